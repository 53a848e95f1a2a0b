// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::branch::client::{RpcConfig, RpcConfigMap, MAIN_CHAIN_NAME};
use crate::primitives::Hash256;
use log::error;

/// Daemon settings parsed from command-line arguments. Built once at start
/// and threaded through the system context; never global.
#[derive(Debug, Clone)]
pub struct Settings {
    /// This node's chain identity. Zero for the main chain, otherwise the
    /// create-branch txid.
    pub self_branch_id: Hash256,
    /// `-mainchaincfg={json}`
    pub main_chain_cfg: Option<RpcConfig>,
    /// `-branchcfg={json}`, repeatable
    pub branch_cfgs: Vec<RpcConfig>,
    /// `-uncheckbranchtxinverifydb`: skip remote confirmation checks while
    /// re-verifying the database
    pub uncheck_branch_tx_in_verify_db: bool,
    /// `-unchecknoconfigbranch`: on the main chain, accept step-2s from
    /// branches with no rpc config
    pub uncheck_no_config_branch: bool,
    /// `-disablewallet`
    pub disable_wallet: bool,
    /// `-datadir=<path>`
    pub data_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            self_branch_id: Hash256::zero(),
            main_chain_cfg: None,
            branch_cfgs: Vec::new(),
            uncheck_branch_tx_in_verify_db: true,
            uncheck_no_config_branch: false,
            disable_wallet: false,
            data_dir: ".ambercoin".to_owned(),
        }
    }
}

impl Settings {
    pub fn from_args<I, S>(args: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut settings = Settings::default();
        for arg in args {
            let arg = arg.as_ref();
            let (name, value) = match arg.split_once('=') {
                Some((n, v)) => (n, Some(v)),
                None => (arg, None),
            };
            match name {
                "-branchid" => {
                    let raw = value.ok_or("-branchid needs a value")?;
                    settings.self_branch_id = Hash256::from_hex(raw)?;
                }
                "-mainchaincfg" => {
                    let raw = value.ok_or("-mainchaincfg needs a value")?;
                    settings.main_chain_cfg = Some(RpcConfig::parse(raw)?);
                }
                "-branchcfg" => {
                    let raw = value.ok_or("-branchcfg needs a value")?;
                    settings.branch_cfgs.push(RpcConfig::parse(raw)?);
                }
                "-uncheckbranchtxinverifydb" => {
                    settings.uncheck_branch_tx_in_verify_db = parse_bool(value);
                }
                "-unchecknoconfigbranch" => {
                    settings.uncheck_no_config_branch = parse_bool(value);
                }
                "-disablewallet" => {
                    settings.disable_wallet = parse_bool(value);
                }
                "-datadir" => {
                    settings.data_dir = value.ok_or("-datadir needs a value")?.to_owned();
                }
                other => {
                    // unknown args belong to other layers (transport, p2p)
                    log::debug!("ignoring argument {other}");
                }
            }
        }
        Ok(settings)
    }

    #[must_use]
    pub fn is_main_chain(&self) -> bool {
        self.self_branch_id.is_zero()
    }

    /// The static per-chain rpc config map the cross-chain client draws from
    #[must_use]
    pub fn rpc_config_map(&self) -> RpcConfigMap {
        let mut map = RpcConfigMap::new();
        if let Some(cfg) = &self.main_chain_cfg {
            map.insert(MAIN_CHAIN_NAME.to_owned(), cfg.clone());
        }
        for cfg in &self.branch_cfgs {
            if cfg.branchid.is_empty() {
                error!("branch rpc config without branchid ignored");
                continue;
            }
            map.insert(cfg.branchid.clone(), cfg.clone());
        }
        map
    }
}

fn parse_bool(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(v) => v != "0" && v != "false",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chain_configs() {
        let branch_id = Hash256::hash_from_slice(b"branch");
        let args = vec![
            format!("-branchid={}", branch_id.to_hex()),
            r#"-mainchaincfg={"ip":"10.0.0.1","port":8332,"usrname":"u","password":"p"}"#.to_owned(),
            format!(
                r#"-branchcfg={{"branchid":"{}","ip":"10.0.0.2","port":8345}}"#,
                branch_id.to_hex()
            ),
            "-unchecknoconfigbranch".to_owned(),
        ];
        let settings = Settings::from_args(&args).unwrap();
        assert!(!settings.is_main_chain());
        assert_eq!(settings.self_branch_id, branch_id);
        assert!(settings.uncheck_no_config_branch);

        let map = settings.rpc_config_map();
        assert!(map.get(MAIN_CHAIN_NAME).is_some());
        assert!(map.get_for_branch(&branch_id).is_some());
    }

    #[test]
    fn defaults_match_legacy_daemon() {
        let settings = Settings::from_args(Vec::<String>::new()).unwrap();
        assert!(settings.is_main_chain());
        assert!(settings.uncheck_branch_tx_in_verify_db);
        assert!(!settings.uncheck_no_config_branch);
    }

    #[test]
    fn bad_config_is_an_error() {
        assert!(Settings::from_args(["-mainchaincfg={\"ip\":\"\"}"]).is_err());
        assert!(Settings::from_args(["-branchid=zz"]).is_err());
    }
}
