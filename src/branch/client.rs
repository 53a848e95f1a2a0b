// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Outbound JSON-RPC client the consensus rules use to query peer chains.
//! Blocking, one request per call, basic auth, 900 second timeout.
//! Transport failures are a distinct, retryable error kind; they are never
//! smuggled back as a null result.

use crate::primitives::Hash256;
use log::error;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use std::collections::HashMap;
use std::time::Duration;

/// Matches the original daemon's HTTP client timeout
pub const RPC_CLIENT_TIMEOUT_SECS: u64 = 900;

/// The chain name the main chain registers under
pub const MAIN_CHAIN_NAME: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcClientErr {
    /// Could not reach the peer; retryable
    ConnectionFailed(String),
    /// Credentials rejected
    BadAuth,
    /// The peer answered but the reply violates the protocol
    Protocol(String),
}

/// Per-chain connection config, parsed from `-mainchaincfg` / `-branchcfg`
/// JSON. Field spellings are wire-compatible with existing deployments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RpcConfig {
    #[serde(default)]
    pub branchid: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub usrname: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub wallet: String,
}

impl RpcConfig {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.ip.is_empty() && self.port != 0
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let cfg: RpcConfig = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        if !cfg.is_valid() {
            return Err("rpc config needs ip and port".to_owned());
        }
        Ok(cfg)
    }
}

/// Static map `chain name -> rpc config`, loaded once at startup
#[derive(Debug, Clone, Default)]
pub struct RpcConfigMap {
    map: HashMap<String, RpcConfig>,
}

impl RpcConfigMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: String, cfg: RpcConfig) {
        self.map.insert(name, cfg);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RpcConfig> {
        self.map.get(name).filter(|cfg| cfg.is_valid())
    }

    /// Lookup by branch id: the zero id means the main chain
    #[must_use]
    pub fn get_for_branch(&self, branch_id: &Hash256) -> Option<&RpcConfig> {
        if branch_id.is_zero() {
            self.get(MAIN_CHAIN_NAME)
        } else {
            self.get(&branch_id.to_hex())
        }
    }
}

/// Reply fields of `getbranchchaintransaction`
#[derive(Debug, Clone, Deserialize)]
pub struct ChainTxReply {
    pub hex: String,
    pub confirmations: u64,
}

/// Reply fields of `getreporttxdata` / `getprovetxdata`
#[derive(Debug, Clone, Deserialize)]
pub struct ReportTxDataReply {
    pub txhex: String,
    pub confirmations: u64,
    pub preminecoinvouthash: String,
}

pub struct CrossChainClient {
    http: reqwest::blocking::Client,
    cfg: RpcConfig,
}

impl CrossChainClient {
    pub fn new(cfg: RpcConfig) -> Result<Self, RpcClientErr> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(RPC_CLIENT_TIMEOUT_SECS))
            .build()
            .map_err(|e| RpcClientErr::ConnectionFailed(e.to_string()))?;
        Ok(Self { http, cfg })
    }

    /// One JSON-RPC request. Returns the `result` field; a populated
    /// `error` field maps to [`RpcClientErr::Protocol`].
    pub fn call(&self, method: &str, params: &[Json]) -> Result<Json, RpcClientErr> {
        let endpoint = if self.cfg.wallet.is_empty() {
            format!("http://{}:{}/", self.cfg.ip, self.cfg.port)
        } else {
            format!(
                "http://{}:{}/wallet/{}",
                self.cfg.ip, self.cfg.port, self.cfg.wallet
            )
        };
        let request = json!({
            "jsonrpc": "1.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(endpoint)
            .basic_auth(&self.cfg.usrname, Some(&self.cfg.password))
            .json(&request)
            .send()
            .map_err(|e| {
                error!("rpc {method} to {}:{} failed: {e}", self.cfg.ip, self.cfg.port);
                RpcClientErr::ConnectionFailed(e.to_string())
            })?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RpcClientErr::BadAuth);
        }
        let reply: Json = response
            .json()
            .map_err(|e| RpcClientErr::Protocol(format!("unparsable reply: {e}")))?;
        let error = reply.get("error").cloned().unwrap_or(Json::Null);
        if !error.is_null() {
            return Err(RpcClientErr::Protocol(error.to_string()));
        }
        reply
            .get("result")
            .cloned()
            .filter(|r| !r.is_null())
            .ok_or_else(|| RpcClientErr::Protocol("result null".to_owned()))
    }

    /// `makebranchtransaction(hex_tx)`: deliver a step-2 to its chain
    pub fn make_branch_transaction(&self, hex_tx: &str) -> Result<(), RpcClientErr> {
        let result = self.call("makebranchtransaction", &[json!(hex_tx)])?;
        if result.as_str() == Some("ok") {
            Ok(())
        } else {
            Err(RpcClientErr::Protocol(format!("not ok: {result}")))
        }
    }

    /// `submitbranchblockinfo(hex_tx)`: returns the commit reject reason,
    /// if the main chain refused the header
    pub fn submit_branch_block_info(&self, hex_tx: &str) -> Result<Option<String>, RpcClientErr> {
        let result = self.call("submitbranchblockinfo", &[json!(hex_tx)])?;
        Ok(result
            .get("commit_reject_reason")
            .and_then(Json::as_str)
            .map(str::to_owned))
    }

    /// `getbranchchaintransaction(txid)`
    pub fn get_branch_chain_transaction(
        &self,
        txid: &Hash256,
    ) -> Result<ChainTxReply, RpcClientErr> {
        let result = self.call("getbranchchaintransaction", &[json!(txid.to_hex())])?;
        serde_json::from_value(result)
            .map_err(|e| RpcClientErr::Protocol(format!("bad tx reply: {e}")))
    }

    /// `redeemmortgagecoin(from_txid, vout, hex_tx, branch_id, hex_spv)`
    pub fn redeem_mortgage_coin(
        &self,
        from_txid: &Hash256,
        vout: u32,
        hex_tx: &str,
        branch_id: &Hash256,
        hex_spv: &str,
    ) -> Result<(), RpcClientErr> {
        self.call(
            "redeemmortgagecoin",
            &[
                json!(from_txid.to_hex()),
                json!(vout),
                json!(hex_tx),
                json!(branch_id.to_hex()),
                json!(hex_spv),
            ],
        )
        .map(|_| ())
    }

    /// `getreporttxdata(txid)`
    pub fn get_report_tx_data(&self, txid: &Hash256) -> Result<ReportTxDataReply, RpcClientErr> {
        let result = self.call("getreporttxdata", &[json!(txid.to_hex())])?;
        serde_json::from_value(result)
            .map_err(|e| RpcClientErr::Protocol(format!("bad report reply: {e}")))
    }

    /// `getprovetxdata(txid)`
    pub fn get_prove_tx_data(&self, txid: &Hash256) -> Result<ReportTxDataReply, RpcClientErr> {
        let result = self.call("getprovetxdata", &[json!(txid.to_hex())])?;
        serde_json::from_value(result)
            .map_err(|e| RpcClientErr::Protocol(format!("bad prove reply: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_wire_spelling() {
        let raw = r#"{"branchid":"main","ip":"127.0.0.1","port":8332,"usrname":"u","password":"p","wallet":"w"}"#;
        let cfg = RpcConfig::parse(raw).unwrap();
        assert_eq!(cfg.branchid, "main");
        assert_eq!(cfg.usrname, "u");
        assert!(cfg.is_valid());
    }

    #[test]
    fn config_requires_endpoint() {
        assert!(RpcConfig::parse(r#"{"ip":"","port":8332}"#).is_err());
        assert!(RpcConfig::parse(r#"{"ip":"127.0.0.1","port":0}"#).is_err());
        assert!(RpcConfig::parse("not json").is_err());
    }

    #[test]
    fn config_map_resolves_main_by_zero_id() {
        let mut map = RpcConfigMap::new();
        map.insert(
            MAIN_CHAIN_NAME.to_owned(),
            RpcConfig {
                ip: "127.0.0.1".into(),
                port: 8332,
                ..RpcConfig::default()
            },
        );
        assert!(map.get_for_branch(&Hash256::zero()).is_some());
        assert!(map
            .get_for_branch(&Hash256::hash_from_slice(b"unknown"))
            .is_none());
    }

    #[test]
    fn connection_refused_maps_to_connection_failed() {
        let client = CrossChainClient::new(RpcConfig {
            ip: "127.0.0.1".into(),
            // reserved port, nothing listens here during tests
            port: 1,
            ..RpcConfig::default()
        })
        .unwrap();
        match client.call("getbranchchaintransaction", &[]) {
            Err(RpcClientErr::ConnectionFailed(_)) => {}
            other => panic!("expected ConnectionFailed, got {other:?}"),
        }
    }
}
