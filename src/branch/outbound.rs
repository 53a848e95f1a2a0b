// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Outbound cross-chain delivery. When a block reaches maturity depth the
//! node pushes its pregnant transactions to their destination chains,
//! submits its own headers to the main chain, and relays redeem
//! statements. All of this happens without the chain lock held: the chain
//! is re-read immediately before each message so a reorg inside the
//! maturity window only skips the displaced transactions.

use crate::consensus::{BRANCH_CHAIN_MATURITY, CUSHION_HEIGHT};
use crate::node::SystemContext;
use crate::primitives::{
    is_main_branch, parse_redeem_script, Block, BranchBlockInfo, Hash256, SpvProof, Transaction,
};
use log::{debug, warn};
use std::collections::HashSet;

/// Deliver one matured step-1 / mortgage to its destination chain. The raw
/// source transaction travels; the destination constructs and validates
/// the step-2 itself. Crossing branch to main attaches the inclusion
/// proof.
pub fn branch_chain_trans_step2(
    ctx: &SystemContext,
    tx: &Transaction,
    block: &Block,
) -> Result<(), String> {
    if !tx.is_pregnant() {
        return Err("tx is not a branch chain transaction".to_owned());
    }
    let to_chain = tx
        .send_to_branch_id
        .ok_or("tx missing destination branch id")?;
    if to_chain == ctx.self_branch_id() {
        return Err("can not send to this chain".to_owned());
    }
    let Some(client) = ctx.client_for_branch(&to_chain) else {
        return Err(format!("can not found branch rpc config for {to_chain}"));
    };

    let hex = if is_main_branch(&to_chain) && tx.is_trans_step1() {
        let mut wanted = HashSet::new();
        wanted.insert(tx.hash());
        let mut with_proof = tx.clone();
        with_proof.spv_proof = Some(SpvProof::new(block.hash(), &block.txids(), &wanted));
        crate::codec::encode_to_hex(&with_proof)
    } else {
        crate::codec::encode_to_hex(tx)
    }
    .map_err(|e| e.to_string())?;

    client
        .make_branch_transaction(&hex)
        .map_err(|e| format!("makebranchtransaction failed: {e:?}"))
}

/// Submit one of this branch's connected block headers to the main chain
pub fn send_branch_block_header(ctx: &SystemContext, block: &Block) -> Result<(), String> {
    if ctx.is_main_chain() {
        return Err("can not be called on the main chain".to_owned());
    }
    let height = ctx
        .chain
        .height_of(&block.hash())
        .ok_or("block is not on the active chain")?;
    let stake_tx = block.stake_tx().ok_or("block vtx size error")?;

    let sync_tx = Transaction {
        tx_type: crate::primitives::TxType::SyncBranchInfo,
        branch_block_info: Some(Box::new(BranchBlockInfo {
            header: block.header.clone(),
            height,
            branch_id: ctx.self_branch_id(),
            stake_tx_bytes: stake_tx.to_bytes(),
        })),
        ..Transaction::default()
    };

    let Some(client) = ctx.client_for_branch(&Hash256::zero()) else {
        return Err("can not found main chain rpc connect info".to_owned());
    };
    let hex = crate::codec::encode_to_hex(&sync_tx).map_err(|e| e.to_string())?;
    match client.submit_branch_block_info(&hex) {
        Ok(None) => Ok(()),
        Ok(Some(reason)) => Err(reason),
        Err(err) => Err(format!("submitbranchblockinfo failed: {err:?}")),
    }
}

/// Relay a matured redeem statement to the main chain so the collateral
/// unlocks.
pub fn req_main_chain_redeem_mortgage(
    ctx: &SystemContext,
    tx: &Transaction,
    block: &Block,
) -> Result<(), String> {
    if !tx.is_redeem_mortgage_statement() {
        return Err("is not a redeem mortgage transaction".to_owned());
    }
    let coin_from_txid = tx
        .vout
        .iter()
        .find_map(|out| parse_redeem_script(&out.script_pubkey))
        .ok_or("redeem statement carries no redeem script")?;

    let mut wanted = HashSet::new();
    wanted.insert(tx.hash());
    let proof = SpvProof::new(block.hash(), &block.txids(), &wanted);

    let Some(client) = ctx.client_for_branch(&Hash256::zero()) else {
        return Err("can not found main chain rpc connect config".to_owned());
    };
    let hex_tx = crate::codec::encode_to_hex(tx).map_err(|e| e.to_string())?;
    let hex_spv = crate::codec::encode_to_hex(&proof).map_err(|e| e.to_string())?;
    client
        .redeem_mortgage_coin(&coin_from_txid, 0, &hex_tx, &ctx.self_branch_id(), &hex_spv)
        .map_err(|e| format!("redeemmortgagecoin failed: {e:?}"))
}

/// On every new tip: replay the block that just reached maturity depth and
/// fire its outbound messages. Each candidate is re-checked against the
/// active chain right before its RPC, so a reorg inside the window only
/// drops the displaced transactions.
pub fn process_block_branch_chain(ctx: &SystemContext) {
    let depth = BRANCH_CHAIN_MATURITY + CUSHION_HEIGHT;
    let (target_height, block_hash) = {
        let _guard = ctx.chain_lock.lock();
        let tip = ctx.chain.height();
        let Some(target_height) = tip.checked_sub(depth) else {
            return;
        };
        let Some(block_hash) = ctx.chain.hash_at_height(target_height) else {
            return;
        };
        (target_height, block_hash)
    };
    let Some(block) = ctx.blocks.read_block(&block_hash) else {
        return;
    };

    // a branch anchors every matured block's header on the main chain
    if !ctx.is_main_chain() {
        if ctx.chain.height_of(&block_hash) != Some(target_height) {
            debug!("block {block_hash} left the active chain mid-delivery");
            return;
        }
        if let Err(err) = send_branch_block_header(ctx, &block) {
            warn!("header submission for {block_hash} failed: {err}");
        }
    }

    for tx in block.vtx.iter().skip(1) {
        // the chain may have reorganized while earlier RPCs were in
        // flight; skip anything no longer canonical
        if ctx.chain.height_of(&block_hash) != Some(target_height) {
            debug!("block {block_hash} left the active chain mid-delivery");
            return;
        }
        if tx.is_trans_step1() || tx.is_mortgage() {
            if let Err(err) = branch_chain_trans_step2(ctx, tx, &block) {
                warn!("step2 delivery for {} failed: {err}", tx.hash());
            }
        }
        if tx.is_redeem_mortgage_statement() {
            if let Err(err) = req_main_chain_redeem_mortgage(ctx, tx, &block) {
                warn!("redeem relay for {} failed: {err}", tx.hash());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::cache::BranchCache;
    use crate::branch::client::{RpcConfig, RpcConfigMap, MAIN_CHAIN_NAME};
    use crate::branch::db::{BranchDb, MemoryDb};
    use crate::node::mempool::Mempool;
    use crate::node::{
        BlockEvents, BlockSink, ChainView, MemoryChain, ReserveSizes, SystemContext,
    };
    use crate::primitives::{
        check_spv_proof, merkle_root, mortgage_coin_script, redeem_statement_script,
        trans_to_main_script, BlockHeader, Hash160, OutPoint, Script, StandardVerifier, TxIn,
        TxOut, TxType,
    };
    use crate::settings::Settings;
    use parking_lot::{Mutex, RwLock};
    use serde_json::{json, Value as Json};
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    struct NullSink;
    impl BlockSink for NullSink {
        fn process_new_block(&self, _block: Block) -> Result<(), String> {
            Ok(())
        }
    }

    fn read_request(stream: &mut TcpStream) -> Option<Json> {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        let header_end = loop {
            let n = stream.read(&mut tmp).ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&tmp[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let headers = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
        let content_length: usize = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse().ok())?;
        while buf.len() < header_end + content_length {
            let n = stream.read(&mut tmp).ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&tmp[..n]);
        }
        serde_json::from_slice(&buf[header_end..header_end + content_length]).ok()
    }

    fn respond(stream: &mut TcpStream, result: &Json) {
        let body = json!({ "result": result, "error": null, "id": 1 }).to_string();
        let reply = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let _ = stream.write_all(reply.as_bytes());
    }

    /// A one-thread JSON-RPC peer recording every `(method, params)` it
    /// serves. Answers every method affirmatively.
    fn spawn_rpc_stub() -> (u16, mpsc::Receiver<(String, Json)>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (record, recorded) = mpsc::channel();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let Some(request) = read_request(&mut stream) else {
                    continue;
                };
                let method = request
                    .get("method")
                    .and_then(Json::as_str)
                    .unwrap_or_default()
                    .to_owned();
                let params = request.get("params").cloned().unwrap_or(Json::Null);
                let result = if method == "makebranchtransaction" {
                    json!("ok")
                } else {
                    json!({})
                };
                respond(&mut stream, &result);
                if record.send((method, params)).is_err() {
                    break;
                }
            }
        });
        (port, recorded)
    }

    fn stub_config(port: u16) -> RpcConfig {
        RpcConfig {
            ip: "127.0.0.1".into(),
            port,
            ..RpcConfig::default()
        }
    }

    fn make_ctx(
        self_branch_id: Hash256,
        chain: Arc<MemoryChain>,
        rpc_configs: RpcConfigMap,
    ) -> SystemContext {
        SystemContext {
            chain_lock: Mutex::new(()),
            chain: chain.clone(),
            blocks: chain,
            block_sink: Arc::new(NullSink),
            branch_db: RwLock::new(BranchDb::open(Box::new(MemoryDb::new())).unwrap()),
            branch_cache: Mutex::new(BranchCache::new()),
            contract_context: RwLock::new(Default::default()),
            mempool: Mutex::new(Mempool::new()),
            rpc_configs,
            settings: Settings {
                self_branch_id,
                ..Settings::default()
            },
            verifier: Arc::new(StandardVerifier),
            events: BlockEvents::new(),
            reserve_sizes: Mutex::new(ReserveSizes::default()),
        }
    }

    fn stake_tx() -> Transaction {
        Transaction {
            tx_type: TxType::Stake,
            vin: vec![TxIn {
                prevout: OutPoint::new(Hash256::hash_from_slice(b"coin"), 0),
                script_sig: Script::new(),
                nsequence: 0,
            }],
            vout: vec![TxOut {
                value: 1000,
                script_pubkey: mortgage_coin_script(
                    &Hash256::hash_from_slice(b"mortgage"),
                    1,
                    &Hash160::hash_from_slice(b"miner"),
                ),
            }],
            ..Transaction::default()
        }
    }

    fn step1_to_main() -> Transaction {
        Transaction {
            tx_type: TxType::TransStep1,
            vout: vec![TxOut {
                value: 70,
                script_pubkey: trans_to_main_script(),
            }],
            send_to_branch_id: Some(Hash256::zero()),
            send_to_tx_bytes: Some(Vec::new()),
            ..Transaction::default()
        }
    }

    /// Matured branch block holding every outbound message kind, buried
    /// under maturity + cushion filler blocks.
    fn matured_branch_setup(port: u16) -> (SystemContext, Block, Arc<MemoryChain>) {
        let chain = Arc::new(MemoryChain::new());
        chain.set_adjusted_time(1_700_000_000);
        let redeem = Transaction {
            tx_type: TxType::RedeemMortgageStatement,
            vout: vec![TxOut {
                value: 0,
                script_pubkey: redeem_statement_script(&Hash256::hash_from_slice(b"mortgage")),
            }],
            ..Transaction::default()
        };
        let matured = Block {
            header: BlockHeader::default(),
            vtx: vec![Transaction::default(), stake_tx(), step1_to_main(), redeem],
        };
        chain.connect_block(matured.clone());
        for i in 0..(BRANCH_CHAIN_MATURITY + CUSHION_HEIGHT) {
            chain.connect_block(Block {
                header: BlockHeader {
                    prev_hash: Hash256::hash_from_slice(format!("filler-{i}")),
                    ..BlockHeader::default()
                },
                ..Block::default()
            });
        }
        let mut configs = RpcConfigMap::new();
        configs.insert(MAIN_CHAIN_NAME.to_owned(), stub_config(port));
        let ctx = make_ctx(Hash256::hash_from_slice(b"this branch"), chain.clone(), configs);
        (ctx, matured, chain)
    }

    #[test]
    fn matured_block_drives_all_outbound_messages() {
        let (port, recorded) = spawn_rpc_stub();
        let (ctx, matured, _chain) = matured_branch_setup(port);

        process_block_branch_chain(&ctx);

        let mut methods = Vec::new();
        let mut header_params = Json::Null;
        for _ in 0..3 {
            let (method, params) = recorded
                .recv_timeout(Duration::from_secs(5))
                .expect("outbound rpc fired");
            if method == "submitbranchblockinfo" {
                header_params = params.clone();
            }
            methods.push(method);
        }
        assert!(methods.contains(&"submitbranchblockinfo".to_owned()));
        assert!(methods.contains(&"makebranchtransaction".to_owned()));
        assert!(methods.contains(&"redeemmortgagecoin".to_owned()));

        // the submitted header is this block's, for this branch
        let hex = header_params[0].as_str().expect("sync tx hex param");
        let sync_tx: Transaction = crate::codec::decode_from_hex(hex).unwrap();
        let info = sync_tx.branch_block_info.expect("sync payload");
        assert_eq!(info.branch_id, ctx.self_branch_id());
        assert_eq!(info.header.hash(), matured.hash());
        let submitted_stake: Transaction = crate::codec::decode(&info.stake_tx_bytes).unwrap();
        assert!(submitted_stake.is_stake());
    }

    #[test]
    fn step2_delivery_attaches_spv_when_crossing_to_main() {
        let (port, recorded) = spawn_rpc_stub();
        let chain = Arc::new(MemoryChain::new());
        let mut configs = RpcConfigMap::new();
        configs.insert(MAIN_CHAIN_NAME.to_owned(), stub_config(port));
        let ctx = make_ctx(Hash256::hash_from_slice(b"this branch"), chain, configs);

        let step1 = step1_to_main();
        let block = Block {
            header: BlockHeader::default(),
            vtx: vec![Transaction::default(), step1.clone()],
        };
        branch_chain_trans_step2(&ctx, &step1, &block).unwrap();

        let (method, params) = recorded.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(method, "makebranchtransaction");
        let delivered: Transaction =
            crate::codec::decode_from_hex(params[0].as_str().unwrap()).unwrap();
        let proof = delivered.spv_proof.as_ref().expect("proof attached");
        assert_eq!(proof.block_hash, block.hash());
        let mut mutated = false;
        let root = merkle_root(&block.txids(), &mut mutated);
        assert_eq!(check_spv_proof(&root, &proof.pmt, &step1.hash()), Some(1));

        // stripping the proof recovers the tx that was mined on this chain
        let mut stripped = delivered;
        stripped.spv_proof = None;
        assert_eq!(stripped.hash(), step1.hash());
    }

    #[test]
    fn mortgage_delivery_to_branch_carries_no_proof() {
        let (port, recorded) = spawn_rpc_stub();
        let chain = Arc::new(MemoryChain::new());
        let branch_id = Hash256::hash_from_slice(b"dest branch");
        let mut configs = RpcConfigMap::new();
        configs.insert(branch_id.to_hex(), stub_config(port));
        let ctx = make_ctx(Hash256::zero(), chain, configs);

        let mortgage = Transaction {
            tx_type: TxType::Mortgage,
            send_to_branch_id: Some(branch_id),
            send_to_tx_bytes: Some(Vec::new()),
            ..Transaction::default()
        };
        let block = Block {
            header: BlockHeader::default(),
            vtx: vec![Transaction::default(), mortgage.clone()],
        };
        branch_chain_trans_step2(&ctx, &mortgage, &block).unwrap();

        let (method, params) = recorded.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(method, "makebranchtransaction");
        let delivered: Transaction =
            crate::codec::decode_from_hex(params[0].as_str().unwrap()).unwrap();
        assert!(delivered.spv_proof.is_none());
        assert_eq!(delivered.hash(), mortgage.hash());
    }

    /// The matured block was fetched, then a reorg displaced it
    struct ReorgedView(Arc<MemoryChain>);

    impl ChainView for ReorgedView {
        fn height(&self) -> u64 {
            self.0.height()
        }
        fn tip_hash(&self) -> Hash256 {
            self.0.tip_hash()
        }
        fn hash_at_height(&self, height: u64) -> Option<Hash256> {
            self.0.hash_at_height(height)
        }
        fn height_of(&self, _block_hash: &Hash256) -> Option<u64> {
            None
        }
        fn adjusted_time(&self) -> i64 {
            self.0.adjusted_time()
        }
    }

    #[test]
    fn reorged_block_skips_delivery() {
        let (port, recorded) = spawn_rpc_stub();
        let (mut ctx, _matured, chain) = matured_branch_setup(port);
        // keep the block store intact but report nothing as canonical
        ctx.chain = Arc::new(ReorgedView(chain));

        process_block_branch_chain(&ctx);
        assert!(recorded.recv_timeout(Duration::from_millis(300)).is_err());
    }
}
