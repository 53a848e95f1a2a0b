// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Typed core verbs. The HTTP/JSON-RPC transport marshals into these; the
//! core itself never parses requests. Rejection reasons surface verbatim
//! to the caller.

use crate::branch::protocol::{self, TxRejection};
use crate::consensus::Money;
use crate::miner::{self, AssemblerOptions, CoinProvider, KeyStore, MinerErr};
use crate::node::mempool::MempoolEntry;
use crate::node::{ReserveSizes, SubmitOutcome, SystemContext};
use crate::primitives::{
    parse_mortgage_script, Block, Hash256, MortgageKind, Script, SpvProof, Transaction,
};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerbErr {
    Decode(&'static str),
    Reject(TxRejection),
    NotFound(&'static str),
    Internal(String),
}

impl From<TxRejection> for VerbErr {
    fn from(rejection: TxRejection) -> Self {
        Self::Reject(rejection)
    }
}

pub type VerbResult<T> = Result<T, VerbErr>;

/// Reply of `getbranchchaintransaction`
#[derive(Debug, Clone, Serialize)]
pub struct ChainTxInfo {
    pub hex: String,
    pub confirmations: u64,
}

/// Reply of `getreporttxdata` / `getprovetxdata`
#[derive(Debug, Clone, Serialize)]
pub struct ReportTxDataInfo {
    pub txhex: String,
    pub confirmations: u64,
    pub preminecoinvouthash: String,
}

/// `makebranchtransaction`: receive a matured step-1 / mortgage from a
/// peer chain, construct the step-2 and admit it to the mempool.
pub fn make_branch_transaction(ctx: &SystemContext, hex_tx: &str) -> VerbResult<&'static str> {
    let from_tx: Transaction =
        crate::codec::decode_from_hex(hex_tx).map_err(VerbErr::Decode)?;
    let from_branch_id = resolve_source_chain(ctx, &from_tx)?;
    let spv = from_tx.spv_proof.clone();
    let step2 = protocol::make_branch_trans_step2(&from_tx, from_branch_id, spv)?;

    {
        let _guard = ctx.chain_lock.lock();
        let cache = ctx.branch_cache.lock();
        protocol::check_branch_duplicate_tx(ctx, &step2, Some(&cache))?;
    }
    // the remote confirmation check blocks; the chain lock stays free
    protocol::check_branch_transaction(ctx, &step2, &from_tx, false)?;

    let mut mempool = ctx.mempool.lock();
    mempool.add(MempoolEntry::new(step2, 0));
    Ok("ok")
}

/// The chain a received source transaction came from: peers of a branch
/// are always the main chain; the main chain locates the submitting
/// branch through the attached proof's block hash.
fn resolve_source_chain(ctx: &SystemContext, from_tx: &Transaction) -> VerbResult<Hash256> {
    if !ctx.is_main_chain() {
        return Ok(Hash256::zero());
    }
    let proof = from_tx
        .spv_proof
        .as_ref()
        .ok_or(VerbErr::Decode("source tx carries no inclusion proof"))?;
    let db = ctx.branch_db.read();
    for branch_id in [from_tx.send_to_branch_id, Some(Hash256::zero())]
        .into_iter()
        .flatten()
    {
        if let Some(branch) = db.branch_data(&branch_id) {
            if branch.contains(&proof.block_hash) {
                return Ok(branch_id);
            }
        }
    }
    // fall back to scanning every branch for the proof's block
    for (branch_id, branch) in db.iter_branches() {
        if branch.contains(&proof.block_hash) {
            return Ok(*branch_id);
        }
    }
    Err(VerbErr::NotFound("proof block not found in any branch"))
}

/// `submitbranchblockinfo`: validate and queue a branch header submission.
/// Returns the reject reason instead of failing, mirroring the wire reply.
pub fn submit_branch_block_info(ctx: &SystemContext, hex_tx: &str) -> VerbResult<Option<String>> {
    let tx: Transaction = crate::codec::decode_from_hex(hex_tx).map_err(VerbErr::Decode)?;
    let _guard = ctx.chain_lock.lock();
    let mut cache = ctx.branch_cache.lock();
    match protocol::check_branch_block_info_tx(ctx, &tx, Some(&cache)) {
        Ok(()) => {
            cache.add(&tx);
            ctx.mempool.lock().add(MempoolEntry::new(tx, 0));
            Ok(None)
        }
        Err(rejection) => Ok(Some(rejection.reason)),
    }
}

/// `getbranchchaintransaction`: a transaction and its confirmation depth
pub fn get_branch_chain_transaction(ctx: &SystemContext, txid: &Hash256) -> VerbResult<ChainTxInfo> {
    if let Some(entry) = ctx.mempool.lock().get(txid) {
        return Ok(ChainTxInfo {
            hex: crate::codec::encode_to_hex(&entry.tx).map_err(|e| VerbErr::Internal(e.to_string()))?,
            confirmations: 0,
        });
    }
    let _guard = ctx.chain_lock.lock();
    let (tx, block_hash) = ctx
        .blocks
        .read_tx(txid)
        .ok_or(VerbErr::NotFound("transaction not found"))?;
    let height = ctx
        .chain
        .height_of(&block_hash)
        .ok_or(VerbErr::NotFound("containing block not on active chain"))?;
    Ok(ChainTxInfo {
        hex: crate::codec::encode_to_hex(&tx).map_err(|e| VerbErr::Internal(e.to_string()))?,
        confirmations: ctx.chain.height() - height + 1,
    })
}

/// `redeemmortgagecoin`: main-chain acceptance of a branch's redeem
/// statement, proven by SPV against the anchored header.
pub fn redeem_mortgage_coin(
    ctx: &SystemContext,
    from_txid: &Hash256,
    vout: u32,
    hex_tx: &str,
    branch_id: &Hash256,
    hex_spv: &str,
) -> VerbResult<&'static str> {
    if !ctx.is_main_chain() {
        return Err(VerbErr::Reject(TxRejection::dos(
            0,
            "redeemmortgagecoin only runs on the main chain",
        )));
    }
    if vout != 0 {
        return Err(VerbErr::Decode("mortgage coin is always vout 0"));
    }
    let statement: Transaction = crate::codec::decode_from_hex(hex_tx).map_err(VerbErr::Decode)?;
    if !statement.is_redeem_mortgage_statement() {
        return Err(VerbErr::Decode("not a redeem mortgage statement"));
    }
    let declared = statement
        .vout
        .iter()
        .find_map(|out| crate::primitives::parse_redeem_script(&out.script_pubkey))
        .ok_or(VerbErr::Decode("statement carries no redeem script"))?;
    if &declared != from_txid {
        return Err(VerbErr::Reject(TxRejection::dos(
            100,
            "redeem statement names a different mortgage",
        )));
    }
    let proof: SpvProof = crate::codec::decode_from_hex(hex_spv).map_err(VerbErr::Decode)?;

    let _guard = ctx.chain_lock.lock();
    let db = ctx.branch_db.read();
    let branch = db
        .branch_data(branch_id)
        .filter(|b| !b.is_empty())
        .ok_or(VerbErr::NotFound("unknown branch"))?;
    let block = branch
        .get(&proof.block_hash)
        .ok_or(VerbErr::NotFound("proof block not anchored"))?;
    if crate::primitives::check_spv_proof(
        &block.header.merkle_root,
        &proof.pmt,
        &statement.hash(),
    )
    .is_none()
    {
        return Err(VerbErr::Reject(TxRejection::dos(0, "redeem spv check fail")));
    }
    Ok("ok")
}

fn anchor_tx_data(
    ctx: &SystemContext,
    txid: &Hash256,
    want_report: bool,
) -> VerbResult<ReportTxDataInfo> {
    let _guard = ctx.chain_lock.lock();
    let (tx, block_hash) = ctx
        .blocks
        .read_tx(txid)
        .ok_or(VerbErr::NotFound("transaction not found"))?;
    let height = ctx
        .chain
        .height_of(&block_hash)
        .ok_or(VerbErr::NotFound("containing block not on active chain"))?;

    let (branch_id, reported_block_hash) = if want_report {
        let report = tx.report.as_ref().ok_or(VerbErr::Decode("not a report tx"))?;
        (report.reported_branch_id, report.reported_block_hash)
    } else {
        let prove = tx.prove.as_ref().ok_or(VerbErr::Decode("not a prove tx"))?;
        (prove.branch_id, prove.block_hash)
    };

    // the coin the anchor pins: the reported block's stake coin origin
    let db = ctx.branch_db.read();
    let coin_from = db
        .branch_data(&branch_id)
        .and_then(|branch| branch.get(&reported_block_hash))
        .and_then(|block| block.stake_tx.vout.first().cloned())
        .and_then(|out| parse_mortgage_script(&out.script_pubkey))
        .filter(|m| m.kind == MortgageKind::MortgageCoin)
        .map(|m| m.branch_or_from)
        .ok_or(VerbErr::NotFound("reported block stake coin unknown"))?;

    Ok(ReportTxDataInfo {
        txhex: crate::codec::encode_to_hex(&tx).map_err(|e| VerbErr::Internal(e.to_string()))?,
        confirmations: ctx.chain.height() - height + 1,
        preminecoinvouthash: coin_from.to_hex(),
    })
}

/// `getreporttxdata`
pub fn get_report_tx_data(ctx: &SystemContext, txid: &Hash256) -> VerbResult<ReportTxDataInfo> {
    anchor_tx_data(ctx, txid, true)
}

/// `getprovetxdata`
pub fn get_prove_tx_data(ctx: &SystemContext, txid: &Hash256) -> VerbResult<ReportTxDataInfo> {
    anchor_tx_data(ctx, txid, false)
}

/// `getblocktemplate`: an unsigned candidate block. With `long_poll` set
/// the call cooperatively waits for a tip change or the one-minute tick
/// before assembling, holding no locks while asleep.
pub fn get_block_template(
    ctx: &SystemContext,
    payout_script: Script,
    keystore: &dyn KeyStore,
    long_poll: bool,
) -> VerbResult<Block> {
    if long_poll {
        let (seen, _) = ctx.events.current_tip();
        ctx.events.wait_tip_change(seen, Duration::from_secs(60));
    }
    let options = AssemblerOptions::with_reserve(*ctx.reserve_sizes.lock());
    miner::BlockAssembler::new(ctx, options)
        .create_new_block(payout_script, keystore)
        .map_err(|err| VerbErr::Internal(format!("{err:?}")))
}

/// `submitblock`: hand a block to validation and wait for its outcome
/// through the catcher keyed by the block hash.
pub fn submit_block(ctx: &SystemContext, hex_block: &str) -> VerbResult<SubmitOutcome> {
    let block: Block = crate::codec::decode_from_hex(hex_block).map_err(VerbErr::Decode)?;
    let block_hash = block.hash();
    {
        let _guard = ctx.chain_lock.lock();
        if ctx.chain.contains(&block_hash) {
            return Ok(SubmitOutcome::Duplicate);
        }
    }
    let receiver = ctx.events.subscribe_submit(block_hash);
    match ctx.block_sink.process_new_block(block) {
        Ok(()) => Ok(receiver
            .recv_timeout(Duration::from_millis(50))
            .unwrap_or(SubmitOutcome::Accepted)),
        Err(reason) => {
            ctx.events.notify_submit(&block_hash, SubmitOutcome::Rejected(reason.clone()));
            let _ = receiver.try_recv();
            Ok(SubmitOutcome::Rejected(reason))
        }
    }
}

/// `generate` / `generatetoaddress`
pub fn generate_to_script(
    ctx: &SystemContext,
    keystore: &dyn KeyStore,
    provider: &dyn CoinProvider,
    payout_script: Script,
    n_generate: usize,
    max_tries: usize,
) -> VerbResult<Vec<Hash256>> {
    // the branch's first mined block is the special second block
    if !ctx.is_main_chain() && ctx.chain.height() == 0 {
        return miner::mine_branch_2nd_block(ctx, keystore, provider, payout_script)
            .map_err(|err| VerbErr::Internal(format!("{err:?}")));
    }
    let coins = if ctx.is_main_chain() {
        Vec::new()
    } else {
        provider.mature_mortgage_coins()
    };
    miner::generate_blocks(ctx, keystore, coins, payout_script, n_generate, max_tries.max(n_generate))
        .map_err(|err| match err {
            MinerErr::Rejected(reason) => VerbErr::Internal(reason),
            other => VerbErr::Internal(format!("{other:?}")),
        })
}

/// `mineblanch2ndblock` (name preserved for wire compatibility)
pub fn mine_branch_2nd_block(
    ctx: &SystemContext,
    keystore: &dyn KeyStore,
    provider: &dyn CoinProvider,
    payout_script: Script,
) -> VerbResult<Vec<Hash256>> {
    miner::mine_branch_2nd_block(ctx, keystore, provider, payout_script)
        .map_err(|err| VerbErr::Internal(format!("{err:?}")))
}

/// `generateforbigboom`: mine bootstrap blocks on the main chain before
/// the big-boom height, no prior coins required.
pub fn generate_for_big_boom(
    ctx: &SystemContext,
    keystore: &dyn KeyStore,
    payout_script: Script,
    n_generate: usize,
    max_tries: usize,
) -> VerbResult<Vec<Hash256>> {
    if !ctx.is_main_chain() {
        return Err(VerbErr::Internal("only the main chain boots with big boom".to_owned()));
    }
    if ctx.chain.height() + n_generate as u64 > crate::consensus::BIG_BOOM_HEIGHT {
        return Err(VerbErr::Internal(
            "can not use this rpc, instead of using generate".to_owned(),
        ));
    }
    miner::generate_blocks(ctx, keystore, Vec::new(), payout_script, n_generate, max_tries)
        .map_err(|err| VerbErr::Internal(format!("{err:?}")))
}

/// `getnetworkhashps`: block production rate over the last `lookup`
/// blocks, derived from header timestamps.
#[must_use]
pub fn get_network_hash_ps(ctx: &SystemContext, lookup: u64) -> f64 {
    let _guard = ctx.chain_lock.lock();
    let tip_height = ctx.chain.height();
    let lookup = lookup.clamp(1, tip_height.max(1));
    let newest = ctx
        .chain
        .hash_at_height(tip_height)
        .and_then(|h| ctx.blocks.read_block(&h));
    let oldest = ctx
        .chain
        .hash_at_height(tip_height.saturating_sub(lookup))
        .and_then(|h| ctx.blocks.read_block(&h));
    match (newest, oldest) {
        (Some(new_block), Some(old_block)) => {
            let span = (new_block.header.time - old_block.header.time).max(1);
            lookup as f64 / span as f64
        }
        _ => 0.0,
    }
}

/// `updateminingreservetxsize`
pub fn update_mining_reserve_tx_size(
    ctx: &SystemContext,
    pub_contract: usize,
    call_contract: usize,
    branch_tx: usize,
) -> ReserveSizes {
    let mut sizes = ctx.reserve_sizes.lock();
    *sizes = ReserveSizes {
        pub_contract,
        call_contract,
        branch_tx,
    };
    *sizes
}

/// `prioritisetransaction`
pub fn prioritise_transaction(ctx: &SystemContext, txid: &Hash256, fee_delta: Money) -> bool {
    ctx.mempool.lock().prioritise(txid, fee_delta)
}

/// `estimatefee` family: one number, the mempool's median fee rate
#[must_use]
pub fn estimate_fee_rate(ctx: &SystemContext) -> Money {
    ctx.mempool.lock().estimate_fee_rate()
}

#[derive(Debug, Clone, Serialize)]
pub struct MiningInfo {
    pub height: u64,
    pub mempool_txs: usize,
    pub mempool_bytes: usize,
    pub reserve_pub_contract: usize,
    pub reserve_call_contract: usize,
    pub reserve_branch_tx: usize,
    pub is_main_chain: bool,
}

/// `getmininginfo`
#[must_use]
pub fn get_mining_info(ctx: &SystemContext) -> MiningInfo {
    let reserve = *ctx.reserve_sizes.lock();
    let mempool = ctx.mempool.lock();
    MiningInfo {
        height: ctx.chain.height(),
        mempool_txs: mempool.len(),
        mempool_bytes: mempool.bytes(),
        reserve_pub_contract: reserve.pub_contract,
        reserve_call_contract: reserve.call_contract,
        reserve_branch_tx: reserve.branch_tx,
        is_main_chain: ctx.is_main_chain(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::{BranchCache, BranchDb, MemoryDb, RpcConfigMap};
    use crate::node::mempool::Mempool;
    use crate::node::{BlockEvents, BlockSink, MemoryChain};
    use crate::primitives::StandardVerifier;
    use crate::settings::Settings;
    use parking_lot::{Mutex, RwLock};
    use std::sync::Arc;

    struct NullSink;
    impl BlockSink for NullSink {
        fn process_new_block(&self, _block: Block) -> Result<(), String> {
            Ok(())
        }
    }

    fn main_ctx() -> SystemContext {
        let chain = Arc::new(MemoryChain::new());
        chain.set_adjusted_time(1_700_000_000);
        SystemContext {
            chain_lock: Mutex::new(()),
            chain: chain.clone(),
            blocks: chain,
            block_sink: Arc::new(NullSink),
            branch_db: RwLock::new(BranchDb::open(Box::new(MemoryDb::new())).unwrap()),
            branch_cache: Mutex::new(BranchCache::new()),
            contract_context: RwLock::new(Default::default()),
            mempool: Mutex::new(Mempool::new()),
            rpc_configs: RpcConfigMap::new(),
            settings: Settings::default(),
            verifier: Arc::new(StandardVerifier),
            events: BlockEvents::new(),
            reserve_sizes: Mutex::new(ReserveSizes::default()),
        }
    }

    #[test]
    fn submit_branch_block_info_surfaces_reject_reason() {
        let ctx = main_ctx();
        // a valid encoding that fails validation: branch never created
        let tx = Transaction {
            tx_type: crate::primitives::TxType::SyncBranchInfo,
            branch_block_info: Some(Box::new(crate::primitives::BranchBlockInfo {
                header: Default::default(),
                height: 1,
                branch_id: Hash256::hash_from_slice(b"unknown"),
                stake_tx_bytes: Vec::new(),
            })),
            ..Transaction::default()
        };
        let hex = crate::codec::encode_to_hex(&tx).unwrap();
        let reason = submit_branch_block_info(&ctx, &hex).unwrap();
        assert_eq!(reason.as_deref(), Some("branch chain has not created"));
        assert!(ctx.mempool.lock().is_empty());

        // garbage is a decode error, not a reject reason
        assert!(submit_branch_block_info(&ctx, "zz").is_err());
    }

    #[test]
    fn reserve_sizes_update_applies_to_templates() {
        let ctx = main_ctx();
        let updated = update_mining_reserve_tx_size(&ctx, 1, 2, 3);
        assert_eq!(
            updated,
            ReserveSizes {
                pub_contract: 1,
                call_contract: 2,
                branch_tx: 3
            }
        );
        assert_eq!(*ctx.reserve_sizes.lock(), updated);
    }

    #[test]
    fn tx_query_reports_confirmations() {
        let ctx = main_ctx();
        let tx = Transaction::default();
        let txid = tx.hash();
        assert!(matches!(
            get_branch_chain_transaction(&ctx, &txid),
            Err(VerbErr::NotFound(_))
        ));

        ctx.mempool.lock().add(MempoolEntry::new(tx, 0));
        let info = get_branch_chain_transaction(&ctx, &txid).unwrap();
        assert_eq!(info.confirmations, 0);
    }

    #[test]
    fn mining_info_snapshot() {
        let ctx = main_ctx();
        let info = get_mining_info(&ctx);
        assert!(info.is_main_chain);
        assert_eq!(info.mempool_txs, 0);
    }
}
