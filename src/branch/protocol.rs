// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Validation predicates over every branch-flavoured transaction. Each
//! returns a typed outcome with a ban score; nothing here throws on the
//! hot path. Cross-chain checks call out through [`CrossChainClient`] and
//! must be invoked without the chain lock held.

use crate::branch::cache::BranchCache;
use crate::branch::client::RpcClientErr;
use crate::branch::db::{BranchData, ReportFlag};
use crate::consensus::{
    money_range, Money, BLOCK_TIMESTAMP_MAX_FUTURE, BRANCH_CHAIN_MATURITY, REDEEM_SAFE_HEIGHT,
    REPORT_LOCK_COIN_HEIGHT, REPORT_OUTOF_HEIGHT,
};
use crate::contract::{
    tx_hash_with_data, tx_hash_with_prev_data, ContractExecutor, ContractPrevData, StaticCoins,
};
use crate::node::SystemContext;
use crate::primitives::{
    check_block_header_signature, check_spv_proof, is_main_branch, parse_mortgage_script,
    prove_tx_flag_hash, report_tx_flag_hash, script, BlockHeader, BranchBlockInfo, Hash256,
    MortgageKind, ProveDataItem, ReportType, ScriptVerifier, Transaction, TxType,
};
use log::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    /// Consensus rule violation
    Invalid,
    Duplicate,
    MissingInputs,
    NotFound,
    /// Cross-chain transport failure; retry later
    ConnectionFailed,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRejection {
    pub kind: RejectKind,
    pub reason: String,
    pub ban_score: u32,
}

impl TxRejection {
    #[must_use]
    pub fn dos(ban_score: u32, reason: impl Into<String>) -> Self {
        Self {
            kind: RejectKind::Invalid,
            reason: reason.into(),
            ban_score,
        }
    }

    #[must_use]
    pub fn duplicate(reason: impl Into<String>) -> Self {
        Self {
            kind: RejectKind::Duplicate,
            reason: reason.into(),
            ban_score: 0,
        }
    }

    #[must_use]
    pub fn not_found(reason: impl Into<String>) -> Self {
        Self {
            kind: RejectKind::NotFound,
            reason: reason.into(),
            ban_score: 0,
        }
    }

    #[must_use]
    pub fn connection(reason: impl Into<String>) -> Self {
        Self {
            kind: RejectKind::ConnectionFailed,
            reason: reason.into(),
            ban_score: 0,
        }
    }
}

impl From<RpcClientErr> for TxRejection {
    fn from(err: RpcClientErr) -> Self {
        match err {
            RpcClientErr::ConnectionFailed(msg) => TxRejection::connection(msg),
            RpcClientErr::BadAuth => TxRejection::dos(0, "rpc authorization failed"),
            RpcClientErr::Protocol(msg) => TxRejection::dos(0, format!("rpc protocol: {msg}")),
        }
    }
}

pub type CheckResult<T = ()> = Result<T, TxRejection>;

// ---- script amount scans -------------------------------------------------

/// Value locked by the create-branch outputs
#[must_use]
pub fn get_branch_chain_create_out(tx: &Transaction) -> Money {
    if !tx.is_branch_create() {
        return 0;
    }
    tx.vout
        .iter()
        .filter(|out| {
            matches!(
                out.script_pubkey.ops().next(),
                Some(crate::primitives::ScriptOp::Op(script::OP_CREATE_BRANCH))
            )
        })
        .map(|out| out.value)
        .sum()
}

/// Value a step-1 sends across, i.e. outputs marked for the destination
/// chain: `OP_TRANS_BRANCH <dest>` towards a branch, `OP_RETURN
/// OP_TRANS_BRANCH` towards the main chain.
#[must_use]
pub fn get_branch_chain_trans_out(step1: &Transaction) -> Money {
    if !step1.is_trans_step1() {
        return 0;
    }
    let Some(dest) = step1.send_to_branch_id else {
        return 0;
    };
    let mut amount = 0;
    for out in &step1.vout {
        let mut ops = out.script_pubkey.ops();
        match ops.next() {
            Some(crate::primitives::ScriptOp::Op(script::OP_TRANS_BRANCH))
                if !is_main_branch(&dest) =>
            {
                if let Some(crate::primitives::ScriptOp::Push(data)) = ops.next() {
                    if data == dest.0.as_slice() {
                        amount += out.value;
                    }
                }
            }
            Some(crate::primitives::ScriptOp::Op(script::OP_RETURN)) if is_main_branch(&dest) => {
                if matches!(
                    ops.next(),
                    Some(crate::primitives::ScriptOp::Op(script::OP_TRANS_BRANCH))
                ) {
                    amount += out.value;
                }
            }
            _ => {}
        }
    }
    amount
}

/// Collateral a mortgage locks; `with_branch_out` adds the coins it also
/// carries across to the branch.
#[must_use]
pub fn get_mortgage_mine_out(tx: &Transaction, with_branch_out: bool) -> Money {
    let mut amount = 0;
    for out in &tx.vout {
        let mut ops = out.script_pubkey.ops();
        match ops.next() {
            Some(crate::primitives::ScriptOp::Op(script::OP_MINE_BRANCH_MORTGAGE)) => {
                amount += out.value;
            }
            Some(crate::primitives::ScriptOp::Op(script::OP_TRANS_BRANCH)) if with_branch_out => {
                if let (Some(crate::primitives::ScriptOp::Push(data)), Some(dest)) =
                    (ops.next(), tx.send_to_branch_id)
                {
                    if data == dest.0.as_slice() {
                        amount += out.value;
                    }
                }
            }
            _ => {}
        }
    }
    amount
}

/// Value entering contract accounts in this transaction
#[must_use]
pub fn get_contract_amount_out(tx: &Transaction) -> Money {
    tx.vout
        .iter()
        .filter(|out| {
            matches!(
                out.script_pubkey.ops().next(),
                Some(crate::primitives::ScriptOp::Op(script::OP_CONTRACT))
            )
        })
        .map(|out| out.value)
        .sum()
}

/// The cross-chain amount a pregnant transaction commits to
#[must_use]
pub fn get_branch_chain_out(tx: &Transaction) -> Money {
    if tx.is_trans_step1() {
        get_branch_chain_trans_out(tx)
    } else if tx.is_mortgage() {
        get_mortgage_mine_out(tx, true)
    } else {
        0
    }
}

/// Decode the source transaction a step-2 embeds
pub fn step2_from_tx(step2: &Transaction) -> CheckResult<Transaction> {
    let bytes = step2
        .from_tx_bytes
        .as_ref()
        .ok_or_else(|| TxRejection::dos(100, "step2 missing fromTx"))?;
    Transaction::from_bytes(bytes).map_err(|_| TxRejection::dos(100, "step2 fromTx undecodable"))
}

// ---- step-2 validation ---------------------------------------------------

/// The heart of cross-chain correctness: validate a step-2 against its
/// embedded source transaction, then (outside IBD fast paths) ask the
/// source chain whether the step-1 is buried deep enough.
pub fn check_branch_transaction(
    ctx: &SystemContext,
    step2: &Transaction,
    from_tx: &Transaction,
    verifying_db: bool,
) -> CheckResult {
    if !step2.is_trans_step2() {
        return Err(TxRejection::dos(100, "is not a branch chain trans step2"));
    }
    let from_branch_id = step2
        .from_branch_id
        .ok_or_else(|| TxRejection::dos(100, "step2 missing fromBranchId"))?;
    if from_branch_id == ctx.self_branch_id() {
        return Err(TxRejection::dos(100, "from chain equals to chain"));
    }

    // a mortgage's acknowledgement must mint exactly the matching coin
    if from_tx.is_mortgage() {
        let mine = from_tx
            .vout
            .first()
            .and_then(|out| parse_mortgage_script(&out.script_pubkey))
            .filter(|m| m.kind == MortgageKind::MortgageMine)
            .ok_or_else(|| TxRejection::dos(100, "invalid mortgage mine script"))?;
        if step2.vout.len() != 1 {
            return Err(TxRejection::dos(100, "invalid mortgage transaction"));
        }
        let coin = parse_mortgage_script(&step2.vout[0].script_pubkey)
            .filter(|m| m.kind == MortgageKind::MortgageCoin)
            .ok_or_else(|| TxRejection::dos(100, "invalid mortgage transaction"))?;
        if coin.keyid != mine.keyid || coin.height != mine.height {
            return Err(TxRejection::dos(100, "invalid mortgage coin script"));
        }
    }

    // the step-1 committed to the stripped shape of this very transaction
    let expected_bytes = from_tx
        .send_to_tx_bytes
        .as_ref()
        .ok_or_else(|| TxRejection::dos(100, "fromTx missing sendToTxData"))?;
    let expected = Transaction::from_bytes(expected_bytes)
        .map_err(|_| TxRejection::dos(100, "sendToTxData is not a valid transaction"))?;
    let stripped = crate::primitives::revert_transaction(step2, Some(from_tx), true);
    if expected.hash() != stripped.hash() {
        return Err(TxRejection::dos(100, "transaction hash error"));
    }

    let in_amount = step2
        .in_amount
        .ok_or_else(|| TxRejection::dos(100, "step2 missing inAmount"))?;
    if get_branch_chain_out(from_tx) != in_amount || !money_range(in_amount) {
        return Err(TxRejection::dos(100, "invalid inAmount"));
    }

    // recharge outputs re-mint the coins that crossed over and are not
    // spendable value added by this tx
    let value_out: Money = if !is_main_branch(&from_branch_id) {
        step2
            .vout
            .iter()
            .filter(|out| !out.script_pubkey.is_coin_branch_trans_script())
            .map(|out| out.value)
            .sum()
    } else {
        step2.value_out()
    };
    if value_out > in_amount {
        return Err(TxRejection::dos(100, "value out larger than inAmount"));
    }

    if verifying_db && ctx.settings.uncheck_branch_tx_in_verify_db {
        debug!(
            "jump check branch tx in verifying db, from tx {}",
            from_tx.hash()
        );
        return Ok(());
    }

    let Some(client) = ctx.client_for_branch(&from_branch_id) else {
        if ctx.is_main_chain() && ctx.settings.uncheck_no_config_branch {
            return Ok(());
        }
        return Err(TxRejection::dos(
            1,
            format!("can not found branch rpc config for {from_branch_id}"),
        ));
    };
    let from_tx_hash = from_tx.hash();
    let reply = client.get_branch_chain_transaction(&from_tx_hash)?;
    let remote: Transaction = crate::codec::decode_from_hex(&reply.hex)
        .map_err(|_| TxRejection::dos(100, "getbranchchaintransaction hex undecodable"))?;
    if remote.hash() != from_tx_hash {
        return Err(TxRejection::dos(
            100,
            "return transaction is not the one that is wanted",
        ));
    }
    if reply.confirmations < BRANCH_CHAIN_MATURITY + 1 {
        return Err(TxRejection::not_found("rpc confirmations not satisfy"));
    }
    Ok(())
}

// ---- header submission ---------------------------------------------------

/// Contextual rules for a submitted branch header, evaluated against the
/// branch data recorded so far and network-adjusted time.
pub fn branch_contextual_check_header(
    header: &BlockHeader,
    height: u64,
    branch: &BranchData,
    adjusted_time: i64,
) -> CheckResult {
    if header.time > adjusted_time + BLOCK_TIMESTAMP_MAX_FUTURE {
        return Err(TxRejection::dos(50, "branch header time too far in future"));
    }
    if branch.is_empty() {
        // the branch leaves genesis through its second block only
        if height != 1 {
            return Err(TxRejection::dos(0, "first submitted header must be height 1"));
        }
        return Ok(());
    }
    let parent = branch
        .get(&header.prev_hash)
        .ok_or_else(|| TxRejection::not_found("branch header parent not found"))?;
    if height != parent.height + 1 {
        return Err(TxRejection::dos(100, "branch header height not contiguous"));
    }
    if header.time <= parent.header.time {
        return Err(TxRejection::dos(100, "branch header time not increasing"));
    }
    Ok(())
}

/// Stake correctness of a submitted header: the embedded stake tx must
/// spend the coin the header names, with the key that signed the header.
pub fn check_branch_block_header_work(info: &BranchBlockInfo) -> CheckResult {
    let stake_tx: Transaction = crate::codec::decode(&info.stake_tx_bytes)
        .map_err(|_| TxRejection::dos(100, "stake tx undecodable"))?;
    if stake_tx.tx_type != TxType::Stake {
        return Err(TxRejection::dos(100, "vtx[1] is not a stake transaction"));
    }
    let coin = stake_tx
        .vout
        .first()
        .and_then(|out| parse_mortgage_script(&out.script_pubkey))
        .filter(|m| m.kind == MortgageKind::MortgageCoin)
        .ok_or_else(|| TxRejection::dos(100, "stake output is not a mortgage coin"))?;
    let stake_in = stake_tx
        .vin
        .first()
        .ok_or_else(|| TxRejection::dos(100, "stake tx has no input"))?;
    if info.header.prevout_stake != stake_in.prevout {
        return Err(TxRejection::dos(100, "header prevoutStake mismatch"));
    }
    match info.header.signer_keyid() {
        Some(keyid) if keyid == coin.keyid => {}
        _ => return Err(TxRejection::dos(100, "header signer is not the coin owner")),
    }
    // the recorded main-chain lock height is informational here but must
    // at least be well-formed
    if coin.height < 0 {
        return Err(TxRejection::dos(100, "mortgage coin height invalid"));
    }
    Ok(())
}

/// Validate a sync-branch-info transaction against the branch db and cache
pub fn check_branch_block_info_tx(
    ctx: &SystemContext,
    tx: &Transaction,
    cache: Option<&BranchCache>,
) -> CheckResult {
    let info = tx
        .branch_block_info
        .as_ref()
        .filter(|_| tx.is_sync_branch_info())
        .ok_or_else(|| TxRejection::dos(100, "not a sync branch info tx"))?;

    let db = ctx.branch_db.read();
    if !db.is_branch_created(&info.branch_id) {
        return Err(TxRejection::dos(0, "branch chain has not created"));
    }

    if !info.header.has_stake() || info.header.block_sig.is_empty() {
        return Err(TxRejection::dos(
            100,
            "submit branch block header must contain prevoutStake and blockSig",
        ));
    }
    if !check_block_header_signature(&info.header) {
        return Err(TxRejection::dos(
            100,
            "submit branch block header sig check fail",
        ));
    }

    if let Some(cache) = cache {
        if cache.has_in_cache(tx) {
            return Err(TxRejection::duplicate("branch block info duplicate"));
        }
    }
    let branch = db.branch_data(&info.branch_id).cloned().unwrap_or_default();
    if branch.contains(&info.header.hash()) {
        return Err(TxRejection::duplicate("blockheader info has include before"));
    }

    branch_contextual_check_header(&info.header, info.height, &branch, ctx.chain.adjusted_time())
        .map_err(|err| {
            TxRejection::dos(
                err.ban_score.min(100),
                format!("branch-contextual-check-block-header-fail: {}", err.reason),
            )
        })?;
    check_branch_block_header_work(info)?;
    Ok(())
}

// ---- duplicate gate ------------------------------------------------------

/// Mempool / connect duplicate gate over all branch payload kinds
pub fn check_branch_duplicate_tx(
    ctx: &SystemContext,
    tx: &Transaction,
    cache: Option<&BranchCache>,
) -> CheckResult {
    let db = ctx.branch_db.read();
    if tx.is_sync_branch_info() {
        if let Some(cache) = cache {
            if cache.has_in_cache(tx) {
                return Err(TxRejection::duplicate("branch block info duplicate"));
            }
        }
        let info = tx
            .branch_block_info
            .as_ref()
            .ok_or_else(|| TxRejection::dos(100, "missing branch block info"))?;
        if let Some(branch) = db.branch_data(&info.branch_id) {
            if branch.contains(&info.header.hash()) {
                return Err(TxRejection::duplicate("blockheader info has include before"));
            }
        }
    }

    if tx.is_trans_step2() {
        let from_branch = tx
            .from_branch_id
            .ok_or_else(|| TxRejection::dos(100, "step2 missing fromBranchId"))?;
        let from_tx = step2_from_tx(tx)?;
        if db.is_step2_received(&from_branch, &from_tx.hash()) {
            return Err(TxRejection::duplicate("txn-already-in-records"));
        }
    }

    if tx.is_report() {
        let flag = report_tx_flag_hash(tx)
            .ok_or_else(|| TxRejection::dos(100, "report tx missing report data"))?;
        if let Some(cache) = cache {
            if cache.has_in_cache(tx) {
                return Err(TxRejection::duplicate("duplicate report in cache"));
            }
        }
        if db.report_flag(&flag).is_some() {
            return Err(TxRejection::duplicate("duplicate report in db"));
        }
    }

    if tx.is_prove() {
        let flag = prove_tx_flag_hash(tx)
            .ok_or_else(|| TxRejection::dos(100, "prove tx missing prove data"))?;
        if let Some(cache) = cache {
            if cache.has_in_cache(tx) {
                return Err(TxRejection::duplicate("duplicate prove in cache"));
            }
        }
        if db.report_flag(&flag) == Some(ReportFlag::Proved) {
            return Err(TxRejection::duplicate("duplicate prove in db"));
        }
    }
    Ok(())
}

// ---- reports -------------------------------------------------------------

fn check_report_tx_commonly(
    report_block_height: u64,
    branch: &BranchData,
) -> CheckResult {
    if branch.height() < report_block_height {
        return Err(TxRejection::dos(
            0,
            format!(
                "report block height larger than branch height, chainheight {}, blockheight {}",
                branch.height(),
                report_block_height
            ),
        ));
    }
    if branch.height() - report_block_height > REDEEM_SAFE_HEIGHT {
        return Err(TxRejection::dos(
            0,
            format!(
                "report block too old, chainheight {}, blockheight {}",
                branch.height(),
                report_block_height
            ),
        ));
    }
    Ok(())
}

/// Validate a report transaction, dispatching on its report type
pub fn check_report_cheat_tx(ctx: &SystemContext, tx: &Transaction) -> CheckResult {
    if !tx.is_report() {
        return Ok(());
    }
    let report = tx
        .report
        .as_ref()
        .ok_or_else(|| TxRejection::dos(100, "report tx missing report data"))?;
    let db = ctx.branch_db.read();
    let branch = db
        .branch_data(&report.reported_branch_id)
        .filter(|b| !b.is_empty())
        .ok_or_else(|| TxRejection::dos(0, "report branchid error"))?;

    match report.report_type {
        ReportType::Tx | ReportType::Coinbase => {
            let proof = tx
                .spv_proof
                .as_ref()
                .ok_or_else(|| TxRejection::dos(100, "report missing spv proof"))?;
            let block = branch
                .get(&report.reported_block_hash)
                .ok_or_else(|| TxRejection::not_found("reported block not in branch data"))?;
            if check_spv_proof(
                &block.header.merkle_root,
                &proof.pmt,
                &report.reported_tx_hash,
            )
            .is_none()
            {
                return Err(TxRejection::dos(0, "report spv check fail"));
            }
            check_report_tx_commonly(block.height, branch)
        }
        ReportType::MerkleTree => {
            let block = branch
                .get(&report.reported_block_hash)
                .ok_or_else(|| TxRejection::not_found("reported block not in branch data"))?;
            check_report_tx_commonly(block.height, branch)
        }
        ReportType::ContractData => {
            drop(db);
            check_prove_contract_data(ctx, tx)
        }
    }
}

// ---- proves --------------------------------------------------------------

/// Verify one proved transaction against its per-input evidence: every
/// input's source tx with SPV, scripts, and the value / contract balances.
/// Returns the transaction fee.
pub fn check_transaction_prove_with_data(
    prove_tx: &Transaction,
    items: &[ProveDataItem],
    branch: &BranchData,
    skip_first: bool,
    verifier: &dyn ScriptVerifier,
) -> CheckResult<Money> {
    if prove_tx.is_coinbase() {
        return Err(TxRejection::dos(0, "prove tx can not be a coinbase transaction"));
    }
    let base = usize::from(skip_first);
    if items.len() != prove_tx.vin.len() + base {
        return Err(TxRejection::dos(0, "prove data size invalid for prove each input"));
    }

    let contract_addr = prove_tx.contract.as_ref().map(|c| c.address);
    let mut in_amount: Money = 0;
    let mut contract_in: Money = 0;
    for (i, txin) in prove_tx.vin.iter().enumerate() {
        let item = &items[i + base];
        let src_tx = Transaction::from_bytes(&item.tx_bytes)
            .map_err(|_| TxRejection::dos(0, "prove item tx undecodable"))?;
        let block = branch
            .get(&item.spv.block_hash)
            .ok_or_else(|| TxRejection::dos(0, "prove item's block not exist"))?;
        if check_spv_proof(&block.header.merkle_root, &item.spv.pmt, &src_tx.hash()).is_none() {
            return Err(TxRejection::dos(0, "prove spv check fail"));
        }
        if src_tx.hash() != txin.prevout.hash {
            return Err(TxRejection::dos(0, "prove provided tx not match"));
        }
        let spent = src_tx
            .vout
            .get(txin.prevout.n as usize)
            .ok_or_else(|| TxRejection::dos(0, "prove prevout index out of range"))?;
        in_amount += spent.value;

        if spent.script_pubkey.is_contract() {
            if spent.script_pubkey.contract_addr() != contract_addr {
                return Err(TxRejection::dos(0, "invalid contract inpoint"));
            }
            contract_in += spent.value;
        }

        if verifier
            .verify(&spent.script_pubkey, spent.value, prove_tx, i)
            .is_err()
        {
            // contract-held coins move without signatures; the output only
            // has to belong to the called contract
            let relaxed = prove_tx.is_call_contract()
                && spent.script_pubkey.is_contract()
                && spent.script_pubkey.contract_addr() == contract_addr;
            if !relaxed {
                return Err(TxRejection::dos(0, "prove script check fail"));
            }
        }
    }

    let mut value_out: Money = 0;
    let mut contract_out: Money = 0;
    for out in &prove_tx.vout {
        if out.value < 0 {
            return Err(TxRejection::dos(100, "bad-txns-vout-negative"));
        }
        value_out += out.value;
        if !money_range(value_out) {
            return Err(TxRejection::dos(100, "bad-txns-txouttotal-toolarge"));
        }
        if out.script_pubkey.is_contract_change() {
            if out.script_pubkey.contract_addr() != contract_addr {
                return Err(TxRejection::dos(0, "invalid contract out public key"));
            }
            contract_out += out.value;
        }
    }

    let declared_out = prove_tx.contract.as_ref().map(|c| c.amount_out).unwrap_or(0);
    if contract_in - contract_out != declared_out {
        return Err(TxRejection::dos(0, "contract out not match"));
    }
    if in_amount < value_out {
        return Err(TxRejection::dos(100, "value in/out error"));
    }
    Ok(in_amount - value_out)
}

/// Re-execute a proved smart-contract call against the supplied pre-state
/// and check both data Merkle roots commit it at the same index.
fn check_prove_smart_contract(
    prove_tx: &Transaction,
    contract_data: &crate::primitives::ProveContractData,
    block: &crate::branch::db::BranchBlockData,
) -> CheckResult {
    let prev = ContractPrevData::from_context(contract_data.coins, &contract_data.prev_data);
    let hash_with_prev = tx_hash_with_prev_data(&prove_tx.hash(), &prev);
    let tx_index = check_spv_proof(
        &block.header.merkle_root_with_prev_data,
        &contract_data.prev_data_spv.pmt,
        &hash_with_prev,
    )
    .ok_or_else(|| TxRejection::dos(0, "prove contract prev data spv fail"))?;

    let mut executor = ContractExecutor::with_data(contract_data.prev_data.clone());
    let addr = prove_tx
        .contract
        .as_ref()
        .map(|c| c.address)
        .ok_or_else(|| TxRejection::dos(0, "prove tx is not a contract call"))?;
    let coins = StaticCoins(std::iter::once((addr, contract_data.coins)).collect());
    // the reported block's parent supplies height and time
    let prev_header = BlockHeader {
        time: block.header.time - 1,
        ..BlockHeader::default()
    };
    let out = executor
        .execute_tx(prove_tx, tx_index, &prev_header, block.height.saturating_sub(1), &coins)
        .map_err(|err| TxRejection::dos(0, format!("prove contract re-execute fail: {err:?}")))?;

    let hash_with_data = tx_hash_with_data(&prove_tx.hash(), &out.tx_final_data);
    let final_index = check_spv_proof(
        &block.header.merkle_root_with_data,
        &contract_data.final_data_spv.pmt,
        &hash_with_data,
    )
    .ok_or_else(|| TxRejection::dos(0, "prove contract final data spv fail"))?;
    if final_index != tx_index {
        return Err(TxRejection::dos(0, "prove contract data index mismatch"));
    }
    Ok(())
}

/// Prove of a reported transaction
pub fn check_prove_report_tx(
    ctx: &SystemContext,
    tx: &Transaction,
    verifier: &dyn ScriptVerifier,
) -> CheckResult {
    let prove = tx
        .prove
        .as_ref()
        .filter(|p| p.prove_type == ReportType::Tx)
        .ok_or_else(|| TxRejection::dos(100, "not a tx prove"))?;
    let db = ctx.branch_db.read();
    let branch = db
        .branch_data(&prove.branch_id)
        .filter(|b| !b.is_empty())
        .ok_or_else(|| TxRejection::not_found("prove branch data missing"))?;

    let first = prove
        .prove_items
        .first()
        .ok_or_else(|| TxRejection::dos(0, "prove data size invalid can not zero"))?;
    let proved_tx = Transaction::from_bytes(&first.tx_bytes)
        .map_err(|_| TxRejection::dos(0, "prove tx undecodable"))?;
    if proved_tx.hash() != prove.tx_hash {
        return Err(TxRejection::dos(
            0,
            "prove tx data error, first tx is not the proved txid",
        ));
    }
    let block = branch
        .get(&first.spv.block_hash)
        .ok_or_else(|| TxRejection::not_found("prove block data missing"))?;
    if check_spv_proof(&block.header.merkle_root, &first.spv.pmt, &proved_tx.hash()).is_none() {
        return Err(TxRejection::dos(0, "prove report tx spv check fail"));
    }

    check_transaction_prove_with_data(&proved_tx, &prove.prove_items, branch, true, verifier)?;

    if proved_tx.is_smart_contract() {
        let contract_data = prove
            .contract_data
            .as_ref()
            .ok_or_else(|| TxRejection::dos(0, "prove missing contract data"))?;
        check_prove_smart_contract(&proved_tx, contract_data, block)?;
    }
    Ok(())
}

/// Prove of a reported coinbase or of a whole Merkle tree: deserialize the
/// full ordered `vtx`, recompute the root, validate every body tx, and
/// require the coinbase to pay exactly the sum of fees (branches mint no
/// subsidy).
pub fn check_prove_coinbase_tx(
    ctx: &SystemContext,
    tx: &Transaction,
    verifier: &dyn ScriptVerifier,
) -> CheckResult {
    let prove = tx
        .prove
        .as_ref()
        .filter(|p| {
            p.prove_type == ReportType::Coinbase || p.prove_type == ReportType::MerkleTree
        })
        .ok_or_else(|| TxRejection::dos(100, "not a coinbase/merkletree prove"))?;
    let db = ctx.branch_db.read();
    let branch = db
        .branch_data(&prove.branch_id)
        .filter(|b| !b.is_empty())
        .ok_or_else(|| TxRejection::dos(0, "prove coinbase tx no branchid data"))?;
    let block = branch
        .get(&prove.block_hash)
        .ok_or_else(|| TxRejection::dos(0, "prove coinbase tx no block data"))?;

    let vtx: Vec<Transaction> = crate::codec::decode(&prove.vtx_bytes)
        .map_err(|_| TxRejection::dos(100, "prove vtx undecodable"))?;
    if vtx.len() < 2 {
        return Err(TxRejection::dos(100, "invalid vtx size"));
    }
    if prove.prove_type == ReportType::Coinbase && vtx[0].hash() != prove.tx_hash {
        return Err(TxRejection::dos(100, "coinbase tx is not eq txHash"));
    }
    if prove.prove_type == ReportType::MerkleTree && !prove.tx_hash.is_zero() {
        return Err(TxRejection::dos(100, "merkle proof txhash is invalid, must null"));
    }

    let leaves: Vec<Hash256> = vtx.iter().map(Transaction::hash).collect();
    let mut mutated = false;
    let root = crate::primitives::merkle_root(&leaves, &mut mutated);
    if block.header.merkle_root != root {
        return Err(TxRejection::dos(100, "invalid merkle tree for vtx"));
    }
    if mutated {
        return Err(TxRejection::dos(100, "duplicate transaction in vtx"));
    }

    // coinbase and stake are not proven; everything else is
    if vtx.len() != prove.block_tx_proves.len() + 2 {
        return Err(TxRejection::dos(100, "provided block tx prove size invalid"));
    }
    let mut total_fee: Money = 0;
    for (i, body_tx) in vtx.iter().enumerate().skip(2) {
        let items = &prove.block_tx_proves[i - 2];
        let fee = check_transaction_prove_with_data(body_tx, items, branch, false, verifier)?;
        total_fee += fee;
    }

    if vtx[0].value_out() != total_fee {
        return Err(TxRejection::dos(
            100,
            "prove coinbase transaction fail, fee invalid",
        ));
    }
    Ok(())
}

/// Fraud proof of a stale contract read. Validation success means the
/// report is sustained: the reported transaction read contract state that
/// a newer committed write had already replaced.
pub fn check_prove_contract_data(ctx: &SystemContext, tx: &Transaction) -> CheckResult {
    let report = tx
        .report
        .as_ref()
        .filter(|r| r.report_type == ReportType::ContractData)
        .ok_or_else(|| TxRejection::dos(100, "not a contract data report"))?;
    let contract_data = report
        .contract_data
        .as_ref()
        .ok_or_else(|| TxRejection::dos(100, "contract data report missing payload"))?;
    let db = ctx.branch_db.read();
    let branch = db
        .branch_data(&report.reported_branch_id)
        .filter(|b| !b.is_empty())
        .ok_or_else(|| TxRejection::dos(0, "report branchid data missing"))?;

    // the reported tx and its pre-state commitment belong to the block
    let reported_block = branch
        .get(&report.reported_block_hash)
        .ok_or_else(|| TxRejection::dos(0, "get branch reported block data fail"))?;
    let reported_leaf = tx_hash_with_prev_data(
        &report.reported_tx_hash,
        &contract_data.reported_prev_data,
    );
    let reported_index = check_spv_proof(
        &reported_block.header.merkle_root_with_prev_data,
        &contract_data.reported_spv.pmt,
        &reported_leaf,
    )
    .ok_or_else(|| TxRejection::dos(0, "reported prev data spv fail"))?;

    // the newer write belongs to its block
    let prove_block = branch
        .get(&contract_data.prove_spv.block_hash)
        .ok_or_else(|| TxRejection::dos(0, "prove block data missing"))?;
    let prove_leaf = tx_hash_with_data(&contract_data.prove_tx_hash, &contract_data.prove_contract_data);
    let prove_index = check_spv_proof(
        &prove_block.header.merkle_root_with_data,
        &contract_data.prove_spv.pmt,
        &prove_leaf,
    )
    .ok_or_else(|| TxRejection::dos(0, "prove final data spv fail"))?;

    if reported_block.height < prove_block.height {
        return Err(TxRejection::dos(0, "prove block is not older than reported block"));
    }
    // both blocks must lie on one chain
    let reported_block_hash = report.reported_block_hash;
    let prove_block_hash = contract_data.prove_spv.block_hash;
    if !branch.is_ancestor(&prove_block_hash, &reported_block_hash)
        && prove_block_hash != reported_block_hash
    {
        return Err(TxRejection::dos(0, "prove block not an ancestor of reported block"));
    }

    // sustained if, for some contract the prove tx wrote, the reported tx
    // recorded an older read
    for (contract_id, _) in &contract_data.prove_contract_data {
        let Some(recorded) = contract_data
            .reported_prev_data
            .data_from
            .get(contract_id)
        else {
            continue;
        };
        let Some(recorded_block) = branch.get(&recorded.block_hash) else {
            // the recorded read points off the anchored chain entirely
            return Ok(());
        };
        if !branch.is_ancestor(&recorded.block_hash, &reported_block_hash) {
            // recorded read is on a fork: stale by construction
            return Ok(());
        }
        let newer_block = prove_block.height > recorded_block.height;
        let newer_in_same_block = prove_block.height == recorded_block.height
            && prove_index > recorded.tx_index
            && prove_index < reported_index;
        if newer_block || newer_in_same_block {
            return Ok(());
        }
    }
    Err(TxRejection::dos(0, "reported read is not stale"))
}

/// Dispatch a prove transaction. A prove without a prior report is
/// accepted; it simply records `PROVED`.
pub fn check_prove_tx(
    ctx: &SystemContext,
    tx: &Transaction,
    verifier: &dyn ScriptVerifier,
) -> CheckResult {
    if !tx.is_prove() {
        return Ok(());
    }
    let prove = tx
        .prove
        .as_ref()
        .ok_or_else(|| TxRejection::dos(100, "prove tx missing prove data"))?;
    match prove.prove_type {
        ReportType::Tx => check_prove_report_tx(ctx, tx, verifier),
        ReportType::Coinbase | ReportType::MerkleTree => {
            check_prove_coinbase_tx(ctx, tx, verifier)
        }
        ReportType::ContractData => Err(TxRejection::dos(0, "invalid prove type")),
    }
}

// ---- report reward -------------------------------------------------------

/// Reward payout after an unanswered report: consumes the cheater's
/// mortgage collateral, pays the reporter at least half.
pub fn check_report_reward_transaction(
    ctx: &SystemContext,
    tx: &Transaction,
    connect_height: u64,
) -> CheckResult {
    if !tx.is_report_reward() {
        return Err(TxRejection::dos(100, "not a report reward tx"));
    }
    if !ctx.is_main_chain() {
        return Err(TxRejection::dos(100, "mainchain-not-accept-reportreward-tx"));
    }
    let report_txid = tx
        .report_txid
        .ok_or_else(|| TxRejection::dos(100, "reward missing reporttxid"))?;
    let (report_tx, report_block_hash) = ctx
        .blocks
        .read_tx(&report_txid)
        .ok_or_else(|| TxRejection::not_found("report tx not exist"))?;
    let report = report_tx
        .report
        .as_ref()
        .filter(|_| report_tx.is_report())
        .ok_or_else(|| TxRejection::dos(100, "invalid-report-tx"))?;

    let report_height = ctx
        .chain
        .height_of(&report_block_hash)
        .ok_or_else(|| TxRejection::not_found("report tx not in active chain"))?;
    if connect_height.saturating_sub(report_height) < REPORT_OUTOF_HEIGHT {
        return Err(TxRejection::dos(100, "still in prove stage"));
    }

    let db = ctx.branch_db.read();
    let branch = db
        .branch_data(&report.reported_branch_id)
        .filter(|b| !b.is_empty())
        .ok_or_else(|| TxRejection::not_found("reported branch data missing"))?;
    // a cheat on a fork is reportable too; no best-chain requirement here
    let block = branch
        .get(&report.reported_block_hash)
        .ok_or_else(|| TxRejection::not_found("reported block data missing"))?;

    let flag = report_tx_flag_hash(&report_tx)
        .ok_or_else(|| TxRejection::dos(100, "invalid-report-tx"))?;
    match block.report_status.get(&flag) {
        Some(ReportFlag::Reported) => {}
        _ => return Err(TxRejection::not_found("report not recorded or already proved")),
    }

    let coin = block
        .stake_tx
        .vout
        .first()
        .and_then(|out| parse_mortgage_script(&out.script_pubkey))
        .filter(|m| m.kind == MortgageKind::MortgageCoin)
        .ok_or_else(|| TxRejection::dos(100, "invalid-stake-pubkey"))?;
    let first_in = tx
        .vin
        .first()
        .ok_or_else(|| TxRejection::dos(100, "invalid-report-reward-input"))?;
    if first_in.prevout.hash != coin.branch_or_from || first_in.prevout.n != 0 {
        return Err(TxRejection::dos(100, "invalid-report-reward-input"));
    }

    let value_in = block.stake_tx.vout[0].value;
    let reporter_value = value_in / 2;
    let reporter_script = report_tx
        .vout
        .first()
        .map(|out| out.script_pubkey.clone())
        .ok_or_else(|| TxRejection::dos(100, "report tx has no outputs"))?;
    let first_out = tx
        .vout
        .first()
        .ok_or_else(|| TxRejection::dos(100, "vout[0]-must-to-reporter"))?;
    if first_out.script_pubkey != reporter_script {
        return Err(TxRejection::dos(100, "vout[0]-must-to-reporter"));
    }
    if first_out.value < reporter_value {
        return Err(TxRejection::dos(100, "invalid-reporter-out-value"));
    }
    Ok(())
}

// ---- lock / unlock mine coin ---------------------------------------------

/// Validate a fetched report / prove anchor reply against the lock or
/// unlock transaction's claims.
pub fn check_anchor_reply(
    self_branch_id: &Hash256,
    reply: &crate::branch::client::ReportTxDataReply,
    coin_preout_hash: &Hash256,
    method_is_report: bool,
) -> CheckResult {
    if reply.confirmations < REPORT_LOCK_COIN_HEIGHT {
        return Err(TxRejection::dos(
            0,
            format!(
                "need {} blocks to be mature, now is {}",
                REPORT_LOCK_COIN_HEIGHT, reply.confirmations
            ),
        ));
    }

    let anchor_tx: Transaction = crate::codec::decode_from_hex(&reply.txhex)
        .map_err(|_| TxRejection::dos(0, "anchor tx hex undecodable"))?;
    let points_here = if method_is_report {
        anchor_tx
            .report
            .as_ref()
            .map(|r| &r.reported_branch_id == self_branch_id)
            .unwrap_or(false)
    } else {
        anchor_tx
            .prove
            .as_ref()
            .map(|p| &p.branch_id == self_branch_id)
            .unwrap_or(false)
    };
    if !points_here {
        return Err(TxRejection::dos(100, "report-branchid-not-match"));
    }

    let remote_coin = Hash256::from_hex(&reply.preminecoinvouthash)
        .map_err(|_| TxRejection::dos(0, "parse preminecoinvouthash fail"))?;
    if &remote_coin != coin_preout_hash {
        return Err(TxRejection::dos(0, "lock-mine-coin-error"));
    }
    Ok(())
}

fn check_mine_coin_anchor(
    ctx: &SystemContext,
    anchor_txid: &Hash256,
    coin_preout_hash: &Hash256,
    method_is_report: bool,
) -> CheckResult {
    let Some(client) = ctx.client_for_branch(&Hash256::zero()) else {
        return Err(TxRejection::dos(1, "can not found main chain rpc config"));
    };
    let reply = if method_is_report {
        client.get_report_tx_data(anchor_txid)
    } else {
        client.get_prove_tx_data(anchor_txid)
    }
    .map_err(TxRejection::from)?;
    check_anchor_reply(&ctx.self_branch_id(), &reply, coin_preout_hash, method_is_report)
}

/// Branch-side acceptance of a lock-mine-coin: the main chain must hold a
/// mature report pinning this very coin.
pub fn check_lock_mortgage_mine_coin_tx(ctx: &SystemContext, tx: &Transaction) -> CheckResult {
    if !tx.is_lock_mine_coin() {
        return Err(TxRejection::dos(100, "not a lock mine coin tx"));
    }
    let report_txid = tx
        .report_txid
        .ok_or_else(|| TxRejection::dos(100, "lock missing reporttxid"))?;
    let coin = tx
        .coin_preout_hash
        .ok_or_else(|| TxRejection::dos(100, "lock missing coinpreouthash"))?;
    check_mine_coin_anchor(ctx, &report_txid, &coin, true)
}

/// Branch-side acceptance of an unlock-mine-coin: mirrors the lock check
/// against a mature prove.
pub fn check_unlock_mortgage_mine_coin_tx(ctx: &SystemContext, tx: &Transaction) -> CheckResult {
    if !tx.is_unlock_mine_coin() {
        return Err(TxRejection::dos(100, "not an unlock mine coin tx"));
    }
    let prove_txid = tx
        .prove_txid
        .ok_or_else(|| TxRejection::dos(100, "unlock missing provetxid"))?;
    let coin = tx
        .coin_preout_hash
        .ok_or_else(|| TxRejection::dos(100, "unlock missing coinpreouthash"))?;
    check_mine_coin_anchor(ctx, &prove_txid, &coin, false)
}

// ---- step-2 construction -------------------------------------------------

/// Destination-side construction of a step-2 from a received step-1 or
/// mortgage. Inverse of [`crate::primitives::revert_transaction`]: start
/// from the committed stripped template and fill in the source fields.
pub fn make_branch_trans_step2(
    from_tx: &Transaction,
    from_branch_id: Hash256,
    spv: Option<crate::primitives::SpvProof>,
) -> CheckResult<Transaction> {
    if !from_tx.is_pregnant() {
        return Err(TxRejection::dos(100, "tx is not a branch chain transaction"));
    }
    let template_bytes = from_tx
        .send_to_tx_bytes
        .as_ref()
        .ok_or_else(|| TxRejection::dos(100, "fromTx missing sendToTxData"))?;
    let mut step2 = Transaction::from_bytes(template_bytes)
        .map_err(|_| TxRejection::dos(100, "sendToTxData is not a valid transaction"))?;
    if !step2.is_trans_step2() {
        return Err(TxRejection::dos(100, "sendToTxData is not a step2"));
    }
    step2.from_branch_id = Some(from_branch_id);
    step2.from_tx_bytes = Some(from_tx.to_bytes());
    if from_tx.is_mortgage() {
        let mine = from_tx
            .vout
            .first()
            .and_then(|out| parse_mortgage_script(&out.script_pubkey))
            .filter(|m| m.kind == MortgageKind::MortgageMine)
            .ok_or_else(|| TxRejection::dos(100, "invalid mortgage mine script"))?;
        let out = step2
            .vout
            .first_mut()
            .ok_or_else(|| TxRejection::dos(100, "mortgage step2 has no output"))?;
        out.script_pubkey =
            script::mortgage_coin_script(&from_tx.hash(), mine.height, &mine.keyid);
    }
    if !is_main_branch(&from_branch_id) {
        step2.spv_proof = spv;
    }
    Ok(step2)
}

// ---- flag updates on connect ---------------------------------------------

/// Apply the report / prove flag state machine for every report and prove
/// inside a connected block. Idempotent under replay; `PROVED` is final.
pub fn update_report_prove_flags(ctx: &SystemContext, block: &crate::primitives::Block) {
    let mut db = ctx.branch_db.write();
    for tx in &block.vtx {
        if tx.is_report() {
            if let (Some(report), Some(flag)) = (tx.report.as_ref(), report_tx_flag_hash(tx)) {
                if let Err(err) = db.set_report_flag(
                    &report.reported_branch_id,
                    &report.reported_block_hash,
                    flag,
                    ReportFlag::Reported,
                ) {
                    warn!("failed to persist report flag: {err:?}");
                }
            }
        }
        if tx.is_prove() {
            if let (Some(prove), Some(flag)) = (tx.prove.as_ref(), prove_tx_flag_hash(tx)) {
                if let Err(err) =
                    db.set_report_flag(&prove.branch_id, &prove.block_hash, flag, ReportFlag::Proved)
                {
                    warn!("failed to persist prove flag: {err:?}");
                }
            }
        }
    }
}
