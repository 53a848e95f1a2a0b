// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Block-connect glue: re-run a connecting block's contract transactions
//! to verify all three Merkle roots, then fold its branch effects into
//! the databases.

use crate::branch::protocol::{self, TxRejection};
use crate::contract::{
    block_merkle_root_with_data, block_merkle_root_with_prev_data, finalize_block_context,
    MultiContractExecutor, MultiExecErr, StaticCoins, VmOut,
};
use crate::node::SystemContext;
use crate::primitives::{Block, BlockHeader};

/// Re-execute the block's contract transactions in parallel and require
/// every root in the header to match the recomputed ones.
pub fn verify_block_contract_roots(
    ctx: &SystemContext,
    block: &Block,
    prev_header: &BlockHeader,
    prev_height: u64,
) -> Result<Vec<VmOut>, TxRejection> {
    let (root, mutated) = block.compute_merkle_root();
    if mutated {
        return Err(TxRejection::dos(100, "bad-txns-duplicate"));
    }
    if root != block.header.merkle_root {
        return Err(TxRejection::dos(100, "bad-txnmrklroot"));
    }

    let base = ctx.contract_context.read().clone();
    let outs = MultiContractExecutor::default()
        .execute(block, prev_header, prev_height, &base, &StaticCoins::default())
        .map_err(|err| match err {
            MultiExecErr::Interrupted => TxRejection::not_found("contract execution interrupted"),
            MultiExecErr::Vm(vm) => TxRejection::dos(100, format!("contract execution fail: {vm:?}")),
        })?;

    let (prev_root, _) = block_merkle_root_with_prev_data(block, &outs);
    if prev_root != block.header.merkle_root_with_prev_data {
        return Err(TxRejection::dos(100, "bad-prevdata-mrklroot"));
    }
    let (final_root, _) = block_merkle_root_with_data(block, &outs);
    if final_root != block.header.merkle_root_with_data {
        return Err(TxRejection::dos(100, "bad-data-mrklroot"));
    }
    Ok(outs)
}

/// Apply a connected block's branch and contract side effects: report /
/// prove flags, received step-2 markers, submitted headers, the committed
/// contract context, and the tip announcement.
pub fn apply_block_effects(ctx: &SystemContext, block: &Block, outs: &[VmOut], height: u64) {
    let block_hash = block.hash();

    protocol::update_report_prove_flags(ctx, block);
    {
        let mut db = ctx.branch_db.write();
        for tx in &block.vtx {
            if tx.is_trans_step2() {
                if let (Some(from_branch), Ok(from_tx)) =
                    (tx.from_branch_id, protocol::step2_from_tx(tx))
                {
                    let _ = db.mark_step2_received(&from_branch, &from_tx.hash());
                }
            }
            if tx.is_branch_create() {
                let _ = db.create_branch(tx.hash());
            }
            if tx.is_sync_branch_info() {
                if let Some(info) = &tx.branch_block_info {
                    let _ = db.add_block_info(info);
                }
            }
        }
    }
    {
        let mut cache = ctx.branch_cache.lock();
        for tx in &block.vtx {
            cache.remove(tx);
        }
    }

    let finalized = {
        let base = ctx.contract_context.read().clone();
        finalize_block_context(&base, outs, &block_hash)
    };
    *ctx.contract_context.write() = finalized;

    ctx.events.notify_tip(block_hash, height);
}
