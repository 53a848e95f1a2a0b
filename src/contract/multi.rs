// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Parallel contract driver. Splits a block's transactions across a worker
//! pool of isolated executors, then proves the parallel schedule was
//! equivalent to canonical order via a read/write conflict check; on
//! conflict the block is re-run sequentially.

use crate::contract::context::{ContractDataFrom, ContractPrevData, MapContractContext};
use crate::contract::executor::{ContractCoinsView, ContractExecutor, VmOut};
use crate::contract::{tx_hash_with_data, tx_hash_with_prev_data, VmErr};
use crate::primitives::{merkle, Block, BlockHeader, Hash256, Transaction};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiExecErr {
    Vm(VmErr),
    /// The interrupt flag was raised; workers stopped at a tx boundary
    Interrupted,
}

impl From<VmErr> for MultiExecErr {
    fn from(err: VmErr) -> Self {
        Self::Vm(err)
    }
}

pub struct MultiContractExecutor {
    interrupt: Arc<AtomicBool>,
    n_workers: usize,
}

impl Default for MultiContractExecutor {
    fn default() -> Self {
        Self::new(rayon::current_num_threads())
    }
}

impl MultiContractExecutor {
    #[must_use]
    pub fn new(n_workers: usize) -> Self {
        Self {
            interrupt: Arc::new(AtomicBool::new(false)),
            n_workers: n_workers.max(1),
        }
    }

    /// Shared flag a caller may raise to abort a long block. Checked
    /// between transactions; workers run to their current tx boundary.
    #[must_use]
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    /// Execute the whole block's contract transactions, one [`VmOut`] per
    /// tx in canonical index order. The result is as-if-sequential: a
    /// conflicting parallel schedule is detected and re-run in order.
    pub fn execute(
        &self,
        block: &Block,
        prev_header: &BlockHeader,
        prev_height: u64,
        base: &MapContractContext,
        coins: &dyn ContractCoinsView,
    ) -> Result<Vec<VmOut>, MultiExecErr> {
        self.interrupt.store(false, Ordering::SeqCst);
        let n_tx = block.vtx.len();
        if n_tx == 0 {
            return Ok(Vec::new());
        }

        let slices = split_ranges(n_tx, self.n_workers);
        let results: Vec<Result<Vec<VmOut>, MultiExecErr>> = {
            use rayon::prelude::*;
            slices
                .par_iter()
                .map(|&(offset, count)| {
                    self.run_slice(block, prev_header, prev_height, base, coins, offset, count)
                })
                .collect()
        };

        let mut outs = Vec::with_capacity(n_tx);
        for result in results {
            outs.extend(result?);
        }

        if has_cross_conflict(&outs) {
            log::debug!(
                "parallel contract schedule conflicted in block {}, re-running sequentially",
                block.hash()
            );
            outs = self.run_slice(block, prev_header, prev_height, base, coins, 0, n_tx)?;
        }
        Ok(outs)
    }

    fn run_slice(
        &self,
        block: &Block,
        prev_header: &BlockHeader,
        prev_height: u64,
        base: &MapContractContext,
        coins: &dyn ContractCoinsView,
        offset: usize,
        count: usize,
    ) -> Result<Vec<VmOut>, MultiExecErr> {
        let mut exec = ContractExecutor::with_data(base.clone());
        let mut outs = Vec::with_capacity(count);
        for i in offset..offset + count {
            if self.interrupt.load(Ordering::SeqCst) {
                return Err(MultiExecErr::Interrupted);
            }
            let tx = &block.vtx[i];
            if tx.is_smart_contract() {
                let out = exec.execute_tx(tx, i as u32, prev_header, prev_height, coins)?;
                exec.commit();
                outs.push(out);
            } else {
                outs.push(VmOut::default());
            }
        }
        Ok(outs)
    }
}

fn split_ranges(n: usize, workers: usize) -> Vec<(usize, usize)> {
    let workers = workers.min(n).max(1);
    let base = n / workers;
    let rem = n % workers;
    let mut ranges = Vec::with_capacity(workers);
    let mut offset = 0;
    for w in 0..workers {
        let count = base + usize::from(w < rem);
        if count > 0 {
            ranges.push((offset, count));
        }
        offset += count;
    }
    ranges
}

/// A later tx reading state an earlier tx wrote invalidates the parallel
/// schedule: the read may have observed the pre-block version.
#[must_use]
pub fn has_cross_conflict(outs: &[VmOut]) -> bool {
    for j in 1..outs.len() {
        if outs[j].tx_prev_data.is_empty() {
            continue;
        }
        for i in 0..j {
            if outs[j]
                .tx_prev_data
                .keys()
                .any(|id| outs[i].tx_final_data.contains_key(id))
            {
                return true;
            }
        }
    }
    false
}

/// Root over `H(tx_hash || prev_contract_data)` in block order
#[must_use]
pub fn block_merkle_root_with_prev_data(block: &Block, outs: &[VmOut]) -> (Hash256, bool) {
    let leaves = leaves_with(block, outs, |tx_hash, tx, out| {
        if tx.is_smart_contract() {
            let prev = ContractPrevData::from_context(out.prev_coins, &out.tx_prev_data);
            tx_hash_with_prev_data(&tx_hash, &prev)
        } else {
            tx_hash
        }
    });
    let mut mutated = false;
    let root = merkle::merkle_root(&leaves, &mut mutated);
    (root, mutated)
}

/// Root over `H(tx_hash || post_contract_data)` in block order
#[must_use]
pub fn block_merkle_root_with_data(block: &Block, outs: &[VmOut]) -> (Hash256, bool) {
    let leaves = leaves_with(block, outs, |tx_hash, tx, out| {
        if tx.is_smart_contract() {
            tx_hash_with_data(&tx_hash, &out.tx_final_data)
        } else {
            tx_hash
        }
    });
    let mut mutated = false;
    let root = merkle::merkle_root(&leaves, &mut mutated);
    (root, mutated)
}

fn leaves_with(
    block: &Block,
    outs: &[VmOut],
    leaf: impl Fn(Hash256, &Transaction, &VmOut) -> Hash256,
) -> Vec<Hash256> {
    debug_assert_eq!(block.vtx.len(), outs.len());
    block
        .vtx
        .iter()
        .zip(outs.iter())
        .map(|(tx, out)| leaf(tx.hash(), tx, out))
        .collect()
}

/// Fold the accepted block's writes into the pre-block context, stamping
/// each contract's provenance with the connecting block and tx index.
#[must_use]
pub fn finalize_block_context(
    base: &MapContractContext,
    outs: &[VmOut],
    block_hash: &Hash256,
) -> MapContractContext {
    let mut ctx = base.clone();
    for (tx_index, out) in outs.iter().enumerate() {
        for (id, info) in &out.tx_final_data {
            let mut info = info.clone();
            info.from = ContractDataFrom {
                block_hash: *block_hash,
                tx_index: tx_index as u32,
            };
            ctx.insert(*id, info);
        }
    }
    ctx
}
