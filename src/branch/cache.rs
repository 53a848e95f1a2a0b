// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Mempool-stage cache of branch-flavoured transactions, so duplicates are
//! rejected before they ever reach a block.

use crate::branch::db::ReportFlag;
use crate::primitives::{prove_tx_flag_hash, report_tx_flag_hash, Hash256, Transaction};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct BranchCache {
    /// `(branch_id, block_hash)` of pending sync-branch-info entries
    pending_block_info: HashSet<(Hash256, Hash256)>,
    /// Pending report / prove flags
    flags: HashMap<Hash256, ReportFlag>,
}

impl BranchCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an equivalent branch payload is already pending
    #[must_use]
    pub fn has_in_cache(&self, tx: &Transaction) -> bool {
        if let Some(info) = &tx.branch_block_info {
            return self
                .pending_block_info
                .contains(&(info.branch_id, info.header.hash()));
        }
        if let Some(flag) = report_tx_flag_hash(tx) {
            return self.flags.contains_key(&flag);
        }
        if let Some(flag) = prove_tx_flag_hash(tx) {
            return self.flags.get(&flag) == Some(&ReportFlag::Proved);
        }
        false
    }

    pub fn add(&mut self, tx: &Transaction) {
        if let Some(info) = &tx.branch_block_info {
            self.pending_block_info
                .insert((info.branch_id, info.header.hash()));
        }
        if let Some(flag) = report_tx_flag_hash(tx) {
            self.flags.entry(flag).or_insert(ReportFlag::Reported);
        }
        if let Some(flag) = prove_tx_flag_hash(tx) {
            self.flags.insert(flag, ReportFlag::Proved);
        }
    }

    /// Drop entries once their tx left the mempool
    pub fn remove(&mut self, tx: &Transaction) {
        if let Some(info) = &tx.branch_block_info {
            self.pending_block_info
                .remove(&(info.branch_id, info.header.hash()));
        }
        if let Some(flag) = report_tx_flag_hash(tx).or_else(|| prove_tx_flag_hash(tx)) {
            self.flags.remove(&flag);
        }
    }

    pub fn clear(&mut self) {
        self.pending_block_info.clear();
        self.flags.clear();
    }
}
