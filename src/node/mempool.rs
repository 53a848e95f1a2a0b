// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::consensus::Money;
use crate::primitives::{Hash256, Transaction};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub fee: Money,
    pub size: usize,
    /// Operator adjustment from `prioritisetransaction`
    pub fee_delta: Money,
}

impl MempoolEntry {
    #[must_use]
    pub fn new(tx: Transaction, fee: Money) -> Self {
        let size = tx.to_bytes().len();
        Self {
            tx,
            fee,
            size,
            fee_delta: 0,
        }
    }

    /// Effective fee per byte, priority delta included
    #[must_use]
    pub fn fee_rate(&self) -> Money {
        (self.fee + self.fee_delta) / self.size.max(1) as Money
    }
}

/// The transaction pool the miner drains. Guarded by its own mutex in the
/// system context.
#[derive(Debug, Default)]
pub struct Mempool {
    map: HashMap<Hash256, MempoolEntry>,
    bytes: usize,
}

impl Mempool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    #[must_use]
    pub fn contains(&self, txid: &Hash256) -> bool {
        self.map.contains_key(txid)
    }

    #[must_use]
    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.map.get(txid)
    }

    pub fn add(&mut self, entry: MempoolEntry) {
        let txid = entry.tx.hash();
        if let Some(old) = self.map.insert(txid, entry) {
            self.bytes -= old.size;
        }
        self.bytes += self.map[&txid].size;
    }

    pub fn remove(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.map.remove(txid)?;
        self.bytes -= entry.size;
        Some(entry)
    }

    pub fn prioritise(&mut self, txid: &Hash256, fee_delta: Money) -> bool {
        match self.map.get_mut(txid) {
            Some(entry) => {
                entry.fee_delta += fee_delta;
                true
            }
            None => false,
        }
    }

    /// Entries ordered best-paying first, ties broken by txid for
    /// deterministic templates.
    #[must_use]
    pub fn collect_sorted(&self) -> Vec<&MempoolEntry> {
        let mut entries: Vec<&MempoolEntry> = self.map.values().collect();
        entries.sort_by(|a, b| {
            b.fee_rate()
                .cmp(&a.fee_rate())
                .then_with(|| a.tx.hash().cmp(&b.tx.hash()))
        });
        entries
    }

    /// Median fee rate of the pool, the whole fee estimator this node
    /// carries. Zero when empty.
    #[must_use]
    pub fn estimate_fee_rate(&self) -> Money {
        if self.map.is_empty() {
            return 0;
        }
        let mut rates: Vec<Money> = self.map.values().map(MempoolEntry::fee_rate).collect();
        rates.sort_unstable();
        rates[rates.len() / 2]
    }
}
