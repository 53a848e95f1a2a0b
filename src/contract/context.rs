// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Contract state snapshots. Snapshots are value types: they are copied
//! across the pre / cache / post stages and across executor threads.

use crate::consensus::Money;
use crate::primitives::{hash_with_payload, Hash160, Hash256};
use bincode::{Decode, Encode};
use std::collections::BTreeMap;

/// Where a contract's current bytes were committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Default)]
pub struct ContractDataFrom {
    pub block_hash: Hash256,
    pub tx_index: u32,
}

/// One contract's state: provenance plus opaque data bytes
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Default)]
pub struct ContractInfo {
    pub from: ContractDataFrom,
    pub data: Vec<u8>,
}

/// `contract_id -> state`. A `BTreeMap` so iteration order, and therefore
/// every hash derived from a snapshot, is deterministic.
pub type MapContractContext = BTreeMap<Hash160, ContractInfo>;

/// The pre-state commitment of one transaction: which version of each
/// contract it read, and the contract's coin balance it executed against.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Default)]
pub struct ContractPrevData {
    pub coins: Money,
    pub data_from: BTreeMap<Hash160, ContractDataFrom>,
}

impl ContractPrevData {
    /// Project the provenance of a full snapshot
    #[must_use]
    pub fn from_context(coins: Money, ctx: &MapContractContext) -> Self {
        Self {
            coins,
            data_from: ctx.iter().map(|(id, info)| (*id, info.from)).collect(),
        }
    }
}

/// Leaf of `hashMerkleRootWithPrevData`: `H(tx_hash || prev_data)`
#[must_use]
pub fn tx_hash_with_prev_data(tx_hash: &Hash256, prev: &ContractPrevData) -> Hash256 {
    let payload = crate::codec::encode_to_vec(prev).expect("prev data within codec limit");
    hash_with_payload(tx_hash, &payload)
}

/// Leaf of `hashMerkleRootWithData`: `H(tx_hash || post_data_bytes)`.
/// Only the written bytes enter the hash: provenance of in-flight writes is
/// assigned when the block connects and must not influence its own root.
#[must_use]
pub fn tx_hash_with_data(tx_hash: &Hash256, written: &MapContractContext) -> Hash256 {
    let bytes_only: BTreeMap<Hash160, Vec<u8>> = written
        .iter()
        .map(|(id, info)| (*id, info.data.clone()))
        .collect();
    let payload = crate::codec::encode_to_vec(&bytes_only).expect("post data within codec limit");
    hash_with_payload(tx_hash, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prev_data_projects_provenance_only() {
        let mut ctx = MapContractContext::new();
        let id = Hash160::hash_from_slice(b"c1");
        ctx.insert(
            id,
            ContractInfo {
                from: ContractDataFrom {
                    block_hash: Hash256::hash_from_slice(b"blk"),
                    tx_index: 3,
                },
                data: vec![1, 2, 3],
            },
        );
        let prev = ContractPrevData::from_context(42, &ctx);
        assert_eq!(prev.coins, 42);
        assert_eq!(prev.data_from[&id].tx_index, 3);
    }

    #[test]
    fn final_leaf_ignores_provenance() {
        let tx_hash = Hash256::hash_from_slice(b"tx");
        let id = Hash160::hash_from_slice(b"c1");
        let mut a = MapContractContext::new();
        a.insert(
            id,
            ContractInfo {
                from: ContractDataFrom {
                    block_hash: Hash256::hash_from_slice(b"blk-a"),
                    tx_index: 1,
                },
                data: vec![9],
            },
        );
        let mut b = MapContractContext::new();
        b.insert(
            id,
            ContractInfo {
                from: ContractDataFrom::default(),
                data: vec![9],
            },
        );
        assert_eq!(tx_hash_with_data(&tx_hash, &a), tx_hash_with_data(&tx_hash, &b));
    }

    #[test]
    fn prev_leaf_binds_coins() {
        let tx_hash = Hash256::hash_from_slice(b"tx");
        let a = ContractPrevData {
            coins: 1,
            data_from: BTreeMap::new(),
        };
        let b = ContractPrevData {
            coins: 2,
            data_from: BTreeMap::new(),
        };
        assert_ne!(
            tx_hash_with_prev_data(&tx_hash, &a),
            tx_hash_with_prev_data(&tx_hash, &b)
        );
    }
}
