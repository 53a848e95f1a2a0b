// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Merkle trees over a block's transactions, and the partial Merkle tree
//! used as an SPV inclusion proof across chains.

use crate::primitives::{hash_nodes, Hash256};
use bincode::{Decode, Encode};
use std::collections::HashSet;

/// Compute a Merkle root over the given leaves. `mutated` is set when two
/// identical consecutive hashes were combined, the malleability trick of
/// duplicating the last transactions in a block.
#[must_use]
pub fn merkle_root(leaves: &[Hash256], mutated: &mut bool) -> Hash256 {
    *mutated = false;
    if leaves.is_empty() {
        return Hash256::zero();
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = if pair.len() == 2 { &pair[1] } else { &pair[0] };
            if pair.len() == 2 && left == right {
                *mutated = true;
            }
            next.push(hash_nodes(left, right));
        }
        level = next;
    }
    level[0]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpvErr {
    /// Proof structure is malformed or internally inconsistent
    BadFormat,
    /// The recomputed root does not match the claimed one
    RootMismatch,
}

/// A partial Merkle tree: the minimal set of interior hashes and traversal
/// bits needed to prove membership of the matched transactions.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Default)]
pub struct PartialMerkleTree {
    n_tx: u32,
    bits: Vec<bool>,
    hashes: Vec<Hash256>,
}

impl PartialMerkleTree {
    /// Build a proof over a block's ordered txids, matching the flagged ones
    #[must_use]
    pub fn from_txids(txids: &[Hash256], matches: &[bool]) -> Self {
        assert_eq!(txids.len(), matches.len());
        assert!(!txids.is_empty(), "a block holds at least one transaction");
        let mut pmt = Self {
            n_tx: txids.len() as u32,
            bits: Vec::new(),
            hashes: Vec::new(),
        };
        let mut height = 0;
        while pmt.tree_width(height) > 1 {
            height += 1;
        }
        pmt.traverse_and_build(height, 0, txids, matches);
        pmt
    }

    /// The "empty" proof substituted when a stripped transaction hash is
    /// recomputed on the source chain.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn n_tx(&self) -> u32 {
        self.n_tx
    }

    fn tree_width(&self, height: u32) -> u32 {
        (self.n_tx + (1 << height) - 1) >> height
    }

    fn calc_hash(&self, height: u32, pos: u32, txids: &[Hash256]) -> Hash256 {
        if height == 0 {
            return txids[pos as usize];
        }
        let left = self.calc_hash(height - 1, pos * 2, txids);
        let right = if pos * 2 + 1 < self.tree_width(height - 1) {
            self.calc_hash(height - 1, pos * 2 + 1, txids)
        } else {
            left
        };
        hash_nodes(&left, &right)
    }

    fn traverse_and_build(&mut self, height: u32, pos: u32, txids: &[Hash256], matches: &[bool]) {
        let mut parent_of_match = false;
        let mut p = pos << height;
        while p < (pos + 1) << height && p < self.n_tx {
            parent_of_match |= matches[p as usize];
            p += 1;
        }
        self.bits.push(parent_of_match);
        if height == 0 || !parent_of_match {
            self.hashes.push(self.calc_hash(height, pos, txids));
        } else {
            self.traverse_and_build(height - 1, pos * 2, txids, matches);
            if pos * 2 + 1 < self.tree_width(height - 1) {
                self.traverse_and_build(height - 1, pos * 2 + 1, txids, matches);
            }
        }
    }

    fn traverse_and_extract(
        &self,
        height: u32,
        pos: u32,
        bits_used: &mut usize,
        hash_used: &mut usize,
        matched: &mut Vec<Hash256>,
        indices: &mut Vec<u32>,
    ) -> Result<Hash256, SpvErr> {
        if *bits_used >= self.bits.len() {
            return Err(SpvErr::BadFormat);
        }
        let parent_of_match = self.bits[*bits_used];
        *bits_used += 1;
        if height == 0 || !parent_of_match {
            if *hash_used >= self.hashes.len() {
                return Err(SpvErr::BadFormat);
            }
            let hash = self.hashes[*hash_used];
            *hash_used += 1;
            if height == 0 && parent_of_match {
                matched.push(hash);
                indices.push(pos);
            }
            Ok(hash)
        } else {
            let left = self.traverse_and_extract(
                height - 1,
                pos * 2,
                bits_used,
                hash_used,
                matched,
                indices,
            )?;
            let right = if pos * 2 + 1 < self.tree_width(height - 1) {
                let right = self.traverse_and_extract(
                    height - 1,
                    pos * 2 + 1,
                    bits_used,
                    hash_used,
                    matched,
                    indices,
                )?;
                if left == right {
                    // identical subtrees can forge positions
                    return Err(SpvErr::BadFormat);
                }
                right
            } else {
                left
            };
            Ok(hash_nodes(&left, &right))
        }
    }

    /// Recompute the root, collecting the matched txids and their block
    /// positions. Fails on any structural inconsistency.
    pub fn extract_matches(&self) -> Result<(Hash256, Vec<Hash256>, Vec<u32>), SpvErr> {
        if self.n_tx == 0 {
            return Err(SpvErr::BadFormat);
        }
        if self.hashes.len() > self.n_tx as usize {
            return Err(SpvErr::BadFormat);
        }
        if self.bits.len() < self.hashes.len() {
            return Err(SpvErr::BadFormat);
        }
        let mut height = 0;
        while self.tree_width(height) > 1 {
            height += 1;
        }
        let mut bits_used = 0;
        let mut hash_used = 0;
        let mut matched = Vec::new();
        let mut indices = Vec::new();
        let root = self.traverse_and_extract(
            height,
            0,
            &mut bits_used,
            &mut hash_used,
            &mut matched,
            &mut indices,
        )?;
        // every bit and hash must be consumed (modulo padding to a byte in
        // other serializations; ours is exact)
        if bits_used != self.bits.len() || hash_used != self.hashes.len() {
            return Err(SpvErr::BadFormat);
        }
        Ok((root, matched, indices))
    }
}

/// An SPV proof: a block hash plus the partial Merkle tree of one of that
/// block's Merkle roots.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Default)]
pub struct SpvProof {
    pub block_hash: Hash256,
    pub pmt: PartialMerkleTree,
}

impl SpvProof {
    #[must_use]
    pub fn new(block_hash: Hash256, txids: &[Hash256], wanted: &HashSet<Hash256>) -> Self {
        let matches: Vec<bool> = txids.iter().map(|h| wanted.contains(h)).collect();
        Self {
            block_hash,
            pmt: PartialMerkleTree::from_txids(txids, &matches),
        }
    }
}

/// Verify an SPV proof against a known Merkle root. Returns the proven
/// transaction's index in the block. Exactly one leaf must match and it
/// must equal `query_hash`.
#[must_use]
pub fn check_spv_proof(
    merkle_root: &Hash256,
    pmt: &PartialMerkleTree,
    query_hash: &Hash256,
) -> Option<u32> {
    let (root, matched, indices) = pmt.extract_matches().ok()?;
    if &root != merkle_root {
        return None;
    }
    if indices.len() != 1 {
        return None;
    }
    if matched.first() != Some(query_hash) {
        return None;
    }
    Some(indices[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txids(n: usize) -> Vec<Hash256> {
        (0..n)
            .map(|i| Hash256::hash_from_slice(format!("tx-{i}")))
            .collect()
    }

    #[test]
    fn spv_proves_every_position() {
        for n in [1usize, 2, 3, 7, 12] {
            let ids = txids(n);
            let mut mutated = false;
            let root = merkle_root(&ids, &mut mutated);
            assert!(!mutated);
            for (i, id) in ids.iter().enumerate() {
                let mut wanted = HashSet::new();
                wanted.insert(*id);
                let proof = SpvProof::new(Hash256::zero(), &ids, &wanted);
                let idx = check_spv_proof(&root, &proof.pmt, id).unwrap();
                assert_eq!(idx as usize, i, "n={n} i={i}");
            }
        }
    }

    #[test]
    fn spv_rejects_wrong_root() {
        let ids = txids(5);
        let mut wanted = HashSet::new();
        wanted.insert(ids[2]);
        let proof = SpvProof::new(Hash256::zero(), &ids, &wanted);
        let wrong_root = Hash256::hash_from_slice(b"not the root");
        assert!(check_spv_proof(&wrong_root, &proof.pmt, &ids[2]).is_none());
    }

    #[test]
    fn spv_requires_exactly_one_match() {
        let ids = txids(6);
        let mut mutated = false;
        let root = merkle_root(&ids, &mut mutated);
        let mut wanted = HashSet::new();
        wanted.insert(ids[1]);
        wanted.insert(ids[4]);
        let proof = SpvProof::new(Hash256::zero(), &ids, &wanted);
        assert!(check_spv_proof(&root, &proof.pmt, &ids[1]).is_none());
    }

    #[test]
    fn mutation_detected_on_duplicated_tail() {
        let mut ids = txids(3);
        ids.push(ids[2]);
        let mut mutated = false;
        let _ = merkle_root(&ids, &mut mutated);
        assert!(mutated);
    }

    #[test]
    fn empty_proof_fails_extraction() {
        assert_eq!(
            PartialMerkleTree::empty().extract_matches(),
            Err(SpvErr::BadFormat)
        );
    }
}
