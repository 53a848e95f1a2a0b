// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::primitives::{merkle, Hash160, Hash256, OutPoint, Transaction};
use bincode::{Decode, Encode};
use schnorrkel::{signing_context, PublicKey as SchnorPK, Signature as SchnorSig};

/// Domain separator for block signatures
pub const BLOCK_SIGNING_CTX: &[u8] = b"ambercoin.block";

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: Hash256,

    /// Root over `tx.hash()`
    pub merkle_root: Hash256,
    /// Root over `H(tx.hash() || prev_contract_data)`
    pub merkle_root_with_prev_data: Hash256,
    /// Root over `H(tx.hash() || post_contract_data)`
    pub merkle_root_with_data: Hash256,

    pub time: i64,
    pub bits: u32,
    pub nonce: u32,

    /// The mortgage-coin UTXO staked by this block. Null on the main chain.
    pub prevout_stake: OutPoint,
    /// Staker public key, empty until signed
    pub sig_pubkey: Vec<u8>,
    /// Signature over [`BlockHeader::hash_no_sig_data`]
    pub block_sig: Vec<u8>,
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            version: 1,
            prev_hash: Hash256::zero(),
            merkle_root: Hash256::zero(),
            merkle_root_with_prev_data: Hash256::zero(),
            merkle_root_with_data: Hash256::zero(),
            time: 0,
            bits: 0,
            nonce: 0,
            prevout_stake: OutPoint::null(),
            sig_pubkey: Vec::new(),
            block_sig: Vec::new(),
        }
    }
}

impl BlockHeader {
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        crate::codec::encode_to_vec(self).expect("header within codec limit")
    }

    /// Block hash over the full header, signature included
    #[must_use]
    pub fn hash(&self) -> Hash256 {
        Hash256::hash_from_slice(self.to_bytes())
    }

    /// The message a block signature commits to: the header with both
    /// signature fields cleared.
    #[must_use]
    pub fn hash_no_sig_data(&self) -> Hash256 {
        let mut unsigned = self.clone();
        unsigned.sig_pubkey.clear();
        unsigned.block_sig.clear();
        unsigned.hash()
    }

    #[must_use]
    pub fn has_stake(&self) -> bool {
        !self.prevout_stake.is_null()
    }

    /// Key id of the embedded staker public key
    #[must_use]
    pub fn signer_keyid(&self) -> Option<Hash160> {
        if self.sig_pubkey.is_empty() {
            return None;
        }
        Some(Hash160::hash_from_slice(&self.sig_pubkey))
    }
}

/// Verify the header's embedded signature against its embedded public key
#[must_use]
pub fn check_block_header_signature(header: &BlockHeader) -> bool {
    let Ok(pk) = SchnorPK::from_bytes(&header.sig_pubkey) else {
        return false;
    };
    let Ok(sig) = SchnorSig::from_bytes(&header.block_sig) else {
        return false;
    };
    let msg = header.hash_no_sig_data();
    let ctx = signing_context(BLOCK_SIGNING_CTX);
    pk.verify(ctx.bytes(msg.as_bytes()), &sig).is_ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Default)]
pub struct Block {
    pub header: BlockHeader,
    pub vtx: Vec<Transaction>,
}

impl Block {
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        crate::codec::encode_to_vec(self).expect("block within codec limit")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        crate::codec::decode(bytes)
    }

    #[must_use]
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// The stake transaction of a branch block, `vtx[1]`
    #[must_use]
    pub fn stake_tx(&self) -> Option<&Transaction> {
        self.vtx.get(1).filter(|tx| tx.is_stake())
    }

    /// Ordered txids, the leaf sequence of all three Merkle trees
    #[must_use]
    pub fn txids(&self) -> Vec<Hash256> {
        self.vtx.iter().map(Transaction::hash).collect()
    }

    /// Root over the plain txids plus the mutation flag
    #[must_use]
    pub fn compute_merkle_root(&self) -> (Hash256, bool) {
        let mut mutated = false;
        let root = merkle::merkle_root(&self.txids(), &mut mutated);
        (root, mutated)
    }
}
