// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use bincode::{Decode, Encode};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    #[must_use]
    pub fn zero() -> Self {
        Self([0; 32])
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }

    /// Double SHA256 of the given bytes
    #[must_use]
    pub fn hash_from_slice(bytes: impl AsRef<[u8]>) -> Self {
        let first = Sha256::digest(bytes.as_ref());
        let second = Sha256::digest(first);
        let mut out = [0; 32];
        out.copy_from_slice(&second);
        Self(out)
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, &'static str> {
        let bytes = hex::decode(s).map_err(|_| "invalid hex")?;
        if bytes.len() != 32 {
            return Err("invalid hash length");
        }
        let mut out = [0; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash256").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Hash256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        String::serialize(&self.to_hex(), serializer)
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D>(deserializer: D) -> Result<Hash256, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        Hash256::from_hex(&string).map_err(serde::de::Error::custom)
    }
}

/// Key id: a 160 bit digest of a public key
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Default)]
pub struct Hash160(pub [u8; 20]);

impl Hash160 {
    #[must_use]
    pub fn zero() -> Self {
        Self([0; 20])
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 20]
    }

    /// Truncated double SHA256 of the given bytes
    #[must_use]
    pub fn hash_from_slice(bytes: impl AsRef<[u8]>) -> Self {
        let h = Hash256::hash_from_slice(bytes);
        let mut out = [0; 20];
        out.copy_from_slice(&h.0[..20]);
        Self(out)
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, &'static str> {
        let bytes = hex::decode(s).map_err(|_| "invalid hex")?;
        if bytes.len() != 20 {
            return Err("invalid keyid length");
        }
        let mut out = [0; 20];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl AsRef<[u8]> for Hash160 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Hash160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash160").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for Hash160 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Hash160 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        String::serialize(&self.to_hex(), serializer)
    }
}

impl<'de> Deserialize<'de> for Hash160 {
    fn deserialize<D>(deserializer: D) -> Result<Hash160, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        Hash160::from_hex(&string).map_err(serde::de::Error::custom)
    }
}

/// Hash of two concatenated nodes, as used by the Merkle trees
#[must_use]
pub fn hash_nodes(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(&left.0);
    buf[32..].copy_from_slice(&right.0);
    Hash256::hash_from_slice(buf)
}

/// `H(tx_hash || payload)`, the leaf form of the two contract-state trees
#[must_use]
pub fn hash_with_payload(tx_hash: &Hash256, payload: &[u8]) -> Hash256 {
    let mut buf = Vec::with_capacity(32 + payload.len());
    buf.extend_from_slice(&tx_hash.0);
    buf.extend_from_slice(payload);
    Hash256::hash_from_slice(buf)
}
