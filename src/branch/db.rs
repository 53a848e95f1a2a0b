// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! The branch database: every branch chain's anchored header stream plus
//! the report / prove flag table. Header chains live in an arena with
//! parent links as indices, so ancestor walks are array hops and reorgs
//! never chase pointers.

use crate::primitives::{BlockHeader, BranchBlockInfo, Hash256, Transaction};
use bincode::{Decode, Encode};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbErr {
    Io(String),
    Codec,
    /// Header's parent is unknown and the chain is non-empty
    Orphan,
    Duplicate,
}

/// Key-value store seam. `RocksDb` in the daemon, `MemoryDb` in tests.
pub trait DbInterface: Send + Sync {
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbErr>;
    fn put_raw(&self, key: &[u8], value: &[u8]) -> Result<(), DbErr>;
    fn delete_raw(&self, key: &[u8]) -> Result<(), DbErr>;
    fn prefix_raw(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbErr>;
}

#[derive(Default)]
pub struct MemoryDb {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDb {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DbInterface for MemoryDb {
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbErr> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put_raw(&self, key: &[u8], value: &[u8]) -> Result<(), DbErr> {
        self.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete_raw(&self, key: &[u8]) -> Result<(), DbErr> {
        self.map.write().remove(key);
        Ok(())
    }

    fn prefix_raw(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbErr> {
        Ok(self
            .map
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

pub struct RocksDb {
    db: rocksdb::DB,
}

impl RocksDb {
    pub fn open(path: &std::path::Path) -> Result<Self, DbErr> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        let db = rocksdb::DB::open(&opts, path).map_err(|e| DbErr::Io(e.to_string()))?;
        Ok(Self { db })
    }
}

impl DbInterface for RocksDb {
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbErr> {
        self.db.get(key).map_err(|e| DbErr::Io(e.to_string()))
    }

    fn put_raw(&self, key: &[u8], value: &[u8]) -> Result<(), DbErr> {
        self.db.put(key, value).map_err(|e| DbErr::Io(e.to_string()))
    }

    fn delete_raw(&self, key: &[u8]) -> Result<(), DbErr> {
        self.db.delete(key).map_err(|e| DbErr::Io(e.to_string()))
    }

    fn prefix_raw(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbErr> {
        let mut out = Vec::new();
        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            prefix,
            rocksdb::Direction::Forward,
        ));
        for item in iter {
            let (k, v) = item.map_err(|e| DbErr::Io(e.to_string()))?;
            if !k.starts_with(prefix) {
                break;
            }
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum ReportFlag {
    Reported,
    Proved,
}

/// One anchored branch block
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct BranchBlockData {
    pub header: BlockHeader,
    pub height: u64,
    pub stake_tx: Transaction,
    /// Reports filed against this block, by report-flag hash
    pub report_status: BTreeMap<Hash256, ReportFlag>,
}

#[derive(Debug, Clone)]
struct ArenaEntry {
    data: BranchBlockData,
    parent: Option<u32>,
}

/// One branch chain's header tree
#[derive(Debug, Clone, Default)]
pub struct BranchData {
    arena: Vec<ArenaEntry>,
    index: HashMap<Hash256, u32>,
    best: Option<u32>,
}

impl BranchData {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    /// Height of the best anchored block, zero when empty
    #[must_use]
    pub fn height(&self) -> u64 {
        self.best
            .map(|idx| self.arena[idx as usize].data.height)
            .unwrap_or(0)
    }

    #[must_use]
    pub fn tip(&self) -> Option<&BranchBlockData> {
        self.best.map(|idx| &self.arena[idx as usize].data)
    }

    #[must_use]
    pub fn contains(&self, hash: &Hash256) -> bool {
        self.index.contains_key(hash)
    }

    #[must_use]
    pub fn get(&self, hash: &Hash256) -> Option<&BranchBlockData> {
        self.index
            .get(hash)
            .map(|&idx| &self.arena[idx as usize].data)
    }

    pub fn get_mut(&mut self, hash: &Hash256) -> Option<&mut BranchBlockData> {
        let idx = *self.index.get(hash)?;
        Some(&mut self.arena[idx as usize].data)
    }

    /// Append a block. The parent must exist unless the chain is empty.
    pub fn connect(&mut self, data: BranchBlockData) -> Result<(), DbErr> {
        let hash = data.header.hash();
        if self.index.contains_key(&hash) {
            return Err(DbErr::Duplicate);
        }
        let parent = match self.index.get(&data.header.prev_hash) {
            Some(&idx) => Some(idx),
            None if self.arena.is_empty() => None,
            None => return Err(DbErr::Orphan),
        };
        let idx = self.arena.len() as u32;
        let height = data.height;
        self.arena.push(ArenaEntry { data, parent });
        self.index.insert(hash, idx);
        let best_height = self.best.map(|b| self.arena[b as usize].data.height);
        if best_height.map_or(true, |h| height > h) {
            self.best = Some(idx);
        }
        Ok(())
    }

    /// The ancestor of `from` at `height`, walking parent indices
    #[must_use]
    pub fn ancestor(&self, from: &Hash256, height: u64) -> Option<&BranchBlockData> {
        let mut idx = *self.index.get(from)?;
        loop {
            let entry = &self.arena[idx as usize];
            if entry.data.height == height {
                return Some(&entry.data);
            }
            if entry.data.height < height {
                return None;
            }
            idx = entry.parent?;
        }
    }

    /// Whether `ancestor_hash` lies on the parent path of `descendant_hash`
    #[must_use]
    pub fn is_ancestor(&self, ancestor_hash: &Hash256, descendant_hash: &Hash256) -> bool {
        let Some(target) = self.get(ancestor_hash) else {
            return false;
        };
        self.ancestor(descendant_hash, target.height)
            .map(|b| b.header.hash() == *ancestor_hash)
            .unwrap_or(false)
    }
}

const PREFIX_BLOCK: u8 = b'b';
const PREFIX_FLAG: u8 = b'f';
const PREFIX_CREATED: u8 = b'c';
const PREFIX_STEP2: u8 = b's';

fn block_key(branch_id: &Hash256, block_hash: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(65);
    key.push(PREFIX_BLOCK);
    key.extend_from_slice(&branch_id.0);
    key.extend_from_slice(&block_hash.0);
    key
}

fn flag_key(flag_hash: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(PREFIX_FLAG);
    key.extend_from_slice(&flag_hash.0);
    key
}

fn created_key(branch_id: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(PREFIX_CREATED);
    key.extend_from_slice(&branch_id.0);
    key
}

fn step2_key(from_branch_id: &Hash256, from_tx_hash: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(65);
    key.push(PREFIX_STEP2);
    key.extend_from_slice(&from_branch_id.0);
    key.extend_from_slice(&from_tx_hash.0);
    key
}

/// Persistent map `branch_id -> BranchData` plus the report flag table.
/// Exclusively owns all branch data; mutation happens under the caller's
/// chain lock.
pub struct BranchDb {
    db: Box<dyn DbInterface>,
    branches: HashMap<Hash256, BranchData>,
    report_flags: HashMap<Hash256, ReportFlag>,
}

impl BranchDb {
    pub fn open(db: Box<dyn DbInterface>) -> Result<Self, DbErr> {
        let mut branches: HashMap<Hash256, BranchData> = HashMap::new();
        // replay persisted blocks in height order per branch
        let mut loaded: HashMap<Hash256, Vec<BranchBlockData>> = HashMap::new();
        for (key, value) in db.prefix_raw(&[PREFIX_BLOCK])? {
            if key.len() != 65 {
                return Err(DbErr::Codec);
            }
            let mut branch_id = [0; 32];
            branch_id.copy_from_slice(&key[1..33]);
            let data: BranchBlockData = crate::codec::decode(&value).map_err(|_| DbErr::Codec)?;
            loaded.entry(Hash256(branch_id)).or_default().push(data);
        }
        for (branch_id, mut blocks) in loaded {
            blocks.sort_by_key(|b| b.height);
            let branch = branches.entry(branch_id).or_default();
            for block in blocks {
                match branch.connect(block) {
                    Ok(()) | Err(DbErr::Duplicate) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        for (_, value) in db.prefix_raw(&[PREFIX_CREATED])? {
            let _: u8 = crate::codec::decode(&value).map_err(|_| DbErr::Codec)?;
        }
        let mut report_flags = HashMap::new();
        for (key, value) in db.prefix_raw(&[PREFIX_FLAG])? {
            if key.len() != 33 {
                return Err(DbErr::Codec);
            }
            let mut flag_hash = [0; 32];
            flag_hash.copy_from_slice(&key[1..]);
            let flag: ReportFlag = crate::codec::decode(&value).map_err(|_| DbErr::Codec)?;
            report_flags.insert(Hash256(flag_hash), flag);
        }
        Ok(Self {
            db,
            branches,
            report_flags,
        })
    }

    #[must_use]
    pub fn is_branch_created(&self, branch_id: &Hash256) -> bool {
        self.branches.contains_key(branch_id)
            || matches!(self.db.get_raw(&created_key(branch_id)), Ok(Some(_)))
    }

    pub fn create_branch(&mut self, branch_id: Hash256) -> Result<(), DbErr> {
        self.db.put_raw(
            &created_key(&branch_id),
            &crate::codec::encode_to_vec(&1u8).expect("u8"),
        )?;
        self.branches.entry(branch_id).or_default();
        Ok(())
    }

    #[must_use]
    pub fn has_branch_data(&self, branch_id: &Hash256) -> bool {
        self.branches
            .get(branch_id)
            .map(|b| !b.is_empty())
            .unwrap_or(false)
    }

    #[must_use]
    pub fn branch_data(&self, branch_id: &Hash256) -> Option<&BranchData> {
        self.branches.get(branch_id)
    }

    pub fn iter_branches(&self) -> impl Iterator<Item = (&Hash256, &BranchData)> {
        self.branches.iter()
    }

    /// Connect a submitted branch header. The stake tx arrives as encoded
    /// bytes inside the sync payload.
    pub fn add_block_info(&mut self, info: &BranchBlockInfo) -> Result<(), DbErr> {
        let stake_tx: Transaction =
            crate::codec::decode(&info.stake_tx_bytes).map_err(|_| DbErr::Codec)?;
        let data = BranchBlockData {
            header: info.header.clone(),
            height: info.height,
            stake_tx,
            report_status: BTreeMap::new(),
        };
        let branch = self.branches.entry(info.branch_id).or_default();
        let block_hash = data.header.hash();
        branch.connect(data.clone())?;
        self.db
            .put_raw(
                &block_key(&info.branch_id, &block_hash),
                &crate::codec::encode_to_vec(&data).map_err(|_| DbErr::Codec)?,
            )
    }

    /// A step-2 is received at most once per source transaction
    #[must_use]
    pub fn is_step2_received(&self, from_branch_id: &Hash256, from_tx_hash: &Hash256) -> bool {
        matches!(
            self.db.get_raw(&step2_key(from_branch_id, from_tx_hash)),
            Ok(Some(_))
        )
    }

    pub fn mark_step2_received(
        &mut self,
        from_branch_id: &Hash256,
        from_tx_hash: &Hash256,
    ) -> Result<(), DbErr> {
        self.db.put_raw(
            &step2_key(from_branch_id, from_tx_hash),
            &crate::codec::encode_to_vec(&1u8).expect("u8"),
        )
    }

    #[must_use]
    pub fn report_flag(&self, flag_hash: &Hash256) -> Option<ReportFlag> {
        self.report_flags.get(flag_hash).copied()
    }

    /// Record a report or prove. The flag is monotone: once `Proved` it
    /// never reverts to `Reported`.
    pub fn set_report_flag(
        &mut self,
        branch_id: &Hash256,
        block_hash: &Hash256,
        flag_hash: Hash256,
        flag: ReportFlag,
    ) -> Result<(), DbErr> {
        if self.report_flags.get(&flag_hash) == Some(&ReportFlag::Proved) {
            return Ok(());
        }
        self.report_flags.insert(flag_hash, flag);
        self.db.put_raw(
            &flag_key(&flag_hash),
            &crate::codec::encode_to_vec(&flag).map_err(|_| DbErr::Codec)?,
        )?;
        if let Some(block) = self
            .branches
            .get_mut(branch_id)
            .and_then(|b| b.get_mut(block_hash))
        {
            let entry = block.report_status.entry(flag_hash).or_insert(flag);
            if *entry != ReportFlag::Proved {
                *entry = flag;
            }
            let data = block.clone();
            self.db.put_raw(
                &block_key(branch_id, block_hash),
                &crate::codec::encode_to_vec(&data).map_err(|_| DbErr::Codec)?,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::TxType;

    fn block_data(height: u64, prev: Hash256) -> BranchBlockData {
        BranchBlockData {
            header: BlockHeader {
                prev_hash: prev,
                time: height as i64,
                ..BlockHeader::default()
            },
            height,
            stake_tx: Transaction {
                tx_type: TxType::Stake,
                ..Transaction::default()
            },
            report_status: BTreeMap::new(),
        }
    }

    fn chain(n: u64) -> (BranchData, Vec<Hash256>) {
        let mut branch = BranchData::default();
        let mut hashes = Vec::new();
        let mut prev = Hash256::zero();
        for h in 1..=n {
            let data = block_data(h, prev);
            let hash = data.header.hash();
            branch.connect(data).unwrap();
            hashes.push(hash);
            prev = hash;
        }
        (branch, hashes)
    }

    #[test]
    fn connect_tracks_best_height() {
        let (branch, hashes) = chain(5);
        assert_eq!(branch.height(), 5);
        assert_eq!(branch.tip().unwrap().header.hash(), hashes[4]);
    }

    #[test]
    fn ancestor_walks_are_exact() {
        let (branch, hashes) = chain(8);
        let anc = branch.ancestor(&hashes[7], 3).unwrap();
        assert_eq!(anc.header.hash(), hashes[2]);
        assert!(branch.is_ancestor(&hashes[2], &hashes[7]));
        assert!(!branch.is_ancestor(&hashes[7], &hashes[2]));
    }

    #[test]
    fn forks_do_not_displace_longer_tip() {
        let (mut branch, hashes) = chain(4);
        // fork off block 2 at the same height as block 3
        let mut fork = block_data(3, hashes[1]);
        fork.header.time = 9999;
        let fork_hash = fork.header.hash();
        branch.connect(fork).unwrap();
        assert_eq!(branch.height(), 4);
        assert!(branch.contains(&fork_hash));
        // the fork block's ancestry is intact
        assert!(branch.is_ancestor(&hashes[0], &fork_hash));
    }

    #[test]
    fn orphans_and_duplicates_rejected() {
        let (mut branch, hashes) = chain(2);
        let orphan = block_data(9, Hash256::hash_from_slice(b"nowhere"));
        assert_eq!(branch.connect(orphan), Err(DbErr::Orphan));
        let dup = block_data(1, Hash256::zero());
        assert_eq!(branch.connect(dup), Err(DbErr::Duplicate));
        assert!(branch.contains(&hashes[0]));
    }

    #[test]
    fn branch_db_persists_and_reloads() {
        let db = std::sync::Arc::new(MemoryDb::new());

        struct Shared(std::sync::Arc<MemoryDb>);
        impl DbInterface for Shared {
            fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbErr> {
                self.0.get_raw(key)
            }
            fn put_raw(&self, key: &[u8], value: &[u8]) -> Result<(), DbErr> {
                self.0.put_raw(key, value)
            }
            fn delete_raw(&self, key: &[u8]) -> Result<(), DbErr> {
                self.0.delete_raw(key)
            }
            fn prefix_raw(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbErr> {
                self.0.prefix_raw(prefix)
            }
        }

        let branch_id = Hash256::hash_from_slice(b"branch");
        {
            let mut bdb = BranchDb::open(Box::new(Shared(db.clone()))).unwrap();
            bdb.create_branch(branch_id).unwrap();
            let data = block_data(1, Hash256::zero());
            let info = BranchBlockInfo {
                header: data.header.clone(),
                height: 1,
                branch_id,
                stake_tx_bytes: crate::codec::encode_to_vec(&data.stake_tx).unwrap(),
            };
            bdb.add_block_info(&info).unwrap();
        }
        let bdb = BranchDb::open(Box::new(Shared(db))).unwrap();
        assert!(bdb.is_branch_created(&branch_id));
        assert!(bdb.has_branch_data(&branch_id));
        assert_eq!(bdb.branch_data(&branch_id).unwrap().height(), 1);
    }

    #[test]
    fn report_flag_is_monotone() {
        let mut bdb = BranchDb::open(Box::new(MemoryDb::new())).unwrap();
        let branch_id = Hash256::hash_from_slice(b"branch");
        bdb.create_branch(branch_id).unwrap();
        let flag_hash = Hash256::hash_from_slice(b"flag");
        let block_hash = Hash256::hash_from_slice(b"block");

        bdb.set_report_flag(&branch_id, &block_hash, flag_hash, ReportFlag::Reported)
            .unwrap();
        assert_eq!(bdb.report_flag(&flag_hash), Some(ReportFlag::Reported));
        bdb.set_report_flag(&branch_id, &block_hash, flag_hash, ReportFlag::Proved)
            .unwrap();
        assert_eq!(bdb.report_flag(&flag_hash), Some(ReportFlag::Proved));
        // never downgrades
        bdb.set_report_flag(&branch_id, &block_hash, flag_hash, ReportFlag::Reported)
            .unwrap();
        assert_eq!(bdb.report_flag(&flag_hash), Some(ReportFlag::Proved));
    }
}
