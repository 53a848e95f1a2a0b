// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Node-level wiring: the chain seams the core validates against, the
//! block event channel, the mempool, and the [`SystemContext`] that binds
//! them. No hidden globals: the context is built once at daemon start and
//! threaded through constructors.

pub mod connect;
pub mod mempool;
pub mod verbs;

use crate::branch::cache::BranchCache;
use crate::branch::client::{CrossChainClient, RpcConfigMap};
use crate::branch::db::BranchDb;
use crate::consensus::{
    RESERVE_BRANCH_TX_BLOCK_DATA_SIZE, RESERVE_CALL_CONTRACT_BLOCK_DATA_SIZE,
    RESERVE_PUB_CONTRACT_BLOCK_DATA_SIZE,
};
use crate::contract::MapContractContext;
use crate::primitives::{Block, Hash256, ScriptVerifier, Transaction};
use crate::settings::Settings;
use crossbeam_channel::{bounded, Receiver, Sender};
use mempool::Mempool;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Read access to the active chain
pub trait ChainView: Send + Sync {
    fn height(&self) -> u64;
    fn tip_hash(&self) -> Hash256;
    fn hash_at_height(&self, height: u64) -> Option<Hash256>;
    /// Height of a block on the active chain, `None` off-chain
    fn height_of(&self, block_hash: &Hash256) -> Option<u64>;
    /// Network-adjusted unix time
    fn adjusted_time(&self) -> i64;

    fn contains(&self, block_hash: &Hash256) -> bool {
        self.height_of(block_hash).is_some()
    }
}

/// Read access to stored blocks and the transaction index
pub trait BlockStore: Send + Sync {
    fn read_block(&self, block_hash: &Hash256) -> Option<Block>;
    /// A transaction and the hash of the block containing it
    fn read_tx(&self, txid: &Hash256) -> Option<(Transaction, Hash256)>;
}

/// Hand a fully built block to the validation pipeline
pub trait BlockSink: Send + Sync {
    fn process_new_block(&self, block: Block) -> Result<(), String>;
}

/// In-memory chain used by tests and by the daemon before storage attaches
#[derive(Default)]
pub struct MemoryChain {
    inner: RwLock<MemoryChainInner>,
}

#[derive(Default)]
struct MemoryChainInner {
    blocks: Vec<Block>,
    index: HashMap<Hash256, u64>,
    tx_index: HashMap<Hash256, Hash256>,
    adjusted_time: i64,
}

impl MemoryChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_adjusted_time(&self, time: i64) {
        self.inner.write().adjusted_time = time;
    }

    /// Append a block to the active chain
    pub fn connect_block(&self, block: Block) {
        let mut inner = self.inner.write();
        let hash = block.hash();
        let height = inner.blocks.len() as u64;
        for tx in &block.vtx {
            inner.tx_index.insert(tx.hash(), hash);
        }
        inner.index.insert(hash, height);
        inner.blocks.push(block);
    }
}

impl ChainView for MemoryChain {
    fn height(&self) -> u64 {
        let inner = self.inner.read();
        inner.blocks.len().saturating_sub(1) as u64
    }

    fn tip_hash(&self) -> Hash256 {
        let inner = self.inner.read();
        inner.blocks.last().map(Block::hash).unwrap_or_else(Hash256::zero)
    }

    fn hash_at_height(&self, height: u64) -> Option<Hash256> {
        let inner = self.inner.read();
        inner.blocks.get(height as usize).map(Block::hash)
    }

    fn height_of(&self, block_hash: &Hash256) -> Option<u64> {
        self.inner.read().index.get(block_hash).copied()
    }

    fn adjusted_time(&self) -> i64 {
        self.inner.read().adjusted_time
    }
}

impl BlockStore for MemoryChain {
    fn read_block(&self, block_hash: &Hash256) -> Option<Block> {
        let inner = self.inner.read();
        let height = *inner.index.get(block_hash)?;
        inner.blocks.get(height as usize).cloned()
    }

    fn read_tx(&self, txid: &Hash256) -> Option<(Transaction, Hash256)> {
        let inner = self.inner.read();
        let block_hash = *inner.tx_index.get(txid)?;
        let height = *inner.index.get(&block_hash)?;
        let block = inner.blocks.get(height as usize)?;
        let tx = block.vtx.iter().find(|tx| &tx.hash() == txid)?.clone();
        Some((tx, block_hash))
    }
}

/// Outcome a submitted block's catcher receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Duplicate,
    Rejected(String),
}

#[derive(Default)]
struct TipState {
    hash: Hash256,
    height: u64,
    version: u64,
}

/// Typed block event channel. Replaces inheritance-based validation
/// callbacks: a submitter registers a oneshot receiver keyed by the block
/// hash, and the long-poll template waiter sleeps on the tip condvar.
#[derive(Default)]
pub struct BlockEvents {
    tip: Mutex<TipState>,
    tip_changed: Condvar,
    catchers: Mutex<HashMap<Hash256, Sender<SubmitOutcome>>>,
}

impl BlockEvents {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the validation outcome of one block
    pub fn subscribe_submit(&self, block_hash: Hash256) -> Receiver<SubmitOutcome> {
        let (tx, rx) = bounded(1);
        self.catchers.lock().insert(block_hash, tx);
        rx
    }

    /// Deliver a submit outcome; drops the catcher either way
    pub fn notify_submit(&self, block_hash: &Hash256, outcome: SubmitOutcome) {
        if let Some(sender) = self.catchers.lock().remove(block_hash) {
            let _ = sender.try_send(outcome);
        }
    }

    /// Announce a new chain tip
    pub fn notify_tip(&self, hash: Hash256, height: u64) {
        let mut tip = self.tip.lock();
        tip.hash = hash;
        tip.height = height;
        tip.version += 1;
        self.tip_changed.notify_all();
    }

    #[must_use]
    pub fn current_tip(&self) -> (Hash256, u64) {
        let tip = self.tip.lock();
        (tip.hash, tip.height)
    }

    /// Block until the tip moves past `seen` or the timeout elapses.
    /// Returns the tip at wake-up. The caller must not hold the chain lock.
    pub fn wait_tip_change(&self, seen: Hash256, timeout: Duration) -> (Hash256, u64) {
        let mut tip = self.tip.lock();
        if tip.hash == seen {
            self.tip_changed.wait_for(&mut tip, timeout);
        }
        (tip.hash, tip.height)
    }
}

/// Byte budgets the miner reserves per transaction family, adjustable at
/// runtime through the mining verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveSizes {
    pub pub_contract: usize,
    pub call_contract: usize,
    pub branch_tx: usize,
}

impl Default for ReserveSizes {
    fn default() -> Self {
        Self {
            pub_contract: RESERVE_PUB_CONTRACT_BLOCK_DATA_SIZE,
            call_contract: RESERVE_CALL_CONTRACT_BLOCK_DATA_SIZE,
            branch_tx: RESERVE_BRANCH_TX_BLOCK_DATA_SIZE,
        }
    }
}

/// Everything the core threads through its validators and the miner.
/// Constructed once in `main`, torn down in reverse order.
pub struct SystemContext {
    /// Serializes chain-state mutation. Never hold across a peer RPC.
    pub chain_lock: Mutex<()>,
    pub chain: Arc<dyn ChainView>,
    pub blocks: Arc<dyn BlockStore>,
    pub block_sink: Arc<dyn BlockSink>,
    pub branch_db: RwLock<BranchDb>,
    pub branch_cache: Mutex<BranchCache>,
    /// Committed contract contexts at the current tip
    pub contract_context: RwLock<MapContractContext>,
    pub mempool: Mutex<Mempool>,
    pub rpc_configs: RpcConfigMap,
    pub settings: Settings,
    pub verifier: Arc<dyn ScriptVerifier>,
    pub events: BlockEvents,
    pub reserve_sizes: Mutex<ReserveSizes>,
}

impl SystemContext {
    #[must_use]
    pub fn is_main_chain(&self) -> bool {
        self.settings.is_main_chain()
    }

    #[must_use]
    pub fn self_branch_id(&self) -> Hash256 {
        self.settings.self_branch_id
    }

    /// Client for a chain by branch id; zero id resolves the main chain
    pub fn client_for_branch(&self, branch_id: &Hash256) -> Option<CrossChainClient> {
        let cfg = self.rpc_configs.get_for_branch(branch_id)?.clone();
        CrossChainClient::new(cfg).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::BlockHeader;

    #[test]
    fn memory_chain_tracks_heights_and_txs() {
        let chain = MemoryChain::new();
        let tx = Transaction::default();
        let txid = tx.hash();
        let block = Block {
            header: BlockHeader::default(),
            vtx: vec![tx],
        };
        let block_hash = block.hash();
        chain.connect_block(block);

        assert_eq!(chain.height(), 0);
        assert_eq!(chain.tip_hash(), block_hash);
        assert_eq!(chain.height_of(&block_hash), Some(0));
        assert!(chain.contains(&block_hash));
        let (found, in_block) = chain.read_tx(&txid).unwrap();
        assert_eq!(found.hash(), txid);
        assert_eq!(in_block, block_hash);
    }

    #[test]
    fn submit_catcher_is_oneshot() {
        let events = BlockEvents::new();
        let hash = Hash256::hash_from_slice(b"block");
        let rx = events.subscribe_submit(hash);
        events.notify_submit(&hash, SubmitOutcome::Accepted);
        assert_eq!(rx.recv().unwrap(), SubmitOutcome::Accepted);
        // second notify has no catcher, silently dropped
        events.notify_submit(&hash, SubmitOutcome::Duplicate);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn tip_wait_times_out_without_change() {
        let events = BlockEvents::new();
        let (hash, _) = events.current_tip();
        let (after, _) = events.wait_tip_change(hash, Duration::from_millis(10));
        assert_eq!(after, hash);

        events.notify_tip(Hash256::hash_from_slice(b"new tip"), 4);
        let (after, height) = events.wait_tip_change(hash, Duration::from_millis(10));
        assert_eq!(after, Hash256::hash_from_slice(b"new tip"));
        assert_eq!(height, 4);
    }
}
