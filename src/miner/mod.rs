// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Block-template construction and PoS block signing. A branch block
//! stakes a mature mortgage-coin UTXO as `vtx[1]`; the second block of a
//! branch is special-cased, it can only be produced from a mempool
//! mortgage coin by the coin's owner.

use crate::consensus::{map_height_to_block_reward, Money, MAX_BLOCK_SIZE};
use crate::contract::{
    block_merkle_root_with_data, block_merkle_root_with_prev_data, ContractCoinsView,
    MultiContractExecutor, MultiExecErr, StaticCoins,
};
use crate::node::{ReserveSizes, SystemContext};
use crate::primitives::{
    parse_mortgage_script, Block, BlockHeader, Hash160, Hash256, MortgageKind, OutPoint, Script,
    Transaction, TxIn, TxOut, TxType, BLOCK_SIGNING_CTX,
};
use log::{debug, info};
use schnorrkel::{signing_context, Keypair};
use std::collections::HashMap;

/// Signing interface the miner needs from the wallet
pub trait KeyStore: Send + Sync {
    /// Sign `msg` with the key hashing to `keyid`; returns `(pubkey, sig)`
    fn sign(&self, keyid: &Hash160, msg: &Hash256) -> Option<(Vec<u8>, Vec<u8>)>;
}

/// In-memory keystore used by tests and the bootstrap path
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: HashMap<Hash160, Keypair>,
}

impl MemoryKeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, keypair: Keypair) -> Hash160 {
        let keyid = Hash160::hash_from_slice(keypair.public.to_bytes());
        self.keys.insert(keyid, keypair);
        keyid
    }
}

impl KeyStore for MemoryKeyStore {
    fn sign(&self, keyid: &Hash160, msg: &Hash256) -> Option<(Vec<u8>, Vec<u8>)> {
        let keypair = self.keys.get(keyid)?;
        let ctx = signing_context(BLOCK_SIGNING_CTX);
        let sig = keypair.sign(ctx.bytes(msg.as_bytes()));
        Some((keypair.public.to_bytes().to_vec(), sig.to_bytes().to_vec()))
    }
}

/// One spendable mortgage-coin UTXO
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MortgageCoinOut {
    pub outpoint: OutPoint,
    pub value: Money,
    pub script_pubkey: Script,
    /// Confirmations; zero while still in the mempool
    pub depth: u64,
}

/// Coin selection interface the miner needs from the wallet
pub trait CoinProvider: Send + Sync {
    /// Mature mortgage coins spendable as a stake input
    fn mature_mortgage_coins(&self) -> Vec<MortgageCoinOut>;
    /// Mortgage coins still in the mempool; only the branch's second block
    /// may stake these
    fn mempool_mortgage_coins(&self) -> Vec<MortgageCoinOut>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MinerErr {
    NoMortgageCoins,
    MissingKey,
    NotABranchChain,
    WrongHeight(String),
    Assembly(String),
    Contract(MultiExecErr),
    Rejected(String),
}

impl From<MultiExecErr> for MinerErr {
    fn from(err: MultiExecErr) -> Self {
        Self::Contract(err)
    }
}

/// Stake-coin preference: richer and longer-buried coins first
pub fn sort_coins_for_staking(coins: &mut [MortgageCoinOut], next_height: u64) {
    coins.sort_by_key(|coin| {
        std::cmp::Reverse(coin.value.saturating_mul(next_height.saturating_sub(coin.depth) as Money))
    });
}

pub struct AssemblerOptions {
    pub reserve: ReserveSizes,
    pub max_block_size: usize,
    /// The mortgage coin to stake; `None` on the main chain
    pub stake_coin: Option<MortgageCoinOut>,
}

impl AssemblerOptions {
    #[must_use]
    pub fn with_reserve(reserve: ReserveSizes) -> Self {
        Self {
            reserve,
            max_block_size: MAX_BLOCK_SIZE,
            stake_coin: None,
        }
    }
}

pub struct BlockAssembler<'a> {
    ctx: &'a SystemContext,
    options: AssemblerOptions,
}

impl<'a> BlockAssembler<'a> {
    #[must_use]
    pub fn new(ctx: &'a SystemContext, options: AssemblerOptions) -> Self {
        Self { ctx, options }
    }

    /// Build a fully signed candidate block on top of the current tip
    pub fn create_new_block(
        &self,
        payout_script: Script,
        keystore: &dyn KeyStore,
    ) -> Result<Block, MinerErr> {
        let (height, prev_hash, prev_header, time) = {
            let _guard = self.ctx.chain_lock.lock();
            let tip_height = self.ctx.chain.height();
            let prev_hash = self.ctx.chain.tip_hash();
            let prev_header = self
                .ctx
                .blocks
                .read_block(&prev_hash)
                .map(|b| b.header)
                .unwrap_or_default();
            (
                tip_height + 1,
                prev_hash,
                prev_header,
                self.ctx.chain.adjusted_time(),
            )
        };

        let (body, fees) = self.collect_mempool_txs();

        let mut vtx = Vec::with_capacity(body.len() + 2);
        let reward = map_height_to_block_reward(height, self.ctx.is_main_chain()) + fees;
        let coinbase = Transaction {
            tx_type: TxType::Coinbase,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: Script(height.to_le_bytes().to_vec()),
                nsequence: 0xffff_ffff,
            }],
            vout: vec![TxOut {
                value: reward,
                script_pubkey: payout_script,
            }],
            ..Transaction::default()
        };
        vtx.push(coinbase);

        let mut prevout_stake = OutPoint::null();
        if !self.ctx.is_main_chain() {
            let coin = self
                .options
                .stake_coin
                .as_ref()
                .ok_or(MinerErr::NoMortgageCoins)?;
            prevout_stake = coin.outpoint;
            vtx.push(Self::build_stake_tx(coin)?);
        }
        vtx.extend(body);

        let mut block = Block {
            header: BlockHeader {
                prev_hash,
                time: time.max(prev_header.time + 1),
                prevout_stake,
                ..BlockHeader::default()
            },
            vtx,
        };

        // contract execution fixes both data roots
        let base = self.ctx.contract_context.read().clone();
        let coins: &dyn ContractCoinsView = &StaticCoins::default();
        let outs = MultiContractExecutor::default().execute(
            &block,
            &prev_header,
            height.saturating_sub(1),
            &base,
            coins,
        )?;

        let (merkle_root, mutated) = block.compute_merkle_root();
        if mutated {
            return Err(MinerErr::Assembly("duplicate txs in template".to_owned()));
        }
        block.header.merkle_root = merkle_root;
        block.header.merkle_root_with_prev_data =
            block_merkle_root_with_prev_data(&block, &outs).0;
        block.header.merkle_root_with_data = block_merkle_root_with_data(&block, &outs).0;

        if block.header.has_stake() {
            sign_block(&mut block, keystore)?;
        }
        Ok(block)
    }

    fn build_stake_tx(coin: &MortgageCoinOut) -> Result<Transaction, MinerErr> {
        parse_mortgage_script(&coin.script_pubkey)
            .filter(|m| m.kind == MortgageKind::MortgageCoin)
            .ok_or(MinerErr::NoMortgageCoins)?;
        Ok(Transaction {
            tx_type: TxType::Stake,
            vin: vec![TxIn {
                prevout: coin.outpoint,
                script_sig: Script::new(),
                nsequence: 0xffff_ffff,
            }],
            // the coin re-locks under the same script
            vout: vec![TxOut {
                value: coin.value,
                script_pubkey: coin.script_pubkey.clone(),
            }],
            ..Transaction::default()
        })
    }

    /// Drain the mempool best-paying first, under the per-family byte
    /// budgets the template reserves.
    fn collect_mempool_txs(&self) -> (Vec<Transaction>, Money) {
        let mempool = self.ctx.mempool.lock();
        let mut out = Vec::new();
        let mut fees = 0;
        let mut total = 0usize;
        let mut pub_contract = 0usize;
        let mut call_contract = 0usize;
        let mut branch_tx = 0usize;
        for entry in mempool.collect_sorted() {
            let size = entry.size;
            if total + size > self.options.max_block_size {
                continue;
            }
            let budget_ok = match entry.tx.tx_type {
                TxType::PublishContract => {
                    pub_contract += size;
                    pub_contract <= self.options.reserve.pub_contract
                }
                TxType::CallContract => {
                    call_contract += size;
                    call_contract <= self.options.reserve.call_contract
                }
                TxType::CreateBranch
                | TxType::TransStep1
                | TxType::TransStep2
                | TxType::SyncBranchInfo
                | TxType::Mortgage
                | TxType::RedeemMortgageStatement
                | TxType::Report
                | TxType::Prove
                | TxType::ReportReward
                | TxType::LockMineCoin
                | TxType::UnlockMineCoin => {
                    branch_tx += size;
                    branch_tx <= self.options.reserve.branch_tx
                }
                _ => true,
            };
            if !budget_ok {
                debug!("tx {} over reserve budget, skipped", entry.tx.hash());
                continue;
            }
            total += size;
            fees += entry.fee;
            out.push(entry.tx.clone());
        }
        (out, fees)
    }
}

/// Sign a candidate block with the stake output's key. The key id comes
/// from the stake transaction's lock script: a mortgage coin on a branch,
/// a plain key lock on the main chain.
pub fn sign_block(block: &mut Block, keystore: &dyn KeyStore) -> Result<(), MinerErr> {
    let stake_out = block
        .vtx
        .get(1)
        .and_then(|tx| tx.vout.first())
        .ok_or_else(|| MinerErr::Assembly("block has no stake output".to_owned()))?;
    let keyid = parse_mortgage_script(&stake_out.script_pubkey)
        .map(|m| m.keyid)
        .or_else(|| stake_out.script_pubkey.keyid_of_pay_script())
        .ok_or(MinerErr::MissingKey)?;

    block.header.sig_pubkey.clear();
    block.header.block_sig.clear();
    let msg = block.header.hash_no_sig_data();
    let (pubkey, sig) = keystore.sign(&keyid, &msg).ok_or(MinerErr::MissingKey)?;
    block.header.sig_pubkey = pubkey;
    block.header.block_sig = sig;
    Ok(())
}

/// Mine up to `n_generate` blocks, rotating through the available
/// mortgage coins. Each accepted block consumes its coin.
pub fn generate_blocks(
    ctx: &SystemContext,
    keystore: &dyn KeyStore,
    mut coins: Vec<MortgageCoinOut>,
    payout_script: Script,
    n_generate: usize,
    max_tries: usize,
) -> Result<Vec<Hash256>, MinerErr> {
    if !ctx.is_main_chain() && coins.is_empty() {
        return Err(MinerErr::NoMortgageCoins);
    }
    let mut hashes = Vec::new();
    let mut tries = 0;
    while hashes.len() < n_generate && tries < max_tries {
        tries += 1;
        let next_height = ctx.chain.height() + 1;
        sort_coins_for_staking(&mut coins, next_height);

        let stake_coin = if ctx.is_main_chain() {
            None
        } else {
            Some(coins[0].clone())
        };
        let options = AssemblerOptions {
            reserve: *ctx.reserve_sizes.lock(),
            max_block_size: MAX_BLOCK_SIZE,
            stake_coin,
        };
        let block = match BlockAssembler::new(ctx, options)
            .create_new_block(payout_script.clone(), keystore)
        {
            Ok(block) => block,
            Err(err) => {
                debug!("block assembly failed: {err:?}");
                continue;
            }
        };
        let block_hash = block.hash();
        match ctx.block_sink.process_new_block(block) {
            Ok(()) => {
                info!("mined block {block_hash}");
                hashes.push(block_hash);
                if !ctx.is_main_chain() {
                    coins.remove(0);
                    if coins.is_empty() && hashes.len() < n_generate {
                        break;
                    }
                }
            }
            Err(reason) => return Err(MinerErr::Rejected(reason)),
        }
    }
    Ok(hashes)
}

/// Mine the second block of a branch chain, the only block allowed to
/// stake a mortgage coin straight from the mempool. This is how a branch
/// leaves genesis.
pub fn mine_branch_2nd_block(
    ctx: &SystemContext,
    keystore: &dyn KeyStore,
    provider: &dyn CoinProvider,
    payout_script: Script,
) -> Result<Vec<Hash256>, MinerErr> {
    if ctx.is_main_chain() {
        return Err(MinerErr::NotABranchChain);
    }
    if ctx.chain.height() != 0 {
        return Err(MinerErr::WrongHeight(
            "only the 2nd block can be generated by this function".to_owned(),
        ));
    }
    let coins = provider.mempool_mortgage_coins();
    if coins.is_empty() {
        return Err(MinerErr::NoMortgageCoins);
    }
    let max_tries = coins.len();
    generate_blocks(ctx, keystore, coins, payout_script, 1, max_tries)
}
