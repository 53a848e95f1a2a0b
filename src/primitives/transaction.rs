// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::consensus::Money;
use crate::contract::context::{ContractPrevData, MapContractContext};
use crate::primitives::{BlockHeader, Hash160, Hash256, Script, SpvProof};
use bincode::{Decode, Encode};

/// Every transaction flavour the consensus rules distinguish. The
/// discriminator is committed by the transaction hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum TxType {
    Normal,
    Coinbase,
    /// The PoS stake transaction, `vtx[1]` of every branch block
    Stake,
    CreateBranch,
    TransStep1,
    TransStep2,
    SyncBranchInfo,
    Mortgage,
    RedeemMortgageStatement,
    Report,
    Prove,
    ReportReward,
    LockMineCoin,
    UnlockMineCoin,
    PublishContract,
    CallContract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Default)]
pub struct OutPoint {
    pub hash: Hash256,
    pub n: u32,
}

impl OutPoint {
    #[must_use]
    pub fn new(hash: Hash256, n: u32) -> Self {
        Self { hash, n }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.hash.is_zero() && self.n == 0
    }

    #[must_use]
    pub fn null() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Default)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Script,
    pub nsequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Default)]
pub struct TxOut {
    pub value: Money,
    pub script_pubkey: Script,
}

/// Compact branch block announcement embedded in a sync-branch-info tx
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct BranchBlockInfo {
    pub header: BlockHeader,
    pub height: u64,
    pub branch_id: Hash256,
    /// The block's stake transaction, `vtx[1]`, in wire encoding
    pub stake_tx_bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum ReportType {
    Tx,
    Coinbase,
    MerkleTree,
    ContractData,
}

/// The contract-data half of a stale-read report
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ReportContractData {
    /// The pre-state commitment the reported tx executed against
    pub reported_prev_data: ContractPrevData,
    /// SPV of `H(reported_tx || prev_data)` under `hashMerkleRootWithPrevData`
    pub reported_spv: SpvProof,
    /// The newer write the reported tx should have seen
    pub prove_tx_hash: Hash256,
    pub prove_contract_data: MapContractContext,
    /// SPV of `H(prove_tx || post_data)` under `hashMerkleRootWithData`
    pub prove_spv: SpvProof,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ReportData {
    pub report_type: ReportType,
    pub reported_branch_id: Hash256,
    pub reported_block_hash: Hash256,
    pub reported_tx_hash: Hash256,
    pub contract_data: Option<ReportContractData>,
}

/// One proven input: the source transaction and its inclusion proof
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ProveDataItem {
    pub tx_bytes: Vec<u8>,
    pub spv: SpvProof,
}

/// Re-execution evidence for a proved smart-contract transaction
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ProveContractData {
    /// Coin balance of the called contract at execution time
    pub coins: Money,
    /// Full contexts the tx read, keyed the same as its prev-data commitment
    pub prev_data: MapContractContext,
    pub prev_data_spv: SpvProof,
    pub final_data_spv: SpvProof,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ProveData {
    pub prove_type: ReportType,
    pub branch_id: Hash256,
    pub block_hash: Hash256,
    pub tx_hash: Hash256,
    /// For a Tx prove: item 0 is the reported tx, then one item per input
    pub prove_items: Vec<ProveDataItem>,
    /// For Coinbase / MerkleTree proves: the block's full ordered `vtx`
    pub vtx_bytes: Vec<u8>,
    /// One prove-item vector per non-coinbase, non-stake block tx
    pub block_tx_proves: Vec<Vec<ProveDataItem>>,
    pub contract_data: Option<ProveContractData>,
}

/// Publish or call payload of a smart-contract transaction
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Default)]
pub struct ContractPayload {
    pub address: Hash160,
    /// Caller key id
    pub sender: Hash160,
    /// Raw code for a publish; the entry function name for a call
    pub code_or_func: Vec<u8>,
    /// Publish only: run the code through a deflate decompress first
    pub decompress: bool,
    pub args: Vec<Vec<u8>>,
    /// Net amount leaving contract accounts in this transaction
    pub amount_out: Money,
}

/// Base transaction. Extended branch / contract payloads ride after the
/// legacy fields; all of them are committed by [`Transaction::hash`].
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Transaction {
    pub version: u32,
    pub tx_type: TxType,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,

    /// Step-1 / mortgage / create-branch: destination chain
    pub send_to_branch_id: Option<Hash256>,
    /// Step-1 / mortgage: the precomputed destination-side tx, stripped form
    pub send_to_tx_bytes: Option<Vec<u8>>,

    /// Step-2: source chain
    pub from_branch_id: Option<Hash256>,
    /// Step-2: the embedded source transaction
    pub from_tx_bytes: Option<Vec<u8>>,
    /// Step-2: value claimed from the source chain
    pub in_amount: Option<Money>,
    /// Step-2 crossing in from a branch / outbound proofs
    pub spv_proof: Option<SpvProof>,

    pub branch_block_info: Option<Box<BranchBlockInfo>>,
    pub report: Option<Box<ReportData>>,
    pub prove: Option<Box<ProveData>>,

    /// Lock-mine-coin: the main-chain report being anchored
    pub report_txid: Option<Hash256>,
    /// Unlock-mine-coin: the main-chain prove being anchored
    pub prove_txid: Option<Hash256>,
    /// Lock / unlock: the pinned mortgage-coin UTXO
    pub coin_preout_hash: Option<Hash256>,

    pub contract: Option<Box<ContractPayload>>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self {
            version: 1,
            tx_type: TxType::Normal,
            vin: Vec::new(),
            vout: Vec::new(),
            lock_time: 0,
            send_to_branch_id: None,
            send_to_tx_bytes: None,
            from_branch_id: None,
            from_tx_bytes: None,
            in_amount: None,
            spv_proof: None,
            branch_block_info: None,
            report: None,
            prove: None,
            report_txid: None,
            prove_txid: None,
            coin_preout_hash: None,
            contract: None,
        }
    }
}

impl Transaction {
    /// Serialize to wire bytes
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        crate::codec::encode_to_vec(self).expect("transaction within codec limit")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        crate::codec::decode(bytes)
    }

    /// Transaction id: double SHA256 over the full wire encoding
    #[must_use]
    pub fn hash(&self) -> Hash256 {
        Hash256::hash_from_slice(self.to_bytes())
    }

    #[must_use]
    pub fn is_coinbase(&self) -> bool {
        self.tx_type == TxType::Coinbase
    }

    #[must_use]
    pub fn is_stake(&self) -> bool {
        self.tx_type == TxType::Stake
    }

    #[must_use]
    pub fn is_branch_create(&self) -> bool {
        self.tx_type == TxType::CreateBranch
    }

    #[must_use]
    pub fn is_mortgage(&self) -> bool {
        self.tx_type == TxType::Mortgage
    }

    #[must_use]
    pub fn is_trans_step1(&self) -> bool {
        self.tx_type == TxType::TransStep1
    }

    #[must_use]
    pub fn is_trans_step2(&self) -> bool {
        self.tx_type == TxType::TransStep2
    }

    /// A transaction whose acceptance later gives birth to a step-2 on the
    /// destination chain.
    #[must_use]
    pub fn is_pregnant(&self) -> bool {
        self.is_trans_step1() || self.is_mortgage() || self.is_branch_create()
    }

    #[must_use]
    pub fn is_sync_branch_info(&self) -> bool {
        self.tx_type == TxType::SyncBranchInfo
    }

    #[must_use]
    pub fn is_redeem_mortgage_statement(&self) -> bool {
        self.tx_type == TxType::RedeemMortgageStatement
    }

    #[must_use]
    pub fn is_report(&self) -> bool {
        self.tx_type == TxType::Report
    }

    #[must_use]
    pub fn is_prove(&self) -> bool {
        self.tx_type == TxType::Prove
    }

    #[must_use]
    pub fn is_report_reward(&self) -> bool {
        self.tx_type == TxType::ReportReward
    }

    #[must_use]
    pub fn is_lock_mine_coin(&self) -> bool {
        self.tx_type == TxType::LockMineCoin
    }

    #[must_use]
    pub fn is_unlock_mine_coin(&self) -> bool {
        self.tx_type == TxType::UnlockMineCoin
    }

    #[must_use]
    pub fn is_publish_contract(&self) -> bool {
        self.tx_type == TxType::PublishContract
    }

    #[must_use]
    pub fn is_call_contract(&self) -> bool {
        self.tx_type == TxType::CallContract
    }

    #[must_use]
    pub fn is_smart_contract(&self) -> bool {
        self.is_publish_contract() || self.is_call_contract()
    }

    /// Sum of output values. Callers range-check separately.
    #[must_use]
    pub fn value_out(&self) -> Money {
        self.vout.iter().map(|o| o.value).sum()
    }
}

/// The main chain's id. Branch ids are create-branch txids, which are never
/// the zero hash.
#[must_use]
pub fn main_branch_id() -> Hash256 {
    Hash256::zero()
}

#[must_use]
pub fn is_main_branch(id: &Hash256) -> bool {
    id.is_zero()
}

/// Rebuild the stripped ("revert") form of a transaction, the shape whose
/// hash a step-1 commits to before the destination-side fields exist.
///
/// With `deep` set the step-2-only fields are removed as well: the embedded
/// source tx, the stake script of a mortgage acknowledgement, and the SPV
/// proof of a branch-origin transfer.
#[must_use]
pub fn revert_transaction(tx: &Transaction, from_tx: Option<&Transaction>, deep: bool) -> Transaction {
    let mut mtx = tx.clone();
    if deep && tx.is_trans_step2() {
        mtx.from_tx_bytes = None;
        if from_tx.map(Transaction::is_mortgage).unwrap_or(false) {
            if let Some(out) = mtx.vout.first_mut() {
                out.script_pubkey.clear();
            }
        }
        if mtx.from_branch_id.map(|id| !is_main_branch(&id)).unwrap_or(false) {
            mtx.spv_proof = None;
        }
    }

    if tx.is_trans_step2()
        && tx.from_branch_id.map(|id| !is_main_branch(&id)).unwrap_or(false)
    {
        // recover the shape built by make_branch_trans_step2: one null input,
        // no recharge outputs
        mtx.vin.clear();
        mtx.vin.push(TxIn {
            prevout: OutPoint::null(),
            script_sig: Script::new(),
            nsequence: 0,
        });
        mtx.vout
            .retain(|out| !out.script_pubkey.is_coin_branch_trans_script());
    } else if tx.is_smart_contract() {
        mtx.vin.retain(|txin| !txin.script_sig.is_contract());
        mtx.vout
            .retain(|out| !out.script_pubkey.is_contract_change());
    }

    mtx
}

/// Canonical key under which a report and its matching prove collide.
/// Computed identically from either side.
#[must_use]
pub fn report_flag_hash(
    report_type: ReportType,
    branch_id: &Hash256,
    block_hash: &Hash256,
    tx_hash: &Hash256,
) -> Hash256 {
    let tuple = (report_type, branch_id, block_hash, tx_hash);
    Hash256::hash_from_slice(crate::codec::encode_to_vec(&tuple).expect("small tuple"))
}

/// Flag key of a report transaction
#[must_use]
pub fn report_tx_flag_hash(tx: &Transaction) -> Option<Hash256> {
    let report = tx.report.as_ref()?;
    Some(report_flag_hash(
        report.report_type,
        &report.reported_branch_id,
        &report.reported_block_hash,
        &report.reported_tx_hash,
    ))
}

/// Flag key of a prove transaction
#[must_use]
pub fn prove_tx_flag_hash(tx: &Transaction) -> Option<Hash256> {
    let prove = tx.prove.as_ref()?;
    Some(report_flag_hash(
        prove.prove_type,
        &prove.branch_id,
        &prove.block_hash,
        &prove.tx_hash,
    ))
}
