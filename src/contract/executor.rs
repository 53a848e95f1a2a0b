// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Single-threaded deterministic interpreter host. One executor owns its
//! staging contexts and interpreter pool; block validation drives it tx by
//! tx, committing or rolling back between them.

use crate::consensus::{Money, MAX_CONTRACT_CALL, MAX_CONTRACT_FILE_LEN, MAX_INTERNAL_CALL_NUM};
use crate::contract::context::{ContractDataFrom, ContractInfo, MapContractContext};
use crate::contract::interpreter::{
    run_function, ContractCode, HostCalls, MsgEnv, ShellPool, Value,
};
use crate::contract::VmErr;
use crate::primitives::{pay_to_keyid, BlockHeader, Hash160, Transaction, TxOut};
use bincode::{Decode, Encode};
use flate2::read::DeflateDecoder;
use std::collections::BTreeMap;
use std::io::Read;

/// The decoded form of a contract's opaque context bytes: its published
/// code plus the key-value store the code manipulates.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Default)]
pub struct ContractState {
    pub code: Vec<u8>,
    pub kv: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl ContractState {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VmErr> {
        crate::codec::decode(bytes).map_err(|_| VmErr::BadCode("undecodable contract state"))
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        crate::codec::encode_to_vec(self).expect("contract state within codec limit")
    }
}

/// Read-only view of contract coin balances outside the current tx
pub trait ContractCoinsView: Sync {
    fn balance(&self, id: &Hash160) -> Money;
}

/// Fixed balance table, used by tests and by fraud-proof re-execution
#[derive(Debug, Clone, Default)]
pub struct StaticCoins(pub BTreeMap<Hash160, Money>);

impl ContractCoinsView for StaticCoins {
    fn balance(&self, id: &Hash160) -> Money {
        self.0.get(id).copied().unwrap_or(0)
    }
}

/// Result of executing one transaction
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VmOut {
    /// Codec-encoded return [`Value`]
    pub return_value: Vec<u8>,
    /// Fuel consumed
    pub running_times: i64,
    /// Contexts read, as committed before this tx
    pub tx_prev_data: MapContractContext,
    /// Contexts written by this tx
    pub tx_final_data: MapContractContext,
    /// Coin balance of the called contract before execution
    pub prev_coins: Money,
    /// Outputs the contract forces the transaction to carry
    pub recipients: Vec<TxOut>,
    /// Net coin debit per contract
    pub contract_coins_out: BTreeMap<Hash160, Money>,
}

#[derive(Default)]
pub struct ContractExecutor {
    /// Committed post-state of earlier txs in the current block
    data: MapContractContext,
    /// Staged writes of the current tx
    cache: MapContractContext,
    /// Contexts the current tx has read from `data`
    reads: MapContractContext,
    call_stack: Vec<Hash160>,
    pool: ShellPool,
    recipients: Vec<TxOut>,
    coins_in: BTreeMap<Hash160, Money>,
    coins_out: BTreeMap<Hash160, Money>,
    current_tx_index: u32,
}

impl ContractExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An executor whose committed layer starts from a pre-block snapshot
    #[must_use]
    pub fn with_data(data: MapContractContext) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    /// Committed contexts: the post-state of every committed tx so far
    #[must_use]
    pub fn snapshot(&self) -> MapContractContext {
        self.data.clone()
    }

    /// Merge the current tx's staged writes into the committed layer
    pub fn commit(&mut self) {
        let cache = std::mem::take(&mut self.cache);
        for (id, info) in cache {
            self.data.insert(id, info);
        }
    }

    /// Discard staging; with `only_cache` unset, reset between blocks
    pub fn clear(&mut self, only_cache: bool) {
        self.cache.clear();
        self.reads.clear();
        self.recipients.clear();
        self.coins_in.clear();
        self.coins_out.clear();
        self.call_stack.clear();
        if !only_cache {
            self.data.clear();
        }
    }

    /// Stage a committed context, as the block-connect path does when
    /// restoring chainstate.
    pub fn set_contract_context(&mut self, id: Hash160, info: ContractInfo) {
        self.data.insert(id, info);
    }

    #[must_use]
    pub fn get_contract_context(&self, id: &Hash160) -> Option<&ContractInfo> {
        self.cache.get(id).or_else(|| self.data.get(id))
    }

    /// Publish contract code at `addr`. The address must not resolve to any
    /// existing context.
    pub fn publish(&mut self, addr: Hash160, raw_code: &[u8], decompress: bool) -> Result<(), VmErr> {
        if raw_code.len() > MAX_CONTRACT_FILE_LEN {
            return Err(VmErr::Oversize);
        }
        let code_bytes = if decompress {
            let decoder = DeflateDecoder::new(raw_code);
            let mut out = Vec::new();
            decoder
                .take(MAX_CONTRACT_FILE_LEN as u64 + 1)
                .read_to_end(&mut out)
                .map_err(|_| VmErr::BadCode("bad compression"))?;
            if out.len() > MAX_CONTRACT_FILE_LEN {
                return Err(VmErr::Oversize);
            }
            out
        } else {
            raw_code.to_vec()
        };
        if self.load_context(&addr).is_some() {
            return Err(VmErr::AddrTaken);
        }
        ContractCode::from_bytes(&code_bytes)?;
        let state = ContractState {
            code: code_bytes,
            kv: BTreeMap::new(),
        };
        self.cache.insert(
            addr,
            ContractInfo {
                from: ContractDataFrom {
                    block_hash: crate::primitives::Hash256::zero(),
                    tx_index: self.current_tx_index,
                },
                data: state.to_bytes(),
            },
        );
        Ok(())
    }

    /// Top-level call with a fresh fuel budget
    pub fn call(
        &mut self,
        addr: &Hash160,
        func: &str,
        args: Vec<Value>,
        sender: Hash160,
        payment: Money,
        prev_header: &BlockHeader,
        prev_height: u64,
        coins: &dyn ContractCoinsView,
    ) -> Result<(Value, i64), VmErr> {
        if payment > 0 {
            *self.coins_in.entry(*addr).or_insert(0) += payment;
        }
        let mut fuel = MAX_CONTRACT_CALL;
        let mut session = Session {
            exec: self,
            coins,
            block_height: prev_height + 1,
            block_time: prev_header.time,
            tx_sender: sender,
            payment,
        };
        let ret = session.internal_call(addr, func, args, &mut fuel, 0)?;
        Ok((ret, MAX_CONTRACT_CALL - fuel))
    }

    /// Top-level validation entry: run one transaction's contract payload
    /// against the staged contexts. On error all staging is rolled back.
    pub fn execute_tx(
        &mut self,
        tx: &Transaction,
        tx_index: u32,
        prev_header: &BlockHeader,
        prev_height: u64,
        coins: &dyn ContractCoinsView,
    ) -> Result<VmOut, VmErr> {
        let payload = tx.contract.as_ref().ok_or(VmErr::BadArgument)?;
        self.clear_tx_staging(tx_index);

        let prev_coins = coins.balance(&payload.address);
        let result = if tx.is_publish_contract() {
            self.publish(payload.address, &payload.code_or_func, payload.decompress)
                .map(|()| (Value::Null, 0))
        } else if tx.is_call_contract() {
            let func = std::str::from_utf8(&payload.code_or_func)
                .map_err(|_| VmErr::BadArgument)?
                .to_owned();
            let args: Vec<Value> = payload.args.iter().cloned().map(Value::Bytes).collect();
            let payment = contract_payment(tx, &payload.address);
            self.call(
                &payload.address,
                &func,
                args,
                payload.sender,
                payment,
                prev_header,
                prev_height,
                coins,
            )
        } else {
            Err(VmErr::BadArgument)
        };

        match result {
            Ok((ret, running_times)) => {
                let total_out: Money = self.coins_out.values().sum();
                if total_out != payload.amount_out {
                    self.clear(true);
                    return Err(VmErr::CoinsOutMismatch);
                }
                Ok(VmOut {
                    return_value: crate::codec::encode_to_vec(&ret)
                        .expect("return value within codec limit"),
                    running_times,
                    tx_prev_data: self.reads.clone(),
                    tx_final_data: self.cache.clone(),
                    prev_coins,
                    recipients: self.recipients.clone(),
                    contract_coins_out: self.coins_out.clone(),
                })
            }
            Err(err) => {
                self.clear(true);
                Err(err)
            }
        }
    }

    /// Execute a contiguous slice of a block's transactions, committing
    /// each successful tx into the executor's data layer. Returns one
    /// [`VmOut`] per transaction in the slice; non-contract txs yield an
    /// empty one.
    pub fn execute_block(
        &mut self,
        block: &crate::primitives::Block,
        prev_header: &BlockHeader,
        prev_height: u64,
        offset: usize,
        count: usize,
        coins: &dyn ContractCoinsView,
    ) -> Result<Vec<VmOut>, VmErr> {
        let mut outs = Vec::with_capacity(count);
        for i in offset..offset + count {
            let tx = block.vtx.get(i).ok_or(VmErr::BadArgument)?;
            if tx.is_smart_contract() {
                let out = self.execute_tx(tx, i as u32, prev_header, prev_height, coins)?;
                self.commit();
                outs.push(out);
            } else {
                outs.push(VmOut::default());
            }
        }
        Ok(outs)
    }

    fn clear_tx_staging(&mut self, tx_index: u32) {
        self.cache.clear();
        self.reads.clear();
        self.recipients.clear();
        self.coins_in.clear();
        self.coins_out.clear();
        self.call_stack.clear();
        self.current_tx_index = tx_index;
    }

    /// Resolve a contract's current context, recording the first read of a
    /// committed context as part of the tx's pre-state.
    fn load_context(&mut self, addr: &Hash160) -> Option<ContractInfo> {
        if let Some(info) = self.cache.get(addr) {
            return Some(info.clone());
        }
        let info = self.data.get(addr)?.clone();
        self.reads.entry(*addr).or_insert_with(|| info.clone());
        Some(info)
    }

    fn load_state(&mut self, addr: &Hash160) -> Result<ContractState, VmErr> {
        let info = self.load_context(addr).ok_or(VmErr::UnknownContract)?;
        ContractState::from_bytes(&info.data)
    }

    fn store_state(&mut self, addr: &Hash160, state: &ContractState) {
        self.cache.insert(
            *addr,
            ContractInfo {
                from: ContractDataFrom {
                    block_hash: crate::primitives::Hash256::zero(),
                    tx_index: self.current_tx_index,
                },
                data: state.to_bytes(),
            },
        );
    }
}

/// Coins paid into `addr` by this transaction's contract outputs
#[must_use]
pub fn contract_payment(tx: &Transaction, addr: &Hash160) -> Money {
    tx.vout
        .iter()
        .filter(|out| {
            !out.script_pubkey.is_contract_change()
                && out.script_pubkey.contract_addr().as_ref() == Some(addr)
        })
        .map(|out| out.value)
        .sum()
}

/// One executing transaction's view of the host. Borrows the executor's
/// staging so internal calls recurse through the same state.
struct Session<'a> {
    exec: &'a mut ContractExecutor,
    coins: &'a dyn ContractCoinsView,
    block_height: u64,
    block_time: i64,
    tx_sender: Hash160,
    payment: Money,
}

impl<'a> HostCalls for Session<'a> {
    fn internal_call(
        &mut self,
        addr: &Hash160,
        func: &str,
        args: Vec<Value>,
        fuel: &mut i64,
        depth: u32,
    ) -> Result<Value, VmErr> {
        if depth > MAX_INTERNAL_CALL_NUM {
            return Err(VmErr::CallDepth);
        }
        if self.exec.call_stack.contains(addr) {
            return Err(VmErr::Reentrancy);
        }
        let state = self.exec.load_state(addr)?;
        let code = ContractCode::from_bytes(&state.code)?;

        let sender = if depth == 0 {
            self.tx_sender
        } else {
            // inner frames see the calling contract as the sender
            *self.exec.call_stack.last().expect("non-empty at depth > 0")
        };
        let msg = MsgEnv {
            self_addr: *addr,
            sender,
            payment: if depth == 0 { self.payment } else { 0 },
            block_height: self.block_height,
            block_time: self.block_time,
        };
        self.exec.pool.acquire(*addr, code, msg.clone())?;
        self.exec.call_stack.push(*addr);

        let code_ref = self
            .exec
            .pool
            .get(addr)
            .and_then(|shell| shell.code.clone())
            .expect("shell bound above");
        let result = run_function(&code_ref, &msg, func, &args, fuel, depth, self);

        // release on every exit path, abort included
        self.exec.call_stack.pop();
        self.exec.pool.release(addr);
        result
    }

    fn send_coins(
        &mut self,
        from: &Hash160,
        dest_keyid: &Hash160,
        amount: Money,
    ) -> Result<(), VmErr> {
        if amount <= 0 {
            return Err(VmErr::BadArgument);
        }
        if amount > self.get_balance(from) {
            return Err(VmErr::InsufficientCoins);
        }
        self.exec.recipients.push(TxOut {
            value: amount,
            script_pubkey: pay_to_keyid(dest_keyid),
        });
        *self.exec.coins_out.entry(*from).or_insert(0) += amount;
        Ok(())
    }

    fn get_balance(&mut self, id: &Hash160) -> Money {
        let outside = self.coins.balance(id);
        let credit = self.exec.coins_in.get(id).copied().unwrap_or(0);
        let debit = self.exec.coins_out.get(id).copied().unwrap_or(0);
        outside + credit - debit
    }

    fn state_get(&mut self, addr: &Hash160, key: &[u8]) -> Option<Vec<u8>> {
        let state = self.exec.load_state(addr).ok()?;
        state.kv.get(key).cloned()
    }

    fn state_put(&mut self, addr: &Hash160, key: Vec<u8>, value: Vec<u8>) -> Result<(), VmErr> {
        let mut state = self.exec.load_state(addr)?;
        state.kv.insert(key, value);
        let bytes_len = state.to_bytes().len();
        if bytes_len > crate::consensus::MAX_DATA_LEN {
            return Err(VmErr::DataTooLarge);
        }
        self.exec.store_state(addr, &state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::interpreter::{FuncDef, Op};
    use crate::primitives::{contract_script, ContractPayload, TxType};

    fn trivial_code() -> Vec<u8> {
        ContractCode {
            version: 1,
            funcs: vec![
                FuncDef {
                    name: "ping".into(),
                    n_locals: 0,
                    ops: vec![Op::PushInt(7), Op::Ret],
                },
                FuncDef {
                    name: "write".into(),
                    n_locals: 0,
                    ops: vec![
                        Op::PushBytes(b"slot".to_vec()),
                        Op::PushBytes(b"data".to_vec()),
                        Op::StatePut,
                        Op::Ret,
                    ],
                },
                FuncDef {
                    name: "spin".into(),
                    n_locals: 0,
                    ops: vec![Op::Jmp(0)],
                },
            ],
        }
        .to_bytes()
    }

    fn publish_tx(addr: Hash160, code: Vec<u8>) -> Transaction {
        Transaction {
            tx_type: TxType::PublishContract,
            contract: Some(Box::new(ContractPayload {
                address: addr,
                sender: Hash160::hash_from_slice(b"publisher"),
                code_or_func: code,
                decompress: false,
                args: Vec::new(),
                amount_out: 0,
            })),
            ..Transaction::default()
        }
    }

    fn call_tx(addr: Hash160, func: &str) -> Transaction {
        Transaction {
            tx_type: TxType::CallContract,
            contract: Some(Box::new(ContractPayload {
                address: addr,
                sender: Hash160::hash_from_slice(b"caller"),
                code_or_func: func.as_bytes().to_vec(),
                decompress: false,
                args: Vec::new(),
                amount_out: 0,
            })),
            ..Transaction::default()
        }
    }

    fn header() -> BlockHeader {
        BlockHeader {
            time: 1_700_000_000,
            ..BlockHeader::default()
        }
    }

    #[test]
    fn publish_then_call() {
        let mut exec = ContractExecutor::new();
        let addr = Hash160::hash_from_slice(b"c1");
        let coins = StaticCoins::default();

        let out = exec
            .execute_tx(&publish_tx(addr, trivial_code()), 1, &header(), 10, &coins)
            .unwrap();
        assert!(out.tx_final_data.contains_key(&addr));
        assert!(out.tx_prev_data.is_empty());
        exec.commit();

        let out = exec
            .execute_tx(&call_tx(addr, "ping"), 2, &header(), 10, &coins)
            .unwrap();
        let ret: Value = crate::codec::decode(&out.return_value).unwrap();
        assert_eq!(ret, Value::Int(7));
        assert!(out.running_times > 0);
        // a pure call still reads its own context
        assert!(out.tx_prev_data.contains_key(&addr));
    }

    #[test]
    fn publish_size_boundary() {
        let mut exec = ContractExecutor::new();
        let addr = Hash160::hash_from_slice(b"c1");
        assert_eq!(
            exec.publish(addr, &vec![0u8; MAX_CONTRACT_FILE_LEN + 1], false),
            Err(VmErr::Oversize)
        );
    }

    #[test]
    fn publish_taken_address_rejected() {
        let mut exec = ContractExecutor::new();
        let addr = Hash160::hash_from_slice(b"c1");
        exec.publish(addr, &trivial_code(), false).unwrap();
        exec.commit();
        assert_eq!(exec.publish(addr, &trivial_code(), false), Err(VmErr::AddrTaken));
    }

    #[test]
    fn fuel_exhaustion_rolls_back_staging() {
        let mut exec = ContractExecutor::new();
        let addr = Hash160::hash_from_slice(b"c1");
        let coins = StaticCoins::default();
        exec.execute_tx(&publish_tx(addr, trivial_code()), 1, &header(), 10, &coins)
            .unwrap();
        exec.commit();

        let err = exec
            .execute_tx(&call_tx(addr, "spin"), 2, &header(), 10, &coins)
            .unwrap_err();
        assert_eq!(err, VmErr::OutOfFuel);
        // staging gone, committed state intact
        assert!(exec.get_contract_context(&addr).is_some());
        let snap = exec.snapshot();
        assert_eq!(snap.len(), 1);
    }

    #[test]
    fn write_tracks_read_and_write_sets() {
        let mut exec = ContractExecutor::new();
        let addr = Hash160::hash_from_slice(b"c1");
        let coins = StaticCoins::default();
        exec.execute_tx(&publish_tx(addr, trivial_code()), 1, &header(), 10, &coins)
            .unwrap();
        exec.commit();

        let out = exec
            .execute_tx(&call_tx(addr, "write"), 2, &header(), 10, &coins)
            .unwrap();
        assert!(out.tx_prev_data.contains_key(&addr));
        assert!(out.tx_final_data.contains_key(&addr));
        let state =
            ContractState::from_bytes(&out.tx_final_data.get(&addr).unwrap().data).unwrap();
        assert_eq!(state.kv.get(&b"slot"[..]), Some(&b"data".to_vec()));
    }

    #[test]
    fn send_coins_respects_contract_balance() {
        let mut exec = ContractExecutor::new();
        let addr = Hash160::hash_from_slice(b"c1");
        let dest = Hash160::hash_from_slice(b"dest");
        let pay_code = ContractCode {
            version: 1,
            funcs: vec![FuncDef {
                name: "payout".into(),
                n_locals: 0,
                ops: vec![
                    Op::PushBytes(dest.0.to_vec()),
                    Op::PushInt(40),
                    Op::SendCoins,
                    Op::Ret,
                ],
            }],
        }
        .to_bytes();
        let coins = StaticCoins(BTreeMap::from([(addr, 50)]));
        exec.execute_tx(&publish_tx(addr, pay_code), 1, &header(), 10, &coins)
            .unwrap();
        exec.commit();

        let mut tx = call_tx(addr, "payout");
        tx.contract.as_mut().unwrap().amount_out = 40;
        let out = exec.execute_tx(&tx, 2, &header(), 10, &coins).unwrap();
        assert_eq!(out.recipients.len(), 1);
        assert_eq!(out.recipients[0].value, 40);
        assert_eq!(out.contract_coins_out.get(&addr), Some(&40));

        // a declared net debit that disagrees with the re-computed one rejects
        let mut lying = call_tx(addr, "payout");
        lying.contract.as_mut().unwrap().amount_out = 39;
        assert_eq!(
            exec.execute_tx(&lying, 3, &header(), 10, &coins).unwrap_err(),
            VmErr::CoinsOutMismatch
        );
    }

    #[test]
    fn internal_call_depth_limit() {
        // contract calls itself through a second contract? reentrancy
        // forbids self-calls, so chain two contracts calling each other is
        // also reentrancy once the cycle closes. Depth is tested with a
        // chain of distinct contracts instead.
        let coins = StaticCoins::default();
        let mut exec = ContractExecutor::new();
        let mut addrs = Vec::new();
        let n = 33usize;
        for i in 0..n {
            addrs.push(Hash160::hash_from_slice(format!("chain-{i}")));
        }
        for i in 0..n {
            let ops = if i + 1 < n {
                vec![
                    Op::PushBytes(addrs[i + 1].0.to_vec()),
                    Op::PushBytes(b"next".to_vec()),
                    Op::CallContract(0),
                    Op::Ret,
                ]
            } else {
                vec![Op::PushInt(1), Op::Ret]
            };
            let code = ContractCode {
                version: 1,
                funcs: vec![FuncDef {
                    name: "next".into(),
                    n_locals: 0,
                    ops,
                }],
            }
            .to_bytes();
            exec.execute_tx(
                &publish_tx(addrs[i], code),
                i as u32,
                &header(),
                10,
                &coins,
            )
            .unwrap();
            exec.commit();
        }

        let err = exec
            .execute_tx(&call_tx(addrs[0], "next"), 100, &header(), 10, &coins)
            .unwrap_err();
        assert_eq!(err, VmErr::CallDepth);
        // all shells released despite the abort
        assert_eq!(exec.pool.in_use_len(), 0);
    }

    #[test]
    fn reentrancy_rejected() {
        let coins = StaticCoins::default();
        let mut exec = ContractExecutor::new();
        let addr = Hash160::hash_from_slice(b"self-caller");
        let code = ContractCode {
            version: 1,
            funcs: vec![FuncDef {
                name: "again".into(),
                n_locals: 0,
                ops: vec![
                    Op::SelfAddr,
                    Op::PushBytes(b"again".to_vec()),
                    Op::CallContract(0),
                    Op::Ret,
                ],
            }],
        }
        .to_bytes();
        exec.execute_tx(&publish_tx(addr, code), 0, &header(), 10, &coins)
            .unwrap();
        exec.commit();
        assert_eq!(
            exec.execute_tx(&call_tx(addr, "again"), 1, &header(), 10, &coins)
                .unwrap_err(),
            VmErr::Reentrancy
        );
    }

    #[test]
    fn publish_accepts_deflated_code() {
        use flate2::write::DeflateEncoder;
        use flate2::Compression;
        use std::io::Write;

        let raw = trivial_code();
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut exec = ContractExecutor::new();
        let addr = Hash160::hash_from_slice(b"c1");
        exec.publish(addr, &compressed, true).unwrap();
        let info = exec.get_contract_context(&addr).unwrap();
        let state = ContractState::from_bytes(&info.data).unwrap();
        assert_eq!(state.code, raw);
    }

    #[test]
    fn contract_payment_sums_contract_outputs() {
        let addr = Hash160::hash_from_slice(b"c1");
        let tx = Transaction {
            vout: vec![
                TxOut {
                    value: 30,
                    script_pubkey: contract_script(&addr),
                },
                TxOut {
                    value: 12,
                    script_pubkey: pay_to_keyid(&Hash160::zero()),
                },
                TxOut {
                    value: 8,
                    script_pubkey: contract_script(&Hash160::hash_from_slice(b"other")),
                },
            ],
            ..Transaction::default()
        };
        assert_eq!(contract_payment(&tx, &addr), 30);
        assert_eq!(
            contract_payment(&tx, &Hash160::hash_from_slice(b"other")),
            8
        );
    }
}
