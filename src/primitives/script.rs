// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Output scripts. Ambercoin only ever *scans* scripts for marker opcodes;
//! full script evaluation is an external concern behind [`ScriptVerifier`].
//! Parsers are tolerant to trailing bytes but strict on opcode order.

use crate::primitives::{Hash160, Hash256};
use bincode::{Decode, Encode};
use std::fmt;

pub const OP_RETURN: u8 = 0x6a;
pub const OP_2DROP: u8 = 0x6d;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_PUSHDATA1: u8 = 0x4c;

pub const OP_CREATE_BRANCH: u8 = 0xc1;
pub const OP_TRANS_BRANCH: u8 = 0xc2;
pub const OP_MINE_BRANCH_MORTGAGE: u8 = 0xc3;
pub const OP_MINE_BRANCH_COIN: u8 = 0xc4;
pub const OP_REDEEM_MORTGAGE: u8 = 0xc5;
pub const OP_CONTRACT: u8 = 0xc6;
pub const OP_CONTRACT_CHANGE: u8 = 0xc7;
pub const OP_BLOCK_HIGH: u8 = 0xc8;
pub const OP_TRANS_BRANCH_RECHARGE: u8 = 0xc9;

#[derive(Clone, PartialEq, Eq, Hash, Encode, Decode, Default)]
pub struct Script(pub Vec<u8>);

/// One step of a script scan: an opcode and its push payload, if any
#[derive(Debug, PartialEq)]
pub enum ScriptOp<'a> {
    Op(u8),
    Push(&'a [u8]),
}

impl Script {
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn push_opcode(&mut self, op: u8) -> &mut Self {
        self.0.push(op);
        self
    }

    pub fn push_data(&mut self, data: &[u8]) -> &mut Self {
        debug_assert!(data.len() < 256);
        if data.len() <= 75 {
            self.0.push(data.len() as u8);
        } else {
            self.0.push(OP_PUSHDATA1);
            self.0.push(data.len() as u8);
        }
        self.0.extend_from_slice(data);
        self
    }

    pub fn push_int64(&mut self, v: i64) -> &mut Self {
        self.push_data(&v.to_le_bytes())
    }

    /// Iterate over (opcode | push) entries
    #[must_use]
    pub fn ops(&self) -> ScriptIter<'_> {
        ScriptIter {
            bytes: &self.0,
            pos: 0,
        }
    }

    #[must_use]
    pub fn is_pay_to_keyid(&self) -> bool {
        self.keyid_of_pay_script().is_some()
    }

    /// Extract the key id from a `OP_DUP OP_HASH160 <keyid> ...` script
    #[must_use]
    pub fn keyid_of_pay_script(&self) -> Option<Hash160> {
        let mut it = self.ops();
        match (it.next()?, it.next()?, it.next()?) {
            (ScriptOp::Op(OP_DUP), ScriptOp::Op(OP_HASH160), ScriptOp::Push(data))
                if data.len() == 20 =>
            {
                let mut out = [0; 20];
                out.copy_from_slice(data);
                Some(Hash160(out))
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn is_contract(&self) -> bool {
        self.contract_addr().is_some()
    }

    /// Contract address of an `OP_CONTRACT <id>` output
    #[must_use]
    pub fn contract_addr(&self) -> Option<Hash160> {
        let mut it = self.ops();
        match (it.next()?, it.next()?) {
            (ScriptOp::Op(op), ScriptOp::Push(data))
                if (op == OP_CONTRACT || op == OP_CONTRACT_CHANGE) && data.len() == 20 =>
            {
                let mut out = [0; 20];
                out.copy_from_slice(data);
                Some(Hash160(out))
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn is_contract_change(&self) -> bool {
        matches!(self.ops().next(), Some(ScriptOp::Op(OP_CONTRACT_CHANGE)))
            && self.contract_addr().is_some()
    }

    /// A destination-side output crediting coins transferred in from another
    /// chain. Excluded from the value-out comparison of step-2 checking.
    #[must_use]
    pub fn is_coin_branch_trans_script(&self) -> bool {
        matches!(
            self.ops().next(),
            Some(ScriptOp::Op(OP_TRANS_BRANCH_RECHARGE))
        )
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Script").field(&hex::encode(&self.0)).finish()
    }
}

pub struct ScriptIter<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for ScriptIter<'a> {
    type Item = ScriptOp<'a>;

    fn next(&mut self) -> Option<ScriptOp<'a>> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let b = self.bytes[self.pos];
        self.pos += 1;
        match b {
            1..=75 => {
                let len = b as usize;
                let end = self.pos.checked_add(len)?;
                if end > self.bytes.len() {
                    self.pos = self.bytes.len();
                    return None;
                }
                let data = &self.bytes[self.pos..end];
                self.pos = end;
                Some(ScriptOp::Push(data))
            }
            OP_PUSHDATA1 => {
                let len = *self.bytes.get(self.pos)? as usize;
                self.pos += 1;
                let end = self.pos.checked_add(len)?;
                if end > self.bytes.len() {
                    self.pos = self.bytes.len();
                    return None;
                }
                let data = &self.bytes[self.pos..end];
                self.pos = end;
                Some(ScriptOp::Push(data))
            }
            op => Some(ScriptOp::Op(op)),
        }
    }
}

/// Which flavour of mortgage script was parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MortgageKind {
    /// `OP_MINE_BRANCH_MORTGAGE`: collateral locked on the main chain
    MortgageMine,
    /// `OP_MINE_BRANCH_COIN`: the stakeable coin created on the branch
    MortgageCoin,
}

/// The decoded fields of either mortgage script flavour
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MortgageScript {
    pub kind: MortgageKind,
    /// Branch id (mortgage-mine) or the funding step-2 txid (mortgage-coin)
    pub branch_or_from: Hash256,
    pub height: i64,
    pub keyid: Hash160,
}

/// Parse `OP_MINE_BRANCH_{MORTGAGE,COIN} <hash32> OP_BLOCK_HIGH <height>
/// OP_2DROP OP_DUP OP_HASH160 <keyid20>` with any trailing bytes allowed.
#[must_use]
pub fn parse_mortgage_script(script: &Script) -> Option<MortgageScript> {
    let mut it = script.ops();
    let kind = match it.next()? {
        ScriptOp::Op(OP_MINE_BRANCH_MORTGAGE) => MortgageKind::MortgageMine,
        ScriptOp::Op(OP_MINE_BRANCH_COIN) => MortgageKind::MortgageCoin,
        _ => return None,
    };
    let branch_or_from = match it.next()? {
        ScriptOp::Push(data) if data.len() == 32 => {
            let mut out = [0; 32];
            out.copy_from_slice(data);
            Hash256(out)
        }
        _ => return None,
    };
    match it.next()? {
        ScriptOp::Op(OP_BLOCK_HIGH) => {}
        _ => return None,
    }
    let height = match it.next()? {
        ScriptOp::Push(data) if data.len() == 8 => {
            let mut out = [0; 8];
            out.copy_from_slice(data);
            i64::from_le_bytes(out)
        }
        _ => return None,
    };
    for expected in [OP_2DROP, OP_DUP, OP_HASH160] {
        match it.next()? {
            ScriptOp::Op(op) if op == expected => {}
            _ => return None,
        }
    }
    let keyid = match it.next()? {
        ScriptOp::Push(data) if data.len() == 20 => {
            let mut out = [0; 20];
            out.copy_from_slice(data);
            Hash160(out)
        }
        _ => return None,
    };
    Some(MortgageScript {
        kind,
        branch_or_from,
        height,
        keyid,
    })
}

/// Extract the redeemed mortgage txid from a
/// `OP_RETURN OP_REDEEM_MORTGAGE <txid32>` statement output
#[must_use]
pub fn parse_redeem_script(script: &Script) -> Option<Hash256> {
    let mut it = script.ops();
    match (it.next()?, it.next()?, it.next()?) {
        (ScriptOp::Op(OP_RETURN), ScriptOp::Op(OP_REDEEM_MORTGAGE), ScriptOp::Push(data))
            if data.len() == 32 =>
        {
            let mut out = [0; 32];
            out.copy_from_slice(data);
            Some(Hash256(out))
        }
        _ => None,
    }
}

#[must_use]
pub fn pay_to_keyid(keyid: &Hash160) -> Script {
    let mut s = Script::new();
    s.push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_data(&keyid.0)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG);
    s
}

#[must_use]
pub fn mortgage_mine_script(branch_id: &Hash256, height: i64, keyid: &Hash160) -> Script {
    mortgage_script(OP_MINE_BRANCH_MORTGAGE, branch_id, height, keyid)
}

#[must_use]
pub fn mortgage_coin_script(from_txid: &Hash256, height: i64, keyid: &Hash160) -> Script {
    mortgage_script(OP_MINE_BRANCH_COIN, from_txid, height, keyid)
}

fn mortgage_script(marker: u8, hash: &Hash256, height: i64, keyid: &Hash160) -> Script {
    let mut s = Script::new();
    s.push_opcode(marker)
        .push_data(&hash.0)
        .push_opcode(OP_BLOCK_HIGH)
        .push_int64(height)
        .push_opcode(OP_2DROP)
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_data(&keyid.0)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG);
    s
}

/// A step-1 output sending value to a branch chain
#[must_use]
pub fn trans_branch_script(to_branch_id: &Hash256) -> Script {
    let mut s = Script::new();
    s.push_opcode(OP_TRANS_BRANCH).push_data(&to_branch_id.0);
    s
}

/// A step-1 output sending value back to the main chain
#[must_use]
pub fn trans_to_main_script() -> Script {
    let mut s = Script::new();
    s.push_opcode(OP_RETURN).push_opcode(OP_TRANS_BRANCH);
    s
}

/// The destination-side recharge output of a step-2
#[must_use]
pub fn branch_recharge_script(from_branch_id: &Hash256) -> Script {
    let mut s = Script::new();
    s.push_opcode(OP_TRANS_BRANCH_RECHARGE)
        .push_data(&from_branch_id.0);
    s
}

#[must_use]
pub fn redeem_statement_script(mortgage_txid: &Hash256) -> Script {
    let mut s = Script::new();
    s.push_opcode(OP_RETURN)
        .push_opcode(OP_REDEEM_MORTGAGE)
        .push_data(&mortgage_txid.0);
    s
}

#[must_use]
pub fn create_branch_script(keyid: &Hash160) -> Script {
    let mut s = Script::new();
    s.push_opcode(OP_CREATE_BRANCH).push_data(&keyid.0);
    s
}

#[must_use]
pub fn contract_script(contract_id: &Hash160) -> Script {
    let mut s = Script::new();
    s.push_opcode(OP_CONTRACT).push_data(&contract_id.0);
    s
}

#[must_use]
pub fn contract_change_script(contract_id: &Hash160) -> Script {
    let mut s = Script::new();
    s.push_opcode(OP_CONTRACT_CHANGE).push_data(&contract_id.0);
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_mortgage_flavours() {
        let branch = Hash256::hash_from_slice(b"branch");
        let keyid = Hash160::hash_from_slice(b"key");
        let mine = mortgage_mine_script(&branch, 100, &keyid);
        let parsed = parse_mortgage_script(&mine).unwrap();
        assert_eq!(parsed.kind, MortgageKind::MortgageMine);
        assert_eq!(parsed.branch_or_from, branch);
        assert_eq!(parsed.height, 100);
        assert_eq!(parsed.keyid, keyid);

        let from = Hash256::hash_from_slice(b"fromtx");
        let coin = mortgage_coin_script(&from, 100, &keyid);
        let parsed = parse_mortgage_script(&coin).unwrap();
        assert_eq!(parsed.kind, MortgageKind::MortgageCoin);
        assert_eq!(parsed.branch_or_from, from);
    }

    #[test]
    fn mortgage_parse_tolerates_trailing_bytes_only() {
        let branch = Hash256::hash_from_slice(b"branch");
        let keyid = Hash160::hash_from_slice(b"key");
        let mut script = mortgage_mine_script(&branch, 7, &keyid);
        script.push_opcode(OP_RETURN);
        assert!(parse_mortgage_script(&script).is_some());

        // wrong opcode order rejects
        let mut bad = Script::new();
        bad.push_data(&branch.0).push_opcode(OP_MINE_BRANCH_MORTGAGE);
        assert!(parse_mortgage_script(&bad).is_none());
    }

    #[test]
    fn redeem_script_round_trip() {
        let txid = Hash256::hash_from_slice(b"mortgage");
        let script = redeem_statement_script(&txid);
        assert_eq!(parse_redeem_script(&script), Some(txid));
        assert!(parse_redeem_script(&pay_to_keyid(&Hash160::zero())).is_none());
    }

    #[test]
    fn keyid_extraction() {
        let keyid = Hash160::hash_from_slice(b"key");
        assert_eq!(pay_to_keyid(&keyid).keyid_of_pay_script(), Some(keyid));
    }

    #[test]
    fn contract_script_markers() {
        let id = Hash160::hash_from_slice(b"contract");
        assert_eq!(contract_script(&id).contract_addr(), Some(id));
        assert!(contract_change_script(&id).is_contract_change());
        assert!(!contract_script(&id).is_contract_change());
    }

    #[test]
    fn truncated_push_terminates_scan() {
        let script = Script(vec![0x20, 0x01, 0x02]);
        assert_eq!(script.ops().count(), 0);
    }
}
