// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! The script verification seam. Full script evaluation is an external
//! collaborator; consensus code consumes it as a pure function of
//! `(script, amount, tx, in_index)`.

use crate::consensus::Money;
use crate::primitives::{parse_mortgage_script, Hash160, Hash256, Script, ScriptOp, Transaction};
use schnorrkel::{signing_context, Keypair, PublicKey as SchnorPK, Signature as SchnorSig};

/// Domain separator for transaction input signatures
pub const TXIN_SIGNING_CTX: &[u8] = b"ambercoin.txin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptErr {
    /// Script shape not understood by the verifier
    NonStandard,
    /// Signature or key data malformed
    BadSignatureEncoding,
    /// Signature does not verify
    BadSignature,
    /// Public key does not hash to the required key id
    KeyMismatch,
}

pub trait ScriptVerifier: Send + Sync {
    fn verify(
        &self,
        script_pubkey: &Script,
        amount: Money,
        tx: &Transaction,
        in_index: usize,
    ) -> Result<(), ScriptErr>;
}

/// The message an input signature commits to: the transaction with every
/// input's unlock script cleared, bound to the input's position.
#[must_use]
pub fn signature_hash(tx: &Transaction, in_index: usize) -> Hash256 {
    let mut unsigned = tx.clone();
    for txin in &mut unsigned.vin {
        txin.script_sig.clear();
    }
    let mut buf = unsigned.to_bytes();
    buf.extend_from_slice(&(in_index as u32).to_le_bytes());
    Hash256::hash_from_slice(buf)
}

/// Build the unlock script for a key-locked output
#[must_use]
pub fn sign_input(keypair: &Keypair, tx: &Transaction, in_index: usize) -> Script {
    let msg = signature_hash(tx, in_index);
    let ctx = signing_context(TXIN_SIGNING_CTX);
    let sig = keypair.sign(ctx.bytes(msg.as_bytes()));
    let mut script = Script::new();
    script
        .push_data(&keypair.public.to_bytes())
        .push_data(&sig.to_bytes());
    script
}

/// Verifies the key-locked script families the core emits: pay-to-keyid
/// and the two mortgage flavours, whose tail is the same keyid lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardVerifier;

impl StandardVerifier {
    fn required_keyid(script_pubkey: &Script) -> Result<Hash160, ScriptErr> {
        if let Some(keyid) = script_pubkey.keyid_of_pay_script() {
            return Ok(keyid);
        }
        if let Some(mortgage) = parse_mortgage_script(script_pubkey) {
            return Ok(mortgage.keyid);
        }
        Err(ScriptErr::NonStandard)
    }
}

impl ScriptVerifier for StandardVerifier {
    fn verify(
        &self,
        script_pubkey: &Script,
        _amount: Money,
        tx: &Transaction,
        in_index: usize,
    ) -> Result<(), ScriptErr> {
        let keyid = Self::required_keyid(script_pubkey)?;

        let txin = tx.vin.get(in_index).ok_or(ScriptErr::NonStandard)?;
        let mut ops = txin.script_sig.ops();
        let (Some(ScriptOp::Push(pubkey)), Some(ScriptOp::Push(sig))) = (ops.next(), ops.next())
        else {
            return Err(ScriptErr::BadSignatureEncoding);
        };

        if Hash160::hash_from_slice(pubkey) != keyid {
            return Err(ScriptErr::KeyMismatch);
        }
        let pk = SchnorPK::from_bytes(pubkey).map_err(|_| ScriptErr::BadSignatureEncoding)?;
        let sig = SchnorSig::from_bytes(sig).map_err(|_| ScriptErr::BadSignatureEncoding)?;

        let msg = signature_hash(tx, in_index);
        let ctx = signing_context(TXIN_SIGNING_CTX);
        pk.verify(ctx.bytes(msg.as_bytes()), &sig)
            .map_err(|_| ScriptErr::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{pay_to_keyid, OutPoint, TxIn, TxOut};
    use rand::rngs::OsRng;

    fn keyed_tx(keypair: &Keypair) -> (Transaction, Script) {
        let keyid = Hash160::hash_from_slice(keypair.public.to_bytes());
        let script_pubkey = pay_to_keyid(&keyid);
        let mut tx = Transaction {
            vin: vec![TxIn {
                prevout: OutPoint::new(Hash256::hash_from_slice(b"prev"), 0),
                script_sig: Script::new(),
                nsequence: 0,
            }],
            vout: vec![TxOut {
                value: 50,
                script_pubkey: pay_to_keyid(&Hash160::zero()),
            }],
            ..Transaction::default()
        };
        tx.vin[0].script_sig = sign_input(keypair, &tx, 0);
        (tx, script_pubkey)
    }

    #[test]
    fn standard_verifier_accepts_valid_signature() {
        let keypair = Keypair::generate_with(OsRng);
        let (tx, script_pubkey) = keyed_tx(&keypair);
        assert!(StandardVerifier.verify(&script_pubkey, 50, &tx, 0).is_ok());
    }

    #[test]
    fn standard_verifier_rejects_tampered_tx() {
        let keypair = Keypair::generate_with(OsRng);
        let (mut tx, script_pubkey) = keyed_tx(&keypair);
        tx.vout[0].value = 51;
        assert_eq!(
            StandardVerifier.verify(&script_pubkey, 50, &tx, 0),
            Err(ScriptErr::BadSignature)
        );
    }

    #[test]
    fn standard_verifier_rejects_wrong_key() {
        let keypair = Keypair::generate_with(OsRng);
        let (tx, _) = keyed_tx(&keypair);
        let other = pay_to_keyid(&Hash160::hash_from_slice(b"someone else"));
        assert_eq!(
            StandardVerifier.verify(&other, 50, &tx, 0),
            Err(ScriptErr::KeyMismatch)
        );
    }

    #[test]
    fn mortgage_script_verifies_with_tail_key() {
        let keypair = Keypair::generate_with(OsRng);
        let keyid = Hash160::hash_from_slice(keypair.public.to_bytes());
        let script_pubkey = crate::primitives::mortgage_coin_script(
            &Hash256::hash_from_slice(b"from"),
            10,
            &keyid,
        );
        let mut tx = Transaction {
            vin: vec![TxIn::default()],
            ..Transaction::default()
        };
        tx.vin[0].script_sig = sign_input(&keypair, &tx, 0);
        assert!(StandardVerifier.verify(&script_pubkey, 1000, &tx, 0).is_ok());
    }
}
