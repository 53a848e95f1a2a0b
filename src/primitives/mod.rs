// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

mod block;
mod hash;
pub mod merkle;
pub mod script;
mod transaction;
mod verify;

pub use block::*;
pub use hash::*;
pub use merkle::{check_spv_proof, merkle_root, PartialMerkleTree, SpvErr, SpvProof};
pub use script::{
    branch_recharge_script, contract_change_script, contract_script, create_branch_script,
    mortgage_coin_script, mortgage_mine_script, parse_mortgage_script, parse_redeem_script,
    pay_to_keyid, redeem_statement_script, trans_branch_script, trans_to_main_script,
    MortgageKind, MortgageScript, Script, ScriptOp,
};
pub use transaction::*;
pub use verify::*;
