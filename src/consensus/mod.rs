// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use static_assertions::const_assert;
use std::cmp;

/// Money type
pub type Money = i64;

/// Satoshis per coin
pub const COIN: Money = 100_000_000;

/// Absolute upper bound for any amount
pub const MAX_MONEY: Money = 21_000_000 * COIN;

/// Initial block reward on the main chain. Branch chains mint nothing:
/// their coinbase collects fees only.
pub const INITIAL_BLOCK_REWARD: Money = 50 * COIN;

/// Reward is halved after `n` blocks
pub const HALVING_INTERVAL: u64 = 210_000;

/// Only `n` halvings will happen, after which the block reward is zero
pub const MAX_HALVINGS: u64 = 33;

/// A cross-chain source transaction must be buried this deep before the
/// destination chain accepts the matching step-2. The remote confirmation
/// check requires `confirmations >= BRANCH_CHAIN_MATURITY + 1`.
pub const BRANCH_CHAIN_MATURITY: u64 = 6;

/// Extra depth on top of the maturity before outbound step-2 and header
/// submission messages fire, absorbing shallow reorgs.
pub const CUSHION_HEIGHT: u64 = 6;

/// Blocks a report stays open for proving. Once elapsed with no valid
/// prove, the reporter may claim the report reward.
pub const REPORT_OUTOF_HEIGHT: u64 = 144;

/// Confirmations a report or prove needs on the main chain before the
/// branch accepts the matching lock / unlock mine-coin transaction.
pub const REPORT_LOCK_COIN_HEIGHT: u64 = 60;

/// A branch block older than this (relative to the branch tip recorded on
/// the main chain) can no longer be reported; mortgage redemption past the
/// same depth is final.
pub const REDEEM_SAFE_HEIGHT: u64 = 720;

/// Max published contract code size in bytes
pub const MAX_CONTRACT_FILE_LEN: usize = 65_536;

/// Fuel budget for one top-level contract call
pub const MAX_CONTRACT_CALL: i64 = 15_000;

/// Max size of any single encoded payload
pub const MAX_DATA_LEN: usize = 1024 * 1024;

/// Max contract-to-contract call depth
pub const MAX_INTERNAL_CALL_NUM: u32 = 30;

/// Maximum serialized block size in bytes
pub const MAX_BLOCK_SIZE: usize = 4_000_000;

/// New blocks with timestamps more than `n` seconds in the future are rejected
pub const BLOCK_TIMESTAMP_MAX_FUTURE: i64 = 2 * 60 * 60;

/// Below this height the main chain accepts bootstrap blocks mined
/// without prior coins, seeding the initial supply.
pub const BIG_BOOM_HEIGHT: u64 = 1000;

/// Default byte budgets the miner reserves inside a block template for each
/// transaction family. Adjustable at runtime through the mining verbs.
pub const RESERVE_PUB_CONTRACT_BLOCK_DATA_SIZE: usize = 100_000;
pub const RESERVE_CALL_CONTRACT_BLOCK_DATA_SIZE: usize = 500_000;
pub const RESERVE_BRANCH_TX_BLOCK_DATA_SIZE: usize = 100_000;

/// Money check
#[must_use]
pub fn money_range(amount: Money) -> bool {
    (0..=MAX_MONEY).contains(&amount)
}

/// Get block reward at height. Zero on branch chains.
#[must_use]
pub fn map_height_to_block_reward(height: u64, is_main_chain: bool) -> Money {
    if !is_main_chain {
        return 0;
    }
    let halvings = cmp::min(height / HALVING_INTERVAL, MAX_HALVINGS);
    if halvings >= 63 {
        return 0;
    }
    INITIAL_BLOCK_REWARD >> halvings
}

const_assert!(COIN > 0);
const_assert!(MAX_MONEY > 0);
const_assert!(BRANCH_CHAIN_MATURITY >= 1);
const_assert!(CUSHION_HEIGHT >= 1);
const_assert!(REPORT_LOCK_COIN_HEIGHT == 60);
const_assert!(REPORT_OUTOF_HEIGHT > REPORT_LOCK_COIN_HEIGHT);
const_assert!(REDEEM_SAFE_HEIGHT > REPORT_OUTOF_HEIGHT);
const_assert!(MAX_CONTRACT_FILE_LEN == 65_536);
const_assert!(MAX_CONTRACT_CALL == 15_000);
const_assert!(MAX_INTERNAL_CALL_NUM == 30);
const_assert!(MAX_DATA_LEN == 1024 * 1024);
const_assert!(
    RESERVE_PUB_CONTRACT_BLOCK_DATA_SIZE
        + RESERVE_CALL_CONTRACT_BLOCK_DATA_SIZE
        + RESERVE_BRANCH_TX_BLOCK_DATA_SIZE
        < MAX_BLOCK_SIZE
);
