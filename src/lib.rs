// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! # Ambercoin
//! Official implementation of Ambercoin, a Bitcoin-derived cryptocurrency
//! built around two systems:
//!
//! * **In-validation smart contracts**: a sandboxed deterministic bytecode
//!   engine runs inside block validation. Independent contract
//!   transactions execute in parallel, and every block commits two extra
//!   Merkle roots over per-transaction pre and post contract state, so a
//!   stale read is provable by anyone holding the two proofs.
//! * **Hub-and-spoke branch chains**: a main chain anchors the block
//!   headers of many branch chains and arbitrates cross-chain value. A
//!   transfer is a two-phase transaction pair tied together by a stripped
//!   transaction hash; miner collateral mortgaged on the main chain is the
//!   only stake that may sign branch blocks, and the report / prove
//!   dispute window slashes collateral behind a proven cheat.
//!
//! The crate is the consensus core: transaction and block primitives, the
//! contract executors, the branch protocol validators, the cross-chain
//! RPC client, and the miner. P2P, wallets, storage and the RPC transport
//! are seams (`ChainView`, `BlockStore`, `KeyStore`, `CoinProvider`,
//! `ScriptVerifier`) the daemon wires up.

pub mod branch;
pub mod codec;
pub mod consensus;
pub mod contract;
pub mod miner;
pub mod node;
pub mod primitives;
pub mod settings;
