// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

pub mod cache;
pub mod client;
pub mod db;
pub mod outbound;
pub mod protocol;

pub use cache::BranchCache;
pub use client::{CrossChainClient, RpcClientErr, RpcConfig, RpcConfigMap};
pub use db::{BranchBlockData, BranchData, BranchDb, DbErr, DbInterface, MemoryDb, ReportFlag, RocksDb};
pub use protocol::{CheckResult, RejectKind, TxRejection};
