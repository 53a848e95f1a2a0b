// Copyright (c) 2024 The Ambercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use ambercoin::branch::{BranchCache, BranchDb, RocksDb};
use ambercoin::node::mempool::Mempool;
use ambercoin::node::{
    BlockEvents, BlockSink, MemoryChain, ReserveSizes, SystemContext,
};
use ambercoin::primitives::{Block, StandardVerifier};
use ambercoin::settings::Settings;
use log::info;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::Arc;

struct ChainSink(Arc<MemoryChain>);

impl BlockSink for ChainSink {
    fn process_new_block(&self, block: Block) -> Result<(), String> {
        self.0.connect_block(block);
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let settings = Settings::from_args(&args).map_err(anyhow::Error::msg)?;

    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads())
        .build_global()?;

    let mut db_path = PathBuf::from(&settings.data_dir);
    db_path.push("branchdb");
    std::fs::create_dir_all(&db_path)?;
    let db = RocksDb::open(&db_path).map_err(|e| anyhow::anyhow!("branch db: {e:?}"))?;
    let branch_db = BranchDb::open(Box::new(db)).map_err(|e| anyhow::anyhow!("branch db: {e:?}"))?;

    // block/chainstate storage and p2p attach through the seams; until
    // they do, the daemon runs on the in-memory chain
    let chain = Arc::new(MemoryChain::new());
    chain.set_adjusted_time(chrono::Utc::now().timestamp());

    let rpc_configs = settings.rpc_config_map();
    let ctx = SystemContext {
        chain_lock: Mutex::new(()),
        chain: chain.clone(),
        blocks: chain.clone(),
        block_sink: Arc::new(ChainSink(chain)),
        branch_db: RwLock::new(branch_db),
        branch_cache: Mutex::new(BranchCache::new()),
        contract_context: RwLock::new(Default::default()),
        mempool: Mutex::new(Mempool::new()),
        rpc_configs,
        settings,
        verifier: Arc::new(StandardVerifier),
        events: BlockEvents::new(),
        reserve_sizes: Mutex::new(ReserveSizes::default()),
    };

    if ctx.is_main_chain() {
        info!("ambercoin main chain node starting");
    } else {
        info!("ambercoin branch node starting, branch {}", ctx.self_branch_id());
    }
    info!(
        "height {}, branch db loaded, mempool empty",
        ctx.chain.height()
    );

    // outbound delivery runs off every tip change
    loop {
        let (seen, _) = ctx.events.current_tip();
        ctx.events
            .wait_tip_change(seen, std::time::Duration::from_secs(60));
        ambercoin::branch::outbound::process_block_branch_chain(&ctx);
    }
}

fn num_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
