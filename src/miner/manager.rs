//! Block producer with an active sealing loop.
//!
//! Assembles a block on the current head from the pending transactions,
//! hands it to the consensus engine for sealing and imports the result.

use super::stats::{MiningStats, MiningStatus};
use crate::chain::events::NewMinedBlockEvent;
use crate::chain::processor::{Executor, GasPool, TxContext};
use crate::chain::{calc_gas_limit, BlockChain};
use crate::config::miner::{MinerConfig, MAX_EXTRA_DATA};
use crate::consensus::Engine;
use crate::consensus_pow::unix_now;
use crate::errors::{ChainError, ConsensusError};
use crate::metrics::POW_HASHRATE;
use crate::types::{Address, Block, Header, Transaction, H256};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

pub struct Miner {
    chain: Arc<BlockChain>,
    engine: Arc<dyn Engine>,
    executor: Arc<dyn Executor>,
    config: RwLock<MinerConfig>,
    pending: Mutex<Vec<Transaction>>,
    stats: MiningStats,

    mining: AtomicBool,
    stop_tx: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Miner {
    pub fn new(chain: Arc<BlockChain>, executor: Arc<dyn Executor>, config: MinerConfig) -> Result<Arc<Self>, ConsensusError> {
        check_extra(config.extra.as_bytes())?;
        let engine = chain.engine().clone();
        Ok(Arc::new(Self {
            chain,
            engine,
            executor,
            config: RwLock::new(config),
            pending: Mutex::new(Vec::new()),
            stats: MiningStats::default(),
            mining: AtomicBool::new(false),
            stop_tx: Mutex::new(None),
            worker: Mutex::new(None),
        }))
    }

    pub fn set_extra(&self, extra: &str) -> Result<(), ConsensusError> {
        check_extra(extra.as_bytes())?;
        self.config.write().extra = extra.to_string();
        Ok(())
    }

    pub fn set_coinbase(&self, coinbase: Address) {
        self.config.write().coinbase = coinbase;
    }

    pub fn coinbase(&self) -> Address {
        self.config.read().coinbase
    }

    pub fn stats(&self) -> &MiningStats {
        &self.stats
    }

    pub fn is_mining(&self) -> bool {
        self.mining.load(Ordering::SeqCst)
    }

    /// Queue a transaction for the next block.
    pub fn add_pending(&self, tx: Transaction) {
        self.pending.lock().push(tx);
    }

    pub fn pending(&self) -> Vec<Transaction> {
        self.pending.lock().clone()
    }

    pub fn status(&self) -> MiningStatus {
        let cfg = self.config.read();
        MiningStatus {
            enabled: self.is_mining(),
            threads: cfg.effective_threads(),
            hashrate_hps: POW_HASHRATE.get(),
            blocks_found: self.stats.blocks_found(),
            current_number: self.chain.current_block().number() + 1,
            pending_txs: self.pending.lock().len(),
        }
    }

    /// Header of the next block on top of `parent`, before the engine fills
    /// in its consensus fields.
    fn next_header(&self, parent: &Block) -> Header {
        let cfg = self.config.read();
        Header {
            parent_hash: parent.hash(),
            number: parent.number() + 1,
            gas_limit: calc_gas_limit(parent.header(), cfg.gas_floor, cfg.gas_ceil),
            extra: cfg.extra.as_bytes().to_vec(),
            coinbase: cfg.coinbase,
            time: unix_now().max(parent.time() + 1),
            ..Header::default()
        }
    }

    /// Build, seal and import one block carrying as many of `pending` as
    /// apply cleanly. Returns `Ok(None)` when `stop` fired during sealing.
    pub fn mine_block(&self, pending: &[Transaction], stop: &Receiver<()>) -> Result<Option<Block>, ChainError> {
        let parent = self.chain.current_block();
        let mut header = self.next_header(&parent);
        self.engine.prepare(&*self.chain, &mut header)?;

        let mut state = self.chain.state_at(parent.root())?;
        let mut gas_pool = GasPool::new(header.gas_limit);
        // prepare may repurpose the coinbase as a vote target; fees go to the
        // author the importing chain will credit.
        let author = self.engine.local_author().unwrap_or(self.config.read().coinbase);
        let ctx = TxContext::new(&header, author, H256::zero());
        let (mut txs, mut receipts, mut used_gas) = (Vec::new(), Vec::new(), 0u64);

        for tx in pending {
            if gas_pool.gas() < tx.gas_limit {
                trace!(target: "miner", hash = %tx.hash(), "not enough gas left for transaction");
                continue;
            }
            match self
                .executor
                .apply_transaction(&ctx, &mut state, &mut gas_pool, tx, txs.len(), &mut used_gas)
            {
                Ok(receipt) => {
                    txs.push(tx.clone());
                    receipts.push(receipt);
                }
                Err(err) => {
                    debug!(target: "miner", hash = %tx.hash(), error = %err, "skipping transaction");
                }
            }
        }
        header.gas_used = used_gas;
        let block = self
            .engine
            .finalize(&*self.chain, header, &mut state, txs, Vec::new(), &receipts)?;

        info!(
            target: "miner",
            number = block.number(),
            txs = block.transactions().len(),
            gas = block.gas_used(),
            "commit new mining work"
        );
        let Some(sealed) = self.engine.seal(&*self.chain, &block, stop)? else {
            trace!(target: "miner", number = block.number(), "sealing aborted");
            return Ok(None);
        };

        self.chain.insert_chain(vec![sealed.clone()]).map_err(|err| err.source)?;
        let author = self.engine.author(sealed.header()).unwrap_or(sealed.coinbase());
        self.stats.record_block(author, sealed.number(), sealed.hash());
        info!(
            target: "miner",
            number = sealed.number(),
            hash = %sealed.hash(),
            "successfully sealed new block"
        );
        self.chain
            .feeds()
            .send_mined(NewMinedBlockEvent { block: sealed.clone() });

        let included: HashSet<H256> = sealed.transactions().iter().map(|tx| tx.hash()).collect();
        self.pending.lock().retain(|tx| !included.contains(&tx.hash()));
        Ok(Some(sealed))
    }

    /// Start the background loop. Does nothing when already mining.
    pub fn start(self: &Arc<Self>) -> Result<(), ChainError> {
        if self.mining.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        *self.stop_tx.lock() = Some(stop_tx);
        let miner = self.clone();
        let handle = thread::Builder::new()
            .name("miner".into())
            .spawn(move || miner.run(stop_rx))
            .map_err(crate::errors::StoreError::from)?;
        *self.worker.lock() = Some(handle);
        info!(target: "miner", coinbase = %self.coinbase(), "starting mining operation");
        Ok(())
    }

    fn run(&self, stop: Receiver<()>) {
        let recommit = Duration::from_millis(self.config.read().recommit_ms.max(1));
        loop {
            let pending = self.pending();
            match self.mine_block(&pending, &stop) {
                Ok(Some(_)) => {}
                Ok(None) => return,
                Err(err) => {
                    warn!(target: "miner", error = %err, "block sealing failed");
                    match stop.recv_timeout(recommit) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => return,
                    }
                }
            }
            if !self.is_mining() {
                return;
            }
        }
    }

    /// Abort sealing and wait for the loop to exit.
    pub fn stop(&self) {
        if !self.mining.swap(false, Ordering::SeqCst) {
            return;
        }
        drop(self.stop_tx.lock().take());
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        info!(target: "miner", blocks = self.stats.blocks_found(), "mining stopped");
    }
}

fn check_extra(extra: &[u8]) -> Result<(), ConsensusError> {
    if extra.len() > MAX_EXTRA_DATA {
        return Err(ConsensusError::ExtraTooLong {
            len: extra.len(),
            max: MAX_EXTRA_DATA,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::genesis::Genesis;
    use crate::chain::processor::TransferExecutor;
    use crate::config::{CacheConfig, ChainConfig};
    use crate::consensus_pow::PowEngine;
    use crate::store::MemoryStore;
    use primitive_types::U256;

    fn setup(alice: Address) -> (Arc<BlockChain>, Arc<Miner>) {
        let db = MemoryStore::shared();
        Genesis::dev_pow(1, &[(alice, U256::from(10u64).pow(U256::from(18u64)))])
            .commit(&db)
            .unwrap();
        let chain = BlockChain::new(
            db,
            CacheConfig::default(),
            ChainConfig::pow(1),
            Arc::new(PowEngine::faker()),
            Arc::new(TransferExecutor),
        )
        .unwrap();
        let miner = Miner::new(
            chain.clone(),
            Arc::new(TransferExecutor),
            MinerConfig {
                coinbase: Address([0xcc; 20]),
                ..MinerConfig::default()
            },
        )
        .unwrap();
        (chain, miner)
    }

    #[test]
    fn mined_block_extends_head_and_skips_bad_transactions() {
        let alice = Address([0xa1; 20]);
        let (chain, miner) = setup(alice);
        let mut mined = chain.feeds().subscribe_mined();

        let good = Transaction {
            nonce: 0,
            gas_price: U256::one(),
            gas_limit: 21_000,
            to: Some(Address([0xb0; 20])),
            value: U256::from(5u64),
            data: Vec::new(),
            from: alice,
        };
        let bad_nonce = Transaction { nonce: 7, ..good.clone() };
        miner.add_pending(good.clone());
        miner.add_pending(bad_nonce);

        let (_keep, stop) = crossbeam_channel::bounded::<()>(1);
        let block = miner.mine_block(&miner.pending(), &stop).unwrap().unwrap();
        assert_eq!(block.number(), 1);
        assert_eq!(block.transactions().len(), 1);
        assert_eq!(chain.current_block().hash(), block.hash());
        assert_eq!(mined.try_recv().unwrap().block.hash(), block.hash());
        assert_eq!(miner.stats().blocks_found(), 1);
        // The included transaction left the pool; the failing one stays.
        assert_eq!(miner.pending().len(), 1);
        chain.stop();
    }

    #[test]
    fn extra_data_is_bounded() {
        let (chain, miner) = setup(Address([0xa1; 20]));
        assert!(miner.set_extra(&"x".repeat(MAX_EXTRA_DATA)).is_ok());
        assert!(matches!(
            miner.set_extra(&"x".repeat(MAX_EXTRA_DATA + 1)),
            Err(ConsensusError::ExtraTooLong { .. })
        ));
        chain.stop();
    }

    #[test]
    fn start_and_stop_loop() {
        let (chain, miner) = setup(Address([0xa1; 20]));
        miner.start().unwrap();
        assert!(miner.is_mining());
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while chain.current_block().number() < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        miner.stop();
        assert!(!miner.is_mining());
        assert!(chain.current_block().number() >= 2);
        chain.stop();
    }
}
