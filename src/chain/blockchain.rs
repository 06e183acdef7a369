//! The canonical chain: block import, fork choice, reorganisation and state
//! retention.
//!
//! Blocks enter through [`BlockChain::insert_chain`]. Headers of a batch are
//! verified concurrently by the consensus engine while bodies are validated,
//! executed and written one by one in input order. Each written block is
//! either canonical (it carries the highest total difficulty) or a side
//! block; a canonical block whose parent is not the current head triggers a
//! reorg.
//!
//! Lock order: `chainmu` (one insert at a time) before `mu` (head pointers
//! and canonical mappings). The validator and processor sit behind their own
//! locks so they can be swapped without touching either.

use super::events::{
    ChainEvent, ChainFeeds, ChainHeadEvent, ChainSideEvent, PendingEvent, RemovedLogsEvent,
    RemovedTransactionsEvent,
};
use super::header_chain::{logged, prefer_external, HeaderChain, WriteStatus};
use super::processor::{Executor, Processor, StateProcessor};
use super::validator::{BlockValidator, ChainStateReader, Validator};
use crate::bounded::{BoundedRing, LruCache};
use crate::config::{CacheConfig, ChainConfig};
use crate::consensus::{ChainReader, Engine};
use crate::consensus_pow::unix_now;
use crate::errors::{ChainError, ConsensusError, InsertError, StateError, StoreError};
use crate::metrics::{CHAIN_BAD_BLOCKS, CHAIN_FUTURE_BLOCKS, CHAIN_HEAD_NUMBER, CHAIN_INSERTS, CHAIN_REORGS, CHAIN_REORG_DROPPED, TRIE_CACHE_BYTES};
use crate::state::{StateDb, TrieDatabase};
use crate::store::schema::{self, TxLookupEntry};
use crate::store::{SharedStore, WriteBatch};
use crate::types::{create_address, tx_difference, Block, Body, Header, Log, Receipt, H256};
use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::{Mutex, MutexGuard, RwLock};
use primitive_types::U256;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const BODY_CACHE_LIMIT: usize = 256;
const BLOCK_CACHE_LIMIT: usize = 256;
const MAX_FUTURE_BLOCKS: usize = 256;
/// Seconds a block may lie ahead of the local clock and still be queued.
const MAX_TIME_FUTURE_BLOCKS: u64 = 30;
const BAD_BLOCK_LIMIT: usize = 10;
const FUTURE_BLOCK_INTERVAL: Duration = Duration::from_secs(5);
const IDEAL_BATCH_SIZE: usize = 100 * 1024;
const STATS_REPORT_LIMIT: Duration = Duration::from_secs(8);
/// Reorgs dropping more blocks than this are logged as warnings.
const REORG_WARN_DEPTH: usize = 63;

pub struct BlockChain {
    me: Weak<BlockChain>,
    config: ChainConfig,
    cache_config: CacheConfig,
    db: SharedStore,

    /// Referenced state roots by block number, lowest first.
    triegc: Mutex<BinaryHeap<Reverse<(u64, H256)>>>,
    /// Canonical processing time accumulated since the last state flush.
    gc_proc: Mutex<Duration>,
    /// Number of the last block whose state was flushed by the time limit.
    last_write: AtomicU64,

    hc: HeaderChain,
    feeds: ChainFeeds,
    genesis_block: RwLock<Block>,

    chainmu: Mutex<()>,
    mu: Mutex<()>,

    current_block: RwLock<Block>,
    current_fast_block: RwLock<Block>,

    state_cache: Arc<TrieDatabase>,
    body_cache: LruCache<H256, Body>,
    block_cache: LruCache<H256, Block>,
    future_blocks: LruCache<H256, Block>,

    quit: Mutex<Option<Sender<()>>>,
    stopped: AtomicBool,
    proc_interrupt: Arc<AtomicBool>,
    updater: Mutex<Option<JoinHandle<()>>>,

    engine: Arc<dyn Engine>,
    validator: RwLock<Arc<dyn Validator>>,
    processor: RwLock<Arc<dyn Processor>>,

    bad_blocks: Mutex<BoundedRing<Block>>,
    bad_hashes: HashSet<H256>,
}

#[derive(Default)]
struct InsertStats {
    queued: usize,
    processed: usize,
    ignored: usize,
    used_gas: u64,
    last_index: usize,
    start: Option<Instant>,
}

impl InsertStats {
    fn new() -> Self {
        Self {
            start: Some(Instant::now()),
            ..Self::default()
        }
    }

    /// Log a summary every few seconds and at the end of the batch.
    fn report(&mut self, chain: &[Block], index: usize, cache: usize) {
        let elapsed = self.start.map(|s| s.elapsed()).unwrap_or_default();
        if index + 1 != chain.len() && elapsed < STATS_REPORT_LIMIT {
            return;
        }
        let end = &chain[index];
        let txs: usize = chain[self.last_index.min(index)..=index]
            .iter()
            .map(|b| b.transactions().len())
            .sum();
        let mgas = self.used_gas as f64 / 1e6;
        let secs = elapsed.as_secs_f64();
        info!(
            target: "chain",
            blocks = self.processed,
            txs,
            mgas,
            elapsed = ?elapsed,
            mgasps = if secs > 0.0 { mgas / secs } else { 0.0 },
            number = end.number(),
            hash = %end.hash(),
            cache,
            queued = self.queued,
            ignored = self.ignored,
            "imported new chain segment"
        );
        *self = InsertStats {
            last_index: index + 1,
            start: Some(Instant::now()),
            ..InsertStats::default()
        };
    }
}

fn check_contiguous(chain: &[Block]) -> Result<(), InsertError> {
    for i in 1..chain.len() {
        let (prev, cur) = (&chain[i - 1], &chain[i]);
        if prev.number().checked_add(1) != Some(cur.number()) || cur.parent_hash() != prev.hash() {
            error!(
                target: "chain",
                number = cur.number(),
                hash = %cur.hash(),
                parent = %cur.parent_hash(),
                prevnumber = prev.number(),
                prevhash = %prev.hash(),
                "non contiguous block insert"
            );
            return Err(InsertError::new(
                i,
                ChainError::NonContiguous {
                    prev_index: i - 1,
                    prev_number: prev.number(),
                    prev_hash: prev.hash(),
                    index: i,
                    number: cur.number(),
                    hash: cur.hash(),
                    parent: cur.parent_hash(),
                },
            ));
        }
    }
    Ok(())
}

impl BlockChain {
    /// Open the chain stored in `db`. The database must already hold a
    /// genesis block (see [`super::genesis::setup_genesis_block`]).
    pub fn new(
        db: SharedStore,
        cache_config: CacheConfig,
        config: ChainConfig,
        engine: Arc<dyn Engine>,
        executor: Arc<dyn Executor>,
    ) -> Result<Arc<Self>, ChainError> {
        Self::with_blacklist(db, cache_config, config, engine, executor, HashSet::new())
    }

    /// Like [`BlockChain::new`], refusing every block in `bad_hashes`. A
    /// blacklisted block already on the canonical chain rewinds the head to
    /// its parent.
    pub fn with_blacklist(
        db: SharedStore,
        cache_config: CacheConfig,
        config: ChainConfig,
        engine: Arc<dyn Engine>,
        executor: Arc<dyn Executor>,
        bad_hashes: HashSet<H256>,
    ) -> Result<Arc<Self>, ChainError> {
        let proc_interrupt = Arc::new(AtomicBool::new(false));
        let hc = HeaderChain::new(db.clone(), config.clone(), engine.clone(), proc_interrupt.clone())?;
        let genesis_header = hc.genesis();
        let genesis = schema::read_block(db.as_ref(), &genesis_header.hash(), 0)?.ok_or(ChainError::NoGenesis)?;
        let state_cache = Arc::new(TrieDatabase::new(db.clone()));
        let (quit_tx, quit_rx) = crossbeam_channel::bounded::<()>(0);

        let validator: Arc<dyn Validator> = Arc::new(BlockValidator::new(engine.clone()));
        let processor: Arc<dyn Processor> = Arc::new(StateProcessor::new(engine.clone(), executor));

        let bc = Arc::new_cyclic(|me| BlockChain {
            me: me.clone(),
            config,
            cache_config,
            db,
            triegc: Mutex::new(BinaryHeap::new()),
            gc_proc: Mutex::new(Duration::ZERO),
            last_write: AtomicU64::new(0),
            hc,
            feeds: ChainFeeds::default(),
            genesis_block: RwLock::new(genesis.clone()),
            chainmu: Mutex::new(()),
            mu: Mutex::new(()),
            current_block: RwLock::new(genesis.clone()),
            current_fast_block: RwLock::new(genesis),
            state_cache,
            body_cache: LruCache::new(BODY_CACHE_LIMIT),
            block_cache: LruCache::new(BLOCK_CACHE_LIMIT),
            future_blocks: LruCache::new(MAX_FUTURE_BLOCKS),
            quit: Mutex::new(Some(quit_tx)),
            stopped: AtomicBool::new(false),
            proc_interrupt,
            updater: Mutex::new(None),
            engine,
            validator: RwLock::new(validator),
            processor: RwLock::new(processor),
            bad_blocks: Mutex::new(BoundedRing::new(BAD_BLOCK_LIMIT)),
            bad_hashes,
        });

        bc.load_last_state()?;
        for hash in &bc.bad_hashes {
            if let Some(header) = bc.get_header_by_hash(hash) {
                if bc.get_canonical_hash(header.number) == Some(*hash) {
                    error!(target: "chain", number = header.number, hash = %hash, "found bad hash, rewinding chain");
                    bc.set_head(header.number.saturating_sub(1))?;
                    error!(target: "chain", "chain rewind was successful, resuming normal operation");
                }
            }
        }
        bc.spawn_updater(quit_rx)?;
        Ok(bc)
    }

    /// Background loop retrying queued future blocks until the chain stops
    /// or is dropped.
    fn spawn_updater(&self, quit: Receiver<()>) -> Result<(), ChainError> {
        let weak = self.me.clone();
        let handle = std::thread::Builder::new()
            .name("chain-update".into())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(FUTURE_BLOCK_INTERVAL);
                loop {
                    select! {
                        recv(ticker) -> _ => match weak.upgrade() {
                            Some(bc) => bc.proc_future_blocks(),
                            None => return,
                        },
                        recv(quit) -> _ => return,
                    }
                }
            })
            .map_err(StoreError::from)?;
        *self.updater.lock() = Some(handle);
        Ok(())
    }

    fn load_last_state(&self) -> Result<(), ChainError> {
        let Some(head) = schema::read_head_block_hash(self.db.as_ref())? else {
            warn!(target: "chain", "empty database, resetting chain");
            return self.reset();
        };
        let Some(mut current) = self.get_block_by_hash(&head) else {
            warn!(target: "chain", hash = %head, "head block missing, resetting chain");
            return self.reset();
        };
        if !self.has_state(&current.root()) {
            warn!(target: "chain", number = current.number(), hash = %current.hash(), "head state missing, repairing chain");
            self.repair(&mut current)?;
        }
        *self.current_block.write() = current.clone();
        CHAIN_HEAD_NUMBER.set(current.number() as i64);

        let mut current_header = current.header().clone();
        if let Some(head) = schema::read_head_header_hash(self.db.as_ref())? {
            if let Some(header) = self.get_header_by_hash(&head) {
                current_header = header;
            }
        }
        self.hc.set_current_header(current_header.clone())?;

        let mut fast = current.clone();
        if let Some(head) = schema::read_head_fast_block_hash(self.db.as_ref())? {
            if let Some(block) = self.get_block_by_hash(&head) {
                fast = block;
            }
        }
        *self.current_fast_block.write() = fast.clone();

        let td_of = |hash: &H256, number: u64| self.get_td(hash, number).unwrap_or_default();
        info!(
            target: "chain",
            number = current_header.number,
            hash = %current_header.hash(),
            td = %td_of(&current_header.hash(), current_header.number),
            "loaded most recent local header"
        );
        info!(
            target: "chain",
            number = current.number(),
            hash = %current.hash(),
            td = %td_of(&current.hash(), current.number()),
            "loaded most recent local full block"
        );
        info!(
            target: "chain",
            number = fast.number(),
            hash = %fast.hash(),
            td = %td_of(&fast.hash(), fast.number()),
            "loaded most recent local fast block"
        );
        Ok(())
    }

    /// Rewind the local chain to `head`. Everything above it is deleted;
    /// if the state of the new head is missing the chain falls back to
    /// genesis.
    pub fn set_head(&self, head: u64) -> Result<(), ChainError> {
        warn!(target: "chain", target_number = head, "rewinding blockchain");
        {
            let _guard = self.mu.lock();
            self.hc.set_head(head, |batch, hash, number| {
                schema::delete_body(batch, hash, number);
                schema::delete_receipts(batch, hash, number);
            })?;
            let current_header = self.hc.current_header();

            self.body_cache.clear();
            self.block_cache.clear();
            self.future_blocks.clear();
            CHAIN_FUTURE_BLOCKS.set(0);

            let mut current = self.current_block();
            if current_header.number < current.number() {
                current = self
                    .get_block(&current_header.hash(), current_header.number)
                    .unwrap_or_else(|| self.genesis());
            }
            if !self.has_state(&current.root()) {
                current = self.genesis();
            }
            let mut fast = self.current_fast_block();
            if current_header.number < fast.number() {
                fast = self
                    .get_block(&current_header.hash(), current_header.number)
                    .unwrap_or_else(|| self.genesis());
            }

            let mut batch = WriteBatch::new();
            schema::write_head_block_hash(&mut batch, &current.hash());
            schema::write_head_fast_block_hash(&mut batch, &fast.hash());
            self.db.write(batch)?;
            *self.current_block.write() = current;
            *self.current_fast_block.write() = fast;
        }
        self.load_last_state()
    }

    /// Make the block `hash` the head after a fast sync delivered its state.
    pub fn fast_sync_commit_head(&self, hash: &H256) -> Result<(), ChainError> {
        let block = self.get_block_by_hash(hash).ok_or(ChainError::UnknownBlock(*hash))?;
        if !self.has_state(&block.root()) {
            return Err(StateError::MissingNode(block.root()).into());
        }
        let _guard = self.mu.lock();
        let mut batch = WriteBatch::new();
        schema::write_head_block_hash(&mut batch, hash);
        self.db.write(batch)?;
        *self.current_block.write() = block.clone();
        CHAIN_HEAD_NUMBER.set(block.number() as i64);
        info!(target: "chain", number = block.number(), hash = %hash, "committed new head block");
        Ok(())
    }

    pub fn reset(&self) -> Result<(), ChainError> {
        let genesis = self.genesis();
        self.reset_with_genesis_block(&genesis)
    }

    /// Purge the whole chain and restart it from `genesis`.
    pub fn reset_with_genesis_block(&self, genesis: &Block) -> Result<(), ChainError> {
        self.set_head(0)?;
        let _guard = self.mu.lock();

        let mut batch = WriteBatch::new();
        schema::write_td(&mut batch, &genesis.hash(), 0, &genesis.difficulty())?;
        schema::write_block(&mut batch, genesis)?;
        self.db.write(batch)?;

        *self.genesis_block.write() = genesis.clone();
        self.insert(genesis)?;
        *self.current_block.write() = genesis.clone();
        self.hc.set_genesis(genesis.header().clone());
        self.hc.set_current_header(genesis.header().clone())?;
        *self.current_fast_block.write() = genesis.clone();
        Ok(())
    }

    /// Walk back from `head` until a block with available state is found.
    fn repair(&self, head: &mut Block) -> Result<(), ChainError> {
        loop {
            if self.has_state(&head.root()) {
                info!(target: "chain", number = head.number(), hash = %head.hash(), "rewound blockchain to past state");
                return Ok(());
            }
            let number = head.number().checked_sub(1).ok_or(ChainError::NoGenesis)?;
            *head = self
                .get_block(&head.parent_hash(), number)
                .ok_or(ChainError::MissingBlock(number))?;
        }
    }

    /// Dump the whole canonical chain to `w`.
    pub fn export<W: Write>(&self, w: &mut W) -> Result<(), ChainError> {
        self.export_n(w, 0, self.current_block().number())
    }

    /// Write canonical blocks `first..=last` to `w`, bincode-framed.
    pub fn export_n<W: Write>(&self, w: &mut W, first: u64, last: u64) -> Result<(), ChainError> {
        if first > last {
            return Err(ChainError::InvalidRange { first, last });
        }
        info!(target: "chain", count = last - first + 1, "exporting batch of blocks");
        let (start, mut reported) = (Instant::now(), Instant::now());
        for nr in first..=last {
            let block = self.get_block_by_number(nr).ok_or(ChainError::MissingBlock(nr))?;
            bincode::serialize_into(&mut *w, &block).map_err(StoreError::from)?;
            if reported.elapsed() >= STATS_REPORT_LIMIT {
                info!(target: "chain", exported = nr - first, elapsed = ?start.elapsed(), "exporting blocks");
                reported = Instant::now();
            }
        }
        Ok(())
    }

    /// Write `block` as the new head, assuming it is already linked to it.
    /// Callers hold `mu`.
    fn insert(&self, block: &Block) -> Result<(), ChainError> {
        let hash = block.hash();
        let update_heads = self.get_canonical_hash(block.number()) != Some(hash);

        let mut batch = WriteBatch::new();
        schema::write_canonical_hash(&mut batch, &hash, block.number());
        schema::write_head_block_hash(&mut batch, &hash);
        if update_heads {
            schema::write_head_fast_block_hash(&mut batch, &hash);
        }
        self.db.write(batch)?;

        *self.current_block.write() = block.clone();
        CHAIN_HEAD_NUMBER.set(block.number() as i64);
        if update_heads {
            self.hc.set_current_header(block.header().clone())?;
            *self.current_fast_block.write() = block.clone();
        }
        Ok(())
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn db(&self) -> &SharedStore {
        &self.db
    }

    pub fn state_cache(&self) -> &Arc<TrieDatabase> {
        &self.state_cache
    }

    pub fn feeds(&self) -> &ChainFeeds {
        &self.feeds
    }

    pub fn genesis(&self) -> Block {
        self.genesis_block.read().clone()
    }

    pub fn current_block(&self) -> Block {
        self.current_block.read().clone()
    }

    pub fn current_fast_block(&self) -> Block {
        self.current_fast_block.read().clone()
    }

    pub fn current_header(&self) -> Header {
        self.hc.current_header()
    }

    pub fn gas_limit(&self) -> u64 {
        self.current_block.read().gas_limit()
    }

    pub fn validator(&self) -> Arc<dyn Validator> {
        self.validator.read().clone()
    }

    pub fn set_validator(&self, validator: Arc<dyn Validator>) {
        *self.validator.write() = validator;
    }

    pub fn processor(&self) -> Arc<dyn Processor> {
        self.processor.read().clone()
    }

    pub fn set_processor(&self, processor: Arc<dyn Processor>) {
        *self.processor.write() = processor;
    }

    /// State at the current head.
    pub fn state(&self) -> Result<StateDb, StateError> {
        self.state_at(self.current_block().root())
    }

    pub fn state_at(&self, root: H256) -> Result<StateDb, StateError> {
        StateDb::new(root, self.state_cache.clone())
    }

    pub fn has_state(&self, root: &H256) -> bool {
        root.is_zero() || self.state_cache.has(root).unwrap_or(false)
    }

    pub fn get_body(&self, hash: &H256) -> Option<Body> {
        if let Some(body) = self.body_cache.get(hash) {
            return Some(body);
        }
        let number = self.hc.get_block_number(hash)?;
        let body = logged(schema::read_body(self.db.as_ref(), hash, number))?;
        self.body_cache.insert(*hash, body.clone());
        Some(body)
    }

    pub fn has_block(&self, hash: &H256, number: u64) -> bool {
        if self.block_cache.contains_key(hash) {
            return true;
        }
        logged(schema::has_body(self.db.as_ref(), hash, number).map(Some)).unwrap_or(false)
    }

    pub fn get_block(&self, hash: &H256, number: u64) -> Option<Block> {
        if let Some(block) = self.block_cache.get(hash) {
            return Some(block);
        }
        let block = logged(schema::read_block(self.db.as_ref(), hash, number))?;
        self.block_cache.insert(*hash, block.clone());
        Some(block)
    }

    pub fn get_block_by_hash(&self, hash: &H256) -> Option<Block> {
        let number = self.hc.get_block_number(hash)?;
        self.get_block(hash, number)
    }

    pub fn get_block_by_number(&self, number: u64) -> Option<Block> {
        let hash = self.get_canonical_hash(number)?;
        self.get_block(&hash, number)
    }

    pub fn get_canonical_hash(&self, number: u64) -> Option<H256> {
        logged(schema::read_canonical_hash(self.db.as_ref(), number))
    }

    pub fn get_receipts_by_hash(&self, hash: &H256) -> Option<Vec<Receipt>> {
        let number = self.hc.get_block_number(hash)?;
        logged(schema::read_receipts(self.db.as_ref(), hash, number))
    }

    pub fn get_tx_lookup_entry(&self, tx_hash: &H256) -> Option<TxLookupEntry> {
        logged(schema::read_tx_lookup_entry(self.db.as_ref(), tx_hash))
    }

    /// Up to `n` blocks starting at `hash` and walking to its ancestors.
    pub fn get_blocks_from_hash(&self, hash: &H256, n: usize) -> Vec<Block> {
        let mut out = Vec::new();
        let Some(mut number) = self.hc.get_block_number(hash) else {
            return out;
        };
        let mut hash = *hash;
        for _ in 0..n {
            let Some(block) = self.get_block(&hash, number) else {
                break;
            };
            hash = block.parent_hash();
            out.push(block);
            if number == 0 {
                break;
            }
            number -= 1;
        }
        out
    }

    /// Uncles of `block` and of its `length - 1` closest ancestors.
    pub fn get_uncles_in_chain(&self, block: &Block, length: usize) -> Vec<Header> {
        let mut uncles = Vec::new();
        let mut cursor = Some(block.clone());
        for _ in 0..length {
            let Some(current) = cursor else {
                break;
            };
            uncles.extend(current.uncles().iter().cloned());
            cursor = match current.number() {
                0 => None,
                n => self.get_block(&current.parent_hash(), n - 1),
            };
        }
        uncles
    }

    pub fn get_block_hashes_from_hash(&self, hash: &H256, max: u64) -> Vec<H256> {
        self.hc.get_block_hashes_from_hash(hash, max)
    }

    pub fn get_td(&self, hash: &H256, number: u64) -> Option<U256> {
        self.hc.get_td(hash, number)
    }

    pub fn get_td_by_hash(&self, hash: &H256) -> Option<U256> {
        self.hc.get_td_by_hash(hash)
    }

    pub fn has_header(&self, hash: &H256, number: u64) -> bool {
        self.hc.has_header(hash, number)
    }

    /// Most recent invalid blocks, oldest first.
    pub fn bad_blocks(&self) -> Vec<Block> {
        self.bad_blocks.lock().to_vec()
    }

    /// Blocks waiting for their timestamp or parent.
    pub fn future_block_count(&self) -> usize {
        self.future_blocks.len()
    }

    /// Stop background work, flush the most recent retained states to disk
    /// and release every cached state root.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        drop(self.quit.lock().take());
        self.proc_interrupt.store(true, Ordering::SeqCst);
        if let Some(handle) = self.updater.lock().take() {
            let _ = handle.join();
        }
        // Wait out an in-flight insert; later ones see the interrupt flag.
        let _guard = self.chainmu.lock();

        if !self.cache_config.disabled {
            let triedb = &self.state_cache;
            let number = self.current_block().number();
            for offset in [0, 1, self.cache_config.tries_in_memory.saturating_sub(1)] {
                if number > offset {
                    let Some(recent) = self.get_block_by_number(number - offset) else {
                        continue;
                    };
                    info!(
                        target: "chain",
                        block = recent.number(),
                        hash = %recent.hash(),
                        root = %recent.root(),
                        "writing cached state to disk"
                    );
                    if let Err(err) = triedb.commit(&recent.root()) {
                        error!(target: "chain", error = %err, "failed to commit recent state trie");
                    }
                }
            }
            for Reverse((_, root)) in self.triegc.lock().drain() {
                triedb.dereference(&root);
            }
            let size = triedb.size();
            if size != 0 {
                error!(target: "chain", size, "dangling trie nodes after full cleanup");
            }
            TRIE_CACHE_BYTES.set(size as i64);
        }
        info!(target: "chain", "blockchain manager stopped");
    }

    fn proc_future_blocks(&self) {
        let mut blocks: Vec<Block> = self
            .future_blocks
            .keys()
            .iter()
            .filter_map(|hash| self.future_blocks.peek(hash))
            .collect();
        if blocks.is_empty() {
            return;
        }
        blocks.sort_by_key(|b| b.number());
        for block in blocks {
            if let Err(err) = self.insert_chain(vec![block]) {
                debug!(target: "chain", error = %err, "queued block still not importable");
            }
        }
    }

    fn queue_future_block(&self, block: &Block) {
        self.future_blocks.insert(block.hash(), block.clone());
        CHAIN_FUTURE_BLOCKS.set(self.future_blocks.len() as i64);
    }

    /// Undo the last head moves for `hashes`, newest last. Used when a
    /// header-first import has to be abandoned.
    pub fn rollback(&self, hashes: &[H256]) -> Result<(), ChainError> {
        let _guard = self.mu.lock();
        for hash in hashes.iter().rev() {
            let Some(header) = self.get_header_by_hash(hash) else {
                continue;
            };
            let parent_number = header.number.saturating_sub(1);
            if self.hc.current_header().hash() == *hash {
                if let Some(parent) = self.get_header(&header.parent_hash, parent_number) {
                    self.hc.set_current_header(parent)?;
                }
            }
            if self.current_fast_block().hash() == *hash {
                if let Some(parent) = self.get_block(&header.parent_hash, parent_number) {
                    let mut batch = WriteBatch::new();
                    schema::write_head_fast_block_hash(&mut batch, &parent.hash());
                    self.db.write(batch)?;
                    *self.current_fast_block.write() = parent;
                }
            }
            if self.current_block().hash() == *hash {
                if let Some(parent) = self.get_block(&header.parent_hash, parent_number) {
                    let mut batch = WriteBatch::new();
                    schema::write_head_block_hash(&mut batch, &parent.hash());
                    self.db.write(batch)?;
                    CHAIN_HEAD_NUMBER.set(parent.number() as i64);
                    *self.current_block.write() = parent;
                }
            }
        }
        Ok(())
    }

    /// Fill in the lookup fields of receipts delivered without them.
    fn derive_receipt_fields(block: &Block, receipts: &[Receipt]) -> Vec<Receipt> {
        let mut out = receipts.to_vec();
        let mut log_index = 0u32;
        let mut prev_cumulative = 0u64;
        for (j, (receipt, tx)) in out.iter_mut().zip(block.transactions()).enumerate() {
            receipt.tx_hash = tx.hash();
            receipt.contract_address = match tx.to {
                None => Some(create_address(&tx.from, tx.nonce)),
                Some(_) => None,
            };
            receipt.gas_used = receipt.cumulative_gas_used.saturating_sub(prev_cumulative);
            prev_cumulative = receipt.cumulative_gas_used;
            for log in receipt.logs.iter_mut() {
                log.block_number = block.number();
                log.block_hash = block.hash();
                log.tx_hash = receipt.tx_hash;
                log.tx_index = j as u32;
                log.index = log_index;
                log_index += 1;
            }
        }
        out
    }

    /// Store bodies and receipts for blocks whose headers are already known,
    /// moving the fast-sync head forward when the batch outweighs it.
    pub fn insert_receipt_chain(&self, blocks: &[Block], receipts: &[Vec<Receipt>]) -> Result<usize, InsertError> {
        check_contiguous(blocks)?;
        if blocks.len() != receipts.len() {
            return Err(InsertError::new(
                0,
                ChainError::ReceiptCountMismatch {
                    blocks: blocks.len(),
                    receipts: receipts.len(),
                },
            ));
        }
        let start = Instant::now();
        let (mut stored, mut ignored) = (0usize, 0usize);

        for (i, (block, block_receipts)) in blocks.iter().zip(receipts).enumerate() {
            if self.proc_interrupt.load(Ordering::SeqCst) {
                debug!(target: "chain", "premature abort during receipts processing");
                return Ok(stored);
            }
            if !self.has_header(&block.hash(), block.number()) {
                return Err(InsertError::new(i, ChainError::UnknownBlock(block.hash())));
            }
            if self.has_block(&block.hash(), block.number()) {
                ignored += 1;
                continue;
            }
            let block_receipts = Self::derive_receipt_fields(block, block_receipts);
            let write = || -> Result<(), ChainError> {
                let mut batch = WriteBatch::new();
                schema::write_body(&mut batch, &block.hash(), block.number(), &block.body())?;
                schema::write_receipts(&mut batch, &block.hash(), block.number(), &block_receipts)?;
                schema::write_tx_lookup_entries(&mut batch, block)?;
                self.db.write(batch)?;
                Ok(())
            };
            write().map_err(|err| InsertError::new(i, err))?;
            stored += 1;
        }

        let Some(head) = blocks.last() else {
            return Ok(0);
        };
        {
            let _guard = self.mu.lock();
            let fast = self.current_fast_block();
            let fast_td = self.get_td(&fast.hash(), fast.number()).unwrap_or_default();
            let head_td = self.get_td(&head.hash(), head.number()).unwrap_or_default();
            if fast_td < head_td {
                let mut batch = WriteBatch::new();
                schema::write_head_fast_block_hash(&mut batch, &head.hash());
                self.db
                    .write(batch)
                    .map_err(|err| InsertError::new(blocks.len() - 1, err))?;
                *self.current_fast_block.write() = head.clone();
            }
        }
        info!(
            target: "chain",
            count = stored,
            elapsed = ?start.elapsed(),
            number = head.number(),
            hash = %head.hash(),
            ignored,
            "imported new block receipts"
        );
        Ok(stored)
    }

    /// Header-first import. Every `check_freq`-th seal (and the last one) is
    /// verified.
    pub fn insert_header_chain(&self, headers: &[Header], check_freq: usize) -> Result<usize, InsertError> {
        let start = Instant::now();
        let Some(me) = self.me.upgrade() else {
            return Err(InsertError::new(0, ChainError::Interrupted));
        };
        self.hc.validate_header_chain(me, headers, check_freq, &self.bad_hashes)?;

        let _guard = self.chainmu.lock();
        self.hc.insert_header_chain(
            headers,
            |header| {
                let _mu = self.mu.lock();
                self.hc.write_header(header)
            },
            start,
        )
    }

    /// Store a block with its total difficulty but no state, for side
    /// blocks on top of pruned ancestors.
    fn write_block_without_state(&self, block: &Block, td: U256) -> Result<(), ChainError> {
        let mut batch = WriteBatch::new();
        schema::write_td(&mut batch, &block.hash(), block.number(), &td)?;
        schema::write_block(&mut batch, block)?;
        self.db.write(batch)?;
        Ok(())
    }

    /// Persist a processed block and its state, then decide whether it
    /// becomes the head.
    fn write_block_with_state(&self, block: &Block, receipts: &[Receipt], state: &mut StateDb) -> Result<WriteStatus, ChainError> {
        let _guard = self.mu.lock();
        let (hash, number) = (block.hash(), block.number());

        let parent_td = self
            .get_td(&block.parent_hash(), number.wrapping_sub(1))
            .ok_or(ConsensusError::UnknownAncestor)?;
        let current = self.current_block();
        let local_td = self.get_td(&current.hash(), current.number()).unwrap_or_default();
        let external_td = parent_td + block.difficulty();

        let mut batch = WriteBatch::new();
        schema::write_td(&mut batch, &hash, number, &external_td)?;
        schema::write_block(&mut batch, block)?;
        schema::write_receipts(&mut batch, &hash, number, receipts)?;
        self.db.write(batch)?;

        let root = state.commit()?;
        self.retain_state(root, number)?;

        let status = if prefer_external(external_td, local_td, number, current.number()) {
            if block.parent_hash() != current.hash() {
                self.reorg(&current, block)?;
            }
            let mut batch = WriteBatch::new();
            schema::write_tx_lookup_entries(&mut batch, block)?;
            self.db.write(batch)?;
            self.insert(block)?;
            WriteStatus::CanonStat
        } else {
            WriteStatus::SideStat
        };

        if self.future_blocks.remove(&hash).is_some() {
            CHAIN_FUTURE_BLOCKS.set(self.future_blocks.len() as i64);
        }
        Ok(status)
    }

    /// Keep the state `root` of block `number` referenced in memory and
    /// release roots that fell out of the retention window, flushing to disk
    /// when the cache grows too large or has been dirty for too long.
    fn retain_state(&self, root: H256, number: u64) -> Result<(), ChainError> {
        let triedb = &self.state_cache;
        if self.cache_config.disabled {
            triedb.commit(&root)?;
            return Ok(());
        }
        triedb.reference(&root);
        self.triegc.lock().push(Reverse((number, root)));

        let tries = self.cache_config.tries_in_memory;
        if number > tries {
            let limit = self.cache_config.trie_node_limit_bytes();
            if triedb.size() > limit {
                warn!(target: "chain", size = triedb.size(), limit, "trie cache above limit, flushing oldest nodes");
                triedb.cap(limit.saturating_sub(IDEAL_BATCH_SIZE))?;
            }
            let chosen = number - tries;

            let mut gc_proc = self.gc_proc.lock();
            let time_limit = self.cache_config.trie_time_limit();
            if *gc_proc > time_limit {
                match self.get_header_by_number(chosen) {
                    None => {
                        warn!(target: "chain", number = chosen, "reorg in progress, trie commit postponed");
                    }
                    Some(header) => {
                        let last_write = self.last_write.load(Ordering::SeqCst);
                        if chosen < last_write + tries && *gc_proc >= time_limit * 2 {
                            info!(
                                target: "chain",
                                time = ?*gc_proc,
                                allowance = ?time_limit,
                                optimum = (chosen - last_write) as f64 / tries as f64,
                                "state in memory for too long, committing"
                            );
                        }
                        triedb.commit(&header.state_root)?;
                        self.last_write.store(chosen, Ordering::SeqCst);
                        *gc_proc = Duration::ZERO;
                    }
                }
            }
            drop(gc_proc);

            let mut heap = self.triegc.lock();
            while let Some(Reverse((n, old_root))) = heap.pop() {
                if n > chosen {
                    heap.push(Reverse((n, old_root)));
                    break;
                }
                triedb.dereference(&old_root);
            }
        }
        TRIE_CACHE_BYTES.set(triedb.size() as i64);
        Ok(())
    }

    /// Switch the canonical chain from `old_head` to `new_head`: rewrite the
    /// number→hash mappings, drop lookup entries of transactions that did not
    /// survive and announce removed logs and transactions.
    fn reorg(&self, old_head: &Block, new_head: &Block) -> Result<(), ChainError> {
        let mut old_chain: Vec<Block> = Vec::new();
        let mut new_chain: Vec<Block> = Vec::new();
        let mut deleted_txs = Vec::new();
        let mut deleted_logs: Vec<Log> = Vec::new();

        let collect_logs = |block: &Block, into: &mut Vec<Log>| {
            if let Some(receipts) = logged(schema::read_receipts(self.db.as_ref(), &block.hash(), block.number())) {
                for receipt in receipts {
                    into.extend(receipt.logs.into_iter().map(|mut log| {
                        log.removed = true;
                        log
                    }));
                }
            }
        };
        let parent_of = |block: &Block, which: &'static str| -> Result<Block, ChainError> {
            let number = block.number().checked_sub(1).ok_or(ChainError::InvalidReorgChain(which))?;
            self.get_block(&block.parent_hash(), number)
                .ok_or(ChainError::InvalidReorgChain(which))
        };

        let (mut old, mut new) = (old_head.clone(), new_head.clone());
        // Bring both sides to the same height.
        while old.number() > new.number() {
            deleted_txs.extend(old.transactions().iter().cloned());
            collect_logs(&old, &mut deleted_logs);
            let parent = parent_of(&old, "old")?;
            old_chain.push(std::mem::replace(&mut old, parent));
        }
        while new.number() > old.number() {
            let parent = parent_of(&new, "new")?;
            new_chain.push(std::mem::replace(&mut new, parent));
        }
        // Step both back until they meet.
        while old.hash() != new.hash() {
            deleted_txs.extend(old.transactions().iter().cloned());
            collect_logs(&old, &mut deleted_logs);
            let old_parent = parent_of(&old, "old")?;
            let new_parent = parent_of(&new, "new")?;
            old_chain.push(std::mem::replace(&mut old, old_parent));
            new_chain.push(std::mem::replace(&mut new, new_parent));
        }
        let common = old;

        if !old_chain.is_empty() && !new_chain.is_empty() {
            let dropped = old_chain.len();
            if dropped > REORG_WARN_DEPTH {
                warn!(
                    target: "chain::reorg",
                    number = common.number(),
                    hash = %common.hash(),
                    drop = dropped,
                    dropfrom = %old_chain[0].hash(),
                    add = new_chain.len(),
                    addfrom = %new_chain[0].hash(),
                    "chain split detected"
                );
            } else {
                debug!(
                    target: "chain::reorg",
                    number = common.number(),
                    hash = %common.hash(),
                    drop = dropped,
                    dropfrom = %old_chain[0].hash(),
                    add = new_chain.len(),
                    addfrom = %new_chain[0].hash(),
                    "chain split detected"
                );
            }
            CHAIN_REORGS.inc();
            CHAIN_REORG_DROPPED.inc_by(dropped as u64);
        } else {
            error!(
                target: "chain::reorg",
                oldnum = old_head.number(),
                oldhash = %old_head.hash(),
                newnum = new_head.number(),
                newhash = %new_head.hash(),
                "impossible reorg, please file an issue"
            );
        }

        // Canonical entries above the new head belong to the old chain.
        let mut batch = WriteBatch::new();
        for n in (new_head.number() + 1)..=old_head.number() {
            schema::delete_canonical_hash(&mut batch, n);
        }
        self.db.write(batch)?;

        // Re-link the new side bottom-up (the new head itself is linked by
        // the caller, but is harmless to include).
        let mut added_txs = Vec::new();
        for block in new_chain.iter().rev() {
            self.insert(block)?;
            let mut batch = WriteBatch::new();
            schema::write_tx_lookup_entries(&mut batch, block)?;
            self.db.write(batch)?;
            added_txs.extend(block.transactions().iter().cloned());
        }

        let diff = tx_difference(&deleted_txs, &added_txs);
        let mut batch = WriteBatch::new();
        for tx in &diff {
            schema::delete_tx_lookup_entry(&mut batch, &tx.hash());
        }
        self.db.write(batch)?;

        if !deleted_logs.is_empty() {
            self.feeds.send_removed_logs(RemovedLogsEvent { logs: deleted_logs });
        }
        for block in old_chain {
            self.feeds.send_side(ChainSideEvent { block });
        }
        if !diff.is_empty() {
            self.feeds.send_removed_txs(RemovedTransactionsEvent { txs: diff });
        }
        Ok(())
    }

    fn report_block(&self, block: &Block, err: &ChainError) {
        self.bad_blocks.lock().push(block.clone());
        CHAIN_BAD_BLOCKS.inc();
        error!(
            target: "chain",
            number = block.number(),
            hash = %block.hash(),
            txs = block.transactions().len(),
            error = %err,
            "bad block"
        );
    }

    /// Import a contiguous batch of blocks. Returns the number of blocks
    /// consumed; on failure the error carries the index of the offending
    /// block and nothing from that block on was written.
    pub fn insert_chain(&self, chain: Vec<Block>) -> Result<usize, InsertError> {
        check_contiguous(&chain)?;
        let mut events = Vec::new();
        let mut logs = Vec::new();
        let res = self.insert_chain_locked(&chain, &mut events, &mut logs);
        self.feeds.send_pending(events, logs);
        res
    }

    fn insert_chain_locked(&self, chain: &[Block], events: &mut Vec<PendingEvent>, logs: &mut Vec<Log>) -> Result<usize, InsertError> {
        if chain.is_empty() {
            return Ok(0);
        }
        let Some(me) = self.me.upgrade() else {
            return Err(InsertError::new(0, ChainError::Interrupted));
        };
        let mut guard = self.chainmu.lock();
        let mut stats = InsertStats::new();
        let mut last_canon: Option<Block> = None;
        let mut consumed = chain.len();

        let headers: Vec<Header> = chain.iter().map(|b| b.header().clone()).collect();
        let seals = vec![true; chain.len()];
        let mut results = self.engine.clone().verify_headers(me, headers, seals);

        for (i, block) in chain.iter().enumerate() {
            if self.proc_interrupt.load(Ordering::SeqCst) {
                debug!(target: "chain", "premature abort during blocks processing");
                consumed = i;
                break;
            }
            if self.bad_hashes.contains(&block.hash()) {
                let err = ChainError::BlacklistedHash(block.hash());
                self.report_block(block, &err);
                return Err(InsertError::new(i, err));
            }
            let bstart = Instant::now();

            let verified: Result<(), ChainError> = match results.next_result() {
                Some(res) => res.map_err(ChainError::from),
                None => Err(ChainError::Interrupted),
            };
            let checked = verified.and_then(|()| {
                self.validator()
                    .validate_body(self, block)
                    .map_err(ChainError::from)
            });

            if let Err(err) = checked {
                if err.is_known_block() {
                    stats.ignored += 1;
                    continue;
                }
                if err.is_future_block() {
                    let max = unix_now() + MAX_TIME_FUTURE_BLOCKS;
                    if block.time() > max {
                        return Err(InsertError::new(
                            i,
                            ChainError::FutureBlockTooFar {
                                time: block.time(),
                                max,
                            },
                        ));
                    }
                    self.queue_future_block(block);
                    stats.queued += 1;
                    continue;
                }
                if err.is_unknown_ancestor() && self.future_blocks.contains_key(&block.parent_hash()) {
                    self.queue_future_block(block);
                    stats.queued += 1;
                    continue;
                }
                if !err.is_pruned_ancestor() {
                    self.report_block(block, &err);
                    return Err(InsertError::new(i, err));
                }

                // Parent state was pruned. Only resurrect it once this side
                // outweighs the canonical chain.
                let current = self.current_block();
                let local_td = self.get_td(&current.hash(), current.number()).unwrap_or_default();
                let parent_td = self
                    .get_td(&block.parent_hash(), block.number().saturating_sub(1))
                    .unwrap_or_default();
                let external_td = parent_td + block.difficulty();
                if local_td > external_td {
                    self.write_block_without_state(block, external_td)
                        .map_err(|err| InsertError::new(i, err))?;
                    continue;
                }
                let winner = self.pruned_suffix(block).map_err(|err| InsertError::new(i, err))?;
                debug!(target: "chain", blocks = winner.len(), number = block.number(), "reimporting pruned ancestors");
                let res = MutexGuard::unlocked(&mut guard, || self.insert_chain_locked(&winner, events, logs));
                if let Err(err) = res {
                    return Err(InsertError::new(i, err.source));
                }
                if self.proc_interrupt.load(Ordering::SeqCst) {
                    consumed = i;
                    break;
                }
            }

            let parent = if i == 0 {
                self.get_block(&block.parent_hash(), block.number().wrapping_sub(1))
            } else {
                Some(chain[i - 1].clone())
            };
            let parent = parent.ok_or_else(|| InsertError::new(i, ConsensusError::UnknownAncestor))?;
            let mut state = self.state_at(parent.root()).map_err(|err| InsertError::new(i, err))?;

            let output = match self.processor().process(self, block, &mut state) {
                Ok(output) => output,
                Err(err) => {
                    self.report_block(block, &err);
                    return Err(InsertError::new(i, err));
                }
            };
            if let Err(err) =
                self.validator()
                    .validate_state(block, &parent, &state, &output.receipts, output.used_gas)
            {
                let err = ChainError::from(err);
                self.report_block(block, &err);
                return Err(InsertError::new(i, err));
            }
            let proc_time = bstart.elapsed();

            let status = self
                .write_block_with_state(block, &output.receipts, &mut state)
                .map_err(|err| InsertError::new(i, err))?;
            match status {
                WriteStatus::CanonStat => {
                    debug!(
                        target: "chain",
                        number = block.number(),
                        hash = %block.hash(),
                        uncles = block.uncles().len(),
                        txs = block.transactions().len(),
                        gas = block.gas_used(),
                        elapsed = ?bstart.elapsed(),
                        "inserted new block"
                    );
                    logs.extend(output.logs.iter().cloned());
                    events.push(PendingEvent::Chain(ChainEvent {
                        block: block.clone(),
                        hash: block.hash(),
                        logs: output.logs,
                    }));
                    last_canon = Some(block.clone());
                    *self.gc_proc.lock() += proc_time;
                }
                WriteStatus::SideStat => {
                    debug!(
                        target: "chain",
                        number = block.number(),
                        hash = %block.hash(),
                        diff = %block.difficulty(),
                        elapsed = ?bstart.elapsed(),
                        txs = block.transactions().len(),
                        gas = block.gas_used(),
                        uncles = block.uncles().len(),
                        "inserted forked block"
                    );
                    events.push(PendingEvent::Side(ChainSideEvent { block: block.clone() }));
                }
                WriteStatus::NonStat => {}
            }
            CHAIN_INSERTS.observe(bstart.elapsed().as_secs_f64());
            stats.processed += 1;
            stats.used_gas += output.used_gas;
            stats.report(chain, i, self.state_cache.size());
        }

        if let Some(last) = last_canon {
            if self.current_block().hash() == last.hash() {
                events.push(PendingEvent::Head(ChainHeadEvent { block: last }));
            }
        }
        Ok(consumed)
    }

    /// Ancestors of `block` back to (excluding) the nearest one whose state
    /// is still available, oldest first.
    fn pruned_suffix(&self, block: &Block) -> Result<Vec<Block>, ChainError> {
        let mut winner = Vec::new();
        let mut parent = self
            .get_block(&block.parent_hash(), block.number().wrapping_sub(1))
            .ok_or(ChainError::InvalidReorgChain("new"))?;
        while !self.has_state(&parent.root()) {
            let number = parent.number().checked_sub(1).ok_or(ChainError::InvalidReorgChain("new"))?;
            let next = self
                .get_block(&parent.parent_hash(), number)
                .ok_or(ChainError::InvalidReorgChain("new"))?;
            winner.push(std::mem::replace(&mut parent, next));
        }
        winner.reverse();
        Ok(winner)
    }
}

/// Read back a stream written by [`BlockChain::export_n`].
pub fn decode_exported<R: Read>(mut r: R) -> Result<Vec<Block>, StoreError> {
    let mut blocks = Vec::new();
    loop {
        match bincode::deserialize_from::<_, Block>(&mut r) {
            Ok(block) => blocks.push(block),
            Err(err) => {
                if let bincode::ErrorKind::Io(io) = err.as_ref() {
                    if io.kind() == std::io::ErrorKind::UnexpectedEof {
                        break;
                    }
                }
                return Err(err.into());
            }
        }
    }
    Ok(blocks)
}

impl ChainReader for BlockChain {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    fn current_header(&self) -> Header {
        self.hc.current_header()
    }

    fn get_header(&self, hash: &H256, number: u64) -> Option<Header> {
        self.hc.get_header(hash, number)
    }

    fn get_header_by_number(&self, number: u64) -> Option<Header> {
        self.hc.get_header_by_number(number)
    }

    fn get_header_by_hash(&self, hash: &H256) -> Option<Header> {
        self.hc.get_header_by_hash(hash)
    }

    fn get_block(&self, hash: &H256, number: u64) -> Option<Block> {
        BlockChain::get_block(self, hash, number)
    }
}

impl ChainStateReader for BlockChain {
    fn has_block(&self, hash: &H256, number: u64) -> bool {
        BlockChain::has_block(self, hash, number)
    }

    fn has_state(&self, root: &H256) -> bool {
        BlockChain::has_state(self, root)
    }

    fn as_chain_reader(&self) -> &dyn ChainReader {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::chain_makers::generate_chain;
    use crate::chain::genesis::Genesis;
    use crate::chain::processor::TransferExecutor;
    use crate::consensus_pow::PowEngine;
    use crate::store::MemoryStore;

    fn new_chain(cache: CacheConfig) -> (Arc<BlockChain>, Block) {
        let db = MemoryStore::shared();
        let genesis = Genesis::default().commit(&db).unwrap();
        let bc = BlockChain::new(
            db,
            cache,
            ChainConfig::default(),
            Arc::new(PowEngine::faker()),
            Arc::new(TransferExecutor),
        )
        .unwrap();
        (bc, genesis)
    }

    #[test]
    fn number_wraparound_is_not_contiguous() {
        let last = Block::from_header(Header {
            number: u64::MAX,
            ..Header::default()
        });
        let wrapped = Block::from_header(Header {
            number: 0,
            parent_hash: last.hash(),
            ..Header::default()
        });
        let err = check_contiguous(&[last, wrapped]).unwrap_err();
        assert_eq!(err.index, 1);
        assert!(matches!(err.source, ChainError::NonContiguous { prev_number: u64::MAX, .. }));
    }

    fn make(bc: &BlockChain, parent: &Block, n: usize, seed: u8) -> Vec<Block> {
        let (blocks, _) = generate_chain(
            bc,
            parent,
            bc.engine().as_ref(),
            bc.state_cache().clone(),
            &TransferExecutor,
            n,
            |_, gen| gen.set_extra(vec![seed]),
        )
        .unwrap();
        blocks
    }

    #[test]
    fn reopening_restores_heads() {
        let db = MemoryStore::shared();
        Genesis::default().commit(&db).unwrap();
        let open = |db: SharedStore| {
            BlockChain::new(
                db,
                CacheConfig {
                    disabled: true,
                    ..CacheConfig::default()
                },
                ChainConfig::default(),
                Arc::new(PowEngine::faker()),
                Arc::new(TransferExecutor),
            )
            .unwrap()
        };
        let bc = open(db.clone());
        let blocks = make(&bc, &bc.genesis(), 4, 0);
        bc.insert_chain(blocks.clone()).unwrap();
        bc.stop();
        drop(bc);

        let again = open(db);
        assert_eq!(again.current_block().hash(), blocks[3].hash());
        assert_eq!(again.current_header().hash(), blocks[3].hash());
        assert_eq!(again.current_fast_block().hash(), blocks[3].hash());
        again.stop();
    }

    #[test]
    fn set_head_rewinds_blocks_and_mappings() {
        let (bc, genesis) = new_chain(CacheConfig {
            disabled: true,
            ..CacheConfig::default()
        });
        let blocks = make(&bc, &genesis, 6, 0);
        bc.insert_chain(blocks.clone()).unwrap();

        bc.set_head(3).unwrap();
        assert_eq!(bc.current_block().hash(), blocks[2].hash());
        assert_eq!(bc.current_header().number, 3);
        assert!(bc.get_block_by_number(4).is_none());
        assert!(bc.get_block(&blocks[5].hash(), 6).is_none());

        // The rewound blocks import again.
        assert_eq!(bc.insert_chain(blocks[3..].to_vec()).unwrap(), 3);
        assert_eq!(bc.current_block().hash(), blocks[5].hash());
        bc.stop();
    }

    #[test]
    fn known_blocks_are_skipped() {
        let (bc, genesis) = new_chain(CacheConfig::default());
        let blocks = make(&bc, &genesis, 3, 0);
        bc.insert_chain(blocks.clone()).unwrap();
        let mut heads = bc.feeds().subscribe_head();
        assert_eq!(bc.insert_chain(blocks.clone()).unwrap(), 3);
        assert!(heads.try_recv().is_err());
        assert_eq!(bc.current_block().hash(), blocks[2].hash());
        bc.stop();
    }

    #[test]
    fn export_roundtrip_and_helpers() {
        let (bc, genesis) = new_chain(CacheConfig::default());
        let blocks = make(&bc, &genesis, 5, 0);
        bc.insert_chain(blocks.clone()).unwrap();

        let mut buf = Vec::new();
        bc.export_n(&mut buf, 1, 3).unwrap();
        let decoded = decode_exported(buf.as_slice()).unwrap();
        assert_eq!(decoded.iter().map(|b| b.hash()).collect::<Vec<_>>(), vec![
            blocks[0].hash(),
            blocks[1].hash(),
            blocks[2].hash()
        ]);
        assert!(matches!(bc.export_n(&mut buf, 4, 2), Err(ChainError::InvalidRange { .. })));

        let back = bc.get_blocks_from_hash(&blocks[4].hash(), 3);
        assert_eq!(back.len(), 3);
        assert_eq!(back[2].hash(), blocks[2].hash());
        assert_eq!(bc.get_block_hashes_from_hash(&blocks[4].hash(), 2), vec![blocks[3].hash(), blocks[2].hash()]);
        assert!(bc.get_uncles_in_chain(&blocks[4], 5).is_empty());
        assert_eq!(bc.get_receipts_by_hash(&blocks[0].hash()), Some(vec![]));
        bc.stop();
    }

    #[test]
    fn rollback_moves_heads_back() {
        let (bc, genesis) = new_chain(CacheConfig::default());
        let blocks = make(&bc, &genesis, 3, 0);
        bc.insert_chain(blocks.clone()).unwrap();
        bc.rollback(&[blocks[1].hash(), blocks[2].hash()]).unwrap();
        assert_eq!(bc.current_block().hash(), blocks[0].hash());
        assert_eq!(bc.current_header().hash(), blocks[0].hash());
        assert_eq!(bc.current_fast_block().hash(), blocks[0].hash());
        bc.stop();
    }

    #[test]
    fn header_and_receipt_import_advance_fast_head() {
        let (source, genesis) = new_chain(CacheConfig::default());
        let blocks = make(&source, &genesis, 4, 0);
        source.insert_chain(blocks.clone()).unwrap();
        let receipts: Vec<Vec<Receipt>> = blocks
            .iter()
            .map(|b| source.get_receipts_by_hash(&b.hash()).unwrap())
            .collect();

        let (bc, _) = new_chain(CacheConfig::default());
        let headers: Vec<Header> = blocks.iter().map(|b| b.header().clone()).collect();
        assert_eq!(bc.insert_header_chain(&headers, 1).unwrap(), 4);
        assert_eq!(bc.current_header().hash(), blocks[3].hash());
        assert_eq!(bc.current_block().number(), 0);

        assert_eq!(bc.insert_receipt_chain(&blocks, &receipts).unwrap(), 4);
        assert_eq!(bc.current_fast_block().hash(), blocks[3].hash());
        assert!(bc.get_body(&blocks[2].hash()).is_some());

        // Receipts for a header never seen are rejected.
        let stray = make(&source, &blocks[3], 1, 9);
        let err = bc.insert_receipt_chain(&stray, &[vec![]]).unwrap_err();
        assert!(matches!(err.source, ChainError::UnknownBlock(_)));
        source.stop();
        bc.stop();
    }

    #[test]
    fn blacklisted_block_is_refused() {
        let db = MemoryStore::shared();
        let genesis = Genesis::default().commit(&db).unwrap();
        let probe = BlockChain::new(
            MemoryStore::shared(),
            CacheConfig::default(),
            ChainConfig::default(),
            Arc::new(PowEngine::faker()),
            Arc::new(TransferExecutor),
        );
        assert!(matches!(probe, Err(ChainError::NoGenesis)));

        let pre = BlockChain::new(
            db.clone(),
            CacheConfig::default(),
            ChainConfig::default(),
            Arc::new(PowEngine::faker()),
            Arc::new(TransferExecutor),
        )
        .unwrap();
        let blocks = make(&pre, &genesis, 2, 0);
        pre.stop();

        let bc = BlockChain::with_blacklist(
            db,
            CacheConfig::default(),
            ChainConfig::default(),
            Arc::new(PowEngine::faker()),
            Arc::new(TransferExecutor),
            [blocks[1].hash()].into_iter().collect(),
        )
        .unwrap();
        let err = bc.insert_chain(blocks.clone()).unwrap_err();
        assert_eq!(err.index, 1);
        assert!(matches!(err.source, ChainError::BlacklistedHash(_)));
        assert_eq!(bc.current_block().hash(), blocks[0].hash());
        assert_eq!(bc.bad_blocks().len(), 1);
        bc.stop();
    }
}
