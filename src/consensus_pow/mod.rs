//! Proof-of-work consensus engine.
//!
//! Headers are sealed by searching a nonce whose epoch hash over the full
//! per-epoch dataset meets `2^256 / difficulty`, and verified with the much
//! smaller per-epoch cache. Caches and datasets are generated lazily, kept in
//! small LRUs, optionally persisted as memory-mapped dumps, and the next
//! epoch is always prepared in the background.

pub mod algorithm;
pub mod difficulty;
pub mod dump;
pub mod epoch_cache;
mod sealer;
mod sizes;

pub use algorithm::seed_hash;
pub use epoch_cache::{EpochItem, GenerateOpts, ItemKind};

use crate::config::{MinerConfig, PowConfig, PowMode, PowParams};
use crate::consensus::{batch_parent, ApiDescriptor, ChainReader, Engine};
use crate::errors::ConsensusError;
use crate::miner::stats::HashrateMeter;
use crate::metrics;
use crate::state::StateDb;
use crate::types::{Address, Block, Header, Receipt, Transaction, H256};
use algorithm::{dataset_size, hashimoto_light, EPOCH_LENGTH, TEST_DATASET_BYTES};
use crossbeam_channel::{Receiver, Sender};
use epoch_cache::EpochLru;
use primitive_types::U256;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, warn};

/// Seconds a header may be ahead of the local clock.
pub const ALLOWED_FUTURE_BLOCK_TIME: u64 = 15;
/// Uncles a block may include.
pub const MAX_UNCLES: usize = 2;
/// Generations back an uncle's parent may be.
const UNCLE_DEPTH: usize = 7;
const MAX_GAS_LIMIT: u64 = 0x7fff_ffff_ffff_ffff;
const MIN_GAS_LIMIT: u64 = 5000;
const GAS_LIMIT_BOUND_DIVISOR: u64 = 1024;

/// Dump retention used by the standalone generators.
const KEEP_ALL_DUMPS: usize = i32::MAX as usize;

pub struct PowEngine {
    config: PowConfig,
    caches: EpochLru,
    datasets: EpochLru,

    threads: AtomicI32,
    update_tx: Sender<()>,
    update_rx: Receiver<()>,
    hashrate: HashrateMeter,

    shared: Option<Arc<PowEngine>>,
    fake_fail: Option<u64>,
    fake_delay: Duration,
}

impl PowEngine {
    pub fn new(config: PowConfig) -> Self {
        if config.mode == PowMode::Shared {
            let backing = PowConfig {
                mode: PowMode::Normal,
                ..config.clone()
            };
            return Self::shared(Arc::new(Self::new(backing)));
        }
        if config.caches_in_mem == 0 {
            warn!(target: "pow", "one cache in memory is required, raising limit");
        }
        let (update_tx, update_rx) = crossbeam_channel::bounded(0);
        Self {
            caches: EpochLru::new(ItemKind::Cache, config.caches_in_mem.max(1)),
            datasets: EpochLru::new(ItemKind::Dataset, config.datasets_in_mem.max(1)),
            config,
            threads: AtomicI32::new(0),
            update_tx,
            update_rx,
            hashrate: HashrateMeter::default(),
            shared: None,
            fake_fail: None,
            fake_delay: Duration::ZERO,
        }
    }

    /// Engine delegating all hashing to `backing`, so every node in a process
    /// shares one set of caches and datasets.
    pub fn shared(backing: Arc<PowEngine>) -> Self {
        let mut engine = Self::new(PowConfig {
            mode: PowMode::Normal,
            caches_in_mem: 1,
            datasets_in_mem: 1,
            ..PowConfig::default()
        });
        engine.config.mode = PowMode::Shared;
        engine.shared = Some(backing);
        engine
    }

    /// Real hashing over tiny caches and datasets.
    pub fn tester() -> Self {
        Self::new(PowConfig {
            cache_dir: None,
            caches_in_mem: 1,
            caches_on_disk: 0,
            dataset_dir: None,
            datasets_in_mem: 1,
            datasets_on_disk: 0,
            mode: PowMode::Test,
        })
    }

    /// Accepts every seal; all other header rules still apply.
    pub fn faker() -> Self {
        Self::fake(PowMode::Fake)
    }

    /// Like [`PowEngine::faker`], but the seal of block `fail` is rejected.
    pub fn fake_failer(fail: u64) -> Self {
        let mut engine = Self::fake(PowMode::Fake);
        engine.fake_fail = Some(fail);
        engine
    }

    /// Like [`PowEngine::faker`], but seal verification takes `delay`.
    pub fn fake_delayer(delay: Duration) -> Self {
        let mut engine = Self::fake(PowMode::Fake);
        engine.fake_delay = delay;
        engine
    }

    /// Accepts every header without checking anything.
    pub fn full_faker() -> Self {
        Self::fake(PowMode::FullFake)
    }

    fn fake(mode: PowMode) -> Self {
        Self::new(PowConfig {
            caches_on_disk: 0,
            datasets_on_disk: 0,
            mode,
            ..PowConfig::default()
        })
    }

    pub fn mode(&self) -> PowMode {
        self.config.mode
    }

    fn is_test(&self) -> bool {
        self.config.mode == PowMode::Test
    }

    /// Verification cache for the epoch of `block`, generating it when
    /// needed and scheduling the next epoch in the background.
    pub fn cache(&self, block: u64) -> Arc<EpochItem> {
        let epoch = block / EPOCH_LENGTH;
        let (item, future) = self.caches.get(epoch);
        let (dir, on_disk) = (self.config.cache_dir.as_deref(), self.config.caches_on_disk);
        item.generate(GenerateOpts {
            dir,
            on_disk,
            test: self.is_test(),
        });
        if let Some(future) = future {
            spawn_generate(future, dir.map(Path::to_path_buf), on_disk, self.is_test());
        }
        item
    }

    /// Mining dataset for the epoch of `block`; same lookahead as the cache.
    pub fn dataset(&self, block: u64) -> Arc<EpochItem> {
        let epoch = block / EPOCH_LENGTH;
        let (item, future) = self.datasets.get(epoch);
        let (dir, on_disk) = (self.config.dataset_dir.as_deref(), self.config.datasets_on_disk);
        item.generate(GenerateOpts {
            dir,
            on_disk,
            test: self.is_test(),
        });
        if let Some(future) = future {
            spawn_generate(future, dir.map(Path::to_path_buf), on_disk, self.is_test());
        }
        item
    }

    /// Configured mining threads: 0 means one per CPU, negative disables
    /// the search.
    pub fn threads(&self) -> i32 {
        if let Some(shared) = &self.shared {
            return shared.threads();
        }
        self.threads.load(Ordering::SeqCst)
    }

    /// Change the mining thread count. A running seal restarts with the new
    /// count.
    pub fn set_threads(&self, threads: i32) {
        if let Some(shared) = &self.shared {
            shared.set_threads(threads);
            return;
        }
        self.threads.store(threads, Ordering::SeqCst);
        let _ = self.update_tx.try_send(());
    }

    /// Apply the miner section of the node configuration.
    pub fn configure_miner(&self, cfg: &MinerConfig) {
        self.set_threads(cfg.threads as i32);
    }

    /// Measured hashes per second of the local search threads.
    pub fn hashrate(&self) -> f64 {
        if let Some(shared) = &self.shared {
            return shared.hashrate();
        }
        let rate = self.hashrate.rate();
        metrics::POW_HASHRATE.set(rate);
        rate
    }

    fn params(chain: &dyn ChainReader) -> PowParams {
        chain.config().pow.clone().unwrap_or_default()
    }

    /// Check the mix digest and the target of a sealed header.
    fn check_seal(&self, header: &Header) -> Result<(), ConsensusError> {
        if matches!(self.config.mode, PowMode::Fake | PowMode::FullFake) {
            if !self.fake_delay.is_zero() {
                std::thread::sleep(self.fake_delay);
            }
            if self.fake_fail == Some(header.number) {
                return Err(ConsensusError::InvalidPow);
            }
            return Ok(());
        }
        if let Some(shared) = &self.shared {
            return shared.check_seal(header);
        }
        if header.difficulty.is_zero() {
            return Err(ConsensusError::NonPositiveDifficulty);
        }

        let number = header.number;
        let cache = self.cache(number);
        let words = cache
            .words()
            .ok_or_else(|| ConsensusError::Unsealable(format!("cache for epoch {} unavailable", cache.epoch())))?;
        let size = if self.is_test() { TEST_DATASET_BYTES } else { dataset_size(number) };
        let (digest, result) = hashimoto_light(size, words, &header.hash_no_nonce().0, header.nonce.to_u64());

        if digest != header.mix_digest.0 {
            return Err(ConsensusError::InvalidMixDigest);
        }
        if !difficulty::meets_target(&result, header.difficulty) {
            return Err(ConsensusError::InvalidPow);
        }
        Ok(())
    }

    /// Header rules against a known parent.
    fn verify_against(
        &self,
        chain: &dyn ChainReader,
        header: &Header,
        parent: &Header,
        uncle: bool,
        seal: bool,
    ) -> Result<(), ConsensusError> {
        if header.extra.len() > crate::config::miner::MAX_EXTRA_DATA {
            return Err(ConsensusError::ExtraTooLong {
                len: header.extra.len(),
                max: crate::config::miner::MAX_EXTRA_DATA,
            });
        }
        if !uncle && header.time > unix_now() + ALLOWED_FUTURE_BLOCK_TIME {
            return Err(ConsensusError::FutureBlock);
        }
        if header.time <= parent.time {
            return Err(ConsensusError::InvalidTimestamp);
        }

        let expected = self.calc_difficulty(chain, header.time, parent);
        if expected != header.difficulty {
            return Err(ConsensusError::InvalidDifficulty {
                have: header.difficulty,
                want: expected,
            });
        }

        if header.gas_limit > MAX_GAS_LIMIT {
            return Err(ConsensusError::InvalidGasLimit(format!(
                "have {}, max {}",
                header.gas_limit, MAX_GAS_LIMIT
            )));
        }
        if header.gas_used > header.gas_limit {
            return Err(ConsensusError::InvalidGasUsed {
                used: header.gas_used,
                limit: header.gas_limit,
            });
        }
        let diff = header.gas_limit.abs_diff(parent.gas_limit);
        let limit = parent.gas_limit / GAS_LIMIT_BOUND_DIVISOR;
        if diff >= limit || header.gas_limit < MIN_GAS_LIMIT {
            return Err(ConsensusError::InvalidGasLimit(format!(
                "have {}, want {} += {}",
                header.gas_limit, parent.gas_limit, limit
            )));
        }

        if header.number != parent.number + 1 {
            return Err(ConsensusError::InvalidNumber);
        }
        if seal {
            self.check_seal(header)?;
        }
        Ok(())
    }
}

fn spawn_generate(item: Arc<EpochItem>, dir: Option<PathBuf>, on_disk: usize, test: bool) {
    let spawned = std::thread::Builder::new()
        .name(format!("pow-{}", item.epoch()))
        .spawn(move || {
            item.generate(GenerateOpts {
                dir: dir.as_deref(),
                on_disk,
                test,
            });
        });
    if let Err(e) = spawned {
        error!(target: "pow", error = %e, "failed to spawn lookahead generation");
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Generate the verification cache for the epoch of `block` into `dir`.
pub fn make_cache(block: u64, dir: &Path) -> Arc<EpochItem> {
    let item = Arc::new(EpochItem::new(ItemKind::Cache, block / EPOCH_LENGTH));
    item.generate(GenerateOpts {
        dir: Some(dir),
        on_disk: KEEP_ALL_DUMPS,
        test: false,
    });
    item
}

/// Generate the mining dataset for the epoch of `block` into `dir`.
pub fn make_dataset(block: u64, dir: &Path) -> Arc<EpochItem> {
    let item = Arc::new(EpochItem::new(ItemKind::Dataset, block / EPOCH_LENGTH));
    item.generate(GenerateOpts {
        dir: Some(dir),
        on_disk: KEEP_ALL_DUMPS,
        test: false,
    });
    item
}

/// Credit the coinbase with the block reward plus inclusion bonuses, and
/// every uncle coinbase with its depth-scaled reward.
pub fn accumulate_rewards(
    params: &PowParams,
    state: &mut StateDb,
    header: &Header,
    uncles: &[Header],
) -> Result<(), ConsensusError> {
    let reward = params.block_reward;
    let mut total = reward;
    for uncle in uncles {
        let depth_factor = U256::from(uncle.number + 8).saturating_sub(U256::from(header.number));
        let uncle_reward = depth_factor * reward / U256::from(8u64);
        state.add_balance(&uncle.coinbase, uncle_reward)?;
        total += reward / U256::from(32u64);
    }
    state.add_balance(&header.coinbase, total)?;
    Ok(())
}

/// Read-only service exposed under the `pow` namespace.
pub struct PowApi {
    engine: Arc<PowEngine>,
}

impl PowApi {
    pub fn hashrate(&self) -> f64 {
        self.engine.hashrate()
    }

    pub fn threads(&self) -> i32 {
        self.engine.threads()
    }

    /// Hex seed of the epoch containing `block`.
    pub fn seed_hash(&self, block: u64) -> String {
        format!("0x{}", hex::encode(seed_hash(block)))
    }
}

impl Engine for PowEngine {
    fn name(&self) -> &'static str {
        "pow"
    }

    fn author(&self, header: &Header) -> Result<Address, ConsensusError> {
        Ok(header.coinbase)
    }

    fn verify_header(&self, chain: &dyn ChainReader, header: &Header, seal: bool) -> Result<(), ConsensusError> {
        if self.config.mode == PowMode::FullFake {
            return Ok(());
        }
        let number = header.number;
        if chain.get_header(&header.hash(), number).is_some() {
            return Ok(());
        }
        let parent = number
            .checked_sub(1)
            .and_then(|n| chain.get_header(&header.parent_hash, n))
            .ok_or(ConsensusError::UnknownAncestor)?;
        self.verify_against(chain, header, &parent, false, seal)
    }

    fn verify_batch_item(
        &self,
        chain: &dyn ChainReader,
        headers: &[Header],
        index: usize,
        seal: bool,
    ) -> Result<(), ConsensusError> {
        if self.config.mode == PowMode::FullFake {
            return Ok(());
        }
        let header = &headers[index];
        let parent = batch_parent(chain, headers, index).ok_or(ConsensusError::UnknownAncestor)?;
        if chain.get_header(&header.hash(), header.number).is_some() {
            return Ok(());
        }
        self.verify_against(chain, header, &parent, false, seal)
    }

    fn verify_uncles(&self, chain: &dyn ChainReader, block: &Block) -> Result<(), ConsensusError> {
        if self.config.mode == PowMode::FullFake {
            return Ok(());
        }
        if block.uncles().len() > MAX_UNCLES {
            return Err(ConsensusError::TooManyUncles);
        }
        if block.uncles().is_empty() {
            return Ok(());
        }

        let mut uncles: HashSet<H256> = HashSet::new();
        let mut ancestors: HashMap<H256, Header> = HashMap::new();
        let mut number = block.number().checked_sub(1);
        let mut parent = block.parent_hash();
        for _ in 0..UNCLE_DEPTH {
            let Some(n) = number else { break };
            let Some(ancestor) = chain.get_block(&parent, n) else { break };
            ancestors.insert(ancestor.hash(), ancestor.header().clone());
            uncles.extend(ancestor.uncles().iter().map(Header::hash));
            parent = ancestor.parent_hash();
            number = n.checked_sub(1);
        }
        ancestors.insert(block.hash(), block.header().clone());
        uncles.insert(block.hash());

        for uncle in block.uncles() {
            let hash = uncle.hash();
            if !uncles.insert(hash) {
                return Err(ConsensusError::DuplicateUncle);
            }
            if ancestors.contains_key(&hash) {
                return Err(ConsensusError::UncleIsAncestor);
            }
            match ancestors.get(&uncle.parent_hash) {
                Some(uncle_parent) if uncle.parent_hash != block.parent_hash() => {
                    self.verify_against(chain, uncle, uncle_parent, true, true)?;
                }
                _ => return Err(ConsensusError::DanglingUncle),
            }
        }
        Ok(())
    }

    fn verify_seal(&self, _chain: &dyn ChainReader, header: &Header) -> Result<(), ConsensusError> {
        self.check_seal(header)
    }

    fn prepare(&self, chain: &dyn ChainReader, header: &mut Header) -> Result<(), ConsensusError> {
        let parent = header
            .number
            .checked_sub(1)
            .and_then(|n| chain.get_header(&header.parent_hash, n))
            .ok_or(ConsensusError::UnknownAncestor)?;
        header.difficulty = self.calc_difficulty(chain, header.time, &parent);
        Ok(())
    }

    fn finalize(
        &self,
        chain: &dyn ChainReader,
        mut header: Header,
        state: &mut StateDb,
        txs: Vec<Transaction>,
        uncles: Vec<Header>,
        receipts: &[Receipt],
    ) -> Result<Block, ConsensusError> {
        accumulate_rewards(&Self::params(chain), state, &header, &uncles)?;
        header.state_root = state.intermediate_root()?;
        Ok(Block::new(header, txs, uncles, receipts))
    }

    fn seal(&self, _chain: &dyn ChainReader, block: &Block, stop: &Receiver<()>) -> Result<Option<Block>, ConsensusError> {
        self.seal_block(block, stop)
    }

    fn calc_difficulty(&self, chain: &dyn ChainReader, time: u64, parent: &Header) -> U256 {
        difficulty::calc_difficulty(&Self::params(chain), time, parent)
    }

    fn apis(self: Arc<Self>, _chain: Arc<dyn ChainReader>) -> Vec<ApiDescriptor> {
        vec![ApiDescriptor {
            namespace: "pow",
            version: "1.0",
            service: Arc::new(PowApi { engine: self }),
            public: true,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::testing::TestChain;
    use crate::state::TrieDatabase;
    use crate::store::MemoryStore;
    use crate::types::BlockNonce;

    fn genesis() -> Header {
        Header {
            difficulty: U256::from(131_072u64),
            gas_limit: 8_000_000,
            time: 1_000,
            ..Header::default()
        }
    }

    fn child(engine: &PowEngine, chain: &TestChain, parent: &Header, dt: u64) -> Header {
        let mut h = Header {
            parent_hash: parent.hash(),
            number: parent.number + 1,
            gas_limit: parent.gas_limit,
            time: parent.time + dt,
            ..Header::default()
        };
        engine.prepare(chain, &mut h).unwrap();
        h
    }

    #[test]
    fn concurrent_cache_requests_generate_once() {
        let engine = PowEngine::tester();
        let block = 5 * EPOCH_LENGTH;
        let (a, b) = std::thread::scope(|s| {
            let t1 = s.spawn(|| engine.cache(block));
            let t2 = s.spawn(|| engine.cache(block));
            (t1.join().unwrap(), t2.join().unwrap())
        });
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.generations(), 1);
        assert_eq!(a.words().unwrap().to_vec(), b.words().unwrap().to_vec());
    }

    #[test]
    fn test_mode_seal_verifies() {
        let engine = PowEngine::tester();
        engine.set_threads(2);
        let header = Header {
            number: 1,
            difficulty: U256::from(64u64),
            time: 10,
            ..Header::default()
        };
        let block = Block::from_header(header);
        let (_stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let chain = TestChain::default();
        let sealed = engine.seal(&chain, &block, &stop_rx).unwrap().unwrap();
        assert_eq!(sealed.header().hash_no_nonce(), block.header().hash_no_nonce());
        engine.verify_seal(&chain, sealed.header()).unwrap();

        let mut tampered = sealed.header().clone();
        tampered.nonce = BlockNonce::from_u64(tampered.nonce.to_u64().wrapping_add(1));
        assert!(engine.verify_seal(&chain, &tampered).is_err());
    }

    #[test]
    fn seal_returns_none_when_stopped() {
        let engine = PowEngine::tester();
        engine.set_threads(1);
        let block = Block::from_header(Header {
            number: 1,
            difficulty: U256::MAX,
            ..Header::default()
        });
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        stop_tx.send(()).unwrap();
        let chain = TestChain::default();
        assert!(engine.seal(&chain, &block, &stop_rx).unwrap().is_none());
    }

    #[test]
    fn fake_modes_short_circuit() {
        let chain = TestChain::default();
        let header = Header {
            number: 3,
            difficulty: U256::from(1_000u64),
            ..Header::default()
        };
        assert!(PowEngine::faker().verify_seal(&chain, &header).is_ok());
        assert!(matches!(
            PowEngine::fake_failer(3).verify_seal(&chain, &header),
            Err(ConsensusError::InvalidPow)
        ));
        let engine = PowEngine::faker();
        assert_eq!(engine.caches.len(), 0);

        let (_tx, stop) = crossbeam_channel::bounded::<()>(0);
        let sealed = engine.seal(&chain, &Block::from_header(header), &stop).unwrap().unwrap();
        assert!(sealed.header().nonce.is_zero());
        assert!(PowEngine::full_faker().verify_header(&chain, &Header::default(), true).is_ok());
    }

    #[test]
    fn header_rules() {
        let engine = PowEngine::faker();
        let chain = TestChain::default();
        let g = Block::from_header(genesis());
        chain.add(&g);

        let ok = child(&engine, &chain, g.header(), 10);
        engine.verify_header(&chain, &ok, true).unwrap();

        let mut bad = ok.clone();
        bad.time = g.time();
        assert!(matches!(engine.verify_header(&chain, &bad, false), Err(ConsensusError::InvalidTimestamp)));

        let mut bad = ok.clone();
        bad.difficulty += U256::one();
        assert!(matches!(
            engine.verify_header(&chain, &bad, false),
            Err(ConsensusError::InvalidDifficulty { .. })
        ));

        let mut bad = ok.clone();
        bad.extra = vec![0; 33];
        assert!(matches!(engine.verify_header(&chain, &bad, false), Err(ConsensusError::ExtraTooLong { .. })));

        let mut bad = ok.clone();
        bad.gas_limit = g.gas_limit() + g.gas_limit() / 1024;
        assert!(matches!(engine.verify_header(&chain, &bad, false), Err(ConsensusError::InvalidGasLimit(_))));

        let mut bad = ok.clone();
        bad.time = unix_now() + 60;
        bad.difficulty = engine.calc_difficulty(&chain, bad.time, g.header());
        assert!(matches!(engine.verify_header(&chain, &bad, false), Err(ConsensusError::FutureBlock)));

        let mut orphan = ok.clone();
        orphan.parent_hash = H256([9; 32]);
        assert!(matches!(engine.verify_header(&chain, &orphan, false), Err(ConsensusError::UnknownAncestor)));
    }

    #[test]
    fn uncle_rules() {
        let engine = PowEngine::faker();
        let chain = TestChain::default();
        let g = Block::from_header(genesis());
        chain.add(&g);
        let b1 = Block::from_header(child(&engine, &chain, g.header(), 10));
        chain.add(&b1);
        let mut side = child(&engine, &chain, g.header(), 11);
        side.extra = b"side".to_vec();
        let b2_header = child(&engine, &chain, b1.header(), 10);

        let with = |uncles: Vec<Header>| Block::new(b2_header.clone(), vec![], uncles, &[]);

        engine.verify_uncles(&chain, &with(vec![side.clone()])).unwrap();
        assert!(matches!(
            engine.verify_uncles(&chain, &with(vec![side.clone(), side.clone()])),
            Err(ConsensusError::DuplicateUncle)
        ));
        assert!(matches!(
            engine.verify_uncles(&chain, &with(vec![b1.header().clone()])),
            Err(ConsensusError::UncleIsAncestor)
        ));
        assert!(matches!(
            engine.verify_uncles(&chain, &with(vec![side.clone(), side.clone(), side])),
            Err(ConsensusError::TooManyUncles)
        ));
        let sibling = child(&engine, &chain, b1.header(), 12);
        assert!(matches!(
            engine.verify_uncles(&chain, &with(vec![sibling])),
            Err(ConsensusError::DanglingUncle)
        ));
    }

    #[test]
    fn rewards_include_uncles() {
        let db = Arc::new(TrieDatabase::new(MemoryStore::shared()));
        let mut state = StateDb::new(H256::zero(), db).unwrap();
        let params = PowParams::default();
        let miner = Address([1; 20]);
        let uncle_miner = Address([2; 20]);
        let header = Header {
            number: 10,
            coinbase: miner,
            ..Header::default()
        };
        let uncle = Header {
            number: 9,
            coinbase: uncle_miner,
            ..Header::default()
        };
        accumulate_rewards(&params, &mut state, &header, &[uncle]).unwrap();
        let r = params.block_reward;
        assert_eq!(state.get_balance(&miner).unwrap(), r + r / U256::from(32u64));
        assert_eq!(state.get_balance(&uncle_miner).unwrap(), r * U256::from(7u64) / U256::from(8u64));
    }

    #[test]
    fn shared_engine_delegates_threads() {
        let backing = Arc::new(PowEngine::tester());
        let shared = PowEngine::shared(backing.clone());
        shared.set_threads(3);
        assert_eq!(backing.threads(), 3);
        assert_eq!(shared.mode(), PowMode::Shared);
    }
}
