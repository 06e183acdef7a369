//! Mining performance tracking and statistics
//!
//! Tracks the sealing hash rate and the blocks this node has mined.

use crate::types::{Address, H256};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

struct MeterInner {
    samples: VecDeque<(Instant, u64)>,
    started: Instant,
    total_hashes: u64,
}

/// Rolling window hash-rate meter, safe to mark from many sealing threads.
pub struct HashrateMeter {
    inner: Mutex<MeterInner>,
    window: Duration,
}

impl HashrateMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Mutex::new(MeterInner {
                samples: VecDeque::with_capacity(128),
                started: Instant::now(),
                total_hashes: 0,
            }),
            window,
        }
    }

    /// Record hashes computed
    pub fn mark(&self, hashes: u64) {
        if hashes == 0 {
            return;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.total_hashes += hashes;
        inner.samples.push_back((now, hashes));

        // Clean old samples outside window
        while let Some(&(ts, _)) = inner.samples.front() {
            if now.duration_since(ts) > self.window {
                inner.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Hashes per second over the window, or since start when younger.
    pub fn rate(&self) -> f64 {
        let inner = self.inner.lock();
        let now = Instant::now();
        let span = now.duration_since(inner.started).min(self.window).as_secs_f64();
        if span < 0.001 {
            return 0.0;
        }
        let total: u64 = inner
            .samples
            .iter()
            .filter(|(ts, _)| now.duration_since(*ts) <= self.window)
            .map(|(_, h)| h)
            .sum();
        total as f64 / span
    }

    /// Get total hashes computed lifetime
    pub fn total_hashes(&self) -> u64 {
        self.inner.lock().total_hashes
    }
}

impl Default for HashrateMeter {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

/// Blocks mined per coinbase.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoinbaseStats {
    pub coinbase: Address,
    pub blocks_found: u64,
    pub last_block_number: u64,
    pub last_block_hash: H256,
    /// Last seen timestamp (unix seconds)
    pub last_seen_ts: u64,
}

/// Record of the blocks this node sealed, newest last.
pub struct MiningStats {
    by_coinbase: Mutex<HashMap<Address, CoinbaseStats>>,
    recent: Mutex<VecDeque<(u64, H256)>>,
    recent_window: usize,
}

impl MiningStats {
    pub fn new(recent_window: usize) -> Self {
        Self {
            by_coinbase: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::with_capacity(recent_window)),
            recent_window: recent_window.max(1),
        }
    }

    pub fn record_block(&self, coinbase: Address, number: u64, hash: H256) {
        let now_ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        {
            let mut all = self.by_coinbase.lock();
            let stats = all.entry(coinbase).or_insert(CoinbaseStats {
                coinbase,
                blocks_found: 0,
                last_block_number: 0,
                last_block_hash: H256::zero(),
                last_seen_ts: 0,
            });
            stats.blocks_found += 1;
            stats.last_block_number = number;
            stats.last_block_hash = hash;
            stats.last_seen_ts = now_ts;
        }
        let mut recent = self.recent.lock();
        recent.push_back((number, hash));
        while recent.len() > self.recent_window {
            recent.pop_front();
        }
    }

    pub fn blocks_found(&self) -> u64 {
        self.by_coinbase.lock().values().map(|s| s.blocks_found).sum()
    }

    pub fn coinbase_stats(&self, coinbase: &Address) -> Option<CoinbaseStats> {
        self.by_coinbase.lock().get(coinbase).cloned()
    }

    pub fn recent_blocks(&self) -> Vec<(u64, H256)> {
        self.recent.lock().iter().copied().collect()
    }
}

impl Default for MiningStats {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Mining status snapshot for reporting
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MiningStatus {
    pub enabled: bool,
    pub threads: usize,
    /// Current hashrate (H/s)
    pub hashrate_hps: f64,
    pub blocks_found: u64,
    /// Number of the block being mined
    pub current_number: u64,
    pub pending_txs: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashrate_meter() {
        let meter = HashrateMeter::new(Duration::from_secs(30));
        meter.mark(1000);
        std::thread::sleep(Duration::from_millis(100));
        meter.mark(1000);

        assert!(meter.rate() > 0.0);
        assert_eq!(meter.total_hashes(), 2000);
    }

    #[test]
    fn test_meter_ignores_empty_marks() {
        let meter = HashrateMeter::default();
        meter.mark(0);
        assert_eq!(meter.total_hashes(), 0);
        assert_eq!(meter.rate(), 0.0);
    }

    #[test]
    fn test_mining_stats() {
        let stats = MiningStats::new(2);
        let a = Address([1; 20]);
        let b = Address([2; 20]);
        stats.record_block(a, 1, H256([1; 32]));
        stats.record_block(a, 2, H256([2; 32]));
        stats.record_block(b, 3, H256([3; 32]));

        assert_eq!(stats.blocks_found(), 3);
        let sa = stats.coinbase_stats(&a).unwrap();
        assert_eq!(sa.blocks_found, 2);
        assert_eq!(sa.last_block_number, 2);
        assert_eq!(stats.recent_blocks(), vec![(2, H256([2; 32])), (3, H256([3; 32]))]);
    }
}
