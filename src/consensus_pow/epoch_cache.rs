//! Per-epoch caches and datasets with a one-epoch lookahead.
//!
//! Each epoch item is generated at most once: the first caller runs the
//! generation, concurrent callers for the same epoch block until it is done.
//! Requesting epoch `E` also hands back a fresh item for `E + 1` (once per
//! epoch) which the engine generates on a detached thread.

use super::algorithm::{
    cache_size, dataset_size, generate_cache, generate_dataset, seed_hash, EPOCH_LENGTH, MAX_EPOCH,
    TEST_CACHE_BYTES, TEST_DATASET_BYTES,
};
use super::dump::{dump_path, memory_map, memory_map_and_generate, remove_stale, Words};
use crate::bounded::LruCache;
use crate::metrics;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Cache,
    Dataset,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Cache => "cache",
            ItemKind::Dataset => "dataset",
        }
    }

    fn dump_kind(&self) -> &'static str {
        match self {
            ItemKind::Cache => "cache",
            ItemKind::Dataset => "full",
        }
    }
}

/// Where and how an item is produced.
#[derive(Debug, Clone, Copy)]
pub struct GenerateOpts<'a> {
    /// Dump directory; `None` keeps the item in memory only.
    pub dir: Option<&'a Path>,
    /// Dumps of older epochs beyond this count are deleted.
    pub on_disk: usize,
    /// Use the tiny test sizes.
    pub test: bool,
}

pub struct EpochItem {
    epoch: u64,
    kind: ItemKind,
    words: OnceCell<Words>,
    generations: AtomicU32,
}

impl EpochItem {
    pub fn new(kind: ItemKind, epoch: u64) -> Self {
        Self {
            epoch,
            kind,
            words: OnceCell::new(),
            generations: AtomicU32::new(0),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Number of times the generation routine actually ran.
    pub fn generations(&self) -> u32 {
        self.generations.load(Ordering::SeqCst)
    }

    pub fn words(&self) -> Option<&Words> {
        self.words.get()
    }

    /// Make sure the item is available, loading it from disk or generating it.
    pub fn generate(&self, opts: GenerateOpts<'_>) -> &Words {
        self.words.get_or_init(|| {
            self.generations.fetch_add(1, Ordering::SeqCst);
            metrics::POW_GENERATIONS
                .with_label_values(&[self.kind.as_str()])
                .inc();
            match self.kind {
                ItemKind::Cache => self.make_cache(opts),
                ItemKind::Dataset => self.make_dataset(opts),
            }
        })
    }

    fn sizes(&self, test: bool) -> (u64, u64, [u8; 32]) {
        let block = self.epoch * EPOCH_LENGTH + 1;
        let seed = seed_hash(block);
        if test {
            return (TEST_CACHE_BYTES, TEST_DATASET_BYTES, seed);
        }
        let dsize = match self.kind {
            ItemKind::Dataset => dataset_size(block),
            ItemKind::Cache => 0,
        };
        (cache_size(block), dsize, seed)
    }

    fn make_cache(&self, opts: GenerateOpts<'_>) -> Words {
        let (size, _, seed) = self.sizes(opts.test);
        let Some(dir) = opts.dir.filter(|_| opts.on_disk > 0) else {
            return Words::Heap(generate_cache(size, self.epoch, &seed));
        };
        self.load_or_write(dir, opts.on_disk, || generate_cache(size, self.epoch, &seed))
    }

    fn make_dataset(&self, opts: GenerateOpts<'_>) -> Words {
        let (csize, dsize, seed) = self.sizes(opts.test);
        let build = || {
            let cache = generate_cache(csize, self.epoch, &seed);
            generate_dataset(dsize, self.epoch, &cache)
        };
        let Some(dir) = opts.dir.filter(|_| opts.on_disk > 0) else {
            return Words::Heap(build());
        };
        self.load_or_write(dir, opts.on_disk, build)
    }

    fn load_or_write<F: FnOnce() -> Vec<u32>>(&self, dir: &Path, limit: usize, build: F) -> Words {
        let kind = self.kind.dump_kind();
        let path = dump_path(dir, kind, self.epoch);
        match memory_map(&path) {
            Ok(words) => {
                debug!(target: "pow", epoch = self.epoch, kind, "loaded old epoch {} from disk", kind);
                return words;
            }
            Err(e) => debug!(target: "pow", epoch = self.epoch, kind, error = %e, "failed to load old epoch {}", kind),
        }

        let words = build();
        let out = match memory_map_and_generate(&path, &words) {
            Ok(mapped) => mapped,
            Err(e) => {
                error!(target: "pow", epoch = self.epoch, kind, error = %e, "failed to write epoch dump, keeping it in memory");
                Words::Heap(words)
            }
        };
        remove_stale(dir, kind, self.epoch, limit);
        out
    }
}

/// Recently used epoch items plus the single pre-announced future epoch.
pub struct EpochLru {
    kind: ItemKind,
    cache: LruCache<u64, Arc<EpochItem>>,
    future: Mutex<Option<Arc<EpochItem>>>,
}

impl EpochLru {
    pub fn new(kind: ItemKind, max_items: usize) -> Self {
        let what = kind.as_str();
        Self {
            kind,
            cache: LruCache::with_evict_hook(max_items.max(1), move |epoch: &u64, _item: &Arc<EpochItem>| {
                trace!(target: "pow", epoch, "evicted epoch {}", what);
            }),
            future: Mutex::new(None),
        }
    }

    /// Item for `epoch`, plus a newly created item for `epoch + 1` when the
    /// lookahead has not been scheduled yet.
    pub fn get(&self, epoch: u64) -> (Arc<EpochItem>, Option<Arc<EpochItem>>) {
        let mut future = self.future.lock();

        let item = match self.cache.get(&epoch) {
            Some(item) => item,
            None => {
                let item = match future.as_ref() {
                    Some(f) if f.epoch() == epoch => f.clone(),
                    _ => {
                        trace!(target: "pow", epoch, "requiring new epoch {}", self.kind.as_str());
                        Arc::new(EpochItem::new(self.kind, epoch))
                    }
                };
                self.cache.insert(epoch, item.clone());
                item
            }
        };

        let mut next = None;
        let scheduled = future.as_ref().map(|f| f.epoch()).unwrap_or(0);
        if epoch < MAX_EPOCH - 1 && scheduled < epoch + 1 {
            trace!(target: "pow", epoch = epoch + 1, "requiring new future epoch {}", self.kind.as_str());
            let f = Arc::new(EpochItem::new(self.kind, epoch + 1));
            *future = Some(f.clone());
            next = Some(f);
        }
        (item, next)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn contains(&self, epoch: u64) -> bool {
        self.cache.contains_key(&epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus_pow::algorithm::WordSource;

    const TEST: GenerateOpts<'static> = GenerateOpts {
        dir: None,
        on_disk: 0,
        test: true,
    };

    #[test]
    fn lookahead_is_announced_once_per_epoch() {
        let lru = EpochLru::new(ItemKind::Cache, 2);
        let (item, future) = lru.get(3);
        assert_eq!(item.epoch(), 3);
        assert_eq!(future.as_ref().map(|f| f.epoch()), Some(4));

        let (_, again) = lru.get(3);
        assert!(again.is_none());

        let (four, next) = lru.get(4);
        assert!(Arc::ptr_eq(&four, future.as_ref().unwrap()));
        assert_eq!(next.map(|f| f.epoch()), Some(5));
    }

    #[test]
    fn lru_evicts_least_recent_epoch() {
        let lru = EpochLru::new(ItemKind::Cache, 2);
        lru.get(10);
        lru.get(20);
        lru.get(10);
        lru.get(30);
        assert!(lru.contains(10));
        assert!(!lru.contains(20));
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn generation_runs_once() {
        let item = EpochItem::new(ItemKind::Cache, 0);
        let a = item.generate(TEST).to_vec();
        let b = item.generate(TEST).to_vec();
        assert_eq!(a, b);
        assert_eq!(item.generations(), 1);
        assert_eq!(item.words().map(|w| w.word_len()), Some((TEST_CACHE_BYTES / 4) as usize));
    }

    #[test]
    fn dumps_are_reused_across_items() {
        let dir = tempfile::tempdir().unwrap();
        let opts = GenerateOpts {
            dir: Some(dir.path()),
            on_disk: 2,
            test: true,
        };
        let first = EpochItem::new(ItemKind::Dataset, 0);
        let words = first.generate(opts).to_vec();
        assert!(dump_path(dir.path(), "full", 0).exists());

        let second = EpochItem::new(ItemKind::Dataset, 0);
        let loaded = second.generate(opts);
        assert!(loaded.is_mapped());
        assert_eq!(loaded.to_vec(), words);
    }
}
