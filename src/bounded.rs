//! Bounded caches shared between chain insertion, sealing and verification.
//!
//! `LruCache` is internally synchronized and may carry an eviction hook, which
//! the PoW epoch cache uses to log and drop generated items and the chain uses
//! to keep gauges current.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::hash::Hash;
use std::num::NonZeroUsize;

type EvictHook<K, V> = Box<dyn Fn(&K, &V) + Send + Sync>;

/// LRU cache with size limit
pub struct LruCache<K: Hash + Eq, V> {
    inner: Mutex<lru::LruCache<K, V>>,
    on_evict: Option<EvictHook<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(lru::LruCache::new(cap)),
            on_evict: None,
        }
    }

    pub fn with_evict_hook<F>(capacity: usize, hook: F) -> Self
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        let mut cache = Self::new(capacity);
        cache.on_evict = Some(Box::new(hook));
        cache
    }

    /// Insert item, evicting the least recently used one if at capacity.
    /// Returns the previous value stored under `key`.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let evicted = {
            let mut inner = self.inner.lock();
            if let Some(old) = inner.peek_mut(&key) {
                let prev = std::mem::replace(old, value);
                inner.promote(&key);
                return Some(prev);
            }
            inner.push(key, value)
        };
        if let (Some((k, v)), Some(hook)) = (evicted.as_ref(), self.on_evict.as_ref()) {
            hook(k, v);
        }
        None
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    /// Look up without touching recency.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.inner.lock().peek(key).cloned()
    }

    /// Return the cached value or insert the one produced by `make`. The
    /// lock is held while `make` runs, so it must be cheap.
    pub fn get_or_insert_with<F: FnOnce() -> V>(&self, key: K, make: F) -> V {
        let evicted;
        let value;
        {
            let mut inner = self.inner.lock();
            if let Some(v) = inner.get(&key) {
                return v.clone();
            }
            value = make();
            evicted = inner.push(key, value.clone());
        }
        if let (Some((k, v)), Some(hook)) = (evicted.as_ref(), self.on_evict.as_ref()) {
            hook(k, v);
        }
        value
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().pop(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().cap().get()
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    /// Retain only items matching predicate
    pub fn retain<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut inner = self.inner.lock();
        let drop: Vec<K> = inner
            .iter()
            .filter(|(k, v)| !f(k, v))
            .map(|(k, _)| k.clone())
            .collect();
        for key in drop {
            inner.pop(&key);
        }
    }
}

/// FIFO ring keeping the most recent `capacity` entries.
#[derive(Debug, Clone)]
pub struct BoundedRing<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> BoundedRing<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// Oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_lru_cache() {
        let cache = LruCache::new(2);
        cache.insert(1, "a");
        cache.insert(2, "b");
        assert_eq!(cache.get(&1), Some("a")); // 1 is now most recent
        cache.insert(3, "c"); // evicts 2

        assert!(cache.contains_key(&1));
        assert!(!cache.contains_key(&2));
        assert!(cache.contains_key(&3));
    }

    #[test]
    fn evict_hook_sees_dropped_entry() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let seen = evicted.clone();
        let cache = LruCache::with_evict_hook(1, move |k: &u32, _v: &u32| {
            seen.store(*k as usize, Ordering::SeqCst);
        });
        cache.insert(7, 70);
        assert_eq!(cache.insert(7, 71), Some(70));
        assert_eq!(evicted.load(Ordering::SeqCst), 0);
        cache.insert(8, 80);
        assert_eq!(evicted.load(Ordering::SeqCst), 7);
        assert_eq!(cache.get_or_insert_with(8, || 0), 80);
    }

    #[test]
    fn test_bounded_ring() {
        let mut ring = BoundedRing::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.to_vec(), vec![2, 3, 4]);
    }
}
