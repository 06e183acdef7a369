//! Reference-counted in-memory cache of state nodes sitting in front of the
//! key-value store.
//!
//! Nodes are content addressed (blake3 of their encoding). A freshly inserted
//! node starts with no parents; inserting a node whose children are still
//! cached bumps the children's counts. External holders (the chain keeping a
//! state root alive) take a reference with [`TrieDatabase::reference`] and
//! release it with [`TrieDatabase::dereference`]; a node whose count drops to
//! zero is dropped from memory together with any children it alone kept
//! alive. Nodes already flushed to the store are never deleted.

use crate::errors::StateError;
use crate::store::{SharedStore, WriteBatch};
use crate::types::H256;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

/// Per-node bookkeeping overhead counted towards the cache size.
const NODE_OVERHEAD: usize = 32 + 8;

struct CachedNode {
    blob: Vec<u8>,
    parents: u32,
    children: Vec<H256>,
    /// Insertion sequence; flushing walks nodes oldest first so children
    /// always reach disk before their parents.
    seq: u64,
}

#[derive(Default)]
struct Inner {
    dirties: HashMap<H256, CachedNode>,
    order: BTreeMap<u64, H256>,
    next_seq: u64,
    size: usize,
    gc_nodes: u64,
    gc_size: usize,
    gc_time: Duration,
    flush_nodes: u64,
    flush_size: usize,
}

pub struct TrieDatabase {
    store: SharedStore,
    inner: RwLock<Inner>,
}

impl TrieDatabase {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Cache a node. Re-inserting a known node is a no-op.
    pub fn insert(&self, hash: H256, blob: Vec<u8>, children: Vec<H256>) {
        let mut inner = self.inner.write();
        if inner.dirties.contains_key(&hash) {
            return;
        }
        for child in &children {
            if let Some(c) = inner.dirties.get_mut(child) {
                c.parents += 1;
            }
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.size += blob.len() + NODE_OVERHEAD;
        inner.order.insert(seq, hash);
        inner.dirties.insert(
            hash,
            CachedNode {
                blob,
                parents: 0,
                children,
                seq,
            },
        );
    }

    /// Node blob from memory, falling back to the store.
    pub fn node(&self, hash: &H256) -> Result<Vec<u8>, StateError> {
        if let Some(n) = self.inner.read().dirties.get(hash) {
            return Ok(n.blob.clone());
        }
        self.store
            .get(hash.as_bytes())?
            .ok_or(StateError::MissingNode(*hash))
    }

    pub fn has(&self, hash: &H256) -> Result<bool, StateError> {
        if self.inner.read().dirties.contains_key(hash) {
            return Ok(true);
        }
        Ok(self.store.has(hash.as_bytes())?)
    }

    /// Add an external reference keeping `root` cached.
    pub fn reference(&self, root: &H256) {
        if let Some(n) = self.inner.write().dirties.get_mut(root) {
            n.parents += 1;
        }
    }

    /// Drop an external reference to `root`, releasing every cached node
    /// that is no longer reachable.
    pub fn dereference(&self, root: &H256) {
        let started = std::time::Instant::now();
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let (nodes, size) = (inner.dirties.len(), inner.size);
        Self::release(inner, *root);
        inner.gc_nodes += (nodes - inner.dirties.len()) as u64;
        inner.gc_size += size - inner.size;
        inner.gc_time += started.elapsed();
        debug!(
            target: "state",
            nodes = nodes - inner.dirties.len(),
            size = size - inner.size,
            live_nodes = inner.dirties.len(),
            live_size = inner.size,
            "dereferenced trie from memory database"
        );
    }

    fn release(inner: &mut Inner, root: H256) {
        let mut stack = vec![root];
        while let Some(hash) = stack.pop() {
            let Some(node) = inner.dirties.get_mut(&hash) else {
                continue;
            };
            if node.parents > 0 {
                node.parents -= 1;
            }
            if node.parents == 0 {
                if let Some(node) = inner.dirties.remove(&hash) {
                    inner.order.remove(&node.seq);
                    inner.size -= node.blob.len() + NODE_OVERHEAD;
                    stack.extend(node.children);
                }
            }
        }
    }

    /// Write `root` and every cached node below it to the store, then drop
    /// them from memory.
    pub fn commit(&self, root: &H256) -> Result<(), StateError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let mut batch = WriteBatch::new();
        let mut done: HashSet<H256> = HashSet::new();

        // Post-order walk: children are written before their parent.
        let mut stack: Vec<(H256, bool)> = vec![(*root, false)];
        while let Some((hash, expanded)) = stack.pop() {
            let Some(node) = inner.dirties.get(&hash) else {
                continue;
            };
            if expanded {
                if done.insert(hash) {
                    batch.put(hash.as_bytes().to_vec(), node.blob.clone());
                }
                continue;
            }
            if done.contains(&hash) {
                continue;
            }
            stack.push((hash, true));
            for child in &node.children {
                stack.push((*child, false));
            }
        }
        let nodes = done.len();
        self.store.write(batch)?;

        let size = inner.size;
        for hash in done {
            if let Some(node) = inner.dirties.remove(&hash) {
                inner.order.remove(&node.seq);
                inner.size -= node.blob.len() + NODE_OVERHEAD;
            }
        }
        inner.flush_nodes += nodes as u64;
        inner.flush_size += size - inner.size;
        debug!(target: "state", root = %root, nodes, size = size - inner.size, "persisted trie from memory database");
        Ok(())
    }

    /// Flush the oldest cached nodes until the cache holds at most `limit`
    /// bytes.
    pub fn cap(&self, limit: usize) -> Result<(), StateError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if inner.size <= limit {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        let mut flushed = Vec::new();
        let mut size = inner.size;
        for (seq, hash) in inner.order.iter() {
            if size <= limit {
                break;
            }
            if let Some(node) = inner.dirties.get(hash) {
                batch.put(hash.as_bytes().to_vec(), node.blob.clone());
                size -= node.blob.len() + NODE_OVERHEAD;
                flushed.push((*seq, *hash));
            }
        }
        self.store.write(batch)?;
        for (seq, hash) in &flushed {
            inner.order.remove(seq);
            if let Some(node) = inner.dirties.remove(hash) {
                inner.size -= node.blob.len() + NODE_OVERHEAD;
            }
        }
        inner.flush_nodes += flushed.len() as u64;
        debug!(target: "state", nodes = flushed.len(), live_size = inner.size, "capped trie memory database");
        Ok(())
    }

    /// Bytes of dirty nodes held in memory.
    pub fn size(&self) -> usize {
        self.inner.read().size
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().dirties.len()
    }

    /// Cached nodes and their reference counts, for inspection.
    pub fn references(&self, hash: &H256) -> Option<u32> {
        self.inner.read().dirties.get(hash).map(|n| n.parents)
    }

    /// Garbage-collection counters: (nodes, bytes, time).
    pub fn gc_stats(&self) -> (u64, usize, Duration) {
        let inner = self.inner.read();
        (inner.gc_nodes, inner.gc_size, inner.gc_time)
    }

    /// Flush counters: (nodes, bytes).
    pub fn flush_stats(&self) -> (u64, usize) {
        let inner = self.inner.read();
        (inner.flush_nodes, inner.flush_size)
    }
}
