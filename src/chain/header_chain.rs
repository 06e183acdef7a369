//! Header-only skeleton of the chain.
//!
//! Tracks headers, total difficulties and the canonical number→hash mapping
//! independently of whether bodies or state are present, so headers can be
//! imported ahead of blocks.

use crate::bounded::LruCache;
use crate::config::ChainConfig;
use crate::consensus::{ChainReader, Engine};
use crate::errors::{ChainError, ConsensusError, InsertError, StoreError};
use crate::store::{schema, SharedStore, WriteBatch};
use crate::types::{Block, Header, H256};
use parking_lot::RwLock;
use primitive_types::U256;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

const HEADER_CACHE_LIMIT: usize = 512;
const TD_CACHE_LIMIT: usize = 1024;
const NUMBER_CACHE_LIMIT: usize = 2048;

/// Outcome of writing a header or block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    NonStat,
    CanonStat,
    SideStat,
}

/// Collapse a store lookup into an `Option`, logging failures.
pub(crate) fn logged<T>(res: Result<Option<T>, StoreError>) -> Option<T> {
    res.unwrap_or_else(|err| {
        error!(target: "chain", error = %err, "database read failed");
        None
    })
}

/// Fork choice on total difficulty. Equal weights go to the lower block,
/// and at equal height to a coin flip.
pub fn prefer_external(external_td: U256, local_td: U256, external_number: u64, local_number: u64) -> bool {
    if external_td != local_td {
        return external_td > local_td;
    }
    external_number < local_number || (external_number == local_number && rand::random::<bool>())
}

pub struct HeaderChain {
    config: ChainConfig,
    db: SharedStore,
    engine: Arc<dyn Engine>,
    genesis_header: RwLock<Header>,
    current_header: RwLock<Header>,
    header_cache: LruCache<H256, Header>,
    td_cache: LruCache<H256, U256>,
    number_cache: LruCache<H256, u64>,
    proc_interrupt: Arc<AtomicBool>,
}

impl HeaderChain {
    /// Open the header chain stored in `db`. The genesis must already be
    /// written.
    pub fn new(
        db: SharedStore,
        config: ChainConfig,
        engine: Arc<dyn Engine>,
        proc_interrupt: Arc<AtomicBool>,
    ) -> Result<Self, ChainError> {
        let genesis_hash = schema::read_canonical_hash(db.as_ref(), 0)?.ok_or(ChainError::NoGenesis)?;
        let genesis = schema::read_header(db.as_ref(), &genesis_hash, 0)?.ok_or(ChainError::NoGenesis)?;

        let mut current = genesis.clone();
        if let Some(head) = schema::read_head_header_hash(db.as_ref())? {
            if let Some(number) = schema::read_header_number(db.as_ref(), &head)? {
                if let Some(header) = schema::read_header(db.as_ref(), &head, number)? {
                    current = header;
                }
            }
        }

        Ok(Self {
            config,
            db,
            engine,
            genesis_header: RwLock::new(genesis),
            current_header: RwLock::new(current),
            header_cache: LruCache::new(HEADER_CACHE_LIMIT),
            td_cache: LruCache::new(TD_CACHE_LIMIT),
            number_cache: LruCache::new(NUMBER_CACHE_LIMIT),
            proc_interrupt,
        })
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn get_block_number(&self, hash: &H256) -> Option<u64> {
        if let Some(number) = self.number_cache.get(hash) {
            return Some(number);
        }
        let number = logged(schema::read_header_number(self.db.as_ref(), hash))?;
        self.number_cache.insert(*hash, number);
        Some(number)
    }

    /// Write a header with its total difficulty and, when it outweighs the
    /// current head, make it canonical by rewriting the number→hash mapping
    /// back to the first ancestor that already agrees.
    pub fn write_header(&self, header: &Header) -> Result<WriteStatus, ChainError> {
        let hash = header.hash();
        let number = header.number;

        let parent_td = self
            .get_td(&header.parent_hash, number.wrapping_sub(1))
            .ok_or(ChainError::Consensus(ConsensusError::UnknownAncestor))?;
        let local = self.current_header();
        let local_td = self.get_td(&local.hash(), local.number).unwrap_or_default();
        let external_td = parent_td + header.difficulty;

        let mut batch = WriteBatch::new();
        schema::write_td(&mut batch, &hash, number, &external_td)?;
        schema::write_header(&mut batch, header)?;

        let status = if prefer_external(external_td, local_td, number, local.number) {
            // Drop canonical entries above the new head.
            let mut n = number + 1;
            while logged(schema::read_canonical_hash(self.db.as_ref(), n)).is_some() {
                schema::delete_canonical_hash(&mut batch, n);
                n += 1;
            }
            // Overwrite stale canonical entries of the ancestry.
            let (mut head_hash, mut head_number) = (header.parent_hash, number.saturating_sub(1));
            while number > 0 {
                match logged(schema::read_canonical_hash(self.db.as_ref(), head_number)) {
                    Some(canonical) if canonical == head_hash => break,
                    _ => {}
                }
                schema::write_canonical_hash(&mut batch, &head_hash, head_number);
                let Some(ancestor) = self.get_header(&head_hash, head_number) else {
                    break;
                };
                if head_number == 0 {
                    break;
                }
                head_hash = ancestor.parent_hash;
                head_number -= 1;
            }
            schema::write_canonical_hash(&mut batch, &hash, number);
            schema::write_head_header_hash(&mut batch, &hash);
            WriteStatus::CanonStat
        } else {
            WriteStatus::SideStat
        };
        self.db.write(batch)?;

        self.header_cache.insert(hash, header.clone());
        self.td_cache.insert(hash, external_td);
        self.number_cache.insert(hash, number);
        if status == WriteStatus::CanonStat {
            *self.current_header.write() = header.clone();
        }
        Ok(status)
    }

    /// Sanity-check a header batch before importing it: contiguity, the
    /// blacklist, then engine verification of every `check_freq`-th seal.
    pub fn validate_header_chain(
        &self,
        chain: Arc<dyn ChainReader>,
        headers: &[Header],
        check_freq: usize,
        bad_hashes: &HashSet<H256>,
    ) -> Result<(), InsertError> {
        for i in 1..headers.len() {
            let (prev, cur) = (&headers[i - 1], &headers[i]);
            if prev.number.checked_add(1) != Some(cur.number) || cur.parent_hash != prev.hash() {
                error!(
                    target: "chain",
                    number = cur.number,
                    hash = %cur.hash(),
                    parent = %cur.parent_hash,
                    prevnumber = prev.number,
                    prevhash = %prev.hash(),
                    "non contiguous header insert"
                );
                return Err(InsertError::new(
                    i,
                    ChainError::NonContiguous {
                        prev_index: i - 1,
                        prev_number: prev.number,
                        prev_hash: prev.hash(),
                        index: i,
                        number: cur.number,
                        hash: cur.hash(),
                        parent: cur.parent_hash,
                    },
                ));
            }
        }

        let freq = check_freq.max(1);
        let offset = if headers.is_empty() { 0 } else { rand::random::<usize>() % freq };
        let mut seals = vec![false; headers.len()];
        for (i, seal) in seals.iter_mut().enumerate() {
            *seal = i % freq == offset;
        }
        if let Some(last) = seals.last_mut() {
            *last = true;
        }

        let mut results = self.engine.clone().verify_headers(chain, headers.to_vec(), seals);
        for (i, header) in headers.iter().enumerate() {
            if self.proc_interrupt.load(Ordering::SeqCst) {
                debug!(target: "chain", "premature abort during headers verification");
                return Err(InsertError::new(i, ChainError::Interrupted));
            }
            if bad_hashes.contains(&header.hash()) {
                return Err(InsertError::new(i, ChainError::BlacklistedHash(header.hash())));
            }
            match results.next_result() {
                Some(Ok(())) => {}
                Some(Err(err)) => return Err(InsertError::new(i, err)),
                None => return Err(InsertError::new(i, ChainError::Interrupted)),
            }
        }
        Ok(())
    }

    /// Import a verified header batch. `write` persists one header under
    /// the caller's lock. Headers already present are skipped.
    pub fn insert_header_chain<F>(&self, headers: &[Header], mut write: F, start: Instant) -> Result<usize, InsertError>
    where
        F: FnMut(&Header) -> Result<WriteStatus, ChainError>,
    {
        let (mut processed, mut ignored) = (0usize, 0usize);
        for (i, header) in headers.iter().enumerate() {
            if self.proc_interrupt.load(Ordering::SeqCst) {
                debug!(target: "chain", "premature abort during headers import");
                return Ok(processed);
            }
            if self.has_header(&header.hash(), header.number) {
                ignored += 1;
                continue;
            }
            write(header).map_err(|err| InsertError::new(i, err))?;
            processed += 1;
        }
        if let Some(last) = headers.last() {
            info!(
                target: "chain",
                count = processed,
                elapsed = ?start.elapsed(),
                number = last.number,
                hash = %last.hash(),
                ignored,
                "imported new block headers"
            );
        }
        Ok(processed)
    }

    /// Hashes of up to `max` ancestors of `hash`, nearest first.
    pub fn get_block_hashes_from_hash(&self, hash: &H256, max: u64) -> Vec<H256> {
        let mut out = Vec::new();
        let Some(mut header) = self.get_header_by_hash(hash) else {
            return out;
        };
        for _ in 0..max {
            if header.number == 0 {
                break;
            }
            let Some(parent) = self.get_header(&header.parent_hash, header.number - 1) else {
                break;
            };
            out.push(header.parent_hash);
            header = parent;
        }
        out
    }

    /// The `ancestor`-th ancestor of (`hash`, `number`), walking at most
    /// `max_non_canonical` non-canonical headers before switching to the
    /// canonical mapping.
    pub fn get_ancestor(&self, hash: &H256, number: u64, ancestor: u64, max_non_canonical: &mut u64) -> Option<(H256, u64)> {
        if ancestor > number {
            return None;
        }
        if ancestor == 1 {
            let header = self.get_header(hash, number)?;
            return Some((header.parent_hash, number - 1));
        }
        let (mut hash, mut number, mut ancestor) = (*hash, number, ancestor);
        while ancestor != 0 {
            if logged(schema::read_canonical_hash(self.db.as_ref(), number)) == Some(hash) {
                let target = number - ancestor;
                return logged(schema::read_canonical_hash(self.db.as_ref(), target)).map(|h| (h, target));
            }
            if *max_non_canonical == 0 {
                return None;
            }
            *max_non_canonical -= 1;
            ancestor -= 1;
            let header = self.get_header(&hash, number)?;
            hash = header.parent_hash;
            number -= 1;
        }
        Some((hash, number))
    }

    pub fn get_td(&self, hash: &H256, number: u64) -> Option<U256> {
        if let Some(td) = self.td_cache.get(hash) {
            return Some(td);
        }
        let td = logged(schema::read_td(self.db.as_ref(), hash, number))?;
        self.td_cache.insert(*hash, td);
        Some(td)
    }

    pub fn get_td_by_hash(&self, hash: &H256) -> Option<U256> {
        let number = self.get_block_number(hash)?;
        self.get_td(hash, number)
    }

    pub fn get_header(&self, hash: &H256, number: u64) -> Option<Header> {
        if let Some(header) = self.header_cache.get(hash) {
            return Some(header);
        }
        let header = logged(schema::read_header(self.db.as_ref(), hash, number))?;
        self.header_cache.insert(*hash, header.clone());
        Some(header)
    }

    pub fn get_header_by_hash(&self, hash: &H256) -> Option<Header> {
        let number = self.get_block_number(hash)?;
        self.get_header(hash, number)
    }

    pub fn has_header(&self, hash: &H256, number: u64) -> bool {
        if self.number_cache.contains_key(hash) || self.header_cache.contains_key(hash) {
            return true;
        }
        logged(schema::has_header(self.db.as_ref(), hash, number).map(Some)).unwrap_or(false)
    }

    pub fn get_header_by_number(&self, number: u64) -> Option<Header> {
        let hash = logged(schema::read_canonical_hash(self.db.as_ref(), number))?;
        self.get_header(&hash, number)
    }

    pub fn current_header(&self) -> Header {
        self.current_header.read().clone()
    }

    /// Move the head header pointer without touching canonical mappings.
    pub fn set_current_header(&self, header: Header) -> Result<(), ChainError> {
        let mut batch = WriteBatch::new();
        schema::write_head_header_hash(&mut batch, &header.hash());
        self.db.write(batch)?;
        *self.current_header.write() = header;
        Ok(())
    }

    pub fn genesis(&self) -> Header {
        self.genesis_header.read().clone()
    }

    pub fn set_genesis(&self, header: Header) {
        *self.genesis_header.write() = header;
    }

    /// Rewind the header chain to `head`, deleting every header above it
    /// along the current head's ancestry. `delete` removes whatever else the
    /// caller keeps per block (bodies, receipts).
    pub fn set_head<F>(&self, head: u64, mut delete: F) -> Result<(), ChainError>
    where
        F: FnMut(&mut WriteBatch, &H256, u64),
    {
        let mut batch = WriteBatch::new();
        let mut current = self.current_header();
        let height = current.number;

        while current.number > head {
            let hash = current.hash();
            delete(&mut batch, &hash, current.number);
            schema::delete_header(&mut batch, &hash, current.number);
            schema::delete_td(&mut batch, &hash, current.number);
            match self.get_header(&current.parent_hash, current.number - 1) {
                Some(parent) => current = parent,
                None => {
                    current = self.genesis();
                    break;
                }
            }
        }
        for n in (head + 1)..=height {
            schema::delete_canonical_hash(&mut batch, n);
        }
        schema::write_head_header_hash(&mut batch, &current.hash());
        self.db.write(batch)?;

        self.header_cache.clear();
        self.td_cache.clear();
        self.number_cache.clear();
        *self.current_header.write() = current;
        Ok(())
    }

    /// Whether `block` is the canonical block at its height.
    pub fn is_canonical(&self, block: &Block) -> bool {
        logged(schema::read_canonical_hash(self.db.as_ref(), block.number())) == Some(block.hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus_pow::PowEngine;
    use crate::store::MemoryStore;

    fn genesis_store() -> (SharedStore, Header) {
        let db = MemoryStore::shared();
        let genesis = Header {
            difficulty: U256::from(10u64),
            ..Header::default()
        };
        let mut batch = WriteBatch::new();
        schema::write_header(&mut batch, &genesis).unwrap();
        schema::write_td(&mut batch, &genesis.hash(), 0, &genesis.difficulty).unwrap();
        schema::write_canonical_hash(&mut batch, &genesis.hash(), 0);
        db.write(batch).unwrap();
        (db, genesis)
    }

    fn child(parent: &Header, difficulty: u64, salt: u8) -> Header {
        Header {
            parent_hash: parent.hash(),
            number: parent.number + 1,
            difficulty: U256::from(difficulty),
            extra: vec![salt],
            ..Header::default()
        }
    }

    fn open(db: SharedStore) -> HeaderChain {
        HeaderChain::new(
            db,
            ChainConfig::default(),
            Arc::new(PowEngine::faker()),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    #[test]
    fn heavier_headers_become_canonical() {
        let (db, genesis) = genesis_store();
        let hc = open(db);

        let a1 = child(&genesis, 5, 1);
        let a2 = child(&a1, 5, 1);
        assert_eq!(hc.write_header(&a1).unwrap(), WriteStatus::CanonStat);
        assert_eq!(hc.write_header(&a2).unwrap(), WriteStatus::CanonStat);
        assert_eq!(hc.get_td(&a2.hash(), 2), Some(U256::from(20u64)));

        let b1 = child(&genesis, 6, 2);
        assert_eq!(hc.write_header(&b1).unwrap(), WriteStatus::SideStat);
        let b2 = child(&b1, 6, 2);
        assert_eq!(hc.write_header(&b2).unwrap(), WriteStatus::CanonStat);

        assert_eq!(hc.current_header().hash(), b2.hash());
        assert_eq!(hc.get_header_by_number(1).unwrap().hash(), b1.hash());
        assert_eq!(hc.get_header_by_number(2).unwrap().hash(), b2.hash());
    }

    #[test]
    fn lower_block_wins_equal_weight() {
        let (db, genesis) = genesis_store();
        let hc = open(db);
        let a1 = child(&genesis, 5, 1);
        let a2 = child(&a1, 5, 1);
        hc.write_header(&a1).unwrap();
        hc.write_header(&a2).unwrap();

        let b1 = child(&genesis, 10, 2);
        assert_eq!(hc.write_header(&b1).unwrap(), WriteStatus::CanonStat);
        assert!(hc.get_header_by_number(2).is_none());
    }

    #[test]
    fn set_head_rewinds_and_ancestors_resolve() {
        let (db, genesis) = genesis_store();
        let hc = open(db.clone());
        let mut parent = genesis.clone();
        let mut headers = Vec::new();
        for _ in 0..5 {
            let h = child(&parent, 1, 0);
            hc.write_header(&h).unwrap();
            headers.push(h.clone());
            parent = h;
        }
        let tip = headers[4].clone();
        let mut budget = u64::MAX;
        assert_eq!(
            hc.get_ancestor(&tip.hash(), 5, 3, &mut budget),
            Some((headers[1].hash(), 2))
        );
        assert_eq!(hc.get_block_hashes_from_hash(&tip.hash(), 2), vec![headers[3].hash(), headers[2].hash()]);

        let mut deleted = Vec::new();
        hc.set_head(2, |_, hash, number| deleted.push((*hash, number))).unwrap();
        assert_eq!(deleted.len(), 3);
        assert_eq!(hc.current_header().number, 2);
        assert!(hc.get_header_by_number(3).is_none());
        assert!(!hc.has_header(&tip.hash(), 5));

        let reopened = open(db);
        assert_eq!(reopened.current_header().hash(), headers[1].hash());
    }
}
