//! Section-wise bloom index.
//!
//! Once a section of `section_size` canonical headers is `confirms` blocks
//! deep, the indexer rotates the section's header blooms into
//! [`Bloom::BIT_LENGTH`] bit vectors: vector `b` has bit `i` set when block
//! `section * section_size + i` has bloom bit `b` set. A log query then
//! reads three vectors per section instead of every header.

use super::blockchain::BlockChain;
use super::header_chain::logged;
use crate::consensus::ChainReader;
use crate::errors::{ChainError, StoreError};
use crate::store::{schema, SharedStore, WriteBatch};
use crate::types::{Bloom, Header, H256};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const BLOOM_SECTION_SIZE: u64 = 4096;
pub const BLOOM_CONFIRMS: u64 = 256;

pub struct BloomIndexer {
    db: SharedStore,
    section_size: u64,
    confirms: u64,
    stored: Mutex<u64>,
}

impl BloomIndexer {
    pub fn new(db: SharedStore, section_size: u64, confirms: u64) -> Result<Self, StoreError> {
        let section_size = section_size.max(8);
        let mut stored = 0;
        while schema::read_bloom_section_head(db.as_ref(), stored)?.is_some() {
            stored += 1;
        }
        Ok(Self {
            db,
            section_size,
            confirms,
            stored: Mutex::new(stored),
        })
    }

    pub fn with_defaults(db: SharedStore) -> Result<Self, StoreError> {
        Self::new(db, BLOOM_SECTION_SIZE, BLOOM_CONFIRMS)
    }

    pub fn section_size(&self) -> u64 {
        self.section_size
    }

    /// Number of consecutive sections indexed from section 0.
    pub fn stored_sections(&self) -> u64 {
        *self.stored.lock()
    }

    /// Rotate the blooms of one complete section into bit vectors and store
    /// them with the section head. Returns the head hash.
    pub fn process_section(&self, section: u64, headers: &[Header]) -> Result<H256, ChainError> {
        let size = self.section_size as usize;
        let head = headers
            .last()
            .filter(|_| headers.len() == size)
            .ok_or(ChainError::MissingBlock((section + 1) * self.section_size - 1))?
            .hash();

        let mut vectors = vec![vec![0u8; size / 8]; Bloom::BIT_LENGTH];
        for (i, header) in headers.iter().enumerate() {
            for (bit, vector) in vectors.iter_mut().enumerate() {
                if header.bloom.bit(bit) {
                    vector[i / 8] |= 0x80 >> (i % 8);
                }
            }
        }
        let mut batch = WriteBatch::new();
        for (bit, vector) in vectors.iter().enumerate() {
            schema::write_bloom_bits(&mut batch, bit as u16, section, &head, vector);
        }
        schema::write_bloom_section_head(&mut batch, section, &head);
        self.db.write(batch)?;
        debug!(target: "chain::bloombits", section, head = %head, "processed bloom section");
        Ok(head)
    }

    /// Bring the index up to date with the canonical chain: drop sections
    /// whose head is no longer canonical, then index every confirmed
    /// section not yet stored. Returns the number of sections added.
    pub fn update(&self, chain: &BlockChain) -> Result<u64, ChainError> {
        let mut stored = self.stored.lock();

        let valid = (0..*stored)
            .find(|&section| {
                let head_number = (section + 1) * self.section_size - 1;
                let recorded = logged(schema::read_bloom_section_head(self.db.as_ref(), section));
                recorded.is_none() || recorded != chain.get_canonical_hash(head_number)
            })
            .unwrap_or(*stored);
        if valid < *stored {
            warn!(target: "chain::bloombits", from = valid, to = *stored, "rolling back reorged bloom sections");
            let mut batch = WriteBatch::new();
            for section in valid..*stored {
                schema::delete_bloom_section_head(&mut batch, section);
            }
            self.db.write(batch)?;
            *stored = valid;
        }

        let head = chain.current_header().number;
        let confirmed = (head + 1).saturating_sub(self.confirms) / self.section_size;
        let mut added = 0;
        while *stored < confirmed {
            let section = *stored;
            let first = section * self.section_size;
            let headers: Option<Vec<Header>> = (first..first + self.section_size)
                .map(|n| chain.get_header_by_number(n))
                .collect();
            let Some(headers) = headers else {
                break;
            };
            self.process_section(section, &headers)?;
            *stored += 1;
            added += 1;
        }
        if added > 0 {
            info!(target: "chain::bloombits", sections = *stored, added, "bloom index updated");
        }
        Ok(added)
    }

    /// Bit vector `bit` of a stored section.
    pub fn bloom_bits(&self, bit: u16, section: u64) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(head) = schema::read_bloom_section_head(self.db.as_ref(), section)? else {
            return Ok(None);
        };
        schema::read_bloom_bits(self.db.as_ref(), bit, section, &head)
    }

    /// Block numbers within `section` whose bloom may contain `data`.
    pub fn matching_blocks(&self, section: u64, data: &[u8]) -> Result<Vec<u64>, StoreError> {
        let mut probe = Bloom::zero();
        probe.add(data);
        let mut acc: Option<Vec<u8>> = None;
        for bit in (0..Bloom::BIT_LENGTH).filter(|&b| probe.bit(b)) {
            let Some(vector) = self.bloom_bits(bit as u16, section)? else {
                return Ok(Vec::new());
            };
            acc = Some(match acc {
                None => vector,
                Some(prev) => prev.iter().zip(&vector).map(|(a, b)| a & b).collect(),
            });
        }
        let first = section * self.section_size;
        Ok(acc
            .unwrap_or_default()
            .iter()
            .enumerate()
            .flat_map(|(byte, v)| (0..8).filter(move |i| v & (0x80 >> i) != 0).map(move |i| (byte * 8 + i) as u64))
            .map(|i| first + i)
            .collect())
    }

    /// Re-run [`BloomIndexer::update`] on every new head until the chain is
    /// dropped.
    pub fn spawn(self: Arc<Self>, chain: &Arc<BlockChain>) -> JoinHandle<()> {
        let mut heads = chain.feeds().subscribe_head();
        let weak: Weak<BlockChain> = Arc::downgrade(chain);
        tokio::spawn(async move {
            loop {
                match heads.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return,
                }
                let Some(chain) = weak.upgrade() else {
                    return;
                };
                let indexer = self.clone();
                match tokio::task::spawn_blocking(move || indexer.update(&chain)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => warn!(target: "chain::bloombits", error = %err, "bloom index update failed"),
                    Err(err) => warn!(target: "chain::bloombits", error = %err, "bloom index task panicked"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn header_with(number: u64, data: Option<&[u8]>) -> Header {
        let mut bloom = Bloom::zero();
        if let Some(d) = data {
            bloom.add(d);
        }
        Header {
            number,
            bloom,
            ..Header::default()
        }
    }

    #[test]
    fn section_vectors_locate_matching_blocks() {
        let db = MemoryStore::shared();
        let indexer = BloomIndexer::new(db.clone(), 16, 0).unwrap();
        let headers: Vec<Header> = (16..32)
            .map(|n| header_with(n, (n == 19 || n == 30).then_some(b"needle".as_slice())))
            .collect();
        let head = indexer.process_section(1, &headers).unwrap();
        assert_eq!(head, headers[15].hash());

        assert_eq!(indexer.matching_blocks(1, b"needle").unwrap(), vec![19, 30]);
        assert!(indexer.matching_blocks(0, b"needle").unwrap().is_empty());
        assert!(indexer.bloom_bits(0, 1).unwrap().is_some());

        // A short section is refused.
        assert!(indexer.process_section(2, &headers[..4]).is_err());
    }

    #[test]
    fn stored_sections_counted_on_open() {
        let db = MemoryStore::shared();
        let indexer = BloomIndexer::new(db.clone(), 8, 0).unwrap();
        let section0: Vec<Header> = (0..8).map(|n| header_with(n, None)).collect();
        indexer.process_section(0, &section0).unwrap();
        assert_eq!(BloomIndexer::new(db, 8, 0).unwrap().stored_sections(), 1);
    }
}
