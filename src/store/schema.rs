//! Key layout of the chain database and typed accessors over it.
//!
//! Numbers in keys are 8-byte big-endian so that prefix scans walk the chain
//! in order. Values are bincode, except the chain config which is JSON.

use super::{KvStore, WriteBatch};
use crate::config::ChainConfig;
use crate::errors::StoreError;
use crate::types::{Block, Body, Header, Receipt, H256};
use primitive_types::U256;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub const HEAD_HEADER_KEY: &[u8] = b"LastHeader";
pub const HEAD_BLOCK_KEY: &[u8] = b"LastBlock";
pub const HEAD_FAST_BLOCK_KEY: &[u8] = b"LastFast";

const HEADER_PREFIX: &[u8] = b"h";
const TD_SUFFIX: &[u8] = b"t";
const NUM_SUFFIX: &[u8] = b"n";
const HEADER_NUMBER_PREFIX: &[u8] = b"H";
const BODY_PREFIX: &[u8] = b"b";
const RECEIPTS_PREFIX: &[u8] = b"r";
const TX_LOOKUP_PREFIX: &[u8] = b"l";
const BLOOM_BITS_PREFIX: &[u8] = b"B";
const BLOOM_SECTION_HEAD_PREFIX: &[u8] = b"iB";
const CONFIG_PREFIX: &[u8] = b"vertex-config-";
pub const CODE_PREFIX: &[u8] = b"c";

fn concat(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for p in parts {
        out.extend_from_slice(p);
    }
    out
}

pub fn header_key(number: u64, hash: &H256) -> Vec<u8> {
    concat(&[HEADER_PREFIX, &number.to_be_bytes(), hash.as_bytes()])
}

pub fn td_key(number: u64, hash: &H256) -> Vec<u8> {
    concat(&[HEADER_PREFIX, &number.to_be_bytes(), hash.as_bytes(), TD_SUFFIX])
}

pub fn canonical_key(number: u64) -> Vec<u8> {
    concat(&[HEADER_PREFIX, &number.to_be_bytes(), NUM_SUFFIX])
}

pub fn header_number_key(hash: &H256) -> Vec<u8> {
    concat(&[HEADER_NUMBER_PREFIX, hash.as_bytes()])
}

pub fn body_key(number: u64, hash: &H256) -> Vec<u8> {
    concat(&[BODY_PREFIX, &number.to_be_bytes(), hash.as_bytes()])
}

pub fn receipts_key(number: u64, hash: &H256) -> Vec<u8> {
    concat(&[RECEIPTS_PREFIX, &number.to_be_bytes(), hash.as_bytes()])
}

pub fn tx_lookup_key(tx_hash: &H256) -> Vec<u8> {
    concat(&[TX_LOOKUP_PREFIX, tx_hash.as_bytes()])
}

pub fn code_key(code_hash: &H256) -> Vec<u8> {
    concat(&[CODE_PREFIX, code_hash.as_bytes()])
}

pub fn bloom_bits_key(bit: u16, section: u64, head: &H256) -> Vec<u8> {
    concat(&[BLOOM_BITS_PREFIX, &bit.to_be_bytes(), &section.to_be_bytes(), head.as_bytes()])
}

pub fn bloom_section_head_key(section: u64) -> Vec<u8> {
    concat(&[BLOOM_SECTION_HEAD_PREFIX, &section.to_be_bytes()])
}

pub fn config_key(genesis: &H256) -> Vec<u8> {
    concat(&[CONFIG_PREFIX, genesis.as_bytes()])
}

fn decode<T: DeserializeOwned>(raw: Option<Vec<u8>>) -> Result<Option<T>, StoreError> {
    match raw {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

fn read_hash(db: &dyn KvStore, key: &[u8]) -> Result<Option<H256>, StoreError> {
    match db.get(key)? {
        Some(bytes) if bytes.len() == 32 => Ok(Some(H256::from_slice(&bytes))),
        Some(_) => Err(StoreError::Corrupt(hex::encode(key))),
        None => Ok(None),
    }
}

pub fn read_canonical_hash(db: &dyn KvStore, number: u64) -> Result<Option<H256>, StoreError> {
    read_hash(db, &canonical_key(number))
}

pub fn write_canonical_hash(batch: &mut WriteBatch, hash: &H256, number: u64) {
    batch.put(canonical_key(number), hash.as_bytes().to_vec());
}

pub fn delete_canonical_hash(batch: &mut WriteBatch, number: u64) {
    batch.delete(canonical_key(number));
}

pub fn read_header_number(db: &dyn KvStore, hash: &H256) -> Result<Option<u64>, StoreError> {
    match db.get(&header_number_key(hash))? {
        Some(bytes) if bytes.len() == 8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes);
            Ok(Some(u64::from_be_bytes(buf)))
        }
        Some(_) => Err(StoreError::Corrupt(hex::encode(header_number_key(hash)))),
        None => Ok(None),
    }
}

pub fn read_head_header_hash(db: &dyn KvStore) -> Result<Option<H256>, StoreError> {
    read_hash(db, HEAD_HEADER_KEY)
}

pub fn write_head_header_hash(batch: &mut WriteBatch, hash: &H256) {
    batch.put(HEAD_HEADER_KEY, hash.as_bytes().to_vec());
}

pub fn read_head_block_hash(db: &dyn KvStore) -> Result<Option<H256>, StoreError> {
    read_hash(db, HEAD_BLOCK_KEY)
}

pub fn write_head_block_hash(batch: &mut WriteBatch, hash: &H256) {
    batch.put(HEAD_BLOCK_KEY, hash.as_bytes().to_vec());
}

pub fn read_head_fast_block_hash(db: &dyn KvStore) -> Result<Option<H256>, StoreError> {
    read_hash(db, HEAD_FAST_BLOCK_KEY)
}

pub fn write_head_fast_block_hash(batch: &mut WriteBatch, hash: &H256) {
    batch.put(HEAD_FAST_BLOCK_KEY, hash.as_bytes().to_vec());
}

pub fn read_header(db: &dyn KvStore, hash: &H256, number: u64) -> Result<Option<Header>, StoreError> {
    decode(db.get(&header_key(number, hash))?)
}

pub fn has_header(db: &dyn KvStore, hash: &H256, number: u64) -> Result<bool, StoreError> {
    db.has(&header_key(number, hash))
}

/// Store a header together with its hash→number mapping.
pub fn write_header(batch: &mut WriteBatch, header: &Header) -> Result<(), StoreError> {
    let hash = header.hash();
    batch.put(header_number_key(&hash), header.number.to_be_bytes().to_vec());
    batch.put(header_key(header.number, &hash), bincode::serialize(header)?);
    Ok(())
}

pub fn delete_header(batch: &mut WriteBatch, hash: &H256, number: u64) {
    batch.delete(header_key(number, hash));
    batch.delete(header_number_key(hash));
}

pub fn read_body(db: &dyn KvStore, hash: &H256, number: u64) -> Result<Option<Body>, StoreError> {
    decode(db.get(&body_key(number, hash))?)
}

pub fn has_body(db: &dyn KvStore, hash: &H256, number: u64) -> Result<bool, StoreError> {
    db.has(&body_key(number, hash))
}

pub fn write_body(batch: &mut WriteBatch, hash: &H256, number: u64, body: &Body) -> Result<(), StoreError> {
    batch.put(body_key(number, hash), bincode::serialize(body)?);
    Ok(())
}

pub fn delete_body(batch: &mut WriteBatch, hash: &H256, number: u64) {
    batch.delete(body_key(number, hash));
}

pub fn read_td(db: &dyn KvStore, hash: &H256, number: u64) -> Result<Option<U256>, StoreError> {
    decode(db.get(&td_key(number, hash))?)
}

pub fn write_td(batch: &mut WriteBatch, hash: &H256, number: u64, td: &U256) -> Result<(), StoreError> {
    batch.put(td_key(number, hash), bincode::serialize(td)?);
    Ok(())
}

pub fn delete_td(batch: &mut WriteBatch, hash: &H256, number: u64) {
    batch.delete(td_key(number, hash));
}

pub fn read_receipts(db: &dyn KvStore, hash: &H256, number: u64) -> Result<Option<Vec<Receipt>>, StoreError> {
    decode(db.get(&receipts_key(number, hash))?)
}

pub fn write_receipts(batch: &mut WriteBatch, hash: &H256, number: u64, receipts: &[Receipt]) -> Result<(), StoreError> {
    batch.put(receipts_key(number, hash), bincode::serialize(receipts)?);
    Ok(())
}

pub fn delete_receipts(batch: &mut WriteBatch, hash: &H256, number: u64) {
    batch.delete(receipts_key(number, hash));
}

pub fn read_block(db: &dyn KvStore, hash: &H256, number: u64) -> Result<Option<Block>, StoreError> {
    let Some(header) = read_header(db, hash, number)? else {
        return Ok(None);
    };
    let Some(body) = read_body(db, hash, number)? else {
        return Ok(None);
    };
    Ok(Some(Block::from_parts(header, body)))
}

pub fn write_block(batch: &mut WriteBatch, block: &Block) -> Result<(), StoreError> {
    write_body(batch, &block.hash(), block.number(), &block.body())?;
    write_header(batch, block.header())
}

/// Remove every piece of a block: receipts, header, body and total difficulty.
pub fn delete_block(batch: &mut WriteBatch, hash: &H256, number: u64) {
    delete_receipts(batch, hash, number);
    delete_header(batch, hash, number);
    delete_body(batch, hash, number);
    delete_td(batch, hash, number);
}

/// Positional metadata to help looking up a transaction by hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLookupEntry {
    pub block_hash: H256,
    pub block_number: u64,
    pub index: u64,
}

pub fn read_tx_lookup_entry(db: &dyn KvStore, tx_hash: &H256) -> Result<Option<TxLookupEntry>, StoreError> {
    decode(db.get(&tx_lookup_key(tx_hash))?)
}

pub fn write_tx_lookup_entries(batch: &mut WriteBatch, block: &Block) -> Result<(), StoreError> {
    for (i, tx) in block.transactions().iter().enumerate() {
        let entry = TxLookupEntry {
            block_hash: block.hash(),
            block_number: block.number(),
            index: i as u64,
        };
        batch.put(tx_lookup_key(&tx.hash()), bincode::serialize(&entry)?);
    }
    Ok(())
}

pub fn delete_tx_lookup_entry(batch: &mut WriteBatch, tx_hash: &H256) {
    batch.delete(tx_lookup_key(tx_hash));
}

pub fn read_chain_config(db: &dyn KvStore, genesis: &H256) -> Result<Option<ChainConfig>, StoreError> {
    match db.get(&config_key(genesis))? {
        Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        None => Ok(None),
    }
}

pub fn write_chain_config(db: &dyn KvStore, genesis: &H256, cfg: &ChainConfig) -> Result<(), StoreError> {
    db.put(&config_key(genesis), &serde_json::to_vec(cfg)?)
}

pub fn read_bloom_bits(db: &dyn KvStore, bit: u16, section: u64, head: &H256) -> Result<Option<Vec<u8>>, StoreError> {
    db.get(&bloom_bits_key(bit, section, head))
}

pub fn write_bloom_bits(batch: &mut WriteBatch, bit: u16, section: u64, head: &H256, bits: &[u8]) {
    batch.put(bloom_bits_key(bit, section, head), bits.to_vec());
}

pub fn read_bloom_section_head(db: &dyn KvStore, section: u64) -> Result<Option<H256>, StoreError> {
    read_hash(db, &bloom_section_head_key(section))
}

pub fn write_bloom_section_head(batch: &mut WriteBatch, section: u64, head: &H256) {
    batch.put(bloom_section_head_key(section), head.as_bytes().to_vec());
}

pub fn delete_bloom_section_head(batch: &mut WriteBatch, section: u64) {
    batch.delete(bloom_section_head_key(section));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::Transaction;

    #[test]
    fn canonical_keys_sort_by_number() {
        assert!(canonical_key(1) < canonical_key(2));
        assert!(canonical_key(255) < canonical_key(256));
        assert_ne!(td_key(1, &H256::zero()), header_key(1, &H256::zero()));
    }

    #[test]
    fn block_and_lookup_roundtrip() {
        let db = MemoryStore::new();
        let tx = Transaction { nonce: 3, ..Transaction::default() };
        let block = Block::new(
            Header { number: 4, ..Header::default() },
            vec![tx.clone()],
            vec![],
            &[],
        );

        let mut batch = WriteBatch::new();
        write_block(&mut batch, &block).unwrap();
        write_tx_lookup_entries(&mut batch, &block).unwrap();
        write_canonical_hash(&mut batch, &block.hash(), 4);
        db.write(batch).unwrap();

        let back = read_block(&db, &block.hash(), 4).unwrap().unwrap();
        assert_eq!(back.hash(), block.hash());
        assert_eq!(read_header_number(&db, &block.hash()).unwrap(), Some(4));
        assert_eq!(read_canonical_hash(&db, 4).unwrap(), Some(block.hash()));
        let entry = read_tx_lookup_entry(&db, &tx.hash()).unwrap().unwrap();
        assert_eq!(entry.block_number, 4);

        let mut batch = WriteBatch::new();
        delete_block(&mut batch, &block.hash(), 4);
        db.write(batch).unwrap();
        assert!(read_block(&db, &block.hash(), 4).unwrap().is_none());
    }
}
