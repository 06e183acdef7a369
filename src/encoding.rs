//! Stable binary encoding used for content hashing.
//!
//! Storage uses bincode, but identities (header hash, seal hash, transaction
//! hash, receipt root leaves) are derived from this hand-laid encoding so they
//! never depend on serializer internals. Integers are little-endian, 256-bit
//! quantities are 32 bytes big-endian, variable-length fields are prefixed
//! with a little-endian u32 length.

use crate::types::{Header, Log, Receipt, Transaction};
use primitive_types::U256;

const HEADER_MAGIC: &[u8; 4] = b"VHDR";
const HEADER_VERSION: u32 = 1;

fn put_u256(out: &mut Vec<u8>, v: &U256) {
    let mut buf = [0u8; 32];
    v.to_big_endian(&mut buf);
    out.extend_from_slice(&buf);
}

fn put_bytes(out: &mut Vec<u8>, b: &[u8]) {
    out.extend_from_slice(&(b.len() as u32).to_le_bytes());
    out.extend_from_slice(b);
}

/// Encode a header. With `with_seal == false` the mix digest and nonce are
/// left out, which yields the message the proof-of-work search runs over.
pub fn header_bytes(h: &Header, with_seal: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 4 + 32 * 6 + 20 + 256 + 32 + 8 * 4 + 4 + h.extra.len() + 40);

    out.extend_from_slice(HEADER_MAGIC);
    out.extend_from_slice(&HEADER_VERSION.to_le_bytes());

    out.extend_from_slice(h.parent_hash.as_bytes());
    out.extend_from_slice(h.uncle_hash.as_bytes());
    out.extend_from_slice(h.coinbase.as_bytes());
    out.extend_from_slice(h.state_root.as_bytes());
    out.extend_from_slice(h.tx_root.as_bytes());
    out.extend_from_slice(h.receipt_root.as_bytes());
    out.extend_from_slice(h.bloom.as_bytes());
    put_u256(&mut out, &h.difficulty);
    out.extend_from_slice(&h.number.to_le_bytes());
    out.extend_from_slice(&h.gas_limit.to_le_bytes());
    out.extend_from_slice(&h.gas_used.to_le_bytes());
    out.extend_from_slice(&h.time.to_le_bytes());
    put_bytes(&mut out, &h.extra);

    if with_seal {
        out.extend_from_slice(h.mix_digest.as_bytes());
        out.extend_from_slice(h.nonce.as_bytes());
    }
    out
}

pub fn tx_bytes(tx: &Transaction) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 32 + 8 + 21 + 32 + 4 + tx.data.len() + 20);
    out.extend_from_slice(&tx.nonce.to_le_bytes());
    put_u256(&mut out, &tx.gas_price);
    out.extend_from_slice(&tx.gas_limit.to_le_bytes());
    match &tx.to {
        Some(to) => {
            out.push(1);
            out.extend_from_slice(to.as_bytes());
        }
        None => out.push(0),
    }
    put_u256(&mut out, &tx.value);
    put_bytes(&mut out, &tx.data);
    out.extend_from_slice(tx.from.as_bytes());
    out
}

fn log_bytes(out: &mut Vec<u8>, log: &Log) {
    out.extend_from_slice(log.address.as_bytes());
    out.extend_from_slice(&(log.topics.len() as u32).to_le_bytes());
    for topic in &log.topics {
        out.extend_from_slice(topic.as_bytes());
    }
    put_bytes(out, &log.data);
}

/// Consensus fields of a receipt only; lookup metadata is excluded.
pub fn receipt_bytes(r: &Receipt) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8 + 256 + 64 * r.logs.len());
    out.push(r.status);
    out.extend_from_slice(&r.cumulative_gas_used.to_le_bytes());
    out.extend_from_slice(r.bloom.as_bytes());
    out.extend_from_slice(&(r.logs.len() as u32).to_le_bytes());
    for log in &r.logs {
        log_bytes(&mut out, log);
    }
    out
}
