//! Chain data model: fixed-size hashes, headers, blocks, transactions,
//! receipts and logs.

use crate::encoding;
use once_cell::sync::OnceCell;
use primitive_types::U256;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256, Keccak512};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub const fn zero() -> Self {
                Self([0u8; $len])
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            /// Right-aligned copy: longer inputs are cropped from the left,
            /// shorter ones are left-padded with zeroes.
            pub fn from_slice(bytes: &[u8]) -> Self {
                let mut out = [0u8; $len];
                if bytes.len() >= $len {
                    out.copy_from_slice(&bytes[bytes.len() - $len..]);
                } else {
                    out[$len - bytes.len()..].copy_from_slice(bytes);
                }
                Self(out)
            }

            /// First four bytes as hex, for log lines.
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4.min($len)])
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::zero()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
                let bytes = hex::decode(s)?;
                if bytes.len() != $len {
                    return Err(hex::FromHexError::InvalidStringLength);
                }
                let mut out = [0u8; $len];
                out.copy_from_slice(&bytes);
                Ok(Self(out))
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(b: [u8; $len]) -> Self {
                Self(b)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                if s.is_human_readable() {
                    s.serialize_str(&self.to_string())
                } else {
                    s.serialize_bytes(&self.0)
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                if d.is_human_readable() {
                    let s = String::deserialize(d)?;
                    s.parse().map_err(de::Error::custom)
                } else {
                    let bytes: Vec<u8> = Vec::deserialize(d)?;
                    if bytes.len() != $len {
                        return Err(de::Error::invalid_length(bytes.len(), &stringify!($len)));
                    }
                    let mut out = [0u8; $len];
                    out.copy_from_slice(&bytes);
                    Ok(Self(out))
                }
            }
        }
    };
}

fixed_bytes!(
    /// 32-byte content hash.
    H256,
    32
);
fixed_bytes!(
    /// 20-byte account address.
    Address,
    20
);
fixed_bytes!(
    /// 8-byte seal nonce (PoW nonce, or vote direction for the voting engine).
    BlockNonce,
    8
);
fixed_bytes!(
    /// 2048-bit log bloom filter.
    Bloom,
    256
);

impl BlockNonce {
    pub fn from_u64(n: u64) -> Self {
        Self(n.to_be_bytes())
    }

    pub fn to_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl Bloom {
    pub const BIT_LENGTH: usize = 2048;

    fn positions(data: &[u8]) -> [(usize, u8); 3] {
        let h = keccak256(data);
        let mut out = [(0usize, 0u8); 3];
        for (slot, i) in [0usize, 2, 4].into_iter().enumerate() {
            let bit = (((h[i] as usize) << 8) | h[i + 1] as usize) & (Self::BIT_LENGTH - 1);
            out[slot] = (Self::LEN - 1 - bit / 8, 1u8 << (bit % 8));
        }
        out
    }

    pub fn add(&mut self, data: &[u8]) {
        for (byte, mask) in Self::positions(data) {
            self.0[byte] |= mask;
        }
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        Self::positions(data)
            .iter()
            .all(|(byte, mask)| self.0[*byte] & mask == *mask)
    }

    pub fn accrue(&mut self, other: &Bloom) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a |= *b;
        }
    }

    /// Bit `i` counted from the most significant end, as the bloom indexer
    /// lays out its vectors.
    pub fn bit(&self, i: usize) -> bool {
        self.0[i / 8] & (0x80 >> (i % 8)) != 0
    }

    pub fn from_logs(logs: &[Log]) -> Self {
        let mut bloom = Bloom::zero();
        for log in logs {
            bloom.add(log.address.as_bytes());
            for topic in &log.topics {
                bloom.add(topic.as_bytes());
            }
        }
        bloom
    }
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(data));
    out
}

pub fn keccak512(data: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out.copy_from_slice(&Keccak512::digest(data));
    out
}

pub fn blake3_hash(data: &[u8]) -> H256 {
    H256(blake3::hash(data).into())
}

/// Address of a contract created by `from` at `nonce`.
pub fn create_address(from: &Address, nonce: u64) -> Address {
    let mut data = Vec::with_capacity(28);
    data.extend_from_slice(from.as_bytes());
    data.extend_from_slice(&nonce.to_be_bytes());
    Address::from_slice(&keccak256(&data)[12..])
}

/// Address owning an uncompressed secp256k1 public key (65 bytes, 0x04 prefix).
pub fn pubkey_to_address(uncompressed: &[u8; 65]) -> Address {
    Address::from_slice(&keccak256(&uncompressed[1..])[12..])
}

/// Pairwise blake3 merkle root; odd levels duplicate their last leaf.
pub fn merkle_root(leaves: &[H256]) -> H256 {
    if leaves.is_empty() {
        return blake3_hash(&[]);
    }
    let mut level: Vec<H256> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for chunk in level.chunks(2) {
            let mut data = [0u8; 64];
            data[..32].copy_from_slice(chunk[0].as_bytes());
            data[32..].copy_from_slice(chunk.get(1).unwrap_or(&chunk[0]).as_bytes());
            next.push(blake3_hash(&data));
        }
        level = next;
    }
    level[0]
}

pub fn derive_tx_root(txs: &[Transaction]) -> H256 {
    let leaves: Vec<H256> = txs.iter().map(|tx| tx.hash()).collect();
    merkle_root(&leaves)
}

pub fn derive_receipt_root(receipts: &[Receipt]) -> H256 {
    let leaves: Vec<H256> = receipts
        .iter()
        .map(|r| blake3_hash(&encoding::receipt_bytes(r)))
        .collect();
    merkle_root(&leaves)
}

pub fn calc_uncle_hash(uncles: &[Header]) -> H256 {
    let leaves: Vec<H256> = uncles.iter().map(|h| h.hash()).collect();
    merkle_root(&leaves)
}

/// Uncle hash of a block without uncles.
pub fn empty_uncle_hash() -> H256 {
    calc_uncle_hash(&[])
}

pub fn create_bloom(receipts: &[Receipt]) -> Bloom {
    let mut bloom = Bloom::zero();
    for r in receipts {
        bloom.accrue(&r.bloom);
    }
    bloom
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub parent_hash: H256,
    pub uncle_hash: H256,
    pub coinbase: Address,
    pub state_root: H256,
    pub tx_root: H256,
    pub receipt_root: H256,
    pub bloom: Bloom,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub time: u64,
    pub extra: Vec<u8>,
    pub mix_digest: H256,
    pub nonce: BlockNonce,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            parent_hash: H256::zero(),
            uncle_hash: empty_uncle_hash(),
            coinbase: Address::zero(),
            state_root: H256::zero(),
            tx_root: merkle_root(&[]),
            receipt_root: merkle_root(&[]),
            bloom: Bloom::zero(),
            difficulty: U256::zero(),
            number: 0,
            gas_limit: 0,
            gas_used: 0,
            time: 0,
            extra: Vec::new(),
            mix_digest: H256::zero(),
            nonce: BlockNonce::zero(),
        }
    }
}

impl Header {
    pub fn hash(&self) -> H256 {
        blake3_hash(&encoding::header_bytes(self, true))
    }

    /// Hash of the header without mix digest and nonce: the proof-of-work
    /// search input.
    pub fn hash_no_nonce(&self) -> H256 {
        blake3_hash(&encoding::header_bytes(self, false))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: u64,
    /// `None` deploys `data` as contract code.
    pub to: Option<Address>,
    pub value: U256,
    pub data: Vec<u8>,
    /// Sender, as resolved by the account layer before the transaction
    /// reaches the chain.
    pub from: Address,
}

impl Transaction {
    pub fn hash(&self) -> H256 {
        blake3_hash(&encoding::tx_bytes(self))
    }

    /// Maximum amount the sender may be charged.
    pub fn cost(&self) -> U256 {
        self.gas_price
            .saturating_mul(U256::from(self.gas_limit))
            .saturating_add(self.value)
    }
}

/// Transactions of `a` whose hash does not appear in `b`.
pub fn tx_difference(a: &[Transaction], b: &[Transaction]) -> Vec<Transaction> {
    let keep: HashSet<H256> = b.iter().map(|tx| tx.hash()).collect();
    a.iter()
        .filter(|tx| !keep.contains(&tx.hash()))
        .cloned()
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub tx_hash: H256,
    pub tx_index: u32,
    pub block_hash: H256,
    pub index: u32,
    /// Set when the log was reverted by a chain reorganisation.
    pub removed: bool,
}

pub const RECEIPT_STATUS_FAILED: u8 = 0;
pub const RECEIPT_STATUS_SUCCESSFUL: u8 = 1;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub status: u8,
    pub cumulative_gas_used: u64,
    pub bloom: Bloom,
    pub logs: Vec<Log>,
    pub tx_hash: H256,
    pub contract_address: Option<Address>,
    pub gas_used: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    pub transactions: Vec<Transaction>,
    pub uncles: Vec<Header>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    header: Header,
    transactions: Vec<Transaction>,
    uncles: Vec<Header>,
    #[serde(skip)]
    hash: OnceCell<H256>,
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for Block {}

impl Block {
    /// Assemble a block, deriving the transaction root, uncle hash, receipt
    /// root and bloom of the header from the given contents.
    pub fn new(mut header: Header, transactions: Vec<Transaction>, uncles: Vec<Header>, receipts: &[Receipt]) -> Self {
        header.tx_root = derive_tx_root(&transactions);
        header.uncle_hash = calc_uncle_hash(&uncles);
        header.receipt_root = derive_receipt_root(receipts);
        header.bloom = create_bloom(receipts);
        Self::from_parts(header, Body { transactions, uncles })
    }

    /// Reassemble a block from stored header and body without touching any
    /// header field.
    pub fn from_parts(header: Header, body: Body) -> Self {
        Self {
            header,
            transactions: body.transactions,
            uncles: body.uncles,
            hash: OnceCell::new(),
        }
    }

    pub fn from_header(header: Header) -> Self {
        Self::from_parts(header, Body::default())
    }

    /// Same body under a replacement (sealed) header.
    pub fn with_seal(&self, header: Header) -> Self {
        Self {
            header,
            transactions: self.transactions.clone(),
            uncles: self.uncles.clone(),
            hash: OnceCell::new(),
        }
    }

    pub fn hash(&self) -> H256 {
        *self.hash.get_or_init(|| self.header.hash())
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn uncles(&self) -> &[Header] {
        &self.uncles
    }

    pub fn body(&self) -> Body {
        Body {
            transactions: self.transactions.clone(),
            uncles: self.uncles.clone(),
        }
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn parent_hash(&self) -> H256 {
        self.header.parent_hash
    }

    pub fn difficulty(&self) -> U256 {
        self.header.difficulty
    }

    pub fn time(&self) -> u64 {
        self.header.time
    }

    pub fn root(&self) -> H256 {
        self.header.state_root
    }

    pub fn coinbase(&self) -> Address {
        self.header.coinbase
    }

    pub fn gas_used(&self) -> u64 {
        self.header.gas_used
    }

    pub fn gas_limit(&self) -> u64 {
        self.header.gas_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_hash_hex_roundtrip_and_padding() {
        let h: H256 = "0x00000000000000000000000000000000000000000000000000000000000000ff"
            .parse()
            .unwrap();
        assert_eq!(h.0[31], 0xff);
        assert_eq!(H256::from_slice(&[0xff]), h);
        assert!("0x1234".parse::<H256>().is_err());

        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{}\"", h));
        let back: H256 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn binary_serialization_uses_raw_bytes() {
        let a = Address([7u8; 20]);
        let bytes = bincode::serialize(&a).unwrap();
        // u64 length prefix + 20 raw bytes
        assert_eq!(bytes.len(), 28);
        let back: Address = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn bloom_contains_added_items() {
        let mut bloom = Bloom::zero();
        bloom.add(b"topic-a");
        assert!(bloom.contains(b"topic-a"));
        assert!(!Bloom::zero().contains(b"topic-a"));
        assert_eq!((0..Bloom::BIT_LENGTH).filter(|i| bloom.bit(*i)).count() <= 3, true);
    }

    #[test]
    fn block_hash_changes_with_seal() {
        let header = Header {
            number: 1,
            difficulty: U256::from(10u64),
            ..Header::default()
        };
        let block = Block::new(header.clone(), vec![], vec![], &[]);
        let mut sealed = block.header().clone();
        sealed.nonce = BlockNonce::from_u64(99);
        let sealed_block = block.with_seal(sealed);

        assert_ne!(block.hash(), sealed_block.hash());
        assert_eq!(block.header().hash_no_nonce(), sealed_block.header().hash_no_nonce());
    }

    #[test]
    fn tx_difference_keeps_only_missing() {
        let a = Transaction { nonce: 1, ..Transaction::default() };
        let b = Transaction { nonce: 2, ..Transaction::default() };
        let c = Transaction { nonce: 3, ..Transaction::default() };
        let diff = tx_difference(&[a.clone(), b.clone(), c.clone()], &[b]);
        assert_eq!(diff, vec![a, c]);
    }
}
