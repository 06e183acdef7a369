//! Error taxonomy for the node library.

use crate::types::{Address, H256};
use primitive_types::U256;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),

    #[error("encoding: {0}")]
    Codec(#[from] bincode::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt entry under key {0}")]
    Corrupt(String),
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("missing trie node {0}")]
    MissingNode(H256),

    #[error("insufficient balance for {address}: have {have}, want {want}")]
    InsufficientBalance { address: Address, have: U256, want: U256 },

    #[error("nonce mismatch for {address}: state {state}, tx {tx}")]
    NonceMismatch { address: Address, state: u64, tx: u64 },

    #[error("intrinsic gas too low: have {have}, want {want}")]
    IntrinsicGas { have: u64, want: u64 },

    #[error("gas limit reached")]
    GasLimitReached,

    #[error("contract address collision at {0}")]
    ContractCollision(Address),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<bincode::Error> for StateError {
    fn from(e: bincode::Error) -> Self {
        StateError::Store(StoreError::Codec(e))
    }
}

#[derive(Error, Debug)]
pub enum PowError {
    #[error("invalid dump magic")]
    InvalidDumpMagic,

    #[error("dump file truncated: {len} bytes")]
    DumpTruncated { len: usize },

    #[error("epoch {0} beyond supported range")]
    UnsupportedEpoch(u64),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("unknown ancestor")]
    UnknownAncestor,

    #[error("pruned ancestor")]
    PrunedAncestor,

    #[error("block in the future")]
    FutureBlock,

    #[error("invalid block number")]
    InvalidNumber,

    #[error("invalid timestamp")]
    InvalidTimestamp,

    #[error("invalid difficulty: have {have}, want {want}")]
    InvalidDifficulty { have: U256, want: U256 },

    #[error("extra-data too long: {len} > {max}")]
    ExtraTooLong { len: usize, max: usize },

    #[error("invalid gas limit: {0}")]
    InvalidGasLimit(String),

    #[error("invalid gas used: have {used}, gas limit {limit}")]
    InvalidGasUsed { used: u64, limit: u64 },

    #[error("non-positive difficulty")]
    NonPositiveDifficulty,

    #[error("invalid mix digest")]
    InvalidMixDigest,

    #[error("invalid proof-of-work")]
    InvalidPow,

    #[error("too many uncles")]
    TooManyUncles,

    #[error("duplicate uncle")]
    DuplicateUncle,

    #[error("uncle is ancestor")]
    UncleIsAncestor,

    #[error("uncle's parent is not ancestor")]
    DanglingUncle,

    #[error("uncles not allowed")]
    InvalidUncleHash,

    #[error("extra-data 32 byte vanity prefix missing")]
    MissingVanity,

    #[error("extra-data 65 byte signature suffix missing")]
    MissingSignature,

    #[error("non-checkpoint block contains extra signer list")]
    ExtraSigners,

    #[error("invalid signer list on checkpoint block")]
    InvalidCheckpointSigners,

    #[error("beneficiary in checkpoint block non-zero")]
    InvalidCheckpointBeneficiary,

    #[error("vote nonce in checkpoint block non-zero")]
    InvalidCheckpointVote,

    #[error("vote nonce not 0x00..0 or 0xff..f")]
    InvalidVote,

    #[error("non-zero mix digest")]
    NonZeroMixDigest,

    #[error("wrong difficulty for signer turn")]
    WrongDifficulty,

    #[error("unauthorized signer {0}")]
    Unauthorized(Address),

    #[error("signer {0} signed recently")]
    Recently(Address),

    #[error("unknown block")]
    UnknownBlock,

    #[error("invalid voting chain")]
    InvalidVotingChain,

    #[error("signature: {0}")]
    Signature(String),

    #[error("sealing not possible: {0}")]
    Unsealable(String),

    #[error(transparent)]
    Pow(#[from] PowError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("block already known")]
    KnownBlock,

    #[error("unknown ancestor")]
    UnknownAncestor,

    #[error("pruned ancestor")]
    PrunedAncestor,

    #[error("uncle root hash mismatch: have {have}, want {want}")]
    UncleRootMismatch { have: H256, want: H256 },

    #[error("transaction root hash mismatch: have {have}, want {want}")]
    TxRootMismatch { have: H256, want: H256 },

    #[error("invalid gas used: remote {remote}, local {local}")]
    GasUsedMismatch { remote: u64, local: u64 },

    #[error("invalid bloom")]
    BloomMismatch,

    #[error("invalid receipt root hash: remote {remote}, local {local}")]
    ReceiptRootMismatch { remote: H256, local: H256 },

    #[error("invalid merkle root: remote {remote}, local {local}")]
    StateRootMismatch { remote: H256, local: H256 },

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error(
        "non contiguous insert: item {index} is #{number} [{hash}], item {prev_index} is #{prev_number} [{prev_hash}] (parent [{parent}])"
    )]
    NonContiguous {
        prev_index: usize,
        prev_number: u64,
        prev_hash: H256,
        index: usize,
        number: u64,
        hash: H256,
        parent: H256,
    },

    #[error("blacklisted hash {0}")]
    BlacklistedHash(H256),

    #[error("invalid {0} chain")]
    InvalidReorgChain(&'static str),

    #[error("genesis not found in chain")]
    NoGenesis,

    #[error("genesis mismatch: database contains {stored}, new {new}")]
    GenesisMismatch { stored: H256, new: H256 },

    #[error("unknown block {0}")]
    UnknownBlock(H256),

    #[error("insertion is interrupted")]
    Interrupted,

    #[error("missing block #{0}")]
    MissingBlock(u64),

    #[error("export range invalid: first {first} > last {last}")]
    InvalidRange { first: u64, last: u64 },

    #[error("future block: {time} > {max}")]
    FutureBlockTooFar { time: u64, max: u64 },

    #[error("receipt count mismatch: {blocks} blocks, {receipts} receipt sets")]
    ReceiptCountMismatch { blocks: usize, receipts: usize },

    #[error("state processing: {0}")]
    Process(#[from] StateError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ChainError {
    pub fn is_known_block(&self) -> bool {
        matches!(self, ChainError::Validation(ValidationError::KnownBlock))
    }

    pub fn is_future_block(&self) -> bool {
        matches!(
            self,
            ChainError::Consensus(ConsensusError::FutureBlock)
                | ChainError::Validation(ValidationError::Consensus(ConsensusError::FutureBlock))
        )
    }

    pub fn is_unknown_ancestor(&self) -> bool {
        matches!(
            self,
            ChainError::Consensus(ConsensusError::UnknownAncestor)
                | ChainError::Validation(ValidationError::UnknownAncestor)
                | ChainError::Validation(ValidationError::Consensus(ConsensusError::UnknownAncestor))
        )
    }

    pub fn is_pruned_ancestor(&self) -> bool {
        matches!(
            self,
            ChainError::Consensus(ConsensusError::PrunedAncestor)
                | ChainError::Validation(ValidationError::PrunedAncestor)
        )
    }
}

/// Failure of a batch insert, carrying the index of the first failing item.
#[derive(Error, Debug)]
#[error("insert failed at index {index}: {source}")]
pub struct InsertError {
    pub index: usize,
    #[source]
    pub source: ChainError,
}

impl InsertError {
    pub fn new(index: usize, source: impl Into<ChainError>) -> Self {
        Self {
            index,
            source: source.into(),
        }
    }
}
