//! Vertex node library: chain storage and import, proof-of-work and
//! signer-voting consensus, and block production.

pub mod bounded;
pub mod chain;
pub mod config;
pub mod consensus;
pub mod consensus_pow;
pub mod consensus_vote;
pub mod encoding;
pub mod errors;
pub mod metrics;
pub mod miner;
pub mod state;
pub mod store;
pub mod types;

pub use chain::BlockChain;
pub use errors::{ChainError, ConsensusError, InsertError};
