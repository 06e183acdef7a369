pub mod chain;
pub mod miner;
pub mod node;

pub use chain::{ChainConfig, PowParams, VoteParams};
pub use miner::MinerConfig;
pub use node::{CacheConfig, ConfigError, NodeConfig, PowConfig, PowMode};
