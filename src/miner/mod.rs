//! Block production.

pub mod manager;
pub mod stats;

pub use manager::Miner;
pub use stats::{HashrateMeter, MiningStats, MiningStatus};
