//! Miner Configuration
//!
//! Block production settings: reward address, extra-data, thread count and
//! the gas-limit band the miner steers toward.

use crate::types::Address;
use serde::{Deserialize, Serialize};

/// Maximum extra-data a miner may put into a header.
pub const MAX_EXTRA_DATA: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerConfig {
    /// Start the sealing loop on `run`
    #[serde(default)]
    pub enabled: bool,

    /// Search threads; 0 means one per logical CPU
    #[serde(default)]
    pub threads: usize,

    /// Reward address (coinbase)
    #[serde(default)]
    pub coinbase: Address,

    /// Free-form extra-data, at most 32 bytes
    #[serde(default = "default_extra")]
    pub extra: String,

    /// Gas limit the miner lowers toward
    #[serde(default = "default_gas_floor")]
    pub gas_floor: u64,

    /// Gas limit the miner raises toward
    #[serde(default = "default_gas_ceil")]
    pub gas_ceil: u64,

    /// Pause between mined blocks when idle (milliseconds)
    #[serde(default = "default_recommit_ms")]
    pub recommit_ms: u64,
}

fn default_extra() -> String {
    format!("vertex/{}", env!("CARGO_PKG_VERSION"))
}
fn default_gas_floor() -> u64 {
    8_000_000
}
fn default_gas_ceil() -> u64 {
    8_000_000
}
fn default_recommit_ms() -> u64 {
    3000
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threads: 0,
            coinbase: Address::zero(),
            extra: default_extra(),
            gas_floor: default_gas_floor(),
            gas_ceil: default_gas_ceil(),
            recommit_ms: default_recommit_ms(),
        }
    }
}

impl MinerConfig {
    pub fn effective_threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.extra.len() > MAX_EXTRA_DATA {
            return Err(format!(
                "miner extra-data exceeds limit: {} > {}",
                self.extra.len(),
                MAX_EXTRA_DATA
            ));
        }
        if self.gas_floor > self.gas_ceil {
            return Err(format!(
                "gas floor {} above gas ceiling {}",
                self.gas_floor, self.gas_ceil
            ));
        }
        Ok(())
    }
}
