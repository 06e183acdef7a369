//! Consensus parameters of a chain, stored alongside its genesis.

use primitive_types::U256;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,

    /// Proof-of-work parameters; present when the chain is mined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pow: Option<PowParams>,

    /// Signer-voting parameters; present when the chain is signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote: Option<VoteParams>,
}

impl ChainConfig {
    pub fn pow(chain_id: u64) -> Self {
        Self {
            chain_id,
            pow: Some(PowParams::default()),
            vote: None,
        }
    }

    pub fn vote(chain_id: u64, period: u64, epoch: u64) -> Self {
        Self {
            chain_id,
            pow: None,
            vote: Some(VoteParams { period, epoch }),
        }
    }

    pub fn engine_name(&self) -> &'static str {
        match (&self.pow, &self.vote) {
            (_, Some(_)) => "vote",
            _ => "pow",
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::pow(1337)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowParams {
    #[serde(default = "default_minimum_difficulty")]
    pub minimum_difficulty: U256,

    #[serde(default = "default_block_reward")]
    pub block_reward: U256,

    #[serde(default = "default_difficulty_bound_divisor")]
    pub difficulty_bound_divisor: u64,

    /// Target block interval used by the difficulty adjustment (seconds).
    #[serde(default = "default_duration_limit")]
    pub duration_limit: u64,
}

fn default_minimum_difficulty() -> U256 {
    U256::from(131_072u64)
}
fn default_block_reward() -> U256 {
    U256::from(5u64) * U256::exp10(18)
}
fn default_difficulty_bound_divisor() -> u64 {
    2048
}
fn default_duration_limit() -> u64 {
    9
}

impl Default for PowParams {
    fn default() -> Self {
        Self {
            minimum_difficulty: default_minimum_difficulty(),
            block_reward: default_block_reward(),
            difficulty_bound_divisor: default_difficulty_bound_divisor(),
            duration_limit: default_duration_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteParams {
    /// Minimum seconds between consecutive blocks.
    pub period: u64,
    /// Blocks between checkpoints that reset pending votes.
    pub epoch: u64,
}

impl Default for VoteParams {
    fn default() -> Self {
        Self { period: 15, epoch: 30_000 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip_omits_absent_engine() {
        let cfg = ChainConfig::vote(5, 3, 100);
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("pow"));
        let back: ChainConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
        assert_eq!(back.engine_name(), "vote");
    }

    #[test]
    fn missing_pow_fields_take_defaults() {
        let cfg: ChainConfig = serde_json::from_str(r#"{"chain_id":1,"pow":{}}"#).unwrap();
        assert_eq!(cfg.pow.unwrap().difficulty_bound_divisor, 2048);
    }
}
