//! Genesis block specification and database bootstrap.

use crate::config::ChainConfig;
use crate::errors::{ChainError, StateError};
use crate::state::{StateDb, TrieDatabase};
use crate::store::{schema, MemoryStore, SharedStore, WriteBatch};
use crate::types::{Address, Block, BlockNonce, Header, H256};
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub const DEFAULT_GENESIS_GAS_LIMIT: u64 = 8_000_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAccount {
    #[serde(default)]
    pub balance: U256,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code: Vec<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub storage: BTreeMap<H256, H256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genesis {
    pub config: ChainConfig,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub extra: Vec<u8>,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    #[serde(default = "default_difficulty")]
    pub difficulty: U256,
    #[serde(default)]
    pub mix_digest: H256,
    #[serde(default)]
    pub coinbase: Address,
    #[serde(default)]
    pub alloc: BTreeMap<Address, GenesisAccount>,
}

fn default_gas_limit() -> u64 {
    DEFAULT_GENESIS_GAS_LIMIT
}
fn default_difficulty() -> U256 {
    U256::from(131_072u64)
}

impl Default for Genesis {
    fn default() -> Self {
        Self {
            config: ChainConfig::default(),
            nonce: 66,
            timestamp: 0,
            extra: b"vertex genesis".to_vec(),
            gas_limit: default_gas_limit(),
            difficulty: default_difficulty(),
            mix_digest: H256::zero(),
            coinbase: Address::zero(),
            alloc: BTreeMap::new(),
        }
    }
}

impl Genesis {
    /// Proof-of-work development chain funding `accounts`.
    pub fn dev_pow(chain_id: u64, accounts: &[(Address, U256)]) -> Self {
        Self {
            config: ChainConfig::pow(chain_id),
            alloc: alloc_of(accounts),
            ..Self::default()
        }
    }

    /// Signer-voting chain whose first checkpoint authorises `signers`.
    pub fn dev_vote(chain_id: u64, period: u64, epoch: u64, signers: &[Address], accounts: &[(Address, U256)]) -> Self {
        Self {
            config: ChainConfig::vote(chain_id, period, epoch),
            nonce: 0,
            extra: crate::consensus_vote::checkpoint_extra(b"", signers),
            difficulty: U256::one(),
            alloc: alloc_of(accounts),
            ..Self::default()
        }
    }

    /// Build the genesis state into `db` (without flushing it) and return
    /// the genesis block.
    pub fn to_block(&self, db: Arc<TrieDatabase>) -> Result<Block, StateError> {
        let mut state = StateDb::new(H256::zero(), db)?;
        for (addr, account) in &self.alloc {
            state.add_balance(addr, account.balance)?;
            state.set_nonce(addr, account.nonce)?;
            if !account.code.is_empty() {
                state.set_code(addr, account.code.clone())?;
            }
            for (key, value) in &account.storage {
                state.set_state(addr, *key, *value)?;
            }
        }
        let root = state.commit()?;
        let header = Header {
            number: 0,
            nonce: BlockNonce::from_u64(self.nonce),
            time: self.timestamp,
            extra: self.extra.clone(),
            gas_limit: self.gas_limit,
            difficulty: self.difficulty,
            mix_digest: self.mix_digest,
            coinbase: self.coinbase,
            state_root: root,
            ..Header::default()
        };
        Ok(Block::new(header, Vec::new(), Vec::new(), &[]))
    }

    /// Write the genesis block, its state and chain config, and point every
    /// head marker at it.
    pub fn commit(&self, db: &SharedStore) -> Result<Block, ChainError> {
        let triedb = Arc::new(TrieDatabase::new(db.clone()));
        let block = self.to_block(triedb.clone())?;
        triedb.commit(&block.root())?;

        let hash = block.hash();
        let mut batch = WriteBatch::new();
        schema::write_td(&mut batch, &hash, 0, &block.difficulty())?;
        schema::write_block(&mut batch, &block)?;
        schema::write_receipts(&mut batch, &hash, 0, &[])?;
        schema::write_canonical_hash(&mut batch, &hash, 0);
        schema::write_head_block_hash(&mut batch, &hash);
        schema::write_head_fast_block_hash(&mut batch, &hash);
        schema::write_head_header_hash(&mut batch, &hash);
        db.write(batch)?;
        schema::write_chain_config(db.as_ref(), &hash, &self.config)?;
        Ok(block)
    }

    /// Hash the genesis would have, computed against a scratch store.
    pub fn hash(&self) -> Result<H256, StateError> {
        let scratch = Arc::new(TrieDatabase::new(Arc::new(MemoryStore::new())));
        Ok(self.to_block(scratch)?.hash())
    }
}

fn alloc_of(accounts: &[(Address, U256)]) -> BTreeMap<Address, GenesisAccount> {
    accounts
        .iter()
        .map(|(addr, balance)| {
            (
                *addr,
                GenesisAccount {
                    balance: *balance,
                    ..GenesisAccount::default()
                },
            )
        })
        .collect()
}

/// Make sure `db` holds a genesis block, writing `genesis` (or the default
/// one) into an empty database. A stored genesis that differs from the
/// supplied one is an error. Returns the chain config in effect and the
/// genesis hash.
pub fn setup_genesis_block(db: &SharedStore, genesis: Option<&Genesis>) -> Result<(ChainConfig, H256), ChainError> {
    let Some(stored) = schema::read_canonical_hash(db.as_ref(), 0)? else {
        let spec = genesis.cloned().unwrap_or_default();
        if genesis.is_none() {
            info!(target: "chain", "writing default genesis block");
        } else {
            info!(target: "chain", "writing custom genesis block");
        }
        let block = spec.commit(db)?;
        return Ok((spec.config, block.hash()));
    };

    if let Some(spec) = genesis {
        let hash = spec.hash()?;
        if hash != stored {
            return Err(ChainError::GenesisMismatch { stored, new: hash });
        }
        schema::write_chain_config(db.as_ref(), &stored, &spec.config)?;
        return Ok((spec.config.clone(), stored));
    }

    let config = schema::read_chain_config(db.as_ref(), &stored)?.unwrap_or_default();
    Ok((config, stored))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_writes_heads_state_and_config() {
        let db = MemoryStore::shared();
        let alice = Address([0xaa; 20]);
        let genesis = Genesis::dev_pow(7, &[(alice, U256::from(1_000u64))]);
        let block = genesis.commit(&db).unwrap();

        assert_eq!(schema::read_canonical_hash(db.as_ref(), 0).unwrap(), Some(block.hash()));
        assert_eq!(schema::read_head_block_hash(db.as_ref()).unwrap(), Some(block.hash()));
        assert_eq!(
            schema::read_chain_config(db.as_ref(), &block.hash()).unwrap(),
            Some(ChainConfig::pow(7))
        );
        let mut state = StateDb::new(block.root(), Arc::new(TrieDatabase::new(db))).unwrap();
        assert_eq!(state.get_balance(&alice).unwrap(), U256::from(1_000u64));
    }

    #[test]
    fn setup_rejects_a_different_genesis() {
        let db = MemoryStore::shared();
        let (config, hash) = setup_genesis_block(&db, None).unwrap();
        assert_eq!(config, ChainConfig::default());
        assert_eq!(hash, Genesis::default().hash().unwrap());

        let (_, again) = setup_genesis_block(&db, Some(&Genesis::default())).unwrap();
        assert_eq!(again, hash);

        let other = Genesis {
            timestamp: 99,
            ..Genesis::default()
        };
        assert!(matches!(
            setup_genesis_block(&db, Some(&other)),
            Err(ChainError::GenesisMismatch { .. })
        ));
    }

    #[test]
    fn genesis_json_takes_defaults() {
        let g: Genesis = serde_json::from_str(r#"{"config":{"chain_id":3,"vote":{"period":1,"epoch":30}}}"#).unwrap();
        assert_eq!(g.gas_limit, DEFAULT_GENESIS_GAS_LIMIT);
        assert_eq!(g.config.engine_name(), "vote");
    }
}
