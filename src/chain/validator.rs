//! Block validation: structural checks before execution and result checks
//! after it.

use crate::consensus::{ChainReader, Engine};
use crate::errors::ValidationError;
use crate::state::StateDb;
use crate::types::{calc_uncle_hash, create_bloom, derive_receipt_root, derive_tx_root, Block, Header, Receipt, H256};
use std::sync::Arc;

/// Chain access the validator needs on top of header lookups.
pub trait ChainStateReader: ChainReader {
    fn has_block(&self, hash: &H256, number: u64) -> bool;
    fn has_state(&self, root: &H256) -> bool;

    fn has_block_and_state(&self, hash: &H256, number: u64) -> bool {
        match self.get_block(hash, number) {
            Some(block) => self.has_state(&block.root()),
            None => false,
        }
    }

    fn as_chain_reader(&self) -> &dyn ChainReader;
}

pub trait Validator: Send + Sync {
    /// Uncles, transaction root and ancestry of a block whose header was
    /// already verified by the engine.
    fn validate_body(&self, chain: &dyn ChainStateReader, block: &Block) -> Result<(), ValidationError>;

    /// Post-execution comparison of the header against what processing
    /// actually produced.
    fn validate_state(
        &self,
        block: &Block,
        parent: &Block,
        state: &StateDb,
        receipts: &[Receipt],
        used_gas: u64,
    ) -> Result<(), ValidationError>;
}

pub struct BlockValidator {
    engine: Arc<dyn Engine>,
}

impl BlockValidator {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }
}

impl Validator for BlockValidator {
    fn validate_body(&self, chain: &dyn ChainStateReader, block: &Block) -> Result<(), ValidationError> {
        if chain.has_block_and_state(&block.hash(), block.number()) {
            return Err(ValidationError::KnownBlock);
        }
        let parent_number = block.number().saturating_sub(1);
        if !chain.has_block_and_state(&block.parent_hash(), parent_number) {
            if !chain.has_block(&block.parent_hash(), parent_number) {
                return Err(ValidationError::UnknownAncestor);
            }
            return Err(ValidationError::PrunedAncestor);
        }
        self.engine.verify_uncles(chain.as_chain_reader(), block)?;

        let header = block.header();
        let uncle_hash = calc_uncle_hash(block.uncles());
        if uncle_hash != header.uncle_hash {
            return Err(ValidationError::UncleRootMismatch {
                have: uncle_hash,
                want: header.uncle_hash,
            });
        }
        let tx_root = derive_tx_root(block.transactions());
        if tx_root != header.tx_root {
            return Err(ValidationError::TxRootMismatch {
                have: tx_root,
                want: header.tx_root,
            });
        }
        Ok(())
    }

    fn validate_state(
        &self,
        block: &Block,
        _parent: &Block,
        state: &StateDb,
        receipts: &[Receipt],
        used_gas: u64,
    ) -> Result<(), ValidationError> {
        let header = block.header();
        if header.gas_used != used_gas {
            return Err(ValidationError::GasUsedMismatch {
                remote: header.gas_used,
                local: used_gas,
            });
        }
        if create_bloom(receipts) != header.bloom {
            return Err(ValidationError::BloomMismatch);
        }
        let receipt_root = derive_receipt_root(receipts);
        if receipt_root != header.receipt_root {
            return Err(ValidationError::ReceiptRootMismatch {
                remote: header.receipt_root,
                local: receipt_root,
            });
        }
        let root = state.intermediate_root()?;
        if root != header.state_root {
            return Err(ValidationError::StateRootMismatch {
                remote: header.state_root,
                local: root,
            });
        }
        Ok(())
    }
}

/// Gas limit of the child of `parent`: usage above two thirds of the
/// parent's limit pushes it up, and it then drifts toward `[floor, ceil]`
/// by at most 1/1024 per block.
pub fn calc_gas_limit(parent: &Header, floor: u64, ceil: u64) -> u64 {
    const BOUND_DIVISOR: u64 = 1024;
    const MIN_GAS_LIMIT: u64 = 5000;

    let contrib = (parent.gas_used + parent.gas_used / 2) / BOUND_DIVISOR;
    let decay = (parent.gas_limit / BOUND_DIVISOR).saturating_sub(1);

    let mut limit = (parent.gas_limit - decay + contrib).max(MIN_GAS_LIMIT);
    if limit < floor {
        limit = (parent.gas_limit + decay).min(floor);
    } else if limit > ceil {
        limit = parent.gas_limit.saturating_sub(decay).max(ceil);
    }
    limit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Bloom;

    #[test]
    fn gas_limit_walks_toward_floor_and_ceiling() {
        let parent = Header {
            gas_limit: 5_000_000,
            ..Header::default()
        };
        let up = calc_gas_limit(&parent, 8_000_000, 8_000_000);
        assert_eq!(up, 5_000_000 + 5_000_000 / 1024 - 1);

        let parent = Header {
            gas_limit: 10_000_000,
            ..Header::default()
        };
        let down = calc_gas_limit(&parent, 8_000_000, 8_000_000);
        assert_eq!(down, 10_000_000 - (10_000_000 / 1024 - 1));

        let parent = Header {
            gas_limit: 8_000_000,
            gas_used: 8_000_000,
            ..Header::default()
        };
        let busy = calc_gas_limit(&parent, 1_000_000, 16_000_000);
        assert!(busy > 8_000_000);
    }

    #[test]
    fn state_checks_compare_header_with_results() {
        use crate::consensus_pow::PowEngine;
        use crate::state::TrieDatabase;
        use crate::store::MemoryStore;
        use crate::types::{Address, Log};
        use primitive_types::U256;

        let mut state = StateDb::new(H256::zero(), Arc::new(TrieDatabase::new(MemoryStore::shared()))).unwrap();
        state.add_balance(&Address([1; 20]), U256::from(7u64)).unwrap();
        let log = Log { address: Address([9; 20]), ..Log::default() };
        let receipts = vec![Receipt {
            cumulative_gas_used: 21_000,
            bloom: Bloom::from_logs(&[log.clone()]),
            logs: vec![log],
            ..Receipt::default()
        }];
        let header = Header {
            gas_used: 21_000,
            state_root: state.intermediate_root().unwrap(),
            ..Header::default()
        };
        let block = Block::new(header, vec![], vec![], &receipts);
        let parent = Block::from_header(Header::default());
        let validator = BlockValidator::new(Arc::new(PowEngine::faker()));

        validator.validate_state(&block, &parent, &state, &receipts, 21_000).unwrap();
        assert!(matches!(
            validator.validate_state(&block, &parent, &state, &receipts, 20_000),
            Err(ValidationError::GasUsedMismatch { remote: 21_000, local: 20_000 })
        ));
        assert!(matches!(
            validator.validate_state(&block, &parent, &state, &[], 21_000),
            Err(ValidationError::BloomMismatch)
        ));
        state.add_balance(&Address([2; 20]), U256::one()).unwrap();
        assert!(matches!(
            validator.validate_state(&block, &parent, &state, &receipts, 21_000),
            Err(ValidationError::StateRootMismatch { .. })
        ));
    }
}
