#![allow(dead_code)]

use primitive_types::U256;
use std::sync::Arc;
use vertex_node::chain::chain_makers::{generate_chain, BlockGen};
use vertex_node::chain::{BlockChain, Genesis, TransferExecutor};
use vertex_node::config::{CacheConfig, ChainConfig};
use vertex_node::consensus_pow::PowEngine;
use vertex_node::store::{MemoryStore, SharedStore};
use vertex_node::types::{Address, Block, Receipt, Transaction};

pub const ALICE: Address = Address([0xa1; 20]);
pub const BOB: Address = Address([0xb0; 20]);

pub fn funded_genesis() -> Genesis {
    Genesis::dev_pow(1337, &[(ALICE, U256::from(10u64).pow(U256::from(18u64)))])
}

/// A chain over `db`, which must already hold the genesis.
pub fn open_chain(db: SharedStore, cache: CacheConfig) -> Arc<BlockChain> {
    BlockChain::new(
        db,
        cache,
        ChainConfig::pow(1337),
        Arc::new(PowEngine::faker()),
        Arc::new(TransferExecutor),
    )
    .unwrap()
}

pub fn new_chain(cache: CacheConfig) -> Arc<BlockChain> {
    let db = MemoryStore::shared();
    funded_genesis().commit(&db).unwrap();
    open_chain(db, cache)
}

/// Chain used only to build blocks, so the chain under test never sees
/// their state before importing them.
pub struct Builder {
    pub chain: Arc<BlockChain>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            chain: new_chain(CacheConfig::default()),
        }
    }

    pub fn genesis(&self) -> Block {
        self.chain.genesis()
    }

    pub fn blocks<F>(&self, parent: &Block, n: usize, gen: F) -> Vec<Block>
    where
        F: FnMut(usize, &mut BlockGen<'_>),
    {
        self.blocks_and_receipts(parent, n, gen).0
    }

    pub fn blocks_and_receipts<F>(&self, parent: &Block, n: usize, gen: F) -> (Vec<Block>, Vec<Vec<Receipt>>)
    where
        F: FnMut(usize, &mut BlockGen<'_>),
    {
        generate_chain(
            &*self.chain,
            parent,
            self.chain.engine().as_ref(),
            self.chain.state_cache().clone(),
            &TransferExecutor,
            n,
            gen,
        )
        .unwrap()
    }
}

impl Drop for Builder {
    fn drop(&mut self) {
        self.chain.stop();
    }
}

pub fn with_coinbase(seed: u8) -> impl FnMut(usize, &mut BlockGen<'_>) {
    move |_, b| b.set_coinbase(Address([seed; 20]))
}

pub fn transfer(nonce: u64, to: Address, value: u64, data: Vec<u8>) -> Transaction {
    Transaction {
        nonce,
        gas_price: U256::one(),
        gas_limit: 100_000,
        to: Some(to),
        value: U256::from(value),
        data,
        from: ALICE,
    }
}
