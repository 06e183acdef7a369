//! Deterministic block generation for tests and development chains.
//!
//! [`generate_chain`] builds `n` blocks on top of a parent, letting a
//! callback shape each one (coinbase, extra-data, transactions, uncles)
//! before the consensus engine finalizes it. Seals are not produced, so the
//! output only imports into a chain whose engine skips seal checks.

use super::processor::{Executor, GasPool, TxContext};
use super::validator::calc_gas_limit;
use crate::config::ChainConfig;
use crate::consensus::{ChainReader, Engine};
use crate::errors::{ChainError, StateError};
use crate::state::{StateDb, TrieDatabase};
use crate::types::{Address, Block, BlockNonce, Header, Receipt, Transaction, H256};
use std::sync::Arc;

/// Header lookups over a base chain extended by the blocks generated so far.
struct MakerChain<'a> {
    base: &'a dyn ChainReader,
    blocks: Vec<Block>,
}

impl MakerChain<'_> {
    fn find(&self, hash: &H256) -> Option<&Block> {
        self.blocks.iter().find(|b| b.hash() == *hash)
    }
}

impl ChainReader for MakerChain<'_> {
    fn config(&self) -> &ChainConfig {
        self.base.config()
    }

    fn current_header(&self) -> Header {
        match self.blocks.last() {
            Some(block) => block.header().clone(),
            None => self.base.current_header(),
        }
    }

    fn get_header(&self, hash: &H256, number: u64) -> Option<Header> {
        match self.find(hash) {
            Some(block) => Some(block.header().clone()),
            None => self.base.get_header(hash, number),
        }
    }

    fn get_header_by_number(&self, number: u64) -> Option<Header> {
        match self.blocks.iter().find(|b| b.number() == number) {
            Some(block) => Some(block.header().clone()),
            None => self.base.get_header_by_number(number),
        }
    }

    fn get_header_by_hash(&self, hash: &H256) -> Option<Header> {
        match self.find(hash) {
            Some(block) => Some(block.header().clone()),
            None => self.base.get_header_by_hash(hash),
        }
    }

    fn get_block(&self, hash: &H256, number: u64) -> Option<Block> {
        match self.find(hash) {
            Some(block) => Some(block.clone()),
            None => self.base.get_block(hash, number),
        }
    }
}

/// The block under construction, handed to the generator callback.
pub struct BlockGen<'a> {
    index: usize,
    parent: &'a Block,
    chain: &'a MakerChain<'a>,
    engine: &'a dyn Engine,
    executor: &'a dyn Executor,

    header: Header,
    state: StateDb,
    gas_pool: Option<GasPool>,
    used_gas: u64,
    txs: Vec<Transaction>,
    receipts: Vec<Receipt>,
    uncles: Vec<Header>,
}

impl<'a> BlockGen<'a> {
    /// Set the block's beneficiary. Must happen before any transaction is
    /// added.
    pub fn set_coinbase(&mut self, coinbase: Address) {
        self.header.coinbase = coinbase;
    }

    pub fn set_extra(&mut self, extra: Vec<u8>) {
        self.header.extra = extra;
    }

    pub fn set_nonce(&mut self, nonce: BlockNonce) {
        self.header.nonce = nonce;
    }

    /// Execute `tx` and include it. A transaction that fails to apply is
    /// not included.
    pub fn add_tx(&mut self, tx: Transaction) -> Result<&Receipt, StateError> {
        let gas_limit = self.header.gas_limit;
        let pool = self.gas_pool.get_or_insert_with(|| GasPool::new(gas_limit));
        let ctx = TxContext::new(&self.header, self.header.coinbase, H256::zero());
        let receipt = self.executor.apply_transaction(
            &ctx,
            &mut self.state,
            pool,
            &tx,
            self.txs.len(),
            &mut self.used_gas,
        )?;
        self.txs.push(tx);
        self.receipts.push(receipt);
        Ok(&self.receipts[self.receipts.len() - 1])
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Next nonce of `addr` in the state being built.
    pub fn tx_nonce(&mut self, addr: &Address) -> Result<u64, StateError> {
        self.state.get_nonce(addr)
    }

    pub fn add_uncle(&mut self, uncle: Header) {
        self.uncles.push(uncle);
    }

    /// A previously generated block of this run, or the parent of the block
    /// being built for `None`.
    pub fn prev_block(&self, index: Option<usize>) -> Option<&Block> {
        match index {
            None => Some(self.parent),
            Some(i) if i < self.index => self.chain.blocks.get(i),
            Some(_) => None,
        }
    }

    /// Push the timestamp forward, recomputing the difficulty.
    pub fn offset_time(&mut self, seconds: u64) {
        self.header.time += seconds;
        self.header.difficulty = self
            .engine
            .calc_difficulty(self.chain, self.header.time, self.parent.header());
    }

    pub fn state(&mut self) -> &mut StateDb {
        &mut self.state
    }
}

fn make_header(chain: &dyn ChainReader, parent: &Block, engine: &dyn Engine) -> Header {
    let time = parent.time() + 10;
    Header {
        parent_hash: parent.hash(),
        coinbase: parent.coinbase(),
        number: parent.number() + 1,
        time,
        gas_limit: calc_gas_limit(parent.header(), parent.gas_limit(), parent.gas_limit()),
        difficulty: engine.calc_difficulty(chain, time, parent.header()),
        ..Header::default()
    }
}

/// Build `n` blocks on top of `parent`, calling `gen` once per block.
/// Every block's state is committed to `triedb` so later blocks (and a
/// chain importing them) can build on it.
pub fn generate_chain<F>(
    chain: &dyn ChainReader,
    parent: &Block,
    engine: &dyn Engine,
    triedb: Arc<TrieDatabase>,
    executor: &dyn Executor,
    n: usize,
    mut gen: F,
) -> Result<(Vec<Block>, Vec<Vec<Receipt>>), ChainError>
where
    F: FnMut(usize, &mut BlockGen<'_>),
{
    let mut maker = MakerChain {
        base: chain,
        blocks: Vec::with_capacity(n),
    };
    let mut all_receipts = Vec::with_capacity(n);
    let mut parent = parent.clone();

    for i in 0..n {
        let state = StateDb::new(parent.root(), triedb.clone())?;
        let (block, receipts) = {
            let header = make_header(&maker, &parent, engine);
            let mut b = BlockGen {
                index: i,
                parent: &parent,
                chain: &maker,
                engine,
                executor,
                header,
                state,
                gas_pool: None,
                used_gas: 0,
                txs: Vec::new(),
                receipts: Vec::new(),
                uncles: Vec::new(),
            };
            gen(i, &mut b);

            let BlockGen {
                mut header,
                mut state,
                used_gas,
                txs,
                receipts,
                uncles,
                ..
            } = b;
            header.gas_used = used_gas;
            let block = engine.finalize(&maker, header, &mut state, txs, uncles, &receipts)?;
            let root = state.commit()?;
            triedb.commit(&root)?;
            (block, receipts)
        };
        parent = block.clone();
        maker.blocks.push(block);
        all_receipts.push(receipts);
    }
    Ok((maker.blocks, all_receipts))
}

/// `n` empty headers on top of `parent`, for header-only imports.
pub fn make_header_chain(
    chain: &dyn ChainReader,
    parent: &Block,
    engine: &dyn Engine,
    triedb: Arc<TrieDatabase>,
    executor: &dyn Executor,
    n: usize,
    seed: u8,
) -> Result<Vec<Header>, ChainError> {
    let (blocks, _) = generate_chain(chain, parent, engine, triedb, executor, n, |_, b| {
        b.set_coinbase(Address([seed; 20]))
    })?;
    Ok(blocks.iter().map(|b| b.header().clone()).collect())
}
