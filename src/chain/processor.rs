//! Block execution.
//!
//! Transaction semantics sit behind [`Executor`]; the chain only relies on
//! the receipts, logs and gas an executor reports and the state it leaves
//! behind. [`TransferExecutor`] handles value transfers and code deployment,
//! which is all the node itself needs to run end to end.

use crate::consensus::{ChainReader, Engine};
use crate::errors::{ChainError, StateError};
use crate::state::{empty_code_hash, StateDb};
use crate::types::{
    blake3_hash, create_address, Address, Block, Bloom, Header, Log, Receipt, Transaction, H256,
    RECEIPT_STATUS_FAILED, RECEIPT_STATUS_SUCCESSFUL,
};
use primitive_types::U256;
use std::sync::Arc;

pub const TX_GAS: u64 = 21_000;
pub const TX_DATA_GAS_PER_BYTE: u64 = 68;

/// Gas still available to the transactions of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasPool(u64);

impl GasPool {
    pub fn new(gas: u64) -> Self {
        Self(gas)
    }

    pub fn sub_gas(&mut self, amount: u64) -> Result<(), StateError> {
        if self.0 < amount {
            return Err(StateError::GasLimitReached);
        }
        self.0 -= amount;
        Ok(())
    }

    pub fn add_gas(&mut self, amount: u64) {
        self.0 = self.0.saturating_add(amount);
    }

    pub fn gas(&self) -> u64 {
        self.0
    }
}

/// Block-level inputs a transaction executes under.
#[derive(Debug, Clone, Copy)]
pub struct TxContext {
    pub coinbase: Address,
    pub number: u64,
    pub time: u64,
    /// Hash stamped into logs; zero while the block is still being built.
    pub block_hash: H256,
}

impl TxContext {
    pub fn new(header: &Header, author: Address, block_hash: H256) -> Self {
        Self {
            coinbase: author,
            number: header.number,
            time: header.time,
            block_hash,
        }
    }
}

pub trait Executor: Send + Sync {
    /// Execute `tx` on top of `state`. On error nothing was written and the
    /// transaction must not be included. `used_gas` is the block's running
    /// total and is advanced by the gas the transaction consumed.
    fn apply_transaction(
        &self,
        ctx: &TxContext,
        state: &mut StateDb,
        gas_pool: &mut GasPool,
        tx: &Transaction,
        tx_index: usize,
        used_gas: &mut u64,
    ) -> Result<Receipt, StateError>;
}

pub fn intrinsic_gas(data: &[u8]) -> u64 {
    TX_GAS + TX_DATA_GAS_PER_BYTE * data.len() as u64
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TransferExecutor;

impl Executor for TransferExecutor {
    fn apply_transaction(
        &self,
        ctx: &TxContext,
        state: &mut StateDb,
        gas_pool: &mut GasPool,
        tx: &Transaction,
        tx_index: usize,
        used_gas: &mut u64,
    ) -> Result<Receipt, StateError> {
        let gas = intrinsic_gas(&tx.data);
        if tx.gas_limit < gas {
            return Err(StateError::IntrinsicGas {
                have: tx.gas_limit,
                want: gas,
            });
        }
        let nonce = state.get_nonce(&tx.from)?;
        if nonce != tx.nonce {
            return Err(StateError::NonceMismatch {
                address: tx.from,
                state: nonce,
                tx: tx.nonce,
            });
        }
        let balance = state.get_balance(&tx.from)?;
        let cost = tx.cost();
        if balance < cost {
            return Err(StateError::InsufficientBalance {
                address: tx.from,
                have: balance,
                want: cost,
            });
        }
        gas_pool.sub_gas(tx.gas_limit)?;

        // Checks passed; from here on the transaction is included.
        let tx_hash = tx.hash();
        state.sub_balance(&tx.from, tx.gas_price * U256::from(tx.gas_limit))?;
        state.set_nonce(&tx.from, nonce + 1)?;

        let mut status = RECEIPT_STATUS_SUCCESSFUL;
        let mut contract_address = None;
        let mut logs = Vec::new();
        match tx.to {
            None => {
                let addr = create_address(&tx.from, tx.nonce);
                let taken = state.get_nonce(&addr)? != 0 || state.get_code_hash(&addr)? != empty_code_hash();
                if taken {
                    status = RECEIPT_STATUS_FAILED;
                } else {
                    state.sub_balance(&tx.from, tx.value)?;
                    state.add_balance(&addr, tx.value)?;
                    state.set_nonce(&addr, 1)?;
                    state.set_code(&addr, tx.data.clone())?;
                    contract_address = Some(addr);
                }
            }
            Some(to) => {
                state.sub_balance(&tx.from, tx.value)?;
                state.add_balance(&to, tx.value)?;
                if !tx.data.is_empty() {
                    logs.push(Log {
                        address: to,
                        topics: vec![blake3_hash(&tx.data)],
                        data: tx.data.clone(),
                        block_number: ctx.number,
                        tx_hash,
                        tx_index: tx_index as u32,
                        block_hash: ctx.block_hash,
                        index: 0,
                        removed: false,
                    });
                }
            }
        }

        // A failed deployment burns the whole allowance.
        let gas_used = if status == RECEIPT_STATUS_FAILED { tx.gas_limit } else { gas };
        let refund = tx.gas_limit - gas_used;
        state.add_balance(&tx.from, tx.gas_price * U256::from(refund))?;
        gas_pool.add_gas(refund);
        state.add_balance(&ctx.coinbase, tx.gas_price * U256::from(gas_used))?;
        *used_gas += gas_used;

        Ok(Receipt {
            status,
            cumulative_gas_used: *used_gas,
            bloom: Bloom::from_logs(&logs),
            logs,
            tx_hash,
            contract_address,
            gas_used,
        })
    }
}

#[derive(Debug, Default)]
pub struct ProcessOutput {
    pub receipts: Vec<Receipt>,
    pub logs: Vec<Log>,
    pub used_gas: u64,
}

pub trait Processor: Send + Sync {
    /// Run every transaction of `block` against `state` and apply the
    /// engine's finalisation (rewards). Does not commit the state.
    fn process(&self, chain: &dyn ChainReader, block: &Block, state: &mut StateDb) -> Result<ProcessOutput, ChainError>;
}

pub struct StateProcessor {
    engine: Arc<dyn Engine>,
    executor: Arc<dyn Executor>,
}

impl StateProcessor {
    pub fn new(engine: Arc<dyn Engine>, executor: Arc<dyn Executor>) -> Self {
        Self { engine, executor }
    }
}

impl Processor for StateProcessor {
    fn process(&self, chain: &dyn ChainReader, block: &Block, state: &mut StateDb) -> Result<ProcessOutput, ChainError> {
        let header = block.header();
        let author = self.engine.author(header)?;
        let ctx = TxContext::new(header, author, block.hash());
        let mut gas_pool = GasPool::new(header.gas_limit);
        let mut out = ProcessOutput::default();

        for (i, tx) in block.transactions().iter().enumerate() {
            let mut receipt = self
                .executor
                .apply_transaction(&ctx, state, &mut gas_pool, tx, i, &mut out.used_gas)?;
            for log in receipt.logs.iter_mut() {
                log.index = out.logs.len() as u32;
                out.logs.push(log.clone());
            }
            out.receipts.push(receipt);
        }
        self.engine.finalize(
            chain,
            header.clone(),
            state,
            block.transactions().to_vec(),
            block.uncles().to_vec(),
            &out.receipts,
        )?;
        Ok(out)
    }
}
