//! Consensus engine interface shared by the proof-of-work and signer-voting
//! engines, plus the batch verification plumbing both use.

use crate::config::ChainConfig;
use crate::errors::ConsensusError;
use crate::state::StateDb;
use crate::types::{Address, Block, Header, Receipt, Transaction, H256};
use crossbeam_channel::{Receiver, Sender};
use primitive_types::U256;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Read access to the local chain needed during header verification.
pub trait ChainReader: Send + Sync {
    fn config(&self) -> &ChainConfig;
    fn current_header(&self) -> Header;
    fn get_header(&self, hash: &H256, number: u64) -> Option<Header>;
    fn get_header_by_number(&self, number: u64) -> Option<Header>;
    fn get_header_by_hash(&self, hash: &H256) -> Option<Header>;
    fn get_block(&self, hash: &H256, number: u64) -> Option<Block>;
}

/// Service an engine exposes to the RPC layer. Consumers downcast `service`
/// to the engine's concrete API type.
#[derive(Clone)]
pub struct ApiDescriptor {
    pub namespace: &'static str,
    pub version: &'static str,
    pub service: Arc<dyn Any + Send + Sync>,
    pub public: bool,
}

impl std::fmt::Debug for ApiDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiDescriptor")
            .field("namespace", &self.namespace)
            .field("version", &self.version)
            .field("public", &self.public)
            .finish()
    }
}

pub trait Engine: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Address that gets credited for the block: the coinbase for mined
    /// chains, the recovered signer for signed chains.
    fn author(&self, header: &Header) -> Result<Address, ConsensusError>;

    /// Author of blocks sealed locally, when the engine decides it rather
    /// than the header's coinbase.
    fn local_author(&self) -> Option<Address> {
        None
    }

    fn verify_header(&self, chain: &dyn ChainReader, header: &Header, seal: bool) -> Result<(), ConsensusError>;

    /// Verify `headers[index]`, treating the earlier entries of `headers` as
    /// its not-yet-stored ancestors.
    fn verify_batch_item(
        &self,
        chain: &dyn ChainReader,
        headers: &[Header],
        index: usize,
        seal: bool,
    ) -> Result<(), ConsensusError>;

    /// Verify a contiguous batch concurrently. Results come back through the
    /// handle in input order; dropping the handle aborts outstanding work.
    fn verify_headers(self: Arc<Self>, chain: Arc<dyn ChainReader>, headers: Vec<Header>, seals: Vec<bool>) -> VerifyHandle {
        verify_parallel(self, chain, headers, seals)
    }

    fn verify_uncles(&self, chain: &dyn ChainReader, block: &Block) -> Result<(), ConsensusError>;

    fn verify_seal(&self, chain: &dyn ChainReader, header: &Header) -> Result<(), ConsensusError>;

    /// Fill in the consensus fields of a header about to be built on.
    fn prepare(&self, chain: &dyn ChainReader, header: &mut Header) -> Result<(), ConsensusError>;

    /// Apply block rewards, set the state root and assemble the block.
    fn finalize(
        &self,
        chain: &dyn ChainReader,
        header: Header,
        state: &mut StateDb,
        txs: Vec<Transaction>,
        uncles: Vec<Header>,
        receipts: &[Receipt],
    ) -> Result<Block, ConsensusError>;

    /// Produce a sealed version of `block`. Returns `Ok(None)` when `stop`
    /// fires (a message or a dropped sender) before a seal is found.
    fn seal(&self, chain: &dyn ChainReader, block: &Block, stop: &Receiver<()>) -> Result<Option<Block>, ConsensusError>;

    fn calc_difficulty(&self, chain: &dyn ChainReader, time: u64, parent: &Header) -> U256;

    fn apis(self: Arc<Self>, chain: Arc<dyn ChainReader>) -> Vec<ApiDescriptor>;

    /// Release background resources.
    fn close(&self) {}
}

type VerifyResult = (usize, Result<(), ConsensusError>);

/// Ordered view over the results of a batch verification.
pub struct VerifyHandle {
    abort: Arc<AtomicBool>,
    results: Receiver<VerifyResult>,
    pending: BTreeMap<usize, Result<(), ConsensusError>>,
    cursor: usize,
    total: usize,
}

impl VerifyHandle {
    fn new(total: usize) -> (Self, Sender<VerifyResult>) {
        let (tx, rx) = crossbeam_channel::bounded(total.max(1));
        let handle = Self {
            abort: Arc::new(AtomicBool::new(false)),
            results: rx,
            pending: BTreeMap::new(),
            cursor: 0,
            total,
        };
        (handle, tx)
    }

    /// Build a handle over already known results.
    pub fn ready(results: Vec<Result<(), ConsensusError>>) -> Self {
        let (handle, tx) = Self::new(results.len());
        for item in results.into_iter().enumerate() {
            let _ = tx.send(item);
        }
        handle
    }

    /// Result for the next header in input order, blocking until it is
    /// available. `None` once every result was consumed.
    pub fn next_result(&mut self) -> Option<Result<(), ConsensusError>> {
        if self.cursor >= self.total {
            return None;
        }
        loop {
            if let Some(res) = self.pending.remove(&self.cursor) {
                self.cursor += 1;
                return Some(res);
            }
            match self.results.recv() {
                Ok((index, res)) => {
                    self.pending.insert(index, res);
                }
                Err(_) => return None,
            }
        }
    }

    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }
}

impl Drop for VerifyHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Spread a batch over worker threads, each pulling the next unverified index.
pub fn verify_parallel<E: Engine + ?Sized>(
    engine: Arc<E>,
    chain: Arc<dyn ChainReader>,
    headers: Vec<Header>,
    seals: Vec<bool>,
) -> VerifyHandle {
    let total = headers.len();
    let (handle, tx) = VerifyHandle::new(total);
    if total == 0 {
        return handle;
    }
    let headers = Arc::new(headers);
    let seals = Arc::new(seals);
    let next = Arc::new(AtomicUsize::new(0));
    let workers = num_cpus::get().min(total).max(1);

    for _ in 0..workers {
        let (engine, chain, headers, seals) = (engine.clone(), chain.clone(), headers.clone(), seals.clone());
        let (next, abort, tx) = (next.clone(), handle.abort.clone(), tx.clone());
        std::thread::spawn(move || loop {
            if abort.load(Ordering::Relaxed) {
                break;
            }
            let index = next.fetch_add(1, Ordering::SeqCst);
            if index >= headers.len() {
                break;
            }
            let seal = seals.get(index).copied().unwrap_or(true);
            let res = engine.verify_batch_item(chain.as_ref(), &headers, index, seal);
            if tx.send((index, res)).is_err() {
                break;
            }
        });
    }
    handle
}

/// Verify a batch on one background thread, in order. Used by engines whose
/// verification of a header depends on the outcome of its predecessors.
pub fn verify_sequential<E: Engine + ?Sized>(
    engine: Arc<E>,
    chain: Arc<dyn ChainReader>,
    headers: Vec<Header>,
    seals: Vec<bool>,
) -> VerifyHandle {
    let (handle, tx) = VerifyHandle::new(headers.len());
    let abort = handle.abort.clone();
    std::thread::spawn(move || {
        for index in 0..headers.len() {
            if abort.load(Ordering::Relaxed) {
                break;
            }
            let seal = seals.get(index).copied().unwrap_or(true);
            let res = engine.verify_batch_item(chain.as_ref(), &headers, index, seal);
            if tx.send((index, res)).is_err() {
                break;
            }
        }
    });
    handle
}

/// Parent of `headers[index]`: the previous batch entry, or the stored header.
pub fn batch_parent(chain: &dyn ChainReader, headers: &[Header], index: usize) -> Option<Header> {
    let header = headers.get(index)?;
    if index > 0 {
        let prev = &headers[index - 1];
        if prev.hash() == header.parent_hash && prev.number.checked_add(1) == Some(header.number) {
            return Some(prev.clone());
        }
        return None;
    }
    if header.number == 0 {
        return None;
    }
    chain.get_header(&header.parent_hash, header.number - 1)
}

/// In-memory chain reader for engine tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::ChainReader;
    use crate::config::ChainConfig;
    use crate::types::{Block, Header, H256};
    use parking_lot::RwLock;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct TestChain {
        pub config: ChainConfig,
        blocks: RwLock<HashMap<H256, Block>>,
        head: RwLock<Option<Header>>,
    }

    impl TestChain {
        pub fn new(config: ChainConfig) -> Self {
            Self {
                config,
                ..Self::default()
            }
        }

        pub fn add(&self, block: &Block) {
            self.blocks.write().insert(block.hash(), block.clone());
            *self.head.write() = Some(block.header().clone());
        }

        pub fn add_header(&self, header: &Header) {
            self.add(&Block::from_header(header.clone()));
        }
    }

    impl ChainReader for TestChain {
        fn config(&self) -> &ChainConfig {
            &self.config
        }
        fn current_header(&self) -> Header {
            self.head.read().clone().unwrap_or_default()
        }
        fn get_header(&self, hash: &H256, number: u64) -> Option<Header> {
            self.get_block(hash, number).map(|b| b.header().clone())
        }
        fn get_header_by_number(&self, number: u64) -> Option<Header> {
            self.blocks
                .read()
                .values()
                .find(|b| b.number() == number)
                .map(|b| b.header().clone())
        }
        fn get_header_by_hash(&self, hash: &H256) -> Option<Header> {
            self.blocks.read().get(hash).map(|b| b.header().clone())
        }
        fn get_block(&self, hash: &H256, number: u64) -> Option<Block> {
            self.blocks.read().get(hash).filter(|b| b.number() == number).cloned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_handle_yields_in_order() {
        let mut handle = VerifyHandle::ready(vec![Ok(()), Err(ConsensusError::InvalidPow), Ok(())]);
        assert!(handle.next_result().unwrap().is_ok());
        assert!(matches!(handle.next_result(), Some(Err(ConsensusError::InvalidPow))));
        assert!(handle.next_result().unwrap().is_ok());
        assert!(handle.next_result().is_none());
    }

    #[test]
    fn out_of_order_arrivals_are_reordered() {
        let (mut handle, tx) = VerifyHandle::new(3);
        tx.send((2, Ok(()))).unwrap();
        tx.send((0, Err(ConsensusError::FutureBlock))).unwrap();
        tx.send((1, Ok(()))).unwrap();
        assert!(matches!(handle.next_result(), Some(Err(ConsensusError::FutureBlock))));
        assert!(handle.next_result().unwrap().is_ok());
        assert!(handle.next_result().unwrap().is_ok());
    }
}
