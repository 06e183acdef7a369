//! Voting-engine service: inspect snapshots and manage local proposals.

use super::{Snapshot, VoteEngine};
use crate::consensus::ChainReader;
use crate::errors::ConsensusError;
use crate::types::{Address, Header, H256};
use std::collections::HashMap;
use std::sync::Arc;

pub struct VoteApi {
    chain: Arc<dyn ChainReader>,
    engine: Arc<VoteEngine>,
}

impl VoteApi {
    pub fn new(chain: Arc<dyn ChainReader>, engine: Arc<VoteEngine>) -> Self {
        Self { chain, engine }
    }

    /// Header at `number`, or the current head when `None`.
    fn header_at(&self, number: Option<u64>) -> Result<Header, ConsensusError> {
        match number {
            None => Ok(self.chain.current_header()),
            Some(n) => self.chain.get_header_by_number(n).ok_or(ConsensusError::UnknownBlock),
        }
    }

    fn snapshot_of(&self, header: &Header) -> Result<Snapshot, ConsensusError> {
        self.engine
            .snapshot(&*self.chain, header.number, header.hash(), &[])
    }

    pub fn get_snapshot(&self, number: Option<u64>) -> Result<Snapshot, ConsensusError> {
        let header = self.header_at(number)?;
        self.snapshot_of(&header)
    }

    pub fn get_snapshot_at_hash(&self, hash: &H256) -> Result<Snapshot, ConsensusError> {
        let header = self.chain.get_header_by_hash(hash).ok_or(ConsensusError::UnknownBlock)?;
        self.snapshot_of(&header)
    }

    pub fn get_signers(&self, number: Option<u64>) -> Result<Vec<Address>, ConsensusError> {
        Ok(self.get_snapshot(number)?.signers())
    }

    pub fn get_signers_at_hash(&self, hash: &H256) -> Result<Vec<Address>, ConsensusError> {
        Ok(self.get_snapshot_at_hash(hash)?.signers())
    }

    pub fn proposals(&self) -> HashMap<Address, bool> {
        self.engine.proposals()
    }

    /// Queue a vote the local signer casts whenever it seals a block.
    pub fn propose(&self, address: Address, authorize: bool) {
        self.engine.propose(address, authorize);
    }

    pub fn discard(&self, address: &Address) {
        self.engine.discard(address);
    }
}
