//! Nonce search.
//!
//! One search thread per configured mining thread, each starting at its own
//! random nonce. The first thread that meets the target hands its header to
//! the coordinator; every other thread stops when the abort channel closes.
//! A thread-count change while sealing aborts the round and starts a new one.

use super::algorithm::{hashimoto_full, WordSource};
use super::difficulty::target_for;
use super::PowEngine;
use crate::config::PowMode;
use crate::errors::ConsensusError;
use crate::miner::stats::HashrateMeter;
use crate::types::{Block, BlockNonce, Header, H256};
use crossbeam_channel::{select, Receiver, Sender, TryRecvError};
use primitive_types::U256;
use tracing::{debug, trace};

/// Hashes between two hash-rate samples of a search thread.
const MARK_INTERVAL: u64 = 1 << 15;

enum Round {
    Found(Header),
    Stopped,
    Restart,
}

impl PowEngine {
    pub(super) fn seal_block(&self, block: &Block, stop: &Receiver<()>) -> Result<Option<Block>, ConsensusError> {
        if matches!(self.config.mode, PowMode::Fake | PowMode::FullFake) {
            let mut header = block.header().clone();
            header.nonce = BlockNonce::zero();
            header.mix_digest = H256::zero();
            return Ok(Some(block.with_seal(header)));
        }
        if let Some(shared) = &self.shared {
            return shared.seal_block(block, stop);
        }

        let dataset = self.dataset(block.number());
        let words = dataset
            .words()
            .ok_or_else(|| ConsensusError::Unsealable(format!("dataset for epoch {} unavailable", dataset.epoch())))?;

        loop {
            let threads = self.search_threads();
            let header = block.header().clone();
            debug!(target: "pow", number = header.number, threads, "started search for new nonces");

            let round = std::thread::scope(|s| {
                let (abort_tx, abort_rx) = crossbeam_channel::bounded::<()>(0);
                let (found_tx, found_rx) = crossbeam_channel::bounded::<Header>(0);
                for id in 0..threads {
                    let (abort, found, header) = (abort_rx.clone(), found_tx.clone(), &header);
                    let seed = rand::random::<u64>();
                    let meter = &self.hashrate;
                    s.spawn(move || mine(words, header, id, seed, &abort, &found, meter));
                }

                let round = select! {
                    recv(stop) -> _ => Round::Stopped,
                    recv(found_rx) -> found => match found {
                        Ok(header) => Round::Found(header),
                        Err(_) => Round::Stopped,
                    },
                    recv(self.update_rx) -> _ => Round::Restart,
                };
                drop(abort_tx);
                drop(found_tx);
                round
            });

            match round {
                Round::Found(sealed) => return Ok(Some(block.with_seal(sealed))),
                Round::Stopped => return Ok(None),
                Round::Restart => {
                    debug!(target: "pow", "mining thread count changed, restarting search");
                    continue;
                }
            }
        }
    }

    /// Configured thread count resolved to an actual number of searchers.
    fn search_threads(&self) -> usize {
        match self.threads() {
            0 => num_cpus::get(),
            n if n < 0 => 0,
            n => n as usize,
        }
    }
}

fn mine<W: WordSource + ?Sized>(
    dataset: &W,
    header: &Header,
    id: usize,
    seed: u64,
    abort: &Receiver<()>,
    found: &Sender<Header>,
    meter: &HashrateMeter,
) {
    let hash = header.hash_no_nonce().0;
    let target = target_for(header.difficulty);
    let mut attempts = 0u64;
    let mut nonce = seed;
    trace!(target: "pow", miner = id, seed, "started search for new nonces");

    loop {
        match abort.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => {
                trace!(target: "pow", miner = id, attempts = nonce.wrapping_sub(seed), "nonce search aborted");
                meter.mark(attempts);
                return;
            }
        }
        attempts += 1;
        if attempts % MARK_INTERVAL == 0 {
            meter.mark(attempts);
            attempts = 0;
        }

        let (digest, result) = hashimoto_full(dataset, &hash, nonce);
        if U256::from_big_endian(&result) <= target {
            let mut sealed = header.clone();
            sealed.nonce = BlockNonce::from_u64(nonce);
            sealed.mix_digest = H256(digest);
            select! {
                send(found, sealed) -> _ => {
                    trace!(target: "pow", miner = id, attempts = nonce.wrapping_sub(seed), nonce, "nonce found and reported");
                }
                recv(abort) -> _ => {
                    trace!(target: "pow", miner = id, attempts = nonce.wrapping_sub(seed), nonce, "nonce found but discarded");
                }
            }
            meter.mark(attempts);
            return;
        }
        nonce = nonce.wrapping_add(1);
    }
}
