//! Signer-voting consensus engine.
//!
//! A fixed set of authorized signers takes turns sealing blocks. Each block
//! may carry one vote (target in the coinbase, direction in the nonce) to add
//! or drop a signer; a vote passes once more than half of the signers back
//! it. Every epoch block resets pending votes and lists the full signer set
//! in its extra-data.

pub mod api;
pub mod snapshot;

pub use api::VoteApi;
pub use snapshot::{Snapshot, Tally, Vote, NONCE_AUTH_VOTE, NONCE_DROP_VOTE};

use crate::bounded::LruCache;
use crate::config::VoteParams;
use crate::consensus::{verify_sequential, ApiDescriptor, ChainReader, Engine, VerifyHandle};
use crate::consensus_pow::unix_now;
use crate::errors::ConsensusError;
use crate::state::StateDb;
use crate::store::SharedStore;
use crate::types::{empty_uncle_hash, pubkey_to_address, Address, Block, BlockNonce, Header, Receipt, Transaction, H256};
use crossbeam_channel::{select, Receiver};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use primitive_types::U256;
use rand::seq::SliceRandom;
use rand::Rng;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Blocks after which the snapshot is persisted.
pub const CHECKPOINT_INTERVAL: u64 = 1024;
const INMEMORY_SNAPSHOTS: usize = 128;
const INMEMORY_SIGNATURES: usize = 4096;
/// Per-signer delay unit for out-of-turn blocks.
const WIGGLE_TIME: Duration = Duration::from_millis(500);

pub const EXTRA_VANITY: usize = 32;
pub const EXTRA_SEAL: usize = 65;

pub const DIFF_IN_TURN: u64 = 2;
pub const DIFF_NO_TURN: u64 = 1;

static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Hash a signer signs: the header with the signature bytes stripped.
pub fn seal_hash(header: &Header) -> H256 {
    let mut unsigned = header.clone();
    let keep = unsigned.extra.len().saturating_sub(EXTRA_SEAL);
    unsigned.extra.truncate(keep);
    unsigned.hash()
}

pub fn signer_address(key: &SecretKey) -> Address {
    pubkey_to_address(&PublicKey::from_secret_key(&SECP, key).serialize_uncompressed())
}

/// Write a recoverable signature over `seal_hash(header)` into the last
/// 65 extra-data bytes, growing extra-data when needed.
pub fn sign_header(header: &mut Header, key: &SecretKey) -> Result<(), ConsensusError> {
    if header.extra.len() < EXTRA_VANITY + EXTRA_SEAL {
        header.extra.resize(EXTRA_VANITY + EXTRA_SEAL, 0);
    }
    let msg = Message::from_slice(seal_hash(header).as_bytes()).map_err(|e| ConsensusError::Signature(e.to_string()))?;
    let (id, compact) = SECP.sign_ecdsa_recoverable(&msg, key).serialize_compact();
    let at = header.extra.len() - EXTRA_SEAL;
    header.extra[at..at + 64].copy_from_slice(&compact);
    header.extra[at + 64] = id.to_i32() as u8;
    Ok(())
}

/// Address that signed `header`, memoized by header hash.
pub fn ecrecover(header: &Header, cache: &LruCache<H256, Address>) -> Result<Address, ConsensusError> {
    let hash = header.hash();
    if let Some(address) = cache.get(&hash) {
        return Ok(address);
    }
    if header.extra.len() < EXTRA_SEAL {
        return Err(ConsensusError::MissingSignature);
    }
    let sig = &header.extra[header.extra.len() - EXTRA_SEAL..];
    let id = RecoveryId::from_i32(sig[64] as i32).map_err(|e| ConsensusError::Signature(e.to_string()))?;
    let sig = RecoverableSignature::from_compact(&sig[..64], id).map_err(|e| ConsensusError::Signature(e.to_string()))?;
    let msg = Message::from_slice(seal_hash(header).as_bytes()).map_err(|e| ConsensusError::Signature(e.to_string()))?;
    let pubkey = SECP
        .recover_ecdsa(&msg, &sig)
        .map_err(|e| ConsensusError::Signature(e.to_string()))?;
    let signer = pubkey_to_address(&pubkey.serialize_uncompressed());
    cache.insert(hash, signer);
    Ok(signer)
}

/// Signers listed in a checkpoint header's extra-data.
fn checkpoint_signers(header: &Header) -> Result<Vec<Address>, ConsensusError> {
    let len = header.extra.len();
    if len < EXTRA_VANITY + EXTRA_SEAL || (len - EXTRA_VANITY - EXTRA_SEAL) % Address::LEN != 0 {
        return Err(ConsensusError::InvalidCheckpointSigners);
    }
    Ok(header.extra[EXTRA_VANITY..len - EXTRA_SEAL]
        .chunks_exact(Address::LEN)
        .map(Address::from_slice)
        .collect())
}

/// Extra-data of a checkpoint block listing `signers`.
pub fn checkpoint_extra(vanity: &[u8], signers: &[Address]) -> Vec<u8> {
    let mut extra = vec![0u8; EXTRA_VANITY];
    let n = vanity.len().min(EXTRA_VANITY);
    extra[..n].copy_from_slice(&vanity[..n]);
    for signer in signers {
        extra.extend_from_slice(signer.as_bytes());
    }
    extra.resize(extra.len() + EXTRA_SEAL, 0);
    extra
}

pub struct VoteEngine {
    params: VoteParams,
    db: SharedStore,

    recents: LruCache<H256, Snapshot>,
    signatures: LruCache<H256, Address>,

    /// Pending local proposals: target → authorize.
    proposals: RwLock<HashMap<Address, bool>>,
    signer: RwLock<Option<(Address, SecretKey)>>,
}

impl VoteEngine {
    pub fn new(params: VoteParams, db: SharedStore) -> Self {
        let params = VoteParams {
            epoch: if params.epoch == 0 { VoteParams::default().epoch } else { params.epoch },
            ..params
        };
        Self {
            params,
            db,
            recents: LruCache::new(INMEMORY_SNAPSHOTS),
            signatures: LruCache::new(INMEMORY_SIGNATURES),
            proposals: RwLock::new(HashMap::new()),
            signer: RwLock::new(None),
        }
    }

    pub fn params(&self) -> &VoteParams {
        &self.params
    }

    /// Set the key used to seal new blocks.
    pub fn authorize(&self, key: SecretKey) {
        let address = signer_address(&key);
        info!(target: "vote", signer = %address, "local signer authorized");
        *self.signer.write() = Some((address, key));
    }

    pub fn local_signer(&self) -> Option<Address> {
        self.signer.read().as_ref().map(|(a, _)| *a)
    }

    pub fn propose(&self, address: Address, authorize: bool) {
        self.proposals.write().insert(address, authorize);
    }

    pub fn discard(&self, address: &Address) {
        self.proposals.write().remove(address);
    }

    pub fn proposals(&self) -> HashMap<Address, bool> {
        self.proposals.read().clone()
    }

    fn recover(&self, header: &Header) -> Result<Address, ConsensusError> {
        ecrecover(header, &self.signatures)
    }

    /// Authorization snapshot at (`number`, `hash`). `parents` are
    /// not-yet-stored ancestors ending at that block.
    pub fn snapshot(
        &self,
        chain: &dyn ChainReader,
        mut number: u64,
        mut hash: H256,
        parents: &[Header],
    ) -> Result<Snapshot, ConsensusError> {
        let mut headers: Vec<Header> = Vec::new();
        let mut parents = parents;

        let base = loop {
            if let Some(snap) = self.recents.get(&hash) {
                break snap;
            }
            if number % CHECKPOINT_INTERVAL == 0 {
                if let Some(snap) = Snapshot::load(self.params.epoch, self.db.as_ref(), &hash)? {
                    trace!(target: "vote", number, hash = %hash, "loaded voting snapshot from disk");
                    break snap;
                }
            }
            if number == 0 {
                let genesis = chain.get_header_by_number(0).ok_or(ConsensusError::UnknownAncestor)?;
                if genesis.hash() != hash {
                    return Err(ConsensusError::UnknownAncestor);
                }
                let signers = checkpoint_signers(&genesis)?;
                let snap = Snapshot::new(self.params.epoch, 0, hash, &signers);
                snap.store(self.db.as_ref())?;
                trace!(target: "vote", number, hash = %hash, "stored genesis voting snapshot to disk");
                break snap;
            }

            let header = match parents.split_last() {
                Some((last, rest)) => {
                    if last.hash() != hash || last.number != number {
                        return Err(ConsensusError::UnknownAncestor);
                    }
                    parents = rest;
                    last.clone()
                }
                None => chain.get_header(&hash, number).ok_or(ConsensusError::UnknownAncestor)?,
            };
            hash = header.parent_hash;
            number -= 1;
            headers.push(header);
        };

        headers.reverse();
        let snap = base.apply(&headers, |h| self.recover(h))?;
        self.recents.insert(snap.hash, snap.clone());

        if snap.number % CHECKPOINT_INTERVAL == 0 && !headers.is_empty() {
            snap.store(self.db.as_ref())?;
            trace!(target: "vote", number = snap.number, hash = %snap.hash, "stored voting snapshot to disk");
        }
        Ok(snap)
    }

    fn difficulty_for(snap: &Snapshot, signer: &Address) -> U256 {
        if snap.inturn(snap.number + 1, signer) {
            U256::from(DIFF_IN_TURN)
        } else {
            U256::from(DIFF_NO_TURN)
        }
    }

    /// Checks that need nothing but the header itself.
    fn verify_standalone(&self, header: &Header) -> Result<(), ConsensusError> {
        let number = header.number;
        if header.time > unix_now() {
            return Err(ConsensusError::FutureBlock);
        }
        let checkpoint = number % self.params.epoch == 0;
        if checkpoint && !header.coinbase.is_zero() {
            return Err(ConsensusError::InvalidCheckpointBeneficiary);
        }
        match header.nonce.0 {
            NONCE_DROP_VOTE => {}
            NONCE_AUTH_VOTE if !checkpoint => {}
            NONCE_AUTH_VOTE => return Err(ConsensusError::InvalidCheckpointVote),
            _ => return Err(ConsensusError::InvalidVote),
        }

        if header.extra.len() < EXTRA_VANITY {
            return Err(ConsensusError::MissingVanity);
        }
        if header.extra.len() < EXTRA_VANITY + EXTRA_SEAL {
            return Err(ConsensusError::MissingSignature);
        }
        let signer_bytes = header.extra.len() - EXTRA_VANITY - EXTRA_SEAL;
        if !checkpoint && signer_bytes != 0 {
            return Err(ConsensusError::ExtraSigners);
        }
        if checkpoint && signer_bytes % Address::LEN != 0 {
            return Err(ConsensusError::InvalidCheckpointSigners);
        }

        if !header.mix_digest.is_zero() {
            return Err(ConsensusError::NonZeroMixDigest);
        }
        if header.uncle_hash != empty_uncle_hash() {
            return Err(ConsensusError::InvalidUncleHash);
        }
        if number > 0 && header.difficulty != U256::from(DIFF_IN_TURN) && header.difficulty != U256::from(DIFF_NO_TURN) {
            return Err(ConsensusError::InvalidDifficulty {
                have: header.difficulty,
                want: U256::from(DIFF_IN_TURN),
            });
        }
        Ok(())
    }

    fn verify_with_parents(&self, chain: &dyn ChainReader, header: &Header, parents: &[Header]) -> Result<(), ConsensusError> {
        self.verify_standalone(header)?;
        let number = header.number;
        if number == 0 {
            return Ok(());
        }

        let parent = match parents.last() {
            Some(p) => Some(p.clone()),
            None => chain.get_header(&header.parent_hash, number - 1),
        };
        let parent = parent
            .filter(|p| p.number == number - 1 && p.hash() == header.parent_hash)
            .ok_or(ConsensusError::UnknownAncestor)?;
        if parent.time + self.params.period > header.time {
            return Err(ConsensusError::InvalidTimestamp);
        }

        let snap = self.snapshot(chain, number - 1, header.parent_hash, parents)?;
        if number % self.params.epoch == 0 && checkpoint_signers(header)? != snap.signers() {
            return Err(ConsensusError::InvalidCheckpointSigners);
        }
        self.verify_seal_with(header, &snap)
    }

    fn verify_seal_with(&self, header: &Header, snap: &Snapshot) -> Result<(), ConsensusError> {
        let number = header.number;
        let signer = self.recover(header)?;
        if !snap.is_signer(&signer) {
            return Err(ConsensusError::Unauthorized(signer));
        }
        if snap.signed_recently(number, &signer) {
            return Err(ConsensusError::Recently(signer));
        }
        let inturn = snap.inturn(number, &signer);
        if inturn && header.difficulty != U256::from(DIFF_IN_TURN) {
            return Err(ConsensusError::WrongDifficulty);
        }
        if !inturn && header.difficulty != U256::from(DIFF_NO_TURN) {
            return Err(ConsensusError::WrongDifficulty);
        }
        Ok(())
    }
}

impl Engine for VoteEngine {
    fn name(&self) -> &'static str {
        "vote"
    }

    fn author(&self, header: &Header) -> Result<Address, ConsensusError> {
        self.recover(header)
    }

    fn local_author(&self) -> Option<Address> {
        self.local_signer()
    }

    fn verify_header(&self, chain: &dyn ChainReader, header: &Header, _seal: bool) -> Result<(), ConsensusError> {
        self.verify_with_parents(chain, header, &[])
    }

    fn verify_batch_item(
        &self,
        chain: &dyn ChainReader,
        headers: &[Header],
        index: usize,
        _seal: bool,
    ) -> Result<(), ConsensusError> {
        self.verify_with_parents(chain, &headers[index], &headers[..index])
    }

    fn verify_headers(self: Arc<Self>, chain: Arc<dyn ChainReader>, headers: Vec<Header>, seals: Vec<bool>) -> VerifyHandle {
        verify_sequential(self, chain, headers, seals)
    }

    fn verify_uncles(&self, _chain: &dyn ChainReader, block: &Block) -> Result<(), ConsensusError> {
        if !block.uncles().is_empty() {
            return Err(ConsensusError::InvalidUncleHash);
        }
        Ok(())
    }

    fn verify_seal(&self, chain: &dyn ChainReader, header: &Header) -> Result<(), ConsensusError> {
        let number = header.number.checked_sub(1).ok_or(ConsensusError::UnknownBlock)?;
        let snap = self.snapshot(chain, number, header.parent_hash, &[])?;
        self.verify_seal_with(header, &snap)
    }

    fn prepare(&self, chain: &dyn ChainReader, header: &mut Header) -> Result<(), ConsensusError> {
        header.coinbase = Address::zero();
        header.nonce = BlockNonce::zero();

        let number = header.number;
        let parent_number = number.checked_sub(1).ok_or(ConsensusError::UnknownBlock)?;
        let snap = self.snapshot(chain, parent_number, header.parent_hash, &[])?;

        if number % self.params.epoch != 0 {
            let proposals = self.proposals.read();
            let candidates: Vec<(Address, bool)> = proposals
                .iter()
                .filter(|(address, authorize)| snap.valid_vote(address, **authorize))
                .map(|(a, auth)| (*a, *auth))
                .collect();
            if let Some((address, authorize)) = candidates.choose(&mut rand::thread_rng()) {
                header.coinbase = *address;
                header.nonce = BlockNonce(if *authorize { NONCE_AUTH_VOTE } else { NONCE_DROP_VOTE });
            }
        }

        let signer = self.local_signer().unwrap_or_default();
        header.difficulty = Self::difficulty_for(&snap, &signer);

        let vanity: Vec<u8> = header.extra.iter().take(EXTRA_VANITY).copied().collect();
        let signers = if number % self.params.epoch == 0 { snap.signers() } else { Vec::new() };
        header.extra = checkpoint_extra(&vanity, &signers);
        header.mix_digest = H256::zero();

        let parent = chain
            .get_header(&header.parent_hash, parent_number)
            .ok_or(ConsensusError::UnknownAncestor)?;
        header.time = (parent.time + self.params.period).max(unix_now());
        Ok(())
    }

    fn finalize(
        &self,
        _chain: &dyn ChainReader,
        mut header: Header,
        state: &mut StateDb,
        txs: Vec<Transaction>,
        _uncles: Vec<Header>,
        receipts: &[Receipt],
    ) -> Result<Block, ConsensusError> {
        header.state_root = state.intermediate_root()?;
        header.uncle_hash = empty_uncle_hash();
        Ok(Block::new(header, txs, Vec::new(), receipts))
    }

    fn seal(&self, chain: &dyn ChainReader, block: &Block, stop: &Receiver<()>) -> Result<Option<Block>, ConsensusError> {
        let mut header = block.header().clone();
        let number = header.number;
        if number == 0 {
            return Err(ConsensusError::UnknownBlock);
        }
        if self.params.period == 0 && block.transactions().is_empty() {
            return Err(ConsensusError::Unsealable("waiting for transactions".into()));
        }
        let (signer, key) = self
            .signer
            .read()
            .clone()
            .ok_or_else(|| ConsensusError::Unsealable("no local signer".into()))?;

        let snap = self.snapshot(chain, number - 1, header.parent_hash, &[])?;
        if !snap.is_signer(&signer) {
            return Err(ConsensusError::Unauthorized(signer));
        }
        if snap.signed_recently(number, &signer) {
            info!(target: "vote", number, "signed recently, must wait for others");
            let _ = stop.recv();
            return Ok(None);
        }

        let mut delay = Duration::from_secs(header.time.saturating_sub(unix_now()));
        if header.difficulty == U256::from(DIFF_NO_TURN) {
            let wiggle = WIGGLE_TIME * (snap.signers.len() / 2 + 1) as u32;
            delay += Duration::from_millis(rand::thread_rng().gen_range(0..=wiggle.as_millis() as u64));
            trace!(target: "vote", ?wiggle, "out-of-turn signing requested");
        }
        trace!(target: "vote", ?delay, "waiting for slot to sign and propagate");
        select! {
            recv(stop) -> _ => return Ok(None),
            default(delay) => {}
        }

        sign_header(&mut header, &key)?;
        debug!(target: "vote", number, signer = %signer, "sealed block");
        Ok(Some(block.with_seal(header)))
    }

    fn calc_difficulty(&self, chain: &dyn ChainReader, _time: u64, parent: &Header) -> U256 {
        let signer = self.local_signer().unwrap_or_default();
        match self.snapshot(chain, parent.number, parent.hash(), &[]) {
            Ok(snap) => Self::difficulty_for(&snap, &signer),
            Err(e) => {
                debug!(target: "vote", error = %e, "no snapshot for difficulty");
                U256::zero()
            }
        }
    }

    fn apis(self: Arc<Self>, chain: Arc<dyn ChainReader>) -> Vec<ApiDescriptor> {
        vec![ApiDescriptor {
            namespace: "vote",
            version: "1.0",
            service: Arc::new(VoteApi::new(chain, self)),
            public: false,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainConfig;
    use crate::consensus::testing::TestChain;
    use crate::store::MemoryStore;

    fn key(n: u8) -> SecretKey {
        SecretKey::from_slice(&[n; 32]).unwrap()
    }

    struct Net {
        keys: Vec<SecretKey>,
        chain: Arc<TestChain>,
        engine: Arc<VoteEngine>,
        db: SharedStore,
        genesis: Header,
    }

    fn net(signers: u8, epoch: u64) -> Net {
        let keys: Vec<SecretKey> = (1..=signers).map(key).collect();
        let addrs: Vec<Address> = keys.iter().map(signer_address).collect();
        let genesis = Header {
            extra: checkpoint_extra(b"genesis", &addrs),
            time: unix_now() - 10_000,
            gas_limit: 8_000_000,
            ..Header::default()
        };
        let chain = Arc::new(TestChain::new(ChainConfig::vote(7, 1, epoch)));
        chain.add_header(&genesis);
        let db = MemoryStore::shared();
        let engine = Arc::new(VoteEngine::new(VoteParams { period: 1, epoch }, db.clone()));
        Net {
            keys,
            chain,
            engine,
            db,
            genesis,
        }
    }

    impl Net {
        /// Signed child of `parent` by `signer`, with an optional vote.
        fn block(&self, parent: &Header, signer: &SecretKey, vote: Option<(Address, bool)>) -> Header {
            let number = parent.number + 1;
            let snap = self
                .engine
                .snapshot(&*self.chain, parent.number, parent.hash(), &[])
                .unwrap();
            let signers = if number % self.engine.params.epoch == 0 { snap.signers() } else { vec![] };
            let mut h = Header {
                parent_hash: parent.hash(),
                number,
                time: parent.time + 1,
                gas_limit: parent.gas_limit,
                extra: checkpoint_extra(b"", &signers),
                difficulty: VoteEngine::difficulty_for(&snap, &signer_address(signer)),
                ..Header::default()
            };
            if let Some((target, authorize)) = vote {
                h.coinbase = target;
                h.nonce = BlockNonce(if authorize { NONCE_AUTH_VOTE } else { NONCE_DROP_VOTE });
            }
            sign_header(&mut h, signer).unwrap();
            h
        }
    }

    #[test]
    fn signatures_recover_to_signer() {
        let k = key(3);
        let mut h = Header {
            number: 5,
            ..Header::default()
        };
        sign_header(&mut h, &k).unwrap();
        let cache = LruCache::new(16);
        assert_eq!(ecrecover(&h, &cache).unwrap(), signer_address(&k));
        assert_eq!(cache.len(), 1);
        h.number = 6;
        assert_ne!(ecrecover(&h, &cache).unwrap(), signer_address(&k));
    }

    #[test]
    fn signed_chain_verifies() {
        let n = net(3, 30_000);
        let mut parent = n.genesis.clone();
        for i in 0..6usize {
            let h = n.block(&parent, &n.keys[i % 3], None);
            n.engine.verify_header(&*n.chain, &h, true).unwrap();
            n.chain.add_header(&h);
            parent = h;
        }
        assert_eq!(n.engine.author(&parent).unwrap(), signer_address(&n.keys[2]));
    }

    #[test]
    fn rejects_unauthorized_and_recent_signers() {
        let n = net(3, 30_000);
        let outsider = key(9);
        let h = n.block(&n.genesis, &outsider, None);
        assert!(matches!(
            n.engine.verify_header(&*n.chain, &h, true),
            Err(ConsensusError::Unauthorized(_))
        ));

        let b1 = n.block(&n.genesis, &n.keys[0], None);
        n.chain.add_header(&b1);
        let again = n.block(&b1, &n.keys[0], None);
        assert!(matches!(
            n.engine.verify_header(&*n.chain, &again, true),
            Err(ConsensusError::Recently(_))
        ));

        let mut wrong = n.block(&b1, &n.keys[1], None);
        wrong.difficulty = if wrong.difficulty == U256::from(DIFF_IN_TURN) {
            U256::from(DIFF_NO_TURN)
        } else {
            U256::from(DIFF_IN_TURN)
        };
        sign_header(&mut wrong, &n.keys[1]).unwrap();
        assert!(matches!(
            n.engine.verify_header(&*n.chain, &wrong, true),
            Err(ConsensusError::WrongDifficulty)
        ));
    }

    #[test]
    fn majority_drop_vote_through_engine() {
        let n = net(4, 30_000);
        let target = signer_address(&n.keys[3]);
        let mut parent = n.genesis.clone();
        let mut headers = Vec::new();
        for i in 0..3 {
            let h = n.block(&parent, &n.keys[i], Some((target, false)));
            n.chain.add_header(&h);
            headers.push(h.clone());
            parent = h;
        }
        let before = n
            .engine
            .snapshot(&*n.chain, 2, headers[1].hash(), &[])
            .unwrap();
        assert!(before.is_signer(&target));
        assert_eq!(before.recent_limit(), 3);

        let after = n.engine.snapshot(&*n.chain, 3, headers[2].hash(), &[]).unwrap();
        assert!(!after.is_signer(&target));
        assert_eq!(after.recent_limit(), 2);
        assert!(after.tally.is_empty());
    }

    #[test]
    fn batch_verification_uses_unstored_parents() {
        let n = net(2, 30_000);
        let b1 = n.block(&n.genesis, &n.keys[1], None);
        n.chain.add_header(&b1);
        let b2 = n.block(&b1, &n.keys[0], None);
        let headers = vec![b1, b2];
        let chain: Arc<dyn ChainReader> = n.chain.clone();
        let mut handle = n.engine.clone().verify_headers(chain, headers, vec![true, true]);
        assert!(handle.next_result().unwrap().is_ok());
        assert!(handle.next_result().unwrap().is_ok());
        assert!(handle.next_result().is_none());
    }

    #[test]
    fn checkpoint_must_list_signers() {
        let n = net(2, 2);
        let b1 = n.block(&n.genesis, &n.keys[1], None);
        n.chain.add_header(&b1);
        let good = n.block(&b1, &n.keys[0], None);
        n.engine.verify_header(&*n.chain, &good, true).unwrap();

        let mut bad = good.clone();
        bad.extra = checkpoint_extra(b"", &[signer_address(&n.keys[0])]);
        sign_header(&mut bad, &n.keys[0]).unwrap();
        assert!(matches!(
            n.engine.verify_header(&*n.chain, &bad, true),
            Err(ConsensusError::InvalidCheckpointSigners)
        ));

        let mut voting = good;
        voting.nonce = BlockNonce(NONCE_AUTH_VOTE);
        assert!(matches!(
            n.engine.verify_header(&*n.chain, &voting, true),
            Err(ConsensusError::InvalidCheckpointVote)
        ));
    }

    #[test]
    fn prepare_and_seal_in_turn() {
        let n = net(2, 30_000);
        let snap = n.engine.snapshot(&*n.chain, 0, n.genesis.hash(), &[]).unwrap();
        let in_turn = n
            .keys
            .iter()
            .find(|k| snap.inturn(1, &signer_address(k)))
            .copied()
            .unwrap();
        n.engine.authorize(in_turn);
        let outsider = Address([0x42; 20]);
        n.engine.propose(outsider, true);

        let mut header = Header {
            parent_hash: n.genesis.hash(),
            number: 1,
            gas_limit: n.genesis.gas_limit,
            ..Header::default()
        };
        n.engine.prepare(&*n.chain, &mut header).unwrap();
        assert_eq!(header.coinbase, outsider);
        assert_eq!(header.nonce.0, NONCE_AUTH_VOTE);
        assert_eq!(header.difficulty, U256::from(DIFF_IN_TURN));
        assert_eq!(header.extra.len(), EXTRA_VANITY + EXTRA_SEAL);

        let (_stop_tx, stop) = crossbeam_channel::bounded::<()>(1);
        let sealed = n
            .engine
            .seal(&*n.chain, &Block::from_header(header), &stop)
            .unwrap()
            .unwrap();
        n.engine.verify_header(&*n.chain, sealed.header(), true).unwrap();
        assert_eq!(n.engine.author(sealed.header()).unwrap(), signer_address(&in_turn));
    }

    #[test]
    fn genesis_snapshot_is_persisted() {
        let n = net(3, 30_000);
        let snap = n.engine.snapshot(&*n.chain, 0, n.genesis.hash(), &[]).unwrap();
        let loaded = Snapshot::load(30_000, n.db.as_ref(), &n.genesis.hash()).unwrap().unwrap();
        assert_eq!(loaded.signers(), snap.signers());
        assert_eq!(loaded.signers().len(), 3);
    }
}
