//! Authorization snapshot: the signer set, recent signers, pending votes and
//! tallies at one block, derived by replaying header votes.

use crate::errors::{ConsensusError, StoreError};
use crate::store::KvStore;
use crate::types::{Address, Header, H256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Store key prefix of persisted snapshots.
pub const SNAPSHOT_PREFIX: &[u8] = b"epvdpos-";

/// Vote direction carried in the header nonce.
pub const NONCE_AUTH_VOTE: [u8; 8] = [0xff; 8];
pub const NONCE_DROP_VOTE: [u8; 8] = [0x00; 8];

/// Empty marker so the signer set serializes as a JSON object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Present {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub authorize: bool,
    pub votes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub signer: Address,
    pub block: u64,
    pub address: Address,
    pub authorize: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(skip)]
    epoch: u64,

    pub number: u64,
    pub hash: H256,
    pub signers: BTreeMap<Address, Present>,
    pub recents: BTreeMap<u64, Address>,
    pub votes: Vec<Vote>,
    pub tally: BTreeMap<Address, Tally>,
}

fn snapshot_key(hash: &H256) -> Vec<u8> {
    [SNAPSHOT_PREFIX, hash.as_bytes()].concat()
}

impl Snapshot {
    pub fn new(epoch: u64, number: u64, hash: H256, signers: &[Address]) -> Self {
        Self {
            epoch: epoch.max(1),
            number,
            hash,
            signers: signers.iter().map(|s| (*s, Present {})).collect(),
            recents: BTreeMap::new(),
            votes: Vec::new(),
            tally: BTreeMap::new(),
        }
    }

    /// Load the snapshot stored for `hash`, if any.
    pub fn load(epoch: u64, db: &dyn KvStore, hash: &H256) -> Result<Option<Self>, StoreError> {
        let Some(blob) = db.get(&snapshot_key(hash))? else {
            return Ok(None);
        };
        let mut snap: Snapshot = serde_json::from_slice(&blob)?;
        snap.epoch = epoch.max(1);
        Ok(Some(snap))
    }

    pub fn store(&self, db: &dyn KvStore) -> Result<(), StoreError> {
        let blob = serde_json::to_vec(self)?;
        db.put(&snapshot_key(&self.hash), &blob)
    }

    /// Whether a vote would change the signer set.
    pub fn valid_vote(&self, address: &Address, authorize: bool) -> bool {
        self.signers.contains_key(address) != authorize
    }

    fn cast(&mut self, address: Address, authorize: bool) -> bool {
        if !self.valid_vote(&address, authorize) {
            return false;
        }
        self.tally
            .entry(address)
            .and_modify(|t| t.votes += 1)
            .or_insert(Tally { authorize, votes: 1 });
        true
    }

    fn uncast(&mut self, address: &Address, authorize: bool) -> bool {
        let Some(tally) = self.tally.get_mut(address) else {
            return false;
        };
        if tally.authorize != authorize {
            return false;
        }
        if tally.votes > 1 {
            tally.votes -= 1;
        } else {
            self.tally.remove(address);
        }
        true
    }

    /// Number of most recent blocks within which a signer may sign once.
    pub fn recent_limit(&self) -> u64 {
        (self.signers.len() / 2 + 1) as u64
    }

    /// Replay `headers` on top of this snapshot. `recover` yields the signer
    /// of a header.
    pub fn apply<F>(&self, headers: &[Header], recover: F) -> Result<Snapshot, ConsensusError>
    where
        F: Fn(&Header) -> Result<Address, ConsensusError>,
    {
        if headers.is_empty() {
            return Ok(self.clone());
        }
        for pair in headers.windows(2) {
            if pair[0].number.checked_add(1) != Some(pair[1].number) {
                return Err(ConsensusError::InvalidVotingChain);
            }
        }
        if self.number.checked_add(1) != Some(headers[0].number) {
            return Err(ConsensusError::InvalidVotingChain);
        }

        let mut snap = self.clone();
        for header in headers {
            let number = header.number;
            if number % snap.epoch == 0 {
                snap.votes.clear();
                snap.tally.clear();
            }
            let limit = snap.recent_limit();
            if number >= limit {
                snap.recents.remove(&(number - limit));
            }

            let signer = recover(header)?;
            if !snap.signers.contains_key(&signer) {
                return Err(ConsensusError::Unauthorized(signer));
            }
            if snap.recents.values().any(|recent| *recent == signer) {
                return Err(ConsensusError::Recently(signer));
            }
            snap.recents.insert(number, signer);

            // A newer vote from the same signer for the same target replaces the old one.
            if let Some(pos) = snap
                .votes
                .iter()
                .position(|v| v.signer == signer && v.address == header.coinbase)
            {
                let old = snap.votes.remove(pos);
                snap.uncast(&old.address, old.authorize);
            }

            let authorize = match header.nonce.0 {
                NONCE_AUTH_VOTE => true,
                NONCE_DROP_VOTE => false,
                _ => return Err(ConsensusError::InvalidVote),
            };
            if snap.cast(header.coinbase, authorize) {
                snap.votes.push(Vote {
                    signer,
                    block: number,
                    address: header.coinbase,
                    authorize,
                });
            }

            let target = header.coinbase;
            let passed = snap
                .tally
                .get(&target)
                .filter(|t| t.votes > snap.signers.len() / 2)
                .copied();
            if let Some(tally) = passed {
                if tally.authorize {
                    snap.signers.insert(target, Present {});
                } else {
                    snap.signers.remove(&target);

                    let limit = snap.recent_limit();
                    if number >= limit {
                        snap.recents.remove(&(number - limit));
                    }
                    let dropped: Vec<Vote> = snap.votes.iter().filter(|v| v.signer == target).cloned().collect();
                    for vote in &dropped {
                        snap.uncast(&vote.address, vote.authorize);
                    }
                    snap.votes.retain(|v| v.signer != target);
                }
                snap.votes.retain(|v| v.address != target);
                snap.tally.remove(&target);
            }
        }
        snap.number += headers.len() as u64;
        snap.hash = headers[headers.len() - 1].hash();
        Ok(snap)
    }

    /// Authorized signers in ascending order.
    pub fn signers(&self) -> Vec<Address> {
        self.signers.keys().copied().collect()
    }

    pub fn is_signer(&self, address: &Address) -> bool {
        self.signers.contains_key(address)
    }

    /// Whether `signer` is the expected signer of block `number`.
    pub fn inturn(&self, number: u64, signer: &Address) -> bool {
        let signers = self.signers();
        if signers.is_empty() {
            return false;
        }
        let offset = signers.iter().position(|s| s == signer).unwrap_or(signers.len());
        (number % signers.len() as u64) == offset as u64
    }

    /// Whether `signer` signed within the recent window and must wait before
    /// signing `number`.
    pub fn signed_recently(&self, number: u64, signer: &Address) -> bool {
        let limit = self.recent_limit();
        self.recents
            .iter()
            .any(|(seen, recent)| recent == signer && (number < limit || *seen > number - limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::BlockNonce;

    fn addr(n: u8) -> Address {
        Address([n; 20])
    }

    /// Headers whose signer is encoded in the first extra byte.
    fn header(number: u64, signer: u8, target: Address, authorize: bool) -> Header {
        Header {
            number,
            coinbase: target,
            extra: vec![signer],
            nonce: BlockNonce(if authorize { NONCE_AUTH_VOTE } else { NONCE_DROP_VOTE }),
            ..Header::default()
        }
    }

    fn recover(h: &Header) -> Result<Address, ConsensusError> {
        h.extra.first().map(|b| addr(*b)).ok_or(ConsensusError::MissingSignature)
    }

    fn four_signers() -> Snapshot {
        Snapshot::new(30_000, 0, H256::zero(), &[addr(1), addr(2), addr(3), addr(4)])
    }

    #[test]
    fn drop_vote_passes_on_majority() {
        let snap = four_signers();
        let target = addr(4);
        let one = snap.apply(&[header(1, 1, target, false)], recover).unwrap();
        assert!(one.is_signer(&target));
        assert_eq!(one.tally[&target].votes, 1);

        let two = one.apply(&[header(2, 2, target, false)], recover).unwrap();
        assert!(two.is_signer(&target));
        assert_eq!(two.recent_limit(), 3);

        let three = two.apply(&[header(3, 3, target, false)], recover).unwrap();
        assert!(!three.is_signer(&target));
        assert!(three.tally.is_empty());
        assert!(three.votes.is_empty());
        assert_eq!(three.recent_limit(), 2);
        assert_eq!(three.recents.len(), 2);
        assert!(!three.recents.contains_key(&1));
    }

    #[test]
    fn recent_signers_are_rejected() {
        let snap = four_signers();
        let headers = [header(1, 1, Address::zero(), false), header(2, 2, Address::zero(), false)];
        let snap = snap.apply(&headers, recover).unwrap();
        assert!(matches!(
            snap.apply(&[header(3, 1, Address::zero(), false)], recover),
            Err(ConsensusError::Recently(_))
        ));
        // after floor(4/2)+1 blocks the first signer may sign again
        let snap = snap.apply(&[header(3, 3, Address::zero(), false)], recover).unwrap();
        assert!(snap.apply(&[header(4, 1, Address::zero(), false)], recover).is_ok());
    }

    #[test]
    fn no_signer_twice_in_recent_window() {
        let mut snap = four_signers();
        let order = [1u8, 2, 3, 4, 1, 2, 3, 4, 2, 1, 4, 3];
        for (i, signer) in order.iter().enumerate() {
            snap = snap
                .apply(&[header(i as u64 + 1, *signer, Address::zero(), false)], recover)
                .unwrap();
            let mut seen: Vec<&Address> = snap.recents.values().collect();
            let total = seen.len();
            seen.sort();
            seen.dedup();
            assert_eq!(seen.len(), total);
            assert!(total as u64 <= snap.recent_limit());
        }
    }

    #[test]
    fn unauthorized_and_invalid_votes() {
        let snap = four_signers();
        assert!(matches!(
            snap.apply(&[header(1, 9, Address::zero(), false)], recover),
            Err(ConsensusError::Unauthorized(_))
        ));
        let mut bad = header(1, 1, addr(7), true);
        bad.nonce = BlockNonce::from_u64(5);
        assert!(matches!(snap.apply(&[bad], recover), Err(ConsensusError::InvalidVote)));
        assert!(matches!(
            snap.apply(&[header(2, 1, addr(7), true)], recover),
            Err(ConsensusError::InvalidVotingChain)
        ));
    }

    #[test]
    fn repeated_vote_replaces_previous() {
        let snap = Snapshot::new(30_000, 0, H256::zero(), &[addr(1), addr(2), addr(3)]);
        let target = addr(9);
        let snap = snap
            .apply(
                &[
                    header(1, 1, target, true),
                    header(2, 2, Address::zero(), false),
                    header(3, 3, Address::zero(), false),
                    header(4, 1, target, true),
                ],
                recover,
            )
            .unwrap();
        assert_eq!(snap.tally[&target].votes, 1);
        assert_eq!(snap.votes.iter().filter(|v| v.address == target).count(), 1);
    }

    #[test]
    fn authorize_passes_and_epoch_clears() {
        let snap = Snapshot::new(4, 0, H256::zero(), &[addr(1), addr(2)]);
        let target = addr(5);
        let snap = snap.apply(&[header(1, 1, target, true)], recover).unwrap();
        assert!(!snap.is_signer(&target));
        let snap = snap.apply(&[header(2, 2, target, true)], recover).unwrap();
        assert!(snap.is_signer(&target));
        assert!(snap.tally.is_empty());

        let snap = snap.apply(&[header(3, 1, addr(6), true)], recover).unwrap();
        assert_eq!(snap.votes.len(), 1);
        let snap = snap.apply(&[header(4, 5, Address::zero(), false)], recover).unwrap();
        assert!(snap.votes.is_empty());
        assert!(snap.tally.is_empty());
    }

    #[test]
    fn inturn_follows_sorted_signers() {
        let snap = Snapshot::new(30_000, 0, H256::zero(), &[addr(3), addr(1), addr(2)]);
        assert_eq!(snap.signers(), vec![addr(1), addr(2), addr(3)]);
        assert!(snap.inturn(0, &addr(1)));
        assert!(snap.inturn(4, &addr(2)));
        assert!(!snap.inturn(4, &addr(3)));
        assert!(!snap.inturn(4, &addr(8)));
    }

    #[test]
    fn store_and_load_as_json() {
        let db = MemoryStore::new();
        let snap = four_signers()
            .apply(&[header(1, 1, addr(4), false)], recover)
            .unwrap();
        snap.store(&db).unwrap();

        let loaded = Snapshot::load(30_000, &db, &snap.hash).unwrap().unwrap();
        assert_eq!(loaded, snap);
        let raw = db.get(&[b"epvdpos-".as_slice(), snap.hash.as_bytes()].concat()).unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert!(json["signers"].is_object());
        assert_eq!(json["number"], 1);
        assert!(Snapshot::load(30_000, &db, &H256([1; 32])).unwrap().is_none());
    }
}
