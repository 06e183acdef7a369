//! Account state over the trie database.
//!
//! State is a three-level, content-addressed tree: a root node holding one
//! bucket hash per leading address nibble, bucket nodes holding the accounts
//! of that nibble, and one storage node per account with storage. A zero hash
//! stands for an empty subtree. Mutations stay in memory until
//! [`StateDb::commit`] writes the changed nodes and returns the new root.

use super::database::TrieDatabase;
use crate::errors::StateError;
use crate::store::schema;
use crate::types::{blake3_hash, Address, H256};
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

const BUCKETS: usize = 16;

pub fn empty_code_hash() -> H256 {
    blake3_hash(&[])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: H256,
    pub code_hash: H256,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::zero(),
            storage_root: H256::zero(),
            code_hash: empty_code_hash(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum StateNode {
    Root(Vec<H256>),
    Bucket(BTreeMap<Address, Account>),
    Storage(BTreeMap<H256, H256>),
}

#[derive(Debug, Clone)]
struct StateObject {
    account: Account,
    storage: Option<BTreeMap<H256, H256>>,
    storage_dirty: bool,
}

#[derive(Clone)]
pub struct StateDb {
    db: Arc<TrieDatabase>,
    root: H256,
    buckets: Vec<H256>,
    objects: HashMap<Address, StateObject>,
    dirty: BTreeSet<Address>,
    new_code: HashMap<H256, Vec<u8>>,
}

fn bucket_of(addr: &Address) -> usize {
    (addr.0[0] >> 4) as usize
}

impl StateDb {
    /// Open the state at `root`. Fails with `MissingNode` when the root is
    /// neither cached nor on disk.
    pub fn new(root: H256, db: Arc<TrieDatabase>) -> Result<Self, StateError> {
        let buckets = if root.is_zero() {
            vec![H256::zero(); BUCKETS]
        } else {
            match bincode::deserialize::<StateNode>(&db.node(&root)?)? {
                StateNode::Root(buckets) if buckets.len() == BUCKETS => buckets,
                _ => return Err(StateError::MissingNode(root)),
            }
        };
        Ok(Self {
            db,
            root,
            buckets,
            objects: HashMap::new(),
            dirty: BTreeSet::new(),
            new_code: HashMap::new(),
        })
    }

    pub fn database(&self) -> &Arc<TrieDatabase> {
        &self.db
    }

    /// Root this state was opened at or last committed to.
    pub fn original_root(&self) -> H256 {
        self.root
    }

    fn load_bucket(&self, idx: usize) -> Result<BTreeMap<Address, Account>, StateError> {
        let hash = self.buckets[idx];
        if hash.is_zero() {
            return Ok(BTreeMap::new());
        }
        match bincode::deserialize::<StateNode>(&self.db.node(&hash)?)? {
            StateNode::Bucket(map) => Ok(map),
            _ => Err(StateError::MissingNode(hash)),
        }
    }

    fn load_storage(&self, root: &H256) -> Result<BTreeMap<H256, H256>, StateError> {
        if root.is_zero() {
            return Ok(BTreeMap::new());
        }
        match bincode::deserialize::<StateNode>(&self.db.node(root)?)? {
            StateNode::Storage(map) => Ok(map),
            _ => Err(StateError::MissingNode(*root)),
        }
    }

    fn object(&mut self, addr: &Address) -> Result<Option<&mut StateObject>, StateError> {
        if !self.objects.contains_key(addr) {
            let Some(account) = self.load_bucket(bucket_of(addr))?.remove(addr) else {
                return Ok(None);
            };
            self.objects.insert(
                *addr,
                StateObject {
                    account,
                    storage: None,
                    storage_dirty: false,
                },
            );
        }
        Ok(self.objects.get_mut(addr))
    }

    fn object_or_create(&mut self, addr: &Address) -> Result<&mut StateObject, StateError> {
        if self.object(addr)?.is_none() {
            self.objects.insert(
                *addr,
                StateObject {
                    account: Account::default(),
                    storage: Some(BTreeMap::new()),
                    storage_dirty: false,
                },
            );
        }
        self.dirty.insert(*addr);
        self.objects
            .get_mut(addr)
            .ok_or(StateError::MissingNode(H256::zero()))
    }

    pub fn exist(&mut self, addr: &Address) -> Result<bool, StateError> {
        Ok(self.object(addr)?.is_some())
    }

    pub fn get_account(&mut self, addr: &Address) -> Result<Option<Account>, StateError> {
        Ok(self.object(addr)?.map(|o| o.account.clone()))
    }

    pub fn get_balance(&mut self, addr: &Address) -> Result<U256, StateError> {
        Ok(self.object(addr)?.map(|o| o.account.balance).unwrap_or_default())
    }

    pub fn get_nonce(&mut self, addr: &Address) -> Result<u64, StateError> {
        Ok(self.object(addr)?.map(|o| o.account.nonce).unwrap_or(0))
    }

    pub fn get_code_hash(&mut self, addr: &Address) -> Result<H256, StateError> {
        Ok(self
            .object(addr)?
            .map(|o| o.account.code_hash)
            .unwrap_or_else(empty_code_hash))
    }

    pub fn get_code(&mut self, addr: &Address) -> Result<Vec<u8>, StateError> {
        let hash = self.get_code_hash(addr)?;
        if hash == empty_code_hash() {
            return Ok(Vec::new());
        }
        if let Some(code) = self.new_code.get(&hash) {
            return Ok(code.clone());
        }
        Ok(self.db.store().get(&schema::code_key(&hash))?.unwrap_or_default())
    }

    pub fn get_state(&mut self, addr: &Address, key: &H256) -> Result<H256, StateError> {
        let Some(root) = self.object(addr)?.map(|o| (o.storage.is_none(), o.account.storage_root)) else {
            return Ok(H256::zero());
        };
        if root.0 {
            let storage = self.load_storage(&root.1)?;
            if let Some(obj) = self.objects.get_mut(addr) {
                obj.storage = Some(storage);
            }
        }
        Ok(self
            .objects
            .get(addr)
            .and_then(|o| o.storage.as_ref())
            .and_then(|s| s.get(key).copied())
            .unwrap_or_default())
    }

    pub fn add_balance(&mut self, addr: &Address, amount: U256) -> Result<(), StateError> {
        let obj = self.object_or_create(addr)?;
        obj.account.balance = obj.account.balance.saturating_add(amount);
        Ok(())
    }

    pub fn sub_balance(&mut self, addr: &Address, amount: U256) -> Result<(), StateError> {
        let have = self.get_balance(addr)?;
        if have < amount {
            return Err(StateError::InsufficientBalance {
                address: *addr,
                have,
                want: amount,
            });
        }
        let obj = self.object_or_create(addr)?;
        obj.account.balance = have - amount;
        Ok(())
    }

    pub fn set_balance(&mut self, addr: &Address, amount: U256) -> Result<(), StateError> {
        self.object_or_create(addr)?.account.balance = amount;
        Ok(())
    }

    pub fn set_nonce(&mut self, addr: &Address, nonce: u64) -> Result<(), StateError> {
        self.object_or_create(addr)?.account.nonce = nonce;
        Ok(())
    }

    pub fn set_code(&mut self, addr: &Address, code: Vec<u8>) -> Result<(), StateError> {
        let hash = blake3_hash(&code);
        self.object_or_create(addr)?.account.code_hash = hash;
        if hash != empty_code_hash() {
            self.new_code.insert(hash, code);
        }
        Ok(())
    }

    pub fn set_state(&mut self, addr: &Address, key: H256, value: H256) -> Result<(), StateError> {
        self.get_state(addr, &key)?;
        let obj = self.object_or_create(addr)?;
        let storage = obj.storage.get_or_insert_with(BTreeMap::new);
        if value.is_zero() {
            storage.remove(&key);
        } else {
            storage.insert(key, value);
        }
        obj.storage_dirty = true;
        Ok(())
    }

    /// Root the state would commit to, without writing anything.
    pub fn intermediate_root(&self) -> Result<H256, StateError> {
        Ok(self.hash_nodes(false)?.0)
    }

    /// Write dirty nodes and new code, returning the new state root.
    pub fn commit(&mut self) -> Result<H256, StateError> {
        let (root, buckets, storage_roots) = self.hash_nodes(true)?;
        for (addr, storage_root) in storage_roots {
            if let Some(obj) = self.objects.get_mut(&addr) {
                obj.account.storage_root = storage_root;
                obj.storage_dirty = false;
            }
        }
        if !self.new_code.is_empty() {
            let mut batch = crate::store::WriteBatch::new();
            for (hash, code) in self.new_code.drain() {
                batch.put(schema::code_key(&hash), code);
            }
            self.db.store().write(batch)?;
        }
        self.root = root;
        self.buckets = buckets;
        self.dirty.clear();
        Ok(root)
    }

    #[allow(clippy::type_complexity)]
    fn hash_nodes(&self, insert: bool) -> Result<(H256, Vec<H256>, Vec<(Address, H256)>), StateError> {
        let mut buckets = self.buckets.clone();
        let mut storage_roots = Vec::new();
        if self.dirty.is_empty() {
            return Ok((self.root, buckets, storage_roots));
        }

        let mut by_bucket: BTreeMap<usize, Vec<Address>> = BTreeMap::new();
        for addr in &self.dirty {
            by_bucket.entry(bucket_of(addr)).or_default().push(*addr);
        }

        for (idx, addrs) in by_bucket {
            let mut accounts = self.load_bucket(idx)?;
            for addr in addrs {
                let Some(obj) = self.objects.get(&addr) else {
                    continue;
                };
                let mut account = obj.account.clone();
                if obj.storage_dirty {
                    if let Some(storage) = &obj.storage {
                        account.storage_root = self.put_node(StateNode::Storage(storage.clone()), vec![], insert, storage.is_empty())?;
                        storage_roots.push((addr, account.storage_root));
                    }
                }
                accounts.insert(addr, account);
            }
            let children: Vec<H256> = accounts
                .values()
                .map(|a| a.storage_root)
                .filter(|h| !h.is_zero())
                .collect();
            let empty = accounts.is_empty();
            buckets[idx] = self.put_node(StateNode::Bucket(accounts), children, insert, empty)?;
        }

        let children: Vec<H256> = buckets.iter().filter(|h| !h.is_zero()).copied().collect();
        let empty = children.is_empty();
        let root = self.put_node(StateNode::Root(buckets.clone()), children, insert, empty)?;
        Ok((root, buckets, storage_roots))
    }

    fn put_node(&self, node: StateNode, children: Vec<H256>, insert: bool, empty: bool) -> Result<H256, StateError> {
        if empty {
            return Ok(H256::zero());
        }
        let blob = bincode::serialize(&node)?;
        let hash = blake3_hash(&blob);
        if insert {
            self.db.insert(hash, blob, children);
        }
        Ok(hash)
    }
}
