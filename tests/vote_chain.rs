use primitive_types::U256;
use secp256k1::SecretKey;
use std::sync::Arc;
use vertex_node::chain::{BlockChain, Genesis, TransferExecutor};
use vertex_node::config::{CacheConfig, ChainConfig, MinerConfig, VoteParams};
use vertex_node::consensus_vote::{
    checkpoint_extra, sign_header, signer_address, VoteEngine, DIFF_IN_TURN, DIFF_NO_TURN, NONCE_AUTH_VOTE,
};
use vertex_node::errors::{ChainError, ConsensusError};
use vertex_node::miner::Miner;
use vertex_node::store::MemoryStore;
use vertex_node::types::{Address, Block, BlockNonce, Header, Transaction};

const EPOCH: u64 = 30_000;

fn key(seed: u8) -> SecretKey {
    SecretKey::from_slice(&[seed; 32]).unwrap()
}

struct Network {
    engine: Arc<VoteEngine>,
    chain: Arc<BlockChain>,
}

impl Network {
    fn new(signers: &[&SecretKey]) -> Self {
        Self::funded(signers, &[])
    }

    fn funded(signers: &[&SecretKey], accounts: &[(Address, U256)]) -> Self {
        let addrs: Vec<Address> = signers.iter().map(|k| signer_address(k)).collect();
        let db = MemoryStore::shared();
        Genesis::dev_vote(5, 1, EPOCH, &addrs, accounts).commit(&db).unwrap();

        let engine = Arc::new(VoteEngine::new(VoteParams { period: 1, epoch: EPOCH }, db.clone()));
        let chain = BlockChain::new(
            db,
            CacheConfig::default(),
            ChainConfig::vote(5, 1, EPOCH),
            engine.clone(),
            Arc::new(TransferExecutor),
        )
        .unwrap();
        Self { engine, chain }
    }

    /// Empty block on `parent` signed by `key`, optionally casting a vote.
    fn block(&self, parent: &Block, key: &SecretKey, vote: Option<Address>) -> Block {
        let signer = signer_address(key);
        let number = parent.number() + 1;
        let snap = self
            .engine
            .snapshot(&*self.chain, parent.number(), parent.hash(), &[])
            .unwrap();
        let difficulty = if snap.inturn(number, &signer) { DIFF_IN_TURN } else { DIFF_NO_TURN };

        let mut header = Header {
            parent_hash: parent.hash(),
            number,
            time: parent.time() + 1,
            gas_limit: parent.gas_limit(),
            difficulty: U256::from(difficulty),
            extra: checkpoint_extra(b"", &[]),
            state_root: parent.root(),
            ..Header::default()
        };
        if let Some(target) = vote {
            header.coinbase = target;
            header.nonce = BlockNonce(NONCE_AUTH_VOTE);
        }
        let mut header = Block::new(header, vec![], vec![], &[]).header().clone();
        sign_header(&mut header, key).unwrap();
        Block::from_header(header)
    }
}

#[test]
fn rotating_signers_extend_the_chain() {
    let (a, b) = (key(1), key(2));
    let net = Network::new(&[&a, &b]);

    let mut parent = net.chain.genesis();
    for i in 0..6 {
        let signer = if i % 2 == 0 { &a } else { &b };
        let block = net.block(&parent, signer, None);
        net.chain.insert_chain(vec![block.clone()]).unwrap();
        parent = block;
    }
    assert_eq!(net.chain.current_block().number(), 6);
    assert_eq!(net.chain.current_block().hash(), parent.hash());
    net.chain.stop();
}

#[test]
fn signer_may_not_seal_twice_in_a_row() {
    let (a, b) = (key(1), key(2));
    let net = Network::new(&[&a, &b]);

    let b1 = net.block(&net.chain.genesis(), &a, None);
    net.chain.insert_chain(vec![b1.clone()]).unwrap();
    let again = net.block(&b1, &a, None);

    let err = net.chain.insert_chain(vec![again]).unwrap_err();
    assert!(matches!(
        err.source,
        ChainError::Consensus(ConsensusError::Recently(signer)) if signer == signer_address(&a)
    ));
    assert_eq!(net.chain.current_block().hash(), b1.hash());
    net.chain.stop();
}

#[test]
fn outsiders_cannot_seal() {
    let (a, b, mallory) = (key(1), key(2), key(9));
    let net = Network::new(&[&a, &b]);

    let forged = net.block(&net.chain.genesis(), &mallory, None);
    let err = net.chain.insert_chain(vec![forged]).unwrap_err();
    assert!(matches!(
        err.source,
        ChainError::Consensus(ConsensusError::Unauthorized(signer)) if signer == signer_address(&mallory)
    ));
    assert_eq!(net.chain.current_block().number(), 0);
    net.chain.stop();
}

#[test]
fn majority_vote_authorizes_a_new_signer() {
    let (a, b, c) = (key(1), key(2), key(3));
    let net = Network::new(&[&a, &b]);
    let candidate = signer_address(&c);

    let b1 = net.block(&net.chain.genesis(), &a, Some(candidate));
    net.chain.insert_chain(vec![b1.clone()]).unwrap();
    let snap = net.engine.snapshot(&*net.chain, 1, b1.hash(), &[]).unwrap();
    assert!(!snap.is_signer(&candidate));

    let b2 = net.block(&b1, &b, Some(candidate));
    net.chain.insert_chain(vec![b2.clone()]).unwrap();
    let snap = net.engine.snapshot(&*net.chain, 2, b2.hash(), &[]).unwrap();
    assert!(snap.is_signer(&candidate));
    assert_eq!(snap.signers().len(), 3);

    // The new signer can seal right away.
    let b3 = net.block(&b2, &c, None);
    net.chain.insert_chain(vec![b3.clone()]).unwrap();
    assert_eq!(net.chain.current_block().hash(), b3.hash());
    net.chain.stop();
}

#[test]
fn mined_block_with_fees_imports_and_pays_the_signer() {
    let a = key(1);
    let sender = Address([0xa1; 20]);
    let net = Network::funded(&[&a], &[(sender, U256::from(10u64).pow(U256::from(18u64)))]);
    let signer = signer_address(&a);
    net.engine.authorize(a);

    let miner = Miner::new(net.chain.clone(), Arc::new(TransferExecutor), MinerConfig::default()).unwrap();
    let tx = Transaction {
        nonce: 0,
        gas_price: U256::from(2u64),
        gas_limit: 50_000,
        to: Some(Address([0xb0; 20])),
        value: U256::from(7u64),
        data: Vec::new(),
        from: sender,
    };
    let (_keep, stop) = crossbeam_channel::bounded::<()>(1);
    let block = miner.mine_block(&[tx], &stop).unwrap().unwrap();

    assert_eq!(block.transactions().len(), 1);
    assert_eq!(net.chain.current_block().hash(), block.hash());
    let mut state = net.chain.state_at(block.root()).unwrap();
    assert_eq!(state.get_balance(&signer).unwrap(), U256::from(2u64 * 21_000));
    assert!(state.get_balance(&Address::zero()).unwrap().is_zero());
    net.chain.stop();
}
