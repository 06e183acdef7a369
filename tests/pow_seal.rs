use primitive_types::U256;
use std::sync::Arc;
use vertex_node::chain::{BlockChain, Genesis, TransferExecutor};
use vertex_node::config::{CacheConfig, ChainConfig, MinerConfig, PowParams};
use vertex_node::consensus::Engine;
use vertex_node::consensus_pow::PowEngine;
use vertex_node::errors::{ChainError, ConsensusError};
use vertex_node::miner::Miner;
use vertex_node::store::MemoryStore;
use vertex_node::types::BlockNonce;

fn low_difficulty_chain() -> (Arc<BlockChain>, Arc<PowEngine>) {
    let config = ChainConfig {
        pow: Some(PowParams {
            minimum_difficulty: U256::from(64u64),
            ..PowParams::default()
        }),
        ..ChainConfig::pow(99)
    };
    let genesis = Genesis {
        config: config.clone(),
        difficulty: U256::from(64u64),
        ..Genesis::default()
    };
    let db = MemoryStore::shared();
    genesis.commit(&db).unwrap();

    let engine = Arc::new(PowEngine::tester());
    engine.set_threads(2);
    let chain = BlockChain::new(
        db,
        CacheConfig::default(),
        config,
        engine.clone(),
        Arc::new(TransferExecutor),
    )
    .unwrap();
    (chain, engine)
}

#[test]
fn mined_blocks_pass_seal_verification_on_import() {
    let (chain, engine) = low_difficulty_chain();
    let miner = Miner::new(chain.clone(), Arc::new(TransferExecutor), MinerConfig::default()).unwrap();
    let (_keep, stop) = crossbeam_channel::bounded::<()>(1);

    let first = miner.mine_block(&[], &stop).unwrap().unwrap();
    let second = miner.mine_block(&[], &stop).unwrap().unwrap();
    assert_eq!(chain.current_block().hash(), second.hash());
    assert_eq!(second.parent_hash(), first.hash());
    assert_eq!(first.difficulty(), U256::from(64u64));

    engine.verify_seal(&*chain, second.header()).unwrap();
    assert!(engine.hashrate() >= 0.0);
    chain.stop();
}

#[test]
fn tampered_seal_is_rejected_on_import() {
    let (chain, engine) = low_difficulty_chain();
    let miner = Miner::new(chain.clone(), Arc::new(TransferExecutor), MinerConfig::default()).unwrap();
    let (_keep, stop) = crossbeam_channel::bounded::<()>(1);
    let sealed = miner.mine_block(&[], &stop).unwrap().unwrap();

    let mut header = sealed.header().clone();
    header.nonce = BlockNonce::from_u64(header.nonce.to_u64().wrapping_add(1));
    let forged = sealed.with_seal(header);
    assert!(engine.verify_seal(&*chain, forged.header()).is_err());

    let err = chain.insert_chain(vec![forged]).unwrap_err();
    assert_eq!(err.index, 0);
    assert!(matches!(
        err.source,
        ChainError::Consensus(ConsensusError::InvalidMixDigest | ConsensusError::InvalidPow)
    ));
    assert_eq!(chain.current_block().hash(), sealed.hash());
    chain.stop();
}
