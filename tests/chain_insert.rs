mod common;

use common::*;
use primitive_types::U256;
use std::sync::Arc;
use vertex_node::config::CacheConfig;
use vertex_node::errors::{ChainError, ValidationError};
use vertex_node::store::SledStore;
use vertex_node::types::{Block, Header, H256};

fn canonical(chain: &vertex_node::BlockChain, from: u64, to: u64) -> Vec<H256> {
    (from..=to).map(|n| chain.get_canonical_hash(n).unwrap()).collect()
}

fn hashes(blocks: &[Block]) -> Vec<H256> {
    blocks.iter().map(|b| b.hash()).collect()
}

#[test]
fn linear_import_moves_head_and_mappings() {
    let builder = Builder::new();
    let chain = new_chain(CacheConfig::default());
    let mut heads = chain.feeds().subscribe_head();
    let mut canon = chain.feeds().subscribe_chain();

    let blocks = builder.blocks(&builder.genesis(), 3, with_coinbase(1));
    assert_eq!(chain.insert_chain(blocks.clone()).unwrap(), 3);

    assert_eq!(chain.current_block().hash(), blocks[2].hash());
    assert_eq!(chain.current_header().hash(), blocks[2].hash());
    assert_eq!(canonical(&chain, 1, 3), hashes(&blocks));
    assert_eq!(chain.get_block_by_number(2).unwrap().hash(), blocks[1].hash());

    for block in &blocks {
        assert_eq!(canon.try_recv().unwrap().hash, block.hash());
    }
    // One head event for the whole batch.
    assert_eq!(heads.try_recv().unwrap().block.hash(), blocks[2].hash());
    assert!(heads.try_recv().is_err());

    let td = chain.get_td(&blocks[2].hash(), 3).unwrap();
    let genesis = chain.genesis();
    assert_eq!(
        td,
        genesis.difficulty() + blocks.iter().fold(U256::zero(), |acc, b| acc + b.difficulty())
    );
    chain.stop();
}

#[test]
fn non_contiguous_batch_writes_nothing() {
    let builder = Builder::new();
    let chain = new_chain(CacheConfig::default());
    let blocks = builder.blocks(&builder.genesis(), 3, with_coinbase(1));

    let err = chain
        .insert_chain(vec![blocks[0].clone(), blocks[2].clone()])
        .unwrap_err();
    assert_eq!(err.index, 1);
    assert!(matches!(err.source, ChainError::NonContiguous { .. }));
    assert_eq!(chain.current_block().number(), 0);
    assert!(chain.get_block(&blocks[0].hash(), 1).is_none());
    chain.stop();
}

#[test]
fn heavier_chain_wins_in_either_order() {
    let builder = Builder::new();
    let genesis = builder.genesis();
    let light = builder.blocks(&genesis, 3, with_coinbase(1));
    let heavy = builder.blocks(&genesis, 4, with_coinbase(2));

    for order in [[&light, &heavy], [&heavy, &light]] {
        let chain = new_chain(CacheConfig::default());
        for batch in order {
            chain.insert_chain(batch.clone()).unwrap();
        }
        assert_eq!(chain.current_block().hash(), heavy[3].hash());
        assert_eq!(canonical(&chain, 1, 4), hashes(&heavy));
        // The losing side is kept as side blocks.
        assert!(chain.get_block(&light[2].hash(), 3).is_some());
        chain.stop();
    }
}

#[test]
fn reorg_returns_dropped_transactions_and_logs() {
    let builder = Builder::new();
    let genesis = builder.genesis();
    let tx = transfer(0, BOB, 1_000, b"hello".to_vec());

    let b1 = builder.blocks(&genesis, 1, with_coinbase(1));
    let old_tip = builder.blocks(&b1[0], 1, |_, b| {
        b.set_coinbase(vertex_node::types::Address([1; 20]));
        b.add_tx(tx.clone()).unwrap();
    });
    let fork = builder.blocks(&b1[0], 2, with_coinbase(2));

    let chain = new_chain(CacheConfig::default());
    let mut removed_txs = chain.feeds().subscribe_removed_txs();
    let mut removed_logs = chain.feeds().subscribe_removed_logs();
    let mut side = chain.feeds().subscribe_side();

    chain.insert_chain(vec![b1[0].clone(), old_tip[0].clone()]).unwrap();
    assert_eq!(chain.get_tx_lookup_entry(&tx.hash()).unwrap().block_hash, old_tip[0].hash());

    chain.insert_chain(fork.clone()).unwrap();
    assert_eq!(chain.current_block().hash(), fork[1].hash());
    assert_eq!(canonical(&chain, 1, 3), vec![b1[0].hash(), fork[0].hash(), fork[1].hash()]);

    let dropped = removed_txs.try_recv().unwrap();
    assert_eq!(dropped.txs.iter().map(|t| t.hash()).collect::<Vec<_>>(), vec![tx.hash()]);
    let logs = removed_logs.try_recv().unwrap().logs;
    assert_eq!(logs.len(), 1);
    assert!(logs[0].removed);
    // Equal-height ties are broken randomly, so fork[0] may also show up here.
    let mut sides = Vec::new();
    while let Ok(ev) = side.try_recv() {
        sides.push(ev.block.hash());
    }
    assert!(sides.contains(&old_tip[0].hash()));
    assert!(chain.get_tx_lookup_entry(&tx.hash()).is_none());
    chain.stop();
}

#[test]
fn reexecution_yields_the_same_root() {
    let builder = Builder::new();
    let chain = new_chain(CacheConfig::default());
    let blocks = builder.blocks(&builder.genesis(), 2, |i, b| {
        b.set_coinbase(vertex_node::types::Address([3; 20]));
        b.add_tx(transfer(i as u64, BOB, 10, vec![])).unwrap();
    });
    chain.insert_chain(blocks.clone()).unwrap();

    let block = &blocks[1];
    let roots: Vec<H256> = (0..2)
        .map(|_| {
            let mut state = chain.state_at(blocks[0].root()).unwrap();
            chain.processor().process(&*chain, block, &mut state).unwrap();
            state.intermediate_root().unwrap()
        })
        .collect();
    assert_eq!(roots[0], roots[1]);
    assert_eq!(roots[0], block.root());
    chain.stop();
}

#[test]
fn pruned_ancestors_are_reimported_for_a_heavier_fork() {
    let builder = Builder::new();
    let genesis = builder.genesis();
    let main = builder.blocks(&genesis, 12, with_coinbase(1));
    let fork = builder.blocks(&main[1], 13, with_coinbase(2));

    let chain = new_chain(CacheConfig {
        tries_in_memory: 4,
        ..CacheConfig::default()
    });
    chain.insert_chain(main.clone()).unwrap();
    assert!(!chain.has_state(&main[1].root()));
    assert!(chain.has_state(&main[11].root()));

    chain.insert_chain(fork.clone()).unwrap();
    assert_eq!(chain.current_block().hash(), fork[12].hash());
    assert_eq!(canonical(&chain, 1, 2), hashes(&main[..2]));
    assert_eq!(canonical(&chain, 3, 15), hashes(&fork));
    chain.stop();
}

#[test]
fn lighter_fork_on_pruned_state_is_stored_without_state() {
    let builder = Builder::new();
    let genesis = builder.genesis();
    let main = builder.blocks(&genesis, 10, with_coinbase(1));
    let fork = builder.blocks(&main[0], 2, with_coinbase(2));

    let chain = new_chain(CacheConfig {
        tries_in_memory: 2,
        ..CacheConfig::default()
    });
    chain.insert_chain(main.clone()).unwrap();
    chain.insert_chain(fork.clone()).unwrap();

    assert_eq!(chain.current_block().hash(), main[9].hash());
    assert!(chain.get_block(&fork[1].hash(), 3).is_some());
    assert!(chain.get_td(&fork[1].hash(), 3).is_some());
    chain.stop();
}

#[test]
fn future_blocks_are_queued_or_refused() {
    let builder = Builder::new();
    let genesis = builder.genesis();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let ahead = now + 20 - genesis.time() - 10;
    let queued = builder.blocks(&genesis, 2, |i, b| {
        if i == 0 {
            b.offset_time(ahead);
        }
    });
    let chain = new_chain(CacheConfig::default());
    assert_eq!(chain.insert_chain(queued.clone()).unwrap(), 2);
    assert_eq!(chain.current_block().number(), 0);
    assert_eq!(chain.future_block_count(), 2);

    let too_far = builder.blocks(&genesis, 1, |_, b| b.offset_time(ahead + 100));
    let err = chain.insert_chain(too_far).unwrap_err();
    assert_eq!(err.index, 0);
    assert!(matches!(err.source, ChainError::FutureBlockTooFar { .. }));
    chain.stop();
}

#[test]
fn invalid_blocks_are_reported() {
    let builder = Builder::new();
    let chain = new_chain(CacheConfig::default());
    let blocks = builder.blocks(&builder.genesis(), 2, with_coinbase(1));

    let mut header: Header = blocks[1].header().clone();
    header.state_root = H256([0xee; 32]);
    let bad_root = blocks[1].with_seal(header);

    let err = chain
        .insert_chain(vec![blocks[0].clone(), bad_root.clone()])
        .unwrap_err();
    assert_eq!(err.index, 1);
    assert!(matches!(
        err.source,
        ChainError::Validation(ValidationError::StateRootMismatch { .. })
    ));
    assert_eq!(chain.current_block().hash(), blocks[0].hash());

    let mut header: Header = blocks[1].header().clone();
    header.tx_root = H256([0xdd; 32]);
    let err = chain.insert_chain(vec![blocks[1].with_seal(header)]).unwrap_err();
    assert!(matches!(
        err.source,
        ChainError::Validation(ValidationError::TxRootMismatch { .. })
    ));

    let bad = chain.bad_blocks();
    assert_eq!(bad.len(), 2);
    assert_eq!(bad[0].hash(), bad_root.hash());
    chain.stop();
}

#[test]
fn sled_backed_chain_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let builder = Builder::new();
    let blocks = builder.blocks(&builder.genesis(), 5, with_coinbase(4));

    {
        let db: vertex_node::store::SharedStore = Arc::new(SledStore::open(dir.path()).unwrap());
        funded_genesis().commit(&db).unwrap();
        let chain = open_chain(db.clone(), CacheConfig::default());
        chain.insert_chain(blocks.clone()).unwrap();
        chain.stop();
        db.flush().unwrap();
    }

    let db: vertex_node::store::SharedStore = Arc::new(SledStore::open(dir.path()).unwrap());
    let chain = open_chain(db, CacheConfig::default());
    assert_eq!(chain.current_block().hash(), blocks[4].hash());
    assert!(chain.has_state(&blocks[4].root()));
    chain.stop();
}

#[test]
fn stop_during_insert_leaves_a_reopenable_head() {
    let dir = tempfile::tempdir().unwrap();
    let builder = Builder::new();
    let blocks = builder.blocks(&builder.genesis(), 200, with_coinbase(5));

    let head = {
        let db: vertex_node::store::SharedStore = Arc::new(SledStore::open(dir.path()).unwrap());
        funded_genesis().commit(&db).unwrap();
        let chain = open_chain(db.clone(), CacheConfig::default());

        let importer = {
            let chain = chain.clone();
            let blocks = blocks.clone();
            std::thread::spawn(move || chain.insert_chain(blocks))
        };
        std::thread::sleep(std::time::Duration::from_millis(5));
        chain.stop();
        let consumed = importer.join().unwrap().unwrap();
        assert!(consumed <= blocks.len());

        let head = chain.current_block();
        if head.number() > 0 {
            assert_eq!(head.hash(), blocks[head.number() as usize - 1].hash());
        }
        db.flush().unwrap();
        head
    };

    let db: vertex_node::store::SharedStore = Arc::new(SledStore::open(dir.path()).unwrap());
    let chain = open_chain(db, CacheConfig::default());
    assert_eq!(chain.current_block().hash(), head.hash());
    assert!(chain.has_state(&head.root()));
    chain.stop();
}
