//! Chain events and the broadcast feeds subscribers attach to.

use crate::types::{Block, Log, Transaction, H256};
use tokio::sync::broadcast;

/// Default per-feed buffer; slow subscribers lag and skip past old events.
pub const FEED_CAPACITY: usize = 256;

/// A block was written as the new canonical tip (or part of the canonical
/// chain during a batch).
#[derive(Clone, Debug)]
pub struct ChainEvent {
    pub block: Block,
    pub hash: H256,
    pub logs: Vec<Log>,
}

/// A block was written on a side chain.
#[derive(Clone, Debug)]
pub struct ChainSideEvent {
    pub block: Block,
}

/// The head advanced; sent at most once per insert batch.
#[derive(Clone, Debug)]
pub struct ChainHeadEvent {
    pub block: Block,
}

/// Transactions that fell off the canonical chain during a reorg and did
/// not reappear on the new side.
#[derive(Clone, Debug)]
pub struct RemovedTransactionsEvent {
    pub txs: Vec<Transaction>,
}

#[derive(Clone, Debug)]
pub struct RemovedLogsEvent {
    pub logs: Vec<Log>,
}

#[derive(Clone, Debug)]
pub struct NewMinedBlockEvent {
    pub block: Block,
}

/// Event produced during an insert, posted after the chain lock is released.
#[derive(Clone, Debug)]
pub enum PendingEvent {
    Chain(ChainEvent),
    Side(ChainSideEvent),
    Head(ChainHeadEvent),
}

pub struct ChainFeeds {
    chain: broadcast::Sender<ChainEvent>,
    side: broadcast::Sender<ChainSideEvent>,
    head: broadcast::Sender<ChainHeadEvent>,
    logs: broadcast::Sender<Vec<Log>>,
    removed_logs: broadcast::Sender<RemovedLogsEvent>,
    removed_txs: broadcast::Sender<RemovedTransactionsEvent>,
    mined: broadcast::Sender<NewMinedBlockEvent>,
}

impl Default for ChainFeeds {
    fn default() -> Self {
        Self::new(FEED_CAPACITY)
    }
}

impl ChainFeeds {
    pub fn new(capacity: usize) -> Self {
        Self {
            chain: broadcast::channel(capacity).0,
            side: broadcast::channel(capacity).0,
            head: broadcast::channel(capacity).0,
            logs: broadcast::channel(capacity).0,
            removed_logs: broadcast::channel(capacity).0,
            removed_txs: broadcast::channel(capacity).0,
            mined: broadcast::channel(capacity).0,
        }
    }

    pub fn subscribe_chain(&self) -> broadcast::Receiver<ChainEvent> {
        self.chain.subscribe()
    }

    pub fn subscribe_side(&self) -> broadcast::Receiver<ChainSideEvent> {
        self.side.subscribe()
    }

    pub fn subscribe_head(&self) -> broadcast::Receiver<ChainHeadEvent> {
        self.head.subscribe()
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<Vec<Log>> {
        self.logs.subscribe()
    }

    pub fn subscribe_removed_logs(&self) -> broadcast::Receiver<RemovedLogsEvent> {
        self.removed_logs.subscribe()
    }

    pub fn subscribe_removed_txs(&self) -> broadcast::Receiver<RemovedTransactionsEvent> {
        self.removed_txs.subscribe()
    }

    pub fn subscribe_mined(&self) -> broadcast::Receiver<NewMinedBlockEvent> {
        self.mined.subscribe()
    }

    // A send only fails when nobody is subscribed, which is not an error here.

    pub fn send_pending(&self, events: Vec<PendingEvent>, logs: Vec<Log>) {
        if !logs.is_empty() {
            let _ = self.logs.send(logs);
        }
        for event in events {
            match event {
                PendingEvent::Chain(ev) => {
                    let _ = self.chain.send(ev);
                }
                PendingEvent::Side(ev) => {
                    let _ = self.side.send(ev);
                }
                PendingEvent::Head(ev) => {
                    let _ = self.head.send(ev);
                }
            }
        }
    }

    pub fn send_side(&self, event: ChainSideEvent) {
        let _ = self.side.send(event);
    }

    pub fn send_removed_logs(&self, event: RemovedLogsEvent) {
        let _ = self.removed_logs.send(event);
    }

    pub fn send_removed_txs(&self, event: RemovedTransactionsEvent) {
        let _ = self.removed_txs.send(event);
    }

    pub fn send_mined(&self, event: NewMinedBlockEvent) {
        let _ = self.mined.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Header;

    #[test]
    fn pending_events_fan_out_to_every_subscriber() {
        let feeds = ChainFeeds::new(8);
        let mut heads_a = feeds.subscribe_head();
        let mut heads_b = feeds.subscribe_head();
        let mut logs = feeds.subscribe_logs();
        let mut sides = feeds.subscribe_side();

        let block = Block::from_header(Header { number: 3, ..Header::default() });
        feeds.send_pending(
            vec![
                PendingEvent::Side(ChainSideEvent { block: block.clone() }),
                PendingEvent::Head(ChainHeadEvent { block: block.clone() }),
            ],
            vec![Log::default()],
        );

        assert_eq!(heads_a.try_recv().unwrap().block.number(), 3);
        assert_eq!(heads_b.try_recv().unwrap().block.number(), 3);
        assert_eq!(sides.try_recv().unwrap().block.hash(), block.hash());
        assert_eq!(logs.try_recv().unwrap().len(), 1);
    }

    #[test]
    fn sending_without_subscribers_is_silent() {
        let feeds = ChainFeeds::default();
        feeds.send_removed_txs(RemovedTransactionsEvent { txs: vec![] });
        feeds.send_pending(vec![], vec![]);
        let mut rx = feeds.subscribe_removed_txs();
        assert!(rx.try_recv().is_err());
    }
}
