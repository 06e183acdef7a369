//! Prometheus metrics for chain insertion, state caching and proof-of-work.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, Encoder, Gauge, Histogram, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    registry
        .register(Box::new(CHAIN_INSERTS.clone()))
        .expect("register chain_inserts_seconds");
    registry
        .register(Box::new(CHAIN_REORGS.clone()))
        .expect("register chain_reorgs_total");
    registry
        .register(Box::new(CHAIN_REORG_DROPPED.clone()))
        .expect("register chain_reorg_dropped_blocks_total");
    registry
        .register(Box::new(CHAIN_BAD_BLOCKS.clone()))
        .expect("register chain_bad_blocks_total");
    registry
        .register(Box::new(CHAIN_HEAD_NUMBER.clone()))
        .expect("register chain_head_number");
    registry
        .register(Box::new(CHAIN_FUTURE_BLOCKS.clone()))
        .expect("register chain_future_blocks");
    registry
        .register(Box::new(TRIE_CACHE_BYTES.clone()))
        .expect("register trie_cache_bytes");
    registry
        .register(Box::new(POW_GENERATIONS.clone()))
        .expect("register pow_generations_total");
    registry
        .register(Box::new(POW_HASHRATE.clone()))
        .expect("register pow_hashrate");
    registry
});

/// Time spent per inserted block
pub static CHAIN_INSERTS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(histogram_opts!(
        "chain_inserts_seconds",
        "Time to verify, execute and write one block",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ))
    .expect("chain_inserts_seconds histogram")
});

pub static CHAIN_REORGS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(opts!("chain_reorgs_total", "Canonical chain reorganisations"))
        .expect("chain_reorgs_total counter")
});

pub static CHAIN_REORG_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(opts!(
        "chain_reorg_dropped_blocks_total",
        "Blocks removed from the canonical chain by reorganisations"
    ))
    .expect("chain_reorg_dropped_blocks_total counter")
});

pub static CHAIN_BAD_BLOCKS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(opts!("chain_bad_blocks_total", "Blocks rejected as invalid"))
        .expect("chain_bad_blocks_total counter")
});

pub static CHAIN_HEAD_NUMBER: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::with_opts(opts!("chain_head_number", "Number of the current head block"))
        .expect("chain_head_number gauge")
});

pub static CHAIN_FUTURE_BLOCKS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::with_opts(opts!("chain_future_blocks", "Blocks queued for later insertion"))
        .expect("chain_future_blocks gauge")
});

pub static TRIE_CACHE_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::with_opts(opts!("trie_cache_bytes", "Dirty state nodes held in memory"))
        .expect("trie_cache_bytes gauge")
});

pub static POW_GENERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        opts!("pow_generations_total", "Proof-of-work caches and datasets generated"),
        &["kind"],
    )
    .expect("pow_generations_total counter")
});

pub static POW_HASHRATE: Lazy<Gauge> = Lazy::new(|| {
    Gauge::with_opts(opts!("pow_hashrate", "Local sealing hash rate (hashes/s)"))
        .expect("pow_hashrate gauge")
});

/// Render every registered metric in the text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_lists_chain_metrics() {
        CHAIN_REORGS.inc();
        POW_GENERATIONS.with_label_values(&["cache"]).inc();
        let text = gather();
        assert!(text.contains("chain_reorgs_total"));
        assert!(text.contains("pow_generations_total{kind=\"cache\"}"));
    }
}
