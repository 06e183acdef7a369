use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use secp256k1::SecretKey;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vertex_node::chain::bloombits::BloomIndexer;
use vertex_node::chain::{setup_genesis_block, BlockChain, Genesis, TransferExecutor};
use vertex_node::config::NodeConfig;
use vertex_node::consensus::Engine;
use vertex_node::consensus_pow::{self, PowEngine};
use vertex_node::consensus_vote::VoteEngine;
use vertex_node::miner::Miner;
use vertex_node::metrics;
use vertex_node::store::{SharedStore, SledStore};

#[derive(Parser)]
#[command(name = "vertex-node", version, about = "Vertex blockchain node")]
struct Cli {
    /// Node configuration file, created with defaults when missing
    #[arg(long, global = true, default_value = "vertex.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the genesis block into a fresh data directory
    Init {
        /// Genesis specification (JSON); the built-in default when omitted
        #[arg(long)]
        genesis: Option<PathBuf>,
    },
    /// Open the chain and optionally mine until Ctrl-C
    Run {
        #[arg(long)]
        mine: bool,
        /// Hex secret key of the local signer (signer-voting chains)
        #[arg(long)]
        signer_key: Option<String>,
    },
    /// Generate the verification cache for the epoch of a block
    MakeCache {
        #[arg(long)]
        block: u64,
        #[arg(long)]
        dir: PathBuf,
    },
    /// Generate the mining dataset for the epoch of a block
    MakeDataset {
        #[arg(long)]
        block: u64,
        #[arg(long)]
        dir: PathBuf,
    },
    /// Print the metrics exposition
    Metrics,
}

fn open_store(cfg: &NodeConfig) -> Result<SharedStore> {
    let dir = cfg.chain_dir();
    let store = SledStore::open(&dir).with_context(|| format!("opening chain database at {}", dir.display()))?;
    Ok(Arc::new(store))
}

fn make_engine(cfg: &NodeConfig, chain_config: &vertex_node::config::ChainConfig, db: &SharedStore, signer_key: Option<&str>) -> Result<Arc<dyn Engine>> {
    if let Some(params) = &chain_config.vote {
        let engine = VoteEngine::new(params.clone(), db.clone());
        if let Some(hex_key) = signer_key {
            let bytes = hex::decode(hex_key.trim_start_matches("0x")).context("decoding signer key")?;
            let key = SecretKey::from_slice(&bytes).context("parsing signer key")?;
            engine.authorize(key);
        }
        return Ok(Arc::new(engine));
    }
    if signer_key.is_some() {
        warn!("signer key ignored on a proof-of-work chain");
    }
    let mut pow_cfg = cfg.pow.clone();
    pow_cfg.cache_dir = Some(cfg.cache_dir());
    pow_cfg.dataset_dir = Some(cfg.dataset_dir());
    let engine = PowEngine::new(pow_cfg);
    engine.configure_miner(&cfg.miner);
    Ok(Arc::new(engine))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = NodeConfig::load_or_create(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Init { genesis } => {
            let spec = match genesis {
                Some(path) => {
                    let raw = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
                    serde_json::from_slice::<Genesis>(&raw).context("parsing genesis")?
                }
                None => Genesis::default(),
            };
            let db = open_store(&cfg)?;
            let (config, hash) = setup_genesis_block(&db, Some(&spec))?;
            db.flush()?;
            info!(hash = %hash, engine = config.engine_name(), chain_id = config.chain_id, "successfully wrote genesis state");
        }
        Command::Run { mine, signer_key } => {
            let db = open_store(&cfg)?;
            let (chain_config, genesis) = setup_genesis_block(&db, None)?;
            info!(genesis = %genesis, engine = chain_config.engine_name(), "initialised chain configuration");

            let engine = make_engine(&cfg, &chain_config, &db, signer_key.as_deref())?;
            let executor = Arc::new(TransferExecutor);
            let chain = BlockChain::new(db.clone(), cfg.cache.clone(), chain_config, engine.clone(), executor.clone())?;

            let indexer = Arc::new(BloomIndexer::with_defaults(db.clone())?);
            let indexing = indexer.spawn(&chain);

            let miner = if mine || cfg.miner.enabled {
                let miner = Miner::new(chain.clone(), executor, cfg.miner.clone())?;
                miner.start()?;
                Some(miner)
            } else {
                None
            };

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("got interrupt, shutting down");

            if let Some(miner) = miner {
                tokio::task::spawn_blocking(move || miner.stop()).await?;
            }
            indexing.abort();
            let stopping = chain.clone();
            tokio::task::spawn_blocking(move || stopping.stop()).await?;
            engine.close();
            db.flush()?;
        }
        Command::MakeCache { block, dir } => {
            let item = consensus_pow::make_cache(block, &dir);
            info!(epoch = item.epoch(), dir = %dir.display(), "verification cache ready");
        }
        Command::MakeDataset { block, dir } => {
            let item = consensus_pow::make_dataset(block, &dir);
            info!(epoch = item.epoch(), dir = %dir.display(), "mining dataset ready");
        }
        Command::Metrics => {
            print!("{}", metrics::gather());
        }
    }
    Ok(())
}
