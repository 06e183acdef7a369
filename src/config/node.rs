//! Node configuration file (`vertex.toml`) with `VERTEX_*` environment
//! overrides.

use super::miner::MinerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config encode: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// `tracing` filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub pow: PowConfig,

    #[serde(default)]
    pub miner: MinerConfig,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vertex")
}
fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_filter: default_log_filter(),
            cache: CacheConfig::default(),
            pow: PowConfig::default(),
            miner: MinerConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str::<NodeConfig>(&content)?
        } else {
            let config = Self::default();
            config.save(path)?;
            config
        };
        config.apply_env_overrides();
        config.miner.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("VERTEX_DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }
        self.miner.threads = env_parse("VERTEX_MINER_THREADS").unwrap_or(self.miner.threads);
        self.cache.tries_in_memory = env_parse("VERTEX_TRIES_IN_MEMORY").unwrap_or(self.cache.tries_in_memory);
        self.pow.mode = env_parse("VERTEX_POW_MODE").unwrap_or(self.pow.mode);
    }

    pub fn chain_dir(&self) -> PathBuf {
        self.data_dir.join("chaindata")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.pow
            .cache_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("powcache"))
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.pow
            .dataset_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("powdataset"))
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// State retention and trie cache limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Archive mode: every state root is flushed to disk immediately
    #[serde(default)]
    pub disabled: bool,

    #[serde(default = "default_trie_node_limit_mb")]
    pub trie_node_limit_mb: usize,

    #[serde(default = "default_trie_time_limit_secs")]
    pub trie_time_limit_secs: u64,

    /// Recent state roots kept referenced in memory
    #[serde(default = "default_tries_in_memory")]
    pub tries_in_memory: u64,
}

fn default_trie_node_limit_mb() -> usize {
    256
}
fn default_trie_time_limit_secs() -> u64 {
    300
}
fn default_tries_in_memory() -> u64 {
    128
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            trie_node_limit_mb: default_trie_node_limit_mb(),
            trie_time_limit_secs: default_trie_time_limit_secs(),
            tries_in_memory: default_tries_in_memory(),
        }
    }
}

impl CacheConfig {
    pub fn trie_time_limit(&self) -> Duration {
        Duration::from_secs(self.trie_time_limit_secs)
    }

    pub fn trie_node_limit_bytes(&self) -> usize {
        self.trie_node_limit_mb * 1024 * 1024
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowMode {
    Normal,
    Shared,
    Test,
    Fake,
    FullFake,
}

impl FromStr for PowMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(PowMode::Normal),
            "shared" => Ok(PowMode::Shared),
            "test" => Ok(PowMode::Test),
            "fake" => Ok(PowMode::Fake),
            "full-fake" | "fullfake" => Ok(PowMode::FullFake),
            other => Err(format!("unknown pow mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowConfig {
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    #[serde(default = "default_caches_in_mem")]
    pub caches_in_mem: usize,

    #[serde(default = "default_caches_on_disk")]
    pub caches_on_disk: usize,

    #[serde(default)]
    pub dataset_dir: Option<PathBuf>,

    #[serde(default = "default_datasets_in_mem")]
    pub datasets_in_mem: usize,

    #[serde(default = "default_datasets_on_disk")]
    pub datasets_on_disk: usize,

    #[serde(default = "default_pow_mode")]
    pub mode: PowMode,
}

fn default_caches_in_mem() -> usize {
    2
}
fn default_caches_on_disk() -> usize {
    3
}
fn default_datasets_in_mem() -> usize {
    1
}
fn default_datasets_on_disk() -> usize {
    2
}
fn default_pow_mode() -> PowMode {
    PowMode::Normal
}

impl Default for PowConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            caches_in_mem: default_caches_in_mem(),
            caches_on_disk: default_caches_on_disk(),
            dataset_dir: None,
            datasets_in_mem: default_datasets_in_mem(),
            datasets_on_disk: default_datasets_on_disk(),
            mode: default_pow_mode(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vertex.toml");
        let cfg = NodeConfig::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.pow.caches_on_disk, 3);

        let again = NodeConfig::load_or_create(&path).unwrap();
        assert_eq!(again.cache, cfg.cache);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let cfg: NodeConfig = toml::from_str(
            r#"
            data_dir = "/tmp/vertex"
            [cache]
            tries_in_memory = 16
            [pow]
            mode = "full-fake"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.cache.tries_in_memory, 16);
        assert_eq!(cfg.cache.trie_node_limit_mb, 256);
        assert_eq!(cfg.pow.mode, PowMode::FullFake);
        assert_eq!(cfg.chain_dir(), PathBuf::from("/tmp/vertex/chaindata"));
    }

    #[test]
    fn pow_mode_parses_from_env_style_strings() {
        assert_eq!("FULL-FAKE".parse::<PowMode>().unwrap(), PowMode::FullFake);
        assert!("quantum".parse::<PowMode>().is_err());
    }
}
