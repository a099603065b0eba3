use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::{CodeGraphError, Result};

/// Configuration for the incremental indexing pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IndexerConfig {
    /// Parse worker pool
    #[serde(default)]
    pub pool: PoolConfig,

    /// Parse-result cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Full vs incremental re-index policy
    #[serde(default)]
    pub incremental: IncrementalConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of parse worker threads
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Hard limit for a single parse task
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,

    /// Extra attempts after a timeout or worker crash
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl PoolConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            task_timeout_ms: default_task_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached parse results
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,

    /// Lifetime of an entry, counted from insertion
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            ttl_ms: default_cache_ttl_ms(),
        }
    }
}

/// Thresholds above which a change is treated as a rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalConfig {
    /// Max `|new - old| / new` symbol count shift
    #[serde(default = "default_symbol_count_threshold")]
    pub symbol_count_threshold: f64,

    /// Count shifts smaller than this never trip the symbol count check
    #[serde(default = "default_min_count_delta")]
    pub min_count_delta: usize,

    /// Max `(added + removed + modified) / new`
    #[serde(default = "default_change_ratio_threshold")]
    pub change_ratio_threshold: f64,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            symbol_count_threshold: default_symbol_count_threshold(),
            min_count_delta: default_min_count_delta(),
            change_ratio_threshold: default_change_ratio_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chunk_lines")]
    pub max_chunk_lines: u32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_lines: default_max_chunk_lines(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "pretty", "json", "compact"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_worker_count() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}
fn default_task_timeout_ms() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    1
}
fn default_cache_max_size() -> usize {
    1_000
}
fn default_cache_ttl_ms() -> u64 {
    60 * 60 * 1000
}
fn default_symbol_count_threshold() -> f64 {
    0.30
}
fn default_min_count_delta() -> usize {
    2
}
fn default_change_ratio_threshold() -> f64 {
    0.50
}
fn default_max_chunk_lines() -> u32 {
    120
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

/// Upper bound accepted for `pool.max_retries`.
pub const MAX_RETRIES: u32 = 16;

impl IndexerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pool.worker_count == 0 {
            return Err(CodeGraphError::Config(
                "pool.worker_count must be at least 1".to_string(),
            ));
        }
        if self.pool.task_timeout_ms == 0 {
            return Err(CodeGraphError::Config(
                "pool.task_timeout_ms must be positive".to_string(),
            ));
        }
        if self.pool.max_retries > MAX_RETRIES {
            return Err(CodeGraphError::Config(format!(
                "pool.max_retries must be at most {}, got {}",
                MAX_RETRIES, self.pool.max_retries
            )));
        }
        if self.cache.max_size == 0 {
            return Err(CodeGraphError::Config(
                "cache.max_size must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            (
                "incremental.symbol_count_threshold",
                self.incremental.symbol_count_threshold,
            ),
            (
                "incremental.change_ratio_threshold",
                self.incremental.change_ratio_threshold,
            ),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(CodeGraphError::Config(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.chunking.max_chunk_lines == 0 {
            return Err(CodeGraphError::Config(
                "chunking.max_chunk_lines must be at least 1".to_string(),
            ));
        }
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(CodeGraphError::Config(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    other
                )))
            }
        }
        match self.logging.format.as_str() {
            "pretty" | "json" | "compact" => {}
            other => {
                return Err(CodeGraphError::Config(format!(
                    "Invalid log format: {}. Must be one of: pretty, json, compact",
                    other
                )))
            }
        }
        Ok(())
    }
}

/// Loads [`IndexerConfig`] from file and environment.
pub struct ConfigManager {
    config: IndexerConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with the following precedence:
    /// 1. Environment variables
    /// 2. `./.codegraph.toml`
    /// 3. `~/.codegraph/indexer.toml`
    /// 4. Defaults
    pub fn load() -> Result<Self> {
        let (config, config_path) = Self::load_config_file()?;
        Self::finish(config, config_path)
    }

    /// Load from an explicit file, still honouring environment overrides.
    pub fn from_path(path: &Path) -> Result<Self> {
        let config = Self::read_toml_file(path)?;
        Self::finish(config, Some(path.to_path_buf()))
    }

    fn finish(config: IndexerConfig, config_path: Option<PathBuf>) -> Result<Self> {
        let config = Self::apply_env_overrides(config);
        config.validate()?;

        match &config_path {
            Some(path) => info!("Indexer config loaded from {}", path.display()),
            None => info!("Indexer config: defaults"),
        }
        info!(
            workers = config.pool.worker_count,
            task_timeout_ms = config.pool.task_timeout_ms,
            cache_max_size = config.cache.max_size,
            "Indexer configuration ready"
        );

        Ok(Self {
            config,
            config_path,
        })
    }

    fn load_config_file() -> Result<(IndexerConfig, Option<PathBuf>)> {
        let local_config = Path::new(".codegraph.toml");
        if local_config.exists() {
            let config = Self::read_toml_file(local_config)?;
            return Ok((config, Some(local_config.to_path_buf())));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".codegraph").join("indexer.toml");
            if user_config.exists() {
                let config = Self::read_toml_file(&user_config)?;
                return Ok((config, Some(user_config)));
            }
        }

        Ok((IndexerConfig::default(), None))
    }

    fn read_toml_file(path: &Path) -> Result<IndexerConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CodeGraphError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        toml::from_str(&content).map_err(|e| {
            CodeGraphError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    fn apply_env_overrides(config: IndexerConfig) -> IndexerConfig {
        Self::apply_overrides(config, |key| std::env::var(key).ok())
    }

    fn apply_overrides(
        mut config: IndexerConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> IndexerConfig {
        fn parsed<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("Ignoring {}={}: not a valid value", key, value);
                    None
                }
            }
        }

        if let Some(n) = parsed("CODEGRAPH_WORKERS", lookup("CODEGRAPH_WORKERS")) {
            config.pool.worker_count = n;
        }
        if let Some(ms) = parsed(
            "CODEGRAPH_TASK_TIMEOUT_MS",
            lookup("CODEGRAPH_TASK_TIMEOUT_MS"),
        ) {
            config.pool.task_timeout_ms = ms;
        }
        if let Some(n) = parsed("CODEGRAPH_CACHE_MAX_SIZE", lookup("CODEGRAPH_CACHE_MAX_SIZE")) {
            config.cache.max_size = n;
        }
        if let Some(ms) = parsed("CODEGRAPH_CACHE_TTL_MS", lookup("CODEGRAPH_CACHE_TTL_MS")) {
            config.cache.ttl_ms = ms;
        }
        if let Some(t) = parsed(
            "CODEGRAPH_SYMBOL_COUNT_THRESHOLD",
            lookup("CODEGRAPH_SYMBOL_COUNT_THRESHOLD"),
        ) {
            config.incremental.symbol_count_threshold = t;
        }
        if let Some(t) = parsed(
            "CODEGRAPH_CHANGE_RATIO_THRESHOLD",
            lookup("CODEGRAPH_CHANGE_RATIO_THRESHOLD"),
        ) {
            config.incremental.change_ratio_threshold = t;
        }
        config
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn into_config(self) -> IndexerConfig {
        self.config
    }

    /// Get the path to the config file that was loaded, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Write the default configuration as TOML.
    pub fn create_default_config(path: &Path) -> Result<()> {
        let toml_str = toml::to_string_pretty(&IndexerConfig::default())
            .map_err(|e| CodeGraphError::Config(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml_str)?;
        Ok(())
    }
}
