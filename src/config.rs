//! TOML configuration parsing and validation.
//!
//! Only `[db] path` is required; every other section falls back to defaults.
//!
//! ```toml
//! [db]
//! path = "./data/archive.sqlite"
//!
//! [pool]
//! size = 5
//! max_connections = 10
//!
//! [ingest]
//! batch_size = 1000
//! max_line_bytes = 16777216
//! archive_root = "./data/archive"
//!
//! [search]
//! default_limit = 100
//! ```

use anyhow::{bail, Context, Result};
use globset::Glob;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Session pool sizing.
///
/// `size` sessions are kept open; under load the pool grows on demand up to
/// `max_connections` and the extra sessions are closed after sitting idle for
/// `idle_timeout_secs`.
#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_pool_size")]
    pub size: u32,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            max_connections: None,
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl PoolConfig {
    /// Hard ceiling on open sessions.
    pub fn max_connections(&self) -> u32 {
        self.max_connections
            .unwrap_or_else(|| self.size.saturating_mul(2))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_pool_size() -> u32 {
    5
}
fn default_acquire_timeout_ms() -> u64 {
    30_000
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Lines longer than this are recorded as parse errors and skipped.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    #[serde(default = "default_archive_root")]
    pub archive_root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_line_bytes: default_max_line_bytes(),
            archive_root: default_archive_root(),
            include_globs: default_include_globs(),
        }
    }
}

fn default_batch_size() -> usize {
    1000
}
fn default_max_line_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_archive_root() -> PathBuf {
    PathBuf::from("./data/archive")
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.jsonl".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    /// Terms longer than this many characters are matched as prefixes.
    #[serde(default = "default_prefix_threshold")]
    pub prefix_threshold: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            prefix_threshold: default_prefix_threshold(),
        }
    }
}

fn default_limit() -> usize {
    100
}
fn default_prefix_threshold() -> usize {
    3
}

impl Config {
    /// Configuration with defaults for everything except the database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            pool: PoolConfig::default(),
            ingest: IngestConfig::default(),
            search: SearchConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.size == 0 {
            bail!("pool.size must be >= 1");
        }
        if self.pool.max_connections() < self.pool.size {
            bail!(
                "pool.max_connections ({}) must be >= pool.size ({})",
                self.pool.max_connections(),
                self.pool.size
            );
        }
        if self.ingest.batch_size == 0 {
            bail!("ingest.batch_size must be > 0");
        }
        if self.ingest.max_line_bytes == 0 {
            bail!("ingest.max_line_bytes must be > 0");
        }
        if self.search.default_limit == 0 {
            bail!("search.default_limit must be >= 1");
        }
        for pattern in &self.ingest.include_globs {
            Glob::new(pattern)
                .with_context(|| format!("invalid ingest.include_globs pattern: {}", pattern))?;
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
