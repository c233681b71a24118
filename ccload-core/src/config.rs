//! Configuration loading (spec §6 Environment). Deserialized with `serde` from
//! YAML/JSON the way the host proxy's own config layer does, minus the Lua scripting
//! path — this crate is a persistence core, not an HTTP/filter pipeline.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Filesystem path to the main SQLite database, or `:memory:` for an in-process
    /// database. Mirrors `CCLOAD_USE_MEMORY_DB`.
    #[serde(default = "DatabaseConfig::default_path")]
    pub path: String,
    /// Always file-backed; pooled separately from `path` to keep the hot request
    /// path off the same connections as log writes (spec §5).
    #[serde(default = "DatabaseConfig::default_logs_path")]
    pub logs_path: String,
    #[serde(default = "DatabaseConfig::default_journal_mode")]
    pub journal_mode: String,
    #[serde(default = "DatabaseConfig::default_pool_size")]
    pub pool_size: u32,
    /// Interval for `LogStore::spawn_cleanup_task`. `None` (the default) leaves
    /// retention entirely to manual/external cleanup, e.g. the `ccload-maintenance`
    /// binary (SPEC_FULL.md §B "off by default, explicit opt-in via config").
    #[serde(default)]
    pub cleanup_interval_secs: Option<u64>,
    #[serde(default = "DatabaseConfig::default_retain_days")]
    pub retain_days: i64,
}

impl DatabaseConfig {
    fn default_path() -> String {
        "ccload.db".to_string()
    }
    fn default_logs_path() -> String {
        "ccload_logs.db".to_string()
    }
    fn default_journal_mode() -> String {
        env::var("SQLITE_JOURNAL_MODE").unwrap_or_else(|_| "WAL".to_string())
    }
    fn default_pool_size() -> u32 {
        10
    }
    fn default_retain_days() -> i64 {
        30
    }

    pub fn is_memory(&self) -> bool {
        self.path == ":memory:"
            || env::var("CCLOAD_USE_MEMORY_DB")
                .map(|v| v == "true")
                .unwrap_or(false)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: Self::default_path(),
            logs_path: Self::default_logs_path(),
            journal_mode: Self::default_journal_mode(),
            pool_size: Self::default_pool_size(),
            cleanup_interval_secs: None,
            retain_days: Self::default_retain_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "RedisConfig::default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "RedisConfig::default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    #[serde(default = "RedisConfig::default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "RedisConfig::default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl RedisConfig {
    fn default_dial_timeout_ms() -> u64 {
        3_000
    }
    fn default_op_timeout_ms() -> u64 {
        2_000
    }
    fn default_debounce_ms() -> u64 {
        100
    }
    fn default_shutdown_timeout_ms() -> u64 {
        5_000
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
    pub fn snapshot_timeout(&self) -> Duration {
        self.op_timeout() * 2
    }
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: DatabaseConfig::default(),
            redis: env::var("REDIS_URL").ok().map(|url| RedisConfig {
                url,
                dial_timeout_ms: RedisConfig::default_dial_timeout_ms(),
                op_timeout_ms: RedisConfig::default_op_timeout_ms(),
                debounce_ms: RedisConfig::default_debounce_ms(),
                shutdown_timeout_ms: RedisConfig::default_shutdown_timeout_ms(),
            }),
        }
    }
}

impl Config {
    /// Loads a config file (YAML or JSON, picked by extension, same convention as
    /// the host proxy's `read_config`) and layers `REDIS_URL`/`CCLOAD_USE_MEMORY_DB`
    /// on top when the file is silent about them.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read(path.as_ref())
            .with_context(|| format!("reading config file {}", path.as_ref().display()))?;
        let mut config: Config = match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_slice(&data)?,
            _ => serde_yaml::from_slice(&data)?,
        };
        if config.redis.is_none() {
            if let Ok(url) = env::var("REDIS_URL") {
                config.redis = Some(RedisConfig {
                    url,
                    dial_timeout_ms: RedisConfig::default_dial_timeout_ms(),
                    op_timeout_ms: RedisConfig::default_op_timeout_ms(),
                    debounce_ms: RedisConfig::default_debounce_ms(),
                    shutdown_timeout_ms: RedisConfig::default_shutdown_timeout_ms(),
                });
            }
        }
        Ok(config)
    }

    pub fn from_env() -> Self {
        Config::default()
    }

    /// Mandatory constraint from spec §4.D: a non-durable main store without Redis
    /// configured must fail to start.
    pub fn validate(&self) -> Result<()> {
        if self.database.is_memory() && self.redis.is_none() {
            anyhow::bail!(
                "CCLOAD_USE_MEMORY_DB is set (or database.path is `:memory:`) but no Redis is \
                 configured; refusing to start with a non-durable store and no restore source"
            );
        }
        Ok(())
    }
}

/// CLI surface for the bundled example binary, mirroring the host proxy's use of
/// `clap`'s `env` feature for overridable settings.
#[derive(Debug, Parser)]
#[command(name = "ccload-core", about = "ccload-core maintenance CLI")]
pub struct CliArgs {
    #[arg(long, env = "CCLOAD_CONFIG")]
    pub config: Option<String>,

    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    #[arg(long, env = "CCLOAD_USE_MEMORY_DB", default_value_t = false)]
    pub use_memory_db: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_without_redis_fails_validation() {
        let config = Config {
            database: DatabaseConfig {
                path: ":memory:".into(),
                ..DatabaseConfig::default()
            },
            redis: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn memory_with_redis_passes_validation() {
        let config = Config {
            database: DatabaseConfig {
                path: ":memory:".into(),
                ..DatabaseConfig::default()
            },
            redis: Some(RedisConfig {
                url: "redis://localhost".into(),
                dial_timeout_ms: 1,
                op_timeout_ms: 1,
                debounce_ms: 1,
                shutdown_timeout_ms: 1,
            }),
        };
        assert!(config.validate().is_ok());
    }
}
