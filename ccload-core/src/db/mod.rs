//! Local persistence: pool setup and the five repository modules. Schema from
//! spec §6. The main database (channels/keys/tokens) and the logs database are
//! pooled separately (spec §5) so log writes never contend with the hot
//! channel-selection path.

pub mod channels;
pub mod cooldown;
pub mod logs;
pub mod tokens;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;

/// A held-open connection preventing a shared-cache in-memory SQLite database from
/// being released when the pool evicts idle connections (spec §5, §9 "keeper
/// connection"). Only meaningful in memory mode; in file mode this is `None`.
#[derive(Debug)]
pub struct Keeper(#[allow(dead_code)] Option<sqlx::pool::PoolConnection<sqlx::Sqlite>>);

static NEXT_MEMORY_DB_ID: AtomicU64 = AtomicU64::new(0);

pub async fn connect_main(config: &DatabaseConfig) -> Result<(SqlitePool, Keeper)> {
    let is_memory = config.is_memory();
    let (pool, keeper) = if is_memory {
        // Shared-cache in-memory database, named uniquely per store instance so
        // that unrelated `Store`s in the same process (e.g. separate tests) don't
        // silently share rows. Every connection in the pool sees the same data as
        // long as at least one connection stays open, hence the keeper below.
        let db_id = NEXT_MEMORY_DB_ID.fetch_add(1, Ordering::Relaxed);
        let uri = format!("file:ccload_mem_{db_id}?mode=memory&cache=shared");
        let opts = SqliteConnectOptions::from_str(&uri)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .context("connecting to in-memory main database")?;
        let keeper = pool
            .acquire()
            .await
            .context("acquiring keeper connection for memory-mode database")?;
        (pool, Keeper(Some(keeper)))
    } else {
        let journal_mode = parse_journal_mode(&config.journal_mode);
        let opts = SqliteConnectOptions::from_str(&config.path)?
            .create_if_missing(true)
            .journal_mode(journal_mode)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size)
            .idle_timeout(Some(Duration::from_secs(300)))
            .connect_with(opts)
            .await
            .with_context(|| format!("connecting to main database at {}", config.path))?;
        (pool, Keeper(None))
    };

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("running migrations on main database")?;

    info!(memory = is_memory, "main database ready");
    Ok((pool, keeper))
}

pub async fn connect_logs(path: &str, pool_size: u32) -> Result<SqlitePool> {
    let opts = SqliteConnectOptions::from_str(path)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);
    let pool = SqlitePoolOptions::new()
        .max_connections(pool_size)
        .idle_timeout(Some(Duration::from_secs(300)))
        .connect_with(opts)
        .await
        .with_context(|| format!("connecting to logs database at {path}"))?;

    // Logs use the same migration set; the `logs` table creation is idempotent and
    // harmless to run against a database that only ever touches that table.
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("running migrations on logs database")?;

    Ok(pool)
}

fn parse_journal_mode(mode: &str) -> sqlx::sqlite::SqliteJournalMode {
    use sqlx::sqlite::SqliteJournalMode::*;
    match mode.to_ascii_uppercase().as_str() {
        "TRUNCATE" => Truncate,
        "DELETE" => Delete,
        "PERSIST" => Persist,
        "MEMORY" => Memory,
        "OFF" => Off,
        _ => Wal,
    }
}

pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

pub fn now_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}
