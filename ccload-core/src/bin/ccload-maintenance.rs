//! Maintenance CLI: runs log retention against a configured store. Exercises
//! the `clap`/`tracing-subscriber` ambient stack the library itself stays
//! agnostic about (a library installs no global subscriber of its own).

use clap::Parser;
use tracing::info;

use ccload_core::config::{CliArgs, Config};
use ccload_core::db::now_unix_ms;
use ccload_core::Store;

#[derive(Parser)]
#[command(name = "ccload-maintenance", about = "Runs retention against a ccload-core store")]
struct Args {
    #[command(flatten)]
    common: CliArgs,

    /// Delete log rows older than this many days.
    #[arg(long, default_value_t = 30)]
    retain_days: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = match &args.common.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env(),
    };
    if let Some(url) = &args.common.redis_url {
        if config.redis.is_none() {
            config.redis = Some(ccload_core::config::RedisConfig {
                url: url.clone(),
                dial_timeout_ms: 3_000,
                op_timeout_ms: 2_000,
                debounce_ms: 100,
                shutdown_timeout_ms: 5_000,
            });
        }
    }

    let store = Store::open(&config).await?;
    let cutoff = now_unix_ms() - args.retain_days * 24 * 60 * 60 * 1000;
    let deleted = store.cleanup_logs_before(cutoff).await?;
    info!(deleted, retain_days = args.retain_days, "log retention complete");
    store.shutdown().await;

    Ok(())
}
