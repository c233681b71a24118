//! Redis mirror (spec §4.D): a debounced async snapshot writer and an authoritative
//! cold-start loader. Mirrors the host proxy's `fred`-based Redis backend in shape
//! (a `RedisPool`, lazy-vs-eager connect, timeout-wrapped operations) but stores one
//! JSON document per key instead of per-response cache entries.

use fred::clients::Pool as RedisPool;
use fred::interfaces::{ClientLike, KeysInterface};
use fred::types::config::{Config as FredConfig, PerformanceConfig, ReconnectPolicy};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::RedisConfig;
use crate::db::channels::ChannelRepo;
use crate::db::tokens::TokenRepo;
use crate::error::{Error, Result};
use crate::metrics::METRICS;
use crate::model::{NewAuthToken, DEFAULT_CHANNEL_TYPE, DEFAULT_KEY_STRATEGY};

const CHANNELS_KEY: &str = "ccload:channels";
const TOKENS_KEY: &str = "ccload:auth_tokens";

#[derive(Debug, Serialize, Deserialize)]
struct ChannelSnapshot {
    config: ChannelConfigSnapshot,
    api_keys: Vec<ApiKeySnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChannelConfigSnapshot {
    id: i64,
    name: String,
    url: String,
    priority: i64,
    models: Vec<String>,
    model_redirects: std::collections::HashMap<String, String>,
    channel_type: String,
    enabled: bool,
    rr_key_index: i64,
    cooldown_until: i64,
    cooldown_duration_ms: i64,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiKeySnapshot {
    key_index: i64,
    api_key: String,
    key_strategy: String,
    cooldown_until: i64,
    cooldown_duration_ms: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenSnapshot {
    token_hash: String,
    description: String,
    created_at: i64,
    expires_at: Option<i64>,
    last_used_at: Option<i64>,
    is_active: bool,
    success_count: i64,
    failure_count: i64,
    stream_avg_ttfb: f64,
    non_stream_avg_rt: f64,
    stream_count: i64,
    non_stream_count: i64,
    prompt_tokens_total: i64,
    completion_tokens_total: i64,
    total_cost_usd: f64,
}

#[derive(Debug)]
pub struct RedisMirror {
    pool: RedisPool,
    config: RedisConfig,
    trigger: mpsc::Sender<()>,
    worker: tokio::task::JoinHandle<()>,
}

impl RedisMirror {
    /// Connects (or lazily prepares) the Redis pool and starts the single debounced
    /// worker task. The worker consumes a one-deep "pending" channel: further
    /// triggers while a snapshot is already pending collapse into that one pending
    /// write (spec §9 "Worker concurrency").
    pub async fn start(
        config: RedisConfig,
        channels: ChannelRepo,
        tokens: TokenRepo,
    ) -> Result<Self> {
        let fred_config = FredConfig::from_url(&config.url).map_err(Error::from)?;
        let perf = PerformanceConfig::default();
        let policy = ReconnectPolicy::default();
        let pool =
            RedisPool::new(fred_config, Some(perf), None, Some(policy), 4).map_err(Error::from)?;

        let _handles = pool.connect().await;
        timeout(config.dial_timeout(), pool.wait_for_connect())
            .await
            .map_err(|_| Error::Redis(anyhow::anyhow!("timed out connecting to Redis")))?
            .map_err(Error::from)?;

        let (tx, rx) = mpsc::channel::<()>(1);
        let worker = tokio::task::spawn(run_worker(
            pool.clone(),
            config.clone(),
            channels,
            tokens,
            rx,
        ));

        Ok(RedisMirror {
            pool,
            config,
            trigger: tx,
            worker,
        })
    }

    /// Non-blocking trigger: if a snapshot is already pending, this is a no-op
    /// (spec §4.D "if full, the pending snapshot already covers this mutation").
    pub fn trigger_async_sync(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Cold-start restore (spec §4.D). Runs inside one transaction; a partial
    /// failure rolls back so a half-restored mirror never becomes visible.
    pub async fn load_channels_with_keys(&self, pool: &SqlitePool) -> Result<usize> {
        let raw: Option<String> = timeout(self.config.op_timeout(), self.pool.get(CHANNELS_KEY))
            .await
            .map_err(|_| Error::Redis(anyhow::anyhow!("timed out reading {CHANNELS_KEY}")))?
            .map_err(Error::from)?;

        let snapshots: Vec<ChannelSnapshot> = match raw {
            Some(data) if !data.is_empty() => {
                serde_json::from_str(&data).map_err(|e| Error::Redis(anyhow::Error::new(e)))?
            }
            _ => Vec::new(),
        };

        if snapshots.is_empty() {
            return Ok(0);
        }

        let mut tx = pool.begin().await.map_err(crate::error::classify_sqlx_error)?;
        let mut restored = 0usize;

        for snap in snapshots {
            let channel_type = if snap.config.channel_type.trim().is_empty() {
                DEFAULT_CHANNEL_TYPE.to_string()
            } else {
                snap.config.channel_type
            };
            let models_json = serde_json::to_string(&snap.config.models)
                .map_err(|e| Error::Redis(anyhow::Error::new(e)))?;
            let redirects_json = serde_json::to_string(&snap.config.model_redirects)
                .map_err(|e| Error::Redis(anyhow::Error::new(e)))?;

            let new_id = sqlx::query(
                "INSERT INTO channels (name, url, priority, models, model_redirects, \
                 channel_type, enabled, cooldown_until, cooldown_duration_ms, rr_key_index, \
                 created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0, 0, ?, ?)",
            )
            .bind(&snap.config.name)
            .bind(&snap.config.url)
            .bind(snap.config.priority)
            .bind(&models_json)
            .bind(&redirects_json)
            .bind(&channel_type)
            .bind(snap.config.enabled as i64)
            .bind(snap.config.created_at)
            .bind(snap.config.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(crate::error::classify_sqlx_error)?
            .last_insert_rowid();

            for model in &snap.config.models {
                sqlx::query(
                    "INSERT OR IGNORE INTO channel_models (channel_id, model, created_at) \
                     VALUES (?, ?, ?)",
                )
                .bind(new_id)
                .bind(model)
                .bind(snap.config.updated_at)
                .execute(&mut *tx)
                .await
                .map_err(crate::error::classify_sqlx_error)?;
            }

            for key in snap.api_keys {
                let strategy = if key.key_strategy.trim().is_empty() {
                    DEFAULT_KEY_STRATEGY.to_string()
                } else {
                    key.key_strategy
                };
                sqlx::query(
                    "INSERT INTO api_keys (channel_id, key_index, api_key, key_strategy, \
                     cooldown_until, cooldown_duration_ms, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, 0, 0, ?, ?)",
                )
                .bind(new_id)
                .bind(key.key_index)
                .bind(&key.api_key)
                .bind(&strategy)
                .bind(snap.config.created_at)
                .bind(snap.config.updated_at)
                .execute(&mut *tx)
                .await
                .map_err(crate::error::classify_sqlx_error)?;
            }

            restored += 1;
        }

        tx.commit().await.map_err(crate::error::classify_sqlx_error)?;
        METRICS.record_redis_restore("ok");
        Ok(restored)
    }

    pub async fn load_auth_tokens(&self, tokens: &TokenRepo) -> Result<usize> {
        let raw: Option<String> = timeout(self.config.op_timeout(), self.pool.get(TOKENS_KEY))
            .await
            .map_err(|_| Error::Redis(anyhow::anyhow!("timed out reading {TOKENS_KEY}")))?
            .map_err(Error::from)?;

        let snapshots: Vec<TokenSnapshot> = match raw {
            Some(data) if !data.is_empty() => {
                serde_json::from_str(&data).map_err(|e| Error::Redis(anyhow::Error::new(e)))?
            }
            _ => Vec::new(),
        };

        let mut restored = 0;
        for snap in snapshots {
            tokens
                .create_token(NewAuthToken {
                    token_hash: snap.token_hash,
                    description: snap.description,
                    expires_at: snap.expires_at,
                    is_active: snap.is_active,
                })
                .await?;
            restored += 1;
        }
        Ok(restored)
    }

    pub async fn shutdown(self) {
        drop(self.trigger);
        match timeout(self.config.shutdown_timeout(), self.worker).await {
            Ok(Ok(())) => info!("redis mirror worker drained"),
            Ok(Err(err)) => error!(?err, "redis mirror worker panicked"),
            Err(_) => warn!("redis mirror worker did not drain before shutdown timeout"),
        }
    }
}

async fn run_worker(
    pool: RedisPool,
    config: RedisConfig,
    channels: ChannelRepo,
    tokens: TokenRepo,
    mut rx: mpsc::Receiver<()>,
) {
    while rx.recv().await.is_some() {
        tokio::time::sleep(config.debounce()).await;
        // Drain any additional triggers that arrived during the debounce window;
        // they're already covered by the snapshot we're about to take.
        while rx.try_recv().is_ok() {}

        if let Err(err) = snapshot_once(&pool, &config, &channels, &tokens).await {
            warn!(?err, "redis mirror snapshot failed, will retry on next trigger");
            METRICS.record_redis_sync("error");
        } else {
            METRICS.record_redis_sync("ok");
        }
    }
}

async fn snapshot_once(
    pool: &RedisPool,
    config: &RedisConfig,
    channels: &ChannelRepo,
    tokens: &TokenRepo,
) -> anyhow::Result<()> {
    let channel_list = channels.list_channels().await?;
    let mut snapshots = Vec::with_capacity(channel_list.len());
    for ch in channel_list {
        let keys = channels.get_api_keys(ch.id).await?;
        snapshots.push(ChannelSnapshot {
            config: ChannelConfigSnapshot {
                id: ch.id,
                name: ch.name,
                url: ch.url,
                priority: ch.priority,
                models: ch.models,
                model_redirects: ch.model_redirects,
                channel_type: ch.channel_type,
                enabled: ch.enabled,
                rr_key_index: ch.rr_key_index,
                cooldown_until: ch.cooldown_until,
                cooldown_duration_ms: ch.cooldown_duration_ms,
                created_at: ch.created_at,
                updated_at: ch.updated_at,
            },
            api_keys: keys
                .into_iter()
                .map(|k| ApiKeySnapshot {
                    key_index: k.key_index,
                    api_key: k.api_key,
                    key_strategy: k.key_strategy,
                    cooldown_until: k.cooldown_until,
                    cooldown_duration_ms: k.cooldown_duration_ms,
                })
                .collect(),
        });
    }

    let channels_json = serde_json::to_string(&snapshots)?;
    timeout(config.snapshot_timeout(), pool.set::<(), _, _>(CHANNELS_KEY, channels_json, None, None, false))
        .await??;

    // Mirror every token, not just the serving-path-active set: a deactivated or
    // expired token must still come back with its `is_active`/`expires_at` intact
    // after a crash-and-restore cycle (spec §4.D).
    let all_tokens = tokens.list_all().await?;
    let token_snapshots: Vec<TokenSnapshot> = all_tokens
        .into_iter()
        .map(|t| TokenSnapshot {
            token_hash: t.token_hash,
            description: t.description,
            created_at: t.created_at,
            expires_at: t.expires_at,
            last_used_at: t.last_used_at,
            is_active: t.is_active,
            success_count: t.success_count,
            failure_count: t.failure_count,
            stream_avg_ttfb: t.stream_avg_ttfb,
            non_stream_avg_rt: t.non_stream_avg_rt,
            stream_count: t.stream_count,
            non_stream_count: t.non_stream_count,
            prompt_tokens_total: t.prompt_tokens_total,
            completion_tokens_total: t.completion_tokens_total,
            total_cost_usd: t.total_cost_usd,
        })
        .collect();
    let tokens_json = serde_json::to_string(&token_snapshots)?;
    timeout(config.snapshot_timeout(), pool.set::<(), _, _>(TOKENS_KEY, tokens_json, None, None, false))
        .await??;

    Ok(())
}
