//! Composite facade (spec §2): wires the five components behind one `Store`,
//! owns cold-start restore from Redis, and fans `trigger_async_sync()` out to
//! every mutating call the way the host proxy's `StorageBackend` fans cache
//! invalidation out from its own request-handling entry points.

use std::collections::HashMap;
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::Config;
use crate::context::guarded;
use crate::db::channels::ChannelRepo;
use crate::db::cooldown::CooldownEngine;
use crate::db::logs::LogStore;
use crate::db::tokens::TokenRepo;
use crate::db::{connect_logs, connect_main, Keeper};
use crate::error::{Error, Result};
use crate::metrics::METRICS;
use crate::model::{
    ApiKey, ApiKeyPatch, AuthToken, Channel, ChannelPatch, LogEntry, LogFilter, MetricPoint,
    NewApiKey, NewAuthToken, NewChannel, NewLogEntry, StatsObservation,
};
use crate::redis_mirror::RedisMirror;

/// One row of `Store::get_stats` (spec §4.F `GetStats`, grouped by channel and
/// model). `channel_name` is `None` when the row's channel has since been
/// deleted — the id survives in the log but the name lookup misses.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelModelStat {
    pub channel_id: Option<i64>,
    pub channel_name: Option<String>,
    pub model: String,
    pub success: i64,
    pub error: i64,
    pub cost: f64,
}

/// The facade described in spec §2. Holds the local repositories plus an
/// optional mirror; `mirror` is `None` when `Config.redis` is absent (file-mode
/// main store with no cache configured is a supported, if less durable, setup —
/// only memory mode without Redis is refused, in `Store::open`).
pub struct Store {
    channels: ChannelRepo,
    cooldown: CooldownEngine,
    tokens: TokenRepo,
    logs: LogStore,
    mirror: Option<RedisMirror>,
    main_pool: SqlitePool,
    logs_pool: SqlitePool,
    cleanup_task: Option<tokio::task::JoinHandle<()>>,
    _keeper: Keeper,
}

impl Store {
    /// Opens local persistence, then performs the cold-start restore described
    /// in spec §4.D: if the local channel table is empty and Redis has a
    /// snapshot, restore from it and let the restore's own writes be the first
    /// thing the mirror would reflect back. A one-time startup sequence, not a
    /// per-call suspension point, so it isn't wrapped by `CallContext`.
    pub async fn open(config: &Config) -> Result<Self> {
        config.validate().map_err(|e| Error::Fatal(e.to_string()))?;

        let (main_pool, keeper) = connect_main(&config.database)
            .await
            .map_err(|e| Error::Fatal(e.to_string()))?;
        let logs_pool = connect_logs(&config.database.logs_path, config.database.pool_size)
            .await
            .map_err(|e| Error::Fatal(e.to_string()))?;

        let channels = ChannelRepo::new(main_pool.clone());
        let cooldown = CooldownEngine::new(main_pool.clone());
        let tokens = TokenRepo::new(main_pool.clone());
        let logs = LogStore::new(logs_pool.clone());

        let cleanup_task = config.database.cleanup_interval_secs.map(|secs| {
            logs.spawn_cleanup_task(
                Duration::from_secs(secs),
                Duration::from_secs(config.database.retain_days.max(0) as u64 * 86_400),
            )
        });

        let mirror = match &config.redis {
            Some(redis_config) => {
                let mirror = RedisMirror::start(redis_config.clone(), channels.clone(), tokens.clone())
                    .await?;

                if channels.list_channels().await?.is_empty() {
                    match mirror.load_channels_with_keys(&main_pool).await {
                        Ok(n) if n > 0 => info!(restored = n, "restored channels from redis on cold start"),
                        Ok(_) => info!("redis snapshot empty, starting with no channels"),
                        Err(err) => warn!(?err, "redis channel restore failed, starting empty"),
                    }
                    match mirror.load_auth_tokens(&tokens).await {
                        Ok(n) if n > 0 => info!(restored = n, "restored auth tokens from redis on cold start"),
                        Ok(_) => {}
                        Err(err) => warn!(?err, "redis token restore failed, starting empty"),
                    }
                }

                Some(mirror)
            }
            None => None,
        };

        Ok(Store {
            channels,
            cooldown,
            tokens,
            logs,
            mirror,
            main_pool,
            logs_pool,
            cleanup_task,
            _keeper: keeper,
        })
    }

    fn trigger_sync(&self) {
        if let Some(mirror) = &self.mirror {
            mirror.trigger_async_sync();
        }
    }

    // --- Channel/Key repository (§4.B) -----------------------------------

    pub async fn create_channel(&self, cfg: NewChannel) -> Result<Channel> {
        guarded(async {
            let ch = self.channels.create_channel(cfg).await?;
            self.trigger_sync();
            Ok(ch)
        })
        .await
    }

    pub async fn update_channel(&self, id: i64, patch: ChannelPatch) -> Result<Channel> {
        guarded(async {
            let ch = self.channels.update_channel(id, patch).await?;
            self.trigger_sync();
            Ok(ch)
        })
        .await
    }

    pub async fn delete_channel(&self, id: i64) -> Result<()> {
        guarded(async {
            self.channels.delete_channel(id).await?;
            self.trigger_sync();
            Ok(())
        })
        .await
    }

    pub async fn get_channel(&self, id: i64) -> Result<Channel> {
        guarded(self.channels.get_channel(id)).await
    }

    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        guarded(self.channels.list_channels()).await
    }

    pub async fn list_channels_for_model(&self, model: &str) -> Result<Vec<Channel>> {
        guarded(self.channels.list_channels_for_model(model)).await
    }

    pub async fn create_api_key(&self, k: NewApiKey) -> Result<ApiKey> {
        guarded(async {
            let key = self.channels.create_api_key(k).await?;
            self.trigger_sync();
            Ok(key)
        })
        .await
    }

    pub async fn update_api_key(
        &self,
        channel_id: i64,
        key_index: i64,
        patch: ApiKeyPatch,
    ) -> Result<ApiKey> {
        guarded(async {
            let key = self.channels.update_api_key(channel_id, key_index, patch).await?;
            self.trigger_sync();
            Ok(key)
        })
        .await
    }

    pub async fn delete_api_key(&self, channel_id: i64, key_index: i64) -> Result<()> {
        guarded(async {
            self.channels.delete_api_key(channel_id, key_index).await?;
            self.trigger_sync();
            Ok(())
        })
        .await
    }

    pub async fn get_api_key(&self, channel_id: i64, key_index: i64) -> Result<ApiKey> {
        guarded(self.channels.get_api_key(channel_id, key_index)).await
    }

    pub async fn get_api_keys(&self, channel_id: i64) -> Result<Vec<ApiKey>> {
        guarded(self.channels.get_api_keys(channel_id)).await
    }

    pub async fn get_and_set_channel_rr_index(&self, channel_id: i64, key_count: i64) -> Result<i64> {
        guarded(self.channels.get_and_set_channel_rr_index(channel_id, key_count)).await
    }

    /// Request-serving selection helper: candidate channels for `model` that
    /// are both enabled and outside cooldown, masking via one batch cooldown
    /// read rather than a round-trip per channel (spec §4.C "Batch read").
    pub async fn selectable_channels_for_model(&self, model: &str, now: i64) -> Result<Vec<Channel>> {
        guarded(async {
            let candidates = self.channels.list_channels_for_model(model).await?;
            let cooldowns = self.cooldown.get_all_channel_cooldowns().await?;
            Ok(candidates
                .into_iter()
                .filter(|c| c.enabled && !cooldowns.contains_key(&c.id))
                .collect())
        })
        .await
    }

    // --- Cooldown engine (§4.C) -------------------------------------------

    pub async fn bump_channel(&self, channel_id: i64, now: i64, status: u16) -> Result<std::time::Duration> {
        guarded(async {
            let d = self.cooldown.bump_channel(channel_id, now, status).await?;
            self.trigger_sync();
            Ok(d)
        })
        .await
    }

    pub async fn bump_key(
        &self,
        channel_id: i64,
        key_index: i64,
        now: i64,
        status: u16,
    ) -> Result<std::time::Duration> {
        guarded(async {
            let d = self.cooldown.bump_key(channel_id, key_index, now, status).await?;
            self.trigger_sync();
            Ok(d)
        })
        .await
    }

    pub async fn reset_channel_cooldown(&self, channel_id: i64) -> Result<()> {
        guarded(async {
            self.cooldown.reset_channel_cooldown(channel_id).await?;
            self.trigger_sync();
            Ok(())
        })
        .await
    }

    pub async fn reset_key_cooldown(&self, channel_id: i64, key_index: i64) -> Result<()> {
        guarded(async {
            self.cooldown.reset_key_cooldown(channel_id, key_index).await?;
            self.trigger_sync();
            Ok(())
        })
        .await
    }

    pub async fn set_channel_cooldown(&self, channel_id: i64, until: i64) -> Result<()> {
        guarded(async {
            self.cooldown.set_channel_cooldown(channel_id, until).await?;
            self.trigger_sync();
            Ok(())
        })
        .await
    }

    pub async fn set_key_cooldown(&self, channel_id: i64, key_index: i64, until: i64) -> Result<()> {
        guarded(async {
            self.cooldown.set_key_cooldown(channel_id, key_index, until).await?;
            self.trigger_sync();
            Ok(())
        })
        .await
    }

    pub async fn get_all_channel_cooldowns(&self) -> Result<HashMap<i64, i64>> {
        guarded(self.cooldown.get_all_channel_cooldowns()).await
    }

    pub async fn get_all_key_cooldowns(&self) -> Result<HashMap<i64, HashMap<i64, i64>>> {
        guarded(self.cooldown.get_all_key_cooldowns()).await
    }

    // --- Auth-token store (§4.E) -------------------------------------------

    pub async fn create_token(&self, t: NewAuthToken) -> Result<AuthToken> {
        guarded(async {
            let token = self.tokens.create_token(t).await?;
            self.trigger_sync();
            Ok(token)
        })
        .await
    }

    pub async fn get_token_by_id(&self, id: i64) -> Result<AuthToken> {
        guarded(self.tokens.get_by_id(id)).await
    }

    pub async fn get_token_by_hash(&self, token_hash: &str) -> Result<AuthToken> {
        guarded(self.tokens.get_by_hash(token_hash)).await
    }

    pub async fn list_active_auth_tokens(&self) -> Result<Vec<AuthToken>> {
        guarded(self.tokens.list_active()).await
    }

    pub async fn update_last_used(&self, token_hash: &str) -> Result<()> {
        guarded(self.tokens.update_last_used(token_hash)).await
    }

    pub async fn update_token_stats(&self, token_hash: &str, obs: StatsObservation) -> Result<()> {
        guarded(async {
            self.tokens.update_stats(token_hash, obs).await?;
            self.trigger_sync();
            Ok(())
        })
        .await
    }

    pub async fn delete_token(&self, id: i64) -> Result<()> {
        guarded(async {
            self.tokens.delete(id).await?;
            self.trigger_sync();
            Ok(())
        })
        .await
    }

    // --- Log store + aggregator (§4.F) -------------------------------------

    pub async fn add_log(&self, entry: NewLogEntry) -> Result<i64> {
        guarded(self.logs.add_log(entry)).await
    }

    pub async fn batch_add_logs(&self, entries: Vec<NewLogEntry>) -> Result<()> {
        guarded(self.logs.batch_add_logs(entries)).await
    }

    pub async fn list_logs(
        &self,
        since_ms: i64,
        limit: i64,
        offset: i64,
        filter: &LogFilter,
    ) -> Result<Vec<LogEntry>> {
        guarded(async {
            let filter = self.resolve_channel_name_filter(filter).await?;
            self.logs.list_logs(since_ms, limit, offset, &filter).await
        })
        .await
    }

    pub async fn list_logs_range(
        &self,
        since_ms: i64,
        until_ms: i64,
        limit: i64,
        offset: i64,
        filter: &LogFilter,
    ) -> Result<Vec<LogEntry>> {
        guarded(async {
            let filter = self.resolve_channel_name_filter(filter).await?;
            self.logs
                .list_logs_range(since_ms, until_ms, limit, offset, &filter)
                .await
        })
        .await
    }

    pub async fn count_logs(&self, since_ms: i64, until_ms: i64, filter: &LogFilter) -> Result<i64> {
        guarded(async {
            let filter = self.resolve_channel_name_filter(filter).await?;
            self.logs.count_logs(since_ms, until_ms, &filter).await
        })
        .await
    }

    pub async fn cleanup_logs_before(&self, cutoff_ms: i64) -> Result<u64> {
        guarded(self.logs.cleanup_logs_before(cutoff_ms)).await
    }

    pub async fn aggregate(&self, since_ms: i64, bucket_secs: i64) -> Result<Vec<MetricPoint>> {
        guarded(async {
            let names = self.channel_names().await?;
            self.logs.aggregate(since_ms, bucket_secs, &names).await
        })
        .await
    }

    pub async fn aggregate_range(
        &self,
        since_ms: i64,
        until_ms: i64,
        bucket_secs: i64,
    ) -> Result<Vec<MetricPoint>> {
        guarded(async {
            let names = self.channel_names().await?;
            self.logs
                .aggregate_range(since_ms, until_ms, bucket_secs, &names)
                .await
        })
        .await
    }

    /// Grouped by `(channel_id, model)` over an HTTP-time range (spec §4.F
    /// `GetStats`); channel ids are resolved to names via the same batched
    /// lookup the aggregator uses.
    pub async fn get_stats(
        &self,
        start_ms: i64,
        end_ms: i64,
        filter: &LogFilter,
    ) -> Result<Vec<ChannelModelStat>> {
        guarded(async {
            let filter = self.resolve_channel_name_filter(filter).await?;
            let names = self.channel_names().await?;
            let rows = self.logs.get_stats(start_ms, end_ms, &filter).await?;
            Ok(rows
                .into_iter()
                .map(|(channel_id, model, success, error, cost)| ChannelModelStat {
                    channel_id,
                    channel_name: channel_id.and_then(|id| names.get(&id).cloned()),
                    model,
                    success,
                    error,
                    cost,
                })
                .collect())
        })
        .await
    }

    /// Single batched lookup feeding both the aggregator's channel-id-to-name
    /// resolution and the filter's name-to-id resolution (spec §4.F "one
    /// batched lookup, no N+1"). Called only from within an already-`guarded`
    /// method, so it doesn't need its own wrapping.
    async fn channel_names(&self) -> Result<HashMap<i64, String>> {
        Ok(self
            .channels
            .list_channels()
            .await?
            .into_iter()
            .map(|c| (c.id, c.name))
            .collect())
    }

    /// Resolves `channel_name_exact`/`channel_name_substring` into `channel_ids`
    /// against the channel repository, so [`LogStore`] itself never needs to
    /// join across the two databases (spec §4.F).
    async fn resolve_channel_name_filter(&self, filter: &LogFilter) -> Result<LogFilter> {
        if filter.channel_name_exact.is_none() && filter.channel_name_substring.is_none() {
            return Ok(filter.clone());
        }

        let all = self.channels.list_channels().await?;
        let mut ids: Vec<i64> = filter.channel_ids.clone().unwrap_or_default();

        if let Some(exact) = &filter.channel_name_exact {
            ids.extend(all.iter().filter(|c| &c.name == exact).map(|c| c.id));
        }
        if let Some(substr) = &filter.channel_name_substring {
            ids.extend(
                all.iter()
                    .filter(|c| c.name.contains(substr.as_str()))
                    .map(|c| c.id),
            );
        }
        ids.sort_unstable();
        ids.dedup();

        Ok(LogFilter {
            status: filter.status,
            model: filter.model.clone(),
            channel_ids: Some(ids),
            channel_name_exact: None,
            channel_name_substring: None,
        })
    }

    /// Liveness probe for the ambient health surface: confirms the main pool
    /// can still round-trip a query. Does not touch Redis — a degraded mirror
    /// is logged, not fatal (spec §7). Also refreshes the pool connection
    /// gauges (SPEC_FULL.md §B "Connection pool metrics") since a health check
    /// is a convenient, already-scheduled place to sample them.
    pub async fn health(&self) -> Result<()> {
        guarded(async {
            self.record_pool_metrics();
            self.channels.list_channels().await.map(|_| ())
        })
        .await
    }

    fn record_pool_metrics(&self) {
        METRICS.record_pool_usage("main", self.main_pool.size() as u64, self.main_pool.num_idle() as u64);
        METRICS.record_pool_usage("logs", self.logs_pool.size() as u64, self.logs_pool.num_idle() as u64);
    }

    /// Drains the Redis worker (if any) and closes the in-memory keeper
    /// connection last, so a memory-backed database is never torn down while
    /// a snapshot is still in flight (spec §5 "Cancellation/timeout"). The
    /// cleanup task (if running) is aborted first since it has no in-flight
    /// work worth draining. Shutdown ignores any scoped `CallContext` — it has
    /// its own timeout (`RedisConfig::shutdown_timeout`) and must run to
    /// completion regardless of the caller's deadline.
    pub async fn shutdown(self) {
        if let Some(task) = self.cleanup_task {
            task.abort();
        }
        if let Some(mirror) = self.mirror {
            mirror.shutdown().await;
        }
        drop(self._keeper);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::context::CallContext;
    use std::collections::HashMap as Map;

    fn memory_config() -> Config {
        Config {
            database: DatabaseConfig {
                path: "ccload_store_test.db".into(),
                logs_path: "ccload_store_test_logs.db".into(),
                ..DatabaseConfig::default()
            },
            redis: None,
        }
    }

    #[tokio::test]
    async fn open_without_redis_in_file_mode_succeeds() {
        let dir = std::env::temp_dir().join(format!("ccload-store-test-{}", line!()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut config = memory_config();
        config.database.path = dir.join("main.db").to_string_lossy().to_string();
        config.database.logs_path = dir.join("logs.db").to_string_lossy().to_string();

        let store = Store::open(&config).await.unwrap();
        assert!(store.list_channels().await.unwrap().is_empty());
        store.health().await.unwrap();
        store.shutdown().await;
    }

    #[tokio::test]
    async fn create_channel_and_select_by_model() {
        let dir = std::env::temp_dir().join(format!("ccload-store-test-{}", line!()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut config = memory_config();
        config.database.path = dir.join("main.db").to_string_lossy().to_string();
        config.database.logs_path = dir.join("logs.db").to_string_lossy().to_string();

        let store = Store::open(&config).await.unwrap();
        let ch = store
            .create_channel(NewChannel {
                name: "c1".into(),
                url: "https://example.test".into(),
                priority: 0,
                models: vec!["claude-3".into()],
                model_redirects: Map::new(),
                channel_type: String::new(),
                enabled: true,
            })
            .await
            .unwrap();
        assert_eq!(ch.channel_type, "anthropic");

        let now = crate::db::now_unix();
        let selectable = store.selectable_channels_for_model("claude-3", now).await.unwrap();
        assert_eq!(selectable.len(), 1);

        store.bump_channel(ch.id, now, 401).await.unwrap();
        let selectable = store.selectable_channels_for_model("claude-3", now).await.unwrap();
        assert!(selectable.is_empty());

        store.shutdown().await;
    }

    #[tokio::test]
    async fn resolves_channel_name_filters_before_hitting_logs() {
        let dir = std::env::temp_dir().join(format!("ccload-store-test-{}", line!()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut config = memory_config();
        config.database.path = dir.join("main.db").to_string_lossy().to_string();
        config.database.logs_path = dir.join("logs.db").to_string_lossy().to_string();

        let store = Store::open(&config).await.unwrap();
        let ch = store
            .create_channel(NewChannel {
                name: "prod-east".into(),
                url: "https://example.test".into(),
                priority: 0,
                models: vec![],
                model_redirects: Map::new(),
                channel_type: String::new(),
                enabled: true,
            })
            .await
            .unwrap();

        store
            .add_log(NewLogEntry {
                time_ms: 1,
                model: "claude-3".into(),
                channel_id: Some(ch.id),
                status_code: 200,
                api_key: "sk-aaaaaaaaaaaa".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let filter = LogFilter {
            channel_name_substring: Some("prod".into()),
            ..Default::default()
        };
        let n = store.count_logs(0, i64::MAX, &filter).await.unwrap();
        assert_eq!(n, 1);

        let filter = LogFilter {
            channel_name_exact: Some("other".into()),
            ..Default::default()
        };
        let n = store.count_logs(0, i64::MAX, &filter).await.unwrap();
        assert_eq!(n, 0);

        store.shutdown().await;
    }

    #[tokio::test]
    async fn cleanup_task_runs_on_the_configured_interval() {
        let dir = std::env::temp_dir().join(format!("ccload-store-test-{}", line!()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut config = memory_config();
        config.database.path = dir.join("main.db").to_string_lossy().to_string();
        config.database.logs_path = dir.join("logs.db").to_string_lossy().to_string();
        config.database.cleanup_interval_secs = Some(1);
        config.database.retain_days = 0;

        let store = Store::open(&config).await.unwrap();
        store
            .add_log(NewLogEntry {
                time_ms: 1,
                model: "claude-3".into(),
                api_key: "sk-aaaaaaaaaaaa".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1_500)).await;
        let remaining = store.count_logs(0, i64::MAX, &LogFilter::default()).await.unwrap();
        assert_eq!(remaining, 0);

        store.shutdown().await;
    }

    #[tokio::test]
    async fn a_deadline_surfaces_as_cancelled_instead_of_hanging() {
        let dir = std::env::temp_dir().join(format!("ccload-store-test-{}", line!()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut config = memory_config();
        config.database.path = dir.join("main.db").to_string_lossy().to_string();
        config.database.logs_path = dir.join("logs.db").to_string_lossy().to_string();

        let store = Store::open(&config).await.unwrap();

        // A zero-duration deadline has already elapsed by the time the guarded
        // future is polled, so even a fast in-memory query is abandoned.
        let ctx = CallContext::with_timeout(Duration::from_nanos(1));
        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = ctx.scope(store.list_channels()).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        // Without a scoped context the same call succeeds normally.
        store.list_channels().await.unwrap();

        store.shutdown().await;
    }
}
