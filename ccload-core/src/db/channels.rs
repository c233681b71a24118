//! Channel/Key repository (spec §4.B): CRUD on channels and keys, the denormalized
//! `channel_models` fast-path index, and the compare-and-swap round-robin advance.

use std::collections::HashMap;

use rand::Rng;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::error::{classify_sqlx_error, Error, Result};
use crate::metrics::METRICS;
use crate::model::{
    ApiKey, ApiKeyPatch, Channel, ChannelPatch, NewApiKey, NewChannel, DEFAULT_CHANNEL_TYPE,
    DEFAULT_KEY_STRATEGY,
};

use super::now_unix;

const RR_CAS_MAX_RETRIES: usize = 8;

#[derive(Clone, Debug)]
pub struct ChannelRepo {
    pool: SqlitePool,
}

impl ChannelRepo {
    pub fn new(pool: SqlitePool) -> Self {
        ChannelRepo { pool }
    }

    pub async fn create_channel(&self, cfg: NewChannel) -> Result<Channel> {
        if cfg.priority < 0 {
            return Err(Error::Validation("priority must be non-negative".into()));
        }

        let now = now_unix();
        let channel_type = if cfg.channel_type.trim().is_empty() {
            DEFAULT_CHANNEL_TYPE.to_string()
        } else {
            cfg.channel_type
        };
        let models_json = serde_json::to_string(&cfg.models).map_err(to_validation)?;
        let redirects_json = serde_json::to_string(&cfg.model_redirects).map_err(to_validation)?;

        let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;

        let id = sqlx::query(
            "INSERT INTO channels (name, url, priority, models, model_redirects, channel_type, \
             enabled, cooldown_until, cooldown_duration_ms, rr_key_index, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0, 0, ?, ?)",
        )
        .bind(&cfg.name)
        .bind(&cfg.url)
        .bind(cfg.priority)
        .bind(&models_json)
        .bind(&redirects_json)
        .bind(&channel_type)
        .bind(cfg.enabled as i64)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(classify_sqlx_error)?
        .last_insert_rowid();

        rebuild_channel_models(&mut tx, id, &cfg.models, now).await?;

        tx.commit().await.map_err(classify_sqlx_error)?;

        self.get_channel(id).await
    }

    pub async fn update_channel(&self, id: i64, patch: ChannelPatch) -> Result<Channel> {
        let mut sets: Vec<&'static str> = Vec::new();
        let mut binds: Vec<Bind> = Vec::new();

        if let Some(ref v) = patch.name {
            sets.push("name = ?");
            binds.push(Bind::Str(v.clone()));
        }
        if let Some(ref v) = patch.url {
            sets.push("url = ?");
            binds.push(Bind::Str(v.clone()));
        }
        if let Some(v) = patch.priority {
            if v < 0 {
                return Err(Error::Validation("priority must be non-negative".into()));
            }
            sets.push("priority = ?");
            binds.push(Bind::I64(v));
        }
        if let Some(ref v) = patch.models {
            let json = serde_json::to_string(v).map_err(to_validation)?;
            sets.push("models = ?");
            binds.push(Bind::Str(json));
        }
        if let Some(ref v) = patch.model_redirects {
            let json = serde_json::to_string(v).map_err(to_validation)?;
            sets.push("model_redirects = ?");
            binds.push(Bind::Str(json));
        }
        if let Some(ref v) = patch.channel_type {
            let v = if v.trim().is_empty() {
                DEFAULT_CHANNEL_TYPE.to_string()
            } else {
                v.clone()
            };
            sets.push("channel_type = ?");
            binds.push(Bind::Str(v));
        }
        if let Some(v) = patch.enabled {
            sets.push("enabled = ?");
            binds.push(Bind::I64(v as i64));
        }

        if sets.is_empty() {
            return self.get_channel(id).await;
        }

        let now = now_unix();
        sets.push("updated_at = ?");
        binds.push(Bind::I64(now));

        let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;

        let sql = format!("UPDATE channels SET {} WHERE id = ?", sets.join(", "));
        let mut q = sqlx::query(&sql);
        for b in &binds {
            q = bind_param(q, b);
        }
        let affected = q
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx_error)?
            .rows_affected();
        if affected == 0 {
            return Err(Error::NotFound);
        }

        if let Some(ref v) = patch.models {
            rebuild_channel_models(&mut tx, id, v, now).await?;
        }

        tx.commit().await.map_err(classify_sqlx_error)?;
        self.get_channel(id).await
    }

    pub async fn delete_channel(&self, id: i64) -> Result<()> {
        let affected = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?
            .rows_affected();
        if affected == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    pub async fn get_channel(&self, id: i64) -> Result<Channel> {
        let row = sqlx::query(
            "SELECT id, name, url, priority, models, model_redirects, channel_type, enabled, \
             rr_key_index, cooldown_until, cooldown_duration_ms, created_at, updated_at \
             FROM channels WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx_error)?
        .ok_or(Error::NotFound)?;

        row_to_channel(&row)
    }

    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        let rows = sqlx::query(
            "SELECT id, name, url, priority, models, model_redirects, channel_type, enabled, \
             rr_key_index, cooldown_until, cooldown_duration_ms, created_at, updated_at \
             FROM channels ORDER BY priority DESC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        rows.iter().map(row_to_channel).collect()
    }

    /// Channels serving `model`, using the denormalized `channel_models` index
    /// instead of scanning the JSON `models` column (spec §4.B "Model filtering fast
    /// path").
    pub async fn list_channels_for_model(&self, model: &str) -> Result<Vec<Channel>> {
        let rows = sqlx::query(
            "SELECT c.id, c.name, c.url, c.priority, c.models, c.model_redirects, \
             c.channel_type, c.enabled, c.rr_key_index, c.cooldown_until, \
             c.cooldown_duration_ms, c.created_at, c.updated_at \
             FROM channels c JOIN channel_models cm ON cm.channel_id = c.id \
             WHERE cm.model = ? ORDER BY c.priority DESC, c.id ASC",
        )
        .bind(model)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        rows.iter().map(row_to_channel).collect()
    }

    pub async fn create_api_key(&self, k: NewApiKey) -> Result<ApiKey> {
        if k.key_index < 0 {
            return Err(Error::Validation("key_index must be non-negative".into()));
        }

        let now = now_unix();
        let strategy = if k.key_strategy.trim().is_empty() {
            DEFAULT_KEY_STRATEGY.to_string()
        } else {
            k.key_strategy
        };
        let id = sqlx::query(
            "INSERT INTO api_keys (channel_id, key_index, api_key, key_strategy, \
             cooldown_until, cooldown_duration_ms, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 0, 0, ?, ?)",
        )
        .bind(k.channel_id)
        .bind(k.key_index)
        .bind(&k.api_key)
        .bind(&strategy)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?
        .last_insert_rowid();

        self.get_api_key_by_id(id).await
    }

    pub async fn update_api_key(
        &self,
        channel_id: i64,
        key_index: i64,
        patch: ApiKeyPatch,
    ) -> Result<ApiKey> {
        let now = now_unix();
        let affected = sqlx::query(
            "UPDATE api_keys SET \
             api_key = COALESCE(?, api_key), \
             key_strategy = COALESCE(?, key_strategy), \
             updated_at = ? \
             WHERE channel_id = ? AND key_index = ?",
        )
        .bind(patch.api_key)
        .bind(patch.key_strategy)
        .bind(now)
        .bind(channel_id)
        .bind(key_index)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?
        .rows_affected();
        if affected == 0 {
            return Err(Error::NotFound);
        }
        self.get_api_key(channel_id, key_index).await
    }

    pub async fn delete_api_key(&self, channel_id: i64, key_index: i64) -> Result<()> {
        let affected = sqlx::query("DELETE FROM api_keys WHERE channel_id = ? AND key_index = ?")
            .bind(channel_id)
            .bind(key_index)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?
            .rows_affected();
        if affected == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    pub async fn get_api_key(&self, channel_id: i64, key_index: i64) -> Result<ApiKey> {
        let row = sqlx::query(
            "SELECT id, channel_id, key_index, api_key, key_strategy, cooldown_until, \
             cooldown_duration_ms, created_at, updated_at FROM api_keys \
             WHERE channel_id = ? AND key_index = ?",
        )
        .bind(channel_id)
        .bind(key_index)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx_error)?
        .ok_or(Error::NotFound)?;
        row_to_api_key(&row)
    }

    async fn get_api_key_by_id(&self, id: i64) -> Result<ApiKey> {
        let row = sqlx::query(
            "SELECT id, channel_id, key_index, api_key, key_strategy, cooldown_until, \
             cooldown_duration_ms, created_at, updated_at FROM api_keys WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx_error)?
        .ok_or(Error::NotFound)?;
        row_to_api_key(&row)
    }

    pub async fn get_api_keys(&self, channel_id: i64) -> Result<Vec<ApiKey>> {
        let rows = sqlx::query(
            "SELECT id, channel_id, key_index, api_key, key_strategy, cooldown_until, \
             cooldown_duration_ms, created_at, updated_at FROM api_keys \
             WHERE channel_id = ? ORDER BY key_index ASC",
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        rows.iter().map(row_to_api_key).collect()
    }

    /// Atomic round-robin advance (spec §4.B). A naive read-then-write is biased
    /// under concurrency because many callers observe the same value before any
    /// writer commits; this instead loops a compare-and-swap on `rr_key_index`,
    /// bounded by `RR_CAS_MAX_RETRIES` to avoid livelock under pathological
    /// contention (falls back to returning the last-observed current value, which
    /// keeps the selection path live at the cost of one stale pick).
    pub async fn get_and_set_channel_rr_index(&self, channel_id: i64, key_count: i64) -> Result<i64> {
        if key_count <= 0 {
            return Err(Error::Validation("key_count must be positive".into()));
        }

        let mut current = self.read_rr_index(channel_id).await?;
        for _ in 0..RR_CAS_MAX_RETRIES {
            let next = (current + 1).rem_euclid(key_count);
            let affected = sqlx::query(
                "UPDATE channels SET rr_key_index = ? WHERE id = ? AND rr_key_index = ?",
            )
            .bind(next)
            .bind(channel_id)
            .bind(current)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?
            .rows_affected();

            if affected == 1 {
                return Ok(next);
            }

            METRICS.record_rr_retry();
            // Lost the race; a jittered re-read reduces thundering-herd convergence
            // time under heavy contention before the next CAS attempt.
            if rand::rng().random_bool(0.5) {
                tokio::task::yield_now().await;
            }
            current = self.read_rr_index(channel_id).await?;
        }

        warn!(channel_id, "round-robin CAS exhausted retries, returning current index");
        Ok(current)
    }

    async fn read_rr_index(&self, channel_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT rr_key_index FROM channels WHERE id = ?")
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_sqlx_error)?
            .ok_or(Error::NotFound)?;
        Ok(row.try_get::<i64, _>("rr_key_index").map_err(classify_sqlx_error)?)
    }
}

async fn rebuild_channel_models(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    channel_id: i64,
    models: &[String],
    now: i64,
) -> Result<()> {
    sqlx::query("DELETE FROM channel_models WHERE channel_id = ?")
        .bind(channel_id)
        .execute(&mut **tx)
        .await
        .map_err(classify_sqlx_error)?;

    for model in models {
        sqlx::query(
            "INSERT OR IGNORE INTO channel_models (channel_id, model, created_at) VALUES (?, ?, ?)",
        )
        .bind(channel_id)
        .bind(model)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(classify_sqlx_error)?;
    }

    Ok(())
}

fn row_to_channel(row: &sqlx::sqlite::SqliteRow) -> Result<Channel> {
    let models_json: String = row.try_get("models").map_err(classify_sqlx_error)?;
    let redirects_json: String = row.try_get("model_redirects").map_err(classify_sqlx_error)?;
    let models: Vec<String> = serde_json::from_str(&models_json).map_err(to_validation)?;
    let model_redirects: HashMap<String, String> =
        serde_json::from_str(&redirects_json).map_err(to_validation)?;

    Ok(Channel {
        id: row.try_get("id").map_err(classify_sqlx_error)?,
        name: row.try_get("name").map_err(classify_sqlx_error)?,
        url: row.try_get("url").map_err(classify_sqlx_error)?,
        priority: row.try_get("priority").map_err(classify_sqlx_error)?,
        models,
        model_redirects,
        channel_type: row.try_get("channel_type").map_err(classify_sqlx_error)?,
        enabled: row.try_get::<i64, _>("enabled").map_err(classify_sqlx_error)? != 0,
        rr_key_index: row.try_get("rr_key_index").map_err(classify_sqlx_error)?,
        cooldown_until: row.try_get("cooldown_until").map_err(classify_sqlx_error)?,
        cooldown_duration_ms: row
            .try_get("cooldown_duration_ms")
            .map_err(classify_sqlx_error)?,
        created_at: row.try_get("created_at").map_err(classify_sqlx_error)?,
        updated_at: row.try_get("updated_at").map_err(classify_sqlx_error)?,
    })
}

fn row_to_api_key(row: &sqlx::sqlite::SqliteRow) -> Result<ApiKey> {
    Ok(ApiKey {
        id: row.try_get("id").map_err(classify_sqlx_error)?,
        channel_id: row.try_get("channel_id").map_err(classify_sqlx_error)?,
        key_index: row.try_get("key_index").map_err(classify_sqlx_error)?,
        api_key: row.try_get("api_key").map_err(classify_sqlx_error)?,
        key_strategy: row.try_get("key_strategy").map_err(classify_sqlx_error)?,
        cooldown_until: row.try_get("cooldown_until").map_err(classify_sqlx_error)?,
        cooldown_duration_ms: row
            .try_get("cooldown_duration_ms")
            .map_err(classify_sqlx_error)?,
        created_at: row.try_get("created_at").map_err(classify_sqlx_error)?,
        updated_at: row.try_get("updated_at").map_err(classify_sqlx_error)?,
    })
}

fn to_validation(err: serde_json::Error) -> Error {
    Error::Validation(err.to_string())
}

/// Bind values for the dynamic `SET` list in `update_channel`. Column *names* in
/// that list are always literals chosen by this function, never caller input, so
/// only the values need binding — same split as `db/logs.rs`'s filter builder.
enum Bind {
    I64(i64),
    Str(String),
}

fn bind_param<'a>(
    q: sqlx::query::Query<'a, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'a>>,
    b: &'a Bind,
) -> sqlx::query::Query<'a, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'a>> {
    match b {
        Bind::I64(v) => q.bind(*v),
        Bind::Str(v) => q.bind(v.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_main;
    use crate::config::DatabaseConfig;
    use std::collections::HashMap as Map;

    async fn repo() -> ChannelRepo {
        let config = DatabaseConfig {
            path: ":memory:".into(),
            ..DatabaseConfig::default()
        };
        let (pool, _keeper) = connect_main(&config).await.unwrap();
        ChannelRepo::new(pool)
    }

    #[tokio::test]
    async fn create_and_get_channel_defaults_type() {
        let repo = repo().await;
        let ch = repo
            .create_channel(NewChannel {
                name: "c1".into(),
                url: "http://x".into(),
                priority: 1,
                models: vec!["m1".into()],
                model_redirects: Map::new(),
                channel_type: "".into(),
                enabled: true,
            })
            .await
            .unwrap();
        assert_eq!(ch.channel_type, DEFAULT_CHANNEL_TYPE);
        assert_eq!(ch.models, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_name_conflicts() {
        let repo = repo().await;
        let new = || NewChannel {
            name: "dup".into(),
            url: "u".into(),
            priority: 0,
            models: vec![],
            model_redirects: Map::new(),
            channel_type: "anthropic".into(),
            enabled: true,
        };
        repo.create_channel(new()).await.unwrap();
        let err = repo.create_channel(new()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_channel_cascades_keys() {
        let repo = repo().await;
        let ch = repo
            .create_channel(NewChannel {
                name: "c1".into(),
                url: "u".into(),
                priority: 0,
                models: vec![],
                model_redirects: Map::new(),
                channel_type: "anthropic".into(),
                enabled: true,
            })
            .await
            .unwrap();
        repo.create_api_key(NewApiKey {
            channel_id: ch.id,
            key_index: 0,
            api_key: "sk-a".into(),
            key_strategy: "sequential".into(),
        })
        .await
        .unwrap();

        repo.delete_channel(ch.id).await.unwrap();
        let keys = repo.get_api_keys(ch.id).await.unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn model_fast_path_finds_channel() {
        let repo = repo().await;
        repo.create_channel(NewChannel {
            name: "c1".into(),
            url: "u".into(),
            priority: 0,
            models: vec!["gpt-4".into(), "gpt-3.5".into()],
            model_redirects: Map::new(),
            channel_type: "openai".into(),
            enabled: true,
        })
        .await
        .unwrap();

        let found = repo.list_channels_for_model("gpt-4").await.unwrap();
        assert_eq!(found.len(), 1);
        let none = repo.list_channels_for_model("claude-3").await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn create_channel_rejects_negative_priority() {
        let repo = repo().await;
        let err = repo
            .create_channel(NewChannel {
                name: "c1".into(),
                url: "u".into(),
                priority: -1,
                models: vec![],
                model_redirects: Map::new(),
                channel_type: "anthropic".into(),
                enabled: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn create_api_key_rejects_negative_key_index() {
        let repo = repo().await;
        let ch = repo
            .create_channel(NewChannel {
                name: "c1".into(),
                url: "u".into(),
                priority: 0,
                models: vec![],
                model_redirects: Map::new(),
                channel_type: "anthropic".into(),
                enabled: true,
            })
            .await
            .unwrap();
        let err = repo
            .create_api_key(NewApiKey {
                channel_id: ch.id,
                key_index: -1,
                api_key: "sk-a".into(),
                key_strategy: "sequential".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn round_robin_cycles_and_returns_new_index() {
        let repo = repo().await;
        let ch = repo
            .create_channel(NewChannel {
                name: "c1".into(),
                url: "u".into(),
                priority: 0,
                models: vec![],
                model_redirects: Map::new(),
                channel_type: "anthropic".into(),
                enabled: true,
            })
            .await
            .unwrap();

        let i1 = repo.get_and_set_channel_rr_index(ch.id, 3).await.unwrap();
        let i2 = repo.get_and_set_channel_rr_index(ch.id, 3).await.unwrap();
        let i3 = repo.get_and_set_channel_rr_index(ch.id, 3).await.unwrap();
        let i4 = repo.get_and_set_channel_rr_index(ch.id, 3).await.unwrap();
        assert_eq!([i1, i2, i3, i4], [1, 2, 0, 1]);
    }

    #[tokio::test]
    async fn round_robin_under_concurrency_is_balanced() {
        let repo = repo().await;
        let ch = repo
            .create_channel(NewChannel {
                name: "c1".into(),
                url: "u".into(),
                priority: 0,
                models: vec![],
                model_redirects: Map::new(),
                channel_type: "anthropic".into(),
                enabled: true,
            })
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..200 {
            let repo = repo.clone();
            let id = ch.id;
            handles.push(tokio::spawn(
                async move { repo.get_and_set_channel_rr_index(id, 5).await.unwrap() },
            ));
        }
        let mut counts = [0u32; 5];
        for h in handles {
            let idx = h.await.unwrap();
            counts[idx as usize] += 1;
        }
        let max = *counts.iter().max().unwrap();
        let distinct = counts.iter().filter(|&&c| c > 0).count();
        assert!(max <= 160, "most frequent bucket too skewed: {counts:?}");
        assert!(distinct >= 3, "not enough distinct indices: {counts:?}");
    }
}
