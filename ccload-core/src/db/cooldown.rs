//! Transactional cooldown engine (spec §4.C). Channel-level and key-level cooldowns
//! are deliberately two independent code paths operating on two tables — per
//! §9 "State-machine factoring", they must not be coupled even though the policy
//! they both defer to (`crate::backoff::next_duration`) is identical.

use std::collections::HashMap;

use sqlx::{Row, SqlitePool};

use crate::backoff;
use crate::error::{classify_sqlx_error, Error, Result};
use crate::metrics::{status_class, METRICS};

use super::now_unix;

#[derive(Clone, Debug)]
pub struct CooldownEngine {
    pool: SqlitePool,
}

impl CooldownEngine {
    pub fn new(pool: SqlitePool) -> Self {
        CooldownEngine { pool }
    }

    pub async fn bump_channel(&self, channel_id: i64, now: i64, status: u16) -> Result<std::time::Duration> {
        self.bump(
            "channels",
            "id",
            channel_id,
            now,
            status,
            "channel",
        )
        .await
    }

    pub async fn bump_key(
        &self,
        channel_id: i64,
        key_index: i64,
        now: i64,
        status: u16,
    ) -> Result<std::time::Duration> {
        let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;

        let row = sqlx::query(
            "SELECT cooldown_until, cooldown_duration_ms FROM api_keys \
             WHERE channel_id = ? AND key_index = ?",
        )
        .bind(channel_id)
        .bind(key_index)
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify_sqlx_error)?
        .ok_or(Error::NotFound)?;

        let prev_until: i64 = row.try_get("cooldown_until").map_err(classify_sqlx_error)?;
        let prev_ms: i64 = row
            .try_get("cooldown_duration_ms")
            .map_err(classify_sqlx_error)?;

        let next = backoff::next_duration(prev_ms, prev_until, now, status);

        sqlx::query(
            "UPDATE api_keys SET cooldown_until = ?, cooldown_duration_ms = ?, updated_at = ? \
             WHERE channel_id = ? AND key_index = ?",
        )
        .bind(now + next.as_secs() as i64)
        .bind(next.as_millis() as i64)
        .bind(now)
        .bind(channel_id)
        .bind(key_index)
        .execute(&mut *tx)
        .await
        .map_err(classify_sqlx_error)?;

        tx.commit().await.map_err(classify_sqlx_error)?;

        METRICS.record_cooldown_bump("key", status_class(status));
        Ok(next)
    }

    async fn bump(
        &self,
        table: &str,
        key_col: &str,
        key_val: i64,
        now: i64,
        status: u16,
        level: &'static str,
    ) -> Result<std::time::Duration> {
        let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;

        let sql = format!(
            "SELECT cooldown_until, cooldown_duration_ms FROM {table} WHERE {key_col} = ?"
        );
        let row = sqlx::query(&sql)
            .bind(key_val)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify_sqlx_error)?
            .ok_or(Error::NotFound)?;

        let prev_until: i64 = row.try_get("cooldown_until").map_err(classify_sqlx_error)?;
        let prev_ms: i64 = row
            .try_get("cooldown_duration_ms")
            .map_err(classify_sqlx_error)?;

        let next = backoff::next_duration(prev_ms, prev_until, now, status);

        let sql = format!(
            "UPDATE {table} SET cooldown_until = ?, cooldown_duration_ms = ?, updated_at = ? \
             WHERE {key_col} = ?"
        );
        sqlx::query(&sql)
            .bind(now + next.as_secs() as i64)
            .bind(next.as_millis() as i64)
            .bind(now)
            .bind(key_val)
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx_error)?;

        tx.commit().await.map_err(classify_sqlx_error)?;

        METRICS.record_cooldown_bump(level, status_class(status));
        Ok(next)
    }

    pub async fn reset_channel_cooldown(&self, channel_id: i64) -> Result<()> {
        self.set_raw("channels", "id", channel_id, 0, 0).await
    }

    pub async fn reset_key_cooldown(&self, channel_id: i64, key_index: i64) -> Result<()> {
        let affected = sqlx::query(
            "UPDATE api_keys SET cooldown_until = 0, cooldown_duration_ms = 0, updated_at = ? \
             WHERE channel_id = ? AND key_index = ?",
        )
        .bind(now_unix())
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

    pub async fn set_channel_cooldown(&self, channel_id: i64, until: i64) -> Result<()> {
        let now = now_unix();
        let duration_ms = (until - now).max(0) * 1000;
        self.set_raw("channels", "id", channel_id, until, duration_ms)
            .await
    }

    pub async fn set_key_cooldown(&self, channel_id: i64, key_index: i64, until: i64) -> Result<()> {
        let now = now_unix();
        let duration_ms = (until - now).max(0) * 1000;
        let affected = sqlx::query(
            "UPDATE api_keys SET cooldown_until = ?, cooldown_duration_ms = ?, updated_at = ? \
             WHERE channel_id = ? AND key_index = ?",
        )
        .bind(until)
        .bind(duration_ms)
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
        Ok(())
    }

    async fn set_raw(
        &self,
        table: &str,
        key_col: &str,
        key_val: i64,
        until: i64,
        duration_ms: i64,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {table} SET cooldown_until = ?, cooldown_duration_ms = ?, updated_at = ? \
             WHERE {key_col} = ?"
        );
        let affected = sqlx::query(&sql)
            .bind(until)
            .bind(duration_ms)
            .bind(now_unix())
            .bind(key_val)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?
            .rows_affected();
        if affected == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// Batch read of all currently-cooling channels (spec §4.C "Batch read"), used by
    /// the selection path to mask candidates without a per-channel round-trip.
    pub async fn get_all_channel_cooldowns(&self) -> Result<HashMap<i64, i64>> {
        let now = now_unix();
        let rows = sqlx::query(
            "SELECT id, cooldown_until FROM channels WHERE cooldown_until > ?",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get("id").map_err(classify_sqlx_error)?,
                    row.try_get("cooldown_until").map_err(classify_sqlx_error)?,
                ))
            })
            .collect()
    }

    pub async fn get_all_key_cooldowns(&self) -> Result<HashMap<i64, HashMap<i64, i64>>> {
        let now = now_unix();
        let rows = sqlx::query(
            "SELECT channel_id, key_index, cooldown_until FROM api_keys WHERE cooldown_until > ?",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        let mut out: HashMap<i64, HashMap<i64, i64>> = HashMap::new();
        for row in rows {
            let cid: i64 = row.try_get("channel_id").map_err(classify_sqlx_error)?;
            let idx: i64 = row.try_get("key_index").map_err(classify_sqlx_error)?;
            let until: i64 = row.try_get("cooldown_until").map_err(classify_sqlx_error)?;
            out.entry(cid).or_default().insert(idx, until);
        }
        Ok(out)
    }
}
