//! Auth-token store (spec §4.E): CRUD plus transactional incremental stats.

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use crate::error::{classify_sqlx_error, Error, Result};
use crate::model::{AuthToken, NewAuthToken, StatsObservation};

use super::now_unix_ms;

#[derive(Clone, Debug)]
pub struct TokenRepo {
    pool: SqlitePool,
}

pub fn hash_token(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

impl TokenRepo {
    pub fn new(pool: SqlitePool) -> Self {
        TokenRepo { pool }
    }

    pub async fn create_token(&self, t: NewAuthToken) -> Result<AuthToken> {
        let now = now_unix_ms();
        let id = sqlx::query(
            "INSERT INTO auth_tokens (token, description, created_at, expires_at, is_active) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&t.token_hash)
        .bind(&t.description)
        .bind(now)
        .bind(t.expires_at)
        .bind(t.is_active as i64)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?
        .last_insert_rowid();

        self.get_by_id(id).await
    }

    pub async fn get_by_id(&self, id: i64) -> Result<AuthToken> {
        let row = sqlx::query(SELECT_COLUMNS_BY_ID)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_sqlx_error)?
            .ok_or(Error::NotFound)?;
        row_to_token(&row)
    }

    /// Fast auth path: looks up by the hash of the presented plaintext token.
    pub async fn get_by_hash(&self, token_hash: &str) -> Result<AuthToken> {
        let row = sqlx::query(SELECT_COLUMNS_BY_HASH)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_sqlx_error)?
            .ok_or(Error::NotFound)?;
        row_to_token(&row)
    }

    pub async fn list_active(&self) -> Result<Vec<AuthToken>> {
        let now = now_unix_ms();
        let rows = sqlx::query(
            "SELECT id, token, description, created_at, expires_at, last_used_at, is_active, \
             success_count, failure_count, stream_avg_ttfb, non_stream_avg_rt, stream_count, \
             non_stream_count, prompt_tokens_total, completion_tokens_total, total_cost_usd \
             FROM auth_tokens \
             WHERE is_active = 1 AND (expires_at IS NULL OR expires_at = 0 OR expires_at > ?) \
             ORDER BY created_at DESC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        rows.iter().map(row_to_token).collect()
    }

    /// Every token regardless of `is_active`/expiry, for the Redis mirror (spec
    /// §4.D): a deactivated-but-not-deleted token must survive a restore with its
    /// `is_active = 0` intact, not disappear because it failed `list_active`'s
    /// serving-path filter.
    pub async fn list_all(&self) -> Result<Vec<AuthToken>> {
        let rows = sqlx::query(
            "SELECT id, token, description, created_at, expires_at, last_used_at, is_active, \
             success_count, failure_count, stream_avg_ttfb, non_stream_avg_rt, stream_count, \
             non_stream_count, prompt_tokens_total, completion_tokens_total, total_cost_usd \
             FROM auth_tokens ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        rows.iter().map(row_to_token).collect()
    }

    pub async fn update_last_used(&self, token_hash: &str) -> Result<()> {
        // Blind, best-effort update; no read, no error if the token happens to be
        // deleted concurrently (spec §4.E).
        let _ = sqlx::query("UPDATE auth_tokens SET last_used_at = ? WHERE token = ?")
            .bind(now_unix_ms())
            .bind(token_hash)
            .execute(&self.pool)
            .await;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        let affected = sqlx::query("DELETE FROM auth_tokens WHERE id = ?")
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

    /// Transactional incremental stats update (spec §4.E). Running averages use the
    /// exact incremental-mean formula so replaying a stream and comparing to the
    /// batch mean always agree (spec §8 invariant).
    pub async fn update_stats(&self, token_hash: &str, obs: StatsObservation) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;

        let row = sqlx::query(
            "SELECT success_count, failure_count, stream_avg_ttfb, non_stream_avg_rt, \
             stream_count, non_stream_count, prompt_tokens_total, completion_tokens_total, \
             total_cost_usd FROM auth_tokens WHERE token = ?",
        )
        .bind(token_hash)
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify_sqlx_error)?
        .ok_or(Error::NotFound)?;

        let mut success_count: i64 = row.try_get("success_count").map_err(classify_sqlx_error)?;
        let mut failure_count: i64 = row.try_get("failure_count").map_err(classify_sqlx_error)?;
        let mut stream_avg_ttfb: f64 = row.try_get("stream_avg_ttfb").map_err(classify_sqlx_error)?;
        let mut non_stream_avg_rt: f64 =
            row.try_get("non_stream_avg_rt").map_err(classify_sqlx_error)?;
        let mut stream_count: i64 = row.try_get("stream_count").map_err(classify_sqlx_error)?;
        let mut non_stream_count: i64 =
            row.try_get("non_stream_count").map_err(classify_sqlx_error)?;
        let mut prompt_tokens_total: i64 =
            row.try_get("prompt_tokens_total").map_err(classify_sqlx_error)?;
        let mut completion_tokens_total: i64 = row
            .try_get("completion_tokens_total")
            .map_err(classify_sqlx_error)?;
        let mut total_cost_usd: f64 = row.try_get("total_cost_usd").map_err(classify_sqlx_error)?;

        if obs.is_success {
            success_count += 1;
            prompt_tokens_total += obs.prompt_tokens;
            completion_tokens_total += obs.completion_tokens;
            total_cost_usd += obs.cost_usd;
        } else {
            failure_count += 1;
        }

        if obs.is_streaming && obs.first_byte_time_secs > 0.0 {
            stream_avg_ttfb = incremental_mean(stream_avg_ttfb, stream_count, obs.first_byte_time_secs);
            stream_count += 1;
        } else if !obs.is_streaming {
            non_stream_avg_rt =
                incremental_mean(non_stream_avg_rt, non_stream_count, obs.duration_secs);
            non_stream_count += 1;
        }

        sqlx::query(
            "UPDATE auth_tokens SET success_count = ?, failure_count = ?, stream_avg_ttfb = ?, \
             non_stream_avg_rt = ?, stream_count = ?, non_stream_count = ?, \
             prompt_tokens_total = ?, completion_tokens_total = ?, total_cost_usd = ?, \
             last_used_at = ? WHERE token = ?",
        )
        .bind(success_count)
        .bind(failure_count)
        .bind(stream_avg_ttfb)
        .bind(non_stream_avg_rt)
        .bind(stream_count)
        .bind(non_stream_count)
        .bind(prompt_tokens_total)
        .bind(completion_tokens_total)
        .bind(total_cost_usd)
        .bind(now_unix_ms())
        .bind(token_hash)
        .execute(&mut *tx)
        .await
        .map_err(classify_sqlx_error)?;

        tx.commit().await.map_err(classify_sqlx_error)?;
        Ok(())
    }
}

fn incremental_mean(old_avg: f64, count: i64, x: f64) -> f64 {
    (old_avg * count as f64 + x) / (count as f64 + 1.0)
}

const SELECT_COLUMNS_BY_ID: &str = "SELECT id, token, description, created_at, expires_at, \
    last_used_at, is_active, success_count, failure_count, stream_avg_ttfb, non_stream_avg_rt, \
    stream_count, non_stream_count, prompt_tokens_total, completion_tokens_total, \
    total_cost_usd FROM auth_tokens WHERE id = ?";

const SELECT_COLUMNS_BY_HASH: &str = "SELECT id, token, description, created_at, expires_at, \
    last_used_at, is_active, success_count, failure_count, stream_avg_ttfb, non_stream_avg_rt, \
    stream_count, non_stream_count, prompt_tokens_total, completion_tokens_total, \
    total_cost_usd FROM auth_tokens WHERE token = ?";

fn row_to_token(row: &sqlx::sqlite::SqliteRow) -> Result<AuthToken> {
    Ok(AuthToken {
        id: row.try_get("id").map_err(classify_sqlx_error)?,
        token_hash: row.try_get("token").map_err(classify_sqlx_error)?,
        description: row.try_get("description").map_err(classify_sqlx_error)?,
        created_at: row.try_get("created_at").map_err(classify_sqlx_error)?,
        expires_at: row.try_get("expires_at").map_err(classify_sqlx_error)?,
        last_used_at: row.try_get("last_used_at").map_err(classify_sqlx_error)?,
        is_active: row.try_get::<i64, _>("is_active").map_err(classify_sqlx_error)? != 0,
        success_count: row.try_get("success_count").map_err(classify_sqlx_error)?,
        failure_count: row.try_get("failure_count").map_err(classify_sqlx_error)?,
        stream_avg_ttfb: row.try_get("stream_avg_ttfb").map_err(classify_sqlx_error)?,
        non_stream_avg_rt: row.try_get("non_stream_avg_rt").map_err(classify_sqlx_error)?,
        stream_count: row.try_get("stream_count").map_err(classify_sqlx_error)?,
        non_stream_count: row.try_get("non_stream_count").map_err(classify_sqlx_error)?,
        prompt_tokens_total: row
            .try_get("prompt_tokens_total")
            .map_err(classify_sqlx_error)?,
        completion_tokens_total: row
            .try_get("completion_tokens_total")
            .map_err(classify_sqlx_error)?,
        total_cost_usd: row.try_get("total_cost_usd").map_err(classify_sqlx_error)?,
    })
}
