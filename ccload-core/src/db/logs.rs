//! Append-only request log plus the SQL-side time-bucket aggregator (spec §4.F).
//! Masking happens here, unconditionally, so callers cannot bypass it by passing a
//! pre-masked-looking string or the plaintext key (spec §8 invariant).

use std::collections::HashMap;
use std::time::Duration;

use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::error::{classify_sqlx_error, Error, Result};
use crate::model::{mask_api_key, ChannelMetric, LogEntry, LogFilter, MetricPoint, NewLogEntry};

#[derive(Clone, Debug)]
pub struct LogStore {
    pool: SqlitePool,
}

impl LogStore {
    pub fn new(pool: SqlitePool) -> Self {
        LogStore { pool }
    }

    pub async fn add_log(&self, entry: NewLogEntry) -> Result<i64> {
        let masked = mask_api_key(&entry.api_key);
        let id = sqlx::query(INSERT_SQL)
            .bind(entry.time_ms)
            .bind(&entry.model)
            .bind(entry.channel_id)
            .bind(entry.status_code)
            .bind(&entry.message)
            .bind(entry.duration_secs)
            .bind(entry.is_streaming as i64)
            .bind(entry.first_byte_time_secs)
            .bind(&masked)
            .bind(entry.input_tokens)
            .bind(entry.output_tokens)
            .bind(entry.cache_read_input_tokens)
            .bind(entry.cache_creation_input_tokens)
            .bind(entry.cost)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?
            .last_insert_rowid();
        Ok(id)
    }

    pub async fn batch_add_logs(&self, entries: Vec<NewLogEntry>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;
        for entry in entries {
            let masked = mask_api_key(&entry.api_key);
            sqlx::query(INSERT_SQL)
                .bind(entry.time_ms)
                .bind(&entry.model)
                .bind(entry.channel_id)
                .bind(entry.status_code)
                .bind(&entry.message)
                .bind(entry.duration_secs)
                .bind(entry.is_streaming as i64)
                .bind(entry.first_byte_time_secs)
                .bind(&masked)
                .bind(entry.input_tokens)
                .bind(entry.output_tokens)
                .bind(entry.cache_read_input_tokens)
                .bind(entry.cache_creation_input_tokens)
                .bind(entry.cost)
                .execute(&mut *tx)
                .await
                .map_err(classify_sqlx_error)?;
        }
        tx.commit().await.map_err(classify_sqlx_error)?;
        Ok(())
    }

    pub async fn list_logs(
        &self,
        since_ms: i64,
        limit: i64,
        offset: i64,
        filter: &LogFilter,
    ) -> Result<Vec<LogEntry>> {
        self.list_logs_range(since_ms, i64::MAX, limit, offset, filter)
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
        let (where_clause, binds) = build_filter(since_ms, until_ms, filter)?;
        let sql = format!(
            "SELECT id, time, model, channel_id, status_code, message, duration, \
             is_streaming, first_byte_time, api_key_used, input_tokens, output_tokens, \
             cache_read_input_tokens, cache_creation_input_tokens, cost \
             FROM logs {where_clause} ORDER BY time DESC LIMIT ? OFFSET ?"
        );
        let mut q = sqlx::query(&sql);
        for b in &binds {
            q = bind_param(q, b);
        }
        q = q.bind(limit).bind(offset);

        let rows = q.fetch_all(&self.pool).await.map_err(classify_sqlx_error)?;
        rows.iter().map(row_to_log).collect()
    }

    pub async fn count_logs(&self, since_ms: i64, until_ms: i64, filter: &LogFilter) -> Result<i64> {
        let (where_clause, binds) = build_filter(since_ms, until_ms, filter)?;
        let sql = format!("SELECT COUNT(*) AS n FROM logs {where_clause}");
        let mut q = sqlx::query(&sql);
        for b in &binds {
            q = bind_param(q, b);
        }
        let row = q.fetch_one(&self.pool).await.map_err(classify_sqlx_error)?;
        row.try_get("n").map_err(classify_sqlx_error)
    }

    pub async fn cleanup_logs_before(&self, cutoff_ms: i64) -> Result<u64> {
        let affected = sqlx::query("DELETE FROM logs WHERE time < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?
            .rows_affected();
        Ok(affected)
    }

    /// Background retention task wrapping `cleanup_logs_before` on an interval
    /// (SPEC_FULL.md §B "`LogStore::cleanup_task`"). Off by default; callers opt in
    /// by passing `DatabaseConfig::cleanup_interval_secs` through to
    /// `Store::open`. The returned handle is aborted by `Store::shutdown`.
    pub fn spawn_cleanup_task(&self, interval: Duration, retention: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        let retention_ms = retention.as_millis() as i64;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let cutoff = now_ms() - retention_ms;
                match store.cleanup_logs_before(cutoff).await {
                    Ok(deleted) => info!(deleted, cutoff, "log retention cleanup ran"),
                    Err(err) => warn!(?err, "log retention cleanup failed, will retry next tick"),
                }
            }
        })
    }

    /// Pushes the bucketed group-by into SQL (spec §4.F). `channel_resolver` is
    /// consulted exactly once with the full set of channel ids appearing in the
    /// result, avoiding N+1 lookups against the channel repository; per the §9
    /// open question, `Aggregate`/`AggregateRange` never filter `channel_id = 0`
    /// (unlike `GetStats`, which does) — this is intentional, not an oversight.
    pub async fn aggregate(
        &self,
        since_ms: i64,
        bucket_secs: i64,
        channel_names: &HashMap<i64, String>,
    ) -> Result<Vec<MetricPoint>> {
        self.aggregate_range(since_ms, now_ms(), bucket_secs, channel_names)
            .await
    }

    pub async fn aggregate_range(
        &self,
        since_ms: i64,
        until_ms: i64,
        bucket_secs: i64,
        channel_names: &HashMap<i64, String>,
    ) -> Result<Vec<MetricPoint>> {
        if bucket_secs <= 0 {
            return Err(Error::Validation("bucket must be positive".into()));
        }

        let since_secs = since_ms / 1000;
        let until_secs = until_ms / 1000;

        let rows = sqlx::query(
            "SELECT ((time/1000)/?)*? AS bucket_ts, \
             channel_id, \
             SUM(CASE WHEN status_code BETWEEN 200 AND 299 THEN 1 ELSE 0 END) AS ok, \
             SUM(CASE WHEN status_code < 200 OR status_code >= 300 THEN 1 ELSE 0 END) AS err, \
             AVG(CASE WHEN is_streaming = 1 AND first_byte_time > 0 \
                 AND status_code BETWEEN 200 AND 299 THEN first_byte_time END) AS avg_ttfb, \
             AVG(CASE WHEN duration > 0 AND status_code BETWEEN 200 AND 299 \
                 THEN duration END) AS avg_dur, \
             SUM(COALESCE(cost, 0)) AS cost, \
             COUNT(*) AS n \
             FROM logs WHERE time/1000 >= ? AND time/1000 <= ? \
             GROUP BY bucket_ts, channel_id ORDER BY bucket_ts ASC",
        )
        .bind(bucket_secs)
        .bind(bucket_secs)
        .bind(since_secs)
        .bind(until_secs)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        let mut by_bucket: HashMap<i64, MetricPoint> = HashMap::new();
        for row in rows {
            let bucket_ts: i64 = row.try_get("bucket_ts").map_err(classify_sqlx_error)?;
            let channel_id: Option<i64> = row.try_get("channel_id").map_err(classify_sqlx_error)?;
            let ok: i64 = row.try_get("ok").map_err(classify_sqlx_error)?;
            let err: i64 = row.try_get("err").map_err(classify_sqlx_error)?;
            let avg_ttfb: Option<f64> = row.try_get("avg_ttfb").map_err(classify_sqlx_error)?;
            let avg_dur: Option<f64> = row.try_get("avg_dur").map_err(classify_sqlx_error)?;
            let cost: f64 = row.try_get("cost").map_err(classify_sqlx_error)?;
            let n: i64 = row.try_get("n").map_err(classify_sqlx_error)?;

            let point = by_bucket.entry(bucket_ts).or_insert_with(|| MetricPoint {
                bucket_ts,
                success: 0,
                error: 0,
                cost: 0.0,
                avg_first_byte_time_secs: None,
                avg_duration_secs: None,
                sample_count: 0,
                by_channel: HashMap::new(),
            });

            point.success += ok;
            point.error += err;
            point.cost += cost;
            point.sample_count += n;
            point.avg_first_byte_time_secs =
                reweight(point.avg_first_byte_time_secs, point.sample_count - n, avg_ttfb, n);
            point.avg_duration_secs =
                reweight(point.avg_duration_secs, point.sample_count - n, avg_dur, n);

            let name = channel_id
                .and_then(|id| channel_names.get(&id).cloned())
                .unwrap_or_else(|| "unknown".to_string());
            point.by_channel.insert(
                name,
                ChannelMetric {
                    success: ok,
                    error: err,
                    cost,
                    avg_first_byte_time_secs: avg_ttfb,
                    avg_duration_secs: avg_dur,
                    sample_count: n,
                },
            );
        }

        Ok(densify(by_bucket, since_secs, until_secs, bucket_secs))
    }

    /// Grouped by (channel_id, model), filtered by an HTTP-time range in
    /// milliseconds; `channel_id = 0` rows ("no channel selected") are excluded as
    /// noise — unlike `Aggregate`, which never filters them (spec §9).
    pub async fn get_stats(
        &self,
        start_ms: i64,
        end_ms: i64,
        filter: &LogFilter,
    ) -> Result<Vec<(Option<i64>, String, i64, i64, f64)>> {
        let (mut where_clause, binds) = build_filter(start_ms, end_ms, filter)?;
        let channel_guard = "(channel_id IS NOT NULL AND channel_id > 0)";
        where_clause = if where_clause.is_empty() {
            format!("WHERE {channel_guard}")
        } else {
            format!("{where_clause} AND {channel_guard}")
        };

        let sql = format!(
            "SELECT channel_id, model, \
             SUM(CASE WHEN status_code BETWEEN 200 AND 299 THEN 1 ELSE 0 END) AS ok, \
             SUM(CASE WHEN status_code < 200 OR status_code >= 300 THEN 1 ELSE 0 END) AS err, \
             SUM(COALESCE(cost, 0)) AS cost \
             FROM logs {where_clause} GROUP BY channel_id, model"
        );
        let mut q = sqlx::query(&sql);
        for b in &binds {
            q = bind_param(q, b);
        }

        let rows = q.fetch_all(&self.pool).await.map_err(classify_sqlx_error)?;
        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get::<Option<i64>, _>("channel_id")
                        .map_err(classify_sqlx_error)?,
                    row.try_get::<String, _>("model").map_err(classify_sqlx_error)?,
                    row.try_get::<i64, _>("ok").map_err(classify_sqlx_error)?,
                    row.try_get::<i64, _>("err").map_err(classify_sqlx_error)?,
                    row.try_get::<f64, _>("cost").map_err(classify_sqlx_error)?,
                ))
            })
            .collect()
    }
}

/// Re-weights a running average by sample count, matching the spec's "re-weight
/// per-channel averages by their respective sample counts" post-processing step.
fn reweight(
    existing: Option<f64>,
    existing_n: i64,
    new_avg: Option<f64>,
    new_n: i64,
) -> Option<f64> {
    match (existing, new_avg) {
        (None, None) => None,
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (Some(a), Some(b)) => {
            let total = existing_n + new_n;
            if total <= 0 {
                return None;
            }
            Some((a * existing_n as f64 + b * new_n as f64) / total as f64)
        }
    }
}

/// Fills gaps between `since`/`until` with zero-valued points so dashboards see a
/// regular time series (spec §8 "Aggregator density").
fn densify(
    mut by_bucket: HashMap<i64, MetricPoint>,
    since_secs: i64,
    until_secs: i64,
    bucket_secs: i64,
) -> Vec<MetricPoint> {
    let first = (since_secs / bucket_secs) * bucket_secs;
    let mut out = Vec::new();
    let mut ts = first;
    while ts < until_secs {
        let point = by_bucket.remove(&ts).unwrap_or_else(|| MetricPoint {
            bucket_ts: ts,
            success: 0,
            error: 0,
            cost: 0.0,
            avg_first_byte_time_secs: None,
            avg_duration_secs: None,
            sample_count: 0,
            by_channel: HashMap::new(),
        });
        out.push(point);
        ts += bucket_secs;
    }
    out
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

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

/// Builds a `WHERE` clause for the logs table from a time range and a [`LogFilter`].
/// Every column name here is a literal chosen by this function, never a caller-
/// supplied string, so there is nothing to run through the allowlist for the simple
/// predicates; `channel_name_exact`/`channel_name_substring` are resolved by the
/// caller (the composite store) to an id set *before* reaching this function, per
/// spec §4.F "resolved to id sets ... in one batch query (no cross-database JOINs)".
fn build_filter(since_ms: i64, until_ms: i64, filter: &LogFilter) -> Result<(String, Vec<Bind>)> {
    let mut clauses = vec!["time >= ?".to_string(), "time <= ?".to_string()];
    let mut binds = vec![Bind::I64(since_ms), Bind::I64(until_ms)];

    if let Some(status) = filter.status {
        clauses.push("status_code = ?".to_string());
        binds.push(Bind::I64(status));
    }
    if let Some(ref model) = filter.model {
        clauses.push("model = ?".to_string());
        binds.push(Bind::Str(model.clone()));
    }
    if let Some(ref ids) = filter.channel_ids {
        if ids.is_empty() {
            // An empty explicit id set can never match; short-circuit with a clause
            // that's always false rather than building a malformed `IN ()`.
            clauses.push("1 = 0".to_string());
        } else {
            let placeholders = vec!["?"; ids.len()].join(", ");
            clauses.push(format!("channel_id IN ({placeholders})"));
            for id in ids {
                binds.push(Bind::I64(*id));
            }
        }
    }

    let where_clause = format!("WHERE {}", clauses.join(" AND "));
    Ok((where_clause, binds))
}

const INSERT_SQL: &str = "INSERT INTO logs (time, model, channel_id, status_code, message, \
    duration, is_streaming, first_byte_time, api_key_used, input_tokens, output_tokens, \
    cache_read_input_tokens, cache_creation_input_tokens, cost) \
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

fn row_to_log(row: &sqlx::sqlite::SqliteRow) -> Result<LogEntry> {
    Ok(LogEntry {
        id: row.try_get("id").map_err(classify_sqlx_error)?,
        time_ms: row.try_get("time").map_err(classify_sqlx_error)?,
        model: row.try_get("model").map_err(classify_sqlx_error)?,
        channel_id: row.try_get("channel_id").map_err(classify_sqlx_error)?,
        status_code: row.try_get("status_code").map_err(classify_sqlx_error)?,
        message: row.try_get("message").map_err(classify_sqlx_error)?,
        duration_secs: row.try_get("duration").map_err(classify_sqlx_error)?,
        is_streaming: row.try_get::<i64, _>("is_streaming").map_err(classify_sqlx_error)? != 0,
        first_byte_time_secs: row.try_get("first_byte_time").map_err(classify_sqlx_error)?,
        api_key_masked: row.try_get("api_key_used").map_err(classify_sqlx_error)?,
        input_tokens: row.try_get("input_tokens").map_err(classify_sqlx_error)?,
        output_tokens: row.try_get("output_tokens").map_err(classify_sqlx_error)?,
        cache_read_input_tokens: row
            .try_get("cache_read_input_tokens")
            .map_err(classify_sqlx_error)?,
        cache_creation_input_tokens: row
            .try_get("cache_creation_input_tokens")
            .map_err(classify_sqlx_error)?,
        cost: row.try_get("cost").map_err(classify_sqlx_error)?,
    })
}
