//! Ambient metrics, mirroring the host proxy's `opentelemetry` + `once_cell::Lazy`
//! pattern. Carried even though the spec's Non-goals exclude a client-facing admin
//! surface: these are process-internal counters, not an exposed query interface.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Gauge};
use opentelemetry::{global, KeyValue};

pub static METRICS: Lazy<CoreMetrics> = Lazy::new(CoreMetrics::new);

pub struct CoreMetrics {
    pub cooldown_bumps: Counter<u64>,
    pub rr_cas_retries: Counter<u64>,
    pub redis_sync: Counter<u64>,
    pub redis_restore: Counter<u64>,
    pool_connections: Gauge<u64>,
}

impl CoreMetrics {
    fn new() -> Self {
        let meter = global::meter("ccload_core");
        CoreMetrics {
            cooldown_bumps: meter
                .u64_counter("cooldown_bumps_total")
                .with_description("Cooldown bump transactions, by level and status class.")
                .build(),
            rr_cas_retries: meter
                .u64_counter("rr_cas_retries_total")
                .with_description("Compare-and-swap retries during round-robin advance.")
                .build(),
            redis_sync: meter
                .u64_counter("redis_sync_total")
                .with_description("Redis mirror snapshot attempts, by result.")
                .build(),
            redis_restore: meter
                .u64_counter("redis_restore_total")
                .with_description("Cold-start restores from the Redis mirror, by result.")
                .build(),
            pool_connections: meter
                .u64_gauge("db_pool_connections")
                .with_description("SQLite pool connections, by database and state (idle/active).")
                .build(),
        }
    }

    pub fn record_cooldown_bump(&self, level: &'static str, status_class: &'static str) {
        self.cooldown_bumps.add(
            1,
            &[
                KeyValue::new("level", level),
                KeyValue::new("status_class", status_class),
            ],
        );
    }

    pub fn record_rr_retry(&self) {
        self.rr_cas_retries.add(1, &[]);
    }

    pub fn record_redis_sync(&self, result: &'static str) {
        self.redis_sync.add(1, &[KeyValue::new("result", result)]);
    }

    pub fn record_redis_restore(&self, result: &'static str) {
        self.redis_restore
            .add(1, &[KeyValue::new("result", result)]);
    }

    /// Surfaces a pool's idle/in-use connection counts (SPEC_FULL.md §B "Connection
    /// pool metrics"). `database` distinguishes the main store from the logs store,
    /// which are pooled separately (spec §5).
    pub fn record_pool_usage(&self, database: &'static str, size: u64, idle: u64) {
        self.pool_connections.record(
            idle,
            &[KeyValue::new("database", database), KeyValue::new("state", "idle")],
        );
        self.pool_connections.record(
            size.saturating_sub(idle),
            &[KeyValue::new("database", database), KeyValue::new("state", "active")],
        );
    }
}

pub fn status_class(status: u16) -> &'static str {
    match status {
        401 | 403 => "auth",
        500..=599 => "server",
        429 => "rate_limit",
        _ => "other",
    }
}
