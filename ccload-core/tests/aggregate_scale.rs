//! Scale check for the bucketed aggregator (spec §8 scenario: tens of thousands
//! of rows, an hour-scale bucket, still answers one query). No Redis required.

use std::collections::HashMap;

use ccload_core::config::{Config, DatabaseConfig};
use ccload_core::model::{NewChannel, NewLogEntry};
use ccload_core::Store;

fn temp_db_paths() -> (String, String) {
    let dir = std::env::temp_dir().join(format!("ccload-it-scale-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    (
        dir.join("main.db").to_string_lossy().to_string(),
        dir.join("logs.db").to_string_lossy().to_string(),
    )
}

#[tokio::test]
async fn fifty_thousand_rows_aggregate_into_a_day_of_hourly_buckets() {
    let (main_path, logs_path) = temp_db_paths();
    let config = Config {
        database: DatabaseConfig {
            path: main_path,
            logs_path,
            ..DatabaseConfig::default()
        },
        redis: None,
    };
    let store = Store::open(&config).await.unwrap();
    let ch = store
        .create_channel(NewChannel {
            name: "scale-test".into(),
            url: "https://example.test".into(),
            priority: 0,
            models: vec!["claude-3".into()],
            model_redirects: HashMap::new(),
            channel_type: "anthropic".into(),
            enabled: true,
        })
        .await
        .unwrap();

    let hour_ms = 3_600_000i64;
    let total_rows = 50_000i64;
    let buckets = 24i64;
    let rows_per_bucket = total_rows / buckets;

    for bucket in 0..buckets {
        let mut batch = Vec::with_capacity(rows_per_bucket as usize);
        for i in 0..rows_per_bucket {
            let status = if i % 10 == 0 { 500 } else { 200 };
            batch.push(NewLogEntry {
                time_ms: bucket * hour_ms + (i * 1000) % hour_ms,
                model: "claude-3".into(),
                channel_id: Some(ch.id),
                status_code: status,
                message: "ok".into(),
                duration_secs: 0.25,
                is_streaming: false,
                first_byte_time_secs: 0.1,
                api_key: "sk-0123456789abcdef".into(),
                input_tokens: Some(100),
                output_tokens: Some(50),
                cache_read_input_tokens: None,
                cache_creation_input_tokens: None,
                cost: Some(0.001),
            });
        }
        store.batch_add_logs(batch).await.unwrap();
    }

    // `until` lands exactly on a bucket boundary (the spec's own scenario 5 shape);
    // the half-open `[since, until)` density invariant must still yield exactly
    // `buckets` points here, not `buckets + 1`.
    let points = store.aggregate_range(0, buckets * hour_ms, 3600).await.unwrap();

    assert_eq!(points.len() as i64, buckets);
    let total_success: i64 = points.iter().map(|p| p.success).sum();
    let total_error: i64 = points.iter().map(|p| p.error).sum();
    assert_eq!(total_success + total_error, total_rows);
    assert!(points.iter().all(|p| p.sample_count == rows_per_bucket));

    store.shutdown().await;
}
