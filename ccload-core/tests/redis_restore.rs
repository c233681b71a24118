//! End-to-end cold-start restore scenarios (spec §8 "deleted key does not
//! reappear", §4.D "mandatory constraint"). Needs a reachable Redis; skipped
//! with a warning when `REDIS_URL` isn't set, matching the teacher's own
//! preference for hermetic-by-default tests that opt into a live dependency.

use std::collections::HashMap;

use ccload_core::config::{Config, DatabaseConfig, RedisConfig};
use ccload_core::model::{NewApiKey, NewChannel};
use ccload_core::Store;

fn redis_config() -> Option<RedisConfig> {
    let url = std::env::var("REDIS_URL").ok()?;
    Some(RedisConfig {
        url,
        dial_timeout_ms: 3_000,
        op_timeout_ms: 2_000,
        debounce_ms: 50,
        shutdown_timeout_ms: 2_000,
    })
}

fn temp_db_paths(label: &str) -> (String, String) {
    let dir = std::env::temp_dir().join(format!("ccload-it-{label}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    (
        dir.join("main.db").to_string_lossy().to_string(),
        dir.join("logs.db").to_string_lossy().to_string(),
    )
}

#[tokio::test]
async fn deleted_key_does_not_reappear_after_restore() {
    let Some(redis) = redis_config() else {
        tracing::warn!("REDIS_URL not set, skipping deleted_key_does_not_reappear_after_restore");
        return;
    };

    let (main_path, logs_path) = temp_db_paths("delete-key");
    let config = Config {
        database: DatabaseConfig {
            path: main_path,
            logs_path,
            ..DatabaseConfig::default()
        },
        redis: Some(redis.clone()),
    };

    let store = Store::open(&config).await.unwrap();
    let ch = store
        .create_channel(NewChannel {
            name: format!("restore-test-{}", std::process::id()),
            url: "https://example.test".into(),
            priority: 0,
            models: vec!["claude-3".into()],
            model_redirects: HashMap::new(),
            channel_type: "anthropic".into(),
            enabled: true,
        })
        .await
        .unwrap();

    for idx in 0..3 {
        store
            .create_api_key(NewApiKey {
                channel_id: ch.id,
                key_index: idx,
                api_key: format!("sk-key-{idx}-aaaaaaaa"),
                key_strategy: "sequential".into(),
            })
            .await
            .unwrap();
    }

    store.delete_api_key(ch.id, 1).await.unwrap();

    // Wait past the debounce window plus a margin for the snapshot round-trip.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    store.shutdown().await;

    // Cold start into a brand-new, empty local database; the only source of
    // channel data is the Redis mirror written above.
    let (main_path2, logs_path2) = temp_db_paths("delete-key-restored");
    let restored_config = Config {
        database: DatabaseConfig {
            path: main_path2,
            logs_path: logs_path2,
            ..DatabaseConfig::default()
        },
        redis: Some(redis),
    };
    let restored = Store::open(&restored_config).await.unwrap();
    let channels = restored.list_channels().await.unwrap();
    let found = channels.iter().find(|c| c.id == ch.id || c.name == ch.name);
    let found = found.expect("restored channel should be present");
    let keys = restored.get_api_keys(found.id).await.unwrap();

    assert_eq!(keys.len(), 2);
    assert!(keys.iter().all(|k| k.key_index != 1));

    restored.shutdown().await;
}

#[tokio::test]
async fn memory_mode_without_redis_is_fatal() {
    let config = Config {
        database: DatabaseConfig {
            path: ":memory:".into(),
            ..DatabaseConfig::default()
        },
        redis: None,
    };

    let err = Store::open(&config).await.unwrap_err();
    assert!(matches!(err, ccload_core::Error::Fatal(_)));
}

#[tokio::test]
async fn memory_mode_with_redis_starts_and_survives_a_restart_cycle() {
    let Some(redis) = redis_config() else {
        tracing::warn!("REDIS_URL not set, skipping memory_mode_with_redis_starts_and_survives_a_restart_cycle");
        return;
    };

    let config = Config {
        database: DatabaseConfig {
            path: ":memory:".into(),
            ..DatabaseConfig::default()
        },
        redis: Some(redis.clone()),
    };

    let store = Store::open(&config).await.unwrap();
    let ch = store
        .create_channel(NewChannel {
            name: format!("memory-test-{}", std::process::id()),
            url: "https://example.test".into(),
            priority: 0,
            models: vec![],
            model_redirects: HashMap::new(),
            channel_type: String::new(),
            enabled: true,
        })
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    store.shutdown().await;

    // A second in-memory store (a fresh process, in spirit) restores the
    // channel from Redis rather than starting empty.
    let store2 = Store::open(&config).await.unwrap();
    let channels = store2.list_channels().await.unwrap();
    assert!(channels.iter().any(|c| c.name == ch.name));
    store2.shutdown().await;
}
