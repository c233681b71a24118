//! Data model types shared by the repositories (spec §3).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CHANNEL_TYPE: &str = "anthropic";
pub const DEFAULT_KEY_STRATEGY: &str = "sequential";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub priority: i64,
    pub models: Vec<String>,
    pub model_redirects: HashMap<String, String>,
    pub channel_type: String,
    pub enabled: bool,
    pub rr_key_index: i64,
    pub cooldown_until: i64,
    pub cooldown_duration_ms: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Channel {
    pub fn is_selectable(&self, now: i64) -> bool {
        self.enabled && self.cooldown_until <= now
    }
}

/// Input used to create a channel. Unset `channel_type` defaults to `anthropic`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewChannel {
    pub name: String,
    pub url: String,
    pub priority: i64,
    pub models: Vec<String>,
    pub model_redirects: HashMap<String, String>,
    pub channel_type: String,
    pub enabled: bool,
}

/// Partial update for a channel. Every field is optional; absent fields are left
/// untouched. Field *names* accepted by `Store::update_channel` are restricted to
/// this struct's members, so there is no free-form column map to validate against
/// the allowlist here — the allowlist in [`crate::allowlist`] guards the dynamic SQL
/// built for filters/order-by elsewhere (logs, cooldown batch reads).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelPatch {
    pub name: Option<String>,
    pub url: Option<String>,
    pub priority: Option<i64>,
    pub models: Option<Vec<String>>,
    pub model_redirects: Option<HashMap<String, String>>,
    pub channel_type: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: i64,
    pub channel_id: i64,
    pub key_index: i64,
    pub api_key: String,
    pub key_strategy: String,
    pub cooldown_until: i64,
    pub cooldown_duration_ms: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewApiKey {
    pub channel_id: i64,
    pub key_index: i64,
    pub api_key: String,
    pub key_strategy: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiKeyPatch {
    pub api_key: Option<String>,
    pub key_strategy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthToken {
    pub id: i64,
    /// Hex-encoded SHA-256 of the plaintext token. The plaintext is never stored.
    pub token_hash: String,
    pub description: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub last_used_at: Option<i64>,
    pub is_active: bool,
    pub success_count: i64,
    pub failure_count: i64,
    pub stream_avg_ttfb: f64,
    pub non_stream_avg_rt: f64,
    pub stream_count: i64,
    pub non_stream_count: i64,
    pub prompt_tokens_total: i64,
    pub completion_tokens_total: i64,
    pub total_cost_usd: f64,
}

#[derive(Debug, Clone)]
pub struct NewAuthToken {
    pub token_hash: String,
    pub description: String,
    pub expires_at: Option<i64>,
    pub is_active: bool,
}

/// Incremental observation fed into `UpdateTokenStats` (spec §4.E).
#[derive(Debug, Clone, Copy)]
pub struct StatsObservation {
    pub is_success: bool,
    pub duration_secs: f64,
    pub is_streaming: bool,
    pub first_byte_time_secs: f64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub time_ms: i64,
    pub model: String,
    pub channel_id: Option<i64>,
    pub status_code: i64,
    pub message: String,
    pub duration_secs: f64,
    pub is_streaming: bool,
    pub first_byte_time_secs: f64,
    pub api_key_masked: String,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_read_input_tokens: Option<i64>,
    pub cache_creation_input_tokens: Option<i64>,
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct NewLogEntry {
    pub time_ms: i64,
    pub model: String,
    pub channel_id: Option<i64>,
    pub status_code: i64,
    pub message: String,
    pub duration_secs: f64,
    pub is_streaming: bool,
    pub first_byte_time_secs: f64,
    /// Caller-provided key; always masked before it reaches storage regardless of
    /// what's passed here (spec §4.F, §8 invariant).
    pub api_key: String,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_read_input_tokens: Option<i64>,
    pub cache_creation_input_tokens: Option<i64>,
    pub cost: Option<f64>,
}

/// Masks an API key as `first4…last4`, matching the invariant that logs never carry
/// plaintext credentials. Keys shorter than 9 characters are masked to an empty
/// string rather than leaking most of the material.
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 9 {
        return String::new();
    }
    let first4: String = chars[..4].iter().collect();
    let last4: String = chars[chars.len() - 4..].iter().collect();
    format!("{first4}…{last4}")
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub status: Option<i64>,
    pub model: Option<String>,
    pub channel_ids: Option<Vec<i64>>,
    pub channel_name_exact: Option<String>,
    pub channel_name_substring: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub bucket_ts: i64,
    pub success: i64,
    pub error: i64,
    pub cost: f64,
    pub avg_first_byte_time_secs: Option<f64>,
    pub avg_duration_secs: Option<f64>,
    pub sample_count: i64,
    pub by_channel: HashMap<String, ChannelMetric>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetric {
    pub success: i64,
    pub error: i64,
    pub cost: f64,
    pub avg_first_byte_time_secs: Option<f64>,
    pub avg_duration_secs: Option<f64>,
    pub sample_count: i64,
}
