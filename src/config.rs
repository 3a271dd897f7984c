use crate::error::AppError;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/";
pub const DEFAULT_WEBSOCKET_PATH: &str = "/websocket";
pub const DEFAULT_TOPIC: &str = "/topic/events";
pub const DEFAULT_TRANSPORT: PushTransport = PushTransport::Stomp;
pub const DEFAULT_EVENT_BATCH_SIZE: u64 = 1_000;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;
pub const DEFAULT_HISTORY_RETRY_DELAY_MS: u64 = 1_000;
pub const DEFAULT_REDRAW_COOLDOWN_MS: u64 = 2_000;
pub const DEFAULT_MAX_CHARTS: usize = 10;
pub const DEFAULT_LIVE_CHANNEL_CAPACITY: usize = 1_024;
pub const DEFAULT_GAP_POLICY: GapPolicy = GapPolicy::Refetch;
pub const DEFAULT_RECONNECT_POLICY: ReconnectPolicy = ReconnectPolicy::Reset;
pub const MIN_EVENT_BATCH_SIZE: u64 = 1;
pub const MAX_EVENT_BATCH_SIZE: u64 = 10_000;
pub const MIN_RETRY_DELAY_MS: u64 = 100;
pub const MAX_RETRY_DELAY_MS: u64 = 60_000;
pub const MAX_REDRAW_COOLDOWN_MS: u64 = 60_000;
pub const MIN_MAX_CHARTS: usize = 1;
pub const MAX_MAX_CHARTS: usize = 100;
pub const MIN_LIVE_CHANNEL_CAPACITY: usize = 16;
pub const MAX_LIVE_CHANNEL_CAPACITY: usize = 100_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PushTransport {
    /// STOMP frames over the websocket, subscribed to a topic.
    Stomp,
    /// One JSON event per websocket text frame.
    Raw,
}

/// What to do when an event arrives with an id beyond `last + 1`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GapPolicy {
    /// Download the missing range from history, escalate to a resync if it stays open.
    Refetch,
    /// Drop the session and synchronize again from scratch.
    Resync,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectPolicy {
    Reset,
    Resume,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MonitorArgs {
    pub base_url: Option<String>,
    pub websocket_path: Option<String>,
    pub topic: Option<String>,
    pub transport: Option<PushTransport>,
    pub event_batch_size: Option<u64>,
    pub reconnect_delay_ms: Option<u64>,
    pub history_retry_delay_ms: Option<u64>,
    pub redraw_cooldown_ms: Option<u64>,
    pub max_charts: Option<usize>,
    pub live_channel_capacity: Option<usize>,
    pub gap_policy: Option<GapPolicy>,
    pub reconnect_policy: Option<ReconnectPolicy>,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub base_url: Url,
    pub websocket_path: String,
    pub topic: String,
    pub transport: PushTransport,
    pub event_batch_size: u64,
    pub reconnect_delay: Duration,
    pub history_retry_delay: Duration,
    pub redraw_cooldown: Duration,
    pub max_charts: usize,
    pub live_channel_capacity: usize,
    pub gap_policy: GapPolicy,
    pub reconnect_policy: ReconnectPolicy,
}

impl MonitorArgs {
    pub fn from_toml_str(raw: &str) -> Result<Self, AppError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Fields set in `overrides` win over the ones already present.
    pub fn merge(self, overrides: MonitorArgs) -> Self {
        Self {
            base_url: overrides.base_url.or(self.base_url),
            websocket_path: overrides.websocket_path.or(self.websocket_path),
            topic: overrides.topic.or(self.topic),
            transport: overrides.transport.or(self.transport),
            event_batch_size: overrides.event_batch_size.or(self.event_batch_size),
            reconnect_delay_ms: overrides.reconnect_delay_ms.or(self.reconnect_delay_ms),
            history_retry_delay_ms: overrides
                .history_retry_delay_ms
                .or(self.history_retry_delay_ms),
            redraw_cooldown_ms: overrides.redraw_cooldown_ms.or(self.redraw_cooldown_ms),
            max_charts: overrides.max_charts.or(self.max_charts),
            live_channel_capacity: overrides
                .live_channel_capacity
                .or(self.live_channel_capacity),
            gap_policy: overrides.gap_policy.or(self.gap_policy),
            reconnect_policy: overrides.reconnect_policy.or(self.reconnect_policy),
        }
    }

    pub fn normalize(self) -> Result<MonitorConfig, AppError> {
        let raw_base_url = self
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let mut base_url = Url::parse(raw_base_url.trim())?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(AppError::InvalidArgument(
                "baseUrl must use http or https".to_string(),
            ));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let websocket_path = normalize_path(
            "websocketPath",
            self.websocket_path
                .unwrap_or_else(|| DEFAULT_WEBSOCKET_PATH.to_string()),
        )?;
        let topic = normalize_path(
            "topic",
            self.topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
        )?;
        let transport = self.transport.unwrap_or(DEFAULT_TRANSPORT);

        let event_batch_size = self.event_batch_size.unwrap_or(DEFAULT_EVENT_BATCH_SIZE);
        if !(MIN_EVENT_BATCH_SIZE..=MAX_EVENT_BATCH_SIZE).contains(&event_batch_size) {
            return Err(AppError::InvalidArgument(format!(
                "eventBatchSize must be between {MIN_EVENT_BATCH_SIZE} and {MAX_EVENT_BATCH_SIZE}"
            )));
        }

        let reconnect_delay_ms = self.reconnect_delay_ms.unwrap_or(DEFAULT_RECONNECT_DELAY_MS);
        if !(MIN_RETRY_DELAY_MS..=MAX_RETRY_DELAY_MS).contains(&reconnect_delay_ms) {
            return Err(AppError::InvalidArgument(format!(
                "reconnectDelayMs must be between {MIN_RETRY_DELAY_MS} and {MAX_RETRY_DELAY_MS}"
            )));
        }

        let history_retry_delay_ms = self
            .history_retry_delay_ms
            .unwrap_or(DEFAULT_HISTORY_RETRY_DELAY_MS);
        if !(MIN_RETRY_DELAY_MS..=MAX_RETRY_DELAY_MS).contains(&history_retry_delay_ms) {
            return Err(AppError::InvalidArgument(format!(
                "historyRetryDelayMs must be between {MIN_RETRY_DELAY_MS} and {MAX_RETRY_DELAY_MS}"
            )));
        }

        let redraw_cooldown_ms = self.redraw_cooldown_ms.unwrap_or(DEFAULT_REDRAW_COOLDOWN_MS);
        if redraw_cooldown_ms > MAX_REDRAW_COOLDOWN_MS {
            return Err(AppError::InvalidArgument(format!(
                "redrawCooldownMs must be at most {MAX_REDRAW_COOLDOWN_MS}"
            )));
        }

        let max_charts = self.max_charts.unwrap_or(DEFAULT_MAX_CHARTS);
        if !(MIN_MAX_CHARTS..=MAX_MAX_CHARTS).contains(&max_charts) {
            return Err(AppError::InvalidArgument(format!(
                "maxCharts must be between {MIN_MAX_CHARTS} and {MAX_MAX_CHARTS}"
            )));
        }

        let live_channel_capacity = self
            .live_channel_capacity
            .unwrap_or(DEFAULT_LIVE_CHANNEL_CAPACITY);
        if !(MIN_LIVE_CHANNEL_CAPACITY..=MAX_LIVE_CHANNEL_CAPACITY).contains(&live_channel_capacity)
        {
            return Err(AppError::InvalidArgument(format!(
                "liveChannelCapacity must be between {MIN_LIVE_CHANNEL_CAPACITY} and {MAX_LIVE_CHANNEL_CAPACITY}"
            )));
        }

        Ok(MonitorConfig {
            base_url,
            websocket_path,
            topic,
            transport,
            event_batch_size,
            reconnect_delay: Duration::from_millis(reconnect_delay_ms),
            history_retry_delay: Duration::from_millis(history_retry_delay_ms),
            redraw_cooldown: Duration::from_millis(redraw_cooldown_ms),
            max_charts,
            live_channel_capacity,
            gap_policy: self.gap_policy.unwrap_or(DEFAULT_GAP_POLICY),
            reconnect_policy: self.reconnect_policy.unwrap_or(DEFAULT_RECONNECT_POLICY),
        })
    }
}

fn normalize_path(key: &str, raw: String) -> Result<String, AppError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return Err(AppError::InvalidArgument(format!(
            "{key} must be a non-empty path without whitespace"
        )));
    }
    if trimmed.starts_with('/') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("/{trimmed}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_defaults() {
        let config = MonitorArgs::default()
            .normalize()
            .expect("defaults should be valid");

        assert_eq!(config.base_url.as_str(), DEFAULT_BASE_URL);
        assert_eq!(config.websocket_path, DEFAULT_WEBSOCKET_PATH);
        assert_eq!(config.topic, DEFAULT_TOPIC);
        assert_eq!(config.transport, DEFAULT_TRANSPORT);
        assert_eq!(config.event_batch_size, DEFAULT_EVENT_BATCH_SIZE);
        assert_eq!(
            config.reconnect_delay,
            Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS)
        );
        assert_eq!(
            config.redraw_cooldown,
            Duration::from_millis(DEFAULT_REDRAW_COOLDOWN_MS)
        );
        assert_eq!(config.max_charts, DEFAULT_MAX_CHARTS);
        assert_eq!(config.gap_policy, GapPolicy::Refetch);
        assert_eq!(config.reconnect_policy, ReconnectPolicy::Reset);
    }

    #[test]
    fn appends_trailing_slash_to_base_path() {
        let config = MonitorArgs {
            base_url: Some("http://lab.example:9000/mork".to_string()),
            ..MonitorArgs::default()
        }
        .normalize()
        .expect("base url should be valid");

        assert_eq!(config.base_url.as_str(), "http://lab.example:9000/mork/");
    }

    #[test]
    fn rejects_non_http_base_url() {
        let result = MonitorArgs {
            base_url: Some("ftp://lab.example/".to_string()),
            ..MonitorArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_batch_size_range() {
        let result = MonitorArgs {
            event_batch_size: Some(0),
            ..MonitorArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_reconnect_delay_range() {
        let result = MonitorArgs {
            reconnect_delay_ms: Some(10),
            ..MonitorArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn prefixes_relative_paths() {
        let config = MonitorArgs {
            topic: Some("topic/progress".to_string()),
            ..MonitorArgs::default()
        }
        .normalize()
        .expect("topic should be valid");

        assert_eq!(config.topic, "/topic/progress");
    }

    #[test]
    fn parses_toml_and_lets_overrides_win() {
        let file_args = MonitorArgs::from_toml_str(
            r#"
            baseUrl = "http://10.0.0.5:8080/"
            eventBatchSize = 250
            gapPolicy = "resync"
            transport = "raw"
            "#,
        )
        .expect("toml should parse");

        let merged = file_args.merge(MonitorArgs {
            event_batch_size: Some(500),
            ..MonitorArgs::default()
        });
        let config = merged.normalize().expect("merged config should be valid");

        assert_eq!(config.base_url.as_str(), "http://10.0.0.5:8080/");
        assert_eq!(config.event_batch_size, 500);
        assert_eq!(config.gap_policy, GapPolicy::Resync);
        assert_eq!(config.transport, PushTransport::Raw);
    }

    #[test]
    fn rejects_unknown_enum_values_in_toml() {
        let result = MonitorArgs::from_toml_str(r#"gapPolicy = "ignore""#);
        assert!(result.is_err());
    }
}
