//! # Streaming Configuration
//!
//! Tunables for the streaming engine: fetch batch size, live-feed idle
//! timeout, timeout-monitor resolution, output buffering and bounded queue
//! sizes.
//!
//! ## Loading
//!
//! [`StreamingConfig`] is a plain struct with sensible defaults. It can also be
//! loaded from JSON; every field is optional and missing fields keep their
//! default, so a deployment only writes down what it changes:
//!
//! ```json
//! { "batch_size": 500, "live_data_timeout_ms": 30000 }
//! ```
//!
//! Durations are expressed in milliseconds in the JSON form.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

/// Number of records pulled from a store per background fetch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Idle window after which a live feed with no new events completes.
pub const DEFAULT_LIVE_DATA_TIMEOUT_MS: u64 = 10_000;

/// Tick period of the timeout monitor.
pub const DEFAULT_TIMEOUT_RESOLUTION_MS: u64 = 1_000;

/// Fixed capacity of the buffered async output.
pub const DEFAULT_OUTPUT_BUFFER_SIZE: usize = 16 * 1024;

/// Per-topic capacity of the event bus broadcast channels.
pub const DEFAULT_EVENT_BUS_CAPACITY: usize = 1024;

/// Maximum number of live events buffered for a subscriber without credit.
pub const DEFAULT_LIVE_QUEUE_CAPACITY: usize = 1024;

/// Pacing timer period for historical replay.
pub const DEFAULT_REPLAY_TICK_MS: u64 = 10;

// =============================================================================
// Streaming Configuration
// =============================================================================

/// Configuration for subscriptions, providers and buffered outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Records pulled from the store per background fetch.
    pub batch_size: usize,

    /// Idle window for live subscriptions.
    #[serde(rename = "live_data_timeout_ms", with = "millis")]
    pub live_data_timeout: Duration,

    /// Tick period of the timeout monitor.
    #[serde(rename = "timeout_resolution_ms", with = "millis")]
    pub timeout_resolution: Duration,

    /// Capacity of [`crate::output::BufferedAsyncOutput`].
    pub output_buffer_size: usize,

    /// Broadcast capacity per event-bus topic.
    pub event_bus_capacity: usize,

    /// Bound on live events queued while the subscriber has no credit.
    pub live_queue_capacity: usize,

    /// Pacing timer period for replay subscriptions.
    #[serde(rename = "replay_tick_ms", with = "millis")]
    pub replay_tick: Duration,

    /// Largest number of observations a single historical request may match.
    pub max_obs_count: u64,

    /// Output names never exposed by the live provider.
    pub excluded_outputs: Vec<String>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            live_data_timeout: Duration::from_millis(DEFAULT_LIVE_DATA_TIMEOUT_MS),
            timeout_resolution: Duration::from_millis(DEFAULT_TIMEOUT_RESOLUTION_MS),
            output_buffer_size: DEFAULT_OUTPUT_BUFFER_SIZE,
            event_bus_capacity: DEFAULT_EVENT_BUS_CAPACITY,
            live_queue_capacity: DEFAULT_LIVE_QUEUE_CAPACITY,
            replay_tick: Duration::from_millis(DEFAULT_REPLAY_TICK_MS),
            max_obs_count: u64::MAX,
            excluded_outputs: Vec::new(),
        }
    }
}

impl StreamingConfig {
    /// Parses a configuration from a JSON document and validates it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: StreamingConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Rejects settings the streaming engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::validation("batch_size must be > 0"));
        }
        if self.output_buffer_size == 0 {
            return Err(Error::validation("output_buffer_size must be > 0"));
        }
        if self.event_bus_capacity == 0 || self.live_queue_capacity == 0 {
            return Err(Error::validation("queue capacities must be > 0"));
        }
        if self.timeout_resolution.is_zero() || self.replay_tick.is_zero() {
            return Err(Error::validation("timer periods must be > 0"));
        }
        Ok(())
    }

    /// Whether the live provider hides this output.
    pub fn is_excluded(&self, output_name: &str) -> bool {
        self.excluded_outputs.iter().any(|name| name == output_name)
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StreamingConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.output_buffer_size, 16 * 1024);
        assert_eq!(config.timeout_resolution, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            StreamingConfig::from_json(r#"{ "batch_size": 500, "live_data_timeout_ms": 2500 }"#)
                .unwrap();
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.live_data_timeout, Duration::from_millis(2500));
        assert_eq!(config.replay_tick, Duration::from_millis(DEFAULT_REPLAY_TICK_MS));
    }

    #[test]
    fn test_zero_batch_rejected() {
        let err = StreamingConfig::from_json(r#"{ "batch_size": 0 }"#).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streaming.json");
        std::fs::write(&path, r#"{ "excluded_outputs": ["debug"] }"#).unwrap();

        let config = StreamingConfig::load(&path).unwrap();
        assert!(config.is_excluded("debug"));
        assert!(!config.is_excluded("weather"));
    }

    #[test]
    fn test_json_roundtrip_uses_millis() {
        let json = serde_json::to_value(StreamingConfig::default()).unwrap();
        assert_eq!(json["live_data_timeout_ms"], 10_000);
    }
}
