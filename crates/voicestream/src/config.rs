//! Engine configuration

use crate::error::{StreamError, StreamResult};
use crate::protocol::DEFAULT_EVENT_PREFIX;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the playback engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Progress ticker cadence in milliseconds (default: 100)
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Maximum chunk decodes in flight; results are still delivered in arrival order (default: 4)
    #[serde(default = "default_decode_concurrency")]
    pub decode_concurrency: usize,

    /// Longest partial line kept between reads before it is discarded (default: 16 MiB)
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    /// Prefix of stream-event lines (default: "data: ")
    #[serde(default = "default_event_prefix")]
    pub event_prefix: String,

    /// Stop already-scheduled audio when the stream fails (default: true)
    #[serde(default = "default_stop_on_error")]
    pub stop_on_error: bool,

    /// Session sample rate; when unset the first decoded chunk fixes it
    #[serde(default)]
    pub expected_sample_rate: Option<u32>,
}

fn default_progress_interval_ms() -> u64 {
    100
}

fn default_decode_concurrency() -> usize {
    4
}

fn default_max_line_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_event_prefix() -> String {
    DEFAULT_EVENT_PREFIX.to_string()
}

fn default_stop_on_error() -> bool {
    true
}

impl EngineConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> StreamResult<Self> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| StreamError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> StreamResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.progress_interval_ms == 0 {
            return Err(StreamError::Config(
                "progress_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.decode_concurrency == 0 {
            return Err(StreamError::Config(
                "decode_concurrency must be greater than zero".to_string(),
            ));
        }
        if self.max_line_bytes == 0 {
            return Err(StreamError::Config(
                "max_line_bytes must be greater than zero".to_string(),
            ));
        }
        if self.event_prefix.is_empty() {
            return Err(StreamError::Config(
                "event_prefix must not be empty".to_string(),
            ));
        }
        if self.expected_sample_rate == Some(0) {
            return Err(StreamError::Config(
                "expected_sample_rate must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn with_progress_interval_ms(mut self, ms: u64) -> Self {
        self.progress_interval_ms = ms;
        self
    }

    pub fn with_decode_concurrency(mut self, concurrency: usize) -> Self {
        self.decode_concurrency = concurrency;
        self
    }

    pub fn with_stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    pub fn with_expected_sample_rate(mut self, sample_rate: u32) -> Self {
        self.expected_sample_rate = Some(sample_rate);
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval_ms(),
            decode_concurrency: default_decode_concurrency(),
            max_line_bytes: default_max_line_bytes(),
            event_prefix: default_event_prefix(),
            stop_on_error: default_stop_on_error(),
            expected_sample_rate: None,
        }
    }
}
