//! Typed runtime configuration for the dispatch engine.
//!
//! Every key the engine consumes is enumerated here; unknown keys in a
//! config file are rejected at load time via `deny_unknown_fields`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Number of subscribers fetched from the store per batch, and the
    /// number of buffered counter updates that force a flush.
    pub batch_size: usize,

    /// Number of concurrent dispatch workers.
    pub concurrency: usize,

    /// Maximum messages dispatched per wall-clock second.
    pub message_rate: usize,

    /// Transient send errors tolerated per campaign before it is cancelled.
    /// `0` disables the threshold.
    pub max_send_errors: u64,

    /// Redelivery attempts for a message that failed transiently. `0` drops
    /// after the first failure.
    pub max_retries: u32,

    /// Enables the sliding-window cap on top of the per-second rate.
    pub sliding_window: bool,

    /// Length of the sliding window, in seconds.
    pub sliding_window_duration_secs: u64,

    /// Maximum messages dispatched within one sliding window.
    pub sliding_window_rate: usize,

    /// `From` address stamped on outgoing campaign messages.
    pub from_email: String,

    /// When false, tracking URLs carry the nil subscriber UUID so opens and
    /// clicks cannot be attributed to individuals.
    pub individual_tracking: bool,

    /// Attach `List-Unsubscribe` headers to outgoing mail.
    pub unsubscribe_header: bool,

    /// How often the store is polled for runnable campaigns, in seconds.
    pub scan_interval_secs: u64,

    /// How often buffered sent-counters are flushed to the store, in seconds.
    pub flush_interval_secs: u64,

    /// How long `stop()` waits for workers to drain, in seconds.
    pub shutdown_grace_secs: u64,

    /// Public root URL tracking links are built on. Trailing slashes are
    /// trimmed on validation.
    pub root_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            message_rate: default_message_rate(),
            max_send_errors: 0,
            max_retries: 0,
            sliding_window: false,
            sliding_window_duration_secs: default_sliding_window_duration_secs(),
            sliding_window_rate: default_sliding_window_rate(),
            from_email: default_from_email(),
            individual_tracking: false,
            unsubscribe_header: true,
            scan_interval_secs: default_scan_interval_secs(),
            flush_interval_secs: default_flush_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            root_url: default_root_url(),
        }
    }
}

const fn default_batch_size() -> usize {
    1000
}

const fn default_concurrency() -> usize {
    10
}

const fn default_message_rate() -> usize {
    10
}

const fn default_sliding_window_duration_secs() -> u64 {
    300
}

const fn default_sliding_window_rate() -> usize {
    500
}

fn default_from_email() -> String {
    "Courier <noreply@localhost>".to_string()
}

const fn default_scan_interval_secs() -> u64 {
    5
}

const fn default_flush_interval_secs() -> u64 {
    2
}

const fn default_shutdown_grace_secs() -> u64 {
    3
}

fn default_root_url() -> String {
    "http://localhost:9000".to_string()
}

impl Config {
    /// Normalize and check the configuration.
    ///
    /// # Errors
    /// If a value is outside its legal range.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.concurrency < 1 {
            return Err(ConfigError::Invalid(
                "concurrency should be at least 1".to_string(),
            ));
        }
        if self.message_rate < 1 {
            return Err(ConfigError::Invalid(
                "message_rate should be at least 1".to_string(),
            ));
        }
        if self.batch_size < 1 {
            return Err(ConfigError::Invalid(
                "batch_size should be at least 1".to_string(),
            ));
        }
        if self.sliding_window
            && (self.sliding_window_rate < 1 || self.sliding_window_duration_secs < 1)
        {
            return Err(ConfigError::Invalid(
                "sliding_window_rate and sliding_window_duration_secs should be at least 1"
                    .to_string(),
            ));
        }
        if self.from_email.trim().is_empty() {
            return Err(ConfigError::Invalid("from_email is empty".to_string()));
        }

        while self.root_url.ends_with('/') {
            self.root_url.pop();
        }
        if self.root_url.is_empty() {
            return Err(ConfigError::Invalid("root_url is empty".to_string()));
        }

        Ok(())
    }
}
