//! Configuration schema definitions.
//!
//! Durations are written in milliseconds so that every key can be set from a
//! plain integer environment variable.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use gramflow_framework::{DispatcherConfig, LimitConfig, LimitMode, OverflowPolicy};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GramflowConfig {
    /// Queue and worker pool settings.
    #[serde(default)]
    pub dispatcher: DispatcherSection,

    /// Outbound rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitSection,

    /// Logging output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GramflowConfig {
    /// Builds the dispatcher configuration from the dispatcher and rate limit
    /// sections.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let d = &self.dispatcher;
        DispatcherConfig {
            queue_capacity: d.queue_capacity,
            worker_count: d.worker_count,
            default_rate: self.rate_limit.rate,
            default_capacity: self.rate_limit.capacity,
            shard_by_chat: d.shard_by_chat,
            drain_timeout: Duration::from_millis(d.drain_timeout_ms),
            overflow: d.overflow,
            limit_mode: self.rate_limit.mode,
            fan_out: d.fan_out,
            dispatch_timeout: d.dispatch_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// The `[dispatcher]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSection {
    /// Maximum number of queued events.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Number of workers started with the runtime.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Pin each chat to one worker.
    #[serde(default)]
    pub shard_by_chat: bool,

    /// Graceful stop budget in milliseconds.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// `block` or `reject`.
    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Run every matching handler instead of the first.
    #[serde(default)]
    pub fan_out: bool,

    /// Per-event processing budget in milliseconds.
    #[serde(default)]
    pub dispatch_timeout_ms: Option<u64>,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            worker_count: default_worker_count(),
            shard_by_chat: false,
            drain_timeout_ms: default_drain_timeout_ms(),
            overflow: OverflowPolicy::default(),
            fan_out: false,
            dispatch_timeout_ms: None,
        }
    }
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_worker_count() -> usize {
    4
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

/// The `[rate_limit]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSection {
    /// Tokens refilled per second for each chat.
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Bucket size for each chat.
    #[serde(default = "default_capacity")]
    pub capacity: f64,

    /// `block` waits for tokens, `reject` fails the call.
    #[serde(default)]
    pub mode: LimitMode,

    /// Limits for specific keys, e.g. a busy group chat id.
    #[serde(default)]
    pub overrides: HashMap<String, LimitOverride>,

    /// How often idle full buckets are dropped; 0 disables the sweep.
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            capacity: default_capacity(),
            mode: LimitMode::default(),
            overrides: HashMap::new(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

impl RateLimitSection {
    pub fn cleanup_interval(&self) -> Option<Duration> {
        (self.cleanup_interval_ms > 0).then(|| Duration::from_millis(self.cleanup_interval_ms))
    }
}

fn default_rate() -> f64 {
    20.0
}

fn default_capacity() -> f64 {
    20.0
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

/// A per-key bucket shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitOverride {
    pub rate: f64,
    pub capacity: f64,
}

impl From<LimitOverride> for LimitConfig {
    fn from(o: LimitOverride) -> Self {
        LimitConfig::new(o.rate, o.capacity)
    }
}

// =============================================================================
// Logging
// =============================================================================

/// The `[logging]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    /// Log file, used when `output = "file"`.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    /// How the log file rolls over.
    #[serde(default)]
    pub rotation: LogRotation,

    /// Include thread ids.
    #[serde(default)]
    pub thread_ids: bool,

    /// Include source file and line.
    #[serde(default)]
    pub file_location: bool,

    /// Per-target levels, e.g. `gramflow_framework = "debug"`.
    #[serde(default)]
    pub filters: HashMap<String, LogLevel>,

    #[serde(default)]
    pub span_events: SpanEventConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            output: LogOutput::default(),
            file_path: None,
            rotation: LogRotation::default(),
            thread_ids: false,
            file_location: false,
            filters: HashMap::new(),
            span_events: SpanEventConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    /// Requires the `json-log` feature.
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub close: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_dispatcher_defaults() {
        let config = GramflowConfig::default().dispatcher_config();
        let expected = DispatcherConfig::default();
        assert_eq!(config.queue_capacity, expected.queue_capacity);
        assert_eq!(config.worker_count, expected.worker_count);
        assert_eq!(config.default_rate, expected.default_rate);
        assert_eq!(config.default_capacity, expected.default_capacity);
        assert_eq!(config.drain_timeout, expected.drain_timeout);
        assert_eq!(config.overflow, expected.overflow);
        assert_eq!(config.limit_mode, expected.limit_mode);
        assert_eq!(config.dispatch_timeout, None);
    }

    #[test]
    fn test_millisecond_durations() {
        let mut config = GramflowConfig::default();
        config.dispatcher.drain_timeout_ms = 250;
        config.dispatcher.dispatch_timeout_ms = Some(1500);
        config.rate_limit.mode = LimitMode::Reject;

        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.drain_timeout, Duration::from_millis(250));
        assert_eq!(dispatcher.dispatch_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(dispatcher.limit_mode, LimitMode::Reject);
    }

    #[test]
    fn test_cleanup_interval_zero_disables() {
        let mut section = RateLimitSection::default();
        assert_eq!(section.cleanup_interval(), Some(Duration::from_secs(60)));
        section.cleanup_interval_ms = 0;
        assert_eq!(section.cleanup_interval(), None);
    }
}
