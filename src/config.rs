//! Recognized configuration keys and their effects (spec.md §6). This is
//! the boundary surface the CLI and embedding applications set; it is
//! not itself part of the deterministic core.

use std::time::Duration;

use crate::continuation::{ContinuationThresholds, PreservationPolicy};
use crate::recorder::{RecorderBackpressureConfig, RecorderConfig};
use crate::reliability::RetryPolicy;

/// Top-level engine configuration, composed from the per-component
/// tunables named in spec.md §6. Mirrors `engine::ExecutorConfig`'s
/// shape (plain struct + `Default`) rather than a builder, since there
/// is no capability-application step to stage.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Events per append flush (default 10).
    pub batch_size: usize,
    /// Continue-as-new thresholds.
    pub max_events: u64,
    pub max_duration: Duration,
    pub max_event_size: u64,
    /// Delay before a breached execution is actually continued, giving
    /// in-flight operations a chance to settle.
    pub continuation_delay: Duration,
    /// Whether continue-as-new carries paths/globals forward.
    pub preserve_paths: bool,
    pub preserve_globals: bool,
    /// Forward-compatible metadata only; no consumer in this spec
    /// (spec.md §9 "Open questions").
    pub workflow_version: i64,
    /// Bound on a single `append_events` call.
    pub flush_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub backpressure: RecorderBackpressureConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_events: 10_000,
            max_duration: Duration::from_secs(24 * 60 * 60),
            max_event_size: 100 * 1024 * 1024,
            continuation_delay: Duration::from_secs(0),
            preserve_paths: true,
            preserve_globals: true,
            workflow_version: 0,
            flush_timeout: Duration::from_secs(10),
            retry_policy: RetryPolicy::exponential(),
            backpressure: RecorderBackpressureConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            batch_size: self.batch_size,
            flush_timeout: self.flush_timeout,
            retry_policy: self.retry_policy.clone(),
            backpressure: self.backpressure.clone(),
        }
    }

    pub fn continuation_thresholds(&self) -> ContinuationThresholds {
        ContinuationThresholds {
            max_events: self.max_events,
            max_duration: self.max_duration,
            max_event_size_bytes: self.max_event_size,
            custom_predicate: None,
            poll_interval: Duration::from_secs(30),
        }
    }

    pub fn preservation_policy(&self) -> PreservationPolicy {
        PreservationPolicy {
            preserve_paths: self.preserve_paths,
            preserve_globals: self.preserve_globals,
        }
    }
}

/// Loads an [`EngineConfig`] from environment variables, following the
/// workspace's `dotenvy` + env-var convention (no config-file layer).
/// Unset variables fall back to [`EngineConfig::default`].
pub fn from_env() -> EngineConfig {
    let _ = dotenvy::dotenv();
    let mut config = EngineConfig::default();

    if let Ok(v) = std::env::var("ENGINE_BATCH_SIZE") {
        if let Ok(n) = v.parse() {
            config.batch_size = n;
        }
    }
    if let Ok(v) = std::env::var("ENGINE_MAX_EVENTS") {
        if let Ok(n) = v.parse() {
            config.max_events = n;
        }
    }
    if let Ok(v) = std::env::var("ENGINE_MAX_DURATION_SECS") {
        if let Ok(n) = v.parse::<u64>() {
            config.max_duration = Duration::from_secs(n);
        }
    }
    if let Ok(v) = std::env::var("ENGINE_MAX_EVENT_SIZE_BYTES") {
        if let Ok(n) = v.parse() {
            config.max_event_size = n;
        }
    }
    if let Ok(v) = std::env::var("ENGINE_PRESERVE_PATHS") {
        if let Ok(b) = v.parse() {
            config.preserve_paths = b;
        }
    }
    if let Ok(v) = std::env::var("ENGINE_PRESERVE_GLOBALS") {
        if let Ok(b) = v.parse() {
            config.preserve_globals = b;
        }
    }
    if let Ok(v) = std::env::var("ENGINE_WORKFLOW_VERSION") {
        if let Ok(n) = v.parse() {
            config.workflow_version = n;
        }
    }

    config
}
