use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tunables for one simulated run.
///
/// Every field has a default, so a config file only needs to mention what it
/// overrides. The backlog and yield numbers are soft bounds, not guarantees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Calls that would create a frame deeper than this fail with a stack overflow.
    pub max_call_depth: usize,
    /// Longest synchronous burst before the scheduler yields to the host.
    pub yield_budget_ms: u64,
    /// Delay used when re-arming a fiber that yielded.
    pub yield_delay_ms: u64,
    /// Pushes onto a queue already holding this many buffered events are dropped.
    pub max_event_backlog: usize,
    pub idle_interval_ms: u64,
    /// Wildcard source/event id.
    pub any_id: u32,
    pub scheduler_source_id: u32,
    pub idle_event_id: u32,
    /// Events raised from this source wake a single waiter instead of all of them.
    pub notify_one_id: Option<u32>,
    pub snapshot_retention: usize,
    /// When set, non-pausing `trace` messages are emitted at most this often.
    pub trace_interval_ms: Option<u64>,
    pub request_timeout_ms: u64,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 100,
            yield_budget_ms: 20,
            yield_delay_ms: 5,
            max_event_backlog: 5,
            idle_interval_ms: 20,
            any_id: 0,
            scheduler_source_id: 15,
            idle_event_id: 2,
            notify_one_id: None,
            snapshot_retention: 3,
            trace_interval_ms: None,
            request_timeout_ms: 5_000,
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// A level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,
    /// Log file to append to, in addition to stderr.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn normalize_level(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "warning" => "warn".to_owned(),
            "trace" | "debug" | "info" | "warn" | "error" => trimmed.to_ascii_lowercase(),
            _ => trimmed.to_owned(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}
