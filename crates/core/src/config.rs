use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unsupported config schema version {0} (expected {SCHEMA_VERSION})")]
    UnsupportedSchema(u32),
    #[error("interval `{0}` must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("source_priority contains an empty entry")]
    EmptySourceName,
}

/// How the active source is chosen when several are running.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// A newly playing source wins over a previously selected idle one.
    #[default]
    Layered,
    /// The previously selected source is kept while it is still running.
    ContinuityFirst,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConfigIntervals {
    pub fallback_poll_ms: u64,
    pub backend_poll_ms: u64,
    pub discovery_ms: u64,
    pub file_watch_poll_ms: u64,
}

impl Default for ConfigIntervals {
    fn default() -> Self {
        Self {
            fallback_poll_ms: 1_000,
            backend_poll_ms: 1_000,
            discovery_ms: 5_000,
            file_watch_poll_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToleranceConfig {
    /// Drift allowed for sources that are only polled.
    pub polled_ms: u64,
    /// Drift allowed for sources that push their own notifications.
    pub push_ms: u64,
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        Self {
            polled_ms: 1_500,
            push_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub source_priority: Vec<String>,
    pub preferred_source: Option<String>,
    pub selection: SelectionMode,
    pub poll_push_sources: bool,
    pub log_level: String,
    pub intervals: ConfigIntervals,
    pub tolerances: ToleranceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            source_priority: vec![
                "apple_music".to_string(),
                "windows".to_string(),
                "mpris".to_string(),
            ],
            preferred_source: None,
            selection: SelectionMode::default(),
            poll_push_sources: true,
            log_level: "info".to_string(),
            intervals: ConfigIntervals::default(),
            tolerances: ToleranceConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(ConfigError::UnsupportedSchema(self.schema_version));
        }
        if self.source_priority.iter().any(|s| s.trim().is_empty()) {
            return Err(ConfigError::EmptySourceName);
        }
        let intervals = [
            ("fallback_poll_ms", self.intervals.fallback_poll_ms),
            ("backend_poll_ms", self.intervals.backend_poll_ms),
            ("discovery_ms", self.intervals.discovery_ms),
            ("file_watch_poll_ms", self.intervals.file_watch_poll_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        Ok(())
    }
}
