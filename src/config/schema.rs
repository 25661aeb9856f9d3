use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::Limits;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub limits: Limits,
    pub replication: ReplicationConfig,
}

/// Consumer flow-control policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControlPolicy {
    /// No window; the producer sends as fast as the transport allows.
    None,
    /// Fixed byte window of `Limits::flow_control_window_bytes`.
    #[default]
    Static,
}

impl FlowControlPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "none" => Some(FlowControlPolicy::None),
            "static" => Some(FlowControlPolicy::Static),
            _ => None,
        }
    }

    pub fn is_enabled(self) -> bool {
        !matches!(self, FlowControlPolicy::None)
    }
}

/// What a replica does when memory is above the replication threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullPolicy {
    /// Buffer incoming messages and drain them later.
    #[default]
    Buffer,
    /// Refuse new data and drop the connection (ephemeral buckets).
    FailNewData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub bucket_name: String,
    pub flow_control_policy: FlowControlPolicy,
    pub disk_backfill_queue: bool,
    pub full_policy: FullPolicy,
    pub enable_sync_replication: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            bucket_name: "default".to_string(),
            flow_control_policy: FlowControlPolicy::default(),
            disk_backfill_queue: false,
            full_policy: FullPolicy::default(),
            enable_sync_replication: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Daily,
    Hourly,
    Minutely,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub filter: Option<String>,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            filter: None,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
            rotation: LogRotation::Daily,
        }
    }
}
