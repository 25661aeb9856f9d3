//! Tracing setup and log attribution.
//!
//! Every connection logs inside a span built from an explicit
//! [`BucketContext`], so records carry the bucket and connection name without
//! any process-global "current engine" state.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::Span;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{FileLoggingConfig, LogFormat, LogRotation, LoggingConfig};

const LOG_FILE_PREFIX: &str = "dcp.log";

/// Bucket identity carried by every component that logs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketContext {
    bucket: Arc<str>,
}

impl BucketContext {
    pub fn new(bucket: impl Into<Arc<str>>) -> Self {
        Self {
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn connection_span(&self, kind: &'static str, name: &str) -> Span {
        tracing::info_span!("dcp_conn", bucket = %self.bucket, kind, conn = %name)
    }

    pub fn task_span(&self, task: &'static str) -> Span {
        tracing::debug_span!("dcp_task", bucket = %self.bucket, task)
    }
}

impl Default for BucketContext {
    fn default() -> Self {
        Self::new("default")
    }
}

#[derive(Clone)]
pub struct TelemetryConfig {
    pub verbosity: u8,
    pub logging: LoggingConfig,
}

impl TelemetryConfig {
    pub fn new(verbosity: u8, logging: LoggingConfig) -> Self {
        Self { verbosity, logging }
    }
}

pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the global subscriber. A second call keeps the first subscriber.
pub fn init(config: TelemetryConfig) -> TelemetryGuard {
    let mut filter_builder =
        EnvFilter::builder().with_default_directive(level_from_verbosity(config.verbosity).into());
    filter_builder = filter_builder.with_env_var("DCP_LOG");
    let filter = match config.logging.filter.as_deref() {
        Some(directives) => filter_builder.parse_lossy(directives),
        None => filter_builder.from_env_lossy(),
    };

    let mut guards = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.logging.stdout {
        layers.push(build_stdout_layer(config.logging.stdout_format));
    }

    let mut file_setup_error = None;
    if config.logging.file.enabled {
        let dir = resolve_log_dir(&config.logging.file);
        match fs::create_dir_all(&dir) {
            Ok(()) => {
                let (layer, guard) = build_file_layer(&config.logging.file, &dir);
                layers.push(layer);
                guards.push(guard);
            }
            Err(err) => {
                file_setup_error =
                    Some(format!("log dir init failed for {}: {err}", dir.display()));
            }
        }
    }

    layers.push(Box::new(filter));

    if Registry::default().with(layers).try_init().is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    if let Some(error) = file_setup_error {
        tracing::warn!("{error}");
    }

    TelemetryGuard { _guards: guards }
}

fn build_stdout_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true)
                .with_current_span(true)
                .with_span_list(true),
        ),
    }
}

fn build_file_layer(
    config: &FileLoggingConfig,
    dir: &Path,
) -> (
    Box<dyn Layer<Registry> + Send + Sync>,
    tracing_appender::non_blocking::WorkerGuard,
) {
    let rotation = match config.rotation {
        LogRotation::Daily => tracing_appender::rolling::Rotation::DAILY,
        LogRotation::Hourly => tracing_appender::rolling::Rotation::HOURLY,
        LogRotation::Minutely => tracing_appender::rolling::Rotation::MINUTELY,
        LogRotation::Never => tracing_appender::rolling::Rotation::NEVER,
    };
    let appender =
        tracing_appender::rolling::RollingFileAppender::new(rotation, dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true),
        ),
    };
    (layer, guard)
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::WARN,
        1 => tracing::metadata::LevelFilter::INFO,
        _ => tracing::metadata::LevelFilter::DEBUG,
    }
}

fn resolve_log_dir(config: &FileLoggingConfig) -> PathBuf {
    config
        .dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("dcp-logs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level_from_verbosity(0), tracing::metadata::LevelFilter::WARN);
        assert_eq!(level_from_verbosity(1), tracing::metadata::LevelFilter::INFO);
        assert_eq!(level_from_verbosity(5), tracing::metadata::LevelFilter::DEBUG);
    }

    #[test]
    fn file_logging_writes_into_configured_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut logging = LoggingConfig {
            stdout: false,
            ..LoggingConfig::default()
        };
        logging.file.enabled = true;
        logging.file.dir = Some(dir.path().join("logs"));
        logging.file.rotation = LogRotation::Never;
        let guard = init(TelemetryConfig::new(1, logging));
        drop(guard);
        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn bucket_context_names_bucket() {
        let ctx = BucketContext::new("travel-sample");
        assert_eq!(ctx.bucket(), "travel-sample");
        let _span = ctx.connection_span("producer", "eq_dcpq:replication");
    }
}
