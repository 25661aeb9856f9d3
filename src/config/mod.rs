//! Config loading and persistence.

mod env;
mod load;
mod schema;

use std::path::PathBuf;

use thiserror::Error;

pub use env::{apply_env_overrides, apply_env_overrides_from};
pub use load::{load_from_path, load_or_default, write_config};
pub use schema::{
    Config, FileLoggingConfig, FlowControlPolicy, FullPolicy, LogFormat, LogRotation,
    LoggingConfig, ReplicationConfig,
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
