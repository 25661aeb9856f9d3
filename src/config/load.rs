use std::fs;
use std::path::Path;

use super::env::apply_env_overrides;
use super::{Config, ConfigError};

/// Parse a TOML config file and apply environment overrides.
pub fn load_from_path(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Like [`load_from_path`], falling back to defaults when the file is
/// missing or malformed.
pub fn load_or_default(path: &Path) -> Config {
    if !path.exists() {
        let mut config = Config::default();
        apply_env_overrides(&mut config);
        return config;
    }
    match load_from_path(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("config load failed, using defaults: {e}");
            let mut config = Config::default();
            apply_env_overrides(&mut config);
            config
        }
    }
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(write_err)?;
    let contents = toml::to_string_pretty(cfg)?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    fs::write(temp.path(), contents.as_bytes()).map_err(write_err)?;
    temp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}
