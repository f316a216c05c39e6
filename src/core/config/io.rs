use crate::core::config::data::{path_display, Config};
use directories::ProjectDirs;
use std::error::Error as StdError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::{fmt, io};
use tempfile::NamedTempFile;

/// Errors that can occur when loading or saving configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    Read { path: PathBuf, source: io::Error },

    /// Failed to parse the configuration file as valid TOML.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Failed to serialize or write the configuration file.
    Write { path: PathBuf, message: String },

    /// No platform configuration directory could be determined.
    NoConfigDir,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "Failed to read config at {}: {}", path_display(path), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "Failed to parse config at {}: {}", path_display(path), source)
            }
            ConfigError::Write { path, message } => {
                write!(f, "Failed to write config at {}: {}", path_display(path), message)
            }
            ConfigError::NoConfigDir => {
                write!(f, "Could not determine a configuration directory; use --config")
            }
        }
    }
}

impl StdError for ConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Write { .. } | ConfigError::NoConfigDir => None,
        }
    }
}

impl Config {
    /// Load from `config_path`; a missing file yields the defaults.
    pub fn load_from_path(config_path: &Path) -> Result<Config, ConfigError> {
        if !config_path.exists() {
            tracing::debug!(path = %path_display(config_path), "no config file, using defaults");
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })
    }

    /// Write atomically: a temp file in the same directory is persisted over
    /// the target.
    pub fn save_to_path(&self, config_path: &Path) -> Result<(), ConfigError> {
        let write_error = |message: String| ConfigError::Write {
            path: config_path.to_path_buf(),
            message,
        };
        let parent = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty());

        if let Some(dir) = parent {
            fs::create_dir_all(dir).map_err(|err| write_error(err.to_string()))?;
        }

        let contents = toml::to_string_pretty(self).map_err(|err| write_error(err.to_string()))?;
        let mut temp_file = match parent {
            Some(dir) => NamedTempFile::new_in(dir),
            None => NamedTempFile::new(),
        }
        .map_err(|err| write_error(err.to_string()))?;

        temp_file
            .write_all(contents.as_bytes())
            .and_then(|_| temp_file.as_file_mut().sync_all())
            .map_err(|err| write_error(err.to_string()))?;
        temp_file
            .persist(config_path)
            .map_err(|err| write_error(err.error.to_string()))?;
        Ok(())
    }

    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        let proj_dirs =
            ProjectDirs::from("org", "causerie", "causerie").ok_or(ConfigError::NoConfigDir)?;
        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// `explicit` if given, otherwise the platform default location.
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        match explicit {
            Some(path) => Ok(path.to_path_buf()),
            None => Self::default_config_path(),
        }
    }
}
