//! Daemon configuration.
//!
//! Layered the simple way: a TOML file named by `--config`, with every key
//! optional and falling back to a built-in default. The working directory
//! defaults to the `PWD` of the launching shell.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_API_PORT: u16 = 4242;
pub const DEFAULT_STREAM_PORT: u16 = 4343;
pub const DEFAULT_GRAPH_FILE: &str = "makefile.json";

/// Name of the directory, under the working directory, that holds falcon's
/// persisted state.
pub const FALCON_DIR: &str = ".falcon";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Directory all build commands run in. Defaults to `$PWD`.
    pub working_directory: Option<PathBuf>,

    /// Graph file, relative to the working directory.
    pub graph: String,

    /// RPC request/response port.
    pub api_port: u16,

    /// Build transcript stream port.
    pub stream_port: u16,

    /// Log filter level (`error`, `warn`, `info`, `debug`, `trace`).
    pub log_level: String,

    /// Write rotating log files in this directory instead of stderr only.
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            working_directory: None,
            graph: DEFAULT_GRAPH_FILE.to_string(),
            api_port: DEFAULT_API_PORT,
            stream_port: DEFAULT_STREAM_PORT,
            log_level: "warn".to_string(),
            log_dir: None,
        }
    }
}

impl Config {
    /// Load from a TOML file; a missing `path` yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents =
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The directory all build commands run in.
    pub fn working_directory(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.working_directory {
            return Ok(dir.clone());
        }
        if let Some(pwd) = std::env::var_os("PWD") {
            return Ok(PathBuf::from(pwd));
        }
        std::env::current_dir().map_err(|_| ConfigError::NoWorkingDirectory)
    }

    pub fn graph_file(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.working_directory()?.join(&self.graph))
    }

    pub fn falcon_dir(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.working_directory()?.join(FALCON_DIR))
    }

    /// Persisted build records consulted by the dependency scan.
    pub fn state_file(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.falcon_dir()?.join("state.json"))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("working directory is not set and PWD is unavailable")]
    NoWorkingDirectory,
}
