use crate::collectors::filter::ProcessFilter;
use crate::collectors::CollectError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub interval_secs: f64,
    pub filter: String,
    pub only_ros: bool,
    pub num_process: usize,
    pub backend: Backend,
    pub wide: bool,
    pub per_core: bool,
    pub history_rows: usize,
    pub listen: Option<String>,
    pub persist: PersistConfig,
    pub top_command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Auto,
    Native,
    Top,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PersistConfig {
    pub enabled: bool,
    pub dir: String,
    pub chunk_rows: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            filter: default_filter(),
            only_ros: false,
            num_process: default_num_process(),
            backend: Backend::Native,
            wide: false,
            per_core: false,
            history_rows: default_history_rows(),
            listen: None,
            persist: PersistConfig::default(),
            top_command: default_top_command(),
        }
    }
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: ".".to_string(),
            chunk_rows: default_chunk_rows(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
    #[error("invalid filter pattern: {0}")]
    Filter(#[from] regex::Error),
    #[error("failed to start collector: {0}")]
    Collector(#[source] CollectError),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn interval(&self) -> Result<Duration, ConfigError> {
        match Duration::try_from_secs_f64(self.interval_secs) {
            Ok(interval) if !interval.is_zero() => Ok(interval),
            _ => Err(ConfigError::Validation(format!(
                "interval_secs must be a positive number of seconds, got {}",
                self.interval_secs
            ))),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.interval()?;
        if self.num_process == 0 {
            return Err(ConfigError::Validation(
                "num_process must be >= 1".to_string(),
            ));
        }
        if self.history_rows == 0 {
            return Err(ConfigError::Validation(
                "history_rows must be >= 1".to_string(),
            ));
        }
        if self.persist.chunk_rows == 0 {
            return Err(ConfigError::Validation(
                "persist.chunk_rows must be >= 1".to_string(),
            ));
        }
        if self.top_command.trim().is_empty() {
            return Err(ConfigError::Validation(
                "top_command must not be empty".to_string(),
            ));
        }
        if let Some(listen) = &self.listen {
            if SocketAddr::from_str(listen).is_err() {
                return Err(ConfigError::Validation(
                    "listen must be a host:port socket address".to_string(),
                ));
            }
        }

        ProcessFilter::new(&self.filter, self.only_ros)?;
        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

const fn default_interval_secs() -> f64 {
    1.0
}

fn default_filter() -> String {
    ".*".to_string()
}

const fn default_num_process() -> usize {
    30
}

const fn default_history_rows() -> usize {
    100
}

const fn default_chunk_rows() -> usize {
    600
}

fn default_top_command() -> String {
    "top".to_string()
}
