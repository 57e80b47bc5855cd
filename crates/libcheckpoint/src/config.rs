//! Host-wide settings for checkpoint/restore, loaded from a JSON file.
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::{CgroupMode, CriuCli, CriuRpc, Engine, MAX_LOG_LEVEL, Unsupported};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to open config file {path:?}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

type Result<T> = std::result::Result<T, ConfigError>;

/// How the engine is driven.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// `criu swrk` over a socket pair.
    #[default]
    Rpc,
    /// One `criu` command line per operation.
    Cli,
    /// Checkpoint/restore switched off on this host.
    Disabled,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub criu_path: String,
    pub transport: Transport,
    // Reported to callers when the transport is disabled
    pub disabled_reason: Option<String>,
    pub log_level: i32,
    // Parent of the per-container restore root mounts
    pub runtime_dir: PathBuf,
    pub enable_fs: Vec<String>,
    pub skip_mounts: Vec<String>,
    pub restore_cgroup_mode: CgroupMode,
    pub ext_unix_sk: bool,
    pub shell_job: bool,
    // Only honoured by the command line transport
    pub timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            criu_path: "criu".to_string(),
            transport: Transport::default(),
            disabled_reason: None,
            log_level: MAX_LOG_LEVEL,
            runtime_dir: PathBuf::from("/run/libcheckpoint"),
            enable_fs: vec!["hugetlbfs".to_string(), "tracefs".to_string()],
            skip_mounts: Vec::new(),
            restore_cgroup_mode: CgroupMode::default(),
            ext_unix_sk: false,
            shell_job: false,
            timeout_secs: None,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| {
            tracing::error!(?path, %err, "failed to open config file");
            ConfigError::Open {
                path: path.to_owned(),
                source: err,
            }
        })?;
        let config: Self = serde_json::from_reader(BufReader::new(file)).map_err(|err| {
            tracing::error!(?path, %err, "failed to parse config file");
            ConfigError::Parse {
                path: path.to_owned(),
                source: err,
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0..=MAX_LOG_LEVEL).contains(&self.log_level) {
            return Err(ConfigError::Invalid {
                field: "log_level",
                reason: format!("{} is outside 0..={MAX_LOG_LEVEL}", self.log_level),
            });
        }
        if !self.runtime_dir.is_absolute() {
            return Err(ConfigError::Invalid {
                field: "runtime_dir",
                reason: format!("{:?} is not absolute", self.runtime_dir),
            });
        }
        if let Some(path) = self.skip_mounts.iter().find(|p| !p.starts_with('/')) {
            return Err(ConfigError::Invalid {
                field: "skip_mounts",
                reason: format!("{path:?} is not absolute"),
            });
        }
        if self.criu_path.is_empty() && self.transport != Transport::Disabled {
            return Err(ConfigError::Invalid {
                field: "criu_path",
                reason: "empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// The engine selected by this configuration.
    pub fn engine(&self) -> Box<dyn Engine> {
        match self.transport {
            Transport::Rpc => Box::new(CriuRpc::new(self.criu_path.as_str())),
            Transport::Cli => {
                Box::new(CriuCli::new(self.criu_path.as_str()).with_timeout(self.timeout()))
            }
            Transport::Disabled => Box::new(Unsupported::new(
                self.disabled_reason
                    .clone()
                    .unwrap_or_else(|| "checkpoint/restore is disabled".to_string()),
            )),
        }
    }
}
