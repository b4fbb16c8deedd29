//! Connector configuration and on-disk layout.
//!
//! Everything lives in one directory, by default
//! `$XDG_CONFIG_HOME/cocalc-connector` (or `~/.config/cocalc-connector`):
//!
//! - `config.json`: credentials written by `pair`
//! - `state.json`: host id → instance mapping
//! - `daemon.pid` / `daemon.log`: background process bookkeeping

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::state::write_atomic;

/// Directory name under the config base.
pub const CONFIG_DIR_NAME: &str = "cocalc-connector";

const CONFIG_FILE: &str = "config.json";
const STATE_FILE: &str = "state.json";
const PID_FILE: &str = "daemon.pid";
const LOG_FILE: &str = "daemon.log";

/// Overrides the reported connector version.
pub const VERSION_ENV: &str = "COCALC_SELF_HOST_CONNECTOR_VERSION";

/// Errors loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("connector config not found at {} (run pair first)", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to read connector config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid connector config {}: {source}", path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "connector config at {} is missing base_url or connector_token (run pair first)",
        path.display()
    )]
    MissingCredentials { path: PathBuf },

    #[error("failed to write connector config {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize connector config: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("could not determine home directory")]
    NoHomeDir,
}

/// Credentials and settings produced by pairing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub base_url: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub connector_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub connector_token: String,

    /// Baseline poll interval chosen by the control plane. Zero means default.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub poll_interval_seconds: i64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl Configuration {
    /// Load the config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ConfigError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

        let config = serde_json::from_str(&contents).map_err(|source| ConfigError::Invalid {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded connector config");
        Ok(config)
    }

    /// Load the config file and require credentials to be present.
    pub fn load_paired(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        if config.base_url.trim().is_empty() || config.connector_token.trim().is_empty() {
            return Err(ConfigError::MissingCredentials {
                path: path.to_path_buf(),
            });
        }
        Ok(config)
    }

    /// Save as pretty JSON readable only by the owner.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)?;
        write_atomic(path, contents.as_bytes()).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Base URL without trailing slashes.
    pub fn base_url(&self) -> &str {
        normalize_base_url(&self.base_url)
    }
}

pub fn normalize_base_url(url: &str) -> &str {
    url.trim().trim_end_matches('/')
}

/// Locations of the connector's files, all beside the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    config: PathBuf,
}

impl Paths {
    pub fn new(config: impl Into<PathBuf>) -> Self {
        Self {
            config: config.into(),
        }
    }

    /// Resolve the config path: explicit override, then `XDG_CONFIG_HOME`,
    /// then `~/.config`.
    pub fn resolve(config_override: Option<PathBuf>) -> Result<Self, ConfigError> {
        let home = BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf());
        resolve_from(
            config_override,
            std::env::var_os("XDG_CONFIG_HOME"),
            home,
        )
    }

    pub fn config(&self) -> &Path {
        &self.config
    }

    pub fn dir(&self) -> &Path {
        self.config
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    pub fn state(&self) -> PathBuf {
        self.dir().join(STATE_FILE)
    }

    pub fn pid(&self) -> PathBuf {
        self.dir().join(PID_FILE)
    }

    pub fn log(&self) -> PathBuf {
        self.dir().join(LOG_FILE)
    }
}

fn resolve_from(
    config_override: Option<PathBuf>,
    xdg_config_home: Option<OsString>,
    home: Option<PathBuf>,
) -> Result<Paths, ConfigError> {
    if let Some(path) = config_override.filter(|p| !p.as_os_str().is_empty()) {
        return Ok(Paths::new(path));
    }

    let base = match xdg_config_home.filter(|v| !v.is_empty()) {
        Some(xdg) => PathBuf::from(xdg),
        None => home.ok_or(ConfigError::NoHomeDir)?.join(".config"),
    };
    Ok(Paths::new(base.join(CONFIG_DIR_NAME).join(CONFIG_FILE)))
}

/// Build and runtime identity reported to the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    pub version: String,
    pub os: String,
    pub arch: String,
}

impl AgentInfo {
    /// Identity of the running binary. The version can be overridden through
    /// [`VERSION_ENV`].
    pub fn detect() -> Self {
        let version = std::env::var(VERSION_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
        Self::new(version)
    }

    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            os: platform_os(std::env::consts::OS).to_string(),
            arch: platform_arch(std::env::consts::ARCH).to_string(),
        }
    }
}

/// OS name as the control plane spells it.
fn platform_os(os: &str) -> &str {
    match os {
        "macos" => "darwin",
        other => other,
    }
}

/// Architecture name as the control plane spells it.
fn platform_arch(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}
