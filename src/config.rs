use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sweeper::{SweeperConfig, DEFAULT_SESSION_MAX_AGE, DEFAULT_SWEEP_INTERVAL};

pub const DEFAULT_BIND: &str = "127.0.0.1:3001";

/// Origins accepted for WebSocket upgrades when nothing else is configured.
pub const DEFAULT_CORS_ORIGINS: &[&str] = &[
    "http://localhost:4200",
    "https://localhost:4200",
    "https://*.github.io",
    "https://*.up.railway.app",
    "https://*.onrender.com",
];

/// Server config, loaded from TOML. Every field is optional in the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub sweeper: SweeperSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: SocketAddr,
    /// Allowed browser origins. `https://*.example.com` matches any
    /// subdomain; an empty list allows every origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3001)),
            cors_origins: DEFAULT_CORS_ORIGINS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperSection {
    pub interval_secs: u64,
    pub max_age_secs: u64,
}

impl Default for SweeperSection {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_SWEEP_INTERVAL.as_secs(),
            max_age_secs: DEFAULT_SESSION_MAX_AGE.as_secs(),
        }
    }
}

impl Config {
    /// Load config from a TOML file path. Returns None if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweeper.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sweeper.interval_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            interval: Duration::from_secs(self.sweeper.interval_secs),
            max_age: Duration::from_secs(self.sweeper.max_age_secs),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {1}", path = .0.display())]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {path}: {1}", path = .0.display())]
    ParseFailed(PathBuf, #[source] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
