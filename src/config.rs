use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::definition::codec::{DecodeOptions, SectionPolicy};

pub const DEFAULT_DIR: &str = ".mole";
pub const CONFIG_FILE: &str = "mole.toml";
pub const CERT_FILE: &str = "mole.crt";
pub const KEY_FILE: &str = "mole.key";
pub const TUNNELS_DIR: &str = "tunnels";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error on {1}: {0}")]
    Io(std::io::Error, String),
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("could not write config file: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("could not find a home directory, use --home")]
    NoHome,
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
impl ConfigError {
    fn io(err: std::io::Error, path: &Path) -> Self {
        ConfigError::Io(err, path.display().to_string())
    }
}

/// Every location mole reads or writes, derived from one root directory.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MolePaths {
    pub root: PathBuf,
    pub config_file: PathBuf,
    /// client certificate handed out by the server on registration
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// local cache of tunnel definitions
    pub tunnels_dir: PathBuf,
}
impl MolePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        MolePaths {
            config_file: root.join(CONFIG_FILE),
            cert_file: root.join(CERT_FILE),
            key_file: root.join(KEY_FILE),
            tunnels_dir: root.join(TUNNELS_DIR),
            root,
        }
    }
    pub fn from_home(home: Option<PathBuf>) -> Result<Self, ConfigError> {
        match home {
            Some(root) => Ok(MolePaths::new(root)),
            None => {
                let home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
                Ok(MolePaths::new(home.join(DEFAULT_DIR)))
            }
        }
    }
    pub fn ensure(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.tunnels_dir)
            .map_err(|e| ConfigError::io(e, &self.tunnels_dir))
    }
    pub fn has_identity(&self) -> bool {
        self.cert_file.exists() && self.key_file.exists()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub(crate) struct MoleConfig {
    pub server: ServerConfig,
    pub sync: SyncConfig,
}
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub(crate) struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// CA bundle used to verify the server certificate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,
    /// accept any server certificate (self-signed servers without a CA file)
    pub insecure: bool,
}
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub(crate) struct SyncConfig {
    /// upper bound of fetches in flight during a pull
    pub fetch_concurrency: usize,
    pub request_timeout_secs: u64,
    /// fail on unknown sections instead of skipping them
    pub strict_sections: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: String::from("localhost"),
            port: 9443,
            ca_cert: None,
            insecure: false,
        }
    }
}
impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            fetch_concurrency: 8,
            request_timeout_secs: 30,
            strict_sections: false,
        }
    }
}

impl MoleConfig {
    /// Reads the config file, writing the defaults out first when there is none.
    pub fn load_or_init(paths: &MolePaths) -> Result<Self, ConfigError> {
        let config = match std::fs::read_to_string(&paths.config_file) {
            Ok(content) => toml::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config, using defaults");
                let config = MoleConfig::default();
                config.save(paths)?;
                config
            }
            Err(e) => return Err(ConfigError::io(e, &paths.config_file)),
        };
        config.validate()?;
        Ok(config)
    }
    pub fn save(&self, paths: &MolePaths) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&paths.root).map_err(|e| ConfigError::io(e, &paths.root))?;
        let content = toml::to_string(self)?;
        std::fs::write(&paths.config_file, content)
            .map_err(|e| ConfigError::io(e, &paths.config_file))
    }
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.fetch_concurrency == 0 {
            return Err(ConfigError::Invalid(String::from(
                "sync.fetch_concurrency must be at least 1",
            )));
        }
        if self.sync.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "sync.request_timeout_secs must be at least 1",
            )));
        }
        if self.server.host.is_empty() {
            return Err(ConfigError::Invalid(String::from("server.host is empty")));
        }
        Ok(())
    }
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.request_timeout_secs)
    }
    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            unknown_sections: if self.sync.strict_sections {
                SectionPolicy::Reject
            } else {
                SectionPolicy::Warn
            },
        }
    }
}
