//! Configuration loading and types

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use winfeature_core::ProvisioningConfig;
use winfeature_exec::Credentials;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "WINFEATURE_CONFIG";

/// Top-level configuration for a winfeature run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
    /// How to reach the target machine
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// What to install
    #[serde(default)]
    pub provision: ProvisioningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins if set
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit logs and progress events as JSON lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Target connection settings
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Host name or address; `localhost` runs commands on this machine
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Environment variable holding the SSH password
    #[serde(default)]
    pub password_env: Option<String>,
    /// Path to a private key file
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,
    /// Environment variable holding a base64 private key
    #[serde(default)]
    pub key_env: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password_env", &self.password_env)
            .field("ssh_key", &self.ssh_key)
            .field("key_env", &self.key_env)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish_non_exhaustive()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: String::new(),
            password: None,
            password_env: None,
            ssh_key: None,
            key_env: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl ConnectionConfig {
    /// Whether commands run on this machine instead of over SSH
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self.host.as_str(), "localhost" | "127.0.0.1" | "::1")
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Pick the configured credentials; a literal password wins, then a
    /// password variable, then a key file, then a key variable.
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        if let Some(password) = &self.password {
            return Some(Credentials::Password(password.clone()));
        }
        if let Some(var) = &self.password_env {
            return Some(Credentials::PasswordEnv(var.clone()));
        }
        if let Some(path) = &self.ssh_key {
            return Some(Credentials::KeyFile(path.clone()));
        }
        self.key_env.clone().map(Credentials::KeyEnv)
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("failed to read {}: {e}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("failed to parse {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Find the config file to use, if any.
    ///
    /// `WINFEATURE_CONFIG` is returned even when it does not exist so that a
    /// typo surfaces as a read error.
    #[must_use]
    pub fn find_default() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }

        let paths = [
            Some(PathBuf::from("winfeature.toml")),
            Some(PathBuf::from("/etc/winfeature/winfeature.toml")),
            dirs::config_dir().map(|p| p.join("winfeature/winfeature.toml")),
        ];

        paths.into_iter().flatten().find(|path| path.exists())
    }
}
