//! Provisioning configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Identity used when no username is configured
pub const DEFAULT_USERNAME: &str = "SYSTEM";

/// How long to wait for the machine to come back after a restart
pub const DEFAULT_RESTART_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

/// What to install and as whom. Immutable for the lifetime of a run.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// User the elevated scheduled tasks run as
    #[serde(default)]
    pub username: String,
    /// Password for `username`, empty for service accounts
    #[serde(default)]
    pub password: String,
    /// Budget for each restart/availability wait, in seconds in config files
    #[serde(default, with = "duration_secs", rename = "restart_timeout_secs")]
    pub restart_timeout: Duration,
    /// Windows features to install, in order
    #[serde(default)]
    pub features: Vec<String>,
    /// Windows capabilities to install, in order
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl std::fmt::Debug for ProvisioningConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningConfig")
            .field("username", &self.username)
            .field("restart_timeout", &self.restart_timeout)
            .field("features", &self.features)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl ProvisioningConfig {
    /// Fill in defaults for empty or zero fields
    #[must_use]
    pub fn normalize(mut self) -> Self {
        if self.username.is_empty() {
            self.username = DEFAULT_USERNAME.to_string();
        }
        if self.restart_timeout.is_zero() {
            self.restart_timeout = DEFAULT_RESTART_TIMEOUT;
        }
        self
    }

    /// Check a normalized config
    ///
    /// # Errors
    /// Returns `CoreError::ConfigError` listing every problem found.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut problems = Vec::new();

        if self.username.trim().is_empty() {
            problems.push("must supply a 'username'".to_string());
        }
        if self.features.iter().any(|f| f.trim().is_empty()) {
            problems.push("'features' must not contain empty names".to_string());
        }
        if self.capabilities.iter().any(|c| c.trim().is_empty()) {
            problems.push("'capabilities' must not contain empty names".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CoreError::ConfigError(problems.join("; ")))
        }
    }

    /// Whether there is anything to install
    #[must_use]
    pub fn has_work(&self) -> bool {
        !self.features.is_empty() || !self.capabilities.is_empty()
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
