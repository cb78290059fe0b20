//! SSH credential resolution

use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::ExecError;

/// Where the SSH login credentials come from
#[derive(Clone)]
pub enum Credentials {
    /// Password authentication
    Password(String),
    /// Password read from an environment variable
    PasswordEnv(String),
    /// Explicit path to a private key file
    KeyFile(PathBuf),
    /// Base64-encoded private key held in an environment variable
    KeyEnv(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password(..)"),
            Credentials::PasswordEnv(var) => f.debug_tuple("PasswordEnv").field(var).finish(),
            Credentials::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            Credentials::KeyEnv(var) => f.debug_tuple("KeyEnv").field(var).finish(),
        }
    }
}

impl Credentials {
    /// Resolve credentials into something the SSH client can use.
    ///
    /// For `KeyEnv`, decodes base64 and writes the key to a temp file that is
    /// removed when the resolved value is dropped.
    ///
    /// # Errors
    /// Returns `ExecError::Credentials` if the variable is unset, the key is
    /// not valid base64, or the key file is unusable.
    pub fn resolve(&self) -> Result<ResolvedCredentials, ExecError> {
        match self {
            Credentials::Password(password) => Ok(ResolvedCredentials::Password(password.clone())),
            Credentials::PasswordEnv(var_name) => env::var(var_name)
                .map(ResolvedCredentials::Password)
                .map_err(|_| ExecError::Credentials(format!("environment variable {var_name} not set"))),
            Credentials::KeyFile(path) => {
                validate_key_permissions(path)?;
                Ok(ResolvedCredentials::KeyPath(path.clone()))
            }
            Credentials::KeyEnv(var_name) => {
                let encoded = env::var(var_name).map_err(|_| {
                    ExecError::Credentials(format!("environment variable {var_name} not set"))
                })?;
                let key_data = base64_decode(&encoded)
                    .map_err(|_| ExecError::Credentials("invalid base64 encoding".to_string()))?;
                let temp_path = write_temp_key(&key_data)?;
                Ok(ResolvedCredentials::TempKey(temp_path))
            }
        }
    }
}

/// Credentials ready for authentication
pub enum ResolvedCredentials {
    Password(String),
    KeyPath(PathBuf),
    /// Temporary key file (deleted on drop)
    TempKey(PathBuf),
}

impl std::fmt::Debug for ResolvedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedCredentials::Password(_) => f.write_str("Password(..)"),
            ResolvedCredentials::KeyPath(p) => f.debug_tuple("KeyPath").field(p).finish(),
            ResolvedCredentials::TempKey(p) => f.debug_tuple("TempKey").field(p).finish(),
        }
    }
}

impl ResolvedCredentials {
    /// Path of the private key, if key based
    #[must_use]
    pub fn key_path(&self) -> Option<&Path> {
        match self {
            ResolvedCredentials::KeyPath(p) | ResolvedCredentials::TempKey(p) => Some(p),
            ResolvedCredentials::Password(_) => None,
        }
    }

    #[must_use]
    pub fn password(&self) -> Option<&str> {
        match self {
            ResolvedCredentials::Password(p) => Some(p),
            _ => None,
        }
    }
}

impl Drop for ResolvedCredentials {
    fn drop(&mut self) {
        if let ResolvedCredentials::TempKey(path) = self
            && let Err(e) = std::fs::remove_file(&*path)
        {
            warn!(path = %path.display(), error = %e, "failed to remove temp key");
        }
    }
}

fn base64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim())
}

#[cfg(unix)]
fn validate_key_permissions(path: &Path) -> Result<(), ExecError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path)
        .map_err(|e| ExecError::Credentials(format!("key file {}: {e}", path.display())))?;

    // group and other bits must be clear
    if metadata.permissions().mode() & 0o77 != 0 {
        return Err(ExecError::Credentials(format!(
            "key file permissions too open: {} (should be 600)",
            path.display()
        )));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_key_permissions(path: &Path) -> Result<(), ExecError> {
    if !path.exists() {
        return Err(ExecError::Credentials(format!(
            "key file not found: {}",
            path.display()
        )));
    }
    Ok(())
}

fn write_temp_key(key_data: &[u8]) -> Result<PathBuf, ExecError> {
    use std::fs::OpenOptions;
    use std::io::Write;

    let temp_path =
        std::env::temp_dir().join(format!("winfeature_ssh_key_{}", std::process::id()));

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let io_err = |e: std::io::Error| ExecError::Credentials(format!("temp key: {e}"));
    let mut file = options.open(&temp_path).map_err(io_err)?;
    file.write_all(key_data).map_err(io_err)?;

    debug!(path = %temp_path.display(), "wrote temporary SSH key");

    Ok(temp_path)
}
