//! Error types for winfeature-exec

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the target machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// Failed to connect to remote host
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Command timed out
    #[error("command timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// Credentials could not be resolved
    #[error("credential error: {0}")]
    Credentials(String),

    /// Process spawn error
    #[error("failed to spawn process: {0}")]
    SpawnError(String),

    /// I/O error during execution
    #[error("I/O error: {0}")]
    IoError(String),

    /// Writing a file on the target failed
    #[error("upload to {path} failed: {message}")]
    UploadFailed {
        /// Destination path on the target
        path: String,
        /// Underlying failure
        message: String,
    },

    /// Connection not established
    #[error("not connected")]
    NotConnected,

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

impl ExecError {
    /// Check if error is caused by the transport rather than the caller.
    ///
    /// A rebooting machine produces exactly these errors, so callers waiting
    /// for availability keep retrying them.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed(_)
                | ExecError::Timeout { .. }
                | ExecError::IoError(_)
                | ExecError::NotConnected
                | ExecError::UploadFailed { .. }
        )
    }
}
