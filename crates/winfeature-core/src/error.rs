//! Core error types for winfeature-core

use std::time::Duration;

use thiserror::Error;
use winfeature_exec::ExecError;

use crate::retry::{RetryError, Retryable};
use crate::script::TemplateError;
use crate::state::{Phase, Step};

/// Errors that end (or would end) a provisioning run
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// Writing a script to the target failed
    #[error("error uploading {what} to {path}: {source}")]
    UploadFailed {
        /// Which script was being uploaded
        what: &'static str,
        /// Destination path on the target
        path: &'static str,
        #[source]
        source: ExecError,
    },

    /// A command that must exit 0 did not
    #[error("`{command}` exited with status {status}")]
    RemoteCommandFailed {
        /// Command line that was run
        command: String,
        /// Exit status reported by the target
        status: i32,
    },

    /// A script exited with something other than 0 or 101
    #[error("{phase} script exited with unexpected status {status}")]
    UnexpectedExitStatus {
        /// Phase whose script misbehaved
        phase: Phase,
        /// Raw exit status
        status: i32,
    },

    /// The execution channel failed
    #[error("remote execution failed: {0}")]
    Exec(#[from] ExecError),

    /// The start timeout elapsed before the phase succeeded
    #[error("{phase} timed out after {elapsed:?} ({attempts} attempts){}", describe_last(.last))]
    Timeout {
        phase: Phase,
        elapsed: Duration,
        attempts: u32,
        /// Last error seen before giving up, if any attempt finished
        last: Option<Box<CoreError>>,
    },

    /// The attempt budget ran out
    #[error("{phase} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        phase: Phase,
        attempts: u32,
        /// Last error seen before giving up
        last: Box<CoreError>,
    },

    /// The run was cancelled from outside
    #[error("cancelled during {phase}")]
    Cancelled { phase: Phase },

    /// A script template could not be rendered
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The session was asked to make a move its state machine does not allow
    #[error("invalid transition from {from} on {step:?}")]
    InvalidTransition { from: Phase, step: Step },
}

impl CoreError {
    /// Exit status behind this error, looking through retry wrappers
    #[must_use]
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            CoreError::RemoteCommandFailed { status, .. }
            | CoreError::UnexpectedExitStatus { status, .. } => Some(*status),
            CoreError::Timeout { last, .. } => last.as_ref().and_then(|e| e.exit_status()),
            CoreError::RetriesExhausted { last, .. } => last.exit_status(),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled { .. })
    }

    /// Attach phase context to a retry engine failure
    pub(crate) fn from_retry(phase: Phase, err: RetryError<CoreError>) -> Self {
        match err {
            RetryError::Cancelled { .. } => CoreError::Cancelled { phase },
            RetryError::TimedOut {
                elapsed,
                attempts,
                last,
            } => CoreError::Timeout {
                phase,
                elapsed,
                attempts,
                last: last.map(Box::new),
            },
            RetryError::Exhausted { attempts, last } => CoreError::RetriesExhausted {
                phase,
                attempts,
                last: Box::new(last),
            },
            RetryError::Aborted(e) => e,
        }
    }
}

fn describe_last(last: &Option<Box<CoreError>>) -> String {
    last.as_ref().map(|e| format!(": {e}")).unwrap_or_default()
}

impl Retryable for CoreError {
    fn is_retryable(&self) -> bool {
        match self {
            CoreError::Exec(e) | CoreError::UploadFailed { source: e, .. } => e.is_retryable(),
            CoreError::RemoteCommandFailed { .. } | CoreError::UnexpectedExitStatus { .. } => true,
            _ => false,
        }
    }
}
