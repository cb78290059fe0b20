//! Exit status classification shared by the install and pending-reboot scripts

use std::fmt;

use serde::{Deserialize, Serialize};

/// Exit status meaning "done" / "no reboot pending"
pub const EXIT_SUCCESS: i32 = 0;

/// Exit status meaning "a reboot is required before work can continue"
pub const EXIT_REBOOT_PENDING: i32 = 101;

/// What a remote script reported through its exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RemoteOutcome {
    Success,
    RebootPending,
    Failed { status: i32 },
}

impl RemoteOutcome {
    /// Map a raw exit status onto an outcome
    #[must_use]
    pub fn from_exit_status(status: i32) -> Self {
        match status {
            EXIT_SUCCESS => RemoteOutcome::Success,
            EXIT_REBOOT_PENDING => RemoteOutcome::RebootPending,
            status => RemoteOutcome::Failed { status },
        }
    }

    #[must_use]
    pub fn is_reboot_pending(&self) -> bool {
        matches!(self, RemoteOutcome::RebootPending)
    }
}

/// Shorthand for [`RemoteOutcome::from_exit_status`]
#[must_use]
pub fn classify(status: i32) -> RemoteOutcome {
    RemoteOutcome::from_exit_status(status)
}

impl fmt::Display for RemoteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteOutcome::Success => f.write_str("success"),
            RemoteOutcome::RebootPending => f.write_str("reboot pending"),
            RemoteOutcome::Failed { status } => write!(f, "failed (exit status {status})"),
        }
    }
}
