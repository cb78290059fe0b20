//! Provisioning session state machine

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::CoreError;
use crate::outcome::RemoteOutcome;

/// Phases of a provisioning run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Uploading,
    Installing,
    CheckingRebootPending,
    Restarting,
    WaitingForAvailability,
    Done,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Uploading => "uploading",
            Phase::Installing => "installing",
            Phase::CheckingRebootPending => "checking_reboot_pending",
            Phase::Restarting => "restarting",
            Phase::WaitingForAvailability => "waiting_for_availability",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What finishing the work of a phase produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// All scripts are on the target
    Uploaded,
    /// The install or pending-reboot script reported an outcome
    Classified { outcome: RemoteOutcome },
    /// The restart command was accepted
    RestartIssued,
    /// The target answered the availability probe
    Available,
    /// The phase failed for good
    Aborted,
}

impl Phase {
    /// Whether the run is over
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }

    /// Pure transition function.
    ///
    /// Restarting is only reachable from a `RebootPending` classification and
    /// `Done` only from a `Success` classification.
    ///
    /// # Errors
    /// Returns `CoreError::InvalidTransition` for a step the phase cannot take.
    pub fn next(self, step: Step) -> Result<Phase, CoreError> {
        use RemoteOutcome::{Failed, RebootPending, Success};

        let next = match (self, step) {
            (phase, Step::Aborted) if !phase.is_terminal() => Phase::Failed,
            (Phase::Uploading, Step::Uploaded) => Phase::Installing,
            (Phase::Installing | Phase::CheckingRebootPending, Step::Classified { outcome }) => {
                match outcome {
                    Success => Phase::Done,
                    RebootPending => Phase::Restarting,
                    Failed { .. } => Phase::Failed,
                }
            }
            (Phase::Restarting, Step::RestartIssued) => Phase::WaitingForAvailability,
            (Phase::WaitingForAvailability, Step::Available) => Phase::CheckingRebootPending,
            (from, step) => return Err(CoreError::InvalidTransition { from, step }),
        };
        Ok(next)
    }
}

/// Ephemeral state of one provisioning run
#[derive(Debug, Clone)]
pub struct Session {
    phase: Phase,
    last_outcome: Option<RemoteOutcome>,
    restarts: u32,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: Phase::Uploading,
            last_outcome: None,
            restarts: 0,
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Most recent install or pending-reboot classification
    #[must_use]
    pub fn last_outcome(&self) -> Option<RemoteOutcome> {
        self.last_outcome
    }

    /// Number of restarts issued so far
    #[must_use]
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Apply `step` and return the `(from, to)` pair
    ///
    /// # Errors
    /// Returns `CoreError::InvalidTransition` and leaves the session untouched
    /// if the step is not valid in the current phase.
    pub fn advance(&mut self, step: Step) -> Result<(Phase, Phase), CoreError> {
        let from = self.phase;
        let to = from.next(step)?;

        match step {
            Step::Classified { outcome } => self.last_outcome = Some(outcome),
            Step::RestartIssued => self.restarts += 1,
            _ => {}
        }
        self.phase = to;

        Ok((from, to))
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
