//! Progress events broadcast while provisioning

use serde::{Deserialize, Serialize};
use winfeature_exec::OutputLine;

use crate::state::Phase;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProvisionEvent {
    PhaseChanged {
        from: Phase,
        to: Phase,
    },
    /// Human readable progress message
    Message {
        text: String,
    },
    /// Output from a remote command
    Output {
        line: OutputLine,
    },
    RestartPending {
        restarts: u32,
    },
    RestartComplete {
        restarts: u32,
    },
    Finished {
        restarts: u32,
    },
    Failed {
        phase: Phase,
        error: String,
    },
}
