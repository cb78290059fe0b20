//! Terminal rendering of provisioning events

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;
use winfeature_core::ProvisionEvent;

/// Print events until the channel closes
pub async fn print_events(mut rx: broadcast::Receiver<ProvisionEvent>, json: bool) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let line = if json {
                    serde_json::to_string(&event).ok()
                } else {
                    render(&event)
                };
                if let Some(line) = line {
                    println!("{line}");
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "progress output fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Human readable line for an event; phase changes only go to the log
pub fn render(event: &ProvisionEvent) -> Option<String> {
    match event {
        ProvisionEvent::PhaseChanged { .. } => None,
        ProvisionEvent::Message { text } => Some(text.clone()),
        ProvisionEvent::Output { line } => Some(format!("    {}", line.line)),
        ProvisionEvent::RestartPending { restarts } => {
            Some(format!("Reboot still pending after {restarts} restart(s)"))
        }
        ProvisionEvent::RestartComplete { restarts } => {
            Some(format!("No reboot pending after {restarts} restart(s)"))
        }
        ProvisionEvent::Finished { restarts } => {
            Some(format!("Windows features installed ({restarts} restart(s))"))
        }
        ProvisionEvent::Failed { phase, error } => Some(format!("Failed while {phase}: {error}")),
    }
}
