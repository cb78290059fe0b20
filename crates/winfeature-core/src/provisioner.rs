//! `Provisioner`: installs features and drives the reboot cycle
//!
//! One run walks the session state machine:
//! upload -> install -> [restart -> wait for availability -> check]* -> done.
//! Every remote call goes through a [`RetryPolicy`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use winfeature_exec::{CommandResult, OutputLine, RemoteExecutor};

use crate::config::ProvisioningConfig;
use crate::error::CoreError;
use crate::event::ProvisionEvent;
use crate::outcome::{RemoteOutcome, classify};
use crate::retry::RetryPolicy;
use crate::script::{
    ABORT_TEST_RESTART_COMMAND, ELEVATED_COMMAND, ELEVATED_PATH, ElevatedOptions,
    PENDING_REBOOT_ELEVATED_COMMAND, PENDING_REBOOT_ELEVATED_PATH, RESTART_COMMAND,
    ScriptTemplates, TEST_RESTART_COMMAND, WINDOWS_FEATURE_PATH,
};
use crate::state::{Phase, Session, Step};

/// Pause between attempts of any remote operation
pub const RETRYABLE_DELAY: Duration = Duration::from_secs(5);

/// Budget for each script upload
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Attempts allowed for the install command
pub const INSTALL_TRIES: u32 = 5;

/// Summary of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    /// Restarts issued during the run
    pub restarts: u32,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

/// Provisions one target over an exclusively owned executor
pub struct Provisioner {
    config: ProvisioningConfig,
    templates: ScriptTemplates,
    executor: Arc<dyn RemoteExecutor>,
    event_tx: broadcast::Sender<ProvisionEvent>,
}

impl Provisioner {
    /// Create a provisioner; `config` is normalized and validated here
    ///
    /// # Errors
    /// Returns `CoreError::ConfigError` if the normalized config is invalid.
    pub fn new(
        config: ProvisioningConfig,
        templates: ScriptTemplates,
        executor: Arc<dyn RemoteExecutor>,
        event_tx: broadcast::Sender<ProvisionEvent>,
    ) -> Result<Self, CoreError> {
        let config = config.normalize();
        config.validate()?;

        Ok(Self {
            config,
            templates,
            executor,
            event_tx,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ProvisioningConfig {
        &self.config
    }

    /// Get a receiver for progress events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProvisionEvent> {
        self.event_tx.subscribe()
    }

    /// Run the whole provisioning state machine.
    ///
    /// Nothing on the target is cleaned up if the run fails.
    ///
    /// # Errors
    /// Returns the error that moved the session to `Failed`, including
    /// `CoreError::Cancelled` once `cancel` fires.
    #[instrument(skip_all, fields(executor = self.executor.executor_type()))]
    pub async fn provision(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ProvisionReport, CoreError> {
        let mut session = Session::new();
        let mut failure = None;

        info!(
            username = %self.config.username,
            features = ?self.config.features,
            capabilities = ?self.config.capabilities,
            restart_timeout = ?self.config.restart_timeout,
            "starting provisioning run"
        );

        loop {
            let phase = session.phase();
            let result = match phase {
                Phase::Uploading => self.upload_scripts(cancel).await.map(|()| Step::Uploaded),
                Phase::Installing => self
                    .install(cancel)
                    .await
                    .map(|outcome| Step::Classified { outcome }),
                Phase::Restarting => self.restart(cancel).await.map(|()| Step::RestartIssued),
                Phase::WaitingForAvailability => self
                    .wait_for_availability(cancel)
                    .await
                    .map(|()| Step::Available),
                Phase::CheckingRebootPending => self
                    .check_reboot_pending(cancel)
                    .await
                    .map(|outcome| Step::Classified { outcome }),
                Phase::Done => {
                    let report = ProvisionReport {
                        restarts: session.restarts(),
                        started_at: session.started_at(),
                        elapsed: session.elapsed(),
                    };
                    info!(restarts = report.restarts, elapsed = ?report.elapsed, "provisioning complete");
                    self.emit(ProvisionEvent::Finished {
                        restarts: report.restarts,
                    });
                    return Ok(report);
                }
                Phase::Failed => {
                    return Err(failure.unwrap_or_else(|| CoreError::InvalidTransition {
                        from: phase,
                        step: Step::Aborted,
                    }));
                }
            };

            match result {
                Ok(step) => {
                    self.advance(&mut session, step)?;
                    if phase == Phase::CheckingRebootPending {
                        self.report_pending(&session);
                    }
                }
                Err(e) => {
                    self.advance(&mut session, Step::Aborted)?;
                    failure = Some(self.failed(phase, e));
                }
            }
        }
    }

    fn report_pending(&self, session: &Session) {
        if session
            .last_outcome()
            .is_some_and(|outcome| outcome.is_reboot_pending())
        {
            self.say("Restart is still pending...");
            self.emit(ProvisionEvent::RestartPending {
                restarts: session.restarts(),
            });
        } else {
            self.say("Restart complete");
            self.emit(ProvisionEvent::RestartComplete {
                restarts: session.restarts(),
            });
        }
    }

    fn failed(&self, phase: Phase, error: CoreError) -> CoreError {
        error!(phase = %phase, error = %error, "provisioning failed");
        self.emit(ProvisionEvent::Failed {
            phase,
            error: error.to_string(),
        });
        error
    }

    /// Render and upload both elevated wrappers and the payload script
    ///
    /// # Errors
    /// Returns `CoreError::Template` for a broken template, otherwise the
    /// upload error once `UPLOAD_TIMEOUT` is spent.
    pub async fn upload_scripts(&self, cancel: &CancellationToken) -> Result<(), CoreError> {
        self.say("Uploading the Windows feature elevated script...");
        let install = ElevatedOptions::install(
            &self.config.username,
            &self.config.password,
            &self.config.features,
            &self.config.capabilities,
        );
        let script = install.render(self.templates.elevated())?;
        self.upload("elevated script", ELEVATED_PATH, script.as_bytes(), cancel)
            .await?;

        self.say("Uploading the Windows feature check for reboot required elevated script...");
        let check = ElevatedOptions::pending_reboot_check(&self.config.username, &self.config.password);
        let script = check.render(self.templates.elevated())?;
        self.upload(
            "check for reboot required elevated script",
            PENDING_REBOOT_ELEVATED_PATH,
            script.as_bytes(),
            cancel,
        )
        .await?;

        self.say("Uploading the Windows feature script...");
        self.upload(
            "feature script",
            WINDOWS_FEATURE_PATH,
            self.templates.payload(),
            cancel,
        )
        .await
    }

    async fn upload(
        &self,
        what: &'static str,
        path: &'static str,
        content: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        RetryPolicy::with_start_timeout(RETRYABLE_DELAY, UPLOAD_TIMEOUT)
            .run(cancel, move |_| async move {
                self.executor
                    .upload(path, content)
                    .await
                    .map_err(|source| CoreError::UploadFailed { what, path, source })
            })
            .await
            .map_err(|e| CoreError::from_retry(Phase::Uploading, e))?;

        debug!(path, bytes = content.len(), "uploaded {what}");
        Ok(())
    }

    /// Run the elevated install and classify its exit status.
    ///
    /// Any status other than 0 or 101 counts as a failed attempt, so a
    /// deterministic bad status is retried `INSTALL_TRIES` times.
    ///
    /// # Errors
    /// Returns `CoreError::RetriesExhausted` once every attempt failed.
    pub async fn install(&self, cancel: &CancellationToken) -> Result<RemoteOutcome, CoreError> {
        self.say("Running Windows Feature and Capability install...");
        RetryPolicy::with_max_tries(RETRYABLE_DELAY, INSTALL_TRIES)
            .run(cancel, move |_| async move {
                let result = self.run_command(ELEVATED_COMMAND).await?;
                Self::classified(Phase::Installing, &result)
            })
            .await
            .map_err(|e| CoreError::from_retry(Phase::Installing, e))
    }

    /// Ask the target to restart now
    ///
    /// # Errors
    /// Returns `CoreError::Timeout` if no attempt succeeded within the
    /// restart timeout.
    pub async fn restart(&self, cancel: &CancellationToken) -> Result<(), CoreError> {
        self.say("Restarting the machine...");
        self.restart_policy()
            .run(cancel, move |_| async move {
                let result = self.run_command(RESTART_COMMAND).await?;
                Self::require_success(RESTART_COMMAND, &result)
            })
            .await
            .map_err(|e| CoreError::from_retry(Phase::Restarting, e))
    }

    /// Probe until the target accepts commands again.
    ///
    /// The probe schedules a delayed restart and immediately aborts it; being
    /// able to do both means the machine is back.
    ///
    /// # Errors
    /// Returns `CoreError::Timeout` if the target stays unreachable for the
    /// whole restart timeout.
    pub async fn wait_for_availability(&self, cancel: &CancellationToken) -> Result<(), CoreError> {
        self.say("Waiting for machine to become available...");
        self.restart_policy()
            .run(cancel, move |_| async move {
                let result = self.run_command(TEST_RESTART_COMMAND).await?;
                if !result.success() {
                    debug!(status = result.status, "machine not yet available");
                    return Err(CoreError::RemoteCommandFailed {
                        command: TEST_RESTART_COMMAND.to_string(),
                        status: result.status,
                    });
                }

                let abort = self.run_command(ABORT_TEST_RESTART_COMMAND).await?;
                if !abort.success() {
                    warn!(status = abort.status, "aborting the test restart failed");
                }
                Ok(())
            })
            .await
            .map_err(|e| CoreError::from_retry(Phase::WaitingForAvailability, e))
    }

    /// Run the elevated pending-reboot check and classify its exit status
    ///
    /// # Errors
    /// Returns `CoreError::Timeout` if no attempt produced 0 or 101 within the
    /// restart timeout.
    pub async fn check_reboot_pending(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RemoteOutcome, CoreError> {
        self.say("Checking for pending restart...");
        self.restart_policy()
            .run(cancel, move |_| async move {
                let result = self.run_command(PENDING_REBOOT_ELEVATED_COMMAND).await?;
                Self::classified(Phase::CheckingRebootPending, &result)
            })
            .await
            .map_err(|e| CoreError::from_retry(Phase::CheckingRebootPending, e))
    }

    fn restart_policy(&self) -> RetryPolicy {
        RetryPolicy::with_start_timeout(RETRYABLE_DELAY, self.config.restart_timeout)
    }

    fn classified(phase: Phase, result: &CommandResult) -> Result<RemoteOutcome, CoreError> {
        match classify(result.status) {
            RemoteOutcome::Failed { status } => {
                Err(CoreError::UnexpectedExitStatus { phase, status })
            }
            outcome => Ok(outcome),
        }
    }

    fn require_success(command: &str, result: &CommandResult) -> Result<(), CoreError> {
        if result.success() {
            Ok(())
        } else {
            Err(CoreError::RemoteCommandFailed {
                command: command.to_string(),
                status: result.status,
            })
        }
    }

    /// Run a command, relaying its output as events
    async fn run_command(&self, cmd: &str) -> Result<CommandResult, CoreError> {
        let observer = |line: OutputLine| {
            debug!(stream = %line.stream, "{}", line.line);
            self.emit(ProvisionEvent::Output { line });
        };
        Ok(self.executor.run_streaming(cmd, &observer).await?)
    }

    fn advance(&self, session: &mut Session, step: Step) -> Result<(), CoreError> {
        let (from, to) = session.advance(step)?;

        info!(from = %from, to = %to, "phase transition");
        self.emit(ProvisionEvent::PhaseChanged { from, to });
        Ok(())
    }

    fn say(&self, text: &str) {
        info!("{text}");
        self.emit(ProvisionEvent::Message {
            text: text.to_string(),
        });
    }

    fn emit(&self, event: ProvisionEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}
