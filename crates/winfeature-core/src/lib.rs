//! winfeature-core: Provisioning orchestration
//!
//! Installs Windows features and capabilities on a remote machine and keeps
//! restarting it until no reboot is pending. Contains the retry policy engine,
//! script parameterization, exit status classification and the session state
//! machine driven by the `Provisioner`.

pub mod config;
pub mod error;
pub mod event;
pub mod outcome;
pub mod provisioner;
pub mod retry;
pub mod script;
pub mod state;

pub use config::{DEFAULT_RESTART_TIMEOUT, DEFAULT_USERNAME, ProvisioningConfig};
pub use error::CoreError;
pub use event::ProvisionEvent;
pub use outcome::{EXIT_REBOOT_PENDING, EXIT_SUCCESS, RemoteOutcome, classify};
pub use provisioner::{INSTALL_TRIES, ProvisionReport, Provisioner, RETRYABLE_DELAY, UPLOAD_TIMEOUT};
pub use retry::{RetryError, RetryPolicy, Retryable};
pub use script::{ElevatedOptions, ScriptTemplates, TemplateError};
pub use state::{Phase, Session, Step};
pub use tokio_util::sync::CancellationToken;
