//! winfeature-exec: Remote execution channel
//!
//! Provides the `RemoteExecutor` trait used by the provisioner, plus local and
//! SSH implementations that can run commands and upload files.

pub mod auth;
pub mod error;
pub mod local;
pub mod result;
pub mod ssh;
pub mod traits;

pub use auth::{Credentials, ResolvedCredentials};
pub use error::ExecError;
pub use local::LocalExecutor;
pub use result::{CommandResult, ConnectionInfo, OutputLine, OutputStream};
pub use ssh::SshExecutor;
pub use traits::{OutputObserver, RemoteExecutor};
