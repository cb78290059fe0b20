//! Remote executor trait

use async_trait::async_trait;

use crate::error::ExecError;
use crate::result::{CommandResult, OutputLine};

/// Receives command output line by line while a command runs
pub type OutputObserver<'a> = &'a (dyn Fn(OutputLine) + Send + Sync);

/// A channel to the machine being provisioned.
///
/// Implementations must tolerate the target disappearing (rebooting) between
/// calls: a call made while the machine is down returns an error, and a later
/// call is expected to succeed once it is back.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a command and collect its output
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError>;

    /// Run a command, passing each output line to `observer` as it arrives
    async fn run_streaming(
        &self,
        cmd: &str,
        observer: OutputObserver<'_>,
    ) -> Result<CommandResult, ExecError> {
        let result = self.run(cmd).await?;
        for line in result.output_lines() {
            observer(line);
        }
        Ok(result)
    }

    /// Write `content` to `destination` on the target, replacing any existing file
    async fn upload(&self, destination: &str, content: &[u8]) -> Result<(), ExecError>;

    fn executor_type(&self) -> &'static str;
}
