//! Local command execution using `tokio::process`

use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::error::ExecError;
use crate::result::{CommandResult, OutputLine, OutputStream};
use crate::traits::{OutputObserver, RemoteExecutor};

/// Local command executor
///
/// Provisions the machine the process runs on. Commands go through the
/// platform shell so the fixed PowerShell/shutdown command lines work as-is.
#[derive(Debug, Clone)]
pub struct LocalExecutor;

impl LocalExecutor {
    /// Create a new local executor
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[cfg(windows)]
    fn shell(cmd: &str) -> Command {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(cmd);
        command
    }

    #[cfg(not(windows))]
    fn shell(cmd: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd);
        command
    }

    /// Internal method to execute command
    #[instrument(skip(self, observer), level = "debug")]
    async fn execute(
        &self,
        cmd: &str,
        observer: Option<OutputObserver<'_>>,
    ) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        debug!(command = %cmd, "executing local command");

        let mut child = Self::shell(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::IoError("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecError::IoError("stderr not captured".to_string()))?;

        let (stdout, stderr) = tokio::join!(
            collect_lines(stdout, OutputStream::Stdout, observer),
            collect_lines(stderr, OutputStream::Stderr, observer),
        );
        let stdout = stdout.map_err(|e| ExecError::IoError(e.to_string()))?;
        let stderr = stderr.map_err(|e| ExecError::IoError(e.to_string()))?;

        let exit = child
            .wait()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let duration = start.elapsed();
        let status = exit.code().unwrap_or(-1);

        // Non-zero is routine here (101, probes during a reboot); callers decide.
        debug!(
            command = %cmd,
            status = status,
            duration = ?duration,
            stderr = %stderr.trim(),
            "command completed"
        );

        Ok(CommandResult {
            status,
            stdout,
            stderr,
            duration,
        })
    }
}

async fn collect_lines<R>(
    reader: R,
    stream: OutputStream,
    observer: Option<OutputObserver<'_>>,
) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut collected = String::new();

    while let Some(line) = lines.next_line().await? {
        collected.push_str(&line);
        collected.push('\n');
        if let Some(observer) = observer {
            observer(OutputLine::new(stream, line));
        }
    }

    Ok(collected)
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    #[instrument(skip(self), level = "debug")]
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.execute(cmd, None).await
    }

    #[instrument(skip(self, observer), level = "debug")]
    async fn run_streaming(
        &self,
        cmd: &str,
        observer: OutputObserver<'_>,
    ) -> Result<CommandResult, ExecError> {
        self.execute(cmd, Some(observer)).await
    }

    #[instrument(skip(self, content), fields(bytes = content.len()), level = "debug")]
    async fn upload(&self, destination: &str, content: &[u8]) -> Result<(), ExecError> {
        let upload_err = |e: std::io::Error| ExecError::UploadFailed {
            path: destination.to_string(),
            message: e.to_string(),
        };

        if let Some(parent) = Path::new(destination).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(upload_err)?;
        }
        tokio::fs::write(destination, content)
            .await
            .map_err(upload_err)?;

        debug!(path = %destination, "file written");
        Ok(())
    }

    fn executor_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    use tracing_subscriber::fmt::MakeWriter;

    use super::*;

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn test_run_success() {
        let executor = LocalExecutor::new();
        let result = executor.run("echo hello").await.unwrap();

        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_reports_exit_status() {
        let executor = LocalExecutor::new();
        let result = executor.run("exit 101").await.unwrap();

        assert!(!result.success());
        assert_eq!(result.status, 101);
    }

    #[tokio::test]
    async fn test_nonzero_exit_logged_below_warn() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let result = LocalExecutor::new().run("exit 101").await.unwrap();

        assert_eq!(result.status, 101);
        assert!(logs.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_streaming_observes_both_streams() {
        let executor = LocalExecutor::new();
        let seen = Mutex::new(Vec::new());
        let observer = |line: OutputLine| seen.lock().unwrap().push(line);

        let result = executor
            .run_streaming("echo first; echo second; echo problem >&2", &observer)
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.stderr.trim(), "problem");

        let seen = seen.into_inner().unwrap();
        let stdout: Vec<_> = seen
            .iter()
            .filter(|l| l.stream == OutputStream::Stdout)
            .map(|l| l.line.as_str())
            .collect();
        assert_eq!(stdout, vec!["first", "second"]);
        assert!(seen.contains(&OutputLine::new(OutputStream::Stderr, "problem")));
    }

    #[tokio::test]
    async fn test_upload_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("Windows/Temp/script.ps1");
        let destination = destination.to_str().unwrap();

        let executor = LocalExecutor::new();
        executor.upload(destination, b"exit 0").await.unwrap();
        executor.upload(destination, b"exit 101").await.unwrap();

        let written = std::fs::read_to_string(destination).unwrap();
        assert_eq!(written, "exit 101");
    }
}
