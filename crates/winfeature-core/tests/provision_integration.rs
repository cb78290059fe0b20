use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

use winfeature_core::script::{
    ABORT_TEST_RESTART_COMMAND, ELEVATED_COMMAND, ELEVATED_PATH, PENDING_REBOOT_ELEVATED_COMMAND,
    PENDING_REBOOT_ELEVATED_PATH, RESTART_COMMAND, TEST_RESTART_COMMAND, WINDOWS_FEATURE_PATH,
};
use winfeature_core::*;
use winfeature_exec::error::ExecError;
use winfeature_exec::result::{CommandResult, OutputLine, OutputStream};
use winfeature_exec::traits::{OutputObserver, RemoteExecutor};

type Reply = Result<i32, ExecError>;
type UploadReply = Result<(), ExecError>;

/// Executor that answers each command and upload from a per-target script.
///
/// Once a script is used up its last reply repeats; commands without a
/// script exit 0 and uploads without one succeed.
#[derive(Default)]
struct ScriptedExecutor {
    replies: Mutex<HashMap<&'static str, VecDeque<Reply>>>,
    upload_replies: Mutex<HashMap<&'static str, VecDeque<UploadReply>>>,
    commands: Mutex<Vec<String>>,
    upload_attempts: Mutex<Vec<String>>,
    uploads: Mutex<Vec<(String, Vec<u8>)>>,
}

impl ScriptedExecutor {
    fn with(mut self, command: &'static str, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.replies
            .get_mut()
            .unwrap()
            .insert(command, replies.into_iter().collect());
        self
    }

    fn with_upload(
        mut self,
        path: &'static str,
        replies: impl IntoIterator<Item = UploadReply>,
    ) -> Self {
        self.upload_replies
            .get_mut()
            .unwrap()
            .insert(path, replies.into_iter().collect());
        self
    }

    fn upload_attempts(&self, path: &str) -> usize {
        self.upload_attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| *p == path)
            .count()
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| *c == command).count()
    }

    fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.uploads.lock().unwrap().clone()
    }

    fn next_reply(&self, cmd: &str) -> Reply {
        next_in(&mut self.replies.lock().unwrap(), cmd, Ok(0))
    }

    fn next_upload_reply(&self, path: &str) -> UploadReply {
        next_in(&mut self.upload_replies.lock().unwrap(), path, Ok(()))
    }
}

fn next_in<T: Clone>(
    scripts: &mut HashMap<&'static str, VecDeque<T>>,
    key: &str,
    default: T,
) -> T {
    match scripts.get_mut(key) {
        Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(default),
        Some(queue) => queue.front().cloned().unwrap_or(default),
        None => default,
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.commands.lock().unwrap().push(cmd.to_string());
        let status = self.next_reply(cmd)?;
        Ok(CommandResult {
            status,
            stdout: format!("ran {cmd}\n"),
            stderr: String::new(),
            duration: Duration::from_millis(1),
        })
    }

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

    async fn upload(&self, destination: &str, content: &[u8]) -> Result<(), ExecError> {
        self.upload_attempts
            .lock()
            .unwrap()
            .push(destination.to_string());
        self.next_upload_reply(destination)?;
        self.uploads
            .lock()
            .unwrap()
            .push((destination.to_string(), content.to_vec()));
        Ok(())
    }

    fn executor_type(&self) -> &'static str {
        "scripted"
    }
}

fn config() -> ProvisioningConfig {
    ProvisioningConfig {
        username: "Administrator".to_string(),
        password: "P@ss'word".to_string(),
        restart_timeout: Duration::from_secs(600),
        features: vec!["Web-Server".to_string(), "O'Brien".to_string()],
        capabilities: vec!["OpenSSH.Server~~~~0.0.1.0".to_string()],
    }
}

fn provisioner(executor: Arc<ScriptedExecutor>) -> Provisioner {
    let (tx, _rx) = broadcast::channel(1024);
    Provisioner::new(config(), ScriptTemplates::builtin(), executor, tx).unwrap()
}

fn connection_refused() -> Reply {
    Err(ExecError::ConnectionFailed("refused".into()))
}

fn connection_reset(path: &str) -> UploadReply {
    Err(ExecError::UploadFailed {
        path: path.to_string(),
        message: "connection reset".to_string(),
    })
}

fn login_rejected() -> ExecError {
    ExecError::AuthenticationFailed("win2022 rejected credentials for Administrator".into())
}

#[tokio::test(start_paused = true)]
async fn test_install_success_needs_no_restart() {
    let executor = Arc::new(ScriptedExecutor::default().with(ELEVATED_COMMAND, [Ok(0)]));
    let provisioner = provisioner(executor.clone());

    let report = provisioner
        .provision(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.restarts, 0);
    assert_eq!(executor.commands(), vec![ELEVATED_COMMAND.to_string()]);

    let paths: Vec<_> = executor.uploads().into_iter().map(|(p, _)| p).collect();
    assert_eq!(
        paths,
        vec![ELEVATED_PATH, PENDING_REBOOT_ELEVATED_PATH, WINDOWS_FEATURE_PATH]
    );
}

#[tokio::test(start_paused = true)]
async fn test_uploads_rendered_scripts() {
    let executor = Arc::new(ScriptedExecutor::default());
    let provisioner = provisioner(executor.clone());

    provisioner
        .upload_scripts(&CancellationToken::new())
        .await
        .unwrap();

    let uploads = executor.uploads();
    let install = String::from_utf8(uploads[0].1.clone()).unwrap();
    let check = String::from_utf8(uploads[1].1.clone()).unwrap();

    assert!(!install.contains("{{"));
    assert!(install.contains("$username = 'Administrator'"));
    assert!(install.contains("$password = 'P@ss''word'"));
    assert!(install.contains("$taskName = 'packer-windows-feature-"));
    assert!(install.contains("-EncodedCommand"));
    assert!(check.contains("$taskName = 'packer-windows-feature-pending-reboot-"));
    assert_eq!(uploads[2].1, ScriptTemplates::builtin().payload());
}

#[tokio::test(start_paused = true)]
async fn test_one_restart_cycle() {
    let executor = Arc::new(
        ScriptedExecutor::default()
            .with(ELEVATED_COMMAND, [Ok(101)])
            .with(RESTART_COMMAND, [Ok(0)])
            .with(TEST_RESTART_COMMAND, [Ok(0)])
            .with(PENDING_REBOOT_ELEVATED_COMMAND, [Ok(0)]),
    );
    let provisioner = provisioner(executor.clone());

    let report = provisioner
        .provision(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.restarts, 1);
    assert_eq!(
        executor.commands(),
        vec![
            ELEVATED_COMMAND,
            RESTART_COMMAND,
            TEST_RESTART_COMMAND,
            ABORT_TEST_RESTART_COMMAND,
            PENDING_REBOOT_ELEVATED_COMMAND,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_restart_repeats_while_reboot_pending() {
    let executor = Arc::new(
        ScriptedExecutor::default()
            .with(ELEVATED_COMMAND, [Ok(101)])
            .with(PENDING_REBOOT_ELEVATED_COMMAND, [Ok(101), Ok(101), Ok(0)]),
    );
    let provisioner = provisioner(executor.clone());

    let report = provisioner
        .provision(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.restarts, 3);
    assert_eq!(executor.count(RESTART_COMMAND), 3);
    assert_eq!(executor.count(PENDING_REBOOT_ELEVATED_COMMAND), 3);
    assert_eq!(executor.count(ELEVATED_COMMAND), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_install_status_exhausts_budget() {
    let executor = Arc::new(ScriptedExecutor::default().with(ELEVATED_COMMAND, [Ok(7)]));
    let provisioner = provisioner(executor.clone());

    let err = provisioner
        .provision(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CoreError::RetriesExhausted {
            phase: Phase::Installing,
            attempts: 5,
            ..
        }
    ));
    assert_eq!(err.exit_status(), Some(7));
    assert_eq!(executor.count(ELEVATED_COMMAND), 5);
    assert_eq!(executor.count(RESTART_COMMAND), 0);
}

#[tokio::test(start_paused = true)]
async fn test_install_recovers_from_transient_failures() {
    let executor = Arc::new(
        ScriptedExecutor::default().with(ELEVATED_COMMAND, [Ok(1), connection_refused(), Ok(0)]),
    );
    let provisioner = provisioner(executor.clone());

    provisioner
        .provision(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(executor.count(ELEVATED_COMMAND), 3);
}

#[tokio::test(start_paused = true)]
async fn test_waits_for_machine_to_come_back() {
    let executor = Arc::new(
        ScriptedExecutor::default()
            .with(ELEVATED_COMMAND, [Ok(101)])
            .with(
                TEST_RESTART_COMMAND,
                [connection_refused(), connection_refused(), Ok(1115), Ok(0)],
            ),
    );
    let provisioner = provisioner(executor.clone());
    let start = Instant::now();

    let report = provisioner
        .provision(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.restarts, 1);
    assert_eq!(executor.count(TEST_RESTART_COMMAND), 4);
    assert_eq!(executor.count(ABORT_TEST_RESTART_COMMAND), 1);
    assert!(start.elapsed() >= RETRYABLE_DELAY * 3);
}

#[tokio::test(start_paused = true)]
async fn test_restart_timeout_is_fatal() {
    let executor = Arc::new(
        ScriptedExecutor::default()
            .with(ELEVATED_COMMAND, [Ok(101)])
            .with(TEST_RESTART_COMMAND, [connection_refused()]),
    );
    let provisioner = provisioner(executor.clone());
    let start = Instant::now();

    let err = provisioner
        .provision(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CoreError::Timeout {
            phase: Phase::WaitingForAvailability,
            last: Some(_),
            ..
        }
    ));
    assert!(start.elapsed() <= Duration::from_secs(600) + RETRYABLE_DELAY);
    assert_eq!(executor.count(PENDING_REBOOT_ELEVATED_COMMAND), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_remote_commands() {
    let executor = Arc::new(
        ScriptedExecutor::default()
            .with(ELEVATED_COMMAND, [Ok(101)])
            .with(TEST_RESTART_COMMAND, [connection_refused()]),
    );
    let provisioner = provisioner(executor.clone());
    let token = CancellationToken::new();

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(32)).await;
        canceller.cancel();
    });

    let err = provisioner.provision(&token).await.unwrap_err();

    assert!(matches!(
        err,
        CoreError::Cancelled {
            phase: Phase::WaitingForAvailability
        }
    ));
    assert!(err.is_cancelled());
    // probes at 0s, 5s, ... 30s; nothing after the cancel at 32s
    assert_eq!(executor.count(TEST_RESTART_COMMAND), 7);
    assert_eq!(executor.count(PENDING_REBOOT_ELEVATED_COMMAND), 0);
}

#[tokio::test(start_paused = true)]
async fn test_payload_upload_retried_until_it_succeeds() {
    let executor = Arc::new(ScriptedExecutor::default().with_upload(
        WINDOWS_FEATURE_PATH,
        [
            connection_reset(WINDOWS_FEATURE_PATH),
            connection_reset(WINDOWS_FEATURE_PATH),
            Ok(()),
        ],
    ));
    let provisioner = provisioner(executor.clone());

    provisioner
        .provision(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(executor.uploads().len(), 3);
    assert_eq!(executor.upload_attempts(WINDOWS_FEATURE_PATH), 3);
    assert_eq!(executor.upload_attempts(ELEVATED_PATH), 1);
    assert_eq!(executor.count(ELEVATED_COMMAND), 1);
}

#[tokio::test(start_paused = true)]
async fn test_upload_timeout_is_fatal() {
    let executor = Arc::new(
        ScriptedExecutor::default().with_upload(ELEVATED_PATH, [connection_reset(ELEVATED_PATH)]),
    );
    let provisioner = provisioner(executor.clone());
    let start = Instant::now();

    let err = provisioner
        .provision(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CoreError::Timeout {
            phase: Phase::Uploading,
            last: Some(_),
            ..
        }
    ));
    assert!(start.elapsed() >= UPLOAD_TIMEOUT);
    assert!(start.elapsed() <= UPLOAD_TIMEOUT + RETRYABLE_DELAY);
    assert!(executor.upload_attempts(ELEVATED_PATH) > 1);
    assert!(executor.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_login_aborts_upload() {
    let executor = Arc::new(
        ScriptedExecutor::default().with_upload(ELEVATED_PATH, [Err(login_rejected())]),
    );
    let provisioner = provisioner(executor.clone());

    let err = provisioner
        .provision(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CoreError::UploadFailed {
            source: ExecError::AuthenticationFailed(_),
            ..
        }
    ));
    assert_eq!(executor.upload_attempts(ELEVATED_PATH), 1);
    assert!(executor.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_install_error_aborts() {
    let executor =
        Arc::new(ScriptedExecutor::default().with(ELEVATED_COMMAND, [Err(login_rejected())]));
    let provisioner = provisioner(executor.clone());

    let err = provisioner
        .provision(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CoreError::Exec(ExecError::AuthenticationFailed(_))
    ));
    assert_eq!(executor.count(ELEVATED_COMMAND), 1);
    assert_eq!(executor.count(RESTART_COMMAND), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_pending_check_status_times_out() {
    let executor = Arc::new(
        ScriptedExecutor::default()
            .with(ELEVATED_COMMAND, [Ok(101)])
            .with(PENDING_REBOOT_ELEVATED_COMMAND, [Ok(3)]),
    );
    let provisioner = provisioner(executor.clone());

    let err = provisioner
        .provision(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CoreError::Timeout {
            phase: Phase::CheckingRebootPending,
            ..
        }
    ));
    assert_eq!(err.exit_status(), Some(3));
    assert!(executor.count(PENDING_REBOOT_ELEVATED_COMMAND) > 1);
    assert_eq!(executor.count(RESTART_COMMAND), 1);
}

#[tokio::test(start_paused = true)]
async fn test_events_follow_phase_transitions() {
    let executor = Arc::new(
        ScriptedExecutor::default()
            .with(ELEVATED_COMMAND, [Ok(101)])
            .with(PENDING_REBOOT_ELEVATED_COMMAND, [Ok(0)]),
    );
    let provisioner = provisioner(executor);
    let mut rx = provisioner.subscribe();

    provisioner
        .provision(&CancellationToken::new())
        .await
        .unwrap();

    let mut transitions = Vec::new();
    let mut output = Vec::new();
    let mut restart_complete = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            ProvisionEvent::PhaseChanged { from, to } => transitions.push((from, to)),
            ProvisionEvent::Output { line } => output.push(line),
            ProvisionEvent::RestartComplete { restarts } => {
                restart_complete = true;
                assert_eq!(restarts, 1);
            }
            _ => {}
        }
    }

    assert_eq!(
        transitions,
        vec![
            (Phase::Uploading, Phase::Installing),
            (Phase::Installing, Phase::Restarting),
            (Phase::Restarting, Phase::WaitingForAvailability),
            (Phase::WaitingForAvailability, Phase::CheckingRebootPending),
            (Phase::CheckingRebootPending, Phase::Done),
        ]
    );
    assert!(restart_complete);
    assert!(output.contains(&OutputLine::new(
        OutputStream::Stdout,
        format!("ran {RESTART_COMMAND}")
    )));
}

#[test]
fn test_invalid_config_rejected() {
    let (tx, _rx) = broadcast::channel(16);
    let config = ProvisioningConfig {
        features: vec![String::new()],
        ..ProvisioningConfig::default()
    };

    let result = Provisioner::new(
        config,
        ScriptTemplates::builtin(),
        Arc::new(ScriptedExecutor::default()),
        tx,
    );
    assert!(matches!(result, Err(CoreError::ConfigError(_))));
}
