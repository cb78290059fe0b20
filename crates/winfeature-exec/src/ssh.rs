//! SSH command execution using russh crate

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use russh::keys::ssh_key;
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh::{ChannelMsg, client};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::auth::{Credentials, ResolvedCredentials};
use crate::error::ExecError;
use crate::result::{CommandResult, ConnectionInfo, OutputLine, OutputStream};
use crate::traits::{OutputObserver, RemoteExecutor};

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Build machines are recreated constantly, so there is no stable
        // known_hosts entry to check against.
        debug!(
            fingerprint = %server_public_key.fingerprint(Default::default()),
            "accepting server key"
        );
        Ok(true)
    }
}

/// SSH command executor
///
/// Holds one SSH session to the target. The session is opened on first use
/// and dropped whenever a command fails at the transport level, so the next
/// call reconnects. That is what lets the provisioner keep using the same
/// executor across reboots.
pub struct SshExecutor {
    /// Connection configuration
    conn_info: ConnectionInfo,
    /// Resolved login credentials
    credentials: ResolvedCredentials,
    /// SSH session (initialized on first use)
    session: Mutex<Option<client::Handle<SshClientHandler>>>,
}

impl std::fmt::Debug for SshExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshExecutor")
            .field("conn_info", &self.conn_info)
            .field("credentials", &self.credentials)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl SshExecutor {
    /// Create a new SSH executor
    ///
    /// # Errors
    /// Returns `ExecError::Credentials` if credential resolution fails
    pub fn new(conn_info: ConnectionInfo, credentials: &Credentials) -> Result<Self, ExecError> {
        let credentials = credentials.resolve()?;

        Ok(Self {
            conn_info,
            credentials,
            session: Mutex::new(None),
        })
    }

    /// Whether a session is open; only a snapshot, the session may be dead
    /// until the next call notices.
    fn is_connected(&self) -> bool {
        self.session
            .try_lock()
            .map(|s| s.as_ref().is_some_and(|h| !h.is_closed()))
            .unwrap_or(false)
    }

    /// Open and authenticate a new session
    async fn open_session(&self) -> Result<client::Handle<SshClientHandler>, ExecError> {
        info!(
            host = %self.conn_info.host,
            port = self.conn_info.port,
            user = %self.conn_info.user,
            "connecting to SSH"
        );

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        });

        let connect = client::connect(
            config,
            (&self.conn_info.host[..], self.conn_info.port),
            SshClientHandler,
        );
        let mut session = timeout(self.conn_info.connect_timeout, connect)
            .await
            .map_err(|_| {
                ExecError::ConnectionFailed(format!(
                    "no answer within {:?}",
                    self.conn_info.connect_timeout
                ))
            })?
            .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;

        let authenticated = if let Some(password) = self.credentials.password() {
            session
                .authenticate_password(&self.conn_info.user, password)
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?
                .success()
        } else if let Some(key_path) = self.credentials.key_path() {
            let key_pair = load_secret_key(key_path, None)
                .map_err(|e| ExecError::Credentials(e.to_string()))?;

            let hash_alg = session
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();
            session
                .authenticate_publickey(
                    &self.conn_info.user,
                    PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
                )
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?
                .success()
        } else {
            return Err(ExecError::AuthenticationFailed(
                "no authentication method available".to_string(),
            ));
        };

        if !authenticated {
            return Err(ExecError::AuthenticationFailed(format!(
                "{} rejected credentials for {}",
                self.conn_info.host, self.conn_info.user
            )));
        }

        info!(host = %self.conn_info.host, "SSH connected and authenticated");
        Ok(session)
    }

    /// Run `cmd` on a connected session, optionally feeding `stdin`.
    ///
    /// A transport failure drops the cached session.
    #[instrument(skip(self, stdin, observer), fields(host = %self.conn_info.host))]
    async fn execute_remote(
        &self,
        cmd: &str,
        stdin: Option<&[u8]>,
        observer: Option<OutputObserver<'_>>,
    ) -> Result<CommandResult, ExecError> {
        let mut session_lock = self.session.lock().await;

        if session_lock.as_ref().is_none_or(|s| s.is_closed()) {
            *session_lock = Some(self.open_session().await?);
        }
        let session = session_lock.as_ref().ok_or(ExecError::NotConnected)?;

        let result = run_on_session(session, cmd, stdin, observer).await;
        if let Err(e) = &result {
            warn!(host = %self.conn_info.host, error = %e, "dropping SSH session");
            *session_lock = None;
        }
        result
    }
}

async fn run_on_session(
    session: &client::Handle<SshClientHandler>,
    cmd: &str,
    stdin: Option<&[u8]>,
    observer: Option<OutputObserver<'_>>,
) -> Result<CommandResult, ExecError> {
    debug!(command = %cmd, "executing remote command");

    let start = Instant::now();

    let mut channel = session
        .channel_open_session()
        .await
        .map_err(|e| ExecError::IoError(e.to_string()))?;

    channel
        .exec(true, cmd)
        .await
        .map_err(|e| ExecError::IoError(e.to_string()))?;

    if let Some(input) = stdin {
        channel
            .data(input)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;
        channel
            .eof()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;
    }

    let mut status = None;
    let mut stdout = LineBuffer::new(OutputStream::Stdout);
    let mut stderr = LineBuffer::new(OutputStream::Stderr);

    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => stdout.push(&data, observer),
            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => stderr.push(&data, observer),
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                status = Some(exit_status.cast_signed());
            }
            Some(ChannelMsg::Close) | None => break,
            _ => {}
        }
    }

    let stdout = stdout.finish(observer);
    let stderr = stderr.finish(observer);
    let duration = start.elapsed();

    // The target went away mid-command (typically a reboot).
    let Some(status) = status else {
        return Err(ExecError::IoError(format!(
            "channel closed without exit status after {duration:?}"
        )));
    };

    debug!(
        command = %cmd,
        status = status,
        duration = ?duration,
        "remote command completed"
    );

    Ok(CommandResult {
        status,
        stdout,
        stderr,
        duration,
    })
}

/// Accumulates channel data and emits complete lines to an observer
struct LineBuffer {
    stream: OutputStream,
    collected: Vec<u8>,
    emitted: usize,
}

impl LineBuffer {
    fn new(stream: OutputStream) -> Self {
        Self {
            stream,
            collected: Vec::new(),
            emitted: 0,
        }
    }

    fn push(&mut self, data: &[u8], observer: Option<OutputObserver<'_>>) {
        self.collected.extend_from_slice(data);
        while let Some(offset) = self.collected[self.emitted..]
            .iter()
            .position(|b| *b == b'\n')
        {
            let end = self.emitted + offset;
            self.emit(self.emitted, end, observer);
            self.emitted = end + 1;
        }
    }

    fn emit(&self, start: usize, end: usize, observer: Option<OutputObserver<'_>>) {
        if let Some(observer) = observer {
            let line = String::from_utf8_lossy(&self.collected[start..end]);
            observer(OutputLine::new(
                self.stream,
                line.trim_end_matches('\r').to_string(),
            ));
        }
    }

    fn finish(self, observer: Option<OutputObserver<'_>>) -> String {
        if self.emitted < self.collected.len() {
            self.emit(self.emitted, self.collected.len(), observer);
        }
        String::from_utf8_lossy(&self.collected).to_string()
    }
}

/// Command line that writes base64 read from stdin to `destination`.
///
/// Runs under the default Windows OpenSSH shell (cmd.exe).
fn upload_command(destination: &str) -> String {
    format!(
        "powershell -NoProfile -NonInteractive -Command \"$d = [Console]::In.ReadToEnd(); \
         [IO.File]::WriteAllBytes('{}', [Convert]::FromBase64String($d.Trim()))\"",
        destination.replace('\'', "''")
    )
}

/// Attach the destination to transport errors; login and credential
/// problems pass through unchanged so they are not retried.
fn upload_failure(destination: &str, error: ExecError) -> ExecError {
    if error.is_retryable() {
        ExecError::UploadFailed {
            path: destination.to_string(),
            message: error.to_string(),
        }
    } else {
        error
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.execute_remote(cmd, None, None).await
    }

    #[instrument(skip(self, observer), fields(host = %self.conn_info.host))]
    async fn run_streaming(
        &self,
        cmd: &str,
        observer: OutputObserver<'_>,
    ) -> Result<CommandResult, ExecError> {
        self.execute_remote(cmd, None, Some(observer)).await
    }

    #[instrument(skip(self, content), fields(host = %self.conn_info.host, bytes = content.len()))]
    async fn upload(&self, destination: &str, content: &[u8]) -> Result<(), ExecError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);

        let result = self
            .execute_remote(&upload_command(destination), Some(encoded.as_bytes()), None)
            .await
            .map_err(|e| upload_failure(destination, e))?;

        if !result.success() {
            return Err(ExecError::UploadFailed {
                path: destination.to_string(),
                message: format!(
                    "writer exited with status {}: {}",
                    result.status,
                    result.stderr.trim()
                ),
            });
        }

        debug!(path = %destination, "file uploaded");
        Ok(())
    }

    fn executor_type(&self) -> &'static str {
        "ssh"
    }
}
