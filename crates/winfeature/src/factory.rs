//! Executor factory for the configured target

use std::sync::Arc;

use eyre::Result;
use winfeature_exec::{ConnectionInfo, LocalExecutor, RemoteExecutor, SshExecutor};

use crate::config::ConnectionConfig;

/// Create the executor for a target: local for localhost, SSH otherwise
///
/// # Errors
/// Returns error if no SSH credentials are configured or they cannot be
/// resolved
pub fn create_executor(config: &ConnectionConfig) -> Result<Arc<dyn RemoteExecutor>> {
    if config.is_local() {
        return Ok(Arc::new(LocalExecutor::new()));
    }

    let credentials = config.credentials().ok_or_else(|| {
        eyre::eyre!(
            "no SSH credentials for {}: set password, password_env, ssh_key or key_env",
            config.host
        )
    })?;

    let conn_info = ConnectionInfo::new(&config.host, &config.user)
        .with_port(config.port)
        .with_connect_timeout(config.connect_timeout());
    let executor = SshExecutor::new(conn_info, &credentials)
        .map_err(|e| eyre::eyre!("failed to create SSH executor: {e}"))?;
    Ok(Arc::new(executor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_localhost_executor_creation() {
        let config = ConnectionConfig {
            host: "127.0.0.1".to_string(),
            ..Default::default()
        };

        let executor = create_executor(&config).unwrap();
        assert_eq!(executor.executor_type(), "local");
    }

    #[test]
    fn test_remote_requires_credentials() {
        let config = ConnectionConfig {
            host: "win2022".to_string(),
            user: "Administrator".to_string(),
            ..Default::default()
        };

        let err = create_executor(&config).err().unwrap();
        assert!(err.to_string().contains("no SSH credentials"));
    }

    #[test]
    fn test_remote_password_executor_creation() {
        let config = ConnectionConfig {
            host: "win2022".to_string(),
            user: "Administrator".to_string(),
            password: Some("vagrant".to_string()),
            ..Default::default()
        };

        let executor = create_executor(&config).unwrap();
        assert_eq!(executor.executor_type(), "ssh");
    }
}
