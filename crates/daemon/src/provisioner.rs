//! Starts game-server instances on fleet hosts.
//!
//! One remote action per spawn: the configured command is executed over an
//! administrative session and receives its parameters as a JSON document on
//! stdin. A non-empty stdout is the instance handle. An empty stdout is a
//! failure regardless of what stderr says; stderr next to a handle is only
//! a warning.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::fleet::{Credential, Host};

/// Raw result of one remote command.
#[derive(Debug, Clone, Default)]
pub struct RemoteOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: Option<u32>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// Nothing was started on the remote side.
    #[error("could not establish session: {0}")]
    Connect(String),

    /// The session broke after the command was sent.
    #[error("session dropped mid-call: {0}")]
    Dropped(String),
}

/// Runs one command on a host. Implemented over SSH in production.
#[async_trait]
pub trait RemoteExecutor: Send + Sync + 'static {
    async fn execute(&self, host: &Host, command: &str, stdin: &[u8]) -> Result<RemoteOutput, SessionError>;
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("host {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("spawn action produced no handle (exit status {exit_status:?}): {diagnostics}")]
    Rejected {
        diagnostics: String,
        exit_status: Option<u32>,
    },

    /// The remote side may or may not have started an instance.
    #[error("spawn outcome unknown: {reason}")]
    Ambiguous { reason: String },

    #[error("failed to encode spawn parameters: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ProvisionError {
    /// Whether the caller may try again without risking a duplicate instance.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProvisionError::Unreachable { .. })
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, ProvisionError::Ambiguous { .. })
    }
}

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub access_secret: Option<String>,
    pub mode: String,
    pub map: String,
    pub administrators: Vec<String>,
}

/// Document written to the spawn action's stdin.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpawnParams<'a> {
    instance_id: String,
    port: u16,
    access_credential: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    access_secret: Option<&'a str>,
    mode: &'a str,
    map: &'a str,
    administrators: &'a [String],
}

#[derive(Clone)]
pub struct Provisioner {
    executor: Arc<dyn RemoteExecutor>,
    command: String,
    timeout: Duration,
}

impl Provisioner {
    pub fn new(executor: Arc<dyn RemoteExecutor>, command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            executor,
            command: command.into(),
            timeout,
        }
    }

    #[instrument(skip_all, fields(host = %host.name, port = port, lease_id = lease_id))]
    pub async fn spawn(
        &self,
        host: &Host,
        port: u16,
        credential: &Credential,
        lease_id: i64,
        opts: &SpawnOptions,
    ) -> Result<String, ProvisionError> {
        let params = SpawnParams {
            instance_id: format!("lease-{lease_id}"),
            port,
            access_credential: &credential.token,
            access_secret: opts.access_secret.as_deref(),
            mode: &opts.mode,
            map: &opts.map,
            administrators: &opts.administrators,
        };
        let payload = serde_json::to_vec(&params)?;

        let call = self.executor.execute(host, &self.command, &payload);
        let output = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(output)) => output,
            Ok(Err(SessionError::Connect(reason))) => {
                return Err(ProvisionError::Unreachable {
                    host: host.name.clone(),
                    reason,
                })
            }
            Ok(Err(SessionError::Dropped(reason))) => return Err(ProvisionError::Ambiguous { reason }),
            Err(_) => {
                return Err(ProvisionError::Ambiguous {
                    reason: format!("no response within {:?}", self.timeout),
                })
            }
        };

        let handle = interpret(output)?;
        info!(handle = %handle, "Instance spawned");
        Ok(handle)
    }
}

fn interpret(output: RemoteOutput) -> Result<String, ProvisionError> {
    let handle = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let diagnostics = String::from_utf8_lossy(&output.stderr).trim().to_string();

    if handle.is_empty() {
        return Err(ProvisionError::Rejected {
            diagnostics,
            exit_status: output.exit_status,
        });
    }
    if !diagnostics.is_empty() {
        warn!(handle = %handle, exit_status = ?output.exit_status, diagnostics = %diagnostics, "Spawn action reported diagnostics alongside a handle");
    }
    Ok(handle)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fleet::tests::{credential, host};
    use std::sync::Mutex;

    /// Scripted executor that records what it was asked to run.
    pub(crate) struct ScriptedExecutor {
        pub(crate) result: Box<dyn Fn() -> Result<RemoteOutput, SessionError> + Send + Sync>,
        pub(crate) delay: Duration,
        pub(crate) calls: Mutex<Vec<(i64, String, serde_json::Value)>>,
    }

    impl ScriptedExecutor {
        pub(crate) fn replying(stdout: &str, stderr: &str) -> Self {
            let (stdout, stderr) = (stdout.to_string(), stderr.to_string());
            Self {
                result: Box::new(move || {
                    Ok(RemoteOutput {
                        stdout: stdout.clone().into_bytes(),
                        stderr: stderr.clone().into_bytes(),
                        exit_status: Some(0),
                    })
                }),
                delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RemoteExecutor for ScriptedExecutor {
        async fn execute(&self, host: &Host, command: &str, stdin: &[u8]) -> Result<RemoteOutput, SessionError> {
            let params = serde_json::from_slice(stdin).unwrap();
            self.calls.lock().unwrap().push((host.id, command.to_string(), params));
            tokio::time::sleep(self.delay).await;
            (self.result)()
        }
    }

    fn opts() -> SpawnOptions {
        SpawnOptions {
            access_secret: Some("letmein".into()),
            mode: "competitive".into(),
            map: "de_nuke".into(),
            administrators: vec!["STEAM_0:1:1".into()],
        }
    }

    fn provisioner(executor: Arc<ScriptedExecutor>, timeout: Duration) -> Provisioner {
        Provisioner::new(executor, "gameserver-spawn", timeout)
    }

    #[tokio::test]
    async fn handle_comes_from_trimmed_stdout() {
        let executor = Arc::new(ScriptedExecutor::replying("  inst-7f3a\n", ""));
        let p = provisioner(executor.clone(), Duration::from_secs(1));

        let handle = p.spawn(&host(1, 27015, 27020, 2), 27016, &credential(5, true), 12, &opts()).await.unwrap();
        assert_eq!(handle, "inst-7f3a");

        let calls = executor.calls.lock().unwrap();
        let (host_id, command, params) = &calls[0];
        assert_eq!(*host_id, 1);
        assert_eq!(command, "gameserver-spawn");
        assert_eq!(params["instanceId"], "lease-12");
        assert_eq!(params["port"], 27016);
        assert_eq!(params["accessCredential"], "token-5");
        assert_eq!(params["accessSecret"], "letmein");
        assert_eq!(params["map"], "de_nuke");
        assert_eq!(params["administrators"][0], "STEAM_0:1:1");
    }

    #[tokio::test]
    async fn missing_secret_is_omitted_from_params() {
        let executor = Arc::new(ScriptedExecutor::replying("inst", ""));
        let p = provisioner(executor.clone(), Duration::from_secs(1));
        let mut o = opts();
        o.access_secret = None;
        p.spawn(&host(1, 27015, 27020, 2), 27015, &credential(1, true), 1, &o).await.unwrap();
        assert!(executor.calls.lock().unwrap()[0].2.get("accessSecret").is_none());
    }

    #[tokio::test]
    async fn stderr_with_handle_is_a_warning_only() {
        let executor = Arc::new(ScriptedExecutor::replying("inst-1", "warning: low disk"));
        let p = provisioner(executor, Duration::from_secs(1));
        let handle = p.spawn(&host(1, 27015, 27020, 2), 27015, &credential(1, true), 1, &opts()).await.unwrap();
        assert_eq!(handle, "inst-1");
    }

    #[tokio::test]
    async fn empty_stdout_is_rejected_with_diagnostics() {
        let executor = Arc::new(ScriptedExecutor::replying("", "port already bound"));
        let p = provisioner(executor, Duration::from_secs(1));
        let err = p.spawn(&host(1, 27015, 27020, 2), 27015, &credential(1, true), 1, &opts()).await.unwrap_err();
        match err {
            ProvisionError::Rejected { diagnostics, .. } => assert_eq!(diagnostics, "port already bound"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_failure_is_retryable() {
        let executor = Arc::new(ScriptedExecutor {
            result: Box::new(|| Err(SessionError::Connect("connection refused".into()))),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        });
        let p = provisioner(executor, Duration::from_secs(1));
        let err = p.spawn(&host(1, 27015, 27020, 2), 27015, &credential(1, true), 1, &opts()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!err.is_ambiguous());
    }

    #[tokio::test]
    async fn timeout_is_ambiguous_never_success() {
        let executor = Arc::new(ScriptedExecutor {
            delay: Duration::from_secs(5),
            ..ScriptedExecutor::replying("inst-late", "")
        });
        let p = provisioner(executor, Duration::from_millis(50));
        let err = p.spawn(&host(1, 27015, 27020, 2), 27015, &credential(1, true), 1, &opts()).await.unwrap_err();
        assert!(err.is_ambiguous());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn dropped_session_is_ambiguous() {
        let executor = Arc::new(ScriptedExecutor {
            result: Box::new(|| Err(SessionError::Dropped("broken pipe".into()))),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        });
        let p = provisioner(executor, Duration::from_secs(1));
        let err = p.spawn(&host(1, 27015, 27020, 2), 27015, &credential(1, true), 1, &opts()).await.unwrap_err();
        assert!(err.is_ambiguous());
    }
}
