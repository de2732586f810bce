//! SSH implementation of [`RemoteExecutor`].

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::fleet::Host;
use crate::provisioner::{RemoteExecutor, RemoteOutput, SessionError};

/// Accepts the server key when it matches the host's pinned fingerprint, or
/// any key when none is pinned.
struct HostKeyCheck {
    host: String,
    expected: Option<String>,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &key::PublicKey) -> Result<bool, Self::Error> {
        let Some(expected) = &self.expected else {
            return Ok(true);
        };
        let actual = server_public_key.fingerprint();
        let matches = fingerprint_matches(expected, &actual);
        if !matches {
            warn!(host = %self.host, expected = %expected, actual = %actual, "Host key fingerprint mismatch");
        }
        Ok(matches)
    }
}

/// Compares a pinned fingerprint, with or without the `SHA256:` prefix,
/// against the bare base64 digest russh reports.
fn fingerprint_matches(pinned: &str, actual: &str) -> bool {
    let pinned = pinned.trim();
    let pinned = pinned.strip_prefix("SHA256:").unwrap_or(pinned);
    let actual = actual.strip_prefix("SHA256:").unwrap_or(actual);
    !pinned.is_empty() && pinned == actual
}

#[derive(Clone, Default)]
pub struct SshExecutor {
    config: Arc<client::Config>,
}

impl std::fmt::Debug for SshExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshExecutor").finish_non_exhaustive()
    }
}

impl SshExecutor {
    pub fn new() -> Self {
        Self {
            config: Arc::new(client::Config::default()),
        }
    }

    async fn connect(&self, host: &Host) -> Result<client::Handle<HostKeyCheck>, SessionError> {
        let key_pair = russh_keys::decode_secret_key(&host.private_key, None)
            .map_err(|e| SessionError::Connect(format!("invalid private key: {e}")))?;

        let handler = HostKeyCheck {
            host: host.name.clone(),
            expected: host.host_key_fingerprint.clone(),
        };
        let mut session = client::connect(
            self.config.clone(),
            (host.address.as_str(), host.admin_port),
            handler,
        )
        .await
        .map_err(|e| SessionError::Connect(e.to_string()))?;

        let authenticated = session
            .authenticate_publickey(host.username.clone(), Arc::new(key_pair))
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        if !authenticated {
            return Err(SessionError::Connect(format!(
                "public key rejected for {}@{}",
                host.username, host.address
            )));
        }
        Ok(session)
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, host: &Host, command: &str, stdin: &[u8]) -> Result<RemoteOutput, SessionError> {
        let session = self.connect(host).await?;
        debug!(host = %host.name, command, "Session established");

        // From here on the remote side may already have acted.
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| SessionError::Dropped(e.to_string()))?;
        channel
            .data(stdin)
            .await
            .map_err(|e| SessionError::Dropped(e.to_string()))?;
        channel.eof().await.map_err(|e| SessionError::Dropped(e.to_string()))?;

        let mut output = RemoteOutput::default();
        let mut closed = false;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => output.stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
                ChannelMsg::Close => {
                    closed = true;
                    break;
                }
                _ => {}
            }
        }
        if !closed && output.exit_status.is_none() {
            return Err(SessionError::Dropped("channel ended without exit status".into()));
        }

        if let Err(e) = session.disconnect(Disconnect::ByApplication, "", "en").await {
            debug!(host = %host.name, error = %e, "Disconnect failed");
        }
        Ok(output)
    }
}
