//! SSH remote-execution controller.
//!
//! Components carry `host`, `user`, `password` and optionally `port` (default
//! 22) and `host_key` (a pinned `SHA256:` fingerprint). Tasks carry `command`
//! and optionally `rollback_command`. Every call opens a fresh connection and
//! session and tears both down when it finishes.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{cancellable, required, ControllerError, ResourceController, Result};
use crate::model::Metadata;

/// Default TCP connect + handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_PORT: u16 = 22;
const HEALTH_COMMAND: &str = "echo ok";

/// How server host keys are verified.
#[derive(Debug, Clone, Default)]
pub struct HostKeyPolicy {
    /// `host:port` to expected `SHA256:` fingerprint.
    pub known_hosts: HashMap<String, String>,
    /// Accept hosts with no pinned fingerprint. Insecure; for lab setups.
    pub accept_unknown: bool,
}

impl HostKeyPolicy {
    fn expected_for(&self, address: &str, pinned: Option<&str>) -> Option<String> {
        pinned
            .map(str::to_string)
            .or_else(|| self.known_hosts.get(address).cloned())
    }
}

/// Connection parameters pulled from component metadata.
struct Target {
    host: String,
    port: u16,
    user: String,
    password: Zeroizing<String>,
    pinned_key: Option<String>,
}

impl Target {
    fn from_metadata(meta: &Metadata) -> Result<Self> {
        let host = required(meta, "host", "component")?.to_string();
        let user = required(meta, "user", "component")?.to_string();
        let password = Zeroizing::new(required(meta, "password", "component")?.to_string());
        let port = match meta.get("port").map(|p| p.trim()).filter(|p| !p.is_empty()) {
            None => DEFAULT_PORT,
            Some(p) => p.parse().map_err(|_| {
                ControllerError::Validation(format!("component port '{p}' is not a valid port"))
            })?,
        };
        let pinned_key = meta
            .get("host_key")
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());

        Ok(Self {
            host,
            port,
            user,
            password,
            pinned_key,
        })
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Captured result of a remote command.
#[derive(Debug, Default)]
struct CommandOutput {
    stdout: String,
    stderr: String,
    exit_status: Option<u32>,
}

/// Strip the `SHA256:` prefix and base64 padding so fingerprints written by
/// `ssh-keygen -lf` and by the key library compare equal.
fn normalize_fingerprint(raw: &str) -> String {
    raw.trim()
        .trim_start_matches("SHA256:")
        .trim_end_matches('=')
        .to_string()
}

struct HostKeyCheck {
    address: String,
    expected: Option<String>,
    accept_unknown: bool,
    rejection: Arc<OnceLock<String>>,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let presented = normalize_fingerprint(&server_public_key.fingerprint());
        match &self.expected {
            Some(expected) if normalize_fingerprint(expected) == presented => Ok(true),
            Some(_) => {
                let _ = self
                    .rejection
                    .set(format!("fingerprint mismatch (presented SHA256:{presented})"));
                Ok(false)
            }
            None if self.accept_unknown => {
                warn!(
                    address = %self.address,
                    fingerprint = %format!("SHA256:{presented}"),
                    "accepting unpinned SSH host key"
                );
                Ok(true)
            }
            None => {
                let _ = self
                    .rejection
                    .set(format!("unknown host (presented SHA256:{presented})"));
                Ok(false)
            }
        }
    }
}

pub struct SshController {
    connect_timeout: Duration,
    host_keys: HostKeyPolicy,
}

impl SshController {
    pub fn new(connect_timeout: Duration, host_keys: HostKeyPolicy) -> Self {
        Self {
            connect_timeout,
            host_keys,
        }
    }

    async fn execute(&self, target: &Target, command: &str) -> Result<CommandOutput> {
        let address = target.address();
        let rejection = Arc::new(OnceLock::new());
        let handler = HostKeyCheck {
            address: address.clone(),
            expected: self
                .host_keys
                .expected_for(&address, target.pinned_key.as_deref()),
            accept_unknown: self.host_keys.accept_unknown,
            rejection: rejection.clone(),
        };

        let config = Arc::new(client::Config::default());
        let connect = client::connect(config, (target.host.clone(), target.port), handler);
        let mut session = match tokio::time::timeout(self.connect_timeout, connect).await {
            Err(_) => {
                return Err(ControllerError::Transport(format!(
                    "failed to dial SSH {address}: timed out after {:?}",
                    self.connect_timeout
                )))
            }
            Ok(Err(e)) => {
                return Err(match rejection.get() {
                    Some(reason) => ControllerError::HostKey {
                        address,
                        reason: reason.clone(),
                    },
                    None => ControllerError::Transport(format!("failed to dial SSH {address}: {e}")),
                })
            }
            Ok(Ok(session)) => session,
        };

        let authenticated = session
            .authenticate_password(target.user.as_str(), target.password.as_str())
            .await
            .map_err(|e| ControllerError::Transport(format!("SSH authentication error: {e}")))?;
        if !authenticated {
            let _ = session
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
            return Err(ControllerError::Transport(format!(
                "SSH authentication rejected for {}@{address}",
                target.user
            )));
        }

        let output = run_command(&mut session, command).await;
        if let Err(e) = session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(%address, error = %e, "SSH disconnect failed");
        }
        output
    }
}

async fn run_command(
    session: &mut client::Handle<HostKeyCheck>,
    command: &str,
) -> Result<CommandOutput> {
    let mut channel = session
        .channel_open_session()
        .await
        .map_err(|e| ControllerError::Transport(format!("failed to create SSH session: {e}")))?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| ControllerError::Transport(format!("failed to start command: {e}")))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            // ext 1 is SSH_EXTENDED_DATA_STDERR
            ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                stderr.extend_from_slice(data)
            }
            ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            _ => {}
        }
    }

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_status,
    })
}

/// Turn a finished command into success or an execution error carrying stderr.
fn into_result(output: CommandOutput, command: &str) -> Result<CommandOutput> {
    match output.exit_status {
        Some(0) => Ok(output),
        Some(code) => Err(ControllerError::Execution(format!(
            "ssh command '{command}' exited with status {code}: {}",
            output.stderr.trim()
        ))),
        None => Err(ControllerError::Execution(format!(
            "ssh command '{command}' ended without an exit status: {}",
            output.stderr.trim()
        ))),
    }
}

#[async_trait]
impl ResourceController for SshController {
    fn validate_component(&self, metadata: &Metadata) -> Result<()> {
        Target::from_metadata(metadata).map(|_| ())
    }

    async fn check_component(&self, metadata: &Metadata, cancel: &CancellationToken) -> Result<()> {
        let target = Target::from_metadata(metadata)?;
        let output = cancellable(cancel, self.execute(&target, HEALTH_COMMAND)).await?;
        into_result(output, HEALTH_COMMAND).map(|_| ())
    }

    fn validate_task(&self, task_metadata: &Metadata) -> Result<()> {
        required(task_metadata, "command", "task").map(|_| ())
    }

    async fn run_task(
        &self,
        task_metadata: &Metadata,
        component_metadata: &Metadata,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let command = required(task_metadata, "command", "task")?;
        let target = Target::from_metadata(component_metadata)?;
        let task_id = task_metadata.get("id").map(String::as_str).unwrap_or("");

        info!(
            task_id,
            user = %target.user,
            address = %target.address(),
            command,
            "running SSH task"
        );
        let output = cancellable(cancel, self.execute(&target, command)).await?;
        let output = into_result(output, command)?;
        debug!(task_id, stdout = %output.stdout, "SSH task output");
        Ok(())
    }

    async fn rollback_task(
        &self,
        task_metadata: &Metadata,
        component_metadata: &Metadata,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let command = required(task_metadata, "rollback_command", "task")?;
        let target = Target::from_metadata(component_metadata)?;
        info!(address = %target.address(), command, "running SSH rollback");
        let output = cancellable(cancel, self.execute(&target, command)).await?;
        into_result(output, command).map(|_| ())
    }
}
