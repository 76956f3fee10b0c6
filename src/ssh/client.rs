// ABOUTME: russh-backed sessions to target hosts, opened straight from a TargetHost.
// ABOUTME: Verifies host keys, authenticates by key file or agent, and captures command output.

use super::error::{Error, Result};
use super::executor::{RemoteSession, TargetHost};
use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::keys::agent::client::AgentClient;
use russh::keys::known_hosts::{
    check_known_hosts, check_known_hosts_path, learn_known_hosts, learn_known_hosts_path,
};
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key, ssh_key};
use russh::{ChannelMsg, Disconnect};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;

/// Keys tried under `$HOME/.ssh` when no key is configured and no agent answers.
const DEFAULT_KEYS: [&str; 3] = ["id_ed25519", "id_rsa", "id_ecdsa"];

/// Captured result of one remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: u32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Decides whether a server key is acceptable for one target.
pub(crate) struct HostKeyCheck {
    address: String,
    port: u16,
    trust_first_connection: bool,
    known_hosts: Option<PathBuf>,
}

impl HostKeyCheck {
    fn for_host(host: &TargetHost) -> Self {
        Self {
            address: host.address.clone(),
            port: host.port,
            trust_first_connection: host.trust_first_connection,
            known_hosts: host.known_hosts_path.clone(),
        }
    }

    /// Record a key seen for the first time. Failure to save only warns.
    fn learn(&self, key: &ssh_key::PublicKey) {
        tracing::warn!(
            "trusting unknown host key for {}:{} on first connection",
            self.address,
            self.port
        );
        let saved = match &self.known_hosts {
            Some(path) => learn_known_hosts_path(&self.address, self.port, key, path),
            None => learn_known_hosts(&self.address, self.port, key),
        };
        if let Err(e) = saved {
            tracing::warn!("could not record host key in known_hosts: {}", e);
        }
    }
}

impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let known = match &self.known_hosts {
            Some(path) => check_known_hosts_path(&self.address, self.port, key, path),
            None => check_known_hosts(&self.address, self.port, key),
        };
        match known {
            Ok(true) => Ok(true),
            // A changed key is never accepted, even on trust-first-connection.
            Err(russh::keys::Error::KeyChanged { .. }) => Ok(false),
            Ok(false) | Err(_) if self.trust_first_connection => {
                self.learn(key);
                Ok(true)
            }
            Ok(false) | Err(_) => Ok(false),
        }
    }
}

/// How the session proves the user's identity.
enum Credential {
    Agent(AgentClient<UnixStream>),
    Key(Arc<ssh_key::PrivateKey>),
}

impl Credential {
    /// Configured key first, then the agent, then default key files.
    async fn locate(host: &TargetHost) -> Result<Self> {
        if let Some(path) = &host.key_path {
            return Self::load(path);
        }
        if let Ok(agent) = AgentClient::connect_env().await {
            return Ok(Credential::Agent(agent));
        }

        let home = std::env::var("HOME").map_err(|_| {
            Error::AgentUnavailable("SSH agent not available and HOME not set".to_string())
        })?;
        DEFAULT_KEYS
            .iter()
            .map(|name| Path::new(&home).join(".ssh").join(name))
            .find_map(|path| Self::load(&path).ok())
            .ok_or_else(|| {
                Error::AgentUnavailable(
                    "SSH agent not available and no default keys found".to_string(),
                )
            })
    }

    fn load(path: &Path) -> Result<Self> {
        let key = load_secret_key(path, None).map_err(|e| Error::KeyLoadFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Credential::Key(Arc::new(key)))
    }

    async fn authenticate(self, handle: &mut Handle<HostKeyCheck>, user: &str) -> Result<()> {
        let accepted = match self {
            Credential::Agent(mut agent) => {
                let identities = agent.request_identities().await.map_err(|e| {
                    Error::AgentUnavailable(format!("failed to list agent keys: {}", e))
                })?;
                if identities.is_empty() {
                    return Err(Error::AgentUnavailable("no keys in SSH agent".to_string()));
                }
                let mut accepted = false;
                for identity in identities {
                    let result = handle
                        .authenticate_publickey_with(user, identity, None, &mut agent)
                        .await;
                    if result.is_ok_and(|r| r.success()) {
                        accepted = true;
                        break;
                    }
                }
                accepted
            }
            Credential::Key(key) => {
                let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
                handle
                    .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, hash_alg))
                    .await?
                    .success()
            }
        };
        if accepted {
            Ok(())
        } else {
            Err(Error::AuthenticationFailed)
        }
    }
}

/// Accumulates channel messages until the command has exited and closed its output.
#[derive(Debug, Default)]
struct OutputCollector {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<u32>,
    eof: bool,
}

impl OutputCollector {
    /// Feed one message. Returns true once nothing more is expected.
    fn push(&mut self, msg: ChannelMsg) -> bool {
        match msg {
            ChannelMsg::Data { data } => self.stdout.extend_from_slice(&data),
            // ext 1 is stderr
            ChannelMsg::ExtendedData { data, ext: 1 } => self.stderr.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => self.exit_code = Some(exit_status),
            ChannelMsg::Eof => self.eof = true,
            ChannelMsg::Close => return true,
            _ => {}
        }
        self.eof && self.exit_code.is_some()
    }

    /// A channel that closed without an exit status died with its connection.
    fn finish(self) -> Result<CommandOutput> {
        let exit_code = self.exit_code.ok_or(Error::ChannelClosed)?;
        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
        })
    }
}

/// An authenticated SSH connection to one target host.
pub struct Session {
    target: String,
    handle: Handle<HostKeyCheck>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Connect to `host` and authenticate as its user.
    pub async fn open(host: &TargetHost) -> Result<Self> {
        let credential = Credential::locate(host).await?;
        let config = Config {
            inactivity_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        let mut handle = client::connect(
            Arc::new(config),
            (host.address.as_str(), host.port),
            HostKeyCheck::for_host(host),
        )
        .await
        .map_err(|e| match e {
            russh::Error::UnknownKey => {
                Error::HostKeyRejected(format!("{}:{}", host.address, host.port))
            }
            e => Error::Connection(format!("{}:{}: {}", host.address, host.port, e)),
        })?;

        credential.authenticate(&mut handle, &host.user).await?;
        tracing::debug!("SSH session established to {}", host);

        Ok(Self {
            target: host.to_string(),
            handle,
        })
    }

    async fn run_to_exit(&self, command: &str) -> Result<CommandOutput> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::CommandFailed(format!("failed to open channel: {}", e)))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::CommandFailed(format!("failed to exec command: {}", e)))?;

        let mut collector = OutputCollector::default();
        while let Some(msg) = channel.wait().await {
            if collector.push(msg) {
                break;
            }
        }
        collector.finish()
    }
}

#[async_trait]
impl RemoteSession for Session {
    async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        // Commands may carry rendered secrets; only their size is logged.
        tracing::debug!(target_host = %self.target, "exec ({} bytes)", command.len());
        match tokio::time::timeout(timeout, self.run_to_exit(command)).await {
            Ok(result) => result,
            Err(_) => Err(Error::CommandTimeout(timeout)),
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}
