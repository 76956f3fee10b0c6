// ABOUTME: Remote Executor running commands on target hosts over SSH.
// ABOUTME: Caches one session per host, serializes commands per host, retries connects.

use super::client::{CommandOutput, Session};
use super::error::{Error, Result};
use crate::diagnostics::Warning;
use crate::template::{self, TemplateError, Vars};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// A remote machine the orchestrator configures.
///
/// `key_path` is the credential reference; when absent the SSH agent and
/// default key locations are tried.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetHost {
    pub address: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub trust_first_connection: bool,
    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,
}

impl TargetHost {
    pub fn new(address: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: 22,
            user: user.into(),
            key_path: None,
            trust_first_connection: false,
            known_hosts_path: None,
        }
    }

    /// Copy of this host with `${KEY}` placeholders in the address filled in.
    pub fn render(&self, vars: &Vars<'_>) -> std::result::Result<TargetHost, TemplateError> {
        Ok(TargetHost {
            address: template::render(&self.address, vars)?,
            ..self.clone()
        })
    }

    fn cache_key(&self) -> HostKey {
        HostKey {
            address: self.address.clone(),
            port: self.port,
            user: self.user.clone(),
        }
    }
}

impl fmt::Display for TargetHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.address, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HostKey {
    address: String,
    port: u16,
    user: String,
}

/// An open connection able to run commands.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens sessions to target hosts.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &TargetHost) -> Result<Box<dyn RemoteSession>>;
}

/// Connector backed by russh.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, host: &TargetHost) -> Result<Box<dyn RemoteSession>> {
        let session = Session::open(host).await?;
        Ok(Box::new(session))
    }
}

/// Runs a command on a host and returns its captured output.
///
/// A non-zero exit code is a successful `Ok` result; callers decide what it
/// means for their stage.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, host: &TargetHost, command: &str, timeout: Duration)
    -> Result<CommandOutput>;
}

/// How hard to try when a host does not accept connections yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    /// Retries after the first failed connect.
    pub reconnects: u32,
    /// Fixed pause between attempts.
    pub delay: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            reconnects: 3,
            delay: Duration::from_secs(10),
        }
    }
}

type SessionSlot = Arc<tokio::sync::Mutex<Option<Box<dyn RemoteSession>>>>;

/// Executes commands on remote hosts, reusing one session per host.
///
/// Commands for the same host are serialized on that host's slot so two
/// stages never interleave on one SSH session. Different hosts proceed in
/// parallel.
pub struct RemoteExecutor<C = SshConnector> {
    connector: C,
    policy: ConnectPolicy,
    sessions: parking_lot::Mutex<HashMap<HostKey, SessionSlot>>,
}

impl<C> fmt::Debug for RemoteExecutor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteExecutor")
            .field("policy", &self.policy)
            .field("cached_hosts", &self.sessions.lock().len())
            .finish()
    }
}

impl RemoteExecutor<SshConnector> {
    pub fn ssh(policy: ConnectPolicy) -> Self {
        Self::new(SshConnector, policy)
    }
}

impl<C: Connector> RemoteExecutor<C> {
    pub fn new(connector: C, policy: ConnectPolicy) -> Self {
        Self {
            connector,
            policy,
            sessions: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, host: &TargetHost) -> SessionSlot {
        let mut sessions = self.sessions.lock();
        Arc::clone(sessions.entry(host.cache_key()).or_default())
    }

    async fn connect_with_retry(&self, host: &TargetHost) -> Result<Box<dyn RemoteSession>> {
        let attempts = self.policy.reconnects.saturating_add(1);
        let mut attempt = 1;
        loop {
            match self.connector.connect(host).await {
                Ok(session) => return Ok(session),
                Err(e) if e.is_auth() => return Err(e),
                Err(e) if attempt >= attempts => {
                    tracing::warn!("giving up connecting to {} after {} attempts", host, attempt);
                    return Err(e);
                }
                Err(e) => {
                    tracing::info!(
                        "connect to {} failed (attempt {}/{}): {}; retrying in {:?}",
                        host,
                        attempt,
                        attempts,
                        e,
                        self.policy.delay
                    );
                    tokio::time::sleep(self.policy.delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Close every cached session, collecting failures as warnings.
    pub async fn disconnect_all(&self) -> Vec<Warning> {
        let slots: Vec<_> = self.sessions.lock().drain().collect();
        let mut warnings = Vec::new();
        for (key, slot) in slots {
            if let Some(session) = slot.lock().await.take()
                && let Err(e) = session.close().await
            {
                tracing::warn!("SSH disconnect failed for {}: {}", key.address, e);
                warnings.push(Warning::ssh_disconnect(format!(
                    "SSH disconnect failed for {}: {}",
                    key.address, e
                )));
            }
        }
        warnings
    }
}

#[async_trait]
impl<C: Connector> CommandRunner for RemoteExecutor<C> {
    async fn run(
        &self,
        host: &TargetHost,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let slot = self.slot(host);
        let mut guard = slot.lock().await;

        if guard.is_none() {
            *guard = Some(self.connect_with_retry(host).await?);
        }

        let Some(session) = guard.as_ref() else {
            return Err(Error::Connection(format!("no session for {}", host)));
        };

        let result = session.exec(command, timeout).await;
        if let Err(e) = &result
            && e.poisons_session()
        {
            tracing::debug!("dropping cached session to {} after error: {}", host, e);
            if let Some(session) = guard.take() {
                let _ = session.close().await;
            }
        }
        result
    }
}
