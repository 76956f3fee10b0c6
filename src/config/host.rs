// ABOUTME: Target host configuration for SSH connections.
// ABOUTME: The address usually comes from the provisioner's outputs via a placeholder.

use crate::infra::PUBLIC_ADDRESS;
use crate::ssh::{ConnectPolicy, TargetHost};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostConfig {
    /// Literal address or a placeholder such as `${public_address}`.
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub key_path: Option<PathBuf>,

    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,

    /// Accept and remember an unknown host key on first connect.
    #[serde(default = "default_trust_first_connection")]
    pub trust_first_connection: bool,

    /// Connection retries after the first attempt fails.
    #[serde(default = "default_reconnects")]
    pub reconnects: u32,

    #[serde(default = "default_connect_delay", with = "humantime_serde")]
    pub connect_delay: Duration,

    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
}

fn default_address() -> String {
    format!("${{{}}}", PUBLIC_ADDRESS)
}

fn default_user() -> String {
    "deploy".to_string()
}

fn default_port() -> u16 {
    22
}

fn default_trust_first_connection() -> bool {
    true
}

fn default_reconnects() -> u32 {
    3
}

fn default_connect_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(600)
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            user: default_user(),
            port: default_port(),
            key_path: None,
            known_hosts_path: None,
            trust_first_connection: default_trust_first_connection(),
            reconnects: default_reconnects(),
            connect_delay: default_connect_delay(),
            command_timeout: default_command_timeout(),
        }
    }
}

impl HostConfig {
    /// Host description with the address still unrendered.
    pub fn target(&self) -> TargetHost {
        TargetHost {
            address: self.address.clone(),
            port: self.port,
            user: self.user.clone(),
            key_path: self.key_path.clone(),
            trust_first_connection: self.trust_first_connection,
            known_hosts_path: self.known_hosts_path.clone(),
        }
    }

    pub fn connect_policy(&self) -> ConnectPolicy {
        ConnectPolicy {
            reconnects: self.reconnects,
            delay: self.connect_delay,
        }
    }
}
