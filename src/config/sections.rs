// ABOUTME: Per-stage configuration sections: infra, workload, commands, proxy, certificate, runner.
// ABOUTME: Also holds per-stage retry overrides layered over each stage's default policy.

use super::env_value::EnvValue;
use crate::deploy::RetryPolicy;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InfraConfig {
    /// Terraform-compatible binary.
    #[serde(default = "default_infra_binary")]
    pub binary: String,

    /// Directory with the resource declarations, relative to the config file.
    #[serde(default = "default_infra_dir")]
    pub working_dir: PathBuf,

    #[serde(default)]
    pub variables: BTreeMap<String, EnvValue>,

    /// Name of the output holding the host's public address.
    #[serde(default = "default_address_output")]
    pub public_address_output: String,
}

fn default_infra_binary() -> String {
    "terraform".to_string()
}

fn default_infra_dir() -> PathBuf {
    PathBuf::from("infra")
}

fn default_address_output() -> String {
    crate::infra::PUBLIC_ADDRESS.to_string()
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            binary: default_infra_binary(),
            working_dir: default_infra_dir(),
            variables: BTreeMap::new(),
            public_address_output: default_address_output(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkloadConfig {
    /// Local descriptor template, e.g. a compose file with `${public_address}`.
    pub template: PathBuf,

    /// Where the rendered descriptor is written on the host.
    pub remote_path: String,

    pub start_command: String,

    #[serde(default)]
    pub stop_command: Option<String>,
}

/// A shell command run on the host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandSpec {
    pub run: String,

    /// Log a failure instead of failing the stage.
    #[serde(default)]
    pub best_effort: bool,

    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(run: impl Into<String>) -> Self {
        Self {
            run: run.into(),
            best_effort: false,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MigrationsConfig {
    #[serde(default, deserialize_with = "super::deserialize::deserialize_commands")]
    pub commands: Vec<CommandSpec>,

    /// A failed migration stage only warns.
    #[serde(default = "default_true")]
    pub best_effort: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            best_effort: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProxyConfig {
    /// Local TLS configuration template with `${domain}`, `${certificate_path}`, `${key_path}`.
    pub template: PathBuf,
    pub remote_path: String,
    #[serde(default)]
    pub test_command: Option<String>,
    pub reload_command: String,
    #[serde(default = "default_cert_dir")]
    pub cert_dir: String,
    #[serde(default = "default_webroot")]
    pub webroot: String,
}

fn default_cert_dir() -> String {
    "/etc/letsencrypt/live".to_string()
}

fn default_webroot() -> String {
    "/var/www/certbot".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CertificateConfig {
    /// Continue with a warning when the domain does not resolve to the host yet.
    #[serde(default)]
    pub allow_dns_override: bool,

    /// Request certificates from the authority's staging environment.
    #[serde(default)]
    pub staging: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_workers() -> usize {
    4
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".shipwright/runs")
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            state_dir: default_state_dir(),
        }
    }
}

/// Fields that replace a stage's default retry policy.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryOverride {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default, with = "humantime_serde::option")]
    pub base: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub cap: Option<Duration>,
    #[serde(default)]
    pub jitter: Option<f64>,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
}

impl RetryOverride {
    pub fn apply(&self, mut policy: RetryPolicy) -> RetryPolicy {
        if let Some(attempts) = self.max_attempts {
            policy.max_attempts = attempts.max(1);
        }
        if let Some(base) = self.base {
            policy.base = base;
        }
        if let Some(cap) = self.cap {
            policy.cap = cap;
        }
        if let Some(jitter) = self.jitter {
            policy.jitter = jitter.clamp(0.0, 1.0);
        }
        if let Some(timeout) = self.timeout {
            policy.timeout = timeout;
        }
        policy
    }
}
