// ABOUTME: Health Prober: polls an HTTP, TCP or remote-command condition until a deadline.
// ABOUTME: Transport errors mean "not yet healthy"; logical failures may short-circuit.

mod probe;
mod prober;
mod stage;

pub use probe::{HttpProbe, Observation, Probe, RemoteProbe, TcpProbe};
pub use prober::{HealthProber, ProbeOutcome, ProbeReport};
pub use stage::HealthcheckStage;

use crate::deploy::StageError;
use crate::template::{self, TemplateError, Vars};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// What "healthy" means for one check.
///
/// Fields may contain `${KEY}` placeholders filled from stage outputs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// A plain-HTTP GET answering with the expected status (and body fragment).
    Http {
        url: String,
        #[serde(default = "default_expect_status")]
        expect_status: u16,
        #[serde(default)]
        expect_body: Option<String>,
    },
    /// A TCP port accepting connections.
    Tcp { address: String },
    /// A command on the target host exiting zero.
    Remote { command: String },
}

fn default_expect_status() -> u16 {
    200
}

impl Condition {
    fn resolve(&self, vars: &Vars<'_>) -> Result<Condition, TemplateError> {
        Ok(match self {
            Condition::Http {
                url,
                expect_status,
                expect_body,
            } => Condition::Http {
                url: template::render(url, vars)?,
                expect_status: *expect_status,
                expect_body: expect_body.clone(),
            },
            Condition::Tcp { address } => Condition::Tcp {
                address: template::render(address, vars)?,
            },
            Condition::Remote { command } => Condition::Remote {
                command: template::render(command, vars)?,
            },
        })
    }
}

/// A condition with its polling schedule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthCheckSpec {
    pub name: String,

    #[serde(flatten)]
    pub condition: Condition,

    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Total time allowed, measured from the first poll.
    #[serde(default = "default_deadline", with = "humantime_serde")]
    pub deadline: Duration,

    /// Upper bound on a single poll.
    #[serde(default = "default_attempt_timeout", with = "humantime_serde")]
    pub attempt_timeout: Duration,

    /// Give up early after this many consecutive logical failures.
    #[serde(default)]
    pub failure_threshold: Option<u32>,
}

fn default_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_deadline() -> Duration {
    Duration::from_secs(120)
}

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(5)
}

impl HealthCheckSpec {
    pub fn new(name: impl Into<String>, condition: Condition) -> Self {
        Self {
            name: name.into(),
            condition,
            interval: default_interval(),
            deadline: default_deadline(),
            attempt_timeout: default_attempt_timeout(),
            failure_threshold: None,
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Copy of this spec with placeholders filled in.
    pub fn resolve(&self, vars: &Vars<'_>) -> Result<HealthCheckSpec, TemplateError> {
        Ok(HealthCheckSpec {
            condition: self.condition.resolve(vars)?,
            ..self.clone()
        })
    }
}

/// A condition that cannot be probed at all.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid health check URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported URL scheme '{scheme}' in '{url}' (use a remote check for HTTPS)")]
    UnsupportedScheme { url: String, scheme: String },

    #[error("remote health checks need a command runner and target host")]
    NoRemoteTarget,

    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl From<ProbeError> for StageError {
    fn from(err: ProbeError) -> Self {
        StageError::fatal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn parses_each_condition_kind() {
        let yaml = r#"
- name: web
  http:
    url: "http://${public_address}:8080/health"
    expect_body: ok
  interval: 2s
  deadline: 1m
- name: db
  tcp:
    address: "${public_address}:5432"
- name: units
  remote:
    command: systemctl is-active app
  failure_threshold: 3
"#;
        let specs: Vec<HealthCheckSpec> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(
            specs[0].condition,
            Condition::Http {
                url: "http://${public_address}:8080/health".to_string(),
                expect_status: 200,
                expect_body: Some("ok".to_string()),
            }
        );
        assert_eq!(specs[0].interval, Duration::from_secs(2));
        assert_eq!(specs[0].deadline, Duration::from_secs(60));
        assert_eq!(specs[1].deadline, default_deadline());
        assert_eq!(specs[2].failure_threshold, Some(3));
    }

    #[test]
    fn resolve_fills_placeholders() {
        let spec = HealthCheckSpec::new(
            "db",
            Condition::Tcp {
                address: "${public_address}:5432".to_string(),
            },
        );
        let vars = BTreeMap::from([("public_address", "10.1.2.3")]);
        let resolved = spec.resolve(&vars).unwrap();
        assert_eq!(
            resolved.condition,
            Condition::Tcp {
                address: "10.1.2.3:5432".to_string()
            }
        );
    }
}
