// ABOUTME: Deadline/interval polling loop shared by every health check.
// ABOUTME: Polls on a fixed schedule from the first attempt and times out exactly at the deadline.

use super::probe::{HttpProbe, Observation, Probe, RemoteProbe, TcpProbe};
use super::{Condition, HealthCheckSpec, ProbeError};
use crate::ssh::{CommandRunner, TargetHost};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Shortest gap between polls, whatever the spec asks for.
const MIN_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Healthy,
    /// The deadline passed without a healthy observation.
    TimedOut,
    /// Consecutive logical failures reached the configured threshold.
    Failed,
}

/// Structured result of [`HealthProber::wait_for`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub name: String,
    pub outcome: ProbeOutcome,
    pub attempts: u32,
    pub last_observed: Option<String>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl ProbeReport {
    pub fn is_healthy(&self) -> bool {
        self.outcome == ProbeOutcome::Healthy
    }
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = match self.outcome {
            ProbeOutcome::Healthy => "healthy",
            ProbeOutcome::TimedOut => "timed out",
            ProbeOutcome::Failed => "failed",
        };
        write!(
            f,
            "'{}' {} after {} attempt(s) in {:?}",
            self.name, verdict, self.attempts, self.elapsed
        )?;
        if let Some(last) = &self.last_observed {
            write!(f, " (last observed: {})", last)?;
        }
        Ok(())
    }
}

/// Turns conditions into probes and polls them.
#[derive(Clone, Default)]
pub struct HealthProber {
    remote: Option<(Arc<dyn CommandRunner>, TargetHost)>,
}

impl fmt::Debug for HealthProber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthProber")
            .field("remote_host", &self.remote.as_ref().map(|(_, host)| host))
            .finish()
    }
}

impl HealthProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable [`Condition::Remote`] checks against `host`.
    pub fn with_remote(mut self, runner: Arc<dyn CommandRunner>, host: TargetHost) -> Self {
        self.remote = Some((runner, host));
        self
    }

    pub fn probe_for(
        &self,
        condition: &Condition,
        attempt_timeout: Duration,
    ) -> Result<Box<dyn Probe>, ProbeError> {
        match condition {
            Condition::Http {
                url,
                expect_status,
                expect_body,
            } => Ok(Box::new(HttpProbe::new(
                url,
                *expect_status,
                expect_body.clone(),
            )?)),
            Condition::Tcp { address } => Ok(Box::new(TcpProbe::new(address.clone()))),
            Condition::Remote { command } => {
                let (runner, host) = self.remote.as_ref().ok_or(ProbeError::NoRemoteTarget)?;
                Ok(Box::new(RemoteProbe::new(
                    Arc::clone(runner),
                    host.clone(),
                    command.clone(),
                    attempt_timeout,
                )))
            }
        }
    }

    /// Poll `spec` until it is healthy, fails, or its deadline elapses.
    ///
    /// # Errors
    ///
    /// Only when the condition cannot be probed at all (bad URL, no remote host).
    pub async fn wait_for(&self, spec: &HealthCheckSpec) -> Result<ProbeReport, ProbeError> {
        let probe = self.probe_for(&spec.condition, spec.attempt_timeout)?;
        Ok(Self::poll(probe.as_ref(), spec).await)
    }

    /// The polling loop, usable with any [`Probe`].
    ///
    /// Polls happen at `start + n * interval`. When the next poll would land at
    /// or after the deadline the loop sleeps until the deadline and reports a
    /// timeout.
    pub async fn poll(probe: &dyn Probe, spec: &HealthCheckSpec) -> ProbeReport {
        let start = Instant::now();
        let deadline = start + spec.deadline;
        let mut attempts: u32 = 0;
        let mut consecutive_failures: u32 = 0;
        let mut last_observed = None;

        let report = |outcome, attempts, last_observed| ProbeReport {
            name: spec.name.clone(),
            outcome,
            attempts,
            last_observed,
            elapsed: start.elapsed(),
        };

        loop {
            attempts += 1;
            let budget = spec
                .attempt_timeout
                .min(deadline.saturating_duration_since(Instant::now()));
            let observation = match tokio::time::timeout(budget, probe.observe()).await {
                Ok(observation) => observation,
                Err(_) => Observation::Unreachable(format!("no answer within {:?}", budget)),
            };
            tracing::debug!("health check {} poll {}: {:?}", spec.name, attempts, observation);

            match observation {
                Observation::Healthy(detail) => {
                    return report(ProbeOutcome::Healthy, attempts, Some(detail));
                }
                Observation::Unhealthy(detail) => {
                    consecutive_failures += 1;
                    last_observed = Some(detail);
                    if spec
                        .failure_threshold
                        .is_some_and(|threshold| consecutive_failures >= threshold)
                    {
                        return report(ProbeOutcome::Failed, attempts, last_observed);
                    }
                }
                Observation::Unreachable(detail) => {
                    consecutive_failures = 0;
                    last_observed = Some(detail);
                }
            }

            let next_poll = start + spec.interval.max(MIN_INTERVAL).saturating_mul(attempts);
            if next_poll >= deadline {
                tokio::time::sleep_until(deadline).await;
                return report(ProbeOutcome::TimedOut, attempts, last_observed);
            }
            tokio::time::sleep_until(next_poll).await;
        }
    }
}
