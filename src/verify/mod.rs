// ABOUTME: Backup/Verification Stage: a fixed post-rollout checklist and a best-effort snapshot.
// ABOUTME: Checklist failures fail the stage; snapshot failures only produce warnings.

use crate::deploy::{OutputValue, Outputs, StageAction, StageContext, StageError};
use crate::diagnostics::Warning;
use crate::health::{HttpProbe, Observation, Probe};
use crate::ssh::{CommandRunner, TargetHost, shell};
use crate::template::{self, Vars};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// What to verify once the workload is live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VerifySettings {
    /// systemd units (or compose services) that must be active.
    #[serde(default)]
    pub services: Vec<String>,

    /// Command on the host that exits zero when the database answers.
    #[serde(default)]
    pub database_command: Option<String>,

    /// URL fetched once; `https` URLs are fetched from the host itself.
    #[serde(default)]
    pub smoke_url: Option<String>,

    #[serde(default = "default_smoke_status")]
    pub smoke_expect_status: u16,

    /// Command that dumps state and ships it off the host.
    #[serde(default)]
    pub snapshot_command: Option<String>,

    #[serde(default = "default_check_timeout", with = "humantime_serde")]
    pub check_timeout: Duration,

    #[serde(default = "default_snapshot_timeout", with = "humantime_serde")]
    pub snapshot_timeout: Duration,
}

fn default_smoke_status() -> u16 {
    200
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_snapshot_timeout() -> Duration {
    Duration::from_secs(900)
}

/// One checklist entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    ServiceUp(String),
    DatabaseReachable(String),
    Smoke { url: String, expect_status: u16 },
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::ServiceUp(unit) => write!(f, "service {}", unit),
            Check::DatabaseReachable(_) => write!(f, "database"),
            Check::Smoke { url, .. } => write!(f, "smoke request {}", url),
        }
    }
}

impl VerifySettings {
    /// The checklist in its fixed order: services, database, smoke request.
    pub fn checklist(&self, vars: &Vars<'_>) -> Result<Vec<Check>, StageError> {
        let mut checks: Vec<Check> = self.services.iter().cloned().map(Check::ServiceUp).collect();
        if let Some(command) = &self.database_command {
            checks.push(Check::DatabaseReachable(template::render(command, vars)?));
        }
        if let Some(url) = &self.smoke_url {
            checks.push(Check::Smoke {
                url: template::render(url, vars)?,
                expect_status: self.smoke_expect_status,
            });
        }
        Ok(checks)
    }
}

pub struct VerifyStage {
    settings: VerifySettings,
    runner: Arc<dyn CommandRunner>,
    host: TargetHost,
}

impl VerifyStage {
    /// `host.address` may be a placeholder such as `${public_address}`.
    pub fn new(settings: VerifySettings, runner: Arc<dyn CommandRunner>, host: TargetHost) -> Self {
        Self {
            settings,
            runner,
            host,
        }
    }

    async fn remote_ok(&self, host: &TargetHost, command: &str) -> Result<(), String> {
        match self
            .runner
            .run(host, command, self.settings.check_timeout)
            .await
        {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(format!(
                "exit {}: {}",
                output.exit_code,
                output.stderr.trim()
            )),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn run_check(&self, host: &TargetHost, check: &Check) -> Result<(), String> {
        match check {
            Check::ServiceUp(unit) => {
                self.remote_ok(host, &format!("systemctl is-active --quiet {}", shell::quote(unit)))
                    .await
            }
            Check::DatabaseReachable(command) => self.remote_ok(host, command).await,
            Check::Smoke { url, expect_status } if url.starts_with("http://") => {
                let probe = HttpProbe::new(url, *expect_status, None).map_err(|e| e.to_string())?;
                let observed =
                    tokio::time::timeout(self.settings.check_timeout, probe.observe()).await;
                match observed {
                    Ok(Observation::Healthy(_)) => Ok(()),
                    Ok(other) => Err(other.detail().to_string()),
                    Err(_) => Err(format!("no answer within {:?}", self.settings.check_timeout)),
                }
            }
            Check::Smoke { url, expect_status } => {
                let command = format!(
                    "curl -sS -o /dev/null -w '%{{http_code}}' --max-time {} {}",
                    self.settings.check_timeout.as_secs().max(1),
                    shell::quote(url)
                );
                let output = self
                    .runner
                    .run(host, &command, self.settings.check_timeout)
                    .await
                    .map_err(|e| e.to_string())?;
                let status = output.stdout.trim();
                if output.success() && status == expect_status.to_string() {
                    Ok(())
                } else {
                    Err(format!("HTTP {} (expected {})", status, expect_status))
                }
            }
        }
    }

    /// Take the snapshot; failures become warnings.
    async fn snapshot(&self, ctx: &StageContext, host: &TargetHost, vars: &Vars<'_>) -> &'static str {
        let Some(template) = &self.settings.snapshot_command else {
            return "skipped";
        };
        let failure = match template::render(template, vars) {
            Err(e) => e.to_string(),
            Ok(command) => match self
                .runner
                .run(host, &command, self.settings.snapshot_timeout)
                .await
            {
                Ok(output) if output.success() => {
                    tracing::info!("state snapshot taken");
                    return "taken";
                }
                Ok(output) => format!("exit {}: {}", output.exit_code, output.stderr.trim()),
                Err(e) => e.to_string(),
            },
        };
        ctx.warn(Warning::snapshot_failed(format!(
            "state snapshot failed: {}",
            failure
        )));
        "failed"
    }
}

#[async_trait]
impl StageAction for VerifyStage {
    async fn run(&self, ctx: &StageContext) -> Result<Outputs, StageError> {
        let vars = ctx.outputs.flatten();
        let host = self.host.render(&vars)?;
        let checks = self.settings.checklist(&vars)?;

        let mut failures = Vec::new();
        for check in &checks {
            match self.run_check(&host, check).await {
                Ok(()) => tracing::info!("verified {}", check),
                Err(e) => {
                    tracing::warn!("verification of {} failed: {}", check, e);
                    failures.push(format!("{}: {}", check, e));
                }
            }
        }
        if !failures.is_empty() {
            return Err(StageError::verification(format!(
                "{} of {} checks failed: {}",
                failures.len(),
                checks.len(),
                failures.join("; ")
            )));
        }

        let snapshot = self.snapshot(ctx, &host, &vars).await;
        Ok(Outputs::from([
            (
                "verified_checks".to_string(),
                OutputValue::text(checks.len().to_string()),
            ),
            ("snapshot".to_string(), OutputValue::text(snapshot)),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::{OutputView, StageErrorKind};
    use crate::ssh::CommandOutput;
    use crate::types::StageName;
    use parking_lot::Mutex;

    /// Fails any command containing one of `failing`.
    struct ScriptedRunner {
        failing: Vec<&'static str>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            _host: &TargetHost,
            command: &str,
            _timeout: Duration,
        ) -> crate::ssh::Result<CommandOutput> {
            self.seen.lock().push(command.to_string());
            let fail = self.failing.iter().any(|f| command.contains(f));
            Ok(CommandOutput {
                exit_code: if fail { 1 } else { 0 },
                stdout: if command.starts_with("curl") { "200".to_string() } else { String::new() },
                stderr: if fail { "nope".to_string() } else { String::new() },
            })
        }
    }

    fn settings() -> VerifySettings {
        VerifySettings {
            services: vec!["app".to_string(), "worker".to_string()],
            database_command: Some("pg_isready -h localhost".to_string()),
            smoke_url: Some("https://app.example.org/".to_string()),
            snapshot_command: Some("backup.sh".to_string()),
            smoke_expect_status: 200,
            check_timeout: Duration::from_secs(5),
            snapshot_timeout: Duration::from_secs(5),
        }
    }

    fn run_stage(failing: Vec<&'static str>) -> (VerifyStage, Arc<ScriptedRunner>) {
        let runner = Arc::new(ScriptedRunner {
            failing,
            seen: Mutex::new(Vec::new()),
        });
        let stage = VerifyStage::new(settings(), runner.clone(), TargetHost::new("10.0.0.1", "deploy"));
        (stage, runner)
    }

    fn ctx() -> StageContext {
        StageContext::detached(StageName::new("verify").unwrap(), OutputView::default())
    }

    #[tokio::test]
    async fn runs_checklist_in_order_then_snapshots() {
        let (stage, runner) = run_stage(vec![]);
        let outputs = stage.run(&ctx()).await.unwrap();
        assert_eq!(outputs["verified_checks"].expose(), Some("4"));
        assert_eq!(outputs["snapshot"].expose(), Some("taken"));

        let seen = runner.seen.lock();
        assert_eq!(seen[0], "systemctl is-active --quiet 'app'");
        assert_eq!(seen[2], "pg_isready -h localhost");
        assert!(seen[3].starts_with("curl"));
        assert_eq!(seen[4], "backup.sh");
    }

    #[tokio::test]
    async fn snapshot_failure_is_only_a_warning() {
        let (stage, _) = run_stage(vec!["backup.sh"]);
        let ctx = ctx();
        let outputs = stage.run(&ctx).await.unwrap();
        assert_eq!(outputs["snapshot"].expose(), Some("failed"));
        assert_eq!(ctx.warnings().len(), 1);
    }

    #[tokio::test]
    async fn failed_checks_are_all_reported_and_skip_snapshot() {
        let (stage, runner) = run_stage(vec!["worker", "pg_isready"]);
        let err = stage.run(&ctx()).await.unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Verification);
        assert!(err.message.starts_with("2 of 4 checks failed"));
        assert!(!runner.seen.lock().iter().any(|c| c == "backup.sh"));
    }
}
