// ABOUTME: The healthcheck stage: every configured check must turn healthy before its deadline.
// ABOUTME: An unhealthy result is a verification failure, retried by the runner and then rolled back.

use super::{HealthCheckSpec, HealthProber};
use crate::deploy::{OutputValue, Outputs, StageAction, StageContext, StageError};
use crate::ssh::{CommandRunner, TargetHost};
use async_trait::async_trait;
use nonempty::NonEmpty;
use std::sync::Arc;

pub struct HealthcheckStage {
    checks: NonEmpty<HealthCheckSpec>,
    runner: Arc<dyn CommandRunner>,
    host: TargetHost,
}

impl HealthcheckStage {
    /// `host.address` may be a placeholder such as `${public_address}`.
    pub fn new(
        checks: NonEmpty<HealthCheckSpec>,
        runner: Arc<dyn CommandRunner>,
        host: TargetHost,
    ) -> Self {
        Self {
            checks,
            runner,
            host,
        }
    }
}

#[async_trait]
impl StageAction for HealthcheckStage {
    async fn run(&self, ctx: &StageContext) -> Result<Outputs, StageError> {
        let vars = ctx.outputs.flatten();
        let host = self.host.render(&vars)?;
        let prober = HealthProber::new().with_remote(Arc::clone(&self.runner), host);

        let mut outputs = Outputs::new();
        for check in &self.checks {
            let spec = check.resolve(&vars)?;
            let report = prober.wait_for(&spec).await?;
            if !report.is_healthy() {
                return Err(StageError::verification(format!("health check {}", report)));
            }
            tracing::info!("health check {}", report);
            outputs.insert(
                format!("health.{}", spec.name),
                OutputValue::text(format!("healthy after {} poll(s)", report.attempts)),
            );
        }
        Ok(outputs)
    }
}
