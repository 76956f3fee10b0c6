// ABOUTME: Stages that act on the target host: bootstrap commands, workload rollout, migrations.
// ABOUTME: Command exit codes are interpreted here; transport failures come from the executor.

use crate::config::CommandSpec;
use crate::deploy::{
    OutputValue, Outputs, Precondition, StageAction, StageContext, StageError, StageErrorKind,
};
use crate::diagnostics::Warning;
use crate::ssh::{CommandOutput, CommandRunner, TargetHost, shell};
use crate::template::{self, Vars};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// The host plus values shared by every remote stage.
#[derive(Clone)]
pub struct RemoteTarget {
    pub runner: Arc<dyn CommandRunner>,
    /// Address may be a placeholder.
    pub host: TargetHost,
    pub timeout: Duration,
    /// Project-level template values.
    pub values: Arc<BTreeMap<String, String>>,
}

impl RemoteTarget {
    /// Template values: project values overlaid by stage outputs.
    fn vars<'a>(&'a self, ctx: &'a StageContext) -> Vars<'a> {
        let mut vars: Vars<'a> = self
            .values
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        vars.extend(ctx.outputs.flatten());
        vars
    }

    fn host(&self, vars: &Vars<'_>) -> Result<TargetHost, StageError> {
        Ok(self.host.render(vars)?)
    }

    /// Run a rendered command. Only `shown`, the unrendered form, is logged.
    async fn run(
        &self,
        host: &TargetHost,
        command: &str,
        shown: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, StageError> {
        tracing::debug!("{}: {}", host, shown);
        Ok(self
            .runner
            .run(host, command, timeout.unwrap_or(self.timeout))
            .await?)
    }
}

/// Failure for a non-zero exit. `shown` is the unrendered command; secrets
/// echoed on stderr are redacted.
fn exit_failure(
    ctx: &StageContext,
    kind: StageErrorKind,
    shown: &str,
    output: &CommandOutput,
) -> StageError {
    let detail = output
        .stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no error output");
    StageError::new(
        kind,
        format!(
            "`{}` exited with {}: {}",
            shown,
            output.exit_code,
            ctx.outputs.redact(detail)
        ),
    )
}

/// Runs a list of commands in order.
///
/// A command marked best-effort only warns when it fails; any other failure
/// stops the stage. With a marker path the stage records completion on the
/// host and reports itself satisfied when re-entered.
pub struct CommandsStage {
    label: String,
    commands: Vec<CommandSpec>,
    target: RemoteTarget,
    marker: Option<String>,
}

impl CommandsStage {
    pub fn new(label: impl Into<String>, commands: Vec<CommandSpec>, target: RemoteTarget) -> Self {
        Self {
            label: label.into(),
            commands,
            target,
            marker: None,
        }
    }

    /// Record completion in `$HOME/.shipwright/<project>/<name>.done`.
    pub fn with_marker(mut self, project: &str, name: &str) -> Self {
        self.marker = Some(format!("$HOME/.shipwright/{}/{}.done", project, name));
        self
    }
}

#[async_trait]
impl StageAction for CommandsStage {
    async fn run(&self, ctx: &StageContext) -> Result<Outputs, StageError> {
        let vars = self.target.vars(ctx);
        let host = self.target.host(&vars)?;

        let mut warnings = 0;
        for spec in &self.commands {
            let command = template::render(&spec.run, &vars)?;
            let output = self
                .target
                .run(&host, &command, &spec.run, spec.timeout)
                .await?;
            if output.success() {
                continue;
            }
            let failure = exit_failure(ctx, StageErrorKind::Fatal, &spec.run, &output);
            if spec.best_effort {
                warnings += 1;
                ctx.warn(Warning::best_effort_command(format!(
                    "{} command failed: {}",
                    self.label, failure.message
                )));
            } else {
                return Err(failure);
            }
        }

        if let Some(marker) = &self.marker {
            let command = format!(
                "mkdir -p \"$(dirname \"{marker}\")\" && touch \"{marker}\"",
                marker = marker
            );
            let output = self.target.run(&host, &command, &command, None).await?;
            if !output.success() {
                return Err(exit_failure(ctx, StageErrorKind::Transient, &command, &output));
            }
        }

        tracing::info!(
            "{} finished: {} command(s), {} best-effort failure(s)",
            self.label,
            self.commands.len(),
            warnings
        );
        Ok(Outputs::new())
    }

    async fn check_preconditions(&self, ctx: &StageContext) -> Result<Precondition, StageError> {
        let Some(marker) = &self.marker else {
            return Ok(Precondition::Ready);
        };
        let vars = self.target.vars(ctx);
        let host = self.target.host(&vars)?;
        let test = format!("test -f \"{}\"", marker);
        let output = self.target.run(&host, &test, &test, None).await?;
        if output.success() {
            tracing::info!("{} already completed on {}", self.label, host);
            Ok(Precondition::AlreadySatisfied(Outputs::new()))
        } else {
            Ok(Precondition::Ready)
        }
    }
}

/// Where the workload descriptor goes and how it is started.
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    /// Descriptor template contents.
    pub template: String,
    pub remote_path: String,
    pub start_command: String,
    pub stop_command: Option<String>,
}

/// Renders the workload descriptor, installs it, and starts the workload.
///
/// The descriptor found before the run's first attempt is kept for rollback;
/// retries and resumes of the same run do not replace it.
pub struct WorkloadStage {
    spec: WorkloadSpec,
    target: RemoteTarget,
}

impl WorkloadStage {
    pub fn new(spec: WorkloadSpec, target: RemoteTarget) -> Self {
        Self { spec, target }
    }
}

#[async_trait]
impl StageAction for WorkloadStage {
    async fn run(&self, ctx: &StageContext) -> Result<Outputs, StageError> {
        let vars = self.target.vars(ctx);
        let host = self.target.host(&vars)?;
        let descriptor = template::render(&self.spec.template, &vars)?;
        let path = self.spec.remote_path.as_str();

        let install = format!(
            "{} && {}",
            shell::backup_file(path, ctx.run_id.as_str()),
            shell::write_file(path, &descriptor)
        );
        let shown = format!("install {}", path);
        let output = self.target.run(&host, &install, &shown, None).await?;
        if !output.success() {
            return Err(exit_failure(ctx, StageErrorKind::Fatal, &shown, &output));
        }

        let start = template::render(&self.spec.start_command, &vars)?;
        let output = self
            .target
            .run(&host, &start, &self.spec.start_command, None)
            .await?;
        if !output.success() {
            return Err(exit_failure(
                ctx,
                StageErrorKind::Transient,
                &self.spec.start_command,
                &output,
            ));
        }

        tracing::info!("workload started on {}", host);
        Ok(Outputs::from([(
            "workload_path".to_string(),
            OutputValue::text(path),
        )]))
    }

    fn compensates(&self) -> bool {
        true
    }

    async fn compensate(&self, ctx: &StageContext) -> Result<(), StageError> {
        let vars = self.target.vars(ctx);
        let host = self.target.host(&vars)?;

        if let Some(shown) = &self.spec.stop_command {
            let stop = template::render(shown, &vars)?;
            let output = self.target.run(&host, &stop, shown, None).await?;
            if !output.success() {
                tracing::warn!("stopping workload failed: exit {}", output.exit_code);
            }
        }

        let restore = shell::restore_file(&self.spec.remote_path, ctx.run_id.as_str());
        let shown = format!("restore {}", self.spec.remote_path);
        let output = self.target.run(&host, &restore, &shown, None).await?;
        if !output.success() {
            return Err(exit_failure(ctx, StageErrorKind::Fatal, &shown, &output));
        }
        Ok(())
    }
}
