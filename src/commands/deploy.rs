// ABOUTME: Deploy command implementation.
// ABOUTME: Loads or creates run state, takes the run lock, and drives the stage runner.

use super::{parse_run_id, store_for};
use shipwright::config::Config;
use shipwright::deploy::{
    CancelHandle, DeployError, DeploymentState, RunLock, RunOptions, RunStatus, StageRunner,
    StateStore,
};
use shipwright::diagnostics::Warning;
use shipwright::error::{Error, Result};
use shipwright::output::Output;
use shipwright::pipeline::{Collaborators, build_plan};
use shipwright::ssh::RemoteExecutor;
use shipwright::types::StageName;
use std::collections::BTreeSet;
use std::sync::Arc;

/// What the operator asked `deploy` to do.
#[derive(Debug, Default)]
pub struct DeployRequest {
    pub resume: bool,
    pub run_id: Option<String>,
    pub force_stages: Vec<String>,
    pub force_unlock: bool,
    pub workers: Option<usize>,
}

/// Run or resume a deployment and report its final status.
pub async fn deploy(config: Config, request: DeployRequest, mut output: Output) -> Result<RunStatus> {
    config.validate()?;
    output.start_timer();

    let store = store_for(&config);
    let run_id = match (&request.run_id, request.resume) {
        (Some(id), _) => parse_run_id(id)?,
        (None, true) => store.latest()?.ok_or(Error::NoPreviousRun)?,
        (None, false) => config.new_run_id(),
    };
    let resuming = request.resume || request.run_id.is_some();
    let state = if resuming {
        store
            .load(&run_id)?
            .ok_or_else(|| DeployError::RunNotFound(run_id.clone()))?
    } else {
        DeploymentState::new(run_id.clone())
    };

    output.progress(&format!(
        "{} {} ({}) in {}",
        if resuming { "Resuming" } else { "Deploying" },
        config.project,
        run_id,
        config.region
    ));

    let lock = RunLock::acquire(store.dir(), &run_id, request.force_unlock)?;

    let executor = Arc::new(RemoteExecutor::ssh(config.host.connect_policy()));
    let collaborators = Collaborators::live(&config, executor.clone());
    let plan = build_plan(&config, &collaborators)?;

    let mut force = BTreeSet::new();
    for name in &request.force_stages {
        let stage = StageName::new(name)
            .ok()
            .filter(|stage| plan.get(stage).is_some())
            .ok_or_else(|| Error::InvalidConfig(format!("unknown stage '{}'", name)))?;
        force.insert(stage);
    }

    let (cancel, signal) = CancelHandle::new();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping the run");
            cancel.cancel();
        }
    });

    let options = RunOptions {
        workers: request.workers.unwrap_or(config.runner.workers),
        force,
        seed: rand::random(),
    };
    let result = StageRunner::new(&store, signal, options).run(&plan, state).await;
    interrupt.abort();

    let mut warnings = executor.disconnect_all().await;
    if let Err(e) = lock.release() {
        warnings.push(Warning::lock_release(format!("failed to release run lock: {}", e)));
    }
    let mut report = result?;
    report.warnings.extend(warnings);

    output.stages(&report.state, &plan.topological_order());
    output.report(&report, &store.location(&run_id));
    Ok(report.outcome.status())
}
