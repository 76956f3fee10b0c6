// ABOUTME: The stage runner: dispatches eligible stages, retries with backoff, persists, rolls back.
// ABOUTME: All state mutation happens on the runner's single writer path between awaits.

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::Instrument;

use super::context::{CancelSignal, OutputView, StageContext};
use super::error::{DeployError, StageError, StageErrorKind};
use super::plan::{DeploymentPlan, Precondition, Stage};
use super::retry::Backoff;
use super::state::{DeploymentState, Outputs, RunStatus, StageFailure, StageStatus};
use super::store::StateStore;
use crate::diagnostics::{Diagnostics, Warning};
use crate::types::StageName;

/// Knobs for one invocation of the runner.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum number of stages in flight at once.
    pub workers: usize,
    /// Stages to re-run even if they already succeeded.
    pub force: BTreeSet<StageName>,
    /// Seed for backoff jitter.
    pub seed: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            force: BTreeSet::new(),
            seed: 0,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every required stage succeeded.
    Succeeded,
    /// A stage failed for good; rollback ran.
    Failed {
        stage: StageName,
        attempts: u32,
        error: StageFailure,
    },
    /// A stage deferred itself, or required stages never became eligible.
    Blocked { stage: StageName, reason: String },
    /// The operator aborted the run; rollback ran.
    Cancelled { stage: Option<StageName> },
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Succeeded => RunStatus::Succeeded,
            RunOutcome::Failed { .. } => RunStatus::Failed,
            RunOutcome::Blocked { .. } => RunStatus::Blocked,
            RunOutcome::Cancelled { .. } => RunStatus::Cancelled,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Succeeded => write!(f, "all stages succeeded"),
            RunOutcome::Failed {
                stage,
                attempts,
                error,
            } => write!(
                f,
                "stage '{}' failed after {} attempt(s): {}",
                stage, attempts, error
            ),
            RunOutcome::Blocked { stage, reason } => {
                write!(f, "stage '{}' is blocked: {}", stage, reason)
            }
            RunOutcome::Cancelled { stage: Some(stage) } => {
                write!(f, "run aborted by operator during stage '{}'", stage)
            }
            RunOutcome::Cancelled { stage: None } => write!(f, "run aborted by operator"),
        }
    }
}

/// Final result of [`StageRunner::run`].
#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub state: DeploymentState,
    pub warnings: Vec<Warning>,
    /// Stages whose compensating action was invoked, in invocation order.
    pub rollback_order: Vec<StageName>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }
}

/// Executes a [`DeploymentPlan`] against a [`DeploymentState`].
pub struct StageRunner<'s> {
    store: &'s dyn StateStore,
    cancel: CancelSignal,
    options: RunOptions,
}

/// Something the dispatch loop waits on.
enum Event {
    /// An attempt finished.
    Done {
        stage: StageName,
        result: Result<Outputs, StageError>,
    },
    /// A backoff delay ran out, or was cut short because the run halted.
    RetryDue(StageName),
}

struct Halt {
    stage: Option<StageName>,
    cancelled: bool,
}

enum Next {
    Settled,
    Retry(Duration),
}

/// Bookkeeping for one invocation. Only touched between awaits.
struct Run<'p> {
    plan: &'p DeploymentPlan,
    state: DeploymentState,
    diagnostics: Arc<Mutex<Diagnostics>>,
    backoffs: HashMap<StageName, Backoff>,
    deferred: HashSet<StageName>,
    previously_attempted: HashSet<StageName>,
    halt: Option<Halt>,
    cancel: CancelSignal,
}

impl<'s> StageRunner<'s> {
    pub fn new(store: &'s dyn StateStore, cancel: CancelSignal, options: RunOptions) -> Self {
        Self {
            store,
            cancel,
            options,
        }
    }

    /// Run every eligible stage of `plan`, starting from `state`.
    ///
    /// `state` is empty for a fresh run or loaded from the store for a resume.
    /// Stage failures are reported in the returned [`RunReport`]; an `Err` means
    /// the runner itself could not continue (for example, state could not be
    /// persisted).
    pub async fn run(
        &self,
        plan: &DeploymentPlan,
        state: DeploymentState,
    ) -> Result<RunReport, DeployError> {
        let mut run = Run::begin(plan, state, &self.options, self.cancel.clone());
        self.store.save(&run.state)?;
        tracing::info!(
            "starting run {} ({} stages, {} workers)",
            run.state.run_id,
            plan.len(),
            self.options.workers
        );

        if run.rehydrate().await {
            self.store.save(&run.state)?;
        }

        let workers = self.options.workers.max(1);
        let mut in_flight: FuturesUnordered<BoxFuture<'_, Event>> = FuturesUnordered::new();
        let mut running: HashSet<StageName> = HashSet::new();
        let (halted_tx, halted_rx) = watch::channel(false);

        loop {
            run.check_cancelled();
            if run.halt.is_some() {
                halted_tx.send_replace(true);
            } else {
                for stage in plan.ordered() {
                    if running.len() >= workers {
                        break;
                    }
                    if running.contains(&stage.name) || !run.is_eligible(stage) {
                        continue;
                    }
                    let ctx = run.start_attempt(stage);
                    self.store.save(&run.state)?;
                    running.insert(stage.name.clone());
                    let precheck = run.needs_precheck(stage, ctx.attempt);
                    in_flight.push(attempt(stage, ctx, precheck));
                }
            }

            let Some(event) = in_flight.next().await else {
                break;
            };
            match event {
                Event::Done { stage, result } => {
                    let Some(stage) = plan.get(&stage) else {
                        continue;
                    };
                    match run.apply(stage, result) {
                        Next::Settled => {
                            running.remove(&stage.name);
                        }
                        Next::Retry(delay) => {
                            in_flight.push(retry_after(
                                stage.name.clone(),
                                delay,
                                halted_rx.clone(),
                                self.cancel.clone(),
                            ));
                        }
                    }
                }
                Event::RetryDue(stage) => {
                    let Some(stage) = plan.get(&stage) else {
                        continue;
                    };
                    run.check_cancelled();
                    if run.halt.is_some() {
                        run.abandon_retry(stage);
                        running.remove(&stage.name);
                    } else {
                        let ctx = run.start_attempt(stage);
                        let precheck = run.needs_precheck(stage, ctx.attempt);
                        in_flight.push(attempt(stage, ctx, precheck));
                    }
                }
            }
            self.store.save(&run.state)?;
        }

        let mut rollback_order = Vec::new();
        if run.halt.is_some() {
            rollback_order = run.rollback(self.store).await?;
        }

        let outcome = run.outcome();
        run.state.status = outcome.status();
        run.state.touch();
        self.store.save(&run.state)?;

        match &outcome {
            RunOutcome::Succeeded => tracing::info!("run {} succeeded", run.state.run_id),
            other => tracing::error!("run {} ended: {}", run.state.run_id, other),
        }

        let warnings = run.diagnostics.lock().warnings().to_vec();
        Ok(RunReport {
            outcome,
            state: run.state,
            warnings,
            rollback_order,
        })
    }
}

/// One invocation of a stage action.
fn attempt(stage: &Stage, ctx: StageContext, precheck: bool) -> BoxFuture<'_, Event> {
    let span = tracing::info_span!("stage", name = %stage.name, attempt = ctx.attempt);
    async move {
        let result = tokio::select! {
            result = execute(stage, &ctx, precheck) => result,
            _ = ctx.cancel.cancelled() => Err(StageError::cancelled()),
        };
        Event::Done {
            stage: stage.name.clone(),
            result,
        }
    }
    .instrument(span)
    .boxed()
}

/// Wait out a backoff delay. Wakes early once the run halts or is cancelled.
fn retry_after(
    stage: StageName,
    delay: Duration,
    mut halted: watch::Receiver<bool>,
    cancel: CancelSignal,
) -> BoxFuture<'static, Event> {
    async move {
        tracing::debug!("stage {} backing off {:?}", stage, delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = halted.wait_for(|halted| *halted) => {}
            _ = cancel.cancelled() => {}
        }
        Event::RetryDue(stage)
    }
    .boxed()
}

async fn execute(
    stage: &Stage,
    ctx: &StageContext,
    precheck: bool,
) -> Result<Outputs, StageError> {
    let work = async {
        if precheck {
            match stage.action.check_preconditions(ctx).await? {
                Precondition::AlreadySatisfied(outputs) => {
                    tracing::info!("preconditions show stage already completed");
                    return Ok(outputs);
                }
                Precondition::Ready => {}
            }
        }
        stage.action.run(ctx).await
    };

    match tokio::time::timeout(stage.retry.timeout, work).await {
        Ok(result) => result,
        Err(_) => Err(StageError::timeout(stage.retry.timeout)),
    }
}

impl<'p> Run<'p> {
    fn begin(
        plan: &'p DeploymentPlan,
        mut state: DeploymentState,
        options: &RunOptions,
        cancel: CancelSignal,
    ) -> Self {
        let mut previously_attempted = HashSet::new();
        let mut backoffs = HashMap::new();

        for (i, stage) in plan.stages().iter().enumerate() {
            backoffs.insert(
                stage.name.clone(),
                stage.retry.schedule(options.seed.wrapping_add(i as u64)),
            );

            let forced = options.force.contains(&stage.name);
            let result = state.result_mut(&stage.name);
            if result.status == StageStatus::Succeeded && !forced {
                continue;
            }
            if !forced && (result.status != StageStatus::Pending || result.attempts > 0) {
                previously_attempted.insert(stage.name.clone());
            }
            result.status = StageStatus::Pending;
            result.attempts = 0;
            result.started_at = None;
            result.finished_at = None;
            result.completion_seq = None;
            result.backoff_ms.clear();
            result.rollback_error = None;
        }

        state.status = RunStatus::Running;
        state.touch();

        Self {
            plan,
            state,
            diagnostics: Arc::default(),
            backoffs,
            deferred: HashSet::new(),
            previously_attempted,
            halt: None,
            cancel,
        }
    }

    fn context(&self, stage: &StageName, attempt: u32, cancel: CancelSignal) -> StageContext {
        StageContext::new(
            self.state.run_id.clone(),
            stage.clone(),
            attempt,
            OutputView::new(self.state.outputs.clone()),
            cancel,
            Arc::clone(&self.diagnostics),
        )
    }

    /// Recover redacted outputs of already-succeeded stages.
    ///
    /// Returns whether state changed. A stage that cannot be rehydrated is
    /// reset so it runs again.
    async fn rehydrate(&mut self) -> bool {
        let plan = self.plan;
        let mut changed = false;
        for stage in plan.ordered() {
            if self.state.status_of(&stage.name) != StageStatus::Succeeded
                || !self.state.has_redacted_outputs(&stage.name)
            {
                continue;
            }

            let ctx = self.context(&stage.name, 0, self.cancel.clone());
            let recovered =
                match tokio::time::timeout(stage.retry.timeout, stage.action.rehydrate(&ctx)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(StageError::timeout(stage.retry.timeout)),
                };

            match recovered {
                Ok(outputs) => {
                    tracing::debug!("rehydrated {} output(s) of {}", outputs.len(), stage.name);
                    self.state
                        .outputs
                        .entry(stage.name.clone())
                        .or_default()
                        .extend(outputs);
                }
                Err(e) => {
                    let error = self.state.redact(&e.to_string());
                    self.diagnostics.lock().warn(Warning::rehydrate_failed(format!(
                        "could not recover outputs of stage '{}', it will run again: {}",
                        stage.name, error
                    )));
                    let result = self.state.result_mut(&stage.name);
                    result.status = StageStatus::Pending;
                    result.completion_seq = None;
                    self.previously_attempted.insert(stage.name.clone());
                    changed = true;
                }
            }
        }
        changed
    }

    fn check_cancelled(&mut self) {
        if self.halt.is_none() && self.cancel.is_cancelled() {
            tracing::warn!("run {} cancelled by operator", self.state.run_id);
            self.halt = Some(Halt {
                stage: None,
                cancelled: true,
            });
        }
    }

    fn is_eligible(&self, stage: &Stage) -> bool {
        self.state.status_of(&stage.name) == StageStatus::Pending
            && !self.deferred.contains(&stage.name)
            && stage
                .depends_on
                .iter()
                .all(|dep| self.state.status_of(dep) == StageStatus::Succeeded)
    }

    fn needs_precheck(&self, stage: &Stage, attempt: u32) -> bool {
        !stage.idempotent && (attempt > 1 || self.previously_attempted.contains(&stage.name))
    }

    fn start_attempt(&mut self, stage: &Stage) -> StageContext {
        let result = self.state.result_mut(&stage.name);
        result.status = StageStatus::Running;
        result.attempts += 1;
        result.started_at.get_or_insert_with(Utc::now);
        let attempt = result.attempts;
        self.state.touch();

        tracing::info!("stage {} running (attempt {})", stage.name, attempt);
        self.context(&stage.name, attempt, self.cancel.clone())
    }

    fn apply(&mut self, stage: &Stage, result: Result<Outputs, StageError>) -> Next {
        let result = result.and_then(|outputs| self.check_output_keys(stage, outputs));
        self.state.touch();

        match result {
            Ok(outputs) => {
                let seq = self.state.next_completion_seq();
                self.state.outputs.insert(stage.name.clone(), outputs);
                let record = self.state.result_mut(&stage.name);
                record.status = StageStatus::Succeeded;
                record.finished_at = Some(Utc::now());
                record.completion_seq = Some(seq);
                tracing::info!(
                    "stage {} succeeded after {} attempt(s)",
                    stage.name,
                    record.attempts
                );
                Next::Settled
            }
            Err(err) => self.apply_failure(stage, err),
        }
    }

    fn apply_failure(&mut self, stage: &Stage, mut err: StageError) -> Next {
        if !err.partial_outputs.is_empty() {
            self.state
                .outputs
                .entry(stage.name.clone())
                .or_default()
                .extend(err.partial_outputs.clone());
        }
        err.message = self.state.redact(&err.message);

        let halted = self.halt.is_some() || self.cancel.is_cancelled();
        let record = self.state.result_mut(&stage.name);
        record.last_error = Some(StageFailure::from(&err));

        if err.kind == StageErrorKind::Deferred {
            record.status = StageStatus::Pending;
            self.deferred.insert(stage.name.clone());
            tracing::warn!("stage {} deferred: {}", stage.name, err.message);
            return Next::Settled;
        }

        if err.is_retryable() && record.attempts < stage.retry.max_attempts && !halted {
            let delay = self
                .backoffs
                .get_mut(&stage.name)
                .map(Backoff::next_delay)
                .unwrap_or(stage.retry.base);
            record
                .backoff_ms
                .push(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
            tracing::warn!(
                "stage {} attempt {}/{} failed: {}; retrying in {:?}",
                stage.name,
                record.attempts,
                stage.retry.max_attempts,
                err,
                delay
            );
            return Next::Retry(delay);
        }

        let attempts = record.attempts;
        record.status = StageStatus::Failed;
        record.finished_at = Some(Utc::now());
        let seq = self.state.next_completion_seq();
        self.state.result_mut(&stage.name).completion_seq = Some(seq);

        if stage.best_effort && err.kind != StageErrorKind::Cancelled {
            self.diagnostics.lock().warn(Warning::best_effort_stage(format!(
                "best-effort stage '{}' failed after {} attempt(s): {}",
                stage.name, attempts, err
            )));
            return Next::Settled;
        }

        tracing::error!(
            "stage {} failed after {} attempt(s): {}",
            stage.name,
            attempts,
            err
        );
        if self.halt.is_none() {
            self.halt = Some(Halt {
                stage: Some(stage.name.clone()),
                cancelled: err.kind == StageErrorKind::Cancelled,
            });
        }
        Next::Settled
    }

    /// Give up on a retry that was still waiting when the run halted.
    ///
    /// The stage keeps the error of its last real attempt.
    fn abandon_retry(&mut self, stage: &Stage) {
        let seq = self.state.next_completion_seq();
        let record = self.state.result_mut(&stage.name);
        record.status = StageStatus::Failed;
        record.finished_at = Some(Utc::now());
        record.completion_seq = Some(seq);
        tracing::warn!(
            "stage {} not retried after {} attempt(s): run halted",
            stage.name,
            record.attempts
        );
        self.state.touch();
    }

    /// Output keys are owned by the first stage that produces them.
    fn check_output_keys(&self, stage: &Stage, outputs: Outputs) -> Result<Outputs, StageError> {
        for key in outputs.keys() {
            if let Some(owner) = self.state.owner_of(key, &stage.name) {
                return Err(StageError::fatal(format!(
                    "output '{}' is already produced by stage '{}'",
                    key, owner
                )));
            }
        }
        Ok(outputs)
    }

    /// Invoke compensating actions in reverse completion order.
    ///
    /// Compensation failures are recorded and unwinding continues.
    async fn rollback(&mut self, store: &dyn StateStore) -> Result<Vec<StageName>, DeployError> {
        let plan = self.plan;
        let mut targets: Vec<(u64, &'p Stage)> = plan
            .stages()
            .iter()
            .filter(|stage| stage.action.compensates())
            .filter_map(|stage| {
                let result = self.state.result(&stage.name)?;
                let eligible = match result.status {
                    StageStatus::Succeeded => true,
                    StageStatus::Failed => !stage.best_effort,
                    _ => false,
                };
                eligible
                    .then_some(result.completion_seq)
                    .flatten()
                    .map(|seq| (seq, stage))
            })
            .collect();
        targets.sort_by(|a, b| b.0.cmp(&a.0));

        if targets.is_empty() {
            return Ok(Vec::new());
        }
        tracing::warn!("rolling back {} stage(s)", targets.len());

        let mut order = Vec::with_capacity(targets.len());
        for (_, stage) in targets {
            let ctx = self.context(&stage.name, 0, CancelSignal::never());
            tracing::info!(
                "compensating stage {} ({})",
                stage.name,
                self.state.status_of(&stage.name)
            );

            let outcome = async {
                match tokio::time::timeout(stage.retry.timeout, stage.action.compensate(&ctx)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(StageError::timeout(stage.retry.timeout)),
                }
            }
            .instrument(tracing::info_span!("rollback", name = %stage.name))
            .await;

            order.push(stage.name.clone());
            self.state.touch();
            match outcome {
                Ok(()) => {
                    let record = self.state.result_mut(&stage.name);
                    if record.status == StageStatus::Succeeded {
                        record.status = StageStatus::RolledBack;
                    }
                    self.state.outputs.remove(&stage.name);
                }
                Err(e) => {
                    let error = self.state.redact(&e.to_string());
                    self.diagnostics.lock().warn(Warning::rollback_failed(format!(
                        "rollback of stage '{}' failed: {}",
                        stage.name, error
                    )));
                    self.state.result_mut(&stage.name).rollback_error = Some(error);
                }
            }
            store.save(&self.state)?;
        }
        Ok(order)
    }

    fn outcome(&self) -> RunOutcome {
        if let Some(halt) = &self.halt {
            if halt.cancelled {
                return RunOutcome::Cancelled {
                    stage: halt.stage.clone(),
                };
            }
            if let Some(stage) = &halt.stage {
                let result = self.state.result(stage).cloned().unwrap_or_default();
                return RunOutcome::Failed {
                    stage: stage.clone(),
                    attempts: result.attempts,
                    error: result.last_error.unwrap_or(StageFailure {
                        kind: StageErrorKind::Fatal,
                        message: "unknown failure".to_string(),
                    }),
                };
            }
        }

        if let Some(stage) = self
            .plan
            .ordered()
            .find(|stage| self.deferred.contains(&stage.name))
        {
            let reason = self
                .state
                .result(&stage.name)
                .and_then(|r| r.last_error.as_ref())
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "deferred".to_string());
            return RunOutcome::Blocked {
                stage: stage.name.clone(),
                reason,
            };
        }

        let unfinished = self.plan.ordered().find(|stage| {
            !stage.best_effort && self.state.status_of(&stage.name) != StageStatus::Succeeded
        });
        match unfinished {
            None => RunOutcome::Succeeded,
            Some(stage) => {
                let waiting: Vec<_> = stage
                    .depends_on
                    .iter()
                    .filter(|dep| self.state.status_of(dep) != StageStatus::Succeeded)
                    .map(|dep| dep.to_string())
                    .collect();
                RunOutcome::Blocked {
                    stage: stage.name.clone(),
                    reason: format!("dependencies did not succeed: {}", waiting.join(", ")),
                }
            }
        }
    }
}
