// ABOUTME: Test support utilities.
// ABOUTME: Scripted stage actions, an in-memory state store, and plan helpers.

use async_trait::async_trait;
use parking_lot::Mutex;
use shipwright::deploy::{
    DeployError, DeploymentState, Outputs, Precondition, RetryPolicy, Stage, StageAction,
    StageContext, StageError, StateStore,
};
use shipwright::types::{RunId, StageName};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests. Safe to call multiple times.
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter =
            EnvFilter::from_default_env().add_directive("shipwright=debug".parse().unwrap());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Ordered record of what actions did, shared across a plan.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

#[allow(dead_code)]
impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Entries with the given prefix, prefix stripped.
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter_map(|e| e.strip_prefix(prefix).map(str::to_string))
            .collect()
    }
}

/// A stage action that replays queued results, then repeats a fallback.
pub struct Scripted {
    name: String,
    journal: Journal,
    queued: Mutex<VecDeque<Result<Outputs, StageError>>>,
    fallback: Result<Outputs, StageError>,
    delay: Duration,
    compensates: bool,
    compensate_error: Option<StageError>,
    precondition: Option<Precondition>,
    rehydrated: Option<Result<Outputs, StageError>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<BTreeMap<String, String>>>,
}

#[allow(dead_code)]
impl Scripted {
    pub fn ok(name: &str, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            journal: journal.clone(),
            queued: Mutex::new(VecDeque::new()),
            fallback: Ok(Outputs::new()),
            delay: Duration::ZERO,
            compensates: false,
            compensate_error: None,
            precondition: None,
            rehydrated: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(name: &str, journal: &Journal, error: StageError) -> Self {
        Self::ok(name, journal).otherwise(Err(error))
    }

    /// Result for the next queued call.
    pub fn then(self, result: Result<Outputs, StageError>) -> Self {
        self.queued.lock().push_back(result);
        self
    }

    /// Result once the queue is empty.
    pub fn otherwise(mut self, result: Result<Outputs, StageError>) -> Self {
        self.fallback = result;
        self
    }

    pub fn producing(self, outputs: Outputs) -> Self {
        self.otherwise(Ok(outputs))
    }

    pub fn taking(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn compensating(mut self) -> Self {
        self.compensates = true;
        self
    }

    pub fn compensation_fails(mut self, error: StageError) -> Self {
        self.compensates = true;
        self.compensate_error = Some(error);
        self
    }

    pub fn precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = Some(precondition);
        self
    }

    pub fn rehydrates(mut self, result: Result<Outputs, StageError>) -> Self {
        self.rehydrated = Some(result);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Exposed outputs visible to each call.
    pub fn seen(&self) -> Vec<BTreeMap<String, String>> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl StageAction for Scripted {
    async fn run(&self, ctx: &StageContext) -> Result<Outputs, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(
            ctx.outputs
                .flatten()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self.journal.record(format!("run:{}", self.name));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.queued.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }

    fn compensates(&self) -> bool {
        self.compensates
    }

    async fn compensate(&self, _ctx: &StageContext) -> Result<(), StageError> {
        self.journal.record(format!("compensate:{}", self.name));
        match &self.compensate_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn check_preconditions(&self, _ctx: &StageContext) -> Result<Precondition, StageError> {
        self.journal.record(format!("precheck:{}", self.name));
        Ok(self.precondition.clone().unwrap_or(Precondition::Ready))
    }

    async fn rehydrate(&self, _ctx: &StageContext) -> Result<Outputs, StageError> {
        self.journal.record(format!("rehydrate:{}", self.name));
        self.rehydrated.clone().unwrap_or_else(|| Ok(Outputs::new()))
    }
}

/// Keeps states in memory and counts saves.
#[derive(Default)]
pub struct MemoryStore {
    states: Mutex<BTreeMap<RunId, DeploymentState>>,
    saves: AtomicUsize,
}

#[allow(dead_code)]
impl MemoryStore {
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn get(&self, run_id: &RunId) -> Option<DeploymentState> {
        self.states.lock().get(run_id).cloned()
    }
}

impl StateStore for MemoryStore {
    fn save(&self, state: &DeploymentState) -> Result<(), DeployError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        // Keep what a file store would keep: secrets lose their values.
        let json = serde_json::to_string(state).expect("state serializes");
        let stored = serde_json::from_str(&json).expect("state deserializes");
        self.states.lock().insert(state.run_id.clone(), stored);
        Ok(())
    }

    fn load(&self, run_id: &RunId) -> Result<Option<DeploymentState>, DeployError> {
        Ok(self.get(run_id))
    }

    fn purge(&self, run_id: &RunId) -> Result<bool, DeployError> {
        Ok(self.states.lock().remove(run_id).is_some())
    }

    fn latest(&self) -> Result<Option<RunId>, DeployError> {
        Ok(self
            .states
            .lock()
            .values()
            .max_by_key(|s| s.updated_at)
            .map(|s| s.run_id.clone()))
    }

    fn location(&self, run_id: &RunId) -> String {
        format!("memory:{}", run_id)
    }
}

#[allow(dead_code)]
pub fn name(value: &str) -> StageName {
    StageName::new(value).unwrap()
}

#[allow(dead_code)]
pub fn run_id() -> RunId {
    RunId::new("shop-20260101-120000").unwrap()
}

/// Deterministic policy: no jitter, 5s base, 60s cap.
#[allow(dead_code)]
pub fn exact(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .max_attempts(max_attempts)
        .backoff(Duration::from_secs(5), Duration::from_secs(60))
        .jitter(0.0)
}

#[allow(dead_code)]
pub fn stage(action: &Arc<Scripted>, stage_name: &str, deps: &[&str]) -> Stage {
    let action: Arc<dyn StageAction> = action.clone();
    Stage::new(name(stage_name), action)
        .depends_on(deps.iter().map(|d| name(d)))
        .retry(exact(3))
}
