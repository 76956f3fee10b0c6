// ABOUTME: Deployment plans: named stages with dependencies, retry policy, and actions.
// ABOUTME: Validates the graph is acyclic and yields a deterministic topological order.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use super::context::StageContext;
use super::error::{DeployError, StageError};
use super::retry::RetryPolicy;
use super::state::Outputs;
use crate::types::StageName;

/// Result of a precondition check before re-running a non-idempotent action.
#[derive(Debug, Clone, PartialEq)]
pub enum Precondition {
    /// Nothing was done yet; run the action.
    Ready,
    /// A previous attempt already completed the work; these are its outputs.
    AlreadySatisfied(Outputs),
}

/// The work a stage performs, and how to undo it.
#[async_trait]
pub trait StageAction: Send + Sync {
    /// Perform the stage. Returned outputs become visible to dependent stages.
    async fn run(&self, ctx: &StageContext) -> Result<Outputs, StageError>;

    /// Whether [`StageAction::compensate`] does anything.
    fn compensates(&self) -> bool {
        false
    }

    /// Undo the effects of `run` during rollback.
    async fn compensate(&self, _ctx: &StageContext) -> Result<(), StageError> {
        Ok(())
    }

    /// Inspect the target before re-running a non-idempotent action.
    async fn check_preconditions(&self, _ctx: &StageContext) -> Result<Precondition, StageError> {
        Ok(Precondition::Ready)
    }

    /// Recover outputs that were redacted when state was persisted.
    ///
    /// Only queries; must not repeat the action's side effects.
    async fn rehydrate(&self, _ctx: &StageContext) -> Result<Outputs, StageError> {
        Ok(Outputs::new())
    }
}

/// A named unit of orchestration work.
#[derive(Clone)]
pub struct Stage {
    pub(crate) name: StageName,
    pub(crate) depends_on: Vec<StageName>,
    pub(crate) action: Arc<dyn StageAction>,
    pub(crate) retry: RetryPolicy,
    pub(crate) idempotent: bool,
    pub(crate) best_effort: bool,
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("retry", &self.retry)
            .field("idempotent", &self.idempotent)
            .field("best_effort", &self.best_effort)
            .finish()
    }
}

impl Stage {
    pub fn new(name: StageName, action: Arc<dyn StageAction>) -> Self {
        Self {
            name,
            depends_on: Vec::new(),
            action,
            retry: RetryPolicy::default(),
            idempotent: true,
            best_effort: false,
        }
    }

    pub fn depends_on(mut self, stages: impl IntoIterator<Item = StageName>) -> Self {
        self.depends_on.extend(stages);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// A best-effort stage logs its failure instead of failing the run.
    pub fn best_effort(mut self, best_effort: bool) -> Self {
        self.best_effort = best_effort;
        self
    }

    pub fn name(&self) -> &StageName {
        &self.name
    }

    pub fn dependencies(&self) -> &[StageName] {
        &self.depends_on
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    pub fn is_best_effort(&self) -> bool {
        self.best_effort
    }

    pub fn action(&self) -> &Arc<dyn StageAction> {
        &self.action
    }
}

/// An immutable, validated set of stages.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    stages: Vec<Stage>,
    index: HashMap<StageName, usize>,
    order: Vec<usize>,
}

impl DeploymentPlan {
    /// Validate stages and compute their execution order.
    ///
    /// # Errors
    ///
    /// Fails on an empty plan, duplicate names, unknown dependencies, or a cycle.
    pub fn new(stages: Vec<Stage>) -> Result<Self, DeployError> {
        if stages.is_empty() {
            return Err(DeployError::EmptyPlan);
        }

        let mut index = HashMap::with_capacity(stages.len());
        for (i, stage) in stages.iter().enumerate() {
            if index.insert(stage.name.clone(), i).is_some() {
                return Err(DeployError::DuplicateStage(stage.name.clone()));
            }
        }

        for stage in &stages {
            for dep in &stage.depends_on {
                if !index.contains_key(dep) {
                    return Err(DeployError::UnknownDependency {
                        stage: stage.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let order = topological_order(&stages, &index)?;
        Ok(Self {
            stages,
            index,
            order,
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn get(&self, name: &StageName) -> Option<&Stage> {
        self.index.get(name).map(|&i| &self.stages[i])
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stages in dependency order, ties broken by declaration order.
    pub fn ordered(&self) -> impl Iterator<Item = &Stage> {
        self.order.iter().map(|&i| &self.stages[i])
    }

    pub fn topological_order(&self) -> Vec<StageName> {
        self.ordered().map(|s| s.name.clone()).collect()
    }
}

/// Kahn's algorithm; the ready set is ordered by declaration index.
fn topological_order(
    stages: &[Stage],
    index: &HashMap<StageName, usize>,
) -> Result<Vec<usize>, DeployError> {
    let mut in_degree = vec![0usize; stages.len()];
    let mut dependents: BTreeMap<usize, Vec<usize>> = BTreeMap::new();

    for (i, stage) in stages.iter().enumerate() {
        let deps: BTreeSet<usize> = stage.depends_on.iter().map(|d| index[d]).collect();
        in_degree[i] = deps.len();
        for dep in deps {
            dependents.entry(dep).or_default().push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..stages.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(stages.len());

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in dependents.get(&next).map(Vec::as_slice).unwrap_or_default() {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != stages.len() {
        let stuck = (0..stages.len())
            .filter(|i| in_degree[*i] > 0)
            .map(|i| stages[i].name.clone())
            .collect();
        return Err(DeployError::CyclicPlan(stuck));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl StageAction for Noop {
        async fn run(&self, _ctx: &StageContext) -> Result<Outputs, StageError> {
            Ok(Outputs::new())
        }
    }

    fn stage(name: &str, deps: &[&str]) -> Stage {
        Stage::new(StageName::new(name).unwrap(), Arc::new(Noop))
            .depends_on(deps.iter().map(|d| StageName::new(d).unwrap()))
    }

    fn names(plan: &DeploymentPlan) -> Vec<String> {
        plan.topological_order()
            .into_iter()
            .map(|n| n.to_string())
            .collect()
    }

    #[test]
    fn declaration_order_breaks_ties() {
        let plan = DeploymentPlan::new(vec![
            stage("certificate", &["healthcheck"]),
            stage("provision", &[]),
            stage("dns", &[]),
            stage("configure", &["provision"]),
            stage("healthcheck", &["configure"]),
        ])
        .unwrap();
        assert_eq!(
            names(&plan),
            vec!["provision", "dns", "configure", "healthcheck", "certificate"]
        );
    }

    #[test]
    fn rejects_cycles() {
        let err = DeploymentPlan::new(vec![
            stage("a", &["c"]),
            stage("b", &["a"]),
            stage("c", &["b"]),
            stage("d", &[]),
        ])
        .unwrap_err();
        match err {
            DeployError::CyclicPlan(stuck) => assert_eq!(stuck.len(), 3),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn rejects_self_dependency() {
        let err = DeploymentPlan::new(vec![stage("a", &["a"])]).unwrap_err();
        assert!(matches!(err, DeployError::CyclicPlan(_)));
    }

    #[test]
    fn rejects_unknown_and_duplicate_stages() {
        assert!(matches!(
            DeploymentPlan::new(vec![stage("a", &["missing"])]),
            Err(DeployError::UnknownDependency { .. })
        ));
        assert!(matches!(
            DeploymentPlan::new(vec![stage("a", &[]), stage("a", &[])]),
            Err(DeployError::DuplicateStage(_))
        ));
        assert!(matches!(
            DeploymentPlan::new(vec![]),
            Err(DeployError::EmptyPlan)
        ));
    }

    #[test]
    fn duplicate_dependency_entries_are_harmless() {
        let plan =
            DeploymentPlan::new(vec![stage("a", &[]), stage("b", &["a", "a"])]).unwrap();
        assert_eq!(names(&plan), vec!["a", "b"]);
    }
}
