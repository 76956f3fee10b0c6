// ABOUTME: Property tests for plan ordering over random acyclic dependency graphs.
// ABOUTME: Checks the topological order and that the runner honours it with parallel workers.

mod support;

use proptest::prelude::*;
use shipwright::deploy::{
    CancelSignal, DeployError, DeploymentPlan, DeploymentState, RunOptions, Stage, StageRunner,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use support::{Journal, MemoryStore, Scripted, run_id, stage};

/// A random DAG: stage `i` may depend only on stages with a lower index.
/// `order` is the declaration order, a permutation of the indices.
fn dag() -> impl Strategy<Value = (Vec<Vec<usize>>, Vec<usize>)> {
    (1usize..10)
        .prop_flat_map(|n| {
            let deps = (0..n)
                .map(|i| proptest::sample::subsequence((0..i).collect::<Vec<_>>(), 0..=i))
                .collect::<Vec<_>>();
            let order = Just((0..n).collect::<Vec<_>>()).prop_shuffle();
            (deps, order)
        })
}

fn stage_name(i: usize) -> String {
    format!("s{i}")
}

fn build(
    deps: &[Vec<usize>],
    order: &[usize],
    journal: &Journal,
    delay: impl Fn(usize) -> Duration,
) -> Vec<Stage> {
    order
        .iter()
        .map(|&i| {
            let action = Arc::new(Scripted::ok(&stage_name(i), journal).taking(delay(i)));
            let names: Vec<String> = deps[i].iter().map(|&d| stage_name(d)).collect();
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            stage(&action, &stage_name(i), &names)
        })
        .collect()
}

proptest! {
    /// Test: Every stage appears once, after all of its dependencies.
    #[test]
    fn topological_order_respects_dependencies((deps, order) in dag()) {
        let journal = Journal::default();
        let plan = DeploymentPlan::new(build(&deps, &order, &journal, |_| Duration::ZERO)).unwrap();

        let position: HashMap<String, usize> = plan
            .topological_order()
            .into_iter()
            .enumerate()
            .map(|(pos, name)| (name.to_string(), pos))
            .collect();
        prop_assert_eq!(position.len(), deps.len());
        for (i, stage_deps) in deps.iter().enumerate() {
            for &d in stage_deps {
                prop_assert!(position[&stage_name(d)] < position[&stage_name(i)]);
            }
        }
    }

    /// Test: Closing any back edge makes the plan cyclic.
    #[test]
    fn back_edges_are_rejected((deps, order) in dag()) {
        let Some((i, &d)) = deps
            .iter()
            .enumerate()
            .find_map(|(i, ds)| ds.first().map(|d| (i, d)))
        else {
            return Ok(());
        };
        let mut cyclic = deps.clone();
        cyclic[d].push(i);

        let journal = Journal::default();
        let result = DeploymentPlan::new(build(&cyclic, &order, &journal, |_| Duration::ZERO));
        prop_assert!(matches!(result, Err(DeployError::CyclicPlan(_))));
    }

    /// Test: With parallel workers, no stage starts before its dependencies finished.
    #[test]
    fn runner_starts_stages_after_dependencies((deps, order) in dag(), workers in 1usize..4) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        let journal = Journal::default();
        let plan = DeploymentPlan::new(build(&deps, &order, &journal, |i| {
            Duration::from_secs(1 + (i as u64 * 7) % 5)
        }))
        .unwrap();
        let store = MemoryStore::default();
        let options = RunOptions { workers, ..RunOptions::default() };

        let report = runtime.block_on(
            StageRunner::new(&store, CancelSignal::never(), options)
                .run(&plan, DeploymentState::new(run_id())),
        ).unwrap();
        prop_assert!(report.is_success());

        let started: HashMap<String, usize> = journal
            .with_prefix("run:")
            .into_iter()
            .enumerate()
            .map(|(pos, name)| (name, pos))
            .collect();
        prop_assert_eq!(started.len(), deps.len());
        for (i, stage_deps) in deps.iter().enumerate() {
            let own = report.state.result(&support::name(&stage_name(i))).unwrap();
            for &d in stage_deps {
                let dep = report.state.result(&support::name(&stage_name(d))).unwrap();
                prop_assert!(dep.completion_seq < own.completion_seq);
                prop_assert!(started[&stage_name(d)] < started[&stage_name(i)]);
            }
        }
    }
}
