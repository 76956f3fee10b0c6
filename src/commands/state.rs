// ABOUTME: Status and purge commands over persisted run state.
// ABOUTME: Neither touches the target host or the infrastructure.

use super::{parse_run_id, store_for};
use shipwright::config::Config;
use shipwright::deploy::{DeployError, StateStore};
use shipwright::error::{Error, Result};
use shipwright::output::Output;

/// Print the persisted state of a run, the most recent by default.
pub fn status(config: &Config, run_id: Option<&str>, output: &Output) -> Result<()> {
    let store = store_for(config);
    let run_id = match run_id {
        Some(id) => parse_run_id(id)?,
        None => store.latest()?.ok_or(Error::NoPreviousRun)?,
    };
    let state = store
        .load(&run_id)?
        .ok_or_else(|| DeployError::RunNotFound(run_id.clone()))?;

    let order = state.completion_order().into_iter().cloned().collect::<Vec<_>>();
    let mut names = order.clone();
    names.extend(state.stages.keys().filter(|name| !order.contains(name)).cloned());
    output.stages(&state, &names);
    output.progress(&format!("state: {}", store.location(&run_id)));
    Ok(())
}

/// Delete a run's persisted state.
pub fn purge(config: &Config, run_id: &str, output: &Output) -> Result<()> {
    let store = store_for(config);
    let run_id = parse_run_id(run_id)?;
    if store.purge(&run_id)? {
        output.success(&format!("Purged run {}", run_id));
        Ok(())
    } else {
        Err(DeployError::RunNotFound(run_id).into())
    }
}
