// ABOUTME: Validated domain identifiers shared across the orchestrator.
// ABOUTME: Stage names key the dependency graph, run IDs key persisted state.

mod run_id;
mod stage_name;

pub use run_id::{RunId, RunIdError};
pub use stage_name::{StageName, StageNameError};
