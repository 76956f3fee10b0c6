// ABOUTME: Command module aggregator for the shipwright CLI.
// ABOUTME: Re-exports deploy, state (status/purge) and destroy command handlers.

mod deploy;
mod destroy;
mod state;

pub use deploy::{DeployRequest, deploy};
pub use destroy::destroy;
pub use state::{purge, status};

use shipwright::deploy::FileStateStore;
use shipwright::error::{Error, Result};
use shipwright::types::RunId;

fn parse_run_id(value: &str) -> Result<RunId> {
    RunId::new(value).map_err(|e| Error::InvalidRunId(format!("{}: {}", value, e)))
}

fn store_for(config: &shipwright::config::Config) -> FileStateStore {
    FileStateStore::new(config.state_dir())
}
