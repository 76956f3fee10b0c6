// ABOUTME: Stage runner core: plans, stage actions, persisted state and the runner itself.
// ABOUTME: Everything here is independent of SSH, DNS or infra specifics.

mod context;
mod error;
mod lock;
mod plan;
mod retry;
mod runner;
mod state;
mod store;

pub use context::{CancelHandle, CancelSignal, OutputView, StageContext};
pub use error::{DeployError, StageError, StageErrorKind};
pub use lock::{LockInfo, RunLock};
pub use plan::{DeploymentPlan, Precondition, Stage, StageAction};
pub use retry::{Backoff, RetryPolicy};
pub use runner::{RunOptions, RunOutcome, RunReport, StageRunner};
pub use state::{
    DeploymentState, OutputKind, OutputValue, Outputs, RunStatus, StageFailure, StageResult,
    StageStatus,
};
pub use store::{FileStateStore, StateStore};
