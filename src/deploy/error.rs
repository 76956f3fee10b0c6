// ABOUTME: Error types for the stage runner and stage actions.
// ABOUTME: StageError carries a kind the runner uses to pick retry, rollback, or deferral.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use super::state::Outputs;
use crate::types::{RunId, StageName};

/// Classification of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// Network timeouts, API throttling, refused connections while booting.
    Transient,
    /// The action exceeded its hard deadline.
    Timeout,
    /// A check never turned healthy.
    Verification,
    /// Some resources were created before the failure.
    PartialResource,
    /// Non-retryable failure of the action itself.
    Fatal,
    /// Credentials were rejected. Never retried.
    Authentication,
    /// The stage cannot proceed yet and must stay pending.
    Deferred,
    /// The operator aborted the run.
    Cancelled,
}

impl StageErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            StageErrorKind::Transient
                | StageErrorKind::Timeout
                | StageErrorKind::Verification
                | StageErrorKind::PartialResource
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageErrorKind::Transient => "transient",
            StageErrorKind::Timeout => "timeout",
            StageErrorKind::Verification => "verification",
            StageErrorKind::PartialResource => "partial resource",
            StageErrorKind::Fatal => "fatal",
            StageErrorKind::Authentication => "authentication",
            StageErrorKind::Deferred => "deferred",
            StageErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a stage action.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct StageError {
    pub kind: StageErrorKind,
    pub message: String,
    /// Outputs of resources that exist despite the failure.
    pub partial_outputs: Outputs,
}

impl StageError {
    pub fn new(kind: StageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            partial_outputs: Outputs::new(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Fatal, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Authentication, message)
    }

    pub fn verification(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Verification, message)
    }

    pub fn deferred(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Deferred, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            StageErrorKind::Timeout,
            format!("stage action exceeded its deadline of {:?}", after),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(StageErrorKind::Cancelled, "run aborted by operator")
    }

    pub fn partial(message: impl Into<String>, outputs: Outputs) -> Self {
        Self {
            kind: StageErrorKind::PartialResource,
            message: message.into(),
            partial_outputs: outputs,
        }
    }

    pub fn with_partial_outputs(mut self, outputs: Outputs) -> Self {
        self.partial_outputs = outputs;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<crate::ssh::Error> for StageError {
    fn from(err: crate::ssh::Error) -> Self {
        if err.is_auth() {
            StageError::authentication(err.to_string())
        } else if matches!(err, crate::ssh::Error::CommandFailed(_)) {
            StageError::fatal(err.to_string())
        } else {
            StageError::transient(err.to_string())
        }
    }
}

/// Errors raised by the runner itself, outside any stage action.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("stage '{0}' is declared more than once")]
    DuplicateStage(StageName),

    #[error("stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency {
        stage: StageName,
        dependency: StageName,
    },

    #[error("plan contains a dependency cycle through: {}", join_names(.0))]
    CyclicPlan(Vec<StageName>),

    #[error("plan has no stages")]
    EmptyPlan,

    #[error("state for run '{0}' not found")]
    RunNotFound(RunId),

    #[error("failed to access state file {path}: {source}")]
    StateIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is not valid: {source}")]
    StateFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("run is locked by {holder} (pid {pid}) since {since}")]
    LockHeld {
        holder: String,
        pid: u32,
        since: DateTime<Utc>,
    },

    #[error("run lock error: {0}")]
    Lock(String),
}

fn join_names(names: &[StageName]) -> String {
    names
        .iter()
        .map(StageName::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(StageError::transient("throttled").is_retryable());
        assert!(StageError::timeout(Duration::from_secs(1)).is_retryable());
        assert!(StageError::verification("unhealthy").is_retryable());
        assert!(!StageError::fatal("bad template").is_retryable());
        assert!(!StageError::authentication("denied").is_retryable());
        assert!(!StageError::deferred("dns").is_retryable());
        assert!(!StageError::cancelled().is_retryable());
    }

    #[test]
    fn ssh_errors_map_to_kinds() {
        let auth: StageError = crate::ssh::Error::AuthenticationFailed.into();
        assert_eq!(auth.kind, StageErrorKind::Authentication);

        let refused: StageError = crate::ssh::Error::Connection("refused".into()).into();
        assert_eq!(refused.kind, StageErrorKind::Transient);
    }

    #[test]
    fn cyclic_plan_message_lists_stages() {
        let err = DeployError::CyclicPlan(vec![
            StageName::new("a").unwrap(),
            StageName::new("b").unwrap(),
        ]);
        assert_eq!(
            err.to_string(),
            "plan contains a dependency cycle through: a, b"
        );
    }
}
