// ABOUTME: Diagnostics accumulator for non-fatal warnings during a run.
// ABOUTME: Best-effort failures land here instead of failing the deployment.

use serde::Serialize;

/// Collects non-fatal warnings during a run.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: Vec<Warning>,
}

impl Diagnostics {
    /// Record a warning, auto-logging it via tracing.
    pub fn warn(&mut self, warning: Warning) {
        tracing::warn!("{}", warning.message);
        self.warnings.push(warning);
    }

    /// Get all collected warnings.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Check if any warnings were collected.
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn into_warnings(self) -> Vec<Warning> {
        self.warnings
    }
}

/// A non-fatal warning collected during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A best-effort stage failed; the run continues.
    pub fn best_effort_stage(message: impl Into<String>) -> Self {
        Self::new(WarningKind::BestEffortStage, message)
    }

    /// A best-effort command inside a stage failed.
    pub fn best_effort_command(message: impl Into<String>) -> Self {
        Self::new(WarningKind::BestEffortCommand, message)
    }

    /// A compensating action failed during rollback.
    pub fn rollback_failed(message: impl Into<String>) -> Self {
        Self::new(WarningKind::RollbackFailed, message)
    }

    /// Domain resolves elsewhere but the operator allowed issuance anyway.
    pub fn dns_mismatch(message: impl Into<String>) -> Self {
        Self::new(WarningKind::DnsMismatch, message)
    }

    /// Post-deploy snapshot did not complete.
    pub fn snapshot_failed(message: impl Into<String>) -> Self {
        Self::new(WarningKind::SnapshotFailed, message)
    }

    /// Redacted outputs could not be recovered on resume.
    pub fn rehydrate_failed(message: impl Into<String>) -> Self {
        Self::new(WarningKind::Rehydrate, message)
    }

    /// Failed to release the run lock.
    pub fn lock_release(message: impl Into<String>) -> Self {
        Self::new(WarningKind::LockRelease, message)
    }

    /// Failed to cleanly disconnect an SSH session.
    pub fn ssh_disconnect(message: impl Into<String>) -> Self {
        Self::new(WarningKind::SshDisconnect, message)
    }
}

/// Categories of warnings that can occur during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    BestEffortStage,
    BestEffortCommand,
    RollbackFailed,
    DnsMismatch,
    SnapshotFailed,
    Rehydrate,
    LockRelease,
    SshDisconnect,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_starts_empty() {
        let diag = Diagnostics::default();
        assert!(!diag.has_warnings());
        assert!(diag.warnings().is_empty());
    }

    #[test]
    fn diagnostics_collects_warnings() {
        let mut diag = Diagnostics::default();

        diag.warn(Warning::snapshot_failed("bucket unreachable"));
        diag.warn(Warning::rollback_failed("destroy timed out"));

        assert!(diag.has_warnings());
        assert_eq!(diag.warnings().len(), 2);
    }

    #[test]
    fn warning_constructors_set_correct_kind() {
        assert_eq!(
            Warning::dns_mismatch("test").kind,
            WarningKind::DnsMismatch
        );
        assert_eq!(
            Warning::best_effort_stage("test").kind,
            WarningKind::BestEffortStage
        );
        assert_eq!(
            Warning::ssh_disconnect("test").kind,
            WarningKind::SshDisconnect
        );
    }
}
