// ABOUTME: What a stage action sees: a read-only snapshot of prior outputs and run signals.
// ABOUTME: Also defines the run-level cancellation handle propagated to in-flight actions.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

use super::error::StageError;
use super::state::{OutputValue, Outputs, redact_secrets};
use crate::diagnostics::{Diagnostics, Warning};
use crate::types::{RunId, StageName};

/// Sender side of the operator abort signal.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

/// Receiver side of the operator abort signal.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelHandle {
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, CancelSignal { rx: Some(rx) })
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once the run is cancelled. Pends forever if the handle is gone.
    pub async fn cancelled(&self) {
        if let Some(rx) = &self.rx {
            let mut rx = rx.clone();
            if rx.wait_for(|cancelled| *cancelled).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }
}

/// Read-only snapshot of outputs produced by earlier stages.
#[derive(Debug, Clone, Default)]
pub struct OutputView {
    outputs: Arc<BTreeMap<StageName, Outputs>>,
}

impl OutputView {
    pub fn new(outputs: BTreeMap<StageName, Outputs>) -> Self {
        Self {
            outputs: Arc::new(outputs),
        }
    }

    pub fn get(&self, key: &str) -> Option<&OutputValue> {
        self.outputs.values().find_map(|outputs| outputs.get(key))
    }

    pub fn from_stage(&self, stage: &StageName) -> Option<&Outputs> {
        self.outputs.get(stage)
    }

    /// The exposed value for `key`.
    ///
    /// # Errors
    ///
    /// A missing or still-redacted value is a fatal error for the caller.
    pub fn require(&self, key: &str) -> Result<&str, StageError> {
        let value = self
            .get(key)
            .ok_or_else(|| StageError::fatal(format!("required output '{}' is missing", key)))?;
        value.expose().ok_or_else(|| {
            StageError::fatal(format!("required output '{}' is redacted", key))
        })
    }

    /// Replace every secret value visible here with `<redacted>`.
    pub fn redact(&self, text: &str) -> String {
        redact_secrets(self.outputs.values(), text)
    }

    /// Every exposed value, flattened by key.
    pub fn flatten(&self) -> BTreeMap<&str, &str> {
        self.outputs
            .values()
            .flat_map(|outputs| outputs.iter())
            .filter_map(|(k, v)| v.expose().map(|value| (k.as_str(), value)))
            .collect()
    }
}

/// Input handed to every stage action invocation.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run_id: RunId,
    pub stage: StageName,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    pub outputs: OutputView,
    pub cancel: CancelSignal,
    diagnostics: Arc<Mutex<Diagnostics>>,
}

impl StageContext {
    pub fn new(
        run_id: RunId,
        stage: StageName,
        attempt: u32,
        outputs: OutputView,
        cancel: CancelSignal,
        diagnostics: Arc<Mutex<Diagnostics>>,
    ) -> Self {
        Self {
            run_id,
            stage,
            attempt,
            outputs,
            cancel,
            diagnostics,
        }
    }

    /// Context for exercising an action outside a runner.
    pub fn detached(stage: StageName, outputs: OutputView) -> Self {
        Self::new(
            RunId::new("detached").expect("static run id is valid"),
            stage,
            1,
            outputs,
            CancelSignal::never(),
            Arc::default(),
        )
    }

    /// Record a non-fatal problem for the end-of-run summary.
    pub fn warn(&self, warning: Warning) {
        self.diagnostics.lock().warn(warning);
    }

    pub fn warnings(&self) -> Vec<Warning> {
        self.diagnostics.lock().warnings().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let (handle, signal) = CancelHandle::new();
        assert!(!signal.is_cancelled());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        handle.cancel();
        waiter.await.unwrap();
        assert!(signal.is_cancelled());
    }

    #[test]
    fn require_reports_missing_and_redacted() {
        let mut outputs = BTreeMap::new();
        let mut provision = Outputs::new();
        provision.insert("public_address".into(), OutputValue::address("203.0.113.1"));
        let redacted: OutputValue =
            serde_json::from_str(r#"{"kind":"secret","sensitive":true}"#).unwrap();
        provision.insert("db_password".into(), redacted);
        outputs.insert(StageName::new("provision").unwrap(), provision);
        let view = OutputView::new(outputs);

        assert_eq!(view.require("public_address").unwrap(), "203.0.113.1");
        assert!(view.require("db_password").unwrap_err().message.contains("redacted"));
        assert!(view.require("nope").unwrap_err().message.contains("missing"));
        assert_eq!(view.flatten().len(), 1);
    }
}
