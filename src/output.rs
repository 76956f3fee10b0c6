// ABOUTME: Output formatting for CLI feedback.
// ABOUTME: Supports normal, quiet (CI), and JSON output modes.

use crate::deploy::{DeploymentState, RunOutcome, RunReport, StageStatus};
use crate::diagnostics::Warning;
use serde::Serialize;
use std::time::Instant;

/// Output mode for CLI feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Human-friendly output with progress messages
    Normal,
    /// Minimal output for CI (only final result)
    Quiet,
    /// JSON lines for scripting
    Json,
}

/// Handles CLI output based on the configured mode.
pub struct Output {
    mode: OutputMode,
    start_time: Option<Instant>,
}

impl Output {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            start_time: None,
        }
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Start timing an operation.
    pub fn start_timer(&mut self) {
        self.start_time = Some(Instant::now());
    }

    /// Get elapsed time since timer started.
    pub fn elapsed_secs(&self) -> f64 {
        self.start_time
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    fn duration(&self) -> Option<f64> {
        self.start_time.map(|_| self.elapsed_secs())
    }

    /// Print a progress message (suppressed in quiet/json mode).
    pub fn progress(&self, message: &str) {
        if self.mode == OutputMode::Normal {
            println!("{message}");
        }
    }

    /// Print a success message with optional timing.
    pub fn success(&self, message: &str) {
        match self.mode {
            OutputMode::Normal => {
                let elapsed = self.elapsed_secs();
                if elapsed > 0.0 {
                    println!("{message} ({:.1}s)", elapsed);
                } else {
                    println!("{message}");
                }
            }
            OutputMode::Quiet => {
                println!("{message}");
            }
            OutputMode::Json => emit(&JsonEvent {
                event: "success",
                message,
                duration_secs: self.duration(),
            }),
        }
    }

    /// Print a warning. Warnings go to stderr in every mode.
    pub fn warning(&self, warning: &Warning) {
        match self.mode {
            OutputMode::Normal | OutputMode::Quiet => {
                eprintln!("Warning: {}", warning.message);
            }
            OutputMode::Json => {
                if let Ok(json) = serde_json::to_string(&JsonWarning {
                    event: "warning",
                    warning,
                }) {
                    eprintln!("{json}");
                }
            }
        }
    }

    /// Print an error message.
    pub fn error(&self, message: &str) {
        match self.mode {
            OutputMode::Normal | OutputMode::Quiet => {
                eprintln!("Error: {message}");
            }
            OutputMode::Json => {
                let event = JsonEvent {
                    event: "error",
                    message,
                    duration_secs: self.duration(),
                };
                if let Ok(json) = serde_json::to_string(&event) {
                    eprintln!("{json}");
                }
            }
        }
    }

    /// One line per stage with its status and attempt count.
    pub fn stages(&self, state: &DeploymentState, order: &[crate::types::StageName]) {
        match self.mode {
            OutputMode::Normal => {
                println!("Run {} ({})", state.run_id, state.status);
                for name in order {
                    let result = state.result(name);
                    let status = state.status_of(name);
                    let attempts = result.map(|r| r.attempts).unwrap_or(0);
                    let marker = match status {
                        StageStatus::Succeeded => "✓",
                        StageStatus::Failed => "✗",
                        StageStatus::RolledBack => "↺",
                        StageStatus::Running => "…",
                        StageStatus::Pending => " ",
                    };
                    print!("  {marker} {name:<14} {status:<12} attempts: {attempts}");
                    match result.and_then(|r| r.last_error.as_ref()) {
                        Some(error) if status != StageStatus::Succeeded => println!("  {error}"),
                        _ => println!(),
                    }
                }
            }
            OutputMode::Quiet => println!("{} {}", state.run_id, state.status),
            OutputMode::Json => {
                if let Ok(json) = serde_json::to_string(state) {
                    println!("{json}");
                }
            }
        }
    }

    /// Final summary for a run: warnings, then the outcome.
    ///
    /// Failures name the stage, its attempt count and the state file on stderr.
    pub fn report(&self, report: &RunReport, state_path: &str) {
        for warning in &report.warnings {
            self.warning(warning);
        }
        if !report.rollback_order.is_empty() {
            let unwound: Vec<&str> = report.rollback_order.iter().map(|s| s.as_str()).collect();
            self.progress(&format!("Rolled back: {}", unwound.join(", ")));
        }

        match &report.outcome {
            RunOutcome::Succeeded => {
                self.success(&format!("Run {} succeeded", report.state.run_id));
            }
            RunOutcome::Failed {
                stage,
                attempts,
                error,
            } => {
                self.error(&format!(
                    "stage '{}' failed after {} attempt(s): {}",
                    stage, attempts, error
                ));
                self.error(&format!("state: {}", state_path));
            }
            other => {
                self.error(&other.to_string());
                self.error(&format!(
                    "state: {} (resume with `shipwright deploy --resume`)",
                    state_path
                ));
            }
        }
    }
}

fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        println!("{json}");
    }
}

#[derive(Serialize)]
struct JsonEvent<'a> {
    event: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_secs: Option<f64>,
}

#[derive(Serialize)]
struct JsonWarning<'a> {
    event: &'a str,
    #[serde(flatten)]
    warning: &'a Warning,
}
