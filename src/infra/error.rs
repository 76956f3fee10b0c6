// ABOUTME: Infra adapter error types with SNAFU pattern.
// ABOUTME: Classifies provisioner failures so the runner can retry, roll back or stop.

use super::InfraOutputs;
use crate::deploy::StageError;
use snafu::Snafu;

/// Error from the infrastructure tool.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum InfraError {
    #[snafu(display("failed to launch {binary}: {source}"))]
    Launch {
        binary: String,
        source: std::io::Error,
    },

    #[snafu(display("`{command}` failed (exit {}): {}", code.map_or("signal".to_string(), |c| c.to_string()), last_line(stderr)))]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
        class: InfraErrorKind,
        /// Outputs of resources that exist despite the failure.
        created: InfraOutputs,
    },

    #[snafu(display("could not parse provisioner outputs: {source}"))]
    Outputs { source: serde_json::Error },
}

/// Error kind for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfraErrorKind {
    /// Credentials rejected. Retrying will not help.
    Authentication,
    /// The cloud API asked us to slow down.
    Throttled,
    /// Network blips, state lock contention and similar.
    Transient,
    /// Some resources were created before the failure.
    Partial,
    /// Any other failure of the tool.
    Failed,
    /// The tool could not be started.
    Unavailable,
    /// The tool's output could not be understood.
    Malformed,
}

impl InfraError {
    /// Returns the error kind for programmatic handling.
    pub fn kind(&self) -> InfraErrorKind {
        match self {
            InfraError::Launch { .. } => InfraErrorKind::Unavailable,
            InfraError::Outputs { .. } => InfraErrorKind::Malformed,
            InfraError::Command { class, created, .. } => {
                if *class == InfraErrorKind::Failed && !created.is_empty() {
                    InfraErrorKind::Partial
                } else {
                    *class
                }
            }
        }
    }

    /// Outputs of resources created before the failure, if any.
    pub fn created(&self) -> Option<&InfraOutputs> {
        match self {
            InfraError::Command { created, .. } if !created.is_empty() => Some(created),
            _ => None,
        }
    }
}

fn last_line(stderr: &str) -> &str {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no error output")
}

const AUTH_MARKERS: &[&str] = &[
    "unauthorized",
    "authentication failed",
    "invalid credentials",
    "no valid credential",
    "could not find default credentials",
    "access denied",
    "permission denied",
    "invalidclienttokenid",
    "expiredtoken",
    "error 403",
];

const THROTTLE_MARKERS: &[&str] = &[
    "throttl",
    "rate exceeded",
    "rate limit",
    "too many requests",
    "error 429",
    "requestlimitexceeded",
    "quota exceeded",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "temporarily unavailable",
    "error acquiring the state lock",
    "internal error",
    "error 500",
    "error 502",
    "error 503",
];

/// Classify a failed invocation by the tool's error output.
pub fn classify(stderr: &str) -> InfraErrorKind {
    let lower = stderr.to_ascii_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));
    if has(AUTH_MARKERS) {
        InfraErrorKind::Authentication
    } else if has(THROTTLE_MARKERS) {
        InfraErrorKind::Throttled
    } else if has(TRANSIENT_MARKERS) {
        InfraErrorKind::Transient
    } else {
        InfraErrorKind::Failed
    }
}

impl From<InfraError> for StageError {
    fn from(err: InfraError) -> Self {
        let created = err.created().cloned().unwrap_or_default();
        let message = err.to_string();
        let stage_error = match err.kind() {
            InfraErrorKind::Authentication => StageError::authentication(message),
            InfraErrorKind::Throttled | InfraErrorKind::Transient => StageError::transient(message),
            InfraErrorKind::Partial => return StageError::partial(message, created),
            InfraErrorKind::Failed | InfraErrorKind::Unavailable | InfraErrorKind::Malformed => {
                StageError::fatal(message)
            }
        };
        stage_error.with_partial_outputs(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::{OutputValue, StageErrorKind};

    fn command_error(stderr: &str, created: InfraOutputs) -> InfraError {
        InfraError::Command {
            command: "terraform apply".to_string(),
            code: Some(1),
            stderr: stderr.to_string(),
            class: classify(stderr),
            created,
        }
    }

    #[test]
    fn classifies_common_failures() {
        assert_eq!(
            classify("Error: error configuring Terraform AWS Provider: InvalidClientTokenId"),
            InfraErrorKind::Authentication
        );
        assert_eq!(
            classify("Error: googleapi: Error 429: Rate Limit Exceeded"),
            InfraErrorKind::Throttled
        );
        assert_eq!(
            classify("Error: Error acquiring the state lock"),
            InfraErrorKind::Transient
        );
        assert_eq!(
            classify("Error: Invalid reference"),
            InfraErrorKind::Failed
        );
    }

    #[test]
    fn failure_with_created_resources_is_partial() {
        let created = InfraOutputs::from([(
            "public_address".to_string(),
            OutputValue::address("203.0.113.9"),
        )]);
        let err = command_error("Error: creating database instance", created);
        assert_eq!(err.kind(), InfraErrorKind::Partial);

        let stage_error = StageError::from(err);
        assert_eq!(stage_error.kind, StageErrorKind::PartialResource);
        assert!(stage_error.partial_outputs.contains_key("public_address"));
    }

    #[test]
    fn auth_failure_maps_to_authentication_even_with_created_resources() {
        let created = InfraOutputs::from([("vm_id".to_string(), OutputValue::identifier("i-1"))]);
        let stage_error = StageError::from(command_error("Error: Unauthorized", created));
        assert_eq!(stage_error.kind, StageErrorKind::Authentication);
        assert!(stage_error.partial_outputs.contains_key("vm_id"));
    }

    #[test]
    fn display_uses_last_stderr_line() {
        let err = command_error("Planning...\nError: boom\n\n", InfraOutputs::new());
        assert_eq!(err.to_string(), "`terraform apply` failed (exit 1): Error: boom");
    }
}
