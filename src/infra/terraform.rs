// ABOUTME: InfraProvisioner backed by a Terraform-compatible CLI run through tokio::process.
// ABOUTME: Variables travel as TF_VAR_* environment entries so they never appear in argv or logs.

use super::error::{InfraError, LaunchSnafu, OutputsSnafu, classify};
use super::{InfraOutputs, InfraPlan, InfraProvisioner};
use crate::deploy::{OutputKind, OutputValue};
use async_trait::async_trait;
use serde::Deserialize;
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::process::{Output, Stdio};
use tokio::process::Command;

/// Drives `terraform` (or a drop-in such as `tofu`) in a working directory.
#[derive(Debug, Clone)]
pub struct TerraformCli {
    binary: String,
}

impl Default for TerraformCli {
    fn default() -> Self {
        Self::new("terraform")
    }
}

impl TerraformCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exec(&self, plan: &InfraPlan, args: &[&str]) -> Result<Output, InfraError> {
        let command = format!("{} {}", self.binary, args.join(" "));
        tracing::debug!("running {} in {}", command, plan.working_dir.display());

        Command::new(&self.binary)
            .args(args)
            .current_dir(&plan.working_dir)
            .envs(
                plan.variables
                    .iter()
                    .map(|(name, value)| (format!("TF_VAR_{}", name), value)),
            )
            .env("TF_IN_AUTOMATION", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .context(LaunchSnafu {
                binary: self.binary.clone(),
            })
    }

    /// Run a subcommand and turn a non-zero exit into a classified error.
    async fn checked(
        &self,
        plan: &InfraPlan,
        args: &[&str],
        created: InfraOutputs,
    ) -> Result<String, InfraError> {
        let output = self.exec(plan, args).await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Err(InfraError::Command {
            command: format!("{} {}", self.binary, args.first().copied().unwrap_or_default()),
            code: output.status.code(),
            class: classify(&stderr),
            stderr,
            created,
        })
    }
}

#[async_trait]
impl InfraProvisioner for TerraformCli {
    async fn apply(&self, plan: &InfraPlan) -> Result<InfraOutputs, InfraError> {
        self.checked(plan, &["init", "-input=false", "-no-color"], InfraOutputs::new())
            .await?;

        let apply = ["apply", "-auto-approve", "-input=false", "-no-color"];
        let output = self.exec(plan, &apply).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            let created = match self.outputs(plan).await {
                Ok(created) => created,
                Err(e) => {
                    tracing::warn!("could not read outputs after failed apply: {}", e);
                    InfraOutputs::new()
                }
            };
            return Err(InfraError::Command {
                command: format!("{} apply", self.binary),
                code: output.status.code(),
                class: classify(&stderr),
                stderr,
                created,
            });
        }

        if stdout.contains("No changes.") {
            tracing::info!("infrastructure already matches the plan");
        } else {
            tracing::info!("infrastructure applied");
        }
        self.outputs(plan).await
    }

    async fn destroy(&self, plan: &InfraPlan) -> Result<(), InfraError> {
        self.checked(
            plan,
            &["destroy", "-auto-approve", "-input=false", "-no-color"],
            InfraOutputs::new(),
        )
        .await?;
        tracing::info!("infrastructure destroyed");
        Ok(())
    }

    async fn outputs(&self, plan: &InfraPlan) -> Result<InfraOutputs, InfraError> {
        let stdout = self
            .checked(plan, &["output", "-json", "-no-color"], InfraOutputs::new())
            .await?;
        parse_outputs(&stdout)
    }
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    #[serde(default)]
    sensitive: bool,
    value: serde_json::Value,
}

/// Parse `output -json` into typed outputs.
///
/// Sensitive outputs become secrets; other kinds are inferred from the name.
pub fn parse_outputs(json: &str) -> Result<InfraOutputs, InfraError> {
    if json.trim().is_empty() {
        return Ok(InfraOutputs::new());
    }
    let raw: BTreeMap<String, RawOutput> = serde_json::from_str(json).context(OutputsSnafu)?;

    Ok(raw
        .into_iter()
        .map(|(name, raw)| {
            let value = match raw.value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            let kind = if raw.sensitive {
                OutputKind::Secret
            } else {
                kind_for(&name)
            };
            (name, OutputValue::new(kind, value))
        })
        .collect())
}

fn kind_for(name: &str) -> OutputKind {
    if name.ends_with("_address") || name.ends_with("_ip") {
        OutputKind::Address
    } else if name.ends_with("_endpoint") || name.ends_with("_url") || name.ends_with("_host") {
        OutputKind::Endpoint
    } else if name.ends_with("_id") || name.ends_with("_name") {
        OutputKind::Identifier
    } else {
        OutputKind::Text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_output_json() {
        let json = r#"{
            "public_address": {"sensitive": false, "type": "string", "value": "203.0.113.4"},
            "db_endpoint": {"sensitive": false, "type": "string", "value": "10.0.0.3:5432"},
            "db_password": {"sensitive": true, "type": "string", "value": "hunter2"},
            "zones": {"sensitive": false, "type": ["list", "string"], "value": ["a", "b"]}
        }"#;
        let outputs = parse_outputs(json).unwrap();

        assert_eq!(outputs["public_address"].kind(), OutputKind::Address);
        assert_eq!(outputs["db_endpoint"].kind(), OutputKind::Endpoint);
        assert!(outputs["db_password"].is_sensitive());
        assert_eq!(outputs["db_password"].expose(), Some("hunter2"));
        assert_eq!(outputs["zones"].expose(), Some(r#"["a","b"]"#));
    }

    #[test]
    fn empty_state_has_no_outputs() {
        assert!(parse_outputs("{}\n").unwrap().is_empty());
        assert!(parse_outputs("").unwrap().is_empty());
    }

    #[test]
    fn garbage_is_malformed() {
        let err = parse_outputs("not json").unwrap_err();
        assert_eq!(err.kind(), super::super::InfraErrorKind::Malformed);
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let plan = InfraPlan::new(dir.path());
        let cli = TerraformCli::new("shipwright-no-such-binary");
        let err = cli.outputs(&plan).await.unwrap_err();
        assert_eq!(err.kind(), super::super::InfraErrorKind::Unavailable);
    }
}
