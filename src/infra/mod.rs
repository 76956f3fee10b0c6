// ABOUTME: Infra Provisioner Adapter: the trait the orchestrator drives and its CLI implementation.
// ABOUTME: Resource declarations stay opaque; only the output map is read.

mod error;
mod stage;
mod terraform;

pub use error::{InfraError, InfraErrorKind, classify};
pub use stage::{PUBLIC_ADDRESS, ProvisionStage};
pub use terraform::{TerraformCli, parse_outputs};

use crate::deploy::Outputs;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Key-value outputs read back after apply.
pub type InfraOutputs = Outputs;

/// A named set of resource declarations and the variables that parameterize it.
#[derive(Clone, Default)]
pub struct InfraPlan {
    /// Directory holding the declarations.
    pub working_dir: PathBuf,
    /// Input variables; values may be secrets.
    pub variables: BTreeMap<String, String>,
}

impl fmt::Debug for InfraPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfraPlan")
            .field("working_dir", &self.working_dir)
            .field("variables", &self.variables.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl InfraPlan {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            variables: BTreeMap::new(),
        }
    }

    pub fn variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

/// Realizes and tears down infrastructure.
///
/// `apply` must treat "nothing to change" as success so a resumed run can
/// call it again safely.
#[async_trait]
pub trait InfraProvisioner: Send + Sync {
    async fn apply(&self, plan: &InfraPlan) -> Result<InfraOutputs, InfraError>;

    async fn destroy(&self, plan: &InfraPlan) -> Result<(), InfraError>;

    /// Read the current output map without changing anything.
    async fn outputs(&self, plan: &InfraPlan) -> Result<InfraOutputs, InfraError>;
}
