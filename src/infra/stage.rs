// ABOUTME: The provision stage: apply infrastructure, publish its outputs, destroy on rollback.
// ABOUTME: Re-reads outputs on resume because sensitive values are never persisted.

use super::{InfraOutputs, InfraPlan, InfraProvisioner};
use crate::deploy::{OutputKind, OutputValue, Outputs, StageAction, StageContext, StageError};
use async_trait::async_trait;
use std::sync::Arc;

/// Output key under which the host address is always published.
pub const PUBLIC_ADDRESS: &str = "public_address";

pub struct ProvisionStage {
    provisioner: Arc<dyn InfraProvisioner>,
    plan: InfraPlan,
    address_output: String,
}

impl ProvisionStage {
    /// `address_output` names the provisioner output holding the public address.
    pub fn new(
        provisioner: Arc<dyn InfraProvisioner>,
        plan: InfraPlan,
        address_output: impl Into<String>,
    ) -> Self {
        Self {
            provisioner,
            plan,
            address_output: address_output.into(),
        }
    }

    fn publish(&self, mut outputs: InfraOutputs) -> Result<Outputs, StageError> {
        if self.address_output != PUBLIC_ADDRESS {
            let address = outputs.remove(&self.address_output).ok_or_else(|| {
                StageError::fatal(format!(
                    "provisioner produced no '{}' output",
                    self.address_output
                ))
            })?;
            let value = address.expose().unwrap_or_default().to_string();
            outputs.insert(
                PUBLIC_ADDRESS.to_string(),
                OutputValue::new(OutputKind::Address, value),
            );
        }
        match outputs.get(PUBLIC_ADDRESS).and_then(OutputValue::expose) {
            Some(address) if !address.is_empty() => Ok(outputs),
            _ => Err(StageError::fatal(format!(
                "provisioner produced no usable '{}' output",
                self.address_output
            ))),
        }
    }
}

#[async_trait]
impl StageAction for ProvisionStage {
    async fn run(&self, _ctx: &StageContext) -> Result<Outputs, StageError> {
        let outputs = self.provisioner.apply(&self.plan).await?;
        self.publish(outputs)
    }

    fn compensates(&self) -> bool {
        true
    }

    async fn compensate(&self, _ctx: &StageContext) -> Result<(), StageError> {
        tracing::warn!("destroying provisioned infrastructure");
        self.provisioner.destroy(&self.plan).await?;
        Ok(())
    }

    async fn rehydrate(&self, _ctx: &StageContext) -> Result<Outputs, StageError> {
        let outputs = self.provisioner.outputs(&self.plan).await?;
        self.publish(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::{OutputView, StageErrorKind};
    use crate::infra::InfraError;
    use crate::types::StageName;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeProvisioner {
        outputs: InfraOutputs,
        destroyed: Mutex<u32>,
    }

    #[async_trait]
    impl InfraProvisioner for FakeProvisioner {
        async fn apply(&self, _plan: &InfraPlan) -> Result<InfraOutputs, InfraError> {
            Ok(self.outputs.clone())
        }

        async fn destroy(&self, _plan: &InfraPlan) -> Result<(), InfraError> {
            *self.destroyed.lock() += 1;
            Ok(())
        }

        async fn outputs(&self, _plan: &InfraPlan) -> Result<InfraOutputs, InfraError> {
            Ok(self.outputs.clone())
        }
    }

    fn ctx() -> StageContext {
        StageContext::detached(StageName::new("provision").unwrap(), OutputView::default())
    }

    #[tokio::test]
    async fn renames_address_output() {
        let fake = Arc::new(FakeProvisioner {
            outputs: InfraOutputs::from([
                ("vm_ip".to_string(), OutputValue::address("198.51.100.2")),
                ("db_password".to_string(), OutputValue::secret("s3cret")),
            ]),
            ..Default::default()
        });
        let stage = ProvisionStage::new(fake, InfraPlan::default(), "vm_ip");
        let outputs = stage.run(&ctx()).await.unwrap();
        assert_eq!(outputs[PUBLIC_ADDRESS].expose(), Some("198.51.100.2"));
        assert!(!outputs.contains_key("vm_ip"));
        assert!(outputs["db_password"].is_sensitive());
    }

    #[tokio::test]
    async fn missing_address_is_fatal() {
        let fake = Arc::new(FakeProvisioner::default());
        let stage = ProvisionStage::new(fake, InfraPlan::default(), PUBLIC_ADDRESS);
        let err = stage.run(&ctx()).await.unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Fatal);
    }

    #[tokio::test]
    async fn compensation_destroys() {
        let fake = Arc::new(FakeProvisioner::default());
        let stage = ProvisionStage::new(fake.clone(), InfraPlan::default(), PUBLIC_ADDRESS);
        assert!(stage.compensates());
        stage.compensate(&ctx()).await.unwrap();
        assert_eq!(*fake.destroyed.lock(), 1);
    }
}
