// ABOUTME: Destroy command: tears down the infrastructure through the provisioner.
// ABOUTME: Requires explicit confirmation because it deletes cloud resources.

use shipwright::config::Config;
use shipwright::error::{Error, Result};
use shipwright::infra::{InfraProvisioner, TerraformCli};
use shipwright::output::Output;
use shipwright::pipeline::infra_plan;

pub async fn destroy(config: Config, confirmed: bool, mut output: Output) -> Result<()> {
    config.validate()?;
    if !confirmed {
        return Err(Error::InvalidConfig(format!(
            "destroying '{}' deletes its infrastructure; pass --yes to confirm",
            config.project
        )));
    }
    output.start_timer();

    let plan = infra_plan(&config)?;
    output.progress(&format!("Destroying infrastructure for {}...", config.project));
    TerraformCli::new(config.infra.binary.clone())
        .destroy(&plan)
        .await?;
    output.success(&format!("Destroyed infrastructure for {}", config.project));
    Ok(())
}
