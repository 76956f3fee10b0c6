// ABOUTME: Builds the application deployment plan from configuration and collaborators.
// ABOUTME: provision -> bootstrap -> workload -> {migrate, healthcheck} -> certificate -> verify.

mod remote;

pub use remote::{CommandsStage, RemoteTarget, WorkloadSpec, WorkloadStage};

use crate::cert::{
    CertbotAuthority, CertificateAuthority, CertificateSettings, CertificateStage, DnsResolver,
    ProxyActivator, ProxySettings, SystemResolver,
};
use crate::config::{Config, resolve_env_map};
use crate::deploy::{DeploymentPlan, RetryPolicy, Stage, StageAction};
use crate::error::{Error, Result};
use crate::health::HealthcheckStage;
use crate::infra::{InfraPlan, InfraProvisioner, ProvisionStage, TerraformCli};
use crate::ssh::CommandRunner;
use crate::types::StageName;
use crate::verify::VerifyStage;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const PROVISION: &str = "provision";
pub const BOOTSTRAP: &str = "bootstrap";
pub const WORKLOAD: &str = "workload";
pub const MIGRATE: &str = "migrate";
pub const HEALTHCHECK: &str = "healthcheck";
pub const CERTIFICATE: &str = "certificate";
pub const VERIFY: &str = "verify";

/// External systems the stages talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub runner: Arc<dyn CommandRunner>,
    pub provisioner: Arc<dyn InfraProvisioner>,
    pub resolver: Arc<dyn DnsResolver>,
    pub authority: Arc<dyn CertificateAuthority>,
}

impl Collaborators {
    /// Terraform, the system resolver and certbot on the host, all through `runner`.
    pub fn live(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        let mut authority = CertbotAuthority::new(Arc::clone(&runner))
            .staging(config.certificate.staging);
        if let Some(proxy) = &config.proxy {
            authority = authority
                .webroot(proxy.webroot.clone())
                .cert_dir(proxy.cert_dir.clone());
        }
        Self {
            runner,
            provisioner: Arc::new(TerraformCli::new(config.infra.binary.clone())),
            resolver: Arc::new(SystemResolver),
            authority: Arc::new(authority),
        }
    }
}

fn name(value: &str) -> Result<StageName> {
    StageName::new(value).map_err(|e| Error::InvalidConfig(e.to_string()))
}

fn read_template(config: &Config, path: &Path) -> Result<String> {
    let path = config.resolve_path(path);
    std::fs::read_to_string(&path).map_err(|source| Error::ReadFile { path, source })
}

/// The provisioner's input: working directory plus project and configured variables.
pub fn infra_plan(config: &Config) -> Result<InfraPlan> {
    let mut plan = InfraPlan::new(config.resolve_path(&config.infra.working_dir))
        .variable("project", config.project.clone())
        .variable("region", config.region.clone())
        .variable("version", config.version.clone());
    if let Some(zone) = &config.zone {
        plan = plan.variable("zone", zone.clone());
    }
    for (key, value) in resolve_env_map(&config.infra.variables)? {
        plan = plan.variable(key, value);
    }
    Ok(plan)
}

/// Default retry policy for each stage.
fn default_policy(stage: &str, config: &Config) -> RetryPolicy {
    match stage {
        PROVISION => RetryPolicy::default()
            .backoff(Duration::from_secs(30), Duration::from_secs(300))
            .timeout(Duration::from_secs(30 * 60)),
        BOOTSTRAP => RetryPolicy::default()
            .backoff(Duration::from_secs(10), Duration::from_secs(60))
            .timeout(Duration::from_secs(15 * 60)),
        MIGRATE => RetryPolicy::default().max_attempts(2),
        HEALTHCHECK => {
            let budget: Duration = config.healthchecks.iter().map(|c| c.deadline).sum();
            RetryPolicy::default().timeout(budget + Duration::from_secs(60))
        }
        CERTIFICATE => RetryPolicy::default()
            .max_attempts(5)
            .backoff(Duration::from_secs(60), Duration::from_secs(15 * 60)),
        VERIFY => RetryPolicy::default()
            .max_attempts(2)
            .backoff(Duration::from_secs(10), Duration::from_secs(60))
            .timeout(config.verify.snapshot_timeout + Duration::from_secs(15 * 60)),
        _ => RetryPolicy::default(),
    }
}

struct Builder<'c> {
    config: &'c Config,
    stages: Vec<Stage>,
}

impl Builder<'_> {
    /// A stage with its default policy and any configured override.
    fn stage(
        &self,
        stage: &str,
        depends_on: &[&str],
        action: Arc<dyn StageAction>,
    ) -> Result<Stage> {
        let policy = default_policy(stage, self.config);
        let stage_name = name(stage)?;
        let policy = match self.config.retry.get(&stage_name) {
            Some(over) => over.apply(policy),
            None => policy,
        };
        let deps = depends_on
            .iter()
            .map(|dep| name(dep))
            .collect::<Result<Vec<_>>>()?;
        Ok(Stage::new(stage_name, action).depends_on(deps).retry(policy))
    }

    fn add(&mut self, stage: &str, depends_on: &[&str], action: Arc<dyn StageAction>) -> Result<()> {
        let stage = self.stage(stage, depends_on, action)?;
        self.stages.push(stage);
        Ok(())
    }
}

/// Assemble the deployment plan for `config`.
///
/// Templates are read from disk here so a missing file fails before any
/// stage runs.
pub fn build_plan(config: &Config, with: &Collaborators) -> Result<DeploymentPlan> {
    let values = Arc::new(config.template_values()?);
    let host = config.host.target();
    let target = RemoteTarget {
        runner: Arc::clone(&with.runner),
        host: host.clone(),
        timeout: config.host.command_timeout,
        values: Arc::clone(&values),
    };
    let mut plan = Builder {
        config,
        stages: Vec::new(),
    };

    plan.add(
        PROVISION,
        &[],
        Arc::new(ProvisionStage::new(
            Arc::clone(&with.provisioner),
            infra_plan(config)?,
            config.infra.public_address_output.clone(),
        )),
    )?;

    let bootstrap = CommandsStage::new(BOOTSTRAP, config.bootstrap.clone(), target.clone())
        .with_marker(&config.project, BOOTSTRAP);
    let bootstrap = plan.stage(BOOTSTRAP, &[PROVISION], Arc::new(bootstrap))?;
    plan.stages.push(bootstrap.idempotent(false));

    let workload = WorkloadSpec {
        template: read_template(config, &config.workload.template)?,
        remote_path: config.workload.remote_path.clone(),
        start_command: config.workload.start_command.clone(),
        stop_command: config.workload.stop_command.clone(),
    };
    plan.add(
        WORKLOAD,
        &[BOOTSTRAP],
        Arc::new(WorkloadStage::new(workload, target.clone())),
    )?;

    if !config.migrations.commands.is_empty() {
        let migrate = CommandsStage::new("migration", config.migrations.commands.clone(), target);
        let migrate = plan.stage(MIGRATE, &[WORKLOAD], Arc::new(migrate))?;
        plan.stages
            .push(migrate.best_effort(config.migrations.best_effort));
    }

    plan.add(
        HEALTHCHECK,
        &[WORKLOAD],
        Arc::new(HealthcheckStage::new(
            config.healthchecks.clone(),
            Arc::clone(&with.runner),
            host.clone(),
        )),
    )?;

    let mut verify_deps = vec![HEALTHCHECK];
    if let (Some(domain), Some(contact), Some(proxy)) =
        (&config.domain, &config.admin_email, &config.proxy)
    {
        let settings = ProxySettings {
            template: read_template(config, &proxy.template)?,
            remote_path: proxy.remote_path.clone(),
            test_command: proxy.test_command.clone(),
            reload_command: proxy.reload_command.clone(),
        };
        let activator = ProxyActivator::new(
            Arc::clone(&with.runner),
            settings,
            config.host.command_timeout,
        );
        let stage = CertificateStage::new(
            CertificateSettings {
                domain: domain.clone(),
                contact: contact.clone(),
                allow_dns_override: config.certificate.allow_dns_override,
            },
            host.clone(),
            Arc::clone(&with.resolver),
            Arc::clone(&with.authority),
            activator,
        );
        plan.add(CERTIFICATE, &[HEALTHCHECK], Arc::new(stage))?;
        verify_deps.push(CERTIFICATE);
    }

    plan.add(
        VERIFY,
        &verify_deps,
        Arc::new(VerifyStage::new(
            config.verify.clone(),
            Arc::clone(&with.runner),
            host,
        )),
    )?;

    for stage in config.retry.keys() {
        if !plan.stages.iter().any(|s| s.name() == stage) {
            return Err(Error::InvalidConfig(format!(
                "retry override for unknown stage '{}'",
                stage
            )));
        }
    }

    Ok(DeploymentPlan::new(plan.stages)?)
}
