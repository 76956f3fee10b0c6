// ABOUTME: Configuration types and parsing for shipwright.yml.
// ABOUTME: Handles discovery, YAML parsing, CLI overrides and validation.

mod deserialize;
mod env_value;
mod host;
mod init;
mod sections;

pub use env_value::{EnvValue, resolve_env_map};
pub use host::HostConfig;
pub use init::init_config;
pub use sections::{
    CertificateConfig, CommandSpec, InfraConfig, MigrationsConfig, ProxyConfig, RetryOverride,
    RunnerConfig, WorkloadConfig,
};

use crate::error::{Error, Result};
use crate::health::HealthCheckSpec;
use crate::types::{RunId, StageName};
use crate::verify::VerifySettings;
use deserialize::{deserialize_commands, deserialize_healthchecks, deserialize_retry_overrides};
use nonempty::NonEmpty;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CONFIG_FILENAME: &str = "shipwright.yml";
pub const CONFIG_FILENAME_ALT: &str = "shipwright.yaml";
pub const CONFIG_FILENAME_DIR: &str = ".shipwright/config.yml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub project: String,

    pub region: String,

    #[serde(default)]
    pub zone: Option<String>,

    #[serde(default = "default_version")]
    pub version: String,

    /// Public domain; enables the certificate stage.
    #[serde(default)]
    pub domain: Option<String>,

    /// Contact address for the certificate authority.
    #[serde(default)]
    pub admin_email: Option<String>,

    #[serde(default)]
    pub host: HostConfig,

    #[serde(default)]
    pub infra: InfraConfig,

    pub workload: WorkloadConfig,

    #[serde(default, deserialize_with = "deserialize_commands")]
    pub bootstrap: Vec<CommandSpec>,

    #[serde(default)]
    pub migrations: MigrationsConfig,

    #[serde(deserialize_with = "deserialize_healthchecks")]
    pub healthchecks: NonEmpty<HealthCheckSpec>,

    #[serde(default)]
    pub proxy: Option<ProxyConfig>,

    #[serde(default)]
    pub certificate: CertificateConfig,

    #[serde(default)]
    pub verify: VerifySettings,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default, deserialize_with = "deserialize_retry_overrides")]
    pub retry: BTreeMap<StageName, RetryOverride>,

    /// Extra values for templates, e.g. `db_password: { env: DB_PASSWORD }`.
    #[serde(default)]
    pub env: BTreeMap<String, EnvValue>,

    /// Directory the configuration was loaded from; relative paths resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_version() -> String {
    "latest".to_string()
}

/// Values given on the command line, which win over the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub project: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub domain: Option<String>,
    pub admin_email: Option<String>,
    pub version: Option<String>,
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(Error::from)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&content)?;
        config.base_dir = config_root(path);
        Ok(config)
    }

    pub fn discover(dir: &Path) -> Result<Self> {
        let candidates = [
            dir.join(CONFIG_FILENAME),
            dir.join(CONFIG_FILENAME_ALT),
            dir.join(CONFIG_FILENAME_DIR),
        ];

        for path in &candidates {
            if path.exists() {
                return Self::load(path);
            }
        }

        Err(Error::ConfigNotFound(dir.to_path_buf()))
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(project) = &overrides.project {
            self.project = project.clone();
        }
        if let Some(region) = &overrides.region {
            self.region = region.clone();
        }
        if overrides.zone.is_some() {
            self.zone = overrides.zone.clone();
        }
        if overrides.domain.is_some() {
            self.domain = overrides.domain.clone();
        }
        if overrides.admin_email.is_some() {
            self.admin_email = overrides.admin_email.clone();
        }
        if let Some(version) = &overrides.version {
            self.version = version.clone();
        }
    }

    /// Checks that span several sections.
    pub fn validate(&self) -> Result<()> {
        if self.project.is_empty()
            || !self
                .project
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::InvalidConfig(format!(
                "project '{}' must be non-empty and use only letters, digits, '-' or '_'",
                self.project
            )));
        }
        if self.region.trim().is_empty() {
            return Err(Error::InvalidConfig("region must not be empty".to_string()));
        }
        if self.runner.workers == 0 {
            return Err(Error::InvalidConfig("runner.workers must be at least 1".to_string()));
        }
        if let Some(domain) = &self.domain {
            if domain.trim().is_empty() || domain.contains(char::is_whitespace) {
                return Err(Error::InvalidConfig(format!("invalid domain '{}'", domain)));
            }
            if self.admin_email.is_none() {
                return Err(Error::InvalidConfig(
                    "a domain needs admin_email for certificate registration".to_string(),
                ));
            }
            if self.proxy.is_none() {
                return Err(Error::InvalidConfig(
                    "a domain needs a proxy section to activate TLS".to_string(),
                ));
            }
        }
        let mut names = std::collections::BTreeSet::new();
        for check in &self.healthchecks {
            if !names.insert(check.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "health check '{}' is declared more than once",
                    check.name
                )));
            }
            if check.interval.is_zero() {
                return Err(Error::InvalidConfig(format!(
                    "health check '{}' needs a non-zero interval",
                    check.name
                )));
            }
        }
        Ok(())
    }

    /// Resolve a path from the file against the config's directory.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Directory for persisted run state.
    pub fn state_dir(&self) -> PathBuf {
        self.resolve_path(&self.runner.state_dir)
    }

    /// A fresh run identifier for this project.
    pub fn new_run_id(&self) -> RunId {
        RunId::generate(&self.project, chrono::Utc::now())
    }

    /// Project-level values available to every template.
    pub fn template_values(&self) -> Result<BTreeMap<String, String>> {
        let mut values = resolve_env_map(&self.env)?;
        values.insert("project".to_string(), self.project.clone());
        values.insert("region".to_string(), self.region.clone());
        values.insert("version".to_string(), self.version.clone());
        if let Some(zone) = &self.zone {
            values.insert("zone".to_string(), zone.clone());
        }
        if let Some(domain) = &self.domain {
            values.insert("domain".to_string(), domain.clone());
        }
        if let Some(email) = &self.admin_email {
            values.insert("admin_email".to_string(), email.clone());
        }
        Ok(values)
    }
}

/// The project directory for a config file, stepping out of `.shipwright/`.
fn config_root(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or(Path::new("."));
    if parent.file_name().is_some_and(|name| name == ".shipwright") {
        parent.parent().unwrap_or(Path::new(".")).to_path_buf()
    } else {
        parent.to_path_buf()
    }
}
