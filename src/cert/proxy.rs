// ABOUTME: Switches the reverse proxy from plaintext to TLS once the certificate is on disk.
// ABOUTME: The previous configuration is kept beside the new one and restored on rollback.

use super::{CertError, IssuedCertificate};
use crate::ssh::{CommandRunner, TargetHost, shell};
use crate::template::{self, Vars};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Where and how the proxy configuration lives on the host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProxySettings {
    /// Template contents with `${domain}`, `${certificate_path}` and `${key_path}` placeholders.
    pub template: String,
    pub remote_path: String,
    #[serde(default)]
    pub test_command: Option<String>,
    pub reload_command: String,
}

pub struct ProxyActivator {
    runner: Arc<dyn CommandRunner>,
    settings: ProxySettings,
    timeout: Duration,
}

impl ProxyActivator {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: ProxySettings, timeout: Duration) -> Self {
        Self {
            runner,
            settings,
            timeout,
        }
    }

    async fn run(&self, host: &TargetHost, command: &str) -> Result<(bool, String), CertError> {
        let output = self.runner.run(host, command, self.timeout).await?;
        let detail = if output.stderr.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        Ok((output.success(), detail))
    }

    /// Install the TLS configuration for `cert`, keeping the previous one as
    /// the backup owned by `owner`.
    ///
    /// Nothing is touched unless both certificate files exist. A configuration
    /// that fails the proxy's own test is reverted before returning.
    pub async fn activate(
        &self,
        host: &TargetHost,
        cert: &IssuedCertificate,
        vars: &Vars<'_>,
        owner: &str,
    ) -> Result<(), CertError> {
        let present = format!(
            "test -f {} && test -f {}",
            shell::quote(&cert.certificate_path),
            shell::quote(&cert.key_path)
        );
        if !self.run(host, &present).await?.0 {
            return Err(CertError::CertificateMissing(cert.certificate_path.clone()));
        }

        let mut vars = vars.clone();
        vars.insert("certificate_path", &cert.certificate_path);
        vars.insert("key_path", &cert.key_path);
        let rendered = template::render(&self.settings.template, &vars)?;

        let path = self.settings.remote_path.as_str();
        let swap = format!(
            "{} && {}",
            shell::backup_file(path, owner),
            shell::write_file(path, &rendered)
        );
        let (ok, detail) = self.run(host, &swap).await?;
        if !ok {
            return Err(CertError::ProxyReload(format!("could not write {}: {}", path, detail)));
        }

        if let Some(test) = &self.settings.test_command {
            let (ok, detail) = self.run(host, test).await?;
            if !ok {
                tracing::warn!("proxy rejected new configuration, restoring previous one");
                self.run(host, &shell::restore_file(path, owner)).await?;
                return Err(CertError::ProxyTest(detail));
            }
        }

        let (ok, detail) = self.run(host, &self.settings.reload_command).await?;
        if !ok {
            self.restore(host, owner).await?;
            return Err(CertError::ProxyReload(detail));
        }
        tracing::info!("proxy now serving TLS from {}", path);
        Ok(())
    }

    /// Put the configuration `owner` replaced back and reload.
    pub async fn restore(&self, host: &TargetHost, owner: &str) -> Result<(), CertError> {
        let command = format!(
            "{} && {}",
            shell::restore_file(&self.settings.remote_path, owner),
            self.settings.reload_command
        );
        let (ok, detail) = self.run(host, &command).await?;
        if !ok {
            return Err(CertError::ProxyReload(detail));
        }
        Ok(())
    }
}
