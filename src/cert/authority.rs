// ABOUTME: Certificate authority seam and a certbot-on-the-host implementation.
// ABOUTME: Maps certbot failures onto rate-limit, challenge and tool errors.

use super::CertError;
use crate::ssh::{CommandRunner, TargetHost, shell};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Paths of an issued certificate on the target host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub certificate_path: String,
    pub key_path: String,
}

#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Obtain (or keep) a certificate for `domain` on `host`.
    async fn issue(
        &self,
        host: &TargetHost,
        domain: &str,
        contact: &str,
    ) -> Result<IssuedCertificate, CertError>;
}

/// Runs `certbot certonly --webroot` on the target host.
#[derive(Clone)]
pub struct CertbotAuthority {
    runner: Arc<dyn CommandRunner>,
    webroot: String,
    cert_dir: String,
    staging: bool,
    timeout: Duration,
}

impl CertbotAuthority {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            webroot: "/var/www/certbot".to_string(),
            cert_dir: "/etc/letsencrypt/live".to_string(),
            staging: false,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn webroot(mut self, webroot: impl Into<String>) -> Self {
        self.webroot = webroot.into();
        self
    }

    pub fn cert_dir(mut self, cert_dir: impl Into<String>) -> Self {
        self.cert_dir = cert_dir.into();
        self
    }

    /// Use the authority's staging environment.
    pub fn staging(mut self, staging: bool) -> Self {
        self.staging = staging;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(&self, domain: &str, contact: &str) -> String {
        let mut cmd = format!(
            "mkdir -p {webroot} && certbot certonly --webroot -w {webroot} -d {domain} \
             --email {contact} --agree-tos --non-interactive --keep-until-expiring",
            webroot = shell::quote(&self.webroot),
            domain = shell::quote(domain),
            contact = shell::quote(contact),
        );
        if self.staging {
            cmd.push_str(" --staging");
        }
        cmd
    }
}

/// Interpret a failed certbot run.
pub(crate) fn classify_failure(exit_code: u32, output: &str) -> CertError {
    let lower = output.to_ascii_lowercase();
    let detail = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no output")
        .to_string();

    if exit_code == 127 || lower.contains("command not found") {
        CertError::ToolMissing(detail)
    } else if lower.contains("too many certificates")
        || lower.contains("ratelimited")
        || lower.contains("rate limit")
        || lower.contains("too many failed authorizations")
    {
        CertError::RateLimited(detail)
    } else if lower.contains("challenge failed")
        || lower.contains("unauthorized")
        || lower.contains("dns problem")
        || lower.contains("connection refused")
    {
        CertError::ChallengeFailed(detail)
    } else {
        CertError::Authority(detail)
    }
}

#[async_trait]
impl CertificateAuthority for CertbotAuthority {
    async fn issue(
        &self,
        host: &TargetHost,
        domain: &str,
        contact: &str,
    ) -> Result<IssuedCertificate, CertError> {
        let command = self.command(domain, contact);
        tracing::info!("requesting certificate for {} on {}", domain, host);
        let output = self.runner.run(host, &command, self.timeout).await?;
        if !output.success() {
            let combined = format!("{}\n{}", output.stdout, output.stderr);
            return Err(classify_failure(output.exit_code, &combined));
        }

        let live = format!("{}/{}", self.cert_dir.trim_end_matches('/'), domain);
        Ok(IssuedCertificate {
            certificate_path: format!("{}/fullchain.pem", live),
            key_path: format!("{}/privkey.pem", live),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_certbot_failures() {
        assert!(matches!(
            classify_failure(1, "Error creating new order :: too many certificates already issued"),
            CertError::RateLimited(_)
        ));
        assert!(matches!(
            classify_failure(1, "Challenge failed for domain example.org"),
            CertError::ChallengeFailed(_)
        ));
        assert!(matches!(
            classify_failure(127, "sh: certbot: command not found"),
            CertError::ToolMissing(_)
        ));
        assert!(matches!(classify_failure(1, "boom"), CertError::Authority(_)));
    }

    #[test]
    fn staging_flag_is_appended() {
        struct Unused;

        #[async_trait]
        impl CommandRunner for Unused {
            async fn run(
                &self,
                _host: &TargetHost,
                _command: &str,
                _timeout: Duration,
            ) -> crate::ssh::Result<crate::ssh::CommandOutput> {
                unreachable!("not executed")
            }
        }

        let authority = CertbotAuthority::new(Arc::new(Unused)).staging(true);
        let cmd = authority.command("example.org", "ops@example.org");
        assert!(cmd.contains("-d 'example.org'"));
        assert!(cmd.ends_with("--staging"));
    }
}
