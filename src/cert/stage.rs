// ABOUTME: The certificate stage driving CertState from DNS validation to an active TLS proxy.
// ABOUTME: A DNS mismatch defers the stage unless the operator allowed an override.

use super::{
    CertError, CertState, CertificateAuthority, DnsResolver, IssuedCertificate, ProxyActivator,
};
use crate::deploy::{OutputValue, Outputs, StageAction, StageContext, StageError};
use crate::diagnostics::Warning;
use crate::infra::PUBLIC_ADDRESS;
use crate::ssh::TargetHost;
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;

/// Output key recording how far the certificate got.
pub const CERTIFICATE_STATE: &str = "certificate_state";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSettings {
    pub domain: String,
    pub contact: String,
    /// Continue with a warning when DNS does not point at the host yet.
    pub allow_dns_override: bool,
}

pub struct CertificateStage {
    settings: CertificateSettings,
    host: TargetHost,
    resolver: Arc<dyn DnsResolver>,
    authority: Arc<dyn CertificateAuthority>,
    activator: ProxyActivator,
}

fn state_output(state: CertState) -> Outputs {
    Outputs::from([(
        CERTIFICATE_STATE.to_string(),
        OutputValue::text(state.as_str()),
    )])
}

impl CertificateStage {
    /// `host.address` may be a placeholder such as `${public_address}`.
    pub fn new(
        settings: CertificateSettings,
        host: TargetHost,
        resolver: Arc<dyn DnsResolver>,
        authority: Arc<dyn CertificateAuthority>,
        activator: ProxyActivator,
    ) -> Self {
        Self {
            settings,
            host,
            resolver,
            authority,
            activator,
        }
    }

    async fn validate_dns(
        &self,
        ctx: &StageContext,
        state: &mut CertState,
        expected: IpAddr,
    ) -> Result<(), StageError> {
        let domain = self.settings.domain.as_str();
        let found = match self.resolver.resolve(domain).await {
            Ok(found) => found,
            Err(e) => {
                tracing::debug!("lookup of {} failed: {}", domain, e);
                Vec::new()
            }
        };

        if !found.contains(&expected) {
            let mismatch = CertError::DnsMismatch {
                domain: domain.to_string(),
                expected,
                found,
            };
            if !self.settings.allow_dns_override {
                tracing::warn!("{}; certificate issuance waits for DNS", mismatch);
                return Err(StageError::from(mismatch).with_partial_outputs(state_output(*state)));
            }
            ctx.warn(Warning::dns_mismatch(format!(
                "{}; continuing because the DNS override is enabled",
                mismatch
            )));
        }
        state.advance(CertState::DnsValidated)?;
        Ok(())
    }

    async fn issue_and_activate(
        &self,
        ctx: &StageContext,
        state: &mut CertState,
        host: &TargetHost,
    ) -> Result<IssuedCertificate, CertError> {
        state.advance(CertState::Issuing)?;
        let cert = self
            .authority
            .issue(host, &self.settings.domain, &self.settings.contact)
            .await?;
        state.advance(CertState::Issued)?;

        let mut vars = ctx.outputs.flatten();
        vars.insert("domain", self.settings.domain.as_str());
        self.activator
            .activate(host, &cert, &vars, ctx.run_id.as_str())
            .await?;
        state.advance(CertState::Active)?;
        Ok(cert)
    }
}

#[async_trait]
impl StageAction for CertificateStage {
    async fn run(&self, ctx: &StageContext) -> Result<Outputs, StageError> {
        let host = self.host.render(&ctx.outputs.flatten())?;
        let address = ctx.outputs.require(PUBLIC_ADDRESS)?;
        let expected: IpAddr = address.parse().map_err(|_| {
            StageError::fatal(format!("public address '{}' is not an IP address", address))
        })?;

        let mut state = CertState::Unbound;
        self.validate_dns(ctx, &mut state, expected).await?;

        let cert = self
            .issue_and_activate(ctx, &mut state, &host)
            .await
            .map_err(|e| StageError::from(e).with_partial_outputs(state_output(state)))?;

        let mut outputs = state_output(state);
        outputs.insert(
            "certificate_path".to_string(),
            OutputValue::text(cert.certificate_path),
        );
        outputs.insert(
            "https_endpoint".to_string(),
            OutputValue::endpoint(format!("https://{}", self.settings.domain)),
        );
        Ok(outputs)
    }

    fn compensates(&self) -> bool {
        true
    }

    /// Restore the plaintext proxy configuration if activation may have touched it.
    async fn compensate(&self, ctx: &StageContext) -> Result<(), StageError> {
        let reached = ctx
            .outputs
            .from_stage(&ctx.stage)
            .and_then(|outputs| outputs.get(CERTIFICATE_STATE))
            .and_then(OutputValue::expose)
            .map(str::to_string);
        if !matches!(reached.as_deref(), Some("issued") | Some("active")) {
            tracing::debug!("proxy configuration untouched, nothing to restore");
            return Ok(());
        }
        let host = self.host.render(&ctx.outputs.flatten())?;
        self.activator.restore(&host, ctx.run_id.as_str()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::ProxySettings;
    use crate::deploy::{OutputView, StageErrorKind};
    use crate::ssh::{CommandOutput, CommandRunner};
    use crate::types::StageName;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::io;
    use std::time::Duration;

    struct FixedResolver(Vec<IpAddr>);

    #[async_trait]
    impl DnsResolver for FixedResolver {
        async fn resolve(&self, _domain: &str) -> io::Result<Vec<IpAddr>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct CountingAuthority {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl CertificateAuthority for CountingAuthority {
        async fn issue(
            &self,
            _host: &TargetHost,
            domain: &str,
            _contact: &str,
        ) -> Result<IssuedCertificate, CertError> {
            *self.calls.lock() += 1;
            Ok(IssuedCertificate {
                certificate_path: format!("/certs/{}/fullchain.pem", domain),
                key_path: format!("/certs/{}/privkey.pem", domain),
            })
        }
    }

    #[derive(Default)]
    struct RecordingRunner {
        commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(
            &self,
            _host: &TargetHost,
            command: &str,
            _timeout: Duration,
        ) -> crate::ssh::Result<CommandOutput> {
            self.commands.lock().push(command.to_string());
            Ok(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    fn stage(
        resolved: &str,
        allow_dns_override: bool,
        authority: Arc<CountingAuthority>,
        runner: Arc<RecordingRunner>,
    ) -> CertificateStage {
        let activator = ProxyActivator::new(
            runner,
            ProxySettings {
                template: "server_name ${domain}; ssl_certificate ${certificate_path};".to_string(),
                remote_path: "/etc/nginx/conf.d/app.conf".to_string(),
                test_command: Some("nginx -t".to_string()),
                reload_command: "systemctl reload nginx".to_string(),
            },
            Duration::from_secs(30),
        );
        CertificateStage::new(
            CertificateSettings {
                domain: "app.example.org".to_string(),
                contact: "ops@example.org".to_string(),
                allow_dns_override,
            },
            TargetHost::new("${public_address}", "deploy"),
            Arc::new(FixedResolver(vec![resolved.parse().unwrap()])),
            authority,
            activator,
        )
    }

    fn ctx() -> StageContext {
        let provision = StageName::new("provision").unwrap();
        let outputs = BTreeMap::from([(
            provision,
            Outputs::from([(
                PUBLIC_ADDRESS.to_string(),
                OutputValue::address("203.0.113.10"),
            )]),
        )]);
        StageContext::detached(StageName::new("certificate").unwrap(), OutputView::new(outputs))
    }

    #[tokio::test]
    async fn mismatch_without_override_defers_before_issuing() {
        let authority = Arc::new(CountingAuthority::default());
        let runner = Arc::new(RecordingRunner::default());
        let stage = stage("198.51.100.99", false, authority.clone(), runner.clone());

        let err = stage.run(&ctx()).await.unwrap_err();
        assert_eq!(err.kind, StageErrorKind::Deferred);
        assert_eq!(
            err.partial_outputs[CERTIFICATE_STATE].expose(),
            Some("unbound")
        );
        assert_eq!(*authority.calls.lock(), 0);
        assert!(runner.commands.lock().is_empty());
    }

    #[tokio::test]
    async fn mismatch_with_override_warns_and_activates() {
        let authority = Arc::new(CountingAuthority::default());
        let runner = Arc::new(RecordingRunner::default());
        let stage = stage("198.51.100.99", true, authority.clone(), runner.clone());
        let ctx = ctx();

        let outputs = stage.run(&ctx).await.unwrap();
        assert_eq!(outputs[CERTIFICATE_STATE].expose(), Some("active"));
        assert_eq!(ctx.warnings().len(), 1);
        assert_eq!(*authority.calls.lock(), 1);
    }

    #[tokio::test]
    async fn activation_checks_files_before_swapping_config() {
        let authority = Arc::new(CountingAuthority::default());
        let runner = Arc::new(RecordingRunner::default());
        let stage = stage("203.0.113.10", false, authority, runner.clone());

        stage.run(&ctx()).await.unwrap();
        let commands = runner.commands.lock();
        assert!(commands[0].starts_with("test -f '/certs/app.example.org/fullchain.pem'"));
        assert!(commands[1].contains("shipwright-bak"));
        assert!(commands[1].contains("server_name app.example.org;"));
        assert_eq!(commands[2], "nginx -t");
        assert_eq!(commands[3], "systemctl reload nginx");
    }

    #[tokio::test]
    async fn compensation_skips_untouched_proxy() {
        let runner = Arc::new(RecordingRunner::default());
        let stage = stage(
            "203.0.113.10",
            false,
            Arc::new(CountingAuthority::default()),
            runner.clone(),
        );
        stage.compensate(&ctx()).await.unwrap();
        assert!(runner.commands.lock().is_empty());
    }
}
