// ABOUTME: Certificate Stage: DNS validation, issuance through a certificate authority, proxy swap.
// ABOUTME: Walks unbound -> dns_validated -> issuing -> issued -> active, one step at a time.

mod authority;
mod dns;
mod proxy;
mod stage;

pub use authority::{CertbotAuthority, CertificateAuthority, IssuedCertificate};
pub use dns::{DnsResolver, SystemResolver};
pub use proxy::{ProxyActivator, ProxySettings};
pub use stage::{CERTIFICATE_STATE, CertificateSettings, CertificateStage};

use crate::deploy::StageError;
use crate::template::TemplateError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

/// Progress of one domain's certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertState {
    Unbound,
    DnsValidated,
    Issuing,
    Issued,
    Active,
}

impl CertState {
    pub fn as_str(self) -> &'static str {
        match self {
            CertState::Unbound => "unbound",
            CertState::DnsValidated => "dns_validated",
            CertState::Issuing => "issuing",
            CertState::Issued => "issued",
            CertState::Active => "active",
        }
    }

    /// The only state reachable from this one.
    pub fn next(self) -> Option<CertState> {
        match self {
            CertState::Unbound => Some(CertState::DnsValidated),
            CertState::DnsValidated => Some(CertState::Issuing),
            CertState::Issuing => Some(CertState::Issued),
            CertState::Issued => Some(CertState::Active),
            CertState::Active => None,
        }
    }

    /// Move to `to`, which must be the immediate successor.
    pub fn advance(&mut self, to: CertState) -> Result<(), CertError> {
        if self.next() != Some(to) {
            return Err(CertError::InvalidTransition { from: *self, to });
        }
        tracing::debug!("certificate {} -> {}", self, to);
        *self = to;
        Ok(())
    }
}

impl fmt::Display for CertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CertError {
    #[error("{domain} resolves to [{}], expected {expected}", join_addrs(.found))]
    DnsMismatch {
        domain: String,
        expected: IpAddr,
        found: Vec<IpAddr>,
    },

    #[error("certificate authority rate limit: {0}")]
    RateLimited(String),

    #[error("certificate authority rejected the challenge: {0}")]
    ChallengeFailed(String),

    #[error("certificate request failed: {0}")]
    Authority(String),

    #[error("certificate tool not available on host: {0}")]
    ToolMissing(String),

    #[error("certificate files not present at {0}")]
    CertificateMissing(String),

    #[error("proxy configuration test failed: {0}")]
    ProxyTest(String),

    #[error("proxy reload failed: {0}")]
    ProxyReload(String),

    #[error("invalid certificate state transition {from} -> {to}")]
    InvalidTransition { from: CertState, to: CertState },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Remote(#[from] crate::ssh::Error),
}

fn join_addrs(addrs: &[IpAddr]) -> String {
    addrs
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<CertError> for StageError {
    fn from(err: CertError) -> Self {
        match err {
            CertError::Remote(e) => StageError::from(e),
            CertError::RateLimited(_)
            | CertError::ChallengeFailed(_)
            | CertError::Authority(_)
            | CertError::ProxyReload(_) => StageError::transient(err.to_string()),
            CertError::CertificateMissing(_) => StageError::verification(err.to_string()),
            CertError::DnsMismatch { .. } => StageError::deferred(err.to_string()),
            CertError::ToolMissing(_)
            | CertError::ProxyTest(_)
            | CertError::InvalidTransition { .. }
            | CertError::Template(_) => StageError::fatal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::StageErrorKind;

    #[test]
    fn walks_forward_one_step_at_a_time() {
        let mut state = CertState::Unbound;
        state.advance(CertState::DnsValidated).unwrap();
        assert!(matches!(
            state.advance(CertState::Active),
            Err(CertError::InvalidTransition { .. })
        ));
        state.advance(CertState::Issuing).unwrap();
        state.advance(CertState::Issued).unwrap();
        state.advance(CertState::Active).unwrap();
        assert_eq!(state.next(), None);
    }

    #[test]
    fn rate_limits_are_retryable_and_mismatch_defers() {
        let err = StageError::from(CertError::RateLimited("too many certificates".to_string()));
        assert_eq!(err.kind, StageErrorKind::Transient);

        let err = StageError::from(CertError::DnsMismatch {
            domain: "example.org".to_string(),
            expected: "203.0.113.1".parse().unwrap(),
            found: vec!["198.51.100.1".parse().unwrap()],
        });
        assert_eq!(err.kind, StageErrorKind::Deferred);
        assert_eq!(
            err.message,
            "example.org resolves to [198.51.100.1], expected 203.0.113.1"
        );
    }
}
