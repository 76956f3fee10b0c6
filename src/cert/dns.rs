// ABOUTME: Domain resolution seam used to check DNS points at the provisioned host.
// ABOUTME: SystemResolver uses the operating system's resolver through tokio.

use async_trait::async_trait;
use std::io;
use std::net::IpAddr;

#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(&self, domain: &str) -> io::Result<Vec<IpAddr>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn resolve(&self, domain: &str) -> io::Result<Vec<IpAddr>> {
        let mut addrs: Vec<IpAddr> = tokio::net::lookup_host((domain, 0))
            .await?
            .map(|addr| addr.ip())
            .collect();
        addrs.sort();
        addrs.dedup();
        Ok(addrs)
    }
}
