//! Resolution paths compared by the leak test.

use crate::dns::pinned_resolver;
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use std::time::Duration;

/// One way of turning a name into addresses
#[async_trait]
pub trait PathResolver: Send + Sync {
    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>, String>;
}

pub struct HickoryPathResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryPathResolver {
    /// Whatever the host's resolv.conf points at
    pub fn system() -> Result<Self, String> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| e.to_string())?;
        Ok(Self { resolver })
    }

    /// Plain DNS straight to `ips:port`, no cache
    pub fn at(ips: &[IpAddr], port: u16, query_timeout: Duration) -> Self {
        Self {
            resolver: pinned_resolver(ips, port, query_timeout),
        }
    }
}

#[async_trait]
impl PathResolver for HickoryPathResolver {
    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>, String> {
        let lookup = self
            .resolver
            .lookup_ip(domain)
            .await
            .map_err(|e| e.to_string())?;
        Ok(lookup.iter().collect())
    }
}
