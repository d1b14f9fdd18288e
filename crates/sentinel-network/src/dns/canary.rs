//! Seams to the resolver processes and the canary query.

use super::model::ResolverStage;
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct StageError(pub String);

/// Runs resolver stage processes
#[async_trait]
pub trait ResolverRuntime: Send + Sync {
    /// Make exactly `stages` run with the given wiring; stages not listed
    /// are stopped.
    async fn apply(&self, stages: &[ResolverStage]) -> Result<(), StageError>;
}

/// Issues the test resolution after a switch
#[async_trait]
pub trait CanaryProbe: Send + Sync {
    async fn probe(&self, port: u16, domain: &str) -> Result<Vec<IpAddr>, StageError>;
}

/// Canary through a local resolver at `127.0.0.1:<port>`
#[derive(Debug, Clone)]
pub struct HickoryCanary {
    query_timeout: Duration,
}

impl HickoryCanary {
    pub fn new(query_timeout: Duration) -> Self {
        Self { query_timeout }
    }
}

/// Uncached resolver pinned to `ips:port`
pub(crate) fn pinned_resolver(ips: &[IpAddr], port: u16, query_timeout: Duration) -> TokioAsyncResolver {
    let config = ResolverConfig::from_parts(
        None,
        vec![],
        NameServerConfigGroup::from_ips_clear(ips, port, true),
    );
    let mut opts = ResolverOpts::default();
    opts.timeout = query_timeout;
    opts.attempts = 1;
    opts.cache_size = 0;
    TokioAsyncResolver::tokio(config, opts)
}

#[async_trait]
impl CanaryProbe for HickoryCanary {
    async fn probe(&self, port: u16, domain: &str) -> Result<Vec<IpAddr>, StageError> {
        let resolver = pinned_resolver(&[IpAddr::V4(Ipv4Addr::LOCALHOST)], port, self.query_timeout);
        let lookup = resolver
            .lookup_ip(domain)
            .await
            .map_err(|e| StageError(e.to_string()))?;
        let ips: Vec<IpAddr> = lookup.iter().collect();
        if ips.is_empty() {
            return Err(StageError(format!("{domain} resolved to nothing")));
        }
        Ok(ips)
    }
}
