//! Leak-Test Engine
//!
//! Each probe domain is resolved twice:
//!
//! ```text
//!            ┌─ forced path (active DNS chain entry) ─▶ {ips}
//! domain ────┤                                             ├─▶ disjoint && both non-empty ⇒ leak
//!            └─ raw path (direct resolver) ──────────────▶ {ips}
//! ```
//!
//! A raw path that fails or times out says nothing about a leak. DNSSEC
//! status and egress addresses are reported next to the verdict but do not
//! change it.

mod egress;
mod resolver;

pub use egress::{EgressProbe, EgressReport, RouteEgressProbe};
pub use resolver::{HickoryPathResolver, PathResolver};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeakKind {
    Dns,
    Ip,
    Webrtc,
}

impl fmt::Display for LeakKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LeakKind::Dns => "dns",
            LeakKind::Ip => "ip",
            LeakKind::Webrtc => "webrtc",
        })
    }
}

impl FromStr for LeakKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dns" => Ok(LeakKind::Dns),
            "ip" => Ok(LeakKind::Ip),
            "webrtc" => Ok(LeakKind::Webrtc),
            other => Err(format!("unknown leak test kind '{other}'")),
        }
    }
}

/// What was active when the test ran
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakContext {
    pub dns_mode: Option<String>,
    pub dns_entry_port: Option<u16>,
    pub active_vpns: Vec<String>,
    /// Tunnel interface addresses (CIDR) of the active VPNs
    pub tunnel_addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainProbe {
    pub domain: String,
    pub forced: BTreeSet<IpAddr>,
    pub raw: BTreeSet<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_error: Option<String>,
    pub leak: bool,
}

/// Both paths answered, with nothing in common
pub fn is_leak(forced: &BTreeSet<IpAddr>, raw: &BTreeSet<IpAddr>) -> bool {
    !forced.is_empty() && !raw.is_empty() && forced.is_disjoint(raw)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnssecStatus {
    Validating,
    NotValidating,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakTestResult {
    pub tested_at: DateTime<Utc>,
    pub kind: LeakKind,
    pub probes: Vec<DomainProbe>,
    pub leak: bool,
    pub context: LeakContext,
    pub dnssec: DnssecStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub egress: Option<EgressReport>,
    /// webrtc only: IPv6 egress is reachable outside the VPN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webrtc_exposed: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct LeakTestSettings {
    pub probe_domains: Vec<String>,
    /// Signed with a deliberately broken signature
    pub dnssec_broken_domain: String,
    pub dnssec_control_domain: String,
    pub probe_timeout: Duration,
}

impl Default for LeakTestSettings {
    fn default() -> Self {
        Self {
            probe_domains: vec![
                "example.com".to_string(),
                "cloudflare.com".to_string(),
                "wikipedia.org".to_string(),
            ],
            dnssec_broken_domain: "dnssec-failed.org".to_string(),
            dnssec_control_domain: "example.com".to_string(),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

pub struct LeakTestEngine {
    raw: Arc<dyn PathResolver>,
    egress: Arc<dyn EgressProbe>,
    settings: LeakTestSettings,
}

impl LeakTestEngine {
    pub fn new(
        raw: Arc<dyn PathResolver>,
        egress: Arc<dyn EgressProbe>,
        settings: LeakTestSettings,
    ) -> Self {
        Self {
            raw,
            egress,
            settings,
        }
    }

    pub fn settings(&self) -> &LeakTestSettings {
        &self.settings
    }

    /// Run one test with `forced` as the privacy path
    pub async fn run(
        &self,
        kind: LeakKind,
        context: LeakContext,
        forced: &dyn PathResolver,
    ) -> LeakTestResult {
        let mut probes = Vec::with_capacity(self.settings.probe_domains.len());
        for domain in &self.settings.probe_domains {
            let (forced_ips, forced_error) = self.lookup(forced, domain).await;
            let (raw_ips, raw_error) = self.lookup(self.raw.as_ref(), domain).await;
            let leak = is_leak(&forced_ips, &raw_ips);
            if leak {
                warn!(
                    "DNS leak on {}: forced {:?} raw {:?}",
                    domain, forced_ips, raw_ips
                );
            }
            probes.push(DomainProbe {
                domain: domain.clone(),
                forced: forced_ips,
                raw: raw_ips,
                forced_error,
                raw_error,
                leak,
            });
        }
        let leak = probes.iter().any(|p| p.leak);

        let dnssec = self.dnssec(forced).await;

        let (egress, webrtc_exposed) = match kind {
            LeakKind::Dns => (None, None),
            LeakKind::Ip | LeakKind::Webrtc => {
                let (v4, v6) = self.egress.local_egress().await;
                let report = EgressReport::compare(v4, v6, &context.tunnel_addresses);
                let exposed = (kind == LeakKind::Webrtc).then_some(report.ipv6_exposed);
                (Some(report), exposed)
            }
        };

        info!(
            "Leak test ({}) finished: {} ({} domains, dnssec {:?})",
            kind,
            if leak { "LEAK" } else { "clean" },
            probes.len(),
            dnssec
        );

        LeakTestResult {
            tested_at: Utc::now(),
            kind,
            probes,
            leak,
            context,
            dnssec,
            egress,
            webrtc_exposed,
        }
    }

    async fn lookup(
        &self,
        path: &dyn PathResolver,
        domain: &str,
    ) -> (BTreeSet<IpAddr>, Option<String>) {
        match timeout(self.settings.probe_timeout, path.resolve(domain)).await {
            Ok(Ok(ips)) => (ips.into_iter().collect(), None),
            Ok(Err(e)) => {
                debug!("Lookup of {} failed: {}", domain, e);
                (BTreeSet::new(), Some(e))
            }
            Err(_) => (BTreeSet::new(), Some("timeout".to_string())),
        }
    }

    /// A validating path refuses the broken domain but answers the control one
    async fn dnssec(&self, forced: &dyn PathResolver) -> DnssecStatus {
        let (broken, _) = self.lookup(forced, &self.settings.dnssec_broken_domain).await;
        if !broken.is_empty() {
            return DnssecStatus::NotValidating;
        }
        let (control, _) = self.lookup(forced, &self.settings.dnssec_control_domain).await;
        if control.is_empty() {
            DnssecStatus::Unknown
        } else {
            DnssecStatus::Validating
        }
    }
}
