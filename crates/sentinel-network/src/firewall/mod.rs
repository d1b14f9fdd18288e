//! Firewall Policy Synthesizer
//!
//! ```text
//! active instances ─┐
//!                   ├─▶ synthesize() ─▶ FirewallPolicy ─▶ render() ─▶ nft script
//! RoutingConfig ────┘                                                  │
//!                                       Firewall::apply: validate ─▶ load
//! ```
//!
//! `apply` is a transaction: the script replaces the whole `inet sentinel`
//! table in one `nft -f` run, and nothing is loaded unless `nft -c` accepts
//! it first. A failed apply leaves the previous ruleset in place.

mod backend;
mod model;
mod routing;
mod synth;

pub use backend::{BackendError, FirewallBackend, NftBackend};
pub use model::{
    BYPASS_MARK, Chain, CtState, Family, FirewallPolicy, Forwarding, Match, NamedSet, Rule,
    SetKind, TABLE, Tier, Verdict, Zone, ZoneDef,
};
pub use routing::{
    DirectBypass, FirewallSettings, GeoIpAction, GeoIpDirection, GeoIpRule, PortForward,
    PortKnock, RoutingConfig, StealthPolicy,
};
pub use synth::synthesize;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PolicyApplyError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("load failed: {0}")]
    Load(String),

    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// The policy that is live, and when it went live
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedPolicy {
    pub policy: FirewallPolicy,
    pub script: String,
    pub applied_at: DateTime<Utc>,
}

/// Serialized owner of the live ruleset
pub struct Firewall {
    backend: Arc<dyn FirewallBackend>,
    timeout: Duration,
    applied: Mutex<Option<AppliedPolicy>>,
}

impl Firewall {
    pub fn new(backend: Arc<dyn FirewallBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            applied: Mutex::new(None),
        }
    }

    /// Validate then load `policy` as one unit. Concurrent calls queue up.
    pub async fn apply(&self, policy: FirewallPolicy) -> Result<AppliedPolicy, PolicyApplyError> {
        let mut applied = self.applied.lock().await;
        let script = policy.render();

        match timeout(self.timeout, self.backend.validate(&script)).await {
            Err(_) => return Err(PolicyApplyError::Timeout("validation")),
            Ok(Err(e)) => {
                warn!("Firewall policy rejected, keeping previous ruleset: {}", e);
                return Err(PolicyApplyError::Validation(e.to_string()));
            }
            Ok(Ok(())) => {}
        }

        match timeout(self.timeout, self.backend.load(&script)).await {
            Err(_) => return Err(PolicyApplyError::Timeout("load")),
            Ok(Err(e)) => {
                warn!("Firewall load failed, keeping previous ruleset: {}", e);
                return Err(PolicyApplyError::Load(e.to_string()));
            }
            Ok(Ok(())) => {}
        }

        let entry = AppliedPolicy {
            policy,
            script,
            applied_at: Utc::now(),
        };
        info!(
            "Firewall policy applied ({} rules, {} sets)",
            entry.policy.rules.len(),
            entry.policy.sets.len()
        );
        *applied = Some(entry.clone());
        Ok(entry)
    }

    /// Last successfully applied policy
    pub async fn current(&self) -> Option<AppliedPolicy> {
        self.applied.lock().await.clone()
    }

    /// Ruleset as the backend reports it
    pub async fn live_ruleset(&self) -> Result<String, BackendError> {
        self.backend.current().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory backend; `reject` makes validation fail
    #[derive(Default)]
    struct FakeBackend {
        reject: AtomicBool,
        live: std::sync::Mutex<String>,
    }

    #[async_trait::async_trait]
    impl FirewallBackend for FakeBackend {
        async fn validate(&self, _script: &str) -> Result<(), BackendError> {
            if self.reject.load(Ordering::SeqCst) {
                Err(BackendError::Rejected("syntax error".into()))
            } else {
                Ok(())
            }
        }

        async fn load(&self, script: &str) -> Result<(), BackendError> {
            *self.live.lock().unwrap() = script.to_string();
            Ok(())
        }

        async fn current(&self) -> Result<String, BackendError> {
            Ok(self.live.lock().unwrap().clone())
        }
    }

    fn policy_with_forward(port: u16) -> FirewallPolicy {
        let routing = RoutingConfig {
            port_forwards: vec![PortForward {
                name: "web".into(),
                transport: sentinel_protocols::Transport::Tcp,
                public_port: port,
                target_addr: "192.168.1.5".into(),
                target_port: 80,
            }],
            ..RoutingConfig::default()
        };
        synthesize(&[], &routing, &FirewallSettings::default())
    }

    #[tokio::test]
    async fn test_apply_records_policy() {
        let backend = Arc::new(FakeBackend::default());
        let firewall = Firewall::new(backend.clone(), Duration::from_secs(5));
        assert!(firewall.current().await.is_none());

        let applied = firewall.apply(policy_with_forward(8080)).await.unwrap();
        assert_eq!(firewall.current().await.unwrap().script, applied.script);
        assert_eq!(firewall.live_ruleset().await.unwrap(), applied.script);
    }

    #[tokio::test]
    async fn test_failed_validation_keeps_previous() {
        let backend = Arc::new(FakeBackend::default());
        let firewall = Firewall::new(backend.clone(), Duration::from_secs(5));
        let first = firewall.apply(policy_with_forward(8080)).await.unwrap();

        backend.reject.store(true, Ordering::SeqCst);
        let err = firewall.apply(policy_with_forward(9090)).await.unwrap_err();
        assert!(matches!(err, PolicyApplyError::Validation(_)));

        assert_eq!(firewall.current().await.unwrap(), first);
        let live = firewall.live_ruleset().await.unwrap();
        assert_eq!(live, first.script);
        assert!(live.contains("tcp dport 8080"));
        assert!(!live.contains("9090"));
    }

    #[test]
    fn test_policy_serializes() {
        let policy = policy_with_forward(8080);
        let json = serde_json::to_value(&policy).unwrap();
        assert!(json["rules"].as_array().unwrap().len() > 5);
        let back: FirewallPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
    }
}
