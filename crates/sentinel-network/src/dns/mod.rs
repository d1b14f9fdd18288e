//! DNS Chain Manager
//!
//! ```text
//!  client ─▶ :entry_port ─▶ stage 0 ─▶ 127.0.0.1:p1 ─▶ stage 1 ─▶ upstream
//! ```
//!
//! `switch` is atomic from the caller's point of view: the candidate is
//! brought up, a canary resolution goes through its entry port, and only
//! then does it become the recorded mode. If anything fails the previous
//! wiring is re-applied and the recorded state is not touched.

mod canary;
mod model;

pub use canary::{CanaryProbe, HickoryCanary, ResolverRuntime, StageError};
pub(crate) use canary::pinned_resolver;
pub use model::{DnsChainState, DnsMode, ResolverStage, StageHealth};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum DnsSwitchError {
    #[error("invalid dns mode: {0}")]
    Invalid(String),

    #[error("resolver stages failed to start: {0}")]
    Runtime(String),

    #[error("canary query for {domain} failed: {reason}")]
    CanaryFailed { domain: String, reason: String },

    #[error("{0} timed out")]
    Timeout(&'static str),
}

#[derive(Debug, Clone)]
pub struct DnsSettings {
    pub canary_domain: String,
    pub canary_timeout: Duration,
    pub apply_timeout: Duration,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            canary_domain: "example.com".to_string(),
            canary_timeout: Duration::from_secs(5),
            apply_timeout: Duration::from_secs(30),
        }
    }
}

pub struct DnsChainManager {
    runtime: Arc<dyn ResolverRuntime>,
    canary: Arc<dyn CanaryProbe>,
    settings: DnsSettings,
    state: Mutex<DnsChainState>,
}

impl DnsChainManager {
    pub fn new(
        runtime: Arc<dyn ResolverRuntime>,
        canary: Arc<dyn CanaryProbe>,
        settings: DnsSettings,
    ) -> Self {
        Self {
            runtime,
            canary,
            settings,
            state: Mutex::new(DnsChainState::default()),
        }
    }

    pub async fn status(&self) -> DnsChainState {
        self.state.lock().await.clone()
    }

    /// Move to `mode`, or leave everything as it was
    pub async fn switch(&self, mode: DnsMode) -> Result<DnsChainState, DnsSwitchError> {
        mode.validate().map_err(DnsSwitchError::Invalid)?;

        // Held across the whole switch so a second switch waits its turn
        let mut state = self.state.lock().await;
        let snapshot = state.clone();

        info!("Switching DNS to {}", mode.label());
        if let Err(e) = self.bring_up(&mode).await {
            warn!("DNS switch to {} failed: {}", mode.label(), e);
            self.roll_back(&snapshot).await;
            return Err(e);
        }

        let healthy = mode.with_health(StageHealth::Healthy);
        state.mode = Some(healthy.clone());
        state.last_known_good = Some(healthy);
        state.switched_at = Some(Utc::now());
        info!("DNS now {}", state.mode.as_ref().map(DnsMode::label).unwrap_or_default());
        Ok(state.clone())
    }

    /// Record a runtime health change of one stage of the active mode.
    /// The rollback target keeps the health it was committed with.
    pub async fn mark_stage(&self, stage: &str, health: StageHealth) -> bool {
        let mut state = self.state.lock().await;
        let Some(mode) = state.mode.as_mut() else {
            return false;
        };
        if !mode.set_stage_health(stage, health) {
            return false;
        }
        match health {
            StageHealth::Failed => warn!("DNS stage {} failed", stage),
            _ => info!("DNS stage {} is {:?}", stage, health),
        }
        true
    }

    async fn bring_up(&self, mode: &DnsMode) -> Result<(), DnsSwitchError> {
        match timeout(self.settings.apply_timeout, self.runtime.apply(&mode.wired())).await {
            Err(_) => return Err(DnsSwitchError::Timeout("resolver start")),
            Ok(Err(e)) => return Err(DnsSwitchError::Runtime(e.to_string())),
            Ok(Ok(())) => {}
        }

        let port = mode
            .entry_port()
            .ok_or_else(|| DnsSwitchError::Invalid("no entry stage".to_string()))?;
        let domain = &self.settings.canary_domain;
        match timeout(self.settings.canary_timeout, self.canary.probe(port, domain)).await {
            Err(_) => Err(DnsSwitchError::Timeout("canary query")),
            Ok(Err(e)) => Err(DnsSwitchError::CanaryFailed {
                domain: domain.clone(),
                reason: e.to_string(),
            }),
            Ok(Ok(_)) => Ok(()),
        }
    }

    async fn roll_back(&self, snapshot: &DnsChainState) {
        let stages = snapshot
            .mode
            .as_ref()
            .map(DnsMode::wired)
            .unwrap_or_default();
        match timeout(self.settings.apply_timeout, self.runtime.apply(&stages)).await {
            Ok(Ok(())) => info!("DNS rolled back to previous wiring"),
            Ok(Err(e)) => error!("DNS rollback failed: {}", e),
            Err(_) => error!("DNS rollback timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Records what the manager asked to run
    #[derive(Default)]
    struct FakeRuntime {
        applied: std::sync::Mutex<Vec<Vec<ResolverStage>>>,
    }

    #[async_trait]
    impl ResolverRuntime for FakeRuntime {
        async fn apply(&self, stages: &[ResolverStage]) -> Result<(), StageError> {
            self.applied.lock().unwrap().push(stages.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeCanary {
        fail: AtomicBool,
    }

    #[async_trait]
    impl CanaryProbe for FakeCanary {
        async fn probe(&self, _port: u16, _domain: &str) -> Result<Vec<IpAddr>, StageError> {
            if self.fail.load(Ordering::SeqCst) {
                Err(StageError("SERVFAIL".into()))
            } else {
                Ok(vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))])
            }
        }
    }

    fn stage(name: &str, port: u16) -> ResolverStage {
        ResolverStage {
            name: name.into(),
            listen_port: port,
            upstreams: vec!["tls://1.1.1.1".into()],
            health: StageHealth::Unknown,
        }
    }

    fn manager() -> (DnsChainManager, Arc<FakeRuntime>, Arc<FakeCanary>) {
        let runtime = Arc::new(FakeRuntime::default());
        let canary = Arc::new(FakeCanary::default());
        let manager = DnsChainManager::new(runtime.clone(), canary.clone(), DnsSettings::default());
        (manager, runtime, canary)
    }

    #[tokio::test]
    async fn test_switch_success() {
        let (manager, runtime, _) = manager();
        let mode = DnsMode::Chain {
            stages: vec![stage("adblock", 5353), stage("doh", 5354)],
        };
        let state = manager.switch(mode).await.unwrap();

        let active = state.mode.unwrap();
        assert!(active.stages().iter().all(|s| s.health == StageHealth::Healthy));
        assert_eq!(state.last_known_good, Some(active));
        assert!(state.switched_at.is_some());

        let applied = runtime.applied.lock().unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0][0].upstreams, vec!["127.0.0.1:5354".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_canary_restores_previous() {
        let (manager, runtime, canary) = manager();
        manager
            .switch(DnsMode::Single { resolver: stage("doh", 5353) })
            .await
            .unwrap();
        let before = manager.status().await;

        canary.fail.store(true, Ordering::SeqCst);
        let err = manager
            .switch(DnsMode::Chain {
                stages: vec![stage("adblock", 5353), stage("dnscrypt", 5354)],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DnsSwitchError::CanaryFailed { .. }));

        assert_eq!(manager.status().await, before);
        // Candidate, then the previous wiring again
        let applied = runtime.applied.lock().unwrap();
        assert_eq!(applied.len(), 3);
        assert_eq!(applied[2].len(), 1);
        assert_eq!(applied[2][0].name, "doh");
    }

    #[tokio::test]
    async fn test_first_switch_failure_stops_candidate() {
        let (manager, runtime, canary) = manager();
        canary.fail.store(true, Ordering::SeqCst);
        assert!(
            manager
                .switch(DnsMode::Single { resolver: stage("doh", 5353) })
                .await
                .is_err()
        );
        assert_eq!(manager.status().await, DnsChainState::default());
        assert!(runtime.applied.lock().unwrap().last().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stage_crash_marks_only_that_stage() {
        let (manager, _, _) = manager();
        assert!(!manager.mark_stage("doh", StageHealth::Failed).await);

        manager
            .switch(DnsMode::Chain {
                stages: vec![stage("adblock", 5353), stage("doh", 5354)],
            })
            .await
            .unwrap();
        assert!(manager.mark_stage("doh", StageHealth::Failed).await);
        assert!(!manager.mark_stage("other", StageHealth::Failed).await);

        let state = manager.status().await;
        let health: Vec<StageHealth> = state
            .mode
            .as_ref()
            .unwrap()
            .stages()
            .iter()
            .map(|s| s.health)
            .collect();
        assert_eq!(health, vec![StageHealth::Healthy, StageHealth::Failed]);
        let good = state.last_known_good.unwrap();
        assert!(good.stages().iter().all(|s| s.health == StageHealth::Healthy));

        assert!(manager.mark_stage("doh", StageHealth::Healthy).await);
        let state = manager.status().await;
        assert_eq!(state.mode, state.last_known_good);
    }

    #[tokio::test]
    async fn test_invalid_mode_touches_nothing() {
        let (manager, runtime, _) = manager();
        let err = manager
            .switch(DnsMode::Chain { stages: vec![] })
            .await
            .unwrap_err();
        assert!(matches!(err, DnsSwitchError::Invalid(_)));
        assert!(runtime.applied.lock().unwrap().is_empty());
    }
}
