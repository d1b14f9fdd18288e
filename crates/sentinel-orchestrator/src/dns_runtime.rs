//! Resolver stages as supervised `dnsproxy` processes.
//!
//! Every `apply` runs to completion on its own task. A caller that gives up
//! (timeout) only stops waiting; the stage list stays accurate, and the next
//! `apply` queues behind the lock and stops whatever the abandoned one
//! brought up.

use async_trait::async_trait;
use sentinel_network::{ResolverRuntime, ResolverStage, StageError};
use sentinel_protocols::{LaunchMode, LaunchSpec, ResourceLimits};
use sentinel_supervisor::Supervisor;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Supervisor names of resolver stages start with this
pub const STAGE_PREFIX: &str = "dns-";

/// Supervisor instance name of a stage
pub fn stage_instance(stage: &ResolverStage) -> String {
    format!("{STAGE_PREFIX}{}", stage.name)
}

/// Stage name behind a supervisor instance, if it is one
pub fn stage_name(instance: &str) -> Option<&str> {
    instance.strip_prefix(STAGE_PREFIX)
}

pub struct SupervisedResolvers {
    inner: Arc<Stages>,
}

struct Stages {
    supervisor: Arc<Supervisor>,
    binary: String,
    /// Instance names brought up by us, recorded before each start
    running: Mutex<Vec<String>>,
}

impl SupervisedResolvers {
    pub fn new(supervisor: Arc<Supervisor>, binary: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Stages {
                supervisor,
                binary: binary.into(),
                running: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Stage instances currently tracked as up
    pub async fn tracked(&self) -> Vec<String> {
        self.inner.running.lock().await.clone()
    }
}

impl Stages {
    fn spec(&self, stage: &ResolverStage) -> LaunchSpec {
        let mut args = vec![
            "--listen".to_string(),
            "127.0.0.1".to_string(),
            "--port".to_string(),
            stage.listen_port.to_string(),
        ];
        for upstream in &stage.upstreams {
            args.push("--upstream".to_string());
            args.push(upstream.clone());
        }
        LaunchSpec {
            program: self.binary.clone(),
            args,
            env: Vec::new(),
            files: Vec::new(),
            mode: LaunchMode::Daemon,
        }
    }

    /// Stop tracked stages; a name leaves `running` only once its stop returned
    async fn stop_tracked(&self, running: &mut Vec<String>) {
        while let Some(name) = running.pop() {
            let supervisor = self.supervisor.clone();
            let owned = name.clone();
            let result = tokio::task::spawn_blocking(move || supervisor.stop(&owned)).await;
            match result {
                Ok(Ok(outcome)) => debug!("Resolver stage {} {:?}", name, outcome),
                Ok(Err(e)) => warn!("Failed to stop resolver stage {}: {}", name, e),
                Err(e) => warn!("Stop task for {} failed: {}", name, e),
            }
        }
    }

    async fn apply(&self, stages: Vec<ResolverStage>) -> Result<(), StageError> {
        let mut running = self.running.lock().await;
        self.stop_tracked(&mut running).await;

        // Last stage first so every stage finds its upstream listening
        for stage in stages.iter().rev() {
            let name = stage_instance(stage);
            let spec = self.spec(stage);
            running.push(name.clone());

            let supervisor = self.supervisor.clone();
            let started = tokio::task::spawn_blocking(move || {
                supervisor.register(&name)?;
                supervisor.start(&name, spec, ResourceLimits::default())
            })
            .await;

            let failure = match started {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = failure {
                self.stop_tracked(&mut running).await;
                return Err(StageError(format!("stage {}: {}", stage.name, reason)));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ResolverRuntime for SupervisedResolvers {
    async fn apply(&self, stages: &[ResolverStage]) -> Result<(), StageError> {
        let inner = self.inner.clone();
        let stages = stages.to_vec();
        tokio::spawn(async move { inner.apply(stages).await })
            .await
            .map_err(|e| StageError(format!("resolver task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_supervisor::SupervisorConfig;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn fake_resolver(dir: &Path) -> String {
        let path = dir.join("dnsproxy");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn stage(name: &str, port: u16) -> ResolverStage {
        ResolverStage {
            name: name.to_string(),
            listen_port: port,
            upstreams: vec!["9.9.9.9".to_string()],
            health: Default::default(),
        }
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(stage_instance(&stage("a", 5353)), "dns-a");
        assert_eq!(stage_name("dns-a"), Some("a"));
        assert_eq!(stage_name("home"), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_abandoned_apply_is_cleaned_up_by_the_next() {
        let dir = TempDir::new().unwrap();
        let supervisor = Arc::new(Supervisor::new(SupervisorConfig {
            liveness_grace: Duration::from_millis(800),
            stop_timeout: Duration::from_secs(2),
            operation_timeout: Duration::from_secs(10),
            cgroup_root: dir.path().join("cgroup"),
            ..SupervisorConfig::default()
        }));
        let runtime = SupervisedResolvers::new(supervisor.clone(), fake_resolver(dir.path()));

        // Gives up while the stage is still inside its liveness grace
        let abandoned = timeout(Duration::from_millis(200), runtime.apply(&[stage("a", 5353)])).await;
        assert!(abandoned.is_err());

        runtime.apply(&[]).await.unwrap();
        assert!(runtime.tracked().await.is_empty());
        let status = supervisor.status("dns-a").unwrap();
        assert!(!status.state.is_active(), "{:?}", status);

        supervisor.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_apply_replaces_previous_stages() {
        let dir = TempDir::new().unwrap();
        let supervisor = Arc::new(Supervisor::new(SupervisorConfig {
            liveness_grace: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(2),
            operation_timeout: Duration::from_secs(10),
            cgroup_root: dir.path().join("cgroup"),
            ..SupervisorConfig::default()
        }));
        let runtime = SupervisedResolvers::new(supervisor.clone(), fake_resolver(dir.path()));

        runtime
            .apply(&[stage("a", 5353), stage("b", 5354)])
            .await
            .unwrap();
        assert_eq!(runtime.tracked().await, vec!["dns-b", "dns-a"]);
        assert!(supervisor.status("dns-a").unwrap().state.is_running());

        runtime.apply(&[stage("c", 5355)]).await.unwrap();
        assert_eq!(runtime.tracked().await, vec!["dns-c"]);
        assert!(!supervisor.status("dns-a").unwrap().state.is_active());
        assert!(!supervisor.status("dns-b").unwrap().state.is_active());

        supervisor.shutdown();
    }
}
