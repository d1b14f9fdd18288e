//! Supervisor handle: registry of instance workers.

use crate::error::SupervisorError;
use crate::limits::{CgroupLimiter, DEFAULT_CGROUP_ROOT};
use crate::message::{Command, StartOutcome, StopOutcome, SupervisorEvent};
use crate::poller::{self, PollerHandle};
use crate::worker;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use sentinel_protocols::{LaunchSpec, ResourceLimits, RuntimeStatus};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Capacity of the event queue before events are dropped
const EVENT_QUEUE: usize = 1024;

/// Supervisor tuning
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Liveness and metrics poll interval
    pub poll_interval: Duration,
    /// How long a fresh daemon must stay up to count as started
    pub liveness_grace: Duration,
    /// SIGTERM to SIGKILL escalation delay
    pub stop_timeout: Duration,
    /// How long a caller waits for a worker reply
    pub operation_timeout: Duration,
    /// Automatic restarts after an unexpected exit
    pub max_auto_retries: u32,
    pub cgroup_root: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            liveness_grace: Duration::from_millis(1500),
            stop_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(30),
            max_auto_retries: 1,
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
        }
    }
}

pub(crate) struct InstanceHandle {
    pub tx: Sender<Command>,
    pub status: Arc<RwLock<RuntimeStatus>>,
    thread: Option<thread::JoinHandle<()>>,
}

pub(crate) type Registry = Arc<RwLock<HashMap<String, InstanceHandle>>>;

/// Owns one worker thread per registered instance.
///
/// All calls are blocking; async callers go through `spawn_blocking`.
pub struct Supervisor {
    config: Arc<SupervisorConfig>,
    limiter: Arc<CgroupLimiter>,
    registry: Registry,
    events_tx: Sender<SupervisorEvent>,
    events_rx: Receiver<SupervisorEvent>,
    poller: Mutex<Option<PollerHandle>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (events_tx, events_rx) = bounded(EVENT_QUEUE);
        Self {
            limiter: Arc::new(CgroupLimiter::new(config.cgroup_root.clone())),
            config: Arc::new(config),
            registry: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
            events_rx,
            poller: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start the liveness/metrics poller (idempotent)
    pub fn start_poller(&self) -> Result<(), SupervisorError> {
        let mut slot = match self.poller.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_none() {
            let handle = poller::spawn_poller(self.config.poll_interval, self.registry.clone())
                .map_err(SupervisorError::Thread)?;
            *slot = Some(handle);
        }
        Ok(())
    }

    /// Create the worker for `name`; registering twice is a no-op
    pub fn register(&self, name: &str) -> Result<(), SupervisorError> {
        let mut registry = self.write_registry();
        if registry.contains_key(name) {
            return Ok(());
        }

        let (tx, rx) = unbounded();
        let status = Arc::new(RwLock::new(RuntimeStatus::default()));
        let thread = worker::spawn_worker(
            name.to_string(),
            self.config.clone(),
            self.limiter.clone(),
            status.clone(),
            self.events_tx.clone(),
            rx,
        )
        .map_err(SupervisorError::Thread)?;

        registry.insert(
            name.to_string(),
            InstanceHandle {
                tx,
                status,
                thread: Some(thread),
            },
        );
        info!("Registered instance {}", name);
        Ok(())
    }

    /// Drop the worker for an idle instance
    pub fn unregister(&self, name: &str) -> Result<(), SupervisorError> {
        let mut registry = self.write_registry();
        let handle = registry
            .get(name)
            .ok_or_else(|| SupervisorError::UnknownInstance(name.to_string()))?;
        let idle = handle
            .status
            .read()
            .map(|s| s.state.is_idle())
            .unwrap_or(true);
        if !idle {
            return Err(SupervisorError::Busy(name.to_string()));
        }

        let removed = registry.remove(name);
        drop(registry);
        if let Some(handle) = removed {
            join_worker(name, handle);
        }
        Ok(())
    }

    pub fn start(
        &self,
        name: &str,
        spec: LaunchSpec,
        limits: ResourceLimits,
    ) -> Result<StartOutcome, SupervisorError> {
        self.request(name, "start", |reply| Command::Start {
            spec,
            limits,
            reply,
        })?
        .map_err(Into::into)
    }

    pub fn stop(&self, name: &str) -> Result<StopOutcome, SupervisorError> {
        self.request(name, "stop", |reply| Command::Stop { reply })?
            .map_err(Into::into)
    }

    pub fn restart(
        &self,
        name: &str,
        spec: LaunchSpec,
        limits: ResourceLimits,
    ) -> Result<StartOutcome, SupervisorError> {
        self.request(name, "restart", |reply| Command::Restart {
            spec,
            limits,
            reply,
        })?
    }

    pub fn status(&self, name: &str) -> Option<RuntimeStatus> {
        let registry = self.read_registry();
        let handle = registry.get(name)?;
        let status = handle.status.read().ok()?;
        Some(status.clone())
    }

    /// Snapshot of every registered instance
    pub fn statuses(&self) -> BTreeMap<String, RuntimeStatus> {
        self.read_registry()
            .iter()
            .filter_map(|(name, handle)| {
                let status = handle.status.read().ok()?;
                Some((name.clone(), status.clone()))
            })
            .collect()
    }

    /// Receiver for worker events
    pub fn events(&self) -> Receiver<SupervisorEvent> {
        self.events_rx.clone()
    }

    /// Stop the poller, then every instance
    pub fn shutdown(&self) {
        let poller = match self.poller.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(poller) = poller {
            poller.stop();
        }

        let handles: Vec<(String, InstanceHandle)> = self.write_registry().drain().collect();
        if handles.is_empty() {
            return;
        }
        info!("Stopping {} instances", handles.len());
        for (name, handle) in handles {
            join_worker(&name, handle);
        }
    }

    fn request<T>(
        &self,
        name: &str,
        operation: &'static str,
        build: impl FnOnce(Sender<T>) -> Command,
    ) -> Result<T, SupervisorError> {
        let tx = self
            .read_registry()
            .get(name)
            .map(|handle| handle.tx.clone())
            .ok_or_else(|| SupervisorError::UnknownInstance(name.to_string()))?;

        let (reply_tx, reply_rx) = bounded(1);
        tx.send(build(reply_tx))
            .map_err(|_| SupervisorError::WorkerGone(name.to_string()))?;

        match reply_rx.recv_timeout(self.config.operation_timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => {
                warn!("{} of {} timed out", operation, name);
                Err(SupervisorError::Timeout {
                    instance: name.to_string(),
                    operation,
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(SupervisorError::WorkerGone(name.to_string()))
            }
        }
    }

    fn read_registry(&self) -> RwLockReadGuard<'_, HashMap<String, InstanceHandle>> {
        match self.registry.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, HashMap<String, InstanceHandle>> {
        match self.registry.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join_worker(name: &str, mut handle: InstanceHandle) {
    let _ = handle.tx.send(Command::Shutdown);
    if let Some(thread) = handle.thread.take() {
        if thread.join().is_err() {
            warn!("Worker {} did not shut down cleanly", name);
        }
    }
}
