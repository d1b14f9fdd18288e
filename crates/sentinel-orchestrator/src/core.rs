//! Orchestrator Core
//!
//! Owns the authoritative instance table and routes every control request to
//! the subsystem that acts on it:
//!
//! ```text
//! Request ─▶ Orchestrator::handle ─┬─▶ parser / store        (parse, save, delete, list)
//!                                  ├─▶ Supervisor            (control, status)
//!                                  ├─▶ DnsChainManager       (dns_switch, dns_status)
//!                                  ├─▶ synthesize + Firewall (firewall_apply)
//!                                  └─▶ LeakTestEngine        (leak_test)
//! ```
//!
//! Mutating requests probe the store first; while it is unavailable they
//! are refused and read-only requests keep working from memory. The firewall
//! follows the active instance set: it is re-synthesized after every
//! start/stop, DNS switch and supervisor-observed crash.

use crate::config::OrchestratorConfig;
use crate::dns_runtime::{STAGE_PREFIX, stage_name};
use crate::error::OrchestratorError;
use crate::protocol::{ControlAction, Request, Response, SaveRequest};
use crate::store::{DNS_KEY, ROUTING_KEY, Store, StoreExt, protocol_key, secret_key};
use sentinel_network::{
    AppliedPolicy, CanaryProbe, DnsChainManager, DnsMode, DnsSettings, EgressProbe, Firewall,
    FirewallBackend, FirewallSettings, HickoryPathResolver, LeakContext, LeakKind, LeakTestEngine,
    PathResolver, ResolverRuntime, RoutingConfig, StageHealth, synthesize,
};
use sentinel_protocols::{
    Category, Eligibility, HostTopology, LaunchContext, LaunchSpec, ProtocolInstance,
    ProtocolKind, ResourceLimits, RuntimeState, SecretBundle, launch_spec, optimize, parse_config,
    validate_name,
};
use sentinel_supervisor::{StartOutcome, StopOutcome, Supervisor, SupervisorError, SupervisorEvent};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Builds the privacy-path resolver for a leak test
pub trait PrivacyPath: Send + Sync {
    fn resolver(&self, entry_port: Option<u16>) -> Result<Arc<dyn PathResolver>, String>;
}

/// The local chain entry when DNS is managed, the host resolver otherwise
pub struct LocalChainPath {
    query_timeout: Duration,
}

impl LocalChainPath {
    pub fn new(query_timeout: Duration) -> Self {
        Self { query_timeout }
    }
}

impl PrivacyPath for LocalChainPath {
    fn resolver(&self, entry_port: Option<u16>) -> Result<Arc<dyn PathResolver>, String> {
        match entry_port {
            Some(port) => Ok(Arc::new(HickoryPathResolver::at(
                &[IpAddr::V4(Ipv4Addr::LOCALHOST)],
                port,
                self.query_timeout,
            ))),
            None => HickoryPathResolver::system().map(|r| Arc::new(r) as Arc<dyn PathResolver>),
        }
    }
}

/// Everything the core talks to
pub struct Services {
    pub store: Arc<dyn Store>,
    pub supervisor: Arc<Supervisor>,
    pub firewall_backend: Arc<dyn FirewallBackend>,
    pub resolver_runtime: Arc<dyn ResolverRuntime>,
    pub canary: Arc<dyn CanaryProbe>,
    pub raw_path: Arc<dyn PathResolver>,
    pub privacy_path: Arc<dyn PrivacyPath>,
    pub egress: Arc<dyn EgressProbe>,
}

/// Body of a `status` reply
#[derive(Debug, Serialize)]
struct StatusView {
    protocols: Vec<ProtocolInstance>,
    dns: sentinel_network::DnsChainState,
    #[serde(skip_serializing_if = "Option::is_none")]
    firewall: Option<FirewallSummary>,
}

#[derive(Debug, Serialize)]
struct FirewallSummary {
    rules: usize,
    sets: usize,
    applied_at: chrono::DateTime<chrono::Utc>,
}

impl From<&AppliedPolicy> for FirewallSummary {
    fn from(applied: &AppliedPolicy) -> Self {
        Self {
            rules: applied.policy.rules.len(),
            sets: applied.policy.sets.len(),
            applied_at: applied.applied_at,
        }
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn Store>,
    supervisor: Arc<Supervisor>,
    firewall: Firewall,
    dns: DnsChainManager,
    leaktest: LeakTestEngine,
    privacy_path: Arc<dyn PrivacyPath>,
    instances: RwLock<BTreeMap<String, ProtocolInstance>>,
    routing: RwLock<RoutingConfig>,
}

/// Run a blocking supervisor call off the async workers
async fn blocking<T, F>(f: F) -> Result<T, OrchestratorError>
where
    F: FnOnce() -> Result<T, SupervisorError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(Into::into),
        Err(e) => Err(OrchestratorError::Start(format!("supervisor task failed: {e}"))),
    }
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, services: Services) -> Self {
        let dns_settings = DnsSettings {
            canary_domain: config.dns.canary_domain.clone(),
            canary_timeout: Duration::from_secs(config.dns.canary_timeout_secs.max(1)),
            apply_timeout: Duration::from_secs(config.dns.switch_timeout_secs.max(1)),
        };
        Self {
            firewall: Firewall::new(
                services.firewall_backend,
                Duration::from_secs(config.firewall.apply_timeout_secs.max(1)),
            ),
            dns: DnsChainManager::new(services.resolver_runtime, services.canary, dns_settings),
            leaktest: LeakTestEngine::new(
                services.raw_path,
                services.egress,
                config.dns.leak_settings(),
            ),
            privacy_path: services.privacy_path,
            store: services.store,
            supervisor: services.supervisor,
            instances: RwLock::new(BTreeMap::new()),
            routing: RwLock::new(RoutingConfig::default()),
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Read persisted instances and routing into memory
    pub async fn load(&self) -> Result<(), OrchestratorError> {
        let mut loaded = BTreeMap::new();
        for key in self.store.keys("protocol/")? {
            match self.store.get_as::<ProtocolInstance>(&key) {
                Ok(Some(instance)) => {
                    self.supervisor.register(&instance.name)?;
                    loaded.insert(instance.name.clone(), instance);
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable {}: {}", key, e),
            }
        }
        let routing: RoutingConfig = self.store.get_as(ROUTING_KEY)?.unwrap_or_default();

        info!("Loaded {} instances from the store", loaded.len());
        *self.instances.write().await = loaded;
        *self.routing.write().await = routing;
        Ok(())
    }

    /// Bring up enabled instances, the DNS chain and the firewall
    pub async fn autostart(&self) {
        let enabled: Vec<String> = self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.enabled)
            .map(|i| i.name.clone())
            .collect();
        for name in enabled {
            match self.run_control(&name, ControlAction::Start).await {
                Ok(message) => info!("{}", message),
                Err(e) => warn!("Autostart of {} failed: {}", name, e),
            }
        }

        let persisted: Option<DnsMode> = match self.store.get_as(DNS_KEY) {
            Ok(mode) => mode,
            Err(e) => {
                warn!("Ignoring persisted DNS mode: {}", e);
                None
            }
        };
        if let Some(mode) = persisted.or_else(|| self.config.dns.initial_mode.clone()) {
            if let Err(e) = self.dns.switch(mode).await {
                warn!("DNS chain not started: {}", e);
            }
        }

        if let Err(e) = self.reconcile_firewall().await {
            error!("Initial firewall apply failed: {}", e);
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        debug!("Request: {:?}", request);
        let result = match request {
            Request::Parse { config, hint } => Self::parse(&config, hint.as_deref()),
            Request::Save(save) => self.save(save).await,
            Request::Delete { name } => self.delete(&name).await,
            Request::List => self.list().await,
            Request::Control { name, action } => self.control(&name, action).await,
            Request::Status => self.status().await,
            Request::DnsSwitch { mode } => self.dns_switch(mode).await,
            Request::DnsStatus => Ok(Response::ok("dns status").with_data(&self.dns.status().await)),
            Request::FirewallApply { routing } => self.firewall_apply(routing).await,
            Request::FirewallStatus => self.firewall_status().await,
            Request::LeakTest { kind } => self.leak_test(kind).await,
        };
        if let Err(e) = &result {
            warn!("Request failed ({}): {}", e.code(), e);
        }
        result.into()
    }

    fn parse_hint(hint: Option<&str>) -> Result<Option<ProtocolKind>, OrchestratorError> {
        Ok(hint.map(str::parse::<ProtocolKind>).transpose()?)
    }

    /// Offline parse; touches no state
    pub fn parse(config: &str, hint: Option<&str>) -> Result<Response, OrchestratorError> {
        let parsed = parse_config(config, Self::parse_hint(hint)?)?;
        let name = parsed
            .descriptor
            .display_name()
            .map(str::to_string)
            .unwrap_or_else(|| parsed.kind.as_str().to_string());
        let slots: Vec<&str> = parsed.secrets.slots().collect();
        let instance = ProtocolInstance::new(name, parsed.kind, parsed.descriptor);
        Ok(Response::ok(format!("parsed {} configuration", parsed.kind)).with_data(
            &serde_json::json!({
                "instance": instance,
                "secret_slots": slots,
            }),
        ))
    }

    pub async fn save(&self, req: SaveRequest) -> Result<Response, OrchestratorError> {
        self.store.probe()?;
        validate_name(&req.name)?;
        if req.name.starts_with(STAGE_PREFIX) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "names starting with '{STAGE_PREFIX}' are reserved"
            )));
        }

        let existing = self.instances.read().await.get(&req.name).cloned();
        let (mut instance, secrets) = match (req.config.as_deref(), existing) {
            (Some(text), previous) => {
                let parsed = parse_config(text, Self::parse_hint(req.hint.as_deref())?)?;
                let mut instance = ProtocolInstance::new(&req.name, parsed.kind, parsed.descriptor);
                if let Some(previous) = previous {
                    instance.enabled = previous.enabled;
                }
                (instance, Some(parsed.secrets))
            }
            (None, Some(previous)) => (previous, None),
            (None, None) => return Err(OrchestratorError::NotFound(req.name)),
        };
        if let Some(enabled) = req.enabled {
            instance.enabled = enabled;
        }
        if let Some(limits) = req.limits {
            instance.limits = limits;
        }
        if let Some(listen) = req.listen {
            instance.listen = listen;
        }

        if let Some(secrets) = &secrets {
            self.store.put_as(&secret_key(&instance.name), secrets)?;
        }
        self.store
            .put_as(&protocol_key(&instance.name), &instance.persisted())?;
        self.supervisor.register(&instance.name)?;

        let name = instance.name.clone();
        info!("Saved {} ({})", name, instance.kind);
        self.instances
            .write()
            .await
            .insert(name.clone(), instance.persisted());

        let mut message = format!("{name} saved");
        if self.is_active(&name) {
            message.push_str("; restart it to use the new configuration");
            if let Err(e) = self.reconcile_firewall().await {
                message.push_str(&format!("; firewall not updated: {e}"));
            }
        }
        Ok(Response::ok(message).with_data(&self.view(&name).await))
    }

    pub async fn delete(&self, name: &str) -> Result<Response, OrchestratorError> {
        self.store.probe()?;
        if !self.instances.read().await.contains_key(name) {
            return Err(OrchestratorError::NotFound(name.to_string()));
        }
        if self.is_active(name) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "stop {name} before deleting it"
            )));
        }
        // Nothing has changed until the instance record is gone
        self.store.delete(&protocol_key(name))?;
        self.instances.write().await.remove(name);
        if let Err(e) = self.supervisor.unregister(name) {
            warn!("Worker for deleted {} kept: {}", name, e);
        }

        let mut message = format!("{name} deleted");
        if let Err(e) = self.store.delete(&secret_key(name)) {
            warn!("Secrets of deleted {} not removed: {}", name, e);
            message.push_str(&format!("; secrets not removed: {e}"));
        }
        info!("Deleted {}", name);
        Ok(Response::ok(message))
    }

    pub async fn list(&self) -> Result<Response, OrchestratorError> {
        self.store.probe()?;
        let protocols = self.views().await;
        Ok(Response::ok(format!("{} instances", protocols.len())).with_data(&protocols))
    }

    pub async fn status(&self) -> Result<Response, OrchestratorError> {
        self.store.probe()?;
        let view = StatusView {
            protocols: self.views().await,
            dns: self.dns.status().await,
            firewall: self.firewall.current().await.as_ref().map(FirewallSummary::from),
        };
        let running = view
            .protocols
            .iter()
            .filter(|p| p.runtime.state.is_running())
            .count();
        Ok(Response::ok(format!("{} of {} running", running, view.protocols.len())).with_data(&view))
    }

    pub async fn control(
        &self,
        name: &str,
        action: ControlAction,
    ) -> Result<Response, OrchestratorError> {
        self.store.probe()?;
        let result = self.run_control(name, action).await;

        if result.is_ok() {
            self.set_enabled(name, action != ControlAction::Stop).await;
        }
        let firewall = self.reconcile_firewall().await;

        let mut message = result?;
        if let Err(e) = firewall {
            message.push_str(&format!("; firewall not updated: {e}"));
        }
        Ok(Response::ok(message).with_data(&self.view(name).await))
    }

    async fn run_control(
        &self,
        name: &str,
        action: ControlAction,
    ) -> Result<String, OrchestratorError> {
        let instance = self
            .instances
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))?;
        let supervisor = self.supervisor.clone();
        let owned = name.to_string();

        if action == ControlAction::Stop {
            let outcome = blocking(move || supervisor.stop(&owned)).await?;
            return Ok(match outcome {
                StopOutcome::Stopped => format!("{name} stopped"),
                StopOutcome::Killed => format!("{name} force-killed after the stop timeout"),
                StopOutcome::AlreadyStopped => format!("{name} already stopped"),
            });
        }

        let (spec, limits) = self.prepare_launch(instance).await?;
        info!("{:?} {}: {}", action, name, spec.command_line());
        let outcome = if action == ControlAction::Restart {
            blocking(move || supervisor.restart(&owned, spec, limits)).await?
        } else {
            blocking(move || supervisor.start(&owned, spec, limits)).await?
        };
        Ok(match outcome {
            StartOutcome::Started { pid: Some(pid) } => format!("{name} started (pid {pid})"),
            StartOutcome::Started { pid: None } => format!("{name} started"),
            StartOutcome::AlreadyRunning => format!("{name} already running"),
        })
    }

    /// Re-derive tuning from the host, then build the launch recipe
    async fn prepare_launch(
        &self,
        mut instance: ProtocolInstance,
    ) -> Result<(LaunchSpec, ResourceLimits), OrchestratorError> {
        let secrets: SecretBundle = self
            .store
            .get_as(&secret_key(&instance.name))?
            .unwrap_or_default();

        let uplink = self.config.network.uplink_interface.clone();
        let topology = tokio::task::spawn_blocking(move || HostTopology::probe(&uplink))
            .await
            .map_err(|e| OrchestratorError::Start(format!("topology probe failed: {e}")))?;
        let flags = optimize(topology, Eligibility::for_kind(instance.kind));
        if flags != instance.optimization {
            debug!("{} tuning: {:?}", instance.name, flags);
            instance.optimization = flags.clone();
            if let Some(entry) = self.instances.write().await.get_mut(&instance.name) {
                entry.optimization = flags;
            }
        }

        let runtime_dir = &self.config.paths.runtime_dir;
        tokio::fs::create_dir_all(runtime_dir).await.map_err(|e| {
            OrchestratorError::Start(format!("cannot create {}: {}", runtime_dir.display(), e))
        })?;
        let spec = launch_spec(
            &instance,
            &secrets,
            LaunchContext {
                runtime_dir,
                binaries: &self.config.binaries,
            },
        )?;
        Ok((spec, instance.limits))
    }

    async fn set_enabled(&self, name: &str, enabled: bool) {
        let snapshot = {
            let mut instances = self.instances.write().await;
            let Some(instance) = instances.get_mut(name) else {
                return;
            };
            if instance.enabled == enabled {
                return;
            }
            instance.enabled = enabled;
            instance.persisted()
        };
        if let Err(e) = self.store.put_as(&protocol_key(name), &snapshot) {
            warn!("Desired state of {} not persisted: {}", name, e);
        }
    }

    pub async fn dns_switch(&self, mode: DnsMode) -> Result<Response, OrchestratorError> {
        self.store.probe()?;
        let state = self.dns.switch(mode).await?;
        self.store.put_as(DNS_KEY, &state.mode)?;

        let label = state.mode.as_ref().map(DnsMode::label).unwrap_or_default();
        let mut message = format!("dns switched to {label}");
        if let Err(e) = self.reconcile_firewall().await {
            message.push_str(&format!("; firewall not updated: {e}"));
        }
        Ok(Response::ok(message).with_data(&state))
    }

    pub async fn firewall_apply(
        &self,
        routing: Option<RoutingConfig>,
    ) -> Result<Response, OrchestratorError> {
        self.store.probe()?;
        let routing = match routing {
            Some(routing) => routing,
            None => self.routing.read().await.clone(),
        };
        let applied = self.apply_routing(&routing).await?;
        self.store.put_as(ROUTING_KEY, &routing)?;
        *self.routing.write().await = routing;

        let summary = FirewallSummary::from(&applied);
        Ok(Response::ok(format!(
            "firewall applied ({} rules, {} sets)",
            summary.rules, summary.sets
        ))
        .with_data(&summary))
    }

    pub async fn firewall_status(&self) -> Result<Response, OrchestratorError> {
        let live = match self.firewall.live_ruleset().await {
            Ok(ruleset) => Some(ruleset),
            Err(e) => {
                warn!("Cannot read live ruleset: {}", e);
                None
            }
        };
        let applied = self.firewall.current().await;
        let message = match &applied {
            Some(applied) => format!("policy applied at {}", applied.applied_at.to_rfc3339()),
            None => "no policy applied yet".to_string(),
        };
        Ok(Response::ok(message).with_data(&serde_json::json!({
            "applied": applied,
            "live": live,
        })))
    }

    pub async fn leak_test(&self, kind: LeakKind) -> Result<Response, OrchestratorError> {
        let dns = self.dns.status().await;
        let vpns: Vec<ProtocolInstance> = self
            .active_instances()
            .await
            .into_iter()
            .filter(|i| i.category() == Category::Vpn)
            .collect();
        let context = LeakContext {
            dns_mode: dns.mode.as_ref().map(DnsMode::label),
            dns_entry_port: dns.mode.as_ref().and_then(DnsMode::entry_port),
            active_vpns: vpns.iter().map(|i| i.name.clone()).collect(),
            tunnel_addresses: vpns
                .iter()
                .flat_map(|i| i.descriptor.tunnel_addresses())
                .collect(),
        };

        let forced = self
            .privacy_path
            .resolver(context.dns_entry_port)
            .map_err(|e| OrchestratorError::InvalidRequest(format!("privacy path unavailable: {e}")))?;
        let result = timeout(self.leak_budget(), self.leaktest.run(kind, context, forced.as_ref()))
            .await
            .map_err(|_| OrchestratorError::Timeout(format!("{kind} leak test")))?;

        let message = if result.leak {
            "leak detected"
        } else {
            "no leak detected"
        };
        Ok(Response::ok(message).with_data(&result))
    }

    /// Worst case: every probe times out on both paths, plus the DNSSEC pair
    fn leak_budget(&self) -> Duration {
        let settings = self.leaktest.settings();
        let lookups = settings.probe_domains.len() as u32 * 2 + 2;
        settings.probe_timeout * lookups + Duration::from_secs(5)
    }

    /// Re-synthesize from the active set and the current routing config
    pub async fn reconcile_firewall(&self) -> Result<AppliedPolicy, OrchestratorError> {
        let routing = self.routing.read().await.clone();
        self.apply_routing(&routing).await
    }

    async fn apply_routing(&self, routing: &RoutingConfig) -> Result<AppliedPolicy, OrchestratorError> {
        let active = self.active_instances().await;
        let settings = self.firewall_settings().await;
        let policy = synthesize(&active, routing, &settings);
        Ok(self.firewall.apply(policy).await?)
    }

    /// Configured settings, with DNS hijack aimed at the live chain entry
    async fn firewall_settings(&self) -> FirewallSettings {
        let mut settings = self.config.firewall.settings.clone();
        if let Some(port) = self
            .dns
            .status()
            .await
            .mode
            .as_ref()
            .and_then(DnsMode::entry_port)
        {
            settings.resolver_port = port;
        }
        settings
    }

    fn is_active(&self, name: &str) -> bool {
        self.supervisor
            .status(name)
            .is_some_and(|s| s.state.is_active())
    }

    async fn active_instances(&self) -> Vec<ProtocolInstance> {
        self.views()
            .await
            .into_iter()
            .filter(|i| i.runtime.state.is_active())
            .collect()
    }

    async fn views(&self) -> Vec<ProtocolInstance> {
        let statuses = self.supervisor.statuses();
        self.instances
            .read()
            .await
            .values()
            .map(|instance| {
                let mut view = instance.clone();
                view.runtime = statuses.get(&instance.name).cloned().unwrap_or_default();
                view
            })
            .collect()
    }

    async fn view(&self, name: &str) -> Option<ProtocolInstance> {
        let mut view = self.instances.read().await.get(name).cloned()?;
        view.runtime = self.supervisor.status(name).unwrap_or_default();
        Some(view)
    }

    /// Log supervisor events, follow crashes with a firewall update and
    /// track the health of DNS resolver stages
    pub fn watch_events(self: &Arc<Self>) -> std::io::Result<thread::JoinHandle<()>> {
        let events = self.supervisor.events();
        let runtime = tokio::runtime::Handle::current();
        let orchestrator = Arc::downgrade(self);

        thread::Builder::new()
            .name("orchestrator-events".to_string())
            .spawn(move || {
                for event in events.iter() {
                    let reconcile = match &event {
                        SupervisorEvent::StateChanged { instance, from, to } => {
                            debug!("{}: {} -> {}", instance, from, to);
                            false
                        }
                        SupervisorEvent::UnexpectedExit { instance, reason } => {
                            warn!("{} exited unexpectedly: {}", instance, reason);
                            true
                        }
                        SupervisorEvent::Retrying { instance, attempt } => {
                            info!("Restarting {} (attempt {})", instance, attempt);
                            false
                        }
                        SupervisorEvent::Parked { instance, reason } => {
                            error!("{} parked in error: {}", instance, reason);
                            true
                        }
                        SupervisorEvent::WorkerPanicked { instance, error } => {
                            error!("Worker for {} panicked: {}", instance, error);
                            true
                        }
                    };
                    let Some(orchestrator) = orchestrator.upgrade() else {
                        break;
                    };
                    if let Some((stage, health)) = stage_health(&event) {
                        // In order, so a retry's recovery never overtakes its crash
                        runtime.block_on(orchestrator.dns.mark_stage(stage, health));
                    }
                    if reconcile {
                        runtime.spawn(async move {
                            if let Err(e) = orchestrator.reconcile_firewall().await {
                                warn!("Firewall not updated after crash: {}", e);
                            }
                        });
                    }
                }
                debug!("Event watcher finished");
            })
    }
}

/// Health change a supervisor event means for a DNS resolver stage
fn stage_health(event: &SupervisorEvent) -> Option<(&str, StageHealth)> {
    let (instance, health) = match event {
        SupervisorEvent::UnexpectedExit { instance, .. }
        | SupervisorEvent::Parked { instance, .. }
        | SupervisorEvent::WorkerPanicked { instance, .. } => (instance, StageHealth::Failed),
        SupervisorEvent::StateChanged {
            instance,
            to: RuntimeState::Running,
            ..
        } => (instance, StageHealth::Healthy),
        _ => return None,
    };
    stage_name(instance).map(|stage| (stage, health))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_health_from_events() {
        let crash = SupervisorEvent::UnexpectedExit {
            instance: "dns-doh".into(),
            reason: "exit status: 1".into(),
        };
        assert_eq!(stage_health(&crash), Some(("doh", StageHealth::Failed)));

        let parked = SupervisorEvent::Parked {
            instance: "dns-doh".into(),
            reason: "retry budget exhausted".into(),
        };
        assert_eq!(stage_health(&parked), Some(("doh", StageHealth::Failed)));

        let recovered = SupervisorEvent::StateChanged {
            instance: "dns-doh".into(),
            from: RuntimeState::Starting,
            to: RuntimeState::Running,
        };
        assert_eq!(stage_health(&recovered), Some(("doh", StageHealth::Healthy)));

        let stopping = SupervisorEvent::StateChanged {
            instance: "dns-doh".into(),
            from: RuntimeState::Running,
            to: RuntimeState::Stopping,
        };
        assert_eq!(stage_health(&stopping), None);

        let protocol_crash = SupervisorEvent::UnexpectedExit {
            instance: "home".into(),
            reason: "killed".into(),
        };
        assert_eq!(stage_health(&protocol_crash), None);
    }
}
