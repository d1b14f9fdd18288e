//! Drives the orchestrator through its Unix socket with in-memory backends
//! and real short-lived processes.

use async_trait::async_trait;
use sentinel_network::{
    BackendError, CanaryProbe, EgressProbe, FirewallBackend, PathResolver, ResolverRuntime,
    ResolverStage, StageError,
};
use sentinel_orchestrator::{
    ControlServer, MemoryStore, Orchestrator, OrchestratorConfig, PrivacyPath, Request, Response,
    Services, Store, control,
};
use sentinel_protocols::{LaunchMode, LaunchSpec, ResourceLimits, RuntimeState};
use sentinel_supervisor::{Supervisor, SupervisorConfig};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Default)]
struct FakeFirewall {
    reject: AtomicBool,
    loaded: Mutex<Vec<String>>,
}

#[async_trait]
impl FirewallBackend for FakeFirewall {
    async fn validate(&self, _script: &str) -> Result<(), BackendError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(BackendError::Rejected("Error: syntax error".into()));
        }
        Ok(())
    }

    async fn load(&self, script: &str) -> Result<(), BackendError> {
        self.loaded.lock().unwrap().push(script.to_string());
        Ok(())
    }

    async fn current(&self) -> Result<String, BackendError> {
        Ok(self.loaded.lock().unwrap().last().cloned().unwrap_or_default())
    }
}

#[derive(Default)]
struct FakeResolvers {
    applied: Mutex<Vec<Vec<ResolverStage>>>,
}

#[async_trait]
impl ResolverRuntime for FakeResolvers {
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
            return Err(StageError("SERVFAIL".into()));
        }
        Ok(vec!["93.184.216.34".parse().unwrap()])
    }
}

struct StaticPath(HashMap<String, Vec<IpAddr>>);

impl StaticPath {
    fn answering(ip: &str) -> Self {
        let ip: IpAddr = ip.parse().unwrap();
        Self(
            ["example.com", "cloudflare.com", "wikipedia.org"]
                .iter()
                .map(|d| (d.to_string(), vec![ip]))
                .collect(),
        )
    }
}

#[async_trait]
impl PathResolver for StaticPath {
    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>, String> {
        self.0
            .get(domain)
            .cloned()
            .ok_or_else(|| "NXDOMAIN".to_string())
    }
}

struct ForcedPath(Arc<StaticPath>);

impl PrivacyPath for ForcedPath {
    fn resolver(&self, _entry_port: Option<u16>) -> Result<Arc<dyn PathResolver>, String> {
        Ok(self.0.clone())
    }
}

struct NoEgress;

#[async_trait]
impl EgressProbe for NoEgress {
    async fn local_egress(&self) -> (Option<IpAddr>, Option<IpAddr>) {
        (None, None)
    }
}

struct Harness {
    _dir: TempDir,
    socket: PathBuf,
    store: Arc<MemoryStore>,
    firewall: Arc<FakeFirewall>,
    canary: Arc<FakeCanary>,
    supervisor: Arc<Supervisor>,
}

impl Harness {
    async fn start(forced_ip: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("control.sock");

        let mut config = OrchestratorConfig::default();
        config.paths.runtime_dir = dir.path().join("run");
        config.paths.control_socket = socket.clone();
        config.dns.probe_timeout_secs = 1;
        // DPI instances launch `ciadpi <args>`; run the args through sh instead
        config.binaries.0.insert("ciadpi".to_string(), "sh".to_string());

        let supervisor = Arc::new(Supervisor::new(SupervisorConfig {
            poll_interval: Duration::from_millis(100),
            liveness_grace: Duration::from_millis(300),
            stop_timeout: Duration::from_secs(2),
            operation_timeout: Duration::from_secs(10),
            cgroup_root: dir.path().join("cgroup"),
            ..SupervisorConfig::default()
        }));
        supervisor.start_poller().unwrap();
        let store = Arc::new(MemoryStore::new());
        let firewall = Arc::new(FakeFirewall::default());
        let canary = Arc::new(FakeCanary::default());

        let services = Services {
            store: store.clone(),
            supervisor: supervisor.clone(),
            firewall_backend: firewall.clone(),
            resolver_runtime: Arc::new(FakeResolvers::default()),
            canary: canary.clone(),
            raw_path: Arc::new(StaticPath::answering("93.184.216.34")),
            privacy_path: Arc::new(ForcedPath(Arc::new(StaticPath::answering(forced_ip)))),
            egress: Arc::new(NoEgress),
        };
        let orchestrator = Arc::new(Orchestrator::new(config, services));
        orchestrator.load().await.unwrap();
        orchestrator.watch_events().unwrap();

        let server = ControlServer::bind(&socket).unwrap();
        tokio::spawn(async move {
            let _ = server.serve(orchestrator).await;
        });

        Self {
            _dir: dir,
            socket,
            store,
            firewall,
            canary,
            supervisor,
        }
    }

    async fn send(&self, request: Value) -> Response {
        let request: Request = serde_json::from_value(request).unwrap();
        control::send(&self.socket, &request).await.unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.supervisor.shutdown();
    }
}

fn save_dpi(name: &str) -> Value {
    json!({"op": "save", "name": name, "config": "-c \"sleep 30\"", "hint": "byedpi"})
}

#[tokio::test(flavor = "multi_thread")]
async fn test_instance_lifecycle() {
    let h = Harness::start("93.184.216.34").await;

    let resp = h.send(save_dpi("dpi")).await;
    assert!(resp.success, "{}", resp.message);

    let resp = h.send(json!({"op": "list"})).await;
    assert_eq!(resp.data.unwrap().as_array().unwrap().len(), 1);

    let resp = h.send(json!({"op": "control", "name": "dpi", "action": "start"})).await;
    assert!(resp.success, "{}", resp.message);
    assert!(resp.message.contains("started"));
    assert_eq!(resp.data.unwrap()["runtime"]["state"], "running");
    assert!(!h.firewall.loaded.lock().unwrap().is_empty());

    let resp = h.send(json!({"op": "delete", "name": "dpi"})).await;
    assert!(!resp.success);
    assert_eq!(resp.code.as_deref(), Some("invalid_request"));

    let resp = h.send(json!({"op": "control", "name": "dpi", "action": "start"})).await;
    assert!(resp.success);
    assert!(resp.message.contains("already running"));

    let resp = h.send(json!({"op": "status"})).await;
    let data = resp.data.unwrap();
    assert_eq!(data["protocols"][0]["runtime"]["state"], "running");
    assert!(data["protocols"][0]["runtime"]["pid"].is_u64());
    assert!(data["firewall"]["rules"].as_u64().unwrap() > 0);

    let resp = h.send(json!({"op": "control", "name": "dpi", "action": "stop"})).await;
    assert!(resp.success, "{}", resp.message);
    let resp = h.send(json!({"op": "control", "name": "dpi", "action": "stop"})).await;
    assert!(resp.success);
    assert!(resp.message.contains("already stopped"));

    let resp = h.send(json!({"op": "delete", "name": "dpi"})).await;
    assert!(resp.success, "{}", resp.message);
    let resp = h.send(json!({"op": "list"})).await;
    assert!(resp.data.unwrap().as_array().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_instance_and_reserved_names() {
    let h = Harness::start("93.184.216.34").await;

    let resp = h.send(json!({"op": "control", "name": "ghost", "action": "stop"})).await;
    assert_eq!(resp.code.as_deref(), Some("not_found"));

    let resp = h.send(save_dpi("dns-adblock")).await;
    assert_eq!(resp.code.as_deref(), Some("invalid_request"));

    let resp = h
        .send(json!({"op": "save", "name": "bad", "config": "[Interface]\nAddress = 10.0.0.2/32\n"}))
        .await;
    assert_eq!(resp.code.as_deref(), Some("parse_error"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_store_outage_halts_mutations() {
    let h = Harness::start("93.184.216.34").await;

    h.store.set_available(false);
    let resp = h.send(save_dpi("dpi")).await;
    assert_eq!(resp.code.as_deref(), Some("store_unavailable"));
    let resp = h.send(json!({"op": "status"})).await;
    assert_eq!(resp.code.as_deref(), Some("store_unavailable"));
    // Read-only views that do not come from the store keep answering
    let resp = h.send(json!({"op": "dns_status"})).await;
    assert!(resp.success);

    h.store.set_available(true);
    let resp = h.send(save_dpi("dpi")).await;
    assert!(resp.success, "{}", resp.message);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_dns_switch_keeps_state() {
    let h = Harness::start("93.184.216.34").await;
    let mode = json!({
        "mode": "single",
        "resolver": {"name": "doh", "listen_port": 5353, "upstreams": ["https://1.1.1.1/dns-query"]}
    });

    let resp = h.send(json!({"op": "dns_switch", "mode": mode})).await;
    assert!(resp.success, "{}", resp.message);
    let before = h.send(json!({"op": "dns_status"})).await.data.unwrap();
    assert_eq!(before["mode"]["resolver"]["health"], "healthy");

    h.canary.fail.store(true, Ordering::SeqCst);
    let chain = json!({
        "mode": "chain",
        "stages": [
            {"name": "adblock", "listen_port": 5353, "upstreams": []},
            {"name": "dnscrypt", "listen_port": 5354, "upstreams": ["sdns://example"]}
        ]
    });
    let resp = h.send(json!({"op": "dns_switch", "mode": chain})).await;
    assert_eq!(resp.code.as_deref(), Some("dns_switch_error"));

    let after = h.send(json!({"op": "dns_status"})).await.data.unwrap();
    assert_eq!(after, before);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_crashed_dns_stage_is_reported_failed() {
    let h = Harness::start("93.184.216.34").await;
    let mode = json!({
        "mode": "single",
        "resolver": {"name": "doh", "listen_port": 5353, "upstreams": ["https://1.1.1.1/dns-query"]}
    });
    assert!(h.send(json!({"op": "dns_switch", "mode": mode})).await.success);

    // A stage daemon that dies shortly after passing its liveness grace
    let supervisor = h.supervisor.clone();
    tokio::task::spawn_blocking(move || {
        supervisor.register("dns-doh").unwrap();
        let spec = LaunchSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 0.5; exit 3".to_string()],
            env: Vec::new(),
            files: Vec::new(),
            mode: LaunchMode::Daemon,
        };
        supervisor.start("dns-doh", spec, ResourceLimits::default()).unwrap();
    })
    .await
    .unwrap();

    let mut health = Value::Null;
    for _ in 0..150 {
        let status = h.send(json!({"op": "dns_status"})).await.data.unwrap();
        health = status["mode"]["resolver"]["health"].clone();
        let parked = h
            .supervisor
            .status("dns-doh")
            .is_some_and(|s| s.state == RuntimeState::Error);
        if parked && health == "failed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(health, "failed");
    let status = h.send(json!({"op": "dns_status"})).await.data.unwrap();
    assert_eq!(status["last_known_good"]["resolver"]["health"], "healthy");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delete_survives_store_write_failures() {
    let h = Harness::start("93.184.216.34").await;
    assert!(h.send(save_dpi("dpi")).await.success);

    // Instance record cannot be removed: nothing changes
    h.store.reject_writes(Some("protocol/"));
    let resp = h.send(json!({"op": "delete", "name": "dpi"})).await;
    assert_eq!(resp.code.as_deref(), Some("store_unavailable"));
    h.store.reject_writes(None);
    let listed = h.send(json!({"op": "list"})).await.data.unwrap();
    assert_eq!(listed[0]["name"], "dpi");
    let resp = h.send(json!({"op": "control", "name": "dpi", "action": "start"})).await;
    assert!(resp.success, "{}", resp.message);
    let resp = h.send(json!({"op": "control", "name": "dpi", "action": "stop"})).await;
    assert!(resp.success, "{}", resp.message);

    // Only the secrets are stuck: the delete goes through and says so
    h.store.reject_writes(Some("secret/"));
    let resp = h.send(json!({"op": "delete", "name": "dpi"})).await;
    assert!(resp.success, "{}", resp.message);
    assert!(resp.message.contains("secrets not removed"), "{}", resp.message);
    assert!(h.store.get("protocol/dpi").unwrap().is_none());
    assert!(h.supervisor.status("dpi").is_none());
    let listed = h.send(json!({"op": "list"})).await.data.unwrap();
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejected_firewall_keeps_previous() {
    let h = Harness::start("93.184.216.34").await;

    let resp = h.send(json!({"op": "firewall_apply", "routing": {"kill_switch": true}})).await;
    assert!(resp.success, "{}", resp.message);
    let applied = h.send(json!({"op": "firewall_status"})).await.data.unwrap();
    assert_eq!(applied["live"], applied["applied"]["script"]);

    h.firewall.reject.store(true, Ordering::SeqCst);
    let routing = json!({
        "port_forwards": [{"name": "web", "public_port": 8080, "target_addr": "192.168.1.5", "target_port": 80}]
    });
    let resp = h.send(json!({"op": "firewall_apply", "routing": routing})).await;
    assert_eq!(resp.code.as_deref(), Some("policy_apply_error"));

    let still = h.send(json!({"op": "firewall_status"})).await.data.unwrap();
    assert_eq!(still, applied);
    // Only the accepted routing is persisted
    let stored = h.store.get("routing").unwrap().unwrap();
    assert_eq!(stored["kill_switch"], true);
    assert!(stored["port_forwards"].as_array().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_leak_detected_when_paths_disagree() {
    let h = Harness::start("1.2.3.4").await;
    let resp = h.send(json!({"op": "leak_test", "kind": "dns"})).await;
    assert!(resp.success, "{}", resp.message);
    assert_eq!(resp.message, "leak detected");
    let data = resp.data.unwrap();
    assert_eq!(data["leak"], true);
    assert_eq!(data["probes"][0]["forced"][0], "1.2.3.4");

    let h = Harness::start("93.184.216.34").await;
    let resp = h.send(json!({"op": "leak_test", "kind": "ip"})).await;
    assert_eq!(resp.message, "no leak detected");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_line_gets_an_answer() {
    let h = Harness::start("93.184.216.34").await;
    let stream = UnixStream::connect(&h.socket).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(b"{\"op\":\"reboot\"}\n{\"op\":\"list\"}\n").await.unwrap();

    let mut lines = BufReader::new(read_half).lines();
    let first: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(first.code.as_deref(), Some("invalid_request"));
    let second: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert!(second.success);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_oversized_line_is_refused() {
    let h = Harness::start("93.184.216.34").await;
    let stream = UnixStream::connect(&h.socket).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();

    // No newline anywhere, so only the length limit can end the read
    let writer = tokio::spawn(async move {
        let _ = write_half.write_all(&vec![b'x'; control::MAX_LINE + 2]).await;
        write_half
    });

    let mut lines = BufReader::new(read_half).lines();
    let answer: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(answer.code.as_deref(), Some("invalid_request"));
    assert!(answer.message.contains("exceeds"), "{}", answer.message);
    assert!(lines.next_line().await.unwrap().is_none());
    drop(writer.await.unwrap());

    // The server keeps serving other clients
    assert!(h.send(json!({"op": "list"})).await.success);
}

#[test]
fn test_offline_parse_hides_secrets() {
    let conf = "[Interface]\n\
                PrivateKey = yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=\n\
                Address = 10.8.0.2/32\n\
                \n\
                [Peer]\n\
                PublicKey = xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=\n\
                Endpoint = vpn.example.net:51820\n\
                AllowedIPs = 0.0.0.0/0\n";
    let resp: Response = Orchestrator::parse(conf, None).into();
    assert!(resp.success, "{}", resp.message);
    let data = resp.data.unwrap();
    assert_eq!(data["instance"]["kind"], "wireguard");
    assert!(!data["secret_slots"].as_array().unwrap().is_empty());
    assert!(!data.to_string().contains("yAnz5TF"));
}
