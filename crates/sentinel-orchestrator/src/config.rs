//! Daemon configuration (`sentinel.toml`).
//!
//! Every field has a default, so an empty or missing file yields a working
//! setup for a stock router.

use sentinel_network::{DnsMode, FirewallSettings, LeakTestSettings};
use sentinel_protocols::Binaries;
use sentinel_supervisor::{DEFAULT_CGROUP_ROOT, SupervisorConfig};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sentinel/sentinel.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Fallback log filter when `RUST_LOG` is unset
    pub log_level: LogLevel,
    pub paths: PathsConfig,
    pub supervisor: SupervisorSection,
    pub dns: DnsSection,
    pub firewall: FirewallSection,
    pub network: NetworkSection,
    /// Per-daemon executable overrides (`xray = "/opt/xray/xray"`)
    pub binaries: Binaries,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogLevel(pub String);

impl Default for LogLevel {
    fn default() -> Self {
        Self("info".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub state_file: PathBuf,
    /// Rendered daemon configs
    pub runtime_dir: PathBuf,
    pub control_socket: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("/etc/sentinel/state.json"),
            runtime_dir: PathBuf::from("/var/run/sentinel"),
            control_socket: PathBuf::from("/var/run/sentinel/control.sock"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub poll_interval_secs: u64,
    pub liveness_grace_ms: u64,
    pub stop_timeout_secs: u64,
    pub operation_timeout_secs: u64,
    pub max_auto_retries: u32,
    pub cgroup_root: PathBuf,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            liveness_grace_ms: 1500,
            stop_timeout_secs: 10,
            operation_timeout_secs: 30,
            max_auto_retries: 1,
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
        }
    }
}

impl SupervisorSection {
    pub fn to_supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            liveness_grace: Duration::from_millis(self.liveness_grace_ms),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
            max_auto_retries: self.max_auto_retries,
            cgroup_root: self.cgroup_root.clone(),
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSection {
    /// Resolver daemon run for every chain stage
    pub resolver_binary: String,
    pub canary_domain: String,
    pub canary_timeout_secs: u64,
    pub switch_timeout_secs: u64,
    /// Domains compared by the leak test
    pub probe_domains: Vec<String>,
    pub probe_timeout_secs: u64,
    /// Raw path resolvers; empty means the host's resolv.conf
    pub raw_resolvers: Vec<IpAddr>,
    pub dnssec_broken_domain: String,
    pub dnssec_control_domain: String,
    /// Mode brought up at startup when none is persisted
    pub initial_mode: Option<DnsMode>,
}

impl Default for DnsSection {
    fn default() -> Self {
        let leak = LeakTestSettings::default();
        Self {
            resolver_binary: "dnsproxy".to_string(),
            canary_domain: "example.com".to_string(),
            canary_timeout_secs: 5,
            switch_timeout_secs: 30,
            probe_domains: leak.probe_domains,
            probe_timeout_secs: leak.probe_timeout.as_secs(),
            raw_resolvers: Vec::new(),
            dnssec_broken_domain: leak.dnssec_broken_domain,
            dnssec_control_domain: leak.dnssec_control_domain,
            initial_mode: None,
        }
    }
}

impl DnsSection {
    pub fn leak_settings(&self) -> LeakTestSettings {
        LeakTestSettings {
            probe_domains: self.probe_domains.clone(),
            dnssec_broken_domain: self.dnssec_broken_domain.clone(),
            dnssec_control_domain: self.dnssec_control_domain.clone(),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallSection {
    pub nft_binary: String,
    pub apply_timeout_secs: u64,
    #[serde(flatten)]
    pub settings: FirewallSettings,
}

impl Default for FirewallSection {
    fn default() -> Self {
        Self {
            nft_binary: "nft".to_string(),
            apply_timeout_secs: 15,
            settings: FirewallSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Interface whose queues bound multiqueue tuning
    pub uplink_interface: String,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            uplink_interface: "eth0".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Load `path`; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.log_level.0, "info");
    }

    #[test]
    fn test_partial_file() {
        let config = OrchestratorConfig::from_toml(
            r#"
log_level = "debug"

[supervisor]
poll_interval_secs = 2

[firewall]
nft_binary = "/usr/sbin/nft"
resolver_port = 5300
lan_interfaces = ["br-lan", "br-guest"]

[binaries]
xray = "/opt/xray/xray"

[dns.initial_mode]
mode = "single"
resolver = { name = "doh", listen_port = 5300, upstreams = ["https://1.1.1.1/dns-query"] }
"#,
        )
        .unwrap();

        assert_eq!(config.log_level.0, "debug");
        assert_eq!(config.supervisor.poll_interval_secs, 2);
        assert_eq!(config.supervisor.stop_timeout_secs, 10);
        assert_eq!(config.firewall.settings.resolver_port, 5300);
        assert_eq!(config.firewall.settings.lan_interfaces.len(), 2);
        assert_eq!(config.firewall.settings.wan_interfaces, vec!["eth0".to_string()]);
        assert_eq!(config.binaries.resolve("xray"), "/opt/xray/xray");
        assert_eq!(config.dns.initial_mode.unwrap().entry_port(), Some(5300));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.toml");
        std::fs::write(&path, "[supervisor]\npoll_interval_secs = \"soon\"\n").unwrap();
        assert!(matches!(
            OrchestratorConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
