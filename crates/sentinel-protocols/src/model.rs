//! Protocol Instance Model
//!
//! The data carried for one configured network-privacy daemon: what it is
//! (kind and canonical descriptor), how it should run (limits, tuning, listen
//! ports) and what it is doing right now (runtime status and metrics).

use crate::descriptor::Descriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol family an instance belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Vpn,
    Proxy,
    Dpi,
    Tunnel,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::Vpn => "vpn",
            Category::Proxy => "proxy",
            Category::Dpi => "dpi",
            Category::Tunnel => "tunnel",
        };
        f.write_str(s)
    }
}

/// Supported protocol daemons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    Wireguard,
    Amneziawg,
    Openvpn,
    Xray,
    Shadowsocks,
    Trojan,
    SingBox,
    Hysteria2,
    Tor,
    Zapret,
    Byedpi,
    Goodbyedpi,
}

impl ProtocolKind {
    /// All kinds, in catalogue order
    pub fn all() -> &'static [ProtocolKind] {
        &[
            ProtocolKind::Wireguard,
            ProtocolKind::Amneziawg,
            ProtocolKind::Openvpn,
            ProtocolKind::Xray,
            ProtocolKind::Shadowsocks,
            ProtocolKind::Trojan,
            ProtocolKind::SingBox,
            ProtocolKind::Hysteria2,
            ProtocolKind::Tor,
            ProtocolKind::Zapret,
            ProtocolKind::Byedpi,
            ProtocolKind::Goodbyedpi,
        ]
    }

    /// Category this kind belongs to
    pub fn category(&self) -> Category {
        match self {
            ProtocolKind::Wireguard | ProtocolKind::Amneziawg | ProtocolKind::Openvpn => {
                Category::Vpn
            }
            ProtocolKind::Xray
            | ProtocolKind::Shadowsocks
            | ProtocolKind::Trojan
            | ProtocolKind::SingBox
            | ProtocolKind::Hysteria2 => Category::Proxy,
            ProtocolKind::Tor => Category::Tunnel,
            ProtocolKind::Zapret | ProtocolKind::Byedpi | ProtocolKind::Goodbyedpi => {
                Category::Dpi
            }
        }
    }

    /// Stable identifier used on the wire and in the store
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Wireguard => "wireguard",
            ProtocolKind::Amneziawg => "amneziawg",
            ProtocolKind::Openvpn => "openvpn",
            ProtocolKind::Xray => "xray",
            ProtocolKind::Shadowsocks => "shadowsocks",
            ProtocolKind::Trojan => "trojan",
            ProtocolKind::SingBox => "sing-box",
            ProtocolKind::Hysteria2 => "hysteria2",
            ProtocolKind::Tor => "tor",
            ProtocolKind::Zapret => "zapret",
            ProtocolKind::Byedpi => "byedpi",
            ProtocolKind::Goodbyedpi => "goodbyedpi",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProtocolKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        let kind = match normalized.as_str() {
            "wireguard" | "wg" => ProtocolKind::Wireguard,
            "amneziawg" | "amnezia" | "awg" => ProtocolKind::Amneziawg,
            "openvpn" | "ovpn" => ProtocolKind::Openvpn,
            "xray" | "vless" | "vmess" => ProtocolKind::Xray,
            "shadowsocks" | "ss" => ProtocolKind::Shadowsocks,
            "trojan" => ProtocolKind::Trojan,
            "sing-box" | "singbox" => ProtocolKind::SingBox,
            "hysteria2" | "hy2" => ProtocolKind::Hysteria2,
            "tor" => ProtocolKind::Tor,
            "zapret" => ProtocolKind::Zapret,
            "byedpi" => ProtocolKind::Byedpi,
            "goodbyedpi" => ProtocolKind::Goodbyedpi,
            _ => return Err(UnknownKind(s.to_string())),
        };
        Ok(kind)
    }
}

/// Unrecognized protocol type name
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown protocol type: {0}")]
pub struct UnknownKind(pub String);

/// I/O scheduling class applied to a daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IoClass {
    /// Leave the kernel default in place
    #[default]
    Inherit,
    /// Best-effort class at the given level (0 highest, 7 lowest)
    BestEffort,
    /// Only gets disk time when nobody else wants it
    Idle,
}

/// Resource ceilings enforced when the daemon's process group is created
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes
    #[serde(default)]
    pub memory_max_bytes: Option<u64>,
    /// CPU quota as a percentage of one core
    #[serde(default)]
    pub cpu_quota_percent: Option<u32>,
    /// I/O scheduling class
    #[serde(default)]
    pub io_class: IoClass,
    /// Best-effort level (0..=7)
    #[serde(default = "default_io_level")]
    pub io_level: u8,
}

fn default_io_level() -> u8 {
    4
}

impl ResourceLimits {
    /// Limits applied to a freshly parsed instance of `kind`
    pub fn for_kind(kind: ProtocolKind) -> Self {
        let mut limits = Self {
            io_level: default_io_level(),
            ..Self::default()
        };
        match kind {
            // Memory hungry proxy cores
            ProtocolKind::Xray | ProtocolKind::SingBox | ProtocolKind::Hysteria2 => {
                limits.memory_max_bytes = Some(512 * 1024 * 1024);
            }
            ProtocolKind::Tor => {
                limits.cpu_quota_percent = Some(50);
                limits.io_class = IoClass::BestEffort;
                limits.io_level = 6;
            }
            _ => {}
        }
        limits
    }

    /// True when nothing needs enforcing
    pub fn is_unconstrained(&self) -> bool {
        self.memory_max_bytes.is_none()
            && self.cpu_quota_percent.is_none()
            && self.io_class == IoClass::Inherit
    }
}

/// Network tuning derived by the resource optimizer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationFlags {
    /// Number of NIC/tunnel queues to use
    pub queue_count: u32,
    /// Enable TCP fast open
    pub fast_open: bool,
    /// Congestion control algorithm, if one should be forced
    pub congestion_control: Option<String>,
}

impl Default for OptimizationFlags {
    fn default() -> Self {
        Self {
            queue_count: 1,
            fast_open: false,
            congestion_control: None,
        }
    }
}

/// L4 transport of a listen socket or rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
            Transport::Udp => f.write_str("udp"),
        }
    }
}

/// Which side of the router a listen socket must be reachable from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exposure {
    /// Local clients (SOCKS/HTTP inbounds)
    Lan,
    /// Remote peers (VPN server ports)
    Wan,
}

/// A port a running daemon listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenSpec {
    pub port: u16,
    pub transport: Transport,
    pub exposure: Exposure,
}

impl ListenSpec {
    pub fn lan_tcp(port: u16) -> Self {
        Self {
            port,
            transport: Transport::Tcp,
            exposure: Exposure::Lan,
        }
    }

    pub fn wan_udp(port: u16) -> Self {
        Self {
            port,
            transport: Transport::Udp,
            exposure: Exposure::Wan,
        }
    }
}

/// Supervisor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl RuntimeState {
    /// Is the daemon (supposed to be) up?
    pub fn is_active(&self) -> bool {
        matches!(self, RuntimeState::Starting | RuntimeState::Running)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, RuntimeState::Running)
    }

    /// Stopped or parked in error; safe to delete or edit
    pub fn is_idle(&self) -> bool {
        matches!(self, RuntimeState::Stopped | RuntimeState::Error)
    }

    /// Whether the state machine permits `self -> next`
    pub fn can_transition_to(&self, next: RuntimeState) -> bool {
        use RuntimeState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Error)
                | (Stopping, Stopped)
                | (Stopping, Error)
                | (Error, Starting)
                | (Error, Stopped)
        )
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeState::Stopped => "stopped",
            RuntimeState::Starting => "starting",
            RuntimeState::Running => "running",
            RuntimeState::Stopping => "stopping",
            RuntimeState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Point-in-time resource sample for a running daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub pid: u32,
    /// Resident set size in bytes
    pub rss_bytes: u64,
    pub cpu_percent: f32,
    pub updated_at: DateTime<Utc>,
}

/// Runtime view published by the supervisor
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub state: RuntimeState,
    pub pid: Option<u32>,
    pub metrics: Option<MetricsSnapshot>,
    pub last_error: Option<String>,
    /// Automatic restarts since the last explicit start
    pub restarts: u32,
}

/// One configured, independently controllable network-privacy daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolInstance {
    /// Unique name
    pub name: String,
    pub kind: ProtocolKind,
    /// Canonical configuration (secrets replaced by slot references)
    pub descriptor: Descriptor,
    /// Desired state
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub optimization: OptimizationFlags,
    /// Ports opened in the firewall while the instance is active
    #[serde(default)]
    pub listen: Vec<ListenSpec>,
    /// Filled in from the supervisor when reporting; never persisted as truth
    #[serde(default)]
    pub runtime: RuntimeStatus,
}

impl ProtocolInstance {
    /// Build an instance from a parsed descriptor with kind defaults
    pub fn new(name: impl Into<String>, kind: ProtocolKind, descriptor: Descriptor) -> Self {
        let listen = descriptor.default_listen(kind);
        Self {
            name: name.into(),
            kind,
            descriptor,
            enabled: false,
            limits: ResourceLimits::for_kind(kind),
            optimization: OptimizationFlags::default(),
            listen,
            runtime: RuntimeStatus::default(),
        }
    }

    pub fn category(&self) -> Category {
        self.kind.category()
    }

    /// Copy suitable for the persistent store
    pub fn persisted(&self) -> Self {
        Self {
            runtime: RuntimeStatus::default(),
            ..self.clone()
        }
    }
}

/// Validate an instance name (used as file, cgroup and store key component)
pub fn validate_name(name: &str) -> Result<(), InvalidName> {
    let ok = !name.is_empty()
        && name.len() <= 48
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(InvalidName(name.to_string()))
    }
}

/// Instance name that cannot be used as a path component
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid instance name '{0}': use 1-48 characters from [A-Za-z0-9._-]")]
pub struct InvalidName(pub String);
