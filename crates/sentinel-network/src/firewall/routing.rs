//! Routing configuration and firewall settings.

use serde::{Deserialize, Serialize};
use sentinel_protocols::Transport;

/// User-controlled routing policy, persisted by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub geoip: Vec<GeoIpRule>,
    #[serde(default)]
    pub port_forwards: Vec<PortForward>,
    #[serde(default)]
    pub stealth: StealthPolicy,
    /// Reject IPv6 towards the WAN so it cannot bypass the tunnel
    #[serde(default)]
    pub block_ipv6_leaks: bool,
    /// LAN may only be forwarded into the VPN zone (plus bypass traffic)
    #[serde(default)]
    pub kill_switch: bool,
    #[serde(default)]
    pub bypass: DirectBypass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoIpAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoIpDirection {
    /// Traffic arriving from the WAN (input and forwarded)
    #[default]
    Inbound,
    /// LAN traffic heading out
    Outbound,
}

/// Allow or deny a country/region given as a list of prefixes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoIpRule {
    /// Short identifier, e.g. a country code
    pub name: String,
    pub cidrs: Vec<String>,
    pub action: GeoIpAction,
    #[serde(default)]
    pub direction: GeoIpDirection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub name: String,
    #[serde(default = "default_transport")]
    pub transport: Transport,
    pub public_port: u16,
    pub target_addr: String,
    pub target_port: u16,
}

fn default_transport() -> Transport {
    Transport::Tcp
}

/// Connection/rate limits and port knocking on the WAN side
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StealthPolicy {
    /// Concurrent connections per source
    #[serde(default)]
    pub conn_limit: Option<u32>,
    /// New connections per second from the WAN
    #[serde(default)]
    pub new_conn_rate: Option<u32>,
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Silently drop ICMP from the WAN
    #[serde(default)]
    pub drop_icmp: bool,
    #[serde(default)]
    pub knock: Option<PortKnock>,
}

fn default_burst() -> u32 {
    20
}

/// Open `protected_port` only to sources that hit `sequence` in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortKnock {
    pub sequence: Vec<u16>,
    pub protected_port: u16,
    #[serde(default = "default_knock_timeout")]
    pub timeout_secs: u32,
}

fn default_knock_timeout() -> u32 {
    10
}

/// Destinations that skip the tunnel (marked and forwarded to the WAN)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DirectBypass {
    #[serde(default)]
    pub addrs: Vec<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl DirectBypass {
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty() && self.ports.is_empty()
    }
}

/// Host-specific firewall settings (from the orchestrator config)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallSettings {
    #[serde(default = "default_lan")]
    pub lan_interfaces: Vec<String>,
    #[serde(default = "default_wan")]
    pub wan_interfaces: Vec<String>,
    /// Patterns matching any tunnel device
    #[serde(default = "default_vpn")]
    pub vpn_interfaces: Vec<String>,
    /// Port of the local DNS chain entry point
    #[serde(default = "default_resolver_port")]
    pub resolver_port: u16,
    /// Router services reachable from the LAN
    #[serde(default = "default_lan_tcp")]
    pub lan_tcp_services: Vec<u16>,
    #[serde(default = "default_lan_udp")]
    pub lan_udp_services: Vec<u16>,
}

fn default_lan() -> Vec<String> {
    vec!["br-lan".to_string()]
}

fn default_wan() -> Vec<String> {
    vec!["eth0".to_string()]
}

fn default_vpn() -> Vec<String> {
    ["wg*", "awg*", "tun*", "tap*"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_resolver_port() -> u16 {
    5353
}

fn default_lan_tcp() -> Vec<u16> {
    vec![22, 80, 443]
}

fn default_lan_udp() -> Vec<u16> {
    vec![67]
}

impl Default for FirewallSettings {
    fn default() -> Self {
        Self {
            lan_interfaces: default_lan(),
            wan_interfaces: default_wan(),
            vpn_interfaces: default_vpn(),
            resolver_port: default_resolver_port(),
            lan_tcp_services: default_lan_tcp(),
            lan_udp_services: default_lan_udp(),
        }
    }
}
