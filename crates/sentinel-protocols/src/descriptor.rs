//! Canonical Descriptors
//!
//! Every accepted configuration is normalized into one of four category
//! variants. Secret values never live here: fields that hold credentials
//! carry a [`SecretRef`] naming a slot in the accompanying
//! [`SecretBundle`](crate::secrets::SecretBundle).

use crate::model::{ListenSpec, ProtocolKind, Transport};
use crate::secrets::SecretRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Canonical configuration, one variant per protocol category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", content = "config", rename_all = "lowercase")]
pub enum Descriptor {
    Vpn(VpnDescriptor),
    Proxy(ProxyDescriptor),
    Tunnel(TorConfig),
    Dpi(DpiConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum VpnDescriptor {
    Wireguard(WireGuardConfig),
    Openvpn(OpenVpnConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum ProxyDescriptor {
    Link(ProxyLink),
    Json(JsonProxyConfig),
}

impl Descriptor {
    /// Protocol kind implied by the descriptor's content
    pub fn kind(&self) -> ProtocolKind {
        match self {
            Descriptor::Vpn(VpnDescriptor::Wireguard(wg)) => {
                if wg.interface.obfuscation.is_some() {
                    ProtocolKind::Amneziawg
                } else {
                    ProtocolKind::Wireguard
                }
            }
            Descriptor::Vpn(VpnDescriptor::Openvpn(_)) => ProtocolKind::Openvpn,
            Descriptor::Proxy(ProxyDescriptor::Link(link)) => link.scheme.kind(),
            Descriptor::Proxy(ProxyDescriptor::Json(json)) => match json.engine {
                JsonEngine::Xray => ProtocolKind::Xray,
                JsonEngine::SingBox => ProtocolKind::SingBox,
            },
            Descriptor::Tunnel(_) => ProtocolKind::Tor,
            Descriptor::Dpi(dpi) => dpi.tool.kind(),
        }
    }

    /// Display name embedded in the config (link fragment, vmess `ps`)
    pub fn display_name(&self) -> Option<&str> {
        match self {
            Descriptor::Proxy(ProxyDescriptor::Link(link)) => link.name.as_deref(),
            _ => None,
        }
    }

    /// Ports the daemon listens on for this configuration
    pub fn default_listen(&self, kind: ProtocolKind) -> Vec<ListenSpec> {
        match self {
            Descriptor::Vpn(VpnDescriptor::Wireguard(wg)) => wg
                .interface
                .listen_port
                .map(ListenSpec::wan_udp)
                .into_iter()
                .collect(),
            Descriptor::Vpn(VpnDescriptor::Openvpn(ovpn)) => ovpn.local_port().into_iter().collect(),
            Descriptor::Proxy(ProxyDescriptor::Link(_)) => {
                vec![ListenSpec::lan_tcp(default_socks_port(kind))]
            }
            Descriptor::Proxy(ProxyDescriptor::Json(json)) => json.inbound_ports(),
            Descriptor::Tunnel(tor) => tor
                .socks_port()
                .map(ListenSpec::lan_tcp)
                .into_iter()
                .collect(),
            Descriptor::Dpi(_) => Vec::new(),
        }
    }

    /// Addresses assigned to the tunnel interface, if any
    pub fn tunnel_addresses(&self) -> Vec<String> {
        match self {
            Descriptor::Vpn(VpnDescriptor::Wireguard(wg)) => wg.interface.addresses.clone(),
            _ => Vec::new(),
        }
    }

    /// Every secret slot this descriptor references
    pub fn secret_refs(&self) -> Vec<&SecretRef> {
        let mut refs = Vec::new();
        match self {
            Descriptor::Vpn(VpnDescriptor::Wireguard(wg)) => {
                refs.push(&wg.interface.private_key);
                refs.extend(wg.peers.iter().filter_map(|p| p.preshared_key.as_ref()));
            }
            Descriptor::Vpn(VpnDescriptor::Openvpn(ovpn)) => {
                refs.extend(ovpn.inline.iter().filter_map(|b| match &b.content {
                    BlockContent::Secret(slot) => Some(slot),
                    BlockContent::Public(_) => None,
                }));
            }
            Descriptor::Proxy(ProxyDescriptor::Link(link)) => refs.push(&link.credential),
            Descriptor::Proxy(ProxyDescriptor::Json(json)) => refs.extend(json.secrets.iter()),
            Descriptor::Tunnel(tor) => refs.extend(tor.control_password.iter()),
            Descriptor::Dpi(_) => {}
        }
        refs
    }
}

/// Local SOCKS inbound opened for link-based proxies
pub fn default_socks_port(kind: ProtocolKind) -> u16 {
    match kind {
        ProtocolKind::Shadowsocks => 1080,
        ProtocolKind::Trojan => 10809,
        ProtocolKind::Hysteria2 => 10810,
        _ => 10808,
    }
}

// ---------------------------------------------------------------------------
// WireGuard / AmneziaWG
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireGuardConfig {
    pub interface: WgInterface,
    pub peers: Vec<WgPeer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WgInterface {
    pub private_key: SecretRef,
    pub addresses: Vec<String>,
    pub dns: Vec<String>,
    pub listen_port: Option<u16>,
    pub mtu: Option<u16>,
    /// AmneziaWG junk/header obfuscation parameters
    pub obfuscation: Option<AmneziaParams>,
    /// Keys we do not interpret, in declaration order
    pub extra: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WgPeer {
    pub public_key: String,
    pub preshared_key: Option<SecretRef>,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    pub persistent_keepalive: Option<u16>,
    pub extra: Vec<(String, String)>,
}

/// AmneziaWG obfuscation knobs (`Jc`, `Jmin`, `Jmax`, `S1`, `S2`, `H1`-`H4`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmneziaParams {
    pub jc: Option<u32>,
    pub jmin: Option<u32>,
    pub jmax: Option<u32>,
    pub s1: Option<u32>,
    pub s2: Option<u32>,
    pub h1: Option<u32>,
    pub h2: Option<u32>,
    pub h3: Option<u32>,
    pub h4: Option<u32>,
}

impl AmneziaParams {
    /// INI key names, in canonical order
    pub const KEYS: [&'static str; 9] = ["Jc", "Jmin", "Jmax", "S1", "S2", "H1", "H2", "H3", "H4"];

    pub fn slot_mut(&mut self, key: &str) -> Option<&mut Option<u32>> {
        match key.to_ascii_lowercase().as_str() {
            "jc" => Some(&mut self.jc),
            "jmin" => Some(&mut self.jmin),
            "jmax" => Some(&mut self.jmax),
            "s1" => Some(&mut self.s1),
            "s2" => Some(&mut self.s2),
            "h1" => Some(&mut self.h1),
            "h2" => Some(&mut self.h2),
            "h3" => Some(&mut self.h3),
            "h4" => Some(&mut self.h4),
            _ => None,
        }
    }

    /// Set values paired with their INI key
    pub fn entries(&self) -> Vec<(&'static str, u32)> {
        let values = [
            self.jc, self.jmin, self.jmax, self.s1, self.s2, self.h1, self.h2, self.h3, self.h4,
        ];
        Self::KEYS
            .iter()
            .zip(values)
            .filter_map(|(k, v)| v.map(|v| (*k, v)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// OpenVPN
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenVpnConfig {
    pub client: bool,
    pub dev: String,
    pub proto: String,
    pub remotes: Vec<OvpnRemote>,
    pub cipher: Option<String>,
    pub auth: Option<String>,
    pub auth_user_pass: bool,
    /// Remaining directives in declaration order
    pub directives: Vec<OvpnDirective>,
    pub inline: Vec<InlineBlock>,
}

impl OpenVpnConfig {
    /// Listen socket when the config binds a local port (`port`/`lport`)
    fn local_port(&self) -> Option<ListenSpec> {
        if self.directives.iter().any(|d| d.name == "nobind") {
            return None;
        }
        let port = self
            .directives
            .iter()
            .find(|d| d.name == "lport" || d.name == "port")
            .and_then(|d| d.args.first())
            .and_then(|p| p.parse::<u16>().ok())?;
        let transport = if self.proto.starts_with("tcp") {
            Transport::Tcp
        } else {
            Transport::Udp
        };
        Some(ListenSpec {
            port,
            transport,
            exposure: crate::model::Exposure::Wan,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OvpnRemote {
    pub host: String,
    pub port: u16,
    pub proto: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OvpnDirective {
    pub name: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineBlock {
    pub tag: String,
    pub content: BlockContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockContent {
    /// Certificates and other non-sensitive material
    Public(String),
    Secret(SecretRef),
}

// ---------------------------------------------------------------------------
// Proxy links and JSON cores
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkScheme {
    Vless,
    Vmess,
    Trojan,
    Shadowsocks,
    Hysteria2,
}

impl LinkScheme {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            LinkScheme::Vless | LinkScheme::Vmess => ProtocolKind::Xray,
            LinkScheme::Trojan => ProtocolKind::Trojan,
            LinkScheme::Shadowsocks => ProtocolKind::Shadowsocks,
            LinkScheme::Hysteria2 => ProtocolKind::Hysteria2,
        }
    }

    /// URL scheme used when re-serializing
    pub fn prefix(&self) -> &'static str {
        match self {
            LinkScheme::Vless => "vless",
            LinkScheme::Vmess => "vmess",
            LinkScheme::Trojan => "trojan",
            LinkScheme::Shadowsocks => "ss",
            LinkScheme::Hysteria2 => "hysteria2",
        }
    }
}

/// A share-link proxy endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyLink {
    pub scheme: LinkScheme,
    pub server: String,
    pub port: u16,
    /// UUID, password or auth string
    pub credential: SecretRef,
    /// Shadowsocks cipher
    pub method: Option<String>,
    pub name: Option<String>,
    /// Transport/security parameters (`type`, `security`, `sni`, `pbk`, ...)
    pub params: BTreeMap<String, String>,
}

impl ProxyLink {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JsonEngine {
    Xray,
    SingBox,
}

/// Full xray / sing-box JSON config with credential values lifted out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonProxyConfig {
    pub engine: JsonEngine,
    /// Document with secret values replaced by `null`
    pub document: serde_json::Value,
    /// JSON pointers of the lifted values; each is also its slot name
    pub secrets: Vec<SecretRef>,
}

impl JsonProxyConfig {
    fn inbound_ports(&self) -> Vec<ListenSpec> {
        let key = match self.engine {
            JsonEngine::Xray => "port",
            JsonEngine::SingBox => "listen_port",
        };
        let mut ports: Vec<ListenSpec> = self
            .document
            .get("inbounds")
            .and_then(|v| v.as_array())
            .map(|inbounds| {
                inbounds
                    .iter()
                    .filter_map(|ib| ib.get(key))
                    .filter_map(|p| {
                        p.as_u64()
                            .or_else(|| p.as_str().and_then(|s| s.parse().ok()))
                    })
                    .filter_map(|p| u16::try_from(p).ok())
                    .map(ListenSpec::lan_tcp)
                    .collect()
            })
            .unwrap_or_default();
        ports.sort();
        ports.dedup();
        ports
    }
}

// ---------------------------------------------------------------------------
// Tor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorConfig {
    /// `SOCKSPort` value as written (`9050`, `127.0.0.1:9050`)
    pub socks: String,
    pub control_port: Option<u16>,
    /// `HashedControlPassword`
    pub control_password: Option<SecretRef>,
    pub directives: Vec<(String, String)>,
}

impl TorConfig {
    pub fn socks_port(&self) -> Option<u16> {
        let port = self.socks.split_whitespace().next()?;
        let port = port.rsplit(':').next()?;
        port.parse().ok().filter(|p| *p != 0)
    }
}

// ---------------------------------------------------------------------------
// DPI evasion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DpiTool {
    Zapret,
    Byedpi,
    Goodbyedpi,
}

impl DpiTool {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            DpiTool::Zapret => ProtocolKind::Zapret,
            DpiTool::Byedpi => ProtocolKind::Byedpi,
            DpiTool::Goodbyedpi => ProtocolKind::Goodbyedpi,
        }
    }

    pub fn from_kind(kind: ProtocolKind) -> Option<Self> {
        match kind {
            ProtocolKind::Zapret => Some(DpiTool::Zapret),
            ProtocolKind::Byedpi => Some(DpiTool::Byedpi),
            ProtocolKind::Goodbyedpi => Some(DpiTool::Goodbyedpi),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DpiConfig {
    pub tool: DpiTool,
    pub args: Vec<DpiArg>,
}

/// `--flag` or `--key value`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DpiArg {
    pub flag: String,
    pub value: Option<String>,
}

impl DpiConfig {
    /// Flattened argv
    pub fn argv(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.args.len() * 2);
        for arg in &self.args {
            out.push(arg.flag.clone());
            if let Some(v) = &arg.value {
                out.push(v.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tor_socks_port() {
        let mut tor = TorConfig {
            socks: "9050".into(),
            control_port: None,
            control_password: None,
            directives: vec![],
        };
        assert_eq!(tor.socks_port(), Some(9050));

        tor.socks = "127.0.0.1:9150 IsolateDestAddr".into();
        assert_eq!(tor.socks_port(), Some(9150));

        tor.socks = "0".into();
        assert_eq!(tor.socks_port(), None);
    }

    #[test]
    fn test_json_inbound_ports() {
        let cfg = JsonProxyConfig {
            engine: JsonEngine::SingBox,
            document: serde_json::json!({
                "inbounds": [
                    {"type": "mixed", "listen_port": 2080},
                    {"type": "socks", "listen_port": "1080"}
                ]
            }),
            secrets: vec![],
        };
        let ports: Vec<u16> = cfg.inbound_ports().iter().map(|l| l.port).collect();
        assert_eq!(ports, vec![1080, 2080]);
    }

    #[test]
    fn test_amnezia_entries_order() {
        let mut p = AmneziaParams::default();
        *p.slot_mut("H1").unwrap() = Some(7);
        *p.slot_mut("jc").unwrap() = Some(4);
        assert_eq!(p.entries(), vec![("Jc", 4), ("H1", 7)]);
    }
}
