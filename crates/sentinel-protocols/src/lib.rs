//! Sentinel Protocols - Protocol Model, Config Parser and Launch Recipes
//!
//! Everything the orchestrator knows about a network-privacy daemon before
//! it is started:
//!
//! ```text
//! raw text ──▶ parser ──▶ Descriptor + SecretBundle ──▶ ProtocolInstance
//!                              │                              │
//!                              ▼                              ▼
//!                         render (canonical)     optimizer + launch ──▶ LaunchSpec
//! ```
//!
//! # Supported protocols
//!
//! - **VPN**: WireGuard, AmneziaWG, OpenVPN
//! - **Proxy**: xray (VLESS/VMess), Shadowsocks, Trojan, sing-box, Hysteria2
//! - **Tunnel**: Tor
//! - **DPI evasion**: zapret, byedpi, GoodbyeDPI
//!
//! # Security
//!
//! - Secret material is kept in a [`SecretBundle`] apart from descriptors
//! - `Debug` output of secrets is redacted

mod descriptor;
mod launch;
mod model;
mod optimizer;
mod parser;
mod render;
mod secrets;

pub use descriptor::{
    AmneziaParams, BlockContent, Descriptor, DpiArg, DpiConfig, DpiTool, InlineBlock, JsonEngine,
    JsonProxyConfig, LinkScheme, OpenVpnConfig, OvpnDirective, OvpnRemote, ProxyDescriptor,
    ProxyLink, TorConfig, VpnDescriptor, WgInterface, WgPeer, WireGuardConfig, default_socks_port,
};
pub use launch::{
    Binaries, LaunchContext, LaunchError, LaunchMode, LaunchSpec, RenderedFile, interface_name,
    launch_spec,
};
pub use model::{
    Category, Exposure, InvalidName, IoClass, ListenSpec, MetricsSnapshot, OptimizationFlags,
    ProtocolInstance, ProtocolKind, ResourceLimits, RuntimeState, RuntimeStatus, Transport,
    UnknownKind, validate_name,
};
pub use optimizer::{Eligibility, HostTopology, count_rx_queues, optimize};
pub use parser::{ParseError, ParsedConfig, parse_config};
pub use render::render;
pub use secrets::{KeyError, MissingSecret, Secret, SecretBundle, SecretRef, validate_wg_key};
