//! Sentinel Orchestrator - Protocol & Network-Policy Orchestrator
//!
//! Ties the subsystems together behind one control surface:
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!  socket ──▶│ control ─▶ Orchestrator (core)               │
//!            │              │        │        │        │    │
//!            │      Supervisor  Firewall  DnsChain  LeakTest│
//!            │              │                               │
//!            │            Store (state.json)                │
//!            └──────────────────────────────────────────────┘
//! ```
//!
//! The `sentinel` binary wires real backends (`nft`, `dnsproxy`, hickory
//! resolvers); tests wire in-memory ones through [`Services`].

pub mod config;
pub mod control;
pub mod core;
pub mod dns_runtime;
pub mod error;
pub mod protocol;
pub mod store;

pub use config::{ConfigError, DEFAULT_CONFIG_PATH, OrchestratorConfig};
pub use control::{ControlError, ControlServer};
pub use core::{LocalChainPath, Orchestrator, PrivacyPath, Services};
pub use dns_runtime::SupervisedResolvers;
pub use error::{OrchestratorError, exit_code};
pub use protocol::{ControlAction, Request, Response, SaveRequest};
pub use store::{FileStore, MemoryStore, Store, StoreError, StoreExt};
