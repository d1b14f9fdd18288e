//! Sentinel Network - Firewall Policy, DNS Chain and Leak Testing
//!
//! The parts of the orchestrator that change process-wide network state:
//!
//! - [`firewall`]: synthesizes an nftables policy from the active protocol
//!   set plus routing rules, and applies it as one transaction
//! - [`dns`]: brings up single or chained local resolvers, switching only
//!   after a canary query succeeds
//! - [`leaktest`]: compares the privacy resolution path with the raw one
//!
//! Kernel and network access sits behind traits ([`FirewallBackend`],
//! [`ResolverRuntime`], [`CanaryProbe`], [`PathResolver`]) so everything
//! above them runs against fakes in tests.

pub mod dns;
pub mod firewall;
pub mod leaktest;

pub use dns::{
    CanaryProbe, DnsChainManager, DnsChainState, DnsMode, DnsSettings, DnsSwitchError,
    HickoryCanary, ResolverRuntime, ResolverStage, StageError, StageHealth,
};
pub use firewall::{
    AppliedPolicy, BackendError, Firewall, FirewallBackend, FirewallPolicy, FirewallSettings,
    NftBackend, PolicyApplyError, RoutingConfig, synthesize,
};
pub use leaktest::{
    DnssecStatus, DomainProbe, EgressProbe, EgressReport, HickoryPathResolver, LeakContext,
    LeakKind, LeakTestEngine, LeakTestResult, LeakTestSettings, PathResolver, RouteEgressProbe,
    is_leak,
};
