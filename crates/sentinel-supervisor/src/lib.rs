//! Sentinel Supervisor - Daemon Lifecycle Management
//!
//! One worker thread per protocol instance, one poller for everybody:
//!
//! ```text
//!  Supervisor ──Command──▶ worker "xray-main" ──▶ sleep/xray/tor process group
//!      │                   worker "wg-home"   ──▶ wg-quick up / down
//!      │                          ▲
//!      └── poller ──Sample────────┘   (liveness + RSS/CPU every interval)
//! ```
//!
//! - Commands to one instance are serialized by its worker
//! - Daemons run in their own process group (SIGTERM, then SIGKILL)
//! - Memory/CPU limits via cgroup v2, joined before exec
//! - An unexpected exit is retried once, then the instance parks in `error`
//! - Worker panics are caught and reported as events

mod error;
mod limits;
mod message;
mod metrics;
mod poller;
mod process;
mod supervisor;
mod worker;

pub use error::{
    ResourceLimitError, StartCause, StartError, StopCause, StopError, SupervisorError,
};
pub use limits::{CgroupLeaf, CgroupLimiter, DEFAULT_CGROUP_ROOT, LimitPlan};
pub use message::{StartOutcome, StopOutcome, SupervisorEvent};
pub use metrics::{ProcessSample, ProcessSampler};
pub use supervisor::{Supervisor, SupervisorConfig};
