//! Message types for supervisor communication.

use crate::error::{StartError, StopError, SupervisorError};
use crate::metrics::ProcessSample;
use crossbeam_channel::Sender;
use sentinel_protocols::{LaunchSpec, ResourceLimits, RuntimeState};

/// Commands sent to an instance worker. Each worker handles its commands
/// one at a time, which serializes all control calls on that instance.
#[derive(Debug)]
pub(crate) enum Command {
    Start {
        spec: LaunchSpec,
        limits: ResourceLimits,
        reply: Sender<Result<StartOutcome, StartError>>,
    },
    Stop {
        reply: Sender<Result<StopOutcome, StopError>>,
    },
    Restart {
        spec: LaunchSpec,
        limits: ResourceLimits,
        reply: Sender<Result<StartOutcome, SupervisorError>>,
    },
    /// Periodic liveness check with the poller's resource sample
    Sample { sample: Option<ProcessSample> },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new process (or tunnel) was brought up
    Started { pid: Option<u32> },
    /// Nothing to do, it is already up
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited after the graceful signal
    Stopped,
    /// Did not exit within the stop timeout and was force-killed
    Killed,
    /// Nothing was running
    AlreadyStopped,
}

/// Notifications published by instance workers
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    StateChanged {
        instance: String,
        from: RuntimeState,
        to: RuntimeState,
    },
    UnexpectedExit {
        instance: String,
        reason: String,
    },
    /// Automatic retry after an unexpected exit
    Retrying { instance: String, attempt: u32 },
    /// Retry budget exhausted; waiting for an explicit start
    Parked { instance: String, reason: String },
    WorkerPanicked { instance: String, error: String },
}
