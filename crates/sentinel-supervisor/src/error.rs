//! Supervisor error taxonomy.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Limits could not be put in place; the start is aborted
#[derive(Debug, Error)]
pub enum ResourceLimitError {
    #[error("cgroup controller '{0}' is not available")]
    ControllerUnavailable(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("failed to configure {path}: {source}")]
    Cgroup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Why a start failed
#[derive(Debug, Error)]
pub enum StartCause {
    #[error("failed to write {path}: {source}")]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("resource limits: {0}")]
    ResourceLimit(#[from] ResourceLimitError),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("exited during startup ({status})")]
    ExitedEarly { status: String },

    #[error("setup command failed ({status}): {stderr}")]
    SetupFailed { status: String, stderr: String },

    #[error("setup command did not finish in time")]
    SetupTimeout,
}

#[derive(Debug, Error)]
#[error("failed to start {instance}: {cause}")]
pub struct StartError {
    pub instance: String,
    pub cause: StartCause,
}

impl StartError {
    /// Was the start aborted because limits could not be enforced?
    pub fn is_resource_limit(&self) -> bool {
        matches!(self.cause, StartCause::ResourceLimit(_))
    }
}

/// Why a stop failed
#[derive(Debug, Error)]
pub enum StopCause {
    #[error("signal delivery failed: {0}")]
    Signal(#[from] nix::errno::Errno),

    #[error("failed to reap process: {0}")]
    Wait(#[from] io::Error),

    #[error("teardown command failed ({status}): {stderr}")]
    Teardown { status: String, stderr: String },

    #[error("teardown command did not finish in time")]
    TeardownTimeout,
}

#[derive(Debug, Error)]
#[error("failed to stop {instance}: {cause}")]
pub struct StopError {
    pub instance: String,
    pub cause: StopCause,
}

/// Errors returned by the [`Supervisor`](crate::Supervisor) handle
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Stop(#[from] StopError),

    #[error("{operation} of {instance} timed out")]
    Timeout {
        instance: String,
        operation: &'static str,
    },

    #[error("worker for {0} is gone")]
    WorkerGone(String),

    #[error("instance {0} is still active")]
    Busy(String),

    #[error("failed to spawn thread: {0}")]
    Thread(#[source] io::Error),
}
