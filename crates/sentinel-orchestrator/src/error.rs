//! Orchestrator error taxonomy and its wire codes.

use crate::store::StoreError;
use sentinel_network::{DnsSwitchError, PolicyApplyError};
use sentinel_protocols::{InvalidName, LaunchError, ParseError, UnknownKind};
use sentinel_supervisor::SupervisorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("{0}")]
    Start(String),

    #[error("{0}")]
    Stop(String),

    #[error("firewall: {0}")]
    PolicyApply(#[from] PolicyApplyError),

    #[error("dns: {0}")]
    DnsSwitch(#[from] DnsSwitchError),

    #[error("{0}")]
    ResourceLimit(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no such instance: {0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0} timed out")]
    Timeout(String),
}

impl OrchestratorError {
    /// Stable identifier clients switch on
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::Parse(_) => "parse_error",
            OrchestratorError::Start(_) => "start_error",
            OrchestratorError::Stop(_) => "stop_error",
            OrchestratorError::PolicyApply(_) => "policy_apply_error",
            OrchestratorError::DnsSwitch(_) => "dns_switch_error",
            OrchestratorError::ResourceLimit(_) => "resource_limit_error",
            OrchestratorError::Store(_) => "store_unavailable",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::InvalidRequest(_) => "invalid_request",
            OrchestratorError::Timeout(_) => "timeout",
        }
    }
}

/// Process exit status for a wire code (`sentinel ctl`)
pub fn exit_code(code: Option<&str>) -> i32 {
    match code {
        None => 0,
        Some("parse_error") => 2,
        Some("start_error") => 3,
        Some("stop_error") => 4,
        Some("policy_apply_error") => 5,
        Some("dns_switch_error") => 6,
        Some("resource_limit_error") => 7,
        Some("store_unavailable") => 8,
        Some("not_found") => 9,
        Some("invalid_request") => 10,
        Some("timeout") => 11,
        Some(_) => 1,
    }
}

impl From<SupervisorError> for OrchestratorError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::UnknownInstance(name) => OrchestratorError::NotFound(name),
            SupervisorError::Start(e) if e.is_resource_limit() => {
                OrchestratorError::ResourceLimit(e.to_string())
            }
            SupervisorError::Start(e) => OrchestratorError::Start(e.to_string()),
            SupervisorError::Stop(e) => OrchestratorError::Stop(e.to_string()),
            SupervisorError::Timeout {
                instance,
                operation,
            } => OrchestratorError::Timeout(format!("{operation} of {instance}")),
            SupervisorError::Busy(name) => {
                OrchestratorError::InvalidRequest(format!("instance {name} is still active"))
            }
            other @ (SupervisorError::WorkerGone(_) | SupervisorError::Thread(_)) => {
                OrchestratorError::Start(other.to_string())
            }
        }
    }
}

impl From<LaunchError> for OrchestratorError {
    fn from(err: LaunchError) -> Self {
        OrchestratorError::Start(err.to_string())
    }
}

impl From<InvalidName> for OrchestratorError {
    fn from(err: InvalidName) -> Self {
        OrchestratorError::InvalidRequest(err.to_string())
    }
}

impl From<UnknownKind> for OrchestratorError {
    fn from(err: UnknownKind) -> Self {
        OrchestratorError::InvalidRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_have_distinct_exit_statuses() {
        let errors = [
            OrchestratorError::Parse(ParseError::at(0, "empty")),
            OrchestratorError::Start("x".into()),
            OrchestratorError::Stop("x".into()),
            OrchestratorError::PolicyApply(PolicyApplyError::Validation("x".into())),
            OrchestratorError::DnsSwitch(DnsSwitchError::Timeout("canary query")),
            OrchestratorError::ResourceLimit("x".into()),
            OrchestratorError::Store(StoreError::Unavailable("x".into())),
            OrchestratorError::NotFound("x".into()),
            OrchestratorError::InvalidRequest("x".into()),
            OrchestratorError::Timeout("x".into()),
        ];
        let mut seen: Vec<i32> = errors.iter().map(|e| exit_code(Some(e.code()))).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), errors.len());
        assert!(!seen.contains(&0));
        assert_eq!(exit_code(None), 0);
    }

    #[test]
    fn test_supervisor_mapping() {
        let err: OrchestratorError = SupervisorError::UnknownInstance("wg0".into()).into();
        assert_eq!(err.code(), "not_found");
        let err: OrchestratorError = SupervisorError::Busy("wg0".into()).into();
        assert_eq!(err.code(), "invalid_request");
    }
}
