//! Control protocol: one JSON request in, one JSON response out.
//!
//! ```text
//! {"op":"control","name":"home","action":"start"}
//! {"success":true,"message":"home started (pid 4242)","data":{...}}
//! ```

use crate::error::OrchestratorError;
use sentinel_network::{DnsMode, LeakKind, RoutingConfig};
use sentinel_protocols::{ListenSpec, ResourceLimits};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Start,
    Stop,
    Restart,
}

/// Create or edit an instance.
///
/// With `config` the raw text is (re)parsed; without it only the listed
/// metadata of an existing instance changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveRequest {
    pub name: String,
    #[serde(default)]
    pub config: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
    #[serde(default)]
    pub listen: Option<Vec<ListenSpec>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Parse {
        config: String,
        #[serde(default)]
        hint: Option<String>,
    },
    Save(SaveRequest),
    Delete {
        name: String,
    },
    List,
    Control {
        name: String,
        action: ControlAction,
    },
    Status,
    DnsSwitch {
        mode: DnsMode,
    },
    DnsStatus,
    /// Apply `routing`, or re-apply the persisted one
    FirewallApply {
        #[serde(default)]
        routing: Option<RoutingConfig>,
    },
    FirewallStatus,
    LeakTest {
        kind: LeakKind,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            code: None,
            data: None,
        }
    }

    pub fn with_data<T: Serialize>(mut self, data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => self.data = Some(value),
            Err(e) => {
                self.message = format!("{} (data not encodable: {})", self.message, e);
            }
        }
        self
    }

    pub fn error(err: &OrchestratorError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            code: Some(err.code().to_string()),
            data: None,
        }
    }

    /// Request line that did not decode
    pub fn malformed(reason: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            message: format!("malformed request: {reason}"),
            code: Some("invalid_request".to_string()),
            data: None,
        }
    }
}

impl From<Result<Response, OrchestratorError>> for Response {
    fn from(result: Result<Response, OrchestratorError>) -> Self {
        result.unwrap_or_else(|e| Response::error(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let req: Request =
            serde_json::from_str(r#"{"op":"control","name":"home","action":"restart"}"#).unwrap();
        assert_eq!(
            req,
            Request::Control {
                name: "home".into(),
                action: ControlAction::Restart
            }
        );

        let req: Request = serde_json::from_str(r#"{"op":"firewall_apply"}"#).unwrap();
        assert_eq!(req, Request::FirewallApply { routing: None });

        let req: Request =
            serde_json::from_str(r#"{"op":"save","name":"home","config":"[Interface]"}"#).unwrap();
        assert!(matches!(req, Request::Save(SaveRequest { ref name, .. }) if name == "home"));

        let req: Request = serde_json::from_str(r#"{"op":"leak_test","kind":"webrtc"}"#).unwrap();
        assert_eq!(req, Request::LeakTest { kind: LeakKind::Webrtc });
    }

    #[test]
    fn test_error_response_carries_code() {
        let resp = Response::error(&OrchestratorError::NotFound("home".into()));
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "not_found");
        assert!(json.get("data").is_none());
    }
}
