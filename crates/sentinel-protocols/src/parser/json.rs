//! xray / sing-box JSON document parsing.

use super::{ParseError, Parsed, lines_with_offsets};
use crate::descriptor::{Descriptor, JsonEngine, JsonProxyConfig, ProxyDescriptor};
use crate::model::ProtocolKind;
use crate::secrets::{SecretBundle, SecretRef};
use serde_json::Value;

/// Object keys whose string values are credentials
const SECRET_KEYS: [&str; 10] = [
    "password",
    "id",
    "uuid",
    "private_key",
    "privateKey",
    "pre_shared_key",
    "preSharedKey",
    "psk",
    "auth_str",
    "secretKey",
];

fn byte_offset(text: &str, line: usize, column: usize) -> usize {
    lines_with_offsets(text)
        .nth(line.saturating_sub(1))
        .map(|(start, _)| start + column.saturating_sub(1))
        .unwrap_or(text.len())
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Replace credential values with `null`, recording their JSON pointers
fn lift_secrets(value: &mut Value, pointer: &str, secrets: &mut SecretBundle, refs: &mut Vec<SecretRef>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                let path = format!("{}/{}", pointer, escape_pointer(key));
                if SECRET_KEYS.contains(&key.as_str()) {
                    if let Value::String(s) = child {
                        refs.push(secrets.insert(path, std::mem::take(s)));
                        *child = Value::Null;
                        continue;
                    }
                }
                lift_secrets(child, &path, secrets, refs);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter_mut().enumerate() {
                lift_secrets(child, &format!("{}/{}", pointer, i), secrets, refs);
            }
        }
        _ => {}
    }
}

fn detect_engine(doc: &Value) -> JsonEngine {
    let entries = ["outbounds", "inbounds"]
        .iter()
        .filter_map(|k| doc.get(*k).and_then(Value::as_array))
        .flatten();
    for entry in entries {
        if entry.get("protocol").is_some() {
            return JsonEngine::Xray;
        }
        if entry.get("type").is_some() {
            return JsonEngine::SingBox;
        }
    }
    if doc.get("inbounds").is_some() {
        JsonEngine::Xray
    } else {
        JsonEngine::SingBox
    }
}

pub(super) fn parse(text: &str, hint: Option<ProtocolKind>) -> Parsed {
    let mut doc: Value = serde_json::from_str(text).map_err(|e| {
        ParseError::at(byte_offset(text, e.line(), e.column()), format!("invalid JSON: {}", e))
    })?;

    if !doc.is_object() {
        return Err(ParseError::at(0, "JSON config must be an object"));
    }
    let has_array = |k: &str| doc.get(k).is_some_and(Value::is_array);
    if !has_array("inbounds") && !has_array("outbounds") {
        return Err(ParseError::at(0, "JSON config has no inbounds or outbounds"));
    }

    let engine = match hint {
        Some(ProtocolKind::SingBox) => JsonEngine::SingBox,
        Some(ProtocolKind::Xray) => JsonEngine::Xray,
        _ => detect_engine(&doc),
    };

    let mut secrets = SecretBundle::new();
    let mut refs = Vec::new();
    lift_secrets(&mut doc, "", &mut secrets, &mut refs);

    let config = JsonProxyConfig {
        engine,
        document: doc,
        secrets: refs,
    };
    Ok((Descriptor::Proxy(ProxyDescriptor::Json(config)), secrets))
}
