//! Share-link parsing (`scheme://credential@host:port?params#name`).

use super::{ParseError, Parsed, decode_base64_lenient, wireguard};
use crate::descriptor::{
    AmneziaParams, Descriptor, LinkScheme, ProxyDescriptor, ProxyLink, VpnDescriptor,
    WgInterface, WgPeer, WireGuardConfig,
};
use crate::secrets::{SecretBundle, validate_wg_key};
use percent_encoding::percent_decode_str;
use std::collections::BTreeMap;
use url::Url;

/// Slot used for the single credential of a link
pub(crate) const CREDENTIAL_SLOT: &str = "credential";

pub(super) fn parse(text: &str) -> Parsed {
    let lead = text.len() - text.trim_start().len();
    let link = text.trim();

    if link.contains(char::is_whitespace) {
        return Err(ParseError::at(lead, "share links must be a single line"));
    }
    let Some((scheme, body)) = link.split_once("://") else {
        return Err(ParseError::at(lead, "not a share link"));
    };
    let body_offset = lead + scheme.len() + 3;

    let result = match scheme.to_ascii_lowercase().as_str() {
        "vless" => authority_link(link, LinkScheme::Vless),
        "trojan" => authority_link(link, LinkScheme::Trojan),
        "hysteria2" | "hy2" => authority_link(link, LinkScheme::Hysteria2),
        "ss" => shadowsocks(link, body),
        "vmess" => vmess(body),
        "wireguard" | "wg" => wireguard_link(link),
        "amnezia" => amnezia(body),
        other => Err(ParseError::at(0, format!("unsupported link scheme '{}'", other))),
    };
    result.map_err(|e| e.shifted(body_offset))
}

/// Host, port and percent-decoded pieces of an authority-style link
struct Authority {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    params: BTreeMap<String, String>,
    name: Option<String>,
}

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

fn authority(link: &str) -> Result<Authority, ParseError> {
    let url = Url::parse(link).map_err(|e| ParseError::at(0, format!("malformed link: {}", e)))?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ParseError::at(0, "link has no server address"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let port = url
        .port()
        .ok_or_else(|| ParseError::at(0, "link has no server port"))?;

    let params = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let name = url.fragment().map(decode).filter(|n| !n.is_empty());

    Ok(Authority {
        host,
        port,
        user: decode(url.username()),
        password: url.password().map(decode),
        params,
        name,
    })
}

fn authority_link(link: &str, scheme: LinkScheme) -> Parsed {
    let mut auth = authority(link)?;

    let credential = match (auth.user.is_empty(), auth.password.take()) {
        (false, Some(pass)) => format!("{}:{}", auth.user, pass),
        (false, None) => auth.user.clone(),
        (true, _) if scheme == LinkScheme::Hysteria2 => auth
            .params
            .remove("auth")
            .filter(|a| !a.is_empty())
            .ok_or_else(|| ParseError::at(0, "hysteria2 link has no auth"))?,
        (true, _) => return Err(ParseError::at(0, "link has no credential")),
    };

    let mut secrets = SecretBundle::new();
    let credential = secrets.insert(CREDENTIAL_SLOT, credential);
    let link = ProxyLink {
        scheme,
        server: auth.host,
        port: auth.port,
        credential,
        method: None,
        name: auth.name,
        params: auth.params,
    };
    Ok((Descriptor::Proxy(ProxyDescriptor::Link(link)), secrets))
}

fn method_password(method: String, password: String) -> Result<(String, String), ParseError> {
    if method.is_empty() || password.is_empty() {
        return Err(ParseError::at(
            0,
            "shadowsocks credentials must be method:password",
        ));
    }
    Ok((method, password))
}

fn split_method(decoded: &str) -> Result<(String, String), ParseError> {
    let (method, password) = decoded.split_once(':').unwrap_or((decoded, ""));
    method_password(method.to_string(), password.to_string())
}

fn shadowsocks(link: &str, body: &str) -> Parsed {
    let (method, password, auth) = if body.split('#').next().unwrap_or("").contains('@') {
        // SIP002: ss://base64(method:password)@host:port or plain method:password
        let mut auth = authority(link)?;
        let (method, password) = match auth.password.take() {
            Some(pass) => method_password(auth.user.clone(), pass)?,
            None => {
                let raw = decode_base64_lenient(&auth.user)
                    .ok_or_else(|| ParseError::at(0, "shadowsocks userinfo is not base64"))?;
                split_method(&String::from_utf8_lossy(&raw))?
            }
        };
        (method, password, auth)
    } else {
        // Legacy: ss://base64(method:password@host:port)#name
        let (encoded, fragment) = match body.split_once('#') {
            Some((e, f)) => (e, Some(f)),
            None => (body, None),
        };
        let raw = decode_base64_lenient(encoded)
            .ok_or_else(|| ParseError::at(0, "shadowsocks link is not base64"))?;
        let decoded = String::from_utf8_lossy(&raw).into_owned();
        let (creds, hostport) = decoded
            .rsplit_once('@')
            .ok_or_else(|| ParseError::at(0, "shadowsocks link has no server"))?;
        let (method, password) = split_method(creds)?;
        let rebuilt = format!(
            "ss://x@{}{}",
            hostport,
            fragment.map(|f| format!("#{}", f)).unwrap_or_default()
        );
        (method, password, authority(&rebuilt)?)
    };

    let mut secrets = SecretBundle::new();
    let credential = secrets.insert(CREDENTIAL_SLOT, password);
    let link = ProxyLink {
        scheme: LinkScheme::Shadowsocks,
        server: auth.host,
        port: auth.port,
        credential,
        method: Some(method),
        name: auth.name,
        params: auth.params,
    };
    Ok((Descriptor::Proxy(ProxyDescriptor::Link(link)), secrets))
}

/// Keys of the vmess JSON payload that map onto dedicated fields
const VMESS_FIELDS: [&str; 5] = ["v", "ps", "add", "port", "id"];

fn json_scalar(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn vmess(body: &str) -> Parsed {
    let encoded = body.split('#').next().unwrap_or(body);
    let raw = decode_base64_lenient(encoded)
        .ok_or_else(|| ParseError::at(0, "vmess payload is not base64"))?;
    let doc: serde_json::Value = serde_json::from_slice(&raw)
        .map_err(|e| ParseError::at(0, format!("vmess payload is not JSON: {}", e)))?;
    let obj = doc
        .as_object()
        .ok_or_else(|| ParseError::at(0, "vmess payload is not an object"))?;

    let server = obj
        .get("add")
        .and_then(json_scalar)
        .ok_or_else(|| ParseError::at(0, "vmess payload has no server (add)"))?;
    let port = obj
        .get("port")
        .and_then(json_scalar)
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or_else(|| ParseError::at(0, "vmess payload has no valid port"))?;
    let id = obj
        .get("id")
        .and_then(json_scalar)
        .ok_or_else(|| ParseError::at(0, "vmess payload has no id"))?;

    let params = obj
        .iter()
        .filter(|(k, _)| !VMESS_FIELDS.contains(&k.as_str()))
        .filter_map(|(k, v)| json_scalar(v).map(|v| (k.clone(), v)))
        .collect();

    let mut secrets = SecretBundle::new();
    let credential = secrets.insert(CREDENTIAL_SLOT, id);
    let link = ProxyLink {
        scheme: LinkScheme::Vmess,
        server,
        port,
        credential,
        method: None,
        name: obj.get("ps").and_then(json_scalar),
        params,
    };
    Ok((Descriptor::Proxy(ProxyDescriptor::Link(link)), secrets))
}

fn list(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn number<T: std::str::FromStr>(params: &BTreeMap<String, String>, key: &str) -> Result<Option<T>, ParseError> {
    params
        .get(key)
        .map(|v| {
            v.parse::<T>()
                .map_err(|_| ParseError::at(0, format!("invalid {} '{}'", key, v)))
        })
        .transpose()
}

fn wireguard_link(link: &str) -> Parsed {
    let auth = authority(link)?;
    if auth.user.is_empty() {
        return Err(ParseError::at(0, "wireguard link has no private key"));
    }
    validate_wg_key(&auth.user)
        .map_err(|e| ParseError::at(0, format!("invalid private key: {}", e)))?;

    let params = &auth.params;
    let public_key = params
        .get("publickey")
        .or_else(|| params.get("peer_public_key"))
        .cloned()
        .ok_or_else(|| ParseError::at(0, "wireguard link has no peer publickey"))?;
    validate_wg_key(&public_key)
        .map_err(|e| ParseError::at(0, format!("invalid public key: {}", e)))?;

    let mut secrets = SecretBundle::new();
    let private_key = secrets.insert(wireguard::PRIVATE_KEY_SLOT, auth.user.clone());
    let preshared_key = match params.get("presharedkey") {
        Some(psk) => {
            validate_wg_key(psk)
                .map_err(|e| ParseError::at(0, format!("invalid preshared key: {}", e)))?;
            Some(secrets.insert(wireguard::peer_psk_slot(0), psk.clone()))
        }
        None => None,
    };

    let mut obfuscation = AmneziaParams::default();
    let mut obfuscated = false;
    for key in AmneziaParams::KEYS {
        let lower = key.to_ascii_lowercase();
        if let Some(value) = number::<u32>(params, &lower)? {
            if let Some(slot) = obfuscation.slot_mut(key) {
                *slot = Some(value);
                obfuscated = true;
            }
        }
    }

    let mut allowed_ips = list(params.get("allowedips"));
    if allowed_ips.is_empty() {
        allowed_ips = vec!["0.0.0.0/0".to_string(), "::/0".to_string()];
    }
    let host = if auth.host.contains(':') {
        format!("[{}]", auth.host)
    } else {
        auth.host.clone()
    };

    let config = WireGuardConfig {
        interface: WgInterface {
            private_key,
            addresses: list(params.get("address")),
            dns: list(params.get("dns")),
            listen_port: None,
            mtu: number(params, "mtu")?,
            obfuscation: obfuscated.then_some(obfuscation),
            extra: Vec::new(),
        },
        peers: vec![WgPeer {
            public_key,
            preshared_key,
            endpoint: Some(format!("{}:{}", host, auth.port)),
            allowed_ips,
            persistent_keepalive: number(params, "keepalive")?,
            extra: Vec::new(),
        }],
    };
    Ok((Descriptor::Vpn(VpnDescriptor::Wireguard(config)), secrets))
}

fn amnezia(body: &str) -> Parsed {
    let encoded = body.split('#').next().unwrap_or(body);
    let raw = decode_base64_lenient(encoded)
        .ok_or_else(|| ParseError::at(0, "amnezia payload is not base64"))?;
    let text = String::from_utf8(raw)
        .map_err(|_| ParseError::at(0, "amnezia payload is not UTF-8 text"))?;
    // Offsets inside the decoded payload do not map onto the link text.
    wireguard::parse(&text).map_err(|e| ParseError::at(0, format!("amnezia payload: {}", e.reason)))
}
