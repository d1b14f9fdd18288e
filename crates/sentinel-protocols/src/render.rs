//! Canonical Re-serialization
//!
//! Turns a descriptor and its secrets back into configuration text. The
//! output is canonical (fixed key order, normalized spacing) and parses
//! back to an identical descriptor. The same text is what gets written to
//! disk for the daemons that consume their native format directly.

use crate::descriptor::{
    BlockContent, Descriptor, DpiConfig, JsonProxyConfig, LinkScheme, OpenVpnConfig, ProxyDescriptor,
    ProxyLink, TorConfig, VpnDescriptor, WireGuardConfig,
};
use crate::parser::quote;
use crate::secrets::{MissingSecret, SecretBundle};
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::fmt::Write as _;
use url::form_urlencoded;

/// Characters escaped in link userinfo and fragments
const LINK_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Render canonical configuration text
pub fn render(descriptor: &Descriptor, secrets: &SecretBundle) -> Result<String, MissingSecret> {
    match descriptor {
        Descriptor::Vpn(VpnDescriptor::Wireguard(wg)) => render_wireguard(wg, secrets),
        Descriptor::Vpn(VpnDescriptor::Openvpn(ovpn)) => render_openvpn(ovpn, secrets),
        Descriptor::Proxy(ProxyDescriptor::Link(link)) => render_link(link, secrets),
        Descriptor::Proxy(ProxyDescriptor::Json(json)) => render_json(json, secrets),
        Descriptor::Tunnel(tor) => render_torrc(tor, secrets),
        Descriptor::Dpi(dpi) => Ok(render_dpi(dpi)),
    }
}

pub(crate) fn render_wireguard(wg: &WireGuardConfig, secrets: &SecretBundle) -> Result<String, MissingSecret> {
    let mut out = String::new();
    let iface = &wg.interface;

    out.push_str("[Interface]\n");
    let _ = writeln!(out, "PrivateKey = {}", secrets.require(&iface.private_key)?);
    if !iface.addresses.is_empty() {
        let _ = writeln!(out, "Address = {}", iface.addresses.join(", "));
    }
    if !iface.dns.is_empty() {
        let _ = writeln!(out, "DNS = {}", iface.dns.join(", "));
    }
    if let Some(port) = iface.listen_port {
        let _ = writeln!(out, "ListenPort = {}", port);
    }
    if let Some(mtu) = iface.mtu {
        let _ = writeln!(out, "MTU = {}", mtu);
    }
    if let Some(params) = &iface.obfuscation {
        for (key, value) in params.entries() {
            let _ = writeln!(out, "{} = {}", key, value);
        }
    }
    for (key, value) in &iface.extra {
        let _ = writeln!(out, "{} = {}", key, value);
    }

    for peer in &wg.peers {
        out.push_str("\n[Peer]\n");
        let _ = writeln!(out, "PublicKey = {}", peer.public_key);
        if let Some(psk) = &peer.preshared_key {
            let _ = writeln!(out, "PresharedKey = {}", secrets.require(psk)?);
        }
        if let Some(endpoint) = &peer.endpoint {
            let _ = writeln!(out, "Endpoint = {}", endpoint);
        }
        if !peer.allowed_ips.is_empty() {
            let _ = writeln!(out, "AllowedIPs = {}", peer.allowed_ips.join(", "));
        }
        if let Some(keepalive) = peer.persistent_keepalive {
            let _ = writeln!(out, "PersistentKeepalive = {}", keepalive);
        }
        for (key, value) in &peer.extra {
            let _ = writeln!(out, "{} = {}", key, value);
        }
    }
    Ok(out)
}

fn render_openvpn(ovpn: &OpenVpnConfig, secrets: &SecretBundle) -> Result<String, MissingSecret> {
    let mut out = String::new();
    if ovpn.client {
        out.push_str("client\n");
    }
    let _ = writeln!(out, "dev {}", quote(&ovpn.dev));
    let _ = writeln!(out, "proto {}", quote(&ovpn.proto));
    for remote in &ovpn.remotes {
        let _ = write!(out, "remote {} {}", quote(&remote.host), remote.port);
        if let Some(proto) = &remote.proto {
            let _ = write!(out, " {}", quote(proto));
        }
        out.push('\n');
    }
    if let Some(cipher) = &ovpn.cipher {
        let _ = writeln!(out, "cipher {}", quote(cipher));
    }
    if let Some(auth) = &ovpn.auth {
        let _ = writeln!(out, "auth {}", quote(auth));
    }
    if ovpn.auth_user_pass {
        out.push_str("auth-user-pass\n");
    }
    for directive in &ovpn.directives {
        out.push_str(&directive.name);
        for arg in &directive.args {
            out.push(' ');
            out.push_str(&quote(arg));
        }
        out.push('\n');
    }
    for block in &ovpn.inline {
        let body = match &block.content {
            BlockContent::Public(text) => text.as_str(),
            BlockContent::Secret(slot) => secrets.require(slot)?,
        };
        let _ = writeln!(out, "<{}>", block.tag);
        if !body.is_empty() {
            let _ = writeln!(out, "{}", body);
        }
        let _ = writeln!(out, "</{}>", block.tag);
    }
    Ok(out)
}

fn host_for_url(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

fn render_link(link: &ProxyLink, secrets: &SecretBundle) -> Result<String, MissingSecret> {
    let credential = secrets.require(&link.credential)?;

    if link.scheme == LinkScheme::Vmess {
        let mut doc = serde_json::Map::new();
        doc.insert("v".into(), "2".into());
        doc.insert("ps".into(), link.name.clone().unwrap_or_default().into());
        doc.insert("add".into(), link.server.clone().into());
        doc.insert("port".into(), link.port.to_string().into());
        doc.insert("id".into(), credential.into());
        for (key, value) in &link.params {
            doc.insert(key.clone(), value.clone().into());
        }
        let payload = serde_json::Value::Object(doc).to_string();
        return Ok(format!("vmess://{}", STANDARD.encode(payload)));
    }

    let userinfo = match (&link.scheme, &link.method) {
        (LinkScheme::Shadowsocks, Some(method)) => {
            URL_SAFE_NO_PAD.encode(format!("{}:{}", method, credential))
        }
        _ => utf8_percent_encode(credential, LINK_ESCAPE).to_string(),
    };

    let mut out = format!(
        "{}://{}@{}:{}",
        link.scheme.prefix(),
        userinfo,
        host_for_url(&link.server),
        link.port
    );
    if !link.params.is_empty() {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(link.params.iter())
            .finish();
        out.push('?');
        out.push_str(&query);
    }
    if let Some(name) = &link.name {
        out.push('#');
        out.push_str(&utf8_percent_encode(name, LINK_ESCAPE).to_string());
    }
    Ok(out)
}

/// The JSON document with credentials put back in place
pub(crate) fn hydrate_json(json: &JsonProxyConfig, secrets: &SecretBundle) -> Result<serde_json::Value, MissingSecret> {
    let mut doc = json.document.clone();
    for slot in &json.secrets {
        let value = secrets.require(slot)?;
        if let Some(target) = doc.pointer_mut(slot.slot()) {
            *target = serde_json::Value::String(value.to_string());
        }
    }
    Ok(doc)
}

fn render_json(json: &JsonProxyConfig, secrets: &SecretBundle) -> Result<String, MissingSecret> {
    let doc = hydrate_json(json, secrets)?;
    // Serializing a Value cannot fail
    Ok(serde_json::to_string_pretty(&doc).unwrap_or_default())
}

pub(crate) fn render_torrc(tor: &TorConfig, secrets: &SecretBundle) -> Result<String, MissingSecret> {
    let mut out = String::new();
    let _ = writeln!(out, "SOCKSPort {}", tor.socks);
    if let Some(port) = tor.control_port {
        let _ = writeln!(out, "ControlPort {}", port);
    }
    if let Some(password) = &tor.control_password {
        let _ = writeln!(out, "HashedControlPassword {}", secrets.require(password)?);
    }
    for (key, value) in &tor.directives {
        let _ = writeln!(out, "{} {}", key, value);
    }
    Ok(out)
}

fn render_dpi(dpi: &DpiConfig) -> String {
    dpi.argv().iter().map(|t| quote(t)).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProtocolKind;
    use crate::parser::parse_config;

    #[test]
    fn test_missing_secret_is_reported() {
        let parsed = parse_config("trojan://pw@example.org:443", None).unwrap();
        let err = render(&parsed.descriptor, &SecretBundle::new()).unwrap_err();
        assert_eq!(err.0, "credential");
    }

    #[test]
    fn test_ipv6_link_host() {
        let parsed = parse_config("trojan://pw@[2001:db8::7]:443", None).unwrap();
        let text = render(&parsed.descriptor, &parsed.secrets).unwrap();
        assert_eq!(text, "trojan://pw@[2001:db8::7]:443");
    }

    #[test]
    fn test_vmess_round_trip() {
        let parsed = parse_config("trojan://pw@example.org:443", None).unwrap();
        let Descriptor::Proxy(ProxyDescriptor::Link(mut link)) = parsed.descriptor else {
            panic!("expected link");
        };
        link.scheme = LinkScheme::Vmess;
        link.params.insert("net".into(), "grpc".into());
        let descriptor = Descriptor::Proxy(ProxyDescriptor::Link(link));

        let text = render(&descriptor, &parsed.secrets).unwrap();
        assert!(text.starts_with("vmess://"));
        let again = parse_config(&text, None).unwrap();
        assert_eq!(again.descriptor, descriptor);
        assert_eq!(again.kind, ProtocolKind::Xray);
    }

    #[test]
    fn test_dpi_quoting() {
        let dpi = DpiConfig {
            tool: crate::descriptor::DpiTool::Zapret,
            args: vec![crate::descriptor::DpiArg {
                flag: "--hostlist".into(),
                value: Some("/etc/zapret/my list.txt".into()),
            }],
        };
        assert_eq!(render_dpi(&dpi), "--hostlist \"/etc/zapret/my list.txt\"");
    }
}
