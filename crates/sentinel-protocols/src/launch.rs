//! Launch Recipes
//!
//! Turns a protocol instance plus its secrets into the concrete command the
//! supervisor runs: program, argv, environment, the config files to write
//! first, and whether the command is a long-running daemon or a one-shot
//! setup script (wg-quick) with a matching teardown.
//!
//! | kind        | program            | config                |
//! |-------------|--------------------|-----------------------|
//! | wireguard   | wg-quick up/down   | INI                   |
//! | amneziawg   | awg-quick up/down  | INI                   |
//! | openvpn     | openvpn --config   | .ovpn                 |
//! | xray/trojan | xray run -c        | generated/native JSON |
//! | sing-box    | sing-box run -c    | native JSON           |
//! | shadowsocks | ss-local -c        | generated JSON        |
//! | hysteria2   | hysteria client -c | generated JSON        |
//! | tor         | tor -f             | torrc                 |
//! | zapret      | nfqws              | argv                  |
//! | byedpi      | ciadpi             | argv                  |
//! | goodbyedpi  | goodbyedpi         | argv                  |

use crate::descriptor::{
    Descriptor, JsonEngine, LinkScheme, ProxyDescriptor, ProxyLink, TorConfig, VpnDescriptor,
    default_socks_port,
};
use crate::model::{ProtocolInstance, ProtocolKind};
use crate::render::{hydrate_json, render, render_torrc, render_wireguard};
use crate::secrets::{MissingSecret, SecretBundle};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A file to write (mode 0600) before launching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    pub path: PathBuf,
    pub contents: String,
}

/// How the supervisor should treat the launched command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMode {
    /// Long-running process; alive means running
    Daemon,
    /// Setup command that exits once the tunnel is configured
    Oneshot {
        /// Teardown argv (program first)
        down: Vec<String>,
        /// Path that exists while the tunnel is up
        probe: PathBuf,
    },
}

/// Everything needed to start one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub files: Vec<RenderedFile>,
    pub mode: LaunchMode,
}

impl LaunchSpec {
    fn daemon(program: String, args: Vec<String>) -> Self {
        Self {
            program,
            args,
            env: Vec::new(),
            files: Vec::new(),
            mode: LaunchMode::Daemon,
        }
    }

    /// Full command line, for logs
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Daemon executable overrides (`kind -> path`); defaults resolve via `$PATH`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Binaries(pub BTreeMap<String, String>);

impl Binaries {
    pub fn resolve(&self, program: &str) -> String {
        self.0.get(program).cloned().unwrap_or_else(|| program.to_string())
    }
}

/// Where and with what a launch spec is built
#[derive(Debug, Clone, Copy)]
pub struct LaunchContext<'a> {
    pub runtime_dir: &'a Path,
    pub binaries: &'a Binaries,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    MissingSecret(#[from] MissingSecret),

    #[error("{kind} cannot run a {format} configuration")]
    Unsupported { kind: ProtocolKind, format: &'static str },
}

/// Kernel interface name for tunnel instances (max 15 bytes)
pub fn interface_name(kind: ProtocolKind, instance: &str) -> String {
    let prefix = match kind {
        ProtocolKind::Amneziawg => "awg",
        ProtocolKind::Openvpn => "tun",
        _ => "wg",
    };
    let suffix: String = instance
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(15 - prefix.len() - 1)
        .collect();
    format!("{}-{}", prefix, suffix)
}

/// Build the launch spec for `instance`
pub fn launch_spec(
    instance: &ProtocolInstance,
    secrets: &SecretBundle,
    ctx: LaunchContext<'_>,
) -> Result<LaunchSpec, LaunchError> {
    let kind = instance.kind;
    let file = |ext: &str| ctx.runtime_dir.join(format!("{}.{}", instance.name, ext));
    let unsupported = |format| LaunchError::Unsupported { kind, format };

    let spec = match (&instance.descriptor, kind) {
        (Descriptor::Vpn(VpnDescriptor::Wireguard(wg)), ProtocolKind::Wireguard | ProtocolKind::Amneziawg) => {
            let tool = if kind == ProtocolKind::Amneziawg {
                "awg-quick"
            } else {
                "wg-quick"
            };
            let iface = interface_name(kind, &instance.name);
            // wg-quick derives the interface name from the file name
            let path = ctx.runtime_dir.join(format!("{}.conf", iface));
            let program = ctx.binaries.resolve(tool);
            let path_arg = path.to_string_lossy().into_owned();
            LaunchSpec {
                program: program.clone(),
                args: vec!["up".into(), path_arg.clone()],
                // Userspace fallbacks (wireguard-go/amneziawg-go) size their workers from this
                env: vec![(
                    "GOMAXPROCS".into(),
                    instance.optimization.queue_count.max(1).to_string(),
                )],
                files: vec![RenderedFile {
                    path,
                    contents: render_wireguard(wg, secrets)?,
                }],
                mode: LaunchMode::Oneshot {
                    down: vec![program, "down".into(), path_arg],
                    probe: PathBuf::from("/sys/class/net").join(iface),
                },
            }
        }
        (Descriptor::Vpn(VpnDescriptor::Openvpn(_)), ProtocolKind::Openvpn) => {
            let path = file("ovpn");
            let mut spec = LaunchSpec::daemon(
                ctx.binaries.resolve("openvpn"),
                vec![
                    "--config".into(),
                    path.to_string_lossy().into_owned(),
                    "--dev".into(),
                    interface_name(kind, &instance.name),
                    "--dev-type".into(),
                    "tun".into(),
                ],
            );
            spec.files.push(RenderedFile {
                path,
                contents: render(&instance.descriptor, secrets)?,
            });
            spec
        }
        (Descriptor::Proxy(ProxyDescriptor::Json(cfg)), ProtocolKind::Xray | ProtocolKind::SingBox) => {
            let path = file("json");
            let program = match cfg.engine {
                JsonEngine::Xray => ctx.binaries.resolve("xray"),
                JsonEngine::SingBox => ctx.binaries.resolve("sing-box"),
            };
            let mut spec = LaunchSpec::daemon(
                program,
                vec!["run".into(), "-c".into(), path.to_string_lossy().into_owned()],
            );
            spec.files.push(RenderedFile {
                path,
                contents: pretty(&hydrate_json(cfg, secrets)?),
            });
            spec
        }
        (Descriptor::Proxy(ProxyDescriptor::Link(link)), _) => {
            link_spec(instance, link, secrets, ctx, file("json"))?
        }
        (Descriptor::Tunnel(tor), ProtocolKind::Tor) => {
            let path = file("torrc");
            let mut spec = LaunchSpec::daemon(
                ctx.binaries.resolve("tor"),
                vec!["-f".into(), path.to_string_lossy().into_owned()],
            );
            let data_dir = ctx.runtime_dir.join(format!("{}.tor", instance.name));
            spec.files.push(RenderedFile {
                path,
                contents: torrc_with_defaults(tor, secrets, &data_dir)?,
            });
            spec
        }
        (Descriptor::Dpi(dpi), _) => {
            let program = match kind {
                ProtocolKind::Zapret => "nfqws",
                ProtocolKind::Byedpi => "ciadpi",
                ProtocolKind::Goodbyedpi => "goodbyedpi",
                _ => return Err(unsupported("DPI argument")),
            };
            LaunchSpec::daemon(ctx.binaries.resolve(program), dpi.argv())
        }
        (Descriptor::Vpn(_), _) => return Err(unsupported("VPN")),
        (Descriptor::Proxy(_), _) => return Err(unsupported("JSON")),
        (Descriptor::Tunnel(_), _) => return Err(unsupported("torrc")),
    };
    Ok(spec)
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

fn torrc_with_defaults(tor: &TorConfig, secrets: &SecretBundle, data_dir: &Path) -> Result<String, MissingSecret> {
    let mut text = render_torrc(tor, secrets)?;
    let has = |key: &str| tor.directives.iter().any(|(k, _)| k.eq_ignore_ascii_case(key));
    if !has("DataDirectory") {
        text.push_str(&format!("DataDirectory {}\n", data_dir.display()));
    }
    if !has("MaxMemInQueues") {
        text.push_str("MaxMemInQueues 256 MB\n");
    }
    Ok(text)
}

fn link_spec(
    instance: &ProtocolInstance,
    link: &ProxyLink,
    secrets: &SecretBundle,
    ctx: LaunchContext<'_>,
    path: PathBuf,
) -> Result<LaunchSpec, LaunchError> {
    let credential = secrets.require(&link.credential)?;
    let local_port = instance
        .listen
        .first()
        .map(|l| l.port)
        .unwrap_or_else(|| default_socks_port(instance.kind));
    let opt = &instance.optimization;

    let (program, args, doc) = match link.scheme {
        LinkScheme::Shadowsocks => {
            let mut doc = json!({
                "server": link.server,
                "server_port": link.port,
                "local_address": "0.0.0.0",
                "local_port": local_port,
                "password": credential,
                "method": link.method.clone().unwrap_or_default(),
                "fast_open": opt.fast_open,
                "mode": "tcp_and_udp",
            });
            if let Some(plugin) = link.param("plugin") {
                let (name, opts) = plugin.split_once(';').unwrap_or((plugin, ""));
                doc["plugin"] = json!(name);
                doc["plugin_opts"] = json!(opts);
            }
            ("ss-local", vec!["-c".to_string()], doc)
        }
        LinkScheme::Hysteria2 => {
            let mut doc = json!({
                "server": format!("{}:{}", link.server, link.port),
                "auth": credential,
                "socks5": { "listen": format!("0.0.0.0:{}", local_port) },
            });
            if let Some(sni) = link.param("sni") {
                doc["tls"] = json!({ "sni": sni, "insecure": link.param("insecure") == Some("1") });
            }
            if let (Some(up), Some(down)) = (link.param("up"), link.param("down")) {
                doc["bandwidth"] = json!({ "up": up, "down": down });
            }
            if let Some(obfs) = link.param("obfs") {
                let mut section = serde_json::Map::new();
                section.insert("type".into(), json!(obfs));
                section.insert(
                    obfs.to_string(),
                    json!({ "password": link.param("obfs-password").unwrap_or_default() }),
                );
                doc["obfs"] = Value::Object(section);
            }
            ("hysteria", vec!["client".to_string(), "-c".to_string()], doc)
        }
        LinkScheme::Vless | LinkScheme::Vmess | LinkScheme::Trojan => {
            let doc = xray_config(link, credential, local_port, opt.fast_open, opt.congestion_control.as_deref());
            ("xray", vec!["run".to_string(), "-c".to_string()], doc)
        }
    };

    let mut args = args;
    args.push(path.to_string_lossy().into_owned());
    let mut spec = LaunchSpec::daemon(ctx.binaries.resolve(program), args);
    spec.files.push(RenderedFile {
        path,
        contents: pretty(&doc),
    });
    Ok(spec)
}

fn xray_config(link: &ProxyLink, credential: &str, local_port: u16, fast_open: bool, congestion: Option<&str>) -> Value {
    let network = link.param("type").or_else(|| link.param("net")).unwrap_or("tcp");
    let security = link
        .param("security")
        .or_else(|| link.param("tls").filter(|t| !t.is_empty()))
        .unwrap_or(if link.scheme == LinkScheme::Trojan { "tls" } else { "none" });

    let settings = match link.scheme {
        LinkScheme::Vless => json!({ "vnext": [{
            "address": link.server,
            "port": link.port,
            "users": [{
                "id": credential,
                "encryption": link.param("encryption").unwrap_or("none"),
                "flow": link.param("flow").unwrap_or_default(),
            }],
        }]}),
        LinkScheme::Vmess => json!({ "vnext": [{
            "address": link.server,
            "port": link.port,
            "users": [{
                "id": credential,
                "alterId": link.param("aid").and_then(|a| a.parse::<u32>().ok()).unwrap_or(0),
                "security": link.param("scy").unwrap_or("auto"),
            }],
        }]}),
        _ => json!({ "servers": [{
            "address": link.server,
            "port": link.port,
            "password": credential,
        }]}),
    };

    let sni = link
        .param("sni")
        .or_else(|| link.param("peer"))
        .or_else(|| link.param("host"))
        .unwrap_or(link.server.as_str());
    let mut stream = json!({ "network": network, "security": security });
    match security {
        "reality" => {
            stream["realitySettings"] = json!({
                "serverName": sni,
                "publicKey": link.param("pbk").unwrap_or_default(),
                "shortId": link.param("sid").unwrap_or_default(),
                "fingerprint": link.param("fp").unwrap_or("chrome"),
            });
        }
        "tls" => {
            stream["tlsSettings"] = json!({ "serverName": sni });
        }
        _ => {}
    }
    match network {
        "ws" => {
            stream["wsSettings"] = json!({
                "path": link.param("path").unwrap_or("/"),
                "headers": { "Host": link.param("host").unwrap_or_default() },
            });
        }
        "grpc" => {
            stream["grpcSettings"] = json!({
                "serviceName": link.param("serviceName").or_else(|| link.param("path")).unwrap_or_default(),
            });
        }
        _ => {}
    }
    let mut sockopt = json!({ "tcpFastOpen": fast_open });
    if let Some(cc) = congestion {
        sockopt["tcpcongestion"] = json!(cc);
    }
    stream["sockopt"] = sockopt;

    json!({
        "log": { "loglevel": "warning" },
        "inbounds": [{
            "listen": "0.0.0.0",
            "port": local_port,
            "protocol": "socks",
            "settings": { "udp": true },
        }],
        "outbounds": [
            {
                "tag": "proxy",
                "protocol": link.scheme.prefix(),
                "settings": settings,
                "streamSettings": stream,
            },
            { "tag": "direct", "protocol": "freedom" },
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_config;

    fn instance_for(text: &str, hint: Option<ProtocolKind>, name: &str) -> (ProtocolInstance, SecretBundle) {
        let parsed = parse_config(text, hint).unwrap();
        let instance = ProtocolInstance::new(name, parsed.kind, parsed.descriptor);
        (instance, parsed.secrets)
    }

    #[test]
    fn test_interface_name_fits_kernel_limit() {
        let name = interface_name(ProtocolKind::Amneziawg, "my-very-long-instance-name");
        assert!(name.len() <= 15);
        assert!(name.starts_with("awg-"));
    }

    #[test]
    fn test_wireguard_is_oneshot() {
        let wg = "[Interface]\nPrivateKey = yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=\nAddress = 10.0.0.2/32\n\
                  [Peer]\nPublicKey = xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=\nAllowedIPs = 0.0.0.0/0\n";
        let (instance, secrets) = instance_for(wg, None, "home");
        let binaries = Binaries::default();
        let ctx = LaunchContext {
            runtime_dir: Path::new("/run/sentinel"),
            binaries: &binaries,
        };
        let spec = launch_spec(&instance, &secrets, ctx).unwrap();
        assert_eq!(spec.program, "wg-quick");
        assert_eq!(spec.args, vec!["up", "/run/sentinel/wg-home.conf"]);
        assert!(spec.files[0].contents.contains("PrivateKey = yAnz5TF"));
        match spec.mode {
            LaunchMode::Oneshot { down, probe } => {
                assert_eq!(down[1], "down");
                assert_eq!(probe, PathBuf::from("/sys/class/net/wg-home"));
            }
            LaunchMode::Daemon => panic!("wireguard should be oneshot"),
        }
    }

    #[test]
    fn test_vless_generates_xray_config() {
        let link = "vless://b831381d-6324-4d53-ad4f-8cda48b30811@203.0.113.7:443?type=tcp&security=reality&pbk=PBK&sid=6b&sni=www.microsoft.com&flow=xtls-rprx-vision#NL";
        let (mut instance, secrets) = instance_for(link, None, "nl");
        instance.optimization.fast_open = true;
        let mut binaries = Binaries::default();
        binaries.0.insert("xray".into(), "/opt/xray/xray".into());
        let ctx = LaunchContext {
            runtime_dir: Path::new("/tmp/rt"),
            binaries: &binaries,
        };

        let spec = launch_spec(&instance, &secrets, ctx).unwrap();
        assert_eq!(spec.program, "/opt/xray/xray");
        assert_eq!(spec.mode, LaunchMode::Daemon);

        let doc: Value = serde_json::from_str(&spec.files[0].contents).unwrap();
        assert_eq!(doc["inbounds"][0]["port"], 10808);
        let out = &doc["outbounds"][0];
        assert_eq!(out["protocol"], "vless");
        assert_eq!(out["settings"]["vnext"][0]["users"][0]["flow"], "xtls-rprx-vision");
        assert_eq!(out["streamSettings"]["realitySettings"]["publicKey"], "PBK");
        assert_eq!(out["streamSettings"]["sockopt"]["tcpFastOpen"], true);
    }

    #[test]
    fn test_shadowsocks_plugin_split() {
        let (instance, secrets) = instance_for(
            "ss://YWVzLTI1Ni1nY206cHc@198.51.100.4:8388?plugin=v2ray-plugin%3Bserver%3Bhost%3Dexample.org#s",
            None,
            "ss1",
        );
        let binaries = Binaries::default();
        let ctx = LaunchContext {
            runtime_dir: Path::new("/tmp"),
            binaries: &binaries,
        };
        let spec = launch_spec(&instance, &secrets, ctx).unwrap();
        let doc: Value = serde_json::from_str(&spec.files[0].contents).unwrap();
        assert_eq!(doc["method"], "aes-256-gcm");
        assert_eq!(doc["password"], "pw");
        assert_eq!(doc["plugin"], "v2ray-plugin");
        assert_eq!(doc["plugin_opts"], "server;host=example.org");
        assert_eq!(doc["local_port"], 1080);
    }

    #[test]
    fn test_torrc_defaults() {
        let (instance, secrets) = instance_for("SOCKSPort 9050\n", None, "tor");
        let binaries = Binaries::default();
        let ctx = LaunchContext {
            runtime_dir: Path::new("/run/s"),
            binaries: &binaries,
        };
        let spec = launch_spec(&instance, &secrets, ctx).unwrap();
        let torrc = &spec.files[0].contents;
        assert!(torrc.contains("DataDirectory /run/s/tor.tor"));
        assert!(torrc.contains("MaxMemInQueues 256 MB"));
    }

    #[test]
    fn test_kind_descriptor_mismatch() {
        let (mut instance, secrets) = instance_for("SOCKSPort 9050\n", None, "tor");
        instance.kind = ProtocolKind::Openvpn;
        let binaries = Binaries::default();
        let ctx = LaunchContext {
            runtime_dir: Path::new("/run/s"),
            binaries: &binaries,
        };
        assert!(matches!(
            launch_spec(&instance, &secrets, ctx),
            Err(LaunchError::Unsupported { .. })
        ));
    }
}
