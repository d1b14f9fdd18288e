//! WireGuard / AmneziaWG INI parsing.

use super::{ParseError, Parsed, lines_with_offsets};
use crate::descriptor::{AmneziaParams, Descriptor, VpnDescriptor, WgInterface, WgPeer, WireGuardConfig};
use crate::secrets::{SecretBundle, SecretRef, validate_wg_key};

pub(crate) const PRIVATE_KEY_SLOT: &str = "interface.private_key";

pub(crate) fn peer_psk_slot(index: usize) -> String {
    format!("peer.{}.preshared_key", index)
}

enum Section {
    None,
    Interface,
    Peer,
}

#[derive(Default)]
struct InterfaceBuilder {
    private_key: Option<SecretRef>,
    addresses: Vec<String>,
    dns: Vec<String>,
    listen_port: Option<u16>,
    mtu: Option<u16>,
    obfuscation: Option<AmneziaParams>,
    extra: Vec<(String, String)>,
}

#[derive(Default)]
struct PeerBuilder {
    offset: usize,
    public_key: Option<String>,
    preshared_key: Option<SecretRef>,
    endpoint: Option<String>,
    allowed_ips: Vec<String>,
    persistent_keepalive: Option<u16>,
    extra: Vec<(String, String)>,
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str, offset: usize) -> Result<T, ParseError> {
    value
        .parse::<T>()
        .map_err(|_| ParseError::at(offset, format!("invalid {} '{}'", key, value)))
}

fn check_key(key: &str, value: &str, offset: usize) -> Result<(), ParseError> {
    validate_wg_key(value).map_err(|e| ParseError::at(offset, format!("{}: {}", key, e)))
}

pub(crate) fn parse(text: &str) -> Parsed {
    let mut section = Section::None;
    let mut seen_interface = false;
    let mut iface = InterfaceBuilder::default();
    let mut peers: Vec<PeerBuilder> = Vec::new();
    let mut secrets = SecretBundle::new();

    for (offset, raw) in lines_with_offsets(text) {
        // wg-quick strips everything after '#'
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') {
            if !line.ends_with(']') {
                return Err(ParseError::at(offset, "unterminated section header"));
            }
            match line[1..line.len() - 1].trim().to_ascii_lowercase().as_str() {
                "interface" => {
                    if seen_interface {
                        return Err(ParseError::at(offset, "duplicate [Interface] section"));
                    }
                    seen_interface = true;
                    section = Section::Interface;
                }
                "peer" => {
                    peers.push(PeerBuilder {
                        offset,
                        ..PeerBuilder::default()
                    });
                    section = Section::Peer;
                }
                other => {
                    return Err(ParseError::at(offset, format!("unknown section [{}]", other)));
                }
            }
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(ParseError::at(offset, "expected 'Key = Value'"));
        };
        let (key, value) = (key.trim(), value.trim());
        let lower = key.to_ascii_lowercase();

        match section {
            Section::None => {
                return Err(ParseError::at(offset, "key outside of any section"));
            }
            Section::Interface => match lower.as_str() {
                "privatekey" => {
                    if iface.private_key.is_some() {
                        return Err(ParseError::at(offset, "duplicate PrivateKey"));
                    }
                    check_key(key, value, offset)?;
                    iface.private_key = Some(secrets.insert(PRIVATE_KEY_SLOT, value));
                }
                "address" => iface.addresses.extend(split_list(value)),
                "dns" => iface.dns.extend(split_list(value)),
                "listenport" => iface.listen_port = Some(parse_num(key, value, offset)?),
                "mtu" => iface.mtu = Some(parse_num(key, value, offset)?),
                _ if AmneziaParams::KEYS.iter().any(|k| k.eq_ignore_ascii_case(&lower)) => {
                    let number = parse_num(key, value, offset)?;
                    let params = iface.obfuscation.get_or_insert_with(AmneziaParams::default);
                    if let Some(slot) = params.slot_mut(&lower) {
                        *slot = Some(number);
                    }
                }
                _ => iface.extra.push((key.to_string(), value.to_string())),
            },
            Section::Peer => {
                let index = peers.len() - 1;
                let peer = &mut peers[index];
                match lower.as_str() {
                    "publickey" => {
                        check_key(key, value, offset)?;
                        peer.public_key = Some(value.to_string());
                    }
                    "presharedkey" => {
                        check_key(key, value, offset)?;
                        peer.preshared_key = Some(secrets.insert(peer_psk_slot(index), value));
                    }
                    "endpoint" => peer.endpoint = Some(value.to_string()),
                    "allowedips" => peer.allowed_ips.extend(split_list(value)),
                    "persistentkeepalive" => {
                        peer.persistent_keepalive = if value.eq_ignore_ascii_case("off") {
                            None
                        } else {
                            Some(parse_num(key, value, offset)?)
                        };
                    }
                    _ => peer.extra.push((key.to_string(), value.to_string())),
                }
            }
        }
    }

    if !seen_interface {
        return Err(ParseError::at(text.len(), "missing [Interface] section"));
    }
    let private_key = iface
        .private_key
        .ok_or_else(|| ParseError::at(text.len(), "[Interface] has no PrivateKey"))?;
    if peers.is_empty() {
        return Err(ParseError::at(text.len(), "no [Peer] section"));
    }

    let peers = peers
        .into_iter()
        .map(|p| {
            let public_key = p
                .public_key
                .ok_or_else(|| ParseError::at(p.offset, "[Peer] has no PublicKey"))?;
            Ok(WgPeer {
                public_key,
                preshared_key: p.preshared_key,
                endpoint: p.endpoint,
                allowed_ips: p.allowed_ips,
                persistent_keepalive: p.persistent_keepalive,
                extra: p.extra,
            })
        })
        .collect::<Result<Vec<_>, ParseError>>()?;

    let config = WireGuardConfig {
        interface: WgInterface {
            private_key,
            addresses: iface.addresses,
            dns: iface.dns,
            listen_port: iface.listen_port,
            mtu: iface.mtu,
            obfuscation: iface.obfuscation,
            extra: iface.extra,
        },
        peers,
    };
    Ok((Descriptor::Vpn(VpnDescriptor::Wireguard(config)), secrets))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";

    #[test]
    fn test_requires_peer() {
        let text = format!("[Interface]\nPrivateKey = {}\n", KEY);
        let err = parse(&text).unwrap_err();
        assert_eq!(err.reason, "no [Peer] section");
    }

    #[test]
    fn test_rejects_bad_key() {
        let text = "[Interface]\nPrivateKey = abc\n";
        let err = parse(text).unwrap_err();
        assert_eq!(err.offset, "[Interface]\n".len());
    }

    #[test]
    fn test_multiple_peers_and_extra_keys() {
        let text = format!(
            "[Interface]\nPrivateKey = {k}\nPostUp = iptables -A FORWARD -i %i -j ACCEPT\nTable = off\n\
             [Peer]\nPublicKey = {k}\nAllowedIPs = 10.0.0.0/24\n\
             [Peer]\nPublicKey = {k}\nPresharedKey = {k}\nAllowedIPs = 10.0.1.0/24\nPersistentKeepalive = off\n",
            k = KEY
        );
        let (descriptor, secrets) = parse(&text).unwrap();
        let Descriptor::Vpn(VpnDescriptor::Wireguard(wg)) = descriptor else {
            panic!("expected wireguard");
        };
        assert_eq!(wg.peers.len(), 2);
        assert_eq!(wg.interface.extra.len(), 2);
        assert!(wg.interface.obfuscation.is_none());
        assert_eq!(wg.peers[1].persistent_keepalive, None);
        assert_eq!(
            secrets.slots().collect::<Vec<_>>(),
            vec!["interface.private_key", "peer.1.preshared_key"]
        );
    }

    #[test]
    fn test_peer_without_public_key() {
        let text = format!("[Interface]\nPrivateKey = {}\n[Peer]\nEndpoint = a:1\n", KEY);
        let err = parse(&text).unwrap_err();
        assert_eq!(&text[err.offset..err.offset + 6], "[Peer]");
    }
}
