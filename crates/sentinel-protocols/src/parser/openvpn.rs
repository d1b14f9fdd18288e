//! OpenVPN directive-file parsing.

use super::{ParseError, Parsed, lines_with_offsets, tokenize};
use crate::descriptor::{
    BlockContent, Descriptor, InlineBlock, OpenVpnConfig, OvpnDirective, OvpnRemote, VpnDescriptor,
};
use crate::secrets::SecretBundle;

/// Inline blocks that carry key material
const SECRET_BLOCKS: [&str; 6] = ["key", "tls-auth", "tls-crypt", "tls-crypt-v2", "secret", "pkcs12"];

const DEFAULT_PORT: u16 = 1194;

pub(crate) fn inline_slot(tag: &str) -> String {
    format!("inline.{}", tag)
}

fn is_directive_name(name: &str) -> bool {
    name.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

pub(super) fn parse(text: &str) -> Parsed {
    let mut config = OpenVpnConfig {
        client: false,
        dev: String::new(),
        proto: String::new(),
        remotes: Vec::new(),
        cipher: None,
        auth: None,
        auth_user_pass: false,
        directives: Vec::new(),
        inline: Vec::new(),
    };
    let mut secrets = SecretBundle::new();
    let mut open_block: Option<(String, usize, Vec<String>)> = None;

    for (offset, raw) in lines_with_offsets(text) {
        if let Some((tag, start, body)) = open_block.as_mut() {
            if raw.trim() == format!("</{}>", tag) {
                let content = body.join("\n");
                let content = if SECRET_BLOCKS.contains(&tag.as_str()) {
                    BlockContent::Secret(secrets.insert(inline_slot(tag), content))
                } else {
                    BlockContent::Public(content)
                };
                if config.inline.iter().any(|b| &b.tag == tag) {
                    return Err(ParseError::at(*start, format!("duplicate <{}> block", tag)));
                }
                config.inline.push(InlineBlock {
                    tag: tag.clone(),
                    content,
                });
                open_block = None;
            } else {
                body.push(raw.to_string());
            }
            continue;
        }

        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(tag) = line.strip_prefix('<').and_then(|l| l.strip_suffix('>')) {
            if tag.starts_with('/') || !is_directive_name(tag) {
                return Err(ParseError::at(offset, format!("unexpected tag {}", line)));
            }
            open_block = Some((tag.to_string(), offset, Vec::new()));
            continue;
        }

        let tokens = tokenize(line, offset)?;
        let (name, args) = match tokens.split_first() {
            Some((name, args)) => (name.as_str(), args),
            None => continue,
        };
        if !is_directive_name(name) {
            return Err(ParseError::at(offset, format!("'{}' is not an OpenVPN directive", name)));
        }

        let single = |what: &str| -> Result<String, ParseError> {
            match args {
                [value] => Ok(value.clone()),
                _ => Err(ParseError::at(offset, format!("{} takes exactly one argument", what))),
            }
        };

        match name {
            "client" if args.is_empty() => config.client = true,
            "dev" => config.dev = single("dev")?,
            "proto" => config.proto = single("proto")?,
            "cipher" => config.cipher = Some(single("cipher")?),
            "auth" => config.auth = Some(single("auth")?),
            "auth-user-pass" if args.is_empty() => config.auth_user_pass = true,
            "remote" => {
                let host = args
                    .first()
                    .ok_or_else(|| ParseError::at(offset, "remote needs a host"))?
                    .clone();
                let port = match args.get(1) {
                    Some(p) => p
                        .parse::<u16>()
                        .map_err(|_| ParseError::at(offset, format!("invalid remote port '{}'", p)))?,
                    None => DEFAULT_PORT,
                };
                if args.len() > 3 {
                    return Err(ParseError::at(offset, "remote takes at most host, port and proto"));
                }
                config.remotes.push(OvpnRemote {
                    host,
                    port,
                    proto: args.get(2).cloned(),
                });
            }
            _ => config.directives.push(OvpnDirective {
                name: name.to_string(),
                args: args.to_vec(),
            }),
        }
    }

    if let Some((tag, start, _)) = open_block {
        return Err(ParseError::at(start, format!("<{}> block is never closed", tag)));
    }
    if config.remotes.is_empty() {
        return Err(ParseError::at(text.len(), "no remote directive"));
    }
    if config.dev.is_empty() {
        config.dev = "tun".to_string();
    }
    if config.proto.is_empty() {
        config.proto = "udp".to_string();
    }

    Ok((Descriptor::Vpn(VpnDescriptor::Openvpn(config)), secrets))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let (descriptor, secrets) = parse("remote vpn.example.net\n").unwrap();
        assert!(secrets.is_empty());
        let Descriptor::Vpn(VpnDescriptor::Openvpn(ovpn)) = descriptor else {
            panic!("expected openvpn");
        };
        assert_eq!(ovpn.remotes[0].port, 1194);
        assert_eq!(ovpn.proto, "udp");
        assert_eq!(ovpn.dev, "tun");
    }

    #[test]
    fn test_unclosed_block() {
        let text = "remote a 1\n<key>\nabc\n";
        let err = parse(text).unwrap_err();
        assert_eq!(err.offset, "remote a 1\n".len());
    }

    #[test]
    fn test_requires_remote() {
        let err = parse("client\ndev tun\n").unwrap_err();
        assert_eq!(err.reason, "no remote directive");
    }

    #[test]
    fn test_rejects_ini() {
        assert!(parse("[Interface]\nPrivateKey = x\n").is_err());
    }
}
