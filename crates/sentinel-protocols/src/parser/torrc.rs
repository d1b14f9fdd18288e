//! torrc parsing.

use super::{ParseError, Parsed, lines_with_offsets};
use crate::descriptor::{Descriptor, TorConfig};
use crate::secrets::SecretBundle;

pub(crate) const CONTROL_PASSWORD_SLOT: &str = "tor.control_password";

const DEFAULT_SOCKS: &str = "9050";

fn is_option_name(key: &str) -> bool {
    key.starts_with(|c: char| c.is_ascii_uppercase()) && key.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Parse a torrc. Without `hinted`, a `SOCKSPort` line is required to
/// tell the file apart from other key/value formats.
pub(super) fn parse(text: &str, hinted: bool) -> Parsed {
    let mut socks: Option<String> = None;
    let mut control_port = None;
    let mut control_password = None;
    let mut directives = Vec::new();
    let mut secrets = SecretBundle::new();

    for (offset, raw) in lines_with_offsets(text) {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line
            .split_once(char::is_whitespace)
            .map(|(k, v)| (k, v.trim()))
            .unwrap_or((line, ""));
        if !is_option_name(key) {
            return Err(ParseError::at(offset, format!("'{}' is not a torrc option", key)));
        }
        if value.is_empty() {
            return Err(ParseError::at(offset, format!("{} has no value", key)));
        }

        match key.to_ascii_lowercase().as_str() {
            "socksport" if socks.is_none() => socks = Some(value.to_string()),
            "controlport" => {
                let port = value
                    .parse::<u16>()
                    .map_err(|_| ParseError::at(offset, format!("invalid ControlPort '{}'", value)))?;
                control_port = Some(port);
            }
            "hashedcontrolpassword" => {
                control_password = Some(secrets.insert(CONTROL_PASSWORD_SLOT, value));
            }
            _ => directives.push((key.to_string(), value.to_string())),
        }
    }

    let socks = match socks {
        Some(s) => s,
        None if hinted => DEFAULT_SOCKS.to_string(),
        None => return Err(ParseError::at(text.len(), "no SOCKSPort directive")),
    };

    let config = TorConfig {
        socks,
        control_port,
        control_password,
        directives,
    };
    Ok((Descriptor::Tunnel(config), secrets))
}
