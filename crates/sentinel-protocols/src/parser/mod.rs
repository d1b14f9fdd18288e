//! Config Parser
//!
//! Normalizes pasted protocol configuration text into a canonical
//! [`Descriptor`] plus a [`SecretBundle`].
//!
//! Format detection runs the parsers in priority order and the first one
//! that consumes the whole input without structural errors wins:
//!
//! 1. share links (`vless://`, `vmess://`, `trojan://`, `ss://`,
//!    `hysteria2://`, `wireguard://`, `amnezia://`)
//! 2. INI blocks (WireGuard / AmneziaWG `.conf`)
//! 3. directive files (OpenVPN `.ovpn`)
//! 4. JSON documents (xray / sing-box)
//! 5. torrc
//!
//! DPI-evasion argument lists have no distinctive syntax, so they are only
//! accepted when the caller passes a zapret/byedpi/goodbyedpi type hint.
//!
//! Parsing is a pure function of its input.

mod dpi;
mod json;
mod link;
mod openvpn;
mod torrc;
mod wireguard;

use crate::descriptor::{Descriptor, DpiTool};
use crate::model::ProtocolKind;
use crate::secrets::SecretBundle;
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use std::fmt;
use tracing::debug;

/// Why the input was rejected, and where
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct ParseError {
    pub reason: String,
    /// Byte offset into the input
    pub offset: usize,
}

impl ParseError {
    pub fn at(offset: usize, reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            offset,
        }
    }

    fn shifted(mut self, by: usize) -> Self {
        self.offset += by;
        self
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at byte {})", self.reason, self.offset)
    }
}

/// Successful parse result
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedConfig {
    pub kind: ProtocolKind,
    pub descriptor: Descriptor,
    pub secrets: SecretBundle,
}

type Parsed = Result<(Descriptor, SecretBundle), ParseError>;

#[derive(Debug, Clone, Copy)]
enum Format {
    Link,
    Ini,
    Ovpn,
    Json,
    Torrc,
}

impl Format {
    fn label(&self) -> &'static str {
        match self {
            Format::Link => "link",
            Format::Ini => "wireguard",
            Format::Ovpn => "openvpn",
            Format::Json => "json",
            Format::Torrc => "torrc",
        }
    }

    fn run(&self, text: &str, hint: Option<ProtocolKind>) -> Parsed {
        match self {
            Format::Link => link::parse(text),
            Format::Ini => wireguard::parse(text),
            Format::Ovpn => openvpn::parse(text),
            Format::Json => json::parse(text, hint),
            Format::Torrc => torrc::parse(text, hint == Some(ProtocolKind::Tor)),
        }
    }
}

const DETECTION_ORDER: [Format; 5] = [
    Format::Link,
    Format::Ini,
    Format::Ovpn,
    Format::Json,
    Format::Torrc,
];

/// Parse raw configuration text, optionally guided by a protocol type hint
pub fn parse_config(text: &str, hint: Option<ProtocolKind>) -> Result<ParsedConfig, ParseError> {
    if text.trim().is_empty() {
        return Err(ParseError::at(0, "configuration is empty"));
    }

    if let Some(tool) = hint.and_then(DpiTool::from_kind) {
        let (descriptor, secrets) = dpi::parse(text, tool)?;
        return Ok(finish(descriptor, secrets));
    }

    // Keep the error of the parser that got furthest; it is the most
    // likely intended format.
    let mut best: Option<ParseError> = None;
    for format in DETECTION_ORDER {
        match format.run(text, hint) {
            Ok((descriptor, secrets)) => {
                let kind = descriptor.kind();
                if let Some(hint) = hint {
                    if !compatible(hint, kind) {
                        return Err(ParseError::at(
                            0,
                            format!("configuration is {}, not {}", kind, hint),
                        ));
                    }
                }
                debug!("Parsed {} configuration as {}", format.label(), kind);
                return Ok(finish(descriptor, secrets));
            }
            Err(e) => {
                let e = ParseError::at(e.offset, format!("{}: {}", format.label(), e.reason));
                if best.as_ref().is_none_or(|b| e.offset > b.offset) {
                    best = Some(e);
                }
            }
        }
    }

    Err(best.unwrap_or_else(|| ParseError::at(0, "unrecognized configuration format")))
}

fn finish(descriptor: Descriptor, secrets: SecretBundle) -> ParsedConfig {
    ParsedConfig {
        kind: descriptor.kind(),
        descriptor,
        secrets,
    }
}

fn compatible(hint: ProtocolKind, kind: ProtocolKind) -> bool {
    use ProtocolKind::*;
    hint == kind || matches!((hint, kind), (Wireguard, Amneziawg) | (Amneziawg, Wireguard))
}

/// Lines with the byte offset of their first character
pub(crate) fn lines_with_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0;
    text.split_inclusive('\n').map(move |raw| {
        let start = offset;
        offset += raw.len();
        (start, raw.trim_end_matches(['\n', '\r']))
    })
}

/// Split a line into whitespace-separated tokens, honouring double quotes
pub(crate) fn tokenize(line: &str, offset: usize) -> Result<Vec<String>, ParseError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote_start = None;
    let mut chars = line.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match c {
            '"' if quote_start.is_none() => {
                quote_start = Some(i);
                in_token = true;
            }
            '"' => quote_start = None,
            '\\' if quote_start.is_some() => {
                if let Some((_, next)) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() && quote_start.is_none() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if let Some(start) = quote_start {
        return Err(ParseError::at(offset + start, "unterminated quote"));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Quote a token for [`tokenize`] if it needs it
pub(crate) fn quote(token: &str) -> String {
    if !token.is_empty() && !token.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\') {
        return token.to_string();
    }
    let escaped = token.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// Decode base64 in any of the padding/alphabet variants seen in share links
pub(crate) fn decode_base64_lenient(s: &str) -> Option<Vec<u8>> {
    let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(&cleaned).ok())
}
