//! DPI-evasion argument lists (zapret nfqws, byedpi, GoodbyeDPI).

use super::{ParseError, Parsed, lines_with_offsets, tokenize};
use crate::descriptor::{Descriptor, DpiArg, DpiConfig, DpiTool};
use crate::secrets::SecretBundle;

fn is_flag(token: &str) -> bool {
    token.starts_with('-') && token.len() > 1 && !token[1..].starts_with(|c: char| c.is_ascii_digit())
}

pub(super) fn parse(text: &str, tool: DpiTool) -> Parsed {
    let mut args: Vec<DpiArg> = Vec::new();

    for (offset, raw) in lines_with_offsets(text) {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        for token in tokenize(line, offset)? {
            if is_flag(&token) {
                args.push(DpiArg {
                    flag: token,
                    value: None,
                });
                continue;
            }
            match args.last_mut() {
                Some(last) if last.value.is_none() => last.value = Some(token),
                Some(last) => {
                    return Err(ParseError::at(
                        offset,
                        format!("unexpected argument '{}' after {}", token, last.flag),
                    ));
                }
                None => {
                    return Err(ParseError::at(offset, format!("expected a flag, found '{}'", token)));
                }
            }
        }
    }

    Ok((Descriptor::Dpi(DpiConfig { tool, args }), SecretBundle::new()))
}
