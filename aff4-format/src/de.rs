//! Parsers for the text formats written by [`ser`](crate::ser).

use crate::error::{Error, Result};
use crate::urn::Urn;
use crate::value::Value;

pub(crate) fn unescape(value: &str) -> Result<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = value
                .get(i + 1..i + 3)
                .ok_or_else(|| Error::structural(format!("truncated escape in {:?}", value)))?;
            let b = u8::from_str_radix(hex, 16)
                .map_err(|_| Error::structural(format!("invalid escape in {:?}", value)))?;
            out.push(b);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|e| Error::structural(e.to_string()))
}

/// A parsed `(subject, attribute, value)` triple.
pub type Triple = (Urn, String, Value);

/// Parse a `properties` member. Relative lines are attributed to `owner`.
pub fn parse_properties(text: &str, owner: &Urn) -> Result<Vec<Triple>> {
    let mut out = vec![];

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }

        let (subject, rest) = match line.strip_prefix('<') {
            Some(rest) => {
                let (subject, rest) = rest.split_once("> ").ok_or_else(|| {
                    Error::structural(format!("unterminated subject on line {}", lineno + 1))
                })?;
                (Urn::new(unescape(subject)?), rest)
            }
            None => (owner.clone(), line),
        };

        let (attr, value) = rest.split_once('=').ok_or_else(|| {
            Error::structural(format!("expected attribute=value on line {}", lineno + 1))
        })?;
        let value = unescape(value)?;
        let value = Value::from_text(attr, &value).ok_or_else(|| {
            Error::structural(format!(
                "invalid value {:?} for {} on line {}",
                value,
                attr,
                lineno + 1
            ))
        })?;

        out.push((subject, attr.to_string(), value));
    }

    tracing::debug!(owner = %owner, triples = out.len(), "parsed properties");
    Ok(out)
}

/// Parse `image_offset,target_offset,target_urn` lines.
pub fn parse_map(text: &str) -> Result<Vec<(u64, u64, Urn)>> {
    let mut out = vec![];
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, ',');
        let (image, target, urn) = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c)) => (a, b, c),
            _ => {
                return Err(Error::structural(format!(
                    "map line {} has fewer than three fields",
                    lineno + 1
                )))
            }
        };
        let parse = |s: &str| {
            s.parse::<u64>().map_err(|_| {
                Error::structural(format!("invalid offset {:?} on map line {}", s, lineno + 1))
            })
        };
        out.push((parse(image)?, parse(target)?, Urn::new(unescape(urn)?)));
    }
    Ok(out)
}
