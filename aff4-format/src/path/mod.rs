//! Archive member names.
//!
//! Members below the volume URN are stored by their relative path; anything
//! else is stored fully qualified. Bytes outside `[A-Za-z0-9._~/-]` are
//! percent-escaped, as is any `/` that would produce an empty path component
//! and any `.` that starts a component, so names never escape the archive
//! root when extracted by ordinary ZIP tools.

use std::fmt;
use std::fmt::Write as _;

use crate::urn::Urn;

mod error;

pub use self::error::IntoMemberPathError;

#[derive(Debug, Clone, PartialOrd, Ord, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MemberPath(String);

#[inline]
fn is_plain(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'~' | b'.')
}

fn escape_into(out: &mut String, value: &str) {
    let mut prev = None;
    for &b in value.as_bytes() {
        let component_start = prev.is_none() || prev == Some(b'/');
        let keep = match b {
            b'/' => !component_start,
            b'.' => !component_start,
            b => is_plain(b),
        };
        if keep {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{:02X}", b);
        }
        prev = Some(b);
    }
}

fn unescape(value: &str) -> Result<String, IntoMemberPathError> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = value
                .get(i + 1..i + 3)
                .ok_or(IntoMemberPathError::InvalidEscape)?;
            out.push(u8::from_str_radix(hex, 16).map_err(|_| IntoMemberPathError::InvalidEscape)?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| IntoMemberPathError::NonUtf8)
}

/// Length of a leading `scheme%3A%2F%2F` in an escaped name.
fn qualified_prefix(name: &str) -> Option<usize> {
    let scheme_len = name
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'.' | b'-'))
        .count();
    if scheme_len == 0 || !name.as_bytes()[0].is_ascii_alphabetic() {
        return None;
    }
    if name[scheme_len..].starts_with("%3A%2F%2F") {
        Some(scheme_len)
    } else {
        None
    }
}

impl MemberPath {
    /// The member name under which `urn` is stored in the volume `volume`.
    pub fn for_urn(urn: &Urn, volume: &Urn) -> MemberPath {
        let mut out = String::new();
        match urn.relative_to(volume) {
            Some(rel) => escape_into(&mut out, rel),
            None => match urn.as_str().split_once("://") {
                Some((scheme, rest)) => {
                    out.push_str(scheme);
                    out.push_str("%3A%2F%2F");
                    escape_into(&mut out, rest);
                }
                None => escape_into(&mut out, urn.as_str()),
            },
        }
        MemberPath(out)
    }

    /// Take a raw member name as found in a central directory.
    pub fn new<S: Into<String>>(name: S) -> Result<MemberPath, IntoMemberPathError> {
        let name = name.into();
        if name.is_empty() {
            return Err(IntoMemberPathError::EmptyPath);
        }
        Ok(MemberPath(name))
    }

    /// Invert [`MemberPath::for_urn`].
    pub fn to_urn(&self, volume: &Urn) -> Result<Urn, IntoMemberPathError> {
        match qualified_prefix(&self.0) {
            Some(scheme_len) => {
                let rest = unescape(&self.0[scheme_len + "%3A%2F%2F".len()..])?;
                Ok(Urn::new(format!("{}://{}", &self.0[..scheme_len], rest)))
            }
            None => Ok(volume.append(unescape(&self.0)?)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Whether this is a `properties` member (either the volume's own or a
    /// stream's `<stream>/properties`).
    pub fn is_properties(&self) -> bool {
        self.0 == "properties" || self.0.ends_with("/properties")
    }
}

impl fmt::Display for MemberPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
