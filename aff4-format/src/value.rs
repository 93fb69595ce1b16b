use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::attrs::{self, ValueKind};
use crate::urn::Urn;

/// A typed attribute value.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Urn(Urn),
    String(String),
    Integer(u64),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn as_urn(&self) -> Option<&Urn> {
        match self {
            Value::Urn(urn) => Some(urn),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Urn(urn) => Some(urn.as_str()),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Text form used in `properties` members (before escaping).
    pub fn to_text(&self) -> String {
        match self {
            Value::Urn(urn) => urn.to_string(),
            Value::String(s) => s.clone(),
            Value::Integer(v) => v.to_string(),
            Value::Bytes(b) => hex::encode(b),
            Value::Timestamp(t) => t.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    /// Parse the text form of a value of `attr`, typed by the vocabulary.
    pub fn from_text(attr: &str, text: &str) -> Option<Value> {
        let value = match attrs::value_kind(attr) {
            ValueKind::Urn => Value::Urn(Urn::new(text)),
            ValueKind::String => Value::String(text.to_string()),
            ValueKind::Integer => Value::Integer(text.parse().ok()?),
            ValueKind::Bytes => Value::Bytes(hex::decode(text).ok()?),
            ValueKind::Timestamp => Value::Timestamp(
                DateTime::parse_from_rfc3339(text)
                    .ok()?
                    .with_timezone(&Utc),
            ),
        };
        Some(value)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Urn(urn) => write!(f, "{:?}", urn),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            Value::Timestamp(t) => write!(f, "{}", t),
        }
    }
}

impl From<Urn> for Value {
    fn from(value: Urn) -> Self {
        Value::Urn(value)
    }
}

impl From<&Urn> for Value {
    fn from(value: &Urn) -> Self {
        Value::Urn(value.clone())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Integer(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_is_typed_by_vocabulary() {
        assert_eq!(
            Value::from_text(attrs::SIZE, "42"),
            Some(Value::Integer(42))
        );
        assert_eq!(
            Value::from_text(attrs::STORED, "aff4://v"),
            Some(Value::Urn(Urn::new("aff4://v")))
        );
        assert_eq!(
            Value::from_text(attrs::SALT, "00ff"),
            Some(Value::Bytes(vec![0, 0xff]))
        );
        assert_eq!(Value::from_text(attrs::SIZE, "not a number"), None);
    }

    #[test]
    fn timestamps_use_rfc3339() {
        let t = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let v = Value::Timestamp(t);
        assert_eq!(v.to_text(), "2024-05-01T10:00:00Z");
        assert_eq!(Value::from_text(attrs::TIMESTAMP, &v.to_text()), Some(v));
    }
}
