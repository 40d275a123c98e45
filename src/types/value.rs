//! Minimal XDM value model used for result items and bound variables.
//!
//! Atomic values keep their lexical form and convert on access. Node values
//! keep their serialized bytes.

use crate::error::ConversionError;
use crate::types::ValueType;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use std::borrow::Cow;
use std::fmt;

/// A single XDM item value.
#[derive(Debug, Clone, PartialEq)]
pub enum XdmValue {
    Atomic(XdmAtomic),
    Node(XdmNode),
}

/// Atomic value in lexical form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XdmAtomic {
    value_type: ValueType,
    lexical: String,
}

/// Node value as serialized bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XdmNode {
    value_type: ValueType,
    body: Vec<u8>,
}

impl XdmAtomic {
    /// Create an atomic value, validating the lexical form where cheap.
    ///
    /// # Errors
    /// Returns `ConversionError::InvalidLexical` if the lexical form is invalid
    /// for the numeric, boolean or binary types, or if `value_type` is a node type.
    pub fn new(value_type: ValueType, lexical: impl Into<String>) -> Result<Self, ConversionError> {
        let lexical = lexical.into();
        if value_type.is_node() || !lexical_is_valid(value_type, &lexical) {
            return Err(ConversionError::InvalidLexical {
                type_name: value_type.primitive().to_string(),
                value: lexical,
            });
        }
        Ok(Self {
            value_type,
            lexical,
        })
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// The lexical form.
    pub fn as_str(&self) -> &str {
        &self.lexical
    }

    fn invalid(&self) -> ConversionError {
        ConversionError::InvalidLexical {
            type_name: self.value_type.primitive().to_string(),
            value: self.lexical.clone(),
        }
    }

    /// Convert to `i64`.
    pub fn as_i64(&self) -> Result<i64, ConversionError> {
        self.lexical.trim().parse().map_err(|_| self.invalid())
    }

    /// Convert to `f64`. Accepts `INF`, `-INF` and `NaN`.
    pub fn as_f64(&self) -> Result<f64, ConversionError> {
        parse_xs_double(&self.lexical).ok_or_else(|| self.invalid())
    }

    /// Convert to `bool`.
    pub fn as_bool(&self) -> Result<bool, ConversionError> {
        match self.lexical.trim() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(self.invalid()),
        }
    }

    /// Convert an `xs:date` to a calendar date, ignoring any timezone.
    pub fn as_date(&self) -> Result<NaiveDate, ConversionError> {
        let s = self.lexical.trim();
        let date_part = s.get(..10).unwrap_or(s);
        NaiveDate::parse_from_str(date_part, "%Y-%m-%d").map_err(|_| self.invalid())
    }

    /// Convert an `xs:dateTime`. Values without a timezone are taken as UTC.
    pub fn as_date_time(&self) -> Result<DateTime<FixedOffset>, ConversionError> {
        let s = self.lexical.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(dt);
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc().fixed_offset())
            .map_err(|_| self.invalid())
    }

    /// Decode `xs:hexBinary` or `xs:base64Binary`.
    pub fn as_bytes(&self) -> Result<Vec<u8>, ConversionError> {
        match self.value_type {
            ValueType::HexBinary => decode_hex(self.lexical.trim()).ok_or_else(|| self.invalid()),
            ValueType::Base64Binary => BASE64
                .decode(self.lexical.trim())
                .map_err(|_| self.invalid()),
            _ => Ok(self.lexical.as_bytes().to_vec()),
        }
    }

    /// Parse JSON containers and scalars.
    pub fn as_json(&self) -> Result<serde_json::Value, ConversionError> {
        match self.value_type {
            ValueType::JsonObject | ValueType::JsonArray => {
                serde_json::from_str(&self.lexical).map_err(|_| self.invalid())
            }
            ValueType::Boolean => self.as_bool().map(serde_json::Value::Bool),
            vt if vt.is_numeric() => serde_json::from_str(self.lexical.trim())
                .or_else(|_| Ok(serde_json::Value::String(self.lexical.clone()))),
            _ => Ok(serde_json::Value::String(self.lexical.clone())),
        }
    }
}

impl XdmNode {
    /// Create a node value from serialized bytes.
    ///
    /// # Errors
    /// Returns `ConversionError::UnsupportedType` if `value_type` is atomic.
    pub fn new(value_type: ValueType, body: impl Into<Vec<u8>>) -> Result<Self, ConversionError> {
        if !value_type.is_node() {
            return Err(ConversionError::UnsupportedType {
                type_name: value_type.primitive().to_string(),
            });
        }
        Ok(Self {
            value_type,
            body: body.into(),
        })
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.body
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.body
    }

    /// Serialized text of the node.
    pub fn as_text(&self) -> Result<&str, ConversionError> {
        std::str::from_utf8(&self.body)
            .map_err(|e| ConversionError::InvalidFormat(format!("node is not UTF-8: {}", e)))
    }

    /// Parse a JSON node.
    pub fn as_json(&self) -> Result<serde_json::Value, ConversionError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ConversionError::InvalidFormat(format!("node is not JSON: {}", e)))
    }
}

impl XdmValue {
    /// Build a value of `value_type` from its wire text.
    pub fn from_wire(value_type: ValueType, body: Vec<u8>) -> Result<Self, ConversionError> {
        if value_type.is_node() {
            return XdmNode::new(value_type, body).map(XdmValue::Node);
        }
        let lexical = String::from_utf8(body)
            .map_err(|e| ConversionError::InvalidFormat(format!("atomic value is not UTF-8: {}", e)))?;
        XdmAtomic::new(value_type, lexical).map(XdmValue::Atomic)
    }

    /// `xs:string` value.
    pub fn string(s: impl Into<String>) -> Self {
        XdmValue::Atomic(XdmAtomic {
            value_type: ValueType::String,
            lexical: s.into(),
        })
    }

    /// `xs:integer` value.
    pub fn integer(i: i64) -> Self {
        XdmValue::Atomic(XdmAtomic {
            value_type: ValueType::Integer,
            lexical: i.to_string(),
        })
    }

    /// `xs:double` value.
    pub fn double(d: f64) -> Self {
        let lexical = if d.is_nan() {
            "NaN".to_string()
        } else if d.is_infinite() {
            if d > 0.0 { "INF" } else { "-INF" }.to_string()
        } else {
            d.to_string()
        };
        XdmValue::Atomic(XdmAtomic {
            value_type: ValueType::Double,
            lexical,
        })
    }

    /// `xs:boolean` value.
    pub fn boolean(b: bool) -> Self {
        XdmValue::Atomic(XdmAtomic {
            value_type: ValueType::Boolean,
            lexical: b.to_string(),
        })
    }

    /// `xs:dateTime` value.
    pub fn date_time(dt: DateTime<FixedOffset>) -> Self {
        XdmValue::Atomic(XdmAtomic {
            value_type: ValueType::DateTime,
            lexical: dt.to_rfc3339(),
        })
    }

    /// JSON object or array value.
    pub fn json(value: &serde_json::Value) -> Self {
        let value_type = if value.is_array() {
            ValueType::JsonArray
        } else {
            ValueType::JsonObject
        };
        XdmValue::Atomic(XdmAtomic {
            value_type,
            lexical: value.to_string(),
        })
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            XdmValue::Atomic(a) => a.value_type,
            XdmValue::Node(n) => n.value_type,
        }
    }

    pub fn is_node(&self) -> bool {
        matches!(self, XdmValue::Node(_))
    }

    /// Text used on the wire and for display. Binary nodes are base64-encoded.
    pub fn lexical(&self) -> Cow<'_, str> {
        match self {
            XdmValue::Atomic(a) => Cow::Borrowed(&a.lexical),
            XdmValue::Node(n) if n.value_type == ValueType::Binary => {
                Cow::Owned(BASE64.encode(&n.body))
            }
            XdmValue::Node(n) => String::from_utf8_lossy(&n.body),
        }
    }

    pub fn as_atomic(&self) -> Option<&XdmAtomic> {
        match self {
            XdmValue::Atomic(a) => Some(a),
            XdmValue::Node(_) => None,
        }
    }

    pub fn as_node(&self) -> Option<&XdmNode> {
        match self {
            XdmValue::Node(n) => Some(n),
            XdmValue::Atomic(_) => None,
        }
    }
}

impl fmt::Display for XdmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lexical())
    }
}

impl From<&str> for XdmValue {
    fn from(value: &str) -> Self {
        XdmValue::string(value)
    }
}

impl From<String> for XdmValue {
    fn from(value: String) -> Self {
        XdmValue::string(value)
    }
}

impl From<i64> for XdmValue {
    fn from(value: i64) -> Self {
        XdmValue::integer(value)
    }
}

impl From<i32> for XdmValue {
    fn from(value: i32) -> Self {
        XdmValue::integer(value as i64)
    }
}

impl From<f64> for XdmValue {
    fn from(value: f64) -> Self {
        XdmValue::double(value)
    }
}

impl From<bool> for XdmValue {
    fn from(value: bool) -> Self {
        XdmValue::boolean(value)
    }
}

fn lexical_is_valid(value_type: ValueType, lexical: &str) -> bool {
    let s = lexical.trim();
    match value_type {
        ValueType::Integer => {
            let digits = s.strip_prefix(['-', '+']).unwrap_or(s);
            !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
        }
        ValueType::Decimal => {
            let body = s.strip_prefix(['-', '+']).unwrap_or(s);
            let mut parts = body.splitn(2, '.');
            let int = parts.next().unwrap_or("");
            let frac = parts.next().unwrap_or("");
            (!int.is_empty() || !frac.is_empty())
                && int.bytes().all(|b| b.is_ascii_digit())
                && frac.bytes().all(|b| b.is_ascii_digit())
        }
        ValueType::Double | ValueType::Float => parse_xs_double(s).is_some(),
        ValueType::Boolean => matches!(s, "true" | "false" | "1" | "0"),
        ValueType::HexBinary => decode_hex(s).is_some(),
        ValueType::Base64Binary => BASE64.decode(s).is_ok(),
        _ => true,
    }
}

fn parse_xs_double(s: &str) -> Option<f64> {
    match s.trim() {
        "INF" | "+INF" => Some(f64::INFINITY),
        "-INF" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        // Rust accepts "inf"/"nan" spellings the lexical space does not
        other if other.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E') => None,
        other => other.parse().ok(),
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}
