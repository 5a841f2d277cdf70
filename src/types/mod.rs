//! PostgreSQL text-format value decoding.
//!
//! Every value in a query result arrives as text. `decode` maps a type OID and
//! that text to a native [`Value`]; it is total and never fails. Anything it
//! cannot interpret is returned as the raw text.
//!
//! - `array`: recursive-descent parser for array literals
//! - `timestamp`: date/timestamp parser (fractions, offsets, BC, infinities)
//! - `encode`: the reverse direction, rendering values as wire text

pub mod array;
pub mod encode;
pub mod timestamp;

use bytes::Bytes;
use chrono::{DateTime, Utc};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub u32);

impl Oid {
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const JSON_ARRAY: Oid = Oid(199);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const BOOL_ARRAY: Oid = Oid(1000);
    pub const BYTEA_ARRAY: Oid = Oid(1001);
    pub const CHAR_ARRAY: Oid = Oid(1002);
    pub const INT2_ARRAY: Oid = Oid(1005);
    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);
    pub const BPCHAR_ARRAY: Oid = Oid(1014);
    pub const VARCHAR_ARRAY: Oid = Oid(1015);
    pub const INT8_ARRAY: Oid = Oid(1016);
    pub const FLOAT4_ARRAY: Oid = Oid(1021);
    pub const FLOAT8_ARRAY: Oid = Oid(1022);
    pub const OID_ARRAY: Oid = Oid(1028);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMP_ARRAY: Oid = Oid(1115);
    pub const DATE_ARRAY: Oid = Oid(1182);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const TIMESTAMPTZ_ARRAY: Oid = Oid(1185);
    pub const JSONB: Oid = Oid(3802);
    pub const JSONB_ARRAY: Oid = Oid(3807);

    /// Decode category for this type.
    pub fn category(self) -> Category {
        use Category::{Array, Scalar as S, Unknown};
        match self {
            Oid::BOOL => S(Scalar::Bool),
            Oid::BYTEA => S(Scalar::Bytea),
            Oid::INT2 | Oid::INT4 | Oid::INT8 | Oid::OID => S(Scalar::Int),
            Oid::FLOAT4 | Oid::FLOAT8 => S(Scalar::Float),
            Oid::TEXT | Oid::CHAR | Oid::NAME | Oid::BPCHAR | Oid::VARCHAR => S(Scalar::Text),
            Oid::JSON | Oid::JSONB => S(Scalar::Json),
            Oid::DATE | Oid::TIMESTAMP | Oid::TIMESTAMPTZ => S(Scalar::Timestamp),

            Oid::BOOL_ARRAY => Array(Scalar::Bool),
            Oid::BYTEA_ARRAY => Array(Scalar::Bytea),
            Oid::INT2_ARRAY | Oid::INT4_ARRAY | Oid::INT8_ARRAY | Oid::OID_ARRAY => {
                Array(Scalar::Int)
            }
            Oid::FLOAT4_ARRAY | Oid::FLOAT8_ARRAY => Array(Scalar::Float),
            Oid::TEXT_ARRAY | Oid::CHAR_ARRAY | Oid::BPCHAR_ARRAY | Oid::VARCHAR_ARRAY => {
                Array(Scalar::Text)
            }
            Oid::JSON_ARRAY | Oid::JSONB_ARRAY => Array(Scalar::Json),
            Oid::DATE_ARRAY | Oid::TIMESTAMP_ARRAY | Oid::TIMESTAMPTZ_ARRAY => {
                Array(Scalar::Timestamp)
            }
            _ => Unknown,
        }
    }
}

// ============================================================================
// Decode dispatch
// ============================================================================

/// Decoders for the closed set of scalar wire categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    Bool,
    Int,
    Float,
    Text,
    Bytea,
    Timestamp,
    Json,
}

/// How a column of a given type is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Scalar(Scalar),
    /// Array literal whose elements use the given scalar decoder.
    Array(Scalar),
    /// Not a well-known type: array-shaped text becomes a text array,
    /// anything else is passed through verbatim.
    Unknown,
}

/// Integers longer than this many characters may not fit a double's
/// integer range on the consumer side, so they stay as text.
pub const MAX_INT_LEN: usize = 15;

impl Scalar {
    pub fn decode(self, text: &[u8]) -> Value {
        match self {
            Scalar::Bool => Value::Bool(text.first() == Some(&b't')),
            Scalar::Int => decode_int(text),
            Scalar::Float => decode_float(text),
            Scalar::Text => Value::Text(lossy(text)),
            Scalar::Bytea => decode_bytea(text),
            Scalar::Timestamp => timestamp::decode(text),
            Scalar::Json => decode_json(text),
        }
    }
}

/// Decode the text representation of a value of type `oid`.
pub fn decode(oid: Oid, text: &[u8]) -> Value {
    match oid.category() {
        Category::Scalar(scalar) => scalar.decode(text),
        Category::Array(element) => array::decode(text, element),
        Category::Unknown if array::looks_like_array(text) => array::decode(text, Scalar::Text),
        Category::Unknown => Value::Text(lossy(text)),
    }
}

fn lossy(text: &[u8]) -> String {
    String::from_utf8_lossy(text).into_owned()
}

fn decode_int(text: &[u8]) -> Value {
    if text.len() > MAX_INT_LEN {
        return Value::Text(lossy(text));
    }
    std::str::from_utf8(text)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .map_or_else(|| Value::Text(lossy(text)), Value::Int)
}

fn decode_float(text: &[u8]) -> Value {
    std::str::from_utf8(text)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .map_or_else(|| Value::Text(lossy(text)), Value::Float)
}

fn decode_json(text: &[u8]) -> Value {
    serde_json::from_slice(text).map_or_else(|_| Value::Text(lossy(text)), Value::Json)
}

#[inline]
fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// `\x` followed by hex pairs. Text without the marker is the legacy escape
/// format and is kept as raw bytes.
fn decode_bytea(text: &[u8]) -> Value {
    let Some(hex) = text.strip_prefix(b"\\x") else {
        return Value::Bytes(Bytes::copy_from_slice(text));
    };
    if hex.len() % 2 != 0 {
        return Value::Text(lossy(text));
    }
    let decoded: Option<Vec<u8>> = hex
        .chunks_exact(2)
        .map(|pair| Some(nibble(pair[0])? << 4 | nibble(pair[1])?))
        .collect();
    match decoded {
        Some(bytes) => Value::Bytes(Bytes::from(bytes)),
        None => Value::Text(lossy(text)),
    }
}

// ============================================================================
// Native values
// ============================================================================

/// A point in time as reported by the server, including the infinities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Timestamp {
    NegInfinity,
    At(DateTime<Utc>),
    Infinity,
}

impl Timestamp {
    /// Milliseconds since the Unix epoch; `None` for the infinities.
    pub fn epoch_millis(&self) -> Option<i64> {
        match self {
            Timestamp::At(t) => Some(t.timestamp_millis()),
            _ => None,
        }
    }
}

/// A decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
    Timestamp(Timestamp),
    Json(serde_json::Value),
    Array(Vec<Value>),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_categories() {
        assert_eq!(Oid::INT4.category(), Category::Scalar(Scalar::Int));
        assert_eq!(Oid::OID.category(), Category::Scalar(Scalar::Int));
        assert_eq!(Oid::VARCHAR_ARRAY.category(), Category::Array(Scalar::Text));
        assert_eq!(Oid::TIMESTAMPTZ.category(), Category::Scalar(Scalar::Timestamp));
        assert_eq!(Oid(2950).category(), Category::Unknown);
    }

    #[test]
    fn test_bool_checks_first_char() {
        assert_eq!(decode(Oid::BOOL, b"t"), Value::Bool(true));
        assert_eq!(decode(Oid::BOOL, b"f"), Value::Bool(false));
        assert_eq!(decode(Oid::BOOL, b""), Value::Bool(false));
    }

    #[test]
    fn test_int_precision_boundary() {
        assert_eq!(decode(Oid::INT8, b"912345678912345"), Value::Int(912345678912345));
        assert_eq!(
            decode(Oid::INT8, b"9123456789123456"),
            Value::Text("9123456789123456".to_string())
        );
        assert_eq!(decode(Oid::INT2, b"-1234"), Value::Int(-1234));
        assert_eq!(decode(Oid::INT4, b"12x"), Value::Text("12x".to_string()));
    }

    #[test]
    fn test_float_parse() {
        assert_eq!(decode(Oid::FLOAT8, b"-1234e-200"), Value::Float(-1234e-200));
        assert_eq!(decode(Oid::FLOAT4, b"12.34"), Value::Float(12.34));
        assert_eq!(decode(Oid::FLOAT8, b"Infinity"), Value::Float(f64::INFINITY));
        assert!(matches!(decode(Oid::FLOAT8, b"NaN"), Value::Float(v) if v.is_nan()));
    }

    #[test]
    fn test_bytea_hex() {
        assert_eq!(
            decode(Oid::BYTEA, b"\\xff00"),
            Value::Bytes(Bytes::from_static(&[0xff, 0x00]))
        );
        assert_eq!(
            decode(Oid::BYTEA, b"\\x000102FF"),
            Value::Bytes(Bytes::from_static(&[0, 1, 2, 255]))
        );
        assert_eq!(decode(Oid::BYTEA, b"\\x"), Value::Bytes(Bytes::new()));
        assert_eq!(decode(Oid::BYTEA, b"\\xfg"), Value::Text("\\xfg".to_string()));
    }

    #[test]
    fn test_json() {
        assert_eq!(
            decode(Oid::JSONB, br#"{"a": 1, "b": [1,2]}"#),
            Value::Json(serde_json::json!({"a": 1, "b": [1, 2]}))
        );
        assert_eq!(decode(Oid::JSON, b"true"), Value::Json(serde_json::json!(true)));
        assert_eq!(decode(Oid::JSON, b"{oops"), Value::Text("{oops".to_string()));
    }

    #[test]
    fn test_unknown_types_pass_through() {
        let uuid = b"a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11";
        assert_eq!(
            decode(Oid(2950), uuid),
            Value::Text(String::from_utf8_lossy(uuid).into_owned())
        );
        assert_eq!(
            decode(Oid(99999), b"{x,y}"),
            Value::Array(vec![Value::from("x"), Value::from("y")])
        );
        assert_eq!(decode(Oid(99999), b"{"), Value::Text("{".to_string()));
    }
}
