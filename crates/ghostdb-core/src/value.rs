//! Scalar values stored in rows, and their primary-key encoding.

use crate::catalog::DataType;
use crate::error::Error;
use rkyv::{Archive, Deserialize, Serialize};
use std::fmt;

/// A single column value.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer of any width.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Binary data.
    Bytes(Vec<u8>),
    /// Timestamp as microseconds since Unix epoch.
    Timestamp(i64),
    /// UUID as 16 bytes.
    Uuid([u8; 16]),
}

/// Type tag for encoded key components.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyTag {
    Null = 0,
    Bool = 1,
    Int = 2,
    Float = 3,
    String = 4,
    Bytes = 5,
    Timestamp = 6,
    Uuid = 7,
}

impl TryFrom<u8> for KeyTag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(KeyTag::Null),
            1 => Ok(KeyTag::Bool),
            2 => Ok(KeyTag::Int),
            3 => Ok(KeyTag::Float),
            4 => Ok(KeyTag::String),
            5 => Ok(KeyTag::Bytes),
            6 => Ok(KeyTag::Timestamp),
            7 => Ok(KeyTag::Uuid),
            _ => Err(Error::InvalidData(format!("unknown key tag: {}", value))),
        }
    }
}

const SIGN_BIT: u64 = 1 << 63;

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the value's kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Timestamp(_) => "timestamp",
            Value::Uuid(_) => "uuid",
        }
    }

    /// Check a value against a column type, normalizing where the
    /// representation is unambiguous (integers stored in float columns).
    ///
    /// Returns the reason on failure.
    pub fn coerce_to(self, data_type: &DataType) -> Result<Value, String> {
        match (self, data_type) {
            (Value::Null, _) => Ok(Value::Null),
            (Value::Bool(b), DataType::Bool) => Ok(Value::Bool(b)),
            (Value::Int(i), dt) if dt.is_integer() => {
                let (min, max) = dt.integer_range().unwrap_or((i64::MIN, i64::MAX));
                if i < min || i > max {
                    Err(format!("{} is out of range", i))
                } else {
                    Ok(Value::Int(i))
                }
            }
            (Value::Int(i), DataType::Float | DataType::Double) => Ok(Value::Float(i as f64)),
            (Value::Float(f), DataType::Float | DataType::Double) => Ok(Value::Float(f)),
            (Value::String(s), DataType::Varchar(len)) => {
                let chars = s.chars().count();
                if chars > *len as usize {
                    Err(format!("{} characters exceed the limit of {}", chars, len))
                } else {
                    Ok(Value::String(s))
                }
            }
            (Value::String(s), DataType::Text) => Ok(Value::String(s)),
            (Value::Bytes(b), DataType::Bytea) => Ok(Value::Bytes(b)),
            (Value::Timestamp(t), DataType::Timestamp) => Ok(Value::Timestamp(t)),
            (Value::Uuid(u), DataType::Uuid) => Ok(Value::Uuid(u)),
            (value, dt) => Err(format!("{} value cannot be stored as {}", value.kind(), dt)),
        }
    }

    /// Convert a value to another column type, as done when a column's
    /// type is altered.
    pub fn cast(&self, target: &DataType) -> Result<Value, Error> {
        let fail = || Error::Conversion {
            value: self.to_string(),
            target: target.to_string(),
        };

        let converted = match (self, target) {
            (Value::Null, _) => Value::Null,

            (_, DataType::Varchar(_) | DataType::Text) => Value::String(self.render()),

            (Value::Bool(b), DataType::Bool) => Value::Bool(*b),
            (Value::Int(i), DataType::Bool) => match i {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                _ => return Err(fail()),
            },
            (Value::String(s), DataType::Bool) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "1" | "yes" => Value::Bool(true),
                "false" | "f" | "0" | "no" => Value::Bool(false),
                _ => return Err(fail()),
            },

            (Value::Int(i), dt) if dt.is_integer() => Value::Int(*i),
            (Value::Bool(b), dt) if dt.is_integer() => Value::Int(i64::from(*b)),
            (Value::Float(f), dt) if dt.is_integer() => {
                if f.fract() != 0.0 || !f.is_finite() {
                    return Err(fail());
                }
                Value::Int(*f as i64)
            }
            (Value::Timestamp(t), dt) if dt.is_integer() => Value::Int(*t),
            (Value::String(s), dt) if dt.is_integer() => {
                Value::Int(s.trim().parse::<i64>().map_err(|_| fail())?)
            }

            (Value::Int(i), DataType::Float | DataType::Double) => Value::Float(*i as f64),
            (Value::Float(f), DataType::Float | DataType::Double) => Value::Float(*f),
            (Value::String(s), DataType::Float | DataType::Double) => {
                Value::Float(s.trim().parse::<f64>().map_err(|_| fail())?)
            }

            (Value::Bytes(b), DataType::Bytea) => Value::Bytes(b.clone()),

            (Value::Timestamp(t), DataType::Timestamp) => Value::Timestamp(*t),
            (Value::Int(i), DataType::Timestamp) => Value::Timestamp(*i),

            (Value::Uuid(u), DataType::Uuid) => Value::Uuid(*u),
            (Value::String(s), DataType::Uuid) => {
                let digits: String = s.chars().filter(|c| *c != '-').collect();
                let bytes = hex::decode(digits).map_err(|_| fail())?;
                let uuid: [u8; 16] = bytes.try_into().map_err(|_| fail())?;
                Value::Uuid(uuid)
            }

            _ => return Err(fail()),
        };

        // Narrowing conversions must still fit the target column.
        converted.coerce_to(target).map_err(|_| fail())
    }

    /// Render the value as text, as a text-typed column would store it.
    fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Bytes(b) => format!("\\x{}", hex::encode(b)),
            Value::Timestamp(t) => t.to_string(),
            Value::Uuid(u) => format_uuid(u),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::String(s) => write!(f, "'{}'", s),
            other => write!(f, "{}", other.render()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

fn format_uuid(bytes: &[u8; 16]) -> String {
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Encode primary-key values so that byte order matches value order.
///
/// Format per component: `[tag (1 byte)][payload]`. Integers and timestamps
/// are big-endian with the sign bit flipped; strings and bytes escape `0x00`
/// as `0x00 0xFF` and end with `0x00 0x00`.
pub fn encode_key(values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 9);
    for value in values {
        match value {
            Value::Null => buf.push(KeyTag::Null as u8),
            Value::Bool(b) => {
                buf.push(KeyTag::Bool as u8);
                buf.push(u8::from(*b));
            }
            Value::Int(i) => {
                buf.push(KeyTag::Int as u8);
                buf.extend_from_slice(&((*i as u64) ^ SIGN_BIT).to_be_bytes());
            }
            Value::Float(f) => {
                buf.push(KeyTag::Float as u8);
                let bits = f.to_bits();
                let ordered = if bits & SIGN_BIT != 0 { !bits } else { bits ^ SIGN_BIT };
                buf.extend_from_slice(&ordered.to_be_bytes());
            }
            Value::String(s) => {
                buf.push(KeyTag::String as u8);
                escape_into(&mut buf, s.as_bytes());
            }
            Value::Bytes(b) => {
                buf.push(KeyTag::Bytes as u8);
                escape_into(&mut buf, b);
            }
            Value::Timestamp(t) => {
                buf.push(KeyTag::Timestamp as u8);
                buf.extend_from_slice(&((*t as u64) ^ SIGN_BIT).to_be_bytes());
            }
            Value::Uuid(u) => {
                buf.push(KeyTag::Uuid as u8);
                buf.extend_from_slice(u);
            }
        }
    }
    buf
}

/// Decode a key produced by [`encode_key`] back into its values.
pub fn decode_key(data: &[u8]) -> Result<Vec<Value>, Error> {
    let mut values = Vec::new();
    let mut cursor = 0;

    while cursor < data.len() {
        let tag = KeyTag::try_from(data[cursor])?;
        cursor += 1;

        let value = match tag {
            KeyTag::Null => Value::Null,
            KeyTag::Bool => {
                let byte = *data
                    .get(cursor)
                    .ok_or_else(|| Error::InvalidData("key too short for bool".into()))?;
                cursor += 1;
                Value::Bool(byte != 0)
            }
            KeyTag::Int | KeyTag::Timestamp => {
                let raw = read_u64(data, cursor)? ^ SIGN_BIT;
                cursor += 8;
                if tag == KeyTag::Int {
                    Value::Int(raw as i64)
                } else {
                    Value::Timestamp(raw as i64)
                }
            }
            KeyTag::Float => {
                let ordered = read_u64(data, cursor)?;
                cursor += 8;
                let bits = if ordered & SIGN_BIT != 0 {
                    ordered ^ SIGN_BIT
                } else {
                    !ordered
                };
                Value::Float(f64::from_bits(bits))
            }
            KeyTag::String => {
                let (bytes, read) = unescape(&data[cursor..])?;
                cursor += read;
                Value::String(
                    String::from_utf8(bytes)
                        .map_err(|_| Error::InvalidData("invalid UTF-8 in key".into()))?,
                )
            }
            KeyTag::Bytes => {
                let (bytes, read) = unescape(&data[cursor..])?;
                cursor += read;
                Value::Bytes(bytes)
            }
            KeyTag::Uuid => {
                let uuid: [u8; 16] = data
                    .get(cursor..cursor + 16)
                    .and_then(|slice| slice.try_into().ok())
                    .ok_or_else(|| Error::InvalidData("key too short for uuid".into()))?;
                cursor += 16;
                Value::Uuid(uuid)
            }
        };
        values.push(value);
    }

    Ok(values)
}

fn read_u64(data: &[u8], cursor: usize) -> Result<u64, Error> {
    data.get(cursor..cursor + 8)
        .and_then(|slice| slice.try_into().ok())
        .map(u64::from_be_bytes)
        .ok_or_else(|| Error::InvalidData("key too short for 8-byte value".into()))
}

fn unescape(data: &[u8]) -> Result<(Vec<u8>, usize), Error> {
    let mut out = Vec::new();
    let mut cursor = 0;
    loop {
        let byte = *data
            .get(cursor)
            .ok_or_else(|| Error::InvalidData("unterminated key component".into()))?;
        if byte != 0 {
            out.push(byte);
            cursor += 1;
            continue;
        }
        match data.get(cursor + 1) {
            Some(0) => return Ok((out, cursor + 2)),
            Some(0xFF) => {
                out.push(0);
                cursor += 2;
            }
            _ => return Err(Error::InvalidData("invalid escape in key component".into())),
        }
    }
}

fn escape_into(buf: &mut Vec<u8>, bytes: &[u8]) {
    for &byte in bytes {
        buf.push(byte);
        if byte == 0 {
            buf.push(0xFF);
        }
    }
    buf.extend_from_slice(&[0, 0]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_checks_ranges_and_lengths() {
        assert_eq!(
            Value::Int(5).coerce_to(&DataType::SmallInt).unwrap(),
            Value::Int(5)
        );
        assert!(Value::Int(70_000).coerce_to(&DataType::SmallInt).is_err());
        assert_eq!(
            Value::Int(2).coerce_to(&DataType::Double).unwrap(),
            Value::Float(2.0)
        );
        assert!(Value::String("abcdef".into())
            .coerce_to(&DataType::Varchar(3))
            .is_err());
        assert!(Value::Bool(true).coerce_to(&DataType::Text).is_err());
        assert_eq!(Value::Null.coerce_to(&DataType::Uuid).unwrap(), Value::Null);
    }

    #[test]
    fn test_cast_between_types() {
        assert_eq!(
            Value::Int(42).cast(&DataType::Text).unwrap(),
            Value::String("42".into())
        );
        assert_eq!(
            Value::String(" 17 ".into()).cast(&DataType::Integer).unwrap(),
            Value::Int(17)
        );
        assert_eq!(
            Value::String("t".into()).cast(&DataType::Bool).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            Value::Float(3.0).cast(&DataType::BigInt).unwrap(),
            Value::Int(3)
        );
        assert!(Value::Float(3.5).cast(&DataType::BigInt).is_err());
        assert!(Value::String("toolong".into())
            .cast(&DataType::Varchar(4))
            .is_err());
        assert_eq!(Value::Null.cast(&DataType::Bool).unwrap(), Value::Null);
    }

    #[test]
    fn test_uuid_text_roundtrip() {
        let uuid = Value::Uuid([0xab; 16]);
        let text = uuid.cast(&DataType::Text).unwrap();
        assert_eq!(
            text,
            Value::String("abababab-abab-abab-abab-abababababab".into())
        );
        assert_eq!(text.cast(&DataType::Uuid).unwrap(), uuid);
    }

    #[test]
    fn test_key_ordering_matches_value_ordering() {
        let ints = [-300i64, -1, 0, 1, 250, i64::MAX];
        let encoded: Vec<_> = ints.iter().map(|i| encode_key(&[Value::Int(*i)])).collect();
        assert!(encoded.windows(2).all(|w| w[0] < w[1]));

        let floats = [-2.5f64, -0.5, 0.0, 0.25, 10.0];
        let encoded: Vec<_> = floats
            .iter()
            .map(|f| encode_key(&[Value::Float(*f)]))
            .collect();
        assert!(encoded.windows(2).all(|w| w[0] < w[1]));

        let a = encode_key(&[Value::String("ab".into()), Value::Int(9)]);
        let b = encode_key(&[Value::String("abc".into()), Value::Int(1)]);
        assert!(a < b);
    }

    #[test]
    fn test_decode_key() {
        let values = vec![
            Value::Int(-42),
            Value::String("a\0b".into()),
            Value::Float(-1.5),
            Value::Bool(true),
            Value::Uuid([7; 16]),
            Value::Null,
        ];
        assert_eq!(decode_key(&encode_key(&values)).unwrap(), values);
        assert!(decode_key(&[9]).is_err());
    }

    #[test]
    fn test_key_escapes_zero_bytes() {
        let a = encode_key(&[Value::Bytes(vec![0]), Value::Int(1)]);
        let b = encode_key(&[Value::Bytes(vec![]), Value::Int(1)]);
        assert_ne!(a, b);
        assert!(b < a);
    }
}
