//! Column data types.

use rkyv::{Archive, Deserialize, Serialize};
use std::fmt;

/// Data types a column can hold.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Boolean value.
    Bool,
    /// 16-bit signed integer.
    SmallInt,
    /// 32-bit signed integer.
    Integer,
    /// 64-bit signed integer.
    BigInt,
    /// 32-bit floating point.
    Float,
    /// 64-bit floating point.
    Double,
    /// Variable-length string with a maximum length in characters.
    Varchar(u32),
    /// Unbounded UTF-8 string.
    Text,
    /// Binary data.
    Bytea,
    /// Timestamp (microseconds since Unix epoch).
    Timestamp,
    /// UUID (128-bit identifier).
    Uuid,
}

impl DataType {
    /// Check if this type is an integer type.
    pub fn is_integer(&self) -> bool {
        matches!(self, DataType::SmallInt | DataType::Integer | DataType::BigInt)
    }

    /// Check if this type is numeric.
    pub fn is_numeric(&self) -> bool {
        self.is_integer() || matches!(self, DataType::Float | DataType::Double)
    }

    /// Check if this type holds text.
    pub fn is_text(&self) -> bool {
        matches!(self, DataType::Varchar(_) | DataType::Text)
    }

    /// Inclusive value range for integer types.
    pub fn integer_range(&self) -> Option<(i64, i64)> {
        match self {
            DataType::SmallInt => Some((i16::MIN as i64, i16::MAX as i64)),
            DataType::Integer => Some((i32::MIN as i64, i32::MAX as i64)),
            DataType::BigInt => Some((i64::MIN, i64::MAX)),
            _ => None,
        }
    }

    /// Whether values of this type can be converted to `target` at all.
    ///
    /// A `true` answer does not guarantee every value converts: narrowing
    /// conversions (shorter varchar, smaller integer, text to number) are
    /// checked per value while rows are copied.
    pub fn can_convert_to(&self, target: &DataType) -> bool {
        if self == target || target.is_text() {
            return true;
        }

        match self {
            DataType::Bool => target.is_integer(),
            DataType::SmallInt | DataType::Integer | DataType::BigInt => {
                target.is_numeric() || *target == DataType::Bool || *target == DataType::Timestamp
            }
            DataType::Float | DataType::Double => target.is_numeric(),
            DataType::Varchar(_) | DataType::Text => {
                target.is_numeric() || *target == DataType::Bool || *target == DataType::Uuid
            }
            DataType::Timestamp => *target == DataType::BigInt,
            DataType::Bytea | DataType::Uuid => false,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Bool => write!(f, "bool"),
            DataType::SmallInt => write!(f, "smallint"),
            DataType::Integer => write!(f, "integer"),
            DataType::BigInt => write!(f, "bigint"),
            DataType::Float => write!(f, "float"),
            DataType::Double => write!(f, "double"),
            DataType::Varchar(len) => write!(f, "varchar({})", len),
            DataType::Text => write!(f, "text"),
            DataType::Bytea => write!(f, "bytea"),
            DataType::Timestamp => write!(f, "timestamp"),
            DataType::Uuid => write!(f, "uuid"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_classes() {
        assert!(DataType::Integer.is_integer());
        assert!(DataType::Double.is_numeric());
        assert!(!DataType::Double.is_integer());
        assert!(DataType::Varchar(10).is_text());
        assert!(!DataType::Bytea.is_text());
    }

    #[test]
    fn test_conversions() {
        assert!(DataType::Integer.can_convert_to(&DataType::BigInt));
        assert!(DataType::BigInt.can_convert_to(&DataType::SmallInt));
        assert!(DataType::Varchar(64).can_convert_to(&DataType::Varchar(16)));
        assert!(DataType::Uuid.can_convert_to(&DataType::Text));
        assert!(!DataType::Uuid.can_convert_to(&DataType::Integer));
        assert!(!DataType::Bytea.can_convert_to(&DataType::Bool));
        assert!(!DataType::Double.can_convert_to(&DataType::Timestamp));
    }

    #[test]
    fn test_display() {
        assert_eq!(DataType::Varchar(255).to_string(), "varchar(255)");
        assert_eq!(DataType::Bool.to_string(), "bool");
    }
}
