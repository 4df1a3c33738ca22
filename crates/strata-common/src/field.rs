//! Field vectors: the ordered keys of the index.
//!
//! A field vector is the tuple of scalar values extracted from a stored
//! object. Vectors compare lexicographically, a vector that is a strict
//! prefix of another sorts first, and `Null` sorts before every other value
//! in the same position.

use bytes::Bytes;
use std::cmp::Ordering;
use std::fmt;

/// A single comparable scalar inside a field vector.
///
/// Variant order is significant: values of different kinds compare by
/// variant, so `Null` is the smallest component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Text(String),
    Bytes(Bytes),
}

impl FieldValue {
    /// Returns the encoding tag used by page codecs.
    pub fn tag(&self) -> u8 {
        match self {
            FieldValue::Null => 0,
            FieldValue::Bool(_) => 1,
            FieldValue::Int(_) => 2,
            FieldValue::UInt(_) => 3,
            FieldValue::Text(_) => 4,
            FieldValue::Bytes(_) => 5,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Bool(value) => write!(f, "{}", value),
            FieldValue::Int(value) => write!(f, "{}", value),
            FieldValue::UInt(value) => write!(f, "{}u", value),
            FieldValue::Text(value) => write!(f, "{:?}", value),
            FieldValue::Bytes(value) => write!(f, "0x{}", hex(value)),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::UInt(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<Bytes> for FieldValue {
    fn from(value: Bytes) -> Self {
        FieldValue::Bytes(value)
    }
}

/// An ordered tuple of field values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FieldVector(Vec<FieldValue>);

impl FieldVector {
    pub fn new(values: Vec<FieldValue>) -> Self {
        Self(values)
    }

    /// Returns the single-component vector `[value]`.
    pub fn of(value: impl Into<FieldValue>) -> Self {
        Self(vec![value.into()])
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_values(self) -> Vec<FieldValue> {
        self.0
    }
}

impl Ord for FieldVector {
    fn cmp(&self, other: &Self) -> Ordering {
        // Vec ordering is lexicographic with the shorter prefix first.
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for FieldVector {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromIterator<FieldValue> for FieldVector {
    fn from_iter<I: IntoIterator<Item = FieldValue>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<Vec<FieldValue>> for FieldVector {
    fn from(values: Vec<FieldValue>) -> Self {
        Self(values)
    }
}

impl fmt::Display for FieldVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lexicographic_order() {
        let a = FieldVector::new(vec![FieldValue::Int(1), FieldValue::Int(2)]);
        let b = FieldVector::new(vec![FieldValue::Int(1), FieldValue::Int(3)]);
        let c = FieldVector::new(vec![FieldValue::Int(2)]);
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn test_shorter_prefix_is_smaller() {
        let short = FieldVector::of(7i64);
        let long = FieldVector::new(vec![FieldValue::Int(7), FieldValue::Null]);
        assert!(short < long);
        assert_eq!(short.cmp(&short.clone()), Ordering::Equal);
    }

    #[test]
    fn test_null_sorts_first() {
        let null = FieldVector::new(vec![FieldValue::Null]);
        for value in [
            FieldValue::Bool(false),
            FieldValue::Int(i64::MIN),
            FieldValue::UInt(0),
            FieldValue::Text(String::new()),
            FieldValue::Bytes(Bytes::new()),
        ] {
            assert!(null < FieldVector::new(vec![value]));
        }
    }

    #[test]
    fn test_display() {
        let v = FieldVector::new(vec![
            FieldValue::Int(-3),
            FieldValue::from("abc"),
            FieldValue::Null,
            FieldValue::Bytes(Bytes::from_static(&[0xab, 0x01])),
        ]);
        assert_eq!(v.to_string(), "[-3, \"abc\", null, 0xab01]");
    }

    #[test]
    fn test_tags_are_distinct() {
        let tags: Vec<u8> = [
            FieldValue::Null,
            FieldValue::Bool(true),
            FieldValue::Int(1),
            FieldValue::UInt(1),
            FieldValue::from("x"),
            FieldValue::Bytes(Bytes::new()),
        ]
        .iter()
        .map(FieldValue::tag)
        .collect();
        assert_eq!(tags, vec![0, 1, 2, 3, 4, 5]);
    }
}
