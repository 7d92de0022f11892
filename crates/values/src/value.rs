use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bytes::Bytes;
use num_bigint::BigInt;
use num_traits::ToPrimitive;

/// A single SQL value: the tagged union behind every column of every row.
///
/// Integers that fit in 64 bits stay in the `Integer` variant; arithmetic
/// that overflows promotes into `BigInt`. Text and blob payloads are
/// reference-counted so cloning a value (and therefore a row) is cheap.
#[derive(Debug, Clone, Default)]
pub enum SqlValue {
    #[default]
    Null,
    Integer(i64),
    BigInt(Box<BigInt>),
    Float(f64),
    Text(Arc<str>),
    Blob(Bytes),
}

impl SqlValue {
    pub fn text(s: impl AsRef<str>) -> Self {
        SqlValue::Text(Arc::from(s.as_ref()))
    }

    pub fn blob(b: impl Into<Bytes>) -> Self {
        SqlValue::Blob(b.into())
    }

    /// Build the narrowest integer representation of a decimal literal.
    pub fn parse_integer(literal: &str) -> Option<Self> {
        if let Ok(i) = literal.parse::<i64>() {
            return Some(SqlValue::Integer(i));
        }
        literal
            .parse::<BigInt>()
            .ok()
            .map(|b| SqlValue::BigInt(Box::new(b)))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// The `typeof()` name of this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Integer(_) | SqlValue::BigInt(_) => "integer",
            SqlValue::Float(_) => "real",
            SqlValue::Text(_) => "text",
            SqlValue::Blob(_) => "blob",
        }
    }

    /// SQL truthiness: Null is unknown, numeric zero is false,
    /// non-numeric text coerces through its numeric prefix.
    pub fn is_truthy(&self) -> Option<bool> {
        match self {
            SqlValue::Null => None,
            SqlValue::Integer(i) => Some(*i != 0),
            SqlValue::BigInt(b) => Some(**b != BigInt::from(0)),
            SqlValue::Float(f) => Some(*f != 0.0),
            SqlValue::Text(t) => Some(numeric_prefix(t) != 0.0),
            SqlValue::Blob(_) => Some(false),
        }
    }

    /// Lossy conversion to f64, for numeric comparison and REAL affinity.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Integer(i) => Some(*i as f64),
            SqlValue::BigInt(b) => b.to_f64(),
            SqlValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Exact i64 view, when the value is an integer in range.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            SqlValue::BigInt(b) => b.to_i64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Canonicalize: a BigInt that fits i64 becomes Integer. Keys and
    /// hashing rely on this so that equal numerics collapse together.
    pub fn normalized(self) -> Self {
        match self {
            SqlValue::BigInt(b) => match b.to_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::BigInt(b),
            },
            other => other,
        }
    }
}

/// Parse the leading numeric prefix of text, SQLite-style: "12abc" is 12,
/// "abc" is 0.
pub(crate) fn numeric_prefix(text: &str) -> f64 {
    let trimmed = text.trim_start();
    let mut end = 0;
    let bytes = trimmed.as_bytes();
    let mut seen_dot = false;
    let mut seen_exp = false;
    while end < bytes.len() {
        let c = bytes[end] as char;
        let ok = c.is_ascii_digit()
            || (end == 0 && (c == '+' || c == '-'))
            || (c == '.' && !seen_dot && !seen_exp)
            || ((c == 'e' || c == 'E') && !seen_exp && end > 0)
            || ((c == '+' || c == '-') && end > 0 && matches!(bytes[end - 1], b'e' | b'E'));
        if !ok {
            break;
        }
        seen_dot |= c == '.';
        seen_exp |= c == 'e' || c == 'E';
        end += 1;
    }
    trimmed[..end].parse::<f64>().unwrap_or(0.0)
}

impl PartialEq for SqlValue {
    fn eq(&self, other: &Self) -> bool {
        crate::compare(self, other) == std::cmp::Ordering::Equal
    }
}

impl Eq for SqlValue {}

impl PartialOrd for SqlValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(crate::compare(self, other))
    }
}

impl Ord for SqlValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        crate::compare(self, other)
    }
}

impl Hash for SqlValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Hash must agree with the cross-type numeric equality of compare():
        // 1, 1-as-BigInt and 1.0 all hash identically.
        match self {
            SqlValue::Null => state.write_u8(0),
            SqlValue::Integer(i) => {
                state.write_u8(1);
                state.write_i64(*i);
            }
            SqlValue::BigInt(b) => match b.to_i64() {
                Some(i) => {
                    state.write_u8(1);
                    state.write_i64(i);
                }
                None => {
                    state.write_u8(2);
                    b.hash(state);
                }
            },
            SqlValue::Float(f) => {
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    state.write_u8(1);
                    state.write_i64(*f as i64);
                } else {
                    state.write_u8(3);
                    state.write_u64(f.to_bits());
                }
            }
            SqlValue::Text(t) => {
                state.write_u8(4);
                t.hash(state);
            }
            SqlValue::Blob(b) => {
                state.write_u8(5);
                b.hash(state);
            }
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Integer(i) => write!(f, "{i}"),
            SqlValue::BigInt(b) => write!(f, "{b}"),
            SqlValue::Float(v) => write!(f, "{v}"),
            SqlValue::Text(t) => write!(f, "{t}"),
            SqlValue::Blob(b) => {
                write!(f, "x'")?;
                for byte in b.iter() {
                    write!(f, "{byte:02x}")?;
                }
                write!(f, "'")
            }
        }
    }
}

impl serde::Serialize for SqlValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SqlValue::Null => serializer.serialize_unit(),
            SqlValue::Integer(i) => serializer.serialize_i64(*i),
            SqlValue::BigInt(b) => match b.to_i64() {
                Some(i) => serializer.serialize_i64(i),
                None => serializer.serialize_str(&b.to_string()),
            },
            SqlValue::Float(v) => serializer.serialize_f64(*v),
            SqlValue::Text(t) => serializer.serialize_str(t),
            SqlValue::Blob(b) => {
                let hex: String = b.iter().map(|byte| format!("{byte:02x}")).collect();
                serializer.serialize_str(&hex)
            }
        }
    }
}

impl From<i64> for SqlValue {
    fn from(i: i64) -> Self {
        SqlValue::Integer(i)
    }
}

impl From<f64> for SqlValue {
    fn from(f: f64) -> Self {
        SqlValue::Float(f)
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::text(s)
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        SqlValue::Text(Arc::from(s.as_str()))
    }
}

impl From<BigInt> for SqlValue {
    fn from(b: BigInt) -> Self {
        SqlValue::BigInt(Box::new(b)).normalized()
    }
}

impl From<Option<SqlValue>> for SqlValue {
    fn from(v: Option<SqlValue>) -> Self {
        v.unwrap_or(SqlValue::Null)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert_eq!(SqlValue::Null.is_truthy(), None);
        assert_eq!(SqlValue::Integer(0).is_truthy(), Some(false));
        assert_eq!(SqlValue::Integer(-3).is_truthy(), Some(true));
        assert_eq!(SqlValue::Float(0.0).is_truthy(), Some(false));
        assert_eq!(SqlValue::text("12abc").is_truthy(), Some(true));
        assert_eq!(SqlValue::text("abc").is_truthy(), Some(false));
    }

    #[test]
    fn test_parse_integer() {
        assert_eq!(
            SqlValue::parse_integer("42"),
            Some(SqlValue::Integer(42))
        );
        let big = SqlValue::parse_integer("123456789012345678901234567890").unwrap();
        assert!(matches!(big, SqlValue::BigInt(_)));
        assert_eq!(SqlValue::parse_integer("nope"), None);
    }

    #[test]
    fn test_normalized_collapses_small_bigints() {
        let v = SqlValue::BigInt(Box::new(BigInt::from(7))).normalized();
        assert!(matches!(v, SqlValue::Integer(7)));
    }

    #[test]
    fn test_display() {
        assert_eq!(SqlValue::Integer(7).to_string(), "7");
        assert_eq!(SqlValue::text("hi").to_string(), "hi");
        assert_eq!(SqlValue::blob(vec![0xde, 0xad]).to_string(), "x'dead'");
    }
}
