use crate::SqlValue;

/// Column type affinity, derived from the declared type name with the
/// SQLite rules and applied to values as they're stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeAffinity {
    Integer,
    Real,
    Text,
    Blob,
    #[default]
    Numeric,
}

impl TypeAffinity {
    /// Derive affinity from a declared type name. Rule order matters:
    /// "INT" wins over "POINT"-style containment only because the rules
    /// are applied in sequence, exactly as the reference algorithm does.
    pub fn from_type_name(name: &str) -> Self {
        let upper = name.to_ascii_uppercase();
        if upper.contains("INT") {
            TypeAffinity::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            TypeAffinity::Text
        } else if upper.contains("BLOB") || upper.is_empty() {
            TypeAffinity::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            TypeAffinity::Real
        } else {
            TypeAffinity::Numeric
        }
    }

    /// Coerce |value| into this affinity where the conversion is lossless
    /// (or, for REAL, the standard int→float widening). Values that don't
    /// convert are stored as-is.
    pub fn apply(&self, value: SqlValue) -> SqlValue {
        match self {
            TypeAffinity::Integer | TypeAffinity::Numeric => match value {
                SqlValue::Text(t) => match coerce_text_numeric(&t) {
                    Some(v) => v,
                    None => SqlValue::Text(t),
                },
                SqlValue::Float(f) => {
                    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                        SqlValue::Integer(f as i64)
                    } else {
                        SqlValue::Float(f)
                    }
                }
                other => other,
            },
            TypeAffinity::Real => match value {
                SqlValue::Integer(i) => SqlValue::Float(i as f64),
                SqlValue::Text(t) => match coerce_text_numeric(&t) {
                    Some(v) => match v.as_f64() {
                        Some(f) => SqlValue::Float(f),
                        None => SqlValue::Text(t),
                    },
                    None => SqlValue::Text(t),
                },
                other => other,
            },
            TypeAffinity::Text => match value {
                SqlValue::Integer(_) | SqlValue::BigInt(_) | SqlValue::Float(_) => {
                    SqlValue::text(value.to_string())
                }
                other => other,
            },
            TypeAffinity::Blob => value,
        }
    }
}

/// Text that is *exactly* a numeric literal converts; anything else stays text.
fn coerce_text_numeric(text: &str) -> Option<SqlValue> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(v) = SqlValue::parse_integer(trimmed) {
        return Some(v);
    }
    trimmed.parse::<f64>().ok().map(SqlValue::Float)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_affinity_from_type_name() {
        assert_eq!(TypeAffinity::from_type_name("INTEGER"), TypeAffinity::Integer);
        assert_eq!(TypeAffinity::from_type_name("BigInt"), TypeAffinity::Integer);
        assert_eq!(TypeAffinity::from_type_name("VARCHAR(40)"), TypeAffinity::Text);
        assert_eq!(TypeAffinity::from_type_name("BLOB"), TypeAffinity::Blob);
        assert_eq!(TypeAffinity::from_type_name(""), TypeAffinity::Blob);
        assert_eq!(TypeAffinity::from_type_name("DOUBLE"), TypeAffinity::Real);
        assert_eq!(TypeAffinity::from_type_name("DECIMAL(10,2)"), TypeAffinity::Numeric);
    }

    #[test]
    fn test_apply_integer_affinity() {
        let a = TypeAffinity::Integer;
        assert_eq!(a.apply(SqlValue::text("42")), SqlValue::Integer(42));
        assert_eq!(a.apply(SqlValue::Float(3.0)), SqlValue::Integer(3));
        assert_eq!(a.apply(SqlValue::Float(3.5)), SqlValue::Float(3.5));
        assert_eq!(a.apply(SqlValue::text("4x")), SqlValue::text("4x"));
    }

    #[test]
    fn test_apply_is_idempotent() {
        for affinity in [
            TypeAffinity::Integer,
            TypeAffinity::Real,
            TypeAffinity::Text,
            TypeAffinity::Blob,
            TypeAffinity::Numeric,
        ] {
            for value in [
                SqlValue::Null,
                SqlValue::Integer(7),
                SqlValue::Float(1.25),
                SqlValue::text("7.5"),
                SqlValue::blob(vec![1u8, 2]),
            ] {
                let once = affinity.apply(value.clone());
                let twice = affinity.apply(once.clone());
                assert_eq!(once, twice, "{affinity:?} over {value:?}");
            }
        }
    }

    #[test]
    fn test_apply_real_and_text() {
        assert_eq!(
            TypeAffinity::Real.apply(SqlValue::Integer(2)),
            SqlValue::Float(2.0)
        );
        assert_eq!(
            TypeAffinity::Text.apply(SqlValue::Integer(2)),
            SqlValue::text("2")
        );
    }
}
