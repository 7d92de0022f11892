use std::cmp::Ordering;

use catalog::TableSchema;
use values::{compare, Collation, SqlValue};

/// One component of a composite key. The stored value has its collation
/// already folded in, and `descending` inverts the component's ordering
/// so the tree's natural order matches the schema's declared key order.
#[derive(Debug, Clone)]
pub struct KeyPart {
    pub value: SqlValue,
    pub descending: bool,
}

impl KeyPart {
    pub fn new(value: SqlValue, descending: bool, collation: Collation) -> Self {
        let value = match value {
            SqlValue::Text(t) => SqlValue::Text(collation.fold(&t)),
            other => other,
        };
        KeyPart { value, descending }
    }
}

impl PartialEq for KeyPart {
    fn eq(&self, other: &Self) -> bool {
        compare(&self.value, &other.value) == Ordering::Equal
    }
}
impl Eq for KeyPart {}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> Ordering {
        let ordering = compare(&self.value, &other.value);
        if self.descending {
            ordering.reverse()
        } else {
            ordering
        }
    }
}

/// A composite key: parts compare lexicographically, so a bare prefix
/// sorts immediately before every key it prefixes.
pub type Key = Vec<KeyPart>;

/// Extract the primary key of |row| per the table schema.
pub fn primary_key(schema: &TableSchema, row: &[SqlValue]) -> Key {
    schema
        .primary_key
        .iter()
        .map(|part| {
            KeyPart::new(
                row.get(part.column).cloned().unwrap_or(SqlValue::Null),
                part.descending,
                part.collation,
            )
        })
        .collect()
}

/// Extract the key of |row| for the named secondary index.
pub fn index_key(schema: &TableSchema, index_name: &str, row: &[SqlValue]) -> Key {
    let Some(index) = schema.index(index_name) else {
        return Key::new();
    };
    index
        .parts
        .iter()
        .map(|part| {
            KeyPart::new(
                row.get(part.column).cloned().unwrap_or(SqlValue::Null),
                part.descending,
                part.collation,
            )
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn part(v: i64, descending: bool) -> KeyPart {
        KeyPart::new(SqlValue::Integer(v), descending, Collation::Binary)
    }

    #[test]
    fn test_descending_part_inverts_order() {
        assert!(part(1, false) < part(2, false));
        assert!(part(1, true) > part(2, true));
    }

    #[test]
    fn test_collation_folds_into_key() {
        let a = KeyPart::new(SqlValue::text("ABC"), false, Collation::NoCase);
        let b = KeyPart::new(SqlValue::text("abc"), false, Collation::NoCase);
        assert_eq!(a, b);
    }

    #[test]
    fn test_prefix_sorts_first() {
        let prefix: Key = vec![part(1, false)];
        let longer: Key = vec![part(1, false), part(0, false)];
        assert!(prefix < longer);
    }
}
