use std::sync::atomic::{AtomicU32, Ordering};

use values::TypeAffinity;

/// A database-unique identifier for one column produced anywhere in a
/// plan. Consumers reference columns exclusively by attribute id, never
/// by position or name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeId(pub u32);

impl std::fmt::Display for AttributeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Allocator for attribute ids, scoped to one database instance.
#[derive(Debug, Default)]
pub struct AttributeGenerator(AtomicU32);

impl AttributeGenerator {
    pub fn next(&self) -> AttributeId {
        AttributeId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// The type of a scalar value: an affinity plus nullability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalarTy {
    pub affinity: TypeAffinity,
    pub nullable: bool,
}

impl ScalarTy {
    pub fn nullable(affinity: TypeAffinity) -> Self {
        ScalarTy {
            affinity,
            nullable: true,
        }
    }
}

impl Default for ScalarTy {
    fn default() -> Self {
        ScalarTy {
            affinity: TypeAffinity::Numeric,
            nullable: true,
        }
    }
}

/// One output column of a relational node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub id: AttributeId,
    pub name: String,
    pub ty: ScalarTy,
}

/// The declared type of a relational node: its ordered columns, key
/// column sets, and whether the relation rejects mutation.
#[derive(Debug, Clone, Default)]
pub struct RelType {
    pub columns: Vec<Attribute>,
    pub keys: Vec<Vec<usize>>,
    pub read_only: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_attribute_ids_are_monotonic() {
        let generator = AttributeGenerator::default();
        let a = generator.next();
        let b = generator.next();
        assert!(b > a);
        assert_eq!(a, AttributeId(1));
    }
}
