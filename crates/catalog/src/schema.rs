use std::sync::Arc;

use sqlparser::ast::Expr;
use values::{Collation, TypeAffinity};

bitflags::bitflags! {
    /// The row operations a CHECK constraint applies to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RowOps: u8 {
        const INSERT = 0b001;
        const UPDATE = 0b010;
        const DELETE = 0b100;
    }
}

impl Default for RowOps {
    fn default() -> Self {
        RowOps::INSERT | RowOps::UPDATE
    }
}

/// One column of a table.
#[derive(Debug, Clone)]
pub struct ColumnSchema {
    pub name: String,
    pub affinity: TypeAffinity,
    /// The declared type name, kept verbatim for DDL regeneration.
    pub declared_type: Option<String>,
    pub not_null: bool,
    pub default: Option<Expr>,
    pub collation: Collation,
    pub generated: bool,
    /// Position of this column within the primary key, if any.
    pub pk_ordinal: Option<usize>,
}

/// One part of the primary key, in key order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryKeyPart {
    pub column: usize,
    pub descending: bool,
    pub collation: Collation,
}

/// A CHECK constraint. `ops` masks the row operations it fires on;
/// deferred constraints are queued and run at COMMIT.
#[derive(Debug, Clone)]
pub struct CheckConstraint {
    pub name: String,
    pub expr: Expr,
    pub ops: RowOps,
    pub deferred: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexPart {
    pub column: usize,
    pub descending: bool,
    pub collation: Collation,
}

/// A secondary index over a table.
#[derive(Debug, Clone)]
pub struct IndexSchema {
    pub name: String,
    pub parts: Vec<IndexPart>,
}

/// An immutable table (or view) schema. Registered schemas are always
/// handled as `Arc<TableSchema>`; DDL replaces the whole Arc.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub schema_name: String,
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub primary_key: Vec<PrimaryKeyPart>,
    pub checks: Vec<CheckConstraint>,
    pub indexes: Vec<IndexSchema>,
    pub module_name: String,
    pub module_args: Vec<String>,
    pub is_view: bool,
    /// The defining query, for views.
    pub view_query: Option<sqlparser::ast::Query>,
    pub is_temporary: bool,
    pub read_only: bool,
}

impl TableSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, index: usize) -> &ColumnSchema {
        &self.columns[index]
    }

    /// Qualified display name, `schema.table`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.name)
    }

    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes
            .iter()
            .find(|i| i.name.eq_ignore_ascii_case(name))
    }

    /// Derive a copy with one more secondary index attached.
    pub fn with_index(&self, index: IndexSchema) -> Arc<TableSchema> {
        let mut next = self.clone();
        next.indexes.push(index);
        Arc::new(next)
    }

    /// Derive a copy without the named index.
    pub fn without_index(&self, name: &str) -> Arc<TableSchema> {
        let mut next = self.clone();
        next.indexes.retain(|i| !i.name.eq_ignore_ascii_case(name));
        Arc::new(next)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_row_ops_default() {
        let ops = RowOps::default();
        assert!(ops.contains(RowOps::INSERT));
        assert!(ops.contains(RowOps::UPDATE));
        assert!(!ops.contains(RowOps::DELETE));
    }
}
