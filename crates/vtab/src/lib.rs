//! The virtual-table protocol: the contract between the engine core and
//! pluggable storage modules. A module plans scans through `best_index`,
//! serves rows through connections and cursors, applies mutations through
//! `update`, and participates in transactions through the connection's
//! begin/commit/rollback/savepoint surface.

mod error;
pub use error::{Error, ErrorCode, Result};

mod index_info;
pub use index_info::{
    ConstraintOp, ConstraintUsage, IndexConstraint, IndexFlags, IndexInfo, IndexOrderBy,
};

mod module;
pub use module::{Cursor, Module, TableConnection, VirtualTable};

mod cursor_stream;
pub use cursor_stream::cursor_rows;

mod registry;
pub use registry::ModuleRegistry;

/// The mutation kind flowing through `update` and the constraint engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowOp {
    Insert,
    Update,
    Delete,
}

impl RowOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowOp::Insert => "insert",
            RowOp::Update => "update",
            RowOp::Delete => "delete",
        }
    }
}

/// How a write resolves a duplicate primary key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    #[default]
    Abort,
    Ignore,
    Replace,
    Fail,
    Rollback,
}
