// Schema objects are immutable snapshots: tables, columns, primary keys,
// CHECK constraints, and secondary indexes.
mod schema;
pub use schema::{
    CheckConstraint, ColumnSchema, IndexPart, IndexSchema, PrimaryKeyPart, RowOps, TableSchema,
};

// The catalog maps lowercased (schema, name) pairs onto registered tables
// and views. Mutation happens only at DDL time.
mod catalog;
pub use catalog::{Catalog, SchemaDefaults};

// Lowering of parsed DDL into schema objects, and rendering back to SQL.
pub mod ddl;
pub use ddl::ModuleClause;

// The declared-vs-actual schema differ.
mod differ;
pub use differ::{diff, Migration, TableAlteration};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no such table: {schema}.{name}")]
    NoSuchTable { schema: String, name: String },
    #[error("table {schema}.{name} already exists")]
    TableExists { schema: String, name: String },
    #[error("no such index: {0}")]
    NoSuchIndex(String),
    #[error("index {0} already exists")]
    IndexExists(String),
    #[error("no such column {column} in table {table}")]
    NoSuchColumn { table: String, column: String },
    #[error("unsupported DDL construct: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Collation(#[from] values::collation::UnknownCollation),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
