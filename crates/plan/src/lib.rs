//! The planner: lowering of parsed SQL statements into a tree of plan
//! nodes. Name resolution walks a scope stack, every produced column gets
//! a database-unique attribute id, and scans are costed through the
//! virtual-table module's `best_index` exchange.

// Attribute ids, attributes, scalar and relation types.
mod types;
pub use types::{Attribute, AttributeGenerator, AttributeId, RelType, ScalarTy};

// Nestable name resolvers.
pub mod scope;
pub use scope::{AliasedScope, GlobalScope, MultiScope, RegisteredScope, Resolution, Scope, ScopeRef};

// Scalar expression nodes.
mod expr;
pub use expr::{AggregateCall, BinOp, ParamKey, ScalarExpr, SortTerm, UnOp};

// Relational plan nodes and statement plans.
mod node;
pub use node::{AccessPlan, CompiledCheck, CteId, RelNode, StatementPlan};

// Registered scalar, aggregate and table functions.
pub mod functions;
pub use functions::{
    AggregateFunction, AggregateState, FunctionRegistry, ScalarFunction, TableFunction,
};

// Statement splitting, lexical transaction control, USING extraction.
pub mod parse;
pub use parse::{InsertConflict, ParsedStatement, TxnControl};

// The statement builder.
mod builder;
pub use builder::{BuildOutput, Builder, BuilderEnv};

// Correlation analysis and the predicate pushdown gate.
mod pushdown;
pub use pushdown::{collect_attrs, is_pushable};

// Sargable-constraint extraction and best_index integration.
mod bestindex;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("no such table: {0}")]
    NoSuchTable(String),
    #[error("no such column: {0}")]
    NoSuchColumn(String),
    #[error("ambiguous column reference: {0}")]
    AmbiguousColumn(String),
    #[error("no such function: {0}")]
    NoSuchFunction(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Plan(String),
    #[error(transparent)]
    Catalog(#[from] catalog::Error),
    #[error(transparent)]
    Module(#[from] vtab::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
