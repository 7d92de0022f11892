//! The registered-function surface the planner resolves call sites
//! against. Function bodies are supplied by the embedder (the runtime
//! registers the built-ins); the planner only needs names, arities and
//! result types.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use values::{Row, SqlValue, TypeAffinity};

pub type FnResult<T> = std::result::Result<T, vtab::Error>;

/// The body of a scalar function. Async bodies are for user functions
/// doing real I/O; built-ins are all synchronous.
#[derive(Clone)]
pub enum ScalarBody {
    Sync(Arc<dyn Fn(&[SqlValue]) -> FnResult<SqlValue> + Send + Sync>),
    Async(Arc<dyn Fn(Vec<SqlValue>) -> BoxFuture<'static, FnResult<SqlValue>> + Send + Sync>),
}

#[derive(Clone)]
pub struct ScalarFunction {
    pub name: String,
    /// None accepts any arity.
    pub arg_count: Option<usize>,
    pub returns: TypeAffinity,
    pub body: ScalarBody,
}

impl std::fmt::Debug for ScalarFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalarFunction")
            .field("name", &self.name)
            .field("arg_count", &self.arg_count)
            .finish_non_exhaustive()
    }
}

/// Per-group accumulator state of an aggregate.
pub trait AggregateState: Send {
    fn step(&mut self, args: &[SqlValue]) -> FnResult<()>;
    fn finish(self: Box<Self>) -> FnResult<SqlValue>;
}

#[derive(Clone)]
pub struct AggregateFunction {
    pub name: String,
    pub arg_count: Option<usize>,
    pub returns: TypeAffinity,
    pub init: Arc<dyn Fn() -> Box<dyn AggregateState> + Send + Sync>,
}

impl std::fmt::Debug for AggregateFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

pub type TableRows = BoxStream<'static, FnResult<Row>>;

/// A table-valued function: called with evaluated arguments, yields rows
/// with a fixed column layout.
#[derive(Clone)]
pub struct TableFunction {
    pub name: String,
    pub columns: Vec<(String, TypeAffinity)>,
    pub call: Arc<dyn Fn(&[SqlValue]) -> FnResult<TableRows> + Send + Sync>,
}

impl std::fmt::Debug for TableFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableFunction")
            .field("name", &self.name)
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

/// The per-database registry of callable functions, keyed by lowercased
/// name.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    scalars: HashMap<String, Arc<ScalarFunction>>,
    aggregates: HashMap<String, Arc<AggregateFunction>>,
    tables: HashMap<String, Arc<TableFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_scalar(&mut self, function: ScalarFunction) {
        self.scalars
            .insert(function.name.to_ascii_lowercase(), Arc::new(function));
    }

    pub fn register_aggregate(&mut self, function: AggregateFunction) {
        self.aggregates
            .insert(function.name.to_ascii_lowercase(), Arc::new(function));
    }

    pub fn register_table(&mut self, function: TableFunction) {
        self.tables
            .insert(function.name.to_ascii_lowercase(), Arc::new(function));
    }

    pub fn scalar(&self, name: &str) -> Option<Arc<ScalarFunction>> {
        self.scalars.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn aggregate(&self, name: &str) -> Option<Arc<AggregateFunction>> {
        self.aggregates.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn table(&self, name: &str) -> Option<Arc<TableFunction>> {
        self.tables.get(&name.to_ascii_lowercase()).cloned()
    }
}
