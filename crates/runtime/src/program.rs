use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use values::{Row, SqlValue};

use crate::{Error, Result, RuntimeCtx};

/// A lazily-pulled stream of rows; the relational currency of the
/// scheduler.
pub type RowStream = BoxStream<'static, Result<Row>>;

/// A compiled scalar expression: evaluated many times, against the row
/// context active inside |ctx| at each call.
pub type Callable =
    Arc<dyn Fn(Arc<RuntimeCtx>) -> BoxFuture<'static, Result<SqlValue>> + Send + Sync>;

/// What one instruction produces.
pub enum InstrOutput {
    Void,
    Value(SqlValue),
    Rows(RowStream),
    Callable(Callable),
}

impl InstrOutput {
    pub fn into_rows(self) -> Result<RowStream> {
        match self {
            InstrOutput::Rows(rows) => Ok(rows),
            _ => Err(Error::Internal(
                "instruction output is not a row stream".into(),
            )),
        }
    }

    pub fn into_value(self) -> Result<SqlValue> {
        match self {
            InstrOutput::Value(value) => Ok(value),
            InstrOutput::Void => Ok(SqlValue::Null),
            _ => Err(Error::Internal("instruction output is not a value".into())),
        }
    }
}

impl std::fmt::Debug for InstrOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstrOutput::Void => write!(f, "Void"),
            InstrOutput::Value(value) => write!(f, "Value({value})"),
            InstrOutput::Rows(_) => write!(f, "Rows(..)"),
            InstrOutput::Callable(_) => write!(f, "Callable(..)"),
        }
    }
}

/// The body of one instruction: pure with respect to the runtime context
/// it's handed; parameter outputs arrive resolved, in declaration order.
pub type InstrBody = Arc<
    dyn Fn(Arc<RuntimeCtx>, Vec<InstrOutput>) -> BoxFuture<'static, Result<InstrOutput>>
        + Send
        + Sync,
>;

/// One emitted instruction.
pub struct Instruction {
    /// Addresses of the instructions whose outputs feed this one.
    pub params: Vec<usize>,
    pub run: InstrBody,
    /// Human-readable description, surfaced by `scheduler_program`.
    pub note: String,
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instruction")
            .field("params", &self.params)
            .field("note", &self.note)
            .finish_non_exhaustive()
    }
}

/// The emitted instruction DAG of one statement. Instructions are stored
/// in dependency order: every parameter address precedes its consumer.
#[derive(Debug, Default)]
pub struct Program {
    pub instructions: Vec<Instruction>,
    /// Nested programs (subqueries, recursive terms), with the address of
    /// the instruction that runs each.
    pub subprograms: Vec<(usize, Arc<Program>)>,
}

impl Program {
    /// The root is the last-emitted instruction.
    pub fn root(&self) -> usize {
        self.instructions.len().saturating_sub(1)
    }
}
