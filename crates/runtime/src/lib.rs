//! The execution runtime: the instruction emitter, the cooperative
//! pull-driven scheduler, the row-context system, the constraint engine,
//! and the statement-lifecycle API around them.

use vtab::ErrorCode;

// The instruction model: emitted programs and their outputs.
mod program;
pub use program::{Callable, InstrOutput, Instruction, Program, RowStream};

// Runtime context: bound parameters, the row-context map, ephemeral
// tables, per-table connections.
mod context;
pub use context::{RowDescriptor, RowSlot, RuntimeCtx, Tracer};

// Plan → instruction emission.
mod emit;
pub use emit::Emitter;

// Dependency-ordered execution of a program.
mod sched;
pub use sched::run_program;

// Immediate constraint checks and the deferred queue.
mod constraints;
pub use constraints::DeferredQueue;

// Ephemeral tables backing materialized CTEs and the recursive queue.
mod ephemeral;
pub use ephemeral::EphemeralTable;

// Built-in scalar and aggregate functions.
pub mod functions;

// The three introspection table functions.
mod explain;

// The database handle and statement lifecycle.
mod db;
pub use db::{Database, EngineOptions};
mod statement;
pub use statement::Statement;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("misuse: {0}")]
    Misuse(String),
    #[error(transparent)]
    Parse(plan::Error),
    #[error("constraint {constraint} failed: {message}")]
    Constraint { constraint: String, message: String },
    #[error("internal invariant violated: {0}")]
    Internal(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("out of range: {0}")]
    Range(String),
    #[error(transparent)]
    Catalog(#[from] catalog::Error),
}

impl Error {
    /// The API error code observable at the boundary.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Misuse(_) => ErrorCode::Misuse,
            Error::Parse(inner) => match inner {
                plan::Error::Unsupported(_) => ErrorCode::Unsupported,
                plan::Error::NoSuchTable(_)
                | plan::Error::NoSuchColumn(_)
                | plan::Error::NoSuchFunction(_) => ErrorCode::NotFound,
                _ => ErrorCode::Error,
            },
            Error::Constraint { .. } => ErrorCode::Constraint,
            Error::Internal(_) => ErrorCode::Internal,
            Error::Unsupported(_) => ErrorCode::Unsupported,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::Range(_) => ErrorCode::Range,
            Error::Catalog(catalog::Error::NoSuchTable { .. }) => ErrorCode::NotFound,
            Error::Catalog(_) => ErrorCode::Error,
        }
    }
}

impl From<plan::Error> for Error {
    fn from(error: plan::Error) -> Self {
        match error {
            plan::Error::Unsupported(message) => Error::Unsupported(message),
            plan::Error::Module(inner) => inner.into(),
            other => Error::Parse(other),
        }
    }
}

impl From<vtab::Error> for Error {
    fn from(error: vtab::Error) -> Self {
        match error {
            vtab::Error::Constraint {
                constraint,
                message,
            } => Error::Constraint {
                constraint,
                message,
            },
            vtab::Error::NotFound(message) => Error::NotFound(message),
            vtab::Error::Misuse(message) => Error::Misuse(message),
            vtab::Error::Unsupported(message) => Error::Unsupported(message),
            vtab::Error::Range(message) => Error::Range(message),
            vtab::Error::Internal(message) => Error::Internal(message),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
