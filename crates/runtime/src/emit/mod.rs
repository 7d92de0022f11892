//! Plan → instruction emission. Each relational node emits exactly one
//! instruction (memoized by the node's `Arc` identity, so shared subplans
//! share instructions); scalar expressions compile into callables; and
//! subqueries compile into nested subprograms the callables re-run per
//! evaluation.

use std::sync::Arc;

use fxhash::FxHashMap;
use plan::{RelNode, StatementPlan};

use crate::{Error, InstrOutput, Instruction, Program, Result};

mod ddl;
mod mutation;
mod relational;
mod scalar;

pub struct Emitter {
    program: Program,
    memo: FxHashMap<*const RelNode, usize>,
    /// Subprograms compiled while building the current instruction; they
    /// attach to its address on push.
    pending_subprograms: Vec<Arc<Program>>,
}

impl Emitter {
    fn new() -> Self {
        Emitter {
            program: Program::default(),
            memo: FxHashMap::default(),
            pending_subprograms: Vec::new(),
        }
    }

    /// Emit a whole statement plan into a runnable program.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn emit_statement(plan: &Arc<StatementPlan>) -> Result<Arc<Program>> {
        let mut emitter = Emitter::new();
        match &**plan {
            StatementPlan::Query { root, .. } | StatementPlan::Dml { root, .. } => {
                emitter.emit_rel(root)?;
            }
            _ => {
                emitter.emit_ddl(plan.clone());
            }
        }
        Ok(Arc::new(emitter.program))
    }

    /// Emit a detached subprogram for |node| (subqueries, recursive
    /// terms). It attaches to the instruction currently being built.
    fn emit_subprogram(&mut self, node: &Arc<RelNode>) -> Result<Arc<Program>> {
        let mut nested = Emitter::new();
        nested.emit_rel(node)?;
        let program = Arc::new(nested.program);
        self.pending_subprograms.push(program.clone());
        Ok(program)
    }

    /// Append an instruction, wiring any subprograms compiled while
    /// building it.
    fn push(
        &mut self,
        params: Vec<usize>,
        note: impl Into<String>,
        run: crate::program::InstrBody,
    ) -> usize {
        let address = self.program.instructions.len();
        self.program.instructions.push(Instruction {
            params,
            run,
            note: note.into(),
        });
        for subprogram in self.pending_subprograms.drain(..) {
            self.program.subprograms.push((address, subprogram));
        }
        address
    }

    /// Emit one relational node, memoized by identity.
    fn emit_rel(&mut self, node: &Arc<RelNode>) -> Result<usize> {
        let identity = Arc::as_ptr(node);
        if let Some(&address) = self.memo.get(&identity) {
            return Ok(address);
        }
        let address = self.emit_rel_uncached(node)?;
        self.memo.insert(identity, address);
        Ok(address)
    }
}

/// A single-parameter pull: the row stream feeding an operator.
fn rows_param(mut params: Vec<InstrOutput>) -> Result<crate::RowStream> {
    if params.is_empty() {
        return Err(Error::Internal("operator expects a row-stream input".into()));
    }
    params.remove(0).into_rows()
}
