//! Mutation emission: the INSERT / UPDATE / DELETE pipelines. Source rows
//! become flat rows (OLD then NEW), the immediate constraint checks run
//! inline, deferred checks queue for COMMIT, and the storage module's
//! `update` applies the write. The pipeline yields the flat rows whose
//! writes actually happened, which is what RETURNING projects over.

use std::sync::Arc;

use catalog::{RowOps, TableSchema};
use futures::{FutureExt, TryStreamExt};
use plan::{CompiledCheck, RelNode};
use values::{flat_row, row, Row, SqlValue};
use vtab::{ConflictPolicy, RowOp};

use super::rows_param;
use crate::constraints::DeferredEntry;
use crate::context::FrameGuard;
use crate::{
    Callable, Emitter, Error, InstrOutput, Result, RowDescriptor, RowSlot, RuntimeCtx,
};

/// One CHECK compiled to callables, plus its firing mask.
struct ReadyCheck {
    name: String,
    ops: RowOps,
    deferred: bool,
    on_new: Callable,
    on_old: Callable,
}

/// Everything the three pipelines share.
struct MutationParts {
    table: Arc<TableSchema>,
    width: usize,
    flat_descriptor: Arc<RowDescriptor>,
    not_null: Vec<(usize, String)>,
    checks: Arc<Vec<ReadyCheck>>,
}

impl Emitter {
    pub(super) fn emit_mutation(&mut self, node: &Arc<RelNode>) -> Result<usize> {
        match &**node {
            RelNode::Insert {
                table,
                source,
                policy,
                checks,
                attrs,
            } => {
                let source = self.emit_rel(source)?;
                let parts = Arc::new(self.mutation_parts(table, checks, attrs)?);
                let policy = *policy;
                let note = format!("insert into {}", table.qualified_name());
                let body = Arc::new(move |ctx: Arc<RuntimeCtx>, params: Vec<InstrOutput>| {
                    let parts = parts.clone();
                    async move {
                        let mut source = rows_param(params)?;
                        let stream = async_stream::try_stream! {
                            let connection = ctx.connection(&parts.table)?;
                            ctx.session.enroll(&connection).await?;
                            let slot = RowSlot::new();
                            let _guard = FrameGuard::install(
                                ctx.clone(),
                                parts.flat_descriptor.clone(),
                                slot.clone(),
                            );
                            while let Some(new_row) = source.try_next().await? {
                                let flat = flat_row(None, Some(&new_row), parts.width);
                                slot.set(flat.clone());
                                apply_checks(&ctx, &parts, RowOp::Insert, &flat).await?;
                                let outcome = connection
                                    .update(RowOp::Insert, flat.clone(), policy)
                                    .await?;
                                slot.clear();
                                if outcome.is_some() {
                                    yield flat;
                                }
                            }
                        };
                        Ok(InstrOutput::Rows(Box::pin(stream)))
                    }
                    .boxed()
                });
                Ok(self.push(vec![source], note, body))
            }

            RelNode::Update {
                table,
                source,
                assignments,
                checks,
                attrs,
            } => {
                let source_attrs = source.attributes();
                let source_address = self.emit_rel(source)?;
                let source_descriptor = Arc::new(RowDescriptor::for_attrs(&source_attrs));
                let parts = Arc::new(self.mutation_parts(table, checks, attrs)?);
                let compiled_assignments: Arc<Vec<(usize, Callable)>> = Arc::new(
                    assignments
                        .iter()
                        .map(|(column, expr)| Ok((*column, self.compile_scalar(expr)?)))
                        .collect::<Result<Vec<_>>>()?,
                );
                let note = format!("update {}", table.qualified_name());
                let body = Arc::new(move |ctx: Arc<RuntimeCtx>, params: Vec<InstrOutput>| {
                    let parts = parts.clone();
                    let source_descriptor = source_descriptor.clone();
                    let assignments = compiled_assignments.clone();
                    async move {
                        let mut source = rows_param(params)?;
                        let stream = async_stream::try_stream! {
                            let connection = ctx.connection(&parts.table)?;
                            ctx.session.enroll(&connection).await?;
                            let source_slot = RowSlot::new();
                            let _source_guard = FrameGuard::install(
                                ctx.clone(),
                                source_descriptor,
                                source_slot.clone(),
                            );
                            let flat_slot = RowSlot::new();
                            let _flat_guard = FrameGuard::install(
                                ctx.clone(),
                                parts.flat_descriptor.clone(),
                                flat_slot.clone(),
                            );
                            while let Some(old_row) = source.try_next().await? {
                                source_slot.set(old_row.clone());
                                let mut new_values: Vec<SqlValue> = old_row.to_vec();
                                for (column, callable) in assignments.iter() {
                                    new_values[*column] = callable(ctx.clone()).await?;
                                }
                                let new_row = row(new_values);
                                let flat =
                                    flat_row(Some(&old_row), Some(&new_row), parts.width);
                                flat_slot.set(flat.clone());
                                apply_checks(&ctx, &parts, RowOp::Update, &flat).await?;
                                let outcome = connection
                                    .update(RowOp::Update, flat.clone(), ConflictPolicy::Abort)
                                    .await?;
                                source_slot.clear();
                                flat_slot.clear();
                                if outcome.is_some() {
                                    yield flat;
                                }
                            }
                        };
                        Ok(InstrOutput::Rows(Box::pin(stream)))
                    }
                    .boxed()
                });
                Ok(self.push(vec![source_address], note, body))
            }

            RelNode::Delete {
                table,
                source,
                checks,
                attrs,
            } => {
                let source_address = self.emit_rel(source)?;
                let parts = Arc::new(self.mutation_parts(table, checks, attrs)?);
                let note = format!("delete from {}", table.qualified_name());
                let body = Arc::new(move |ctx: Arc<RuntimeCtx>, params: Vec<InstrOutput>| {
                    let parts = parts.clone();
                    async move {
                        let mut source = rows_param(params)?;
                        let stream = async_stream::try_stream! {
                            let connection = ctx.connection(&parts.table)?;
                            ctx.session.enroll(&connection).await?;
                            let slot = RowSlot::new();
                            let _guard = FrameGuard::install(
                                ctx.clone(),
                                parts.flat_descriptor.clone(),
                                slot.clone(),
                            );
                            while let Some(old_row) = source.try_next().await? {
                                let flat = flat_row(Some(&old_row), None, parts.width);
                                slot.set(flat.clone());
                                apply_checks(&ctx, &parts, RowOp::Delete, &flat).await?;
                                connection
                                    .update(RowOp::Delete, flat.clone(), ConflictPolicy::Abort)
                                    .await?;
                                slot.clear();
                                yield flat;
                            }
                        };
                        Ok(InstrOutput::Rows(Box::pin(stream)))
                    }
                    .boxed()
                });
                Ok(self.push(vec![source_address], note, body))
            }

            other => Err(Error::Internal(format!(
                "emit_mutation on non-mutation node {other:?}"
            ))),
        }
    }

    fn mutation_parts(
        &mut self,
        table: &Arc<TableSchema>,
        checks: &[CompiledCheck],
        flat_attrs: &[plan::Attribute],
    ) -> Result<MutationParts> {
        let ready = checks
            .iter()
            .map(|check| {
                Ok(ReadyCheck {
                    name: check.name.clone(),
                    ops: check.ops,
                    deferred: check.deferred,
                    on_new: self.compile_scalar(&check.expr_new)?,
                    on_old: self.compile_scalar(&check.expr_old)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(MutationParts {
            width: table.columns.len(),
            flat_descriptor: Arc::new(RowDescriptor::for_attrs(flat_attrs)),
            not_null: table
                .columns
                .iter()
                .enumerate()
                .filter(|(_, column)| column.not_null && !column.generated)
                .map(|(at, column)| {
                    (at, format!("{}.{}", table.qualified_name(), column.name))
                })
                .collect(),
            checks: Arc::new(ready),
            table: table.clone(),
        })
    }
}

/// The immediate constraint sequence for one flat row: NOT NULL over the
/// NEW half (skipped for deletes), then the CHECKs whose mask includes
/// the current operation. Primary-key uniqueness is the storage module's
/// job. Deferred CHECKs queue for COMMIT instead of evaluating here.
async fn apply_checks(
    ctx: &Arc<RuntimeCtx>,
    parts: &MutationParts,
    op: RowOp,
    flat: &Row,
) -> Result<()> {
    let mask = match op {
        RowOp::Insert => RowOps::INSERT,
        RowOp::Update => RowOps::UPDATE,
        RowOp::Delete => RowOps::DELETE,
    };

    if !matches!(op, RowOp::Delete) {
        for (column, constraint) in &parts.not_null {
            if flat[parts.width + column].is_null() {
                return Err(Error::Constraint {
                    constraint: format!("{constraint}.not_null"),
                    message: "NOT NULL constraint failed".into(),
                });
            }
        }
    }

    for check in parts.checks.iter() {
        if !check.ops.contains(mask) {
            continue;
        }
        let evaluator = match op {
            RowOp::Delete => &check.on_old,
            _ => &check.on_new,
        };
        if check.deferred {
            // Defensive copy: the queued row must not alias pipeline state.
            let copied: Row = flat.to_vec().into();
            ctx.core.deferred.enqueue(DeferredEntry {
                flat: copied,
                descriptor: parts.flat_descriptor.clone(),
                evaluator: evaluator.clone(),
                constraint: check.name.clone(),
                connection_id: ctx.session.connection_id,
                table: parts.table.qualified_name(),
            });
            continue;
        }
        // False or zero fails; Null and other values pass.
        if evaluator(ctx.clone()).await?.is_truthy() == Some(false) {
            return Err(Error::Constraint {
                constraint: check.name.clone(),
                message: format!("CHECK failed on {}", op.as_str()),
            });
        }
    }
    Ok(())
}
