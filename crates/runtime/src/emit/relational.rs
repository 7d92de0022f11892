//! Emission of the streaming relational operators. Every operator that
//! evaluates expressions installs one scope frame over its input's
//! attributes and opens one evaluation window per row (set, evaluate,
//! clear) — the clear keeps a finished row from shadowing another frame
//! that covers the same attributes. Frames tear down through drop
//! guards, which is also the cancellation path.

use std::collections::HashSet;
use std::sync::Arc;

use futures::{FutureExt, StreamExt, TryStreamExt};
use indexmap::IndexMap;
use plan::{AggregateCall, RelNode, ScalarExpr, SortTerm};
use values::{compare, compare_with, row, Row, SqlValue};
use vtab::ConflictPolicy;

use super::rows_param;
use crate::context::FrameGuard;
use crate::sched::run_program;
use crate::{
    Callable, Emitter, Error, InstrOutput, Result, RowDescriptor, RowSlot, RowStream,
};

impl Emitter {
    pub(super) fn emit_rel_uncached(&mut self, node: &Arc<RelNode>) -> Result<usize> {
        match &**node {
            RelNode::TableScan {
                table,
                attrs: _,
                access,
                ..
            } => {
                let arg_callables = match access {
                    Some(access) => access
                        .args
                        .iter()
                        .map(|arg| self.compile_scalar(arg))
                        .collect::<Result<Vec<_>>>()?,
                    None => Vec::new(),
                };
                let (index_number, index_string) = match access {
                    Some(access) => (access.index_number, access.index_string.clone()),
                    None => (0, None),
                };
                let table = table.clone();
                let note = format!("scan {}", table.qualified_name());
                let body = Arc::new(move |ctx: Arc<crate::RuntimeCtx>, _params: Vec<InstrOutput>| {
                    let table = table.clone();
                    let arg_callables = arg_callables.clone();
                    let index_string = index_string.clone();
                    async move {
                        let connection = ctx.connection(&table)?;
                        let mut args = Vec::with_capacity(arg_callables.len());
                        for callable in &arg_callables {
                            args.push(callable(ctx.clone()).await?);
                        }
                        let mut cursor = connection.open_cursor()?;
                        cursor
                            .filter(index_number, index_string.as_deref(), &args)
                            .await?;
                        let rows = vtab::cursor_rows(cursor).map_err(Error::from);
                        Ok(InstrOutput::Rows(Box::pin(rows)))
                    }
                    .boxed()
                });
                Ok(self.push(vec![], note, body))
            }

            RelNode::TableFunctionCall { func, args, .. } => {
                let callables = args
                    .iter()
                    .map(|arg| self.compile_scalar(arg))
                    .collect::<Result<Vec<_>>>()?;
                let func = func.clone();
                let note = format!("table function {}", func.name);
                let body = Arc::new(move |ctx: Arc<crate::RuntimeCtx>, _params: Vec<InstrOutput>| {
                    let callables = callables.clone();
                    let func = func.clone();
                    async move {
                        let mut args = Vec::with_capacity(callables.len());
                        for callable in &callables {
                            args.push(callable(ctx.clone()).await?);
                        }
                        let rows = (func.call)(&args)?.map_err(Error::from);
                        Ok(InstrOutput::Rows(Box::pin(rows)))
                    }
                    .boxed()
                });
                Ok(self.push(vec![], note, body))
            }

            RelNode::Values { rows: exprs, .. } => {
                let compiled: Vec<Vec<Callable>> = exprs
                    .iter()
                    .map(|row_exprs| {
                        row_exprs
                            .iter()
                            .map(|expr| self.compile_scalar(expr))
                            .collect::<Result<Vec<_>>>()
                    })
                    .collect::<Result<Vec<_>>>()?;
                let note = format!("values ({} rows)", compiled.len());
                let body = Arc::new(move |ctx: Arc<crate::RuntimeCtx>, _params: Vec<InstrOutput>| {
                    let compiled = compiled.clone();
                    async move {
                        let stream = async_stream::try_stream! {
                            for row_callables in compiled {
                                let mut out = Vec::with_capacity(row_callables.len());
                                for callable in &row_callables {
                                    out.push(callable(ctx.clone()).await?);
                                }
                                yield row(out);
                            }
                        };
                        Ok(InstrOutput::Rows(Box::pin(stream)))
                    }
                    .boxed()
                });
                Ok(self.push(vec![], note, body))
            }

            RelNode::Filter { input, predicate } => {
                let source = self.emit_rel(input)?;
                let descriptor = Arc::new(RowDescriptor::for_attrs(&input.attributes()));
                let predicate_callable = self.compile_scalar(predicate)?;
                let note = format!("filter {}", predicate.render());
                let body = Arc::new(move |ctx: Arc<crate::RuntimeCtx>, params: Vec<InstrOutput>| {
                    let descriptor = descriptor.clone();
                    let predicate = predicate_callable.clone();
                    async move {
                        let mut source = rows_param(params)?;
                        let stream = async_stream::try_stream! {
                            let slot = RowSlot::new();
                            let _guard = FrameGuard::install(
                                ctx.clone(),
                                descriptor,
                                slot.clone(),
                            );
                            while let Some(input_row) = source.try_next().await? {
                                slot.set(input_row.clone());
                                let keep =
                                    predicate(ctx.clone()).await?.is_truthy() == Some(true);
                                // Close the evaluation window: a stale row
                                // must never shadow a downstream frame
                                // covering the same attributes.
                                slot.clear();
                                if keep {
                                    yield input_row;
                                }
                            }
                        };
                        Ok(InstrOutput::Rows(Box::pin(stream)))
                    }
                    .boxed()
                });
                Ok(self.push(vec![source], note, body))
            }

            RelNode::Project { input, exprs, .. } => {
                let source = self.emit_rel(input)?;
                let descriptor = Arc::new(RowDescriptor::for_attrs(&input.attributes()));
                let callables = exprs
                    .iter()
                    .map(|expr| self.compile_scalar(expr))
                    .collect::<Result<Vec<_>>>()?;
                let note = format!("project {} columns", callables.len());
                let body = Arc::new(move |ctx: Arc<crate::RuntimeCtx>, params: Vec<InstrOutput>| {
                    let descriptor = descriptor.clone();
                    let callables = callables.clone();
                    async move {
                        let mut source = rows_param(params)?;
                        let stream = async_stream::try_stream! {
                            let slot = RowSlot::new();
                            let _guard = FrameGuard::install(
                                ctx.clone(),
                                descriptor,
                                slot.clone(),
                            );
                            while let Some(input_row) = source.try_next().await? {
                                slot.set(input_row);
                                let mut out = Vec::with_capacity(callables.len());
                                for callable in &callables {
                                    out.push(callable(ctx.clone()).await?);
                                }
                                slot.clear();
                                yield row(out);
                            }
                        };
                        Ok(InstrOutput::Rows(Box::pin(stream)))
                    }
                    .boxed()
                });
                Ok(self.push(vec![source], note, body))
            }

            RelNode::Aggregate {
                input,
                group_by,
                aggregates,
                ..
            } => self.emit_aggregate(node, input, group_by, aggregates),

            RelNode::Sort { input, terms } => {
                let source = self.emit_rel(input)?;
                let descriptor = Arc::new(RowDescriptor::for_attrs(&input.attributes()));
                let compiled: Vec<(Callable, bool, Option<values::Collation>)> = terms
                    .iter()
                    .map(|SortTerm { expr, descending, collation }| {
                        Ok((self.compile_scalar(expr)?, *descending, *collation))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let note = format!("sort ({} terms)", compiled.len());
                let body = Arc::new(move |ctx: Arc<crate::RuntimeCtx>, params: Vec<InstrOutput>| {
                    let descriptor = descriptor.clone();
                    let compiled = compiled.clone();
                    async move {
                        let mut source = rows_param(params)?;
                        let stream = async_stream::try_stream! {
                            // Sort materializes: keys are computed once per
                            // row under a one-shot frame, then the frame is
                            // gone before rows stream out.
                            let mut keyed: Vec<(Vec<SqlValue>, Row)> = Vec::new();
                            {
                                let slot = RowSlot::new();
                                let _guard = FrameGuard::install(
                                    ctx.clone(),
                                    descriptor,
                                    slot.clone(),
                                );
                                while let Some(input_row) = source.try_next().await? {
                                    slot.set(input_row.clone());
                                    let mut keys = Vec::with_capacity(compiled.len());
                                    for (callable, _, _) in &compiled {
                                        keys.push(callable(ctx.clone()).await?);
                                    }
                                    slot.clear();
                                    keyed.push((keys, input_row));
                                }
                            }
                            keyed.sort_by(|(a, _), (b, _)| {
                                for (at, (_, descending, collation)) in
                                    compiled.iter().enumerate()
                                {
                                    let ordering = match collation {
                                        Some(collation) => {
                                            compare_with(*collation, &a[at], &b[at])
                                        }
                                        None => compare(&a[at], &b[at]),
                                    };
                                    let ordering = if *descending {
                                        ordering.reverse()
                                    } else {
                                        ordering
                                    };
                                    if ordering != std::cmp::Ordering::Equal {
                                        return ordering;
                                    }
                                }
                                std::cmp::Ordering::Equal
                            });
                            for (_, output_row) in keyed {
                                yield output_row;
                            }
                        };
                        Ok(InstrOutput::Rows(Box::pin(stream)))
                    }
                    .boxed()
                });
                Ok(self.push(vec![source], note, body))
            }

            RelNode::LimitOffset {
                input,
                limit,
                offset,
            } => {
                let source = self.emit_rel(input)?;
                let limit = limit
                    .as_ref()
                    .map(|expr| self.compile_scalar(expr))
                    .transpose()?;
                let offset = offset
                    .as_ref()
                    .map(|expr| self.compile_scalar(expr))
                    .transpose()?;
                let body = Arc::new(move |ctx: Arc<crate::RuntimeCtx>, params: Vec<InstrOutput>| {
                    let limit = limit.clone();
                    let offset = offset.clone();
                    async move {
                        let source = rows_param(params)?;
                        let skip = match &offset {
                            Some(callable) => callable(ctx.clone())
                                .await?
                                .as_i64()
                                .unwrap_or(0)
                                .max(0) as usize,
                            None => 0,
                        };
                        // A Null or negative limit means no limit.
                        let take = match &limit {
                            Some(callable) => match callable(ctx.clone()).await?.as_i64() {
                                Some(n) if n >= 0 => Some(n as usize),
                                _ => None,
                            },
                            None => None,
                        };
                        let stream = source.skip(skip);
                        let rows: RowStream = match take {
                            Some(n) => Box::pin(stream.take(n)),
                            None => Box::pin(stream),
                        };
                        Ok(InstrOutput::Rows(rows))
                    }
                    .boxed()
                });
                Ok(self.push(vec![source], "limit/offset", body))
            }

            RelNode::Distinct { input } => {
                let source = self.emit_rel(input)?;
                let body = sync_rows_body(|source| {
                    let stream = async_stream::try_stream! {
                        let mut source = source;
                        let mut seen: HashSet<Row> = HashSet::new();
                        while let Some(input_row) = source.try_next().await? {
                            if seen.insert(input_row.clone()) {
                                yield input_row;
                            }
                        }
                    };
                    Box::pin(stream)
                });
                Ok(self.push(vec![source], "distinct", body))
            }

            RelNode::UnionAll { left, right, .. } => {
                let left = self.emit_rel(left)?;
                let right = self.emit_rel(right)?;
                let body = Arc::new(
                    move |_ctx: Arc<crate::RuntimeCtx>, mut params: Vec<InstrOutput>| {
                        std::future::ready((|| {
                            if params.len() != 2 {
                                return Err(Error::Internal(
                                    "union expects two inputs".into(),
                                ));
                            }
                            let right = params.pop().expect("checked len").into_rows()?;
                            let left = params.pop().expect("checked len").into_rows()?;
                            Ok(InstrOutput::Rows(Box::pin(left.chain(right))))
                        })())
                        .boxed()
                    },
                );
                Ok(self.push(vec![left, right], "union all", body))
            }

            RelNode::Materialize {
                cte, name, plan, body: cte_body, ..
            } => {
                let plan_address = self.emit_rel(plan)?;
                let body_address = self.emit_rel(cte_body)?;
                let cte = *cte;
                // The recursive driver writes its own result table as it
                // runs; collecting its output here would double every row.
                let self_materializing = matches!(&**plan, RelNode::RecursiveCte { .. });
                let note = format!("materialize cte {name}");
                let body = Arc::new(move |ctx: Arc<crate::RuntimeCtx>, mut params: Vec<InstrOutput>| {
                    async move {
                        if params.len() != 2 {
                            return Err(Error::Internal(
                                "materialize expects plan and body inputs".into(),
                            ));
                        }
                        let body_rows = params.pop().expect("checked len").into_rows()?;
                        let mut plan_rows = params.pop().expect("checked len").into_rows()?;

                        // Populate the ephemeral table before the body is
                        // pulled; re-execution (subprograms) repopulates.
                        if self_materializing {
                            while plan_rows.try_next().await?.is_some() {}
                        } else {
                            let table = ctx.ephemeral(cte);
                            table.clear();
                            while let Some(cte_row) = plan_rows.try_next().await? {
                                table.append(cte_row);
                            }
                        }
                        Ok(InstrOutput::Rows(body_rows))
                    }
                    .boxed()
                });
                Ok(self.push(vec![plan_address, body_address], note, body))
            }

            RelNode::CteScan { cte, name, .. } => {
                let cte = *cte;
                let note = format!("scan cte {name}");
                let body = Arc::new(move |ctx: Arc<crate::RuntimeCtx>, _params: Vec<InstrOutput>| {
                    async move {
                        let stream = async_stream::try_stream! {
                            // Snapshot at first pull, after materialization.
                            for cte_row in ctx.ephemeral(cte).snapshot() {
                                yield cte_row;
                            }
                        };
                        Ok(InstrOutput::Rows(Box::pin(stream) as RowStream))
                    }
                    .boxed()
                });
                Ok(self.push(vec![], note, body))
            }

            RelNode::SelfRow { name, attrs } => {
                let ids: Vec<plan::AttributeId> = attrs.iter().map(|a| a.id).collect();
                let note = format!("self row {name}");
                let body = Arc::new(move |ctx: Arc<crate::RuntimeCtx>, _params: Vec<InstrOutput>| {
                    let ids = ids.clone();
                    async move {
                        let stream = async_stream::try_stream! {
                            let mut out = Vec::with_capacity(ids.len());
                            for id in &ids {
                                out.push(ctx.attribute(*id)?);
                            }
                            yield row(out);
                        };
                        Ok(InstrOutput::Rows(Box::pin(stream) as RowStream))
                    }
                    .boxed()
                });
                Ok(self.push(vec![], note, body))
            }

            RelNode::RecursiveCte {
                name,
                cte,
                queue,
                initial,
                recursive,
                self_attrs,
                union_all,
                ..
            } => {
                let initial_address = self.emit_rel(initial)?;
                let subprogram = self.emit_subprogram(recursive)?;
                let descriptor = Arc::new(RowDescriptor::for_attrs(self_attrs));
                let (cte, queue_id) = (*cte, *queue);
                let union_all = *union_all;
                let note = format!("recursive cte {name}");
                let body = Arc::new(move |ctx: Arc<crate::RuntimeCtx>, params: Vec<InstrOutput>| {
                    let subprogram = subprogram.clone();
                    let descriptor = descriptor.clone();
                    async move {
                        let mut initial = rows_param(params)?;
                        let stream = async_stream::try_stream! {
                            // The loop's two ephemeral tables. Result
                            // inserts use ABORT under UNION ALL (bag
                            // semantics, never conflicts) and IGNORE under
                            // UNION-distinct so duplicates drop; a row
                            // reaches the queue only when the result
                            // accepted it.
                            let result = ctx.ephemeral(cte);
                            let queue = ctx.ephemeral(queue_id);
                            result.clear();
                            queue.clear();
                            let policy = if union_all {
                                ConflictPolicy::Abort
                            } else {
                                ConflictPolicy::Ignore
                            };

                            while let Some(seed) = initial.try_next().await? {
                                if result.insert(seed.clone(), policy) {
                                    queue.append(seed.clone());
                                    yield seed;
                                }
                            }

                            let slot = RowSlot::new();
                            let _guard = FrameGuard::install(
                                ctx.clone(),
                                descriptor,
                                slot.clone(),
                            );
                            let mut steps = 0u64;
                            // Terminate when the queue drains; pop_front
                            // truncates the consumed prefix as it goes.
                            while let Some(current) = queue.pop_front() {
                                steps += 1;
                                if steps > 1_000_000 {
                                    Err::<(), Error>(Error::Internal(
                                        "recursive CTE exceeded its step budget".into(),
                                    ))?;
                                }
                                slot.set(current);
                                let mut expanded = run_program(subprogram.clone(), ctx.clone())
                                    .await?
                                    .into_rows()?;
                                while let Some(next) = expanded.try_next().await? {
                                    if result.insert(next.clone(), policy) {
                                        queue.append(next.clone());
                                        yield next;
                                    }
                                }
                            }
                        };
                        Ok(InstrOutput::Rows(Box::pin(stream)))
                    }
                    .boxed()
                });
                Ok(self.push(vec![initial_address], note, body))
            }

            RelNode::Insert { .. } | RelNode::Update { .. } | RelNode::Delete { .. } => {
                self.emit_mutation(node)
            }
        }
    }

    fn emit_aggregate(
        &mut self,
        _node: &Arc<RelNode>,
        input: &Arc<RelNode>,
        group_by: &[Arc<ScalarExpr>],
        aggregates: &[Arc<ScalarExpr>],
    ) -> Result<usize> {
        let source = self.emit_rel(input)?;
        let descriptor = Arc::new(RowDescriptor::for_attrs(&input.attributes()));
        let group_callables = group_by
            .iter()
            .map(|expr| self.compile_scalar(expr))
            .collect::<Result<Vec<_>>>()?;

        struct CompiledAgg {
            init: Arc<dyn Fn() -> Box<dyn plan::AggregateState> + Send + Sync>,
            args: Vec<Callable>,
            star: bool,
            distinct: bool,
        }
        let mut compiled: Vec<CompiledAgg> = Vec::with_capacity(aggregates.len());
        for aggregate in aggregates {
            let ScalarExpr::Aggregate(AggregateCall {
                func,
                args,
                star,
                distinct,
            }) = &**aggregate
            else {
                return Err(Error::Internal(
                    "aggregate operator holds a non-aggregate expression".into(),
                ));
            };
            compiled.push(CompiledAgg {
                init: func.init.clone(),
                args: args
                    .iter()
                    .map(|arg| self.compile_scalar(arg))
                    .collect::<Result<Vec<_>>>()?,
                star: *star,
                distinct: *distinct,
            });
        }
        let compiled = Arc::new(compiled);
        let group_callables = Arc::new(group_callables);
        let global = group_by.is_empty();
        let note = format!(
            "aggregate ({} groups keys, {} calls)",
            group_callables.len(),
            compiled.len()
        );

        let body = Arc::new(move |ctx: Arc<crate::RuntimeCtx>, params: Vec<InstrOutput>| {
            let descriptor = descriptor.clone();
            let group_callables = group_callables.clone();
            let compiled = compiled.clone();
            async move {
                let mut source = rows_param(params)?;
                let stream = async_stream::try_stream! {
                    struct Group {
                        keys: Vec<SqlValue>,
                        states: Vec<Box<dyn plan::AggregateState>>,
                        distinct_seen: Vec<HashSet<Vec<SqlValue>>>,
                    }
                    // IndexMap keeps group-arrival order.
                    let mut groups: IndexMap<Vec<SqlValue>, Group> = IndexMap::new();
                    if global {
                        groups.insert(
                            Vec::new(),
                            Group {
                                keys: Vec::new(),
                                states: compiled.iter().map(|c| (c.init)()).collect(),
                                distinct_seen: compiled
                                    .iter()
                                    .map(|_| HashSet::new())
                                    .collect(),
                            },
                        );
                    }
                    {
                        let slot = RowSlot::new();
                        let _guard = FrameGuard::install(
                            ctx.clone(),
                            descriptor,
                            slot.clone(),
                        );
                        while let Some(input_row) = source.try_next().await? {
                            slot.set(input_row);
                            let mut keys = Vec::with_capacity(group_callables.len());
                            for callable in group_callables.iter() {
                                keys.push(callable(ctx.clone()).await?);
                            }
                            if !groups.contains_key(&keys) {
                                groups.insert(
                                    keys.clone(),
                                    Group {
                                        keys: keys.clone(),
                                        states: compiled.iter().map(|c| (c.init)()).collect(),
                                        distinct_seen: compiled
                                            .iter()
                                            .map(|_| HashSet::new())
                                            .collect(),
                                    },
                                );
                            }
                            let group = groups.get_mut(&keys).expect("inserted above");
                            for (at, call) in compiled.iter().enumerate() {
                                let mut args = Vec::with_capacity(call.args.len());
                                for arg in &call.args {
                                    args.push(arg(ctx.clone()).await?);
                                }
                                if call.star {
                                    group.states[at].step(&[])?;
                                    continue;
                                }
                                if call.distinct
                                    && !group.distinct_seen[at].insert(args.clone())
                                {
                                    continue;
                                }
                                group.states[at].step(&args)?;
                            }
                            slot.clear();
                        }
                    }
                    for (_, group) in groups {
                        let mut out = group.keys;
                        for state in group.states {
                            out.push(state.finish()?);
                        }
                        yield row(out);
                    }
                };
                Ok(InstrOutput::Rows(Box::pin(stream) as RowStream))
            }
            .boxed()
        });
        Ok(self.push(vec![source], note, body))
    }
}

/// A body that only rearranges its single row-stream parameter.
fn sync_rows_body(
    wrap: impl Fn(RowStream) -> RowStream + Send + Sync + 'static,
) -> crate::program::InstrBody {
    Arc::new(move |_ctx, params| {
        std::future::ready(rows_param(params).map(|rows| InstrOutput::Rows(wrap(rows)))).boxed()
    })
}
