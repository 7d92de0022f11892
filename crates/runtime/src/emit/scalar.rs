//! Scalar compilation: a [`ScalarExpr`] becomes a [`Callable`] — a
//! closure evaluated many times against the row context active at each
//! call. Subqueries compile into subprograms run per evaluation.

use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use plan::functions::ScalarBody;
use plan::{BinOp, ScalarExpr, UnOp};
use values::{compare_with, ops, Collation, SqlValue};

use crate::sched::run_program;
use crate::{Callable, Emitter, Error, Result};

impl Emitter {
    pub(crate) fn compile_scalar(&mut self, expr: &Arc<ScalarExpr>) -> Result<Callable> {
        Ok(match &**expr {
            ScalarExpr::Literal(value) => {
                let value = value.clone();
                constant(move || Ok(value.clone()))
            }
            ScalarExpr::Column(attribute) => {
                let id = attribute.id;
                Arc::new(move |ctx| std::future::ready(ctx.attribute(id)).boxed())
            }
            ScalarExpr::Parameter(key) => {
                let key = key.clone();
                Arc::new(move |ctx| {
                    // Unbound parameters read as Null.
                    let value = ctx.params.get(&key).cloned().unwrap_or(SqlValue::Null);
                    std::future::ready(Ok(value)).boxed()
                })
            }
            ScalarExpr::Binary { op, left, right } => {
                let collation = if op.is_comparison() {
                    explicit_collation(left).or_else(|| explicit_collation(right))
                } else {
                    None
                };
                let left = self.compile_scalar(left)?;
                let right = self.compile_scalar(right)?;
                let op = *op;
                Arc::new(move |ctx| {
                    let left = left.clone();
                    let right = right.clone();
                    async move {
                        let a = left(ctx.clone()).await?;
                        let b = right(ctx).await?;
                        Ok(eval_binary(op, collation, &a, &b))
                    }
                    .boxed()
                })
            }
            ScalarExpr::Unary { op, expr } => {
                let inner = self.compile_scalar(expr)?;
                let op = *op;
                Arc::new(move |ctx| {
                    let inner = inner.clone();
                    async move {
                        let value = inner(ctx).await?;
                        Ok(match op {
                            UnOp::Neg => ops::neg(&value),
                            UnOp::Not => ops::not(&value),
                        })
                    }
                    .boxed()
                })
            }
            ScalarExpr::Like {
                negated,
                expr,
                pattern,
            } => {
                let target = self.compile_scalar(expr)?;
                let pattern = self.compile_scalar(pattern)?;
                let negated = *negated;
                Arc::new(move |ctx| {
                    let target = target.clone();
                    let pattern = pattern.clone();
                    async move {
                        let value = target(ctx.clone()).await?;
                        let pattern = pattern(ctx).await?;
                        let hit = ops::like(&value, &pattern);
                        Ok(if negated { ops::not(&hit) } else { hit })
                    }
                    .boxed()
                })
            }
            ScalarExpr::InList {
                expr,
                list,
                negated,
            } => {
                let target = self.compile_scalar(expr)?;
                let list = list
                    .iter()
                    .map(|item| self.compile_scalar(item))
                    .collect::<Result<Vec<_>>>()?;
                let negated = *negated;
                Arc::new(move |ctx| {
                    let target = target.clone();
                    let list = list.clone();
                    async move {
                        let value = target(ctx.clone()).await?;
                        let mut items = Vec::with_capacity(list.len());
                        for item in &list {
                            items.push(item(ctx.clone()).await?);
                        }
                        Ok(in_verdict(&value, &items, negated))
                    }
                    .boxed()
                })
            }
            ScalarExpr::IsNull { expr, negated } => {
                let inner = self.compile_scalar(expr)?;
                let negated = *negated;
                Arc::new(move |ctx| {
                    let inner = inner.clone();
                    async move {
                        let value = inner(ctx).await?;
                        Ok(SqlValue::Integer((value.is_null() != negated) as i64))
                    }
                    .boxed()
                })
            }
            ScalarExpr::Case {
                operand,
                branches,
                otherwise,
            } => {
                let operand = operand
                    .as_ref()
                    .map(|operand| self.compile_scalar(operand))
                    .transpose()?;
                let branches = branches
                    .iter()
                    .map(|(when, then)| {
                        Ok((self.compile_scalar(when)?, self.compile_scalar(then)?))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let otherwise = otherwise
                    .as_ref()
                    .map(|otherwise| self.compile_scalar(otherwise))
                    .transpose()?;
                Arc::new(move |ctx| {
                    let operand = operand.clone();
                    let branches = branches.clone();
                    let otherwise = otherwise.clone();
                    async move {
                        let probe = match &operand {
                            Some(operand) => Some(operand(ctx.clone()).await?),
                            None => None,
                        };
                        for (when, then) in &branches {
                            let condition = when(ctx.clone()).await?;
                            let hit = match &probe {
                                Some(probe) => {
                                    ops::eq(probe, &condition).is_truthy() == Some(true)
                                }
                                None => condition.is_truthy() == Some(true),
                            };
                            if hit {
                                return then(ctx).await;
                            }
                        }
                        match &otherwise {
                            Some(otherwise) => otherwise(ctx).await,
                            None => Ok(SqlValue::Null),
                        }
                    }
                    .boxed()
                })
            }
            ScalarExpr::Cast { expr, affinity } => {
                let inner = self.compile_scalar(expr)?;
                let affinity = *affinity;
                Arc::new(move |ctx| {
                    let inner = inner.clone();
                    async move { Ok(affinity.apply(inner(ctx).await?)) }.boxed()
                })
            }
            ScalarExpr::Collate { expr, .. } => self.compile_scalar(expr)?,
            ScalarExpr::Call { func, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.compile_scalar(arg))
                    .collect::<Result<Vec<_>>>()?;
                let func = func.clone();
                Arc::new(move |ctx| {
                    let args = args.clone();
                    let func = func.clone();
                    async move {
                        let mut evaluated = Vec::with_capacity(args.len());
                        for arg in &args {
                            evaluated.push(arg(ctx.clone()).await?);
                        }
                        match &func.body {
                            ScalarBody::Sync(body) => Ok(body(&evaluated)?),
                            ScalarBody::Async(body) => Ok(body(evaluated).await?),
                        }
                    }
                    .boxed()
                })
            }
            ScalarExpr::Aggregate(_) => {
                return Err(Error::Internal(
                    "aggregate call escaped its Aggregate operator".into(),
                ))
            }
            ScalarExpr::Exists { plan, negated, .. } => {
                let subprogram = self.emit_subprogram(plan)?;
                let negated = *negated;
                Arc::new(move |ctx| {
                    let subprogram = subprogram.clone();
                    async move {
                        let mut rows = run_program(subprogram, ctx).await?.into_rows()?;
                        let found = rows.next().await.transpose()?.is_some();
                        Ok(SqlValue::Integer((found != negated) as i64))
                    }
                    .boxed()
                })
            }
            ScalarExpr::ScalarSubquery { plan, .. } => {
                let subprogram = self.emit_subprogram(plan)?;
                Arc::new(move |ctx| {
                    let subprogram = subprogram.clone();
                    async move {
                        let mut rows = run_program(subprogram, ctx).await?.into_rows()?;
                        match rows.next().await.transpose()? {
                            Some(row) => Ok(row.first().cloned().unwrap_or(SqlValue::Null)),
                            None => Ok(SqlValue::Null),
                        }
                    }
                    .boxed()
                })
            }
            ScalarExpr::InSubquery {
                expr,
                plan,
                negated,
                ..
            } => {
                let target = self.compile_scalar(expr)?;
                let subprogram = self.emit_subprogram(plan)?;
                let negated = *negated;
                Arc::new(move |ctx| {
                    let target = target.clone();
                    let subprogram = subprogram.clone();
                    async move {
                        let value = target(ctx.clone()).await?;
                        let mut rows = run_program(subprogram, ctx).await?.into_rows()?;
                        let mut items = Vec::new();
                        while let Some(row) = rows.next().await.transpose()? {
                            items.push(row.first().cloned().unwrap_or(SqlValue::Null));
                        }
                        Ok(in_verdict(&value, &items, negated))
                    }
                    .boxed()
                })
            }
        })
    }
}

fn constant(
    body: impl Fn() -> Result<SqlValue> + Send + Sync + 'static,
) -> Callable {
    Arc::new(move |_ctx| std::future::ready(body()).boxed())
}

/// The explicitly-declared collation of a comparison operand, if any.
fn explicit_collation(expr: &Arc<ScalarExpr>) -> Option<Collation> {
    match &**expr {
        ScalarExpr::Collate { collation, .. } => Some(*collation),
        _ => None,
    }
}

fn eval_binary(op: BinOp, collation: Option<Collation>, a: &SqlValue, b: &SqlValue) -> SqlValue {
    if let (Some(collation), true) = (collation, op.is_comparison()) {
        if a.is_null() || b.is_null() {
            return SqlValue::Null;
        }
        let ordering = compare_with(collation, a, b);
        let hit = match op {
            BinOp::Eq => ordering == std::cmp::Ordering::Equal,
            BinOp::Ne => ordering != std::cmp::Ordering::Equal,
            BinOp::Lt => ordering == std::cmp::Ordering::Less,
            BinOp::Le => ordering != std::cmp::Ordering::Greater,
            BinOp::Gt => ordering == std::cmp::Ordering::Greater,
            BinOp::Ge => ordering != std::cmp::Ordering::Less,
            _ => unreachable!("is_comparison gated above"),
        };
        return SqlValue::Integer(hit as i64);
    }
    match op {
        BinOp::Add => ops::add(a, b),
        BinOp::Sub => ops::sub(a, b),
        BinOp::Mul => ops::mul(a, b),
        BinOp::Div => ops::div(a, b),
        BinOp::Rem => ops::rem(a, b),
        BinOp::Concat => ops::concat(a, b),
        BinOp::Eq => ops::eq(a, b),
        BinOp::Ne => ops::ne(a, b),
        BinOp::Lt => ops::lt(a, b),
        BinOp::Le => ops::le(a, b),
        BinOp::Gt => ops::gt(a, b),
        BinOp::Ge => ops::ge(a, b),
        BinOp::And => ops::and(a, b),
        BinOp::Or => ops::or(a, b),
    }
}

/// Three-valued IN: a match wins; otherwise a Null probe or Null item
/// makes the answer unknown.
fn in_verdict(value: &SqlValue, items: &[SqlValue], negated: bool) -> SqlValue {
    if value.is_null() {
        return SqlValue::Null;
    }
    let mut saw_null = false;
    for item in items {
        if item.is_null() {
            saw_null = true;
            continue;
        }
        if ops::eq(value, item).is_truthy() == Some(true) {
            return SqlValue::Integer(!negated as i64);
        }
    }
    if saw_null {
        SqlValue::Null
    } else {
        SqlValue::Integer(negated as i64)
    }
}
