//! Lowering of AST expressions into scalar plan nodes, under a scope.

use std::sync::Arc;

use sqlparser::ast::{
    BinaryOperator, Expr, Function, FunctionArg, FunctionArgExpr, UnaryOperator, Value,
};

use values::{Collation, SqlValue, TypeAffinity};

use crate::scope::{CorrelationTracker, ScopeRef};
use crate::{
    AggregateCall, BinOp, Builder, Error, Resolution, Result, ScalarExpr, Scope, UnOp,
};

/// Expression-building context: the active scope plus whether aggregate
/// calls are legal here (projections and HAVING yes, WHERE no).
pub(crate) struct ExprCx<'b, 'a> {
    pub builder: &'b mut Builder<'a>,
    pub scope: ScopeRef,
    pub allow_aggregates: bool,
}

impl<'b, 'a> ExprCx<'b, 'a> {
    pub fn new(builder: &'b mut Builder<'a>, scope: ScopeRef, allow_aggregates: bool) -> Self {
        ExprCx {
            builder,
            scope,
            allow_aggregates,
        }
    }

    pub fn build(&mut self, expr: &Expr) -> Result<Arc<ScalarExpr>> {
        match expr {
            Expr::Identifier(ident) => self.column(None, &ident.value),
            Expr::CompoundIdentifier(idents) => match idents.as_slice() {
                [qualifier, name] => self.column(Some(&qualifier.value), &name.value),
                _ => Err(Error::Unsupported(format!(
                    "compound identifier {}",
                    idents
                        .iter()
                        .map(|i| i.value.as_str())
                        .collect::<Vec<_>>()
                        .join(".")
                ))),
            },
            Expr::Value(value) => self.value(value),
            Expr::Nested(inner) => self.build(inner),
            Expr::BinaryOp { left, op, right } => {
                let op = match op {
                    BinaryOperator::Plus => BinOp::Add,
                    BinaryOperator::Minus => BinOp::Sub,
                    BinaryOperator::Multiply => BinOp::Mul,
                    BinaryOperator::Divide => BinOp::Div,
                    BinaryOperator::Modulo => BinOp::Rem,
                    BinaryOperator::StringConcat => BinOp::Concat,
                    BinaryOperator::Eq => BinOp::Eq,
                    BinaryOperator::NotEq => BinOp::Ne,
                    BinaryOperator::Lt => BinOp::Lt,
                    BinaryOperator::LtEq => BinOp::Le,
                    BinaryOperator::Gt => BinOp::Gt,
                    BinaryOperator::GtEq => BinOp::Ge,
                    BinaryOperator::And => BinOp::And,
                    BinaryOperator::Or => BinOp::Or,
                    other => {
                        return Err(Error::Unsupported(format!("binary operator {other}")))
                    }
                };
                Ok(Arc::new(ScalarExpr::Binary {
                    op,
                    left: self.build(left)?,
                    right: self.build(right)?,
                }))
            }
            Expr::UnaryOp { op, expr } => match op {
                UnaryOperator::Minus => Ok(Arc::new(ScalarExpr::Unary {
                    op: UnOp::Neg,
                    expr: self.build(expr)?,
                })),
                UnaryOperator::Plus => self.build(expr),
                UnaryOperator::Not => Ok(Arc::new(ScalarExpr::Unary {
                    op: UnOp::Not,
                    expr: self.build(expr)?,
                })),
                other => Err(Error::Unsupported(format!("unary operator {other}"))),
            },
            Expr::IsNull(inner) => Ok(Arc::new(ScalarExpr::IsNull {
                expr: self.build(inner)?,
                negated: false,
            })),
            Expr::IsNotNull(inner) => Ok(Arc::new(ScalarExpr::IsNull {
                expr: self.build(inner)?,
                negated: true,
            })),
            Expr::Between {
                expr,
                negated,
                low,
                high,
            } => {
                // BETWEEN desugars at build time.
                let target = self.build(expr)?;
                let within = Arc::new(ScalarExpr::Binary {
                    op: BinOp::And,
                    left: Arc::new(ScalarExpr::Binary {
                        op: BinOp::Ge,
                        left: target.clone(),
                        right: self.build(low)?,
                    }),
                    right: Arc::new(ScalarExpr::Binary {
                        op: BinOp::Le,
                        left: target,
                        right: self.build(high)?,
                    }),
                });
                Ok(if *negated {
                    Arc::new(ScalarExpr::Unary {
                        op: UnOp::Not,
                        expr: within,
                    })
                } else {
                    within
                })
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => Ok(Arc::new(ScalarExpr::InList {
                expr: self.build(expr)?,
                list: list
                    .iter()
                    .map(|item| self.build(item))
                    .collect::<Result<Vec<_>>>()?,
                negated: *negated,
            })),
            Expr::Like {
                negated,
                expr,
                pattern,
                ..
            } => Ok(Arc::new(ScalarExpr::Like {
                negated: *negated,
                expr: self.build(expr)?,
                pattern: self.build(pattern)?,
            })),
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                let operand = operand
                    .as_ref()
                    .map(|operand| self.build(operand))
                    .transpose()?;
                let branches = conditions
                    .iter()
                    .zip(results)
                    .map(|(when, then)| Ok((self.build(when)?, self.build(then)?)))
                    .collect::<Result<Vec<_>>>()?;
                let otherwise = else_result
                    .as_ref()
                    .map(|otherwise| self.build(otherwise))
                    .transpose()?;
                Ok(Arc::new(ScalarExpr::Case {
                    operand,
                    branches,
                    otherwise,
                }))
            }
            Expr::Cast {
                expr, data_type, ..
            } => Ok(Arc::new(ScalarExpr::Cast {
                expr: self.build(expr)?,
                affinity: TypeAffinity::from_type_name(&data_type.to_string()),
            })),
            Expr::Collate { expr, collation } => Ok(Arc::new(ScalarExpr::Collate {
                expr: self.build(expr)?,
                collation: Collation::parse(&collation.to_string())
                    .map_err(catalog::Error::from)?,
            })),
            Expr::Function(function) => self.function(function),
            Expr::Exists { subquery, negated } => {
                let (plan, correlated) = self.subquery(subquery)?;
                Ok(Arc::new(ScalarExpr::Exists {
                    plan,
                    correlated,
                    negated: *negated,
                }))
            }
            Expr::Subquery(subquery) => {
                let (plan, correlated) = self.subquery(subquery)?;
                if plan.attributes().len() != 1 {
                    return Err(Error::Plan(
                        "scalar subquery must yield exactly one column".to_string(),
                    ));
                }
                Ok(Arc::new(ScalarExpr::ScalarSubquery { plan, correlated }))
            }
            Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => {
                let target = self.build(expr)?;
                let (plan, correlated) = self.subquery(subquery)?;
                if plan.attributes().len() != 1 {
                    return Err(Error::Plan(
                        "IN subquery must yield exactly one column".to_string(),
                    ));
                }
                Ok(Arc::new(ScalarExpr::InSubquery {
                    expr: target,
                    plan,
                    correlated,
                    negated: *negated,
                }))
            }
            other => Err(Error::Unsupported(format!("expression {other}"))),
        }
    }

    fn column(&mut self, qualifier: Option<&str>, name: &str) -> Result<Arc<ScalarExpr>> {
        match self.scope.resolve(qualifier, name) {
            Resolution::Column(attribute) => Ok(Arc::new(ScalarExpr::Column(attribute))),
            Resolution::Ambiguous(name) => Err(Error::AmbiguousColumn(name)),
            Resolution::NotFound => Err(Error::NoSuchColumn(match qualifier {
                Some(qualifier) => format!("{qualifier}.{name}"),
                None => name.to_string(),
            })),
        }
    }

    fn value(&mut self, value: &Value) -> Result<Arc<ScalarExpr>> {
        let scalar = match value {
            Value::Null => ScalarExpr::Literal(SqlValue::Null),
            Value::Boolean(flag) => ScalarExpr::Literal(SqlValue::Integer(*flag as i64)),
            Value::Number(text, _) => match SqlValue::parse_integer(text) {
                Some(integer) => ScalarExpr::Literal(integer),
                None => ScalarExpr::Literal(SqlValue::Float(
                    text.parse::<f64>()
                        .map_err(|_| Error::Parse(format!("bad numeric literal {text:?}")))?,
                )),
            },
            Value::SingleQuotedString(text) | Value::DoubleQuotedString(text) => {
                ScalarExpr::Literal(SqlValue::text(text))
            }
            Value::HexStringLiteral(hex) => {
                let bytes = decode_hex(hex)
                    .ok_or_else(|| Error::Parse(format!("bad hex literal {hex:?}")))?;
                ScalarExpr::Literal(SqlValue::blob(bytes))
            }
            Value::Placeholder(text) => {
                ScalarExpr::Parameter(self.builder.register_param(text)?)
            }
            other => return Err(Error::Unsupported(format!("literal {other}"))),
        };
        Ok(Arc::new(scalar))
    }

    fn function(&mut self, function: &Function) -> Result<Arc<ScalarExpr>> {
        let name = function
            .name
            .0
            .last()
            .map(|ident| ident.value.clone())
            .unwrap_or_default();

        let star = matches!(
            function.args.as_slice(),
            [FunctionArg::Unnamed(FunctionArgExpr::Wildcard)]
        );
        let mut args = Vec::new();
        if !star {
            for arg in &function.args {
                match arg {
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => {
                        args.push(self.build(expr)?)
                    }
                    other => {
                        return Err(Error::Unsupported(format!(
                            "function argument {other} in {name}"
                        )))
                    }
                }
            }
        }

        if let Some(aggregate) = self.builder.global().aggregate_function(&name) {
            if !self.allow_aggregates {
                return Err(Error::Plan(format!(
                    "aggregate {name}() is not allowed here"
                )));
            }
            if let Some(expected) = aggregate.arg_count {
                if !star && args.len() != expected {
                    return Err(Error::Plan(format!(
                        "{name}() expects {expected} arguments, got {}",
                        args.len()
                    )));
                }
            }
            return Ok(Arc::new(ScalarExpr::Aggregate(AggregateCall {
                func: aggregate,
                args,
                star,
                distinct: function.distinct,
            })));
        }

        let scalar = self
            .builder
            .global()
            .scalar_function(&name)
            .ok_or_else(|| Error::NoSuchFunction(name.clone()))?;
        if star {
            return Err(Error::Plan(format!("{name}(*) is not an aggregate")));
        }
        if let Some(expected) = scalar.arg_count {
            if args.len() != expected {
                return Err(Error::Plan(format!(
                    "{name}() expects {expected} arguments, got {}",
                    args.len()
                )));
            }
        }
        Ok(Arc::new(ScalarExpr::Call { func: scalar, args }))
    }

    /// Build a subquery under this scope, learning which outer attributes
    /// it correlates with.
    fn subquery(
        &mut self,
        subquery: &sqlparser::ast::Query,
    ) -> Result<(Arc<crate::RelNode>, Vec<crate::AttributeId>)> {
        let tracker = Arc::new(CorrelationTracker::new(self.scope.clone()));
        let (plan, _names) = self
            .builder
            .build_query(subquery, Some(tracker.clone() as ScopeRef))?;
        Ok((plan, tracker.correlated()))
    }
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|at| u8::from_str_radix(&hex[at..at + 2], 16).ok())
        .collect()
}
