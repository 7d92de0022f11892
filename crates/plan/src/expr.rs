use std::fmt;
use std::sync::Arc;

use values::{Collation, SqlValue, TypeAffinity};

use crate::{AggregateFunction, Attribute, AttributeId, RelNode, ScalarFunction, ScalarTy};

/// A statement parameter: named (`:name`, `$name`, `@name`) or positional
/// (`?`, `?3`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamKey {
    Named(String),
    Positional(u32),
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKey::Named(name) => write!(f, ":{name}"),
            ParamKey::Positional(index) => write!(f, "?{index}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Concat => "||",
            BinOp::Eq => "=",
            BinOp::Ne => "<>",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "AND",
            BinOp::Or => "OR",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

/// An aggregate call site within a projection.
#[derive(Debug, Clone)]
pub struct AggregateCall {
    pub func: Arc<AggregateFunction>,
    pub args: Vec<Arc<ScalarExpr>>,
    /// `count(*)` has no arguments and steps once per row.
    pub star: bool,
    pub distinct: bool,
}

/// One ORDER BY term.
#[derive(Debug, Clone)]
pub struct SortTerm {
    pub expr: Arc<ScalarExpr>,
    pub descending: bool,
    pub collation: Option<Collation>,
}

/// A scalar plan node: produces one value per evaluation, under the row
/// context active at evaluation time.
#[derive(Debug, Clone)]
pub enum ScalarExpr {
    Literal(SqlValue),
    Column(Attribute),
    Parameter(ParamKey),
    Binary {
        op: BinOp,
        left: Arc<ScalarExpr>,
        right: Arc<ScalarExpr>,
    },
    Unary {
        op: UnOp,
        expr: Arc<ScalarExpr>,
    },
    Like {
        negated: bool,
        expr: Arc<ScalarExpr>,
        pattern: Arc<ScalarExpr>,
    },
    InList {
        expr: Arc<ScalarExpr>,
        list: Vec<Arc<ScalarExpr>>,
        negated: bool,
    },
    IsNull {
        expr: Arc<ScalarExpr>,
        negated: bool,
    },
    Case {
        operand: Option<Arc<ScalarExpr>>,
        branches: Vec<(Arc<ScalarExpr>, Arc<ScalarExpr>)>,
        otherwise: Option<Arc<ScalarExpr>>,
    },
    Cast {
        expr: Arc<ScalarExpr>,
        affinity: TypeAffinity,
    },
    Collate {
        expr: Arc<ScalarExpr>,
        collation: Collation,
    },
    Call {
        func: Arc<ScalarFunction>,
        args: Vec<Arc<ScalarExpr>>,
    },
    Aggregate(AggregateCall),
    Exists {
        plan: Arc<RelNode>,
        correlated: Vec<AttributeId>,
        negated: bool,
    },
    ScalarSubquery {
        plan: Arc<RelNode>,
        correlated: Vec<AttributeId>,
    },
    InSubquery {
        expr: Arc<ScalarExpr>,
        plan: Arc<RelNode>,
        correlated: Vec<AttributeId>,
        negated: bool,
    },
}

impl ScalarExpr {
    /// The inferred type of this expression.
    pub fn ty(&self) -> ScalarTy {
        match self {
            ScalarExpr::Literal(value) => ScalarTy {
                affinity: match value {
                    SqlValue::Integer(_) | SqlValue::BigInt(_) => TypeAffinity::Integer,
                    SqlValue::Float(_) => TypeAffinity::Real,
                    SqlValue::Text(_) => TypeAffinity::Text,
                    SqlValue::Blob(_) => TypeAffinity::Blob,
                    SqlValue::Null => TypeAffinity::Blob,
                },
                nullable: value.is_null(),
            },
            ScalarExpr::Column(attribute) => attribute.ty,
            ScalarExpr::Parameter(_) => ScalarTy::default(),
            ScalarExpr::Binary { op, left, right } => {
                let nullable = left.ty().nullable || right.ty().nullable;
                let affinity = match op {
                    BinOp::Concat => TypeAffinity::Text,
                    BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
                        if left.ty().affinity == TypeAffinity::Real
                            || right.ty().affinity == TypeAffinity::Real
                        {
                            TypeAffinity::Real
                        } else {
                            TypeAffinity::Numeric
                        }
                    }
                    _ => TypeAffinity::Integer,
                };
                ScalarTy { affinity, nullable }
            }
            ScalarExpr::Unary { op, expr } => match op {
                UnOp::Neg => expr.ty(),
                UnOp::Not => ScalarTy {
                    affinity: TypeAffinity::Integer,
                    nullable: expr.ty().nullable,
                },
            },
            ScalarExpr::Like { .. }
            | ScalarExpr::InList { .. }
            | ScalarExpr::Exists { .. }
            | ScalarExpr::InSubquery { .. } => ScalarTy::nullable(TypeAffinity::Integer),
            ScalarExpr::IsNull { .. } => ScalarTy {
                affinity: TypeAffinity::Integer,
                nullable: false,
            },
            ScalarExpr::Case {
                branches,
                otherwise,
                ..
            } => {
                let affinity = branches
                    .first()
                    .map(|(_, result)| result.ty().affinity)
                    .or_else(|| otherwise.as_ref().map(|e| e.ty().affinity))
                    .unwrap_or(TypeAffinity::Blob);
                ScalarTy::nullable(affinity)
            }
            ScalarExpr::Cast { affinity, expr } => ScalarTy {
                affinity: *affinity,
                nullable: expr.ty().nullable,
            },
            ScalarExpr::Collate { expr, .. } => expr.ty(),
            ScalarExpr::Call { func, .. } => ScalarTy::nullable(func.returns),
            ScalarExpr::Aggregate(call) => ScalarTy::nullable(call.func.returns),
            ScalarExpr::ScalarSubquery { plan, .. } => plan
                .attributes()
                .first()
                .map(|a| ScalarTy::nullable(a.ty.affinity))
                .unwrap_or_default(),
        }
    }

    /// A display name for an unaliased projection of this expression.
    pub fn output_name(&self) -> String {
        match self {
            ScalarExpr::Column(attribute) => attribute.name.clone(),
            other => other.render(),
        }
    }

    /// Render the expression for explain output and structural matching.
    pub fn render(&self) -> String {
        match self {
            ScalarExpr::Literal(value) => value.to_string(),
            ScalarExpr::Column(attribute) => format!("{}{}", attribute.name, attribute.id),
            ScalarExpr::Parameter(key) => key.to_string(),
            ScalarExpr::Binary { op, left, right } => {
                format!("({} {} {})", left.render(), op.symbol(), right.render())
            }
            ScalarExpr::Unary { op, expr } => match op {
                UnOp::Neg => format!("(-{})", expr.render()),
                UnOp::Not => format!("(NOT {})", expr.render()),
            },
            ScalarExpr::Like {
                negated,
                expr,
                pattern,
            } => format!(
                "({}{} LIKE {})",
                expr.render(),
                if *negated { " NOT" } else { "" },
                pattern.render()
            ),
            ScalarExpr::InList {
                expr,
                list,
                negated,
            } => format!(
                "({} {}IN ({}))",
                expr.render(),
                if *negated { "NOT " } else { "" },
                list.iter().map(|e| e.render()).collect::<Vec<_>>().join(", ")
            ),
            ScalarExpr::IsNull { expr, negated } => format!(
                "({} IS {}NULL)",
                expr.render(),
                if *negated { "NOT " } else { "" }
            ),
            ScalarExpr::Case { .. } => "CASE".to_string(),
            ScalarExpr::Cast { expr, affinity } => {
                format!("CAST({} AS {:?})", expr.render(), affinity)
            }
            ScalarExpr::Collate { expr, collation } => {
                format!("({} COLLATE {})", expr.render(), collation)
            }
            ScalarExpr::Call { func, args } => format!(
                "{}({})",
                func.name,
                args.iter().map(|e| e.render()).collect::<Vec<_>>().join(", ")
            ),
            ScalarExpr::Aggregate(call) => format!(
                "{}({}{})",
                call.func.name,
                if call.distinct { "DISTINCT " } else { "" },
                if call.star {
                    "*".to_string()
                } else {
                    call.args
                        .iter()
                        .map(|e| e.render())
                        .collect::<Vec<_>>()
                        .join(", ")
                }
            ),
            ScalarExpr::Exists { negated, .. } => {
                format!("({}EXISTS (subquery))", if *negated { "NOT " } else { "" })
            }
            ScalarExpr::ScalarSubquery { .. } => "(subquery)".to_string(),
            ScalarExpr::InSubquery { expr, negated, .. } => format!(
                "({} {}IN (subquery))",
                expr.render(),
                if *negated { "NOT " } else { "" }
            ),
        }
    }

    /// Walk this expression tree, visiting every node.
    pub fn visit(&self, visitor: &mut dyn FnMut(&ScalarExpr)) {
        visitor(self);
        match self {
            ScalarExpr::Binary { left, right, .. } => {
                left.visit(visitor);
                right.visit(visitor);
            }
            ScalarExpr::Unary { expr, .. }
            | ScalarExpr::IsNull { expr, .. }
            | ScalarExpr::Cast { expr, .. }
            | ScalarExpr::Collate { expr, .. } => expr.visit(visitor),
            ScalarExpr::Like { expr, pattern, .. } => {
                expr.visit(visitor);
                pattern.visit(visitor);
            }
            ScalarExpr::InList { expr, list, .. } => {
                expr.visit(visitor);
                for item in list {
                    item.visit(visitor);
                }
            }
            ScalarExpr::Case {
                operand,
                branches,
                otherwise,
            } => {
                if let Some(operand) = operand {
                    operand.visit(visitor);
                }
                for (when, then) in branches {
                    when.visit(visitor);
                    then.visit(visitor);
                }
                if let Some(otherwise) = otherwise {
                    otherwise.visit(visitor);
                }
            }
            ScalarExpr::Call { args, .. } => {
                for arg in args {
                    arg.visit(visitor);
                }
            }
            ScalarExpr::Aggregate(call) => {
                for arg in &call.args {
                    arg.visit(visitor);
                }
            }
            ScalarExpr::InSubquery { expr, .. } => expr.visit(visitor),
            ScalarExpr::Literal(_)
            | ScalarExpr::Column(_)
            | ScalarExpr::Parameter(_)
            | ScalarExpr::Exists { .. }
            | ScalarExpr::ScalarSubquery { .. } => {}
        }
    }

    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.visit(&mut |expr| {
            if matches!(expr, ScalarExpr::Aggregate(_)) {
                found = true;
            }
        });
        found
    }
}
