use std::sync::Arc;

use catalog::{IndexSchema, TableSchema};
use vtab::{ConflictPolicy, Module};

use crate::{Attribute, ScalarExpr, SortTerm, TableFunction};

/// Identifier of one materialized common-table-expression instance
/// within a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CteId(pub u32);

/// A CHECK constraint compiled for one mutation: the same predicate bound
/// against the NEW half of the flat row and against the OLD half (delete
/// checks evaluate over the vanishing values).
#[derive(Debug, Clone)]
pub struct CompiledCheck {
    pub name: String,
    pub ops: catalog::RowOps,
    pub deferred: bool,
    pub expr_new: Arc<ScalarExpr>,
    pub expr_old: Arc<ScalarExpr>,
}

/// The access path settled with the storage module through `best_index`,
/// stored on the scan that will drive it.
#[derive(Clone)]
pub struct AccessPlan {
    pub index_number: i32,
    pub index_string: Option<String>,
    /// Filter-argument expressions, in argv order.
    pub args: Vec<Arc<ScalarExpr>>,
    pub order_by_consumed: bool,
    pub estimated_cost: f64,
    pub estimated_rows: u64,
    pub unique_scan: bool,
    /// Human-readable summary for explain output.
    pub detail: String,
}

impl std::fmt::Debug for AccessPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessPlan")
            .field("index_number", &self.index_number)
            .field("index_string", &self.index_string)
            .field("order_by_consumed", &self.order_by_consumed)
            .field("estimated_rows", &self.estimated_rows)
            .finish_non_exhaustive()
    }
}

/// A relational plan node. Nodes are immutable and shared through `Arc`;
/// the `Arc` pointer identity is the structural identity the emitter
/// memoizes on.
pub enum RelNode {
    /// Scan one virtual table through its module-planned access path.
    TableScan {
        table: Arc<TableSchema>,
        module: Arc<dyn Module>,
        attrs: Vec<Attribute>,
        access: Option<AccessPlan>,
    },
    /// Call a table-valued function.
    TableFunctionCall {
        func: Arc<TableFunction>,
        args: Vec<Arc<ScalarExpr>>,
        attrs: Vec<Attribute>,
    },
    /// Literal rows (INSERT ... VALUES, SELECT without FROM).
    Values {
        rows: Vec<Vec<Arc<ScalarExpr>>>,
        attrs: Vec<Attribute>,
    },
    Filter {
        input: Arc<RelNode>,
        predicate: Arc<ScalarExpr>,
    },
    Project {
        input: Arc<RelNode>,
        exprs: Vec<Arc<ScalarExpr>>,
        attrs: Vec<Attribute>,
    },
    Aggregate {
        input: Arc<RelNode>,
        group_by: Vec<Arc<ScalarExpr>>,
        aggregates: Vec<Arc<ScalarExpr>>,
        attrs: Vec<Attribute>,
    },
    Sort {
        input: Arc<RelNode>,
        terms: Vec<SortTerm>,
    },
    LimitOffset {
        input: Arc<RelNode>,
        limit: Option<Arc<ScalarExpr>>,
        offset: Option<Arc<ScalarExpr>>,
    },
    Distinct {
        input: Arc<RelNode>,
    },
    /// Bag union: left's rows then right's rows. UNION-distinct wraps
    /// this in Distinct.
    UnionAll {
        left: Arc<RelNode>,
        right: Arc<RelNode>,
        attrs: Vec<Attribute>,
    },
    /// Populate a materialized CTE, then run the body that reads it.
    Materialize {
        cte: CteId,
        name: String,
        plan: Arc<RelNode>,
        body: Arc<RelNode>,
    },
    /// Scan a materialized CTE's ephemeral table.
    CteScan {
        cte: CteId,
        name: String,
        attrs: Vec<Attribute>,
    },
    /// The single current row of the recursive-CTE queue.
    SelfRow {
        name: String,
        attrs: Vec<Attribute>,
    },
    /// The recursive-CTE driver: seed the result and queue ephemeral
    /// tables from the initial term, then expand queue rows through the
    /// recursive term until the queue drains.
    RecursiveCte {
        name: String,
        /// Ephemeral id of the result table (what references scan).
        cte: CteId,
        /// Ephemeral id of the pending-row queue.
        queue: CteId,
        initial: Arc<RelNode>,
        recursive: Arc<RelNode>,
        /// Attributes the recursive term's self-reference reads.
        self_attrs: Vec<Attribute>,
        union_all: bool,
        attrs: Vec<Attribute>,
    },
    /// Mutations yield flat rows: OLD attributes then NEW attributes.
    Insert {
        table: Arc<TableSchema>,
        source: Arc<RelNode>,
        policy: ConflictPolicy,
        checks: Vec<CompiledCheck>,
        attrs: Vec<Attribute>,
    },
    Update {
        table: Arc<TableSchema>,
        source: Arc<RelNode>,
        /// Column index → replacement expression over the source row.
        assignments: Vec<(usize, Arc<ScalarExpr>)>,
        checks: Vec<CompiledCheck>,
        attrs: Vec<Attribute>,
    },
    Delete {
        table: Arc<TableSchema>,
        source: Arc<RelNode>,
        checks: Vec<CompiledCheck>,
        attrs: Vec<Attribute>,
    },
}

impl std::fmt::Debug for RelNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.op_name(), self.detail())
    }
}

impl RelNode {
    /// The output attributes of this node. Pass-through operators expose
    /// their input's attributes.
    pub fn attributes(&self) -> Vec<Attribute> {
        match self {
            RelNode::TableScan { attrs, .. }
            | RelNode::TableFunctionCall { attrs, .. }
            | RelNode::Values { attrs, .. }
            | RelNode::Project { attrs, .. }
            | RelNode::Aggregate { attrs, .. }
            | RelNode::CteScan { attrs, .. }
            | RelNode::SelfRow { attrs, .. }
            | RelNode::RecursiveCte { attrs, .. }
            | RelNode::UnionAll { attrs, .. }
            | RelNode::Insert { attrs, .. }
            | RelNode::Update { attrs, .. }
            | RelNode::Delete { attrs, .. } => attrs.clone(),
            RelNode::Filter { input, .. }
            | RelNode::Sort { input, .. }
            | RelNode::LimitOffset { input, .. }
            | RelNode::Distinct { input } => input.attributes(),
            RelNode::Materialize { body, .. } => body.attributes(),
        }
    }

    /// Input relations, for plan walking.
    pub fn children(&self) -> Vec<&Arc<RelNode>> {
        match self {
            RelNode::TableScan { .. }
            | RelNode::TableFunctionCall { .. }
            | RelNode::Values { .. }
            | RelNode::CteScan { .. }
            | RelNode::SelfRow { .. } => Vec::new(),
            RelNode::Filter { input, .. }
            | RelNode::Project { input, .. }
            | RelNode::Aggregate { input, .. }
            | RelNode::Sort { input, .. }
            | RelNode::LimitOffset { input, .. }
            | RelNode::Distinct { input } => vec![input],
            RelNode::UnionAll { left, right, .. } => vec![left, right],
            RelNode::Materialize { plan, body, .. } => vec![plan, body],
            RelNode::RecursiveCte {
                initial, recursive, ..
            } => vec![initial, recursive],
            RelNode::Insert { source, .. }
            | RelNode::Update { source, .. }
            | RelNode::Delete { source, .. } => vec![source],
        }
    }

    pub fn estimated_rows(&self) -> f64 {
        match self {
            RelNode::TableScan { access, .. } => access
                .as_ref()
                .map(|a| a.estimated_rows as f64)
                .unwrap_or(1024.0),
            RelNode::TableFunctionCall { .. } => 32.0,
            RelNode::Values { rows, .. } => rows.len() as f64,
            RelNode::Filter { input, .. } => input.estimated_rows() * 0.5,
            RelNode::Project { input, .. } => input.estimated_rows(),
            RelNode::Aggregate { input, group_by, .. } => {
                if group_by.is_empty() {
                    1.0
                } else {
                    input.estimated_rows().sqrt().max(1.0)
                }
            }
            RelNode::Sort { input, .. } => input.estimated_rows(),
            RelNode::LimitOffset { input, .. } => input.estimated_rows(),
            RelNode::Distinct { input } => input.estimated_rows() * 0.8,
            RelNode::UnionAll { left, right, .. } => {
                left.estimated_rows() + right.estimated_rows()
            }
            RelNode::Materialize { body, .. } => body.estimated_rows(),
            RelNode::CteScan { .. } => 64.0,
            RelNode::SelfRow { .. } => 1.0,
            RelNode::RecursiveCte { .. } => 128.0,
            RelNode::Insert { source, .. }
            | RelNode::Update { source, .. }
            | RelNode::Delete { source, .. } => source.estimated_rows(),
        }
    }

    pub fn estimated_cost(&self) -> f64 {
        let children: f64 = self.children().iter().map(|c| c.estimated_cost()).sum();
        let own = match self {
            RelNode::TableScan { access, .. } => access
                .as_ref()
                .map(|a| a.estimated_cost)
                .unwrap_or(1024.0),
            RelNode::Sort { input, .. } => {
                let n = input.estimated_rows().max(2.0);
                n * n.log2()
            }
            _ => self.estimated_rows(),
        };
        children + own
    }

    /// The operator name shown by explain.
    pub fn op_name(&self) -> &'static str {
        match self {
            RelNode::TableScan { .. } => "scan",
            RelNode::TableFunctionCall { .. } => "table-function",
            RelNode::Values { .. } => "values",
            RelNode::Filter { .. } => "filter",
            RelNode::Project { .. } => "project",
            RelNode::Aggregate { .. } => "aggregate",
            RelNode::Sort { .. } => "sort",
            RelNode::LimitOffset { .. } => "limit",
            RelNode::Distinct { .. } => "distinct",
            RelNode::UnionAll { .. } => "union-all",
            RelNode::Materialize { .. } => "materialize-cte",
            RelNode::CteScan { .. } => "cte-scan",
            RelNode::SelfRow { .. } => "self-row",
            RelNode::RecursiveCte { .. } => "recursive-cte",
            RelNode::Insert { .. } => "insert",
            RelNode::Update { .. } => "update",
            RelNode::Delete { .. } => "delete",
        }
    }

    /// The object a node touches, if any (table, CTE, function).
    pub fn object_name(&self) -> Option<String> {
        match self {
            RelNode::TableScan { table, .. } => Some(table.qualified_name()),
            RelNode::TableFunctionCall { func, .. } => Some(func.name.clone()),
            RelNode::Materialize { name, .. }
            | RelNode::CteScan { name, .. }
            | RelNode::SelfRow { name, .. }
            | RelNode::RecursiveCte { name, .. } => Some(name.clone()),
            RelNode::Insert { table, .. }
            | RelNode::Update { table, .. }
            | RelNode::Delete { table, .. } => Some(table.qualified_name()),
            _ => None,
        }
    }

    /// One-line detail for explain output.
    pub fn detail(&self) -> String {
        match self {
            RelNode::TableScan { table, access, .. } => match access {
                Some(access) => format!("{}: {}", table.qualified_name(), access.detail),
                None => format!("{}: full scan", table.qualified_name()),
            },
            RelNode::TableFunctionCall { func, args, .. } => {
                format!("{}({} args)", func.name, args.len())
            }
            RelNode::Values { rows, .. } => format!("{} rows", rows.len()),
            RelNode::Filter { predicate, .. } => predicate.render(),
            RelNode::Project { exprs, .. } => exprs
                .iter()
                .map(|e| e.render())
                .collect::<Vec<_>>()
                .join(", "),
            RelNode::Aggregate {
                group_by,
                aggregates,
                ..
            } => format!(
                "group by [{}], aggregates [{}]",
                group_by
                    .iter()
                    .map(|e| e.render())
                    .collect::<Vec<_>>()
                    .join(", "),
                aggregates
                    .iter()
                    .map(|e| e.render())
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            RelNode::Sort { terms, .. } => terms
                .iter()
                .map(|t| {
                    format!(
                        "{}{}",
                        t.expr.render(),
                        if t.descending { " DESC" } else { "" }
                    )
                })
                .collect::<Vec<_>>()
                .join(", "),
            RelNode::LimitOffset { limit, offset, .. } => format!(
                "limit {}, offset {}",
                limit.as_ref().map(|e| e.render()).unwrap_or_else(|| "-".into()),
                offset.as_ref().map(|e| e.render()).unwrap_or_else(|| "-".into()),
            ),
            RelNode::Distinct { .. } | RelNode::UnionAll { .. } => String::new(),
            RelNode::Materialize { name, .. } => format!("cte {name}"),
            RelNode::CteScan { name, .. } => format!("cte {name}"),
            RelNode::SelfRow { name, .. } => format!("recursive self {name}"),
            RelNode::RecursiveCte {
                name, union_all, ..
            } => format!(
                "cte {name} ({})",
                if *union_all { "union all" } else { "union" }
            ),
            RelNode::Insert { table, policy, .. } => {
                format!("into {} ({policy:?})", table.qualified_name())
            }
            RelNode::Update {
                table, assignments, ..
            } => format!(
                "{} set {} columns",
                table.qualified_name(),
                assignments.len()
            ),
            RelNode::Delete { table, .. } => format!("from {}", table.qualified_name()),
        }
    }
}

/// The plan of one statement.
#[derive(Debug)]
pub enum StatementPlan {
    /// A row-yielding query.
    Query {
        root: Arc<RelNode>,
        column_names: Vec<String>,
    },
    /// A mutation; `returning` projects over the flat-row output.
    Dml {
        root: Arc<RelNode>,
        returning: bool,
        column_names: Vec<String>,
    },
    CreateTable {
        schema: Arc<TableSchema>,
        if_not_exists: bool,
    },
    CreateIndex {
        table: Arc<TableSchema>,
        index: IndexSchema,
    },
    CreateView {
        schema: Arc<TableSchema>,
    },
    DropTable {
        schema_name: String,
        name: String,
        if_exists: bool,
    },
    DropView {
        schema_name: String,
        name: String,
        if_exists: bool,
    },
    DropIndex {
        name: String,
        if_exists: bool,
    },
}

impl StatementPlan {
    pub fn column_names(&self) -> &[String] {
        match self {
            StatementPlan::Query { column_names, .. }
            | StatementPlan::Dml { column_names, .. } => column_names,
            _ => &[],
        }
    }
}
