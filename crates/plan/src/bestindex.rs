//! `best_index` integration: extract sargable terms from a scan's WHERE
//! conjuncts, offer them (plus ORDER BY terms and the used-column bitmap)
//! to the table's module, and fold the module's answer back into the plan
//! as an [`AccessPlan`] with the consumed conjuncts dropped.

use std::collections::BTreeSet;
use std::sync::Arc;

use catalog::TableSchema;
use vtab::{ConstraintOp, IndexConstraint, IndexInfo, IndexOrderBy, Module};

use crate::pushdown::collect_attrs;
use crate::{
    AccessPlan, Attribute, AttributeId, BinOp, Error, RelNode, Result, ScalarExpr, SortTerm,
};

/// One sargable WHERE conjunct: which column, which operator, and the
/// expression supplying the probe value.
struct Sargable {
    conjunct: usize,
    column: usize,
    op: ConstraintOp,
    value: Arc<ScalarExpr>,
    usable: bool,
}

/// Split a predicate into AND-joined conjuncts.
pub(crate) fn split_conjuncts(predicate: &Arc<ScalarExpr>) -> Vec<Arc<ScalarExpr>> {
    match &**predicate {
        ScalarExpr::Binary {
            op: BinOp::And,
            left,
            right,
        } => {
            let mut out = split_conjuncts(left);
            out.extend(split_conjuncts(right));
            out
        }
        _ => vec![predicate.clone()],
    }
}

fn and_join(conjuncts: Vec<Arc<ScalarExpr>>) -> Option<Arc<ScalarExpr>> {
    conjuncts.into_iter().reduce(|left, right| {
        Arc::new(ScalarExpr::Binary {
            op: BinOp::And,
            left,
            right,
        })
    })
}

fn scan_column(attrs: &[Attribute], expr: &ScalarExpr) -> Option<usize> {
    match expr {
        ScalarExpr::Column(attribute) => attrs.iter().position(|a| a.id == attribute.id),
        _ => None,
    }
}

fn constraint_op(op: BinOp, swapped: bool) -> Option<ConstraintOp> {
    let direct = match op {
        BinOp::Eq => ConstraintOp::Eq,
        BinOp::Lt => ConstraintOp::Lt,
        BinOp::Le => ConstraintOp::Le,
        BinOp::Gt => ConstraintOp::Gt,
        BinOp::Ge => ConstraintOp::Ge,
        _ => return None,
    };
    if !swapped {
        return Some(direct);
    }
    Some(match direct {
        ConstraintOp::Eq => ConstraintOp::Eq,
        ConstraintOp::Lt => ConstraintOp::Gt,
        ConstraintOp::Le => ConstraintOp::Ge,
        ConstraintOp::Gt => ConstraintOp::Lt,
        ConstraintOp::Ge => ConstraintOp::Le,
    })
}

fn contains_subquery(expr: &ScalarExpr) -> bool {
    let mut found = false;
    expr.visit(&mut |node| {
        if matches!(
            node,
            ScalarExpr::Exists { .. }
                | ScalarExpr::ScalarSubquery { .. }
                | ScalarExpr::InSubquery { .. }
        ) {
            found = true;
        }
    });
    found
}

fn extract_sargables(
    attrs: &[Attribute],
    scan_attrs: &BTreeSet<AttributeId>,
    conjuncts: &[Arc<ScalarExpr>],
) -> Vec<Sargable> {
    let mut out = Vec::new();
    for (at, conjunct) in conjuncts.iter().enumerate() {
        let ScalarExpr::Binary { op, left, right } = &**conjunct else {
            continue;
        };
        let (column, value, swapped) = if let Some(column) = scan_column(attrs, left) {
            (column, right.clone(), false)
        } else if let Some(column) = scan_column(attrs, right) {
            (column, left.clone(), true)
        } else {
            continue;
        };
        let Some(op) = constraint_op(*op, swapped) else {
            continue;
        };
        // A probe value reading this scan's own columns isn't a constant
        // for the cursor and can't drive the access path at all.
        if !collect_attrs(&value).is_disjoint(scan_attrs) {
            continue;
        }
        // Subquery-valued probes are offered for costing only.
        let usable = !contains_subquery(&value);
        out.push(Sargable {
            conjunct: at,
            column,
            op,
            value,
            usable,
        });
    }
    out
}

/// Settle the access path for one table scan. Returns the (possibly
/// filter-wrapped) scan and whether the module consumed the ORDER BY.
pub(crate) fn plan_scan(
    table: Arc<TableSchema>,
    module: Arc<dyn Module>,
    attrs: Vec<Attribute>,
    conjuncts: Vec<Arc<ScalarExpr>>,
    order_terms: &[SortTerm],
    used_attrs: &BTreeSet<AttributeId>,
) -> Result<(Arc<RelNode>, bool)> {
    let scan_attrs: BTreeSet<AttributeId> = attrs.iter().map(|a| a.id).collect();
    let sargables = extract_sargables(&attrs, &scan_attrs, &conjuncts);

    // ORDER BY terms are offered only when every term is a plain column
    // of this scan.
    let order_by: Vec<IndexOrderBy> = order_terms
        .iter()
        .map(|term| {
            scan_column(&attrs, &term.expr).map(|column| IndexOrderBy {
                column,
                descending: term.descending,
            })
        })
        .collect::<Option<Vec<_>>>()
        .unwrap_or_default();

    let mut columns_used = 0u64;
    for (position, attribute) in attrs.iter().enumerate() {
        if used_attrs.contains(&attribute.id) {
            columns_used |= 1 << position.min(63);
        }
    }

    let mut info = IndexInfo::new(
        sargables
            .iter()
            .map(|s| IndexConstraint {
                column: s.column,
                op: s.op,
                usable: s.usable,
            })
            .collect(),
        order_by,
        columns_used,
    );
    module.best_index(&table, &mut info)?;

    // Fold constraint usage back: argv slots collect probe expressions,
    // omitted conjuncts disappear from the residual filter.
    let mut args: Vec<(u32, Arc<ScalarExpr>)> = Vec::new();
    let mut omitted: BTreeSet<usize> = BTreeSet::new();
    for (at, usage) in info.constraint_usage.iter().enumerate() {
        if let Some(argv) = usage.argv_index {
            let sargable = &sargables[at];
            if !sargable.usable {
                return Err(Error::Plan(format!(
                    "module assigned argv {argv} to an unusable constraint"
                )));
            }
            args.push((argv, sargable.value.clone()));
            if usage.omit {
                omitted.insert(sargable.conjunct);
            }
        } else if usage.omit {
            omitted.insert(sargables[at].conjunct);
        }
    }
    args.sort_by_key(|(argv, _)| *argv);
    let args: Vec<Arc<ScalarExpr>> = args.into_iter().map(|(_, expr)| expr).collect();

    let order_by_consumed = info.order_by_consumed;
    let detail = match (&info.index_string, info.index_number) {
        (Some(index), _) => format!("via index {index}"),
        (None, number) => format!("access #{number}"),
    };
    let access = AccessPlan {
        index_number: info.index_number,
        index_string: info.index_string.clone(),
        args,
        order_by_consumed,
        estimated_cost: info.estimated_cost,
        estimated_rows: info.estimated_rows,
        unique_scan: info.flags.contains(vtab::IndexFlags::UNIQUE_SCAN),
        detail,
    };

    let scan = Arc::new(RelNode::TableScan {
        table,
        module,
        attrs,
        access: Some(access),
    });

    let residual: Vec<Arc<ScalarExpr>> = conjuncts
        .into_iter()
        .enumerate()
        .filter(|(at, _)| !omitted.contains(at))
        .map(|(_, conjunct)| conjunct)
        .collect();
    let node = match and_join(residual) {
        Some(predicate) => Arc::new(RelNode::Filter {
            input: scan,
            predicate,
        }),
        None => scan,
    };
    Ok((node, order_by_consumed))
}
