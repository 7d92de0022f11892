//! WITH-clause handling: strategy selection (view vs. materialized),
//! recursive-CTE lowering, and reference counting.

use std::collections::HashMap;
use std::sync::Arc;

use sqlparser::ast::{
    Cte, CteAsMaterialized, Expr as AstExpr, Query, SetExpr, SetOperator, SetQuantifier,
    TableFactor, With,
};

use crate::scope::ScopeRef;
use crate::{Attribute, Builder, CteId, Error, RelNode, Result, ScalarTy};

/// How a CTE name resolves while building the queries that can see it.
#[derive(Debug, Clone)]
pub(crate) enum CteBinding {
    /// Inlined: compiled as a subquery at each reference site.
    View {
        query: Box<Query>,
        columns: Vec<String>,
    },
    /// Compiled once into an ephemeral table; references scan it.
    Materialized {
        cte: CteId,
        name: String,
        columns: Vec<(String, ScalarTy)>,
    },
    /// The recursive term's self-reference: the current queue row.
    RecursiveSelf {
        name: String,
        attrs: Vec<Attribute>,
    },
}

impl<'a> Builder<'a> {
    /// Process a WITH clause: push a binding frame and return the
    /// materialized plans (in declaration order) the caller must wrap
    /// around its body. Always pushes a frame, even for queries without
    /// CTEs, so the caller's pop is unconditional.
    pub(crate) fn push_cte_frame(
        &mut self,
        with: Option<&With>,
        parent_body: &SetExpr,
        outer: Option<ScopeRef>,
    ) -> Result<Vec<(CteId, String, Arc<RelNode>)>> {
        self.cte_frames.push(HashMap::new());
        let Some(with) = with else {
            return Ok(Vec::new());
        };

        let mut materialized = Vec::new();
        for (at, cte) in with.cte_tables.iter().enumerate() {
            let name = cte.alias.name.value.clone();
            let columns: Vec<String> = cte
                .alias
                .columns
                .iter()
                .map(|ident| ident.value.clone())
                .collect();

            let is_recursive = with.recursive && references_table(&cte.query, &name);
            // Later CTEs and the main body can reference this one.
            let mut reference_count = with.cte_tables[at + 1..]
                .iter()
                .map(|later| count_references(&later.query, &name))
                .sum::<usize>();
            count_in_set_expr(parent_body, &name, &mut reference_count);
            let reference_count = reference_count;

            let strategy = match &cte.materialized {
                Some(CteAsMaterialized::Materialized) => Strategy::Materialized,
                Some(CteAsMaterialized::NotMaterialized) => Strategy::View,
                None if is_recursive => Strategy::Materialized,
                None if reference_count > 1 => Strategy::Materialized,
                None => Strategy::View,
            };

            if is_recursive {
                let (id, node, columns) =
                    self.build_recursive_cte(cte, &name, &columns, outer.clone())?;
                self.bind_cte(
                    &name,
                    CteBinding::Materialized {
                        cte: id,
                        name: name.clone(),
                        columns,
                    },
                );
                materialized.push((id, name, node));
                continue;
            }

            match strategy {
                Strategy::View => {
                    self.bind_cte(
                        &name,
                        CteBinding::View {
                            query: cte.query.clone(),
                            columns,
                        },
                    );
                }
                Strategy::Materialized => {
                    let (node, names) = self.build_query(&cte.query, outer.clone())?;
                    let names = if columns.is_empty() { names } else { columns };
                    let (node, attrs) = self.rename_columns(node, &names);
                    let id = self.next_cte_id();
                    self.bind_cte(
                        &name,
                        CteBinding::Materialized {
                            cte: id,
                            name: name.clone(),
                            columns: attrs
                                .iter()
                                .map(|a| (a.name.clone(), a.ty))
                                .collect(),
                        },
                    );
                    materialized.push((id, name, node));
                }
            }
        }
        Ok(materialized)
    }

    fn bind_cte(&mut self, name: &str, binding: CteBinding) {
        self.cte_frames
            .last_mut()
            .expect("a frame was just pushed")
            .insert(name.to_ascii_lowercase(), binding);
    }

    /// Lower a recursive CTE. The query must be a UNION or UNION ALL; the
    /// left arm seeds the result and queue, the right arm expands one
    /// queue row at a time through its self-reference.
    fn build_recursive_cte(
        &mut self,
        cte: &Cte,
        name: &str,
        columns: &[String],
        outer: Option<ScopeRef>,
    ) -> Result<(CteId, Arc<RelNode>, Vec<(String, ScalarTy)>)> {
        let SetExpr::SetOperation {
            op: SetOperator::Union,
            set_quantifier,
            left,
            right,
        } = &*cte.query.body
        else {
            return Err(Error::Plan(format!(
                "recursive CTE {name} must be a UNION or UNION ALL"
            )));
        };
        let union_all = matches!(set_quantifier, SetQuantifier::All);

        let (initial, initial_names) = self.build_body(left, outer.clone(), &[])?;
        let initial_attrs = initial.attributes();
        let column_names: Vec<String> = if columns.is_empty() {
            initial_names
        } else {
            columns.to_vec()
        };
        if column_names.len() != initial_attrs.len() {
            return Err(Error::Plan(format!(
                "recursive CTE {name} declares {} columns but its seed yields {}",
                column_names.len(),
                initial_attrs.len()
            )));
        }

        // The self-reference reads the current queue row through these
        // attributes; the emitter binds them to the queue slot.
        let self_attrs =
            self.fresh_attrs(&column_names, |at| initial_attrs[at].ty);

        self.bind_cte(
            name,
            CteBinding::RecursiveSelf {
                name: name.to_string(),
                attrs: self_attrs.clone(),
            },
        );
        let (recursive, _) = self.build_body(right, outer, &[])?;
        if recursive.attributes().len() != self_attrs.len() {
            return Err(Error::Plan(format!(
                "recursive CTE {name}: the recursive term yields a different column count"
            )));
        }

        let id = self.next_cte_id();
        let queue = self.next_cte_id();
        let output_attrs = self.fresh_attrs(&column_names, |at| initial_attrs[at].ty);
        let columns_out = output_attrs
            .iter()
            .map(|a| (a.name.clone(), a.ty))
            .collect();
        let node = Arc::new(RelNode::RecursiveCte {
            name: name.to_string(),
            cte: id,
            queue,
            initial,
            recursive,
            self_attrs,
            union_all,
            attrs: output_attrs,
        });
        Ok((id, node, columns_out))
    }

}

enum Strategy {
    View,
    Materialized,
}

/// Does |query| reference the table |name| anywhere in a FROM position?
fn references_table(query: &Query, name: &str) -> bool {
    count_references(query, name) > 0
}

/// Count FROM-position references to |name| across the query, including
/// derived tables and subqueries in expressions.
fn count_references(query: &Query, name: &str) -> usize {
    let mut count = 0;
    count_in_set_expr(&query.body, name, &mut count);
    count
}

fn count_in_set_expr(body: &SetExpr, name: &str, count: &mut usize) {
    match body {
        SetExpr::Select(select) => {
            for table in &select.from {
                count_in_factor(&table.relation, name, count);
            }
            if let Some(selection) = &select.selection {
                count_in_expr(selection, name, count);
            }
            for item in &select.projection {
                if let sqlparser::ast::SelectItem::UnnamedExpr(expr)
                | sqlparser::ast::SelectItem::ExprWithAlias { expr, .. } = item
                {
                    count_in_expr(expr, name, count);
                }
            }
        }
        SetExpr::Query(inner) => count_in_set_expr(&inner.body, name, count),
        SetExpr::SetOperation { left, right, .. } => {
            count_in_set_expr(left, name, count);
            count_in_set_expr(right, name, count);
        }
        _ => {}
    }
}

fn count_in_factor(factor: &TableFactor, name: &str, count: &mut usize) {
    match factor {
        TableFactor::Table {
            name: table_name, ..
        } => {
            if table_name.0.len() == 1
                && table_name.0[0].value.eq_ignore_ascii_case(name)
            {
                *count += 1;
            }
        }
        TableFactor::Derived { subquery, .. } => {
            count_in_set_expr(&subquery.body, name, count)
        }
        _ => {}
    }
}

fn count_in_expr(expr: &AstExpr, name: &str, count: &mut usize) {
    match expr {
        AstExpr::Subquery(query) | AstExpr::Exists { subquery: query, .. } => {
            count_in_set_expr(&query.body, name, count)
        }
        AstExpr::InSubquery { subquery, expr, .. } => {
            count_in_set_expr(&subquery.body, name, count);
            count_in_expr(expr, name, count);
        }
        AstExpr::BinaryOp { left, right, .. } => {
            count_in_expr(left, name, count);
            count_in_expr(right, name, count);
        }
        AstExpr::UnaryOp { expr, .. } | AstExpr::Nested(expr) => {
            count_in_expr(expr, name, count)
        }
        _ => {}
    }
}
