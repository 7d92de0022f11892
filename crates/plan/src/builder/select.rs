//! SELECT building: FROM sources, scope assembly, WHERE, projection with
//! aggregate extraction, ORDER BY resolution, set operations, and the
//! hand-off to `best_index` access planning.

use std::collections::BTreeSet;
use std::sync::Arc;

use sqlparser::ast::{
    Distinct as AstDistinct, Expr as AstExpr, GroupByExpr, OrderByExpr, Query, Select,
    SelectItem, SetExpr, SetOperator, SetQuantifier, TableFactor, Value,
};

use crate::bestindex::{plan_scan, split_conjuncts};
use crate::builder::cte::CteBinding;
use crate::builder::expr::ExprCx;
use crate::pushdown::collect_attrs;
use crate::scope::{AliasedScope, MultiScope, RegisteredScope, ScopeRef};
use crate::{
    Attribute, AttributeId, Builder, Error, RelNode, Result, ScalarExpr, ScalarTy, SortTerm,
    StatementPlan,
};

/// A FROM source before final assembly: either an already-built node, or
/// a deferred table scan awaiting access planning.
enum Source {
    Node(Arc<RelNode>),
    DeferredScan {
        table: Arc<catalog::TableSchema>,
        module: Arc<dyn vtab::Module>,
    },
    /// SELECT without FROM: one empty row.
    Unit,
}

struct FromClause {
    source: Source,
    attrs: Vec<Attribute>,
    scope: ScopeRef,
}

impl<'a> Builder<'a> {
    pub(crate) fn build_query_statement(&mut self, query: &Query) -> Result<StatementPlan> {
        let (root, column_names) = self.build_query(query, None)?;
        Ok(StatementPlan::Query { root, column_names })
    }

    /// Build a full query: WITH frame, body, ORDER BY, LIMIT/OFFSET, and
    /// the materialization wrappers for its CTEs.
    pub(crate) fn build_query(
        &mut self,
        query: &Query,
        outer: Option<ScopeRef>,
    ) -> Result<(Arc<RelNode>, Vec<String>)> {
        let Query {
            with,
            body,
            order_by,
            limit,
            offset,
            ..
        } = query;

        let materialized = self.push_cte_frame(with.as_ref(), body, outer.clone())?;

        let result = self.build_body(body, outer.clone(), order_by);
        let (mut node, names) = match result {
            Ok(built) => built,
            Err(error) => {
                self.cte_frames.pop();
                return Err(error);
            }
        };

        if limit.is_some() || offset.is_some() {
            let mut cx = ExprCx::new(self, empty_or(outer.clone()), false);
            let limit = limit.as_ref().map(|e| cx.build(e)).transpose()?;
            let offset = offset
                .as_ref()
                .map(|offset| cx.build(&offset.value))
                .transpose()?;
            node = Arc::new(RelNode::LimitOffset {
                input: node,
                limit,
                offset,
            });
        }

        // Innermost CTE materializes closest to the body.
        for (cte, name, plan) in materialized.into_iter().rev() {
            node = Arc::new(RelNode::Materialize {
                cte,
                name,
                plan,
                body: node,
            });
        }
        self.cte_frames.pop();
        Ok((node, names))
    }

    pub(crate) fn build_body(
        &mut self,
        body: &SetExpr,
        outer: Option<ScopeRef>,
        order_by: &[OrderByExpr],
    ) -> Result<(Arc<RelNode>, Vec<String>)> {
        match body {
            SetExpr::Select(select) => self.build_select(select, outer, order_by),
            SetExpr::Query(inner) => self.build_query(inner, outer),
            SetExpr::Values(values) => {
                let (node, names) = self.build_values(values, outer.clone())?;
                let node = self.sort_by_output(node, names.clone(), order_by, outer)?;
                Ok((node, names))
            }
            SetExpr::SetOperation {
                op: SetOperator::Union,
                set_quantifier,
                left,
                right,
            } => {
                let union_all = matches!(set_quantifier, SetQuantifier::All);
                let (left, names) = self.build_body(left, outer.clone(), &[])?;
                let (right, _) = self.build_body(right, outer.clone(), &[])?;
                if left.attributes().len() != right.attributes().len() {
                    return Err(Error::Plan(
                        "UNION arms yield different column counts".to_string(),
                    ));
                }
                let attrs = left.attributes();
                let mut node: Arc<RelNode> = Arc::new(RelNode::UnionAll { left, right, attrs });
                if !union_all {
                    node = Arc::new(RelNode::Distinct { input: node });
                }
                let node = self.sort_by_output(node, names.clone(), order_by, outer)?;
                Ok((node, names))
            }
            SetExpr::SetOperation { op, .. } => {
                Err(Error::Unsupported(format!("set operation {op}")))
            }
            other => Err(Error::Unsupported(format!("query body {other}"))),
        }
    }

    pub(crate) fn build_values(
        &mut self,
        values: &sqlparser::ast::Values,
        outer: Option<ScopeRef>,
    ) -> Result<(Arc<RelNode>, Vec<String>)> {
        let width = values.rows.first().map(Vec::len).unwrap_or(0);
        let mut rows = Vec::with_capacity(values.rows.len());
        for row in &values.rows {
            if row.len() != width {
                return Err(Error::Plan("VALUES rows differ in width".to_string()));
            }
            let mut cx = ExprCx::new(self, empty_or(outer.clone()), false);
            rows.push(
                row.iter()
                    .map(|expr| cx.build(expr))
                    .collect::<Result<Vec<_>>>()?,
            );
        }
        let names: Vec<String> = (1..=width).map(|at| format!("column{at}")).collect();
        let attrs = self.fresh_attrs(&names, |at| {
            rows.first()
                .map(|row| row[at].ty())
                .unwrap_or_default()
        });
        Ok((
            Arc::new(RelNode::Values { rows, attrs }),
            names,
        ))
    }

    /// Sort a set-operation or VALUES body by its output columns.
    fn sort_by_output(
        &mut self,
        node: Arc<RelNode>,
        names: Vec<String>,
        order_by: &[OrderByExpr],
        _outer: Option<ScopeRef>,
    ) -> Result<Arc<RelNode>> {
        if order_by.is_empty() {
            return Ok(node);
        }
        let attrs = node.attributes();
        let mut terms = Vec::with_capacity(order_by.len());
        for term in order_by {
            let expr = match &term.expr {
                AstExpr::Value(Value::Number(text, _)) => {
                    let ordinal: usize = text
                        .parse()
                        .map_err(|_| Error::Plan(format!("bad ORDER BY ordinal {text}")))?;
                    let attribute = attrs.get(ordinal.saturating_sub(1)).ok_or_else(|| {
                        Error::Plan(format!("ORDER BY ordinal {ordinal} out of range"))
                    })?;
                    Arc::new(ScalarExpr::Column(attribute.clone()))
                }
                AstExpr::Identifier(ident) => {
                    let at = names
                        .iter()
                        .position(|name| name.eq_ignore_ascii_case(&ident.value))
                        .ok_or_else(|| Error::NoSuchColumn(ident.value.clone()))?;
                    Arc::new(ScalarExpr::Column(attrs[at].clone()))
                }
                other => return Err(Error::Unsupported(format!("ORDER BY term {other}"))),
            };
            terms.push(SortTerm {
                expr,
                descending: term.asc == Some(false),
                collation: None,
            });
        }
        Ok(Arc::new(RelNode::Sort { input: node, terms }))
    }

    fn build_select(
        &mut self,
        select: &Select,
        outer: Option<ScopeRef>,
        order_by: &[OrderByExpr],
    ) -> Result<(Arc<RelNode>, Vec<String>)> {
        let Select {
            distinct,
            projection,
            from,
            selection,
            group_by,
            having,
            ..
        } = select;
        if matches!(distinct, Some(AstDistinct::On(_))) {
            return Err(Error::Unsupported("DISTINCT ON".to_string()));
        }

        // (1) FROM: a single source; joins are an open extension.
        let from_clause = match from.as_slice() {
            [] => FromClause {
                source: Source::Unit,
                attrs: Vec::new(),
                scope: Arc::new(RegisteredScope::default()),
            },
            [table] if table.joins.is_empty() => self.build_table_factor(&table.relation, outer.clone())?,
            _ => return Err(Error::Unsupported("joins".to_string())),
        };

        let mut chain = MultiScope::default();
        chain.push(from_clause.scope.clone());
        if let Some(outer) = outer.clone() {
            chain.push(outer);
        }
        let chain: ScopeRef = Arc::new(chain);

        // (2) WHERE, split into conjuncts for access planning.
        let conjuncts = match selection {
            Some(predicate) => {
                let mut cx = ExprCx::new(self, chain.clone(), false);
                let built = cx.build(predicate)?;
                split_conjuncts(&built)
            }
            None => Vec::new(),
        };

        // (3) the SELECT list, with * and table.* expansion.
        let mut items: Vec<(Arc<ScalarExpr>, String)> = Vec::new();
        for item in projection {
            match item {
                SelectItem::Wildcard(_) => {
                    if from_clause.attrs.is_empty() {
                        return Err(Error::Plan("* requires a FROM source".to_string()));
                    }
                    for attribute in &from_clause.attrs {
                        items.push((
                            Arc::new(ScalarExpr::Column(attribute.clone())),
                            attribute.name.clone(),
                        ));
                    }
                }
                SelectItem::QualifiedWildcard(qualifier, _) => {
                    // A lone source: verify the qualifier resolves into it.
                    let qualifier_name = qualifier
                        .0
                        .last()
                        .map(|ident| ident.value.clone())
                        .unwrap_or_default();
                    let probe = from_clause
                        .attrs
                        .first()
                        .map(|attribute| {
                            from_clause
                                .scope
                                .resolve(Some(&qualifier_name), &attribute.name)
                        })
                        .unwrap_or(crate::Resolution::NotFound);
                    if matches!(probe, crate::Resolution::NotFound) {
                        return Err(Error::NoSuchTable(qualifier_name));
                    }
                    for attribute in &from_clause.attrs {
                        items.push((
                            Arc::new(ScalarExpr::Column(attribute.clone())),
                            attribute.name.clone(),
                        ));
                    }
                }
                SelectItem::UnnamedExpr(expr) => {
                    let mut cx = ExprCx::new(self, chain.clone(), true);
                    let built = cx.build(expr)?;
                    let name = match expr {
                        AstExpr::Identifier(ident) => ident.value.clone(),
                        AstExpr::CompoundIdentifier(parts) => parts
                            .last()
                            .map(|ident| ident.value.clone())
                            .unwrap_or_else(|| built.output_name()),
                        other => other.to_string(),
                    };
                    items.push((built, name));
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    let mut cx = ExprCx::new(self, chain.clone(), true);
                    items.push((cx.build(expr)?, alias.value.clone()));
                }
            }
        }

        // (4) GROUP BY and HAVING.
        let group_exprs = match group_by {
            GroupByExpr::Expressions(exprs) => {
                let mut cx = ExprCx::new(self, chain.clone(), false);
                exprs
                    .iter()
                    .map(|expr| cx.build(expr))
                    .collect::<Result<Vec<_>>>()?
            }
            GroupByExpr::All => {
                return Err(Error::Unsupported("GROUP BY ALL".to_string()))
            }
        };
        let having_expr = having
            .as_ref()
            .map(|expr| ExprCx::new(self, chain.clone(), true).build(expr))
            .transpose()?;

        let is_aggregate = !group_exprs.is_empty()
            || items.iter().any(|(expr, _)| expr.contains_aggregate())
            || having_expr
                .as_ref()
                .map(|expr| expr.contains_aggregate())
                .unwrap_or(false);
        if !is_aggregate {
            if let Some(having) = &having_expr {
                let _ = having;
                return Err(Error::Plan(
                    "HAVING requires aggregation or GROUP BY".to_string(),
                ));
            }
        }

        // (5) ORDER BY terms, resolved against aliases, ordinals, or the
        // source scope.
        let mut sort_terms = Vec::with_capacity(order_by.len());
        for term in order_by {
            let expr = self.order_term_expr(term, &items, &chain)?;
            let (expr, collation) = match &*expr {
                ScalarExpr::Collate { expr, collation } => (expr.clone(), Some(*collation)),
                _ => (expr, None),
            };
            sort_terms.push(SortTerm {
                expr,
                descending: term.asc == Some(false),
                collation,
            });
        }

        // (6) assemble. Access planning sees the ORDER BY only when the
        // sort would sit directly over the scan.
        let mut used: BTreeSet<AttributeId> = BTreeSet::new();
        for (expr, _) in &items {
            used.extend(collect_attrs(expr));
        }
        for conjunct in &conjuncts {
            used.extend(collect_attrs(conjunct));
        }
        for term in &sort_terms {
            used.extend(collect_attrs(&term.expr));
        }
        for expr in &group_exprs {
            used.extend(collect_attrs(expr));
        }

        let sort_at_scan = !is_aggregate && !matches!(distinct, Some(_));
        let (mut node, order_consumed) = match from_clause.source {
            Source::DeferredScan { table, module } => plan_scan(
                table,
                module,
                from_clause.attrs.clone(),
                conjuncts,
                if sort_at_scan { &sort_terms } else { &[] },
                &used,
            )?,
            Source::Node(node) => (wrap_filter(node, conjuncts), false),
            Source::Unit => {
                let unit = Arc::new(RelNode::Values {
                    rows: vec![Vec::new()],
                    attrs: Vec::new(),
                });
                (wrap_filter(unit, conjuncts), false)
            }
        };

        let mut items = items;
        let mut sort_terms = sort_terms;
        let mut having_expr = having_expr;
        if is_aggregate {
            node = self.build_aggregate(
                node,
                group_exprs,
                &mut items,
                &mut sort_terms,
                &mut having_expr,
            )?;
            if let Some(having) = having_expr {
                node = Arc::new(RelNode::Filter {
                    input: node,
                    predicate: having,
                });
            }
        }

        // Sort below the projection: every term references pre-projection
        // attributes by construction.
        if !sort_terms.is_empty() && !order_consumed {
            node = Arc::new(RelNode::Sort {
                input: node,
                terms: sort_terms,
            });
        }

        let names: Vec<String> = items.iter().map(|(_, name)| name.clone()).collect();
        let attrs = self.fresh_attrs(&names, |at| items[at].0.ty());
        node = Arc::new(RelNode::Project {
            input: node,
            exprs: items.into_iter().map(|(expr, _)| expr).collect(),
            attrs,
        });

        if matches!(distinct, Some(AstDistinct::Distinct)) {
            node = Arc::new(RelNode::Distinct { input: node });
        }
        Ok((node, names))
    }

    fn order_term_expr(
        &mut self,
        term: &OrderByExpr,
        items: &[(Arc<ScalarExpr>, String)],
        chain: &ScopeRef,
    ) -> Result<Arc<ScalarExpr>> {
        match &term.expr {
            AstExpr::Value(Value::Number(text, _)) => {
                let ordinal: usize = text
                    .parse()
                    .map_err(|_| Error::Plan(format!("bad ORDER BY ordinal {text}")))?;
                items
                    .get(ordinal.saturating_sub(1))
                    .map(|(expr, _)| expr.clone())
                    .ok_or_else(|| Error::Plan(format!("ORDER BY ordinal {ordinal} out of range")))
            }
            AstExpr::Identifier(ident) => {
                // A select-list alias wins over a source column.
                if let Some((expr, _)) = items
                    .iter()
                    .find(|(_, name)| name.eq_ignore_ascii_case(&ident.value))
                {
                    return Ok(expr.clone());
                }
                ExprCx::new(self, chain.clone(), true).build(&term.expr)
            }
            _ => ExprCx::new(self, chain.clone(), true).build(&term.expr),
        }
    }

    /// Turn a projection with inline aggregate calls into an Aggregate
    /// node plus rewritten projections above it.
    fn build_aggregate(
        &mut self,
        input: Arc<RelNode>,
        group_exprs: Vec<Arc<ScalarExpr>>,
        items: &mut Vec<(Arc<ScalarExpr>, String)>,
        sort_terms: &mut [SortTerm],
        having: &mut Option<Arc<ScalarExpr>>,
    ) -> Result<Arc<RelNode>> {
        // Collect every aggregate call across projections, HAVING and
        // ORDER BY, keyed by rendering for sharing.
        let mut calls: Vec<Arc<ScalarExpr>> = Vec::new();
        let mut collect = |expr: &Arc<ScalarExpr>| {
            expr.visit(&mut |node| {
                if matches!(node, ScalarExpr::Aggregate(_))
                    && !calls.iter().any(|c| c.render() == node.render())
                {
                    calls.push(Arc::new(node.clone()));
                }
            });
        };
        for (expr, _) in items.iter() {
            collect(expr);
        }
        if let Some(expr) = having.as_ref() {
            collect(expr);
        }
        for term in sort_terms.iter() {
            collect(&term.expr);
        }

        // The aggregate's output: group columns first, then one column
        // per aggregate call.
        let group_attrs = group_exprs
            .iter()
            .enumerate()
            .map(|(at, expr)| Attribute {
                id: self.env.attrs.next(),
                name: format!("group{}", at + 1),
                ty: expr.ty(),
            })
            .collect::<Vec<_>>();
        let call_attrs = calls
            .iter()
            .map(|call| Attribute {
                id: self.env.attrs.next(),
                name: call.render(),
                ty: call.ty(),
            })
            .collect::<Vec<_>>();

        let mut attrs = group_attrs.clone();
        attrs.extend(call_attrs.clone());
        let node = Arc::new(RelNode::Aggregate {
            input,
            group_by: group_exprs.clone(),
            aggregates: calls.clone(),
            attrs,
        });

        // Rewrite consumers: aggregate calls and group expressions become
        // references to the aggregate's output columns; anything else
        // touching input columns is an error.
        let rewrite = |expr: &Arc<ScalarExpr>| -> Result<Arc<ScalarExpr>> {
            let rewritten = rewrite_aggregate_refs(expr, &group_exprs, &group_attrs, &calls, &call_attrs);
            let visible: BTreeSet<AttributeId> = group_attrs
                .iter()
                .chain(&call_attrs)
                .map(|a| a.id)
                .collect();
            if !collect_attrs(&rewritten).is_subset(&visible) {
                return Err(Error::Plan(format!(
                    "expression {} must appear in GROUP BY or an aggregate",
                    expr.render()
                )));
            }
            Ok(rewritten)
        };
        for (expr, _) in items.iter_mut() {
            *expr = rewrite(expr)?;
        }
        if let Some(expr) = having.as_mut() {
            *expr = rewrite(expr)?;
        }
        for term in sort_terms.iter_mut() {
            term.expr = rewrite(&term.expr)?;
        }
        Ok(node)
    }

    pub(crate) fn fresh_attrs(
        &mut self,
        names: &[String],
        ty_of: impl Fn(usize) -> ScalarTy,
    ) -> Vec<Attribute> {
        names
            .iter()
            .enumerate()
            .map(|(at, name)| Attribute {
                id: self.env.attrs.next(),
                name: name.clone(),
                ty: ty_of(at),
            })
            .collect()
    }

    /// Build one FROM source.
    fn build_table_factor(
        &mut self,
        relation: &TableFactor,
        outer: Option<ScopeRef>,
    ) -> Result<FromClause> {
        match relation {
            TableFactor::Table {
                name, alias, args, ..
            } => {
                let (schema_name, table_name) = catalog::ddl::object_name_parts(name)?;
                let alias_name = alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .unwrap_or_else(|| table_name.clone());

                if let Some(args) = args {
                    // Table-valued function call.
                    let func = self
                        .global()
                        .table_function(&table_name)
                        .ok_or_else(|| Error::NoSuchFunction(table_name.clone()))?;
                    let mut built_args = Vec::new();
                    for arg in args {
                        match arg {
                            sqlparser::ast::FunctionArg::Unnamed(
                                sqlparser::ast::FunctionArgExpr::Expr(expr),
                            ) => {
                                let mut cx =
                                    ExprCx::new(self, empty_or(outer.clone()), false);
                                built_args.push(cx.build(expr)?);
                            }
                            other => {
                                return Err(Error::Unsupported(format!(
                                    "table function argument {other}"
                                )))
                            }
                        }
                    }
                    let names: Vec<String> =
                        func.columns.iter().map(|(name, _)| name.clone()).collect();
                    let attrs = self.fresh_attrs(&names, |at| ScalarTy::nullable(func.columns[at].1));
                    let scope = aliased(&alias_name, attrs.clone());
                    return Ok(FromClause {
                        source: Source::Node(Arc::new(RelNode::TableFunctionCall {
                            func,
                            args: built_args,
                            attrs: attrs.clone(),
                        })),
                        attrs,
                        scope,
                    });
                }

                // A CTE binding shadows catalog tables.
                if schema_name.is_none() {
                    if let Some(binding) = self.cte_binding(&table_name).cloned() {
                        return self.build_cte_reference(binding, &alias_name, outer);
                    }
                }

                let table = self
                    .global()
                    .resolve_table(schema_name.as_deref(), &table_name)
                    .ok_or_else(|| {
                        let schema_name = schema_name
                            .unwrap_or_else(|| self.env.defaults.schema_name.clone());
                        Error::NoSuchTable(format!("{schema_name}.{table_name}"))
                    })?;

                if table.is_view {
                    let query = table.view_query.clone().ok_or_else(|| {
                        Error::Plan(format!("view {table_name} has no stored query"))
                    })?;
                    let (node, names) = self.build_query(&query, outer)?;
                    let (node, attrs) = self.rename_columns(node, &names);
                    let scope = aliased(&alias_name, attrs.clone());
                    return Ok(FromClause {
                        source: Source::Node(node),
                        attrs,
                        scope,
                    });
                }

                let module = self
                    .env
                    .modules
                    .get(&table.module_name)
                    .ok_or_else(|| {
                        Error::Plan(format!(
                            "table {} uses unregistered module {}",
                            table.qualified_name(),
                            table.module_name
                        ))
                    })?;
                let names: Vec<String> =
                    table.columns.iter().map(|c| c.name.clone()).collect();
                let attrs = self.fresh_attrs(&names, |at| ScalarTy {
                    affinity: table.columns[at].affinity,
                    nullable: !table.columns[at].not_null,
                });
                let scope = aliased(&alias_name, attrs.clone());
                Ok(FromClause {
                    source: Source::DeferredScan { table, module },
                    attrs,
                    scope,
                })
            }
            TableFactor::Derived {
                subquery, alias, ..
            } => {
                let (node, names) = self.build_query(subquery, outer)?;
                let (node, attrs) = self.rename_columns(node, &names);
                let alias_name = alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .unwrap_or_else(|| "subquery".to_string());
                let scope = aliased(&alias_name, attrs.clone());
                Ok(FromClause {
                    source: Source::Node(node),
                    attrs,
                    scope,
                })
            }
            other => Err(Error::Unsupported(format!("FROM source {other}"))),
        }
    }

    /// Build a reference to a CTE binding.
    fn build_cte_reference(
        &mut self,
        binding: CteBinding,
        alias: &str,
        outer: Option<ScopeRef>,
    ) -> Result<FromClause> {
        match binding {
            CteBinding::View { query, columns } => {
                let (node, names) = self.build_query(&query, outer)?;
                let names = if columns.is_empty() { names } else { columns };
                let (node, attrs) = self.rename_columns(node, &names);
                let scope = aliased(alias, attrs.clone());
                Ok(FromClause {
                    source: Source::Node(node),
                    attrs,
                    scope,
                })
            }
            CteBinding::Materialized { cte, name, columns } => {
                // Every reference site gets fresh attributes; they all
                // read the same ephemeral table.
                let names: Vec<String> = columns.iter().map(|(name, _)| name.clone()).collect();
                let attrs = self.fresh_attrs(&names, |at| columns[at].1);
                let scope = aliased(alias, attrs.clone());
                Ok(FromClause {
                    source: Source::Node(Arc::new(RelNode::CteScan {
                        cte,
                        name,
                        attrs: attrs.clone(),
                    })),
                    attrs,
                    scope,
                })
            }
            CteBinding::RecursiveSelf { name, attrs } => {
                let scope = aliased(alias, attrs.clone());
                Ok(FromClause {
                    source: Source::Node(Arc::new(RelNode::SelfRow {
                        name,
                        attrs: attrs.clone(),
                    })),
                    attrs,
                    scope,
                })
            }
        }
    }

    /// Wrap |node| in a Project that renames its columns.
    pub(crate) fn rename_columns(
        &mut self,
        node: Arc<RelNode>,
        names: &[String],
    ) -> (Arc<RelNode>, Vec<Attribute>) {
        let input_attrs = node.attributes();
        let attrs = self.fresh_attrs(&names.to_vec(), |at| {
            input_attrs
                .get(at)
                .map(|a| a.ty)
                .unwrap_or_default()
        });
        let exprs = input_attrs
            .iter()
            .map(|attribute| Arc::new(ScalarExpr::Column(attribute.clone())))
            .collect();
        (
            Arc::new(RelNode::Project {
                input: node,
                exprs,
                attrs: attrs.clone(),
            }),
            attrs,
        )
    }
}

fn wrap_filter(node: Arc<RelNode>, conjuncts: Vec<Arc<ScalarExpr>>) -> Arc<RelNode> {
    let predicate = conjuncts.into_iter().reduce(|left, right| {
        Arc::new(ScalarExpr::Binary {
            op: crate::BinOp::And,
            left,
            right,
        })
    });
    match predicate {
        Some(predicate) => Arc::new(RelNode::Filter {
            input: node,
            predicate,
        }),
        None => node,
    }
}

fn aliased(alias: &str, attrs: Vec<Attribute>) -> ScopeRef {
    Arc::new(AliasedScope::new(
        alias,
        Arc::new(RegisteredScope::new(attrs)),
    ))
}

pub(crate) fn empty_or(outer: Option<ScopeRef>) -> ScopeRef {
    outer.unwrap_or_else(|| Arc::new(RegisteredScope::default()))
}

/// Replace aggregate calls and group expressions with references to the
/// aggregate's output columns, by structural (rendered) equality.
fn rewrite_aggregate_refs(
    expr: &Arc<ScalarExpr>,
    group_exprs: &[Arc<ScalarExpr>],
    group_attrs: &[Attribute],
    calls: &[Arc<ScalarExpr>],
    call_attrs: &[Attribute],
) -> Arc<ScalarExpr> {
    let rendered = expr.render();
    for (at, group) in group_exprs.iter().enumerate() {
        if group.render() == rendered {
            return Arc::new(ScalarExpr::Column(group_attrs[at].clone()));
        }
    }
    for (at, call) in calls.iter().enumerate() {
        if call.render() == rendered {
            return Arc::new(ScalarExpr::Column(call_attrs[at].clone()));
        }
    }

    let recurse =
        |inner: &Arc<ScalarExpr>| rewrite_aggregate_refs(inner, group_exprs, group_attrs, calls, call_attrs);
    let rewritten = match &**expr {
        ScalarExpr::Binary { op, left, right } => ScalarExpr::Binary {
            op: *op,
            left: recurse(left),
            right: recurse(right),
        },
        ScalarExpr::Unary { op, expr } => ScalarExpr::Unary {
            op: *op,
            expr: recurse(expr),
        },
        ScalarExpr::Like {
            negated,
            expr,
            pattern,
        } => ScalarExpr::Like {
            negated: *negated,
            expr: recurse(expr),
            pattern: recurse(pattern),
        },
        ScalarExpr::InList {
            expr,
            list,
            negated,
        } => ScalarExpr::InList {
            expr: recurse(expr),
            list: list.iter().map(recurse).collect(),
            negated: *negated,
        },
        ScalarExpr::IsNull { expr, negated } => ScalarExpr::IsNull {
            expr: recurse(expr),
            negated: *negated,
        },
        ScalarExpr::Case {
            operand,
            branches,
            otherwise,
        } => ScalarExpr::Case {
            operand: operand.as_ref().map(&recurse),
            branches: branches
                .iter()
                .map(|(when, then)| (recurse(when), recurse(then)))
                .collect(),
            otherwise: otherwise.as_ref().map(&recurse),
        },
        ScalarExpr::Cast { expr, affinity } => ScalarExpr::Cast {
            expr: recurse(expr),
            affinity: *affinity,
        },
        ScalarExpr::Collate { expr, collation } => ScalarExpr::Collate {
            expr: recurse(expr),
            collation: *collation,
        },
        ScalarExpr::Call { func, args } => ScalarExpr::Call {
            func: func.clone(),
            args: args.iter().map(recurse).collect(),
        },
        other => other.clone(),
    };
    Arc::new(rewritten)
}
