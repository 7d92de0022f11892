//! INSERT / UPDATE / DELETE building. Mutations consume a source
//! relation, produce flat rows (OLD then NEW), and surface them to
//! RETURNING projections.

use std::collections::BTreeSet;
use std::sync::Arc;

use sqlparser::ast::{
    Expr as AstExpr, FromTable, SelectItem, Statement, TableFactor, TableWithJoins,
};

use catalog::TableSchema;
use vtab::ConflictPolicy;

use crate::bestindex::{plan_scan, split_conjuncts};
use crate::builder::expr::ExprCx;
use crate::builder::select::empty_or;
use crate::scope::{AliasedScope, RegisteredScope, ScopeRef};
use crate::{
    Attribute, Builder, CompiledCheck, Error, RelNode, Result, ScalarExpr, ScalarTy,
    StatementPlan,
};

impl<'a> Builder<'a> {
    pub(crate) fn build_insert(&mut self, statement: &Statement) -> Result<StatementPlan> {
        let Statement::Insert {
            table_name,
            columns,
            source,
            returning,
            ..
        } = statement
        else {
            return Err(Error::Plan("expected INSERT".to_string()));
        };

        let (schema_name, name) = catalog::ddl::object_name_parts(table_name)?;
        let table = self.resolve_table(schema_name, &name)?;
        if table.read_only || table.is_view {
            return Err(Error::Plan(format!(
                "{} is not writable",
                table.qualified_name()
            )));
        }
        let policy = conflict_policy(self.insert_conflict);

        // The insert source: VALUES or any query.
        let source = source
            .as_deref()
            .ok_or_else(|| Error::Unsupported("INSERT without a source".to_string()))?;
        let (source_node, _) = self.build_query(source, None)?;
        let source_attrs = source_node.attributes();

        // Map the named column subset (or all columns, in order) onto
        // table positions.
        let targets: Vec<usize> = if columns.is_empty() {
            (0..table.columns.len()).collect()
        } else {
            columns
                .iter()
                .map(|ident| {
                    table.column_index(&ident.value).ok_or_else(|| {
                        Error::NoSuchColumn(format!("{}.{}", table.name, ident.value))
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };
        if targets.len() != source_attrs.len() {
            return Err(Error::Plan(format!(
                "INSERT supplies {} values for {} columns",
                source_attrs.len(),
                targets.len()
            )));
        }

        // Widen to full table rows: targeted columns take the source
        // value, everything else its default (or NULL), all coerced
        // through column affinity.
        let mut exprs: Vec<Arc<ScalarExpr>> = Vec::with_capacity(table.columns.len());
        for (at, column) in table.columns.iter().enumerate() {
            let value = match targets.iter().position(|&target| target == at) {
                Some(position) => Arc::new(ScalarExpr::Column(source_attrs[position].clone())),
                None => match &column.default {
                    Some(default) => {
                        let mut cx = ExprCx::new(self, empty_or(None), false);
                        cx.build(default)?
                    }
                    None => Arc::new(ScalarExpr::Literal(values::SqlValue::Null)),
                },
            };
            exprs.push(Arc::new(ScalarExpr::Cast {
                expr: value,
                affinity: column.affinity,
            }));
        }
        let names: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
        let widened_attrs = self.fresh_attrs(&names, |at| ScalarTy {
            affinity: table.columns[at].affinity,
            nullable: true,
        });
        let widened = Arc::new(RelNode::Project {
            input: source_node,
            exprs,
            attrs: widened_attrs,
        });

        let flat_attrs = self.flat_attrs(&table);
        let checks = self.compile_checks(&table, &flat_attrs)?;
        let node = Arc::new(RelNode::Insert {
            table: table.clone(),
            source: widened,
            policy,
            checks,
            attrs: flat_attrs.clone(),
        });
        self.wrap_returning(node, &table, flat_attrs, returning.as_deref())
    }

    pub(crate) fn build_update(&mut self, statement: &Statement) -> Result<StatementPlan> {
        let Statement::Update {
            table,
            assignments,
            from,
            selection,
            returning,
            ..
        } = statement
        else {
            return Err(Error::Plan("expected UPDATE".to_string()));
        };
        if from.is_some() {
            return Err(Error::Unsupported("UPDATE ... FROM".to_string()));
        }

        let (table, scope, attrs, node) = self.mutation_scan(table, selection.as_ref())?;

        let assignments = assignments
            .iter()
            .map(|assignment| {
                let column_name = assignment
                    .id
                    .last()
                    .map(|ident| ident.value.clone())
                    .unwrap_or_default();
                let column = table.column_index(&column_name).ok_or_else(|| {
                    Error::NoSuchColumn(format!("{}.{column_name}", table.name))
                })?;
                if table.columns[column].generated {
                    return Err(Error::Plan(format!(
                        "cannot assign generated column {column_name}"
                    )));
                }
                let mut cx = ExprCx::new(self, scope.clone(), false);
                let value = cx.build(&assignment.value)?;
                Ok((
                    column,
                    Arc::new(ScalarExpr::Cast {
                        expr: value,
                        affinity: table.columns[column].affinity,
                    }),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let flat_attrs = self.flat_attrs(&table);
        let checks = self.compile_checks(&table, &flat_attrs)?;
        let update = Arc::new(RelNode::Update {
            table: table.clone(),
            source: node,
            assignments,
            checks,
            attrs: flat_attrs.clone(),
        });
        let _ = attrs;
        self.wrap_returning(update, &table, flat_attrs, returning.as_deref())
    }

    pub(crate) fn build_delete(&mut self, statement: &Statement) -> Result<StatementPlan> {
        let Statement::Delete {
            tables,
            from,
            using,
            selection,
            returning,
            ..
        } = statement
        else {
            return Err(Error::Plan("expected DELETE".to_string()));
        };
        if !tables.is_empty() || using.is_some() {
            return Err(Error::Unsupported("multi-table DELETE".to_string()));
        }
        let tables = match from {
            FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
        };
        let [target] = tables.as_slice() else {
            return Err(Error::Unsupported("multi-table DELETE".to_string()));
        };

        let (table, _scope, _attrs, node) = self.mutation_scan(target, selection.as_ref())?;

        let flat_attrs = self.flat_attrs(&table);
        let checks = self.compile_checks(&table, &flat_attrs)?;
        let delete = Arc::new(RelNode::Delete {
            table: table.clone(),
            source: node,
            checks,
            attrs: flat_attrs.clone(),
        });
        self.wrap_returning(delete, &table, flat_attrs, returning.as_deref())
    }

    /// Resolve the mutation target and build its filtered scan. The
    /// table's columns are registered into a dedicated scope so WHERE and
    /// assignments resolve into the scan's attributes.
    fn mutation_scan(
        &mut self,
        target: &TableWithJoins,
        selection: Option<&AstExpr>,
    ) -> Result<(Arc<TableSchema>, ScopeRef, Vec<Attribute>, Arc<RelNode>)> {
        if !target.joins.is_empty() {
            return Err(Error::Unsupported("joins".to_string()));
        }
        let TableFactor::Table { name, alias, .. } = &target.relation else {
            return Err(Error::Unsupported(format!(
                "mutation target {}",
                target.relation
            )));
        };
        let (schema_name, table_name) = catalog::ddl::object_name_parts(name)?;
        let table = self.resolve_table(schema_name, &table_name)?;
        if table.read_only || table.is_view {
            return Err(Error::Plan(format!(
                "{} is not writable",
                table.qualified_name()
            )));
        }
        let module = self.env.modules.get(&table.module_name).ok_or_else(|| {
            Error::Plan(format!(
                "table {} uses unregistered module {}",
                table.qualified_name(),
                table.module_name
            ))
        })?;

        let names: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
        let attrs = self.fresh_attrs(&names, |at| ScalarTy {
            affinity: table.columns[at].affinity,
            nullable: !table.columns[at].not_null,
        });
        let alias_name = alias
            .as_ref()
            .map(|a| a.name.value.clone())
            .unwrap_or_else(|| table_name.clone());
        let scope: ScopeRef = Arc::new(AliasedScope::new(
            alias_name,
            Arc::new(RegisteredScope::new(attrs.clone())),
        ));

        let conjuncts = match selection {
            Some(predicate) => {
                let mut cx = ExprCx::new(self, scope.clone(), false);
                split_conjuncts(&cx.build(predicate)?)
            }
            None => Vec::new(),
        };

        // Mutations read every column (the flat row needs them all).
        let used: BTreeSet<_> = attrs.iter().map(|a| a.id).collect();
        let (node, _) = plan_scan(
            table.clone(),
            module,
            attrs.clone(),
            conjuncts,
            &[],
            &used,
        )?;
        Ok((table, scope, attrs, node))
    }

    fn resolve_table(
        &self,
        schema_name: Option<String>,
        name: &str,
    ) -> Result<Arc<TableSchema>> {
        self.global()
            .resolve_table(schema_name.as_deref(), name)
            .ok_or_else(|| {
                let schema_name =
                    schema_name.unwrap_or_else(|| self.env.defaults.schema_name.clone());
                Error::NoSuchTable(format!("{schema_name}.{name}"))
            })
    }

    /// Compile the table's CHECK constraints against the flat row: the
    /// predicate is bound once to the NEW half and once to the OLD half,
    /// so delete-mask checks can read the vanishing values.
    fn compile_checks(
        &mut self,
        table: &TableSchema,
        flat_attrs: &[Attribute],
    ) -> Result<Vec<CompiledCheck>> {
        let width = table.columns.len();
        let old_scope: ScopeRef = Arc::new(RegisteredScope::new(flat_attrs[..width].to_vec()));
        let new_scope: ScopeRef = Arc::new(RegisteredScope::new(flat_attrs[width..].to_vec()));

        table
            .checks
            .iter()
            .map(|check| {
                let expr_new = ExprCx::new(self, new_scope.clone(), false).build(&check.expr)?;
                let expr_old = ExprCx::new(self, old_scope.clone(), false).build(&check.expr)?;
                Ok(CompiledCheck {
                    name: check.name.clone(),
                    ops: check.ops,
                    deferred: check.deferred,
                    expr_new,
                    expr_old,
                })
            })
            .collect()
    }

    /// The flat-row attributes of a mutation: OLD columns then NEW
    /// columns, in table order.
    fn flat_attrs(&mut self, table: &TableSchema) -> Vec<Attribute> {
        let names: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
        let mut attrs = self.fresh_attrs(&names, |at| ScalarTy {
            affinity: table.columns[at].affinity,
            nullable: true,
        });
        attrs.extend(self.fresh_attrs(&names, |at| ScalarTy {
            affinity: table.columns[at].affinity,
            nullable: true,
        }));
        attrs
    }

    /// Wrap a mutation in its RETURNING projection, or finish it as a
    /// plain DML plan. RETURNING resolves names against the NEW half of
    /// the flat row.
    fn wrap_returning(
        &mut self,
        node: Arc<RelNode>,
        table: &TableSchema,
        flat_attrs: Vec<Attribute>,
        returning: Option<&[SelectItem]>,
    ) -> Result<StatementPlan> {
        let Some(items) = returning else {
            return Ok(StatementPlan::Dml {
                root: node,
                returning: false,
                column_names: Vec::new(),
            });
        };

        let width = table.columns.len();
        let new_attrs: Vec<Attribute> = flat_attrs[width..].to_vec();
        let scope: ScopeRef = Arc::new(AliasedScope::new(
            table.name.clone(),
            Arc::new(RegisteredScope::new(new_attrs.clone())),
        ));

        let mut exprs: Vec<(Arc<ScalarExpr>, String)> = Vec::new();
        for item in items {
            match item {
                SelectItem::Wildcard(_) => {
                    for attribute in &new_attrs {
                        exprs.push((
                            Arc::new(ScalarExpr::Column(attribute.clone())),
                            attribute.name.clone(),
                        ));
                    }
                }
                SelectItem::UnnamedExpr(expr) => {
                    let mut cx = ExprCx::new(self, scope.clone(), false);
                    let built = cx.build(expr)?;
                    let name = match expr {
                        AstExpr::Identifier(ident) => ident.value.clone(),
                        other => other.to_string(),
                    };
                    exprs.push((built, name));
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    let mut cx = ExprCx::new(self, scope.clone(), false);
                    exprs.push((cx.build(expr)?, alias.value.clone()));
                }
                other => {
                    return Err(Error::Unsupported(format!("RETURNING item {other}")))
                }
            }
        }

        let column_names: Vec<String> = exprs.iter().map(|(_, name)| name.clone()).collect();
        let attrs = self.fresh_attrs(&column_names, |at| exprs[at].0.ty());
        let root = Arc::new(RelNode::Project {
            input: node,
            exprs: exprs.into_iter().map(|(expr, _)| expr).collect(),
            attrs,
        });
        Ok(StatementPlan::Dml {
            root,
            returning: true,
            column_names,
        })
    }
}

fn conflict_policy(clause: Option<crate::InsertConflict>) -> ConflictPolicy {
    match clause {
        None => ConflictPolicy::Abort,
        Some(crate::InsertConflict::Abort) => ConflictPolicy::Abort,
        Some(crate::InsertConflict::Ignore) => ConflictPolicy::Ignore,
        Some(crate::InsertConflict::Replace) => ConflictPolicy::Replace,
        Some(crate::InsertConflict::Fail) => ConflictPolicy::Fail,
        Some(crate::InsertConflict::Rollback) => ConflictPolicy::Rollback,
    }
}
