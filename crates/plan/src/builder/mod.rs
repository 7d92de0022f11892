//! The statement builder: one [`Builder`] per prepared statement walks
//! the parsed AST and produces a [`StatementPlan`], allocating attribute
//! ids as it goes and collecting the statement's parameters in order of
//! first appearance.

use std::collections::HashMap;
use std::sync::Arc;

use sqlparser::ast::{ObjectType, Statement};

use catalog::{Catalog, ModuleClause, SchemaDefaults};
use vtab::ModuleRegistry;

use crate::{
    AttributeGenerator, CteId, Error, FunctionRegistry, ParamKey, ParsedStatement, Result,
    StatementPlan,
};

mod cte;
mod dml;
mod expr;
mod select;

pub(crate) use cte::CteBinding;

/// Everything the builder borrows from its database.
pub struct BuilderEnv<'a> {
    pub catalog: &'a Catalog,
    pub defaults: &'a SchemaDefaults,
    pub modules: &'a ModuleRegistry,
    pub functions: &'a FunctionRegistry,
    pub attrs: &'a AttributeGenerator,
}

/// What a statement compiles to: its plan plus the parameters it binds,
/// in first-appearance order.
#[derive(Debug)]
pub struct BuildOutput {
    pub plan: StatementPlan,
    pub params: Vec<ParamKey>,
}

pub struct Builder<'a> {
    pub(crate) env: BuilderEnv<'a>,
    pub(crate) params: Vec<ParamKey>,
    pub(crate) next_positional: u32,
    pub(crate) cte_frames: Vec<HashMap<String, CteBinding>>,
    pub(crate) next_cte: u32,
    pub(crate) insert_conflict: Option<crate::InsertConflict>,
}

impl<'a> Builder<'a> {
    pub fn new(env: BuilderEnv<'a>) -> Self {
        Builder {
            env,
            params: Vec::new(),
            next_positional: 0,
            cte_frames: Vec::new(),
            next_cte: 0,
            insert_conflict: None,
        }
    }

    /// Compile one parsed statement. Transaction control never reaches
    /// the builder; the statement layer handles it directly.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn build(mut self, parsed: &ParsedStatement) -> Result<BuildOutput> {
        let plan = match parsed {
            ParsedStatement::Txn(txn) => {
                return Err(Error::Plan(format!(
                    "transaction control {txn:?} is handled by the statement layer"
                )))
            }
            ParsedStatement::Sql {
                statement,
                module,
                insert_conflict,
            } => {
                self.insert_conflict = *insert_conflict;
                self.build_statement(statement, module.as_ref())?
            }
        };
        Ok(BuildOutput {
            plan,
            params: self.params,
        })
    }

    fn build_statement(
        &mut self,
        statement: &Statement,
        module: Option<&ModuleClause>,
    ) -> Result<StatementPlan> {
        match statement {
            Statement::Query(query) => self.build_query_statement(query),
            Statement::Insert { .. } => self.build_insert(statement),
            Statement::Update { .. } => self.build_update(statement),
            Statement::Delete { .. } => self.build_delete(statement),
            Statement::CreateTable { .. } => {
                let lowered =
                    catalog::ddl::table_from_create(statement, module, self.env.defaults)?;
                Ok(StatementPlan::CreateTable {
                    schema: Arc::new(lowered.schema),
                    if_not_exists: lowered.if_not_exists,
                })
            }
            Statement::CreateIndex { .. } => {
                let (schema_name, table_name, _) = catalog::ddl::create_index_target(statement)?;
                let schema_name =
                    schema_name.unwrap_or_else(|| self.env.defaults.schema_name.clone());
                let table = self
                    .global()
                    .resolve_table(Some(&schema_name), &table_name)
                    .ok_or_else(|| Error::NoSuchTable(format!("{schema_name}.{table_name}")))?;
                let index = catalog::ddl::index_from_create(statement, &table)?;
                Ok(StatementPlan::CreateIndex { table, index })
            }
            Statement::CreateView { .. } => {
                let schema = catalog::ddl::view_from_create(statement, self.env.defaults)?;
                Ok(StatementPlan::CreateView {
                    schema: Arc::new(schema),
                })
            }
            Statement::Drop {
                object_type,
                if_exists,
                names,
                ..
            } => {
                let name = names
                    .first()
                    .ok_or_else(|| Error::Plan("DROP without a target".to_string()))?;
                let (schema_name, object_name) = catalog::ddl::object_name_parts(name)?;
                let schema_name =
                    schema_name.unwrap_or_else(|| self.env.defaults.schema_name.clone());
                match object_type {
                    ObjectType::Table => Ok(StatementPlan::DropTable {
                        schema_name,
                        name: object_name,
                        if_exists: *if_exists,
                    }),
                    ObjectType::View => Ok(StatementPlan::DropView {
                        schema_name,
                        name: object_name,
                        if_exists: *if_exists,
                    }),
                    ObjectType::Index => Ok(StatementPlan::DropIndex {
                        name: object_name,
                        if_exists: *if_exists,
                    }),
                    other => Err(Error::Unsupported(format!("DROP {other}"))),
                }
            }
            other => Err(Error::Unsupported(format!(
                "statement kind: {}",
                statement_kind(other)
            ))),
        }
    }

    /// Register one parameter occurrence and return its key.
    pub(crate) fn register_param(&mut self, text: &str) -> Result<ParamKey> {
        let key = if let Some(name) = text
            .strip_prefix(':')
            .or_else(|| text.strip_prefix('$'))
            .or_else(|| text.strip_prefix('@'))
        {
            if let Ok(position) = name.parse::<u32>() {
                ParamKey::Positional(position)
            } else {
                ParamKey::Named(name.to_string())
            }
        } else if let Some(rest) = text.strip_prefix('?') {
            if rest.is_empty() {
                self.next_positional += 1;
                ParamKey::Positional(self.next_positional)
            } else {
                let position: u32 = rest
                    .parse()
                    .map_err(|_| Error::Parse(format!("bad parameter token {text:?}")))?;
                self.next_positional = self.next_positional.max(position);
                ParamKey::Positional(position)
            }
        } else {
            return Err(Error::Parse(format!("bad parameter token {text:?}")));
        };
        if !self.params.contains(&key) {
            self.params.push(key.clone());
        }
        Ok(key)
    }

    pub(crate) fn next_cte_id(&mut self) -> CteId {
        self.next_cte += 1;
        CteId(self.next_cte)
    }

    /// The database-wide resolver at the root of every lookup chain.
    pub(crate) fn global(&self) -> crate::GlobalScope<'_> {
        crate::GlobalScope::new(self.env.catalog, self.env.defaults, self.env.functions)
    }

    /// Resolve a CTE binding visible from the innermost frame outward.
    pub(crate) fn cte_binding(&self, name: &str) -> Option<&CteBinding> {
        let key = name.to_ascii_lowercase();
        self.cte_frames.iter().rev().find_map(|frame| frame.get(&key))
    }
}

/// The leading words of a statement, for error messages.
fn statement_kind(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
}
