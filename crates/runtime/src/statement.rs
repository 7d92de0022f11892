//! The statement lifecycle: prepare a batch, advance through it, bind
//! parameters, and iterate results. A busy guard rejects re-entrant
//! iteration; plans are cached per statement and invalidated when the
//! statement advances or resets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use indexmap::IndexMap;
use plan::{
    Builder, BuilderEnv, ParamKey, ParsedStatement, RelNode, StatementPlan, TxnControl,
};
use values::{Row, SqlValue, TypeAffinity};

use crate::db::{DbCore, SessionState};
use crate::{Emitter, Error, Program, Result, RowStream, RuntimeCtx};

struct Compiled {
    plan: Arc<StatementPlan>,
    program: Arc<Program>,
    params: Vec<ParamKey>,
}

pub struct Statement {
    core: Arc<DbCore>,
    session: Arc<SessionState>,
    parsed: Vec<ParsedStatement>,
    current: usize,
    compiled: Option<Compiled>,
    bindings: HashMap<ParamKey, SqlValue>,
    busy: Arc<AtomicBool>,
    finalized: bool,
}

/// Clears the busy flag when the consumer drops the stream — the
/// cancellation path for abandoned iteration.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement").finish_non_exhaustive()
    }
}

impl Statement {
    pub(crate) fn prepare(
        core: Arc<DbCore>,
        session: Arc<SessionState>,
        sql: &str,
    ) -> Result<Statement> {
        let parsed = plan::parse::parse_batch(sql)?;
        Ok(Statement {
            core,
            session,
            parsed,
            current: 0,
            compiled: None,
            bindings: HashMap::new(),
            busy: Arc::new(AtomicBool::new(false)),
            finalized: false,
        })
    }

    fn guard_usable(&self) -> Result<()> {
        if self.finalized {
            return Err(Error::Misuse("statement is finalized".into()));
        }
        if self.busy.load(Ordering::Acquire) {
            return Err(Error::Misuse(
                "statement is busy; finish or drop the active iteration first".into(),
            ));
        }
        Ok(())
    }

    fn compile(&mut self) -> Result<&Compiled> {
        if self.compiled.is_none() {
            let parsed = self
                .parsed
                .get(self.current)
                .ok_or_else(|| Error::Misuse("statement batch is empty".into()))?;
            let catalog = self.core.catalog.read().expect("catalog poisoned");
            let functions = self.core.functions.read().expect("function registry poisoned");
            let defaults = self.core.options.schema_defaults();
            let builder = Builder::new(BuilderEnv {
                catalog: &catalog,
                defaults: &defaults,
                modules: &self.core.modules,
                functions: &functions,
                attrs: &self.core.attrs,
            });
            let output = builder.build(parsed)?;
            let plan = Arc::new(output.plan);
            let program = Emitter::emit_statement(&plan)?;
            self.compiled = Some(Compiled {
                plan,
                program,
                params: output.params,
            });
        }
        Ok(self.compiled.as_ref().expect("compiled just above"))
    }

    /// Bind one parameter by name (`name`, `:name`, `$name`, `@name`) or
    /// positional text (`?3`).
    pub fn bind(&mut self, key: &str, value: impl Into<SqlValue>) -> Result<()> {
        self.guard_usable()?;
        let trimmed = key.trim_start_matches([':', '$', '@']);
        let param = if let Some(rest) = key.strip_prefix('?') {
            ParamKey::Positional(
                rest.parse()
                    .map_err(|_| Error::Misuse(format!("bad parameter key {key:?}")))?,
            )
        } else if let Ok(position) = trimmed.parse::<u32>() {
            ParamKey::Positional(position)
        } else {
            ParamKey::Named(trimmed.to_string())
        };
        self.bindings.insert(param, value.into());
        Ok(())
    }

    /// Bind a positional parameter (1-based).
    pub fn bind_at(&mut self, position: u32, value: impl Into<SqlValue>) -> Result<()> {
        self.guard_usable()?;
        self.bindings
            .insert(ParamKey::Positional(position), value.into());
        Ok(())
    }

    pub fn bind_all<K: AsRef<str>>(
        &mut self,
        values: impl IntoIterator<Item = (K, SqlValue)>,
    ) -> Result<()> {
        for (key, value) in values {
            self.bind(key.as_ref(), value)?;
        }
        Ok(())
    }

    pub fn clear_bindings(&mut self) {
        self.bindings.clear();
    }

    /// Drop the cached plan; the next execution replans.
    pub fn reset(&mut self) -> Result<()> {
        self.guard_usable()?;
        self.compiled = None;
        Ok(())
    }

    pub fn finalize(&mut self) {
        self.finalized = true;
        self.compiled = None;
    }

    /// Advance to the next statement in the batch. Returns false at the
    /// end.
    pub fn next_statement(&mut self) -> Result<bool> {
        self.guard_usable()?;
        if self.current + 1 >= self.parsed.len() {
            return Ok(false);
        }
        self.current += 1;
        self.compiled = None;
        Ok(true)
    }

    pub fn column_names(&mut self) -> Result<Vec<String>> {
        if matches!(self.parsed.get(self.current), Some(ParsedStatement::Txn(_))) {
            return Ok(Vec::new());
        }
        Ok(self.compile()?.plan.column_names().to_vec())
    }

    pub fn column_type(&mut self, index: usize) -> Result<TypeAffinity> {
        let compiled = self.compile()?;
        let attrs = match &*compiled.plan {
            StatementPlan::Query { root, .. } | StatementPlan::Dml { root, .. } => {
                root.attributes()
            }
            _ => Vec::new(),
        };
        attrs
            .get(index)
            .map(|attribute| attribute.ty.affinity)
            .ok_or_else(|| Error::Range(format!("column index {index}")))
    }

    pub fn parameter_count(&mut self) -> Result<usize> {
        if matches!(self.parsed.get(self.current), Some(ParsedStatement::Txn(_))) {
            return Ok(0);
        }
        Ok(self.compile()?.params.len())
    }

    pub fn parameter_name(&mut self, index: usize) -> Result<Option<String>> {
        let compiled = self.compile()?;
        Ok(compiled.params.get(index).map(|key| key.to_string()))
    }

    pub fn parameter_index(&mut self, name: &str) -> Result<Option<usize>> {
        let compiled = self.compile()?;
        let wanted = name.trim_start_matches([':', '$', '@']);
        Ok(compiled.params.iter().position(|key| match key {
            ParamKey::Named(named) => named == wanted,
            ParamKey::Positional(position) => position.to_string() == wanted,
        }))
    }

    /// Execute the current statement, consuming its rows.
    pub async fn run(&mut self) -> Result<()> {
        if let Some(mut rows) = self.execute().await? {
            while rows.try_next().await?.is_some() {}
        }
        Ok(())
    }

    /// The first row as an ordered column→value map.
    pub async fn get(&mut self) -> Result<Option<IndexMap<String, SqlValue>>> {
        let names = self.column_names()?;
        let Some(mut rows) = self.execute().await? else {
            return Ok(None);
        };
        let Some(first) = rows.try_next().await? else {
            return Ok(None);
        };
        Ok(Some(to_object(&names, &first)))
    }

    /// Every row as an ordered column→value map.
    pub async fn all(
        &mut self,
    ) -> Result<BoxStream<'static, Result<IndexMap<String, SqlValue>>>> {
        let names = self.column_names()?;
        let rows = self.iterate_rows().await?;
        Ok(Box::pin(
            rows.map_ok(move |row| to_object(&names, &row)),
        ))
    }

    /// Raw rows.
    pub async fn iterate_rows(&mut self) -> Result<RowStream> {
        match self.execute().await? {
            Some(rows) => Ok(rows),
            None => Ok(Box::pin(futures::stream::empty())),
        }
    }

    /// The execution entry point: transaction control runs against the
    /// session; queries hand back their root stream; mutations run inside
    /// the open transaction or an autocommit unit.
    async fn execute(&mut self) -> Result<Option<RowStream>> {
        self.guard_usable()?;

        let parsed = self
            .parsed
            .get(self.current)
            .ok_or_else(|| Error::Misuse("statement batch is empty".into()))?;
        if let ParsedStatement::Txn(control) = parsed {
            let control = control.clone();
            self.run_txn_control(&control).await?;
            return Ok(None);
        }

        self.compile()?;
        let compiled = self.compiled.as_ref().expect("compiled above");
        let plan = compiled.plan.clone();
        let program = compiled.program.clone();
        let ctx = RuntimeCtx::new(
            self.core.clone(),
            self.session.clone(),
            self.bindings.clone(),
        );

        match &*plan {
            StatementPlan::Query { .. } => {
                self.busy.store(true, Ordering::Release);
                let guard = BusyGuard(self.busy.clone());
                let rows = match crate::run_program(program, ctx).await {
                    Ok(output) => output.into_rows()?,
                    Err(error) => return Err(error),
                };
                // The guard rides along; dropping the stream frees the
                // statement.
                let rows: RowStream =
                    Box::pin(rows.map(move |item| {
                        let _ = &guard;
                        item
                    }));
                Ok(Some(rows))
            }
            StatementPlan::Dml { returning, .. } => {
                self.busy.store(true, Ordering::Release);
                let _guard = BusyGuard(self.busy.clone());

                let autocommit = !self.session.in_explicit_txn();
                let targets = match &*plan {
                    StatementPlan::Dml { root, .. } => mutation_targets(root),
                    _ => Vec::new(),
                };
                let mut connections = Vec::new();
                for target in &targets {
                    let connection = self.session.connection(&self.core, target)?;
                    if autocommit {
                        connection.begin().await?;
                    }
                    connections.push(connection);
                }

                let outcome = async {
                    let rows = crate::run_program(program, ctx).await?.into_rows()?;
                    let collected: Vec<Row> = rows.try_collect().await?;
                    Ok::<Vec<Row>, Error>(collected)
                }
                .await;

                match outcome {
                    Ok(collected) => {
                        if autocommit {
                            // The statement is the transaction: deferred
                            // checks run now, then the storage commit.
                            if self.core.options.enforce_deferred {
                                if let Err(error) = self
                                    .core
                                    .deferred
                                    .run_deferred(&self.core, &self.session)
                                    .await
                                {
                                    for connection in &connections {
                                        connection.rollback().await.ok();
                                    }
                                    self.core.deferred.clear();
                                    return Err(error);
                                }
                            }
                            for connection in &connections {
                                connection.commit().await?;
                            }
                            self.core.deferred.clear();
                        }
                        if *returning {
                            let stream =
                                futures::stream::iter(collected.into_iter().map(Ok));
                            Ok(Some(Box::pin(stream) as RowStream))
                        } else {
                            Ok(None)
                        }
                    }
                    Err(error) => {
                        if autocommit {
                            for connection in &connections {
                                connection.rollback().await.ok();
                            }
                            self.core.deferred.clear();
                        }
                        Err(error)
                    }
                }
            }
            _ => {
                // DDL: the program performs the change and yields Void.
                crate::run_program(program, ctx).await?;
                Ok(None)
            }
        }
    }

    async fn run_txn_control(&mut self, control: &TxnControl) -> Result<()> {
        match control {
            TxnControl::Begin => self.session.begin_explicit(),
            TxnControl::Commit => self.session.commit(&self.core, &self.session.clone()).await,
            TxnControl::Rollback => self.session.rollback(&self.core).await,
            TxnControl::Savepoint(name) => self.session.savepoint(&self.core, name).await,
            TxnControl::Release(name) => {
                self.session.release_savepoint(&self.core, name).await
            }
            TxnControl::RollbackTo(name) => {
                self.session.rollback_to_savepoint(&self.core, name).await
            }
        }
    }
}

fn to_object(names: &[String], row: &Row) -> IndexMap<String, SqlValue> {
    names
        .iter()
        .enumerate()
        .map(|(at, name)| {
            (
                name.clone(),
                row.get(at).cloned().unwrap_or(SqlValue::Null),
            )
        })
        .collect()
}

/// The tables a DML plan writes, for transaction enrollment.
fn mutation_targets(node: &Arc<RelNode>) -> Vec<Arc<catalog::TableSchema>> {
    let mut out = Vec::new();
    fn walk(node: &Arc<RelNode>, out: &mut Vec<Arc<catalog::TableSchema>>) {
        if let RelNode::Insert { table, .. }
        | RelNode::Update { table, .. }
        | RelNode::Delete { table, .. } = &**node
        {
            if !out
                .iter()
                .any(|seen: &Arc<catalog::TableSchema>| Arc::ptr_eq(seen, table))
            {
                out.push(table.clone());
            }
        }
        for child in node.children() {
            walk(child, out);
        }
    }
    walk(node, &mut out);
    out
}
