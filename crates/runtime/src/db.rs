use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use catalog::{Catalog, SchemaDefaults, TableSchema};
use plan::{AttributeGenerator, FunctionRegistry};
use vtab::{ModuleRegistry, TableConnection, VirtualTable};

use crate::constraints::DeferredQueue;
use crate::{Error, Result, Statement};

/// Engine configuration, deserializable the way embedders pass it in.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineOptions {
    pub schema_name: String,
    pub default_module: String,
    pub default_module_args: Vec<String>,
    /// Committed-chain length that triggers a layer collapse.
    pub collapse_threshold: usize,
    /// Gate for deferred-constraint evaluation at COMMIT.
    pub enforce_deferred: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            schema_name: "main".to_string(),
            default_module: "memory".to_string(),
            default_module_args: Vec::new(),
            collapse_threshold: 32,
            enforce_deferred: true,
        }
    }
}

impl EngineOptions {
    pub fn schema_defaults(&self) -> SchemaDefaults {
        SchemaDefaults {
            schema_name: self.schema_name.clone(),
            module_name: self.default_module.clone(),
            module_args: self.default_module_args.clone(),
        }
    }
}

/// The shared heart of one database instance: catalog, registries, live
/// table instances, the deferred-constraint queue, and the id wells.
/// Sessions share a core; cores share nothing.
pub struct DbCore {
    pub catalog: RwLock<Catalog>,
    pub modules: ModuleRegistry,
    pub functions: RwLock<FunctionRegistry>,
    pub attrs: AttributeGenerator,
    pub options: EngineOptions,
    pub deferred: DeferredQueue,
    tables: RwLock<HashMap<(String, String), Arc<dyn VirtualTable>>>,
    session_ids: AtomicU64,
}

impl DbCore {
    fn new(options: EngineOptions) -> Arc<Self> {
        let core = Arc::new(DbCore {
            catalog: RwLock::new(Catalog::new()),
            modules: ModuleRegistry::new(),
            functions: RwLock::new(FunctionRegistry::new()),
            attrs: AttributeGenerator::default(),
            deferred: DeferredQueue::default(),
            tables: RwLock::new(HashMap::new()),
            session_ids: AtomicU64::new(0),
            options,
        });
        core.modules.register(
            "memory",
            Arc::new(memstore::MemoryModule::new(
                core.options.collapse_threshold,
            )),
        );
        {
            let mut functions = core.functions.write().expect("function registry poisoned");
            crate::functions::register_builtins(&mut functions);
        }
        crate::explain::register(&core);
        core
    }

    pub fn next_session_id(&self) -> u64 {
        self.session_ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn table_key(schema: &TableSchema) -> (String, String) {
        (
            schema.schema_name.to_ascii_lowercase(),
            schema.name.to_ascii_lowercase(),
        )
    }

    /// The live instance behind a registered table, created through its
    /// module on first touch.
    pub fn table_instance(&self, schema: &Arc<TableSchema>) -> Result<Arc<dyn VirtualTable>> {
        let key = Self::table_key(schema);
        if let Some(table) = self
            .tables
            .read()
            .expect("table instances poisoned")
            .get(&key)
        {
            return Ok(table.clone());
        }
        let module = self.modules.get(&schema.module_name).ok_or_else(|| {
            Error::NotFound(format!("virtual-table module {}", schema.module_name))
        })?;
        let table = module.create(schema.clone())?;
        self.tables
            .write()
            .expect("table instances poisoned")
            .insert(key, table.clone());
        Ok(table)
    }

    pub fn remove_table_instance(&self, schema_name: &str, name: &str) {
        self.tables.write().expect("table instances poisoned").remove(&(
            schema_name.to_ascii_lowercase(),
            name.to_ascii_lowercase(),
        ));
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Arc<Self> {
        Self::new(EngineOptions::default())
    }
}

/// Per-session state: this consumer's table connections and transaction
/// bookkeeping. One writer session at a time can hold pending layers on
/// a table; that exclusion lives in the storage module.
pub struct SessionState {
    pub connection_id: u64,
    connections: Mutex<HashMap<(String, String), Arc<dyn TableConnection>>>,
    txn: Mutex<TxnState>,
}

#[derive(Default)]
struct TxnState {
    explicit: bool,
    /// Connections that have begun inside the open transaction.
    begun: Vec<Arc<dyn TableConnection>>,
    /// Savepoint name → storage index, in creation order.
    savepoints: Vec<(String, u32)>,
    next_savepoint: u32,
}

impl SessionState {
    pub fn new(connection_id: u64) -> Self {
        SessionState {
            connection_id,
            connections: Mutex::new(HashMap::new()),
            txn: Mutex::new(TxnState::default()),
        }
    }

    pub fn connection(
        &self,
        core: &Arc<DbCore>,
        table: &TableSchema,
    ) -> Result<Arc<dyn TableConnection>> {
        let key = (
            table.schema_name.to_ascii_lowercase(),
            table.name.to_ascii_lowercase(),
        );
        if let Some(connection) = self
            .connections
            .lock()
            .expect("session connections poisoned")
            .get(&key)
        {
            return Ok(connection.clone());
        }
        let schema = core
            .catalog
            .read()
            .expect("catalog poisoned")
            .resolve(&table.schema_name, &table.name)
            .ok_or_else(|| Error::NotFound(format!("table {}", table.qualified_name())))?;
        let connection = core.table_instance(&schema)?.connect(self.connection_id)?;
        self.connections
            .lock()
            .expect("session connections poisoned")
            .insert(key, connection.clone());
        Ok(connection)
    }

    /// Whether this session holds a connection to the named table (the
    /// deferred queue's fallback context lookup).
    pub fn has_connection_to(&self, qualified: &str) -> bool {
        self.connections
            .lock()
            .expect("session connections poisoned")
            .values()
            .any(|connection| connection.schema().qualified_name().eq_ignore_ascii_case(qualified))
    }

    pub fn forget_connection(&self, schema_name: &str, name: &str) {
        self.connections
            .lock()
            .expect("session connections poisoned")
            .remove(&(
                schema_name.to_ascii_lowercase(),
                name.to_ascii_lowercase(),
            ));
    }

    pub fn in_explicit_txn(&self) -> bool {
        self.txn.lock().expect("txn state poisoned").explicit
    }

    pub fn begin_explicit(&self) -> Result<()> {
        let mut txn = self.txn.lock().expect("txn state poisoned");
        if txn.explicit {
            return Err(Error::Misuse(
                "a transaction is already active; COMMIT or ROLLBACK first".into(),
            ));
        }
        txn.explicit = true;
        Ok(())
    }

    /// Enroll a connection into the open transaction: begin it and replay
    /// the savepoints created so far.
    pub async fn enroll(&self, connection: &Arc<dyn TableConnection>) -> Result<()> {
        let (needs_begin, savepoints) = {
            let txn = self.txn.lock().expect("txn state poisoned");
            if !txn.explicit {
                return Ok(());
            }
            let begun = txn
                .begun
                .iter()
                .any(|c| Arc::ptr_eq(c, connection));
            (
                !begun,
                txn.savepoints.iter().map(|(_, i)| *i).collect::<Vec<_>>(),
            )
        };
        if !needs_begin {
            return Ok(());
        }
        connection.begin().await?;
        for index in savepoints {
            connection.create_savepoint(index).await?;
        }
        let mut txn = self.txn.lock().expect("txn state poisoned");
        txn.begun.push(connection.clone());
        Ok(())
    }

    pub async fn commit(&self, core: &Arc<DbCore>, self_arc: &Arc<SessionState>) -> Result<()> {
        // Deferred constraints run before the storage commit finalizes.
        if core.options.enforce_deferred {
            core.deferred.run_deferred(core, self_arc).await?;
        }
        let begun = {
            let mut txn = self.txn.lock().expect("txn state poisoned");
            if !txn.explicit {
                return Err(Error::Misuse("no transaction to commit".into()));
            }
            txn.explicit = false;
            txn.savepoints.clear();
            txn.next_savepoint = 0;
            std::mem::take(&mut txn.begun)
        };
        for connection in begun {
            connection.commit().await?;
        }
        core.deferred.clear();
        Ok(())
    }

    pub async fn rollback(&self, core: &Arc<DbCore>) -> Result<()> {
        let begun = {
            let mut txn = self.txn.lock().expect("txn state poisoned");
            if !txn.explicit {
                return Err(Error::Misuse("no transaction to roll back".into()));
            }
            txn.explicit = false;
            txn.savepoints.clear();
            txn.next_savepoint = 0;
            std::mem::take(&mut txn.begun)
        };
        for connection in begun {
            connection.rollback().await?;
        }
        core.deferred.clear();
        Ok(())
    }

    pub async fn savepoint(&self, core: &Arc<DbCore>, name: &str) -> Result<()> {
        let (index, begun) = {
            let mut txn = self.txn.lock().expect("txn state poisoned");
            // SAVEPOINT outside a transaction opens one.
            txn.explicit = true;
            txn.next_savepoint += 1;
            let index = txn.next_savepoint;
            txn.savepoints.push((name.to_ascii_lowercase(), index));
            (index, txn.begun.clone())
        };
        for connection in begun {
            connection.create_savepoint(index).await?;
        }
        core.deferred.begin_layer(index);
        Ok(())
    }

    pub async fn release_savepoint(&self, core: &Arc<DbCore>, name: &str) -> Result<()> {
        let (released, begun) = {
            let mut txn = self.txn.lock().expect("txn state poisoned");
            let at = find_savepoint(&txn.savepoints, name)?;
            let released: Vec<u32> =
                txn.savepoints.drain(at..).map(|(_, index)| index).collect();
            (released, txn.begun.clone())
        };
        // Innermost first.
        for &index in released.iter().rev() {
            for connection in &begun {
                connection.release_savepoint(index).await?;
            }
            core.deferred.release_layer(index);
        }
        Ok(())
    }

    pub async fn rollback_to_savepoint(&self, core: &Arc<DbCore>, name: &str) -> Result<()> {
        let (index, begun) = {
            let mut txn = self.txn.lock().expect("txn state poisoned");
            let at = find_savepoint(&txn.savepoints, name)?;
            let index = txn.savepoints[at].1;
            // The named savepoint survives; everything nested after it
            // is discarded.
            txn.savepoints.truncate(at + 1);
            (index, txn.begun.clone())
        };
        for connection in &begun {
            connection.rollback_to_savepoint(index).await?;
        }
        core.deferred.rollback_to(index);
        Ok(())
    }
}

fn find_savepoint(savepoints: &[(String, u32)], name: &str) -> Result<usize> {
    let wanted = name.to_ascii_lowercase();
    savepoints
        .iter()
        .rposition(|(name, _)| *name == wanted)
        .ok_or_else(|| Error::NotFound(format!("savepoint {name}")))
}

/// A database handle: one consumer session over a shared core. `connect`
/// opens further sessions with their own transaction state; every session
/// sees the same catalog and storage.
pub struct Database {
    pub(crate) core: Arc<DbCore>,
    pub(crate) session: Arc<SessionState>,
}

impl Database {
    pub fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    pub fn with_options(options: EngineOptions) -> Self {
        let core = DbCore::new(options);
        let session = Arc::new(SessionState::new(core.next_session_id()));
        Database { core, session }
    }

    /// Open another session over the same database.
    pub fn connect(&self) -> Database {
        Database {
            core: self.core.clone(),
            session: Arc::new(SessionState::new(self.core.next_session_id())),
        }
    }

    pub fn prepare(&self, sql: &str) -> Result<Statement> {
        Statement::prepare(self.core.clone(), self.session.clone(), sql)
    }

    /// Run every statement in |sql|, discarding rows.
    pub async fn exec(&self, sql: &str) -> Result<()> {
        let mut statement = self.prepare(sql)?;
        loop {
            statement.run().await?;
            if !statement.next_statement()? {
                break;
            }
        }
        Ok(())
    }

    /// Convenience: all raw rows of a single query.
    pub async fn query(&self, sql: &str) -> Result<Vec<values::Row>> {
        use futures::TryStreamExt;
        let mut statement = self.prepare(sql)?;
        let rows: Vec<values::Row> = statement.iterate_rows().await?.try_collect().await?;
        Ok(rows)
    }

    pub fn register_module(&self, name: &str, module: Arc<dyn vtab::Module>) {
        self.core.modules.register(name, module);
    }

    pub fn register_scalar(&self, function: plan::ScalarFunction) {
        self.core
            .functions
            .write()
            .expect("function registry poisoned")
            .register_scalar(function);
    }

    pub fn register_aggregate(&self, function: plan::AggregateFunction) {
        self.core
            .functions
            .write()
            .expect("function registry poisoned")
            .register_aggregate(function);
    }

    pub fn register_table_function(&self, function: plan::TableFunction) {
        self.core
            .functions
            .write()
            .expect("function registry poisoned")
            .register_table(function);
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}
