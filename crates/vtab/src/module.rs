use std::any::Any;
use std::sync::Arc;

use catalog::TableSchema;
use values::{Row, SqlValue};

use crate::{ConflictPolicy, IndexInfo, Result, RowOp};

/// A virtual-table module: the factory and planner behind one `USING`
/// clause. Implementations are registered on the database by name.
pub trait Module: Send + Sync {
    /// Decide the access path for a scan. The planner fills the input half
    /// of |info|; the module fills the output half.
    fn best_index(&self, schema: &TableSchema, info: &mut IndexInfo) -> Result<()>;

    /// Instantiate the table described by |schema|.
    fn create(&self, schema: Arc<TableSchema>) -> Result<Arc<dyn VirtualTable>>;
}

/// One table instance. Tables are shared; per-session state lives on the
/// connections they hand out.
pub trait VirtualTable: Send + Sync {
    fn schema(&self) -> Arc<TableSchema>;

    /// Open a connection for the consumer session |connection_id|.
    fn connect(self: Arc<Self>, connection_id: u64) -> Result<Arc<dyn TableConnection>>;

    /// Escape hatch for module-specific DDL (index backfill and the like).
    fn as_any(&self) -> &dyn Any;
}

/// A per-session connection: the transactional surface plus cursor and
/// mutation entry points. One writer at a time owns a pending layer.
#[async_trait::async_trait]
pub trait TableConnection: Send + Sync {
    fn connection_id(&self) -> u64;
    fn schema(&self) -> Arc<TableSchema>;

    async fn begin(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;

    async fn create_savepoint(&self, index: u32) -> Result<()>;
    async fn release_savepoint(&self, index: u32) -> Result<()>;
    async fn rollback_to_savepoint(&self, index: u32) -> Result<()>;

    fn open_cursor(&self) -> Result<Box<dyn Cursor>>;

    /// Apply one mutation. The flat row carries OLD then NEW halves.
    /// Returns the new primary key, or None when an Ignore policy dropped
    /// the write.
    async fn update(
        &self,
        op: RowOp,
        flat_row: Row,
        policy: ConflictPolicy,
    ) -> Result<Option<Row>>;
}

/// A scan in progress. `filter` arms the cursor with the access path the
/// module chose at plan time; iteration is pull-driven.
#[async_trait::async_trait]
pub trait Cursor: Send {
    async fn filter(
        &mut self,
        index_number: i32,
        index_string: Option<&str>,
        args: &[SqlValue],
    ) -> Result<()>;

    async fn next(&mut self) -> Result<()>;
    fn eof(&self) -> bool;

    /// The current row. Misuse to call at eof.
    fn row(&self) -> Result<Row>;

    fn column(&self, index: usize) -> Result<SqlValue> {
        let row = self.row()?;
        row.get(index)
            .cloned()
            .ok_or_else(|| crate::Error::Range(format!("column index {index}")))
    }
}
