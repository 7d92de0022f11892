use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use catalog::TableSchema;
use values::{flat_new, flat_old, row, Row, SqlValue};
use vtab::{ConflictPolicy, Cursor, Error, Result, RowOp, TableConnection, VirtualTable};

use crate::cursor::MemoryCursor;
use crate::table::MemoryTable;
use crate::{primary_key, Key, Layer, LayerTrees, PendingLayer};

/// Per-session state over one [`MemoryTable`]: the pinned read layer, the
/// pending write layer when a transaction is open, and the savepoint
/// snapshots taken inside it.
pub struct MemoryConnection {
    table: Arc<MemoryTable>,
    connection_id: u64,
    state: Mutex<ConnState>,
}

struct ConnState {
    read_layer: Arc<Layer>,
    pending: Option<PendingLayer>,
    savepoints: BTreeMap<u32, Arc<Layer>>,
    explicit_txn: bool,
}

impl MemoryConnection {
    pub fn new(table: Arc<MemoryTable>, connection_id: u64) -> Self {
        let read_layer = table.head();
        MemoryConnection {
            table,
            connection_id,
            state: Mutex::new(ConnState {
                read_layer,
                pending: None,
                savepoints: BTreeMap::new(),
                explicit_txn: false,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ConnState> {
        self.state.lock().expect("connection state poisoned")
    }

    fn open_pending(&self, state: &mut ConnState, explicit: bool) -> Result<()> {
        if state.pending.is_some() {
            return Err(Error::Misuse(
                "a transaction is already active on this connection".into(),
            ));
        }
        self.table.acquire_writer(self.connection_id)?;
        let head = self.table.head();
        state.pending = Some(PendingLayer::over(head, self.table.layer_ids()));
        state.explicit_txn = explicit;
        Ok(())
    }

    fn commit_pending(&self, state: &mut ConnState) -> Result<()> {
        let Some(pending) = state.pending.take() else {
            return Ok(());
        };
        let result = self.table.publish(&pending.parent, pending.trees);
        self.table.release_writer(self.connection_id);
        state.savepoints.clear();
        state.explicit_txn = false;
        state.read_layer = self.table.head();
        result
    }

    fn discard_pending(&self, state: &mut ConnState) {
        if state.pending.take().is_some() {
            self.table.release_writer(self.connection_id);
        }
        state.savepoints.clear();
        state.explicit_txn = false;
    }
}

#[async_trait::async_trait]
impl TableConnection for MemoryConnection {
    fn connection_id(&self) -> u64 {
        self.connection_id
    }

    fn schema(&self) -> Arc<TableSchema> {
        self.table.schema()
    }

    async fn begin(&self) -> Result<()> {
        let mut state = self.state();
        self.open_pending(&mut state, true)
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.state();
        self.commit_pending(&mut state)
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state();
        self.discard_pending(&mut state);
        Ok(())
    }

    async fn create_savepoint(&self, index: u32) -> Result<()> {
        let mut state = self.state();
        if state.pending.is_none() {
            self.open_pending(&mut state, false)?;
        }
        let snapshot = state
            .pending
            .as_ref()
            .expect("pending opened above")
            .snapshot(self.table.layer_ids());
        state.savepoints.insert(index, snapshot);
        Ok(())
    }

    async fn release_savepoint(&self, index: u32) -> Result<()> {
        let mut state = self.state();
        state
            .savepoints
            .remove(&index)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("savepoint {index}")))
    }

    async fn rollback_to_savepoint(&self, index: u32) -> Result<()> {
        let mut state = self.state();
        let snapshot = state
            .savepoints
            .get(&index)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("savepoint {index}")))?;
        let Some(pending) = state.pending.as_mut() else {
            return Err(Error::Misuse("no transaction to roll back within".into()));
        };
        pending.restore(&snapshot);
        state.savepoints.retain(|&at, _| at <= index);
        Ok(())
    }

    fn open_cursor(&self) -> Result<Box<dyn Cursor>> {
        let mut state = self.state();
        let (schema, trees) = match &state.pending {
            Some(pending) => (self.table.schema(), pending.trees.clone()),
            None => {
                // Readers re-pin the committed head at each statement's
                // first cursor; the clone makes the scan a snapshot scan.
                state.read_layer = self.table.head();
                (state.read_layer.schema.clone(), state.read_layer.trees.clone())
            }
        };
        Ok(Box::new(MemoryCursor::new(schema, trees)))
    }

    async fn update(
        &self,
        op: RowOp,
        flat_row: Row,
        policy: ConflictPolicy,
    ) -> Result<Option<Row>> {
        let mut state = self.state();
        let autocommit = state.pending.is_none();
        if autocommit {
            self.open_pending(&mut state, false)?;
        }

        let schema = self.table.schema();
        let result = {
            let pending = state.pending.as_mut().expect("pending opened above");
            apply_update(&schema, &mut pending.trees, op, &flat_row, policy)
        };

        if autocommit {
            match &result {
                Ok(_) => self.commit_pending(&mut state)?,
                Err(_) => self.discard_pending(&mut state),
            }
        }
        result
    }
}

/// Apply one mutation to a working tree set.
fn apply_update(
    schema: &TableSchema,
    trees: &mut LayerTrees,
    op: RowOp,
    flat: &Row,
    policy: ConflictPolicy,
) -> Result<Option<Row>> {
    let width = schema.columns.len();
    match op {
        RowOp::Insert => {
            let new = row(flat_new(flat, width).to_vec());
            let key = primary_key(schema, &new);
            if trees.primary.contains_key(&key) {
                match policy {
                    ConflictPolicy::Ignore => return Ok(None),
                    ConflictPolicy::Replace => {
                        let old = trees
                            .primary
                            .get(&key)
                            .cloned()
                            .expect("checked contains_key above");
                        unlink_row(schema, trees, &key, &old);
                    }
                    ConflictPolicy::Abort | ConflictPolicy::Fail | ConflictPolicy::Rollback => {
                        return Err(duplicate_key(schema, &new));
                    }
                }
            }
            link_row(schema, trees, key, new.clone());
            Ok(Some(key_values(schema, &new)))
        }
        RowOp::Update => {
            let old = row(flat_old(flat, width).to_vec());
            let new = row(flat_new(flat, width).to_vec());
            let old_key = primary_key(schema, &old);
            let new_key = primary_key(schema, &new);

            if old_key != new_key {
                if trees.primary.contains_key(&new_key) {
                    match policy {
                        ConflictPolicy::Ignore => return Ok(None),
                        ConflictPolicy::Replace => {
                            let displaced = trees
                                .primary
                                .get(&new_key)
                                .cloned()
                                .expect("checked contains_key above");
                            unlink_row(schema, trees, &new_key, &displaced);
                        }
                        _ => return Err(duplicate_key(schema, &new)),
                    }
                }
                unlink_row(schema, trees, &old_key, &old);
                link_row(schema, trees, new_key, new.clone());
            } else {
                trees.primary.insert(new_key.clone(), new.clone());
                reindex_row(schema, trees, &new_key, &old, &new);
            }
            Ok(Some(key_values(schema, &new)))
        }
        RowOp::Delete => {
            let old = row(flat_old(flat, width).to_vec());
            let key = primary_key(schema, &old);
            if !trees.primary.contains_key(&key) {
                return Err(Error::NotFound(format!(
                    "row to delete from {}",
                    schema.qualified_name()
                )));
            }
            unlink_row(schema, trees, &key, &old);
            Ok(None)
        }
    }
}

fn duplicate_key(schema: &TableSchema, new: &Row) -> Error {
    let key_text = schema
        .primary_key
        .iter()
        .map(|part| new[part.column].to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Error::constraint(
        format!("{}.primary_key", schema.qualified_name()),
        format!("duplicate primary key ({key_text})"),
    )
}

/// The primary-key values of |row|, as a row.
fn key_values(schema: &TableSchema, new: &Row) -> Row {
    row(schema
        .primary_key
        .iter()
        .map(|part| new[part.column].clone())
        .collect())
}

fn link_row(schema: &TableSchema, trees: &mut LayerTrees, key: Key, new: Row) {
    for index in &schema.indexes {
        let index_key = crate::index_key(schema, &index.name, &new);
        if let Some(tree) = trees.indexes.get_mut(&index.name) {
            let mut entry = tree.get(&index_key).cloned().unwrap_or_default();
            if !entry.primary_keys.contains(&key) {
                entry.primary_keys.push(key.clone());
            }
            tree.insert(index_key, entry);
        }
    }
    trees.primary.insert(key, new);
}

fn unlink_row(schema: &TableSchema, trees: &mut LayerTrees, key: &Key, old: &Row) {
    trees.primary.remove(key);
    for index in &schema.indexes {
        let index_key = crate::index_key(schema, &index.name, old);
        if let Some(tree) = trees.indexes.get_mut(&index.name) {
            let Some(mut entry) = tree.get(&index_key).cloned() else {
                continue;
            };
            entry.primary_keys.retain(|pk| pk != key);
            if entry.primary_keys.is_empty() {
                tree.remove(&index_key);
            } else {
                tree.insert(index_key, entry);
            }
        }
    }
}

/// After an in-place update, move the primary key between index entries
/// whose key changed; equal keys keep their entry as-is.
fn reindex_row(schema: &TableSchema, trees: &mut LayerTrees, key: &Key, old: &Row, new: &Row) {
    for index in &schema.indexes {
        let old_key = crate::index_key(schema, &index.name, old);
        let new_key = crate::index_key(schema, &index.name, new);
        if old_key == new_key {
            continue;
        }
        if let Some(tree) = trees.indexes.get_mut(&index.name) {
            if let Some(mut entry) = tree.get(&old_key).cloned() {
                entry.primary_keys.retain(|pk| pk != key);
                if entry.primary_keys.is_empty() {
                    tree.remove(&old_key);
                } else {
                    tree.insert(old_key, entry);
                }
            }
            let mut entry = tree.get(&new_key).cloned().unwrap_or_default();
            entry.primary_keys.push(key.clone());
            tree.insert(new_key, entry);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::access::AccessPath;
    use crate::table::test_schema;
    use catalog::{IndexPart, IndexSchema};
    use values::{flat_row, Collation};

    fn make_table(with_index: bool) -> Arc<MemoryTable> {
        let mut schema = test_schema("t");
        if with_index {
            schema = schema.with_index(IndexSchema {
                name: "t_b".to_string(),
                parts: vec![IndexPart {
                    column: 1,
                    descending: false,
                    collation: Collation::Binary,
                }],
            });
        }
        Arc::new(MemoryTable::new(schema, 32))
    }

    fn record(a: i64, b: &str) -> Row {
        row(vec![SqlValue::Integer(a), SqlValue::text(b)])
    }

    async fn insert(conn: &MemoryConnection, a: i64, b: &str) -> Result<Option<Row>> {
        let schema = conn.schema();
        let flat = flat_row(None, Some(&record(a, b)), schema.columns.len());
        conn.update(RowOp::Insert, flat, ConflictPolicy::Abort).await
    }

    async fn scan_all(conn: &MemoryConnection) -> Vec<Row> {
        let mut cursor = conn.open_cursor().unwrap();
        let (number, string) = AccessPath::default().encode();
        cursor.filter(number, string.as_deref(), &[]).await.unwrap();
        let mut rows = Vec::new();
        while !cursor.eof() {
            rows.push(cursor.row().unwrap());
            cursor.next().await.unwrap();
        }
        rows
    }

    #[tokio::test]
    async fn test_autocommit_insert_and_scan() {
        let table = make_table(false);
        let conn = MemoryConnection::new(table.clone(), 1);
        insert(&conn, 2, "y").await.unwrap();
        insert(&conn, 1, "x").await.unwrap();

        let rows = scan_all(&conn).await;
        assert_eq!(rows, vec![record(1, "x"), record(2, "y")]);
        // Autocommit published each row to the committed chain.
        assert_eq!(table.head().trees.primary.len(), 2);
    }

    #[tokio::test]
    async fn test_reader_isolation_mid_scan() {
        let table = make_table(false);
        let writer = MemoryConnection::new(table.clone(), 1);
        let reader = MemoryConnection::new(table.clone(), 2);

        insert(&writer, 1, "x").await.unwrap();

        // Arm the reader's cursor, then commit a new row behind it.
        let mut cursor = reader.open_cursor().unwrap();
        let (number, string) = AccessPath::default().encode();
        cursor.filter(number, string.as_deref(), &[]).await.unwrap();

        insert(&writer, 2, "y").await.unwrap();

        let mut rows = Vec::new();
        while !cursor.eof() {
            rows.push(cursor.row().unwrap());
            cursor.next().await.unwrap();
        }
        assert_eq!(rows, vec![record(1, "x")]);

        // A fresh cursor sees the new committed state.
        assert_eq!(scan_all(&reader).await.len(), 2);
    }

    #[tokio::test]
    async fn test_transaction_rollback_and_savepoints() {
        let table = make_table(false);
        let conn = MemoryConnection::new(table.clone(), 1);

        conn.begin().await.unwrap();
        insert(&conn, 10, "a").await.unwrap();
        conn.create_savepoint(1).await.unwrap();
        insert(&conn, 11, "b").await.unwrap();
        insert(&conn, 12, "c").await.unwrap();
        conn.rollback_to_savepoint(1).await.unwrap();
        conn.commit().await.unwrap();

        let rows = scan_all(&conn).await;
        assert_eq!(rows, vec![record(10, "a")]);
    }

    #[tokio::test]
    async fn test_rollback_discards_everything() {
        let table = make_table(false);
        let conn = MemoryConnection::new(table.clone(), 1);

        conn.begin().await.unwrap();
        insert(&conn, 1, "x").await.unwrap();
        conn.rollback().await.unwrap();

        assert!(scan_all(&conn).await.is_empty());
        // The writer latch is free again.
        conn.begin().await.unwrap();
        conn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_conflict_policies() {
        let table = make_table(false);
        let conn = MemoryConnection::new(table.clone(), 1);
        let schema = conn.schema();

        insert(&conn, 1, "x").await.unwrap();

        // Abort fails and reports the constraint.
        let err = insert(&conn, 1, "y").await.unwrap_err();
        assert!(matches!(err, Error::Constraint { .. }));

        // Ignore drops the write and reports no key.
        let flat = flat_row(None, Some(&record(1, "y")), schema.columns.len());
        let outcome = conn
            .update(RowOp::Insert, flat, ConflictPolicy::Ignore)
            .await
            .unwrap();
        assert_eq!(outcome, None);

        // Replace overwrites.
        let flat = flat_row(None, Some(&record(1, "z")), schema.columns.len());
        let outcome = conn
            .update(RowOp::Insert, flat, ConflictPolicy::Replace)
            .await
            .unwrap();
        assert_eq!(outcome, Some(row(vec![SqlValue::Integer(1)])));
        assert_eq!(scan_all(&conn).await, vec![record(1, "z")]);
    }

    #[tokio::test]
    async fn test_secondary_index_maintenance() {
        let table = make_table(true);
        let conn = MemoryConnection::new(table.clone(), 1);
        let schema = conn.schema();

        insert(&conn, 1, "blue").await.unwrap();
        insert(&conn, 2, "red").await.unwrap();
        insert(&conn, 3, "blue").await.unwrap();

        // Equality scan through the index fans out to primary rows.
        let mut cursor = conn.open_cursor().unwrap();
        let path = AccessPath {
            index: Some("t_b".to_string()),
            eq_parts: 1,
            ..Default::default()
        };
        let (number, string) = path.encode();
        cursor
            .filter(number, string.as_deref(), &[SqlValue::text("blue")])
            .await
            .unwrap();
        let mut rows = Vec::new();
        while !cursor.eof() {
            rows.push(cursor.row().unwrap());
            cursor.next().await.unwrap();
        }
        assert_eq!(rows, vec![record(1, "blue"), record(3, "blue")]);

        // Delete removes the primary key from the entry; the entry for a
        // now-unused key disappears entirely.
        let flat = flat_row(Some(&record(2, "red")), None, schema.columns.len());
        conn.update(RowOp::Delete, flat, ConflictPolicy::Abort)
            .await
            .unwrap();
        let head = table.head();
        let index_tree = head.trees.indexes.get("t_b").unwrap();
        assert_eq!(index_tree.len(), 1);

        // Update moves the key between entries.
        let flat = flat_row(
            Some(&record(1, "blue")),
            Some(&record(1, "green")),
            schema.columns.len(),
        );
        conn.update(RowOp::Update, flat, ConflictPolicy::Abort)
            .await
            .unwrap();
        let head = table.head();
        let index_tree = head.trees.indexes.get("t_b").unwrap();
        assert_eq!(index_tree.len(), 2);
    }
}
