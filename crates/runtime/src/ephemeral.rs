use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use values::Row;
use vtab::ConflictPolicy;

/// The ephemeral table behind a materialized CTE, and the result/queue
/// pair of a recursive one. Cloning shares the underlying storage;
/// `snapshot` copies the current rows so scans tolerate concurrent
/// appends by the same statement (the recursive queue traversal relies
/// on this).
#[derive(Debug, Clone, Default)]
pub struct EphemeralTable {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    rows: VecDeque<Row>,
    /// Whole-row keys already inserted, for Ignore-policy dedup.
    seen: HashSet<Row>,
}

impl EphemeralTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, row: Row) {
        self.lock().rows.push_back(row);
    }

    /// Insert keyed on the whole row. Under `Ignore` a duplicate is
    /// dropped and `false` comes back; every other policy keeps bag
    /// semantics, so `Abort` never actually conflicts here.
    pub fn insert(&self, row: Row, policy: ConflictPolicy) -> bool {
        let mut inner = self.lock();
        if matches!(policy, ConflictPolicy::Ignore) && !inner.seen.insert(row.clone()) {
            return false;
        }
        inner.rows.push_back(row);
        true
    }

    /// Consume the front row; the consumed prefix is gone for good,
    /// which is how the recursive loop truncates its queue.
    pub fn pop_front(&self) -> Option<Row> {
        self.lock().rows.pop_front()
    }

    pub fn snapshot(&self) -> Vec<Row> {
        self.lock().rows.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.rows.clear();
        inner.seen.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("ephemeral table poisoned")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use values::{row, SqlValue};

    fn one(v: i64) -> Row {
        row(vec![SqlValue::Integer(v)])
    }

    #[test]
    fn test_insert_policies_and_queue_consumption() {
        let table = EphemeralTable::new();

        // Abort keeps bag semantics: duplicates are fine.
        assert!(table.insert(one(1), ConflictPolicy::Abort));
        assert!(table.insert(one(1), ConflictPolicy::Abort));
        assert_eq!(table.len(), 2);

        // Ignore drops whole-row duplicates.
        table.clear();
        assert!(table.insert(one(1), ConflictPolicy::Ignore));
        assert!(!table.insert(one(1), ConflictPolicy::Ignore));
        assert!(table.insert(one(2), ConflictPolicy::Ignore));
        assert_eq!(table.len(), 2);

        assert_eq!(table.pop_front(), Some(one(1)));
        assert_eq!(table.pop_front(), Some(one(2)));
        assert_eq!(table.pop_front(), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_snapshot_is_stable_under_appends() {
        let table = EphemeralTable::new();
        table.append(one(1));
        let snapshot = table.snapshot();
        table.append(one(2));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(table.len(), 2);
    }
}
