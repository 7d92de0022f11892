use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use catalog::TableSchema;
use values::Row;

use crate::{Key, Tree};

/// Allocator for layer ids. One lives per table so ids stay scoped to
/// their database instance rather than the process.
#[derive(Debug, Default)]
pub struct LayerIds(AtomicU64);

impl LayerIds {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// One secondary-index posting: the primary keys of every row sharing the
/// index key. Multi-valued to support non-unique indexes.
#[derive(Debug, Clone, Default)]
pub struct IndexEntry {
    pub primary_keys: Vec<Key>,
}

/// The tree set of one layer: the primary tree plus one tree per
/// secondary index, keyed by index name.
#[derive(Debug, Clone, Default)]
pub struct LayerTrees {
    pub primary: Tree<Key, Row>,
    pub indexes: BTreeMap<String, Tree<Key, IndexEntry>>,
}

impl LayerTrees {
    pub fn for_schema(schema: &TableSchema) -> Self {
        LayerTrees {
            primary: Tree::new(),
            indexes: schema
                .indexes
                .iter()
                .map(|index| (index.name.clone(), Tree::new()))
                .collect(),
        }
    }
}

/// An immutable committed snapshot of one table. Layers chain through
/// `parent`; only the chain head is ever extended. Because the trees are
/// structurally shared and self-contained, a layer's reads never need to
/// consult its parent — the chain exists for collapse bookkeeping and to
/// keep reader-pinned snapshots alive.
#[derive(Debug)]
pub struct Layer {
    pub id: u64,
    pub parent: Option<Arc<Layer>>,
    pub schema: Arc<TableSchema>,
    pub trees: LayerTrees,
}

impl Layer {
    /// The empty base layer of a fresh table.
    pub fn base(schema: Arc<TableSchema>, ids: &LayerIds) -> Arc<Self> {
        Arc::new(Layer {
            id: ids.next(),
            parent: None,
            schema: schema.clone(),
            trees: LayerTrees::for_schema(&schema),
        })
    }

    /// Seal |trees| as the next committed layer over |parent|.
    pub fn committed(parent: Arc<Layer>, trees: LayerTrees, ids: &LayerIds) -> Arc<Self> {
        Arc::new(Layer {
            id: ids.next(),
            schema: parent.schema.clone(),
            parent: Some(parent),
            trees,
        })
    }

    /// A self-contained copy of this layer with the parent chain cut:
    /// the collapse target.
    pub fn collapsed(&self, ids: &LayerIds) -> Arc<Self> {
        Arc::new(Layer {
            id: ids.next(),
            parent: None,
            schema: self.schema.clone(),
            trees: self.trees.clone(),
        })
    }

    /// Chain length from this layer back to the base.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut node = self.parent.as_deref();
        while let Some(layer) = node {
            depth += 1;
            node = layer.parent.as_deref();
        }
        depth
    }
}

/// The mutable working set of one writer: a fork of the parent's trees.
/// Constructing it is O(1); writes copy only the touched tree paths.
#[derive(Debug)]
pub struct PendingLayer {
    pub id: u64,
    pub parent: Arc<Layer>,
    pub trees: LayerTrees,
}

impl PendingLayer {
    pub fn over(parent: Arc<Layer>, ids: &LayerIds) -> Self {
        PendingLayer {
            id: ids.next(),
            trees: parent.trees.clone(),
            parent,
        }
    }

    /// Snapshot the working set as an independent committed layer parented
    /// on this layer's own parent — the savepoint primitive. Later writes
    /// to the live working set never reach the snapshot.
    pub fn snapshot(&self, ids: &LayerIds) -> Arc<Layer> {
        Arc::new(Layer {
            id: ids.next(),
            parent: Some(self.parent.clone()),
            schema: self.parent.schema.clone(),
            trees: self.trees.clone(),
        })
    }

    /// Replace the working set with a snapshot's contents.
    pub fn restore(&mut self, snapshot: &Layer) {
        self.trees = snapshot.trees.clone();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::KeyPart;
    use values::{row, Collation, SqlValue};

    fn schema() -> Arc<TableSchema> {
        crate::table::test_schema("t")
    }

    fn key(v: i64) -> Key {
        vec![KeyPart::new(SqlValue::Integer(v), false, Collation::Binary)]
    }

    #[test]
    fn test_pending_fork_is_isolated() {
        let ids = LayerIds::default();
        let base = Layer::base(schema(), &ids);
        let mut pending = PendingLayer::over(base.clone(), &ids);

        pending
            .trees
            .primary
            .insert(key(1), row(vec![SqlValue::Integer(1), SqlValue::text("a")]));

        // Copy-on-write soundness: the parent never sees child writes.
        assert!(base.trees.primary.is_empty());
        assert_eq!(pending.trees.primary.len(), 1);
    }

    #[test]
    fn test_savepoint_snapshot_is_independent() {
        let ids = LayerIds::default();
        let base = Layer::base(schema(), &ids);
        let mut pending = PendingLayer::over(base, &ids);

        pending
            .trees
            .primary
            .insert(key(1), row(vec![SqlValue::Integer(1), SqlValue::text("a")]));
        let snapshot = pending.snapshot(&ids);

        pending
            .trees
            .primary
            .insert(key(2), row(vec![SqlValue::Integer(2), SqlValue::text("b")]));
        pending.trees.primary.remove(&key(1));

        assert_eq!(snapshot.trees.primary.len(), 1);
        assert!(snapshot.trees.primary.contains_key(&key(1)));

        // Savepoint idempotence: restoring returns the working set to the
        // snapshot's exact contents.
        pending.restore(&snapshot);
        assert_eq!(pending.trees.primary.len(), 1);
        assert!(pending.trees.primary.contains_key(&key(1)));
        assert!(!pending.trees.primary.contains_key(&key(2)));
    }

    #[test]
    fn test_depth_and_collapse() {
        let ids = LayerIds::default();
        let base = Layer::base(schema(), &ids);
        let l2 = Layer::committed(base, LayerTrees::default(), &ids);
        let l3 = Layer::committed(l2, LayerTrees::default(), &ids);
        assert_eq!(l3.depth(), 3);
        assert_eq!(l3.collapsed(&ids).depth(), 1);
    }
}
