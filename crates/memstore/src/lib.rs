//! The in-memory MVCC virtual-table module.
//!
//! Storage is a chain of layers, each holding a primary copy-on-write
//! B-tree plus one tree per secondary index. Committed layers are
//! immutable and shared; every writer owns exactly one pending layer.
//! Because tree nodes are structurally shared, constructing a layer over
//! a parent is O(1) and deletion needs no tombstones: removing a key from
//! the pending layer's tree hides it regardless of the parent still
//! holding it.

// The persistent copy-on-write B-tree.
pub mod tree;
pub use tree::Tree;

// Composite keys honoring per-part direction and collation.
mod key;
pub use key::{index_key, primary_key, Key, KeyPart};

// Layers: committed snapshots and the mutable pending working set.
mod layer;
pub use layer::{IndexEntry, Layer, LayerIds, LayerTrees, PendingLayer};

// The module, table, connection and cursor implementations.
mod table;
pub use table::{MemoryModule, MemoryTable};

mod conn;
pub use conn::MemoryConnection;

mod cursor;
pub use cursor::MemoryCursor;

// Access-path encoding shared between best_index and the cursor.
mod access;
pub use access::AccessPath;
