/// SqlValue is the runtime representation of a single SQL value.
/// It's the currency of every row flowing through the engine:
/// scans yield them, expressions compute them, and the storage
/// layer keys its trees on them.
mod value;
pub use value::SqlValue;

// Type affinity follows the SQLite name-derivation rules and governs
// how values are coerced when stored into a column.
mod affinity;
pub use affinity::TypeAffinity;

// Collations alter text comparison and key folding.
pub mod collation;
pub use collation::Collation;

// All SqlValue variants are comparable with one another under a
// single total order: Null < numerics < Text < Blob.
mod compare;
pub use compare::{compare, compare_with};

// Arithmetic, logical, comparison and LIKE kernels over SqlValue.
pub mod ops;

// Rows, and the wide OLD‖NEW "flat row" layout used during mutation.
mod row;
pub use row::{flat_new, flat_old, flat_row, row, Row};
