/// Comparison operators a module can receive as sargable constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintOp {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

/// One sargable WHERE term, from the planner's point of view.
#[derive(Debug, Clone, Copy)]
pub struct IndexConstraint {
    pub column: usize,
    pub op: ConstraintOp,
    /// Unusable constraints (e.g. correlated terms not yet bound) are
    /// passed through for costing but must not receive an argv slot.
    pub usable: bool,
}

/// One ORDER BY term, by column position.
#[derive(Debug, Clone, Copy)]
pub struct IndexOrderBy {
    pub column: usize,
    pub descending: bool,
}

/// The module's verdict on one constraint: which filter-argument slot it
/// wants the value in (1-based), and whether the core may omit its own
/// re-check of the term.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstraintUsage {
    pub argv_index: Option<u32>,
    pub omit: bool,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct IndexFlags: u32 {
        /// The chosen access path yields at most one row.
        const UNIQUE_SCAN = 0b1;
    }
}

/// The planning exchange of `best_index`: the planner fills the inputs,
/// the module fills the outputs.
#[derive(Debug, Clone, Default)]
pub struct IndexInfo {
    // Inputs.
    pub constraints: Vec<IndexConstraint>,
    pub order_by: Vec<IndexOrderBy>,
    /// Bitmap of columns the statement reads; bit 63 stands in for every
    /// column at position 63 and beyond.
    pub columns_used: u64,

    // Outputs.
    pub constraint_usage: Vec<ConstraintUsage>,
    pub index_number: i32,
    pub index_string: Option<String>,
    pub order_by_consumed: bool,
    pub estimated_cost: f64,
    pub estimated_rows: u64,
    pub flags: IndexFlags,
}

impl IndexInfo {
    pub fn new(constraints: Vec<IndexConstraint>, order_by: Vec<IndexOrderBy>, columns_used: u64) -> Self {
        let constraint_usage = vec![ConstraintUsage::default(); constraints.len()];
        IndexInfo {
            constraints,
            order_by,
            columns_used,
            constraint_usage,
            index_number: 0,
            index_string: None,
            order_by_consumed: false,
            estimated_cost: f64::MAX,
            estimated_rows: u64::MAX,
            flags: IndexFlags::empty(),
        }
    }

    /// True when the statement reads |column|.
    pub fn uses_column(&self, column: usize) -> bool {
        let bit = column.min(63);
        self.columns_used & (1 << bit) != 0
    }
}
