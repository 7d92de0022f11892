use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use catalog::{IndexPart, IndexSchema, PrimaryKeyPart, TableSchema};
use vtab::{
    ConstraintOp, Error, IndexFlags, IndexInfo, Module, Result, TableConnection, VirtualTable,
};

use crate::access::{AccessPath, RangeBound};
use crate::conn::MemoryConnection;
use crate::{index_key, Layer, LayerIds, LayerTrees};

/// The in-memory MVCC module. Registered once per database under the
/// module name `memory`; tracks its table instances so `best_index` can
/// cost against live row counts.
pub struct MemoryModule {
    collapse_threshold: usize,
    tables: RwLock<HashMap<(String, String), Weak<MemoryTable>>>,
}

impl MemoryModule {
    pub fn new(collapse_threshold: usize) -> Self {
        MemoryModule {
            collapse_threshold,
            tables: RwLock::new(HashMap::new()),
        }
    }

    fn row_estimate(&self, schema: &TableSchema) -> u64 {
        let key = (
            schema.schema_name.to_ascii_lowercase(),
            schema.name.to_ascii_lowercase(),
        );
        self.tables
            .read()
            .expect("module table registry poisoned")
            .get(&key)
            .and_then(Weak::upgrade)
            .map(|table| table.head().trees.primary.len() as u64)
            .unwrap_or(1024)
    }
}

impl Default for MemoryModule {
    fn default() -> Self {
        Self::new(32)
    }
}

/// One candidate key order `best_index` can serve a scan through.
struct KeyCandidate {
    index: Option<String>,
    parts: Vec<(usize, bool)>,
    unique: bool,
}

fn candidates(schema: &TableSchema) -> Vec<KeyCandidate> {
    let mut out = vec![KeyCandidate {
        index: None,
        parts: schema
            .primary_key
            .iter()
            .map(|PrimaryKeyPart {
                     column, descending, ..
                 }| (*column, *descending))
            .collect(),
        unique: true,
    }];
    for index in &schema.indexes {
        out.push(KeyCandidate {
            index: Some(index.name.clone()),
            parts: index
                .parts
                .iter()
                .map(|IndexPart {
                         column, descending, ..
                     }| (*column, *descending))
                .collect(),
            unique: false,
        });
    }
    out
}

/// A costed plan for one candidate: the path plus the constraint indexes
/// feeding each filter argument, in argument order.
struct CandidatePlan {
    path: AccessPath,
    arg_constraints: Vec<usize>,
    order_consumed: bool,
    cost: f64,
    rows: u64,
}

fn plan_candidate(candidate: &KeyCandidate, info: &IndexInfo, table_rows: u64) -> CandidatePlan {
    let mut arg_constraints = Vec::new();
    let mut eq_parts = 0;

    for &(column, _) in &candidate.parts {
        let found = info.constraints.iter().position(|c| {
            c.usable && c.column == column && c.op == ConstraintOp::Eq
        });
        match found {
            Some(at) => {
                arg_constraints.push(at);
                eq_parts += 1;
            }
            None => break,
        }
    }

    let point = candidate.unique && eq_parts == candidate.parts.len() && eq_parts > 0;

    // A range over the first key part after the equality prefix. On a
    // descending part the key-space direction flips, so Gt becomes a
    // key-space upper bound.
    let mut lower = None;
    let mut upper = None;
    if !point && eq_parts < candidate.parts.len() {
        let (column, part_descending) = candidate.parts[eq_parts];
        for (at, constraint) in info.constraints.iter().enumerate() {
            if !constraint.usable || constraint.column != column {
                continue;
            }
            let (is_lower, strict) = match constraint.op {
                ConstraintOp::Gt => (true, true),
                ConstraintOp::Ge => (true, false),
                ConstraintOp::Lt => (false, true),
                ConstraintOp::Le => (false, false),
                ConstraintOp::Eq => continue,
            };
            let is_lower = is_lower != part_descending;
            let slot = if is_lower { &mut lower } else { &mut upper };
            if slot.is_none() {
                *slot = Some((at, RangeBound { strict }));
            }
        }
    }
    if let Some((at, _)) = lower {
        arg_constraints.push(at);
    }
    if let Some((at, _)) = upper {
        arg_constraints.push(at);
    }

    // ORDER BY is consumed when its terms walk the candidate's key parts
    // (from the front, or right after the equality prefix) in a uniform
    // direction.
    let (order_consumed, descending) = consume_order(candidate, eq_parts, info);

    let rows = if point {
        1
    } else {
        let narrowed = table_rows / 10u64.pow(eq_parts as u32).max(1);
        let narrowed = if lower.is_some() || upper.is_some() {
            narrowed / 2
        } else {
            narrowed
        };
        narrowed.max(1)
    };
    let mut cost = rows as f64;
    if candidate.index.is_some() {
        // Secondary scans pay the primary-tree fan-out.
        cost *= 1.2;
    }

    CandidatePlan {
        path: AccessPath {
            index: candidate.index.clone(),
            eq_parts,
            lower: lower.map(|(_, bound)| bound),
            upper: upper.map(|(_, bound)| bound),
            descending,
            point,
        },
        arg_constraints,
        order_consumed,
        cost,
        rows,
    }
}

fn consume_order(candidate: &KeyCandidate, eq_parts: usize, info: &IndexInfo) -> (bool, bool) {
    if info.order_by.is_empty() {
        return (false, false);
    }
    for start in [0, eq_parts] {
        if start + info.order_by.len() > candidate.parts.len() {
            continue;
        }
        let columns_match = info
            .order_by
            .iter()
            .zip(&candidate.parts[start..])
            .all(|(term, &(column, _))| term.column == column);
        if !columns_match {
            continue;
        }
        let flip = info.order_by[0].descending != candidate.parts[start].1;
        let uniform = info
            .order_by
            .iter()
            .zip(&candidate.parts[start..])
            .all(|(term, &(_, part_desc))| term.descending == (part_desc != flip));
        if uniform {
            return (true, flip);
        }
    }
    (false, false)
}

impl Module for MemoryModule {
    fn best_index(&self, schema: &TableSchema, info: &mut IndexInfo) -> Result<()> {
        let table_rows = self.row_estimate(schema);

        let mut best: Option<CandidatePlan> = None;
        for candidate in candidates(schema) {
            let plan = plan_candidate(&candidate, info, table_rows);
            let better = match &best {
                None => true,
                Some(current) => {
                    plan.cost < current.cost
                        || (plan.cost == current.cost
                            && plan.order_consumed
                            && !current.order_consumed)
                }
            };
            if better {
                best = Some(plan);
            }
        }
        let best = best.ok_or_else(|| Error::Internal("no access path candidates".into()))?;

        let (number, string) = best.path.encode();
        info.index_number = number;
        info.index_string = string;
        info.order_by_consumed = best.order_consumed;
        info.estimated_cost = best.cost;
        info.estimated_rows = best.rows;
        if best.path.point {
            info.flags |= IndexFlags::UNIQUE_SCAN;
        }
        for (argv, &constraint) in best.arg_constraints.iter().enumerate() {
            info.constraint_usage[constraint].argv_index = Some(argv as u32 + 1);
            info.constraint_usage[constraint].omit = true;
        }
        Ok(())
    }

    fn create(&self, schema: Arc<TableSchema>) -> Result<Arc<dyn VirtualTable>> {
        let key = (
            schema.schema_name.to_ascii_lowercase(),
            schema.name.to_ascii_lowercase(),
        );
        let table = Arc::new(MemoryTable::new(schema, self.collapse_threshold));
        self.tables
            .write()
            .expect("module table registry poisoned")
            .insert(key, Arc::downgrade(&table));
        Ok(table)
    }
}

/// One in-memory table: the committed layer chain head plus the writer
/// latch. Per-session state lives on [`MemoryConnection`]s.
pub struct MemoryTable {
    schema: RwLock<Arc<TableSchema>>,
    head: RwLock<Arc<Layer>>,
    writer: Mutex<Option<u64>>,
    layer_ids: LayerIds,
    collapse_threshold: usize,
}

impl MemoryTable {
    pub fn new(schema: Arc<TableSchema>, collapse_threshold: usize) -> Self {
        let layer_ids = LayerIds::default();
        let head = Layer::base(schema.clone(), &layer_ids);
        MemoryTable {
            schema: RwLock::new(schema),
            head: RwLock::new(head),
            writer: Mutex::new(None),
            layer_ids,
            collapse_threshold,
        }
    }

    pub fn head(&self) -> Arc<Layer> {
        self.head.read().expect("layer head poisoned").clone()
    }

    pub(crate) fn layer_ids(&self) -> &LayerIds {
        &self.layer_ids
    }

    /// Latch this table for |connection_id|: one writer at a time.
    pub(crate) fn acquire_writer(&self, connection_id: u64) -> Result<()> {
        let mut writer = self.writer.lock().expect("writer latch poisoned");
        match *writer {
            Some(holder) if holder != connection_id => Err(Error::Misuse(format!(
                "table {} is locked by another writer",
                self.schema().qualified_name()
            ))),
            _ => {
                *writer = Some(connection_id);
                Ok(())
            }
        }
    }

    pub(crate) fn release_writer(&self, connection_id: u64) {
        let mut writer = self.writer.lock().expect("writer latch poisoned");
        if *writer == Some(connection_id) {
            *writer = None;
        }
    }

    /// Append |trees| over |parent| as the new committed head, collapsing
    /// the chain once it grows past the threshold.
    pub(crate) fn publish(&self, parent: &Arc<Layer>, trees: LayerTrees) -> Result<()> {
        let mut head = self.head.write().expect("layer head poisoned");
        if !Arc::ptr_eq(&head, parent) {
            return Err(Error::Internal(
                "commit raced another writer past the latch".into(),
            ));
        }
        let mut next = Layer::committed(head.clone(), trees, &self.layer_ids);
        if next.depth() > self.collapse_threshold {
            tracing::debug!(
                table = %self.schema().qualified_name(),
                depth = next.depth(),
                "collapsing committed layer chain"
            );
            next = next.collapsed(&self.layer_ids);
        }
        *head = next;
        Ok(())
    }

    /// Register a new secondary index: backfill its tree from the current
    /// committed rows and publish a layer carrying it.
    pub fn define_index(&self, index: IndexSchema) -> Result<Arc<TableSchema>> {
        let mut writer = self.writer.lock().expect("writer latch poisoned");
        if writer.is_some() {
            return Err(Error::Misuse(
                "cannot create an index while a write transaction is active".into(),
            ));
        }
        *writer = None;

        let schema = self.schema();
        if schema.index(&index.name).is_some() {
            return Err(Error::Misuse(format!("index {} already exists", index.name)));
        }
        let next_schema = schema.with_index(index.clone());

        let head = self.head();
        let mut tree = crate::Tree::default();
        for (primary, row) in head.trees.primary.iter() {
            let key = index_key(&next_schema, &index.name, &row);
            let mut entry: crate::IndexEntry = tree.get(&key).cloned().unwrap_or_default();
            entry.primary_keys.push(primary);
            tree.insert(key, entry);
        }

        let mut trees = head.trees.clone();
        trees.indexes.insert(index.name.clone(), tree);

        let mut head_slot = self.head.write().expect("layer head poisoned");
        *head_slot = Layer::committed(head_slot.clone(), trees, &self.layer_ids);
        *self.schema.write().expect("schema slot poisoned") = next_schema.clone();
        Ok(next_schema)
    }

    /// Drop a secondary index and its tree.
    pub fn drop_index(&self, name: &str) -> Result<Arc<TableSchema>> {
        let schema = self.schema();
        if schema.index(name).is_none() {
            return Err(Error::NotFound(format!("index {name}")));
        }
        let next_schema = schema.without_index(name);

        let mut head_slot = self.head.write().expect("layer head poisoned");
        let mut trees = head_slot.trees.clone();
        trees.indexes.retain(|index, _| !index.eq_ignore_ascii_case(name));
        *head_slot = Layer::committed(head_slot.clone(), trees, &self.layer_ids);
        *self.schema.write().expect("schema slot poisoned") = next_schema.clone();
        Ok(next_schema)
    }
}

impl VirtualTable for MemoryTable {
    fn schema(&self) -> Arc<TableSchema> {
        self.schema.read().expect("schema slot poisoned").clone()
    }

    fn connect(self: Arc<Self>, connection_id: u64) -> Result<Arc<dyn TableConnection>> {
        Ok(Arc::new(MemoryConnection::new(self, connection_id)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
pub(crate) fn test_schema(name: &str) -> Arc<TableSchema> {
    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;

    let sql = format!("CREATE TABLE {name} (a INTEGER PRIMARY KEY, b TEXT)");
    let statements = Parser::parse_sql(&GenericDialect {}, &sql).unwrap();
    let lowered = catalog::ddl::table_from_create(
        &statements[0],
        None,
        &catalog::SchemaDefaults::default(),
    )
    .unwrap();
    Arc::new(lowered.schema)
}

#[cfg(test)]
mod test {
    use super::*;
    use vtab::{IndexConstraint, IndexOrderBy};

    fn indexed_schema() -> Arc<TableSchema> {
        test_schema("t").with_index(IndexSchema {
            name: "t_b".to_string(),
            parts: vec![IndexPart {
                column: 1,
                descending: false,
                collation: values::Collation::Binary,
            }],
        })
    }

    #[test]
    fn test_best_index_point_lookup() {
        let module = MemoryModule::default();
        let mut info = IndexInfo::new(
            vec![IndexConstraint {
                column: 0,
                op: ConstraintOp::Eq,
                usable: true,
            }],
            vec![],
            u64::MAX,
        );
        module.best_index(&indexed_schema(), &mut info).unwrap();

        let path = AccessPath::decode(info.index_number, info.index_string.as_deref());
        assert!(path.point);
        assert!(path.index.is_none());
        assert!(info.flags.contains(IndexFlags::UNIQUE_SCAN));
        assert_eq!(info.estimated_rows, 1);
        assert_eq!(info.constraint_usage[0].argv_index, Some(1));
        assert!(info.constraint_usage[0].omit);
    }

    #[test]
    fn test_best_index_consumes_order_by() {
        let module = MemoryModule::default();
        let mut info = IndexInfo::new(
            vec![],
            vec![IndexOrderBy {
                column: 0,
                descending: true,
            }],
            u64::MAX,
        );
        module.best_index(&indexed_schema(), &mut info).unwrap();

        let path = AccessPath::decode(info.index_number, info.index_string.as_deref());
        assert!(path.index.is_none());
        assert!(path.descending);
        assert!(info.order_by_consumed);
    }

    #[test]
    fn test_best_index_prefers_secondary_for_its_column() {
        let module = MemoryModule::default();
        let mut info = IndexInfo::new(
            vec![IndexConstraint {
                column: 1,
                op: ConstraintOp::Eq,
                usable: true,
            }],
            vec![],
            u64::MAX,
        );
        module.best_index(&indexed_schema(), &mut info).unwrap();

        let path = AccessPath::decode(info.index_number, info.index_string.as_deref());
        assert_eq!(path.index.as_deref(), Some("t_b"));
        assert_eq!(path.eq_parts, 1);
        assert_eq!(info.constraint_usage[0].argv_index, Some(1));
    }

    #[test]
    fn test_best_index_range_bounds() {
        let module = MemoryModule::default();
        let mut info = IndexInfo::new(
            vec![
                IndexConstraint {
                    column: 0,
                    op: ConstraintOp::Gt,
                    usable: true,
                },
                IndexConstraint {
                    column: 0,
                    op: ConstraintOp::Le,
                    usable: true,
                },
            ],
            vec![],
            u64::MAX,
        );
        module.best_index(&indexed_schema(), &mut info).unwrap();

        let path = AccessPath::decode(info.index_number, info.index_string.as_deref());
        assert_eq!(path.lower, Some(RangeBound { strict: true }));
        assert_eq!(path.upper, Some(RangeBound { strict: false }));
        // argv order is eq values, then lower, then upper.
        assert_eq!(info.constraint_usage[0].argv_index, Some(1));
        assert_eq!(info.constraint_usage[1].argv_index, Some(2));
    }
}
