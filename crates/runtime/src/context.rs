use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use catalog::TableSchema;
use plan::{AttributeId, CteId, ParamKey};
use values::{Row, SqlValue};
use vtab::TableConnection;

use crate::db::{DbCore, SessionState};
use crate::{EphemeralTable, Error, Result};

/// A row getter: the mutable cell one operator installs once and updates
/// per output row.
#[derive(Debug, Clone, Default)]
pub struct RowSlot(Arc<Mutex<Option<Row>>>);

impl RowSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, row: Row) {
        *self.0.lock().expect("row slot poisoned") = Some(row);
    }

    pub fn clear(&self) {
        *self.0.lock().expect("row slot poisoned") = None;
    }

    pub fn get(&self) -> Option<Row> {
        self.0.lock().expect("row slot poisoned").clone()
    }
}

/// Maps attribute ids onto column positions within one row shape.
#[derive(Debug, Clone)]
pub struct RowDescriptor {
    pub columns: Vec<(AttributeId, usize)>,
}

impl RowDescriptor {
    pub fn for_attrs(attrs: &[plan::Attribute]) -> Self {
        RowDescriptor {
            columns: attrs
                .iter()
                .enumerate()
                .map(|(at, attribute)| (attribute.id, at))
                .collect(),
        }
    }
}

/// Optional execution tracer; sites fire as the scheduler and operators
/// progress.
pub trait Tracer: Send + Sync {
    fn event(&self, site: &str, detail: &str);
}

struct Frame {
    id: u64,
    descriptor: Arc<RowDescriptor>,
    slot: RowSlot,
}

/// The row-context map: active scope frames plus a flat attribute index
/// maintained transactionally on every install/remove. Lookup probes the
/// index first (O(1)); when the indexed slot is installed but unset it
/// falls back to scanning active frames newest-to-oldest.
#[derive(Default)]
struct RowContext {
    frames: Vec<Frame>,
    index: HashMap<AttributeId, (RowSlot, usize)>,
}

impl RowContext {
    fn rebuild_index(&mut self) {
        self.index.clear();
        for frame in &self.frames {
            for &(attribute, column) in &frame.descriptor.columns {
                // Oldest-to-newest insertion: the newest frame wins.
                self.index
                    .insert(attribute, (frame.slot.clone(), column));
            }
        }
    }
}

/// The per-execution runtime context: database core, session, bound
/// parameters, the row-context map, ephemeral CTE tables, and the
/// optional tracer.
pub struct RuntimeCtx {
    pub core: Arc<DbCore>,
    pub session: Arc<SessionState>,
    pub params: HashMap<ParamKey, SqlValue>,
    row_ctx: Mutex<RowContext>,
    frame_ids: AtomicU64,
    ephemerals: Mutex<HashMap<CteId, EphemeralTable>>,
    pub tracer: Option<Arc<dyn Tracer>>,
    pub collect_metrics: bool,
}

impl RuntimeCtx {
    pub fn new(
        core: Arc<DbCore>,
        session: Arc<SessionState>,
        params: HashMap<ParamKey, SqlValue>,
    ) -> Arc<Self> {
        Arc::new(RuntimeCtx {
            core,
            session,
            params,
            row_ctx: Mutex::new(RowContext::default()),
            frame_ids: AtomicU64::new(0),
            ephemerals: Mutex::new(HashMap::new()),
            tracer: None,
            collect_metrics: false,
        })
    }

    /// Attach a tracer before execution starts.
    pub fn with_tracer(self: Arc<Self>, tracer: Arc<dyn Tracer>) -> Arc<Self> {
        let mut ctx = match Arc::try_unwrap(self) {
            Ok(ctx) => ctx,
            Err(shared) => {
                return shared;
            }
        };
        ctx.tracer = Some(tracer);
        Arc::new(ctx)
    }

    pub fn trace(&self, site: &str, detail: &str) {
        if let Some(tracer) = &self.tracer {
            tracer.event(site, detail);
        }
    }

    /// Install a scope frame: descriptor plus its row slot. Returns the
    /// frame id for removal.
    pub fn install_frame(&self, descriptor: Arc<RowDescriptor>, slot: RowSlot) -> u64 {
        let id = self.frame_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let mut row_ctx = self.row_ctx.lock().expect("row context poisoned");
        row_ctx.frames.push(Frame {
            id,
            descriptor,
            slot,
        });
        row_ctx.rebuild_index();
        id
    }

    pub fn remove_frame(&self, frame: u64) {
        let mut row_ctx = self.row_ctx.lock().expect("row context poisoned");
        row_ctx.frames.retain(|f| f.id != frame);
        row_ctx.rebuild_index();
    }

    /// Resolve one attribute against the active scope stack.
    pub fn attribute(&self, attribute: AttributeId) -> Result<SqlValue> {
        let row_ctx = self.row_ctx.lock().expect("row context poisoned");
        if let Some((slot, column)) = row_ctx.index.get(&attribute) {
            if let Some(row) = slot.get() {
                return row.get(*column).cloned().ok_or_else(|| {
                    Error::Internal(format!("attribute {attribute} maps past its row"))
                });
            }
        }
        // Indexed slot unset: fall back newest-to-oldest.
        for frame in row_ctx.frames.iter().rev() {
            if let Some(&(_, column)) = frame
                .descriptor
                .columns
                .iter()
                .find(|(id, _)| *id == attribute)
            {
                if let Some(row) = frame.slot.get() {
                    return row.get(column).cloned().ok_or_else(|| {
                        Error::Internal(format!("attribute {attribute} maps past its row"))
                    });
                }
            }
        }
        Err(Error::Internal(format!(
            "attribute {attribute} does not resolve in the active row context"
        )))
    }

    /// Run |body| with a one-shot frame installed; the frame is removed
    /// on every exit path.
    pub async fn with_row<T>(
        self: &Arc<Self>,
        descriptor: Arc<RowDescriptor>,
        row: Row,
        body: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let slot = RowSlot::new();
        slot.set(row);
        let guard = FrameGuard::install(self.clone(), descriptor, slot);
        let result = body.await;
        drop(guard);
        result
    }

    /// The ephemeral table backing one materialized CTE.
    pub fn ephemeral(&self, cte: CteId) -> EphemeralTable {
        self.ephemerals
            .lock()
            .expect("ephemerals poisoned")
            .entry(cte)
            .or_default()
            .clone()
    }

    /// The session's connection to |table|, opened lazily.
    pub fn connection(&self, table: &TableSchema) -> Result<Arc<dyn TableConnection>> {
        self.session.connection(&self.core, table)
    }
}

/// Removes its frame when dropped: the cancellation-safe teardown path
/// for streaming operators.
pub struct FrameGuard {
    ctx: Arc<RuntimeCtx>,
    frame: u64,
}

impl FrameGuard {
    pub fn install(ctx: Arc<RuntimeCtx>, descriptor: Arc<RowDescriptor>, slot: RowSlot) -> Self {
        let frame = ctx.install_frame(descriptor, slot);
        FrameGuard { ctx, frame }
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.ctx.remove_frame(self.frame);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use plan::{Attribute, ScalarTy};
    use values::row;

    fn attrs(ids: &[u32]) -> Vec<Attribute> {
        ids.iter()
            .map(|&id| Attribute {
                id: AttributeId(id),
                name: format!("a{id}"),
                ty: ScalarTy::default(),
            })
            .collect()
    }

    fn test_ctx() -> Arc<RuntimeCtx> {
        let core = crate::db::DbCore::for_tests();
        let session = Arc::new(crate::db::SessionState::new(1));
        RuntimeCtx::new(core, session, HashMap::new())
    }

    #[test]
    fn test_lookup_prefers_newest_frame() {
        let ctx = test_ctx();

        let outer = RowSlot::new();
        outer.set(row(vec![SqlValue::Integer(1)]));
        ctx.install_frame(
            Arc::new(RowDescriptor::for_attrs(&attrs(&[7]))),
            outer,
        );

        let inner = RowSlot::new();
        inner.set(row(vec![SqlValue::Integer(2)]));
        let inner_frame = ctx.install_frame(
            Arc::new(RowDescriptor::for_attrs(&attrs(&[7]))),
            inner,
        );

        assert_eq!(ctx.attribute(AttributeId(7)).unwrap(), SqlValue::Integer(2));

        // Removing the inner frame re-exposes the outer binding.
        ctx.remove_frame(inner_frame);
        assert_eq!(ctx.attribute(AttributeId(7)).unwrap(), SqlValue::Integer(1));
    }

    #[test]
    fn test_unset_slot_falls_back() {
        let ctx = test_ctx();

        let outer = RowSlot::new();
        outer.set(row(vec![SqlValue::text("outer")]));
        ctx.install_frame(
            Arc::new(RowDescriptor::for_attrs(&attrs(&[3]))),
            outer,
        );

        // Newest frame covers the same attribute but its slot is unset.
        let unset = RowSlot::new();
        ctx.install_frame(
            Arc::new(RowDescriptor::for_attrs(&attrs(&[3]))),
            unset,
        );

        assert_eq!(
            ctx.attribute(AttributeId(3)).unwrap(),
            SqlValue::text("outer")
        );
    }

    #[test]
    fn test_index_matches_brute_force() {
        // After arbitrary installs/removes, the indexed lookup equals a
        // newest-first scan for every attribute.
        let ctx = test_ctx();
        let mut frames = Vec::new();
        for round in 0..6u32 {
            let slot = RowSlot::new();
            slot.set(row(vec![SqlValue::Integer(round as i64); 3]));
            let ids: Vec<u32> = (round..round + 3).collect();
            frames.push(ctx.install_frame(
                Arc::new(RowDescriptor::for_attrs(&attrs(&ids))),
                slot,
            ));
        }
        ctx.remove_frame(frames[1]);
        ctx.remove_frame(frames[4]);

        for id in 0..9u32 {
            let indexed = ctx.attribute(AttributeId(id));
            let brute = {
                let row_ctx = ctx.row_ctx.lock().unwrap();
                row_ctx
                    .frames
                    .iter()
                    .rev()
                    .find_map(|frame| {
                        frame
                            .descriptor
                            .columns
                            .iter()
                            .find(|(a, _)| *a == AttributeId(id))
                            .and_then(|&(_, column)| {
                                frame.slot.get().map(|row| row[column].clone())
                            })
                    })
            };
            match (indexed, brute) {
                (Ok(a), Some(b)) => assert_eq!(a, b, "attribute {id}"),
                (Err(_), None) => {}
                (indexed, brute) => panic!("mismatch for {id}: {indexed:?} vs {brute:?}"),
            }
        }
    }
}
