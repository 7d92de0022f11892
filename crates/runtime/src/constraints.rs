//! The constraint engine's deferred half: a savepoint-aware queue of
//! CHECK evaluations that run at COMMIT, before the storage commit
//! finalizes. Immediate checks run inline in the mutation pipeline (see
//! the emitter).

use std::sync::{Arc, Mutex};

use values::Row;

use crate::db::{DbCore, SessionState};
use crate::{Callable, Error, Result, RowDescriptor, RowSlot, RuntimeCtx};

/// One queued deferred check: a defensive copy of the flat row, the
/// descriptor to install it under, the compiled evaluator, and enough
/// provenance to resolve the right connection at commit.
pub struct DeferredEntry {
    pub flat: Row,
    pub descriptor: Arc<RowDescriptor>,
    pub evaluator: Callable,
    pub constraint: String,
    pub connection_id: u64,
    pub table: String,
}

struct Bucket {
    savepoint: Option<u32>,
    entries: Vec<DeferredEntry>,
}

/// The per-database deferred queue: one active bucket plus a layer stack
/// mirroring savepoints.
#[derive(Default)]
pub struct DeferredQueue {
    buckets: Mutex<Vec<Bucket>>,
}

impl DeferredQueue {
    pub fn enqueue(&self, entry: DeferredEntry) {
        let mut buckets = self.lock();
        if buckets.is_empty() {
            buckets.push(Bucket {
                savepoint: None,
                entries: Vec::new(),
            });
        }
        buckets
            .last_mut()
            .expect("base bucket pushed above")
            .entries
            .push(entry);
    }

    pub fn begin_layer(&self, savepoint: u32) {
        self.lock().push(Bucket {
            savepoint: Some(savepoint),
            entries: Vec::new(),
        });
    }

    /// Drop the top layer and its entries.
    pub fn rollback_layer(&self) {
        self.lock().pop();
    }

    /// Drop every layer above the one tagged |savepoint|, and that
    /// layer's entries too; the layer itself stays open for new entries.
    pub fn rollback_to(&self, savepoint: u32) {
        let mut buckets = self.lock();
        while let Some(top) = buckets.last() {
            match top.savepoint {
                Some(tag) if tag == savepoint => {
                    buckets.pop();
                    break;
                }
                Some(_) => {
                    buckets.pop();
                }
                None => break,
            }
        }
        buckets.push(Bucket {
            savepoint: Some(savepoint),
            entries: Vec::new(),
        });
    }

    /// Merge the layer tagged |savepoint| into the one beneath it.
    pub fn release_layer(&self, savepoint: u32) {
        let mut buckets = self.lock();
        let Some(at) = buckets
            .iter()
            .rposition(|bucket| bucket.savepoint == Some(savepoint))
        else {
            return;
        };
        let released = buckets.remove(at);
        match buckets.get_mut(at.saturating_sub(1)) {
            Some(below) if at > 0 => below.entries.extend(released.entries),
            _ => {
                // Released past the base: re-seat the entries there.
                if buckets.is_empty() {
                    buckets.push(Bucket {
                        savepoint: None,
                        entries: Vec::new(),
                    });
                }
                buckets[0].entries.extend(released.entries);
            }
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().iter().map(|bucket| bucket.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluate every queued entry under a synthesized runtime context.
    /// A false or zero verdict aborts the commit with the constraint's
    /// name; Null and other values pass.
    pub async fn run_deferred(
        &self,
        core: &Arc<DbCore>,
        session: &Arc<SessionState>,
    ) -> Result<()> {
        // Clone the snapshot out so evaluation never holds the lock.
        let entries: Vec<(Row, Arc<RowDescriptor>, Callable, String, u64, String)> = {
            self.lock()
                .iter()
                .flat_map(|bucket| &bucket.entries)
                .map(|entry| {
                    (
                        entry.flat.clone(),
                        entry.descriptor.clone(),
                        entry.evaluator.clone(),
                        entry.constraint.clone(),
                        entry.connection_id,
                        entry.table.clone(),
                    )
                })
                .collect()
        };

        for (flat, descriptor, evaluator, constraint, connection_id, table) in entries {
            resolve_context(session, connection_id, &table)?;
            let ctx = RuntimeCtx::new(core.clone(), session.clone(), Default::default());
            let slot = RowSlot::new();
            slot.set(flat);
            let frame = ctx.install_frame(descriptor, slot);
            let verdict = evaluator(ctx.clone()).await;
            ctx.remove_frame(frame);

            match verdict?.is_truthy() {
                Some(false) => {
                    return Err(Error::Constraint {
                        constraint,
                        message: "deferred CHECK failed at commit".into(),
                    })
                }
                // Null and truthy values pass.
                _ => {}
            }
        }
        Ok(())
    }
}

impl DeferredQueue {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Bucket>> {
        self.buckets.lock().expect("deferred queue poisoned")
    }
}

/// The active-connection lookup at commit: prefer the exact connection
/// id, fall back to a table-name match within the committing session.
fn resolve_context(session: &Arc<SessionState>, connection_id: u64, table: &str) -> Result<()> {
    if session.connection_id == connection_id {
        return Ok(());
    }
    if session.has_connection_to(table) {
        return Ok(());
    }
    Err(Error::Internal(format!(
        "deferred constraint for connection {connection_id} on {table} has no resolvable context"
    )))
}
