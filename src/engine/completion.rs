// src/engine/completion.rs

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::engine::invocation::InvocationHandle;
use crate::engine::state::ControllerState;
use crate::errors::Result;
use crate::reconciler::ReconcileResult;
use crate::types::ReconcileStatus;

/// A finished reconcile call, sent from the invocation task to the loop.
#[derive(Debug)]
pub struct Completion {
    pub handle: Arc<InvocationHandle>,
    pub result: ReconcileResult,
}

impl ControllerState {
    /// Record the result of a finished invocation and enqueue whatever it
    /// unblocks: itself if rescheduled, otherwise its DAG children, plus
    /// every still-current waitlist entry.
    pub(crate) fn process_completed(&mut self, completion: Completion) -> Result<()> {
        let Completion { handle, result } = completion;
        let name = handle.name().clone();

        // Must leave `invocations` before anything can fail, or shutdown
        // would wait on it forever.
        let Some(mut inv) = self.invocations.remove(&name.key()) else {
            warn!(%name, "completion for unknown invocation");
            return Ok(());
        };
        if !Arc::ptr_eq(&inv.handle, &handle) {
            // Not ours; put it back.
            warn!(%name, "completion does not match the running invocation");
            self.invocations.insert(name.key(), inv);
            return Ok(());
        }

        let elapsed_ms = inv.started_on.elapsed().as_millis() as u64;
        let is_cancellation = result.is_cancelled();
        let error_msg = result
            .err
            .as_ref()
            .filter(|_| !is_cancellation)
            .map(|e| format!("{e:#}"));
        let mut retrigger = result.retrigger;

        match &error_msg {
            Some(err) => error!(
                name = %name.name,
                kind = %name.kind,
                elapsed_ms,
                retrigger_on = ?retrigger,
                cancelled = inv.cancelled,
                error = %err,
                "Reconcile failed"
            ),
            None if !inv.is_hidden => info!(
                name = %name.name,
                kind = %name.kind,
                elapsed_ms,
                retrigger_on = ?retrigger,
                cancelled = inv.cancelled,
                "Reconciled resource"
            ),
            None => {}
        }

        // The resource may be gone: self-deletes are hard deletes, and a
        // rename moves it to another name.
        let mut current = match self.catalog.get(&name, true) {
            Ok(r) => Some((r.is_deleted(), r.meta.renamed_from.is_some())),
            Err(e) if e.is_not_found() => {
                if !inv.deleted_self {
                    debug!(%name, "resource no longer exists after reconcile");
                }
                None
            }
            Err(e) => return Err(e),
        };

        if inv.is_delete {
            // It may have been re-created meanwhile, or the delete cancelled.
            if matches!(current, Some((true, _))) && !inv.cancelled {
                if let Some(err) = &error_msg {
                    error!(%name, error = %err, "got error while deleting resource");
                }
                self.catalog.delete(&name)?;
                current = None;
            }
            if !self.catalog.has_deleted() {
                self.set_queue_updated();
            }
        }

        if inv.is_rename() {
            if matches!(current, Some((_, true))) && !inv.cancelled {
                self.catalog.clear_renamed_from(&name)?;
            }
            if !self.catalog.has_renamed() {
                self.set_queue_updated();
            }
        }

        if current.is_some() {
            if let Some(at) = retrigger {
                if at > Utc::now() {
                    self.timeline.set(&name, at);
                } else {
                    inv.reschedule = true;
                    retrigger = None;
                }
            }

            self.catalog
                .update_status(&name, ReconcileStatus::Idle, retrigger)?;
            self.catalog.update_error(&name, error_msg)?;

            if inv.reschedule {
                self.enqueue(&name);
            }
        }

        // Stale entries were re-enqueued by whatever changed their spec.
        for entry in inv.waitlist.values() {
            let spec_version = match self.catalog.get(&entry.name, true) {
                Ok(w) => w.meta.spec_version,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if spec_version == entry.spec_version {
                self.enqueue(&entry.name);
            }
        }

        // Children were blocked on this one. Not needed after a reschedule
        // (they stay blocked) or a delete (enqueued when it was deleted).
        if !inv.reschedule && matches!(current, Some((false, _))) && !self.catalog.is_cyclic(&name) {
            for child in self.catalog.children(&name) {
                self.enqueue(&child);
            }
        }

        Ok(())
    }
}
