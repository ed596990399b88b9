// src/engine/mutations.rs

//! Catalog mutations issued by external callers and by reconcilers.
//!
//! `caller` is the invocation issuing the call when it comes from a
//! reconciler. A reconciler mutating its own resource does not cancel
//! itself and is the only one allowed to update that resource's state.
//!
//! Renames interact badly with concurrent changes, so two helpers turn
//! risky renames into delete+create pairs, which is safe because deletes
//! are always scheduled before anything else:
//! - `safe_mutate_renamed`: mutating a resource whose rename hasn't been
//!   reconciled yet.
//! - `safe_rename`: renaming onto a name another in-flight rename just left
//!   (A -> B while B -> C).

use serde_json::Value;
use tracing::debug;

use crate::engine::invocation::InvocationHandle;
use crate::engine::state::ControllerState;
use crate::errors::{ControllerError, Result};
use crate::reconciler::Reconciler;
use crate::types::{MetaUpdate, Resource, ResourceName};

fn is_reconciler_for(caller: Option<&InvocationHandle>, name: &ResourceName) -> bool {
    caller.is_some_and(|c| c.is_for(name))
}

impl ControllerState {
    /// Create a resource and enqueue it. If a deleted resource with the same
    /// name is still being reconciled, that invocation is cancelled and
    /// rescheduled instead.
    pub(crate) fn create(
        &mut self,
        name: &ResourceName,
        meta: MetaUpdate,
        hidden: bool,
        spec: Value,
    ) -> Result<()> {
        let mut requeued = false;
        if let Some(inv) = self.invocations.get_mut(&name.key()) {
            if !inv.deleted_self {
                let existing = self.catalog.get(name, true).map_err(|e| {
                    ControllerError::Internal(format!(
                        "got catalog error for reconciling resource: {e}"
                    ))
                })?;
                if !existing.is_deleted() {
                    return Err(ControllerError::ResourceAlreadyExists(name.clone()));
                }
                inv.cancel(true);
                requeued = true;
            }
        }

        self.catalog.create(name, meta, hidden, spec)?;

        if !requeued {
            self.enqueue(name);
        }
        Ok(())
    }

    pub(crate) fn update_meta(
        &mut self,
        caller: Option<&InvocationHandle>,
        name: &ResourceName,
        meta: MetaUpdate,
    ) -> Result<()> {
        if !is_reconciler_for(caller, name) {
            self.cancel_if_running(name, false);
            self.enqueue(name);
        }

        self.safe_mutate_renamed(name)?;
        self.catalog.update_meta(name, meta)?;

        // New refs may break an earlier cycle.
        self.enqueue_uncycled();
        Ok(())
    }

    pub(crate) fn update_name(
        &mut self,
        caller: Option<&InvocationHandle>,
        name: &ResourceName,
        new_name: &ResourceName,
        owner: Option<ResourceName>,
        file_paths: Vec<String>,
    ) -> Result<()> {
        if !is_reconciler_for(caller, name) {
            self.cancel_if_running(name, false);
            self.enqueue(name);
        }

        let refs = self.catalog.get(name, false)?.meta.refs.clone();

        // Children now point at a missing resource.
        if !self.catalog.is_cyclic(name) {
            for child in self.catalog.children(name) {
                self.enqueue(&child);
            }
        }

        self.safe_rename(name, new_name)?;
        self.enqueue(new_name);

        self.catalog.update_meta(
            new_name,
            MetaUpdate {
                refs,
                owner,
                file_paths,
            },
        )?;

        self.enqueue_uncycled();
        Ok(())
    }

    pub(crate) fn update_spec(
        &mut self,
        caller: Option<&InvocationHandle>,
        reconciler: &dyn Reconciler,
        name: &ResourceName,
        spec: Value,
    ) -> Result<()> {
        if !is_reconciler_for(caller, name) {
            self.cancel_if_running(name, false);
            self.enqueue(name);
        }

        self.safe_mutate_renamed(name)?;

        let existing = self.catalog.get(name, false)?;
        let mut from = existing.clone();
        from.spec = spec;
        let mut to = existing.clone();
        reconciler.assign_spec(&from, &mut to)?;

        self.catalog.update_spec(name, to.spec)
    }

    /// Only the resource's own reconciler may update its state. Works even
    /// after the invocation was cancelled so partial progress is kept.
    pub(crate) fn update_state(
        &mut self,
        caller: Option<&InvocationHandle>,
        reconciler: &dyn Reconciler,
        name: &ResourceName,
        state: Value,
    ) -> Result<()> {
        if !is_reconciler_for(caller, name) {
            return Err(ControllerError::StateUpdateOutsideReconciler);
        }

        let existing = self.catalog.get(name, true)?;
        let mut from = existing.clone();
        from.state = state;
        let mut to = existing.clone();
        reconciler.assign_state(&from, &mut to)?;

        self.catalog.update_state(name, to.state)
    }

    /// Does not cancel or enqueue anything.
    pub(crate) fn update_error(&mut self, name: &ResourceName, error: Option<String>) -> Result<()> {
        self.catalog.update_error(name, error)
    }

    /// Soft-delete and enqueue the deleting reconcile. From the resource's
    /// own reconciler this is an immediate hard delete instead.
    pub(crate) fn delete(
        &mut self,
        caller: Option<&InvocationHandle>,
        name: &ResourceName,
    ) -> Result<()> {
        self.cancel_if_running(name, false);

        self.catalog.get(name, false)?;

        if !self.catalog.is_cyclic(name) {
            for child in self.catalog.children(name) {
                self.enqueue(&child);
            }
        }

        if is_reconciler_for(caller, name) {
            if let Some(inv) = self.invocations.get_mut(&name.key()) {
                inv.deleted_self = true;
            }
            self.catalog.delete(name)?;
        } else {
            // A resource is never both deleted and renamed.
            self.catalog.clear_renamed_from(name)?;
            self.catalog.update_deleted(name)?;
            self.enqueue(name);
        }

        self.enqueue_uncycled();
        Ok(())
    }

    fn enqueue_uncycled(&mut self) {
        for name in self.catalog.retry_cyclic_refs() {
            self.enqueue(&name);
        }
    }

    /// If `name` is mid-rename, turn the rename into a delete of the old
    /// name plus the (already applied) create of the new one.
    fn safe_mutate_renamed(&mut self, name: &ResourceName) -> Result<()> {
        let r = match self.catalog.get(name, true) {
            Ok(r) => r,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let Some(renamed_from) = r.meta.renamed_from.clone() else {
            return Ok(());
        };
        let copy: Resource = r.clone();

        self.catalog.clear_renamed_from(name)?;

        // Something already lives at the old name again; nothing to delete.
        if self.catalog.contains(&renamed_from) {
            return Ok(());
        }

        debug!(%name, %renamed_from, "converting in-flight rename to delete");
        self.catalog.create_copy(&renamed_from, &copy)?;
        self.catalog.update_deleted(&renamed_from)?;
        self.enqueue(&renamed_from);
        Ok(())
    }

    fn safe_rename(&mut self, from: &ResourceName, to: &ResourceName) -> Result<()> {
        if from == to {
            return Ok(());
        }

        let mut collision = false;
        for n in self.catalog.renamed() {
            let r = self.catalog.get(&n, true).map_err(|e| {
                ControllerError::Internal(format!("failed to get renamed resource {n}: {e}"))
            })?;
            if r.meta.renamed_from.as_ref() == Some(to) {
                collision = true;
                break;
            }
        }

        if !collision {
            return self.catalog.rename(from, to);
        }

        // The caller enqueues `to`.
        debug!(%from, %to, "rename collides with another rename; using delete+create");
        let r = self.catalog.get(from, true)?.clone();
        self.catalog.create_copy(to, &r)?;
        self.catalog.update_deleted(from)?;
        self.enqueue(from);
        Ok(())
    }
}
