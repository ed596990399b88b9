// src/engine/scheduler.rs

//! Queue processing: mark everything affected as pending, then invoke what
//! can run now.
//!
//! Scheduling relies on one invariant established by [`mark_pending`]: when
//! a resource is pending, so is every resource that (transitively) refs it.
//! `try_schedule` therefore only has to look at immediate parents.
//!
//! [`mark_pending`]: ControllerState::mark_pending

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::engine::invocation::{Invocation, InvocationHandle};
use crate::engine::state::ControllerState;
use crate::errors::{ControllerError, Result};
use crate::types::{ReconcileStatus, ResourceName};

/// A reconcile call decided by `process_queue`, to be spawned by the loop.
#[derive(Debug, Clone)]
pub struct Launch {
    pub handle: Arc<InvocationHandle>,
    pub is_delete: bool,
    pub renamed_from: Option<ResourceName>,
}

impl Launch {
    pub fn name(&self) -> &ResourceName {
        self.handle.name()
    }
}

/// What `try_schedule` decided for one queued resource.
enum Schedule {
    /// Invoked now.
    Invoked(Launch),
    /// Nothing to do now; something else re-enqueues it when needed.
    Dropped,
    /// Leave it on the queue for the next pass.
    Deferred,
}

impl ControllerState {
    /// Run one mark/sweep pass over the queue and return the invocations to
    /// start.
    pub(crate) fn process_queue(&mut self) -> Result<Vec<Launch>> {
        self.pass += 1;
        let pass = self.pass;

        // Phase 1: mark pending, trimming what can't run yet.
        let snapshot: Vec<(String, ResourceName)> = self
            .queue
            .iter()
            .map(|(k, n)| (k.clone(), n.clone()))
            .collect();
        for (key, name) in snapshot {
            if self.mark_pending(&name)? {
                self.queue.remove(&key);
            }
        }

        // Phase 2: schedule what remains.
        let mut launches = Vec::new();
        let mut deferred = 0usize;
        let snapshot: Vec<(String, ResourceName)> = self
            .queue
            .iter()
            .map(|(k, n)| (k.clone(), n.clone()))
            .collect();
        for (key, name) in snapshot {
            match self.try_schedule(&name)? {
                Schedule::Invoked(launch) => {
                    self.queue.remove(&key);
                    launches.push(launch);
                }
                Schedule::Dropped => {
                    self.queue.remove(&key);
                }
                Schedule::Deferred => deferred += 1,
            }
        }

        self.reset_queue_updated();

        debug!(
            pass,
            invoked = launches.len(),
            deferred,
            running = self.invocations.len(),
            "processed queue"
        );
        Ok(launches)
    }

    /// Mark `name` and its descendants pending.
    ///
    /// Returns `true` if `name` should leave the queue because it can't be
    /// scheduled and will be enqueued again later (or no longer exists).
    pub(crate) fn mark_pending(&mut self, name: &ResourceName) -> Result<bool> {
        self.timeline.remove(name);

        let (is_deleted, is_hidden, spec_version) = match self.catalog.get(name, true) {
            Ok(r) => (r.is_deleted(), r.meta.hidden, r.meta.spec_version),
            Err(e) if e.is_not_found() => return Ok(true),
            Err(e) => return Err(e),
        };

        // Already running: its descendants are pending already. Cancel and
        // let completion put it back on the queue.
        if let Some(inv) = self.invocations.get_mut(&name.key()) {
            inv.cancel(true);
            return Ok(true);
        }

        self.catalog.update_error(name, None)?;
        self.catalog
            .update_status(name, ReconcileStatus::Pending, None)?;

        // Deleted resources are not in the DAG.
        if is_deleted {
            return Ok(false);
        }

        if self.catalog.is_cyclic(name) {
            let err = ControllerError::CyclicDependency;
            self.catalog.update_error(name, Some(err.to_string()))?;
            self.catalog.update_status(name, ReconcileStatus::Idle, None)?;
            if !is_hidden {
                error!(name = %name.name, kind = %name.kind, error = %err, "Skipping resource");
            }
            return Ok(true);
        }

        let mut descendant_running = false;
        let mut stack: Vec<ResourceName> = self.catalog.children(name);
        let mut visited: HashSet<String> = HashSet::new();

        while let Some(d) = stack.pop() {
            if !visited.insert(d.key()) {
                continue;
            }

            let status = self
                .catalog
                .get(&d, true)
                .map_err(|e| ControllerError::Internal(format!("error getting dag node {d}: {e}")))?
                .meta
                .reconcile_status;

            match status {
                ReconcileStatus::Idle => {
                    self.catalog.update_error(&d, None)?;
                    self.catalog.update_status(&d, ReconcileStatus::Pending, None)?;
                }
                ReconcileStatus::Pending => {
                    // Its descendants are pending too; only keep walking to
                    // look for running ones.
                    if descendant_running {
                        continue;
                    }
                }
                ReconcileStatus::Running => {
                    let Some(inv) = self.invocations.get_mut(&d.key()) else {
                        return Err(ControllerError::Internal(format!(
                            "no invocation found for resource {d} with status running"
                        )));
                    };
                    // Goes idle, then `name` is revisited from the waitlist.
                    inv.cancel(false);
                    inv.add_to_waitlist(name, spec_version);
                    descendant_running = true;
                    continue;
                }
            }

            stack.extend(self.catalog.children(&d));
        }

        Ok(descendant_running)
    }

    fn try_schedule(&mut self, name: &ResourceName) -> Result<Schedule> {
        let r = match self.catalog.get(name, true) {
            Ok(r) => r,
            Err(e) if e.is_not_found() => return Ok(Schedule::Dropped),
            Err(e) => return Err(e),
        };
        let is_deleted = r.is_deleted();
        let is_renamed = r.meta.renamed_from.is_some();

        if !is_deleted {
            for p in self.catalog.parents(name) {
                let parent = self.catalog.get(&p, false).map_err(|e| {
                    ControllerError::Internal(format!("error getting present parent {p}: {e}"))
                })?;
                // The parent's completion enqueues its children.
                if parent.meta.reconcile_status != ReconcileStatus::Idle {
                    return Ok(Schedule::Dropped);
                }
            }

            // Deletes run before renames, renames before everything else.
            if self.catalog.has_deleted() {
                return Ok(Schedule::Deferred);
            }
            if !is_renamed && self.catalog.has_renamed() {
                return Ok(Schedule::Deferred);
            }
        }

        self.invoke(name).map(Schedule::Invoked)
    }

    /// Mark `name` running and track a new invocation for it.
    fn invoke(&mut self, name: &ResourceName) -> Result<Launch> {
        self.catalog
            .update_status(name, ReconcileStatus::Running, None)
            .map_err(|e| ControllerError::Internal(format!("error updating dag node {name}: {e}")))?;

        let r = self.catalog.get(name, true)?;
        let is_hidden = r.meta.hidden;
        let is_delete = r.is_deleted();
        let renamed_from = r.meta.renamed_from.clone();

        let handle = Arc::new(InvocationHandle::new(name.clone()));
        let inv = Invocation::new(handle.clone(), is_hidden, is_delete, renamed_from.clone());
        self.invocations.insert(name.key(), inv);

        if !is_hidden {
            match (&renamed_from, is_delete) {
                (_, true) => info!(name = %name.name, kind = %name.kind, deleted = true, "Reconciling resource"),
                (Some(from), false) => info!(
                    name = %name.name,
                    kind = %name.kind,
                    renamed_from = %from.name,
                    "Reconciling resource"
                ),
                (None, false) => info!(name = %name.name, kind = %name.kind, "Reconciling resource"),
            }
        }

        Ok(Launch {
            handle,
            is_delete,
            renamed_from,
        })
    }
}
