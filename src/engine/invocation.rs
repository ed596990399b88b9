// src/engine/invocation.rs

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OwnedRwLockWriteGuard;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::engine::state::ControllerState;
use crate::types::ResourceName;

/// The part of an invocation shared with the running reconciler task.
///
/// Holds the cancellation token and, while the reconciler has called
/// `lock`, the controller state guard itself. Mutations issued through the
/// reconciler's context use that guard instead of locking again.
pub struct InvocationHandle {
    name: ResourceName,
    token: CancellationToken,
    held: Mutex<Option<OwnedRwLockWriteGuard<ControllerState>>>,
    /// Set while the lock is held or being acquired.
    locking: AtomicBool,
}

impl InvocationHandle {
    pub(crate) fn new(name: ResourceName) -> Self {
        Self {
            name,
            token: CancellationToken::new(),
            held: Mutex::new(None),
            locking: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True if this invocation reconciles `name`.
    pub fn is_for(&self, name: &ResourceName) -> bool {
        &self.name == name
    }

    pub(crate) fn held_lock(&self) -> MutexGuard<'_, Option<OwnedRwLockWriteGuard<ControllerState>>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn holds_lock(&self) -> bool {
        self.held_lock().is_some()
    }

    /// Reserve the lock for this invocation before waiting on the state
    /// lock. `None` if it is already held or another call is acquiring it.
    pub(crate) fn claim_lock(&self) -> Option<LockClaim<'_>> {
        if self.locking.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(LockClaim {
            handle: self,
            done: false,
        })
    }

    /// Drop the state guard if the reconciler still holds it.
    pub(crate) fn release_lock(&self) -> bool {
        let released = self.held_lock().take().is_some();
        if released {
            self.locking.store(false, Ordering::SeqCst);
        }
        released
    }
}

/// A pending `lock` call. Dropped without [`hold`](Self::hold) (the caller
/// gave up waiting), it frees the reservation again.
pub(crate) struct LockClaim<'a> {
    handle: &'a InvocationHandle,
    done: bool,
}

impl LockClaim<'_> {
    pub(crate) fn hold(mut self, guard: OwnedRwLockWriteGuard<ControllerState>) {
        *self.handle.held_lock() = Some(guard);
        self.done = true;
    }
}

impl Drop for LockClaim<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.handle.locking.store(false, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for InvocationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationHandle")
            .field("name", &self.name)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// A resource to revisit once an invocation completes, tagged with the spec
/// version it had when it was added.
#[derive(Debug, Clone)]
pub struct WaitlistEntry {
    pub name: ResourceName,
    pub spec_version: u64,
}

/// Controller-side bookkeeping for one running `reconcile` call.
#[derive(Debug)]
pub struct Invocation {
    pub handle: Arc<InvocationHandle>,
    pub is_hidden: bool,
    pub is_delete: bool,
    pub renamed_from: Option<ResourceName>,
    pub started_on: Instant,
    pub cancelled: bool,
    pub reschedule: bool,
    pub deleted_self: bool,
    pub waitlist: BTreeMap<String, WaitlistEntry>,
}

impl Invocation {
    pub fn new(
        handle: Arc<InvocationHandle>,
        is_hidden: bool,
        is_delete: bool,
        renamed_from: Option<ResourceName>,
    ) -> Self {
        Self {
            handle,
            is_hidden,
            is_delete,
            renamed_from,
            started_on: Instant::now(),
            cancelled: false,
            reschedule: false,
            deleted_self: false,
            waitlist: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &ResourceName {
        self.handle.name()
    }

    pub fn is_rename(&self) -> bool {
        self.renamed_from.is_some()
    }

    /// Cancel the reconciler. Repeated calls are fine; the invocation is
    /// rescheduled if any of them asked for it.
    pub fn cancel(&mut self, reschedule: bool) {
        if !self.cancelled {
            self.cancelled = true;
            self.handle.token.cancel();
        }
        self.reschedule = self.reschedule || reschedule;
    }

    pub fn add_to_waitlist(&mut self, name: &ResourceName, spec_version: u64) {
        self.waitlist.insert(
            name.key(),
            WaitlistEntry {
                name: name.clone(),
                spec_version,
            },
        );
    }
}
