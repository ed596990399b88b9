// src/engine/context.rs

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::engine::controller::Controller;
use crate::engine::invocation::InvocationHandle;
use crate::errors::{ControllerError, Result};
use crate::types::{MetaUpdate, Resource, ResourceName};

/// What a reconciler gets to talk to the controller during one invocation.
///
/// Every call is made on behalf of the invocation, which is how the
/// controller knows whether a change comes from the resource's own
/// reconciler and whether the caller already holds the state lock.
///
/// Except for [`update_state`](Self::update_state), calls fail with
/// [`ControllerError::Cancelled`] once the invocation has been cancelled.
#[derive(Clone)]
pub struct ReconcileContext {
    controller: Controller,
    invocation: Arc<InvocationHandle>,
}

impl fmt::Debug for ReconcileContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcileContext")
            .field("invocation", &self.invocation)
            .finish_non_exhaustive()
    }
}

impl ReconcileContext {
    pub(crate) fn new(controller: Controller, invocation: Arc<InvocationHandle>) -> Self {
        Self {
            controller,
            invocation,
        }
    }

    /// The resource being reconciled.
    pub fn name(&self) -> &ResourceName {
        self.invocation.name()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.invocation.token().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.invocation.is_cancelled()
    }

    /// Resolves once the invocation is cancelled.
    pub async fn cancelled(&self) {
        self.invocation.token().cancelled().await
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.invocation.is_cancelled() {
            return Err(ControllerError::Cancelled);
        }
        Ok(())
    }

    fn caller(&self) -> Option<&InvocationHandle> {
        Some(self.invocation.as_ref())
    }

    /// Like [`Controller::get`], but the resource's own reconciler also sees
    /// it while it is being deleted.
    pub async fn get(&self, name: &ResourceName) -> Result<Resource> {
        self.check_cancelled()?;
        let include_deleted = self.invocation.is_for(name);
        self.controller
            .read_state(self.caller(), |s| {
                s.catalog.get(name, include_deleted).cloned()
            })
            .await
    }

    pub async fn list(&self, kind: Option<&str>) -> Result<Vec<Resource>> {
        self.check_cancelled()?;
        self.controller
            .read_state(self.caller(), |s| Ok(s.catalog.list(kind, false)))
            .await
    }

    pub async fn create(
        &self,
        name: &ResourceName,
        meta: MetaUpdate,
        hidden: bool,
        spec: Value,
    ) -> Result<()> {
        self.check_cancelled()?;
        self.controller
            .write_state(self.caller(), |s| s.create(name, meta, hidden, spec))
            .await
    }

    pub async fn update_meta(&self, name: &ResourceName, meta: MetaUpdate) -> Result<()> {
        self.check_cancelled()?;
        let caller = self.caller();
        self.controller
            .write_state(caller, |s| s.update_meta(caller, name, meta))
            .await
    }

    pub async fn update_name(
        &self,
        name: &ResourceName,
        new_name: &ResourceName,
        owner: Option<ResourceName>,
        file_paths: Vec<String>,
    ) -> Result<()> {
        self.check_cancelled()?;
        let caller = self.caller();
        self.controller
            .write_state(caller, |s| {
                s.update_name(caller, name, new_name, owner, file_paths)
            })
            .await
    }

    pub async fn update_spec(&self, name: &ResourceName, spec: Value) -> Result<()> {
        self.check_cancelled()?;
        let reconciler = self.controller.reconciler(&name.kind)?;
        let caller = self.caller();
        self.controller
            .write_state(caller, |s| {
                s.update_spec(caller, reconciler.as_ref(), name, spec)
            })
            .await
    }

    /// Persist the observed state of the resource being reconciled. Allowed
    /// after cancellation so a reconciler can record partial progress.
    pub async fn update_state(&self, state: Value) -> Result<()> {
        let name = self.invocation.name().clone();
        let reconciler = self.controller.reconciler(&name.kind)?;
        let caller = self.caller();
        self.controller
            .write_state(caller, |s| {
                s.update_state(caller, reconciler.as_ref(), &name, state)
            })
            .await
    }

    pub async fn update_error(&self, name: &ResourceName, error: Option<String>) -> Result<()> {
        self.check_cancelled()?;
        self.controller
            .write_state(self.caller(), |s| s.update_error(name, error))
            .await
    }

    /// Deleting the resource being reconciled removes it immediately and
    /// cancels this invocation.
    pub async fn delete(&self, name: &ResourceName) -> Result<()> {
        self.check_cancelled()?;
        let caller = self.caller();
        self.controller
            .write_state(caller, |s| s.delete(caller, name))
            .await
    }

    pub async fn reconcile(&self, name: &ResourceName) -> Result<()> {
        self.check_cancelled()?;
        self.controller
            .write_state(self.caller(), |s| {
                s.enqueue(name);
                Ok(())
            })
            .await
    }

    pub async fn cancel(&self, name: &ResourceName) -> Result<()> {
        self.check_cancelled()?;
        self.controller
            .write_state(self.caller(), |s| {
                s.cancel_if_running(name, false);
                Ok(())
            })
            .await
    }

    /// Take the controller's state lock. No scheduling happens and no other
    /// caller can touch the catalog until [`unlock`](Self::unlock); calls
    /// made through this context keep working.
    pub async fn lock(&self) -> Result<()> {
        self.controller.check_running()?;
        let Some(claim) = self.invocation.claim_lock() else {
            return Err(ControllerError::LockAlreadyHeld);
        };
        let guard = self.controller.state_lock().write_owned().await;
        claim.hold(guard);
        Ok(())
    }

    pub fn unlock(&self) -> Result<()> {
        if self.invocation.release_lock() {
            Ok(())
        } else {
            Err(ControllerError::LockNotHeld)
        }
    }

    pub fn holds_lock(&self) -> bool {
        self.invocation.holds_lock()
    }
}
