// src/reconciler/mod.rs

//! Per-kind reconciliation logic.
//!
//! The controller only knows about the [`Reconciler`] trait. Concrete
//! reconcilers are registered per resource kind in a [`ReconcilerRegistry`]
//! and constructed lazily, once per kind per controller.
//!
//! - [`registry`] maps kinds to initializers.
//! - [`command`] is a shell-command reconciler used by the `resctl` binary.

pub mod command;
pub mod registry;

use std::fmt;

use chrono::{DateTime, Utc};

use crate::engine::ReconcileContext;
use crate::errors::{ControllerError, is_cancellation};
use crate::types::{BoxFuture, Resource, ResourceName};

pub use command::CommandReconciler;
pub use registry::{DuplicateKindError, ReconcilerInitializer, ReconcilerRegistry};

/// Outcome of a single `reconcile` call.
#[derive(Default)]
pub struct ReconcileResult {
    pub err: Option<anyhow::Error>,
    /// Ask to be reconciled again at this time.
    pub retrigger: Option<DateTime<Utc>>,
}

impl ReconcileResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self {
            err: Some(err.into()),
            retrigger: None,
        }
    }

    /// Result for a reconcile that stopped because it was cancelled.
    pub fn cancelled() -> Self {
        Self::failed(ControllerError::Cancelled)
    }

    pub fn retrigger_at(at: DateTime<Utc>) -> Self {
        Self {
            err: None,
            retrigger: Some(at),
        }
    }

    pub fn with_retrigger(mut self, at: DateTime<Utc>) -> Self {
        self.retrigger = Some(at);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.err.as_ref().is_some_and(is_cancellation)
    }
}

impl fmt::Debug for ReconcileResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcileResult")
            .field("err", &self.err.as_ref().map(|e| format!("{e:#}")))
            .field("retrigger", &self.retrigger)
            .finish()
    }
}

/// Logic that drives resources of one kind toward their desired state.
///
/// `reconcile` may run for a long time and must return promptly once
/// `ctx.cancelled()` fires. Catalog changes go through `ctx`.
pub trait Reconciler: Send + Sync {
    fn reconcile(&self, ctx: ReconcileContext, name: ResourceName) -> BoxFuture<'_, ReconcileResult>;

    /// Release anything held by the reconciler. Called once on shutdown.
    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Copy the desired spec from `from` onto `to`.
    fn assign_spec(&self, from: &Resource, to: &mut Resource) -> anyhow::Result<()> {
        to.spec = from.spec.clone();
        Ok(())
    }

    /// Copy the observed state from `from` onto `to`.
    fn assign_state(&self, from: &Resource, to: &mut Resource) -> anyhow::Result<()> {
        to.state = from.state.clone();
        Ok(())
    }
}
