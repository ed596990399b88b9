// src/engine/controller.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, Notify, RwLock, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::catalog::{Catalog, CatalogStore};
use crate::config::ControllerConfig;
use crate::engine::completion::Completion;
use crate::engine::invocation::InvocationHandle;
use crate::engine::state::ControllerState;
use crate::errors::{ControllerError, Result};
use crate::reconciler::{Reconciler, ReconcilerRegistry};
use crate::types::{MetaUpdate, Resource, ResourceEvent, ResourceName};

pub(crate) struct Shared {
    pub(crate) config: ControllerConfig,
    registry: ReconcilerRegistry,
    pub(crate) store: Arc<dyn CatalogStore>,
    pub(crate) state: Arc<RwLock<ControllerState>>,
    pub(crate) reconcilers: Mutex<HashMap<String, Arc<dyn Reconciler>>>,
    pub(crate) queue_notify: Arc<Notify>,
    pub(crate) events_notify: Arc<Notify>,
    pub(crate) started: AtomicBool,
    pub(crate) running: AtomicBool,
    pub(crate) ready: CancellationToken,
    pub(crate) closed: CancellationToken,
    pub(crate) init_err: Mutex<Option<String>>,
    pub(crate) completed_tx: mpsc::Sender<Completion>,
    pub(crate) completed_rx: Mutex<Option<mpsc::Receiver<Completion>>>,
    /// Held from taking a flush batch until the store has written it, so
    /// batches reach the store in the order they were taken.
    flush_gate: AsyncMutex<()>,
}

/// Drives every resource in the catalog toward its desired state by running
/// the reconciler registered for its kind.
///
/// Cheap to clone; all clones share the same controller. The event loop is
/// started with [`run`](Controller::run) and the rest of the API is only
/// usable while it is running.
#[derive(Clone)]
pub struct Controller {
    pub(crate) shared: Arc<Shared>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Load the catalog from `store` and build a controller around it.
    pub async fn open(
        config: ControllerConfig,
        registry: ReconcilerRegistry,
        store: Arc<dyn CatalogStore>,
    ) -> Result<Self> {
        let resources = store.load().await?;
        let catalog = Catalog::from_resources(resources);
        let events_notify = catalog.events_notify();

        let queue_notify = Arc::new(Notify::new());
        let state = ControllerState::new(catalog, queue_notify.clone());
        let (completed_tx, completed_rx) = mpsc::channel(config.completion_buffer.max(1));

        debug!(kinds = ?registry.kinds(), "controller opened");

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                registry,
                store,
                state: Arc::new(RwLock::new(state)),
                reconcilers: Mutex::new(HashMap::new()),
                queue_notify,
                events_notify,
                started: AtomicBool::new(false),
                running: AtomicBool::new(false),
                ready: CancellationToken::new(),
                closed: CancellationToken::new(),
                init_err: Mutex::new(None),
                completed_tx,
                completed_rx: Mutex::new(Some(completed_rx)),
                flush_gate: AsyncMutex::new(()),
            }),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub(crate) fn check_running(&self) -> Result<()> {
        if !self.is_running() {
            return Err(ControllerError::NotRunning);
        }
        Ok(())
    }

    pub(crate) fn state_lock(&self) -> Arc<RwLock<ControllerState>> {
        self.shared.state.clone()
    }

    /// Reconciler for `kind`, constructed on first use.
    pub(crate) fn reconciler(&self, kind: &str) -> Result<Arc<dyn Reconciler>> {
        if let Some(r) = self.reconcilers().get(kind) {
            return Ok(r.clone());
        }

        let init = self
            .shared
            .registry
            .get(kind)
            .ok_or_else(|| ControllerError::UnknownKind(kind.to_string()))?;
        // Built without holding the map lock; first insert wins.
        let built = init(self);

        let mut map = self.reconcilers();
        Ok(map.entry(kind.to_string()).or_insert(built).clone())
    }

    pub(crate) fn reconcilers(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn Reconciler>>> {
        self.shared
            .reconcilers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to the state. An invocation holding the
    /// lock through `ReconcileContext::lock` reuses its guard.
    pub(crate) async fn write_state<T>(
        &self,
        caller: Option<&InvocationHandle>,
        f: impl FnOnce(&mut ControllerState) -> Result<T>,
    ) -> Result<T> {
        self.check_running()?;
        if let Some(inv) = caller {
            let mut held = inv.held_lock();
            if let Some(guard) = held.as_mut() {
                return f(&mut **guard);
            }
        }
        let mut state = self.shared.state.write().await;
        f(&mut *state)
    }

    pub(crate) async fn read_state<T>(
        &self,
        caller: Option<&InvocationHandle>,
        f: impl FnOnce(&ControllerState) -> Result<T>,
    ) -> Result<T> {
        self.check_running()?;
        if let Some(inv) = caller {
            let held = inv.held_lock();
            if let Some(guard) = held.as_ref() {
                return f(&**guard);
            }
        }
        let state = self.shared.state.read().await;
        f(&*state)
    }

    /// Resolves once the event loop is running, or fails if it could not
    /// start.
    pub async fn wait_until_ready(&self) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.shared.ready.cancelled() => Ok(()),
            _ = self.shared.closed.cancelled() => {
                let init_err = self
                    .shared
                    .init_err
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match init_err {
                    Some(msg) => Err(ControllerError::Internal(format!(
                        "controller failed to start: {msg}"
                    ))),
                    None => Err(ControllerError::Closed),
                }
            }
        }
    }

    /// Resolves when nothing is queued or running. With `ignore_hidden`,
    /// running invocations of hidden resources don't count. Also resolves
    /// when the controller shuts down.
    pub async fn wait_until_idle(&self, ignore_hidden: bool) -> Result<()> {
        self.check_running()?;
        let (tx, rx) = oneshot::channel();
        self.shared
            .state
            .write()
            .await
            .add_idle_wait(tx, ignore_hidden);

        tokio::select! {
            _ = rx => Ok(()),
            _ = self.shared.closed.cancelled() => Ok(()),
        }
    }

    /// Soft-deleted resources are not returned.
    pub async fn get(&self, name: &ResourceName) -> Result<Resource> {
        self.read_state(None, |s| s.catalog.get(name, false).cloned())
            .await
    }

    /// All live resources, or those of one kind.
    pub async fn list(&self, kind: Option<&str>) -> Result<Vec<Resource>> {
        self.read_state(None, |s| Ok(s.catalog.list(kind, false)))
            .await
    }

    /// Deliver catalog events to `callback` until `token` is cancelled.
    ///
    /// Events are batched per event loop iteration; within a batch a
    /// resource appears at most once with its latest change.
    pub async fn subscribe<F>(&self, token: CancellationToken, mut callback: F) -> Result<()>
    where
        F: FnMut(ResourceEvent, &ResourceName, Option<&Resource>) + Send,
    {
        self.check_running()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = self.shared.state.write().await.add_subscriber(tx);

        let res = loop {
            tokio::select! {
                batch = rx.recv() => match batch {
                    Some(batch) => {
                        for ev in batch.iter() {
                            callback(ev.event, &ev.name, ev.resource.as_ref());
                        }
                    }
                    None => break Err(ControllerError::Closed),
                },
                _ = self.shared.closed.cancelled() => break Err(ControllerError::Closed),
                _ = token.cancelled() => break Ok(()),
            }
        };

        self.shared.state.write().await.remove_subscriber(id);
        res
    }

    /// Create a resource and enqueue it. Fails with `ResourceAlreadyExists`
    /// if a live resource has the name; a resource being deleted under the
    /// name is replaced.
    pub async fn create(
        &self,
        name: &ResourceName,
        meta: MetaUpdate,
        hidden: bool,
        spec: Value,
    ) -> Result<()> {
        self.write_state(None, |s| s.create(name, meta, hidden, spec))
            .await
    }

    /// Replace refs, owner and file paths, cancelling and re-enqueueing the
    /// resource.
    pub async fn update_meta(&self, name: &ResourceName, meta: MetaUpdate) -> Result<()> {
        self.write_state(None, |s| s.update_meta(None, name, meta))
            .await
    }

    pub async fn update_name(
        &self,
        name: &ResourceName,
        new_name: &ResourceName,
        owner: Option<ResourceName>,
        file_paths: Vec<String>,
    ) -> Result<()> {
        self.write_state(None, |s| {
            s.update_name(None, name, new_name, owner, file_paths)
        })
        .await
    }

    pub async fn update_spec(&self, name: &ResourceName, spec: Value) -> Result<()> {
        self.check_running()?;
        let reconciler = self.reconciler(&name.kind)?;
        self.write_state(None, |s| s.update_spec(None, reconciler.as_ref(), name, spec))
            .await
    }

    /// State belongs to the reconciler: this always fails outside of one.
    /// Use [`ReconcileContext::update_state`](crate::engine::ReconcileContext::update_state).
    pub async fn update_state(&self, name: &ResourceName, state: Value) -> Result<()> {
        self.check_running()?;
        let reconciler = self.reconciler(&name.kind)?;
        self.write_state(None, |s| s.update_state(None, reconciler.as_ref(), name, state))
            .await
    }

    /// Set the resource's error without cancelling or enqueueing it.
    pub async fn update_error(&self, name: &ResourceName, error: Option<String>) -> Result<()> {
        self.write_state(None, |s| s.update_error(name, error))
            .await
    }

    /// Soft-delete; the resource is removed once its deleting reconcile
    /// finishes.
    pub async fn delete(&self, name: &ResourceName) -> Result<()> {
        self.write_state(None, |s| s.delete(None, name)).await
    }

    /// Enqueue a resource, cancelling it first if it is running.
    pub async fn reconcile(&self, name: &ResourceName) -> Result<()> {
        self.write_state(None, |s| {
            s.enqueue(name);
            Ok(())
        })
        .await
    }

    /// Cancel a running invocation without enqueueing it again.
    pub async fn cancel(&self, name: &ResourceName) -> Result<()> {
        self.write_state(None, |s| {
            s.cancel_if_running(name, false);
            Ok(())
        })
        .await
    }

    /// Persist pending catalog changes now.
    pub async fn flush(&self) -> Result<()> {
        self.check_running()?;
        self.flush_catalog().await
    }

    /// Take the dirty batch under the state lock, write it outside of it. A
    /// failed write puts the batch back. Flushes never overlap: an older
    /// batch landing after a newer one could resurrect deleted resources.
    pub(crate) async fn flush_catalog(&self) -> Result<()> {
        let _gate = self.shared.flush_gate.lock().await;
        let batch = self.shared.state.write().await.catalog.take_flush_batch();
        if batch.is_empty() {
            return Ok(());
        }

        let upserts = batch.upserts.len();
        let deletes = batch.deletes.len();
        match self.shared.store.flush(batch.clone()).await {
            Ok(()) => {
                debug!(upserts, deletes, "flushed catalog");
                Ok(())
            }
            Err(e) => {
                self.shared
                    .state
                    .write()
                    .await
                    .catalog
                    .restore_flush_batch(batch);
                Err(e)
            }
        }
    }
}
