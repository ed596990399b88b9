// src/engine/state.rs

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{Notify, mpsc, oneshot};
use tracing::debug;

use crate::catalog::{Catalog, CatalogEvent};
use crate::engine::invocation::Invocation;
use crate::engine::timeline::Timeline;
use crate::types::ResourceName;

/// Batches of catalog events delivered to one subscriber.
pub(crate) type EventBatchSender = mpsc::UnboundedSender<Arc<Vec<CatalogEvent>>>;

struct IdleWait {
    tx: oneshot::Sender<()>,
    ignore_hidden: bool,
}

/// Everything the controller serializes behind its state lock: the catalog,
/// the scheduling queue, the timeline and the running invocations.
///
/// Scheduling (`scheduler.rs`), completion handling (`completion.rs`) and the
/// mutation API (`mutations.rs`) are implemented as methods on this type and
/// are only ever called with the lock held.
pub struct ControllerState {
    pub(crate) catalog: Catalog,
    pub(crate) queue: BTreeMap<String, ResourceName>,
    queue_updated: bool,
    queue_notify: Arc<Notify>,
    pub(crate) timeline: Timeline,
    pub(crate) invocations: HashMap<String, Invocation>,
    subscribers: HashMap<u64, EventBatchSender>,
    next_subscriber_id: u64,
    idle_waits: HashMap<u64, IdleWait>,
    next_idle_wait_id: u64,
    /// Number of `process_queue` passes so far.
    pub(crate) pass: u64,
}

impl ControllerState {
    pub(crate) fn new(catalog: Catalog, queue_notify: Arc<Notify>) -> Self {
        Self {
            catalog,
            queue: BTreeMap::new(),
            queue_updated: false,
            queue_notify,
            timeline: Timeline::new(),
            invocations: HashMap::new(),
            subscribers: HashMap::new(),
            next_subscriber_id: 0,
            idle_waits: HashMap::new(),
            next_idle_wait_id: 0,
            pass: 0,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn running(&self) -> Vec<ResourceName> {
        let mut names: Vec<ResourceName> =
            self.invocations.values().map(|i| i.name().clone()).collect();
        names.sort();
        names
    }

    /// Put `name` on the queue for the next scheduling pass.
    pub(crate) fn enqueue(&mut self, name: &ResourceName) {
        self.queue.insert(name.key(), name.clone());
        self.set_queue_updated();
    }

    /// Wake the event loop, at most once per pass.
    pub(crate) fn set_queue_updated(&mut self) {
        if !self.queue_updated {
            self.queue_updated = true;
            self.queue_notify.notify_one();
        }
    }

    pub(crate) fn reset_queue_updated(&mut self) {
        self.queue_updated = false;
    }

    /// Cancel the running invocation of `name`, if any.
    pub(crate) fn cancel_if_running(&mut self, name: &ResourceName, reschedule: bool) {
        if let Some(inv) = self.invocations.get_mut(&name.key()) {
            inv.cancel(reschedule);
        }
    }

    pub(crate) fn add_subscriber(&mut self, tx: EventBatchSender) -> u64 {
        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;
        self.subscribers.insert(id, tx);
        id
    }

    pub(crate) fn remove_subscriber(&mut self, id: u64) {
        self.subscribers.remove(&id);
    }

    /// Hand buffered catalog events to every subscriber.
    pub(crate) fn fan_out_events(&mut self) {
        let events = self.catalog.take_events();
        if events.is_empty() {
            return;
        }
        let batch = Arc::new(events);
        self.subscribers
            .retain(|_, tx| tx.send(Arc::clone(&batch)).is_ok());
        debug!(
            events = batch.len(),
            subscribers = self.subscribers.len(),
            "delivered catalog events"
        );
    }

    pub(crate) fn add_idle_wait(&mut self, tx: oneshot::Sender<()>, ignore_hidden: bool) {
        let id = self.next_idle_wait_id;
        self.next_idle_wait_id += 1;
        self.idle_waits.insert(id, IdleWait { tx, ignore_hidden });
        self.check_idle_waits();
    }

    /// Release idle waiters that are satisfied: nothing queued and no
    /// invocations running (hidden ones excepted for `ignore_hidden` waiters).
    pub(crate) fn check_idle_waits(&mut self) {
        if self.idle_waits.is_empty() || !self.queue.is_empty() {
            return;
        }
        if self.invocations.values().any(|inv| !inv.is_hidden) {
            return;
        }

        let any_running = !self.invocations.is_empty();
        let ready: Vec<u64> = self
            .idle_waits
            .iter()
            .filter(|(_, w)| w.ignore_hidden || !any_running)
            .map(|(id, _)| *id)
            .collect();
        for id in ready {
            if let Some(w) = self.idle_waits.remove(&id) {
                let _ = w.tx.send(());
            }
        }
    }

    /// Release every idle waiter regardless of state (shutdown).
    pub(crate) fn release_idle_waits(&mut self) {
        for (_, w) in self.idle_waits.drain() {
            let _ = w.tx.send(());
        }
    }
}
