// src/catalog/mod.rs

//! In-memory, versioned cache of resources.
//!
//! The catalog is owned by the controller and is only ever touched while the
//! controller's state lock is held, so none of its methods are async. Changes
//! are tracked as dirty keys and flushed to a [`CatalogStore`] in batches.
//!
//! Besides the resources themselves it maintains:
//! - the refs DAG (see [`crate::dag::Dag`]), which never contains deleted or
//!   cyclic resources,
//! - the sets of cyclic, soft-deleted and mid-rename resources,
//! - a coalescing event buffer for subscribers.

pub mod file_store;
pub mod store;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::dag::Dag;
use crate::errors::{ControllerError, Result};
use crate::types::{
    MetaUpdate, ReconcileStatus, Resource, ResourceEvent, ResourceMeta, ResourceName,
    dedupe_refs,
};

pub use file_store::JsonFileStore;
pub use store::{CatalogStore, FlushBatch, MemoryCatalogStore};

/// A buffered change notification.
#[derive(Debug, Clone)]
pub struct CatalogEvent {
    pub event: ResourceEvent,
    pub name: ResourceName,
    /// Snapshot of the resource after the change (`None` for deletes).
    pub resource: Option<Resource>,
}

#[derive(Debug)]
pub struct Catalog {
    resources: HashMap<String, Resource>,
    dag: Dag,
    cyclic: BTreeMap<String, ResourceName>,
    deleted: BTreeMap<String, ResourceName>,
    renamed: BTreeMap<String, ResourceName>,
    dirty: HashSet<String>,
    removed: HashMap<String, ResourceName>,
    events: Vec<CatalogEvent>,
    event_index: HashMap<String, usize>,
    has_events: Arc<Notify>,
    version: u64,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            resources: HashMap::new(),
            dag: Dag::new(),
            cyclic: BTreeMap::new(),
            deleted: BTreeMap::new(),
            renamed: BTreeMap::new(),
            dirty: HashSet::new(),
            removed: HashMap::new(),
            events: Vec::new(),
            event_index: HashMap::new(),
            has_events: Arc::new(Notify::new()),
            version: 0,
        }
    }

    /// Build a catalog from persisted resources.
    ///
    /// Statuses are reset to idle since nothing can be running in a fresh
    /// process. Loading does not produce events or dirty entries.
    pub fn from_resources(resources: Vec<Resource>) -> Self {
        let mut catalog = Self::new();

        for mut r in resources {
            r.meta.reconcile_status = ReconcileStatus::Idle;
            let key = r.meta.name.key();
            if r.is_deleted() {
                catalog.deleted.insert(key.clone(), r.meta.name.clone());
            } else if r.meta.renamed_from.is_some() {
                catalog.renamed.insert(key.clone(), r.meta.name.clone());
            }
            catalog.resources.insert(key, r);
        }

        // Add to the DAG in name order so cycle rejection is deterministic.
        let mut live: Vec<(ResourceName, Vec<ResourceName>)> = catalog
            .resources
            .values()
            .filter(|r| !r.is_deleted())
            .map(|r| (r.meta.name.clone(), r.meta.refs.clone()))
            .collect();
        live.sort();
        for (name, refs) in live {
            if !catalog.dag.add(&name, &refs) {
                catalog.cyclic.insert(name.key(), name);
            }
        }

        debug!(
            resources = catalog.resources.len(),
            cyclic = catalog.cyclic.len(),
            deleted = catalog.deleted.len(),
            "catalog loaded"
        );
        catalog
    }

    /// Monotonic counter bumped on every mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Look up a resource. Soft-deleted resources are only returned when
    /// `include_deleted` is set.
    pub fn get(&self, name: &ResourceName, include_deleted: bool) -> Result<&Resource> {
        match self.resources.get(&name.key()) {
            Some(r) if include_deleted || !r.is_deleted() => Ok(r),
            _ => Err(ControllerError::ResourceNotFound(name.clone())),
        }
    }

    pub fn contains(&self, name: &ResourceName) -> bool {
        self.resources.contains_key(&name.key())
    }

    /// Resources sorted by name, optionally restricted to one kind.
    pub fn list(&self, kind: Option<&str>, include_deleted: bool) -> Vec<Resource> {
        let mut out: Vec<Resource> = self
            .resources
            .values()
            .filter(|r| kind.is_none_or(|k| r.meta.name.kind == k))
            .filter(|r| include_deleted || !r.is_deleted())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.meta.name.cmp(&b.meta.name));
        out
    }

    /// Names of every resource (including deleted ones), sorted.
    pub fn names(&self) -> Vec<ResourceName> {
        let mut out: Vec<ResourceName> =
            self.resources.values().map(|r| r.meta.name.clone()).collect();
        out.sort();
        out
    }

    pub fn create(
        &mut self,
        name: &ResourceName,
        meta: MetaUpdate,
        hidden: bool,
        spec: Value,
    ) -> Result<()> {
        let mut r = Resource::new(name.clone(), spec);
        r.meta.refs = dedupe_refs(&meta.refs);
        r.meta.owner = meta.owner;
        r.meta.file_paths = meta.file_paths;
        r.meta.hidden = hidden;
        self.insert_new(r)
    }

    /// Create `name` as a copy of `from`'s meta, spec and state.
    pub fn create_copy(&mut self, name: &ResourceName, from: &Resource) -> Result<()> {
        let mut r = Resource::new(name.clone(), from.spec.clone());
        r.state = from.state.clone();
        r.meta.refs = from.meta.refs.clone();
        r.meta.owner = from.meta.owner.clone();
        r.meta.file_paths = from.meta.file_paths.clone();
        r.meta.hidden = from.meta.hidden;
        self.insert_new(r)
    }

    fn insert_new(&mut self, mut r: Resource) -> Result<()> {
        let name = r.meta.name.clone();
        let key = name.key();

        // A soft-deleted entry is replaced outright. Its status carries over
        // since its deleting invocation may still be running.
        match self.resources.get(&key) {
            Some(existing) if !existing.is_deleted() => {
                return Err(ControllerError::ResourceAlreadyExists(name));
            }
            Some(existing) => {
                r.meta.reconcile_status = existing.meta.reconcile_status;
                self.deleted.remove(&key);
            }
            None => {}
        }

        self.removed.remove(&key);
        self.link(&r.meta);
        self.resources.insert(key, r);
        self.touch(&name, ResourceEvent::Write);
        Ok(())
    }

    /// Replace refs, owner and file paths. Counts as a spec change.
    pub fn update_meta(&mut self, name: &ResourceName, meta: MetaUpdate) -> Result<()> {
        let r = self.get_mut(name)?;
        r.meta.refs = dedupe_refs(&meta.refs);
        r.meta.owner = meta.owner;
        r.meta.file_paths = meta.file_paths;
        r.meta.meta_version += 1;
        r.meta.spec_version += 1;
        r.meta.spec_updated_on = Utc::now();

        let snapshot = r.meta.clone();
        if snapshot.deleted_on.is_none() {
            self.cyclic.remove(&name.key());
            self.link(&snapshot);
        }
        self.touch(name, ResourceEvent::Write);
        Ok(())
    }

    pub fn update_spec(&mut self, name: &ResourceName, spec: Value) -> Result<()> {
        let r = self.get_mut(name)?;
        r.spec = spec;
        r.meta.spec_version += 1;
        r.meta.spec_updated_on = Utc::now();
        self.touch(name, ResourceEvent::Write);
        Ok(())
    }

    pub fn update_state(&mut self, name: &ResourceName, state: Value) -> Result<()> {
        let r = self.get_mut(name)?;
        r.state = state;
        r.meta.state_version += 1;
        r.meta.state_updated_on = Utc::now();
        self.touch(name, ResourceEvent::Write);
        Ok(())
    }

    pub fn update_error(&mut self, name: &ResourceName, error: Option<String>) -> Result<()> {
        let r = self.get_mut(name)?;
        if r.meta.reconcile_error == error {
            return Ok(());
        }
        r.meta.reconcile_error = error;
        self.touch(name, ResourceEvent::Write);
        Ok(())
    }

    /// Set the reconcile status and the time of the next requested retrigger.
    pub fn update_status(
        &mut self,
        name: &ResourceName,
        status: ReconcileStatus,
        reconcile_on: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let r = self.get_mut(name)?;
        r.meta.reconcile_status = status;
        r.meta.reconcile_on = reconcile_on;
        self.touch(name, ResourceEvent::Write);
        Ok(())
    }

    /// Soft-delete: stamp `deleted_on` and drop the resource from the DAG.
    pub fn update_deleted(&mut self, name: &ResourceName) -> Result<()> {
        let r = self.get_mut(name)?;
        r.meta.deleted_on = Some(Utc::now());

        let key = name.key();
        self.dag.remove(name);
        self.cyclic.remove(&key);
        self.renamed.remove(&key);
        self.deleted.insert(key, name.clone());
        self.touch(name, ResourceEvent::Write);
        Ok(())
    }

    /// Move `from` to `to`, recording where it came from. A resource renamed
    /// twice before its rename is reconciled keeps the oldest `renamed_from`.
    pub fn rename(&mut self, from: &ResourceName, to: &ResourceName) -> Result<()> {
        if from == to {
            return Ok(());
        }
        if self.contains(to) {
            return Err(ControllerError::ResourceAlreadyExists(to.clone()));
        }
        let from_key = from.key();
        let Some(mut r) = self.resources.remove(&from_key) else {
            return Err(ControllerError::ResourceNotFound(from.clone()));
        };

        self.dag.remove(from);
        self.cyclic.remove(&from_key);
        self.renamed.remove(&from_key);
        self.dirty.remove(&from_key);
        self.removed.insert(from_key, from.clone());
        self.push_event(from, ResourceEvent::Delete);

        r.meta.renamed_from = Some(r.meta.renamed_from.take().unwrap_or_else(|| from.clone()));
        r.meta.name = to.clone();
        // Any invocation still running belongs to the old name.
        if r.meta.reconcile_status == ReconcileStatus::Running {
            r.meta.reconcile_status = ReconcileStatus::Pending;
        }
        r.meta.meta_version += 1;
        r.meta.spec_version += 1;
        r.meta.spec_updated_on = Utc::now();

        let to_key = to.key();
        self.removed.remove(&to_key);
        self.link(&r.meta);
        self.renamed.insert(to_key.clone(), to.clone());
        self.resources.insert(to_key, r);
        self.touch(to, ResourceEvent::Write);
        Ok(())
    }

    pub fn clear_renamed_from(&mut self, name: &ResourceName) -> Result<()> {
        let r = self.get_mut(name)?;
        if r.meta.renamed_from.take().is_none() {
            return Ok(());
        }
        self.renamed.remove(&name.key());
        self.touch(name, ResourceEvent::Write);
        Ok(())
    }

    /// Hard delete.
    pub fn delete(&mut self, name: &ResourceName) -> Result<()> {
        let key = name.key();
        if self.resources.remove(&key).is_none() {
            return Err(ControllerError::ResourceNotFound(name.clone()));
        }
        self.dag.remove(name);
        self.cyclic.remove(&key);
        self.deleted.remove(&key);
        self.renamed.remove(&key);
        self.dirty.remove(&key);
        self.removed.insert(key, name.clone());
        self.version += 1;
        self.push_event(name, ResourceEvent::Delete);
        Ok(())
    }

    pub fn is_cyclic(&self, name: &ResourceName) -> bool {
        self.cyclic.contains_key(&name.key())
    }

    /// Try to re-add every cyclic resource to the DAG, returning those that
    /// no longer close a cycle.
    pub fn retry_cyclic_refs(&mut self) -> Vec<ResourceName> {
        let candidates: Vec<ResourceName> = self.cyclic.values().cloned().collect();
        let mut fixed = Vec::new();
        for name in candidates {
            let Some(refs) = self.resources.get(&name.key()).map(|r| r.meta.refs.clone()) else {
                self.cyclic.remove(&name.key());
                continue;
            };
            if self.dag.add(&name, &refs) {
                self.cyclic.remove(&name.key());
                fixed.push(name);
            }
        }
        if !fixed.is_empty() {
            debug!(?fixed, "resources no longer cyclic");
        }
        fixed
    }

    /// Present parents of `name` in the DAG.
    pub fn parents(&self, name: &ResourceName) -> Vec<ResourceName> {
        self.dag.parents(name)
    }

    /// Children of `name` in the DAG (resources whose refs include it).
    pub fn children(&self, name: &ResourceName) -> Vec<ResourceName> {
        self.dag.children(name)
    }

    pub fn has_deleted(&self) -> bool {
        !self.deleted.is_empty()
    }

    pub fn has_renamed(&self) -> bool {
        !self.renamed.is_empty()
    }

    /// Resources currently mid-rename (new names).
    pub fn renamed(&self) -> Vec<ResourceName> {
        self.renamed.values().cloned().collect()
    }

    /// Take everything changed since the last call.
    pub fn take_flush_batch(&mut self) -> FlushBatch {
        let mut upserts: Vec<Resource> = self
            .dirty
            .drain()
            .filter_map(|key| self.resources.get(&key).cloned())
            .collect();
        upserts.sort_by(|a, b| a.meta.name.cmp(&b.meta.name));

        let mut deletes: Vec<ResourceName> = self.removed.drain().map(|(_, n)| n).collect();
        deletes.sort();

        FlushBatch { upserts, deletes }
    }

    /// Put a batch back after a failed flush so the changes are retried.
    pub fn restore_flush_batch(&mut self, batch: FlushBatch) {
        for r in batch.upserts {
            let key = r.meta.name.key();
            if self.resources.contains_key(&key) {
                self.dirty.insert(key);
            }
        }
        for name in batch.deletes {
            let key = name.key();
            if !self.resources.contains_key(&key) {
                self.removed.insert(key, name);
            }
        }
    }

    /// Notified when the event buffer goes from empty to non-empty.
    pub fn events_notify(&self) -> Arc<Notify> {
        self.has_events.clone()
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Drain buffered events in the order resources were first touched.
    pub fn take_events(&mut self) -> Vec<CatalogEvent> {
        self.event_index.clear();
        std::mem::take(&mut self.events)
    }

    fn get_mut(&mut self, name: &ResourceName) -> Result<&mut Resource> {
        self.resources
            .get_mut(&name.key())
            .ok_or_else(|| ControllerError::ResourceNotFound(name.clone()))
    }

    /// Add a live resource to the DAG, tracking it as cyclic on rejection.
    fn link(&mut self, meta: &ResourceMeta) {
        if self.dag.add(&meta.name, &meta.refs) {
            self.cyclic.remove(&meta.name.key());
        } else {
            warn!(name = %meta.name, refs = ?meta.refs, "resource refs form a cycle");
            self.cyclic.insert(meta.name.key(), meta.name.clone());
        }
    }

    fn touch(&mut self, name: &ResourceName, event: ResourceEvent) {
        self.version += 1;
        self.dirty.insert(name.key());
        self.push_event(name, event);
    }

    /// Coalesce by resource: a later event replaces an earlier one in place.
    fn push_event(&mut self, name: &ResourceName, event: ResourceEvent) {
        let resource = match event {
            ResourceEvent::Write => self.resources.get(&name.key()).cloned(),
            ResourceEvent::Delete => None,
        };
        let ev = CatalogEvent {
            event,
            name: name.clone(),
            resource,
        };

        let key = name.key();
        if let Some(&i) = self.event_index.get(&key) {
            self.events[i] = ev;
            return;
        }

        let was_empty = self.events.is_empty();
        self.event_index.insert(key, self.events.len());
        self.events.push(ev);
        if was_empty {
            self.has_events.notify_one();
        }
    }
}
