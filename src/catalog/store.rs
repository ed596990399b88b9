// src/catalog/store.rs

//! Durable storage abstraction behind the catalog cache.
//!
//! The catalog talks to a `CatalogStore` instead of a concrete database so
//! that tests can use [`MemoryCatalogStore`] while the CLI can persist to a
//! JSON file (see [`super::file_store`]).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::errors::Result;
use crate::types::{BoxFuture, Resource, ResourceName};

/// Changes accumulated since the previous flush.
#[derive(Debug, Clone, Default)]
pub struct FlushBatch {
    pub upserts: Vec<Resource>,
    pub deletes: Vec<ResourceName>,
}

impl FlushBatch {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Trait abstracting where catalog resources are persisted.
pub trait CatalogStore: Send + Sync {
    /// Load every persisted resource.
    fn load(&self) -> BoxFuture<'_, Result<Vec<Resource>>>;

    /// Persist a batch of upserts and hard deletes.
    fn flush(&self, batch: FlushBatch) -> BoxFuture<'_, Result<()>>;

    /// Fail if this process is no longer allowed to write the catalog.
    fn check_leader(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// In-memory store. Clones share the same underlying map, so tests can keep
/// a handle and inspect what the controller flushed.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalogStore {
    resources: Arc<Mutex<BTreeMap<String, Resource>>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with resources (as if flushed by a previous run).
    pub fn with_resources(resources: impl IntoIterator<Item = Resource>) -> Self {
        let store = Self::new();
        {
            let mut map = store.lock();
            for r in resources {
                map.insert(r.meta.name.key(), r);
            }
        }
        store
    }

    /// Snapshot of everything persisted so far.
    pub fn snapshot(&self) -> Vec<Resource> {
        self.lock().values().cloned().collect()
    }

    pub fn get(&self, name: &ResourceName) -> Option<Resource> {
        self.lock().get(&name.key()).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Resource>> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CatalogStore for MemoryCatalogStore {
    fn load(&self) -> BoxFuture<'_, Result<Vec<Resource>>> {
        let resources = self.snapshot();
        Box::pin(async move { Ok(resources) })
    }

    fn flush(&self, batch: FlushBatch) -> BoxFuture<'_, Result<()>> {
        {
            let mut map = self.lock();
            for name in &batch.deletes {
                map.remove(&name.key());
            }
            for r in batch.upserts {
                map.insert(r.meta.name.key(), r);
            }
        }
        Box::pin(async { Ok(()) })
    }
}
