// src/types.rs

//! Core data model shared by the catalog, the controller and reconcilers.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Boxed, sendable future used at the trait seams (reconcilers, stores).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Identity of a resource: `(kind, name)`, compared case-sensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceName {
    pub kind: String,
    pub name: String,
}

impl ResourceName {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Stable string encoding used as a map key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Scheduling status of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileStatus {
    #[default]
    Idle,
    Pending,
    Running,
}

/// Kind of change delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceEvent {
    Write,
    Delete,
}

/// Envelope fields the controller manipulates on every resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub name: ResourceName,
    /// Ordered, deduplicated list of resources this one depends on.
    #[serde(default)]
    pub refs: Vec<ResourceName>,
    #[serde(default)]
    pub owner: Option<ResourceName>,
    #[serde(default)]
    pub file_paths: Vec<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub reconcile_status: ReconcileStatus,
    #[serde(default)]
    pub reconcile_error: Option<String>,
    /// When the last reconcile asked to be retriggered.
    #[serde(default)]
    pub reconcile_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub renamed_from: Option<ResourceName>,
    #[serde(default)]
    pub deleted_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub meta_version: u64,
    #[serde(default)]
    pub spec_version: u64,
    #[serde(default)]
    pub state_version: u64,
    pub created_on: DateTime<Utc>,
    pub spec_updated_on: DateTime<Utc>,
    pub state_updated_on: DateTime<Utc>,
}

impl ResourceMeta {
    pub fn new(name: ResourceName) -> Self {
        let now = Utc::now();
        Self {
            name,
            refs: Vec::new(),
            owner: None,
            file_paths: Vec::new(),
            hidden: false,
            reconcile_status: ReconcileStatus::Idle,
            reconcile_error: None,
            reconcile_on: None,
            renamed_from: None,
            deleted_on: None,
            meta_version: 1,
            spec_version: 1,
            state_version: 1,
            created_on: now,
            spec_updated_on: now,
            state_updated_on: now,
        }
    }
}

/// A resource: the controller-owned meta plus an opaque per-kind payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub meta: ResourceMeta,
    #[serde(default)]
    pub spec: Value,
    #[serde(default)]
    pub state: Value,
}

impl Resource {
    pub fn new(name: ResourceName, spec: Value) -> Self {
        Self {
            meta: ResourceMeta::new(name),
            spec,
            state: Value::Null,
        }
    }

    pub fn name(&self) -> &ResourceName {
        &self.meta.name
    }

    pub fn is_deleted(&self) -> bool {
        self.meta.deleted_on.is_some()
    }
}

/// Meta fields supplied by callers on create / meta updates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaUpdate {
    pub refs: Vec<ResourceName>,
    pub owner: Option<ResourceName>,
    pub file_paths: Vec<String>,
}

impl MetaUpdate {
    pub fn with_refs(refs: impl IntoIterator<Item = ResourceName>) -> Self {
        Self {
            refs: refs.into_iter().collect(),
            ..Self::default()
        }
    }
}

/// Deduplicate refs while keeping their first-seen order.
pub fn dedupe_refs(refs: &[ResourceName]) -> Vec<ResourceName> {
    let mut out: Vec<ResourceName> = Vec::with_capacity(refs.len());
    for r in refs {
        if !out.contains(r) {
            out.push(r.clone());
        }
    }
    out
}
