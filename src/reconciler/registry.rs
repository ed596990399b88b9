// src/reconciler/registry.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::engine::Controller;
use crate::reconciler::Reconciler;

/// Builds the reconciler for one kind. Called at most once per controller.
pub type ReconcilerInitializer = Arc<dyn Fn(&Controller) -> Arc<dyn Reconciler> + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("reconciler already registered for resource kind {kind:?}")]
pub struct DuplicateKindError {
    pub kind: String,
}

/// Kind -> initializer map handed to `Controller::open`.
#[derive(Clone, Default)]
pub struct ReconcilerRegistry {
    initializers: HashMap<String, ReconcilerInitializer>,
}

impl ReconcilerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, init: F) -> Result<(), DuplicateKindError>
    where
        F: Fn(&Controller) -> Arc<dyn Reconciler> + Send + Sync + 'static,
    {
        let kind = kind.into();
        if self.initializers.contains_key(&kind) {
            return Err(DuplicateKindError { kind });
        }
        self.initializers.insert(kind, Arc::new(init));
        Ok(())
    }

    /// Register a single shared instance for `kind`.
    pub fn register_instance(
        &mut self,
        kind: impl Into<String>,
        reconciler: Arc<dyn Reconciler>,
    ) -> Result<(), DuplicateKindError> {
        self.register(kind, move |_| reconciler.clone())
    }

    pub fn get(&self, kind: &str) -> Option<&ReconcilerInitializer> {
        self.initializers.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.initializers.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.initializers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl fmt::Debug for ReconcilerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcilerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
