// src/engine/timeline.rs

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::types::ResourceName;

/// Future re-trigger times, at most one per resource.
///
/// Ordered by time (ties broken by name) so the event loop can peek the
/// earliest entry and pop everything that has become due.
#[derive(Debug, Default)]
pub struct Timeline {
    by_name: HashMap<String, (DateTime<Utc>, ResourceName)>,
    order: BTreeSet<(DateTime<Utc>, String)>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) the trigger time for `name`.
    pub fn set(&mut self, name: &ResourceName, at: DateTime<Utc>) {
        let key = name.key();
        if let Some((prev, _)) = self.by_name.insert(key.clone(), (at, name.clone())) {
            self.order.remove(&(prev, key.clone()));
        }
        self.order.insert((at, key));
    }

    pub fn remove(&mut self, name: &ResourceName) -> bool {
        let key = name.key();
        match self.by_name.remove(&key) {
            Some((at, _)) => {
                self.order.remove(&(at, key));
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &ResourceName) -> Option<DateTime<Utc>> {
        self.by_name.get(&name.key()).map(|(at, _)| *at)
    }

    /// Earliest trigger time.
    pub fn next(&self) -> Option<DateTime<Utc>> {
        self.order.first().map(|(at, _)| *at)
    }

    /// Remove and return every entry due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<ResourceName> {
        let mut due = Vec::new();
        while let Some((at, key)) = self.order.first().cloned() {
            if at > now {
                break;
            }
            self.order.remove(&(at, key.clone()));
            if let Some((_, name)) = self.by_name.remove(&key) {
                due.push(name);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
