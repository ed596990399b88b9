// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::reconciler::command::COMMAND_KIND;
use crate::types::{MetaUpdate, ResourceName};

/// Top-level project file as read from TOML, before validation.
///
/// ```toml
/// [controller]
/// flush_interval_ms = 10000
///
/// [store]
/// path = ".resctl/catalog.json"
///
/// [resource.fetch]
/// cmd = "curl -sO https://example.com/data.csv"
///
/// [resource.build]
/// cmd = "make build"
/// refs = ["fetch"]
/// refresh_every_ms = 60000
/// ```
///
/// All sections are optional at this stage; [`ProjectFile`] is only built
/// through validation (see `validate.rs`).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawProjectFile {
    #[serde(default)]
    pub controller: ControllerSection,

    #[serde(default)]
    pub store: StoreSection,

    /// Keyed by resource name.
    #[serde(default)]
    pub resource: BTreeMap<String, ResourceConfig>,
}

/// `[controller]` section. All values in milliseconds except the buffer.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerSection {
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,

    /// Added to every timeline wake-up so near-simultaneous retriggers are
    /// picked up together.
    #[serde(default = "default_retrigger_slack_ms")]
    pub retrigger_slack_ms: u64,

    #[serde(default = "default_completion_buffer")]
    pub completion_buffer: usize,
}

fn default_flush_interval_ms() -> u64 {
    10_000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_flush_timeout_ms() -> u64 {
    10_000
}

fn default_retrigger_slack_ms() -> u64 {
    1_000
}

fn default_completion_buffer() -> usize {
    64
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            flush_timeout_ms: default_flush_timeout_ms(),
            retrigger_slack_ms: default_retrigger_slack_ms(),
            completion_buffer: default_completion_buffer(),
        }
    }
}

/// `[store]` section. Without a path the catalog lives in memory only.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreSection {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// `[resource.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Shell command run by the `command` reconciler.
    pub cmd: String,

    /// Names of other declared resources this one depends on.
    #[serde(default)]
    pub refs: Vec<String>,

    /// Re-run this long after each reconcile.
    #[serde(default)]
    pub refresh_every_ms: Option<u64>,

    /// Hidden resources are reconciled but not logged at info level.
    #[serde(default)]
    pub hidden: bool,
}

fn default_kind() -> String {
    COMMAND_KIND.to_string()
}

/// Timing and sizing knobs of the controller event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub flush_interval: Duration,
    pub shutdown_timeout: Duration,
    pub flush_timeout: Duration,
    pub retrigger_slack: Duration,
    pub completion_buffer: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from(&ControllerSection::default())
    }
}

impl From<&ControllerSection> for ControllerConfig {
    fn from(s: &ControllerSection) -> Self {
        Self {
            flush_interval: Duration::from_millis(s.flush_interval_ms),
            shutdown_timeout: Duration::from_millis(s.shutdown_timeout_ms),
            flush_timeout: Duration::from_millis(s.flush_timeout_ms),
            retrigger_slack: Duration::from_millis(s.retrigger_slack_ms),
            completion_buffer: s.completion_buffer,
        }
    }
}

/// A resource as declared in the project file, ready to be synced into the
/// catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredResource {
    pub name: ResourceName,
    pub refs: Vec<ResourceName>,
    pub hidden: bool,
    pub spec: serde_json::Value,
}

impl DeclaredResource {
    pub fn meta(&self) -> MetaUpdate {
        MetaUpdate::with_refs(self.refs.iter().cloned())
    }
}

/// Validated project file.
#[derive(Debug, Clone)]
pub struct ProjectFile {
    pub controller: ControllerConfig,
    pub store: StoreSection,
    pub resources: BTreeMap<String, ResourceConfig>,
}

impl ProjectFile {
    /// Only called after validation succeeded.
    pub(crate) fn new_unchecked(raw: RawProjectFile) -> Self {
        Self {
            controller: ControllerConfig::from(&raw.controller),
            store: raw.store,
            resources: raw.resource,
        }
    }

    pub fn resource_name(&self, key: &str) -> Option<ResourceName> {
        self.resources
            .get(key)
            .map(|r| ResourceName::new(r.kind.clone(), key))
    }

    /// Declared resources in name order.
    pub fn declared(&self) -> Vec<DeclaredResource> {
        self.resources
            .iter()
            .map(|(key, r)| DeclaredResource {
                name: ResourceName::new(r.kind.clone(), key.clone()),
                refs: r
                    .refs
                    .iter()
                    .filter_map(|dep| self.resource_name(dep))
                    .collect(),
                hidden: r.hidden,
                spec: json!({
                    "cmd": r.cmd,
                    "refresh_every_ms": r.refresh_every_ms,
                }),
            })
            .collect()
    }
}
