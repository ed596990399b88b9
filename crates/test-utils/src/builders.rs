#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use resctl::catalog::{CatalogStore, MemoryCatalogStore};
use resctl::config::{
    ControllerConfig, ControllerSection, ProjectFile, RawProjectFile, ResourceConfig,
    StoreSection,
};
use resctl::engine::Controller;
use resctl::errors::Result;
use resctl::reconciler::ReconcilerRegistry;
use resctl::reconciler::command::COMMAND_KIND;
use resctl::types::ResourceName;

/// Kind used by most controller tests.
pub const TEST_KIND: &str = "test";

/// `test/<name>`.
pub fn rn(name: &str) -> ResourceName {
    ResourceName::new(TEST_KIND, name)
}

/// Controller settings tuned for tests: no retrigger slack and short
/// timeouts.
pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        flush_interval: Duration::from_millis(50),
        shutdown_timeout: Duration::from_secs(2),
        flush_timeout: Duration::from_secs(2),
        retrigger_slack: Duration::ZERO,
        completion_buffer: 64,
    }
}

/// A controller running on a background task.
pub struct TestController {
    pub controller: Controller,
    pub store: MemoryCatalogStore,
    pub shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl TestController {
    /// Start on an empty in-memory store with [`fast_config`].
    pub async fn start(registry: ReconcilerRegistry) -> Self {
        Self::start_with(fast_config(), registry, MemoryCatalogStore::new()).await
    }

    pub async fn start_with(
        config: ControllerConfig,
        registry: ReconcilerRegistry,
        store: MemoryCatalogStore,
    ) -> Self {
        let dyn_store: Arc<dyn CatalogStore> = Arc::new(store.clone());
        let controller = Controller::open(config, registry, dyn_store)
            .await
            .expect("controller should open");
        let shutdown = CancellationToken::new();
        let handle = {
            let controller = controller.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { controller.run(shutdown).await })
        };
        controller
            .wait_until_ready()
            .await
            .expect("controller should start");
        Self {
            controller,
            store,
            shutdown,
            handle,
        }
    }

    /// Cancel the run and return its result.
    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.handle.await.expect("run task should not panic")
    }
}

/// Builder for `ProjectFile` to simplify test setup.
pub struct ProjectFileBuilder {
    raw: RawProjectFile,
}

impl ProjectFileBuilder {
    pub fn new() -> Self {
        Self {
            raw: RawProjectFile {
                controller: ControllerSection::default(),
                store: StoreSection::default(),
                resource: BTreeMap::new(),
            },
        }
    }

    pub fn with_resource(mut self, name: &str, resource: ResourceConfig) -> Self {
        self.raw.resource.insert(name.to_string(), resource);
        self
    }

    pub fn with_store_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.raw.store.path = Some(path.into());
        self
    }

    pub fn raw(self) -> RawProjectFile {
        self.raw
    }

    pub fn build(self) -> ProjectFile {
        ProjectFile::try_from(self.raw).expect("Failed to build valid project from builder")
    }
}

impl Default for ProjectFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `ResourceConfig`.
pub struct ResourceConfigBuilder {
    resource: ResourceConfig,
}

impl ResourceConfigBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            resource: ResourceConfig {
                kind: COMMAND_KIND.to_string(),
                cmd: cmd.to_string(),
                refs: vec![],
                refresh_every_ms: None,
                hidden: false,
            },
        }
    }

    pub fn refs(mut self, dep: &str) -> Self {
        self.resource.refs.push(dep.to_string());
        self
    }

    pub fn refresh_every_ms(mut self, ms: u64) -> Self {
        self.resource.refresh_every_ms = Some(ms);
        self
    }

    pub fn hidden(mut self) -> Self {
        self.resource.hidden = true;
        self
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.resource.kind = kind.to_string();
        self
    }

    pub fn build(self) -> ResourceConfig {
        self.resource
    }
}
