// src/catalog/file_store.rs

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::debug;

use crate::catalog::store::{CatalogStore, FlushBatch};
use crate::errors::Result;
use crate::types::{BoxFuture, Resource};

/// Persists the whole catalog as a single pretty-printed JSON array.
///
/// Flushes rewrite the file through a temporary sibling and a rename so a
/// crash mid-write never leaves a truncated catalog behind.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<Resource>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(Vec::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.path, "catalog file missing; starting empty");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, resources: &[Resource]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_vec_pretty(resources)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

impl CatalogStore for JsonFileStore {
    fn load(&self) -> BoxFuture<'_, Result<Vec<Resource>>> {
        Box::pin(self.read_all())
    }

    fn flush(&self, batch: FlushBatch) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if batch.is_empty() {
                return Ok(());
            }
            let _guard = self.write_lock.lock().await;

            let mut resources = self.read_all().await?;
            resources.retain(|r| {
                !batch.deletes.contains(&r.meta.name)
                    && !batch.upserts.iter().any(|u| u.meta.name == r.meta.name)
            });
            resources.extend(batch.upserts);
            resources.sort_by(|a, b| a.meta.name.cmp(&b.meta.name));

            debug!(
                path = ?self.path,
                count = resources.len(),
                "writing catalog file"
            );
            self.write_all(&resources).await
        })
    }
}
