//! Local workspace cache.
//!
//! Each workspace lives at `<cache_root>/<owner>/<workspace>`. The first
//! connection to a workspace in this process hydrates it from object storage;
//! concurrent first connections share that one pull. A failed hydration is not
//! remembered, so the next connection retries it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::storage::{StorageClient, StorageError};
use crate::workspace::WorkspaceId;
use crate::workspace_fs::FsError;

#[derive(Debug, Error)]
pub enum HydrationError {
    #[error("pulling {prefix}: {source}")]
    Storage {
        prefix: String,
        #[source]
        source: StorageError,
    },
    #[error("pulling {prefix} timed out after {timeout:?}")]
    Timeout { prefix: String, timeout: Duration },
    #[error("preparing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("listing workspace root: {0}")]
    Snapshot(#[from] FsError),
}

pub struct WorkspaceCache {
    root: PathBuf,
    storage: StorageClient,
    storage_class: String,
    timeout: Duration,
    hydrated: DashMap<WorkspaceId, Arc<OnceCell<PathBuf>>>,
}

impl WorkspaceCache {
    pub fn new(
        root: PathBuf,
        storage: StorageClient,
        storage_class: String,
        timeout: Duration,
    ) -> Self {
        Self {
            root,
            storage,
            storage_class,
            timeout,
            hydrated: DashMap::new(),
        }
    }

    /// Local directory for a workspace, whether or not it is hydrated yet.
    pub fn local_path(&self, workspace: &WorkspaceId) -> PathBuf {
        self.root.join(workspace.owner()).join(workspace.name())
    }

    pub fn remote_prefix(&self, workspace: &WorkspaceId) -> String {
        workspace.remote_prefix(&self.storage_class)
    }

    pub fn is_hydrated(&self, workspace: &WorkspaceId) -> bool {
        self.hydrated
            .get(workspace)
            .is_some_and(|cell| cell.initialized())
    }

    /// Forget a hydration so the next [`ensure`](Self::ensure) pulls again.
    /// Local files are left in place and overwritten by that pull.
    pub fn invalidate(&self, workspace: &WorkspaceId) {
        if self.hydrated.remove(workspace).is_some() {
            debug!(
                component = "cache",
                event = "cache.invalidated",
                workspace = %workspace,
                "Workspace will be hydrated again on next connect"
            );
        }
    }

    /// Make sure the workspace is present locally, pulling it on first use.
    pub async fn ensure(&self, workspace: &WorkspaceId) -> Result<PathBuf, HydrationError> {
        let cell = self
            .hydrated
            .entry(workspace.clone())
            .or_default()
            .value()
            .clone();

        cell.get_or_try_init(|| self.hydrate(workspace))
            .await
            .cloned()
    }

    async fn hydrate(&self, workspace: &WorkspaceId) -> Result<PathBuf, HydrationError> {
        let local = self.local_path(workspace);
        let prefix = self.remote_prefix(workspace);
        let started = Instant::now();

        create_dir(&local).await?;

        let pulled = match tokio::time::timeout(self.timeout, self.storage.pull(&prefix, &local))
            .await
        {
            Ok(Ok(count)) => count,
            Ok(Err(source)) => return Err(HydrationError::Storage { prefix, source }),
            Err(_) => {
                return Err(HydrationError::Timeout {
                    prefix,
                    timeout: self.timeout,
                })
            }
        };

        if pulled == 0 {
            warn!(
                component = "cache",
                event = "cache.hydrate.empty",
                workspace = %workspace,
                prefix = %prefix,
                "Workspace has no remote objects"
            );
        }
        info!(
            component = "cache",
            event = "cache.hydrate.completed",
            workspace = %workspace,
            local_path = %local.display(),
            objects = pulled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Workspace hydrated"
        );
        Ok(local)
    }
}

async fn create_dir(path: &Path) -> Result<(), HydrationError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| HydrationError::Io {
            path: path.display().to_string(),
            source,
        })
}
