//! Application state

use std::sync::Arc;

use crate::auth::CredentialValidator;
use crate::cache::WorkspaceCache;
use crate::compute::ComputeLifecycle;
use crate::config::Config;
use crate::remote_sync::RemoteSync;
use crate::storage::StorageClient;
use crate::terminal::TerminalManager;
use crate::workspace::ResolutionMode;

/// Shared by every connection and REST handler.
pub struct AppState {
    /// How a handshake names its workspace
    pub resolution: ResolutionMode,

    pub validator: Arc<dyn CredentialValidator>,

    /// Folder-level object storage operations
    pub storage: StorageClient,

    /// Local copies of hydrated workspaces
    pub cache: Arc<WorkspaceCache>,

    /// Connection id → shell process
    pub terminals: Arc<TerminalManager>,

    /// Queue feeding the background uploader
    pub remote_sync: RemoteSync,

    pub compute: Arc<dyn ComputeLifecycle>,

    /// Prefix templates are copied from when provisioning
    pub template_class: String,
}

impl AppState {
    pub fn new(
        config: &Config,
        validator: Arc<dyn CredentialValidator>,
        storage: StorageClient,
        remote_sync: RemoteSync,
        compute: Arc<dyn ComputeLifecycle>,
    ) -> Self {
        let cache = WorkspaceCache::new(
            config.cache_root.clone(),
            storage.clone(),
            config.storage_class.clone(),
            config.store_timeout,
        );
        Self {
            resolution: config.resolution,
            validator,
            storage,
            cache: Arc::new(cache),
            terminals: Arc::new(TerminalManager::new(config.shell.clone())),
            remote_sync,
            compute,
            template_class: config.template_class.clone(),
        }
    }
}
