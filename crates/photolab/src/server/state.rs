//! Application state for the photolab server

use parking_lot::RwLock;
use std::sync::Arc;

use crate::config::{PhotolabConfig, StorageBackend};
use crate::error::Result;
use crate::imaging::ImagePreparer;
use crate::processing::JobQueue;
use crate::providers::{LocalObjectStore, ProviderSet};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Configuration
    config: PhotolabConfig,
    /// Job queue shared with the batch workers
    queue: Arc<JobQueue>,
    /// Upload validation and normalization
    preparer: ImagePreparer,
    /// Removal providers for the synchronous path
    providers: Arc<ProviderSet>,
    /// Object store serving `/api/results` (local backend only)
    object_store: Option<Arc<LocalObjectStore>>,
    /// Ready state
    ready: RwLock<bool>,
}

impl AppState {
    /// Create application state from already constructed dependencies
    pub fn new(config: PhotolabConfig, queue: Arc<JobQueue>, providers: Arc<ProviderSet>) -> Self {
        let preparer = ImagePreparer::from_config(&config.images);
        let object_store = match config.storage.backend {
            StorageBackend::Local => Some(Arc::new(LocalObjectStore::from_config(&config.storage))),
            StorageBackend::Inline => None,
        };

        Self {
            inner: Arc::new(AppStateInner {
                config,
                queue,
                preparer,
                providers,
                object_store,
                ready: RwLock::new(true),
            }),
        }
    }

    /// Create application state, building providers from the configuration
    pub fn from_config(config: PhotolabConfig, queue: Arc<JobQueue>) -> Result<Self> {
        tracing::info!("Initializing photolab application state...");
        let providers = Arc::new(ProviderSet::from_config(&config.providers)?);
        Ok(Self::new(config, queue, providers))
    }

    pub fn config(&self) -> &PhotolabConfig {
        &self.inner.config
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.inner.queue
    }

    pub fn preparer(&self) -> &ImagePreparer {
        &self.inner.preparer
    }

    pub fn providers(&self) -> &Arc<ProviderSet> {
        &self.inner.providers
    }

    pub fn object_store(&self) -> Option<&Arc<LocalObjectStore>> {
        self.inner.object_store.as_ref()
    }

    /// Check if the server is ready
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.read()
    }

    /// Set ready state
    pub fn set_ready(&self, ready: bool) {
        *self.inner.ready.write() = ready;
    }
}
