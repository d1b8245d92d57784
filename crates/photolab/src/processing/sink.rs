//! Destinations for processed images

use base64::Engine;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::Result;
use crate::providers::{LocalObjectStore, ObjectStore};
use crate::types::ResultReference;

const PNG_CONTENT_TYPE: &str = "image/png";

/// Turns provider output into a result reference
pub enum ResultSink {
    /// Embed the PNG in the job record as a data URL
    Inline,
    /// Upload to an object store and hand out a temporary link
    Object {
        store: Arc<dyn ObjectStore>,
        link_ttl: Duration,
    },
}

impl ResultSink {
    pub fn from_config(config: &StorageConfig) -> Self {
        match config.backend {
            StorageBackend::Inline => ResultSink::Inline,
            StorageBackend::Local => ResultSink::Object {
                store: Arc::new(LocalObjectStore::from_config(config)),
                link_ttl: Duration::from_secs(config.link_ttl_secs),
            },
        }
    }

    /// Object store behind this sink, if results leave the job record
    pub fn object_store(&self) -> Option<Arc<dyn ObjectStore>> {
        match self {
            ResultSink::Inline => None,
            ResultSink::Object { store, .. } => Some(Arc::clone(store)),
        }
    }

    pub async fn store(&self, png: &[u8]) -> Result<ResultReference> {
        match self {
            ResultSink::Inline => Ok(ResultReference::DataUrl {
                data_url: data_url(png),
            }),
            ResultSink::Object { store, link_ttl } => {
                let key = store.put(png, PNG_CONTENT_TYPE).await?;
                let url = store.temporary_link(&key, *link_ttl)?;
                tracing::debug!("Stored result {} in {}", key, store.name());
                Ok(ResultReference::Object { key, url })
            }
        }
    }
}

fn data_url(png: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        PNG_CONTENT_TYPE,
        base64::engine::general_purpose::STANDARD.encode(png)
    )
}
