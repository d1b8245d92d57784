//! Local model runtime provider
//!
//! Talks to a rembg-compatible HTTP server running next to the service
//! (`POST /api/remove` with a multipart `file` and `model`, PNG in the body).

use async_trait::async_trait;
use reqwest::{multipart, Client, StatusCode};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::Mode;

use super::removal::RemovalProvider;

/// Removal through a local segmentation runtime
pub struct LocalRuntimeProvider {
    client: Client,
    base_url: String,
    model: String,
    name: String,
    timeout: Duration,
}

impl LocalRuntimeProvider {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            name: format!("local:{}", model),
            timeout,
        })
    }

    fn request_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::ProviderTimeout(self.timeout.as_secs())
        } else {
            Error::provider(format!("{}: {}", self.name, err))
        }
    }
}

#[async_trait]
impl RemovalProvider for LocalRuntimeProvider {
    async fn remove(&self, image: &[u8], mode: Mode) -> Result<Vec<u8>> {
        tracing::debug!("{} removing background ({} bytes, mode {})", self.name, image.len(), mode);

        let file = multipart::Part::bytes(image.to_vec())
            .file_name("image.png")
            .mime_str("image/png")?;
        let form = multipart::Form::new()
            .part("file", file)
            .text("model", self.model.clone());

        let response = self
            .client
            .post(format!("{}/api/remove", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::InvalidImage(format!("{} rejected input: {}", self.name, body)));
        }
        if !status.is_success() {
            return Err(Error::provider(format!("{} failed: HTTP {}", self.name, status)));
        }

        let bytes = response.bytes().await.map_err(|e| self.request_error(e))?;
        if bytes.is_empty() {
            return Err(Error::EmptyResult);
        }
        Ok(bytes.to_vec())
    }

    async fn health_check(&self) -> Result<bool> {
        match self.client.get(&self.base_url).send().await {
            Ok(response) => Ok(!response.status().is_server_error()),
            Err(_) => Ok(false),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
