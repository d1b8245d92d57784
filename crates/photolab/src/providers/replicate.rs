//! Replicate-hosted background removal models
//!
//! A removal is a prediction: it is created with the image as a data URL and
//! then polled until it reaches a terminal status, after which the output image
//! is downloaded.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::config::ProvidersConfig;
use crate::error::{Error, Result};
use crate::types::Mode;

use super::removal::RemovalProvider;

/// Removal through a Replicate model (`owner/name`)
pub struct ReplicateProvider {
    client: Client,
    api_base: String,
    token: String,
    model: String,
    name: String,
    timeout: Duration,
    poll_interval: Duration,
}

#[derive(Serialize)]
struct CreatePrediction<'a> {
    input: PredictionInput<'a>,
}

#[derive(Serialize)]
struct PredictionInput<'a> {
    image: &'a str,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: PredictionStatus,
    #[serde(default)]
    output: Option<PredictionOutput>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    urls: Option<PredictionUrls>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

#[derive(Debug, Deserialize)]
struct PredictionUrls {
    get: String,
}

/// Model output: either a single file URL or a list of them
#[derive(Debug, Deserialize, PartialEq)]
#[serde(untagged)]
enum PredictionOutput {
    Single(String),
    Many(Vec<String>),
}

impl PredictionOutput {
    fn into_first(self) -> Option<String> {
        let first = match self {
            PredictionOutput::Single(url) => Some(url),
            PredictionOutput::Many(urls) => urls.into_iter().next(),
        };
        first.filter(|url| !url.is_empty())
    }
}

impl ReplicateProvider {
    pub fn new(config: &ProvidersConfig, model: &str) -> Result<Self> {
        let token = config
            .replicate_api_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Config("REPLICATE_API_TOKEN is not set".to_string()))?;

        let client = Client::builder()
            .timeout(config.timeout())
            .pool_max_idle_per_host(5)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: config.replicate_api_base.trim_end_matches('/').to_string(),
            token,
            model: model.to_string(),
            name: format!("replicate:{}", model),
            timeout: config.timeout(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        })
    }

    async fn create_prediction(&self, image: &[u8]) -> Result<Prediction> {
        let url = format!("{}/v1/models/{}/predictions", self.api_base, self.model);
        let data_url = format!("data:image/png;base64,{}", STANDARD.encode(image));

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&CreatePrediction {
                input: PredictionInput { image: &data_url },
            })
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        if status == StatusCode::UNPROCESSABLE_ENTITY || status == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::InvalidImage(format!("{} rejected input: {}", self.name, body)));
        }
        if !status.is_success() {
            return Err(Error::provider(format!(
                "{} createPrediction failed: HTTP {}",
                self.name, status
            )));
        }

        response
            .json::<Prediction>()
            .await
            .map_err(|e| Error::provider(format!("{} sent an unreadable prediction: {}", self.name, e)))
    }

    async fn get_prediction(&self, url: &str) -> Result<Prediction> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        if !response.status().is_success() {
            return Err(Error::provider(format!(
                "{} prediction status failed: HTTP {}",
                self.name,
                response.status()
            )));
        }

        response
            .json::<Prediction>()
            .await
            .map_err(|e| Error::provider(format!("{} sent an unreadable prediction: {}", self.name, e)))
    }

    async fn wait_for_output(&self, mut prediction: Prediction) -> Result<String> {
        loop {
            match prediction.status {
                PredictionStatus::Succeeded => {
                    return prediction
                        .output
                        .and_then(PredictionOutput::into_first)
                        .ok_or(Error::EmptyResult);
                }
                PredictionStatus::Failed | PredictionStatus::Canceled => {
                    let reason = prediction
                        .error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| format!("{:?}", prediction.status).to_lowercase());
                    return Err(Error::provider(format!(
                        "{} prediction {} failed: {}",
                        self.name, prediction.id, reason
                    )));
                }
                PredictionStatus::Starting | PredictionStatus::Processing => {
                    let get_url = prediction
                        .urls
                        .as_ref()
                        .map(|u| u.get.clone())
                        .unwrap_or_else(|| format!("{}/v1/predictions/{}", self.api_base, prediction.id));
                    sleep(self.poll_interval).await;
                    prediction = self.get_prediction(&get_url).await?;
                }
            }
        }
    }

    async fn download(&self, output: &str) -> Result<Vec<u8>> {
        if let Some(encoded) = output.strip_prefix("data:") {
            let payload = encoded
                .split_once(',')
                .map(|(_, data)| data)
                .ok_or(Error::EmptyResult)?;
            let bytes = STANDARD
                .decode(payload)
                .map_err(|e| Error::provider(format!("{} returned a bad data URL: {}", self.name, e)))?;
            return non_empty(bytes);
        }

        let response = self
            .client
            .get(output)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        if !response.status().is_success() {
            return Err(Error::provider(format!(
                "{} output download failed: HTTP {}",
                self.name,
                response.status()
            )));
        }
        let bytes = response.bytes().await.map_err(|e| self.request_error(e))?;
        non_empty(bytes.to_vec())
    }

    fn request_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::ProviderTimeout(self.timeout.as_secs())
        } else {
            Error::provider(format!("{}: {}", self.name, err))
        }
    }
}

fn non_empty(bytes: Vec<u8>) -> Result<Vec<u8>> {
    if bytes.is_empty() {
        Err(Error::EmptyResult)
    } else {
        Ok(bytes)
    }
}

#[async_trait]
impl RemovalProvider for ReplicateProvider {
    async fn remove(&self, image: &[u8], mode: Mode) -> Result<Vec<u8>> {
        tracing::debug!("{} removing background ({} bytes, mode {})", self.name, image.len(), mode);

        let run = async {
            let prediction = self.create_prediction(image).await?;
            tracing::debug!("{} prediction {} created", self.name, prediction.id);
            let output = self.wait_for_output(prediction).await?;
            self.download(&output).await
        };

        match timeout(self.timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(Error::ProviderTimeout(self.timeout.as_secs())),
        }
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/v1/models/{}", self.api_base, self.model);
        match self.client.get(&url).bearer_auth(&self.token).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
