//! Configuration for the photolab service

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::Mode;

/// Environment variable naming an optional TOML config file
pub const CONFIG_PATH_ENV: &str = "PHOTOLAB_CONFIG";

/// Main service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PhotolabConfig {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Upload validation and preparation limits
    pub images: ImageConfig,
    /// Job queue configuration
    pub queue: QueueConfig,
    /// Batch worker configuration
    pub worker: WorkerConfig,
    /// Mode to removal provider mapping
    pub providers: ProvidersConfig,
    /// Result storage configuration
    pub storage: StorageConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Enable permissive CORS
    pub enable_cors: bool,
    /// Run batch workers inside the API process
    pub embedded_workers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            enable_cors: true,
            embedded_workers: true,
        }
    }
}

/// Image validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Maximum accepted upload size in bytes (default: 15MB)
    pub max_upload_bytes: usize,
    /// Larger side is downsampled to this many pixels (default: 3072)
    pub max_dimension: u32,
    /// Maximum number of images per batch
    pub max_batch_items: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 15 * 1024 * 1024,
            max_dimension: 3072,
            max_batch_items: 50,
        }
    }
}

impl ImageConfig {
    /// Request body ceiling for a whole batch upload
    pub fn max_request_bytes(&self) -> usize {
        // multipart framing overhead on top of the raw images
        self.max_upload_bytes
            .saturating_mul(self.max_batch_items.max(1))
            .saturating_add(1024 * 1024)
    }
}

/// Job queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// SQLite database shared by API and worker processes
    pub database_path: PathBuf,
    /// Timeout applied when a submission does not request one
    pub default_job_timeout_secs: u64,
    /// Upper bound for any requested job timeout
    pub max_job_timeout_secs: u64,
    /// How long terminal jobs stay readable
    pub result_ttl_secs: u64,
    /// Dequeue poll interval for jobs enqueued by other processes
    pub poll_interval_ms: u64,
    /// Interval of the retention sweep
    pub maintenance_interval_secs: u64,
    /// Extra time after a job's timeout before a started job counts as abandoned
    pub abandoned_grace_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let database_path = dirs::data_local_dir()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
            .join("photolab")
            .join("queue.db");

        Self {
            database_path,
            default_job_timeout_secs: 600,
            max_job_timeout_secs: 3600,
            result_ttl_secs: 24 * 3600,
            poll_interval_ms: 1000,
            maintenance_interval_secs: 60,
            abandoned_grace_secs: 120,
        }
    }
}

impl QueueConfig {
    /// Resolve a requested timeout against the default and the ceiling
    pub fn job_timeout(&self, requested_secs: Option<u64>) -> Duration {
        let secs = requested_secs
            .filter(|s| *s > 0)
            .unwrap_or(self.default_job_timeout_secs)
            .min(self.max_job_timeout_secs);
        Duration::from_secs(secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}

/// What the worker does when one item of a batch fails
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ItemFailurePolicy {
    /// Fail the whole job on the first failing item
    #[default]
    Abort,
    /// Record the failure for that item and keep going
    Record,
}

/// Batch worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of independent worker loops per process
    pub concurrency: Option<usize>,
    /// Per-item failure handling
    pub item_failure: ItemFailurePolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: None, // Auto-detect from CPU count
            item_failure: ItemFailurePolicy::Abort,
        }
    }
}

impl WorkerConfig {
    pub fn worker_count(&self) -> usize {
        self.concurrency
            .unwrap_or_else(|| num_cpus::get().min(4))
            .max(1)
    }
}

/// A removal backend and its model selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderSpec {
    /// Replicate hosted model, `owner/name`
    Replicate { model: String },
    /// rembg-compatible local runtime
    Local { base_url: String, model: String },
}

/// Mode to provider mapping plus shared provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Provider for `quality` mode
    pub quality: ProviderSpec,
    /// Provider for `fast` mode
    pub fast: ProviderSpec,
    /// Replicate API base URL
    pub replicate_api_base: String,
    /// Replicate API token
    pub replicate_api_token: Option<String>,
    /// Time budget for one removal call in seconds
    pub timeout_secs: u64,
    /// Interval between prediction status polls in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            quality: ProviderSpec::Replicate {
                model: "851-labs/background-remover".to_string(),
            },
            fast: ProviderSpec::Replicate {
                model: "lucataco/remove-bg".to_string(),
            },
            replicate_api_base: "https://api.replicate.com".to_string(),
            replicate_api_token: None,
            timeout_secs: 120,
            poll_interval_ms: 1000,
        }
    }
}

impl ProvidersConfig {
    pub fn spec_for(&self, mode: Mode) -> &ProviderSpec {
        match mode {
            Mode::Quality => &self.quality,
            Mode::Fast => &self.fast,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Where worker output goes
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Embed results in the job record as data URLs
    #[default]
    Inline,
    /// Write results to the local object store and hand out signed links
    Local,
}

/// Result storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory of the local object store
    pub root: PathBuf,
    /// Externally reachable base URL used in temporary links
    pub public_base_url: String,
    /// Lifetime of temporary links in seconds; must cover `queue.result_ttl_secs`
    pub link_ttl_secs: u64,
    /// Secret used to sign temporary links
    pub signing_secret: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let root = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photolab")
            .join("objects");

        Self {
            backend: StorageBackend::Inline,
            root,
            public_base_url: "http://localhost:8080".to_string(),
            link_ttl_secs: 24 * 3600,
            signing_secret: "change-me".to_string(),
        }
    }
}

impl PhotolabConfig {
    /// Load configuration: defaults, then the optional TOML file, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid config: {}", e)))
    }

    /// Apply environment overrides through a lookup function
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("REPLICATE_API_TOKEN") {
            self.providers.replicate_api_token = Some(token);
        }
        if let Some(model) = lookup("REPLICATE_MODEL_QUALITY") {
            self.providers.quality = ProviderSpec::Replicate { model };
        }
        if let Some(model) = lookup("REPLICATE_MODEL_FAST") {
            self.providers.fast = ProviderSpec::Replicate { model };
        }
        if let Some(mb) = lookup("MAX_FILE_SIZE_MB") {
            let mb: usize = parse_env("MAX_FILE_SIZE_MB", &mb)?;
            self.images.max_upload_bytes = mb.checked_mul(1024 * 1024).ok_or_else(|| {
                Error::Config(format!("MAX_FILE_SIZE_MB is too large: {}", mb))
            })?;
        }
        if let Some(dim) = lookup("MAX_DIMENSION") {
            self.images.max_dimension = parse_env("MAX_DIMENSION", &dim)?;
        }
        if let Some(path) = lookup("PHOTOLAB_QUEUE_PATH") {
            self.queue.database_path = PathBuf::from(path);
        }
        if let Some(host) = lookup("PHOTOLAB_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PHOTOLAB_PORT") {
            self.server.port = parse_env("PHOTOLAB_PORT", &port)?;
        }
        if let Some(workers) = lookup("PHOTOLAB_WORKERS") {
            self.worker.concurrency = Some(parse_env("PHOTOLAB_WORKERS", &workers)?);
        }
        Ok(())
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.images.max_upload_bytes == 0 {
            return Err(Error::Config("images.max_upload_bytes must be > 0".to_string()));
        }
        if self.images.max_dimension == 0 {
            return Err(Error::Config("images.max_dimension must be > 0".to_string()));
        }
        if self.images.max_batch_items == 0 {
            return Err(Error::Config("images.max_batch_items must be > 0".to_string()));
        }
        if self.queue.max_job_timeout_secs == 0 {
            return Err(Error::Config("queue.max_job_timeout_secs must be > 0".to_string()));
        }
        // links handed out by the status API must outlive the job record
        if self.storage.backend == StorageBackend::Local
            && self.storage.link_ttl_secs < self.queue.result_ttl_secs
        {
            return Err(Error::Config(format!(
                "storage.link_ttl_secs ({}) must be >= queue.result_ttl_secs ({})",
                self.storage.link_ttl_secs, self.queue.result_ttl_secs
            )));
        }

        let uses_replicate = [&self.providers.quality, &self.providers.fast]
            .iter()
            .any(|spec| matches!(spec, ProviderSpec::Replicate { .. }));
        let has_token = self
            .providers
            .replicate_api_token
            .as_deref()
            .is_some_and(|t| !t.is_empty());
        if uses_replicate && !has_token {
            return Err(Error::Config(
                "REPLICATE_API_TOKEN is required when a mode uses the replicate provider".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} has an invalid value: '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_overrides_use_original_names() {
        let env: HashMap<&str, &str> = [
            ("REPLICATE_API_TOKEN", "r8_test"),
            ("REPLICATE_MODEL_FAST", "someone/fast-model"),
            ("MAX_FILE_SIZE_MB", "2"),
            ("MAX_DIMENSION", "1024"),
        ]
        .into_iter()
        .collect();

        let mut config = PhotolabConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.providers.replicate_api_token.as_deref(), Some("r8_test"));
        assert_eq!(
            config.providers.fast,
            ProviderSpec::Replicate { model: "someone/fast-model".to_string() }
        );
        assert_eq!(config.images.max_upload_bytes, 2 * 1024 * 1024);
        assert_eq!(config.images.max_dimension, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_env_value_is_config_error() {
        let mut config = PhotolabConfig::default();
        let err = config
            .apply_env(|k| (k == "MAX_DIMENSION").then(|| "huge".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_oversized_file_limit_is_config_error() {
        let mut config = PhotolabConfig::default();
        let huge = usize::MAX.to_string();
        let err = config
            .apply_env(|k| (k == "MAX_FILE_SIZE_MB").then(|| huge.clone()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("MAX_FILE_SIZE_MB")));
    }

    #[test]
    fn test_local_links_must_outlive_results() {
        let mut config = PhotolabConfig::default();
        config.providers.replicate_api_token = Some("r8_test".to_string());
        config.storage.backend = StorageBackend::Local;
        assert!(config.validate().is_ok());

        config.storage.link_ttl_secs = 3600;
        assert!(matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("link_ttl_secs")));

        config.queue.result_ttl_secs = 3600;
        assert!(config.validate().is_ok());

        // inline results carry no links
        config.storage.backend = StorageBackend::Inline;
        config.queue.result_ttl_secs = 24 * 3600;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_replicate_without_token_is_rejected() {
        let config = PhotolabConfig::default();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_toml_with_local_providers() {
        let config = PhotolabConfig::from_toml(
            r#"
            [images]
            max_dimension = 512

            [worker]
            concurrency = 2
            item_failure = "record"

            [providers.quality]
            kind = "local"
            base_url = "http://localhost:7000"
            model = "isnet-general-use"

            [providers.fast]
            kind = "local"
            base_url = "http://localhost:7000"
            model = "u2netp"
            "#,
        )
        .unwrap();

        assert_eq!(config.images.max_dimension, 512);
        assert_eq!(config.images.max_upload_bytes, 15 * 1024 * 1024);
        assert_eq!(config.worker.worker_count(), 2);
        assert_eq!(config.worker.item_failure, ItemFailurePolicy::Record);
        assert!(matches!(config.providers.spec_for(Mode::Fast), ProviderSpec::Local { model, .. } if model == "u2netp"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_job_timeout_is_capped() {
        let queue = QueueConfig::default();
        assert_eq!(queue.job_timeout(None), Duration::from_secs(600));
        assert_eq!(queue.job_timeout(Some(30)), Duration::from_secs(30));
        assert_eq!(queue.job_timeout(Some(0)), Duration::from_secs(600));
        assert_eq!(queue.job_timeout(Some(100_000)), Duration::from_secs(3600));
    }
}
