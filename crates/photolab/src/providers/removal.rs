//! Removal provider trait and the mode to provider mapping

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{ProviderSpec, ProvidersConfig};
use crate::error::Result;
use crate::types::Mode;

use super::local::LocalRuntimeProvider;
use super::replicate::ReplicateProvider;

/// Trait for background removal backends
///
/// Implementations:
/// - `ReplicateProvider`: hosted models on Replicate, prediction polling
/// - `LocalRuntimeProvider`: rembg-compatible model runtime over HTTP
///
/// A call either returns the processed image or fails; callers never retry.
#[async_trait]
pub trait RemovalProvider: Send + Sync {
    /// Remove the background of a prepared PNG image
    async fn remove(&self, image: &[u8], mode: Mode) -> Result<Vec<u8>>;

    /// Check if the provider is reachable
    async fn health_check(&self) -> Result<bool>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}

/// Providers selected by mode
#[derive(Clone)]
pub struct ProviderSet {
    quality: Arc<dyn RemovalProvider>,
    fast: Arc<dyn RemovalProvider>,
}

impl ProviderSet {
    pub fn new(quality: Arc<dyn RemovalProvider>, fast: Arc<dyn RemovalProvider>) -> Self {
        Self { quality, fast }
    }

    /// Use the same provider for both modes
    pub fn uniform(provider: Arc<dyn RemovalProvider>) -> Self {
        Self {
            quality: Arc::clone(&provider),
            fast: provider,
        }
    }

    /// Build providers from configuration
    pub fn from_config(config: &ProvidersConfig) -> Result<Self> {
        let quality = build_provider(config, &config.quality)?;
        let fast = if config.fast == config.quality {
            Arc::clone(&quality)
        } else {
            build_provider(config, &config.fast)?
        };

        tracing::info!(
            "Removal providers: quality -> {}, fast -> {}",
            quality.name(),
            fast.name()
        );
        Ok(Self { quality, fast })
    }

    pub fn for_mode(&self, mode: Mode) -> &Arc<dyn RemovalProvider> {
        match mode {
            Mode::Quality => &self.quality,
            Mode::Fast => &self.fast,
        }
    }

    /// Run the provider configured for `mode`
    pub async fn remove(&self, image: &[u8], mode: Mode) -> Result<Vec<u8>> {
        self.for_mode(mode).remove(image, mode).await
    }
}

fn build_provider(config: &ProvidersConfig, spec: &ProviderSpec) -> Result<Arc<dyn RemovalProvider>> {
    let provider: Arc<dyn RemovalProvider> = match spec {
        ProviderSpec::Replicate { model } => Arc::new(ReplicateProvider::new(config, model)?),
        ProviderSpec::Local { base_url, model } => {
            Arc::new(LocalRuntimeProvider::new(base_url, model, config.timeout())?)
        }
    };
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Answers with its own name so the caller can tell which one ran
    struct NamedProvider(&'static str);

    #[async_trait]
    impl RemovalProvider for NamedProvider {
        async fn remove(&self, _image: &[u8], mode: Mode) -> Result<Vec<u8>> {
            Ok(format!("{}:{}", self.0, mode).into_bytes())
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    #[tokio::test]
    async fn test_modes_reach_their_own_provider() {
        let providers = ProviderSet::new(
            Arc::new(NamedProvider("precise")),
            Arc::new(NamedProvider("quick")),
        );

        assert_eq!(providers.for_mode(Mode::Quality).name(), "precise");
        assert_eq!(providers.for_mode(Mode::Fast).name(), "quick");
        assert_eq!(providers.remove(b"img", Mode::Quality).await.unwrap(), b"precise:quality");
        assert_eq!(providers.remove(b"img", Mode::Fast).await.unwrap(), b"quick:fast");
    }

    #[test]
    fn test_same_spec_builds_one_provider() {
        let config = ProvidersConfig {
            quality: ProviderSpec::Local {
                base_url: "http://localhost:7000".to_string(),
                model: "u2net".to_string(),
            },
            fast: ProviderSpec::Local {
                base_url: "http://localhost:7000".to_string(),
                model: "u2net".to_string(),
            },
            ..ProvidersConfig::default()
        };
        let providers = ProviderSet::from_config(&config).unwrap();
        assert!(Arc::ptr_eq(
            providers.for_mode(Mode::Quality),
            providers.for_mode(Mode::Fast)
        ));
    }
}
