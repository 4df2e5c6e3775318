//! External generator contract
//!
//! The pipeline never produces content itself. Every stage output comes from
//! an [`ExternalGenerator`] given the stage, its context and the ancestor
//! artifacts it depends on. [`CachingGenerator`] wraps any generator with a
//! time-bounded response cache.

use crate::config::{CacheConfig, GeneratorSettings};
use crate::error::GenerationError;
use async_trait::async_trait;
use moka::future::Cache;
use serde::Serialize;
use stagecraft_artifact::{Artifact, ContentHash, Fingerprint, Stage};
use stagecraft_graph::FileUnit;
use std::sync::Arc;

/// Ancestor artifact handed to the generator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AncestorArtifact {
    pub stage: Stage,
    pub version: u32,
    pub payload: String,
}

impl From<&Artifact> for AncestorArtifact {
    fn from(artifact: &Artifact) -> Self {
        Self {
            stage: artifact.stage(),
            version: artifact.version,
            payload: artifact.payload.clone(),
        }
    }
}

/// Everything the generator needs to produce one stage output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationRequest {
    pub stage: Stage,
    /// Current project brief
    pub brief: String,
    /// Refinement feedback; absent on first generation
    pub feedback: Option<String>,
    /// Output being refined, when feedback is given
    pub previous: Option<String>,
    /// Current artifacts of the stage's dependencies, in stage order
    pub ancestors: Vec<AncestorArtifact>,
    /// CODE_GEN file being generated
    pub file: Option<FileUnit>,
}

impl GenerationRequest {
    #[must_use]
    pub fn new(stage: Stage, brief: impl Into<String>) -> Self {
        Self {
            stage,
            brief: brief.into(),
            feedback: None,
            previous: None,
            ancestors: Vec::new(),
            file: None,
        }
    }

    #[must_use]
    pub fn with_ancestors(mut self, ancestors: Vec<AncestorArtifact>) -> Self {
        self.ancestors = ancestors;
        self
    }

    #[must_use]
    pub fn with_feedback(
        mut self,
        feedback: impl Into<String>,
        previous: impl Into<String>,
    ) -> Self {
        self.feedback = Some(feedback.into());
        self.previous = Some(previous.into());
        self
    }

    #[must_use]
    pub fn with_file(mut self, unit: FileUnit) -> Self {
        self.file = Some(unit);
        self
    }

    /// Payload of a dependency's artifact, if supplied
    #[must_use]
    pub fn ancestor(&self, stage: Stage) -> Option<&str> {
        self.ancestors
            .iter()
            .find(|a| a.stage == stage)
            .map(|a| a.payload.as_str())
    }

    /// Cache key: the request plus the settings that shape the output
    fn cache_key(&self, settings: &GeneratorSettings) -> Result<ContentHash, GenerationError> {
        let fp = Fingerprint::new("generation")
            .with_json(self)
            .map_err(|e| GenerationError::Permanent(format!("unencodable request: {e}")))?
            .with_str(&settings.model)
            .with_str(&settings.max_tokens.to_string())
            .with_str(&settings.temperature.to_string());
        Ok(fp.finish())
    }
}

/// Produces raw stage content
#[async_trait]
pub trait ExternalGenerator: Send + Sync + std::fmt::Debug {
    /// Generate raw output for `request`
    ///
    /// # Errors
    /// Any [`GenerationError`]; retryable kinds are retried by the caller
    async fn generate(
        &self,
        settings: &GeneratorSettings,
        request: &GenerationRequest,
    ) -> Result<String, GenerationError>;

    /// Told that the output last produced for `request` failed validation
    async fn reject(&self, _settings: &GeneratorSettings, _request: &GenerationRequest) {}
}

/// Generator decorator caching successful responses with a TTL
///
/// A response the pipeline rejects is evicted, so the next attempt reaches
/// the inner generator.
#[derive(Debug, Clone)]
pub struct CachingGenerator {
    inner: Arc<dyn ExternalGenerator>,
    cache: Cache<ContentHash, Arc<str>>,
}

impl CachingGenerator {
    #[must_use]
    pub fn new(inner: Arc<dyn ExternalGenerator>, config: &CacheConfig) -> Self {
        Self {
            inner,
            cache: Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(config.ttl())
                .build(),
        }
    }

    /// Wrap `inner` only when caching is enabled
    #[must_use]
    pub fn wrap(
        inner: Arc<dyn ExternalGenerator>,
        config: &CacheConfig,
    ) -> Arc<dyn ExternalGenerator> {
        if config.enabled {
            Arc::new(Self::new(inner, config))
        } else {
            inner
        }
    }
}

#[async_trait]
impl ExternalGenerator for CachingGenerator {
    async fn generate(
        &self,
        settings: &GeneratorSettings,
        request: &GenerationRequest,
    ) -> Result<String, GenerationError> {
        let key = request.cache_key(settings)?;
        if let Some(hit) = self.cache.get(&key).await {
            tracing::debug!(stage = %request.stage, key = %key.short(), "generator cache hit");
            return Ok(hit.to_string());
        }
        let output = self.inner.generate(settings, request).await?;
        self.cache.insert(key, Arc::from(output.as_str())).await;
        Ok(output)
    }

    async fn reject(&self, settings: &GeneratorSettings, request: &GenerationRequest) {
        if let Ok(key) = request.cache_key(settings) {
            self.cache.invalidate(&key).await;
            tracing::debug!(
                stage = %request.stage,
                key = %key.short(),
                "evicted rejected response"
            );
        }
        self.inner.reject(settings, request).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExternalGenerator for Counting {
        async fn generate(
            &self,
            _settings: &GeneratorSettings,
            request: &GenerationRequest,
        ) -> Result<String, GenerationError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if request.brief == "fail" {
                return Err(GenerationError::Transient("boom".into()));
            }
            Ok(format!("{} #{n}", request.stage))
        }
    }

    #[tokio::test]
    async fn identical_requests_hit_the_cache() {
        let inner = Arc::new(Counting::default());
        let cached = CachingGenerator::new(inner.clone(), &CacheConfig::default());
        let settings = GeneratorSettings::default();
        let request = GenerationRequest::new(Stage::RequirementsText, "todo app");

        let first = cached.generate(&settings, &request).await.unwrap();
        let second = cached.generate(&settings, &request).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        let other_model = settings.clone().with_model("other");
        cached.generate(&other_model, &request).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let inner = Arc::new(Counting::default());
        let cached = CachingGenerator::new(inner.clone(), &CacheConfig::default());
        let settings = GeneratorSettings::default();
        let request = GenerationRequest::new(Stage::RequirementsText, "fail");
        assert!(cached.generate(&settings, &request).await.is_err());
        assert!(cached.generate(&settings, &request).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejected_response_is_regenerated() {
        let inner = Arc::new(Counting::default());
        let cached = CachingGenerator::new(inner.clone(), &CacheConfig::default());
        let settings = GeneratorSettings::default();
        let request = GenerationRequest::new(Stage::RequirementsText, "todo app");

        let first = cached.generate(&settings, &request).await.unwrap();
        cached.reject(&settings, &request).await;
        let second = cached.generate(&settings, &request).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);

        let third = cached.generate(&settings, &request).await.unwrap();
        assert_eq!(second, third);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disabled_cache_passes_through() {
        let inner: Arc<dyn ExternalGenerator> = Arc::new(Counting::default());
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let wrapped = CachingGenerator::wrap(Arc::clone(&inner), &config);
        assert!(Arc::ptr_eq(&wrapped, &inner));
    }

    #[test]
    fn ancestor_lookup_by_stage() {
        let request = GenerationRequest::new(Stage::Scaffold, "brief").with_ancestors(vec![
            AncestorArtifact {
                stage: Stage::RequirementsStructured,
                version: 2,
                payload: "{}".into(),
            },
        ]);
        assert_eq!(request.ancestor(Stage::RequirementsStructured), Some("{}"));
        assert_eq!(request.ancestor(Stage::Brief), None);
    }
}
