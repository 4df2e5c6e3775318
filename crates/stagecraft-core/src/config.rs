//! Pipeline configuration
//!
//! [`PipelineConfig`] is an explicit context value: the controller and every
//! generator call receive it (or a piece of it) as an argument. Nothing here
//! is read from environment variables.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use stagecraft_artifact::Stage;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Pipeline configuration, loadable from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Artifact store directory
    pub store_root: PathBuf,
    pub retry: RetryPolicy,
    /// Per-call timeout for the external generator
    pub generation_timeout_secs: u64,
    /// Concurrent file generations during CODE_GEN
    pub codegen_workers: usize,
    pub cache: CacheConfig,
    pub generator: GeneratorSettings,
    /// Allowed tech stack entries for structured stages (case-insensitive)
    pub allowed_tech_stack: Option<Vec<String>>,
    /// Last stage `create` drives
    pub create_through: Stage,
    /// Default tracing filter directive
    pub log_filter: String,
    pub log_json: bool,
}

impl PipelineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    /// `Parse` on malformed TOML, `Invalid` if validation fails
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    ///
    /// # Errors
    /// `Io` if the file cannot be read, otherwise as [`Self::from_toml_str`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// `Invalid` naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.multiplier < 1.0 {
            return invalid("retry.multiplier must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return invalid("retry.jitter must be within [0, 1]");
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return invalid("retry.initial_backoff_ms exceeds retry.max_backoff_ms");
        }
        if self.generation_timeout_secs == 0 {
            return invalid("generation_timeout_secs must be positive");
        }
        if self.codegen_workers == 0 {
            return invalid("codegen_workers must be at least 1");
        }
        if self.cache.enabled && (self.cache.ttl_secs == 0 || self.cache.max_entries == 0) {
            return invalid("cache.ttl_secs and cache.max_entries must be positive when enabled");
        }
        if self.create_through == Stage::Brief {
            return invalid("create_through must be a generated stage");
        }
        if self.generator.max_tokens == 0 {
            return invalid("generator.max_tokens must be positive");
        }
        Ok(())
    }

    /// Generation timeout as a duration
    #[inline]
    #[must_use]
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    /// Whether a tech stack entry passes the allow-list
    #[must_use]
    pub fn allows_tech(&self, entry: &str) -> bool {
        self.allowed_tech_stack.as_ref().map_or(true, |allowed| {
            allowed.iter().any(|a| a.eq_ignore_ascii_case(entry.trim()))
        })
    }

    #[inline]
    #[must_use]
    pub fn with_store_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.store_root = root.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_generation_timeout_secs(mut self, secs: u64) -> Self {
        self.generation_timeout_secs = secs;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_codegen_workers(mut self, workers: usize) -> Self {
        self.codegen_workers = workers;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_generator(mut self, generator: GeneratorSettings) -> Self {
        self.generator = generator;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_allowed_tech_stack(mut self, allowed: Vec<String>) -> Self {
        self.allowed_tech_stack = Some(allowed);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_create_through(mut self, stage: Stage) -> Self {
        self.create_through = stage;
        self
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from(".stagecraft"),
            retry: RetryPolicy::default(),
            generation_timeout_secs: 120,
            codegen_workers: 4,
            cache: CacheConfig::default(),
            generator: GeneratorSettings::default(),
            allowed_tech_stack: None,
            create_through: Stage::CodeGen,
            log_filter: "info".to_string(),
            log_json: false,
        }
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction of it
    pub jitter: f64,
}

impl RetryPolicy {
    /// Policy that never waits between attempts
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Un-jittered delay after the `failed_attempts`-th failure
    #[must_use]
    pub fn base_delay(&self, failed_attempts: u32) -> Duration {
        let exponent = i32::try_from(failed_attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

/// Response cache settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: u64,
}

impl CacheConfig {
    #[inline]
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3_600,
            max_entries: 1_024,
        }
    }
}

/// Settings passed through to the external generator on every call
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Credential forwarded to the generator; never serialized or logged
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl GeneratorSettings {
    #[inline]
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            model: "claude-3-5-sonnet-20240620".to_string(),
            max_tokens: 4_096,
            temperature: 0.0,
            api_key: None,
        }
    }
}

impl std::fmt::Debug for GeneratorSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorSettings")
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
