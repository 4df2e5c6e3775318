//! Testing utilities for the Stagecraft workspace
//!
//! Shared test helpers, fixtures, and a scripted generator.

#![allow(missing_docs)]

mod fixtures;
mod scripted;

pub use fixtures::{requirements, requirements_json, ABC_FILES, FIXTURE_ROOT};
pub use scripted::{RecordedCall, ScriptedGenerator};

use stagecraft_core::{
    ArtifactStore, CacheConfig, InMemoryArtifactStore, Pipeline, PipelineConfig,
    PipelineController, RetryPolicy,
};
use std::sync::Arc;

/// Config with immediate retries and no response cache
#[must_use]
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::new().with_retry(RetryPolicy::immediate(2));
    config.cache.enabled = false;
    config
}

/// [`test_config`] with the default response cache switched on
#[must_use]
pub fn cached_config() -> PipelineConfig {
    let mut config = test_config();
    config.cache = CacheConfig::default();
    config
}

/// Controller over a fresh in-memory store
#[must_use]
pub fn setup_controller(
    generator: Arc<ScriptedGenerator>,
    config: PipelineConfig,
) -> PipelineController {
    let store: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::new());
    PipelineController::new(store, generator, config)
}

/// Pipeline over a fresh in-memory store
#[must_use]
pub fn setup_pipeline(generator: Arc<ScriptedGenerator>, config: PipelineConfig) -> Pipeline {
    Pipeline::new(setup_controller(generator, config))
}
