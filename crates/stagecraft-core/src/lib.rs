//! Stagecraft pipeline core
//!
//! Turns a natural-language brief into a generated codebase through a fixed
//! sequence of stages, each producing a versioned artifact that later
//! stages consume.
//!
//! # Core Concepts
//!
//! - [`Pipeline`]: the command surface (`create`, `refine`, `resume`,
//!   `status`, version browsing)
//! - [`PipelineController`]: advances, regenerates and resumes single stages
//! - [`CodeGenOrchestrator`]: fans CODE_GEN out into one lineage per file
//!   and aggregates the outcome
//! - [`ExternalGenerator`]: the seam to the model that produces stage output
//! - [`PipelineConfig`]: retry, timeout, concurrency, cache and generator
//!   settings loaded from TOML
//!
//! Storage and staleness live in `stagecraft-artifact` and
//! `stagecraft-graph`; the types callers need from them are re-exported
//! here.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod codegen;
mod config;
mod controller;
mod error;
mod generator;
mod logging;
mod pipeline;
mod retry;
mod state;
mod validate;

pub use codegen::{CodeGenManifest, CodeGenOrchestrator, FileOutcome, FileRecord};
pub use config::{CacheConfig, GeneratorSettings, PipelineConfig, RetryPolicy};
pub use controller::PipelineController;
pub use error::{ConfigError, GenerationError, PipelineError, ValidationError};
pub use generator::{AncestorArtifact, CachingGenerator, ExternalGenerator, GenerationRequest};
pub use logging::init_tracing;
pub use pipeline::Pipeline;
pub use state::{PipelineState, StageReport};
pub use validate::{parse_requirements, validate_code, validate_structured, validate_text};

pub use stagecraft_artifact::{
    Artifact, ArtifactKey, ArtifactStatus, ArtifactStore, FsArtifactStore, InMemoryArtifactStore,
    ProjectId, ProjectRequirements, Stage, StoreError,
};
pub use stagecraft_graph::{FileState, FileUnit, StageGraph, StaleReason};

/// Re-exported for callers passing cancellation tokens
pub use tokio_util::sync::CancellationToken;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
