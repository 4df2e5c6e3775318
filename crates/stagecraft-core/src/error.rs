//! Error types for the pipeline
//!
//! - [`GenerationError`]: a single external generation call failed
//! - [`ValidationError`]: generated output does not have the stage's shape
//! - [`PipelineError`]: everything a pipeline operation can surface
//! - [`ConfigError`]: configuration could not be loaded or is invalid

use stagecraft_artifact::{ArtifactKey, ProjectId, SchemaIssue, Stage, StoreError};
use stagecraft_graph::{GraphError, StaleReason};
use std::path::PathBuf;

/// Failure of one external generation call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// Network or service hiccup
    #[error("transient generator failure: {0}")]
    Transient(String),

    /// Service asked us to slow down
    #[error("rate limited by generator")]
    RateLimited {
        /// Service-suggested wait before the next attempt
        retry_after_ms: Option<u64>,
    },

    /// Call exceeded the configured timeout
    #[error("generator call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Request can never succeed as issued
    #[error("generator rejected request: {0}")]
    Permanent(String),
}

impl GenerationError {
    /// Check if another attempt may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

/// Generated output failed the stage's shape check
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{stage} output failed validation: {}", summarize(.issues))]
pub struct ValidationError {
    pub stage: Stage,
    /// CODE_GEN file the output was generated for
    pub file: Option<String>,
    pub issues: Vec<SchemaIssue>,
}

impl ValidationError {
    #[must_use]
    pub fn new(stage: Stage, issues: Vec<SchemaIssue>) -> Self {
        Self {
            stage,
            file: None,
            issues,
        }
    }

    /// Single-issue error
    #[must_use]
    pub fn single(stage: Stage, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(stage, vec![SchemaIssue::new(path, message)])
    }

    /// Attach the CODE_GEN file path
    #[must_use]
    pub fn for_file(mut self, path: impl Into<String>) -> Self {
        self.file = Some(path.into());
        self
    }
}

fn summarize(issues: &[SchemaIssue]) -> String {
    match issues {
        [] => "no detail".to_string(),
        [only] => only.to_string(),
        [first, rest @ ..] => format!("{first} (+{} more)", rest.len()),
    }
}

/// Pipeline operation errors
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// External generation exhausted its retries; a Failed record was written
    #[error("generation failed for {key} after {attempts} attempt(s): {source}")]
    Generation {
        key: ArtifactKey,
        attempts: u32,
        /// Version of the Failed record
        version: u32,
        #[source]
        source: GenerationError,
    },

    /// Output rejected; no version was created
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Another writer holds or already took the stage's next version
    #[error("version conflict on {project}/{stage}")]
    VersionConflict { project: ProjectId, stage: Stage },

    /// An ancestor must be regenerated first
    #[error("{stage} cannot proceed: {reason}")]
    StaleInput { stage: Stage, reason: StaleReason },

    /// A dependency has never succeeded
    #[error("{stage} requires a succeeded {dependency} artifact")]
    MissingDependency { stage: Stage, dependency: Stage },

    /// Request is malformed for the current project state
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Caller cancelled; nothing was written
    #[error("{stage} cancelled")]
    Cancelled { stage: Stage },

    /// A multi-stage command stopped part-way; the project keeps every
    /// version written so far
    #[error("pipeline halted for project {project}: {source}")]
    Halted {
        project: ProjectId,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// Check if the caller may retry the operation as-is or after adjusting
    /// its context
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Halted { source, .. } => source.is_retryable(),
            other => matches!(
                other,
                Self::Generation { .. }
                    | Self::Validation(_)
                    | Self::VersionConflict { .. }
                    | Self::Cancelled { .. }
            ),
        }
    }

    /// Check if an ancestor has to be regenerated first
    #[inline]
    #[must_use]
    pub fn is_stale_input(&self) -> bool {
        match self {
            Self::Halted { source, .. } => source.is_stale_input(),
            other => matches!(other, Self::StaleInput { .. }),
        }
    }

    /// Error that stopped a halted command, or `self`
    #[must_use]
    pub fn root(&self) -> &PipelineError {
        match self {
            Self::Halted { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { key, .. } => Self::VersionConflict {
                project: key.project,
                stage: key.stage,
            },
            other => Self::Store(other),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_permanent_generation_errors_are_final() {
        assert!(GenerationError::Transient("reset".into()).is_retryable());
        assert!(GenerationError::RateLimited { retry_after_ms: None }.is_retryable());
        assert!(GenerationError::Timeout { secs: 5 }.is_retryable());
        assert!(!GenerationError::Permanent("bad key".into()).is_retryable());
    }

    #[test]
    fn store_conflicts_surface_as_version_conflicts() {
        let key = ArtifactKey::stage(ProjectId::new("demo").unwrap(), Stage::Scaffold);
        let err: PipelineError = StoreError::VersionConflict {
            key,
            expected: 2,
            actual: 3,
        }
        .into();
        assert!(matches!(
            err,
            PipelineError::VersionConflict {
                stage: Stage::Scaffold,
                ..
            }
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn validation_message_summarizes_issues() {
        let err = ValidationError::new(
            Stage::Scaffold,
            vec![
                SchemaIssue::new("features", "at least one feature is required"),
                SchemaIssue::new("tech_stack", "at least one entry is required"),
            ],
        );
        let expected = "scaffold output failed validation: \
                        features: at least one feature is required (+1 more)";
        assert_eq!(err.to_string(), expected);
    }
}
