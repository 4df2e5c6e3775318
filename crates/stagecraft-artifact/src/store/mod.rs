//! Durable, versioned artifact storage
//!
//! [`ArtifactStore`] is the append-only log behind every pipeline stage.
//! Two implementations ship with the crate:
//! - [`InMemoryArtifactStore`] for tests and ephemeral runs
//! - [`FsArtifactStore`] which persists each version as its own file using
//!   write-then-publish, so a torn write is never visible to readers
//!
//! # Contract
//! - `put` allocates the next version of the draft's lineage atomically
//! - a draft carrying `expected_version` fails with `VersionConflict` when the
//!   lineage has already moved past it; nothing is overwritten
//! - `history` is version-ascending and gapless from 1

mod fs;
mod memory;

pub use fs::FsArtifactStore;
pub use memory::InMemoryArtifactStore;

use crate::artifact::{Artifact, ArtifactDraft, ArtifactKey, ProjectId, ProjectRecord};
use crate::manifest::ProjectManifest;
use std::path::PathBuf;

/// Storage backend for artifacts, projects and manifests
pub trait ArtifactStore: Send + Sync + std::fmt::Debug {
    /// Register a new project (staging or published)
    ///
    /// # Errors
    /// `ProjectExists` if the id is taken
    fn create_project(&self, id: &ProjectId) -> Result<ProjectRecord, StoreError>;

    /// Project metadata, if the project exists
    fn project(&self, id: &ProjectId) -> Result<Option<ProjectRecord>, StoreError>;

    /// Published projects (staging projects are excluded)
    fn list_projects(&self) -> Result<Vec<ProjectId>, StoreError>;

    /// Atomically move a staging project to its published identity
    ///
    /// # Errors
    /// `UnknownProject` if `staging` does not exist, `ProjectExists` if
    /// `name` is taken
    fn publish(&self, staging: &ProjectId, name: &ProjectId) -> Result<ProjectRecord, StoreError>;

    /// Append the next version of a lineage
    ///
    /// # Errors
    /// `UnknownProject`, `VersionConflict`, or I/O failures
    fn put(&self, draft: ArtifactDraft) -> Result<Artifact, StoreError>;

    /// Exact version of a lineage
    ///
    /// # Errors
    /// `NotFound` if the version does not exist
    fn get(&self, key: &ArtifactKey, version: u32) -> Result<Artifact, StoreError>;

    /// Highest version of any status
    fn latest(&self, key: &ArtifactKey) -> Result<Option<Artifact>, StoreError>;

    /// Every version, ascending
    fn history(&self, key: &ArtifactKey) -> Result<Vec<Artifact>, StoreError>;

    /// Highest succeeded version
    fn current(&self, key: &ArtifactKey) -> Result<Option<Artifact>, StoreError> {
        Ok(self
            .history(key)?
            .into_iter()
            .rev()
            .find(Artifact::is_succeeded))
    }

    /// Paths of every per-file CODE_GEN lineage in the project
    fn file_lineages(&self, project: &ProjectId) -> Result<Vec<String>, StoreError>;

    /// Last written manifest
    fn read_manifest(&self, project: &ProjectId) -> Result<Option<ProjectManifest>, StoreError>;

    /// Replace the manifest
    fn write_manifest(&self, manifest: &ProjectManifest) -> Result<(), StoreError>;
}

/// Next version for a lineage whose highest version is `highest`, honoring
/// the draft's expectation
pub(crate) fn allocate_version(
    draft: &ArtifactDraft,
    highest: Option<u32>,
) -> Result<u32, StoreError> {
    let next = highest.map_or(1, |v| v + 1);
    match draft.expected_version {
        Some(expected) if expected != next => Err(StoreError::VersionConflict {
            key: draft.key.clone(),
            expected,
            actual: next,
        }),
        _ => Ok(next),
    }
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Requested version does not exist
    #[error("artifact not found: {key} v{version}")]
    NotFound { key: ArtifactKey, version: u32 },

    /// Another writer already published the expected version
    #[error("version conflict on {key}: expected v{expected}, next is v{actual}")]
    VersionConflict {
        key: ArtifactKey,
        expected: u32,
        actual: u32,
    },

    /// Project id already in use
    #[error("project already exists: {0}")]
    ProjectExists(ProjectId),

    /// Project was never created
    #[error("unknown project: {0}")]
    UnknownProject(ProjectId),

    /// Filesystem failure
    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Record (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored data violates an invariant
    #[error("corrupt store: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this is a lost race on version allocation
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}
