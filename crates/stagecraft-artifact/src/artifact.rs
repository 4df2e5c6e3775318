//! Versioned artifact records
//!
//! An [`Artifact`] is the immutable output of one generation attempt for a
//! lineage, identified by an [`ArtifactKey`] and a per-lineage version.
//!
//! # Invariants
//! - Records are append-only; a published record is never rewritten
//! - Versions within a lineage start at 1 and have no gaps
//! - `payload_hash` is always `ContentHash::compute(payload)`

use crate::hash::ContentHash;
use crate::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use ulid::Ulid;

const STAGING_PREFIX: &str = "staging-";

/// Project identity
///
/// Doubles as a storage directory name, so it is restricted to
/// `[a-z0-9_-]` and never starts with `.`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectId(String);

impl ProjectId {
    /// Create a project id, rejecting names that are not storage-safe
    ///
    /// # Errors
    /// Returns error if the name is empty or contains disallowed characters
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidProjectId> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= 128
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if valid {
            Ok(Self(name))
        } else {
            Err(InvalidProjectId(name))
        }
    }

    /// Derive a project id from a free-form display name
    ///
    /// Lowercases, maps every run of non-alphanumerics to `-` and trims the
    /// ends, so `"My Todo App!"` becomes `my-todo-app`.
    ///
    /// # Errors
    /// Returns error if nothing alphanumeric remains
    pub fn from_display_name(name: &str) -> Result<Self, InvalidProjectId> {
        let mut slug = String::with_capacity(name.len());
        let mut pending_dash = false;
        for c in name.chars() {
            if c.is_ascii_alphanumeric() {
                if pending_dash && !slug.is_empty() {
                    slug.push('-');
                }
                pending_dash = false;
                slug.push(c.to_ascii_lowercase());
            } else {
                pending_dash = true;
            }
        }
        slug.truncate(128);
        Self::new(slug).map_err(|_| InvalidProjectId(name.to_string()))
    }

    /// Fresh staging identity for a project that has not been published yet
    #[must_use]
    pub fn staging() -> Self {
        Self(format!(
            "{STAGING_PREFIX}{}",
            Ulid::new().to_string().to_ascii_lowercase()
        ))
    }

    /// Whether this id names an unpublished staging project
    #[inline]
    #[must_use]
    pub fn is_staging(&self) -> bool {
        self.0.starts_with(STAGING_PREFIX)
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ProjectId {
    type Error = InvalidProjectId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ProjectId> for String {
    fn from(value: ProjectId) -> Self {
        value.0
    }
}

/// Project name is not a valid identity
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid project id: {0:?}")]
pub struct InvalidProjectId(pub String);

/// Project metadata, written once when the project is first staged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    /// Project identity
    pub id: ProjectId,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Staging id this project was published from, if any
    pub published_from: Option<ProjectId>,
}

/// Identifies one version lineage
///
/// Stage lineages have `file == None`. CODE_GEN additionally owns one lineage
/// per generated file, keyed by the file's path in the scaffold tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub project: ProjectId,
    pub stage: Stage,
    pub file: Option<String>,
}

impl ArtifactKey {
    /// Stage-level lineage
    #[inline]
    #[must_use]
    pub fn stage(project: ProjectId, stage: Stage) -> Self {
        Self {
            project,
            stage,
            file: None,
        }
    }

    /// Per-file CODE_GEN lineage
    #[inline]
    #[must_use]
    pub fn file(project: ProjectId, path: impl Into<String>) -> Self {
        Self {
            project,
            stage: Stage::CodeGen,
            file: Some(path.into()),
        }
    }

    /// Same lineage under another project id
    #[must_use]
    pub fn rebased(&self, project: &ProjectId) -> Self {
        Self {
            project: project.clone(),
            stage: self.stage,
            file: self.file.clone(),
        }
    }
}

impl Display for ArtifactKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(path) => write!(f, "{}/{}/{}", self.project, self.stage, path),
            None => write!(f, "{}/{}", self.project, self.stage),
        }
    }
}

/// Outcome recorded for a generation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// Output validated and stored
    Succeeded,
    /// External generation exhausted its retries
    Failed,
    /// CODE_GEN aggregate where some files failed
    PartiallyFailed,
}

impl ArtifactStatus {
    /// Whether this record may serve as input to downstream stages
    #[inline]
    #[must_use]
    pub const fn is_succeeded(&self) -> bool {
        matches!(self, ArtifactStatus::Succeeded)
    }
}

impl Display for ArtifactStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArtifactStatus::Succeeded => "succeeded",
            ArtifactStatus::Failed => "failed",
            ArtifactStatus::PartiallyFailed => "partially_failed",
        })
    }
}

/// Immutable versioned artifact record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub key: ArtifactKey,
    pub version: u32,
    pub payload: String,
    pub payload_hash: ContentHash,
    /// Fingerprint of the upstream artifacts consumed
    pub input_hash: ContentHash,
    pub created_at: DateTime<Utc>,
    pub status: ArtifactStatus,
    /// Failure detail for non-succeeded records
    pub diagnostic: Option<String>,
}

impl Artifact {
    /// Stage this artifact belongs to
    #[inline]
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.key.stage
    }

    /// Whether the stored hash matches the payload
    #[inline]
    #[must_use]
    pub fn verify(&self) -> bool {
        self.payload_hash == ContentHash::compute(self.payload.as_bytes())
    }

    /// Whether this record may serve as input to downstream stages
    #[inline]
    #[must_use]
    pub fn is_succeeded(&self) -> bool {
        self.status.is_succeeded()
    }
}

/// An artifact waiting for a version number
///
/// The store assigns `version`, `created_at` and `payload_hash` on publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDraft {
    pub key: ArtifactKey,
    pub payload: String,
    pub input_hash: ContentHash,
    pub status: ArtifactStatus,
    pub diagnostic: Option<String>,
    /// Version the writer expects to be assigned; publish fails with
    /// `VersionConflict` if another writer got there first
    pub expected_version: Option<u32>,
}

impl ArtifactDraft {
    /// Draft for a validated output
    #[must_use]
    pub fn succeeded(
        key: ArtifactKey,
        payload: impl Into<String>,
        input_hash: ContentHash,
    ) -> Self {
        Self {
            key,
            payload: payload.into(),
            input_hash,
            status: ArtifactStatus::Succeeded,
            diagnostic: None,
            expected_version: None,
        }
    }

    /// Draft for an attempt that exhausted retries (empty payload)
    #[must_use]
    pub fn failed(
        key: ArtifactKey,
        input_hash: ContentHash,
        diagnostic: impl Into<String>,
    ) -> Self {
        Self {
            key,
            payload: String::new(),
            input_hash,
            status: ArtifactStatus::Failed,
            diagnostic: Some(diagnostic.into()),
            expected_version: None,
        }
    }

    /// Override the recorded status
    #[must_use]
    pub fn with_status(mut self, status: ArtifactStatus) -> Self {
        self.status = status;
        self
    }

    /// Attach a diagnostic
    #[must_use]
    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }

    /// Require a specific version on publish
    #[must_use]
    pub fn expecting(mut self, version: u32) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Materialize the record once a version has been allocated
    #[must_use]
    pub fn into_artifact(self, version: u32, created_at: DateTime<Utc>) -> Artifact {
        let payload_hash = ContentHash::compute(self.payload.as_bytes());
        Artifact {
            key: self.key,
            version,
            payload: self.payload,
            payload_hash,
            input_hash: self.input_hash,
            created_at,
            status: self.status,
            diagnostic: self.diagnostic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> ProjectId {
        ProjectId::new("demo").unwrap()
    }

    #[test]
    fn project_id_rejects_unsafe_names() {
        assert!(ProjectId::new("").is_err());
        assert!(ProjectId::new("../etc").is_err());
        assert!(ProjectId::new(".hidden").is_err());
        assert!(ProjectId::new("Upper").is_err());
        assert!(ProjectId::new("todo-app_2").is_ok());
    }

    #[test]
    fn project_id_from_display_name_slugifies() {
        let id = ProjectId::from_display_name("  My Todo App! v2 ").unwrap();
        assert_eq!(id.as_str(), "my-todo-app-v2");
        assert!(ProjectId::from_display_name("!!!").is_err());
    }

    #[test]
    fn staging_ids_are_unique_and_flagged() {
        let a = ProjectId::staging();
        let b = ProjectId::staging();
        assert_ne!(a, b);
        assert!(a.is_staging());
        assert!(!project().is_staging());
        assert!(ProjectId::new(a.as_str()).is_ok());
    }

    #[test]
    fn project_id_deserialize_validates() {
        let ok: Result<ProjectId, _> = serde_json::from_str("\"demo\"");
        assert!(ok.is_ok());
        let bad: Result<ProjectId, _> = serde_json::from_str("\"a/b\"");
        assert!(bad.is_err());
    }

    #[test]
    fn draft_materializes_with_payload_hash() {
        let key = ArtifactKey::stage(project(), Stage::RequirementsText);
        let artifact = ArtifactDraft::succeeded(key, "reqs", ContentHash::default())
            .into_artifact(1, Utc::now());
        assert!(artifact.verify());
        assert_eq!(artifact.version, 1);
        assert!(artifact.is_succeeded());
    }

    #[test]
    fn failed_draft_has_empty_payload_and_diagnostic() {
        let key = ArtifactKey::file(project(), "src/main.py");
        let draft = ArtifactDraft::failed(key.clone(), ContentHash::default(), "timeout");
        assert_eq!(draft.payload, "");
        assert_eq!(draft.status, ArtifactStatus::Failed);
        assert_eq!(draft.key.stage, Stage::CodeGen);
        assert_eq!(key.to_string(), "demo/code_gen/src/main.py");
    }
}
