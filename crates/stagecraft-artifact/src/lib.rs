//! Stagecraft artifact system
//!
//! Versioned, append-only storage for the outputs of every pipeline stage.
//!
//! # Core Concepts
//!
//! - [`Stage`]: the fixed, ordered pipeline phases
//! - [`Artifact`]: immutable record of one generation attempt for a lineage
//! - [`ArtifactKey`]: lineage identity `(project, stage, file?)`
//! - [`ContentHash`] / [`Fingerprint`]: Blake3 digests for payload integrity
//!   and input fingerprints
//! - [`ProjectRequirements`] / [`FileEntry`]: the structured requirements
//!   schema carried by the structured stages
//! - [`ArtifactStore`]: the storage contract, with in-memory and filesystem
//!   implementations
//!
//! # Example
//!
//! ```rust
//! use stagecraft_artifact::{
//!     ArtifactDraft, ArtifactKey, ArtifactStore, ContentHash, InMemoryArtifactStore, ProjectId,
//!     Stage,
//! };
//!
//! let store = InMemoryArtifactStore::new();
//! let project = ProjectId::new("todo").unwrap();
//! store.create_project(&project).unwrap();
//!
//! let key = ArtifactKey::stage(project, Stage::Brief);
//! let artifact = store
//!     .put(ArtifactDraft::succeeded(key.clone(), "a todo app", ContentHash::default()))
//!     .unwrap();
//! assert_eq!(artifact.version, 1);
//! assert_eq!(store.get(&key, 1).unwrap().payload, "a todo app");
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod artifact;
mod file_entry;
mod hash;
mod manifest;
mod stage;

pub mod store;

pub use artifact::{
    Artifact, ArtifactDraft, ArtifactKey, ArtifactStatus, InvalidProjectId, ProjectId,
    ProjectRecord,
};
pub use file_entry::{
    Feature, FileDescriptor, FileEntry, FileKind, MethodSpec, ProjectRequirements, SchemaIssue,
};
pub use hash::{ContentHash, Fingerprint, HashError};
pub use manifest::{ManifestEntry, ProjectManifest};
pub use stage::{Stage, UnknownStage};
pub use store::{ArtifactStore, FsArtifactStore, InMemoryArtifactStore, StoreError};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
