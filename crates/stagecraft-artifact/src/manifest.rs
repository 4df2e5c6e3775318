//! Per-project manifest
//!
//! Records each stage's current version and staleness flag so a reader can
//! see pipeline state at a glance. The manifest is a derived cache: it can
//! always be rebuilt from the artifact log and is rewritten on every change.

use crate::artifact::{ArtifactStatus, ProjectId};
use crate::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Manifest line for one stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Highest succeeded version (the `current` pointer)
    pub current_version: Option<u32>,
    /// Highest version of any status
    pub latest_version: Option<u32>,
    pub latest_status: Option<ArtifactStatus>,
    pub stale: bool,
}

/// Snapshot of a project's pipeline pointers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectManifest {
    pub project: ProjectId,
    pub updated_at: DateTime<Utc>,
    pub stages: BTreeMap<Stage, ManifestEntry>,
}

impl ProjectManifest {
    /// Empty manifest for a project
    #[must_use]
    pub fn new(project: ProjectId) -> Self {
        Self {
            project,
            updated_at: Utc::now(),
            stages: BTreeMap::new(),
        }
    }

    /// Entry for a stage (default when the stage has no artifacts)
    #[must_use]
    pub fn entry(&self, stage: Stage) -> ManifestEntry {
        self.stages.get(&stage).cloned().unwrap_or_default()
    }

    /// Stages flagged stale
    #[must_use]
    pub fn stale_stages(&self) -> Vec<Stage> {
        self.stages
            .iter()
            .filter(|(_, entry)| entry.stale)
            .map(|(stage, _)| *stage)
            .collect()
    }

    /// Whether two manifests agree on every pointer (timestamps ignored)
    #[must_use]
    pub fn same_pointers(&self, other: &ProjectManifest) -> bool {
        self.project == other.project && self.stages == other.stages
    }
}
