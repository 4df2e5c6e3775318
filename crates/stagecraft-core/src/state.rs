//! Derived pipeline state

use serde::Serialize;
use stagecraft_artifact::{ArtifactStatus, ProjectId, Stage};
use stagecraft_graph::StageStatus;
use std::collections::BTreeMap;

/// Report line for one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    /// Highest succeeded version
    pub current_version: Option<u32>,
    pub latest_version: Option<u32>,
    pub latest_status: Option<ArtifactStatus>,
    pub stale: bool,
    /// Human-readable staleness cause
    pub stale_reason: Option<String>,
}

impl StageReport {
    /// Whether the most recent attempt succeeded
    #[inline]
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.latest_status.is_some_and(|s| s.is_succeeded())
    }

    /// Whether the stage has a current artifact that needs no regeneration
    #[inline]
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.current_version.is_some() && !self.stale && self.succeeded()
    }
}

impl From<&StageStatus> for StageReport {
    fn from(status: &StageStatus) -> Self {
        Self {
            current_version: status.current_version,
            latest_version: status.latest_version,
            latest_status: status.latest_status,
            stale: status.is_stale(),
            stale_reason: status.stale.map(|r| r.to_string()),
        }
    }
}

/// Per-stage pointers and staleness of a project, derived from its log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineState {
    pub project: ProjectId,
    pub stages: BTreeMap<Stage, StageReport>,
}

impl PipelineState {
    #[must_use]
    pub fn from_statuses(project: ProjectId, statuses: &BTreeMap<Stage, StageStatus>) -> Self {
        Self {
            project,
            stages: statuses
                .iter()
                .map(|(stage, status)| (*stage, StageReport::from(status)))
                .collect(),
        }
    }

    #[must_use]
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.get(&stage)
    }

    /// Stages currently flagged stale
    #[must_use]
    pub fn stale_stages(&self) -> Vec<Stage> {
        self.stages
            .iter()
            .filter(|(_, r)| r.stale)
            .map(|(s, _)| *s)
            .collect()
    }
}
