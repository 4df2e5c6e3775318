//! Staleness computation
//!
//! The [`Invalidator`] is a pure function of the artifact log: it loads a
//! [`Snapshot`] of every stage lineage, recomputes each stage's expected
//! input fingerprint from its dependencies' current artifacts, and flags the
//! stages whose recorded fingerprint no longer matches.
//!
//! Staleness propagates: a stage whose dependency is stale is itself stale,
//! even if the fingerprints happen to agree.

use crate::graph::StageGraph;
use crate::units::FileUnit;
use chrono::Utc;
use stagecraft_artifact::{
    Artifact, ArtifactKey, ArtifactStatus, ArtifactStore, ContentHash, Fingerprint, ManifestEntry,
    ProjectId, ProjectManifest, Stage, StoreError,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Input fingerprint of a stage given its dependencies' current payload hashes
///
/// `dependencies` must be in stage order.
#[must_use]
pub fn stage_input_hash(stage: Stage, dependencies: &[(Stage, ContentHash)]) -> ContentHash {
    let mut fp = Fingerprint::new("stage-input").with_str(stage.as_str());
    for (dep, hash) in dependencies {
        fp = fp.with_str(dep.as_str()).with_hash(hash);
    }
    fp.finish()
}

/// Lineage summary for one stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageLineage {
    /// Highest succeeded version
    pub current: Option<Artifact>,
    pub latest_version: Option<u32>,
    pub latest_status: Option<ArtifactStatus>,
}

impl StageLineage {
    fn from_history(history: Vec<Artifact>) -> Self {
        let latest_version = history.last().map(|a| a.version);
        let latest_status = history.last().map(|a| a.status);
        let current = history.into_iter().rev().find(Artifact::is_succeeded);
        Self {
            current,
            latest_version,
            latest_status,
        }
    }
}

/// Point-in-time view of a project's stage lineages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub project: ProjectId,
    pub stages: BTreeMap<Stage, StageLineage>,
}

impl Snapshot {
    /// Load every stage lineage of `project` from the store
    ///
    /// # Errors
    /// Propagates store failures
    pub fn load(store: &dyn ArtifactStore, project: &ProjectId) -> Result<Self, StoreError> {
        let mut stages = BTreeMap::new();
        for stage in Stage::ALL {
            let history = store.history(&ArtifactKey::stage(project.clone(), stage))?;
            stages.insert(stage, StageLineage::from_history(history));
        }
        Ok(Self {
            project: project.clone(),
            stages,
        })
    }

    /// Lineage summary of a stage
    #[must_use]
    pub fn lineage(&self, stage: Stage) -> Option<&StageLineage> {
        self.stages.get(&stage)
    }

    /// Current (highest succeeded) artifact of a stage
    #[must_use]
    pub fn current(&self, stage: Stage) -> Option<&Artifact> {
        self.stages.get(&stage).and_then(|l| l.current.as_ref())
    }
}

/// Why a stage is stale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// Recorded fingerprint differs from the recomputed one
    InputChanged,
    /// A dependency is itself stale
    DependencyStale(Stage),
    /// A dependency has no current artifact
    DependencyMissing(Stage),
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StaleReason::InputChanged => f.write_str("upstream input changed"),
            StaleReason::DependencyStale(stage) => write!(f, "dependency {stage} is stale"),
            StaleReason::DependencyMissing(stage) => {
                write!(f, "dependency {stage} has no current artifact")
            }
        }
    }
}

/// Evaluated state of one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatus {
    pub current_version: Option<u32>,
    pub latest_version: Option<u32>,
    pub latest_status: Option<ArtifactStatus>,
    pub stale: Option<StaleReason>,
}

impl StageStatus {
    #[inline]
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.stale.is_some()
    }
}

/// Freshness of one CODE_GEN file lineage against its unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub unit: FileUnit,
    /// Highest succeeded version of the file
    pub current: Option<Artifact>,
    pub latest_status: Option<ArtifactStatus>,
}

impl FileState {
    /// Whether the current artifact was produced from the unit's present inputs
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|a| a.input_hash == self.unit.input_hash)
    }
}

/// Computes staleness over a [`StageGraph`]
#[derive(Debug, Clone)]
pub struct Invalidator {
    graph: Arc<StageGraph>,
}

impl Invalidator {
    #[must_use]
    pub fn new(graph: Arc<StageGraph>) -> Self {
        Self { graph }
    }

    #[inline]
    #[must_use]
    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// Fingerprint `stage` should record given the snapshot's current
    /// artifacts, or the first dependency lacking one
    ///
    /// # Errors
    /// The dependency with no current artifact
    pub fn expected_input_hash(
        &self,
        stage: Stage,
        snapshot: &Snapshot,
    ) -> Result<ContentHash, Stage> {
        let mut deps = Vec::new();
        for dep in self.graph.dependencies_of(stage) {
            let current = snapshot.current(dep).ok_or(dep)?;
            deps.push((dep, current.payload_hash));
        }
        Ok(stage_input_hash(stage, &deps))
    }

    /// Status of every stage, evaluated in topological order
    #[must_use]
    pub fn evaluate(&self, snapshot: &Snapshot) -> BTreeMap<Stage, StageStatus> {
        let mut out: BTreeMap<Stage, StageStatus> = BTreeMap::new();
        for &stage in self.graph.topological_order() {
            let lineage = snapshot.lineage(stage).cloned().unwrap_or_default();
            let stale = lineage
                .current
                .as_ref()
                .and_then(|current| self.stale_reason(stage, current, snapshot, &out));
            out.insert(
                stage,
                StageStatus {
                    current_version: lineage.current.as_ref().map(|a| a.version),
                    latest_version: lineage.latest_version,
                    latest_status: lineage.latest_status,
                    stale,
                },
            );
        }
        out
    }

    fn stale_reason(
        &self,
        stage: Stage,
        current: &Artifact,
        snapshot: &Snapshot,
        evaluated: &BTreeMap<Stage, StageStatus>,
    ) -> Option<StaleReason> {
        for dep in self.graph.dependencies_of(stage) {
            if evaluated.get(&dep).is_some_and(StageStatus::is_stale) {
                return Some(StaleReason::DependencyStale(dep));
            }
        }
        match self.expected_input_hash(stage, snapshot) {
            Err(dep) => Some(StaleReason::DependencyMissing(dep)),
            Ok(expected) if expected != current.input_hash => Some(StaleReason::InputChanged),
            Ok(_) => None,
        }
    }

    /// Descendants of `changed` that are stale in the snapshot
    #[must_use]
    pub fn invalidated(&self, changed: Stage, snapshot: &Snapshot) -> BTreeSet<Stage> {
        let statuses = self.evaluate(snapshot);
        let invalidated: BTreeSet<Stage> = self
            .graph
            .descendants_of(changed)
            .into_iter()
            .filter(|stage| statuses.get(stage).is_some_and(StageStatus::is_stale))
            .collect();
        if !invalidated.is_empty() {
            tracing::warn!(
                project = %snapshot.project,
                changed = %changed,
                stale = ?invalidated,
                "downstream stages invalidated"
            );
        }
        invalidated
    }

    /// Manifest reflecting the snapshot
    #[must_use]
    pub fn manifest(&self, snapshot: &Snapshot) -> ProjectManifest {
        let stages = self
            .evaluate(snapshot)
            .into_iter()
            .filter(|(_, status)| status.latest_version.is_some())
            .map(|(stage, status)| {
                (
                    stage,
                    ManifestEntry {
                        current_version: status.current_version,
                        latest_version: status.latest_version,
                        latest_status: status.latest_status,
                        stale: status.is_stale(),
                    },
                )
            })
            .collect();
        ProjectManifest {
            project: snapshot.project.clone(),
            updated_at: Utc::now(),
            stages,
        }
    }

    /// Per-file freshness of the CODE_GEN lineages for `units`
    ///
    /// # Errors
    /// Propagates store failures
    pub fn file_states(
        &self,
        store: &dyn ArtifactStore,
        project: &ProjectId,
        units: &[FileUnit],
    ) -> Result<Vec<FileState>, StoreError> {
        units
            .iter()
            .map(|unit| {
                let history = store.history(&ArtifactKey::file(project.clone(), &unit.path))?;
                let latest_status = history.last().map(|a| a.status);
                let current = history.into_iter().rev().find(Artifact::is_succeeded);
                Ok(FileState {
                    unit: unit.clone(),
                    current,
                    latest_status,
                })
            })
            .collect()
    }
}
