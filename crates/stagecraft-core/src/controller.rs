//! Pipeline controller
//!
//! Drives stage advancement, regeneration and resumption for a project.
//!
//! # Concurrency
//! Advancing a stage holds a non-blocking lock scoped to `(project, stage)`;
//! a second caller gets `VersionConflict` instead of queuing. Every write
//! also carries the version it expects, so the store rejects a racing writer
//! from another process. Nothing is shared across projects.
//!
//! # Cancellation
//! A cancelled advance writes nothing, including Failed records.

use crate::codegen::{CodeGenJob, CodeGenManifest, CodeGenOrchestrator};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, ValidationError};
use crate::generator::{AncestorArtifact, CachingGenerator, ExternalGenerator, GenerationRequest};
use crate::retry::{generate_with_retry, RetryOutcome};
use crate::state::PipelineState;
use crate::validate::{parse_requirements, validate_structured, validate_text};
use dashmap::DashMap;
use stagecraft_artifact::{
    Artifact, ArtifactDraft, ArtifactKey, ArtifactStore, ProjectId, ProjectRequirements, Stage,
};
use stagecraft_graph::{
    stage_input_hash, FileState, Invalidator, Snapshot, StageGraph, StageStatus, StaleReason,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

type StageLockKey = (ProjectId, Stage);

/// Drives stages of every project in one store
#[derive(Debug)]
pub struct PipelineController {
    store: Arc<dyn ArtifactStore>,
    generator: Arc<dyn ExternalGenerator>,
    config: Arc<PipelineConfig>,
    invalidator: Invalidator,
    codegen: CodeGenOrchestrator,
    stage_locks: DashMap<StageLockKey, Arc<Mutex<()>>>,
}

impl PipelineController {
    /// Controller over the standard stage graph
    ///
    /// The generator is wrapped in a response cache when the config enables
    /// one.
    #[must_use]
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        generator: Arc<dyn ExternalGenerator>,
        config: PipelineConfig,
    ) -> Self {
        Self::with_graph(store, generator, config, StageGraph::standard())
    }

    #[must_use]
    pub fn with_graph(
        store: Arc<dyn ArtifactStore>,
        generator: Arc<dyn ExternalGenerator>,
        config: PipelineConfig,
        graph: StageGraph,
    ) -> Self {
        let config = Arc::new(config);
        let generator = CachingGenerator::wrap(generator, &config.cache);
        let invalidator = Invalidator::new(Arc::new(graph));
        let codegen = CodeGenOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&generator),
            Arc::clone(&config),
            invalidator.clone(),
        );
        Self {
            store,
            generator,
            config,
            invalidator,
            codegen,
            stage_locks: DashMap::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn graph(&self) -> &StageGraph {
        self.invalidator.graph()
    }

    /// Take the stage lock or fail fast
    fn lock_stage(
        &self,
        project: &ProjectId,
        stage: Stage,
    ) -> Result<OwnedMutexGuard<()>, PipelineError> {
        let lock = Arc::clone(
            self.stage_locks
                .entry((project.clone(), stage))
                .or_default()
                .value(),
        );
        lock.try_lock_owned().map_err(|_| {
            tracing::warn!(project = %project, stage = %stage, "stage is already advancing");
            PipelineError::VersionConflict {
                project: project.clone(),
                stage,
            }
        })
    }

    /// Drop the stage locks of a project nobody is advancing
    ///
    /// Locks still held are kept.
    pub(crate) fn forget_project(&self, project: &ProjectId) {
        self.stage_locks
            .retain(|(owner, _), lock| owner != project || Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.stage_locks.len()
    }

    fn ensure_project(&self, project: &ProjectId) -> Result<(), PipelineError> {
        match self.store.project(project)? {
            Some(_) => Ok(()),
            None => Err(PipelineError::InvalidRequest(format!(
                "unknown project {project}"
            ))),
        }
    }

    /// Record a new brief version
    ///
    /// # Errors
    /// `Validation` for a blank brief, `VersionConflict` if another brief is
    /// being written
    pub fn submit_brief(
        &self,
        project: &ProjectId,
        brief: &str,
    ) -> Result<Artifact, PipelineError> {
        self.ensure_project(project)?;
        let text = validate_text(Stage::Brief, brief)?;
        let _guard = self.lock_stage(project, Stage::Brief)?;

        let key = ArtifactKey::stage(project.clone(), Stage::Brief);
        let expected = self.store.latest(&key)?.map_or(1, |a| a.version + 1);
        let artifact = self.store.put(
            ArtifactDraft::succeeded(key, text, stage_input_hash(Stage::Brief, &[]))
                .expecting(expected),
        )?;
        tracing::info!(project = %project, version = artifact.version, "brief recorded");
        self.refresh(project, Stage::Brief)?;
        Ok(artifact)
    }

    /// Generate the next version of `stage`
    ///
    /// # Errors
    /// See [`Self::advance_with_cancel`]
    pub async fn advance(
        &self,
        project: &ProjectId,
        stage: Stage,
        feedback: Option<&str>,
    ) -> Result<Artifact, PipelineError> {
        self.advance_with_cancel(project, stage, feedback, &CancellationToken::new())
            .await
    }

    /// Generate the next version of `stage`, abandoning it if `cancel` fires
    ///
    /// CODE_GEN returns its aggregate artifact whatever the file outcomes;
    /// a partial failure shows in the aggregate's status.
    ///
    /// # Errors
    /// - `InvalidRequest` for BRIEF, or feedback on a stage with no artifact
    ///   (for CODE_GEN, no aggregate and no generated file)
    /// - `StaleInput` / `MissingDependency` if a dependency is not usable
    /// - `VersionConflict` if the stage is already advancing
    /// - `Validation` if the output is rejected (nothing is written)
    /// - `Generation` after retries are exhausted (a Failed record is written)
    /// - `Cancelled` (nothing is written)
    pub async fn advance_with_cancel(
        &self,
        project: &ProjectId,
        stage: Stage,
        feedback: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Artifact, PipelineError> {
        if stage == Stage::Brief {
            return Err(PipelineError::InvalidRequest(
                "the brief is submitted, not generated".to_string(),
            ));
        }
        self.ensure_project(project)?;
        let _guard = self.lock_stage(project, stage)?;

        let snapshot = Snapshot::load(self.store.as_ref(), project)?;
        let statuses = self.invalidator.evaluate(&snapshot);
        let ancestors = self.usable_dependencies(stage, &snapshot, &statuses)?;
        let input_hash = self
            .invalidator
            .expected_input_hash(stage, &snapshot)
            .map_err(|dependency| PipelineError::MissingDependency { stage, dependency })?;
        let (brief, brief_hash) = snapshot
            .current(Stage::Brief)
            .map(|a| (a.payload.clone(), a.payload_hash))
            .ok_or(PipelineError::MissingDependency {
                stage,
                dependency: Stage::Brief,
            })?;
        let previous = snapshot.current(stage);
        let expected_version = snapshot
            .lineage(stage)
            .and_then(|l| l.latest_version)
            .map_or(1, |v| v + 1);

        if stage == Stage::CodeGen {
            let scaffold = snapshot.current(Stage::Scaffold).ok_or(
                PipelineError::MissingDependency {
                    stage,
                    dependency: Stage::Scaffold,
                },
            )?;
            let requirements = parse_requirements(Stage::Scaffold, &scaffold.payload)?;
            let units = self.graph().file_units(&requirements, &brief_hash)?;
            if feedback.is_some()
                && previous.is_none()
                && !self
                    .codegen
                    .file_states(project, &units)?
                    .iter()
                    .any(|f| f.current.is_some())
            {
                return Err(PipelineError::InvalidRequest(format!(
                    "{stage} has no generated file to refine"
                )));
            }
            tracing::info!(
                project = %project,
                stage = %stage,
                refine = feedback.is_some(),
                files = units.len(),
                "advancing stage"
            );
            let job = CodeGenJob {
                project,
                brief: &brief,
                scaffold,
                units,
                feedback,
                input_hash,
                expected_version,
            };
            let (aggregate, _) = self.codegen.run(job, cancel).await?;
            self.refresh(project, stage)?;
            return Ok(aggregate);
        }

        if feedback.is_some() && previous.is_none() {
            return Err(PipelineError::InvalidRequest(format!(
                "{stage} has no artifact to refine"
            )));
        }
        tracing::info!(
            project = %project,
            stage = %stage,
            refine = feedback.is_some(),
            "advancing stage"
        );

        let mut request = GenerationRequest::new(stage, brief).with_ancestors(ancestors);
        if let (Some(feedback), Some(previous)) = (feedback, previous) {
            request = request.with_feedback(feedback, previous.payload.clone());
        }
        let key = ArtifactKey::stage(project.clone(), stage);

        let outcome =
            generate_with_retry(self.generator.as_ref(), &self.config, &request, cancel).await;
        if cancel.is_cancelled() {
            tracing::info!(
                project = %project,
                stage = %stage,
                "advance cancelled; result discarded"
            );
            return Err(PipelineError::Cancelled { stage });
        }

        let raw = match outcome {
            RetryOutcome::Generated(raw) => raw,
            RetryOutcome::Cancelled => return Err(PipelineError::Cancelled { stage }),
            RetryOutcome::Failed { error, attempts } => {
                let failed = self.store.put(
                    ArtifactDraft::failed(
                        key.clone(),
                        input_hash,
                        format!("{error} after {attempts} attempt(s)"),
                    )
                    .expecting(expected_version),
                )?;
                self.refresh(project, stage)?;
                return Err(PipelineError::Generation {
                    key,
                    attempts,
                    version: failed.version,
                    source: error,
                });
            }
        };

        let payload = match self.validate(stage, &raw) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(project = %project, stage = %stage, error = %e, "output rejected");
                self.generator.reject(&self.config.generator, &request).await;
                return Err(e.into());
            }
        };
        let artifact = self.store.put(
            ArtifactDraft::succeeded(key, payload, input_hash).expecting(expected_version),
        )?;
        tracing::info!(
            project = %project,
            stage = %stage,
            version = artifact.version,
            "stage succeeded"
        );
        self.refresh(project, stage)?;
        Ok(artifact)
    }

    /// Current artifacts of `stage`'s dependencies, refusing stale or
    /// missing ones
    fn usable_dependencies(
        &self,
        stage: Stage,
        snapshot: &Snapshot,
        statuses: &BTreeMap<Stage, StageStatus>,
    ) -> Result<Vec<AncestorArtifact>, PipelineError> {
        let mut ancestors = Vec::new();
        for dependency in self.graph().dependencies_of(stage) {
            if statuses.get(&dependency).is_some_and(StageStatus::is_stale) {
                return Err(PipelineError::StaleInput {
                    stage,
                    reason: StaleReason::DependencyStale(dependency),
                });
            }
            let current = snapshot
                .current(dependency)
                .ok_or(PipelineError::MissingDependency { stage, dependency })?;
            ancestors.push(AncestorArtifact::from(current));
        }
        Ok(ancestors)
    }

    fn validate(&self, stage: Stage, raw: &str) -> Result<String, ValidationError> {
        if stage.is_structured() {
            validate_structured(stage, raw, &self.config).map(|(_, payload)| payload)
        } else {
            validate_text(stage, raw)
        }
    }

    /// Rebuild state from the artifact log, refusing stale ancestors of
    /// `stage`
    ///
    /// `stage` itself may be stale; that is what resuming fixes.
    ///
    /// # Errors
    /// `StaleInput` naming the first stale ancestor in topological order
    pub fn resume_from(
        &self,
        project: &ProjectId,
        stage: Stage,
    ) -> Result<PipelineState, PipelineError> {
        self.ensure_project(project)?;
        let snapshot = Snapshot::load(self.store.as_ref(), project)?;
        let statuses = self.invalidator.evaluate(&snapshot);
        let ancestors = self.graph().ancestors_of(stage);

        let stale_ancestor = self
            .graph()
            .topological_order()
            .iter()
            .copied()
            .filter(|s| ancestors.contains(s))
            .find(|s| statuses.get(s).is_some_and(StageStatus::is_stale));
        if let Some(ancestor) = stale_ancestor {
            tracing::warn!(
                project = %project,
                stage = %stage,
                stale = %ancestor,
                "resume refused"
            );
            return Err(PipelineError::StaleInput {
                stage,
                reason: StaleReason::DependencyStale(ancestor),
            });
        }

        let manifest = self.invalidator.manifest(&snapshot);
        match self.store.read_manifest(project)? {
            Some(stored) if stored.same_pointers(&manifest) => {}
            stored => {
                if stored.is_some() {
                    tracing::warn!(
                        project = %project,
                        "manifest drifted from the artifact log; rewriting"
                    );
                }
                self.store.write_manifest(&manifest)?;
            }
        }
        Ok(PipelineState::from_statuses(project.clone(), &statuses))
    }

    /// Per-stage report
    ///
    /// # Errors
    /// Propagates store failures
    pub fn status(&self, project: &ProjectId) -> Result<PipelineState, PipelineError> {
        self.ensure_project(project)?;
        let snapshot = Snapshot::load(self.store.as_ref(), project)?;
        let statuses = self.invalidator.evaluate(&snapshot);
        Ok(PipelineState::from_statuses(project.clone(), &statuses))
    }

    /// Current structured requirements, if the stage has succeeded
    ///
    /// # Errors
    /// Propagates store failures; `Validation` if the stored payload is
    /// unreadable
    pub fn requirements(
        &self,
        project: &ProjectId,
        stage: Stage,
    ) -> Result<Option<ProjectRequirements>, PipelineError> {
        if !stage.is_structured() {
            return Err(PipelineError::InvalidRequest(format!(
                "{stage} is not a structured stage"
            )));
        }
        match self.store.current(&ArtifactKey::stage(project.clone(), stage))? {
            Some(artifact) => Ok(Some(parse_requirements(stage, &artifact.payload)?)),
            None => Ok(None),
        }
    }

    /// Per-file state of the current scaffold's CODE_GEN units
    ///
    /// # Errors
    /// `MissingDependency` if no brief or scaffold has succeeded
    pub fn code_gen_files(&self, project: &ProjectId) -> Result<Vec<FileState>, PipelineError> {
        let brief = self
            .store
            .current(&ArtifactKey::stage(project.clone(), Stage::Brief))?
            .ok_or(PipelineError::MissingDependency {
                stage: Stage::CodeGen,
                dependency: Stage::Brief,
            })?;
        let scaffold = self
            .requirements(project, Stage::Scaffold)?
            .ok_or(PipelineError::MissingDependency {
                stage: Stage::CodeGen,
                dependency: Stage::Scaffold,
            })?;
        let units = self.graph().file_units(&scaffold, &brief.payload_hash)?;
        self.codegen.file_states(project, &units)
    }

    /// Aggregate manifest of the latest CODE_GEN run
    ///
    /// # Errors
    /// Propagates store failures
    pub fn code_gen_manifest(
        &self,
        project: &ProjectId,
    ) -> Result<Option<CodeGenManifest>, PipelineError> {
        match self.store.latest(&ArtifactKey::stage(project.clone(), Stage::CodeGen))? {
            Some(artifact) => CodeGenManifest::parse(&artifact.payload)
                .map(Some)
                .map_err(|e| {
                    PipelineError::InvalidRequest(format!("unreadable CODE_GEN manifest: {e}"))
                }),
            None => Ok(None),
        }
    }

    /// Recompute staleness after `changed` got a new version and persist the
    /// manifest
    fn refresh(&self, project: &ProjectId, changed: Stage) -> Result<(), PipelineError> {
        let snapshot = Snapshot::load(self.store.as_ref(), project)?;
        self.invalidator.invalidated(changed, &snapshot);
        self.write_manifest(&snapshot)
    }

    fn write_manifest(&self, snapshot: &Snapshot) -> Result<(), PipelineError> {
        let manifest = self.invalidator.manifest(snapshot);
        if let Some(stored) = self.store.read_manifest(&snapshot.project)? {
            if stored.same_pointers(&manifest) {
                return Ok(());
            }
        }
        self.store.write_manifest(&manifest)?;
        Ok(())
    }
}
