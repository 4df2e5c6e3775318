//! Pipeline command surface
//!
//! The operations a front end drives: `create`, `refine`, `resume` and
//! `status`, plus version browsing. Each returns a [`PipelineState`] report
//! or a typed error.
//!
//! `create` works in a staging project and publishes it under the name from
//! the first successful structured requirements, so a half-built project
//! never appears under its final name.

use crate::config::PipelineConfig;
use crate::controller::PipelineController;
use crate::error::PipelineError;
use crate::generator::ExternalGenerator;
use crate::state::PipelineState;
use stagecraft_artifact::{
    Artifact, ArtifactKey, ArtifactStore, FsArtifactStore, ProjectId, Stage, StoreError,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const MAX_NAME_SUFFIX: u32 = 1_000;

fn halted(project: &ProjectId, source: PipelineError) -> PipelineError {
    match source {
        already @ PipelineError::Halted { .. } => already,
        source => PipelineError::Halted {
            project: project.clone(),
            source: Box::new(source),
        },
    }
}

/// Front door to the pipeline
#[derive(Debug)]
pub struct Pipeline {
    controller: PipelineController,
}

impl Pipeline {
    #[must_use]
    pub fn new(controller: PipelineController) -> Self {
        Self { controller }
    }

    /// Pipeline over a filesystem store at `config.store_root`
    ///
    /// # Errors
    /// `Config` if the configuration is invalid, `Store` if the store cannot
    /// be opened
    pub fn open(
        config: PipelineConfig,
        generator: Arc<dyn ExternalGenerator>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let store: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::open(&config.store_root)?);
        tracing::info!(store = %config.store_root.display(), "pipeline opened");
        Ok(Self::new(PipelineController::new(store, generator, config)))
    }

    #[inline]
    #[must_use]
    pub fn controller(&self) -> &PipelineController {
        &self.controller
    }

    fn store(&self) -> &dyn ArtifactStore {
        self.controller.store().as_ref()
    }

    /// Start a project from a brief and drive it through `create_through`
    ///
    /// # Errors
    /// `Halted` carrying the (staging or published) project id and the error
    /// that stopped it; the project can be resumed from there
    pub async fn create(&self, brief: &str) -> Result<PipelineState, PipelineError> {
        self.create_with_cancel(brief, &CancellationToken::new()).await
    }

    /// As [`Self::create`], abandoning in-flight work if `cancel` fires
    ///
    /// # Errors
    /// See [`Self::create`]
    pub async fn create_with_cancel(
        &self,
        brief: &str,
        cancel: &CancellationToken,
    ) -> Result<PipelineState, PipelineError> {
        let staging = ProjectId::staging();
        self.store().create_project(&staging)?;
        tracing::info!(project = %staging, "staging project created");

        self.controller
            .submit_brief(&staging, brief)
            .map_err(|e| halted(&staging, e))?;
        let through = self.controller.config().create_through;
        let project = self.drive(&staging, Stage::RequirementsText, through, cancel).await?;
        self.controller.status(&project)
    }

    /// Regenerate one stage with feedback (for BRIEF, record a new brief)
    ///
    /// Descendants become stale; they are not regenerated.
    ///
    /// # Errors
    /// Anything [`PipelineController::advance`] returns
    pub async fn refine(
        &self,
        project: &ProjectId,
        stage: Stage,
        feedback: &str,
    ) -> Result<PipelineState, PipelineError> {
        if stage == Stage::Brief {
            self.controller.submit_brief(project, feedback)?;
        } else {
            self.controller.advance(project, stage, Some(feedback)).await?;
        }
        let project = self.publish_if_ready(project)?;
        self.controller.status(&project)
    }

    /// Check ancestors of `stage`, then regenerate `stage` and every later
    /// stage that is not up to date
    ///
    /// # Errors
    /// `StaleInput` if an ancestor of `stage` is stale; `Halted` if a stage
    /// fails along the way
    pub async fn resume(
        &self,
        project: &ProjectId,
        stage: Stage,
    ) -> Result<PipelineState, PipelineError> {
        self.resume_with_cancel(project, stage, &CancellationToken::new())
            .await
    }

    /// As [`Self::resume`], abandoning in-flight work if `cancel` fires
    ///
    /// # Errors
    /// See [`Self::resume`]
    pub async fn resume_with_cancel(
        &self,
        project: &ProjectId,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> Result<PipelineState, PipelineError> {
        self.controller.resume_from(project, stage)?;
        let configured = self.controller.config().create_through;
        let through = if self.position(stage) > self.position(configured) {
            stage
        } else {
            configured
        };
        let project = self.drive(project, stage, through, cancel).await?;
        self.controller.status(&project)
    }

    /// Per-stage report
    ///
    /// # Errors
    /// Propagates store failures
    pub fn status(&self, project: &ProjectId) -> Result<PipelineState, PipelineError> {
        self.controller.status(project)
    }

    /// Published projects
    ///
    /// # Errors
    /// Propagates store failures
    pub fn projects(&self) -> Result<Vec<ProjectId>, PipelineError> {
        Ok(self.store().list_projects()?)
    }

    /// Paths of every CODE_GEN file with a recorded version, sorted
    ///
    /// Includes files a later scaffold no longer lists.
    ///
    /// # Errors
    /// Propagates store failures
    pub fn files(&self, project: &ProjectId) -> Result<Vec<String>, PipelineError> {
        Ok(self.store().file_lineages(project)?)
    }

    /// Every version of a stage lineage, or of one CODE_GEN file
    ///
    /// # Errors
    /// `InvalidRequest` for a file outside CODE_GEN
    pub fn history(
        &self,
        project: &ProjectId,
        stage: Stage,
        file: Option<&str>,
    ) -> Result<Vec<Artifact>, PipelineError> {
        Ok(self.store().history(&lineage_key(project, stage, file)?)?)
    }

    /// One version of a lineage
    ///
    /// # Errors
    /// `Store(NotFound)` if the version does not exist
    pub fn get(
        &self,
        project: &ProjectId,
        stage: Stage,
        file: Option<&str>,
        version: u32,
    ) -> Result<Artifact, PipelineError> {
        Ok(self.store().get(&lineage_key(project, stage, file)?, version)?)
    }

    /// Highest version of a lineage, any status
    ///
    /// # Errors
    /// Propagates store failures
    pub fn latest(
        &self,
        project: &ProjectId,
        stage: Stage,
        file: Option<&str>,
    ) -> Result<Option<Artifact>, PipelineError> {
        Ok(self.store().latest(&lineage_key(project, stage, file)?)?)
    }

    fn position(&self, stage: Stage) -> usize {
        self.controller
            .graph()
            .topological_order()
            .iter()
            .position(|s| *s == stage)
            .unwrap_or(usize::MAX)
    }

    /// Advance every stage from `from` through `through` that is not up to
    /// date, publishing the project as soon as it can be named
    async fn drive(
        &self,
        project: &ProjectId,
        from: Stage,
        through: Stage,
        cancel: &CancellationToken,
    ) -> Result<ProjectId, PipelineError> {
        let mut project = self.publish_if_ready(project).map_err(|e| halted(project, e))?;
        let last = self.position(through);

        for stage in self.controller.graph().from_stage(from) {
            if self.position(stage) > last {
                break;
            }
            if stage == Stage::Brief {
                continue;
            }
            let state = self.controller.status(&project).map_err(|e| halted(&project, e))?;
            if state.stage(stage).is_some_and(|r| r.is_up_to_date()) {
                tracing::debug!(project = %project, stage = %stage, "stage up to date; skipping");
                continue;
            }
            self.controller
                .advance_with_cancel(&project, stage, None, cancel)
                .await
                .map_err(|e| halted(&project, e))?;
            project = self.publish_if_ready(&project).map_err(|e| halted(&project, e))?;
        }
        Ok(project)
    }

    /// Publish a staging project once structured requirements have succeeded
    fn publish_if_ready(&self, project: &ProjectId) -> Result<ProjectId, PipelineError> {
        if !project.is_staging() {
            return Ok(project.clone());
        }
        let Some(requirements) = self
            .controller
            .requirements(project, Stage::RequirementsStructured)?
        else {
            return Ok(project.clone());
        };

        let base = ProjectId::from_display_name(&requirements.project_name)
            .map(String::from)
            .unwrap_or_else(|_| "project".to_string());
        for n in 1..=MAX_NAME_SUFFIX {
            let candidate = if n == 1 { base.clone() } else { format!("{base}-{n}") };
            let Ok(name) = ProjectId::new(candidate) else {
                continue;
            };
            match self.store().publish(project, &name) {
                Ok(_) => {
                    tracing::info!(staging = %project, project = %name, "project published");
                    self.controller.forget_project(project);
                    return Ok(name);
                }
                Err(StoreError::ProjectExists(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(PipelineError::InvalidRequest(format!(
            "no free project name derived from {:?}",
            requirements.project_name
        )))
    }
}

fn lineage_key(
    project: &ProjectId,
    stage: Stage,
    file: Option<&str>,
) -> Result<ArtifactKey, PipelineError> {
    match file {
        None => Ok(ArtifactKey::stage(project.clone(), stage)),
        Some(path) if stage == Stage::CodeGen => Ok(ArtifactKey::file(project.clone(), path)),
        Some(_) => Err(PipelineError::InvalidRequest(format!(
            "{stage} has no per-file lineages"
        ))),
    }
}
