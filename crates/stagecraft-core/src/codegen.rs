//! CODE_GEN fan-out
//!
//! Every scaffold leaf is an independent generation unit with its own
//! version lineage `(project, CODE_GEN, path)`. Units run on a bounded worker
//! pool under the shared retry policy; the results are folded into one
//! aggregate CODE_GEN artifact whose payload is a [`CodeGenManifest`].
//!
//! On re-runs, files whose current artifact was produced from the unit's
//! present inputs are reused without a new version, so a retry after a
//! partial failure only regenerates what failed.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, ValidationError};
use crate::generator::{AncestorArtifact, ExternalGenerator, GenerationRequest};
use crate::retry::{generate_with_retry, RetryOutcome};
use crate::validate::validate_code;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use stagecraft_artifact::{
    Artifact, ArtifactDraft, ArtifactKey, ArtifactStatus, ArtifactStore, ContentHash, ProjectId,
    Stage,
};
use stagecraft_graph::{FileState, FileUnit, Invalidator};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Outcome of one file in a CODE_GEN run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOutcome {
    /// Current artifact was still fresh
    Reused,
    Generated,
    /// Generation exhausted its retries; a Failed version was recorded
    Failed,
    /// Output was rejected; no version was recorded
    Invalid,
}

impl FileOutcome {
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Reused | Self::Generated)
    }
}

/// One line of the aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    /// File version used (succeeded) or recorded (failed)
    pub version: Option<u32>,
    pub outcome: FileOutcome,
    pub payload_hash: Option<ContentHash>,
    pub diagnostic: Option<String>,
}

/// Payload of the aggregate CODE_GEN artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeGenManifest {
    pub scaffold_version: u32,
    pub files: Vec<FileRecord>,
}

impl CodeGenManifest {
    /// Aggregate status over the file outcomes
    #[must_use]
    pub fn status(&self) -> ArtifactStatus {
        let ok = self.files.iter().filter(|f| f.outcome.is_success()).count();
        if ok == self.files.len() {
            ArtifactStatus::Succeeded
        } else if ok == 0 {
            ArtifactStatus::Failed
        } else {
            ArtifactStatus::PartiallyFailed
        }
    }

    /// Paths of files that did not succeed
    #[must_use]
    pub fn failed_paths(&self) -> Vec<&str> {
        self.files
            .iter()
            .filter(|f| !f.outcome.is_success())
            .map(|f| f.path.as_str())
            .collect()
    }

    /// Parse an aggregate payload
    ///
    /// # Errors
    /// Returns error if the payload is not a CODE_GEN manifest
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// Inputs of one CODE_GEN run
#[derive(Debug)]
pub(crate) struct CodeGenJob<'a> {
    pub project: &'a ProjectId,
    pub brief: &'a str,
    pub scaffold: &'a Artifact,
    pub units: Vec<FileUnit>,
    pub feedback: Option<&'a str>,
    pub input_hash: ContentHash,
    pub expected_version: u32,
}

/// Fans CODE_GEN out into per-file generation tasks
#[derive(Debug, Clone)]
pub struct CodeGenOrchestrator {
    store: Arc<dyn ArtifactStore>,
    generator: Arc<dyn ExternalGenerator>,
    config: Arc<PipelineConfig>,
    invalidator: Invalidator,
}

impl CodeGenOrchestrator {
    #[must_use]
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        generator: Arc<dyn ExternalGenerator>,
        config: Arc<PipelineConfig>,
        invalidator: Invalidator,
    ) -> Self {
        Self {
            store,
            generator,
            config,
            invalidator,
        }
    }

    /// Freshness of each file lineage against the given units
    ///
    /// # Errors
    /// Propagates store failures
    pub fn file_states(
        &self,
        project: &ProjectId,
        units: &[FileUnit],
    ) -> Result<Vec<FileState>, PipelineError> {
        Ok(self.invalidator.file_states(self.store.as_ref(), project, units)?)
    }

    /// Generate (or reuse) every unit and write the aggregate
    ///
    /// The caller holds the CODE_GEN stage lock.
    pub(crate) async fn run(
        &self,
        job: CodeGenJob<'_>,
        cancel: &CancellationToken,
    ) -> Result<(Artifact, CodeGenManifest), PipelineError> {
        let states = self.file_states(job.project, &job.units)?;
        let semaphore = Semaphore::new(self.config.codegen_workers);
        let ancestors = vec![AncestorArtifact::from(job.scaffold)];
        let total = states.len();

        let mut tasks = FuturesUnordered::new();
        for (idx, state) in states.into_iter().enumerate() {
            let semaphore = &semaphore;
            let ancestors = &ancestors;
            let job = &job;
            tasks.push(async move {
                if job.feedback.is_none() && state.is_fresh() {
                    tracing::debug!(file = %state.unit.path, "reusing fresh file");
                    return (idx, Ok(reused(&state)));
                }
                let Ok(_permit) = semaphore.acquire().await else {
                    return (idx, Err(PipelineError::Cancelled { stage: Stage::CodeGen }));
                };
                (idx, self.generate_file(job, state, ancestors.clone(), cancel).await)
            });
        }

        let mut records: Vec<Option<FileRecord>> = vec![None; total];
        let mut first_error = None;
        while let Some((idx, result)) = tasks.next().await {
            match result {
                Ok(record) => records[idx] = Some(record),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        drop(tasks);
        if let Some(e) = first_error {
            return Err(e);
        }
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { stage: Stage::CodeGen });
        }

        let manifest = CodeGenManifest {
            scaffold_version: job.scaffold.version,
            files: records.into_iter().flatten().collect(),
        };
        let status = manifest.status();
        let payload = serde_json::to_string_pretty(&manifest)
            .map_err(|e| PipelineError::InvalidRequest(format!("unencodable manifest: {e}")))?;
        let mut draft = ArtifactDraft::succeeded(
            ArtifactKey::stage(job.project.clone(), Stage::CodeGen),
            payload,
            job.input_hash,
        )
        .with_status(status)
        .expecting(job.expected_version);
        if !status.is_succeeded() {
            draft = draft.with_diagnostic(format!(
                "failed files: {}",
                manifest.failed_paths().join(", ")
            ));
        }
        let aggregate = self.store.put(draft)?;
        tracing::info!(
            project = %job.project,
            version = aggregate.version,
            status = %status,
            files = manifest.files.len(),
            failed = manifest.failed_paths().len(),
            "code generation aggregated"
        );
        Ok((aggregate, manifest))
    }

    async fn generate_file(
        &self,
        job: &CodeGenJob<'_>,
        state: FileState,
        ancestors: Vec<AncestorArtifact>,
        cancel: &CancellationToken,
    ) -> Result<FileRecord, PipelineError> {
        let FileState {
            unit,
            current,
            latest_status: _,
        } = state;
        let path = unit.path.clone();
        let key = ArtifactKey::file(job.project.clone(), &path);
        let input_hash = unit.input_hash;

        let mut request =
            GenerationRequest::new(Stage::CodeGen, job.brief).with_ancestors(ancestors);
        if let (Some(feedback), Some(previous)) = (job.feedback, current.as_ref()) {
            request = request.with_feedback(feedback, previous.payload.clone());
        }
        let request = request.with_file(unit);

        let outcome =
            generate_with_retry(self.generator.as_ref(), &self.config, &request, cancel).await;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { stage: Stage::CodeGen });
        }

        match outcome {
            RetryOutcome::Cancelled => Err(PipelineError::Cancelled { stage: Stage::CodeGen }),
            RetryOutcome::Failed { error, attempts } => {
                let artifact = self.store.put(ArtifactDraft::failed(
                    key,
                    input_hash,
                    format!("{error} after {attempts} attempt(s)"),
                ))?;
                Ok(FileRecord {
                    path,
                    version: Some(artifact.version),
                    outcome: FileOutcome::Failed,
                    payload_hash: None,
                    diagnostic: artifact.diagnostic,
                })
            }
            RetryOutcome::Generated(raw) => match validate_code(&path, &raw) {
                Ok(code) => {
                    let artifact = self
                        .store
                        .put(ArtifactDraft::succeeded(key, code, input_hash))?;
                    tracing::debug!(file = %path, version = artifact.version, "file generated");
                    Ok(FileRecord {
                        path,
                        version: Some(artifact.version),
                        outcome: FileOutcome::Generated,
                        payload_hash: Some(artifact.payload_hash),
                        diagnostic: None,
                    })
                }
                Err(ValidationError { issues, .. }) => {
                    let diagnostic = issues
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("; ");
                    tracing::warn!(file = %path, %diagnostic, "generated file rejected");
                    self.generator.reject(&self.config.generator, &request).await;
                    Ok(FileRecord {
                        path,
                        version: None,
                        outcome: FileOutcome::Invalid,
                        payload_hash: None,
                        diagnostic: Some(diagnostic),
                    })
                }
            },
        }
    }
}

fn reused(state: &FileState) -> FileRecord {
    FileRecord {
        path: state.unit.path.clone(),
        version: state.current.as_ref().map(|a| a.version),
        outcome: FileOutcome::Reused,
        payload_hash: state.current.as_ref().map(|a| a.payload_hash),
        diagnostic: None,
    }
}
