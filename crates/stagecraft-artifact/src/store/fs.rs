//! Filesystem artifact store
//!
//! Layout under the root directory:
//!
//! ```text
//! projects/<id>/project.json
//! projects/<id>/manifest.json
//! projects/<id>/stages/<stage>/v000001.json
//! projects/<id>/files/<hex(path)>/v000001.json
//! staging/<id>/...                      (same shape, unpublished)
//! ```
//!
//! Every version is written to a temp file, fsynced, then hard-linked to its
//! final name. `link` refuses to replace an existing file, so two writers
//! racing for the same version cannot overwrite each other and readers only
//! ever see complete records.

use super::{allocate_version, ArtifactStore, StoreError};
use crate::artifact::{
    Artifact, ArtifactDraft, ArtifactKey, ArtifactStatus, ProjectId, ProjectRecord,
};
use crate::hash::ContentHash;
use crate::manifest::ProjectManifest;
use crate::stage::Stage;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use ulid::Ulid;

const PROJECTS_DIR: &str = "projects";
const STAGING_DIR: &str = "staging";
const PROJECT_FILE: &str = "project.json";
const MANIFEST_FILE: &str = "manifest.json";

/// On-disk record; the project is implied by the directory so that
/// publishing a staging project is a single directory rename
#[derive(Debug, Serialize, Deserialize)]
struct StoredArtifact {
    stage: Stage,
    file: Option<String>,
    version: u32,
    payload: String,
    payload_hash: ContentHash,
    input_hash: ContentHash,
    created_at: DateTime<Utc>,
    status: ArtifactStatus,
    diagnostic: Option<String>,
}

impl StoredArtifact {
    fn from_artifact(artifact: &Artifact) -> Self {
        Self {
            stage: artifact.key.stage,
            file: artifact.key.file.clone(),
            version: artifact.version,
            payload: artifact.payload.clone(),
            payload_hash: artifact.payload_hash,
            input_hash: artifact.input_hash,
            created_at: artifact.created_at,
            status: artifact.status,
            diagnostic: artifact.diagnostic.clone(),
        }
    }

    fn into_artifact(self, project: &ProjectId) -> Artifact {
        Artifact {
            key: ArtifactKey {
                project: project.clone(),
                stage: self.stage,
                file: self.file,
            },
            version: self.version,
            payload: self.payload,
            payload_hash: self.payload_hash,
            input_hash: self.input_hash,
            created_at: self.created_at,
            status: self.status,
            diagnostic: self.diagnostic,
        }
    }
}

/// Artifact store persisted as one JSON file per version
#[derive(Debug)]
pub struct FsArtifactStore {
    root: PathBuf,
    /// In-process writer locks, one per lineage
    lineage_locks: DashMap<ArtifactKey, Arc<Mutex<()>>>,
    /// Serializes project creation and publication
    namespace_lock: Mutex<()>,
}

impl FsArtifactStore {
    /// Open (or initialize) a store rooted at `root`
    ///
    /// # Errors
    /// Returns error if the directory tree cannot be created
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in [root.join(PROJECTS_DIR), root.join(STAGING_DIR)] {
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        tracing::debug!(root = %root.display(), "opened artifact store");
        Ok(Self {
            root,
            lineage_locks: DashMap::new(),
            namespace_lock: Mutex::new(()),
        })
    }

    /// Store root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn project_dir(&self, id: &ProjectId) -> PathBuf {
        let parent = if id.is_staging() { STAGING_DIR } else { PROJECTS_DIR };
        self.root.join(parent).join(id.as_str())
    }

    fn existing_project_dir(&self, id: &ProjectId) -> Result<PathBuf, StoreError> {
        let dir = self.project_dir(id);
        if dir.join(PROJECT_FILE).is_file() {
            Ok(dir)
        } else {
            Err(StoreError::UnknownProject(id.clone()))
        }
    }

    fn lineage_dir(&self, key: &ArtifactKey) -> Result<PathBuf, StoreError> {
        let project = self.existing_project_dir(&key.project)?;
        Ok(match &key.file {
            Some(path) => project.join("files").join(hex::encode(path.as_bytes())),
            None => project.join("stages").join(key.stage.as_str()),
        })
    }

    fn lineage_lock(&self, key: &ArtifactKey) -> Arc<Mutex<()>> {
        Arc::clone(
            self.lineage_locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Version numbers present in a lineage directory, ascending
    fn versions_in(dir: &Path) -> Result<Vec<u32>, StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(dir, e)),
        };
        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(dir, e))?;
            if let Some(version) = entry.file_name().to_str().and_then(parse_version_name) {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    fn read_version(
        &self,
        key: &ArtifactKey,
        dir: &Path,
        version: u32,
    ) -> Result<Artifact, StoreError> {
        let path = dir.join(version_name(version));
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    key: key.clone(),
                    version,
                })
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let stored: StoredArtifact = serde_json::from_slice(&bytes)?;
        let artifact = stored.into_artifact(&key.project);
        if artifact.version != version || !artifact.verify() {
            return Err(StoreError::Corrupt(format!(
                "record {} failed integrity check",
                path.display()
            )));
        }
        Ok(artifact)
    }
}

impl ArtifactStore for FsArtifactStore {
    fn create_project(&self, id: &ProjectId) -> Result<ProjectRecord, StoreError> {
        let _guard = self.namespace_lock.lock();
        let dir = self.project_dir(id);
        if dir.exists() {
            return Err(StoreError::ProjectExists(id.clone()));
        }
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let record = ProjectRecord {
            id: id.clone(),
            created_at: Utc::now(),
            published_from: None,
        };
        write_atomic(&dir.join(PROJECT_FILE), &serde_json::to_vec_pretty(&record)?)?;
        tracing::debug!(project = %id, "created project");
        Ok(record)
    }

    fn project(&self, id: &ProjectId) -> Result<Option<ProjectRecord>, StoreError> {
        let path = self.project_dir(id).join(PROJECT_FILE);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    fn list_projects(&self) -> Result<Vec<ProjectId>, StoreError> {
        let dir = self.root.join(PROJECTS_DIR);
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Ok(id) = ProjectId::new(name) {
                if entry.path().join(PROJECT_FILE).is_file() {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn publish(&self, staging: &ProjectId, name: &ProjectId) -> Result<ProjectRecord, StoreError> {
        let _guard = self.namespace_lock.lock();
        let from = self.existing_project_dir(staging)?;
        let to = self.project_dir(name);
        if to.exists() {
            return Err(StoreError::ProjectExists(name.clone()));
        }
        let previous: ProjectRecord = {
            let path = from.join(PROJECT_FILE);
            let bytes = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
            serde_json::from_slice(&bytes)?
        };
        let record = ProjectRecord {
            id: name.clone(),
            created_at: previous.created_at,
            published_from: Some(staging.clone()),
        };
        write_atomic(&from.join(PROJECT_FILE), &serde_json::to_vec_pretty(&record)?)?;
        fs::rename(&from, &to).map_err(|e| StoreError::io(&to, e))?;
        sync_dir(&self.root.join(PROJECTS_DIR));

        // manifest carries the project id
        if let Some(mut manifest) = self.read_manifest(name)? {
            manifest.project = name.clone();
            self.write_manifest(&manifest)?;
        }
        self.lineage_locks.retain(|key, _| &key.project != staging);
        tracing::info!(staging = %staging, project = %name, "published project");
        Ok(record)
    }

    fn put(&self, draft: ArtifactDraft) -> Result<Artifact, StoreError> {
        let dir = self.lineage_dir(&draft.key)?;
        let lock = self.lineage_lock(&draft.key);
        let _guard = lock.lock();

        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let highest = Self::versions_in(&dir)?.last().copied();
        let version = allocate_version(&draft, highest)?;
        let artifact = draft.into_artifact(version, Utc::now());
        let bytes = serde_json::to_vec_pretty(&StoredArtifact::from_artifact(&artifact))?;

        match publish_new(&dir, &version_name(version), &bytes) {
            Ok(()) => Ok(artifact),
            // a writer in another process took this version
            Err(StoreError::Io { source, .. }) if source.kind() == ErrorKind::AlreadyExists => {
                Err(StoreError::VersionConflict {
                    key: artifact.key,
                    expected: version,
                    actual: version + 1,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn get(&self, key: &ArtifactKey, version: u32) -> Result<Artifact, StoreError> {
        let dir = self.lineage_dir(key)?;
        self.read_version(key, &dir, version)
    }

    fn latest(&self, key: &ArtifactKey) -> Result<Option<Artifact>, StoreError> {
        let dir = self.lineage_dir(key)?;
        match Self::versions_in(&dir)?.last() {
            Some(&version) => self.read_version(key, &dir, version).map(Some),
            None => Ok(None),
        }
    }

    fn history(&self, key: &ArtifactKey) -> Result<Vec<Artifact>, StoreError> {
        let dir = self.lineage_dir(key)?;
        let versions = Self::versions_in(&dir)?;
        for (idx, version) in versions.iter().enumerate() {
            if *version as usize != idx + 1 {
                return Err(StoreError::Corrupt(format!(
                    "lineage {key} has a gap before v{version}"
                )));
            }
        }
        versions
            .into_iter()
            .map(|version| self.read_version(key, &dir, version))
            .collect()
    }

    fn file_lineages(&self, project: &ProjectId) -> Result<Vec<String>, StoreError> {
        let dir = self.existing_project_dir(project)?.join("files");
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let decoded = entry
                .file_name()
                .to_str()
                .and_then(|name| hex::decode(name).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok());
            match decoded {
                Some(path) => paths.push(path),
                None => tracing::warn!(
                    entry = ?entry.file_name(),
                    "skipping unreadable file lineage"
                ),
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn read_manifest(&self, project: &ProjectId) -> Result<Option<ProjectManifest>, StoreError> {
        let path = self.existing_project_dir(project)?.join(MANIFEST_FILE);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    fn write_manifest(&self, manifest: &ProjectManifest) -> Result<(), StoreError> {
        let path = self.existing_project_dir(&manifest.project)?.join(MANIFEST_FILE);
        write_atomic(&path, &serde_json::to_vec_pretty(manifest)?)
    }
}

fn version_name(version: u32) -> String {
    format!("v{version:06}.json")
}

fn parse_version_name(name: &str) -> Option<u32> {
    name.strip_prefix('v')?.strip_suffix(".json")?.parse().ok()
}

fn temp_path(dir: &Path) -> PathBuf {
    dir.join(format!(".tmp-{}", Ulid::new()))
}

fn write_temp(dir: &Path, bytes: &[u8]) -> Result<PathBuf, StoreError> {
    let tmp = temp_path(dir);
    let mut file = fs::File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
    file.write_all(bytes).map_err(|e| StoreError::io(&tmp, e))?;
    file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
    Ok(tmp)
}

/// Publish `bytes` as `dir/name`, failing if the name already exists
fn publish_new(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = write_temp(dir, bytes)?;
    let target = dir.join(name);
    let linked = fs::hard_link(&tmp, &target).map_err(|e| StoreError::io(&target, e));
    if let Err(e) = fs::remove_file(&tmp) {
        tracing::warn!(path = %tmp.display(), error = %e, "failed to remove temp file");
    }
    linked?;
    sync_dir(dir);
    Ok(())
}

/// Replace `path` with `bytes` atomically
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::Corrupt(format!("{} has no parent", path.display())))?;
    let tmp = write_temp(dir, bytes)?;
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
    sync_dir(dir);
    Ok(())
}

fn sync_dir(dir: &Path) {
    // directory fsync is unsupported on some platforms; durability there
    // falls back to the file-level sync
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}
