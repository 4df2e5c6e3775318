//! In-memory artifact store

use super::{allocate_version, ArtifactStore, StoreError};
use crate::artifact::{Artifact, ArtifactDraft, ArtifactKey, ProjectId, ProjectRecord};
use crate::manifest::ProjectManifest;
use crate::stage::Stage;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

type LineageId = (Stage, Option<String>);

#[derive(Debug)]
struct ProjectState {
    record: ProjectRecord,
    lineages: BTreeMap<LineageId, Vec<Artifact>>,
    manifest: Option<ProjectManifest>,
}

/// Artifact store held entirely in memory
///
/// Each project sits behind its own lock; unrelated projects never contend.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    projects: DashMap<ProjectId, Arc<RwLock<ProjectState>>>,
}

impl InMemoryArtifactStore {
    /// Create an empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, id: &ProjectId) -> Result<Arc<RwLock<ProjectState>>, StoreError> {
        self.projects
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StoreError::UnknownProject(id.clone()))
    }

    fn lineage_id(key: &ArtifactKey) -> LineageId {
        (key.stage, key.file.clone())
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn create_project(&self, id: &ProjectId) -> Result<ProjectRecord, StoreError> {
        match self.projects.entry(id.clone()) {
            Entry::Occupied(_) => Err(StoreError::ProjectExists(id.clone())),
            Entry::Vacant(vacant) => {
                let record = ProjectRecord {
                    id: id.clone(),
                    created_at: Utc::now(),
                    published_from: None,
                };
                vacant.insert(Arc::new(RwLock::new(ProjectState {
                    record: record.clone(),
                    lineages: BTreeMap::new(),
                    manifest: None,
                })));
                Ok(record)
            }
        }
    }

    fn project(&self, id: &ProjectId) -> Result<Option<ProjectRecord>, StoreError> {
        Ok(self
            .projects
            .get(id)
            .map(|entry| entry.value().read().record.clone()))
    }

    fn list_projects(&self) -> Result<Vec<ProjectId>, StoreError> {
        let mut ids: Vec<_> = self
            .projects
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| !id.is_staging())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn publish(&self, staging: &ProjectId, name: &ProjectId) -> Result<ProjectRecord, StoreError> {
        let state = self.state(staging)?;
        let vacant = match self.projects.entry(name.clone()) {
            Entry::Occupied(_) => return Err(StoreError::ProjectExists(name.clone())),
            Entry::Vacant(vacant) => vacant,
        };

        let record = {
            let mut guard = state.write();
            guard.record = ProjectRecord {
                id: name.clone(),
                created_at: guard.record.created_at,
                published_from: Some(staging.clone()),
            };
            for artifacts in guard.lineages.values_mut() {
                for artifact in artifacts.iter_mut() {
                    artifact.key = artifact.key.rebased(name);
                }
            }
            if let Some(manifest) = guard.manifest.as_mut() {
                manifest.project = name.clone();
            }
            guard.record.clone()
        };
        vacant.insert(state);
        self.projects.remove(staging);
        Ok(record)
    }

    fn put(&self, draft: ArtifactDraft) -> Result<Artifact, StoreError> {
        let state = self.state(&draft.key.project)?;
        let mut guard = state.write();
        let lineage = guard
            .lineages
            .entry(Self::lineage_id(&draft.key))
            .or_default();
        let version = allocate_version(&draft, lineage.last().map(|a| a.version))?;
        let artifact = draft.into_artifact(version, Utc::now());
        lineage.push(artifact.clone());
        Ok(artifact)
    }

    fn get(&self, key: &ArtifactKey, version: u32) -> Result<Artifact, StoreError> {
        let not_found = || StoreError::NotFound {
            key: key.clone(),
            version,
        };
        let state = self.state(&key.project)?;
        let guard = state.read();
        let lineage = guard
            .lineages
            .get(&Self::lineage_id(key))
            .ok_or_else(not_found)?;
        version
            .checked_sub(1)
            .and_then(|idx| lineage.get(idx as usize))
            .cloned()
            .ok_or_else(not_found)
    }

    fn latest(&self, key: &ArtifactKey) -> Result<Option<Artifact>, StoreError> {
        let state = self.state(&key.project)?;
        let guard = state.read();
        Ok(guard
            .lineages
            .get(&Self::lineage_id(key))
            .and_then(|lineage| lineage.last().cloned()))
    }

    fn history(&self, key: &ArtifactKey) -> Result<Vec<Artifact>, StoreError> {
        let state = self.state(&key.project)?;
        let guard = state.read();
        Ok(guard
            .lineages
            .get(&Self::lineage_id(key))
            .cloned()
            .unwrap_or_default())
    }

    fn file_lineages(&self, project: &ProjectId) -> Result<Vec<String>, StoreError> {
        let state = self.state(project)?;
        let guard = state.read();
        Ok(guard
            .lineages
            .keys()
            .filter_map(|(_, file)| file.clone())
            .collect())
    }

    fn read_manifest(&self, project: &ProjectId) -> Result<Option<ProjectManifest>, StoreError> {
        let state = self.state(project)?;
        let manifest = state.read().manifest.clone();
        Ok(manifest)
    }

    fn write_manifest(&self, manifest: &ProjectManifest) -> Result<(), StoreError> {
        let state = self.state(&manifest.project)?;
        state.write().manifest = Some(manifest.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ContentHash;

    fn setup() -> (InMemoryArtifactStore, ProjectId) {
        let store = InMemoryArtifactStore::new();
        let id = ProjectId::new("demo").unwrap();
        store.create_project(&id).unwrap();
        (store, id)
    }

    #[test]
    fn put_assigns_gapless_versions() {
        let (store, id) = setup();
        let key = ArtifactKey::stage(id, Stage::RequirementsText);
        for expected in 1..=3 {
            let payload = format!("v{expected}");
            let draft = ArtifactDraft::succeeded(key.clone(), payload, ContentHash::default());
            let a = store.put(draft).unwrap();
            assert_eq!(a.version, expected);
        }
        let versions: Vec<_> = store.history(&key).unwrap().iter().map(|a| a.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn put_into_unknown_project_fails() {
        let store = InMemoryArtifactStore::new();
        let key = ArtifactKey::stage(ProjectId::new("ghost").unwrap(), Stage::Brief);
        let err = store
            .put(ArtifactDraft::succeeded(key, "x", ContentHash::default()))
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownProject(_)));
    }

    #[test]
    fn get_version_zero_is_not_found() {
        let (store, id) = setup();
        let key = ArtifactKey::stage(id, Stage::Brief);
        assert!(matches!(store.get(&key, 0), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn publish_moves_lineages_and_hides_staging() {
        let store = InMemoryArtifactStore::new();
        let staging = ProjectId::staging();
        store.create_project(&staging).unwrap();
        store
            .put(ArtifactDraft::succeeded(
                ArtifactKey::stage(staging.clone(), Stage::Brief),
                "brief",
                ContentHash::default(),
            ))
            .unwrap();
        assert!(store.list_projects().unwrap().is_empty());

        let name = ProjectId::new("todo").unwrap();
        let record = store.publish(&staging, &name).unwrap();
        assert_eq!(record.published_from.as_ref(), Some(&staging));

        let brief = store
            .latest(&ArtifactKey::stage(name.clone(), Stage::Brief))
            .unwrap()
            .unwrap();
        assert_eq!(brief.key.project, name);
        assert_eq!(store.list_projects().unwrap(), vec![name]);
        assert!(store.project(&staging).unwrap().is_none());
    }
}
