//! CODE_GEN file units
//!
//! CODE_GEN depends on SCAFFOLD at the stage level, but each scaffold leaf is
//! generated, versioned and invalidated on its own. A [`FileUnit`] is that
//! synthetic per-file dependency.

use crate::error::GraphError;
use serde::{Deserialize, Serialize};
use stagecraft_artifact::{ContentHash, Feature, FileDescriptor, Fingerprint, ProjectRequirements};

/// One file to generate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUnit {
    /// Slash-separated path from the scaffold root
    pub path: String,
    pub descriptor: FileDescriptor,
    /// Feature associated through the file-name prefix
    pub feature: Option<Feature>,
    /// Fingerprint of everything the file's generation depends on
    pub input_hash: ContentHash,
}

impl FileUnit {
    /// Enumerate the leaves of a scaffold in declaration order
    ///
    /// `brief` is the payload hash of the brief the scaffold was derived from;
    /// it is folded into every unit's fingerprint together with the
    /// project-wide scaffold fields.
    ///
    /// # Errors
    /// Returns error if a fingerprint cannot be computed
    pub fn expand(
        scaffold: &ProjectRequirements,
        brief: &ContentHash,
    ) -> Result<Vec<Self>, GraphError> {
        let context = Self::context_hash(scaffold, brief)?;
        scaffold
            .folder_structure
            .leaves()
            .into_iter()
            .map(|(path, descriptor)| {
                let file_name = path.rsplit('/').next().unwrap_or(&path);
                let feature = scaffold.feature_for_file(file_name).cloned();
                let input_hash =
                    Self::fingerprint(&path, descriptor, feature.as_ref(), &context)?;
                Ok(Self {
                    path,
                    descriptor: descriptor.clone(),
                    feature,
                    input_hash,
                })
            })
            .collect()
    }

    /// Hash of the project-wide inputs every file shares
    ///
    /// # Errors
    /// Returns error if the tech stack cannot be serialized
    pub fn context_hash(
        scaffold: &ProjectRequirements,
        brief: &ContentHash,
    ) -> Result<ContentHash, GraphError> {
        Ok(Fingerprint::new("file-context")
            .with_hash(brief)
            .with_str(&scaffold.project_name)
            .with_str(&scaffold.description)
            .with_json(&scaffold.tech_stack)?
            .finish())
    }

    /// Fingerprint over a file's path, descriptor, feature and shared context
    ///
    /// # Errors
    /// Returns error if the descriptor cannot be serialized
    pub fn fingerprint(
        path: &str,
        descriptor: &FileDescriptor,
        feature: Option<&Feature>,
        context: &ContentHash,
    ) -> Result<ContentHash, GraphError> {
        Ok(Fingerprint::new("file-unit")
            .with_hash(context)
            .with_str(path)
            .with_json(descriptor)?
            .with_json(&feature)?
            .finish())
    }

    /// File name without its directory
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}
