//! Requirement documents for tests

use stagecraft_artifact::{
    Feature, FileDescriptor, FileEntry, FileKind, MethodSpec, ProjectRequirements,
};

/// Root directory of fixture folder structures
pub const FIXTURE_ROOT: &str = "app";

/// Three-file layout used by partial failure scenarios
pub const ABC_FILES: [&str; 3] = ["a.py", "b.py", "c.py"];

/// Requirements with one flat directory holding `files`
#[must_use]
pub fn requirements(project_name: &str, files: &[&str]) -> ProjectRequirements {
    ProjectRequirements {
        project_name: project_name.to_string(),
        description: format!("{project_name} generated for tests"),
        features: vec![Feature {
            name: "Task List".to_string(),
            description: "Show and edit tasks".to_string(),
            acceptance_criteria: vec!["tasks are listed".to_string()],
        }],
        tech_stack: vec!["python".to_string()],
        folder_structure: FileEntry::Directory {
            name: FIXTURE_ROOT.to_string(),
            children: files
                .iter()
                .map(|name| FileEntry::Leaf {
                    name: (*name).to_string(),
                    descriptor: FileDescriptor {
                        kind: FileKind::Function,
                        description: format!("{name} module"),
                        properties: Vec::new(),
                        methods: vec![MethodSpec {
                            name: "run".to_string(),
                            params: Vec::new(),
                            return_type: "None".to_string(),
                            description: "entry point".to_string(),
                        }],
                    },
                })
                .collect(),
        },
    }
}

/// [`requirements`] as generator output, wrapped in chatter the way models
/// answer
#[must_use]
pub fn requirements_json(project_name: &str, files: &[&str]) -> String {
    let doc =
        serde_json::to_string_pretty(&requirements(project_name, files)).unwrap_or_default();
    format!("Here is the structure:\n{doc}\nLet me know if anything should change.")
}
