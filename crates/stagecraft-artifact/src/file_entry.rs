//! Structured requirements schema
//!
//! [`ProjectRequirements`] is the payload of the REQUIREMENTS_STRUCTURED and
//! SCAFFOLD stages. Its `folder_structure` is an explicit tagged tree of
//! [`FileEntry`] nodes: a `Directory` with ordered children, or a `Leaf`
//! describing one file to generate.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What a generated file primarily contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Class,
    Function,
    Component,
}

/// Method signature declared for a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSpec {
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    pub return_type: String,
    pub description: String,
}

/// Descriptor of a file leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub kind: FileKind,
    pub description: String,
    #[serde(default)]
    pub properties: Vec<String>,
    #[serde(default)]
    pub methods: Vec<MethodSpec>,
}

/// Node of the project layout tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileEntry {
    Directory {
        name: String,
        #[serde(default)]
        children: Vec<FileEntry>,
    },
    Leaf {
        name: String,
        descriptor: FileDescriptor,
    },
}

impl FileEntry {
    /// Node name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            FileEntry::Directory { name, .. } | FileEntry::Leaf { name, .. } => name,
        }
    }

    /// Whether this node is a file
    #[inline]
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self, FileEntry::Leaf { .. })
    }

    /// All leaves in depth-first, declaration order with their full paths
    #[must_use]
    pub fn leaves(&self) -> Vec<(String, &FileDescriptor)> {
        let mut out = Vec::new();
        self.collect_leaves("", &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a FileDescriptor)>) {
        let path = if prefix.is_empty() {
            self.name().to_string()
        } else {
            format!("{prefix}/{}", self.name())
        };
        match self {
            FileEntry::Leaf { descriptor, .. } => out.push((path, descriptor)),
            FileEntry::Directory { children, .. } => {
                for child in children {
                    child.collect_leaves(&path, out);
                }
            }
        }
    }

    /// Number of leaves under (and including) this node
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        match self {
            FileEntry::Leaf { .. } => 1,
            FileEntry::Directory { children, .. } => children.iter().map(Self::leaf_count).sum(),
        }
    }

    /// Look up a node by slash-separated path (first segment is this node)
    #[must_use]
    pub fn find(&self, path: &str) -> Option<&FileEntry> {
        let mut segments = path.split('/');
        if segments.next()? != self.name() {
            return None;
        }
        let mut node = self;
        for segment in segments {
            match node {
                FileEntry::Directory { children, .. } => {
                    node = children.iter().find(|c| c.name() == segment)?;
                }
                FileEntry::Leaf { .. } => return None,
            }
        }
        Some(node)
    }

    fn check_into(&self, path: &str, issues: &mut Vec<SchemaIssue>) {
        let name = self.name();
        if name.trim().is_empty() || name == "." || name == ".." || name.contains('/') {
            issues.push(SchemaIssue::new(path, format!("invalid entry name {name:?}")));
        }
        match self {
            FileEntry::Directory { children, .. } => {
                let mut seen = HashSet::new();
                for child in children {
                    let child_path = format!("{path}/{}", child.name());
                    if !seen.insert(child.name()) {
                        issues.push(SchemaIssue::new(
                            &child_path,
                            "duplicate name among siblings",
                        ));
                    }
                    child.check_into(&child_path, issues);
                }
            }
            FileEntry::Leaf { descriptor, .. } => {
                if descriptor.description.trim().is_empty() {
                    issues.push(SchemaIssue::new(path, "file description is empty"));
                }
                for (i, method) in descriptor.methods.iter().enumerate() {
                    if method.name.trim().is_empty() {
                        issues.push(SchemaIssue::new(
                            format!("{path}#methods[{i}]"),
                            "method name is empty",
                        ));
                    }
                }
            }
        }
    }
}

/// One product feature with its acceptance criteria
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
}

impl Feature {
    /// Snake-cased name used to associate features with files
    #[must_use]
    pub fn file_prefix(&self) -> String {
        self.name.trim().to_lowercase().replace(' ', "_")
    }
}

/// Payload of the structured stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRequirements {
    pub project_name: String,
    pub description: String,
    pub features: Vec<Feature>,
    pub tech_stack: Vec<String>,
    pub folder_structure: FileEntry,
}

impl ProjectRequirements {
    /// Feature whose snake-cased name prefixes `file_name`, if any
    #[must_use]
    pub fn feature_for_file(&self, file_name: &str) -> Option<&Feature> {
        let file_name = file_name.to_lowercase();
        self.features.iter().find(|feature| {
            let prefix = feature.file_prefix();
            !prefix.is_empty() && file_name.starts_with(&prefix)
        })
    }

    /// Structural problems, empty when the document is complete
    #[must_use]
    pub fn check(&self) -> Vec<SchemaIssue> {
        let mut issues = Vec::new();
        if self.project_name.trim().is_empty() {
            issues.push(SchemaIssue::new("project_name", "must not be empty"));
        }
        if self.description.trim().is_empty() {
            issues.push(SchemaIssue::new("description", "must not be empty"));
        }
        if self.features.is_empty() {
            issues.push(SchemaIssue::new("features", "at least one feature is required"));
        }
        for (i, feature) in self.features.iter().enumerate() {
            if feature.name.trim().is_empty() {
                issues.push(SchemaIssue::new(format!("features[{i}].name"), "must not be empty"));
            }
            if feature.acceptance_criteria.is_empty() {
                issues.push(SchemaIssue::new(
                    format!("features[{i}].acceptance_criteria"),
                    "at least one criterion is required",
                ));
            }
        }
        if self.tech_stack.is_empty() {
            issues.push(SchemaIssue::new("tech_stack", "at least one entry is required"));
        }
        let root = self.folder_structure.name().to_string();
        self.folder_structure
            .check_into(&format!("folder_structure:{root}"), &mut issues);
        if self.folder_structure.leaf_count() == 0 {
            issues.push(SchemaIssue::new("folder_structure", "tree contains no files"));
        }
        issues
    }
}

/// A located schema violation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaIssue {
    pub path: String,
    pub message: String,
}

impl SchemaIssue {
    #[must_use]
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str) -> FileEntry {
        FileEntry::Leaf {
            name: name.to_string(),
            descriptor: FileDescriptor {
                kind: FileKind::Function,
                description: format!("{name} module"),
                properties: vec![],
                methods: vec![],
            },
        }
    }

    fn dir(name: &str, children: Vec<FileEntry>) -> FileEntry {
        FileEntry::Directory {
            name: name.to_string(),
            children,
        }
    }

    fn requirements(tree: FileEntry) -> ProjectRequirements {
        ProjectRequirements {
            project_name: "todo".into(),
            description: "a todo app".into(),
            features: vec![Feature {
                name: "Task List".into(),
                description: "lists tasks".into(),
                acceptance_criteria: vec!["shows tasks".into()],
            }],
            tech_stack: vec!["python".into()],
            folder_structure: tree,
        }
    }

    #[test]
    fn leaves_are_depth_first_with_paths() {
        let tree = dir("app", vec![leaf("main.py"), dir("core", vec![leaf("a.py"), leaf("b.py")])]);
        let paths: Vec<_> = tree.leaves().into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["app/main.py", "app/core/a.py", "app/core/b.py"]);
        assert_eq!(tree.leaf_count(), 3);
    }

    #[test]
    fn find_resolves_nested_paths() {
        let tree = dir("app", vec![dir("core", vec![leaf("a.py")])]);
        assert!(tree.find("app/core/a.py").is_some_and(FileEntry::is_leaf));
        assert!(tree.find("app/core/missing.py").is_none());
        assert!(tree.find("other/core").is_none());
    }

    #[test]
    fn check_flags_duplicate_siblings() {
        let reqs = requirements(dir("app", vec![leaf("main.py"), leaf("main.py")]));
        let issues = reqs.check();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("duplicate"));
    }

    #[test]
    fn check_flags_empty_tree_and_missing_criteria() {
        let mut reqs = requirements(dir("app", vec![]));
        reqs.features[0].acceptance_criteria.clear();
        let issues = reqs.check();
        assert!(issues.iter().any(|i| i.path == "folder_structure"));
        assert!(issues.iter().any(|i| i.path.contains("acceptance_criteria")));
    }

    #[test]
    fn complete_document_has_no_issues() {
        let reqs = requirements(dir("app", vec![leaf("task_list_view.py")]));
        assert!(reqs.check().is_empty());
    }

    #[test]
    fn feature_for_file_matches_snake_case_prefix() {
        let reqs = requirements(dir("app", vec![leaf("task_list_view.py")]));
        assert_eq!(
            reqs.feature_for_file("Task_List_View.py").map(|f| f.name.as_str()),
            Some("Task List")
        );
        assert!(reqs.feature_for_file("main.py").is_none());
    }

    #[test]
    fn file_entry_serde_is_tagged() {
        let json = serde_json::to_value(leaf("x.py")).unwrap();
        assert_eq!(json["type"], "leaf");
        assert_eq!(json["descriptor"]["kind"], "function");
        let back: FileEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, leaf("x.py"));
    }
}
