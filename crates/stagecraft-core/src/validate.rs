//! Output validation
//!
//! Checks raw generator output against the shape its stage expects and turns
//! it into the payload that gets stored:
//! - text stages: trimmed, non-empty text
//! - structured stages: a [`ProjectRequirements`] document, stored as
//!   canonical JSON
//! - CODE_GEN files: the code inside markdown fences, or the trimmed output
//!
//! Structured output is accepted in the loose boundary shapes generators
//! produce (JSON wrapped in prose, nested folder maps, nested file
//! `content`) and normalized into the tagged [`FileEntry`] tree.

use crate::config::PipelineConfig;
use crate::error::ValidationError;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use stagecraft_artifact::{
    Feature, FileDescriptor, FileEntry, ProjectId, ProjectRequirements, SchemaIssue, Stage,
};
use std::sync::OnceLock;

/// Validate free-text output
///
/// # Errors
/// Returns error if the output is blank
pub fn validate_text(stage: Stage, raw: &str) -> Result<String, ValidationError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ValidationError::single(stage, "output", "generator returned no text"));
    }
    Ok(text.to_string())
}

/// Validate structured output, returning the parsed document and its
/// canonical JSON payload
///
/// # Errors
/// Returns every schema issue found
pub fn validate_structured(
    stage: Stage,
    raw: &str,
    config: &PipelineConfig,
) -> Result<(ProjectRequirements, String), ValidationError> {
    let requirements = parse_requirements(stage, raw)?;

    let mut issues = requirements.check();
    for (i, tech) in requirements.tech_stack.iter().enumerate() {
        if !config.allows_tech(tech) {
            issues.push(SchemaIssue::new(
                format!("tech_stack[{i}]"),
                format!("{tech:?} is not in the allowed tech stack"),
            ));
        }
    }
    if !issues.is_empty() {
        return Err(ValidationError::new(stage, issues));
    }

    let payload = serde_json::to_string_pretty(&requirements)
        .map_err(|e| ValidationError::single(stage, "document", e.to_string()))?;
    Ok((requirements, payload))
}

/// Parse a stored structured payload
///
/// # Errors
/// Returns error if the payload is not a requirements document
pub fn parse_requirements(stage: Stage, raw: &str) -> Result<ProjectRequirements, ValidationError> {
    let json = extract_json(raw)
        .ok_or_else(|| ValidationError::single(stage, "output", "no JSON object found"))?;
    let value: Value = serde_json::from_str(json)
        .map_err(|e| ValidationError::single(stage, "output", format!("malformed JSON: {e}")))?;
    normalize_requirements(stage, value)
}

/// Validate one generated file, returning the code to store
///
/// # Errors
/// Returns error if no code remains after extraction
pub fn validate_code(path: &str, raw: &str) -> Result<String, ValidationError> {
    let code = extract_code(raw);
    if code.trim().is_empty() {
        return Err(
            ValidationError::single(Stage::CodeGen, path, "generator returned no code")
                .for_file(path),
        );
    }
    Ok(code)
}

/// Outermost `{ ... }` span of the text
fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (start < end).then(|| &raw[start..=end])
}

fn code_fence() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| Regex::new(r"(?s)```[\w+#.-]*\n(.*?)```").expect("valid code fence regex"))
}

/// Fenced code blocks joined by a blank line, or the trimmed text when the
/// output has no fences
fn extract_code(raw: &str) -> String {
    let blocks: Vec<&str> = code_fence()
        .captures_iter(raw)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim_end())
        .collect();
    if blocks.is_empty() {
        raw.trim().to_string()
    } else {
        blocks.join("\n\n")
    }
}

#[derive(Deserialize)]
struct RawRequirements {
    project_name: String,
    description: String,
    features: Vec<Feature>,
    tech_stack: Vec<String>,
    folder_structure: Value,
}

fn normalize_requirements(
    stage: Stage,
    value: Value,
) -> Result<ProjectRequirements, ValidationError> {
    let raw: RawRequirements = serde_json::from_value(value)
        .map_err(|e| ValidationError::single(stage, "document", e.to_string()))?;

    let mut issues = Vec::new();
    let root = normalize_root(&raw.project_name, raw.folder_structure, &mut issues);
    match root {
        Some(folder_structure) if issues.is_empty() => Ok(ProjectRequirements {
            project_name: raw.project_name,
            description: raw.description,
            features: raw.features,
            tech_stack: raw.tech_stack,
            folder_structure,
        }),
        _ => {
            if issues.is_empty() {
                issues.push(SchemaIssue::new("folder_structure", "no folder tree found"));
            }
            Err(ValidationError::new(stage, issues))
        }
    }
}

/// Accepts the tagged tree, a `{name, subfolders, files}` folder, or a
/// `{"<folder>": {subfolders, files}}` map. A map with several top-level
/// folders is rooted under the project's slug.
fn normalize_root(
    project_name: &str,
    value: Value,
    issues: &mut Vec<SchemaIssue>,
) -> Option<FileEntry> {
    let Value::Object(map) = value else {
        issues.push(SchemaIssue::new("folder_structure", "expected an object"));
        return None;
    };

    if map.contains_key("type") {
        return match serde_json::from_value(Value::Object(map)) {
            Ok(entry) => Some(entry),
            Err(e) => {
                issues.push(SchemaIssue::new("folder_structure", e.to_string()));
                None
            }
        };
    }

    if map.get("name").is_some_and(Value::is_string) {
        return folder_from_object(map, "folder_structure", issues);
    }

    let mut folders = folders_from_map(map, "folder_structure", issues);
    if folders.len() == 1 {
        return folders.pop();
    }
    let root = ProjectId::from_display_name(project_name)
        .map(String::from)
        .unwrap_or_else(|_| "project".to_string());
    Some(FileEntry::Directory {
        name: root,
        children: folders,
    })
}

/// `{name, subfolders: [...], files: [...]}`
fn folder_from_object(
    mut map: Map<String, Value>,
    path: &str,
    issues: &mut Vec<SchemaIssue>,
) -> Option<FileEntry> {
    let Some(Value::String(name)) = map.remove("name") else {
        issues.push(SchemaIssue::new(path, "folder has no name"));
        return None;
    };
    let path = format!("{path}/{name}");
    let mut children = match map.remove("subfolders") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(m) => folder_from_object(m, &path, issues),
                _ => {
                    issues.push(SchemaIssue::new(&path, "subfolder must be an object"));
                    None
                }
            })
            .collect(),
        Some(Value::Object(m)) => folders_from_map(m, &path, issues),
        Some(_) => {
            issues.push(SchemaIssue::new(&path, "subfolders must be a list or map"));
            Vec::new()
        }
    };
    children.extend(files_from_value(map.remove("files"), &path, issues));
    Some(FileEntry::Directory { name, children })
}

/// `{"<folder>": {subfolders: {...}, files: [...]}, ...}`
fn folders_from_map(
    map: Map<String, Value>,
    path: &str,
    issues: &mut Vec<SchemaIssue>,
) -> Vec<FileEntry> {
    map.into_iter()
        .filter_map(|(name, contents)| {
            let folder_path = format!("{path}/{name}");
            let Value::Object(mut contents) = contents else {
                issues.push(SchemaIssue::new(&folder_path, "folder contents must be an object"));
                return None;
            };
            let mut children = match contents.remove("subfolders") {
                Some(Value::Object(m)) => folders_from_map(m, &folder_path, issues),
                None | Some(Value::Null) => Vec::new(),
                Some(_) => {
                    issues.push(SchemaIssue::new(&folder_path, "subfolders must be a map"));
                    Vec::new()
                }
            };
            children.extend(files_from_value(contents.remove("files"), &folder_path, issues));
            Some(FileEntry::Directory { name, children })
        })
        .collect()
}

fn files_from_value(
    value: Option<Value>,
    path: &str,
    issues: &mut Vec<SchemaIssue>,
) -> Vec<FileEntry> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .into_iter()
            .enumerate()
            .filter_map(|(i, item)| file_from_value(item, &format!("{path}#files[{i}]"), issues))
            .collect(),
        Some(_) => {
            issues.push(SchemaIssue::new(path, "files must be a list"));
            Vec::new()
        }
    }
}

/// Flat `{name, type, ...}` or nested `{name, content: {type, ...}}`
fn file_from_value(value: Value, path: &str, issues: &mut Vec<SchemaIssue>) -> Option<FileEntry> {
    let Value::Object(mut map) = value else {
        issues.push(SchemaIssue::new(path, "file must be an object"));
        return None;
    };
    let Some(Value::String(name)) = map.remove("name") else {
        issues.push(SchemaIssue::new(path, "file has no name"));
        return None;
    };
    let mut fields = match map.remove("content") {
        Some(Value::Object(content)) => content,
        _ => map,
    };
    if let Some(kind) = fields.remove("type") {
        fields.entry("kind").or_insert(kind);
    }
    match serde_json::from_value::<FileDescriptor>(Value::Object(fields)) {
        Ok(descriptor) => Some(FileEntry::Leaf { name, descriptor }),
        Err(e) => {
            issues.push(SchemaIssue::new(format!("{path}:{name}"), e.to_string()));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn document(folder_structure: Value) -> String {
        json!({
            "project_name": "Todo App",
            "description": "tracks tasks",
            "features": [{
                "name": "Task List",
                "description": "lists tasks",
                "acceptance_criteria": ["shows all tasks"]
            }],
            "tech_stack": ["Python"],
            "folder_structure": folder_structure
        })
        .to_string()
    }

    fn paths(reqs: &ProjectRequirements) -> Vec<String> {
        reqs.folder_structure.leaves().into_iter().map(|(p, _)| p).collect()
    }

    #[test]
    fn text_must_not_be_blank() {
        assert_eq!(validate_text(Stage::RequirementsText, "  reqs \n").unwrap(), "reqs");
        assert!(validate_text(Stage::RequirementsText, " \n\t").is_err());
    }

    #[test]
    fn structured_output_is_extracted_from_prose() {
        let raw = format!(
            "Here are the requirements:\n{}\nLet me know!",
            document(json!({
                "name": "todo",
                "subfolders": [{"name": "core", "files": [
                    {"name": "task_list.py", "content": {"type": "class", "description": "tasks"}}
                ]}],
                "files": [{"name": "main.py", "type": "function", "description": "entry"}]
            }))
        );
        let config = PipelineConfig::default();
        let (reqs, payload) =
            validate_structured(Stage::RequirementsStructured, &raw, &config).unwrap();
        assert_eq!(paths(&reqs), vec!["todo/core/task_list.py", "todo/main.py"]);
        // canonical payload parses back to the same document
        assert_eq!(parse_requirements(Stage::Scaffold, &payload).unwrap(), reqs);
    }

    #[test]
    fn map_form_with_several_roots_is_wrapped() {
        let raw = document(json!({
            "backend": {"subfolders": {"src": {"files": [
                {"name": "api.py", "type": "function", "description": "api",
                 "methods": [{"name": "get", "params": ["id"], "return_type": "Task",
                              "description": "fetch"}]}
            ]}}},
            "frontend": {"files": [{"name": "App.js", "type": "component", "description": "root"}]}
        }));
        let config = PipelineConfig::default();
        let (reqs, _) = validate_structured(Stage::RequirementsStructured, &raw, &config).unwrap();
        assert_eq!(reqs.folder_structure.name(), "todo-app");
        assert_eq!(
            paths(&reqs),
            vec!["todo-app/backend/src/api.py", "todo-app/frontend/App.js"]
        );
    }

    #[test]
    fn single_map_root_is_used_directly() {
        let raw = document(json!({
            "app": {"files": [{"name": "main.py", "type": "function", "description": "entry"}]}
        }));
        let (reqs, _) =
            validate_structured(Stage::Scaffold, &raw, &PipelineConfig::default()).unwrap();
        assert_eq!(paths(&reqs), vec!["app/main.py"]);
    }

    #[test]
    fn unknown_file_kind_is_reported() {
        let raw = document(json!({
            "app": {"files": [{"name": "main.py", "type": "script", "description": "entry"}]}
        }));
        let err =
            validate_structured(Stage::Scaffold, &raw, &PipelineConfig::default()).unwrap_err();
        assert_eq!(err.stage, Stage::Scaffold);
        assert!(err.issues[0].path.contains("main.py"));
    }

    #[test]
    fn incomplete_documents_are_rejected() {
        let raw = json!({
            "project_name": "x",
            "description": "y",
            "features": [],
            "tech_stack": [],
            "folder_structure": {"app": {"files": []}}
        })
        .to_string();
        let config = PipelineConfig::default();
        let err = validate_structured(Stage::RequirementsStructured, &raw, &config).unwrap_err();
        let paths: Vec<_> = err.issues.iter().map(|i| i.path.as_str()).collect();
        assert!(paths.contains(&"features"));
        assert!(paths.contains(&"tech_stack"));
        assert!(paths.contains(&"folder_structure"));
    }

    #[test]
    fn tech_stack_allow_list_is_enforced() {
        let raw = document(json!({
            "app": {"files": [{"name": "main.py", "type": "function", "description": "entry"}]}
        }));
        let config = PipelineConfig::default().with_allowed_tech_stack(vec!["rust".into()]);
        let err = validate_structured(Stage::RequirementsStructured, &raw, &config).unwrap_err();
        assert_eq!(err.issues[0].path, "tech_stack[0]");
    }

    #[test]
    fn missing_json_is_a_validation_error() {
        assert!(parse_requirements(Stage::Scaffold, "sorry, I can't").is_err());
        assert!(parse_requirements(Stage::Scaffold, "{not json}").is_err());
    }

    #[test]
    fn code_fences_are_joined() {
        let raw = "Here you go:\n```python\nclass A:\n    pass\n```\nand\n```\nprint(1)\n```\n";
        assert_eq!(
            validate_code("app/a.py", raw).unwrap(),
            "class A:\n    pass\n\nprint(1)"
        );
    }

    #[test]
    fn unfenced_code_is_trimmed() {
        assert_eq!(validate_code("a.py", "\n  x = 1\n").unwrap(), "x = 1");
        let err = validate_code("a.py", "```\n\n```").unwrap_err();
        assert_eq!(err.file.as_deref(), Some("a.py"));
    }
}
