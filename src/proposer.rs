//! Code-change proposer.
//!
//! Turns a code-related finding (or a directive) into a reviewable
//! `ChangePlan`. It only describes changes; nothing here writes to source
//! files or flips `applied`.

use std::collections::HashSet;
use std::path::Path;

use crate::error::ProposalError;
use crate::types::{ChangePlan, FileAction, FileChange, Finding, FindingCategory, RiskLevel, Task};
use crate::util::slugify;

/// What the drafter is asked to address.
#[derive(Debug, Clone)]
pub struct ProposalRequest {
    pub category: FindingCategory,
    pub title: String,
    pub description: String,
    pub location: Option<String>,
    pub detection_method: Option<String>,
}

impl ProposalRequest {
    pub fn from_finding(finding: &Finding, task: &Task) -> Self {
        Self {
            category: finding.category,
            title: task.title.clone(),
            description: finding.description.clone(),
            location: Some(finding.location.clone()).filter(|l| !l.trim().is_empty()),
            detection_method: Some(finding.detection_method.clone()),
        }
    }

    /// Directive tasks have no finding; treat them as improvements.
    pub fn from_task(task: &Task) -> Self {
        Self {
            category: FindingCategory::Improvement,
            title: task.title.clone(),
            description: task.detail.clone(),
            location: task.location.clone(),
            detection_method: None,
        }
    }
}

/// A candidate change before the proposer assigns risk.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftChange {
    pub path: String,
    pub action: FileAction,
    pub description: String,
    pub rationale: String,
}

/// Drafts candidate file changes for a request.
pub trait ChangeDrafter: Send + Sync {
    fn draft(&self, request: &ProposalRequest) -> Result<Vec<DraftChange>, String>;
}

// =============================================================================
// Heuristic drafter
// =============================================================================

/// Derives changes from the category and a `path[:line]` location.
#[derive(Debug, Default)]
pub struct HeuristicDrafter;

/// Split `src/api/search.rs:42` into the path and line. Returns `None` for
/// locations that are not source paths (operation names, URLs, tables).
fn parse_location(location: &str) -> Option<(String, Option<u32>)> {
    let location = location.trim();
    if location.is_empty()
        || location.contains("://")
        || location.contains(char::is_whitespace)
        || location.starts_with("detector/")
    {
        return None;
    }

    let (path, line) = match location.rsplit_once(':') {
        Some((path, line)) if line.chars().all(|c| c.is_ascii_digit()) && !line.is_empty() => {
            (path, line.parse().ok())
        }
        _ => (location, None),
    };

    let has_extension = Path::new(path).extension().is_some();
    if path.contains('/') || has_extension {
        Some((path.to_string(), line))
    } else {
        None
    }
}

/// Where a regression test for `path` goes.
fn regression_test_path(path: &str) -> String {
    let p = Path::new(path);
    let stem = p.file_stem().and_then(|s| s.to_str()).unwrap_or("module");
    match p.extension().and_then(|e| e.to_str()) {
        Some("rs") => format!("tests/{}_regression.rs", stem),
        Some(ext) => {
            let file = format!("{}.regression.test.{}", stem, ext);
            match p.parent().filter(|d| !d.as_os_str().is_empty()) {
                Some(dir) => format!("{}/{}", dir.display(), file),
                None => file,
            }
        }
        None => format!("tests/{}_regression", stem),
    }
}

impl ChangeDrafter for HeuristicDrafter {
    fn draft(&self, request: &ProposalRequest) -> Result<Vec<DraftChange>, String> {
        let evidence = match &request.detection_method {
            Some(method) => format!("{} (detected by {})", request.description, method),
            None => request.description.clone(),
        };

        let located = request.location.as_deref().and_then(parse_location);
        let Some((path, line)) = located else {
            return Ok(vec![DraftChange {
                path: format!("docs/proposals/{}.md", slugify(&request.title, 60)),
                action: FileAction::Create,
                description: format!("Write up a proposal for: {}", request.title),
                rationale: evidence,
            }]);
        };

        let site = match line {
            Some(line) => format!("{} near line {}", path, line),
            None => path.clone(),
        };
        let fix = match request.category {
            FindingCategory::Error => format!("Handle the failure raised in {}", site),
            FindingCategory::Performance => format!("Reduce latency of the hot path in {}", site),
            FindingCategory::DataIntegrity => format!("Enforce the data constraint at the write site in {}", site),
            FindingCategory::Improvement => format!("Implement: {} in {}", request.title, site),
        };

        let mut changes = vec![DraftChange {
            path: path.clone(),
            action: FileAction::Modify,
            description: fix,
            rationale: evidence.clone(),
        }];

        if request.category == FindingCategory::Error {
            changes.push(DraftChange {
                path: regression_test_path(&path),
                action: FileAction::Create,
                description: format!("Add a regression test reproducing the failure in {}", site),
                rationale: format!("Keeps the fix for \"{}\" from regressing", request.description),
            });
        }

        Ok(changes)
    }
}

// =============================================================================
// Risk
// =============================================================================

const SHARED_FILES: &[&str] = &["mod.rs", "lib.rs", "main.rs", "__init__.py"];
const SHARED_SEGMENTS: &[&str] = &["shared", "common", "core", "utils", "lib"];
const BUILD_FILES: &[&str] = &["Cargo.toml", "package.json"];
const BUILD_EXTENSIONS: &[&str] = &["sql", "lock"];

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Module roots, entry points, and anything under a shared directory.
fn is_shared_module(path: &str) -> bool {
    let name = file_name(path);
    if SHARED_FILES.contains(&name) || name.starts_with("index.") {
        return true;
    }
    let mut segments: Vec<&str> = path.split('/').collect();
    segments.pop();
    segments.iter().any(|s| SHARED_SEGMENTS.contains(s))
}

fn is_build_or_schema(path: &str) -> bool {
    let name = file_name(path);
    BUILD_FILES.contains(&name)
        || Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| BUILD_EXTENSIONS.contains(&e))
}

fn is_test_file(path: &str) -> bool {
    let name = file_name(path);
    path.starts_with("tests/")
        || path.contains("/tests/")
        || path.contains("/__tests__/")
        || name.contains(".test.")
        || name.contains(".spec.")
        || name.ends_with("_test.rs")
        || name.ends_with("_test.go")
        || name.starts_with("test_")
}

/// Blast-radius classification. The drafter's opinion is never consulted.
pub fn classify_risk(path: &str, action: FileAction) -> RiskLevel {
    match action {
        FileAction::Create => RiskLevel::Low,
        FileAction::Delete if is_shared_module(path) => RiskLevel::High,
        FileAction::Delete => RiskLevel::Medium,
        FileAction::Modify if is_shared_module(path) => RiskLevel::High,
        FileAction::Modify if is_build_or_schema(path) => RiskLevel::Medium,
        FileAction::Modify if is_test_file(path) => RiskLevel::Low,
        FileAction::Modify => RiskLevel::Medium,
    }
}

// =============================================================================
// Validation and notes
// =============================================================================

fn validate(changes: &[DraftChange]) -> Result<(), ProposalError> {
    if changes.is_empty() {
        return Err(ProposalError::Empty);
    }
    let invalid = |path: &str, reason: &str| ProposalError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    let mut seen = HashSet::new();
    for change in changes {
        let path = change.path.as_str();
        if path.trim().is_empty() {
            return Err(invalid(path, "empty path"));
        }
        let has_drive = path.len() > 1 && path.as_bytes()[1] == b':';
        if path.starts_with('/') || path.starts_with('\\') || has_drive {
            return Err(invalid(path, "absolute paths are not allowed"));
        }
        if path.split(['/', '\\']).any(|segment| segment == "..") {
            return Err(invalid(path, "parent directory segments are not allowed"));
        }
        if !seen.insert(path) {
            return Err(ProposalError::DuplicatePath(path.to_string()));
        }
    }
    Ok(())
}

fn testing_notes(files: &[FileChange]) -> String {
    let mut lines: Vec<String> = files
        .iter()
        .map(|f| match f.action {
            FileAction::Create => format!("- {}: confirm the new file builds and its checks run in CI", f.path),
            FileAction::Modify => format!("- {}: run the tests covering this file and re-check the finding", f.path),
            FileAction::Delete => format!("- {}: confirm nothing still references this file", f.path),
        })
        .collect();

    if files.iter().any(|f| f.risk == RiskLevel::High) {
        lines.push("- High-risk change: requires reviewer sign-off before it is applied".to_string());
    }
    lines.join("\n")
}

// =============================================================================
// Proposer
// =============================================================================

pub struct Proposer {
    drafter: Box<dyn ChangeDrafter>,
}

impl Default for Proposer {
    fn default() -> Self {
        Self::new(Box::new(HeuristicDrafter))
    }
}

impl Proposer {
    pub fn new(drafter: Box<dyn ChangeDrafter>) -> Self {
        Self { drafter }
    }

    /// Draft, classify and validate a plan for `task_id`. The plan is never applied.
    pub fn propose(&self, task_id: &str, request: &ProposalRequest, now: &str) -> Result<ChangePlan, ProposalError> {
        let drafts = self.drafter.draft(request).map_err(ProposalError::Drafter)?;
        validate(&drafts)?;

        let files: Vec<FileChange> = drafts
            .into_iter()
            .map(|d| FileChange {
                risk: classify_risk(&d.path, d.action),
                path: d.path,
                action: d.action,
                description: d.description,
                rationale: d.rationale,
            })
            .collect();
        let notes = testing_notes(&files);

        Ok(ChangePlan::new(task_id, files, notes, now.to_string()))
    }
}
