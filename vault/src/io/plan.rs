//! Plan documents written to `Plans/PLAN_<task>.md` when a task finishes.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;

use super::layout::VaultPaths;
use super::store::{stem, write_document};
use crate::core::external::ExternalError;
use crate::core::frontmatter::TaskDocument;
use crate::core::types::format_timestamp;

/// Why a task could not be completed, rendered into an error plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanFailure {
    pub kind: String,
    pub message: String,
    pub next_steps: Vec<String>,
}

impl PlanFailure {
    pub fn new(kind: &str, message: impl Into<String>, next_steps: &[&str]) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            next_steps: next_steps.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl From<&ExternalError> for PlanFailure {
    fn from(err: &ExternalError) -> Self {
        PlanFailure::new(err.kind(), err.to_string(), err.remediation())
    }
}

pub fn plan_path(paths: &VaultPaths, task: &str) -> PathBuf {
    paths.plans.join(format!("PLAN_{}.md", stem(task)))
}

/// Write the plan for a completed task. One plan per task: a rerun replaces it.
pub fn write_plan(paths: &VaultPaths, task: &str, content: &str) -> Result<PathBuf> {
    let mut doc = plan_document(task, "completed");
    doc.body = format!("# Plan: {task}\n\n{}\n", content.trim());
    let path = plan_path(paths, task);
    write_document(&path, &doc)?;
    Ok(path)
}

/// Write an error plan with a visible `# ERROR:` marker and next steps.
pub fn write_error_plan(paths: &VaultPaths, task: &str, failure: &PlanFailure) -> Result<PathBuf> {
    let mut doc = plan_document(task, "error");
    doc.set("error_kind", &failure.kind);
    let mut body = String::new();
    let _ = writeln!(body, "# ERROR: {task} could not be completed\n");
    let _ = writeln!(body, "- kind: {}", failure.kind);
    let _ = writeln!(body, "- message: {}", failure.message.trim());
    if !failure.next_steps.is_empty() {
        let _ = writeln!(body, "\n## Next Steps\n");
        for (idx, step) in failure.next_steps.iter().enumerate() {
            let _ = writeln!(body, "{}. {step}", idx + 1);
        }
    }
    doc.body = body;
    let path = plan_path(paths, task);
    write_document(&path, &doc)?;
    Ok(path)
}

fn plan_document(task: &str, status: &str) -> TaskDocument {
    let mut doc = TaskDocument::new(String::new());
    doc.set("type", "plan");
    doc.set("created", format_timestamp(Utc::now()));
    doc.set("status", status);
    doc.set("original_file", task);
    doc
}
