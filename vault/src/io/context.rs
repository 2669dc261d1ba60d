//! Bounded context gathering for engine prompts.
//!
//! A task's context is the task itself plus a handful of directly related
//! files, each cut to a fixed size. Nothing from earlier iterations
//! accumulates here.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use super::layout::VaultPaths;
use super::store::{TaskFile, stem};
use crate::core::stage::Stage;

/// A related document excerpt included in a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelatedFile {
    pub name: String,
    pub excerpt: String,
}

/// Collect up to `limit` files related to `task`, each cut to `max_chars` characters.
///
/// Candidates, in order: the task's existing plan, the attachment named by
/// `original_file` (beside the task or still in `Needs_Action/`), then file
/// names mentioned in the body, looked up in
/// `Plans/`, `Done/` and `Needs_Action/`.
pub fn related_files(
    paths: &VaultPaths,
    task: &TaskFile,
    limit: usize,
    max_chars: usize,
) -> Result<Vec<RelatedFile>> {
    static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"[A-Za-z0-9_][A-Za-z0-9_.\-]*\.(?:md|txt|json|csv)\b").expect("valid mention regex")
    });

    let task_dir = task.path.parent().unwrap_or(&paths.root);
    let mut candidates = vec![paths.plans.join(format!("PLAN_{}.md", stem(&task.name)))];
    if let Some(original) = task.doc.get("original_file") {
        candidates.push(task_dir.join(original));
        candidates.push(paths.needs_action.join(original));
    }
    let search_dirs = [
        paths.plans.as_path(),
        paths.stage_dir(Stage::Done),
        paths.stage_dir(Stage::NeedsAction),
    ];
    for mention in MENTION_RE.find_iter(&task.doc.body) {
        let name = mention.as_str();
        if name.contains('/') || name == task.name {
            continue;
        }
        for dir in search_dirs {
            candidates.push(dir.join(name));
        }
    }

    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for path in candidates {
        if out.len() >= limit {
            break;
        }
        if path == task.path || !path.is_file() || !seen.insert(path.clone()) {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(text) = read_text(&path)? else {
            continue;
        };
        out.push(RelatedFile {
            name: name.to_string(),
            excerpt: truncate_chars(&text, max_chars),
        });
    }
    debug!(task = %task.name, related = out.len(), "gathered related files");
    Ok(out)
}

/// Read a file as UTF-8 text; binary files are skipped.
fn read_text(path: &Path) -> Result<Option<String>> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(String::from_utf8(bytes).ok())
}

/// Keep the first `max_chars` characters, marking the cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push_str("\n[truncated]");
    out
}
