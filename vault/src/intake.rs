//! Promote `Inbox/` drops into `Needs_Action/`.

use std::fs;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::frontmatter::TaskDocument;
use crate::core::stage::Stage;
use crate::core::types::format_timestamp;
use crate::io::layout::VaultPaths;
use crate::io::store::{
    create_document, list_files, move_task, read_task, stem, unique_name, write_document,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntakeSummary {
    /// Markdown tasks promoted as-is.
    pub tasks: usize,
    /// Other files promoted with a generated `FILE_<stem>.md` task.
    pub files: usize,
    pub errors: usize,
}

/// Stamp and move every inbox entry; a failure on one entry does not stop the rest.
#[instrument(skip_all)]
pub fn promote_inbox(paths: &VaultPaths) -> Result<IntakeSummary> {
    let mut summary = IntakeSummary::default();
    for name in list_files(&paths.inbox)? {
        let result = if name.ends_with(".md") {
            promote_task(paths, &name).map(|_| summary.tasks += 1)
        } else {
            promote_file(paths, &name).map(|_| summary.files += 1)
        };
        if let Err(err) = result {
            warn!(entry = %name, err = %format!("{err:#}"), "inbox entry not promoted");
            summary.errors += 1;
        }
    }
    if summary.tasks + summary.files > 0 {
        info!(tasks = summary.tasks, files = summary.files, "inbox promoted");
    }
    Ok(summary)
}

fn promote_task(paths: &VaultPaths, name: &str) -> Result<String> {
    let path = paths.inbox.join(name);
    let mut task = read_task(&path)?;
    task.doc.set_if_missing("created", format_timestamp(Utc::now()));
    task.doc.set_if_missing("status", "new");
    write_document(&path, &task.doc)?;
    move_into_needs_action(paths, name)
}

fn promote_file(paths: &VaultPaths, name: &str) -> Result<String> {
    let size = fs::metadata(paths.inbox.join(name))
        .with_context(|| format!("stat inbox file {name}"))?
        .len();
    let target = move_into_needs_action(paths, name)?;

    let mut doc = TaskDocument::new(format!(
        "# New file: {target}\n\nA file was dropped into the inbox and needs review.\n\n- file: {target}\n- size: {size} bytes\n"
    ));
    doc.set("type", "file_drop");
    doc.set("original_file", &target);
    doc.set("created", format_timestamp(Utc::now()));
    doc.set("status", "new");
    doc.set("priority", "normal");
    let task_name = unique_name(&paths.needs_action, &format!("FILE_{}.md", stem(&target)));
    create_document(&paths.needs_action.join(&task_name), &doc)?;
    Ok(task_name)
}

/// Move `name` to `Needs_Action/`, renaming it first if the name is taken there.
fn move_into_needs_action(paths: &VaultPaths, name: &str) -> Result<String> {
    let target = unique_name(&paths.needs_action, name);
    if target != name {
        let from = paths.inbox.join(name);
        let to = paths.inbox.join(&target);
        fs::rename(&from, &to)
            .with_context(|| format!("rename {} -> {}", from.display(), to.display()))?;
    }
    move_task(paths, &target, Stage::Inbox, Stage::NeedsAction)?;
    Ok(target)
}
