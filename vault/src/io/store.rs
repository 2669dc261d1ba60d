//! Task file store: listing, reading, atomic rewrites and stage moves.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::debug;

use super::layout::VaultPaths;
use crate::core::frontmatter::TaskDocument;
use crate::core::stage::{Stage, check_transition};

/// A task document loaded from a stage directory.
#[derive(Debug, Clone)]
pub struct TaskFile {
    pub name: String,
    pub path: PathBuf,
    pub doc: TaskDocument,
}

/// Names of the markdown documents in `dir`, sorted.
///
/// Hidden files (including in-flight temp files) are skipped. A missing
/// directory lists as empty.
pub fn list_markdown(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for name in list_entries(dir)? {
        if name.ends_with(".md") && dir.join(&name).is_file() {
            names.push(name);
        }
    }
    Ok(names)
}

/// Names of all visible regular files in `dir`, sorted.
pub fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for name in list_entries(dir)? {
        if dir.join(&name).is_file() {
            names.push(name);
        }
    }
    Ok(names)
}

fn list_entries(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read dir entry in {}", dir.display()))?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

pub fn read_task(path: &Path) -> Result<TaskFile> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let name = file_name(path)?;
    Ok(TaskFile {
        name,
        path: path.to_path_buf(),
        doc: TaskDocument::parse(&contents),
    })
}

/// Atomically replace `path` with the rendered document (temp file + rename).
pub fn write_document(path: &Path, doc: &TaskDocument) -> Result<()> {
    write_atomic(path, &doc.render())
}

/// Write a document that must not exist yet.
pub fn create_document(path: &Path, doc: &TaskDocument) -> Result<()> {
    if path.exists() {
        bail!("refusing to overwrite {}", path.display());
    }
    write_document(path, doc)
}

/// Atomically write `contents` to `path`; the temp file is hidden so scans skip it.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name(path)?));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Move `name` from one stage directory to another along a legal edge.
///
/// Archive stages (`Done`, `Rejected`) never clobber: a colliding name gets a
/// timestamp suffix. Any other collision is an error. Returns the new path.
pub fn move_task(paths: &VaultPaths, name: &str, from: Stage, to: Stage) -> Result<PathBuf> {
    check_transition(from, to)?;
    let src = paths.stage_path(from, name);
    let dest_dir = paths.stage_dir(to);
    fs::create_dir_all(dest_dir)
        .with_context(|| format!("create directory {}", dest_dir.display()))?;

    let mut dest = dest_dir.join(name);
    if dest.exists() {
        if !matches!(to, Stage::Done | Stage::Rejected) {
            bail!(
                "cannot move {name} to {to}: {} already exists",
                dest.display()
            );
        }
        dest = dest_dir.join(unique_name(dest_dir, name));
    }

    fs::rename(&src, &dest)
        .with_context(|| format!("move {} -> {}", src.display(), dest.display()))?;
    debug!(task = name, %from, %to, "moved task");
    Ok(dest)
}

/// Pick a name in `dir` that does not exist yet, derived from `name`.
pub fn unique_name(dir: &Path, name: &str) -> String {
    if !dir.join(name).exists() {
        return name.to_string();
    }
    let (base, ext) = split_extension(name);
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let mut n = 0u32;
    loop {
        let candidate = if n == 0 {
            format!("{base}.{stamp}{ext}")
        } else {
            format!("{base}.{stamp}-{n}{ext}")
        };
        if !dir.join(&candidate).exists() {
            return candidate;
        }
        n += 1;
    }
}

/// File name without its final extension (`invoice.md` -> `invoice`).
pub fn stem(name: &str) -> &str {
    split_extension(name).0
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("path has no file name {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::AgentRole;
    use crate::io::layout::{InitOptions, init_vault};

    #[test]
    fn listing_skips_hidden_and_non_markdown() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path();
        fs::write(dir.join("b.md"), "b").expect("write");
        fs::write(dir.join("a.md"), "a").expect("write");
        fs::write(dir.join(".a.md.tmp"), "tmp").expect("write");
        fs::write(dir.join("scan.pdf"), "pdf").expect("write");
        fs::create_dir(dir.join("sub.md")).expect("mkdir");

        assert_eq!(list_markdown(dir).expect("list"), vec!["a.md", "b.md"]);
        assert_eq!(
            list_files(dir).expect("list"),
            vec!["a.md", "b.md", "scan.pdf"]
        );
        assert!(list_markdown(&dir.join("missing")).expect("list").is_empty());
    }

    #[test]
    fn write_document_replaces_without_leaving_temp_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("task.md");
        let mut doc = TaskDocument::new("# Task\n");
        doc.set("status", "new");
        write_document(&path, &doc).expect("write");
        doc.set("status", "done");
        write_document(&path, &doc).expect("rewrite");

        let loaded = read_task(&path).expect("read");
        assert_eq!(loaded.name, "task.md");
        assert_eq!(loaded.doc.status(), Some("done"));
        let names: Vec<_> = fs::read_dir(temp.path())
            .expect("read dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn move_rejects_illegal_edges() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_vault(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(paths.inbox.join("t.md"), "x").expect("write");

        let err = move_task(&paths, "t.md", Stage::Inbox, Stage::Done).unwrap_err();
        assert!(err.to_string().contains("illegal stage transition"));
        assert!(paths.inbox.join("t.md").exists());
    }

    /// Archive stages keep both files when names collide.
    #[test]
    fn move_into_done_never_clobbers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_vault(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(paths.done.join("t.md"), "old").expect("write");
        fs::write(paths.in_progress_local.join("t.md"), "new").expect("write");

        let dest = move_task(
            &paths,
            "t.md",
            Stage::InProgress(AgentRole::Local),
            Stage::Done,
        )
        .expect("move");

        assert_ne!(dest, paths.done.join("t.md"));
        assert_eq!(fs::read_to_string(paths.done.join("t.md")).expect("read"), "old");
        assert_eq!(fs::read_to_string(&dest).expect("read"), "new");
        assert_eq!(list_markdown(&paths.done).expect("list").len(), 2);
    }

    #[test]
    fn stem_strips_last_extension() {
        assert_eq!(stem("invoice.md"), "invoice");
        assert_eq!(stem("archive.tar.gz"), "archive.tar");
        assert_eq!(stem(".hidden"), ".hidden");
        assert_eq!(stem("README"), "README");
    }
}
