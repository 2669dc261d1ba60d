//! Per-iteration records for Ralph loops under `Ralph_Logs/<task>/`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::layout::VaultPaths;
use super::store::{stem, write_atomic};
use crate::core::response::ParseMode;
use crate::core::types::{NextAction, ToolCall, format_timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub name: String,
    pub ok: bool,
    pub output: String,
}

/// Everything that happened in one iteration. Written once, never rewritten.
///
/// `iteration` counts within one run of the loop; `step` numbers the record
/// within the task's log, so a task that runs again appends after its
/// earlier runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub task: String,
    pub step: u32,
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub thought: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    /// `None` when the reply could not be parsed.
    pub next_action: Option<NextAction>,
    pub parse: ParseMode,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub json_path: PathBuf,
    pub markdown_path: PathBuf,
}

impl IterationPaths {
    pub fn new(paths: &VaultPaths, task: &str, step: u32) -> Self {
        let dir = task_log_dir(paths, task);
        Self {
            json_path: dir.join(format!("step_{step:02}.json")),
            markdown_path: dir.join(format!("step_{step:02}.md")),
            dir,
        }
    }
}

pub fn task_log_dir(paths: &VaultPaths, task: &str) -> PathBuf {
    paths.ralph_logs.join(stem(task))
}

/// Write the JSON and markdown views of `record`. Existing steps are never replaced.
pub fn write_iteration(paths: &VaultPaths, record: &IterationRecord) -> Result<IterationPaths> {
    let out = IterationPaths::new(paths, &record.task, record.step);
    if out.json_path.exists() {
        bail!(
            "iteration record already exists: {}",
            out.json_path.display()
        );
    }
    let mut json = serde_json::to_string_pretty(record).context("serialize iteration record")?;
    json.push('\n');
    write_atomic(&out.json_path, &json)?;
    write_atomic(&out.markdown_path, &render_markdown(record))?;
    Ok(out)
}

/// Highest step already recorded for `task`, or 0 when it has no log yet.
pub fn last_step(paths: &VaultPaths, task: &str) -> Result<u32> {
    Ok(step_files(paths, task)?.last().map_or(0, |(step, _)| *step))
}

/// Load every record for `task`, in step order across all runs.
pub fn read_iterations(paths: &VaultPaths, task: &str) -> Result<Vec<IterationRecord>> {
    step_files(paths, task)?
        .iter()
        .map(|(_, path)| read_record(path))
        .collect()
}

/// `(step, path)` for each `step_NN.json`, sorted numerically.
fn step_files(paths: &VaultPaths, task: &str) -> Result<Vec<(u32, PathBuf)>> {
    let dir = task_log_dir(paths, task);
    let mut files: Vec<(u32, PathBuf)> = super::store::list_files(&dir)?
        .into_iter()
        .filter_map(|name| {
            let step = name
                .strip_prefix("step_")?
                .strip_suffix(".json")?
                .parse()
                .ok()?;
            Some((step, dir.join(name)))
        })
        .collect();
    files.sort_by_key(|(step, _)| *step);
    Ok(files)
}

fn read_record(path: &Path) -> Result<IterationRecord> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

fn render_markdown(record: &IterationRecord) -> String {
    let mut out = String::new();
    let next = record.next_action.map_or("UNPARSEABLE", NextAction::as_str);
    let _ = writeln!(
        out,
        "# {} - step {} (iteration {})",
        record.task, record.step, record.iteration
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "- started: {}", format_timestamp(record.started_at));
    let _ = writeln!(out, "- duration_ms: {}", record.duration_ms);
    let _ = writeln!(out, "- next_action: {next}");
    let _ = writeln!(out, "- parse: {}", record.parse.as_str());
    if let Some(note) = &record.note {
        let _ = writeln!(out, "- note: {note}");
    }
    let _ = writeln!(out, "\n## Thought\n\n{}", record.thought.trim());
    if !record.tool_calls.is_empty() {
        let _ = writeln!(out, "\n## Tool Calls\n");
        for call in &record.tool_calls {
            let _ = writeln!(out, "- `{}` {}", call.name, call.arguments);
        }
    }
    if !record.tool_results.is_empty() {
        let _ = writeln!(out, "\n## Tool Results\n");
        for result in &record.tool_results {
            let mark = if result.ok { "ok" } else { "error" };
            let _ = writeln!(out, "- `{}` ({mark}): {}", result.name, result.output);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::layout::{InitOptions, init_vault};
    use serde_json::json;

    fn record(iteration: u32) -> IterationRecord {
        IterationRecord {
            task: "research.md".to_string(),
            step: iteration,
            iteration,
            started_at: Utc::now(),
            duration_ms: 12,
            thought: "look things up".to_string(),
            tool_calls: vec![ToolCall {
                name: "read_file".to_string(),
                arguments: json!({"path": "Plans/x.md"}),
            }],
            tool_results: vec![ToolResult {
                name: "read_file".to_string(),
                ok: false,
                output: "missing".to_string(),
            }],
            next_action: Some(NextAction::Continue),
            parse: ParseMode::Strict,
            note: None,
        }
    }

    #[test]
    fn writes_numbered_json_and_markdown() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_vault(temp.path(), &InitOptions { force: false }).expect("init");
        let out = write_iteration(&paths, &record(3)).expect("write");

        assert!(out.json_path.ends_with("Ralph_Logs/research/step_03.json"));
        let md = std::fs::read_to_string(&out.markdown_path).expect("md");
        assert!(md.contains("next_action: CONTINUE"));
        assert!(md.contains("`read_file` (error): missing"));
    }

    #[test]
    fn records_are_immutable_and_read_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_vault(temp.path(), &InitOptions { force: false }).expect("init");
        write_iteration(&paths, &record(2)).expect("write");
        write_iteration(&paths, &record(1)).expect("write");
        assert!(write_iteration(&paths, &record(1)).is_err());

        let loaded = read_iterations(&paths, "research.md").expect("read");
        let order: Vec<u32> = loaded.iter().map(|r| r.iteration).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn last_step_orders_numerically_past_two_digits() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_vault(temp.path(), &InitOptions { force: false }).expect("init");
        assert_eq!(last_step(&paths, "research.md").expect("empty"), 0);

        for step in [9, 100, 10] {
            let mut rec = record(1);
            rec.step = step;
            write_iteration(&paths, &rec).expect("write");
        }
        assert_eq!(last_step(&paths, "research.md").expect("last"), 100);
        let steps: Vec<u32> = read_iterations(&paths, "research.md")
            .expect("read")
            .iter()
            .map(|r| r.step)
            .collect();
        assert_eq!(steps, vec![9, 10, 100]);
    }
}
