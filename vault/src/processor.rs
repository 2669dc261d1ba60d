//! Single-pass task processing and the `Needs_Action/` scan.
//!
//! A scan claims tasks one at a time (priority, then name) and processes each
//! to a terminal move. A failure on one task is audited and the scan moves on.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

use crate::core::approval::ApprovalDraft;
use crate::core::frontmatter::TaskDocument;
use crate::core::stage::Stage;
use crate::core::types::{Priority, TaskMode, format_timestamp};
use crate::io::audit::{AuditAction, AuditActor};
use crate::io::claim::{Claimed, claim};
use crate::io::context::related_files;
use crate::io::engine::ReasoningEngine;
use crate::io::layout::VaultPaths;
use crate::io::plan::{PlanFailure, write_error_plan, write_plan};
use crate::io::prompt::{SinglePassInputs, TaskContext};
use crate::io::store::{list_markdown, move_task, read_task, unique_name};
use crate::ralph::run_ralph;
use crate::runtime::Runtime;

/// Action used when a task needs a person rather than a tool.
pub const HUMAN_REVIEW: &str = "human_review";

/// Where a processed task ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    Failed { reason: String },
    AwaitingApproval { action: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub name: String,
    pub outcome: TaskOutcome,
    pub path: PathBuf,
}

/// Counters for one scan of `Needs_Action/`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub done: usize,
    pub failed: usize,
    pub awaiting_approval: usize,
    /// Tasks another agent claimed first.
    pub lost: usize,
    /// Tasks that hit an error and could not be moved to `Done/` as failed.
    pub errors: usize,
}

impl ScanSummary {
    fn tally(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Done => self.done += 1,
            TaskOutcome::Failed { .. } => self.failed += 1,
            TaskOutcome::AwaitingApproval { .. } => self.awaiting_approval += 1,
        }
    }
}

/// Claim and process every task currently in `Needs_Action/`.
#[instrument(skip_all, fields(role = %rt.role))]
pub fn process_pending<E: ReasoningEngine>(rt: &Runtime<'_, E>) -> Result<ScanSummary> {
    let mut summary = ScanSummary::default();
    for name in ordered_candidates(rt.paths)? {
        let claimed = match claim(rt.paths, Stage::NeedsAction, &name, rt.role) {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                summary.lost += 1;
                continue;
            }
            Err(err) => {
                report_task_error(rt, &name, &err);
                summary.errors += 1;
                continue;
            }
        };
        match process_claimed(rt, claimed) {
            Ok(report) => {
                info!(task = %report.name, outcome = ?report.outcome, "task processed");
                summary.tally(&report.outcome);
            }
            Err(err) => {
                report_task_error(rt, &name, &err);
                match fail_stranded(rt, &name, &err) {
                    Ok(Some(report)) => summary.tally(&report.outcome),
                    Ok(None) => summary.errors += 1,
                    Err(recovery) => {
                        report_task_error(rt, &name, &recovery.context("fail task after error"));
                        summary.errors += 1;
                    }
                }
            }
        }
    }
    Ok(summary)
}

/// Task names ordered high -> normal -> low priority, then by name.
fn ordered_candidates(paths: &VaultPaths) -> Result<Vec<String>> {
    let mut ranked = Vec::new();
    for name in list_markdown(&paths.needs_action)? {
        // A file that vanished mid-listing was claimed elsewhere.
        let Ok(task) = read_task(&paths.needs_action.join(&name)) else {
            continue;
        };
        ranked.push((Priority::from_front_matter(task.doc.get("priority")), name));
    }
    ranked.sort();
    Ok(ranked.into_iter().map(|(_, name)| name).collect())
}

/// Process a task this agent owns, dispatching on its `mode`.
pub fn process_claimed<E: ReasoningEngine>(
    rt: &Runtime<'_, E>,
    claimed: Claimed,
) -> Result<TaskReport> {
    match TaskMode::from_front_matter(claimed.task.doc.get("mode")) {
        TaskMode::Ralph => run_ralph(rt, claimed).map(|outcome| outcome.report),
        TaskMode::SinglePass => run_single_pass(rt, claimed),
    }
}

#[instrument(skip_all, fields(task = %claimed.name()))]
fn run_single_pass<E: ReasoningEngine>(
    rt: &Runtime<'_, E>,
    claimed: Claimed,
) -> Result<TaskReport> {
    let related = related_files(
        rt.paths,
        &claimed.task,
        rt.config.ralph.related_files_limit,
        rt.config.ralph.related_file_bytes,
    )?;
    let prompt = rt.prompt_builder().build_single_pass(&SinglePassInputs {
        task: task_context(&claimed),
        related,
    })?;

    let reply = match rt.call_engine(claimed.name(), prompt, None) {
        Ok(reply) => reply,
        Err(err) => {
            write_error_plan(rt.paths, claimed.name(), &PlanFailure::from(&err))?;
            return fail_task(rt, claimed, err.kind());
        }
    };
    write_plan(rt.paths, claimed.name(), &reply)?;

    let declared = claimed.task.doc.get("action").map(str::to_string);
    if declared.is_some() || rt.is_sensitive(&claimed.task.doc.body) {
        let params = match declared_params(&claimed.task.doc) {
            Ok(params) => params,
            Err(err) => {
                let failure = PlanFailure::new(
                    "invalid_params",
                    format!("{err:#}"),
                    &["Fix the `params` front matter (a JSON object) and move the task back to Needs_Action."],
                );
                write_error_plan(rt.paths, claimed.name(), &failure)?;
                return fail_task(rt, claimed, "invalid_params");
            }
        };
        let reason = match &declared {
            Some(action) => format!("The task requests the `{action}` action."),
            None => "The task mentions a sensitive operation and needs a human decision.".to_string(),
        };
        let action = declared.unwrap_or_else(|| HUMAN_REVIEW.to_string());
        return escalate(rt, claimed, &action, params, &reason);
    }
    complete_task(rt, claimed)
}

pub(crate) fn task_context(claimed: &Claimed) -> TaskContext {
    TaskContext {
        name: claimed.name().to_string(),
        priority: Priority::from_front_matter(claimed.task.doc.get("priority"))
            .as_str()
            .to_string(),
        body: claimed.task.doc.body.clone(),
    }
}

/// The task's `params` front matter as a JSON object; `{}` when absent.
fn declared_params(doc: &TaskDocument) -> Result<Value> {
    let Some(raw) = doc.get("params") else {
        return Ok(json!({}));
    };
    let value: Value = serde_json::from_str(raw).context("parse params front matter")?;
    anyhow::ensure!(value.is_object(), "params must be a JSON object");
    Ok(value)
}

/// Mark the task done and archive it.
pub(crate) fn complete_task<E: ReasoningEngine>(
    rt: &Runtime<'_, E>,
    mut claimed: Claimed,
) -> Result<TaskReport> {
    claimed.task.doc.set("status", "done");
    claimed
        .task
        .doc
        .set("completed_at", format_timestamp(Utc::now()));
    archive(rt, claimed, TaskOutcome::Done)
}

/// Record a terminal failure and archive the task; it is never retried automatically.
pub(crate) fn fail_task<E: ReasoningEngine>(
    rt: &Runtime<'_, E>,
    mut claimed: Claimed,
    reason: &str,
) -> Result<TaskReport> {
    claimed.task.doc.set("status", "failed");
    claimed.task.doc.set("failure_reason", reason);
    claimed
        .task
        .doc
        .set("completed_at", format_timestamp(Utc::now()));
    warn!(task = %claimed.name(), reason, "task failed");
    archive(
        rt,
        claimed,
        TaskOutcome::Failed {
            reason: reason.to_string(),
        },
    )
}

fn archive<E: ReasoningEngine>(
    rt: &Runtime<'_, E>,
    claimed: Claimed,
    outcome: TaskOutcome,
) -> Result<TaskReport> {
    claimed.save()?;
    release_attachment(rt.paths, &claimed.task.doc)?;
    let path = move_task(rt.paths, claimed.name(), claimed.stage(), Stage::Done)?;
    Ok(TaskReport {
        name: claimed.task.name,
        outcome,
        path,
    })
}

/// Turn the task itself into a pending approval request for `action`.
pub(crate) fn escalate<E: ReasoningEngine>(
    rt: &Runtime<'_, E>,
    mut claimed: Claimed,
    action: &str,
    params: Value,
    reason: &str,
) -> Result<TaskReport> {
    let created = Utc::now();
    let draft = ApprovalDraft {
        task: claimed.name().to_string(),
        action: action.to_string(),
        params,
        reason: reason.to_string(),
        requested_by: rt.role,
        created,
        expires: rt.approval_expiry(created),
        follow_up_of: None,
        task_body: Some(claimed.task.doc.body.clone()),
    };
    draft.apply_to(&mut claimed.task.doc);
    claimed.save()?;
    let path = move_task(rt.paths, claimed.name(), claimed.stage(), rt.pending_stage())?;
    info!(task = %claimed.name(), action, "task awaits approval");
    Ok(TaskReport {
        name: claimed.task.name,
        outcome: TaskOutcome::AwaitingApproval {
            action: action.to_string(),
        },
        path,
    })
}

/// Move the non-markdown file named by `original_file` into `Done/` with its task.
///
/// Attachments are not task documents, so they follow their task without a
/// stage transition of their own.
pub fn release_attachment(paths: &VaultPaths, doc: &TaskDocument) -> Result<()> {
    let Some(original) = doc.get("original_file") else {
        return Ok(());
    };
    if original.ends_with(".md") || original.contains('/') || original.contains('\\') {
        return Ok(());
    }
    let homes = [
        paths.needs_action.as_path(),
        paths.in_progress_local.as_path(),
        paths.in_progress_cloud.as_path(),
    ];
    let Some(src) = homes
        .iter()
        .map(|dir| dir.join(original))
        .find(|path| path.is_file())
    else {
        return Ok(());
    };
    let dest = paths.done.join(unique_name(&paths.done, original));
    fs::rename(&src, &dest)
        .with_context(|| format!("move attachment {} -> {}", src.display(), dest.display()))?;
    debug!(attachment = original, "attachment archived");
    Ok(())
}

/// Fail a task that an error left in `In_Progress/<role>/` after its claim.
///
/// Returns `None` when the task is no longer held there.
fn fail_stranded<E: ReasoningEngine>(
    rt: &Runtime<'_, E>,
    name: &str,
    err: &anyhow::Error,
) -> Result<Option<TaskReport>> {
    let path = rt.paths.stage_path(Stage::InProgress(rt.role), name);
    if !path.is_file() {
        return Ok(None);
    }
    let claimed = Claimed {
        agent: rt.role,
        task: read_task(&path)?,
    };
    let failure = PlanFailure::new(
        "internal_error",
        format!("{err:#}"),
        &[
            "Check the audit log for the error entry.",
            "Move the task back to Needs_Action once the cause is fixed.",
        ],
    );
    write_error_plan(rt.paths, name, &failure)?;
    fail_task(rt, claimed, "internal_error").map(Some)
}

fn report_task_error<E: ReasoningEngine>(rt: &Runtime<'_, E>, name: &str, err: &anyhow::Error) {
    error!(task = name, err = %format!("{err:#}"), "task processing failed");
    rt.audit.record_or_warn(
        AuditActor::Orchestrator,
        AuditAction::ErrorOccurred,
        false,
        json!({"task": name, "role": rt.role.as_str()}),
        Some(&format!("{err:#}")),
    );
}
