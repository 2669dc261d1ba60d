//! Human approval gate: drafting, simulated decisions, expiry and execution.
//!
//! A request only ever executes after a human moved it into `Approved/`.
//! The executor claims it into `In_Progress/local/` before running the
//! action, so a restart can never pick the same document up twice.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use chrono::Utc;
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::core::approval::{ApprovalDraft, ApprovalStatus, is_approval_request, parse_request};
use crate::core::external::ExternalError;
use crate::core::stage::Stage;
use crate::core::types::{AgentRole, format_timestamp};
use crate::io::audit::{AuditAction, AuditActor};
use crate::io::claim::{Claimed, claim};
use crate::io::engine::ReasoningEngine;
use crate::io::layout::VaultPaths;
use crate::io::retry::with_fallback;
use crate::io::store::{
    create_document, list_markdown, move_task, read_task, stem, unique_name, write_document,
};
use crate::io::tools::slug;
use crate::processor::release_attachment;
use crate::runtime::Runtime;

const PENDING_STAGES: [Stage; 2] = [
    Stage::PendingApproval(AgentRole::Local),
    Stage::PendingApproval(AgentRole::Cloud),
];

/// Write a new pending request; returns its path.
pub fn draft_request(paths: &VaultPaths, draft: &ApprovalDraft) -> Result<PathBuf> {
    let dir = paths.stage_dir(Stage::PendingApproval(draft.requested_by));
    let name = unique_name(
        dir,
        &format!("APPROVAL_{}_{}.md", slug(&draft.action), slug(stem(&draft.task))),
    );
    let path = dir.join(&name);
    create_document(&path, &draft.to_document())?;
    info!(request = %name, action = %draft.action, "approval requested");
    Ok(path)
}

/// Which pending directory holds `name`, if any.
fn find_pending(paths: &VaultPaths, name: &str) -> Option<Stage> {
    PENDING_STAGES
        .into_iter()
        .find(|stage| paths.stage_path(*stage, name).is_file())
}

/// Simulated approver: move a pending request to `Approved/`.
pub fn approve(paths: &VaultPaths, name: &str) -> Result<PathBuf> {
    decide(paths, name, Stage::Approved)
}

/// Simulated approver: move a pending request to `Rejected/`.
pub fn reject(paths: &VaultPaths, name: &str) -> Result<PathBuf> {
    decide(paths, name, Stage::Rejected)
}

fn decide(paths: &VaultPaths, name: &str, to: Stage) -> Result<PathBuf> {
    let Some(from) = find_pending(paths, name) else {
        bail!("no pending approval request named {name}");
    };
    let request = read_task(&paths.stage_path(from, name))?;
    if !is_approval_request(&request.doc) {
        bail!("{name} is not an approval request");
    }
    move_task(paths, name, from, to)
}

/// Outcome of waiting on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Rejected,
    TimedOut,
}

/// Sleep-poll until `name` shows up in `Approved/` or `Rejected/`.
///
/// On timeout a still-pending request is moved to `Rejected/` with status
/// `timeout`, so it is cancelled rather than left to be approved later.
#[instrument(skip(paths))]
pub fn await_decision(
    paths: &VaultPaths,
    name: &str,
    timeout: Duration,
    poll: Duration,
) -> Result<Decision> {
    let deadline = Instant::now() + timeout;
    loop {
        if paths.stage_path(Stage::Approved, name).exists() {
            return Ok(Decision::Approved);
        }
        if paths.stage_path(Stage::Rejected, name).exists() {
            return Ok(Decision::Rejected);
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(poll.min(deadline - now).max(Duration::from_millis(1)));
    }

    match find_pending(paths, name) {
        Some(from) => {
            cancel_as_timeout(paths, name, from)?;
            warn!(request = name, "approval timed out");
            Ok(Decision::TimedOut)
        }
        // Decided between the last poll and the deadline.
        None if paths.stage_path(Stage::Approved, name).exists() => Ok(Decision::Approved),
        None if paths.stage_path(Stage::Rejected, name).exists() => Ok(Decision::Rejected),
        None => bail!("approval request {name} disappeared while waiting"),
    }
}

/// Move a pending request into `Rejected/` and mark it `timeout`.
fn cancel_as_timeout(paths: &VaultPaths, name: &str, from: Stage) -> Result<()> {
    let dest = move_task(paths, name, from, Stage::Rejected)?;
    let mut request = read_task(&dest)?;
    request.doc.set("status", ApprovalStatus::Timeout.as_str());
    request
        .doc
        .set("timed_out_at", format_timestamp(Utc::now()));
    write_document(&dest, &request.doc)
}

/// Counters for one gate pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateSummary {
    pub expired: usize,
    pub executed: usize,
    pub failed: usize,
    pub follow_ups: usize,
    pub rejected: usize,
    /// Approved requests another executor claimed first.
    pub lost: usize,
    pub errors: usize,
}

/// One pass of the approval executor: expire, execute approved, finalize rejected.
#[instrument(skip_all)]
pub fn run_gate_pass<E: ReasoningEngine>(rt: &Runtime<'_, E>) -> Result<GateSummary> {
    if rt.role == AgentRole::Cloud {
        bail!("the approval executor only runs as the local agent (cloud drafts only)");
    }
    let mut summary = GateSummary::default();
    expire_pending(rt, &mut summary)?;

    for name in list_markdown(&rt.paths.approved)? {
        let claimed = match claim(rt.paths, Stage::Approved, &name, AgentRole::Local) {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                summary.lost += 1;
                continue;
            }
            Err(err) => {
                report_error(rt, &name, &err);
                summary.errors += 1;
                continue;
            }
        };
        match execute_approved(rt, claimed) {
            Ok(Execution::Executed) => summary.executed += 1,
            Ok(Execution::Failed) => summary.failed += 1,
            Ok(Execution::FollowUp) => {
                summary.failed += 1;
                summary.follow_ups += 1;
            }
            Err(err) => {
                report_error(rt, &name, &err);
                summary.errors += 1;
            }
        }
    }

    for name in list_markdown(&rt.paths.rejected)? {
        match finalize_rejected(rt, &name) {
            Ok(()) => summary.rejected += 1,
            Err(err) => {
                report_error(rt, &name, &err);
                summary.errors += 1;
            }
        }
    }
    Ok(summary)
}

fn expire_pending<E: ReasoningEngine>(rt: &Runtime<'_, E>, summary: &mut GateSummary) -> Result<()> {
    let now = Utc::now();
    for stage in PENDING_STAGES {
        for name in list_markdown(rt.paths.stage_dir(stage))? {
            let Ok(task) = read_task(&rt.paths.stage_path(stage, &name)) else {
                continue;
            };
            if !is_approval_request(&task.doc) {
                continue;
            }
            let expired = match parse_request(&name, &task.doc) {
                Ok(request) => request.is_expired(now),
                Err(err) => {
                    warn!(request = %name, err = %format!("{err:#}"), "unreadable approval request");
                    false
                }
            };
            if !expired {
                continue;
            }
            match cancel_as_timeout(rt.paths, &name, stage) {
                Ok(()) => {
                    summary.expired += 1;
                    info!(request = %name, "expired approval request");
                }
                Err(err) => {
                    report_error(rt, &name, &err);
                    summary.errors += 1;
                }
            }
        }
    }
    Ok(())
}

enum Execution {
    Executed,
    Failed,
    FollowUp,
}

/// Run the approved action of a claimed request exactly once and archive it.
#[instrument(skip_all, fields(request = %claimed.name()))]
fn execute_approved<E: ReasoningEngine>(
    rt: &Runtime<'_, E>,
    mut claimed: Claimed,
) -> Result<Execution> {
    let name = claimed.name().to_string();
    let request = match parse_request(&name, &claimed.task.doc) {
        Ok(request) => request,
        Err(err) => {
            claimed.task.doc.set("status", ApprovalStatus::Failed.as_str());
            claimed.task.doc.append_section(
                "Execution Result",
                &format!("Status: failed\n\nThe request could not be read: {err:#}"),
            );
            archive(rt, &claimed)?;
            return Ok(Execution::Failed);
        }
    };

    claimed.task.doc.set("status", ApprovalStatus::Executing.as_str());
    claimed.save()?;

    let outcome = with_fallback(
        || {
            rt.tools
                .dispatch(&request.action, &request.params, &request.task, &rt.config.retry, rt.audit)
                .map(ActionResult::Done)
        },
        |err: ExternalError| {
            if !err.is_unavailable() {
                return Ok(ActionResult::Failed(err));
            }
            let follow_up = ApprovalDraft {
                task: request.task.clone(),
                action: request.action.clone(),
                params: request.params.clone(),
                reason: format!(
                    "Automatic execution of {name} failed because the service was unavailable ({err}). \
                     Handle it manually, or approve this request again once the service is back."
                ),
                requested_by: AgentRole::Local,
                created: Utc::now(),
                expires: rt.approval_expiry(Utc::now()),
                follow_up_of: Some(name.clone()),
                task_body: None,
            };
            let path = draft_request(rt.paths, &follow_up)?;
            Ok(ActionResult::FollowUp(err, path))
        },
    )?;

    let executed_at = format_timestamp(Utc::now());
    claimed.task.doc.set("executed_at", &executed_at);
    let execution = match outcome {
        ActionResult::Done(value) => {
            claimed.task.doc.set("status", ApprovalStatus::Executed.as_str());
            claimed.task.doc.append_section(
                "Execution Result",
                &format!("Status: executed at {executed_at}\n\n```json\n{}\n```", pretty(&value)),
            );
            info!(action = %request.action, "approved action executed");
            Execution::Executed
        }
        ActionResult::Failed(err) => {
            mark_failed(&mut claimed, &err, &executed_at, None);
            Execution::Failed
        }
        ActionResult::FollowUp(err, path) => {
            let follow_up = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string);
            mark_failed(&mut claimed, &err, &executed_at, follow_up.as_deref());
            Execution::FollowUp
        }
    };
    archive(rt, &claimed)?;
    Ok(execution)
}

enum ActionResult {
    Done(Value),
    Failed(ExternalError),
    FollowUp(ExternalError, PathBuf),
}

fn mark_failed(claimed: &mut Claimed, err: &ExternalError, at: &str, follow_up: Option<&str>) {
    claimed.task.doc.set("status", ApprovalStatus::Failed.as_str());
    claimed.task.doc.set("error_kind", err.kind());
    let mut content = format!("Status: failed at {at}\n\nError ({}): {err}", err.kind());
    if let Some(follow_up) = follow_up {
        content.push_str(&format!(
            "\n\nA follow-up request was filed for manual handling: `{follow_up}`"
        ));
    }
    claimed.task.doc.append_section("Execution Result", &content);
}

fn archive<E: ReasoningEngine>(rt: &Runtime<'_, E>, claimed: &Claimed) -> Result<()> {
    claimed.save()?;
    release_attachment(rt.paths, &claimed.task.doc)?;
    move_task(rt.paths, claimed.name(), claimed.stage(), Stage::Done)?;
    Ok(())
}

/// Record the outcome of a rejected (or expired) request and archive it.
fn finalize_rejected<E: ReasoningEngine>(rt: &Runtime<'_, E>, name: &str) -> Result<()> {
    let path = rt.paths.stage_path(Stage::Rejected, name);
    let mut task = read_task(&path)?;
    let timed_out = task.doc.status() == Some(ApprovalStatus::Timeout.as_str());
    let outcome = if timed_out {
        "Expired without a decision. No action was taken."
    } else {
        task.doc.set("status", ApprovalStatus::Rejected.as_str());
        "Rejected by the reviewer. No action was taken."
    };
    task.doc.set("finalized_at", format_timestamp(Utc::now()));
    task.doc.append_section("Outcome", outcome);
    write_document(&path, &task.doc)?;
    release_attachment(rt.paths, &task.doc)?;
    move_task(rt.paths, name, Stage::Rejected, Stage::Done)?;
    info!(request = name, timed_out, "finalized rejected request");
    Ok(())
}

fn report_error<E: ReasoningEngine>(rt: &Runtime<'_, E>, name: &str, err: &anyhow::Error) {
    error!(request = name, err = %format!("{err:#}"), "approval gate error");
    rt.audit.record_or_warn(
        AuditActor::Approval,
        AuditAction::ErrorOccurred,
        false,
        serde_json::json!({"request": name}),
        Some(&format!("{err:#}")),
    );
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
