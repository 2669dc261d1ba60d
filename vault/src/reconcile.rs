//! Operator-triggered recovery of claims stranded by a crashed agent.
//!
//! Never runs on its own: a live agent holding a slow task looks exactly like
//! a dead one, so the operator decides when to reclaim.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::core::approval::{ApprovalStatus, is_approval_request};
use crate::core::stage::Stage;
use crate::core::types::{AgentRole, format_timestamp, parse_timestamp};
use crate::io::layout::VaultPaths;
use crate::io::store::{TaskFile, list_markdown, move_task, read_task, write_document};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimSummary {
    /// Plain tasks moved back to `Needs_Action/`.
    pub requeued: Vec<String>,
    /// Interrupted approval requests returned to the pending directory.
    pub returned_for_approval: Vec<String>,
    /// Claims younger than the threshold.
    pub skipped: usize,
    /// Files that could not be read or moved; they stay where they are.
    pub errors: usize,
}

enum Reclaimed {
    Requeued,
    ReturnedForApproval,
    Fresh,
}

/// Move claims in `In_Progress/<role>/` older than `older_than` back out.
///
/// Approval requests go back to the pending directory with a warning, since
/// the action may already have run; a human must re-approve them.
#[instrument(skip(paths))]
pub fn reclaim_stranded(
    paths: &VaultPaths,
    role: AgentRole,
    older_than: Duration,
    now: DateTime<Utc>,
) -> Result<ReclaimSummary> {
    let stage = Stage::InProgress(role);
    let threshold = chrono::Duration::from_std(older_than).context("reclaim threshold")?;
    let mut summary = ReclaimSummary::default();

    for name in list_markdown(paths.stage_dir(stage))? {
        match reclaim_one(paths, role, &name, threshold, now) {
            Ok(Reclaimed::Requeued) => summary.requeued.push(name),
            Ok(Reclaimed::ReturnedForApproval) => summary.returned_for_approval.push(name),
            Ok(Reclaimed::Fresh) => summary.skipped += 1,
            Err(err) => {
                warn!(task = %name, err = %format!("{err:#}"), "claim not reclaimed");
                summary.errors += 1;
            }
        }
    }
    Ok(summary)
}

fn reclaim_one(
    paths: &VaultPaths,
    role: AgentRole,
    name: &str,
    threshold: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<Reclaimed> {
    let stage = Stage::InProgress(role);
    let mut task = read_task(&paths.stage_path(stage, name))?;
    if now - claimed_at(&task)? < threshold {
        return Ok(Reclaimed::Fresh);
    }
    task.doc.remove("claimed_by");
    task.doc.remove("claimed_at");
    task.doc.set("reclaimed_at", format_timestamp(now));

    if is_approval_request(&task.doc) {
        let was = task.doc.status().unwrap_or("unknown").to_string();
        task.doc.set("status", ApprovalStatus::Pending.as_str());
        task.doc.append_section(
            "Reclaim Warning",
            &format!(
                "Execution was interrupted (status was `{was}`). The action may already have \
                 run. Verify in the target system before approving again."
            ),
        );
        write_document(&task.path, &task.doc)?;
        move_task(paths, name, stage, Stage::PendingApproval(role))?;
        warn!(request = %name, "interrupted approval request returned for review");
        Ok(Reclaimed::ReturnedForApproval)
    } else {
        task.doc.set("status", "reclaimed");
        write_document(&task.path, &task.doc)?;
        move_task(paths, name, stage, Stage::NeedsAction)?;
        info!(task = %name, "stranded task requeued");
        Ok(Reclaimed::Requeued)
    }
}

/// The `claimed_at` stamp, or the file's mtime when the stamp never got written.
fn claimed_at(task: &TaskFile) -> Result<DateTime<Utc>> {
    if let Some(at) = task.doc.get("claimed_at").and_then(parse_timestamp) {
        return Ok(at);
    }
    modified_at(&task.path)
}

fn modified_at(path: &Path) -> Result<DateTime<Utc>> {
    let modified = fs::metadata(path)
        .and_then(|m| m.modified())
        .with_context(|| format!("stat {}", path.display()))?;
    Ok(DateTime::<Utc>::from(modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::approval::ApprovalDraft;
    use crate::io::layout::{InitOptions, init_vault};
    use crate::test_support::write_task;
    use serde_json::json;

    #[test]
    fn old_claims_are_requeued_and_fresh_ones_kept() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_vault(temp.path(), &InitOptions { force: false }).expect("init");
        let now = Utc::now();
        let old = format_timestamp(now - chrono::Duration::hours(3));
        let fresh = format_timestamp(now - chrono::Duration::minutes(5));
        write_task(&paths.in_progress_local, "old.md", &[("claimed_at", old.as_str())], "old");
        write_task(&paths.in_progress_local, "fresh.md", &[("claimed_at", fresh.as_str())], "fresh");

        let summary =
            reclaim_stranded(&paths, AgentRole::Local, Duration::from_secs(3600), now).expect("reclaim");
        assert_eq!(summary.requeued, vec!["old.md"]);
        assert_eq!(summary.skipped, 1);

        let task = read_task(&paths.needs_action.join("old.md")).expect("read");
        assert_eq!(task.doc.status(), Some("reclaimed"));
        assert_eq!(task.doc.get("claimed_by"), None);
        assert!(paths.in_progress_local.join("fresh.md").exists());
    }

    /// An interrupted execution is never retried blindly.
    #[test]
    fn executing_requests_go_back_to_pending_with_warning() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_vault(temp.path(), &InitOptions { force: false }).expect("init");
        let now = Utc::now();
        let mut doc = ApprovalDraft {
            task: "pay.md".to_string(),
            action: "send_payment".to_string(),
            params: json!({"amount": 5}),
            reason: "supplier".to_string(),
            requested_by: AgentRole::Local,
            created: now,
            expires: now + chrono::Duration::hours(1),
            follow_up_of: None,
            task_body: None,
        }
        .to_document();
        doc.set("status", "executing");
        doc.set("claimed_at", format_timestamp(now - chrono::Duration::hours(2)));
        write_document(&paths.in_progress_local.join("APPROVAL_pay.md"), &doc).expect("write");

        let summary =
            reclaim_stranded(&paths, AgentRole::Local, Duration::from_secs(600), now).expect("reclaim");
        assert_eq!(summary.returned_for_approval, vec!["APPROVAL_pay.md"]);
        let request = read_task(&paths.pending_approval.join("APPROVAL_pay.md")).expect("read");
        assert_eq!(request.doc.status(), Some("pending"));
        assert!(request.doc.body.contains("## Reclaim Warning"));
        assert!(request.doc.body.contains("`executing`"));
    }

    /// One unreadable claim does not block the rest of the pass.
    #[test]
    fn unreadable_claim_is_skipped_and_counted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_vault(temp.path(), &InitOptions { force: false }).expect("init");
        let now = Utc::now();
        let old = format_timestamp(now - chrono::Duration::hours(3));
        fs::write(paths.in_progress_local.join("broken.md"), [0xff, 0xfe, 0x00, 0x80]).expect("write");
        write_task(&paths.in_progress_local, "old.md", &[("claimed_at", old.as_str())], "old");

        let summary =
            reclaim_stranded(&paths, AgentRole::Local, Duration::from_secs(3600), now).expect("reclaim");
        assert_eq!(summary.requeued, vec!["old.md"]);
        assert_eq!(summary.errors, 1);
        assert!(paths.in_progress_local.join("broken.md").is_file());
    }
}
