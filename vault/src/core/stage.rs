//! Lifecycle stages and the directed graph of allowed moves between them.
//!
//! A task's stage is the directory it lives in. Every move performed by the
//! orchestrator is checked against [`check_transition`] before the rename.

use std::fmt;

use anyhow::{Result, bail};

use super::types::AgentRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Inbox,
    NeedsAction,
    InProgress(AgentRole),
    /// Local requests live at the directory root, cloud drafts under `cloud/`.
    PendingApproval(AgentRole),
    Approved,
    Rejected,
    Done,
}

impl Stage {
    /// Path of the stage directory relative to the vault root.
    pub fn relative_dir(self) -> &'static str {
        match self {
            Stage::Inbox => "Inbox",
            Stage::NeedsAction => "Needs_Action",
            Stage::InProgress(AgentRole::Local) => "In_Progress/local",
            Stage::InProgress(AgentRole::Cloud) => "In_Progress/cloud",
            Stage::PendingApproval(AgentRole::Local) => "Pending_Approval",
            Stage::PendingApproval(AgentRole::Cloud) => "Pending_Approval/cloud",
            Stage::Approved => "Approved",
            Stage::Rejected => "Rejected",
            Stage::Done => "Done",
        }
    }

    /// Every stage directory, in lifecycle order.
    pub fn all() -> [Stage; 9] {
        [
            Stage::Inbox,
            Stage::NeedsAction,
            Stage::InProgress(AgentRole::Local),
            Stage::InProgress(AgentRole::Cloud),
            Stage::PendingApproval(AgentRole::Local),
            Stage::PendingApproval(AgentRole::Cloud),
            Stage::Approved,
            Stage::Rejected,
            Stage::Done,
        ]
    }

    /// Parse a stage from its directory name (case-insensitive, `/` or `_` separators).
    pub fn parse(name: &str) -> Option<Stage> {
        let normalized = name.trim().trim_end_matches('/').to_ascii_lowercase();
        Stage::all()
            .into_iter()
            .find(|stage| stage.relative_dir().to_ascii_lowercase() == normalized)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.relative_dir())
    }
}

/// Return an error unless `from -> to` is an edge of the lifecycle graph.
///
/// `In_Progress -> Needs_Action` and `In_Progress -> Pending_Approval` for an
/// approval request are only taken by the operator-triggered reclaim pass.
pub fn check_transition(from: Stage, to: Stage) -> Result<()> {
    let allowed = match (from, to) {
        (Stage::Inbox, Stage::NeedsAction) => true,
        (Stage::NeedsAction, Stage::InProgress(_)) => true,
        (Stage::InProgress(_), Stage::Done) => true,
        (Stage::InProgress(_), Stage::PendingApproval(_)) => true,
        (Stage::InProgress(_), Stage::NeedsAction) => true,
        (Stage::PendingApproval(_), Stage::Approved) => true,
        (Stage::PendingApproval(_), Stage::Rejected) => true,
        (Stage::Approved, Stage::InProgress(AgentRole::Local)) => true,
        (Stage::Rejected, Stage::Done) => true,
        _ => false,
    };
    if !allowed {
        bail!("illegal stage transition {from} -> {to}");
    }
    Ok(())
}
