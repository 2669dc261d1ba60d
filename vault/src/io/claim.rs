//! Claim-by-move: ownership of a file is taken with a single atomic rename.
//!
//! Two agents racing for the same file both attempt the rename; the
//! filesystem lets exactly one succeed and the loser sees the source vanish.
//! Nothing else (lock files, timestamps) participates in ownership.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{debug, instrument};

use super::layout::VaultPaths;
use super::store::{TaskFile, read_task, write_document};
use crate::core::stage::{Stage, check_transition};
use crate::core::types::{AgentRole, format_timestamp};

/// A file now owned by this agent in `In_Progress/<agent>/`.
#[derive(Debug, Clone)]
pub struct Claimed {
    pub agent: AgentRole,
    pub task: TaskFile,
}

impl Claimed {
    pub fn stage(&self) -> Stage {
        Stage::InProgress(self.agent)
    }

    pub fn name(&self) -> &str {
        &self.task.name
    }

    pub fn path(&self) -> &PathBuf {
        &self.task.path
    }

    /// Persist in-memory front matter/body changes while still owned.
    pub fn save(&self) -> Result<()> {
        write_document(&self.task.path, &self.task.doc)
    }
}

/// Try to claim `name` from `from` into `In_Progress/<agent>/`.
///
/// Returns `Ok(None)` when another agent won the race (the source is gone).
#[instrument(skip(paths), fields(%from, %agent))]
pub fn claim(
    paths: &VaultPaths,
    from: Stage,
    name: &str,
    agent: AgentRole,
) -> Result<Option<Claimed>> {
    let to = Stage::InProgress(agent);
    check_transition(from, to)?;

    let src = paths.stage_path(from, name);
    let dest = paths.stage_path(to, name);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    if dest.exists() && src.exists() {
        bail!(
            "cannot claim {name}: {} is already held (reclaim it first)",
            dest.display()
        );
    }

    match fs::rename(&src, &dest) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(task = name, "claim lost: file already taken");
            return Ok(None);
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("claim {} -> {}", src.display(), dest.display()));
        }
    }

    let mut task = read_task(&dest)?;
    task.doc.set("claimed_by", agent.as_str());
    task.doc.set("claimed_at", format_timestamp(Utc::now()));
    let claimed = Claimed { agent, task };
    claimed.save()?;
    debug!(task = name, "claimed");
    Ok(Some(claimed))
}
