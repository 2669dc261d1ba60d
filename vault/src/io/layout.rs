//! Directory layout of a vault and `vault init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{VaultConfig, write_config};
use crate::core::stage::Stage;
use crate::core::types::AgentRole;

/// All canonical paths within a vault root.
#[derive(Debug, Clone)]
pub struct VaultPaths {
    pub root: PathBuf,
    pub inbox: PathBuf,
    pub needs_action: PathBuf,
    pub in_progress_local: PathBuf,
    pub in_progress_cloud: PathBuf,
    pub pending_approval: PathBuf,
    pub pending_approval_cloud: PathBuf,
    pub approved: PathBuf,
    pub rejected: PathBuf,
    pub done: PathBuf,
    pub plans: PathBuf,
    pub ralph_logs: PathBuf,
    pub logs: PathBuf,
    pub config_path: PathBuf,
}

impl VaultPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            inbox: root.join(Stage::Inbox.relative_dir()),
            needs_action: root.join(Stage::NeedsAction.relative_dir()),
            in_progress_local: root.join(Stage::InProgress(AgentRole::Local).relative_dir()),
            in_progress_cloud: root.join(Stage::InProgress(AgentRole::Cloud).relative_dir()),
            pending_approval: root.join(Stage::PendingApproval(AgentRole::Local).relative_dir()),
            pending_approval_cloud: root
                .join(Stage::PendingApproval(AgentRole::Cloud).relative_dir()),
            approved: root.join(Stage::Approved.relative_dir()),
            rejected: root.join(Stage::Rejected.relative_dir()),
            done: root.join(Stage::Done.relative_dir()),
            plans: root.join("Plans"),
            ralph_logs: root.join("Ralph_Logs"),
            logs: root.join("Logs"),
            config_path: root.join("vault.toml"),
            root,
        }
    }

    pub fn stage_dir(&self, stage: Stage) -> &Path {
        match stage {
            Stage::Inbox => &self.inbox,
            Stage::NeedsAction => &self.needs_action,
            Stage::InProgress(AgentRole::Local) => &self.in_progress_local,
            Stage::InProgress(AgentRole::Cloud) => &self.in_progress_cloud,
            Stage::PendingApproval(AgentRole::Local) => &self.pending_approval,
            Stage::PendingApproval(AgentRole::Cloud) => &self.pending_approval_cloud,
            Stage::Approved => &self.approved,
            Stage::Rejected => &self.rejected,
            Stage::Done => &self.done,
        }
    }

    pub fn stage_path(&self, stage: Stage, name: &str) -> PathBuf {
        self.stage_dir(stage).join(name)
    }

    /// Location of the emergency stop sentinel named in the config.
    pub fn emergency_stop_path(&self, config: &VaultConfig) -> PathBuf {
        self.root.join(&config.ralph.emergency_stop_file)
    }

    /// Fail unless every stage directory exists.
    pub fn ensure_initialized(&self) -> Result<()> {
        for stage in Stage::all() {
            let dir = self.stage_dir(stage);
            if !dir.is_dir() {
                return Err(anyhow!(
                    "vault not initialized: missing {} (run `vault init`)",
                    dir.display()
                ));
            }
        }
        Ok(())
    }
}

/// Options for `init_vault`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing `vault.toml` with defaults.
    pub force: bool,
}

/// Create the vault directory tree in `root`.
///
/// Directories are created idempotently. An existing `vault.toml` is kept
/// unless `options.force` is set.
pub fn init_vault(root: &Path, options: &InitOptions) -> Result<VaultPaths> {
    let paths = VaultPaths::new(root);
    if paths.root.exists() && !paths.root.is_dir() {
        return Err(anyhow!(
            "vault init: {} exists but is not a directory",
            paths.root.display()
        ));
    }

    for stage in Stage::all() {
        create_dir(paths.stage_dir(stage))?;
    }
    create_dir(&paths.plans)?;
    create_dir(&paths.ralph_logs)?;
    create_dir(&paths.logs)?;

    if options.force || !paths.config_path.exists() {
        write_config(&paths.config_path, &VaultConfig::default())?;
    }

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}
