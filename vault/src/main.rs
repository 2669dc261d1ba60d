//! `vault`: file-queue orchestrator CLI.
//!
//! Each long-running component (`intake`, `processor`, `approvals`) is its own
//! process polling the vault directories; the remaining subcommands are
//! operator tools.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;

use vault::core::approval::ApprovalDraft;
use vault::core::stage::Stage;
use vault::core::types::AgentRole;
use vault::daemon::{Component, DaemonOptions, ScanReport, run_component};
use vault::exit_codes;
use vault::gate::{Decision, approve, await_decision, draft_request, reject};
use vault::io::audit::{AuditLog, new_session_id, read_entries, summarize};
use vault::io::config::{VaultConfig, load_config};
use vault::io::engine::CliEngine;
use vault::io::layout::{InitOptions, VaultPaths, init_vault};
use vault::io::store::{list_markdown, read_task};
use vault::io::tools::ToolRegistry;
use vault::logging;
use vault::reconcile::reclaim_stranded;
use vault::runtime::Runtime;

#[derive(Parser)]
#[command(name = "vault", version, about = "File-queue task orchestrator")]
struct Cli {
    /// Vault root directory.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Act as this agent instead of the role in `vault.toml`.
    #[arg(long, global = true, value_enum)]
    role: Option<RoleArg>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the stage directories and a default `vault.toml`.
    Init {
        /// Overwrite an existing `vault.toml`.
        #[arg(short, long)]
        force: bool,
    },
    /// Promote inbox drops once.
    Intake,
    /// Process pending tasks once.
    Process,
    /// Run one approval-gate pass.
    Approvals,
    /// Poll one component until killed.
    Run {
        #[arg(value_enum)]
        component: ComponentArg,
        /// Run a single scan and exit.
        #[arg(long)]
        once: bool,
    },
    /// File an approval request for a task.
    RequestApproval {
        #[arg(long)]
        task: String,
        #[arg(long)]
        action: String,
        /// Action parameters as a JSON object.
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long, default_value = "requested by operator")]
        reason: String,
        /// Block until the request is decided or times out.
        #[arg(long)]
        wait: bool,
    },
    /// Move a pending request to `Approved/`.
    Approve { name: String },
    /// Move a pending request to `Rejected/`.
    Reject { name: String },
    /// Create the emergency stop sentinel.
    Stop,
    /// Remove the emergency stop sentinel.
    Resume,
    /// Print task counts per stage.
    Status,
    /// Return stranded claims to the queue.
    Reclaim {
        /// Only reclaim claims older than this.
        #[arg(long, default_value_t = 3600)]
        older_than_secs: u64,
    },
    /// Summarize one day of the audit log.
    Audit {
        /// Day to summarize (YYYY-MM-DD); defaults to today (UTC).
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Local,
    Cloud,
}

impl From<RoleArg> for AgentRole {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Local => AgentRole::Local,
            RoleArg::Cloud => AgentRole::Cloud,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ComponentArg {
    Intake,
    Processor,
    Approvals,
}

impl From<ComponentArg> for Component {
    fn from(value: ComponentArg) -> Self {
        match value {
            ComponentArg::Intake => Component::Intake,
            ComponentArg::Processor => Component::Processor,
            ComponentArg::Approvals => Component::Approvals,
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    if let Command::Init { force } = cli.command {
        let paths = init_vault(&cli.root, &InitOptions { force })?;
        println!("initialized vault at {}", paths.root.display());
        return Ok(exit_codes::OK);
    }

    let paths = VaultPaths::new(&cli.root);
    paths.ensure_initialized()?;
    let config = load_config(&paths.config_path)?;
    let role = cli.role.map(AgentRole::from).unwrap_or(config.role);

    match cli.command {
        Command::Init { .. } => Ok(exit_codes::OK),
        Command::Intake => run_scans(&paths, &config, role, Component::Intake, true),
        Command::Process => run_scans(&paths, &config, role, Component::Processor, true),
        Command::Approvals => run_scans(&paths, &config, role, Component::Approvals, true),
        Command::Run { component, once } => {
            run_scans(&paths, &config, role, component.into(), once)
        }
        Command::RequestApproval {
            task,
            action,
            params,
            reason,
            wait,
        } => cmd_request_approval(&paths, &config, role, &task, &action, &params, &reason, wait),
        Command::Approve { name } => {
            let dest = approve(&paths, &name)?;
            println!("{}", dest.display());
            Ok(exit_codes::OK)
        }
        Command::Reject { name } => {
            let dest = reject(&paths, &name)?;
            println!("{}", dest.display());
            Ok(exit_codes::OK)
        }
        Command::Stop => {
            let path = paths.emergency_stop_path(&config);
            fs::write(&path, format!("stopped at {}\n", Utc::now().to_rfc3339()))
                .with_context(|| format!("write {}", path.display()))?;
            println!("emergency stop set: {}", path.display());
            Ok(exit_codes::OK)
        }
        Command::Resume => {
            let path = paths.emergency_stop_path(&config);
            if path.exists() {
                fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
            }
            println!("emergency stop cleared");
            Ok(exit_codes::OK)
        }
        Command::Status => cmd_status(&paths, &config),
        Command::Reclaim { older_than_secs } => {
            let summary =
                reclaim_stranded(&paths, role, Duration::from_secs(older_than_secs), Utc::now())?;
            for name in &summary.requeued {
                println!("requeued {name}");
            }
            for name in &summary.returned_for_approval {
                println!("returned for approval {name} (verify before re-approving)");
            }
            println!("skipped {} recent claim(s)", summary.skipped);
            if summary.errors > 0 {
                println!("{} claim(s) could not be reclaimed (see log)", summary.errors);
            }
            Ok(exit_codes::OK)
        }
        Command::Audit { date } => cmd_audit(&paths, date),
    }
}

fn run_scans(
    paths: &VaultPaths,
    config: &VaultConfig,
    role: AgentRole,
    component: Component,
    once: bool,
) -> Result<i32> {
    let audit = AuditLog::new(&paths.logs, new_session_id(role.as_str()));
    let engine = CliEngine::from_config(&config.engine, &paths.root);
    let tools = ToolRegistry::from_config(paths, config)?;
    let rt = Runtime {
        paths,
        config,
        engine: &engine,
        tools: &tools,
        audit: &audit,
        role,
    };
    let options = DaemonOptions {
        once,
        max_scans: None,
    };
    let mut failed = false;
    run_component(&rt, component, options, |report| {
        failed = matches!(report, ScanReport::Failed(_));
        if once {
            print_report(report);
        }
    })?;
    Ok(if failed { exit_codes::INVALID } else { exit_codes::OK })
}

fn print_report(report: &ScanReport) {
    match report {
        ScanReport::Intake(s) => println!(
            "promoted {} task(s) and {} file(s), {} error(s)",
            s.tasks, s.files, s.errors
        ),
        ScanReport::Processor(s) => println!(
            "done {}, failed {}, awaiting approval {}, lost {}, errors {}",
            s.done, s.failed, s.awaiting_approval, s.lost, s.errors
        ),
        ScanReport::Approvals(s) => println!(
            "executed {}, failed {}, follow-ups {}, rejected {}, expired {}, lost {}, errors {}",
            s.executed, s.failed, s.follow_ups, s.rejected, s.expired, s.lost, s.errors
        ),
        ScanReport::Failed(message) => eprintln!("scan failed: {message}"),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_request_approval(
    paths: &VaultPaths,
    config: &VaultConfig,
    role: AgentRole,
    task: &str,
    action: &str,
    params: &str,
    reason: &str,
    wait: bool,
) -> Result<i32> {
    let params: Value = serde_json::from_str(params).context("parse --params as JSON")?;
    if !params.is_object() {
        bail!("--params must be a JSON object");
    }
    let created = Utc::now();
    let timeout = config.approval_timeout();
    let draft = ApprovalDraft {
        task: task.to_string(),
        action: action.to_string(),
        params,
        reason: reason.to_string(),
        requested_by: role,
        created,
        expires: created + chrono::Duration::from_std(timeout).context("approval timeout")?,
        follow_up_of: None,
        task_body: task_body(paths, task),
    };
    let path = draft_request(paths, &draft)?;
    println!("{}", path.display());
    if !wait {
        return Ok(exit_codes::OK);
    }

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("request file name")?;
    let poll = Duration::from_secs(config.approval.poll_interval_secs);
    Ok(match await_decision(paths, name, timeout, poll)? {
        Decision::Approved => {
            println!("approved");
            exit_codes::OK
        }
        Decision::Rejected => {
            println!("rejected");
            exit_codes::REJECTED
        }
        Decision::TimedOut => {
            println!("timed out; request cancelled");
            exit_codes::TIMED_OUT
        }
    })
}

/// Body of the named task if it is still queued, quoted into the request.
fn task_body(paths: &VaultPaths, task: &str) -> Option<String> {
    [Stage::NeedsAction, Stage::InProgress(AgentRole::Local)]
        .into_iter()
        .map(|stage| paths.stage_path(stage, task))
        .find(|path| path.is_file())
        .and_then(|path| read_task(&path).ok())
        .map(|task| task.doc.body)
}

fn cmd_status(paths: &VaultPaths, config: &VaultConfig) -> Result<i32> {
    for stage in Stage::all() {
        let count = list_markdown(paths.stage_dir(stage))?.len();
        println!("{:<24} {count}", stage.relative_dir());
    }
    let stop = paths.emergency_stop_path(config);
    println!(
        "emergency stop: {}",
        if stop.exists() { "SET" } else { "clear" }
    );
    Ok(exit_codes::OK)
}

fn cmd_audit(paths: &VaultPaths, date: Option<NaiveDate>) -> Result<i32> {
    let date = date.unwrap_or_else(|| Utc::now().date_naive());
    let path = audit_path(&paths.logs, date);
    let entries = read_entries(&path)?;
    let summary = summarize(&entries);
    println!(
        "{date}: {} entries, {} failed, {} session(s)",
        summary.total, summary.failed, summary.sessions
    );
    for ((actor, action), tally) in &summary.by_kind {
        println!(
            "  {actor:<12} {action:<24} ok {:>4}  failed {:>4}",
            tally.succeeded, tally.failed
        );
    }
    Ok(exit_codes::OK)
}

fn audit_path(logs: &Path, date: NaiveDate) -> PathBuf {
    AuditLog::new(logs, String::new()).path_for(date)
}
