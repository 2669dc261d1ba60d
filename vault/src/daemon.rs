//! Poll loops for the long-running components (`vault run <component>`).

use std::fmt;
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use serde_json::json;
use tracing::{error, info};

use crate::core::types::AgentRole;
use crate::gate::{GateSummary, run_gate_pass};
use crate::intake::{IntakeSummary, promote_inbox};
use crate::io::audit::{AuditAction, AuditActor};
use crate::io::engine::ReasoningEngine;
use crate::processor::{ScanSummary, process_pending};
use crate::runtime::Runtime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Intake,
    Processor,
    Approvals,
}

impl Component {
    pub fn as_str(self) -> &'static str {
        match self {
            Component::Intake => "intake",
            Component::Processor => "processor",
            Component::Approvals => "approvals",
        }
    }

    fn actor(self) -> AuditActor {
        match self {
            Component::Intake => AuditActor::Watcher,
            Component::Processor => AuditActor::Orchestrator,
            Component::Approvals => AuditActor::Approval,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one scan did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanReport {
    Intake(IntakeSummary),
    Processor(ScanSummary),
    Approvals(GateSummary),
    /// The scan failed as a whole; the loop keeps going.
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DaemonOptions {
    /// Run a single scan and return (cron style).
    pub once: bool,
    /// Stop after this many scans.
    pub max_scans: Option<u64>,
}

/// Run one component's scan.
pub fn scan_once<E: ReasoningEngine>(rt: &Runtime<'_, E>, component: Component) -> Result<ScanReport> {
    Ok(match component {
        Component::Intake => ScanReport::Intake(promote_inbox(rt.paths)?),
        Component::Processor => ScanReport::Processor(process_pending(rt)?),
        Component::Approvals => ScanReport::Approvals(run_gate_pass(rt)?),
    })
}

/// Scan, sleep, repeat. Scan errors are logged and audited, never fatal.
///
/// Returns the number of scans run.
pub fn run_component<E, F>(
    rt: &Runtime<'_, E>,
    component: Component,
    options: DaemonOptions,
    mut on_scan: F,
) -> Result<u64>
where
    E: ReasoningEngine,
    F: FnMut(&ScanReport),
{
    if component == Component::Approvals && rt.role == AgentRole::Cloud {
        bail!("the approvals component only runs as the local agent");
    }
    let interval = poll_interval(rt, component);
    let limit = if options.once { Some(1) } else { options.max_scans };
    info!(%component, role = %rt.role, interval_secs = interval.as_secs(), "component started");

    let mut scans = 0u64;
    loop {
        let report = match scan_once(rt, component) {
            Ok(report) => report,
            Err(err) => {
                let message = format!("{err:#}");
                error!(%component, err = %message, "scan failed");
                rt.audit.record_or_warn(
                    component.actor(),
                    AuditAction::ErrorOccurred,
                    false,
                    json!({"component": component.as_str(), "role": rt.role.as_str()}),
                    Some(&message),
                );
                ScanReport::Failed(message)
            }
        };
        on_scan(&report);
        scans += 1;
        if limit.is_some_and(|limit| scans >= limit) {
            return Ok(scans);
        }
        thread::sleep(interval);
    }
}

fn poll_interval<E: ReasoningEngine>(rt: &Runtime<'_, E>, component: Component) -> Duration {
    match component {
        Component::Approvals => Duration::from_secs(rt.config.approval.poll_interval_secs),
        Component::Intake | Component::Processor => rt.config.poll_interval(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::tools::ToolRegistry;
    use crate::test_support::{ScriptedEngine, TestVault, write_task};

    #[test]
    fn once_runs_a_single_scan() {
        let vault = TestVault::new();
        write_task(&vault.paths.inbox, "a.md", &[], "hello");
        let engine = ScriptedEngine::new(Vec::new());
        let tools = ToolRegistry::new();
        let rt = vault.runtime(&engine, &tools);

        let mut reports = Vec::new();
        let scans = run_component(
            &rt,
            Component::Intake,
            DaemonOptions { once: true, max_scans: None },
            |r| reports.push(r.clone()),
        )
        .expect("run");
        assert_eq!(scans, 1);
        assert!(matches!(&reports[0], ScanReport::Intake(s) if s.tasks == 1));
    }

    /// A failing scan is audited and the loop carries on.
    #[test]
    fn scan_errors_do_not_stop_the_loop() {
        let mut vault = TestVault::new();
        vault.config.poll_interval_secs = 1;
        std::fs::remove_dir_all(&vault.paths.needs_action).expect("remove");
        std::fs::write(&vault.paths.needs_action, "not a dir").expect("write");
        let engine = ScriptedEngine::new(Vec::new());
        let tools = ToolRegistry::new();
        let rt = vault.runtime(&engine, &tools);

        let mut failures = 0;
        let scans = run_component(
            &rt,
            Component::Processor,
            DaemonOptions { once: false, max_scans: Some(2) },
            |r| {
                if matches!(r, ScanReport::Failed(_)) {
                    failures += 1;
                }
            },
        )
        .expect("run");
        assert_eq!(scans, 2);
        assert_eq!(failures, 2);
        let entries = vault.audit_entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.action == AuditAction::ErrorOccurred));
    }

    #[test]
    fn cloud_role_cannot_run_approvals() {
        let vault = TestVault::new();
        let engine = ScriptedEngine::new(Vec::new());
        let tools = ToolRegistry::new();
        let mut rt = vault.runtime(&engine, &tools);
        rt.role = AgentRole::Cloud;
        assert!(run_component(&rt, Component::Approvals, DaemonOptions::default(), |_| {}).is_err());
    }
}
