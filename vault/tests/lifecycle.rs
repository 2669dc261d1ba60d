//! End-to-end lifecycle tests: a dropped file travels through every stage.

use std::fs;

use serde_json::json;
use vault::core::approval::{ApprovalStatus, parse_request};
use vault::core::stage::Stage;
use vault::core::types::AgentRole;
use vault::gate::{approve, run_gate_pass};
use vault::intake::promote_inbox;
use vault::io::audit::AuditAction;
use vault::io::claim::claim;
use vault::io::store::{list_markdown, read_task};
use vault::io::tools::ToolRegistry;
use vault::processor::process_pending;
use vault::test_support::{RecordingTool, ScriptedEngine, TestVault};

const INVOICE: &str = "---\npriority: high\naction: send_invoice\nparams: {\"client\": \"acme\", \"amount\": 1500}\n---\n\nSend the January invoice to ACME.\n";

/// Inbox -> Needs_Action -> Pending_Approval -> Approved -> Done.
#[test]
fn approved_task_round_trip() {
    let vault = TestVault::new();
    fs::write(vault.paths.inbox.join("invoice.md"), INVOICE).expect("write");
    let send = RecordingTool::new(true);
    let mut tools = ToolRegistry::new();
    tools.register("send_invoice", send.clone());
    let engine = ScriptedEngine::replying(&["1. Prepare the invoice\n2. Send it to ACME"]);
    let rt = vault.runtime(&engine, &tools);

    assert_eq!(promote_inbox(&vault.paths).expect("intake").tasks, 1);
    assert!(vault.paths.needs_action.join("invoice.md").is_file());

    let scan = process_pending(&rt).expect("process");
    assert_eq!(scan.awaiting_approval, 1);
    assert!(vault.paths.pending_approval.join("invoice.md").is_file());
    assert!(send.calls().is_empty(), "nothing executes before approval");

    approve(&vault.paths, "invoice.md").expect("approve");
    let pass = run_gate_pass(&rt).expect("gate");
    assert_eq!(pass.executed, 1);
    assert_eq!(send.calls(), vec![json!({"client": "acme", "amount": 1500})]);

    let done = read_task(&vault.paths.done.join("invoice.md")).expect("done");
    let request = parse_request("invoice.md", &done.doc).expect("request");
    assert_eq!(request.status, Some(ApprovalStatus::Executed));
    assert!(done.doc.body.contains("## Execution Result"));

    assert_eq!(
        list_markdown(&vault.paths.plans).expect("plans"),
        vec!["PLAN_invoice.md"]
    );
    for stage in [Stage::Inbox, Stage::NeedsAction, Stage::PendingApproval(AgentRole::Local), Stage::Approved] {
        assert!(list_markdown(vault.paths.stage_dir(stage)).expect("list").is_empty());
    }

    // One engine request plus one tool call.
    let entries = vault.audit_entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].action, AuditAction::EngineRequest);
    assert_eq!(entries[1].action, AuditAction::ToolCall);
    assert!(entries.iter().all(|e| e.success));
}

/// A request claimed by an executor that then died is never picked up again
/// by a later gate pass.
#[test]
fn restarted_gate_does_not_reexecute_claimed_request() {
    let vault = TestVault::new();
    fs::write(vault.paths.inbox.join("invoice.md"), INVOICE).expect("write");
    let send = RecordingTool::new(true);
    let mut tools = ToolRegistry::new();
    tools.register("send_invoice", send.clone());
    let engine = ScriptedEngine::replying(&["plan"]);
    let rt = vault.runtime(&engine, &tools);

    promote_inbox(&vault.paths).expect("intake");
    process_pending(&rt).expect("process");
    approve(&vault.paths, "invoice.md").expect("approve");

    // The crashed executor got as far as claiming.
    claim(&vault.paths, Stage::Approved, "invoice.md", AgentRole::Local)
        .expect("claim")
        .expect("won");

    let pass = run_gate_pass(&rt).expect("gate");
    assert_eq!(pass.executed, 0);
    assert!(send.calls().is_empty());
    assert!(vault.paths.in_progress_local.join("invoice.md").is_file());
}

#[test]
fn plain_task_goes_straight_to_done() {
    let vault = TestVault::new();
    fs::write(vault.paths.inbox.join("notes.md"), "Summarize the meeting notes.\n").expect("write");
    let tools = ToolRegistry::new();
    let engine = ScriptedEngine::replying(&["Summary: nothing urgent."]);
    let rt = vault.runtime(&engine, &tools);

    promote_inbox(&vault.paths).expect("intake");
    let scan = process_pending(&rt).expect("process");
    assert_eq!(scan.done, 1);

    let done = read_task(&vault.paths.done.join("notes.md")).expect("done");
    assert_eq!(done.doc.status(), Some("done"));
    let plan = fs::read_to_string(vault.paths.plans.join("PLAN_notes.md")).expect("plan");
    assert!(plan.contains("Summary: nothing urgent."));
    assert_eq!(vault.audit_entries().len(), 1);
}
