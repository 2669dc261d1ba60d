//! Ralph mode: a bounded reason-act loop for one claimed task.
//!
//! Each iteration sees the task, the previous iteration's tool results and a
//! few related files; nothing older. The loop stops on a terminal signal
//! from the engine, on the emergency stop sentinel, or when the iteration or
//! wall-clock cap is reached. The task keeps its stage until the loop ends.

use std::fmt;
use std::thread;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::core::approval::ApprovalDraft;
use crate::core::budget::{BudgetExhausted, LoopBudget, LoopLimits, remaining_budget};
use crate::core::external::ExternalError;
use crate::core::response::{ParseMode, parse_engine_response};
use crate::core::types::{NextAction, ToolCall};
use crate::gate::draft_request;
use crate::io::claim::Claimed;
use crate::io::context::{related_files, truncate_chars};
use crate::io::engine::ReasoningEngine;
use crate::io::plan::{PlanFailure, write_error_plan, write_plan};
use crate::io::prompt::{PreviousIteration, PreviousResult, RalphInputs};
use crate::io::ralph_log::{IterationRecord, ToolResult, last_step, write_iteration};
use crate::processor::{HUMAN_REVIEW, TaskReport, complete_task, escalate, fail_task, task_context};
use crate::runtime::Runtime;

/// Longest tool output carried into a record or the next prompt.
const TOOL_OUTPUT_CHARS: usize = 2_000;

/// Why a Ralph loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RalphStop {
    Done,
    Failed,
    NeedsHuman { reason: String },
    Halted,
    IterationCap { max_iterations: u32 },
    TimeCap,
    EngineError { kind: &'static str, message: String },
}

impl RalphStop {
    pub fn label(&self) -> &'static str {
        match self {
            RalphStop::Done => "done",
            RalphStop::Failed => "agent_failed",
            RalphStop::NeedsHuman { .. } => "needs_human",
            RalphStop::Halted => "halted",
            RalphStop::IterationCap { .. } => "iteration_cap",
            RalphStop::TimeCap => "time_cap",
            RalphStop::EngineError { kind, .. } => *kind,
        }
    }
}

impl fmt::Display for RalphStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone)]
pub struct RalphOutcome {
    pub iterations: u32,
    pub stop: RalphStop,
    pub report: TaskReport,
}

/// Run the loop with the configured limits.
pub fn run_ralph<E: ReasoningEngine>(rt: &Runtime<'_, E>, claimed: Claimed) -> Result<RalphOutcome> {
    run_ralph_with_limits(rt, claimed, rt.limits())
}

/// Run the loop; `limits` are clamped to the hard caps.
#[instrument(skip_all, fields(task = %claimed.name()))]
pub fn run_ralph_with_limits<E: ReasoningEngine>(
    rt: &Runtime<'_, E>,
    mut claimed: Claimed,
    limits: LoopLimits,
) -> Result<RalphOutcome> {
    let budget = LoopBudget::start(limits);
    let limits = budget.limits();
    let task = claimed.name().to_string();
    let tools = rt.tools.descriptors();
    let mut previous: Option<PreviousIteration> = None;
    let mut last_thought = String::new();
    let mut iteration = 0u32;
    let first_step = last_step(rt.paths, &task)?;
    info!(
        max_iterations = limits.max_iterations,
        first_step = first_step + 1,
        "ralph loop started"
    );

    let stop = loop {
        if rt.stop_requested() {
            break RalphStop::Halted;
        }
        match budget.check(iteration + 1) {
            Some(BudgetExhausted::Iterations { max_iterations }) => {
                break RalphStop::IterationCap { max_iterations };
            }
            Some(BudgetExhausted::WallClock { .. }) => break RalphStop::TimeCap,
            None => {}
        }
        iteration += 1;
        let started_at = Utc::now();
        let started = Instant::now();
        let mut record = IterationRecord {
            task: task.clone(),
            step: first_step + iteration,
            iteration,
            started_at,
            duration_ms: 0,
            thought: String::new(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            next_action: None,
            parse: ParseMode::Unparseable,
            note: None,
        };

        let prompt = rt.prompt_builder().build_ralph(&RalphInputs {
            task: task_context(&claimed),
            iteration,
            max_iterations: limits.max_iterations,
            previous: previous.take(),
            tools: tools.clone(),
            related: related_files(
                rt.paths,
                &claimed.task,
                rt.config.ralph.related_files_limit,
                rt.config.ralph.related_file_bytes,
            )?,
        })?;
        let reply = rt.call_engine(&task, prompt, Some(budget.deadline()));

        if rt.stop_requested() {
            record.note = Some("emergency stop present after engine call".to_string());
            finish_record(rt, &mut record, started)?;
            break RalphStop::Halted;
        }

        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                record.note = Some(format!("engine error: {err}"));
                finish_record(rt, &mut record, started)?;
                break engine_stop(&err, budget.elapsed() >= limits.max_duration);
            }
        };

        let parsed = match parse_engine_response(&reply) {
            Ok(parsed) => parsed,
            Err(err) => {
                record.thought = truncate_chars(&reply, TOOL_OUTPUT_CHARS);
                record.note = Some(err.to_string());
                finish_record(rt, &mut record, started)?;
                warn!(iteration, "unparseable engine response");
                break RalphStop::NeedsHuman {
                    reason: format!("The engine reply in iteration {iteration} could not be parsed: {err}"),
                };
            }
        };
        let response = parsed.response;
        record.parse = parsed.mode;
        record.thought = response.thought.clone();
        record.tool_calls = response.tool_calls.clone();
        record.next_action = Some(response.next_action);
        last_thought = response.thought.clone();

        if response.next_action == NextAction::Continue {
            record.tool_results =
                run_tool_calls(rt, &task, iteration, &response.tool_calls, budget.deadline());
        } else if !response.tool_calls.is_empty() {
            record.note = Some("tool calls ignored on a terminal signal".to_string());
        }
        finish_record(rt, &mut record, started)?;

        match response.next_action {
            NextAction::Continue => {}
            NextAction::Done => break RalphStop::Done,
            NextAction::Failed => break RalphStop::Failed,
            NextAction::NeedsHuman => {
                break RalphStop::NeedsHuman {
                    reason: format!("The agent asked for a human in iteration {iteration}."),
                };
            }
        }

        previous = Some(PreviousIteration {
            iteration,
            thought: response.thought,
            results: record
                .tool_results
                .iter()
                .map(|r| PreviousResult {
                    name: r.name.clone(),
                    ok: r.ok,
                    output: r.output.clone(),
                })
                .collect(),
        });
        let pause = limits
            .iteration_delay
            .min(remaining_budget(budget.deadline()).unwrap_or_default());
        if !pause.is_zero() {
            thread::sleep(pause);
        }
    };

    info!(iterations = iteration, stop = %stop, "ralph loop finished");
    claimed.task.doc.set("ralph_iterations", iteration.to_string());
    claimed.task.doc.set("ralph_stop", stop.label());
    let report = finish_task(rt, claimed, &stop, iteration, &last_thought)?;
    Ok(RalphOutcome {
        iterations: iteration,
        stop,
        report,
    })
}

fn engine_stop(err: &ExternalError, out_of_time: bool) -> RalphStop {
    if out_of_time && matches!(err, ExternalError::Timeout(_)) {
        return RalphStop::TimeCap;
    }
    RalphStop::EngineError {
        kind: err.kind(),
        message: err.to_string(),
    }
}

fn finish_record<E: ReasoningEngine>(
    rt: &Runtime<'_, E>,
    record: &mut IterationRecord,
    started: Instant,
) -> Result<()> {
    record.duration_ms = started.elapsed().as_millis() as u64;
    write_iteration(rt.paths, record)?;
    Ok(())
}

/// Execute tool calls in order. Sensitive tools are never run here; a
/// request referencing the task is filed instead.
///
/// Every call is bounded by the loop's `deadline`. Once it has passed the
/// remaining calls are skipped and reported as not executed.
fn run_tool_calls<E: ReasoningEngine>(
    rt: &Runtime<'_, E>,
    task: &str,
    iteration: u32,
    calls: &[ToolCall],
    deadline: Instant,
) -> Vec<ToolResult> {
    calls
        .iter()
        .map(|call| {
            if Instant::now() >= deadline {
                warn!(iteration, tool = %call.name, "tool call skipped: wall-clock budget spent");
                return ToolResult {
                    name: call.name.clone(),
                    ok: false,
                    output: "not executed: wall-clock budget exhausted".to_string(),
                };
            }
            if rt.tools.requires_approval(&call.name) {
                return request_tool_approval(rt, task, iteration, call);
            }
            match rt.tools.dispatch_until(
                &call.name,
                &call.arguments,
                task,
                &rt.config.retry,
                rt.audit,
                Some(deadline),
            ) {
                Ok(value) => ToolResult {
                    name: call.name.clone(),
                    ok: true,
                    output: truncate_chars(&render_value(&value), TOOL_OUTPUT_CHARS),
                },
                Err(err) => ToolResult {
                    name: call.name.clone(),
                    ok: false,
                    output: err.to_string(),
                },
            }
        })
        .collect()
}

fn request_tool_approval<E: ReasoningEngine>(
    rt: &Runtime<'_, E>,
    task: &str,
    iteration: u32,
    call: &ToolCall,
) -> ToolResult {
    let created = Utc::now();
    let draft = ApprovalDraft {
        task: task.to_string(),
        action: call.name.clone(),
        params: call.arguments.clone(),
        reason: format!("Requested by the agent working on {task} (iteration {iteration})."),
        requested_by: rt.role,
        created,
        expires: rt.approval_expiry(created),
        follow_up_of: None,
        task_body: None,
    };
    match draft_request(rt.paths, &draft) {
        Ok(path) => ToolResult {
            name: call.name.clone(),
            ok: true,
            output: format!(
                "not executed: requires human approval; request filed as {}",
                path.file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
            ),
        },
        Err(err) => ToolResult {
            name: call.name.clone(),
            ok: false,
            output: format!("not executed: approval request could not be filed: {err:#}"),
        },
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn finish_task<E: ReasoningEngine>(
    rt: &Runtime<'_, E>,
    claimed: Claimed,
    stop: &RalphStop,
    iterations: u32,
    last_thought: &str,
) -> Result<TaskReport> {
    let name = claimed.name().to_string();
    match stop {
        RalphStop::Done => {
            let summary = format!(
                "Completed in {iterations} iteration(s).\n\n{}",
                if last_thought.trim().is_empty() { "(no final thought)" } else { last_thought }
            );
            write_plan(rt.paths, &name, &summary)?;
            complete_task(rt, claimed)
        }
        RalphStop::NeedsHuman { reason } => {
            let params = json!({
                "question": last_thought,
                "iterations": iterations,
            });
            escalate(rt, claimed, HUMAN_REVIEW, params, reason)
        }
        other => {
            write_error_plan(rt.paths, &name, &failure_for(other, iterations))?;
            fail_task(rt, claimed, other.label())
        }
    }
}

fn failure_for(stop: &RalphStop, iterations: u32) -> PlanFailure {
    match stop {
        RalphStop::Halted => PlanFailure::new(
            "halted",
            format!("Emergency stop file present; halted after {iterations} iteration(s)."),
            &[
                "Remove the emergency stop file once it is safe to continue (`vault resume`).",
                "Move the task back to Needs_Action to run it again.",
            ],
        ),
        RalphStop::IterationCap { max_iterations } => PlanFailure::new(
            "iteration_cap",
            format!("Reached the limit of {max_iterations} iterations without finishing."),
            &[
                "Review the iteration logs in Ralph_Logs/.",
                "Split the task into smaller tasks or clarify the goal.",
            ],
        ),
        RalphStop::TimeCap => PlanFailure::new(
            "time_cap",
            format!("Ran out of wall-clock time after {iterations} iteration(s)."),
            &["Review the iteration logs in Ralph_Logs/.", "Split the task into smaller tasks."],
        ),
        RalphStop::Failed => PlanFailure::new(
            "agent_failed",
            "The agent reported that the task cannot be completed.",
            &["Read the last iteration's thought in Ralph_Logs/ for the reason."],
        ),
        RalphStop::EngineError { kind, message } => PlanFailure::new(
            kind,
            message.clone(),
            &[
                "Check the reasoning engine CLI and its credentials.",
                "Move the task back to Needs_Action once the engine works again.",
            ],
        ),
        RalphStop::Done | RalphStop::NeedsHuman { .. } => {
            PlanFailure::new("unexpected", "not a failure", &[])
        }
    }
}
