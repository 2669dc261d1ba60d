//! Prompt builder for reasoning engine input.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use super::context::RelatedFile;

const SINGLE_PASS_TEMPLATE: &str = include_str!("prompts/single_pass.md");
const RALPH_TEMPLATE: &str = include_str!("prompts/ralph.md");

/// Task fields exposed to templates.
#[derive(Debug, Clone, Serialize)]
pub struct TaskContext {
    pub name: String,
    pub priority: String,
    pub body: String,
}

/// One tool result carried into the next iteration.
#[derive(Debug, Clone, Serialize)]
pub struct PreviousResult {
    pub name: String,
    pub ok: bool,
    pub output: String,
}

/// The immediately preceding iteration, the only history a Ralph prompt sees.
#[derive(Debug, Clone, Serialize)]
pub struct PreviousIteration {
    pub iteration: u32,
    pub thought: String,
    pub results: Vec<PreviousResult>,
}

/// Tool listing for the Ralph contract.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub requires_approval: bool,
}

#[derive(Debug, Clone)]
pub struct SinglePassInputs {
    pub task: TaskContext,
    pub related: Vec<RelatedFile>,
}

#[derive(Debug, Clone)]
pub struct RalphInputs {
    pub task: TaskContext,
    pub iteration: u32,
    pub max_iterations: u32,
    pub previous: Option<PreviousIteration>,
    pub tools: Vec<ToolDescriptor>,
    pub related: Vec<RelatedFile>,
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("single_pass", SINGLE_PASS_TEMPLATE)?;
        env.add_template("ralph", RALPH_TEMPLATE)?;
        Ok(Self { env })
    }

    fn render_single_pass(&self, input: &SinglePassInputs) -> Result<String> {
        let template = self.env.get_template("single_pass")?;
        let rendered = template.render(context! {
            task => input.task.clone(),
            related => (!input.related.is_empty()).then(|| input.related.clone()),
        })?;
        Ok(rendered)
    }

    fn render_ralph(&self, input: &RalphInputs) -> Result<String> {
        let template = self.env.get_template("ralph")?;
        let rendered = template.render(context! {
            task => input.task.clone(),
            iteration => input.iteration,
            max_iterations => input.max_iterations,
            previous => input.previous.clone(),
            tools => (!input.tools.is_empty()).then(|| input.tools.clone()),
            related => (!input.related.is_empty()).then(|| input.related.clone()),
        })?;
        Ok(rendered)
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("valid section regex")
    });

    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let key = caps.get(1)?.as_str().to_string();
            let required = caps.get(2)?.as_str() == "required";
            Some((whole.start(), whole.end(), key, required))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (_, end, key, required)) in markers.iter().enumerate() {
        let next_start = markers
            .get(i + 1)
            .map(|(start, ..)| *start)
            .unwrap_or(rendered.len());
        let content = rendered[*end..next_start].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

/// Drop droppable sections in `drop_order` until under budget, then cut the last section.
fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize, drop_order: &[&str]) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in drop_order {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let allowed = last.content.len().saturating_sub(total - budget);
    let before_len = last.content.len();
    let marker = "\n[truncated]";
    let keep = floor_char_boundary(&last.content, allowed.saturating_sub(marker.len()));
    last.content.truncate(keep);
    if allowed > marker.len() {
        last.content.push_str(marker);
    }
    debug!(
        section = %last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

fn floor_char_boundary(s: &str, idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    let mut i = idx;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds prompts within a byte budget, dropping less critical sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build_single_pass(&self, input: &SinglePassInputs) -> Result<String> {
        let rendered = PromptEngine::new()?.render_single_pass(input)?;
        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes, &["related"]);
        Ok(render_sections(&sections))
    }

    /// Drop order: related -> tools -> previous.
    pub fn build_ralph(&self, input: &RalphInputs) -> Result<String> {
        let rendered = PromptEngine::new()?.render_ralph(input)?;
        let mut sections = parse_sections(&rendered);
        apply_budget(
            &mut sections,
            self.budget_bytes,
            &["related", "tools", "previous"],
        );
        Ok(render_sections(&sections))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(body: &str) -> TaskContext {
        TaskContext {
            name: "invoice.md".to_string(),
            priority: "high".to_string(),
            body: body.to_string(),
        }
    }

    fn ralph_inputs(related_len: usize) -> RalphInputs {
        RalphInputs {
            task: task("Send the invoice to ACME"),
            iteration: 2,
            max_iterations: 15,
            previous: Some(PreviousIteration {
                iteration: 1,
                thought: "look up the customer".to_string(),
                results: vec![PreviousResult {
                    name: "read_file".to_string(),
                    ok: true,
                    output: "customer: ACME".to_string(),
                }],
            }),
            tools: vec![ToolDescriptor {
                name: "create_invoice".to_string(),
                description: "Create an invoice in the ERP".to_string(),
                requires_approval: true,
            }],
            related: vec![RelatedFile {
                name: "notes.md".to_string(),
                excerpt: "r".repeat(related_len),
            }],
        }
    }

    /// Verifies Ralph prompt sections appear in deterministic order.
    #[test]
    fn ralph_prompt_ordering_is_stable() {
        let prompt = PromptBuilder::new(100_000)
            .build_ralph(&ralph_inputs(10))
            .expect("build");
        let contract = prompt.find("### Agent Contract").expect("contract");
        let task_pos = prompt.find("### Task").expect("task");
        let previous = prompt.find("### Previous Iteration").expect("previous");
        let tools = prompt.find("### Available Tools").expect("tools");
        let related = prompt.find("### Related Files").expect("related");
        assert!(contract < task_pos && task_pos < previous && previous < tools && tools < related);
        assert!(prompt.contains("iteration 2 of at most 15"));
        assert!(prompt.contains("create_invoice (requires approval)"));
        assert!(prompt.contains("customer: ACME"));
        assert!(!prompt.contains("<!--"), "markers are stripped");
    }

    /// With a tight budget, related files go first while contract and task remain.
    #[test]
    fn budget_drops_related_before_previous() {
        let full = PromptBuilder::new(100_000)
            .build_ralph(&ralph_inputs(5_000))
            .expect("build");
        let prompt = PromptBuilder::new(full.len() - 4_000)
            .build_ralph(&ralph_inputs(5_000))
            .expect("build");
        assert!(!prompt.contains("### Related Files"));
        assert!(prompt.contains("### Previous Iteration"));
        assert!(prompt.contains("### Agent Contract"));
        assert!(prompt.contains("### Task"));
    }

    #[test]
    fn single_pass_omits_empty_related_section() {
        let prompt = PromptBuilder::new(10_000)
            .build_single_pass(&SinglePassInputs {
                task: task("Summarize the quarterly report"),
                related: Vec::new(),
            })
            .expect("build");
        assert!(prompt.contains("### Planner Contract"));
        assert!(prompt.contains("Summarize the quarterly report"));
        assert!(!prompt.contains("### Related Files"));
    }

    /// An oversized required task body is cut instead of blowing the budget.
    #[test]
    fn oversized_task_is_truncated() {
        let prompt = PromptBuilder::new(2_000)
            .build_single_pass(&SinglePassInputs {
                task: task(&"é".repeat(5_000)),
                related: Vec::new(),
            })
            .expect("build");
        assert!(prompt.len() <= 2_000 + 4);
        assert!(prompt.contains("[truncated]"));
    }
}
