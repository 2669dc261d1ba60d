use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Next-state signal returned by the reasoning engine in Ralph mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NextAction {
    Continue,
    Done,
    Failed,
    NeedsHuman,
}

impl NextAction {
    pub fn as_str(self) -> &'static str {
        match self {
            NextAction::Continue => "CONTINUE",
            NextAction::Done => "DONE",
            NextAction::Failed => "FAILED",
            NextAction::NeedsHuman => "NEEDS_HUMAN",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, NextAction::Continue)
    }
}

impl fmt::Display for NextAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a task is processed once claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskMode {
    #[default]
    SinglePass,
    Ralph,
}

impl TaskMode {
    /// Interpret the `mode` front matter value. Unknown values fall back to single pass.
    pub fn from_front_matter(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "ralph" => TaskMode::Ralph,
            _ => TaskMode::SinglePass,
        }
    }
}

/// Task priority used to order a scan; lower rank runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn from_front_matter(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("high") | Some("urgent") => Priority::High,
            Some("low") => Priority::Low,
            _ => Priority::Normal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// A named tool invocation requested by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Structured response expected from the engine on every Ralph iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineResponse {
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub next_action: NextAction,
}

/// Which agent owns a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Cloud,
    #[default]
    Local,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Cloud => "cloud",
            AgentRole::Local => "local",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cloud" => Ok(AgentRole::Cloud),
            "local" => Ok(AgentRole::Local),
            other => Err(anyhow!("unknown agent role '{other}' (expected cloud|local)")),
        }
    }
}

/// RFC 3339 timestamp with second precision, as written into front matter.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a front matter timestamp written by [`format_timestamp`] or any RFC 3339 writer.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
