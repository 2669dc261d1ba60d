//! Approval request documents.
//!
//! A request is an ordinary markdown document whose front matter names the
//! referenced task and the action it authorizes. Parameters live in a fenced
//! JSON block so a reviewer can read and edit them before approving.

use std::fmt;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;

use super::frontmatter::TaskDocument;
use super::types::{AgentRole, format_timestamp, parse_timestamp};

pub const REQUEST_TYPE: &str = "approval_request";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Executing,
    Executed,
    Failed,
    Timeout,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Executing => "executing",
            ApprovalStatus::Executed => "executed",
            ApprovalStatus::Failed => "failed",
            ApprovalStatus::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "rejected" => Some(ApprovalStatus::Rejected),
            "executing" => Some(ApprovalStatus::Executing),
            "executed" => Some(ApprovalStatus::Executed),
            "failed" => Some(ApprovalStatus::Failed),
            "timeout" => Some(ApprovalStatus::Timeout),
            _ => None,
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to write a new approval request.
#[derive(Debug, Clone)]
pub struct ApprovalDraft {
    /// Name of the task file this request refers to.
    pub task: String,
    pub action: String,
    pub params: Value,
    pub reason: String,
    pub requested_by: AgentRole,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub follow_up_of: Option<String>,
    /// Original task body, quoted for the reviewer.
    pub task_body: Option<String>,
}

impl ApprovalDraft {
    /// Render a standalone request document.
    pub fn to_document(&self) -> TaskDocument {
        let mut doc = TaskDocument::new(String::new());
        self.apply_to(&mut doc);
        doc
    }

    /// Turn `doc` into a pending request, keeping its existing front matter keys.
    pub fn apply_to(&self, doc: &mut TaskDocument) {
        doc.set("type", REQUEST_TYPE);
        doc.set("task", &self.task);
        doc.set("action", &self.action);
        doc.set("status", ApprovalStatus::Pending.as_str());
        doc.set("requested_by", self.requested_by.as_str());
        doc.set("created", format_timestamp(self.created));
        doc.set("expires", format_timestamp(self.expires));
        if let Some(prev) = &self.follow_up_of {
            doc.set("follow_up_of", prev);
        }
        doc.remove("params");
        doc.body = self.render_body();
    }

    fn render_body(&self) -> String {
        let params = serde_json::to_string_pretty(&self.params).unwrap_or_else(|_| "{}".into());
        let mut body = format!(
            "# Approval Request: {} for {}\n\n## Parameters\n\n```json\n{}\n```\n\n## Reason\n\n{}\n",
            self.action,
            self.task,
            params,
            self.reason.trim()
        );
        if let Some(task_body) = self.task_body.as_deref().map(str::trim)
            && !task_body.is_empty()
        {
            body.push_str("\n## Original Task\n\n");
            body.push_str(task_body);
            body.push('\n');
        }
        body.push_str(
            "\n## Action Required\n\nMove this file to `Approved/` to proceed or to `Rejected/` to cancel.\n",
        );
        body
    }
}

/// A request parsed back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRequest {
    pub task: String,
    pub action: String,
    pub params: Value,
    pub status: Option<ApprovalStatus>,
    pub expires: Option<DateTime<Utc>>,
    pub follow_up_of: Option<String>,
}

impl ApprovalRequest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }
}

pub fn is_approval_request(doc: &TaskDocument) -> bool {
    doc.get("type") == Some(REQUEST_TYPE)
}

/// Parse a request document. `name` is used as the task when the key is missing.
pub fn parse_request(name: &str, doc: &TaskDocument) -> Result<ApprovalRequest> {
    let action = doc
        .get("action")
        .ok_or_else(|| anyhow!("approval request {name} has no action"))?
        .to_string();
    let params = match parameters_block(&doc.body) {
        Some(block) => serde_json::from_str(block)
            .with_context(|| format!("parse parameters block in {name}"))?,
        None => match doc.get("params") {
            Some(inline) => serde_json::from_str(inline)
                .with_context(|| format!("parse params front matter in {name}"))?,
            None => Value::Object(serde_json::Map::new()),
        },
    };
    Ok(ApprovalRequest {
        task: doc.get("task").unwrap_or(name).to_string(),
        action,
        params,
        status: doc.status().and_then(ApprovalStatus::parse),
        expires: doc.get("expires").and_then(parse_timestamp),
        follow_up_of: doc.get("follow_up_of").map(str::to_string),
    })
}

fn parameters_block(body: &str) -> Option<&str> {
    static PARAMS_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)##\s*Parameters\s*```(?:json)?\s*(.*?)```").expect("valid params regex")
    });
    PARAMS_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn draft() -> ApprovalDraft {
        let created = parse_timestamp("2026-05-01T10:00:00Z").expect("ts");
        ApprovalDraft {
            task: "invoice_acme.md".to_string(),
            action: "create_invoice".to_string(),
            params: json!({"customer": "ACME", "amount": 1200}),
            reason: "Invoice requested by email".to_string(),
            requested_by: AgentRole::Local,
            created,
            expires: created + Duration::hours(1),
            follow_up_of: None,
            task_body: Some("# Invoice ACME\n".to_string()),
        }
    }

    #[test]
    fn rendered_request_parses_back() {
        let doc = TaskDocument::parse(&draft().to_document().render());
        assert!(is_approval_request(&doc));
        let req = parse_request("APPROVAL_x.md", &doc).expect("parse");
        assert_eq!(req.task, "invoice_acme.md");
        assert_eq!(req.action, "create_invoice");
        assert_eq!(req.params, json!({"customer": "ACME", "amount": 1200}));
        assert_eq!(req.status, Some(ApprovalStatus::Pending));
        assert!(doc.body.contains("## Original Task"));
    }

    #[test]
    fn apply_keeps_existing_keys_and_drops_inline_params() {
        let mut doc = TaskDocument::parse(
            "---\npriority: high\naction: create_invoice\nparams: {\"amount\": 5}\n---\n\nbody\n",
        );
        draft().apply_to(&mut doc);
        assert_eq!(doc.get("priority"), Some("high"));
        assert_eq!(doc.get("params"), None);
        assert_eq!(doc.status(), Some("pending"));
    }

    #[test]
    fn inline_params_are_used_without_block() {
        let doc = TaskDocument::parse("---\naction: send_email\nparams: {\"to\": \"a@b.c\"}\n---\n\nbody\n");
        let req = parse_request("t.md", &doc).expect("parse");
        assert_eq!(req.task, "t.md");
        assert_eq!(req.params, json!({"to": "a@b.c"}));
    }

    #[test]
    fn expiry_compares_against_now() {
        let req = parse_request("x.md", &draft().to_document()).expect("parse");
        let created = parse_timestamp("2026-05-01T10:00:00Z").expect("ts");
        assert!(!req.is_expired(created));
        assert!(req.is_expired(created + Duration::hours(2)));
    }

    #[test]
    fn missing_action_is_an_error() {
        let doc = TaskDocument::parse("---\ntype: approval_request\n---\n\nbody\n");
        let err = parse_request("x.md", &doc).unwrap_err();
        assert!(err.to_string().contains("has no action"));
    }
}
