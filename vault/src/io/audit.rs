//! Append-only JSONL audit trail of external calls and errors.
//!
//! # Separation of Concerns
//!
//! - **Tracing (`logging`)**: developer diagnostics on stderr, filtered by `RUST_LOG`.
//! - **Audit log (this module)**: product artifact under `Logs/audit_<date>.jsonl`.
//!   One entry per external call attempt and per component error, always written.
//!
//! Several processes append to the same daily file. Each entry is serialized
//! in memory and written with one `write_all` on an `O_APPEND` handle, so
//! lines from concurrent writers never interleave.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Longest string kept verbatim inside audit details.
const MAX_DETAIL_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditActor {
    Watcher,
    Engine,
    Tool,
    Orchestrator,
    Approval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    EngineRequest,
    ToolCall,
    ErrorOccurred,
}

impl fmt::Display for AuditActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditActor::Watcher => "watcher",
            AuditActor::Engine => "engine",
            AuditActor::Tool => "tool",
            AuditActor::Orchestrator => "orchestrator",
            AuditActor::Approval => "approval",
        };
        f.pad(s)
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditAction::EngineRequest => "engine_request",
            AuditAction::ToolCall => "tool_call",
            AuditAction::ErrorOccurred => "error_occurred",
        };
        f.pad(s)
    }
}

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub actor: AuditActor,
    pub action: AuditAction,
    pub success: bool,
    pub details: Value,
    pub error: Option<String>,
    pub session_id: Option<String>,
}

/// Writer for the daily audit files of one vault.
#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
    session_id: String,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            session_id: session_id.into(),
        }
    }

    /// Session id shared by every entry this process writes unless overridden.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("audit_{}.jsonl", date.format("%Y-%m-%d")))
    }

    pub fn current_path(&self) -> PathBuf {
        self.path_for(Utc::now().date_naive())
    }

    /// Append one entry. `session_id` defaults to this log's session.
    pub fn record(
        &self,
        actor: AuditActor,
        action: AuditAction,
        success: bool,
        details: Value,
        error: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<()> {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            actor,
            action,
            success,
            details: summarize_value(details),
            error: error.map(truncate_chars),
            session_id: Some(session_id.unwrap_or(&self.session_id).to_string()),
        };
        self.append(&entry)
    }

    /// Record and downgrade write failures to a warning; auditing never aborts the caller.
    pub fn record_or_warn(
        &self,
        actor: AuditActor,
        action: AuditAction,
        success: bool,
        details: Value,
        error: Option<&str>,
    ) {
        if let Err(err) = self.record(actor, action, success, details, error, None) {
            warn!(err = %format!("{err:#}"), %actor, %action, "failed to write audit entry");
        }
    }

    fn append(&self, entry: &AuditEntry) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create directory {}", self.dir.display()))?;
        let path = self.path_for(entry.timestamp.date_naive());
        let mut line = serde_json::to_vec(entry).context("serialize audit entry")?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        file.write_all(&line)
            .with_context(|| format!("append {}", path.display()))?;
        Ok(())
    }
}

/// Generate a session id such as `local-20260501_101500-a8Zk2Q`.
pub fn new_session_id(prefix: &str) -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{prefix}-{}-{suffix}", Utc::now().format("%Y%m%d_%H%M%S"))
}

/// Read every entry of an audit file. Malformed lines are skipped with a warning.
pub fn read_entries(path: &Path) -> Result<Vec<AuditEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut entries = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(err) => warn!(line = idx + 1, err = %err, path = %path.display(), "skipping malformed audit line"),
        }
    }
    Ok(entries)
}

/// Counts of successes and failures for one actor/action pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditSummary {
    pub total: usize,
    pub failed: usize,
    pub sessions: usize,
    pub by_kind: BTreeMap<(AuditActor, AuditAction), Tally>,
}

pub fn summarize(entries: &[AuditEntry]) -> AuditSummary {
    let mut summary = AuditSummary {
        total: entries.len(),
        ..AuditSummary::default()
    };
    let mut sessions = std::collections::BTreeSet::new();
    for entry in entries {
        let tally = summary.by_kind.entry((entry.actor, entry.action)).or_default();
        if entry.success {
            tally.succeeded += 1;
        } else {
            tally.failed += 1;
            summary.failed += 1;
        }
        if let Some(id) = &entry.session_id {
            sessions.insert(id.clone());
        }
    }
    summary.sessions = sessions.len();
    summary
}

fn truncate_chars(s: &str) -> String {
    if s.chars().count() <= MAX_DETAIL_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_DETAIL_CHARS).collect();
    out.push_str("...[truncated]");
    out
}

/// Bound long strings anywhere inside the details value.
fn summarize_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_chars(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(summarize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, summarize_value(v)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn record_appends_one_json_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::new(temp.path(), "s-1");
        log.record(
            AuditActor::Engine,
            AuditAction::EngineRequest,
            true,
            json!({"task": "t.md"}),
            None,
            None,
        )
        .expect("record");
        log.record(
            AuditActor::Tool,
            AuditAction::ToolCall,
            false,
            json!({}),
            Some("boom"),
            Some("other-session"),
        )
        .expect("record");

        let raw = fs::read_to_string(log.current_path()).expect("read");
        assert_eq!(raw.lines().count(), 2);
        let entries = read_entries(&log.current_path()).expect("entries");
        assert_eq!(entries[0].session_id.as_deref(), Some("s-1"));
        assert_eq!(entries[0].details, json!({"task": "t.md"}));
        assert_eq!(entries[1].error.as_deref(), Some("boom"));
        assert_eq!(entries[1].session_id.as_deref(), Some("other-session"));

        let first: Value = serde_json::from_str(raw.lines().next().expect("line")).expect("json");
        for key in ["timestamp", "actor", "action", "success", "details", "error", "session_id"] {
            assert!(first.get(key).is_some(), "missing {key}");
        }
        assert_eq!(first["actor"], "engine");
        assert_eq!(first["action"], "engine_request");
    }

    #[test]
    fn long_details_are_truncated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::new(temp.path(), "s");
        log.record(
            AuditActor::Engine,
            AuditAction::EngineRequest,
            true,
            json!({"reply": "x".repeat(5_000), "nested": ["y".repeat(900)]}),
            None,
            None,
        )
        .expect("record");
        let entries = read_entries(&log.current_path()).expect("entries");
        let reply = entries[0].details["reply"].as_str().expect("str");
        assert!(reply.len() < 600);
        assert!(reply.ends_with("[truncated]"));
        assert!(entries[0].details["nested"][0].as_str().expect("str").len() < 600);
    }

    /// Concurrent writers each produce whole lines; nothing interleaves.
    #[test]
    fn concurrent_writers_do_not_interleave() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = Arc::new(AuditLog::new(temp.path(), "s"));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for i in 0..50 {
                        log.record(
                            AuditActor::Tool,
                            AuditAction::ToolCall,
                            true,
                            json!({"thread": t, "i": i, "pad": "z".repeat(300)}),
                            None,
                            None,
                        )
                        .expect("record");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        let raw = fs::read_to_string(log.current_path()).expect("read");
        assert_eq!(raw.lines().count(), 400);
        for line in raw.lines() {
            serde_json::from_str::<AuditEntry>(line).expect("whole line");
        }
    }

    #[test]
    fn summary_counts_by_kind() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::new(temp.path(), "s");
        for ok in [true, false, false] {
            log.record(AuditActor::Engine, AuditAction::EngineRequest, ok, json!({}), None, None)
                .expect("record");
        }
        fs::write(
            log.current_path(),
            format!(
                "{}not json\n",
                fs::read_to_string(log.current_path()).expect("read")
            ),
        )
        .expect("write");

        let summary = summarize(&read_entries(&log.current_path()).expect("entries"));
        assert_eq!(summary.total, 3);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.sessions, 1);
        assert_eq!(
            summary.by_kind[&(AuditActor::Engine, AuditAction::EngineRequest)],
            Tally {
                succeeded: 1,
                failed: 2
            }
        );
    }

    #[test]
    fn session_ids_are_prefixed_and_unique() {
        let a = new_session_id("local");
        let b = new_session_id("local");
        assert!(a.starts_with("local-"));
        assert_ne!(a, b);
    }
}
