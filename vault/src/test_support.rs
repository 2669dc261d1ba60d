//! Test-only fakes and vault fixtures.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tempfile::TempDir;

use crate::core::external::ExternalError;
use crate::core::frontmatter::TaskDocument;
use crate::core::types::AgentRole;
use crate::io::audit::{AuditEntry, AuditLog, read_entries};
use crate::io::config::{VaultConfig, write_config};
use crate::io::engine::{EngineRequest, ReasoningEngine};
use crate::io::layout::{InitOptions, VaultPaths, init_vault};
use crate::io::retry::immediate;
use crate::io::store::write_document;
use crate::io::tools::{ToolHandler, ToolRegistry};
use crate::runtime::Runtime;

/// Engine returning scripted replies in order; runs out with an `Other` error.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    replies: Mutex<VecDeque<Result<String, ExternalError>>>,
    requests: Mutex<Vec<EngineRequest>>,
}

impl ScriptedEngine {
    pub fn new(replies: Vec<Result<String, ExternalError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Engine that answers every call in `replies` successfully.
    pub fn replying(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn requests(&self) -> Vec<EngineRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }
}

impl ReasoningEngine for ScriptedEngine {
    fn complete(&self, request: &EngineRequest) -> Result<String, ExternalError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or_else(|| Err(ExternalError::Other("script exhausted".to_string())))
    }
}

/// Tool that records its arguments and replays scripted results.
#[derive(Clone)]
pub struct RecordingTool {
    requires_approval: bool,
    calls: Arc<Mutex<Vec<Value>>>,
    results: Arc<Mutex<VecDeque<Result<Value, ExternalError>>>>,
}

impl RecordingTool {
    pub fn new(requires_approval: bool) -> Self {
        Self {
            requires_approval,
            calls: Arc::default(),
            results: Arc::default(),
        }
    }

    /// Queue results; once drained every call answers `{"ok": true}`.
    pub fn with_results(self, results: Vec<Result<Value, ExternalError>>) -> Self {
        self.results.lock().expect("results lock").extend(results);
        self
    }

    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl ToolHandler for RecordingTool {
    fn description(&self) -> &str {
        "records calls"
    }

    fn requires_approval(&self) -> bool {
        self.requires_approval
    }

    fn call(&self, arguments: &Value) -> Result<Value, ExternalError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(arguments.clone());
        self.results
            .lock()
            .expect("results lock")
            .pop_front()
            .unwrap_or_else(|| Ok(serde_json::json!({"ok": true})))
    }
}

/// An initialized vault in a temp dir, configured for fast tests.
pub struct TestVault {
    pub temp: TempDir,
    pub paths: VaultPaths,
    pub config: VaultConfig,
    pub audit: AuditLog,
}

impl TestVault {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_vault(temp.path(), &InitOptions { force: false }).expect("init vault");
        let mut config = VaultConfig::default();
        config.ralph.iteration_delay_ms = 0;
        config.retry = immediate(3);
        write_config(&paths.config_path, &config).expect("write config");
        let audit = AuditLog::new(&paths.logs, "test-session");
        Self {
            temp,
            paths,
            config,
            audit,
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Persist `self.config` after a test changed it.
    pub fn save_config(&self) {
        write_config(&self.paths.config_path, &self.config).expect("write config");
    }

    pub fn runtime<'a, E: ReasoningEngine>(
        &'a self,
        engine: &'a E,
        tools: &'a ToolRegistry,
    ) -> Runtime<'a, E> {
        Runtime {
            paths: &self.paths,
            config: &self.config,
            engine,
            tools,
            audit: &self.audit,
            role: AgentRole::Local,
        }
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        read_entries(&self.audit.current_path()).expect("audit entries")
    }
}

impl Default for TestVault {
    fn default() -> Self {
        Self::new()
    }
}

/// Write a task document with the given front matter into `dir`.
pub fn write_task(dir: &Path, name: &str, front: &[(&str, &str)], body: &str) {
    let mut doc = TaskDocument::new(body);
    for (key, value) in front {
        doc.set(key, *value);
    }
    write_document(&dir.join(name), &doc).expect("write task");
}
