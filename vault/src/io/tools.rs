//! Tool registry: named capabilities backed by local handlers or remote HTTP endpoints.
//!
//! Handlers are statically typed implementations of [`ToolHandler`]. The
//! registry is built once per process from the vault config and passed
//! explicitly to whatever needs to run tools.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use super::audit::{AuditAction, AuditActor, AuditLog};
use super::config::{EndpointConfig, VaultConfig};
use super::context::truncate_chars;
use super::layout::VaultPaths;
use super::prompt::ToolDescriptor;
use super::retry::{CallSite, with_retry};
use super::store::{create_document, list_markdown, unique_name};
use crate::core::backoff::RetryPolicy;
use crate::core::external::{ExternalError, classify_http_status};
use crate::core::frontmatter::TaskDocument;
use crate::core::stage::Stage;
use crate::core::types::format_timestamp;

/// Where a tool runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolTarget {
    Local,
    Remote { service: String },
}

impl fmt::Display for ToolTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolTarget::Local => f.write_str("local"),
            ToolTarget::Remote { service } => write!(f, "remote:{service}"),
        }
    }
}

/// A single callable capability.
pub trait ToolHandler: Send + Sync {
    fn description(&self) -> &str;

    /// Sensitive tools only run after a human approves a request.
    fn requires_approval(&self) -> bool {
        false
    }

    fn target(&self) -> ToolTarget {
        ToolTarget::Local
    }

    fn call(&self, arguments: &Value) -> Result<Value, ExternalError>;

    /// Like [`ToolHandler::call`], but waiting at most `limit` for a result.
    /// Handlers that cannot be interrupted ignore the limit.
    fn call_within(&self, arguments: &Value, _limit: Duration) -> Result<Value, ExternalError> {
        self.call(arguments)
    }
}

/// Name -> handler map.
#[derive(Default)]
pub struct ToolRegistry {
    handlers: BTreeMap<String, Box<dyn ToolHandler>>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous handler.
    pub fn register(&mut self, name: impl Into<String>, handler: impl ToolHandler + 'static) {
        self.handlers.insert(name.into(), Box::new(handler));
    }

    /// Registry holding the built-in local tools.
    pub fn with_builtins(paths: &VaultPaths) -> Self {
        let mut registry = Self::new();
        registry.register("human_review", HumanReview);
        registry.register("write_draft", WriteDraft { paths: paths.clone() });
        registry.register("read_file", ReadFile { paths: paths.clone() });
        registry.register("list_stage", ListStage { paths: paths.clone() });
        registry.register("create_follow_up", CreateFollowUp { paths: paths.clone() });
        registry
    }

    /// Built-ins plus every tool declared under `[endpoints.*]`.
    pub fn from_config(paths: &VaultPaths, config: &VaultConfig) -> Result<Self> {
        let mut registry = Self::with_builtins(paths);
        for (service, endpoint) in &config.endpoints {
            let client = reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(endpoint.timeout_secs))
                .build()
                .with_context(|| format!("build HTTP client for endpoint {service}"))?;
            for (tool, path) in &endpoint.tools {
                registry.register(
                    tool.clone(),
                    RemoteTool::new(service, endpoint, path, client.clone()),
                );
            }
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&dyn ToolHandler> {
        self.handlers.get(name).map(|h| h.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn requires_approval(&self, name: &str) -> bool {
        self.get(name).is_some_and(|h| h.requires_approval())
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.handlers
            .iter()
            .map(|(name, handler)| ToolDescriptor {
                name: name.clone(),
                description: handler.description().to_string(),
                requires_approval: handler.requires_approval(),
            })
            .collect()
    }

    /// Run a tool through the retry wrapper; every attempt is audited.
    pub fn dispatch(
        &self,
        name: &str,
        arguments: &Value,
        task: &str,
        policy: &RetryPolicy,
        audit: &AuditLog,
    ) -> Result<Value, ExternalError> {
        self.dispatch_until(name, arguments, task, policy, audit, None)
    }

    /// [`ToolRegistry::dispatch`] bounded by `deadline`: no attempt starts
    /// after it, and each attempt waits at most the time left.
    #[instrument(skip(self, arguments, policy, audit, deadline))]
    pub fn dispatch_until(
        &self,
        name: &str,
        arguments: &Value,
        task: &str,
        policy: &RetryPolicy,
        audit: &AuditLog,
        deadline: Option<Instant>,
    ) -> Result<Value, ExternalError> {
        let Some(handler) = self.get(name) else {
            audit.record_or_warn(
                AuditActor::Tool,
                AuditAction::ToolCall,
                false,
                json!({"tool": name, "task": task}),
                Some(&ExternalError::UnknownTool(name.to_string()).to_string()),
            );
            return Err(ExternalError::UnknownTool(name.to_string()));
        };
        let site = CallSite::new(
            AuditActor::Tool,
            AuditAction::ToolCall,
            json!({
                "tool": name,
                "task": task,
                "target": handler.target().to_string(),
            }),
        );
        let site = match deadline {
            Some(deadline) => site.with_deadline(deadline),
            None => site,
        };
        debug!(target = %handler.target(), "dispatching tool");
        with_retry(policy, audit, &site, |_| match deadline {
            None => handler.call(arguments),
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(ExternalError::Timeout(Duration::ZERO));
                }
                handler.call_within(arguments, left)
            }
        })
    }
}

/// Acknowledges a human decision; executing an approved review is the review itself.
pub struct HumanReview;

impl ToolHandler for HumanReview {
    fn description(&self) -> &str {
        "Hand the task to a person; args: {\"question\": string}"
    }

    fn call(&self, arguments: &Value) -> Result<Value, ExternalError> {
        Ok(json!({
            "acknowledged": true,
            "question": arguments.get("question").cloned().unwrap_or(Value::Null),
        }))
    }
}

/// Writes a draft document into `Plans/`.
pub struct WriteDraft {
    paths: VaultPaths,
}

impl ToolHandler for WriteDraft {
    fn description(&self) -> &str {
        "Save a draft document to Plans/; args: {\"title\": string, \"content\": string}"
    }

    fn call(&self, arguments: &Value) -> Result<Value, ExternalError> {
        let content = required_str(arguments, "content")?;
        let title = arguments
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("draft");
        let name = unique_name(&self.paths.plans, &format!("DRAFT_{}.md", slug(title)));
        let mut doc = TaskDocument::new(content);
        doc.set("type", "draft");
        doc.set("title", title);
        doc.set("created", format_timestamp(Utc::now()));
        create_document(&self.paths.plans.join(&name), &doc).map_err(local_failure)?;
        Ok(json!({"path": format!("Plans/{name}")}))
    }
}

/// Reads a vault-relative file.
pub struct ReadFile {
    paths: VaultPaths,
}

const READ_FILE_MAX_CHARS: usize = 4_000;

impl ToolHandler for ReadFile {
    fn description(&self) -> &str {
        "Read a file inside the vault; args: {\"path\": \"Plans/PLAN_x.md\"}"
    }

    fn call(&self, arguments: &Value) -> Result<Value, ExternalError> {
        let rel = required_str(arguments, "path")?;
        let rel_path = Path::new(rel);
        let escapes = rel_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || rel.is_empty() {
            return Err(ExternalError::Rejected(format!(
                "path must stay inside the vault: {rel}"
            )));
        }
        let full = self.paths.root.join(rel_path);
        let text = std::fs::read_to_string(&full)
            .map_err(|err| ExternalError::Rejected(format!("read {rel}: {err}")))?;
        Ok(json!({"path": rel, "content": truncate_chars(&text, READ_FILE_MAX_CHARS)}))
    }
}

/// Lists markdown documents in a stage directory.
pub struct ListStage {
    paths: VaultPaths,
}

impl ToolHandler for ListStage {
    fn description(&self) -> &str {
        "List documents in a stage; args: {\"stage\": \"Needs_Action\"}"
    }

    fn call(&self, arguments: &Value) -> Result<Value, ExternalError> {
        let name = required_str(arguments, "stage")?;
        let stage = Stage::parse(name)
            .ok_or_else(|| ExternalError::Rejected(format!("unknown stage '{name}'")))?;
        let names =
            list_markdown(self.paths.stage_dir(stage)).map_err(local_failure)?;
        Ok(json!({"stage": stage.relative_dir(), "files": names}))
    }
}

/// Queues a new task for manual handling.
pub struct CreateFollowUp {
    paths: VaultPaths,
}

impl ToolHandler for CreateFollowUp {
    fn description(&self) -> &str {
        "Queue a follow-up task; args: {\"title\": string, \"body\": string, \"priority\": \"high|normal|low\"}"
    }

    fn call(&self, arguments: &Value) -> Result<Value, ExternalError> {
        let title = required_str(arguments, "title")?;
        let body = arguments.get("body").and_then(Value::as_str).unwrap_or("");
        let priority = arguments
            .get("priority")
            .and_then(Value::as_str)
            .unwrap_or("normal");
        let name = unique_name(
            &self.paths.needs_action,
            &format!("FOLLOWUP_{}.md", slug(title)),
        );
        let mut doc = TaskDocument::new(format!("# {title}\n\n{body}\n"));
        doc.set("type", "follow_up");
        doc.set("priority", priority);
        doc.set("status", "new");
        doc.set("created", format_timestamp(Utc::now()));
        if let Some(origin) = arguments.get("follow_up_of").and_then(Value::as_str) {
            doc.set("follow_up_of", origin);
        }
        create_document(&self.paths.needs_action.join(&name), &doc).map_err(local_failure)?;
        Ok(json!({"path": format!("Needs_Action/{name}")}))
    }
}

/// A tool served by `POST <url><path>` on a configured endpoint.
pub struct RemoteTool {
    service: String,
    url: String,
    auth_env: Option<String>,
    timeout: Duration,
    requires_approval: bool,
    description: String,
    client: reqwest::blocking::Client,
}

impl RemoteTool {
    pub fn new(
        service: &str,
        endpoint: &EndpointConfig,
        path: &str,
        client: reqwest::blocking::Client,
    ) -> Self {
        let url = format!(
            "{}/{}",
            endpoint.url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Self {
            service: service.to_string(),
            description: format!("Call {service} at {url}"),
            url,
            auth_env: endpoint.auth_env.clone(),
            timeout: Duration::from_secs(endpoint.timeout_secs),
            requires_approval: endpoint.requires_approval,
            client,
        }
    }

    fn post(&self, arguments: &Value, timeout: Duration) -> Result<Value, ExternalError> {
        let mut request = self.client.post(&self.url).json(arguments).timeout(timeout);
        if let Some(var) = &self.auth_env {
            let token = std::env::var(var).map_err(|_| {
                ExternalError::Auth(format!("environment variable {var} is not set"))
            })?;
            request = request.bearer_auth(token);
        }
        let response = request.send().map_err(|err| {
            if err.is_timeout() {
                ExternalError::Timeout(timeout)
            } else if err.is_connect() {
                ExternalError::Unavailable(format!("{}: {err}", self.service))
            } else {
                ExternalError::Network(format!("{}: {err}", self.service))
            }
        })?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|err| ExternalError::Network(format!("read response body: {err}")))?;
        if !status.is_success() {
            return Err(classify_http_status(status.as_u16(), &body));
        }
        if body.trim().is_empty() {
            return Ok(json!({"status": status.as_u16()}));
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

impl ToolHandler for RemoteTool {
    fn description(&self) -> &str {
        &self.description
    }

    fn requires_approval(&self) -> bool {
        self.requires_approval
    }

    fn target(&self) -> ToolTarget {
        ToolTarget::Remote {
            service: self.service.clone(),
        }
    }

    fn call(&self, arguments: &Value) -> Result<Value, ExternalError> {
        self.post(arguments, self.timeout)
    }

    fn call_within(&self, arguments: &Value, limit: Duration) -> Result<Value, ExternalError> {
        self.post(arguments, self.timeout.min(limit))
    }
}

fn required_str<'a>(arguments: &'a Value, key: &str) -> Result<&'a str, ExternalError> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ExternalError::Rejected(format!("missing string argument '{key}'")))
}

fn local_failure(err: anyhow::Error) -> ExternalError {
    ExternalError::Other(format!("{err:#}"))
}

/// Lowercase `[a-z0-9_]` slug of at most 40 characters.
pub fn slug(title: &str) -> String {
    let mut out = String::new();
    for ch in title.trim().chars() {
        if out.len() >= 40 {
            break;
        }
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
    }
    let out = out.trim_end_matches('_').to_string();
    if out.is_empty() { "untitled".to_string() } else { out }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::audit::read_entries;
    use crate::io::layout::{InitOptions, init_vault};
    use crate::io::retry::immediate;
    use std::fs;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serve one canned HTTP response per entry, in order, then stop.
    fn serve(responses: Vec<(u16, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        thread::spawn(move || {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut reader = BufReader::new(stream.try_clone().expect("clone"));
                let mut content_length = 0usize;
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                        break;
                    }
                    if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                        content_length = v.trim().parse().unwrap_or(0);
                    }
                }
                let mut request_body = vec![0u8; content_length];
                let _ = reader.read_exact(&mut request_body);
                let reply = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(reply.as_bytes());
            }
        });
        format!("http://{addr}")
    }

    fn registry_with_endpoint(url: String) -> (tempfile::TempDir, VaultPaths, ToolRegistry) {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_vault(temp.path(), &InitOptions { force: false }).expect("init");
        let mut config = VaultConfig::default();
        config.endpoints.insert(
            "erp".to_string(),
            EndpointConfig {
                url,
                tools: BTreeMap::from([("create_invoice".to_string(), "/invoices".to_string())]),
                ..EndpointConfig::default()
            },
        );
        let registry = ToolRegistry::from_config(&paths, &config).expect("registry");
        (temp, paths, registry)
    }

    #[test]
    fn remote_tool_returns_json_body() {
        let url = serve(vec![(200, r#"{"invoice_id": 17}"#)]);
        let (_temp, paths, registry) = registry_with_endpoint(url);
        assert!(registry.requires_approval("create_invoice"));

        let audit = AuditLog::new(&paths.logs, "s");
        let result = registry
            .dispatch("create_invoice", &json!({"amount": 5}), "t.md", &immediate(0), &audit)
            .expect("call");
        assert_eq!(result, json!({"invoice_id": 17}));

        let entries = read_entries(&audit.current_path()).expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].details["target"], "remote:erp");
    }

    /// A 503 is retried and the later success is returned.
    #[test]
    fn remote_tool_retries_unavailable() {
        let url = serve(vec![(503, ""), (201, r#"{"ok": true}"#)]);
        let (_temp, paths, registry) = registry_with_endpoint(url);
        let audit = AuditLog::new(&paths.logs, "s");
        let result = registry
            .dispatch("create_invoice", &json!({}), "t.md", &immediate(2), &audit)
            .expect("call");
        assert_eq!(result, json!({"ok": true}));
        let entries = read_entries(&audit.current_path()).expect("entries");
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].success);
        assert!(entries[1].success);
    }

    #[test]
    fn unreachable_endpoint_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let url = format!("http://{}", listener.local_addr().expect("addr"));
        drop(listener);
        let (_temp, paths, registry) = registry_with_endpoint(url);
        let audit = AuditLog::new(&paths.logs, "s");
        let err = registry
            .dispatch("create_invoice", &json!({}), "t.md", &immediate(0), &audit)
            .unwrap_err();
        assert!(err.is_unavailable(), "{err:?}");
    }

    #[test]
    fn unknown_tool_is_audited() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_vault(temp.path(), &InitOptions { force: false }).expect("init");
        let registry = ToolRegistry::with_builtins(&paths);
        let audit = AuditLog::new(&paths.logs, "s");
        let err = registry
            .dispatch("teleport", &json!({}), "t.md", &immediate(3), &audit)
            .unwrap_err();
        assert_eq!(err, ExternalError::UnknownTool("teleport".to_string()));
        assert_eq!(read_entries(&audit.current_path()).expect("entries").len(), 1);
    }

    #[test]
    fn read_file_stays_inside_vault() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_vault(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(paths.plans.join("PLAN_a.md"), "plan a").expect("write");
        let tool = ReadFile { paths: paths.clone() };

        let ok = tool.call(&json!({"path": "Plans/PLAN_a.md"})).expect("read");
        assert_eq!(ok["content"], "plan a");
        for bad in ["../etc/passwd", "/etc/passwd", "Plans/../../x"] {
            assert!(matches!(
                tool.call(&json!({"path": bad})),
                Err(ExternalError::Rejected(_))
            ));
        }
    }

    #[test]
    fn write_draft_and_follow_up_create_documents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_vault(temp.path(), &InitOptions { force: false }).expect("init");
        let registry = ToolRegistry::with_builtins(&paths);
        let audit = AuditLog::new(&paths.logs, "s");

        let draft = registry
            .dispatch(
                "write_draft",
                &json!({"title": "Reply to ACME!", "content": "Dear ACME"}),
                "t.md",
                &immediate(0),
                &audit,
            )
            .expect("draft");
        assert_eq!(draft["path"], "Plans/DRAFT_reply_to_acme.md");

        registry
            .dispatch(
                "create_follow_up",
                &json!({"title": "Retry invoice", "priority": "high"}),
                "t.md",
                &immediate(0),
                &audit,
            )
            .expect("follow up");
        let queued = list_markdown(&paths.needs_action).expect("list");
        assert_eq!(queued, vec!["FOLLOWUP_retry_invoice.md"]);

        let listed = registry
            .dispatch("list_stage", &json!({"stage": "Needs_Action"}), "t.md", &immediate(0), &audit)
            .expect("list");
        assert_eq!(listed["files"], json!(["FOLLOWUP_retry_invoice.md"]));
    }

    #[test]
    fn slug_is_bounded_and_clean() {
        assert_eq!(slug("  Hello, World!  "), "hello_world");
        assert_eq!(slug("***"), "untitled");
        assert!(slug(&"a".repeat(100)).len() <= 40);
    }

    /// A remote call never outlives the deadline, whatever the endpoint timeout.
    #[test]
    fn remote_call_is_cut_at_the_deadline() {
        // Connections queue in the backlog and are never answered.
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let url = format!("http://{}", listener.local_addr().expect("addr"));
        let (_temp, paths, registry) = registry_with_endpoint(url);
        let audit = AuditLog::new(&paths.logs, "s");

        let started = Instant::now();
        let err = registry
            .dispatch_until(
                "create_invoice",
                &json!({}),
                "t.md",
                &immediate(3),
                &audit,
                Some(Instant::now() + Duration::from_millis(200)),
            )
            .unwrap_err();
        assert!(matches!(err, ExternalError::Timeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
        let entries = read_entries(&audit.current_path()).expect("entries");
        assert_eq!(entries.last().expect("entry").details["terminal"], json!(true));
    }

    #[test]
    fn spent_deadline_skips_the_handler() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_vault(temp.path(), &InitOptions { force: false }).expect("init");
        let registry = ToolRegistry::with_builtins(&paths);
        let audit = AuditLog::new(&paths.logs, "s");
        let err = registry
            .dispatch_until(
                "list_stage",
                &json!({"stage": "Needs_Action"}),
                "t.md",
                &immediate(3),
                &audit,
                Some(Instant::now()),
            )
            .unwrap_err();
        assert_eq!(err, ExternalError::Timeout(Duration::ZERO));
        assert_eq!(read_entries(&audit.current_path()).expect("entries").len(), 1);
    }
}
