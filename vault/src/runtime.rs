//! Explicit per-process context handed to every component.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::core::budget::LoopLimits;
use crate::core::external::ExternalError;
use crate::core::stage::Stage;
use crate::core::types::AgentRole;
use crate::io::audit::{AuditAction, AuditActor, AuditLog};
use crate::io::config::VaultConfig;
use crate::io::engine::{EngineRequest, ReasoningEngine};
use crate::io::layout::VaultPaths;
use crate::io::prompt::PromptBuilder;
use crate::io::retry::{CallSite, with_retry};
use crate::io::tools::ToolRegistry;

/// Everything a component needs; nothing is global.
pub struct Runtime<'a, E: ReasoningEngine> {
    pub paths: &'a VaultPaths,
    pub config: &'a VaultConfig,
    pub engine: &'a E,
    pub tools: &'a ToolRegistry,
    pub audit: &'a AuditLog,
    pub role: AgentRole,
}

impl<E: ReasoningEngine> Runtime<'_, E> {
    pub fn limits(&self) -> LoopLimits {
        self.config.ralph.limits()
    }

    pub fn prompt_builder(&self) -> PromptBuilder {
        PromptBuilder::new(self.config.engine.prompt_budget_bytes)
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.config.engine.timeout_secs)
    }

    /// Where this agent files approval requests.
    pub fn pending_stage(&self) -> Stage {
        Stage::PendingApproval(self.role)
    }

    pub fn approval_expiry(&self, created: DateTime<Utc>) -> DateTime<Utc> {
        let timeout = chrono::Duration::from_std(self.config.approval_timeout())
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        created + timeout
    }

    pub fn stop_path(&self) -> PathBuf {
        self.paths.emergency_stop_path(self.config)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_path().exists()
    }

    /// Does the task body mention one of the configured sensitive keywords?
    pub fn is_sensitive(&self, body: &str) -> bool {
        let lower = body.to_lowercase();
        self.config
            .approval
            .sensitive_keywords
            .iter()
            .any(|word| !word.trim().is_empty() && lower.contains(&word.trim().to_lowercase()))
    }

    /// One engine request through the retry wrapper.
    ///
    /// With a `deadline`, neither the call timeout nor a retry delay may pass it.
    pub fn call_engine(
        &self,
        task: &str,
        prompt: String,
        deadline: Option<Instant>,
    ) -> Result<String, ExternalError> {
        let mut site = CallSite::new(
            AuditActor::Engine,
            AuditAction::EngineRequest,
            json!({"task": task, "prompt_bytes": prompt.len()}),
        );
        if let Some(deadline) = deadline {
            site = site.with_deadline(deadline);
        }
        let base_timeout = self.engine_timeout();
        with_retry(&self.config.retry, self.audit, &site, |_| {
            let timeout = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(ExternalError::Timeout(Duration::ZERO));
                    }
                    base_timeout.min(remaining)
                }
                None => base_timeout,
            };
            self.engine.complete(&EngineRequest {
                task: task.to_string(),
                prompt: prompt.clone(),
                timeout,
            })
        })
    }
}
