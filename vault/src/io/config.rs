//! Vault configuration stored in `<root>/vault.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::backoff::RetryPolicy;
use crate::core::budget::{HARD_MAX_DURATION, HARD_MAX_ITERATIONS, LoopLimits};
use crate::core::types::AgentRole;

/// Vault configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values the orchestrator ships with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VaultConfig {
    /// Which agent this process acts as. Cloud agents only draft.
    pub role: AgentRole,

    /// Pause between scans of a polling component.
    pub poll_interval_secs: u64,

    pub engine: EngineConfig,
    pub ralph: RalphConfig,
    pub retry: RetryPolicy,
    pub approval: ApprovalConfig,

    /// Remote tool endpoints keyed by service name.
    pub endpoints: BTreeMap<String, EndpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Command to run the reasoning engine; the prompt is written to stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate captured engine stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Upper bound on the rendered prompt size.
    pub prompt_budget_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            timeout_secs: 5 * 60,
            output_limit_bytes: 200_000,
            prompt_budget_bytes: 40_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RalphConfig {
    pub max_iterations: u32,
    pub max_duration_secs: u64,
    pub iteration_delay_ms: u64,
    /// Sentinel file name at the vault root that halts every loop.
    pub emergency_stop_file: String,
    pub related_files_limit: usize,
    pub related_file_bytes: usize,
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            max_iterations: HARD_MAX_ITERATIONS,
            max_duration_secs: HARD_MAX_DURATION.as_secs(),
            iteration_delay_ms: 10_000,
            emergency_stop_file: "EMERGENCY_STOP_RALPH".to_string(),
            related_files_limit: 5,
            related_file_bytes: 1_000,
        }
    }
}

impl RalphConfig {
    pub fn limits(&self) -> LoopLimits {
        LoopLimits {
            max_iterations: self.max_iterations,
            max_duration: Duration::from_secs(self.max_duration_secs),
            iteration_delay: Duration::from_millis(self.iteration_delay_ms),
        }
        .clamped()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Pending requests older than this are cancelled with status `timeout`.
    pub timeout_secs: u64,
    /// Poll interval used while waiting for a decision.
    pub poll_interval_secs: u64,
    /// Tasks whose body mentions any of these words are routed through approval.
    pub sensitive_keywords: Vec<String>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60 * 60,
            poll_interval_secs: 5,
            sensitive_keywords: vec![
                "payment".to_string(),
                "invoice".to_string(),
                "approval".to_string(),
            ],
        }
    }
}

/// A remote service exposing tools over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EndpointConfig {
    /// Base URL, e.g. `http://localhost:8001`.
    pub url: String,
    /// Environment variable holding a bearer token.
    pub auth_env: Option<String>,
    pub timeout_secs: u64,
    /// Remote tools are sensitive unless explicitly marked otherwise.
    pub requires_approval: bool,
    /// Tool name -> request path.
    pub tools: BTreeMap<String, String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            auth_env: None,
            timeout_secs: 30,
            requires_approval: true,
            tools: BTreeMap::new(),
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            role: AgentRole::Local,
            poll_interval_secs: 30,
            engine: EngineConfig::default(),
            ralph: RalphConfig::default(),
            retry: RetryPolicy::default(),
            approval: ApprovalConfig::default(),
            endpoints: BTreeMap::new(),
        }
    }
}

impl VaultConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(anyhow!("poll_interval_secs must be > 0"));
        }
        if self.engine.command.is_empty() || self.engine.command[0].trim().is_empty() {
            return Err(anyhow!("engine.command must be a non-empty array"));
        }
        if self.engine.timeout_secs == 0 {
            return Err(anyhow!("engine.timeout_secs must be > 0"));
        }
        if self.engine.output_limit_bytes == 0 {
            return Err(anyhow!("engine.output_limit_bytes must be > 0"));
        }
        if self.engine.prompt_budget_bytes == 0 {
            return Err(anyhow!("engine.prompt_budget_bytes must be > 0"));
        }
        if self.ralph.max_iterations == 0 || self.ralph.max_iterations > HARD_MAX_ITERATIONS {
            return Err(anyhow!(
                "ralph.max_iterations must be between 1 and {HARD_MAX_ITERATIONS}"
            ));
        }
        if self.ralph.max_duration_secs == 0
            || self.ralph.max_duration_secs > HARD_MAX_DURATION.as_secs()
        {
            return Err(anyhow!(
                "ralph.max_duration_secs must be between 1 and {}",
                HARD_MAX_DURATION.as_secs()
            ));
        }
        let stop = self.ralph.emergency_stop_file.trim();
        if stop.is_empty() || stop.contains('/') || stop.contains('\\') {
            return Err(anyhow!(
                "ralph.emergency_stop_file must be a plain file name"
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(anyhow!("retry.base_delay_ms must be <= retry.max_delay_ms"));
        }
        if self.approval.timeout_secs == 0 || self.approval.poll_interval_secs == 0 {
            return Err(anyhow!(
                "approval.timeout_secs and approval.poll_interval_secs must be > 0"
            ));
        }
        for (name, endpoint) in &self.endpoints {
            if !(endpoint.url.starts_with("http://") || endpoint.url.starts_with("https://")) {
                return Err(anyhow!(
                    "endpoints.{name}.url must start with http:// or https://"
                ));
            }
            if endpoint.timeout_secs == 0 {
                return Err(anyhow!("endpoints.{name}.timeout_secs must be > 0"));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval.timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `VaultConfig::default()`.
pub fn load_config(path: &Path) -> Result<VaultConfig> {
    if !path.exists() {
        let cfg = VaultConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: VaultConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &VaultConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, VaultConfig::default());
    }

    #[test]
    fn write_then_load_round_trips_with_endpoints() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("vault.toml");
        let mut cfg = VaultConfig::default();
        cfg.endpoints.insert(
            "erp".to_string(),
            EndpointConfig {
                url: "http://localhost:8001".to_string(),
                auth_env: Some("ERP_TOKEN".to_string()),
                tools: BTreeMap::from([(
                    "create_invoice".to_string(),
                    "/create_invoice".to_string(),
                )]),
                ..EndpointConfig::default()
            },
        );
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("vault.toml");
        fs::write(&path, "role = \"cloud\"\n[ralph]\nmax_iterations = 5\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.role, AgentRole::Cloud);
        assert_eq!(cfg.ralph.max_iterations, 5);
        assert_eq!(cfg.ralph.emergency_stop_file, "EMERGENCY_STOP_RALPH");
        assert_eq!(cfg.approval.timeout_secs, 3600);
    }

    /// The iteration and wall-clock ceilings cannot be raised from the config file.
    #[test]
    fn hard_caps_cannot_be_raised() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("vault.toml");
        fs::write(&path, "[ralph]\nmax_iterations = 50\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("ralph.max_iterations"));

        fs::write(&path, "[ralph]\nmax_duration_secs = 86400\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("ralph.max_duration_secs"));
    }

    #[test]
    fn endpoint_url_must_be_http() {
        let mut cfg = VaultConfig::default();
        cfg.endpoints.insert(
            "erp".to_string(),
            EndpointConfig {
                url: "localhost:8001".to_string(),
                ..EndpointConfig::default()
            },
        );
        assert!(cfg.validate().is_err());
    }
}
