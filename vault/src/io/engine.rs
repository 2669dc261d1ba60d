//! Reasoning engine abstraction.
//!
//! The [`ReasoningEngine`] trait decouples task processing from the actual
//! LLM backend (an external CLI such as `claude -p`). Tests use scripted
//! engines that return predetermined replies without spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::config::EngineConfig;
use super::process::run_command_with_timeout;
use crate::core::external::{ExternalError, classify_failure_text};

/// One prompt sent to the engine.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    /// Task the request is made for; used in logs and audit details.
    pub task: String,
    pub prompt: String,
    pub timeout: Duration,
}

/// Abstraction over reasoning engine backends.
pub trait ReasoningEngine {
    /// Send the prompt and return the raw reply text.
    fn complete(&self, request: &EngineRequest) -> Result<String, ExternalError>;
}

impl<E: ReasoningEngine + ?Sized> ReasoningEngine for &E {
    fn complete(&self, request: &EngineRequest) -> Result<String, ExternalError> {
        (**self).complete(request)
    }
}

/// Engine that spawns a CLI and writes the prompt to its stdin.
#[derive(Debug, Clone)]
pub struct CliEngine {
    command: Vec<String>,
    workdir: PathBuf,
    output_limit_bytes: usize,
}

impl CliEngine {
    pub fn new(command: Vec<String>, workdir: impl Into<PathBuf>, output_limit_bytes: usize) -> Self {
        Self {
            command,
            workdir: workdir.into(),
            output_limit_bytes,
        }
    }

    pub fn from_config(config: &EngineConfig, workdir: impl Into<PathBuf>) -> Self {
        Self::new(config.command.clone(), workdir, config.output_limit_bytes)
    }
}

impl ReasoningEngine for CliEngine {
    #[instrument(skip_all, fields(task = %request.task, timeout_secs = request.timeout.as_secs()))]
    fn complete(&self, request: &EngineRequest) -> Result<String, ExternalError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(ExternalError::Other("engine command is empty".to_string()));
        };
        info!(program = %program, "invoking reasoning engine");

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
        )
        .map_err(|err| ExternalError::Other(format!("run {program}: {err:#}")))?;

        if output.timed_out {
            warn!("reasoning engine timed out");
            return Err(ExternalError::Timeout(request.timeout));
        }
        if !output.status.success() {
            let err = classify_failure_text(&output.failure_text());
            warn!(exit_code = ?output.status.code(), kind = err.kind(), "reasoning engine failed");
            return Err(err);
        }

        let reply = output.stdout_text();
        if reply.trim().is_empty() {
            return Err(ExternalError::Other(
                "reasoning engine returned an empty reply".to_string(),
            ));
        }
        if let Some(err) = error_banner(&reply) {
            warn!(kind = err.kind(), "reasoning engine replied with an error banner");
            return Err(err);
        }
        debug!(bytes = reply.len(), "reasoning engine replied");
        Ok(reply)
    }
}

/// Some CLIs exit 0 but print a one-line account error instead of an answer.
fn error_banner(reply: &str) -> Option<ExternalError> {
    const BANNERS: &[&str] = &[
        "credit balance is too low",
        "invalid api key",
        "please run /login",
        "usage limit reached",
    ];
    let trimmed = reply.trim();
    if trimmed.len() > 200 {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    if BANNERS.iter().any(|b| lower.contains(b)) {
        return Some(classify_failure_text(trimmed));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> EngineRequest {
        EngineRequest {
            task: "t.md".to_string(),
            prompt: "plan this".to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    fn sh_engine(script: &str) -> CliEngine {
        let temp = std::env::temp_dir();
        CliEngine::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            temp,
            10_000,
        )
    }

    #[cfg(unix)]
    #[test]
    fn cli_engine_returns_stdout() {
        let reply = sh_engine("read line; echo \"plan for: $line\"")
            .complete(&request())
            .expect("reply");
        assert_eq!(reply.trim(), "plan for: plan this");
    }

    #[cfg(unix)]
    #[test]
    fn cli_engine_classifies_rate_limit_exit() {
        let err = sh_engine("echo 'Error: 429 rate limit exceeded' >&2; exit 1")
            .complete(&request())
            .unwrap_err();
        assert!(matches!(err, ExternalError::RateLimited(_)));
        assert!(err.is_transient());
    }

    #[cfg(unix)]
    #[test]
    fn cli_engine_reports_timeout() {
        let mut req = request();
        req.timeout = Duration::from_millis(200);
        let err = sh_engine("sleep 5").complete(&req).unwrap_err();
        assert_eq!(err, ExternalError::Timeout(Duration::from_millis(200)));
    }

    #[test]
    fn banner_on_success_is_an_error() {
        assert!(matches!(
            error_banner("Credit balance is too low"),
            Some(ExternalError::Quota(_))
        ));
        assert!(matches!(
            error_banner("Invalid API key · Please run /login"),
            Some(ExternalError::Auth(_))
        ));
        assert_eq!(error_banner("# Plan\n\n1. Send the invoice"), None);
    }

    #[test]
    fn missing_binary_is_not_transient() {
        let engine = CliEngine::new(
            vec!["definitely-not-a-real-engine-binary".to_string()],
            std::env::temp_dir(),
            1_000,
        );
        let err = engine.complete(&request()).unwrap_err();
        assert!(matches!(err, ExternalError::Other(_)));
        assert!(!err.is_transient());
    }
}
