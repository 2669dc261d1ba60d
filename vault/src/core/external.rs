//! Failure taxonomy for calls that leave the process (reasoning engine, remote tools).

use std::time::Duration;

use thiserror::Error;

/// Failure of a single external call, classified so callers can decide on retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExternalError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("quota exhausted: {0}")]
    Quota(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("{0}")]
    Other(String),
}

impl ExternalError {
    /// Transient failures are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExternalError::RateLimited(_)
                | ExternalError::Server { .. }
                | ExternalError::Unavailable(_)
                | ExternalError::Network(_)
                | ExternalError::Timeout(_)
        )
    }

    /// Failures that mean the target service is down rather than wrong.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ExternalError::Unavailable(_) | ExternalError::Network(_) | ExternalError::Timeout(_)
        )
    }

    /// Short stable identifier used in audit details and plan documents.
    pub fn kind(&self) -> &'static str {
        match self {
            ExternalError::RateLimited(_) => "rate_limited",
            ExternalError::Server { .. } => "server_error",
            ExternalError::Unavailable(_) => "unavailable",
            ExternalError::Network(_) => "network",
            ExternalError::Timeout(_) => "timeout",
            ExternalError::Auth(_) => "auth",
            ExternalError::Quota(_) => "quota",
            ExternalError::Rejected(_) => "rejected",
            ExternalError::UnknownTool(_) => "unknown_tool",
            ExternalError::Other(_) => "other",
        }
    }

    /// Human-facing next steps written into error plans.
    pub fn remediation(&self) -> &'static [&'static str] {
        match self {
            ExternalError::Auth(_) => &[
                "Re-authenticate the reasoning engine CLI (e.g. run its login command).",
                "Check that API keys referenced in vault.toml are exported.",
            ],
            ExternalError::Quota(_) => &[
                "Check the account's usage limits or billing status.",
                "Re-queue the task once quota is restored.",
            ],
            ExternalError::RateLimited(_) => &[
                "Wait for the rate limit window to pass.",
                "Lower the polling frequency or the number of concurrent agents.",
            ],
            ExternalError::UnknownTool(_) => &[
                "Register the tool or add it to an endpoint's tools table in vault.toml.",
            ],
            ExternalError::Server { .. }
            | ExternalError::Unavailable(_)
            | ExternalError::Network(_)
            | ExternalError::Timeout(_) => &[
                "Check connectivity to the service.",
                "Re-queue the task by moving it back to Needs_Action once the service is healthy.",
            ],
            ExternalError::Rejected(_) | ExternalError::Other(_) => &[
                "Review the error details and the task content.",
                "Fix the task and move it back to Needs_Action to retry.",
            ],
        }
    }
}

/// Classify free-form failure output (CLI stderr, error bodies) into an [`ExternalError`].
pub fn classify_failure_text(text: &str) -> ExternalError {
    let lower = text.to_ascii_lowercase();
    let message = first_line(text);
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["rate limit", "rate_limit", "429", "too many requests"]) {
        return ExternalError::RateLimited(message);
    }
    if has(&["quota", "credit balance", "insufficient credit", "billing"]) {
        return ExternalError::Quota(message);
    }
    if has(&[
        "unauthorized",
        "authentication",
        "invalid api key",
        "api key",
        "401",
        "403",
        "forbidden",
        "please run /login",
        "not logged in",
    ]) {
        return ExternalError::Auth(message);
    }
    if has(&[
        "temporarily unavailable",
        "service unavailable",
        "503",
        "502",
        "504",
        "overloaded",
        "529",
    ]) {
        return ExternalError::Unavailable(message);
    }
    if has(&["500", "internal server error"]) {
        return ExternalError::Server {
            status: 500,
            message,
        };
    }
    if has(&["connection", "network", "dns", "econnreset", "broken pipe"]) {
        return ExternalError::Network(message);
    }
    if has(&["timed out", "timeout"]) {
        return ExternalError::Network(message);
    }
    ExternalError::Other(message)
}

/// Classify a non-success HTTP status from a remote tool endpoint.
pub fn classify_http_status(status: u16, body: &str) -> ExternalError {
    let message = if body.trim().is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", first_line(body))
    };
    match status {
        429 => ExternalError::RateLimited(message),
        401 | 403 => ExternalError::Auth(message),
        402 => ExternalError::Quota(message),
        502..=504 => ExternalError::Unavailable(message),
        500..=599 => ExternalError::Server { status, message },
        _ => ExternalError::Rejected(message),
    }
}

fn first_line(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no error output");
    let mut out: String = line.chars().take(300).collect();
    if line.chars().count() > 300 {
        out.push_str("...");
    }
    out
}
