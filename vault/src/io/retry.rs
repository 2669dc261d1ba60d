//! Retry and graceful-degradation wrappers for external calls.
//!
//! Every attempt made through [`with_retry`] is audited: successes, failed
//! attempts that will be retried (with the chosen delay), and the terminal
//! failure once retries are exhausted or the error is not transient.

use std::fmt::Display;
use std::thread;
use std::time::Instant;

use rand::{Rng, thread_rng};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::audit::{AuditAction, AuditActor, AuditLog};
use crate::core::backoff::RetryPolicy;
use crate::core::external::ExternalError;

/// What is being called, for the audit trail.
#[derive(Debug, Clone)]
pub struct CallSite {
    pub actor: AuditActor,
    pub action: AuditAction,
    pub details: Value,
    /// Never sleep past this instant; the failure becomes terminal instead.
    pub deadline: Option<Instant>,
}

impl CallSite {
    pub fn new(actor: AuditActor, action: AuditAction, details: Value) -> Self {
        Self {
            actor,
            action,
            details,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn details_with(&self, extra: Value) -> Value {
        let mut details = match &self.details {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("context".to_string(), other.clone());
                map
            }
        };
        if let Value::Object(extra) = extra {
            details.extend(extra);
        }
        Value::Object(details)
    }
}

/// Call `call` until it succeeds, fails non-transiently, or retries run out.
///
/// `call` receives the 0-based attempt number.
pub fn with_retry<T, F>(
    policy: &RetryPolicy,
    audit: &AuditLog,
    site: &CallSite,
    mut call: F,
) -> Result<T, ExternalError>
where
    F: FnMut(u32) -> Result<T, ExternalError>,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 0u32;
    loop {
        let started = Instant::now();
        let result = call(attempt);
        let duration_ms = started.elapsed().as_millis() as u64;

        let err = match result {
            Ok(value) => {
                audit.record_or_warn(
                    site.actor,
                    site.action,
                    true,
                    site.details_with(json!({
                        "attempt": attempt + 1,
                        "duration_ms": duration_ms,
                    })),
                    None,
                );
                return Ok(value);
            }
            Err(err) => err,
        };

        let delay = policy.delay_for(attempt, thread_rng().r#gen::<f64>());
        let out_of_attempts = attempt + 1 >= max_attempts;
        let past_deadline = site
            .deadline
            .is_some_and(|deadline| Instant::now() + delay >= deadline);

        if !err.is_transient() || out_of_attempts || past_deadline {
            audit.record_or_warn(
                site.actor,
                site.action,
                false,
                site.details_with(json!({
                    "attempt": attempt + 1,
                    "duration_ms": duration_ms,
                    "error_kind": err.kind(),
                    "terminal": true,
                })),
                Some(&err.to_string()),
            );
            warn!(
                actor = %site.actor,
                action = %site.action,
                attempts = attempt + 1,
                kind = err.kind(),
                "external call failed"
            );
            return Err(err);
        }

        audit.record_or_warn(
            site.actor,
            site.action,
            false,
            site.details_with(json!({
                "attempt": attempt + 1,
                "duration_ms": duration_ms,
                "error_kind": err.kind(),
                "retry_delay_ms": delay.as_millis() as u64,
            })),
            Some(&err.to_string()),
        );
        debug!(
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            kind = err.kind(),
            "transient failure, retrying"
        );
        thread::sleep(delay);
        attempt += 1;
    }
}

/// Run `primary`; on failure hand the error to `fallback` instead of propagating it.
pub fn with_fallback<T, E, P, F>(primary: P, fallback: F) -> anyhow::Result<T>
where
    E: Display,
    P: FnOnce() -> Result<T, E>,
    F: FnOnce(E) -> anyhow::Result<T>,
{
    match primary() {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!(err = %err, "primary path failed, using fallback");
            fallback(err)
        }
    }
}

/// Zero-delay policy for tests that must not sleep.
#[cfg(any(test, feature = "test-support"))]
pub fn immediate(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay_ms: 0,
        max_delay_ms: 0,
    }
}
