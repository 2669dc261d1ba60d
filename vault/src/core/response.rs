//! Parsing of structured Ralph responses from free-form engine output.
//!
//! The engine is asked for a bare JSON object but often wraps it in prose or a
//! code fence. Parsing tries the whole output first, then embedded candidates.
//! Anything that still fails validation is reported as unparseable and the
//! caller escalates to a human.

use std::sync::LazyLock;

use jsonschema::validator_for;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use super::types::EngineResponse;

const RESPONSE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/ralph_response.schema.json"
));

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseMode {
    /// The whole output was a valid response object.
    Strict,
    /// A response object was recovered from surrounding text.
    Fallback,
    /// No valid response could be recovered.
    Unparseable,
}

impl ParseMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ParseMode::Strict => "strict",
            ParseMode::Fallback => "fallback",
            ParseMode::Unparseable => "unparseable",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub response: EngineResponse,
    pub mode: ParseMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponseError {
    #[error("engine output contains no JSON object")]
    NoJson,
    #[error("engine response failed validation: {0}")]
    Invalid(String),
}

/// Parse engine output into an [`EngineResponse`].
pub fn parse_engine_response(raw: &str) -> Result<ParsedResponse, ResponseError> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && value.is_object()
    {
        return validate(value).map(|response| ParsedResponse {
            response,
            mode: ParseMode::Strict,
        });
    }

    let mut last_err = ResponseError::NoJson;
    for candidate in embedded_candidates(trimmed) {
        let Ok(value) = serde_json::from_str::<Value>(&candidate) else {
            continue;
        };
        if !value.is_object() {
            continue;
        }
        match validate(value) {
            Ok(response) => {
                return Ok(ParsedResponse {
                    response,
                    mode: ParseMode::Fallback,
                });
            }
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

fn validate(mut value: Value) -> Result<EngineResponse, ResponseError> {
    normalize(&mut value);
    let schema: Value = serde_json::from_str(RESPONSE_SCHEMA)
        .map_err(|err| ResponseError::Invalid(format!("response schema: {err}")))?;
    let compiled = validator_for(&schema)
        .map_err(|err| ResponseError::Invalid(format!("response schema: {err}")))?;
    if !compiled.is_valid(&value) {
        let messages = compiled
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(ResponseError::Invalid(messages.join("; ")));
    }
    serde_json::from_value(value).map_err(|err| ResponseError::Invalid(err.to_string()))
}

/// Accept `done`, `needs human`, `needs-human`; default missing lists and thoughts.
fn normalize(value: &mut Value) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };
    if let Some(Value::String(action)) = obj.get_mut("next_action") {
        *action = action
            .trim()
            .to_ascii_uppercase()
            .replace([' ', '-'], "_");
    }
    if matches!(obj.get("thought"), Some(Value::Null)) {
        obj.remove("thought");
    }
    if matches!(obj.get("tool_calls"), Some(Value::Null)) {
        obj.remove("tool_calls");
    }
}

/// Candidate JSON snippets in priority order: fenced blocks, greedy braces, balanced objects.
fn embedded_candidates(text: &str) -> Vec<String> {
    static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").expect("valid fence regex")
    });
    static GREEDY_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid brace regex"));

    let mut out = Vec::new();
    for caps in FENCE_RE.captures_iter(text) {
        if let Some(m) = caps.get(1) {
            out.push(m.as_str().to_string());
        }
    }
    if let Some(m) = GREEDY_RE.find(text) {
        out.push(m.as_str().to_string());
    }
    out.extend(balanced_objects(text));
    out.dedup();
    out
}

/// Top-level `{...}` spans with balanced braces, ignoring braces inside strings.
fn balanced_objects(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0
                    && let Some(s) = start.take()
                {
                    out.push(text[s..=idx].to_string());
                }
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::NextAction;

    #[test]
    fn strict_json_parses() {
        let raw = r#"{"thought":"t","tool_calls":[{"name":"read_file","arguments":{"path":"Plans/x.md"}}],"next_action":"CONTINUE"}"#;
        let parsed = parse_engine_response(raw).expect("parse");
        assert_eq!(parsed.mode, ParseMode::Strict);
        assert_eq!(parsed.response.next_action, NextAction::Continue);
        assert_eq!(parsed.response.tool_calls.len(), 1);
        assert_eq!(parsed.response.tool_calls[0].name, "read_file");
    }

    #[test]
    fn fenced_json_inside_prose_is_recovered() {
        let raw = "Here is my answer:\n```json\n{\"thought\": \"all good\", \"next_action\": \"done\"}\n```\nThanks!";
        let parsed = parse_engine_response(raw).expect("parse");
        assert_eq!(parsed.mode, ParseMode::Fallback);
        assert_eq!(parsed.response.next_action, NextAction::Done);
        assert!(parsed.response.tool_calls.is_empty());
    }

    /// Two objects in one reply defeat the greedy match; the balanced scan still finds the valid one.
    #[test]
    fn balanced_scan_handles_multiple_objects() {
        let raw = r#"Context {"note": "ignore me"} then {"thought": "x } y", "next_action": "needs human"}"#;
        let parsed = parse_engine_response(raw).expect("parse");
        assert_eq!(parsed.response.next_action, NextAction::NeedsHuman);
        assert_eq!(parsed.response.thought, "x } y");
    }

    #[test]
    fn prose_without_json_is_unparseable() {
        let err = parse_engine_response("I think we are done here.").unwrap_err();
        assert_eq!(err, ResponseError::NoJson);
    }

    #[test]
    fn unknown_next_action_is_invalid() {
        let err = parse_engine_response(r#"{"thought":"x","next_action":"MAYBE"}"#).unwrap_err();
        assert!(matches!(err, ResponseError::Invalid(_)));
    }

    #[test]
    fn missing_next_action_is_invalid() {
        let err = parse_engine_response(r#"{"thought":"x","tool_calls":[]}"#).unwrap_err();
        assert!(matches!(err, ResponseError::Invalid(_)));
    }
}
