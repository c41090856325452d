//! Strict validation of model output.
//!
//! The model must reply with a JSON object whose `mode` is one of
//! `tool_request`, `patch`, or `feature_summary`. Anything else becomes a
//! synthetic `sandbox.list_tree` request with a corrective explanation so
//! one malformed reply costs a step instead of the run.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::domain::models::{
    CompletionStatus, ModelReply, RunMode, ToolRequest, ValidatedReply,
};
use crate::services::command_guard;

const CONTRACT_REMINDER: &str =
    "Reply with a single JSON object: {\"mode\": \"tool_request\", \"requests\": \
     [{\"tool\": ..., \"args\": {...}}], \"why\": ...} or {\"mode\": \"patch\", \
     \"diff\": <unified diff>, \"why\": ...} or, in feature mode, {\"mode\": \
     \"feature_summary\", \"summary\": ..., \"completion_status\": ...}.";

/// Tools the model is allowed to name.
const KNOWN_TOOLS: [&str; 4] =
    ["sandbox.list_tree", "sandbox.read_file", "sandbox.grep", "sandbox.run"];

fn diff_hunk_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^@@ -\d+(?:,\d+)? \+\d+(?:,\d+)? @@").expect("static regex")
    })
}

fn diff_file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^(--- a/|\+\+\+ b/|diff --git a/)").expect("static regex"))
}

/// Validate raw model text into an actionable reply.
pub fn validate_model_output(raw: &str, mode: RunMode) -> ValidatedReply {
    let data: Value = match serde_json::from_str(raw.trim()) {
        Ok(v) => v,
        Err(e) => return fallback(format!("reply was not valid JSON: {}", e)),
    };

    let Some(obj) = data.as_object() else {
        return fallback("reply must be a JSON object".to_string());
    };

    match obj.get("mode").and_then(Value::as_str) {
        Some("tool_request") => validate_tool_request(obj),
        Some("patch") => validate_patch(obj),
        Some("feature_summary") => {
            if mode == RunMode::Feature {
                validate_feature_summary(obj)
            } else {
                fallback("feature_summary is only valid in feature mode".to_string())
            }
        }
        Some(other) => fallback(format!("unknown mode: {}", other)),
        None => fallback("missing 'mode' field".to_string()),
    }
}

fn validate_tool_request(obj: &serde_json::Map<String, Value>) -> ValidatedReply {
    let why = obj.get("why").and_then(Value::as_str).unwrap_or("").to_string();
    let Some(raw_requests) = obj.get("requests").and_then(Value::as_array) else {
        return fallback("tool_request requires a 'requests' array".to_string());
    };
    if raw_requests.is_empty() {
        return fallback("'requests' cannot be empty".to_string());
    }

    let mut requests = Vec::new();
    let mut rejected = Vec::new();

    for (index, raw) in raw_requests.iter().enumerate() {
        match parse_single_request(raw) {
            Ok(request) => requests.push(request),
            Err(reason) => rejected.push(format!("request {}: {}", index, reason)),
        }
    }

    if requests.is_empty() {
        let detail = rejected.join("; ");
        return fallback(format!("every request was malformed ({})", detail));
    }

    ValidatedReply {
        reply: ModelReply::ToolRequests { requests, why },
        corrective: None,
        rejected_requests: rejected,
    }
}

/// Parse one request, checking tool name and (for sandbox.run) the command
/// string against the shell-idiom rules. Bad requests are dropped
/// individually; the batch survives.
fn parse_single_request(raw: &Value) -> Result<ToolRequest, String> {
    let Some(obj) = raw.as_object() else {
        return Err("must be an object".to_string());
    };
    let Some(tool) = obj.get("tool").and_then(Value::as_str) else {
        return Err("missing 'tool' field".to_string());
    };
    if !KNOWN_TOOLS.contains(&tool) {
        return Err(format!("unknown tool '{}'", tool));
    }

    let args = obj
        .get("args")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if tool == "sandbox.run" {
        let Some(cmd) = args.get("cmd").and_then(Value::as_str) else {
            return Err("sandbox.run requires a string 'cmd'".to_string());
        };
        if let Err(e) = command_guard::normalize_command(cmd) {
            return Err(e.to_string());
        }
    }

    Ok(ToolRequest { tool: tool.to_string(), args })
}

fn validate_patch(obj: &serde_json::Map<String, Value>) -> ValidatedReply {
    let why = obj.get("why").and_then(Value::as_str).unwrap_or("").to_string();
    let diff = obj.get("diff").and_then(Value::as_str).unwrap_or("");

    if diff.trim().is_empty() {
        return fallback("patch diff cannot be empty".to_string());
    }
    if let Err(reason) = check_unified_diff(diff) {
        return fallback(format!("invalid diff: {}", reason));
    }

    ValidatedReply::clean(ModelReply::Patch { diff: diff.to_string(), why })
}

fn validate_feature_summary(obj: &serde_json::Map<String, Value>) -> ValidatedReply {
    let summary = obj.get("summary").and_then(Value::as_str).unwrap_or("").trim().to_string();
    if summary.len() < 20 {
        return fallback("feature summary must be at least 20 characters".to_string());
    }

    let raw_status = obj.get("completion_status").and_then(Value::as_str).unwrap_or("");
    let Some(status) = CompletionStatus::parse(raw_status) else {
        return fallback(format!(
            "invalid completion_status '{}': expected complete|partial|blocked|in_progress",
            raw_status
        ));
    };

    ValidatedReply::clean(ModelReply::FeatureSummary { summary, status })
}

/// Shape check for a unified diff: must carry file markers or hunks and no
/// markdown fencing.
fn check_unified_diff(diff: &str) -> Result<(), String> {
    let lines: Vec<&str> = diff.trim().lines().collect();
    if lines.len() < 2 {
        return Err("too short".to_string());
    }
    for line in &lines {
        if line.starts_with("```") {
            return Err("markdown fence in diff".to_string());
        }
    }
    if !diff_file_re().is_match(diff) && !diff_hunk_re().is_match(diff) {
        return Err("missing file markers or hunks".to_string());
    }
    Ok(())
}

/// The corrective fallback: a synthetic list_tree request plus the contract
/// reminder, keeping the run alive for one more turn.
fn fallback(error: String) -> ValidatedReply {
    let request = ToolRequest {
        tool: "sandbox.list_tree".to_string(),
        args: serde_json::Map::new(),
    };
    ValidatedReply {
        reply: ModelReply::ToolRequests {
            requests: vec![request],
            why: format!("{} {}", error, CONTRACT_REMINDER),
        },
        corrective: Some(error),
        rejected_requests: Vec::new(),
    }
}
