//! Tool requests and the observation buffer.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

/// Maximum characters kept in the observation buffer before FIFO eviction.
pub const OBSERVATION_BUFFER_CAP: usize = 50_000;

/// Maximum characters of stdout kept per observation.
pub const OBSERVATION_STDOUT_CAP: usize = 500;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Map<String, Value>,
}

impl ToolRequest {
    /// Deterministic MD5 signature over the tool name and canonicalized
    /// arguments (sorted keys, whitespace-normalized scalar rendering).
    /// Two requests with the same signature are the same request.
    pub fn signature(&self) -> String {
        let mut parts = vec![self.tool.clone()];
        let mut keys: Vec<&String> = self.args.keys().collect();
        keys.sort();
        for key in keys {
            let value = &self.args[key];
            let rendered = match value {
                Value::String(s) => s.split_whitespace().collect::<Vec<_>>().join(" "),
                other => other.to_string(),
            };
            parts.push(format!("{}:{}", key, rendered));
        }
        let mut hasher = Md5::new();
        hasher.update(parts.join("|").as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    /// A short rendering of the arguments for observations and logs.
    pub fn args_digest(&self) -> String {
        let mut keys: Vec<&String> = self.args.keys().collect();
        keys.sort();
        let rendered: Vec<String> = keys
            .iter()
            .map(|k| {
                let v = self.args[*k].to_string();
                let clipped = if v.chars().count() > 80 {
                    format!("{}...", v.chars().take(80).collect::<String>())
                } else {
                    v
                };
                format!("{}={}", k, clipped)
            })
            .collect();
        rendered.join(" ")
    }
}

/// A summary of one tool execution, appended to the model's context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub tool: String,
    pub args_digest: String,
    pub exit_code: Option<i32>,
    pub stdout_prefix: String,
}

impl Observation {
    pub fn new(tool: &str, args_digest: String, exit_code: Option<i32>, stdout: &str) -> Self {
        let stdout_prefix = truncate_chars(stdout, OBSERVATION_STDOUT_CAP);
        Self {
            tool: tool.to_string(),
            args_digest,
            exit_code,
            stdout_prefix,
        }
    }

    /// A synthetic observation with no subprocess behind it (rejections,
    /// corrective messages).
    pub fn note(tool: &str, message: &str) -> Self {
        Self {
            tool: tool.to_string(),
            args_digest: String::new(),
            exit_code: None,
            stdout_prefix: truncate_chars(message, OBSERVATION_STDOUT_CAP),
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!("Tool: {}\n", self.tool);
        if !self.args_digest.is_empty() {
            out.push_str(&format!("Args: {}\n", self.args_digest));
        }
        if let Some(code) = self.exit_code {
            out.push_str(&format!("Exit: {}\n", code));
        }
        if !self.stdout_prefix.is_empty() {
            out.push_str(&format!("Output: {}\n", self.stdout_prefix));
        }
        out
    }
}

/// Bounded FIFO buffer of rendered observations fed into every prompt.
#[derive(Debug, Default)]
pub struct ObservationBuffer {
    entries: VecDeque<String>,
    total_chars: usize,
}

impl ObservationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observation, evicting the oldest entries once the buffer
    /// exceeds its character budget.
    pub fn push(&mut self, obs: &Observation) {
        let rendered = obs.render();
        self.total_chars += rendered.len();
        self.entries.push_back(rendered);
        while self.total_chars > OBSERVATION_BUFFER_CAP {
            match self.entries.pop_front() {
                Some(evicted) => self.total_chars -= evicted.len(),
                None => break,
            }
        }
    }

    pub fn as_text(&self) -> String {
        self.entries.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len_chars(&self) -> usize {
        self.total_chars
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(tool: &str, args: Value) -> ToolRequest {
        ToolRequest {
            tool: tool.to_string(),
            args: args.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn signature_ignores_key_order() {
        let a = request("sandbox.grep", json!({"query": "foo", "max_matches": 10}));
        let b = request("sandbox.grep", json!({"max_matches": 10, "query": "foo"}));
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn signature_normalizes_whitespace_in_strings() {
        let a = request("sandbox.run", json!({"cmd": "pytest   -q"}));
        let b = request("sandbox.run", json!({"cmd": "pytest -q"}));
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn signature_distinguishes_tools_and_args() {
        let a = request("sandbox.grep", json!({"query": "foo"}));
        let b = request("sandbox.grep", json!({"query": "bar"}));
        let c = request("sandbox.read_file", json!({"query": "foo"}));
        assert_ne!(a.signature(), b.signature());
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn signature_is_md5_hex() {
        let sig = request("sandbox.list_tree", json!({})).signature();
        assert_eq!(sig.len(), 32);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn observation_truncates_stdout() {
        let long = "x".repeat(2000);
        let obs = Observation::new("sandbox.run", "cmd=ls".into(), Some(0), &long);
        assert_eq!(obs.stdout_prefix.chars().count(), OBSERVATION_STDOUT_CAP);
    }

    #[test]
    fn buffer_evicts_fifo() {
        let mut buf = ObservationBuffer::new();
        let big = "y".repeat(400);
        for i in 0..200 {
            buf.push(&Observation::new(&format!("tool{}", i), String::new(), Some(0), &big));
        }
        assert!(buf.len_chars() <= OBSERVATION_BUFFER_CAP);
        let text = buf.as_text();
        // Oldest entries evicted, newest retained
        assert!(!text.contains("tool0\n"));
        assert!(text.contains("tool199"));
    }

    #[test]
    fn buffer_renders_in_insertion_order() {
        let mut buf = ObservationBuffer::new();
        buf.push(&Observation::note("first", "a"));
        buf.push(&Observation::note("second", "b"));
        let text = buf.as_text();
        let first = text.find("first").unwrap();
        let second = text.find("second").unwrap();
        assert!(first < second);
    }
}
