//! Verification results and error fingerprinting.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Which predicate produced a [`VerifyResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Tests,
    Command,
}

/// Structured outcome of one verification command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResult {
    pub ok: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Failing test identifiers in runner output order.
    pub failing_tests: Vec<String>,
    /// Stable 64-hex-char fingerprint of the failure output.
    pub fingerprint: String,
    pub predicate: Predicate,
    /// True when the runner collected no tests and the caller allowed that
    /// (feature-mode early stages).
    pub skipped: bool,
}

impl VerifyResult {
    /// A result for a command the sandbox never ran (rejection path).
    pub fn not_run(reason: String) -> Self {
        Self {
            ok: false,
            exit_code: 1,
            stdout: String::new(),
            stderr: reason,
            failing_tests: Vec::new(),
            fingerprint: error_fingerprint("", ""),
            predicate: Predicate::Command,
            skipped: false,
        }
    }

    pub fn combined_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Compute the stable fingerprint of a failure.
///
/// The fingerprint is the SHA-256 of the last five lines of the combined
/// stdout+stderr that mention "error" (case-insensitive), joined with
/// newlines. When no such lines exist it is the SHA-256 of the empty
/// string. This keeps the value stable across runs that fail the same way
/// while paths and line numbers drift.
pub fn error_fingerprint(stdout: &str, stderr: &str) -> String {
    let combined = format!("{}\n{}", stdout, stderr);
    let error_lines: Vec<&str> = combined
        .lines()
        .filter(|line| line.to_ascii_lowercase().contains("error"))
        .collect();
    let tail_start = error_lines.len().saturating_sub(5);
    let blob = error_lines[tail_start..].join("\n");

    let mut hasher = Sha256::new();
    hasher.update(blob.as_bytes());
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
