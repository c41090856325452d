//! Shell-idiom detection for model-requested commands.
//!
//! The sandbox never spawns a shell, so chaining, pipes, redirects,
//! substitution, `cd`, and inline environment assignments cannot work.
//! Rejecting them up front with a corrective message saves the model from
//! burning quota on commands that would fail anyway.

use regex::Regex;
use std::sync::OnceLock;

use crate::domain::error::SandboxError;

fn env_assign_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=\S+(\s|$)").expect("static regex"))
}

/// Inspect a raw command string for shell idioms. Returns the offending
/// construct descriptions, empty when the command is clean.
pub fn detect_shell_idioms(cmd: &str) -> Vec<&'static str> {
    let mut found = Vec::new();

    if cmd.contains("&&") || cmd.contains("||") || cmd.contains(';') {
        found.push("command chaining (&&, ||, ;)");
    }
    if cmd.replace("||", "").contains('|') {
        found.push("pipe (|)");
    }
    if cmd.contains('>') || cmd.contains('<') {
        found.push("redirect (>, <)");
    }
    if cmd.contains("$(") || cmd.contains('`') {
        found.push("command substitution");
    }
    if cmd.contains('\n') || cmd.contains('\r') {
        found.push("multi-line command");
    }
    let trimmed = cmd.trim_start();
    if trimmed == "cd" || trimmed.starts_with("cd ") {
        found.push("cd (commands run from repo root)");
    }
    if env_assign_re().is_match(trimmed) {
        found.push("inline environment assignment");
    }

    found
}

/// Validate a command string and split it into an argv vector.
///
/// On rejection the error carries a corrective message meant for the model:
/// what was wrong and how to phrase the request instead.
pub fn normalize_command(cmd: &str) -> Result<Vec<String>, SandboxError> {
    let idioms = detect_shell_idioms(cmd);
    if !idioms.is_empty() {
        return Err(SandboxError::ShellIdiomRejected(corrective_message(&idioms)));
    }

    let argv = shell_words::split(cmd)
        .map_err(|e| SandboxError::ShellIdiomRejected(format!("unparseable command: {}", e)))?;
    if argv.is_empty() {
        return Err(SandboxError::ShellIdiomRejected("empty command".to_string()));
    }
    Ok(argv)
}

fn corrective_message(idioms: &[&str]) -> String {
    format!(
        "Shell syntax detected: {}. Commands run without a shell. \
         Split compound workflows into separate tool requests, use explicit \
         paths instead of cd, and pass settings as flags rather than inline \
         env assignments. Commands run from the repo root.",
        idioms.join(", ")
    )
}
