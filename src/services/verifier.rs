//! Test execution and result parsing.
//!
//! Runs a verification command in the sandbox (or a worktree view) and
//! turns the raw output into a [`VerifyResult`]: pass/fail, failing test
//! identifiers, and the stable error fingerprint.

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

use crate::domain::models::{error_fingerprint, Predicate, VerifyResult};
use crate::infrastructure::sandbox::{ExecResult, Sandbox, WorktreeView};
use crate::services::command_guard;

/// Default timeout for focused verification commands.
pub const FOCUS_TIMEOUT: Duration = Duration::from_secs(90);

/// Default timeout for full test runs.
pub const FULL_TIMEOUT: Duration = Duration::from_secs(180);

fn pytest_failed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^FAILED\s+(\S+)").expect("static regex"))
}

/// Signals in runner output that mean "no tests exist here yet".
const NO_TESTS_SIGNALS: [&str; 5] = [
    "no tests ran",
    "no test",
    "collected 0 items",
    "cannot find",
    "does not exist",
];

/// Extract failing test identifiers from pytest-style output
/// (`FAILED path::name` lines), capped at 20.
pub fn parse_failing_tests(output: &str) -> Vec<String> {
    pytest_failed_re()
        .captures_iter(output)
        .take(20)
        .map(|c| c[1].to_string())
        .collect()
}

/// First failing test identifier reduced to its file path.
pub fn failing_test_file(failing: &[String]) -> Option<String> {
    let first = failing.first()?;
    Some(first.split("::").next().unwrap_or(first).trim().to_string())
}

fn assemble(exec: ExecResult, predicate: Predicate, allow_skip: bool) -> VerifyResult {
    let combined = format!("{}\n{}", exec.stdout, exec.stderr);

    if allow_skip && !exec.ok {
        let lower = combined.to_ascii_lowercase();
        if NO_TESTS_SIGNALS.iter().any(|sig| lower.contains(sig)) {
            return VerifyResult {
                ok: true,
                exit_code: 0,
                stdout: exec.stdout,
                stderr: exec.stderr,
                failing_tests: Vec::new(),
                fingerprint: error_fingerprint("", ""),
                predicate,
                skipped: true,
            };
        }
    }

    let failing_tests = match predicate {
        Predicate::Tests => parse_failing_tests(&combined),
        Predicate::Command => Vec::new(),
    };
    let fingerprint = error_fingerprint(&exec.stdout, &exec.stderr);
    let ok = exec.ok && failing_tests.is_empty();

    VerifyResult {
        ok,
        exit_code: exec.exit_code,
        stdout: exec.stdout,
        stderr: exec.stderr,
        failing_tests,
        fingerprint,
        predicate,
        skipped: false,
    }
}

/// Run a verification command in the primary working copy.
///
/// Commands that fail the shell-idiom or allowlist gates come back as
/// failed [`VerifyResult`]s carrying the rejection text, so callers treat
/// "could not run" and "ran and failed" uniformly.
pub async fn run_verify(
    sandbox: &Sandbox,
    cmd: &str,
    predicate: Predicate,
    timeout: Duration,
    allow_skip: bool,
) -> VerifyResult {
    let argv = match command_guard::normalize_command(cmd) {
        Ok(argv) => argv,
        Err(e) => return VerifyResult::not_run(e.to_string()),
    };
    match sandbox.run(&argv, timeout).await {
        Ok(exec) => assemble(exec, predicate, allow_skip),
        Err(e) => VerifyResult::not_run(e.to_string()),
    }
}

/// Run a verification command inside a candidate worktree.
pub async fn run_verify_in_worktree(
    worktree: &WorktreeView,
    cmd: &str,
    predicate: Predicate,
    timeout: Duration,
) -> VerifyResult {
    let argv = match command_guard::normalize_command(cmd) {
        Ok(argv) => argv,
        Err(e) => return VerifyResult::not_run(e.to_string()),
    };
    match worktree.run(&argv, timeout).await {
        Ok(exec) => assemble(exec, predicate, false),
        Err(e) => VerifyResult::not_run(e.to_string()),
    }
}
