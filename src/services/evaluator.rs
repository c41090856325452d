//! Parallel candidate evaluation.
//!
//! Each candidate gets a private detached worktree off the current HEAD:
//! apply the diff, run the focused command, run the full command, report a
//! complete [`VerifyResult`]. Workers share nothing with the loop and
//! destroy their worktree on every exit path, including cancellation.
//!
//! First passing candidate wins. When several finish passing in the same
//! drain, the lowest temperature index is selected to bias toward
//! determinism.

use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::domain::models::{CandidateStatus, PatchCandidate, Predicate, VerifyResult};
use crate::infrastructure::sandbox::Sandbox;
use crate::services::verifier;

/// One candidate's evaluation outcome.
#[derive(Debug, Clone)]
pub struct EvaluatedCandidate {
    pub candidate: PatchCandidate,
    pub verify: VerifyResult,
}

/// Result of an evaluation round.
#[derive(Debug)]
pub struct EvalOutcome {
    /// The selected passing candidate, when any passed.
    pub winner: Option<EvaluatedCandidate>,
    /// Every completed evaluation, for the loser report and event log.
    pub reports: Vec<EvaluatedCandidate>,
}

impl EvalOutcome {
    /// Best loser by ascending failing-test count; used for logging when
    /// nothing passed.
    pub fn best_loser(&self) -> Option<&EvaluatedCandidate> {
        self.reports
            .iter()
            .filter(|r| !r.verify.ok)
            .min_by_key(|r| r.verify.failing_tests.len())
    }
}

/// Evaluate candidates concurrently, one worktree each.
///
/// Concurrency equals the candidate count (bounded upstream by the
/// temperature list). Outstanding workers are cancelled once a winner is
/// known; in-flight subprocesses finish but their results are discarded.
#[instrument(skip_all, fields(candidates = candidates.len()))]
pub async fn evaluate_candidates(
    sandbox: &Sandbox,
    candidates: Vec<PatchCandidate>,
    focus_cmd: Option<String>,
    full_cmd: String,
    timeout: Duration,
) -> EvalOutcome {
    if candidates.is_empty() {
        return EvalOutcome { winner: None, reports: Vec::new() };
    }

    let cancel = CancellationToken::new();
    let mut join_set: JoinSet<EvaluatedCandidate> = JoinSet::new();

    for candidate in candidates {
        let sandbox = sandbox.clone();
        let focus_cmd = focus_cmd.clone();
        let full_cmd = full_cmd.clone();
        let token = cancel.clone();
        join_set.spawn(async move {
            evaluate_one(&sandbox, candidate, focus_cmd.as_deref(), &full_cmd, timeout, token)
                .await
        });
    }

    let mut reports = Vec::new();
    let mut passing: Vec<usize> = Vec::new();

    while let Some(joined) = join_set.join_next().await {
        let Ok(result) = joined else {
            warn!("candidate evaluation task panicked");
            continue;
        };
        let passed = result.verify.ok;
        reports.push(result);
        if !passed {
            continue;
        }
        passing.push(reports.len() - 1);

        // Drain everything that has already finished in this same tick so
        // simultaneous passes tie-break on temperature index.
        while let Some(extra) = join_set.try_join_next() {
            if let Ok(result) = extra {
                let extra_passed = result.verify.ok;
                reports.push(result);
                if extra_passed {
                    passing.push(reports.len() - 1);
                }
            }
        }
        break;
    }

    let winner_index = passing
        .into_iter()
        .min_by_key(|&i| reports[i].candidate.temp_index);

    if winner_index.is_some() {
        // Cancel the stragglers and wait them out so every worktree is gone
        // before the next phase. Late results are discarded.
        cancel.cancel();
        while let Some(joined) = join_set.join_next().await {
            if let Ok(result) = joined {
                debug!(hash = %result.candidate.hash, "discarding late evaluation result");
            }
        }
    }

    let winner = winner_index.map(|i| reports[i].clone());
    if let Some(ref w) = winner {
        info!(hash = %w.candidate.hash, temperature = w.candidate.temperature, "candidate passed");
    }

    EvalOutcome { winner, reports }
}

/// Evaluate one candidate in its own worktree. Always destroys the
/// worktree before returning.
async fn evaluate_one(
    sandbox: &Sandbox,
    mut candidate: PatchCandidate,
    focus_cmd: Option<&str>,
    full_cmd: &str,
    timeout: Duration,
    cancel: CancellationToken,
) -> EvaluatedCandidate {
    let tag = format!("wt_{}", &candidate.hash[..12]);
    let worktree = match sandbox.create_worktree(&tag).await {
        Ok(wt) => wt,
        Err(e) => {
            candidate.status = CandidateStatus::Fail;
            return EvaluatedCandidate {
                candidate,
                verify: VerifyResult::not_run(format!("worktree creation failed: {}", e)),
            };
        }
    };

    let verify = evaluate_in_worktree(&worktree, &candidate, focus_cmd, full_cmd, timeout, cancel)
        .await;
    worktree.destroy().await;

    candidate.status = if verify.ok { CandidateStatus::Pass } else { CandidateStatus::Fail };
    EvaluatedCandidate { candidate, verify }
}

async fn evaluate_in_worktree(
    worktree: &crate::infrastructure::sandbox::WorktreeView,
    candidate: &PatchCandidate,
    focus_cmd: Option<&str>,
    full_cmd: &str,
    timeout: Duration,
    cancel: CancellationToken,
) -> VerifyResult {
    match worktree.apply_patch(&candidate.diff).await {
        Ok(result) if !result.ok => {
            return VerifyResult::not_run(format!("apply failed: {}{}", result.stderr, result.stdout));
        }
        Err(e) => return VerifyResult::not_run(format!("apply failed: {}", e)),
        Ok(_) => {}
    }

    if cancel.is_cancelled() {
        return VerifyResult::not_run("cancelled".to_string());
    }

    if let Some(focus) = focus_cmd {
        let focused =
            verifier::run_verify_in_worktree(worktree, focus, Predicate::Tests, timeout).await;
        if !focused.ok {
            return focused;
        }
    }

    if cancel.is_cancelled() {
        return VerifyResult::not_run("cancelled".to_string());
    }

    verifier::run_verify_in_worktree(worktree, full_cmd, Predicate::Tests, timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::allowlist::effective_allowlist;
    use crate::services::project_detector::ProjectLanguage;
    use std::process::Command as StdCommand;

    /// Build a real git repo inside a sandbox. The repo's "test" is
    /// `grep -q marker data.txt`: it fails until a patch adds the marker
    /// line, which keeps fixtures hermetic and fast.
    fn git_fixture() -> (tempfile::TempDir, Sandbox) {
        let base = tempfile::tempdir().unwrap();
        let mut sandbox = Sandbox::create(Some(base.path())).unwrap();
        std::fs::create_dir_all(&sandbox.repo_dir).unwrap();
        std::fs::write(sandbox.repo_dir.join("data.txt"), "plain line\n").unwrap();

        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "ci@example.com"],
            vec!["config", "user.name", "ci"],
            vec!["add", "."],
            vec!["commit", "-qm", "seed"],
        ] {
            let status = StdCommand::new("git")
                .args(&args)
                .current_dir(&sandbox.repo_dir)
                .status()
                .unwrap();
            assert!(status.success(), "git {:?} failed", args);
        }

        sandbox.set_allowlist(effective_allowlist(ProjectLanguage::Python));
        (base, sandbox)
    }

    const GOOD_DIFF: &str = "--- a/data.txt\n+++ b/data.txt\n@@ -1 +1,2 @@\n plain line\n+marker\n";
    const BAD_DIFF: &str = "--- a/data.txt\n+++ b/data.txt\n@@ -1 +1,2 @@\n plain line\n+nothing useful\n";

    #[tokio::test]
    async fn passing_candidate_wins() {
        let (_base, sandbox) = git_fixture();
        let candidates = vec![PatchCandidate::new(GOOD_DIFF.to_string(), 0.0, 0)];
        let outcome = evaluate_candidates(
            &sandbox,
            candidates,
            None,
            "grep -q marker data.txt".to_string(),
            Duration::from_secs(30),
        )
        .await;

        let winner = outcome.winner.expect("expected a winner");
        assert_eq!(winner.candidate.status, CandidateStatus::Pass);
        assert!(winner.verify.ok);
    }

    #[tokio::test]
    async fn failing_candidates_produce_loser_report() {
        let (_base, sandbox) = git_fixture();
        let candidates = vec![PatchCandidate::new(BAD_DIFF.to_string(), 0.0, 0)];
        let outcome = evaluate_candidates(
            &sandbox,
            candidates,
            None,
            "grep -q marker data.txt".to_string(),
            Duration::from_secs(30),
        )
        .await;

        assert!(outcome.winner.is_none());
        assert_eq!(outcome.reports.len(), 1);
        assert!(outcome.best_loser().is_some());
    }

    #[tokio::test]
    async fn lowest_temperature_passing_candidate_selected() {
        let (_base, sandbox) = git_fixture();
        // Both candidates pass; the diffs differ so the hashes differ
        let variant =
            "--- a/data.txt\n+++ b/data.txt\n@@ -1 +1,3 @@\n plain line\n+marker\n+extra\n";
        let candidates = vec![
            PatchCandidate::new(variant.to_string(), 0.4, 2),
            PatchCandidate::new(GOOD_DIFF.to_string(), 0.0, 0),
        ];
        let outcome = evaluate_candidates(
            &sandbox,
            candidates,
            None,
            "grep -q marker data.txt".to_string(),
            Duration::from_secs(30),
        )
        .await;

        let winner = outcome.winner.expect("expected a winner");
        assert!(winner.verify.ok);
        // Among candidates that completed passing before the decision, the
        // lowest temperature index must have been selected.
        let min_passing_index = outcome
            .reports
            .iter()
            .filter(|r| r.verify.ok)
            .map(|r| r.candidate.temp_index)
            .min()
            .unwrap();
        assert_eq!(winner.candidate.temp_index, min_passing_index);
    }

    #[tokio::test]
    async fn unapplicable_diff_fails_cleanly() {
        let (_base, sandbox) = git_fixture();
        let bogus = "--- a/missing.txt\n+++ b/missing.txt\n@@ -1 +1 @@\n-x\n+y\n";
        let outcome = evaluate_candidates(
            &sandbox,
            vec![PatchCandidate::new(bogus.to_string(), 0.0, 0)],
            None,
            "grep -q marker data.txt".to_string(),
            Duration::from_secs(30),
        )
        .await;
        assert!(outcome.winner.is_none());
        assert!(outcome.reports[0].verify.stderr.contains("apply failed"));
    }

    #[tokio::test]
    async fn worktrees_are_destroyed_after_evaluation() {
        let (_base, sandbox) = git_fixture();
        let candidates = vec![
            PatchCandidate::new(GOOD_DIFF.to_string(), 0.0, 0),
            PatchCandidate::new(BAD_DIFF.to_string(), 0.2, 1),
        ];
        evaluate_candidates(
            &sandbox,
            candidates,
            None,
            "grep -q marker data.txt".to_string(),
            Duration::from_secs(30),
        )
        .await;

        let leftover: Vec<_> = std::fs::read_dir(sandbox.root.join("worktrees"))
            .unwrap()
            .flatten()
            .collect();
        assert!(leftover.is_empty(), "worktrees leaked: {:?}", leftover);
    }

    #[tokio::test]
    async fn empty_candidate_list_is_a_no_op() {
        let (_base, sandbox) = git_fixture();
        let outcome = evaluate_candidates(
            &sandbox,
            Vec::new(),
            None,
            "grep -q marker data.txt".to_string(),
            Duration::from_secs(5),
        )
        .await;
        assert!(outcome.winner.is_none());
        assert!(outcome.reports.is_empty());
    }
}
