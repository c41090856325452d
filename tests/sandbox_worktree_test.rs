//! Sandbox git-operation tests against throwaway repositories.

mod common;

use std::time::Duration;

use common::{git_fixture, FIX_DIFF};

#[tokio::test]
async fn apply_patch_mutates_primary_copy() {
    let base = tempfile::tempdir().unwrap();
    let sandbox = git_fixture(base.path());

    sandbox.apply_patch(FIX_DIFF).await.unwrap();
    let content = std::fs::read_to_string(sandbox.repo_dir.join("data.txt")).unwrap();
    assert!(content.contains("marker"));
}

#[tokio::test]
async fn reset_hard_discards_changes() {
    let base = tempfile::tempdir().unwrap();
    let sandbox = git_fixture(base.path());

    sandbox.apply_patch(FIX_DIFF).await.unwrap();
    std::fs::write(sandbox.repo_dir.join("untracked.txt"), "junk").unwrap();
    sandbox.reset_hard().await.unwrap();

    let content = std::fs::read_to_string(sandbox.repo_dir.join("data.txt")).unwrap();
    assert!(!content.contains("marker"));
    assert!(!sandbox.repo_dir.join("untracked.txt").exists());
}

#[tokio::test]
async fn worktree_isolates_candidate_changes() {
    let base = tempfile::tempdir().unwrap();
    let sandbox = git_fixture(base.path());

    let worktree = sandbox.create_worktree("wt_isolation").await.unwrap();
    let apply = worktree.apply_patch(FIX_DIFF).await.unwrap();
    assert!(apply.ok, "apply failed: {}", apply.stderr);

    // Worktree sees the change; the primary copy does not
    let wt_content = std::fs::read_to_string(worktree.path.join("data.txt")).unwrap();
    assert!(wt_content.contains("marker"));
    let main_content = std::fs::read_to_string(sandbox.repo_dir.join("data.txt")).unwrap();
    assert!(!main_content.contains("marker"));

    let wt_path = worktree.path.clone();
    worktree.destroy().await;
    assert!(!wt_path.exists());
}

#[tokio::test]
async fn concurrent_worktrees_are_disjoint() {
    let base = tempfile::tempdir().unwrap();
    let sandbox = git_fixture(base.path());

    let first = sandbox.create_worktree("wt_a").await.unwrap();
    let second = sandbox.create_worktree("wt_b").await.unwrap();
    assert_ne!(first.path, second.path);

    first.apply_patch(FIX_DIFF).await.unwrap();
    let second_content = std::fs::read_to_string(second.path.join("data.txt")).unwrap();
    assert!(!second_content.contains("marker"));

    first.destroy().await;
    second.destroy().await;
}

#[tokio::test]
async fn worktree_run_respects_allowlist() {
    let base = tempfile::tempdir().unwrap();
    let sandbox = git_fixture(base.path());
    let worktree = sandbox.create_worktree("wt_allow").await.unwrap();

    let blocked: Vec<String> = vec!["curl".into(), "http://x".into()];
    assert!(worktree.run(&blocked, Duration::from_secs(5)).await.is_err());

    let allowed: Vec<String> = vec!["ls".into()];
    let result = worktree.run(&allowed, Duration::from_secs(5)).await.unwrap();
    assert!(result.ok);

    worktree.destroy().await;
}
