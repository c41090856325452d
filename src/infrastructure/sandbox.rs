//! Disposable on-disk sandbox.
//!
//! One sandbox per run: a unique directory holding the cloned repository,
//! the event log, and any candidate worktrees. Every subprocess goes
//! through [`Sandbox::run`], which enforces the command allowlist, never
//! spawns a shell, and turns timeouts into synthetic exit code 124.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::error::SandboxError;
use crate::services::allowlist;

/// Exit code reported for commands killed by their timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Path prefixes the model may never read or touch through the sandbox.
const FORBIDDEN_READ_PREFIXES: [&str; 6] =
    [".git", "node_modules", "vendor", ".venv", "venv", "__pycache__"];

/// Directories pruned out of tree listings.
const PRUNED_DIRS: [&str; 10] = [
    ".git",
    "node_modules",
    ".venv",
    "venv",
    "__pycache__",
    "dist",
    "build",
    ".next",
    "out",
    "target",
];

/// Captured output of one subprocess.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub ok: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecResult {
    fn from_output(output: std::process::Output) -> Self {
        let exit_code = output.status.code().unwrap_or(1);
        Self {
            ok: output.status.success(),
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: false,
        }
    }

    fn timed_out(timeout: Duration) -> Self {
        Self {
            ok: false,
            exit_code: TIMEOUT_EXIT_CODE,
            stdout: String::new(),
            stderr: format!("command timed out after {}s", timeout.as_secs()),
            timed_out: true,
        }
    }
}

/// A disjoint checkout used to evaluate one candidate diff. Holds no
/// reference back to the loop; workers get this handle and nothing else.
#[derive(Debug, Clone)]
pub struct WorktreeView {
    pub path: PathBuf,
    repo_dir: PathBuf,
    allowlist: Arc<HashSet<String>>,
}

impl WorktreeView {
    /// Apply a unified diff inside this worktree via `git apply` on stdin.
    pub async fn apply_patch(&self, diff: &str) -> Result<ExecResult, SandboxError> {
        apply_patch_in(&self.path, diff).await
    }

    /// Run an allowlisted argv inside this worktree.
    pub async fn run(
        &self,
        argv: &[String],
        timeout: Duration,
    ) -> Result<ExecResult, SandboxError> {
        run_checked(&self.path, argv, timeout, &self.allowlist).await
    }

    /// Remove the worktree. Retries with `--force` and falls back to
    /// deleting the directory so no exit path leaks a checkout.
    pub async fn destroy(self) {
        let path_str = self.path.to_string_lossy().to_string();
        let removed = git_in(&self.repo_dir, &["worktree", "remove", &path_str])
            .await
            .map(|r| r.ok)
            .unwrap_or(false);
        if !removed {
            let forced = git_in(&self.repo_dir, &["worktree", "remove", "--force", &path_str])
                .await
                .map(|r| r.ok)
                .unwrap_or(false);
            if !forced {
                warn!(worktree = %path_str, "force removal failed, deleting directory");
            }
        }
        if self.path.exists() {
            let _ = tokio::fs::remove_dir_all(&self.path).await;
        }
    }
}

/// The per-run sandbox. Cheap to clone; the allowlist is shared.
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub run_id: String,
    pub root: PathBuf,
    pub repo_dir: PathBuf,
    allowlist: Arc<HashSet<String>>,
}

impl Sandbox {
    /// Create a fresh sandbox directory under `base` (or the system temp
    /// dir). Layout: `<base>/rfsn_sb_<hex>/{repo/, run.jsonl, worktrees/}`.
    pub fn create(base: Option<&Path>) -> Result<Self> {
        let run_id = Uuid::new_v4().simple().to_string();
        let base_dir = base
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let root = base_dir.join(format!("rfsn_sb_{}", &run_id[..12]));
        std::fs::create_dir_all(root.join("worktrees"))
            .with_context(|| format!("failed to create sandbox at {}", root.display()))?;
        let repo_dir = root.join("repo");
        Ok(Self {
            run_id,
            root,
            repo_dir,
            allowlist: Arc::new(HashSet::new()),
        })
    }

    /// Install the effective allowlist once the project language is known.
    pub fn set_allowlist(&mut self, commands: HashSet<String>) {
        self.allowlist = Arc::new(commands);
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join("run.jsonl")
    }

    /// Clone the target repository into the sandbox. The URL has already
    /// passed validation; this is the last credential check before network.
    pub async fn clone_repo(&self, url: &str) -> Result<(), SandboxError> {
        if self.repo_dir.join(".git").exists() {
            return Ok(());
        }
        if url.contains('@') {
            return Err(SandboxError::CloneFailed("credentials are not allowed".into()));
        }
        if let Some(query) = url.split('?').nth(1) {
            if query.to_ascii_lowercase().contains("token") {
                return Err(SandboxError::CloneFailed(
                    "credential-like query parameters are not allowed".into(),
                ));
            }
        }

        let result = raw_exec(
            &self.root,
            "git",
            &["clone", "--quiet", url, &self.repo_dir.to_string_lossy()],
            Duration::from_secs(600),
            None,
        )
        .await?;
        if !result.ok {
            return Err(SandboxError::CloneFailed(result.stderr));
        }
        Ok(())
    }

    pub async fn checkout(&self, git_ref: &str) -> Result<(), SandboxError> {
        let result = git_in(&self.repo_dir, &["checkout", "--quiet", git_ref]).await?;
        if !result.ok {
            return Err(SandboxError::CloneFailed(format!(
                "checkout of '{}' failed: {}",
                git_ref, result.stderr
            )));
        }
        Ok(())
    }

    /// Drop all local modifications and untracked files.
    pub async fn reset_hard(&self) -> Result<(), SandboxError> {
        let reset = git_in(&self.repo_dir, &["reset", "--hard", "--quiet"]).await?;
        let clean = git_in(&self.repo_dir, &["clean", "-fdq"]).await?;
        if !reset.ok || !clean.ok {
            return Err(SandboxError::WorktreeFailed(format!(
                "reset failed: {}{}",
                reset.stderr, clean.stderr
            )));
        }
        Ok(())
    }

    /// Flattened, sorted listing of repository files with junk pruned.
    pub fn list_tree(&self, max_files: usize) -> Vec<String> {
        let mut files = Vec::new();
        collect_files(&self.repo_dir, &self.repo_dir, &mut files, max_files);
        files.sort();
        files
    }

    /// Read a repo-relative file, truncated to `max_bytes`.
    pub fn read_file(&self, path: &str, max_bytes: usize) -> Result<String, SandboxError> {
        let full = self.resolve_repo_path(path)?;
        let bytes = std::fs::read(&full)
            .map_err(|_| SandboxError::PathRejected(format!("file not found: {}", path)))?;
        let clipped = if bytes.len() > max_bytes { &bytes[..max_bytes] } else { &bytes[..] };
        Ok(String::from_utf8_lossy(clipped).into_owned())
    }

    /// Recursive text search via the system grep, bounded by `max_matches`.
    /// A patternless result set is not an error: exit code 1 from grep just
    /// means no matches.
    pub async fn grep(
        &self,
        pattern: &str,
        max_matches: usize,
    ) -> Result<Vec<String>, SandboxError> {
        let flat = pattern.replace('\n', " ");
        let argv: Vec<String> = ["grep", "-R", "--line-number", "-I", flat.as_str(), "."]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let result = self.run(&argv, Duration::from_secs(60)).await?;
        Ok(result
            .stdout
            .lines()
            .filter(|l| !l.starts_with("./.git/"))
            .take(max_matches)
            .map(|s| s.to_string())
            .collect())
    }

    /// Run an allowlisted argv in the repository root.
    pub async fn run(
        &self,
        argv: &[String],
        timeout: Duration,
    ) -> Result<ExecResult, SandboxError> {
        run_checked(&self.repo_dir, argv, timeout, &self.allowlist).await
    }

    /// Apply a winning diff to the primary working copy. Only the loop
    /// calls this, only in APPLY_WINNER.
    pub async fn apply_patch(&self, diff: &str) -> Result<(), SandboxError> {
        let result = apply_patch_in(&self.repo_dir, diff).await?;
        if !result.ok {
            return Err(SandboxError::PatchApplyFailed(result.stderr));
        }
        Ok(())
    }

    /// Create a detached worktree off the current HEAD for candidate
    /// evaluation. Concurrent creations can contend on the repository
    /// lock, so a failed add is retried once.
    pub async fn create_worktree(&self, tag: &str) -> Result<WorktreeView, SandboxError> {
        let path = self.root.join("worktrees").join(tag);
        let path_str = path.to_string_lossy().to_string();

        let mut result =
            git_in(&self.repo_dir, &["worktree", "add", "--detach", "--quiet", &path_str]).await?;
        if !result.ok {
            tokio::time::sleep(Duration::from_millis(100)).await;
            result =
                git_in(&self.repo_dir, &["worktree", "add", "--detach", "--quiet", &path_str])
                    .await?;
        }
        if !result.ok {
            return Err(SandboxError::WorktreeFailed(result.stderr));
        }
        debug!(worktree = %path_str, "worktree created");
        Ok(WorktreeView {
            path,
            repo_dir: self.repo_dir.clone(),
            allowlist: Arc::clone(&self.allowlist),
        })
    }

    /// Resolve a repo-relative path, rejecting escapes and forbidden
    /// prefixes.
    fn resolve_repo_path(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let cleaned = path.trim().trim_start_matches("./").replace('\\', "/");
        if cleaned.is_empty() {
            return Err(SandboxError::PathRejected("empty path".into()));
        }
        let rel = Path::new(&cleaned);
        if rel.is_absolute() {
            return Err(SandboxError::PathRejected(format!("absolute path: {}", path)));
        }
        for component in rel.components() {
            if matches!(component, Component::ParentDir) {
                return Err(SandboxError::PathRejected(format!("path escapes repo: {}", path)));
            }
        }
        for prefix in FORBIDDEN_READ_PREFIXES {
            if cleaned == prefix || cleaned.starts_with(&format!("{}/", prefix)) {
                return Err(SandboxError::PathRejected(format!("forbidden prefix: {}", path)));
            }
        }
        Ok(self.repo_dir.join(rel))
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>, max: usize) {
    if out.len() >= max {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        if out.len() >= max {
            return;
        }
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() {
            if !PRUNED_DIRS.contains(&name.as_str()) {
                collect_files(root, &path, out, max);
            }
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
}

/// Allowlist-checked execution. All model-visible commands funnel through
/// here.
async fn run_checked(
    cwd: &Path,
    argv: &[String],
    timeout: Duration,
    allowed: &HashSet<String>,
) -> Result<ExecResult, SandboxError> {
    allowlist::check_argv(argv, allowed)?;
    raw_exec(cwd, &argv[0], &argv[1..].iter().map(String::as_str).collect::<Vec<_>>(), timeout, None)
        .await
}

/// Controller-internal git invocation; bypasses the model allowlist but
/// still never touches a shell.
async fn git_in(cwd: &Path, args: &[&str]) -> Result<ExecResult, SandboxError> {
    raw_exec(cwd, "git", args, Duration::from_secs(120), None).await
}

async fn apply_patch_in(dir: &Path, diff: &str) -> Result<ExecResult, SandboxError> {
    raw_exec(dir, "git", &["apply", "--whitespace=nowarn", "-"], Duration::from_secs(60), Some(diff))
        .await
}

/// Spawn a process with no shell, piped stdio, and a hard timeout. The
/// child is killed on timeout via kill-on-drop.
async fn raw_exec(
    cwd: &Path,
    program: &str,
    args: &[&str],
    timeout: Duration,
    stdin_data: Option<&str>,
) -> Result<ExecResult, SandboxError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(if stdin_data.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;

    if let Some(data) = stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            let bytes = data.as_bytes().to_vec();
            // Writing can only fail if the child already exited; that error
            // surfaces through the exit status instead.
            let _ = stdin.write_all(&bytes).await;
            drop(stdin);
        }
    }

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(ExecResult::from_output(output)),
        Ok(Err(e)) => Err(SandboxError::SpawnFailed(e)),
        Err(_) => Ok(ExecResult::timed_out(timeout)),
    }
}
