//! Git-worktree workspace isolation for parallel execution attempts.
//!
//! Each attempt gets an ephemeral detached worktree created from the
//! canonical workspace's HEAD. On success the worktree's diff is
//! three-way-merged back; on conflict the caller marks the work item
//! blocked. Per-scope merge locks serialise merges within a scope while
//! independent scopes merge in parallel.
//!
//! Path convention: `{runtime_dir}/{scope_id}/{task_id}/{attempt}`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Default worktree directory under the canonical root.
const DEFAULT_RUNTIME_DIR: &str = ".runtime/worktrees";

/// Worktree subsystem errors.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// Spawning or talking to git failed.
    #[error("git io error: {0}")]
    Io(#[from] std::io::Error),
    /// A git command exited non-zero (non-conflict).
    #[error("git {command} failed (rc={code}): {stderr}")]
    Git {
        command: String,
        code: i32,
        stderr: String,
    },
}

/// Subprocess-based `git worktree` lifecycle manager.
pub struct WorktreeManager {
    canonical_root: PathBuf,
    runtime_dir: PathBuf,
    // One merge at a time per scope.
    scope_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WorktreeManager {
    /// Manage worktrees for the repository at `canonical_root`.
    pub fn new(canonical_root: impl Into<PathBuf>, runtime_dir: Option<PathBuf>) -> Self {
        let canonical_root = canonical_root.into();
        let runtime_dir = runtime_dir.unwrap_or_else(|| canonical_root.join(DEFAULT_RUNTIME_DIR));
        Self {
            canonical_root,
            runtime_dir,
            scope_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create an ephemeral worktree from canonical HEAD; returns its path.
    pub async fn create(
        &self,
        scope_id: &str,
        task_id: &str,
        attempt: u32,
    ) -> Result<PathBuf, WorktreeError> {
        let worktree_path = self.worktree_path(scope_id, task_id, attempt);
        if let Some(parent) = worktree_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let baseline = self.git(&["rev-parse", "HEAD"], None).await?;
        let baseline = baseline.trim().to_owned();

        self.git(
            &[
                "worktree",
                "add",
                "--detach",
                &worktree_path.to_string_lossy(),
                &baseline,
            ],
            None,
        )
        .await?;

        info!(
            scope_id,
            task_id,
            attempt,
            path = %worktree_path.display(),
            baseline = &baseline[..baseline.len().min(12)],
            "worktree_created"
        );
        Ok(worktree_path)
    }

    /// Three-way-merge worktree changes back into the canonical workspace.
    ///
    /// Under the scope's merge lock: a clean worktree is a no-op;
    /// otherwise commit its changes, diff against the merge base with
    /// canonical HEAD, and apply with `git apply --3way`. Returns
    /// `(true, None)` on clean merge or no-op, `(false, detail)` on
    /// conflict.
    pub async fn merge_back(
        &self,
        worktree_path: &Path,
    ) -> Result<(bool, Option<String>), WorktreeError> {
        let scope_id = self.scope_from_path(worktree_path);
        let lock = self.scope_lock(&scope_id).await;
        let _guard = lock.lock().await;

        let status = self.git_in(worktree_path, &["status", "--porcelain"], None).await?;
        if status.trim().is_empty() {
            info!(path = %worktree_path.display(), "worktree_merge_noop");
            return Ok((true, None));
        }

        self.git_in(worktree_path, &["add", "-A"], None).await?;
        self.git_in(
            worktree_path,
            &["commit", "-m", "worktree changes", "--allow-empty"],
            None,
        )
        .await?;

        let worktree_commit = self
            .git_in(worktree_path, &["rev-parse", "HEAD"], None)
            .await?
            .trim()
            .to_owned();
        let canonical_head = self.git(&["rev-parse", "HEAD"], None).await?.trim().to_owned();
        let baseline = self
            .git_in(
                worktree_path,
                &["merge-base", &canonical_head, &worktree_commit],
                None,
            )
            .await?
            .trim()
            .to_owned();

        let diff = self
            .git_in(worktree_path, &["diff", &baseline, &worktree_commit], None)
            .await?;
        if diff.trim().is_empty() {
            return Ok((true, None));
        }

        match self
            .git(&["apply", "--3way", "--whitespace=nowarn"], Some(&diff))
            .await
        {
            Ok(_) => {
                info!(
                    path = %worktree_path.display(),
                    baseline = &baseline[..baseline.len().min(12)],
                    commit = &worktree_commit[..worktree_commit.len().min(12)],
                    "worktree_merged"
                );
                Ok((true, None))
            }
            Err(WorktreeError::Git { stderr, .. })
                if stderr.to_lowercase().contains("conflict") =>
            {
                warn!(path = %worktree_path.display(), detail = %stderr, "worktree_merge_conflict");
                // Abort the partial apply; ignore failure if nothing to abort.
                let _ = self.git(&["apply", "--abort"], None).await;
                Ok((false, Some(stderr)))
            }
            Err(other) => Err(other),
        }
    }

    /// Remove the worktree directory and prune stale git metadata.
    pub async fn destroy(&self, worktree_path: &Path) -> Result<(), WorktreeError> {
        if worktree_path.exists() {
            tokio::fs::remove_dir_all(worktree_path).await?;
        }
        let _ = self.git(&["worktree", "prune"], None).await;
        info!(path = %worktree_path.display(), "worktree_destroyed");
        Ok(())
    }

    /// Convention: `{runtime_dir}/{scope_id}/{task_id}/{attempt}`.
    pub fn worktree_path(&self, scope_id: &str, task_id: &str, attempt: u32) -> PathBuf {
        self.runtime_dir
            .join(scope_id)
            .join(task_id)
            .join(attempt.to_string())
    }

    fn scope_from_path(&self, worktree: &Path) -> String {
        worktree
            .strip_prefix(&self.runtime_dir)
            .ok()
            .and_then(|relative| relative.components().next())
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_owned())
    }

    async fn scope_lock(&self, scope_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.scope_locks.lock().await;
        locks
            .entry(scope_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn git(&self, args: &[&str], stdin: Option<&str>) -> Result<String, WorktreeError> {
        self.git_in(&self.canonical_root, args, stdin).await
    }

    async fn git_in(
        &self,
        cwd: &Path,
        args: &[&str],
        stdin: Option<&str>,
    ) -> Result<String, WorktreeError> {
        let mut command = Command::new("git");
        command
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command.spawn()?;
        if let (Some(input), Some(mut handle)) = (stdin, child.stdin.take()) {
            handle.write_all(input.as_bytes()).await?;
            drop(handle);
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(WorktreeError::Git {
                command: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: if stderr.trim().is_empty() { stdout } else { stderr },
            });
        }
        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Initialise a git repo with one committed file, for worktree tests.
    async fn init_repo() -> (TempDir, WorktreeManager) {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path().to_path_buf();
        run(&root, &["init", "--initial-branch=main"]).await;
        run(&root, &["config", "user.email", "test@example.com"]).await;
        run(&root, &["config", "user.name", "Test"]).await;
        tokio::fs::write(root.join("base.txt"), "base\n").await.expect("write");
        run(&root, &["add", "-A"]).await;
        run(&root, &["commit", "-m", "initial"]).await;
        let manager = WorktreeManager::new(root, None);
        (dir, manager)
    }

    async fn run(cwd: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .expect("git spawn");
        assert!(status.success(), "git {args:?} failed");
    }

    #[tokio::test]
    async fn test_create_uses_path_convention() {
        let (_dir, manager) = init_repo().await;
        let path = manager.create("owner", "task-1", 1).await.expect("create");
        assert!(path.ends_with("owner/task-1/1"));
        assert!(path.join("base.txt").exists());
        manager.destroy(&path).await.expect("destroy");
    }

    #[tokio::test]
    async fn test_merge_back_noop_without_changes() {
        let (_dir, manager) = init_repo().await;
        let path = manager.create("owner", "task-2", 1).await.expect("create");
        let (ok, detail) = manager.merge_back(&path).await.expect("merge");
        assert!(ok);
        assert!(detail.is_none());
        manager.destroy(&path).await.expect("destroy");
    }

    #[tokio::test]
    async fn test_merge_back_applies_changes() {
        let (dir, manager) = init_repo().await;
        let path = manager.create("owner", "task-3", 1).await.expect("create");

        tokio::fs::write(path.join("new.txt"), "from worktree\n")
            .await
            .expect("write");
        let (ok, detail) = manager.merge_back(&path).await.expect("merge");
        assert!(ok, "merge failed: {detail:?}");

        let merged = dir.path().join("new.txt");
        assert!(merged.exists(), "change should land in the canonical workspace");
        manager.destroy(&path).await.expect("destroy");
    }

    #[tokio::test]
    async fn test_merge_back_detects_conflict() {
        let (dir, manager) = init_repo().await;
        let path = manager.create("owner", "task-4", 1).await.expect("create");

        // Diverge the same file in both copies.
        tokio::fs::write(path.join("base.txt"), "worktree version\n")
            .await
            .expect("write worktree");
        tokio::fs::write(dir.path().join("base.txt"), "canonical version\n")
            .await
            .expect("write canonical");
        run(dir.path(), &["add", "-A"]).await;
        run(dir.path(), &["commit", "-m", "canonical change"]).await;

        let (ok, detail) = manager.merge_back(&path).await.expect("merge");
        assert!(!ok, "conflicting edits must not merge cleanly");
        assert!(detail.is_some());
        manager.destroy(&path).await.expect("destroy");
    }

    #[tokio::test]
    async fn test_destroy_removes_directory() {
        let (_dir, manager) = init_repo().await;
        let path = manager.create("owner", "task-5", 1).await.expect("create");
        manager.destroy(&path).await.expect("destroy");
        assert!(!path.exists());
    }
}
