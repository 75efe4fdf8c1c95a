//! Git worktree management for agent isolation.
//!
//! Each agent gets its own checkout under `<project>/.worktrees/<agent_id>`
//! on a dedicated branch `agent/<agent_id>`. All worktrees share the same
//! object database, so merging an agent branch back is cheap.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git command failed: {0}")]
    GitCommand(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over git CLI invocations so they can be mocked in tests.
#[async_trait]
pub trait GitRunner: Send + Sync {
    /// Run `git <args>` in `dir`, returning status and captured output.
    async fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String>;
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Real git runner that shells out to the `git` binary.
pub struct RealGitRunner;

#[async_trait]
impl GitRunner for RealGitRunner {
    async fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// WorktreeInfo
// ---------------------------------------------------------------------------

/// One record from `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: String,
    pub head: Option<String>,
    pub branch: Option<String>,
    #[serde(default)]
    pub bare: bool,
}

/// Parse the porcelain output of `git worktree list --porcelain`.
pub fn parse_porcelain(output: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(wt) = current.take() {
                worktrees.push(wt);
            }
            current = Some(WorktreeInfo {
                path: path.to_string(),
                head: None,
                branch: None,
                bare: false,
            });
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            if let Some(wt) = current.as_mut() {
                wt.head = Some(head.to_string());
            }
        } else if let Some(branch) = line.strip_prefix("branch ") {
            if let Some(wt) = current.as_mut() {
                wt.branch = Some(branch.to_string());
            }
        } else if line == "bare" {
            if let Some(wt) = current.as_mut() {
                wt.bare = true;
            }
        }
    }
    if let Some(wt) = current {
        worktrees.push(wt);
    }
    worktrees
}

// ---------------------------------------------------------------------------
// WorktreeManager
// ---------------------------------------------------------------------------

/// Manages the `.worktrees/` subtree of one project.
pub struct WorktreeManager {
    project_root: PathBuf,
    git: Arc<dyn GitRunner>,
}

impl WorktreeManager {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            git: Arc::new(RealGitRunner),
        }
    }

    /// Create a manager with a custom git runner (for testing).
    pub fn with_git_runner(project_root: impl Into<PathBuf>, git: Arc<dyn GitRunner>) -> Self {
        Self {
            project_root: project_root.into(),
            git,
        }
    }

    /// Where an agent's worktree lives, whether or not it exists yet.
    pub fn worktree_path(&self, agent_id: &str) -> PathBuf {
        self.project_root.join(".worktrees").join(agent_id)
    }

    /// Create an isolated checkout for an agent on branch `agent/<agent_id>`.
    ///
    /// Idempotent: an existing worktree directory is returned as-is.
    pub async fn create_worktree(&self, agent_id: &str) -> Result<PathBuf> {
        let wt_path = self.worktree_path(agent_id);
        let branch = format!("agent/{agent_id}");

        if wt_path.exists() {
            info!(path = %wt_path.display(), "worktree already exists");
            return Ok(wt_path);
        }

        let parent = wt_path.parent().expect(".worktrees parent");
        std::fs::create_dir_all(parent)?;

        let wt_path_str = wt_path.to_string_lossy().to_string();
        let result = self
            .git
            .run_git(
                &self.project_root,
                &["worktree", "add", &wt_path_str, "-b", &branch],
            )
            .await;

        match result {
            Ok(output) if output.success => {
                info!(path = %wt_path.display(), branch = %branch, "created worktree");
                Ok(wt_path)
            }
            Ok(output) => Err(WorktreeError::GitCommand(format!(
                "git worktree add failed: {}",
                output.stderr
            ))),
            Err(e) => Err(WorktreeError::GitCommand(e)),
        }
    }

    /// List the project's worktrees from porcelain output.
    pub async fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>> {
        let result = self
            .git
            .run_git(&self.project_root, &["worktree", "list", "--porcelain"])
            .await;

        match result {
            Ok(output) if output.success => Ok(parse_porcelain(&output.stdout)),
            Ok(output) => {
                warn!(stderr = %output.stderr, "git worktree list failed");
                Ok(Vec::new())
            }
            Err(e) => Err(WorktreeError::GitCommand(e)),
        }
    }

    /// Force-remove an agent's worktree and delete its branch.
    ///
    /// Branch-delete failures are logged, not fatal — a stale `agent/*`
    /// branch is tolerable.
    pub async fn remove_worktree(&self, agent_id: &str) -> Result<()> {
        let wt_path = self.worktree_path(agent_id);
        let branch = format!("agent/{agent_id}");

        if wt_path.exists() {
            let wt_path_str = wt_path.to_string_lossy().to_string();
            let result = self
                .git
                .run_git(
                    &self.project_root,
                    &["worktree", "remove", &wt_path_str, "--force"],
                )
                .await;
            match result {
                Ok(output) if !output.success => {
                    warn!(stderr = %output.stderr, "git worktree remove failed");
                }
                Err(e) => return Err(WorktreeError::GitCommand(e)),
                _ => {}
            }
        }

        match self
            .git
            .run_git(&self.project_root, &["branch", "-D", &branch])
            .await
        {
            Ok(output) if !output.success => {
                warn!(branch = %branch, stderr = %output.stderr.trim(), "branch cleanup failed");
            }
            Err(e) => {
                warn!(branch = %branch, error = %e, "branch cleanup failed");
            }
            _ => {}
        }

        info!(path = %wt_path.display(), "removed worktree");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
