//! End-to-end worktree tests against a real git repository. Skipped when no
//! git binary is available.

use std::path::Path;
use std::process::Command;

use alch_core::worktree::WorktreeManager;

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn init_repo(path: &Path) {
    let run = |args: &[&str]| {
        let status = Command::new("git")
            .args([
                "-c",
                "user.email=test@example.com",
                "-c",
                "user.name=test",
            ])
            .args(args)
            .current_dir(path)
            .status()
            .expect("git invocation");
        assert!(status.success(), "git {args:?} failed");
    };
    run(&["init", "--initial-branch=main"]);
    run(&["commit", "--allow-empty", "-m", "init"]);
}

#[tokio::test]
async fn create_list_remove_round_trip() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let manager = WorktreeManager::new(tmp.path());

    // Create.
    let path = manager.create_worktree("backend-t1").await.unwrap();
    assert!(path.is_dir());
    assert!(path.ends_with(".worktrees/backend-t1"));

    // Idempotent: second create returns the same path without error.
    let again = manager.create_worktree("backend-t1").await.unwrap();
    assert_eq!(path, again);

    // Listed with its branch.
    let worktrees = manager.list_worktrees().await.unwrap();
    assert_eq!(worktrees.len(), 2, "main checkout plus the agent worktree");
    let agent_wt = worktrees
        .iter()
        .find(|w| w.path.ends_with("backend-t1"))
        .expect("agent worktree listed");
    assert_eq!(
        agent_wt.branch.as_deref(),
        Some("refs/heads/agent/backend-t1")
    );
    assert!(agent_wt.head.is_some());

    // Remove deletes the checkout and the branch.
    manager.remove_worktree("backend-t1").await.unwrap();
    assert!(!path.exists());
    let worktrees = manager.list_worktrees().await.unwrap();
    assert_eq!(worktrees.len(), 1);

    let branches = Command::new("git")
        .args(["branch", "--list", "agent/*"])
        .current_dir(tmp.path())
        .output()
        .unwrap();
    assert!(String::from_utf8_lossy(&branches.stdout).trim().is_empty());
}

#[tokio::test]
async fn two_agents_get_distinct_worktrees() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    init_repo(tmp.path());
    let manager = WorktreeManager::new(tmp.path());

    let a = manager.create_worktree("backend-t1").await.unwrap();
    let b = manager.create_worktree("frontend-t2").await.unwrap();
    assert_ne!(a, b);
    assert!(a.is_dir() && b.is_dir());
}
