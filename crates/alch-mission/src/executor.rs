//! DAG executor — runs an orchestrator plan with dependency resolution.
//!
//! Independent tasks spawn in parallel under a counting semaphore; dependent
//! tasks wait for their dependencies to complete; a failed dependency skips
//! every transitive dependent. After a fully successful run the executor
//! merges agent branches back to the main branch, installs changed
//! dependency manifests, and runs the plan's verification command.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use alch_agents::manager::{AgentManager, SpawnAgentRequest};
use alch_bridge::{Event, EventBus, EventKind};
use alch_core::memory::MemoryDir;
use alch_core::types::{AgentStatus, PlannedTask};
use alch_core::worktree::{GitRunner, RealGitRunner};

/// Upper bound on concurrently running coding agents.
pub const MAX_CONCURRENT_AGENTS: usize = 3;

/// Default interval between agent status polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Timeout for post-run dependency installs.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for the post-run verification command.
const RUN_TIMEOUT: Duration = Duration::from_secs(30);

/// Verification output is truncated to this many bytes before broadcast.
const RUN_OUTPUT_LIMIT: usize = 4096;

/// `.gitignore` written into a worktree that lacks one before committing,
/// so build artifacts and virtualenvs stay out of the agent branch.
const DEFAULT_GITIGNORE: &str = "\
node_modules/
__pycache__/
*.pyc
.venv/
venv/
dist/
build/
target/
.worktrees/
";

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

pub struct DagRequest {
    pub dag: Vec<PlannedTask>,
    pub project_path: PathBuf,
    pub memory: MemoryDir,
    pub adapter_name: String,
    pub project_id: String,
    pub run_command: Option<String>,
}

/// Final accounting of one DAG run, task ids in plan order.
#[derive(Debug, Clone, Default)]
pub struct DagOutcome {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub merged: Vec<String>,
    pub conflicts: Vec<String>,
}

// ---------------------------------------------------------------------------
// DagExecutor
// ---------------------------------------------------------------------------

pub struct DagExecutor {
    manager: Arc<AgentManager>,
    bus: EventBus,
    git: Arc<dyn GitRunner>,
    semaphore: Arc<Semaphore>,
    poll_interval: Duration,
}

impl DagExecutor {
    pub fn new(manager: Arc<AgentManager>, bus: EventBus) -> Self {
        Self::with_parts(manager, bus, Arc::new(RealGitRunner), DEFAULT_POLL_INTERVAL)
    }

    /// Inject the git runner and poll interval (for testing).
    pub fn with_parts(
        manager: Arc<AgentManager>,
        bus: EventBus,
        git: Arc<dyn GitRunner>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            manager,
            bus,
            git,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_AGENTS)),
            poll_interval,
        }
    }

    /// Execute a plan's DAG to completion and run the post-stage.
    pub async fn execute(&self, req: DagRequest) -> DagOutcome {
        if req.dag.is_empty() {
            info!("empty DAG, nothing to execute");
            return DagOutcome::default();
        }

        let total = req.dag.len();
        self.bus.publish(
            Event::orchestrator(EventKind::DagExecutionStart)
                .with_text(format!("Executing DAG with {total} tasks")),
        );

        let mut completed: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut spawned: HashSet<String> = HashSet::new();
        let mut workers: JoinSet<(String, bool)> = JoinSet::new();

        let max_iterations = total * 10;
        let mut iteration = 0usize;

        while completed.len() + failed.len() < total {
            iteration += 1;
            if iteration > max_iterations {
                error!(iteration, "DAG execution exceeded max iterations, aborting");
                break;
            }

            // Cascade failures to every transitive dependent before
            // computing readiness, so each skipped task is marked exactly
            // once and no dependent is left dangling.
            loop {
                let mut changed = false;
                for task in &req.dag {
                    if spawned.contains(&task.id) {
                        continue;
                    }
                    if task.dependencies.iter().any(|d| failed.contains(d)) {
                        failed.insert(task.id.clone());
                        spawned.insert(task.id.clone());
                        changed = true;
                        self.bus.publish(
                            Event::orchestrator(EventKind::TaskSkipped)
                                .with("task_id", task.id.clone())
                                .with_text(format!(
                                    "Skipped {}, dependency failed",
                                    task.label
                                )),
                        );
                    }
                }
                if !changed {
                    break;
                }
            }

            // Ready: unspawned tasks whose dependencies all completed.
            // Tie-break is plan order.
            let ready: Vec<PlannedTask> = req
                .dag
                .iter()
                .filter(|t| {
                    !spawned.contains(&t.id)
                        && t.dependencies.iter().all(|d| completed.contains(d))
                })
                .cloned()
                .collect();

            let spawned_any = !ready.is_empty();
            for task in ready {
                spawned.insert(task.id.clone());
                workers.spawn(run_task(
                    task,
                    req.project_path.clone(),
                    req.memory.clone(),
                    req.adapter_name.clone(),
                    req.project_id.clone(),
                    Arc::clone(&self.manager),
                    self.bus.clone(),
                    Arc::clone(&self.git),
                    Arc::clone(&self.semaphore),
                    self.poll_interval,
                ));
            }

            if !spawned_any && workers.is_empty() {
                warn!("no tasks ready and none running, possible cycle");
                break;
            }

            // Wait for at least one in-flight worker, then re-plan.
            if let Some(result) = workers.join_next().await {
                match result {
                    Ok((task_id, true)) => {
                        completed.insert(task_id);
                    }
                    Ok((task_id, false)) => {
                        failed.insert(task_id);
                    }
                    Err(join_err) => {
                        // A panicked worker loses its task id; the iteration
                        // fuse bounds the loop regardless.
                        error!(error = %join_err, "task worker aborted");
                    }
                }
            }
        }

        let mut outcome = DagOutcome {
            completed: ordered(&req.dag, &completed),
            failed: ordered(&req.dag, &failed),
            merged: Vec::new(),
            conflicts: Vec::new(),
        };

        self.bus.publish(
            Event::orchestrator(EventKind::DagExecutionDone)
                .with("completed", outcome.completed.clone())
                .with("failed", outcome.failed.clone())
                .with_text(format!(
                    "DAG complete: {} succeeded, {} failed",
                    outcome.completed.len(),
                    outcome.failed.len()
                )),
        );
        info!(
            completed = outcome.completed.len(),
            failed = outcome.failed.len(),
            "DAG execution done"
        );

        let success = outcome.failed.is_empty() && outcome.completed.len() == total;
        let summaries: Vec<serde_json::Value> = req
            .dag
            .iter()
            .map(|t| {
                serde_json::json!({
                    "id": t.id,
                    "label": t.label,
                    "domain": t.domain.as_str(),
                    "status": if completed.contains(&t.id) { "done" } else { "failed" },
                    "branch": t.branch(),
                })
            })
            .collect();
        self.bus.publish(
            Event::orchestrator(EventKind::MissionComplete)
                .with("success", success)
                .with("tasks", summaries)
                .with_text(if success {
                    "Mission complete"
                } else {
                    "Mission finished with failures"
                }),
        );

        // Post-DAG integration only with zero failures and at least one
        // completion.
        if outcome.failed.is_empty() && !outcome.completed.is_empty() {
            let (merged, conflicts) = self.auto_merge(&req, &completed).await;
            let merge_count = merged.len();
            outcome.merged = merged;
            outcome.conflicts = conflicts;
            self.auto_install(&req, merge_count).await;
            self.auto_run(&req).await;
        }

        outcome
    }

    // -----------------------------------------------------------------------
    // Post-stage: merge
    // -----------------------------------------------------------------------

    /// Merge every completed agent branch into main (falling back to
    /// master). A conflicting merge is aborted and retried with the
    /// `theirs` strategy option; a branch failing both is recorded as a
    /// conflict and the rest continue.
    async fn auto_merge(
        &self,
        req: &DagRequest,
        completed: &HashSet<String>,
    ) -> (Vec<String>, Vec<String>) {
        let root = &req.project_path;

        let on_main = self.git_ok(root, &["checkout", "main"]).await
            || self.git_ok(root, &["checkout", "master"]).await;
        if !on_main {
            self.post_stage_error("auto-merge: could not check out main or master")
                .await;
            return (Vec::new(), Vec::new());
        }

        let mut merged = Vec::new();
        let mut conflicts = Vec::new();

        for task in req.dag.iter().filter(|t| completed.contains(&t.id)) {
            let branch = task.branch();
            let msg = format!("merge {}", task.id);

            if self
                .git_ok(root, &["merge", &branch, "--no-edit", "-m", &msg])
                .await
            {
                merged.push(branch);
                continue;
            }

            self.git_ok(root, &["merge", "--abort"]).await;
            warn!(branch = %branch, "merge conflict, retrying with strategy-option theirs");

            if self
                .git_ok(
                    root,
                    &[
                        "merge",
                        &branch,
                        "--strategy-option",
                        "theirs",
                        "--no-edit",
                        "-m",
                        &msg,
                    ],
                )
                .await
            {
                merged.push(branch);
            } else {
                self.git_ok(root, &["merge", "--abort"]).await;
                warn!(branch = %branch, "merge failed even with theirs, recording conflict");
                conflicts.push(branch);
            }
        }

        self.bus.publish(
            Event::orchestrator(EventKind::MergeComplete)
                .with("merged", merged.clone())
                .with("conflicts", conflicts.clone())
                .with_text(format!(
                    "Merged {} branches, {} conflicts",
                    merged.len(),
                    conflicts.len()
                )),
        );

        (merged, conflicts)
    }

    // -----------------------------------------------------------------------
    // Post-stage: install
    // -----------------------------------------------------------------------

    /// If the merges changed `requirements.txt` or `package.json`, install
    /// the dependencies they declare.
    async fn auto_install(&self, req: &DagRequest, merge_count: usize) {
        if merge_count == 0 {
            return;
        }
        let root = &req.project_path;
        let base = format!("HEAD~{merge_count}");

        let requirements_changed = self
            .git_stdout(root, &["diff", "--name-only", &base, "--", "requirements.txt"])
            .await
            .map(|out| !out.trim().is_empty())
            .unwrap_or(false);
        let package_changed = self
            .git_stdout(root, &["diff", "--name-only", &base, "--", "package.json"])
            .await
            .map(|out| !out.trim().is_empty())
            .unwrap_or(false);

        let (package_manager, command) = if requirements_changed {
            ("pip", "pip install -r requirements.txt")
        } else if package_changed {
            ("npm", "npm install")
        } else {
            return;
        };

        info!(command, "installing merged dependencies");
        match run_shell(root, command, INSTALL_TIMEOUT).await {
            Ok((exit_code, _output)) => {
                self.bus.publish(
                    Event::orchestrator(EventKind::DepsInstalled)
                        .with("manager", package_manager)
                        .with("exit_code", exit_code)
                        .with_text(format!("{command} exited with {exit_code}")),
                );
            }
            Err(err) => self.post_stage_error(&format!("auto-install failed: {err}")).await,
        }
    }

    // -----------------------------------------------------------------------
    // Post-stage: verification run
    // -----------------------------------------------------------------------

    /// Run the plan's verification command, if any.
    async fn auto_run(&self, req: &DagRequest) {
        let Some(command) = req
            .run_command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
        else {
            return;
        };

        info!(command, "running verification command");
        match run_shell(&req.project_path, command, RUN_TIMEOUT).await {
            Ok((exit_code, output)) => {
                self.bus.publish(
                    Event::orchestrator(EventKind::RunResult)
                        .with("exit_code", exit_code)
                        .with("output", truncate_output(output))
                        .with_text(format!("{command} exited with {exit_code}")),
                );
            }
            Err(err) => {
                self.post_stage_error(&format!("run command failed: {err}"))
                    .await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn git_ok(&self, dir: &Path, args: &[&str]) -> bool {
        match self.git.run_git(dir, args).await {
            Ok(output) => output.success,
            Err(err) => {
                warn!(?args, error = %err, "git command failed");
                false
            }
        }
    }

    async fn git_stdout(&self, dir: &Path, args: &[&str]) -> Option<String> {
        match self.git.run_git(dir, args).await {
            Ok(output) if output.success => Some(output.stdout),
            Ok(output) => {
                warn!(?args, stderr = %output.stderr.trim(), "git command unsuccessful");
                None
            }
            Err(err) => {
                warn!(?args, error = %err, "git command failed");
                None
            }
        }
    }

    /// Post-stage failures are non-fatal: log, broadcast one error, continue.
    async fn post_stage_error(&self, text: &str) {
        error!("{text}");
        self.bus
            .publish(Event::orchestrator(EventKind::Error).with_text(text));
    }
}

// ---------------------------------------------------------------------------
// Per-task worker
// ---------------------------------------------------------------------------

/// One task's lifetime: acquire a concurrency permit, spawn the agent, poll
/// its state to a terminal status, and on success commit the worktree so the
/// merge stage has something to merge. The permit is released on every exit
/// path when it drops.
#[allow(clippy::too_many_arguments)]
async fn run_task(
    task: PlannedTask,
    project_path: PathBuf,
    memory: MemoryDir,
    adapter_name: String,
    project_id: String,
    manager: Arc<AgentManager>,
    bus: EventBus,
    git: Arc<dyn GitRunner>,
    semaphore: Arc<Semaphore>,
    poll_interval: Duration,
) -> (String, bool) {
    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return (task.id, false),
    };

    let agent_id = task.agent_id();
    manager
        .spawn_agent(
            SpawnAgentRequest {
                agent_id: agent_id.clone(),
                project_id: project_id.clone(),
                domain: task.domain,
                label: task.label.clone(),
                task_prompt: task.prompt.clone(),
                project_path: project_path.clone(),
                memory,
                adapter_name,
                skills: Vec::new(),
            },
            &bus,
        )
        .await;

    // Poll until the agent reaches a terminal status.
    let final_state = loop {
        match manager.get_agent(&agent_id, Some(&project_id)).await {
            Some(state) if state.status.is_terminal() => break Some(state),
            Some(_) => tokio::time::sleep(poll_interval).await,
            None => break None,
        }
    };

    let Some(state) = final_state else {
        return (task.id, false);
    };
    let success = state.status == AgentStatus::Done;

    // The coding CLI writes files but never commits; without this commit the
    // merge stage finds no changes on the agent branch.
    if success {
        if let Some(worktree) = state.worktree_path.as_deref() {
            if let Err(err) = commit_worktree(git.as_ref(), Path::new(worktree), &task).await {
                warn!(task_id = %task.id, error = %err, "worktree commit failed");
            }
        }
    }

    (task.id, success)
}

async fn commit_worktree(
    git: &dyn GitRunner,
    worktree: &Path,
    task: &PlannedTask,
) -> Result<(), String> {
    let gitignore = worktree.join(".gitignore");
    if !gitignore.exists() {
        std::fs::write(&gitignore, DEFAULT_GITIGNORE).map_err(|e| e.to_string())?;
    }

    run_git_checked(git, worktree, &["add", "-A"]).await?;
    let msg = format!("agent {}: {}", task.id, task.label);
    run_git_checked(git, worktree, &["commit", "-m", &msg, "--allow-empty"]).await?;
    Ok(())
}

async fn run_git_checked(git: &dyn GitRunner, dir: &Path, args: &[&str]) -> Result<(), String> {
    let output = git.run_git(dir, args).await?;
    if output.success {
        Ok(())
    } else {
        Err(format!("git {} failed: {}", args.join(" "), output.stderr))
    }
}

// ---------------------------------------------------------------------------
// Shell helpers
// ---------------------------------------------------------------------------

async fn run_shell(
    dir: &Path,
    command: &str,
    timeout: Duration,
) -> Result<(i32, String), String> {
    let future = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .output();

    match tokio::time::timeout(timeout, future).await {
        Err(_) => Err(format!("timed out after {}s", timeout.as_secs())),
        Ok(Err(err)) => Err(err.to_string()),
        Ok(Ok(output)) => {
            let mut text = String::from_utf8_lossy(&output.stdout).to_string();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            Ok((output.status.code().unwrap_or(-1), text))
        }
    }
}

fn truncate_output(mut text: String) -> String {
    if text.len() > RUN_OUTPUT_LIMIT {
        let mut end = RUN_OUTPUT_LIMIT;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

fn ordered(dag: &[PlannedTask], set: &HashSet<String>) -> Vec<String> {
    dag.iter()
        .filter(|t| set.contains(&t.id))
        .map(|t| t.id.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use alch_agents::cli_adapter::{AdapterEvent, AgentConfig, CliAdapter};
    use alch_agents::manager::AdapterFactory;
    use alch_bridge::EventKind;
    use alch_core::types::{Domain, TaskKind};
    use alch_core::worktree::GitOutput;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    // -- Mock git: creates worktree dirs, can conflict on chosen merges -----

    struct MockGit {
        commands: Mutex<Vec<Vec<String>>>,
        /// Branch whose plain merge fails once before the theirs retry.
        conflict_branch: Option<String>,
        conflicted: AtomicBool,
    }

    impl MockGit {
        fn new() -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                conflict_branch: None,
                conflicted: AtomicBool::new(false),
            }
        }

        fn with_conflict(branch: &str) -> Self {
            Self {
                conflict_branch: Some(branch.to_string()),
                ..Self::new()
            }
        }

        fn commands(&self) -> Vec<Vec<String>> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GitRunner for MockGit {
        async fn run_git(
            &self,
            _dir: &Path,
            args: &[&str],
        ) -> std::result::Result<GitOutput, String> {
            let argv: Vec<String> = args.iter().map(|s| s.to_string()).collect();
            self.commands.lock().unwrap().push(argv.clone());

            // Materialize the worktree dir so the commit step can write its
            // .gitignore into it.
            if argv.first().map(String::as_str) == Some("worktree")
                && argv.get(1).map(String::as_str) == Some("add")
            {
                let _ = std::fs::create_dir_all(&argv[2]);
            }

            // Scripted conflict: the first plain merge of the chosen branch
            // fails; the retry with --strategy-option theirs succeeds.
            if argv.first().map(String::as_str) == Some("merge")
                && argv.get(1).map(String::as_str) == self.conflict_branch.as_deref()
                && !argv.contains(&"--strategy-option".to_string())
                && !self.conflicted.swap(true, Ordering::SeqCst)
            {
                return Ok(GitOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: "CONFLICT (content): Merge conflict in file.rs".into(),
                });
            }

            Ok(GitOutput {
                success: true,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    // -- Test adapter: optional hold, scripted failure per agent ------------

    #[derive(Debug)]
    struct TestAdapter {
        fail: bool,
        hold: Duration,
        gauge: Option<Arc<Gauge>>,
        tx: flume::Sender<AdapterEvent>,
        rx: flume::Receiver<AdapterEvent>,
        done: Arc<AtomicBool>,
    }

    #[derive(Default, Debug)]
    struct Gauge {
        current: AtomicUsize,
        max: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl TestAdapter {
        fn new(fail: bool, hold: Duration, gauge: Option<Arc<Gauge>>) -> Self {
            let (tx, rx) = flume::unbounded();
            Self {
                fail,
                hold,
                gauge,
                tx,
                rx,
                done: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl CliAdapter for TestAdapter {
        fn name(&self) -> &'static str {
            "test"
        }

        async fn spawn(
            &mut self,
            _worktree: &Path,
            _prompt: &str,
            _config: &AgentConfig,
            agent_id: &str,
        ) -> Result<(), alch_agents::AdapterError> {
            let tx = self.tx.clone();
            let done = Arc::clone(&self.done);
            let fail = self.fail;
            let hold = self.hold;
            let gauge = self.gauge.clone();
            let agent_id = agent_id.to_string();
            tokio::spawn(async move {
                if let Some(g) = &gauge {
                    g.enter();
                }
                tokio::time::sleep(hold).await;
                if let Some(g) = &gauge {
                    g.exit();
                }
                done.store(true, Ordering::SeqCst);
                let (kind, text) = if fail {
                    (EventKind::Error, "agent blew up".to_string())
                } else {
                    (EventKind::Done, "Agent completed".to_string())
                };
                let _ = tx.send(AdapterEvent {
                    agent_id,
                    kind,
                    text,
                });
            });
            Ok(())
        }

        fn stream_events(&self) -> flume::Receiver<AdapterEvent> {
            self.rx.clone()
        }

        async fn is_complete(&self) -> bool {
            self.done.load(Ordering::SeqCst)
        }

        async fn kill(&mut self) {
            self.done.store(true, Ordering::SeqCst);
        }
    }

    /// Factory producing a fresh adapter per spawn; agents listed in
    /// `failing` emit an error instead of done.
    fn factory(failing: &[&str], hold: Duration, gauge: Option<Arc<Gauge>>) -> AdapterFactory {
        let failing: HashSet<String> = failing.iter().map(|s| s.to_string()).collect();
        Arc::new(move |_name| {
            Ok(Box::new(RoutingAdapter {
                failing: failing.clone(),
                hold,
                gauge: gauge.clone(),
                inner: None,
            }) as Box<dyn CliAdapter>)
        })
    }

    /// Defers TestAdapter construction until spawn, when the agent id is
    /// known and failure routing can be decided.
    #[derive(Debug)]
    struct RoutingAdapter {
        failing: HashSet<String>,
        hold: Duration,
        gauge: Option<Arc<Gauge>>,
        inner: Option<TestAdapter>,
    }

    #[async_trait]
    impl CliAdapter for RoutingAdapter {
        fn name(&self) -> &'static str {
            "test"
        }

        async fn spawn(
            &mut self,
            worktree: &Path,
            prompt: &str,
            config: &AgentConfig,
            agent_id: &str,
        ) -> Result<(), alch_agents::AdapterError> {
            let mut adapter = TestAdapter::new(
                self.failing.contains(agent_id),
                self.hold,
                self.gauge.clone(),
            );
            adapter.spawn(worktree, prompt, config, agent_id).await?;
            self.inner = Some(adapter);
            Ok(())
        }

        fn stream_events(&self) -> flume::Receiver<AdapterEvent> {
            match &self.inner {
                Some(adapter) => adapter.stream_events(),
                None => flume::unbounded().1,
            }
        }

        async fn is_complete(&self) -> bool {
            match &self.inner {
                Some(adapter) => adapter.is_complete().await,
                None => false,
            }
        }

        async fn kill(&mut self) {
            if let Some(adapter) = &mut self.inner {
                adapter.kill().await;
            }
        }
    }

    // -- Helpers ------------------------------------------------------------

    fn task(id: &str, domain: Domain, deps: &[&str]) -> PlannedTask {
        PlannedTask {
            id: id.into(),
            label: format!("task {id}"),
            domain,
            kind: TaskKind::Parent,
            parent_id: None,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            prompt: "do it".into(),
        }
    }

    fn executor_with(
        git: Arc<MockGit>,
        adapters: AdapterFactory,
        bus: &EventBus,
    ) -> DagExecutor {
        let manager = Arc::new(AgentManager::with_parts(git.clone(), adapters));
        DagExecutor::with_parts(manager, bus.clone(), git, Duration::from_millis(10))
    }

    fn request(tmp: &tempfile::TempDir, dag: Vec<PlannedTask>, run_command: Option<&str>) -> DagRequest {
        DagRequest {
            dag,
            project_path: tmp.path().to_path_buf(),
            memory: MemoryDir::new(tmp.path()),
            adapter_name: "test".into(),
            project_id: "p1".into(),
            run_command: run_command.map(String::from),
        }
    }

    fn kinds(rx: &flume::Receiver<Event>) -> Vec<EventKind> {
        rx.drain().map(|e| e.kind).collect()
    }

    // -- Tests --------------------------------------------------------------

    #[tokio::test]
    async fn empty_dag_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let events = bus.subscribe();
        let git = Arc::new(MockGit::new());
        let executor = executor_with(git, factory(&[], Duration::ZERO, None), &bus);

        let outcome = executor.execute(request(&tmp, vec![], None)).await;
        assert!(outcome.completed.is_empty());
        assert!(outcome.failed.is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn single_task_completes_commits_and_merges() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let events = bus.subscribe();
        let git = Arc::new(MockGit::new());
        let executor = executor_with(git.clone(), factory(&[], Duration::ZERO, None), &bus);

        let outcome = executor
            .execute(request(&tmp, vec![task("t1", Domain::Backend, &[])], None))
            .await;

        assert_eq!(outcome.completed, vec!["t1"]);
        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.merged, vec!["agent/backend-t1"]);
        assert!(outcome.conflicts.is_empty());

        let commands = git.commands();
        assert!(commands
            .iter()
            .any(|c| c[0] == "add" && c[1] == "-A"));
        assert!(commands
            .iter()
            .any(|c| c[0] == "commit" && c.contains(&"--allow-empty".to_string())));
        assert!(commands
            .iter()
            .any(|c| c == &vec!["checkout".to_string(), "main".to_string()]));
        assert!(commands
            .iter()
            .any(|c| c[0] == "merge" && c[1] == "agent/backend-t1"));

        let kinds = kinds(&events);
        assert!(kinds.contains(&EventKind::DagExecutionStart));
        assert!(kinds.contains(&EventKind::DagExecutionDone));
        assert!(kinds.contains(&EventKind::MissionComplete));
        assert!(kinds.contains(&EventKind::MergeComplete));
        assert!(!kinds.contains(&EventKind::TaskSkipped));
    }

    #[tokio::test]
    async fn failed_dependency_cascades_and_skips_post_stage() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let events = bus.subscribe();
        let git = Arc::new(MockGit::new());
        let executor = executor_with(
            git.clone(),
            factory(&["backend-a"], Duration::ZERO, None),
            &bus,
        );

        let dag = vec![
            task("a", Domain::Backend, &[]),
            task("b", Domain::Frontend, &["a"]),
            task("c", Domain::Security, &["b"]),
        ];
        let outcome = executor.execute(request(&tmp, dag, None)).await;

        assert!(outcome.completed.is_empty());
        assert_eq!(outcome.failed, vec!["a", "b", "c"]);
        assert!(outcome.merged.is_empty());

        let all: Vec<Event> = events.drain().collect();
        let skipped: Vec<&Event> = all
            .iter()
            .filter(|e| e.kind == EventKind::TaskSkipped)
            .collect();
        assert_eq!(skipped.len(), 2, "one task_skipped per transitive dependent");

        let mission_complete = all
            .iter()
            .find(|e| e.kind == EventKind::MissionComplete)
            .unwrap();
        assert_eq!(mission_complete.fields["success"], false);

        // No merge was attempted.
        assert!(!git.commands().iter().any(|c| c[0] == "merge"));
    }

    #[tokio::test]
    async fn self_cycle_trips_the_liveness_break() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let events = bus.subscribe();
        let git = Arc::new(MockGit::new());
        let executor = executor_with(git, factory(&[], Duration::ZERO, None), &bus);

        let dag = vec![
            task("x", Domain::Backend, &["y"]),
            task("y", Domain::Backend, &["x"]),
        ];
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            executor.execute(request(&tmp, dag, None)),
        )
        .await
        .expect("cycle must not hang the scheduler");

        assert!(outcome.completed.is_empty());
        let kinds = kinds(&events);
        assert!(kinds.contains(&EventKind::DagExecutionDone));
    }

    #[tokio::test]
    async fn concurrency_stays_within_the_semaphore_bound() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let git = Arc::new(MockGit::new());
        let gauge = Arc::new(Gauge::default());
        let executor = executor_with(
            git,
            factory(&[], Duration::from_millis(100), Some(gauge.clone())),
            &bus,
        );

        let dag: Vec<PlannedTask> = (1..=6)
            .map(|i| task(&format!("t{i}"), Domain::Backend, &[]))
            .collect();
        let outcome = executor.execute(request(&tmp, dag, None)).await;

        assert_eq!(outcome.completed.len(), 6);
        assert!(outcome.failed.is_empty());
        assert!(
            gauge.max.load(Ordering::SeqCst) <= MAX_CONCURRENT_AGENTS,
            "observed {} concurrent agents",
            gauge.max.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn merge_conflict_recovers_with_theirs() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let events = bus.subscribe();
        let git = Arc::new(MockGit::with_conflict("agent/frontend-t2"));
        let executor = executor_with(git.clone(), factory(&[], Duration::ZERO, None), &bus);

        let dag = vec![
            task("t1", Domain::Backend, &[]),
            task("t2", Domain::Frontend, &[]),
        ];
        let outcome = executor.execute(request(&tmp, dag, None)).await;

        assert_eq!(
            outcome.merged,
            vec!["agent/backend-t1", "agent/frontend-t2"]
        );
        assert!(outcome.conflicts.is_empty());

        let commands = git.commands();
        assert!(commands
            .iter()
            .any(|c| c == &vec!["merge".to_string(), "--abort".to_string()]));
        assert!(commands
            .iter()
            .any(|c| c[0] == "merge" && c.contains(&"--strategy-option".to_string())));

        let all: Vec<Event> = events.drain().collect();
        let merge_complete = all
            .iter()
            .find(|e| e.kind == EventKind::MergeComplete)
            .unwrap();
        assert_eq!(
            merge_complete.fields["merged"].as_array().unwrap().len(),
            2
        );
        assert!(merge_complete.fields["conflicts"]
            .as_array()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn run_command_broadcasts_run_result() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let events = bus.subscribe();
        let git = Arc::new(MockGit::new());
        let executor = executor_with(git, factory(&[], Duration::ZERO, None), &bus);

        let outcome = executor
            .execute(request(
                &tmp,
                vec![task("t1", Domain::Backend, &[])],
                Some("echo ok"),
            ))
            .await;
        assert_eq!(outcome.completed, vec!["t1"]);

        let all: Vec<Event> = events.drain().collect();
        let run_result = all
            .iter()
            .find(|e| e.kind == EventKind::RunResult)
            .expect("run_result event");
        assert_eq!(run_result.fields["exit_code"], 0);
        assert!(run_result.fields["output"]
            .as_str()
            .unwrap()
            .contains("ok"));
    }

    #[test]
    fn truncate_output_respects_char_boundaries() {
        let text = "é".repeat(RUN_OUTPUT_LIMIT); // 2 bytes per char
        let truncated = truncate_output(text);
        assert!(truncated.len() <= RUN_OUTPUT_LIMIT);
        assert!(truncated.chars().all(|c| c == 'é'));
    }
}
