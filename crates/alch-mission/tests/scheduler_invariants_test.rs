//! Scheduler invariant checks through the public API: dependency safety,
//! disjoint accounting, and terminal-event ordering over a diamond DAG.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use alch_agents::cli_adapter::{AdapterError, AdapterEvent, AgentConfig, CliAdapter};
use alch_agents::manager::{AdapterFactory, AgentManager};
use alch_bridge::{Event, EventBus, EventKind};
use alch_core::memory::MemoryDir;
use alch_core::types::{Domain, PlannedTask, TaskKind};
use alch_core::worktree::{GitOutput, GitRunner};
use alch_mission::{DagExecutor, DagRequest};

struct NoopGit;

#[async_trait]
impl GitRunner for NoopGit {
    async fn run_git(&self, _dir: &Path, args: &[&str]) -> Result<GitOutput, String> {
        if args.first() == Some(&"worktree") && args.get(1) == Some(&"add") {
            let _ = std::fs::create_dir_all(args[2]);
        }
        Ok(GitOutput {
            success: true,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

/// Emits `done` a short while after spawn, so ordering between tasks is
/// observable on the bus.
#[derive(Debug)]
struct SlowDoneAdapter {
    tx: flume::Sender<AdapterEvent>,
    rx: flume::Receiver<AdapterEvent>,
    done: Arc<AtomicBool>,
}

impl SlowDoneAdapter {
    fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            done: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl CliAdapter for SlowDoneAdapter {
    fn name(&self) -> &'static str {
        "slow-done"
    }

    async fn spawn(
        &mut self,
        _worktree: &Path,
        _prompt: &str,
        _config: &AgentConfig,
        agent_id: &str,
    ) -> Result<(), AdapterError> {
        let tx = self.tx.clone();
        let done = Arc::clone(&self.done);
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            done.store(true, Ordering::SeqCst);
            let _ = tx.send(AdapterEvent {
                agent_id,
                kind: EventKind::Done,
                text: "Agent completed".into(),
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

#[tokio::test]
async fn diamond_dag_spawns_dependents_only_after_dependencies_complete() {
    let tmp = tempfile::tempdir().unwrap();
    let bus = EventBus::new();
    let events = bus.subscribe();

    let git: Arc<dyn GitRunner> = Arc::new(NoopGit);
    let factory: AdapterFactory =
        Arc::new(|_| Ok(Box::new(SlowDoneAdapter::new()) as Box<dyn CliAdapter>));
    let manager = Arc::new(AgentManager::with_parts(Arc::clone(&git), factory));
    let executor =
        DagExecutor::with_parts(manager, bus.clone(), git, Duration::from_millis(10));

    let dag = vec![
        task("t1", Domain::Backend, &[]),
        task("t2", Domain::Backend, &["t1"]),
        task("t3", Domain::Frontend, &["t1"]),
        task("t4", Domain::Security, &["t2", "t3"]),
    ];
    let outcome = executor
        .execute(DagRequest {
            dag,
            project_path: tmp.path().to_path_buf(),
            memory: MemoryDir::new(tmp.path()),
            adapter_name: "slow-done".into(),
            project_id: "p1".into(),
            run_command: None,
        })
        .await;

    // Disjoint accounting covering the whole plan.
    assert_eq!(outcome.completed, vec!["t1", "t2", "t3", "t4"]);
    assert!(outcome.failed.is_empty());

    let all: Vec<Event> = events.drain().collect();
    let position = |kind: EventKind, agent: &str| {
        all.iter()
            .position(|e| e.kind == kind && e.agent_id == agent)
            .unwrap_or_else(|| panic!("missing {kind} for {agent}"))
    };

    // Dependency safety, observed as event order: no dependent spawns
    // before every one of its dependencies is done.
    let t1_done = position(EventKind::Done, "backend-t1");
    assert!(position(EventKind::Spawn, "backend-t2") > t1_done);
    assert!(position(EventKind::Spawn, "frontend-t3") > t1_done);

    let t4_spawn = position(EventKind::Spawn, "security-t4");
    assert!(t4_spawn > position(EventKind::Done, "backend-t2"));
    assert!(t4_spawn > position(EventKind::Done, "frontend-t3"));

    // Exactly one terminal event per agent.
    for agent in ["backend-t1", "backend-t2", "frontend-t3", "security-t4"] {
        let terminals = all
            .iter()
            .filter(|e| e.agent_id == agent && e.kind.is_terminal())
            .count();
        assert_eq!(terminals, 1, "agent {agent} must emit exactly one terminal");
    }
}
