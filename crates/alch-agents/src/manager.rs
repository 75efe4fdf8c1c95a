//! Agent manager — lifecycle of every spawned coding agent.
//!
//! Owns the per-project agent state map and the background relay workers
//! that pump adapter events onto the broadcast bus. The spawn sequence:
//! record in `spawning`, create the worktree, build the domain prompt,
//! select and spawn the adapter (mock under demo mode), then relay the
//! event stream until its terminal event.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info};

use alch_bridge::{Event, EventBus, EventKind};
use alch_core::config;
use alch_core::memory::MemoryDir;
use alch_core::types::{AgentState, AgentStatus, AgentSummary, Domain};
use alch_core::worktree::{GitRunner, RealGitRunner, WorktreeError, WorktreeManager};

use crate::cli_adapter::{get_adapter, AdapterError, AdapterEvent, AgentConfig, CliAdapter};
use crate::prompts::build_prompt;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),
}

// ---------------------------------------------------------------------------
// SpawnAgentRequest
// ---------------------------------------------------------------------------

/// Everything needed to bring one agent up for one task.
pub struct SpawnAgentRequest {
    pub agent_id: String,
    pub project_id: String,
    pub domain: Domain,
    pub label: String,
    pub task_prompt: String,
    pub project_path: PathBuf,
    pub memory: MemoryDir,
    pub adapter_name: String,
    pub skills: Vec<String>,
}

// ---------------------------------------------------------------------------
// AgentManager
// ---------------------------------------------------------------------------

/// Constructor registry injected for tests; the default resolves through
/// [`get_adapter`].
pub type AdapterFactory =
    Arc<dyn Fn(&str) -> Result<Box<dyn CliAdapter>, AdapterError> + Send + Sync>;

type AgentMap = HashMap<String, HashMap<String, AgentState>>;

pub struct AgentManager {
    /// project_id -> agent_id -> state
    agents: Arc<Mutex<AgentMap>>,
    relays: Arc<Mutex<HashMap<String, tokio::task::JoinHandle<()>>>>,
    adapters: Arc<Mutex<HashMap<String, Box<dyn CliAdapter>>>>,
    git: Arc<dyn GitRunner>,
    factory: AdapterFactory,
}

impl AgentManager {
    pub fn new() -> Self {
        Self::with_parts(Arc::new(RealGitRunner), Arc::new(get_adapter))
    }

    /// Inject a git runner and adapter factory (for testing).
    pub fn with_parts(git: Arc<dyn GitRunner>, factory: AdapterFactory) -> Self {
        Self {
            agents: Arc::new(Mutex::new(HashMap::new())),
            relays: Arc::new(Mutex::new(HashMap::new())),
            adapters: Arc::new(Mutex::new(HashMap::new())),
            git,
            factory,
        }
    }

    /// Look up one agent's state. With a project id the lookup is scoped;
    /// without it, all projects are searched (used by the scheduler poll).
    pub async fn get_agent(&self, agent_id: &str, project_id: Option<&str>) -> Option<AgentState> {
        let agents = self.agents.lock().await;
        match project_id {
            Some(pid) => agents.get(pid).and_then(|m| m.get(agent_id)).cloned(),
            None => agents.values().find_map(|m| m.get(agent_id)).cloned(),
        }
    }

    /// Summaries of all agents, optionally scoped to one project.
    pub async fn list_agents(&self, project_id: Option<&str>) -> Vec<AgentSummary> {
        let agents = self.agents.lock().await;
        match project_id {
            Some(pid) => agents
                .get(pid)
                .map(|m| m.values().map(AgentState::summary).collect())
                .unwrap_or_default(),
            None => agents
                .values()
                .flat_map(|m| m.values().map(AgentState::summary))
                .collect(),
        }
    }

    /// Spawn an agent: worktree, prompt, adapter, relay. Failures along the
    /// spawn path mark the agent `failed` and broadcast an `error`; the
    /// returned snapshot reflects the outcome.
    pub async fn spawn_agent(&self, req: SpawnAgentRequest, bus: &EventBus) -> AgentState {
        let state = AgentState::spawning(
            &req.agent_id,
            &req.project_id,
            req.domain,
            &req.label,
            &req.task_prompt,
        );
        {
            let mut agents = self.agents.lock().await;
            agents
                .entry(req.project_id.clone())
                .or_default()
                .insert(req.agent_id.clone(), state.clone());
        }

        bus.publish(
            Event::agent(&req.agent_id, EventKind::Spawn)
                .with("domain", req.domain.as_str())
                .with("label", req.label.clone())
                .with("project_id", req.project_id.clone()),
        );

        if let Err(err) = self.launch(&req, bus).await {
            error!(agent_id = %req.agent_id, error = %err, "agent spawn failed");
            {
                let mut agents = self.agents.lock().await;
                if let Some(state) = agents
                    .get_mut(&req.project_id)
                    .and_then(|m| m.get_mut(&req.agent_id))
                {
                    state.mark_failed(format!("Spawn failed: {err}"));
                }
            }
            bus.publish(
                Event::agent(&req.agent_id, EventKind::Error)
                    .with_text(format!("Spawn failed: {err}"))
                    .with("project_id", req.project_id.clone()),
            );
        }

        self.get_agent(&req.agent_id, Some(&req.project_id))
            .await
            .unwrap_or(state)
    }

    async fn launch(&self, req: &SpawnAgentRequest, bus: &EventBus) -> Result<(), ManagerError> {
        let worktrees =
            WorktreeManager::with_git_runner(req.project_path.clone(), Arc::clone(&self.git));
        let wt_path = worktrees.create_worktree(&req.agent_id).await?;
        let branch = format!("agent/{}", req.agent_id);

        let todos = req.memory.read_todos();
        let full_prompt = build_prompt(
            req.domain.as_str(),
            &req.task_prompt,
            &req.memory,
            &req.skills,
            &todos,
        );

        let adapter_name = if config::demo_mode() {
            "mock"
        } else {
            req.adapter_name.as_str()
        };
        let mut adapter = (self.factory)(adapter_name)?;
        let agent_config = AgentConfig {
            skills: req.skills.clone(),
            ..AgentConfig::default()
        };

        adapter
            .spawn(&wt_path, &full_prompt, &agent_config, &req.agent_id)
            .await?;
        let rx = adapter.stream_events();
        self.adapters
            .lock()
            .await
            .insert(req.agent_id.clone(), adapter);

        {
            let mut agents = self.agents.lock().await;
            if let Some(state) = agents
                .get_mut(&req.project_id)
                .and_then(|m| m.get_mut(&req.agent_id))
            {
                state.worktree_path = Some(wt_path.to_string_lossy().to_string());
                state.branch = Some(branch.clone());
                state.status = AgentStatus::Active;
            }
        }

        info!(agent_id = %req.agent_id, branch = %branch, "agent active");
        bus.publish(
            Event::agent(&req.agent_id, EventKind::Status)
                .with_text(format!("Agent {} active in {}", req.agent_id, branch))
                .with("status", "active")
                .with("worktree", wt_path.to_string_lossy().to_string())
                .with("branch", branch)
                .with("project_id", req.project_id.clone()),
        );

        let relay = tokio::spawn(relay_events(
            Arc::clone(&self.agents),
            bus.clone(),
            rx,
            req.agent_id.clone(),
            req.project_id.clone(),
        ));
        self.relays.lock().await.insert(req.agent_id.clone(), relay);

        Ok(())
    }

    /// Kill a running agent: cancel the relay, terminate the process, mark
    /// the state failed. Returns false when the agent is unknown.
    pub async fn kill_agent(&self, agent_id: &str) -> bool {
        if let Some(handle) = self.relays.lock().await.remove(agent_id) {
            handle.abort();
        }
        let adapter = self.adapters.lock().await.remove(agent_id);
        if let Some(mut adapter) = adapter {
            adapter.kill().await;
        }

        let mut agents = self.agents.lock().await;
        for project_agents in agents.values_mut() {
            if let Some(state) = project_agents.get_mut(agent_id) {
                state.mark_failed("Killed by user");
                info!(agent_id, "agent killed");
                return true;
            }
        }
        false
    }
}

impl Default for AgentManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Pump one agent's adapter events: append to the output tail, apply
/// terminal transitions, and broadcast each event enriched with the agent id
/// and a fresh timestamp.
async fn relay_events(
    agents: Arc<Mutex<AgentMap>>,
    bus: EventBus,
    rx: flume::Receiver<AdapterEvent>,
    agent_id: String,
    project_id: String,
) {
    while let Ok(event) = rx.recv_async().await {
        {
            let mut map = agents.lock().await;
            if let Some(state) = map
                .get_mut(&project_id)
                .and_then(|m| m.get_mut(&agent_id))
            {
                state.push_output(event.text.clone());
                match event.kind {
                    EventKind::Done => state.mark_done(),
                    EventKind::Error => state.mark_failed(event.text.clone()),
                    _ => {}
                }
            }
        }

        bus.publish(Event::agent(&agent_id, event.kind).with_text(event.text));

        if event.kind.is_terminal() {
            return;
        }
    }

    // The channel closed without a terminal event: the adapter went away
    // mid-stream. Fail the agent so the scheduler observes a terminal state.
    let failed_now = {
        let mut map = agents.lock().await;
        map.get_mut(&project_id)
            .and_then(|m| m.get_mut(&agent_id))
            .map(|state| {
                if state.status.is_terminal() {
                    false
                } else {
                    state.mark_failed("Agent event stream ended unexpectedly");
                    true
                }
            })
            .unwrap_or(false)
    };
    if failed_now {
        error!(agent_id = %agent_id, "agent event stream ended without terminal event");
        bus.publish(
            Event::agent(&agent_id, EventKind::Error)
                .with_text("Agent event stream ended unexpectedly"),
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use alch_core::worktree::GitOutput;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct MockGitRunner;

    #[async_trait]
    impl GitRunner for MockGitRunner {
        async fn run_git(
            &self,
            _dir: &Path,
            _args: &[&str],
        ) -> std::result::Result<GitOutput, String> {
            Ok(GitOutput {
                success: true,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    /// Adapter that emits a scripted sequence immediately on spawn.
    #[derive(Debug)]
    struct ScriptedAdapter {
        script: Vec<(EventKind, String)>,
        tx: flume::Sender<AdapterEvent>,
        rx: flume::Receiver<AdapterEvent>,
        done: Arc<AtomicBool>,
    }

    impl ScriptedAdapter {
        fn new(script: Vec<(EventKind, String)>) -> Self {
            let (tx, rx) = flume::unbounded();
            Self {
                script,
                tx,
                rx,
                done: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl CliAdapter for ScriptedAdapter {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn spawn(
            &mut self,
            _worktree: &Path,
            _prompt: &str,
            _config: &AgentConfig,
            agent_id: &str,
        ) -> Result<(), AdapterError> {
            for (kind, text) in self.script.drain(..) {
                let _ = self.tx.send(AdapterEvent {
                    agent_id: agent_id.to_string(),
                    kind,
                    text,
                });
            }
            self.done.store(true, Ordering::SeqCst);
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

    fn scripted_factory(script: Vec<(EventKind, String)>) -> AdapterFactory {
        let script = std::sync::Mutex::new(Some(script));
        Arc::new(move |_name| {
            let script = script.lock().unwrap().take().unwrap_or_default();
            Ok(Box::new(ScriptedAdapter::new(script)) as Box<dyn CliAdapter>)
        })
    }

    fn request(tmp: &tempfile::TempDir, agent_id: &str) -> SpawnAgentRequest {
        SpawnAgentRequest {
            agent_id: agent_id.to_string(),
            project_id: "p1".into(),
            domain: Domain::Backend,
            label: "implement endpoint".into(),
            task_prompt: "add /hello".into(),
            project_path: tmp.path().to_path_buf(),
            memory: MemoryDir::new(tmp.path()),
            adapter_name: "vibe".into(),
            skills: vec![],
        }
    }

    async fn wait_for_terminal(manager: &AgentManager, agent_id: &str) -> AgentState {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(state) = manager.get_agent(agent_id, Some("p1")).await {
                    if state.status.is_terminal() {
                        return state;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("agent never reached a terminal state")
    }

    #[tokio::test]
    async fn spawn_agent_runs_to_done() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = AgentManager::with_parts(
            Arc::new(MockGitRunner),
            scripted_factory(vec![
                (EventKind::Think, "planning".into()),
                (EventKind::Done, "Agent completed".into()),
            ]),
        );
        let bus = EventBus::new();
        let events = bus.subscribe();

        let state = manager.spawn_agent(request(&tmp, "backend-t1"), &bus).await;
        assert_eq!(state.branch.as_deref(), Some("agent/backend-t1"));
        assert!(state.worktree_path.is_some());

        let final_state = wait_for_terminal(&manager, "backend-t1").await;
        assert_eq!(final_state.status, AgentStatus::Done);
        assert_eq!(final_state.validation_level, 1);
        assert!(final_state.completed_at.is_some());
        assert!(final_state
            .output_lines
            .iter()
            .any(|l| l.contains("planning")));

        let kinds: Vec<EventKind> = events.drain().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::Spawn));
        assert!(kinds.contains(&EventKind::Status));
        assert!(kinds.contains(&EventKind::Think));
        assert!(kinds.contains(&EventKind::Done));
        assert!(!kinds.contains(&EventKind::Error));
    }

    #[tokio::test]
    async fn error_event_marks_agent_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = AgentManager::with_parts(
            Arc::new(MockGitRunner),
            scripted_factory(vec![(EventKind::Error, "Vibe exited with code 1".into())]),
        );
        let bus = EventBus::new();

        manager.spawn_agent(request(&tmp, "backend-t1"), &bus).await;
        let state = wait_for_terminal(&manager, "backend-t1").await;
        assert_eq!(state.status, AgentStatus::Failed);
        assert!(state.error.as_deref().unwrap().contains("code 1"));
        assert_eq!(state.validation_level, 0);
    }

    #[tokio::test]
    async fn unknown_adapter_fails_the_spawn() {
        let tmp = tempfile::tempdir().unwrap();
        let manager =
            AgentManager::with_parts(Arc::new(MockGitRunner), Arc::new(get_adapter));
        let bus = EventBus::new();
        let events = bus.subscribe();

        let mut req = request(&tmp, "backend-t1");
        req.adapter_name = "no-such-cli".into();
        let state = manager.spawn_agent(req, &bus).await;

        assert_eq!(state.status, AgentStatus::Failed);
        assert!(state.error.as_deref().unwrap().contains("no-such-cli"));
        let kinds: Vec<EventKind> = events.drain().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::Error));
    }

    #[tokio::test]
    async fn kill_agent_records_killed_by_user() {
        let tmp = tempfile::tempdir().unwrap();
        // No terminal event: the agent stays active until killed.
        let manager = AgentManager::with_parts(
            Arc::new(MockGitRunner),
            scripted_factory(vec![(EventKind::Think, "working".into())]),
        );
        let bus = EventBus::new();

        manager.spawn_agent(request(&tmp, "backend-t1"), &bus).await;
        assert!(manager.kill_agent("backend-t1").await);

        let state = manager.get_agent("backend-t1", Some("p1")).await.unwrap();
        assert_eq!(state.status, AgentStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("Killed by user"));
        assert!(state.completed_at.is_some());

        assert!(!manager.kill_agent("ghost").await);
    }

    #[tokio::test]
    async fn list_agents_is_project_scoped() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = AgentManager::with_parts(
            Arc::new(MockGitRunner),
            scripted_factory(vec![(EventKind::Done, "done".into())]),
        );
        let bus = EventBus::new();
        manager.spawn_agent(request(&tmp, "backend-t1"), &bus).await;

        assert_eq!(manager.list_agents(Some("p1")).await.len(), 1);
        assert!(manager.list_agents(Some("other")).await.is_empty());
        assert_eq!(manager.list_agents(None).await.len(), 1);
    }
}
