//! CLI adapter pattern for driving coding-agent subprocesses.
//!
//! An adapter owns one subprocess for one agent and exposes exactly four
//! operations: spawn, stream classified events, completion check, kill.
//! Two implementations exist: [`VibeAdapter`] shells out to the Vibe CLI,
//! [`MockAdapter`] replays a canned session for demo mode. Adapters are
//! selected by name through [`get_adapter`]; unknown names fail at lookup.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use alch_bridge::EventKind;

/// Stderr lines retained for the failure summary.
const STDERR_TAIL: usize = 50;

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Errors / config / events
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unknown CLI adapter: {0:?} (available: vibe, mock)")]
    UnknownAdapter(String),
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
}

/// Configuration for spawning an agent subprocess.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_turns: u32,
    pub max_price: f64,
    pub skills: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 50,
            max_price: 5.0,
            skills: Vec::new(),
        }
    }
}

/// One event from an agent's output stream.
#[derive(Debug, Clone)]
pub struct AdapterEvent {
    pub agent_id: String,
    pub kind: EventKind,
    pub text: String,
}

// ---------------------------------------------------------------------------
// CliAdapter trait
// ---------------------------------------------------------------------------

/// Capability over a coding-agent subprocess.
///
/// The event sequence ends with exactly one terminal event (`done` or
/// `error`); nothing follows it.
#[async_trait]
pub trait CliAdapter: Send + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Launch the agent process in the given worktree.
    async fn spawn(
        &mut self,
        worktree: &Path,
        prompt: &str,
        config: &AgentConfig,
        agent_id: &str,
    ) -> Result<(), AdapterError>;

    /// The lazy event sequence for this agent. May be taken before or after
    /// `spawn`; events buffer until consumed.
    fn stream_events(&self) -> flume::Receiver<AdapterEvent>;

    /// Whether the underlying process has finished.
    async fn is_complete(&self) -> bool;

    /// Terminate the process: SIGTERM, then SIGKILL after the grace period.
    async fn kill(&mut self);
}

/// Classify one stdout line into its event kind by prefix.
pub fn classify_line(line: &str) -> EventKind {
    if line.starts_with("Thinking") || line.starts_with('>') {
        EventKind::Think
    } else if line.starts_with("$ ") || line.starts_with("Running:") {
        EventKind::Bash
    } else if line.starts_with("Writing") || line.starts_with("Editing") {
        EventKind::Code
    } else {
        EventKind::Output
    }
}

// ---------------------------------------------------------------------------
// VibeAdapter
// ---------------------------------------------------------------------------

/// Adapter for the Vibe CLI (Devstral).
///
/// Command shape: `vibe --prompt <prompt> --max-turns N --max-price P`, run
/// with the worktree as cwd. The prompt goes through an argv element, not a
/// shell string, so no quoting is needed; credentials reach the subprocess
/// through the inherited environment.
#[derive(Debug)]
pub struct VibeAdapter {
    binary: String,
    tx: flume::Sender<AdapterEvent>,
    rx: flume::Receiver<AdapterEvent>,
    done: Arc<AtomicBool>,
    pid: Arc<AtomicI32>,
}

impl VibeAdapter {
    pub fn new() -> Self {
        Self::with_binary("vibe")
    }

    /// Use a different binary (tests point this at a stub script).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            binary: binary.into(),
            tx,
            rx,
            done: Arc::new(AtomicBool::new(false)),
            pid: Arc::new(AtomicI32::new(0)),
        }
    }
}

impl Default for VibeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CliAdapter for VibeAdapter {
    fn name(&self) -> &'static str {
        "vibe"
    }

    async fn spawn(
        &mut self,
        worktree: &Path,
        prompt: &str,
        config: &AgentConfig,
        agent_id: &str,
    ) -> Result<(), AdapterError> {
        self.done.store(false, Ordering::SeqCst);

        info!(
            agent_id,
            cwd = %worktree.display(),
            prompt_len = prompt.len(),
            max_turns = config.max_turns,
            max_price = config.max_price,
            "spawning vibe process"
        );

        let mut child = Command::new(&self.binary)
            .arg("--prompt")
            .arg(prompt)
            .arg("--max-turns")
            .arg(config.max_turns.to_string())
            .arg("--max-price")
            .arg(config.max_price.to_string())
            .current_dir(worktree)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| AdapterError::SpawnFailed(e.to_string()))?;

        self.pid
            .store(child.id().map(|p| p as i32).unwrap_or(0), Ordering::SeqCst);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AdapterError::SpawnFailed("no stdout pipe".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AdapterError::SpawnFailed("no stderr pipe".into()))?;

        let tx = self.tx.clone();
        let done = Arc::clone(&self.done);
        let agent_id = agent_id.to_string();

        tokio::spawn(async move {
            // Drain stderr concurrently into a bounded tail.
            let stderr_tail: Arc<Mutex<VecDeque<String>>> =
                Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL)));
            let tail = Arc::clone(&stderr_tail);
            let stderr_task = tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let mut tail = tail.lock().expect("stderr tail lock");
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });

            let mut line_count = 0usize;
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(raw)) = lines.next_line().await {
                let line = raw.trim_end();
                if line.is_empty() {
                    continue;
                }
                line_count += 1;
                let _ = tx.send(AdapterEvent {
                    agent_id: agent_id.clone(),
                    kind: classify_line(line),
                    text: line.to_string(),
                });
            }

            // Stdout closed: wait for exit and the stderr drain.
            let status = child.wait().await;
            let _ = stderr_task.await;

            let exit_code = status.as_ref().ok().and_then(|s| s.code());
            let success = status.map(|s| s.success()).unwrap_or(false);
            done.store(true, Ordering::SeqCst);

            if success {
                let _ = tx.send(AdapterEvent {
                    agent_id: agent_id.clone(),
                    kind: EventKind::Done,
                    text: format!("Agent completed ({line_count} output lines)"),
                });
            } else {
                let tail: Vec<String> = {
                    let tail = stderr_tail.lock().expect("stderr tail lock");
                    tail.iter().rev().take(3).rev().cloned().collect()
                };
                let code = exit_code.unwrap_or(-1);
                let summary = if tail.is_empty() {
                    format!("exit code {code}")
                } else {
                    tail.join("; ")
                };
                warn!(agent_id = %agent_id, code, "vibe process failed");
                let _ = tx.send(AdapterEvent {
                    agent_id: agent_id.clone(),
                    kind: EventKind::Error,
                    text: format!("Vibe exited with code {code}: {summary}"),
                });
            }
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
        if self.done.load(Ordering::SeqCst) {
            return;
        }
        let pid = self.pid.load(Ordering::SeqCst);
        if pid <= 0 {
            self.done.store(true, Ordering::SeqCst);
            return;
        }

        info!(pid, "terminating vibe process");
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }

        let deadline = tokio::time::Instant::now() + KILL_GRACE;
        while tokio::time::Instant::now() < deadline {
            if self.done.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        warn!(pid, "grace period elapsed, sending SIGKILL");
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }
}

// ---------------------------------------------------------------------------
// MockAdapter
// ---------------------------------------------------------------------------

/// Interval between canned mock events.
const MOCK_STEP_DELAY: Duration = Duration::from_millis(1500);

/// Demo-mode adapter that simulates agent work with a fixed six-step session.
#[derive(Debug)]
pub struct MockAdapter {
    tx: flume::Sender<AdapterEvent>,
    rx: flume::Receiver<AdapterEvent>,
    done: Arc<AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            done: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CliAdapter for MockAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn spawn(
        &mut self,
        worktree: &Path,
        prompt: &str,
        _config: &AgentConfig,
        agent_id: &str,
    ) -> Result<(), AdapterError> {
        info!(agent_id, worktree = %worktree.display(), "mock spawn");
        self.done.store(false, Ordering::SeqCst);

        let snippet: String = prompt.chars().take(80).collect();
        let steps: Vec<(EventKind, String)> = vec![
            (EventKind::Think, format!("Analyzing task: {snippet}...")),
            (EventKind::Think, "Reading project structure...".into()),
            (EventKind::Bash, "$ ls -la src/".into()),
            (EventKind::Code, "Writing implementation...".into()),
            (EventKind::Bash, "$ npm test".into()),
            (EventKind::Output, "All tests passed.".into()),
        ];

        let tx = self.tx.clone();
        let done = Arc::clone(&self.done);
        let agent_id = agent_id.to_string();
        self.task = Some(tokio::spawn(async move {
            for (kind, text) in steps {
                tokio::time::sleep(MOCK_STEP_DELAY).await;
                let _ = tx.send(AdapterEvent {
                    agent_id: agent_id.clone(),
                    kind,
                    text,
                });
            }
            done.store(true, Ordering::SeqCst);
            let _ = tx.send(AdapterEvent {
                agent_id: agent_id.clone(),
                kind: EventKind::Done,
                text: "Agent completed (mock)".into(),
            });
        }));

        Ok(())
    }

    fn stream_events(&self) -> flume::Receiver<AdapterEvent> {
        self.rx.clone()
    }

    async fn is_complete(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    async fn kill(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.done.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Construct a CLI adapter by name. Unknown names fail here, before any
/// process is spawned.
pub fn get_adapter(name: &str) -> Result<Box<dyn CliAdapter>, AdapterError> {
    match name {
        "vibe" => Ok(Box::new(VibeAdapter::new())),
        "mock" => Ok(Box::new(MockAdapter::new())),
        other => Err(AdapterError::UnknownAdapter(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
