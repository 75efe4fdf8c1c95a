use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The `agent_id` used for events emitted by the pipeline/executor rather
/// than an individual agent.
pub const ORCHESTRATOR_ID: &str = "orchestrator";

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

/// Every event type that crosses the broadcast channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // Agent + pipeline status
    Status,
    Spawn,
    Thinking,
    Reprompt,
    DagUpdate,
    ContractUpdate,
    MemoryUpdate,
    Ready,
    // Scheduler
    DagExecutionStart,
    TaskSkipped,
    DagExecutionDone,
    MissionComplete,
    // Post-DAG integration
    MergeComplete,
    DepsInstalled,
    RunResult,
    // Codebase scanner
    Scanning,
    FilesUpdated,
    ScanComplete,
    // Conversation
    Assistant,
    // Agent output stream
    Think,
    Bash,
    Code,
    Output,
    // Terminals
    Done,
    Error,
}

impl EventKind {
    /// Terminal kinds for one agent's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::Done | EventKind::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Status => "status",
            EventKind::Spawn => "spawn",
            EventKind::Thinking => "thinking",
            EventKind::Reprompt => "reprompt",
            EventKind::DagUpdate => "dag_update",
            EventKind::ContractUpdate => "contract_update",
            EventKind::MemoryUpdate => "memory_update",
            EventKind::Ready => "ready",
            EventKind::DagExecutionStart => "dag_execution_start",
            EventKind::TaskSkipped => "task_skipped",
            EventKind::DagExecutionDone => "dag_execution_done",
            EventKind::MissionComplete => "mission_complete",
            EventKind::MergeComplete => "merge_complete",
            EventKind::DepsInstalled => "deps_installed",
            EventKind::RunResult => "run_result",
            EventKind::Scanning => "scanning",
            EventKind::FilesUpdated => "files_updated",
            EventKind::ScanComplete => "scan_complete",
            EventKind::Assistant => "assistant",
            EventKind::Think => "think",
            EventKind::Bash => "bash",
            EventKind::Code => "code",
            EventKind::Output => "output",
            EventKind::Done => "done",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// One broadcast event: `agent_id`, `type`, ISO-8601 `timestamp`, and a flat
/// set of type-dependent payload fields serialized at the top level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub agent_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Event {
    /// An event attributed to a specific agent, timestamped now.
    pub fn agent(agent_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            agent_id: agent_id.into(),
            kind,
            timestamp: Utc::now(),
            fields: Map::new(),
        }
    }

    /// An event attributed to the orchestrator, timestamped now.
    pub fn orchestrator(kind: EventKind) -> Self {
        Self::agent(ORCHESTRATOR_ID, kind)
    }

    /// Attach an arbitrary payload field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Attach the conventional human-readable `text` field.
    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with("text", text.into())
    }

    /// Read back a string payload field.
    pub fn text(&self) -> Option<&str> {
        self.fields.get("text").and_then(|v| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
