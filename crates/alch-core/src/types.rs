use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Domain
// ---------------------------------------------------------------------------

/// The agent domain a task is routed to.
///
/// The orchestrator model is constrained to exactly these four values; an
/// unknown domain in a plan response is a parse failure (and triggers the
/// mock-plan fallback upstream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Frontend,
    Backend,
    Security,
    Infra,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Frontend => "frontend",
            Domain::Backend => "backend",
            Domain::Security => "security",
            Domain::Infra => "infra",
        }
    }

    pub const ALL: [Domain; 4] = [
        Domain::Frontend,
        Domain::Backend,
        Domain::Security,
        Domain::Infra,
    ];
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskKind
// ---------------------------------------------------------------------------

/// Whether a planned task is a top-level unit or a child of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    #[default]
    Parent,
    Child,
}

// ---------------------------------------------------------------------------
// PlannedTask
// ---------------------------------------------------------------------------

/// One unit of the orchestrator's decomposition.
///
/// Field names follow the LLM JSON contract (`agent_domain`, `agent_type`),
/// so a plan response deserializes directly into this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub id: String,
    pub label: String,
    #[serde(rename = "agent_domain")]
    pub domain: Domain,
    #[serde(rename = "agent_type", default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub prompt: String,
}

impl PlannedTask {
    /// The agent identifier derived for this task: `<domain>-<task_id>`.
    pub fn agent_id(&self) -> String {
        format!("{}-{}", self.domain, self.id)
    }

    /// The worktree branch an agent for this task works on.
    pub fn branch(&self) -> String {
        format!("agent/{}", self.agent_id())
    }
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// A named artifact the orchestrator persists so later agents can read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub file: String,
    pub content: String,
    pub written_by: Domain,
    #[serde(default)]
    pub read_by: Vec<Domain>,
}

// ---------------------------------------------------------------------------
// MemoryUpdates / Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUpdates {
    #[serde(default)]
    pub global_additions: Vec<String>,
    #[serde(default)]
    pub architecture_changes: String,
}

/// The orchestrator stage's output: analysis, verification command, the task
/// DAG, contracts, and memory updates. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub run_command: Option<String>,
    #[serde(default)]
    pub dag: Vec<PlannedTask>,
    #[serde(default)]
    pub contracts: Vec<Contract>,
    #[serde(default)]
    pub memory_updates: MemoryUpdates,
}

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("duplicate task id: {0}")]
    DuplicateTask(String),
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },
    #[error("dependency graph contains a cycle")]
    Cycle,
}

impl Plan {
    /// Validate the structural invariants of the DAG: unique identifiers,
    /// dependencies resolving within the plan, and acyclicity.
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut ids = HashSet::new();
        for task in &self.dag {
            if !ids.insert(task.id.as_str()) {
                return Err(PlanError::DuplicateTask(task.id.clone()));
            }
        }
        for task in &self.dag {
            for dep in &task.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm: if a topological order cannot cover every task,
        // the graph has a cycle.
        let mut in_degree: HashMap<&str, usize> = self
            .dag
            .iter()
            .map(|t| (t.id.as_str(), t.dependencies.len()))
            .collect();
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for task in &self.dag {
                if task.dependencies.iter().any(|d| d == id) {
                    let entry = in_degree.get_mut(task.id.as_str()).expect("known id");
                    *entry -= 1;
                    if *entry == 0 {
                        queue.push_back(task.id.as_str());
                    }
                }
            }
        }
        if visited != self.dag.len() {
            return Err(PlanError::Cycle);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AgentStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a spawned agent. `Done` and `Failed` are terminal and
/// sticky: once reached, no further transition is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Spawning,
    Active,
    Validating,
    Done,
    Failed,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Done | AgentStatus::Failed)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Spawning => "spawning",
            AgentStatus::Active => "active",
            AgentStatus::Validating => "validating",
            AgentStatus::Done => "done",
            AgentStatus::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

// ---------------------------------------------------------------------------
// AgentState
// ---------------------------------------------------------------------------

/// Upper bound on the retained output tail per agent.
pub const MAX_OUTPUT_LINES: usize = 500;

/// Runtime record of a single spawned agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub id: String,
    pub project_id: String,
    pub domain: Domain,
    pub label: String,
    pub status: AgentStatus,
    pub worktree_path: Option<String>,
    pub branch: Option<String>,
    pub prompt: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 0 = none, 1 = self-test, 2 = orchestrator, 3 = integration.
    pub validation_level: u8,
    pub output_lines: Vec<String>,
    pub error: Option<String>,
}

impl AgentState {
    /// Create a fresh record in `Spawning` with `started_at` stamped.
    pub fn spawning(
        id: impl Into<String>,
        project_id: impl Into<String>,
        domain: Domain,
        label: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            domain,
            label: label.into(),
            status: AgentStatus::Spawning,
            worktree_path: None,
            branch: None,
            prompt: prompt.into(),
            started_at: Some(Utc::now()),
            completed_at: None,
            validation_level: 0,
            output_lines: Vec::new(),
            error: None,
        }
    }

    /// Append a line to the output tail, dropping the oldest beyond the cap.
    pub fn push_output(&mut self, line: impl Into<String>) {
        self.output_lines.push(line.into());
        if self.output_lines.len() > MAX_OUTPUT_LINES {
            let excess = self.output_lines.len() - MAX_OUTPUT_LINES;
            self.output_lines.drain(..excess);
        }
    }

    /// Transition to `Done` unless already terminal.
    pub fn mark_done(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = AgentStatus::Done;
        self.completed_at = Some(Utc::now());
        self.validation_level = 1;
    }

    /// Transition to `Failed` unless already terminal.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = AgentStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    /// Compact view for API listings — line count instead of the full tail.
    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            id: self.id.clone(),
            project_id: self.project_id.clone(),
            domain: self.domain,
            label: self.label.clone(),
            status: self.status,
            worktree_path: self.worktree_path.clone(),
            branch: self.branch.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            validation_level: self.validation_level,
            output_line_count: self.output_lines.len(),
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: String,
    pub project_id: String,
    pub domain: Domain,
    pub label: String,
    pub status: AgentStatus,
    pub worktree_path: Option<String>,
    pub branch: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub validation_level: u8,
    pub output_line_count: usize,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
