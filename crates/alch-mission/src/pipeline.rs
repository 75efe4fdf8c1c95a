//! Mission pipeline — the full orchestration flow triggered by one user
//! message.
//!
//! Flow: reprompt classifies intent and refines; conversations are answered
//! directly by the large model; missions are decomposed into a DAG whose
//! planning artifacts (contracts, global memory, architecture, decisions
//! log) are persisted before the DAG executor takes over. Every event goes
//! out on the broadcast bus; any escape from the inner flow is caught and
//! broadcast as a single `error` without re-raising.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};

use alch_agents::manager::AgentManager;
use alch_bridge::{Event, EventBus, EventKind};
use alch_core::memory::MemoryDir;
use alch_core::project::{ProjectError, ProjectStore};
use alch_core::worktree::{GitRunner, RealGitRunner};
use alch_llm::orchestrator::orchestrate;
use alch_llm::reprompt::{reprompt, Intent};
use alch_llm::{ChatClient, ChatMessage, LARGE_MODEL};

use crate::executor::{DagExecutor, DagRequest};

const CONVERSATION_SYSTEM: &str = "\
You are Alchemistral's assistant, a staff-level engineering copilot. You have full \
knowledge of the project's codebase, stack, and architecture.

Answer the developer's question using the project context provided. Be specific, \
reference actual files and patterns from the codebase. Be concise and technical. \
If you suggest code changes, tell the developer to send a mission instead.";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Project not found: {0}")]
    ProjectNotFound(String),
    #[error("project registry error: {0}")]
    Registry(#[from] ProjectError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// MissionPipeline
// ---------------------------------------------------------------------------

pub struct MissionPipeline {
    store: ProjectStore,
    manager: Arc<AgentManager>,
    bus: EventBus,
    llm: Arc<dyn ChatClient>,
    git: Arc<dyn GitRunner>,
    poll_interval: Duration,
}

impl MissionPipeline {
    pub fn new(
        store: ProjectStore,
        manager: Arc<AgentManager>,
        bus: EventBus,
        llm: Arc<dyn ChatClient>,
    ) -> Self {
        Self::with_parts(
            store,
            manager,
            bus,
            llm,
            Arc::new(RealGitRunner),
            DEFAULT_POLL_INTERVAL,
        )
    }

    /// Inject the git runner and scheduler poll interval (for testing).
    pub fn with_parts(
        store: ProjectStore,
        manager: Arc<AgentManager>,
        bus: EventBus,
        llm: Arc<dyn ChatClient>,
        git: Arc<dyn GitRunner>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            manager,
            bus,
            llm,
            git,
            poll_interval,
        }
    }

    /// Run the full pipeline for one user message, broadcasting events to
    /// all connected clients. Never returns an error: the outer frame
    /// converts any escape into one `error` event.
    pub async fn run_mission(&self, project_id: &str, message: &str) {
        if let Err(err) = self.pipeline(project_id, message).await {
            error!(project_id, error = %err, "mission pipeline error");
            self.bus.publish(
                Event::orchestrator(EventKind::Error)
                    .with_text(format!("Pipeline error: {err}")),
            );
        }
    }

    async fn pipeline(&self, project_id: &str, message: &str) -> Result<(), PipelineError> {
        let project = self
            .store
            .get(project_id)?
            .ok_or_else(|| PipelineError::ProjectNotFound(project_id.to_string()))?;

        let memory = MemoryDir::new(&project.local_path);
        let global_md = memory.read_global();
        let codebase_summary = memory.read_codebase_summary();
        let architecture = memory.read_architecture();
        let contract_blocks = memory.contract_blocks();

        // -- Step 1: reprompt ------------------------------------------------
        self.bus.publish(
            Event::orchestrator(EventKind::Thinking)
                .with_text("Refining your request with Reprompt Engine..."),
        );

        let outcome = reprompt(self.llm.as_ref(), message, &global_md, &codebase_summary).await;
        self.bus.publish(
            Event::orchestrator(EventKind::Reprompt)
                .with("original", message)
                .with("refined", outcome.refined.clone())
                .with("intent", outcome.intent.to_string()),
        );

        // -- Branch: conversation vs mission --------------------------------
        if outcome.intent == Intent::Conversation {
            self.handle_conversation(message, &global_md, &codebase_summary)
                .await;
            return Ok(());
        }

        // -- Step 2: orchestrate ---------------------------------------------
        self.bus.publish(Event::orchestrator(EventKind::Thinking).with_text(
            "Analyzing repository structure and decomposing into agent tasks...",
        ));

        let plan = orchestrate(
            self.llm.as_ref(),
            &outcome.refined,
            &global_md,
            &architecture,
            &contract_blocks,
            &codebase_summary,
        )
        .await;

        // -- Step 3: stream the DAG ------------------------------------------
        self.bus.publish(
            Event::orchestrator(EventKind::DagUpdate)
                .with("dag", serde_json::to_value(&plan.dag).unwrap_or_default())
                .with("analysis", plan.analysis.clone()),
        );

        // -- Step 4: write contracts -----------------------------------------
        for contract in &plan.contracts {
            memory.write_contract(&contract.file, &contract.content)?;
            self.bus.publish(
                Event::orchestrator(EventKind::ContractUpdate)
                    .with("file", contract.file.clone())
                    .with("written_by", contract.written_by.as_str())
                    .with(
                        "read_by",
                        contract
                            .read_by
                            .iter()
                            .map(|d| d.as_str())
                            .collect::<Vec<_>>(),
                    ),
            );
        }

        // -- Step 5: update GLOBAL.md ----------------------------------------
        let additions = &plan.memory_updates.global_additions;
        if !additions.is_empty() {
            memory.append_global_additions(additions)?;
            self.bus.publish(
                Event::orchestrator(EventKind::MemoryUpdate)
                    .with("additions", additions.clone()),
            );
        }

        // -- Step 6: update architecture.json --------------------------------
        let mut arch: serde_json::Value = serde_json::from_str(&architecture)
            .unwrap_or_else(|_| serde_json::json!({}));
        if !arch.is_object() {
            arch = serde_json::json!({});
        }
        arch["dag"] = serde_json::to_value(&plan.dag).unwrap_or_default();
        arch["last_analysis"] = serde_json::Value::String(plan.analysis.clone());
        memory.write_architecture(&arch)?;

        // -- Step 7: append to decisions.log ---------------------------------
        if !plan.analysis.is_empty() {
            memory.append_decision(Utc::now(), &plan.analysis)?;
        }

        // -- Step 8: ready ----------------------------------------------------
        let n = plan.dag.len();
        self.bus.publish(
            Event::orchestrator(EventKind::Ready).with_text(format!(
                "Plan ready. {n} agent task{} queued. Spawning agents...",
                if n == 1 { "" } else { "s" }
            )),
        );

        // -- Step 9: execute the DAG -----------------------------------------
        if !plan.dag.is_empty() {
            let executor = DagExecutor::with_parts(
                Arc::clone(&self.manager),
                self.bus.clone(),
                Arc::clone(&self.git),
                self.poll_interval,
            );
            executor
                .execute(DagRequest {
                    dag: plan.dag,
                    project_path: project.local_path.clone().into(),
                    memory,
                    adapter_name: project.cli_adapter.clone(),
                    project_id: project_id.to_string(),
                    run_command: plan.run_command,
                })
                .await;
        }

        info!(project_id, "mission pipeline finished");
        Ok(())
    }

    /// Conversation fast-path: answer directly with the large model, no DAG,
    /// no agents, no worktrees.
    async fn handle_conversation(&self, message: &str, global_md: &str, codebase_summary: &str) {
        self.bus
            .publish(Event::orchestrator(EventKind::Thinking).with_text("Thinking..."));

        if !self.llm.has_key() {
            self.bus.publish(
                Event::orchestrator(EventKind::Assistant).with_text(
                    "I can't answer questions without a Mistral API key configured. \
                     Please add one in Settings.",
                ),
            );
            return;
        }

        let mut ctx_parts = Vec::new();
        if !global_md.trim().is_empty() {
            ctx_parts.push(format!("Project memory:\n{global_md}"));
        }
        if !codebase_summary.trim().is_empty() {
            ctx_parts.push(format!("Codebase scan:\n{codebase_summary}"));
        }
        ctx_parts.push(format!("Developer question:\n{message}"));

        let messages = [
            ChatMessage::system(CONVERSATION_SYSTEM),
            ChatMessage::user(ctx_parts.join("\n\n")),
        ];

        match self.llm.chat(LARGE_MODEL, &messages, 0.4).await {
            Ok(answer) => {
                self.bus
                    .publish(Event::orchestrator(EventKind::Assistant).with_text(answer));
            }
            Err(err) => {
                warn!(error = %err, "conversation API error");
                self.bus.publish(
                    Event::orchestrator(EventKind::Error)
                        .with_text(format!("Failed to get response: {err}")),
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
