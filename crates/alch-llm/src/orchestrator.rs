//! Orchestrator stage — decomposes a refined mission into a [`Plan`]: a DAG
//! of agent tasks, interface contracts, and memory updates.
//!
//! Uses the large model. Any failure (no key, network, malformed or invalid
//! JSON) yields a deterministic four-task mock plan so downstream stages stay
//! exercised; the mock is clearly labelled in its `analysis`. This stage
//! never writes files — persistence belongs to the mission pipeline.

use tracing::warn;

use alch_core::types::{Contract, Domain, MemoryUpdates, Plan, PlannedTask, TaskKind};

use crate::client::{strip_code_fence, ChatClient, ChatMessage, LARGE_MODEL};

const SYSTEM_PROMPT: &str = "\
You are the orchestrator of Alchemistral, a multi-agent coding system. You coordinate AI \
coding agents that work in parallel on isolated git worktrees.

You NEVER write code. You ONLY:
1. Analyze the request and project context
2. Decompose into a DAG of tasks with dependencies
3. Define which agent domain handles each task (frontend, backend, security, infra)
4. Generate interface contracts between agents (API schemas, TypeScript types)
5. Update global memory with architectural decisions

Respond in this exact JSON format (no markdown, no code block, raw JSON only):
{
  \"analysis\": \"Brief analysis of the request and how it maps to the codebase\",
  \"run_command\": \"Shell command to verify the result works after all tasks complete (e.g. 'python app.py', 'pytest', 'npm start')\",
  \"dag\": [
    {
      \"id\": \"t1\",
      \"label\": \"Short task description\",
      \"agent_domain\": \"frontend\",
      \"agent_type\": \"parent\",
      \"parent_id\": null,
      \"dependencies\": [],
      \"prompt\": \"The detailed prompt this agent will receive to execute the task\"
    }
  ],
  \"contracts\": [
    {
      \"file\": \"api-schema.json\",
      \"content\": \"The actual contract content as a string\",
      \"written_by\": \"backend\",
      \"read_by\": [\"frontend\"]
    }
  ],
  \"memory_updates\": {
    \"global_additions\": [\"New decisions or conventions to add to GLOBAL.md\"],
    \"architecture_changes\": \"Description of architecture updates\"
  }
}

CRITICAL: Read the codebase summary carefully. Your tasks MUST match the actual project \
stack. If the project is C++, never create TypeScript tasks. If it has CMakeLists.txt, \
the build system is CMake. Reference ACTUAL files from the scan, not imaginary ones. If \
the project uses Python, agents must run pytest. If it uses Node.js, agents must run \
npm test.

Rules:
- agent_domain must be one of: frontend, backend, security, infra
- agent_type must be one of: parent, child
- Tasks with no dependencies can run in parallel
- Child tasks depend on their parent being started first
- Always generate contracts when frontend and backend need to communicate
- Contract format: OpenAPI-style JSON for APIs, TypeScript interfaces for shared types
- Keep task prompts specific, each agent only knows its own domain
- Maximum 10 tasks per decomposition
- Output ONLY valid JSON, no prose, no explanation";

// ---------------------------------------------------------------------------
// Mock fallback
// ---------------------------------------------------------------------------

/// The deterministic four-task plan used whenever the real orchestrator is
/// unavailable: `t1` feeds `t2` and `t3`, which both gate `t4`.
pub fn mock_plan(refined_prompt: &str) -> Plan {
    let snippet: String = refined_prompt
        .chars()
        .take(80)
        .map(|c| if c == '\n' { ' ' } else { c })
        .collect();

    let schema = serde_json::json!({
        "info": "Mock API schema (MISTRAL_API_KEY not configured)",
        "description": format!("Auto-generated for: {snippet}"),
        "endpoints": [
            {"path": "/api/resource", "method": "GET", "response": {"items": "array"}},
            {
                "path": "/api/resource",
                "method": "POST",
                "body": {"name": "string"},
                "response": {"id": "string", "name": "string"},
            },
        ],
    });

    Plan {
        analysis: format!(
            "Mock analysis (MISTRAL_API_KEY not configured). \
             Request: \"{snippet}...\", showing example decomposition."
        ),
        run_command: Some("echo 'mock run, no verification command'".to_string()),
        dag: vec![
            PlannedTask {
                id: "t1".into(),
                label: "Define API schema and data models".into(),
                domain: Domain::Backend,
                kind: TaskKind::Parent,
                parent_id: None,
                dependencies: vec![],
                prompt: format!(
                    "Design and implement the API schema and data models for: {refined_prompt}. \
                     Write the OpenAPI schema to .alchemistral/contracts/api-schema.json."
                ),
            },
            PlannedTask {
                id: "t2".into(),
                label: "Implement backend endpoints".into(),
                domain: Domain::Backend,
                kind: TaskKind::Parent,
                parent_id: None,
                dependencies: vec!["t1".into()],
                prompt: "Implement the backend endpoints based on \
                         .alchemistral/contracts/api-schema.json. Run pytest after each \
                         change. Report DONE only when all tests pass."
                    .into(),
            },
            PlannedTask {
                id: "t3".into(),
                label: "Build frontend UI components".into(),
                domain: Domain::Frontend,
                kind: TaskKind::Parent,
                parent_id: None,
                dependencies: vec!["t1".into()],
                prompt: "Build the UI components. Read \
                         .alchemistral/contracts/api-schema.json first. Run npm run build \
                         after changes. Report DONE only when the build passes."
                    .into(),
            },
            PlannedTask {
                id: "t4".into(),
                label: "Security audit".into(),
                domain: Domain::Security,
                kind: TaskKind::Parent,
                parent_id: None,
                dependencies: vec!["t2".into(), "t3".into()],
                prompt: "Run OWASP Top 10 analysis on the implemented code. Check for \
                         injection, exposed secrets, broken auth, insecure deps. Return: \
                         severity, location, remediation."
                    .into(),
            },
        ],
        contracts: vec![Contract {
            file: "api-schema.json".into(),
            content: serde_json::to_string_pretty(&schema).unwrap_or_else(|_| "{}".into()),
            written_by: Domain::Backend,
            read_by: vec![Domain::Frontend],
        }],
        memory_updates: MemoryUpdates {
            global_additions: vec![
                "Mock orchestration run (MISTRAL_API_KEY not configured)".into(),
                format!("Feature requested: {snippet}"),
            ],
            architecture_changes: "Example decomposition: 4 tasks, 2 parallel tracks \
                                   (backend + frontend), security audit gating."
                .into(),
        },
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Decode a plan response, falling back to the mock on malformed JSON or a
/// plan that violates the DAG invariants.
pub fn parse_plan(raw: &str, refined_prompt: &str) -> Plan {
    let stripped = strip_code_fence(raw);
    match serde_json::from_str::<Plan>(&stripped) {
        Ok(plan) => match plan.validate() {
            Ok(()) => plan,
            Err(err) => {
                warn!(error = %err, "orchestrator plan failed validation, using mock");
                mock_plan(refined_prompt)
            }
        },
        Err(err) => {
            warn!(error = %err, "orchestrator response parse failed, using mock");
            mock_plan(refined_prompt)
        }
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Decompose a refined mission into a plan. Falls back to the mock plan on
/// any failure.
pub async fn orchestrate(
    client: &dyn ChatClient,
    refined_prompt: &str,
    global_memory: &str,
    architecture: &str,
    contracts: &[String],
    codebase_summary: &str,
) -> Plan {
    if !client.has_key() {
        warn!("MISTRAL_API_KEY not set, orchestrator returning mock plan");
        return mock_plan(refined_prompt);
    }

    let mut ctx_parts = Vec::new();
    if !global_memory.trim().is_empty() {
        ctx_parts.push(format!("Global memory:\n{global_memory}"));
    }
    if !codebase_summary.trim().is_empty() {
        ctx_parts.push(format!("Codebase scan:\n{codebase_summary}"));
    }
    let arch = architecture.trim();
    if !arch.is_empty() && arch != "{}" {
        ctx_parts.push(format!("Architecture:\n{architecture}"));
    }
    if !contracts.is_empty() {
        ctx_parts.push(format!("Existing contracts:\n{}", contracts.join("\n\n")));
    }
    ctx_parts.push(format!("Mission:\n{refined_prompt}"));
    let context = ctx_parts.join("\n\n");

    let messages = [
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(context),
    ];

    match client.chat(LARGE_MODEL, &messages, 0.2).await {
        Ok(text) => parse_plan(&text, refined_prompt),
        Err(err) => {
            warn!(error = %err, "orchestrator API call failed, using mock plan");
            mock_plan(refined_prompt)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
