//! Agent prompt builder.
//!
//! Pure function of (domain, task, memory directory, skills, todos): reads
//! the global memory file, the per-domain memory file, and every contract,
//! then interpolates them into a domain-specific template. Missing files
//! produce empty sections, never errors.

use alch_core::memory::{MemoryDir, Todo};

struct PromptContext {
    task_prompt: String,
    global_md: String,
    domain_memory: String,
    contracts_text: String,
    skills_text: String,
    todos_text: String,
}

/// Build the full prompt an agent receives for one task.
pub fn build_prompt(
    domain: &str,
    task_prompt: &str,
    memory: &MemoryDir,
    skills: &[String],
    todos: &[Todo],
) -> String {
    let contract_blocks = memory.contract_blocks();
    let contracts_text = if contract_blocks.is_empty() {
        "No contracts yet.".to_string()
    } else {
        contract_blocks.join("\n\n")
    };

    let skills_text = if skills.is_empty() {
        "None".to_string()
    } else {
        skills.join(", ")
    };

    let todos_text = if todos.is_empty() {
        "No todos assigned.".to_string()
    } else {
        todos
            .iter()
            .map(|t| format!("- [{}] {}", if t.done { 'x' } else { ' ' }, t.text))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let ctx = PromptContext {
        task_prompt: task_prompt.to_string(),
        global_md: memory.read_global(),
        domain_memory: memory.read_domain_memory(domain),
        contracts_text,
        skills_text,
        todos_text,
    };

    match domain {
        "frontend" => frontend_prompt(&ctx),
        "backend" => backend_prompt(&ctx),
        "security" => security_prompt(&ctx),
        "infra" => infra_prompt(&ctx),
        _ => generic_prompt(&ctx),
    }
}

fn frontend_prompt(ctx: &PromptContext) -> String {
    format!(
        "You are Alchemistral's Frontend Agent working in this directory.\n\
         You own all frontend code. Never touch backend or infra files.\n\
         \n\
         Read these files first:\n\
         - .alchemistral/GLOBAL.md (conventions)\n\
         - .alchemistral/agents/frontend.md (your domain state)\n\
         - .alchemistral/contracts/api-schema.json (backend API you consume)\n\
         \n\
         === GLOBAL MEMORY ===\n{}\n\
         \n\
         === YOUR DOMAIN MEMORY ===\n{}\n\
         \n\
         === CONTRACTS ===\n{}\n\
         \n\
         Your active skills: {}\n\
         Your current todos:\n{}\n\
         \n\
         YOUR TASK:\n{}\n\
         \n\
         RULES:\n\
         1. After every significant change, run the build: npm run build\n\
         2. After completing your task, run tests: npm test\n\
         3. Only report DONE if build AND tests pass\n\
         4. Update .alchemistral/agents/frontend.md with what you did",
        ctx.global_md,
        ctx.domain_memory,
        ctx.contracts_text,
        ctx.skills_text,
        ctx.todos_text,
        ctx.task_prompt,
    )
}

fn backend_prompt(ctx: &PromptContext) -> String {
    format!(
        "You are Alchemistral's Backend Agent working in this directory.\n\
         You own all backend code. Never touch frontend or infra files.\n\
         \n\
         Read these files first:\n\
         - .alchemistral/GLOBAL.md (conventions)\n\
         - .alchemistral/agents/backend.md (your domain state)\n\
         \n\
         === GLOBAL MEMORY ===\n{}\n\
         \n\
         === YOUR DOMAIN MEMORY ===\n{}\n\
         \n\
         === CONTRACTS ===\n{}\n\
         \n\
         Your active skills: {}\n\
         Your current todos:\n{}\n\
         \n\
         YOUR TASK:\n{}\n\
         \n\
         RULES:\n\
         1. After every significant change, run tests: pytest\n\
         2. Write your API schema to .alchemistral/contracts/api-schema.json\n\
         3. Only report DONE if tests pass\n\
         4. Update .alchemistral/agents/backend.md with what you did",
        ctx.global_md,
        ctx.domain_memory,
        ctx.contracts_text,
        ctx.skills_text,
        ctx.todos_text,
        ctx.task_prompt,
    )
}

fn security_prompt(ctx: &PromptContext) -> String {
    format!(
        "You are Alchemistral's Security Agent.\n\
         You can be invoked on any node at any time.\n\
         Run OWASP Top 10 analysis on the provided code.\n\
         \n\
         === GLOBAL MEMORY ===\n{}\n\
         \n\
         === SECURITY FINDINGS ===\n{}\n\
         \n\
         === CONTRACTS ===\n{}\n\
         \n\
         YOUR TASK:\n{}\n\
         \n\
         Check for: injection, exposed secrets, broken auth, insecure deps.\n\
         Return: severity, location, remediation.\n\
         Update .alchemistral/agents/security.md with your findings.",
        ctx.global_md, ctx.domain_memory, ctx.contracts_text, ctx.task_prompt,
    )
}

fn infra_prompt(ctx: &PromptContext) -> String {
    format!(
        "You are Alchemistral's Infra Agent working in this directory.\n\
         You own Docker, CI/CD, deployment. Never touch application code.\n\
         \n\
         Read these files first:\n\
         - .alchemistral/GLOBAL.md (conventions)\n\
         - .alchemistral/agents/infra.md (your domain state)\n\
         \n\
         === GLOBAL MEMORY ===\n{}\n\
         \n\
         === YOUR DOMAIN MEMORY ===\n{}\n\
         \n\
         === CONTRACTS ===\n{}\n\
         \n\
         Your active skills: {}\n\
         Your current todos:\n{}\n\
         \n\
         YOUR TASK:\n{}\n\
         \n\
         RULES:\n\
         1. After every significant change, validate your configurations\n\
         2. Only report DONE if validation passes\n\
         3. Update .alchemistral/agents/infra.md with what you did",
        ctx.global_md,
        ctx.domain_memory,
        ctx.contracts_text,
        ctx.skills_text,
        ctx.todos_text,
        ctx.task_prompt,
    )
}

fn generic_prompt(ctx: &PromptContext) -> String {
    format!(
        "You are an Alchemistral Agent working in this directory.\n\
         \n\
         === GLOBAL MEMORY ===\n{}\n\
         \n\
         === DOMAIN MEMORY ===\n{}\n\
         \n\
         === CONTRACTS ===\n{}\n\
         \n\
         Your active skills: {}\n\
         Your current todos:\n{}\n\
         \n\
         YOUR TASK:\n{}\n\
         \n\
         RULES:\n\
         1. After completing your task, run relevant tests\n\
         2. Only report DONE if tests pass",
        ctx.global_md,
        ctx.domain_memory,
        ctx.contracts_text,
        ctx.skills_text,
        ctx.todos_text,
        ctx.task_prompt,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
