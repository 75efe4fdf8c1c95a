//! Typed access to a project's `.alchemistral/` memory directory.
//!
//! Layout:
//! - `GLOBAL.md` — natural-language project memory
//! - `codebase-summary.md` — one-shot scan output
//! - `architecture.json` — `{"dag": [...], "last_analysis": "...", ...}`
//! - `decisions.log` — append-only `[<iso_ts>] <analysis>` lines
//! - `contracts/<file>` — orchestrator-defined contracts
//! - `agents/<domain>.md` — per-domain memory, written by agents
//! - `todos.json` — optional per-agent todos
//!
//! Reads never fail the pipeline: a missing file is an empty section.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the memory directory inside a project root.
pub const MEMORY_DIR_NAME: &str = ".alchemistral";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Todo {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub done: bool,
}

/// Handle on one project's `.alchemistral/` directory.
#[derive(Debug, Clone)]
pub struct MemoryDir {
    base: PathBuf,
}

impl MemoryDir {
    /// Resolve the memory directory inside `project_root`.
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self {
            base: project_root.as_ref().join(MEMORY_DIR_NAME),
        }
    }

    /// Wrap an already-resolved `.alchemistral/` path.
    pub fn from_base(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn exists(&self) -> bool {
        self.base.is_dir()
    }

    fn read_or_empty(&self, name: &str) -> String {
        std::fs::read_to_string(self.base.join(name)).unwrap_or_default()
    }

    // -- Global memory ------------------------------------------------------

    pub fn read_global(&self) -> String {
        self.read_or_empty("GLOBAL.md")
    }

    pub fn write_global(&self, content: &str) -> io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::write(self.base.join("GLOBAL.md"), content)
    }

    /// Append an `## Orchestrator Updates` block with one bullet per entry.
    pub fn append_global_additions(&self, additions: &[String]) -> io::Result<()> {
        if additions.is_empty() {
            return Ok(());
        }
        let mut content = self.read_global().trim_end().to_string();
        if !content.is_empty() {
            content.push_str("\n\n");
        }
        content.push_str("## Orchestrator Updates\n");
        for addition in additions {
            content.push_str(&format!("- {addition}\n"));
        }
        self.write_global(&content)
    }

    // -- Scan + architecture ------------------------------------------------

    pub fn read_codebase_summary(&self) -> String {
        self.read_or_empty("codebase-summary.md")
    }

    /// Raw `architecture.json`, `"{}"` when missing or empty.
    pub fn read_architecture(&self) -> String {
        let raw = self.read_or_empty("architecture.json");
        if raw.trim().is_empty() {
            "{}".to_string()
        } else {
            raw
        }
    }

    pub fn write_architecture(&self, value: &serde_json::Value) -> io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".into());
        std::fs::write(self.base.join("architecture.json"), text)
    }

    // -- Decisions log ------------------------------------------------------

    pub fn append_decision(&self, ts: DateTime<Utc>, entry: &str) -> io::Result<()> {
        use std::io::Write;
        std::fs::create_dir_all(&self.base)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.base.join("decisions.log"))?;
        writeln!(file, "[{}] {}", ts.to_rfc3339(), entry)
    }

    pub fn read_decisions(&self) -> String {
        self.read_or_empty("decisions.log")
    }

    // -- Contracts ----------------------------------------------------------

    fn contracts_dir(&self) -> PathBuf {
        self.base.join("contracts")
    }

    /// All contract files as `(name, content)`, sorted by name.
    pub fn read_contracts(&self) -> Vec<(String, String)> {
        let dir = self.contracts_dir();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut contracts: Vec<(String, String)> = entries
            .flatten()
            .filter(|e| e.path().is_file())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                let content = std::fs::read_to_string(e.path()).ok()?;
                Some((name, content))
            })
            .collect();
        contracts.sort_by(|a, b| a.0.cmp(&b.0));
        contracts
    }

    /// Contracts formatted as `=== <name> ===\n<content>` blocks, the shape
    /// both the orchestrator context and agent prompts embed.
    pub fn contract_blocks(&self) -> Vec<String> {
        self.read_contracts()
            .into_iter()
            .map(|(name, content)| format!("=== {name} ===\n{content}"))
            .collect()
    }

    pub fn write_contract(&self, file: &str, content: &str) -> io::Result<PathBuf> {
        let dir = self.contracts_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(file);
        std::fs::write(&path, content)?;
        Ok(path)
    }

    // -- Per-domain memory + todos ------------------------------------------

    pub fn read_domain_memory(&self, domain: &str) -> String {
        self.read_or_empty(&format!("agents/{domain}.md"))
    }

    pub fn read_todos(&self) -> Vec<Todo> {
        let raw = self.read_or_empty("todos.json");
        serde_json::from_str(&raw).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
