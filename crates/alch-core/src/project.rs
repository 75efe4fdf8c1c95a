//! Project registry — named projects persisted at `~/.alchemistral/projects.json`,
//! plus seeding of the per-project `.alchemistral/` layout.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::memory::MEMORY_DIR_NAME;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("registry parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProjectError>;

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// One registered project. `cli_adapter` names the coding-agent CLI used for
/// its missions (see the adapter registry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub local_path: String,
    #[serde(default = "default_adapter")]
    pub cli_adapter: String,
    pub created_at: DateTime<Utc>,
}

fn default_adapter() -> String {
    "vibe".to_string()
}

impl Project {
    pub fn new(name: impl Into<String>, local_path: impl Into<String>, cli_adapter: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            local_path: local_path.into(),
            cli_adapter: cli_adapter.into(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProjectStore
// ---------------------------------------------------------------------------

/// JSON-file-backed project registry.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    root: PathBuf,
}

impl ProjectStore {
    /// Store rooted at a specific directory (tests use a tempdir).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store at the default location, `~/.alchemistral/`.
    pub fn default_location() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".alchemistral"))
    }

    fn projects_file(&self) -> PathBuf {
        self.root.join("projects.json")
    }

    fn ensure_root(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let file = self.projects_file();
        if !file.exists() {
            std::fs::write(&file, "[]")?;
        }
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<Project>> {
        self.ensure_root()?;
        let text = std::fs::read_to_string(self.projects_file())?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, projects: &[Project]) -> Result<()> {
        self.ensure_root()?;
        let text = serde_json::to_string_pretty(projects)?;
        std::fs::write(self.projects_file(), text)?;
        Ok(())
    }

    pub fn get(&self, project_id: &str) -> Result<Option<Project>> {
        Ok(self.load()?.into_iter().find(|p| p.id == project_id))
    }

    pub fn add(&self, project: Project) -> Result<Project> {
        let mut projects = self.load()?;
        projects.push(project.clone());
        self.save(&projects)?;
        info!(id = %project.id, name = %project.name, "project registered");
        Ok(project)
    }

    pub fn remove(&self, project_id: &str) -> Result<bool> {
        let mut projects = self.load()?;
        let before = projects.len();
        projects.retain(|p| p.id != project_id);
        let removed = projects.len() != before;
        if removed {
            self.save(&projects)?;
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// .alchemistral/ layout seeding
// ---------------------------------------------------------------------------

const GLOBAL_MD_TEMPLATE: &str = "\
# Global Memory

## Stack

## Conventions

## Decisions
";

const ARCHITECTURE_TEMPLATE: &str = "{\n  \"agents\": [],\n  \"dag\": [],\n  \"contracts\": []\n}";

/// Create the `.alchemistral/` structure inside a project, preserving any
/// files that already exist.
pub fn init_project_layout(local_path: impl AsRef<Path>) -> io::Result<()> {
    let base = local_path.as_ref().join(MEMORY_DIR_NAME);
    std::fs::create_dir_all(base.join("contracts"))?;
    std::fs::create_dir_all(base.join("agents"))?;

    let defaults: [(&str, &str); 4] = [
        ("GLOBAL.md", GLOBAL_MD_TEMPLATE),
        ("architecture.json", ARCHITECTURE_TEMPLATE),
        ("todos.json", "[]"),
        ("decisions.log", ""),
    ];
    for (name, content) in defaults {
        let file = base.join(name);
        if !file.exists() {
            std::fs::write(&file, content)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
