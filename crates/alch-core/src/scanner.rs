//! Codebase scanner — analyses a project's files, stack, and structure once
//! at import time and writes `.alchemistral/codebase-summary.md`.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use tracing::info;

use crate::memory::MEMORY_DIR_NAME;

/// Cap on the number of files included in the scan.
const MAX_FILES: usize = 200;

/// Number of source files sampled for their leading lines.
const MAX_SAMPLED_FILES: usize = 10;

/// Leading lines captured per sampled source file.
const MAX_SAMPLED_LINES: usize = 10;

/// Leading bytes of the README included in the summary.
const MAX_README_CHARS: usize = 2000;

/// Directories never descended into.
const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    ".worktrees",
    "__pycache__",
    ".venv",
    "venv",
    ".tox",
    ".mypy_cache",
    ".pytest_cache",
    "dist",
    "build",
    ".next",
    ".nuxt",
    "target",
    "out",
    ".turbo",
    ".cache",
    "coverage",
];

/// Marker file → stack label. Markers starting with `*` match by suffix.
const STACK_MARKERS: &[(&str, &str)] = &[
    ("CMakeLists.txt", "C/C++ (CMake)"),
    ("Makefile", "Make build system"),
    ("package.json", "Node.js / JavaScript"),
    ("tsconfig.json", "TypeScript"),
    ("Cargo.toml", "Rust (Cargo)"),
    ("go.mod", "Go"),
    ("pyproject.toml", "Python (pyproject)"),
    ("requirements.txt", "Python (pip)"),
    ("setup.py", "Python (setuptools)"),
    ("Pipfile", "Python (Pipenv)"),
    ("poetry.lock", "Python (Poetry)"),
    ("Gemfile", "Ruby (Bundler)"),
    ("pom.xml", "Java (Maven)"),
    ("build.gradle", "Java/Kotlin (Gradle)"),
    ("*.sln", "C# / .NET"),
    ("mix.exs", "Elixir (Mix)"),
    ("deno.json", "Deno"),
    ("composer.json", "PHP (Composer)"),
    ("Dockerfile", "Docker"),
    ("docker-compose.yml", "Docker Compose"),
    ("docker-compose.yaml", "Docker Compose"),
];

const SOURCE_EXTS: &[&str] = &[
    "py", "js", "ts", "tsx", "jsx", "rs", "go", "c", "cpp", "h", "hpp", "java", "kt", "rb", "ex",
    "exs", "cs", "php", "swift", "zig", "lua", "vue", "svelte",
];

/// Result of a completed scan.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub file_count: usize,
    pub stack: Vec<String>,
    pub summary: String,
}

/// Walk the project tree and return relative file paths, sorted, capped at
/// [`MAX_FILES`], skipping vendor/build directories and hidden entries.
fn collect_files(root: &Path) -> Vec<PathBuf> {
    let walker = WalkBuilder::new(root)
        .hidden(true)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !SKIP_DIRS.contains(&name.as_ref())
        })
        .sort_by_file_path(|a, b| a.cmp(b))
        .build();

    let mut files = Vec::new();
    for entry in walker.flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            files.push(rel.to_path_buf());
        }
        if files.len() >= MAX_FILES {
            break;
        }
    }
    files
}

/// Detect the project stack from known marker files.
fn detect_stack(files: &[PathBuf]) -> Vec<String> {
    let names: BTreeSet<String> = files
        .iter()
        .filter_map(|f| f.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .collect();

    let mut detected = Vec::new();
    for (marker, label) in STACK_MARKERS {
        let hit = if let Some(suffix) = marker.strip_prefix('*') {
            names.iter().any(|n| n.ends_with(suffix))
        } else {
            names.contains(*marker)
        };
        if hit && !detected.contains(&label.to_string()) {
            detected.push(label.to_string());
        }
    }
    detected
}

/// First [`MAX_README_CHARS`] characters of the README, if one exists.
fn read_readme(root: &Path) -> Option<String> {
    for name in ["README.md", "readme.md", "Readme.md", "README.rst", "README"] {
        let path = root.join(name);
        if let Ok(text) = std::fs::read_to_string(&path) {
            let head: String = text.chars().take(MAX_README_CHARS).collect();
            return Some(format!(
                "=== {name} (first {MAX_README_CHARS} chars) ===\n{head}"
            ));
        }
    }
    None
}

/// First lines of the top source files, to capture imports/includes.
fn sample_imports(root: &Path, files: &[PathBuf]) -> Option<String> {
    let sources: Vec<&PathBuf> = files
        .iter()
        .filter(|f| {
            f.extension()
                .map(|e| SOURCE_EXTS.contains(&e.to_string_lossy().as_ref()))
                .unwrap_or(false)
        })
        .take(MAX_SAMPLED_FILES)
        .collect();

    let mut parts = Vec::new();
    for file in sources {
        if let Ok(text) = std::fs::read_to_string(root.join(file)) {
            let head: Vec<&str> = text.lines().take(MAX_SAMPLED_LINES).collect();
            parts.push(format!(
                "=== {} (first {MAX_SAMPLED_LINES} lines) ===\n{}",
                file.display(),
                head.join("\n")
            ));
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Build the raw codebase summary for a project root.
pub fn build_summary(root: &Path) -> ScanReport {
    let files = collect_files(root);
    let stack = detect_stack(&files);

    let file_list = files
        .iter()
        .map(|f| f.display().to_string())
        .collect::<Vec<_>>()
        .join("\n");
    let stack_list = if stack.is_empty() {
        "(none detected)".to_string()
    } else {
        stack
            .iter()
            .map(|s| format!("- {s}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut sections = vec![
        format!("# Codebase Scan\n\nScanned: {} files", files.len()),
        format!("## Detected Stack\n{stack_list}"),
        format!("## File Tree\n{file_list}"),
    ];
    if let Some(readme) = read_readme(root) {
        sections.push(format!("## README\n{readme}"));
    }
    if let Some(imports) = sample_imports(root, &files) {
        sections.push(format!("## Source Samples (imports)\n{imports}"));
    }

    ScanReport {
        file_count: files.len(),
        stack,
        summary: sections.join("\n\n"),
    }
}

/// Run the one-shot scan and persist `codebase-summary.md`.
pub fn scan_project(root: &Path) -> io::Result<ScanReport> {
    let report = build_summary(root);
    let base = root.join(MEMORY_DIR_NAME);
    std::fs::create_dir_all(&base)?;
    std::fs::write(base.join("codebase-summary.md"), &report.summary)?;
    info!(
        files = report.file_count,
        stack = ?report.stack,
        "codebase scan written"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
