//! Project language detection from marker files.
//!
//! The shallowest marker wins; ties at the same depth are broken by a fixed
//! precedence order so detection is deterministic for polyglot repos.

use std::fs;
use std::path::Path;

/// Detected project language. Drives the command allowlist, the default
/// test command, and language-specific hygiene budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProjectLanguage {
    Python,
    Node,
    Rust,
    Go,
    Java,
    Dotnet,
    Ruby,
    Unknown,
}

impl ProjectLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Node => "node",
            Self::Rust => "rust",
            Self::Go => "go",
            Self::Java => "java",
            Self::Dotnet => "dotnet",
            Self::Ruby => "ruby",
            Self::Unknown => "unknown",
        }
    }

    /// Default test command when the caller did not provide one.
    pub fn default_test_cmd(&self) -> &'static str {
        match self {
            Self::Python | Self::Unknown => "pytest -q",
            Self::Node => "npm test",
            Self::Rust => "cargo test",
            Self::Go => "go test ./...",
            Self::Java => "mvn -q test",
            Self::Dotnet => "dotnet test",
            Self::Ruby => "bundle exec rake test",
        }
    }
}

/// Precedence order used to break same-depth ties. First match wins.
const PRECEDENCE: [ProjectLanguage; 7] = [
    ProjectLanguage::Python,
    ProjectLanguage::Node,
    ProjectLanguage::Rust,
    ProjectLanguage::Go,
    ProjectLanguage::Java,
    ProjectLanguage::Dotnet,
    ProjectLanguage::Ruby,
];

/// Directories never descended into during detection.
const PRUNED_DIRS: [&str; 8] = [
    ".git",
    "node_modules",
    ".venv",
    "venv",
    "__pycache__",
    "dist",
    "build",
    "target",
];

fn classify_marker(file_name: &str) -> Option<ProjectLanguage> {
    match file_name {
        "pyproject.toml" | "requirements.txt" | "setup.py" => Some(ProjectLanguage::Python),
        "package.json" => Some(ProjectLanguage::Node),
        "Cargo.toml" => Some(ProjectLanguage::Rust),
        "go.mod" => Some(ProjectLanguage::Go),
        "pom.xml" | "build.gradle" => Some(ProjectLanguage::Java),
        "Gemfile" => Some(ProjectLanguage::Ruby),
        _ => {
            if file_name.ends_with(".csproj") || file_name.ends_with(".sln") {
                Some(ProjectLanguage::Dotnet)
            } else {
                None
            }
        }
    }
}

/// Classify the repository under `repo_dir`.
pub fn detect_language(repo_dir: &Path) -> ProjectLanguage {
    let mut best: Option<(usize, ProjectLanguage)> = None;
    walk_markers(repo_dir, 0, &mut best);
    best.map(|(_, lang)| lang).unwrap_or(ProjectLanguage::Unknown)
}

fn walk_markers(dir: &Path, depth: usize, best: &mut Option<(usize, ProjectLanguage)>) {
    // No marker deeper than an already-found one can win
    if let Some((best_depth, _)) = best {
        if depth > *best_depth {
            return;
        }
    }

    let Ok(entries) = fs::read_dir(dir) else { return };
    let mut subdirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() {
            if !PRUNED_DIRS.contains(&name.as_str()) {
                subdirs.push(path);
            }
            continue;
        }
        if let Some(lang) = classify_marker(&name) {
            let candidate = (depth, lang);
            *best = match best.take() {
                None => Some(candidate),
                Some(current) => Some(prefer(current, candidate)),
            };
        }
    }
    for sub in subdirs {
        walk_markers(&sub, depth + 1, best);
    }
}

fn prefer(
    a: (usize, ProjectLanguage),
    b: (usize, ProjectLanguage),
) -> (usize, ProjectLanguage) {
    if b.0 < a.0 {
        return b;
    }
    if b.0 > a.0 {
        return a;
    }
    let rank = |lang: ProjectLanguage| {
        PRECEDENCE.iter().position(|&l| l == lang).unwrap_or(usize::MAX)
    };
    if rank(b.1) < rank(a.1) {
        b
    } else {
        a
    }
}
