//! Language-scoped command allowlists.
//!
//! Each project type gets the base utilities plus its own toolchain and
//! nothing else, so adding support for one language never widens the
//! surface available to another.

use std::collections::HashSet;
use std::path::Path;

use crate::domain::error::SandboxError;
use crate::services::project_detector::ProjectLanguage;

/// Safe utilities available to every project type.
const BASE_COMMANDS: [&str; 13] = [
    "git", "cat", "ls", "grep", "find", "head", "tail", "wc", "echo", "pwd", "tar", "unzip",
    "make",
];

const PYTHON_COMMANDS: [&str; 10] = [
    "python", "pip", "pytest", "ruff", "mypy", "black", "pipenv", "poetry", "flake8", "pylint",
];

const NODE_COMMANDS: [&str; 9] = [
    "node", "npm", "yarn", "pnpm", "npx", "tsc", "jest", "mocha", "eslint",
];

const RUST_COMMANDS: [&str; 4] = ["cargo", "rustc", "rustfmt", "clippy"];

const GO_COMMANDS: [&str; 3] = ["go", "gofmt", "goimports"];

const JAVA_COMMANDS: [&str; 5] = ["mvn", "gradle", "javac", "java", "ant"];

const DOTNET_COMMANDS: [&str; 3] = ["dotnet", "nuget", "msbuild"];

const RUBY_COMMANDS: [&str; 5] = ["ruby", "gem", "bundle", "rake", "rspec"];

/// Commands rejected in every profile, no exceptions.
const HARD_BLOCKED: [&str; 17] = [
    "curl", "wget", "ssh", "scp", "rsync", "ftp", "nc", "telnet", "sudo", "su", "docker",
    "kubectl", "systemctl", "service", "crontab", "at", "cd",
];

/// Characters that would only make sense under a shell. Their presence in
/// any argv element is a rejection regardless of position.
const SHELL_METACHARS: [char; 8] = ['&', '|', ';', '<', '>', '`', '$', '\n'];

/// Build the effective allowlist for a detected language.
pub fn effective_allowlist(language: ProjectLanguage) -> HashSet<String> {
    let extra: &[&str] = match language {
        ProjectLanguage::Python | ProjectLanguage::Unknown => &PYTHON_COMMANDS,
        ProjectLanguage::Node => &NODE_COMMANDS,
        ProjectLanguage::Rust => &RUST_COMMANDS,
        ProjectLanguage::Go => &GO_COMMANDS,
        ProjectLanguage::Java => &JAVA_COMMANDS,
        ProjectLanguage::Dotnet => &DOTNET_COMMANDS,
        ProjectLanguage::Ruby => &RUBY_COMMANDS,
    };
    BASE_COMMANDS
        .iter()
        .chain(extra.iter())
        .map(|s| s.to_string())
        .collect()
}

/// Check an argv vector against the allowlist and shell-metacharacter
/// rules. The first token's basename must be allowlisted; hard-blocked
/// commands lose even if a profile were to include them.
pub fn check_argv(argv: &[String], allowlist: &HashSet<String>) -> Result<(), SandboxError> {
    let Some(first) = argv.first() else {
        return Err(SandboxError::CommandNotAllowed {
            command: String::new(),
            hint: allowlist_hint(allowlist),
        });
    };

    let base = Path::new(first)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| first.clone());

    if HARD_BLOCKED.contains(&base.as_str()) {
        return Err(SandboxError::CommandNotAllowed {
            command: base,
            hint: allowlist_hint(allowlist),
        });
    }
    if !allowlist.contains(&base) {
        return Err(SandboxError::CommandNotAllowed {
            command: base,
            hint: allowlist_hint(allowlist),
        });
    }

    for arg in argv {
        if arg.chars().any(|c| SHELL_METACHARS.contains(&c)) {
            return Err(SandboxError::ShellIdiomRejected(format!(
                "shell metacharacter in argument '{}'",
                arg
            )));
        }
    }

    Ok(())
}

fn allowlist_hint(allowlist: &HashSet<String>) -> String {
    let mut sorted: Vec<&String> = allowlist.iter().collect();
    sorted.sort();
    sorted
        .iter()
        .take(10)
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn base_commands_present_in_all_profiles() {
        for lang in [
            ProjectLanguage::Python,
            ProjectLanguage::Node,
            ProjectLanguage::Rust,
            ProjectLanguage::Go,
            ProjectLanguage::Java,
            ProjectLanguage::Dotnet,
            ProjectLanguage::Ruby,
        ] {
            let list = effective_allowlist(lang);
            assert!(list.contains("git"), "{:?} missing git", lang);
            assert!(list.contains("grep"), "{:?} missing grep", lang);
            assert!(list.contains("make"), "{:?} missing make", lang);
        }
    }

    #[test]
    fn language_scoping_holds() {
        let python = effective_allowlist(ProjectLanguage::Python);
        assert!(python.contains("pytest"));
        assert!(!python.contains("cargo"));

        let rust = effective_allowlist(ProjectLanguage::Rust);
        assert!(rust.contains("cargo"));
        assert!(!rust.contains("pytest"));
    }

    #[test]
    fn hard_blocked_rejected_in_every_profile() {
        let list = effective_allowlist(ProjectLanguage::Python);
        for cmd in ["curl", "sudo", "cd", "docker", "nc"] {
            assert!(check_argv(&argv(&[cmd]), &list).is_err(), "{} allowed", cmd);
        }
    }

    #[test]
    fn allowlisted_command_accepted() {
        let list = effective_allowlist(ProjectLanguage::Python);
        assert!(check_argv(&argv(&["pytest", "-q"]), &list).is_ok());
        assert!(check_argv(&argv(&["git", "status"]), &list).is_ok());
    }

    #[test]
    fn unlisted_command_rejected_with_hint() {
        let list = effective_allowlist(ProjectLanguage::Rust);
        let err = check_argv(&argv(&["pytest", "-q"]), &list).unwrap_err();
        match err {
            SandboxError::CommandNotAllowed { command, hint } => {
                assert_eq!(command, "pytest");
                assert!(!hint.is_empty());
            }
            other => panic!("expected CommandNotAllowed, got {:?}", other),
        }
    }

    #[test]
    fn basename_is_what_counts() {
        let list = effective_allowlist(ProjectLanguage::Python);
        assert!(check_argv(&argv(&["/usr/bin/pytest", "-q"]), &list).is_ok());
        assert!(check_argv(&argv(&["/usr/bin/curl", "http://x"]), &list).is_err());
    }

    #[test]
    fn metacharacters_in_any_argument_rejected() {
        let list = effective_allowlist(ProjectLanguage::Python);
        assert!(check_argv(&argv(&["echo", "a && b"]), &list).is_err());
        assert!(check_argv(&argv(&["grep", "foo|bar"]), &list).is_err());
        assert!(check_argv(&argv(&["cat", "$HOME/x"]), &list).is_err());
        assert!(check_argv(&argv(&["ls", "a;b"]), &list).is_err());
    }

    #[test]
    fn empty_argv_rejected() {
        let list = effective_allowlist(ProjectLanguage::Python);
        assert!(check_argv(&[], &list).is_err());
    }
}
