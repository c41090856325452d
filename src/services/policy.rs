//! Failure classification policy.
//!
//! Scans the latest verification output and picks a repair intent with a
//! subgoal for the prompt, plus a focused test command for fast feedback.

use regex::Regex;
use std::sync::OnceLock;

use crate::domain::models::VerifyResult;

/// What kind of fix the controller believes is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    DependencyOrImportFix,
    TypeFix,
    AttributeFix,
    SyntaxFix,
    LogicFix,
    GatherEvidence,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DependencyOrImportFix => "dependency_or_import_fix",
            Self::TypeFix => "type_fix",
            Self::AttributeFix => "attribute_fix",
            Self::SyntaxFix => "syntax_fix",
            Self::LogicFix => "logic_fix",
            Self::GatherEvidence => "gather_evidence",
        }
    }

    /// Default subgoal string appended to the prompt for this intent.
    pub fn subgoal(&self) -> &'static str {
        match self {
            Self::DependencyOrImportFix => {
                "Resolve the missing module: install the dependency or fix the import path"
            }
            Self::TypeFix => "Fix the type mismatch at the reported call site",
            Self::AttributeFix => "Fix the missing or misspelled attribute access",
            Self::SyntaxFix => "Correct the syntax error; change nothing else",
            Self::LogicFix => "Fix the logic so the failing assertions pass",
            Self::GatherEvidence => {
                "Collect more context: list the tree, grep for the failing symbols, read the \
                 implicated files"
            }
        }
    }
}

/// The policy's decision for one step.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub intent: Intent,
    pub subgoal: String,
    /// Focused command exercising only the first failing test, when one can
    /// be derived. Used as the fast predicate in candidate evaluation.
    pub focus_cmd: Option<String>,
    pub confidence: f32,
}

struct ErrorPatterns {
    import: Regex,
    type_err: Regex,
    attribute: Regex,
    syntax: Regex,
    assertion: Regex,
}

fn patterns() -> &'static ErrorPatterns {
    static P: OnceLock<ErrorPatterns> = OnceLock::new();
    P.get_or_init(|| ErrorPatterns {
        import: Regex::new(r"ModuleNotFoundError|ImportError|No module named|cannot import name")
            .expect("static regex"),
        type_err: Regex::new(r"TypeError|unsupported operand type").expect("static regex"),
        attribute: Regex::new(r"AttributeError|has no attribute").expect("static regex"),
        syntax: Regex::new(r"SyntaxError|IndentationError|invalid syntax").expect("static regex"),
        assertion: Regex::new(r"AssertionError").expect("static regex"),
    })
}

/// Classify the failure and choose an intent.
pub fn choose_policy(test_cmd: &str, verify: &VerifyResult) -> PolicyDecision {
    let blob = verify.combined_output();
    let p = patterns();

    let (intent, confidence) = if verify.ok {
        (Intent::GatherEvidence, 0.5)
    } else if p.import.is_match(&blob) {
        (Intent::DependencyOrImportFix, 0.9)
    } else if p.syntax.is_match(&blob) {
        (Intent::SyntaxFix, 0.95)
    } else if p.attribute.is_match(&blob) {
        (Intent::AttributeFix, 0.85)
    } else if p.type_err.is_match(&blob) {
        (Intent::TypeFix, 0.8)
    } else if p.assertion.is_match(&blob) || verify.exit_code != 0 {
        (Intent::LogicFix, 0.7)
    } else {
        (Intent::GatherEvidence, 0.5)
    };

    PolicyDecision {
        intent,
        subgoal: intent.subgoal().to_string(),
        focus_cmd: focus_command(test_cmd, verify),
        confidence,
    }
}

/// Derive a focused test command from the first failing test identifier.
/// Only pytest-style runners get one; other runners fall back to the full
/// command.
fn focus_command(test_cmd: &str, verify: &VerifyResult) -> Option<String> {
    let first = verify.failing_tests.first()?;
    let file = first.split("::").next().unwrap_or(first).trim();
    if file.is_empty() {
        return None;
    }
    if test_cmd.contains("pytest") {
        Some(format!("pytest -q {}", file))
    } else {
        None
    }
}
