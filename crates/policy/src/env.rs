//! Required-credential validation.
//!
//! A variable is `missing` when unset or empty, and `invalid` when set
//! to a recognizable placeholder ("xxx", "your-key", "<paste here>", …).
//! Both classes block a dependency the same way; they are reported
//! separately so approval prompts can say which is which.

use caprun_domain::error::{Error, ErrorKind, Result};

/// Known placeholder values, compared case-insensitively with hyphens
/// and underscores stripped.
const PLACEHOLDERS: &[&str] = &[
    "xxx",
    "yourkey",
    "todo",
    "changeme",
    "placeholder",
    "testkey",
    "fakekey",
    "example",
    "inserthere",
    "replaceme",
];

/// Outcome of checking a list of required variable names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvReport {
    /// Unset or empty.
    pub missing: Vec<String>,
    /// Set, but to a placeholder value.
    pub invalid: Vec<String>,
}

impl EnvReport {
    pub fn is_satisfied(&self) -> bool {
        self.missing.is_empty() && self.invalid.is_empty()
    }

    /// All problem names, missing first, in original declaration order
    /// within each class.
    pub fn problem_names(&self) -> Vec<String> {
        self.missing.iter().chain(&self.invalid).cloned().collect()
    }

    /// Fail with `env-missing` unless every variable is satisfied.
    pub fn into_result(self) -> Result<()> {
        if self.is_satisfied() {
            return Ok(());
        }
        let names = self.problem_names();
        Err(Error::new(
            ErrorKind::EnvMissing,
            format!("missing or placeholder credential variables: {}", names.join(", ")),
        )
        .with("missingKeys", names))
    }
}

/// Check each required name against the process environment.
pub fn check_env_vars(required: &[String]) -> EnvReport {
    check_with(required, |name| std::env::var(name).ok())
}

/// Same check against an explicit lookup, for tests and embedding.
pub fn check_with<F>(required: &[String], lookup: F) -> EnvReport
where
    F: Fn(&str) -> Option<String>,
{
    let mut report = EnvReport::default();
    for name in required {
        match lookup(name) {
            None => report.missing.push(name.clone()),
            Some(value) if value.is_empty() => report.missing.push(name.clone()),
            Some(value) if is_placeholder(&value) => report.invalid.push(name.clone()),
            Some(_) => {}
        }
    }
    report
}

fn is_placeholder(value: &str) -> bool {
    let trimmed = value.trim();
    // Angle-bracketed values are template text, whatever they contain.
    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        return true;
    }
    let normalized: String = trimmed
        .to_lowercase()
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .collect();
    PLACEHOLDERS.contains(&normalized.as_str())
}
