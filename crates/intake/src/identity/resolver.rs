use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::config::{validate_naming_pattern, NamingConfig, SessionSpec};
use crate::error::ConfigError;
use crate::model::{Severity, ViolationType};
use crate::unpacker::{Entry, FailedEntry};
use crate::violations::ViolationDraft;

/// How an identity was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// The file name matches the naming rule as written.
    Exact,
    /// The file name matches only ignoring case and whitespace.
    Partial,
    /// The file name does not match; an enclosing archive or folder does.
    Ancestor,
    Unresolved,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub student_id: Option<String>,
    pub confidence: Confidence,
    /// The name the identity was read from.
    pub matched_name: Option<String>,
    pub naming_violation: Option<ViolationDraft>,
}

impl Classification {
    pub fn is_resolved(&self) -> bool {
        self.student_id.is_some()
    }
}

/// A compiled naming rule: the configured pattern plus its
/// case-insensitive twin used for partial matches.
pub struct NamingRule {
    exact: Regex,
    partial: Option<Regex>,
    capture: String,
}

impl NamingRule {
    pub fn new(pattern: &str, capture: &str, partial_matching: bool) -> Result<Self, ConfigError> {
        validate_naming_pattern(pattern, capture)?;

        let invalid = |e: regex::Error| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        };
        let exact = Regex::new(pattern).map_err(invalid)?;
        let partial = if partial_matching {
            Some(
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(invalid)?,
            )
        } else {
            None
        };

        Ok(Self {
            exact,
            partial,
            capture: capture.to_string(),
        })
    }

    fn capture_id(&self, regex: &Regex, text: &str) -> Option<String> {
        regex
            .captures(text)
            .and_then(|c| c.name(&self.capture))
            .map(|m| normalize_student_id(m.as_str()))
            .filter(|id| !id.is_empty())
    }

    pub fn match_exact(&self, stem: &str) -> Option<String> {
        self.capture_id(&self.exact, stem)
    }

    pub fn match_partial(&self, stem: &str) -> Option<String> {
        let partial = self.partial.as_ref()?;
        let compact: String = stem.split_whitespace().collect();
        self.capture_id(partial, &compact)
    }
}

/// Canonical student id: whitespace removed, upper-cased.
pub fn normalize_student_id(raw: &str) -> String {
    raw.split_whitespace().collect::<String>().to_uppercase()
}

fn stem(name: &str) -> &str {
    Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
}

/// Names enclosing an entry, nearest first: folders of its own path, then
/// nested containers (and their folders). The uploaded archive itself is
/// never an identity source.
pub fn ancestors(origin: &[String], path: &str) -> Vec<String> {
    let mut names: Vec<String> = origin
        .iter()
        .skip(1)
        .flat_map(|container| container.split('/'))
        .chain(path.split('/').rev().skip(1).collect::<Vec<_>>().into_iter().rev())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    names.reverse();
    names
}

pub struct IdentityResolver {
    rule: NamingRule,
    ancestor_before_partial: bool,
}

impl IdentityResolver {
    pub fn new(rule: NamingRule, ancestor_before_partial: bool) -> Self {
        Self {
            rule,
            ancestor_before_partial,
        }
    }

    /// Builds the resolver for one session: its pattern override wins over
    /// the configured pattern.
    pub fn from_config(naming: &NamingConfig, session: &SessionSpec) -> Result<Self, ConfigError> {
        let pattern = session.naming_pattern.as_deref().unwrap_or(&naming.pattern);
        let rule = NamingRule::new(pattern, &naming.capture, naming.partial_matching)?;
        Ok(Self::new(rule, naming.ancestor_before_partial))
    }

    pub fn classify(&self, entry: &Entry) -> Classification {
        self.classify_name(&entry.name, &ancestors(&entry.origin, &entry.path))
    }

    pub fn classify_failed(&self, failed: &FailedEntry) -> Classification {
        self.classify_name(&failed.name, &ancestors(&failed.origin, &failed.path))
    }

    pub fn classify_name(&self, name: &str, ancestors: &[String]) -> Classification {
        let leaf = stem(name);

        if let Some(id) = self.rule.match_exact(leaf) {
            return Classification {
                student_id: Some(id),
                confidence: Confidence::Exact,
                matched_name: Some(name.to_string()),
                naming_violation: None,
            };
        }

        let resolved = if self.ancestor_before_partial {
            self.from_ancestors(name, ancestors)
                .or_else(|| self.from_partial_leaf(name))
        } else {
            self.from_partial_leaf(name)
                .or_else(|| self.from_ancestors(name, ancestors))
        };

        resolved.unwrap_or_else(|| Classification {
            student_id: None,
            confidence: Confidence::Unresolved,
            matched_name: None,
            naming_violation: Some(ViolationDraft {
                kind: ViolationType::NamingMismatch,
                severity: Severity::Flag,
                subject: name.to_string(),
                description: format!(
                    "'{}' does not match the naming rule and no enclosing archive or folder identifies a student",
                    name
                ),
            }),
        })
    }

    fn from_partial_leaf(&self, name: &str) -> Option<Classification> {
        let id = self.rule.match_partial(stem(name))?;
        Some(Classification {
            naming_violation: Some(ViolationDraft {
                kind: ViolationType::NamingMismatch,
                severity: Severity::Warning,
                subject: name.to_string(),
                description: format!(
                    "'{}' matches the naming rule only ignoring case or whitespace; filed under {}",
                    name, id
                ),
            }),
            student_id: Some(id),
            confidence: Confidence::Partial,
            matched_name: Some(name.to_string()),
        })
    }

    fn from_ancestors(&self, name: &str, ancestors: &[String]) -> Option<Classification> {
        ancestors.iter().find_map(|ancestor| {
            let s = stem(ancestor);
            let id = self
                .rule
                .match_exact(s)
                .or_else(|| self.rule.match_partial(s))?;
            Some(Classification {
                naming_violation: Some(ViolationDraft {
                    kind: ViolationType::NamingMismatch,
                    severity: Severity::Warning,
                    subject: name.to_string(),
                    description: format!(
                        "'{}' does not match the naming rule; filed under {} from enclosing '{}'",
                        name, id, ancestor
                    ),
                }),
                student_id: Some(id),
                confidence: Confidence::Ancestor,
                matched_name: Some(ancestor.clone()),
            })
        })
    }
}
