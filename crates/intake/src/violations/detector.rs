use std::collections::{BTreeMap, BTreeSet};

use glob::{MatchOptions, Pattern};

use crate::aggregator::SubmissionDraft;
use crate::config::{SessionSpec, ViolationPolicyConfig};
use crate::dedup::Fingerprint;
use crate::error::ConfigError;
use crate::model::{Severity, ViolationType};
use crate::violations::ViolationDraft;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Evaluates one student's draft submission against the session's rules.
pub struct ViolationDetector {
    required_files: Option<Vec<Pattern>>,
    duplicate_escalation_threshold: Option<usize>,
}

impl ViolationDetector {
    pub fn new(
        required_files: Option<&[String]>,
        duplicate_escalation_threshold: Option<usize>,
    ) -> Result<Self, ConfigError> {
        let required_files = required_files
            .map(|patterns| {
                patterns
                    .iter()
                    .map(|p| {
                        Pattern::new(p).map_err(|e| ConfigError::InvalidManifest {
                            pattern: p.clone(),
                            reason: e.to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;

        Ok(Self {
            required_files,
            duplicate_escalation_threshold,
        })
    }

    pub fn from_config(
        policy: &ViolationPolicyConfig,
        session: &SessionSpec,
    ) -> Result<Self, ConfigError> {
        Self::new(
            session.required_files.as_deref(),
            policy.duplicate_escalation_threshold,
        )
    }

    /// Naming, duplicate, unreadable and missing-file checks, in that order.
    pub fn evaluate(&self, draft: &SubmissionDraft) -> Vec<ViolationDraft> {
        let mut violations = Vec::new();

        violations.extend(
            draft
                .files
                .iter()
                .filter_map(|f| f.naming_violation.clone()),
        );
        self.check_duplicates(draft, &mut violations);
        self.check_unreadable(draft, &mut violations);
        self.check_required(draft, &mut violations);

        violations
    }

    fn check_duplicates(&self, draft: &SubmissionDraft, out: &mut Vec<ViolationDraft>) {
        let mut groups: BTreeMap<&Fingerprint, (BTreeSet<&str>, usize)> = BTreeMap::new();
        for file in &draft.files {
            let group = groups.entry(&file.fingerprint).or_default();
            group.0.insert(file.name.as_str());
            group.1 += 1;
        }
        for copy in &draft.duplicate_copies {
            let group = groups.entry(&copy.fingerprint).or_default();
            group.0.insert(copy.name.as_str());
            group.1 += 1;
        }

        for (fingerprint, (names, occurrences)) in groups {
            if names.len() < 2 {
                continue;
            }
            let severity = match self.duplicate_escalation_threshold {
                Some(threshold) if occurrences >= threshold => Severity::Flag,
                _ => Severity::Warning,
            };
            let names: Vec<&str> = names.into_iter().collect();
            out.push(ViolationDraft {
                kind: ViolationType::DuplicateContent,
                severity,
                subject: fingerprint.to_string(),
                description: format!(
                    "{} copies of identical content ({}): {}",
                    occurrences,
                    fingerprint.short(),
                    names.join(", ")
                ),
            });
        }
    }

    fn check_unreadable(&self, draft: &SubmissionDraft, out: &mut Vec<ViolationDraft>) {
        for unreadable in &draft.unreadable {
            out.push(ViolationDraft {
                kind: ViolationType::UnreadableFile,
                severity: Severity::Flag,
                subject: unreadable.source_path.clone(),
                description: format!("'{}' could not be read: {}", unreadable.name, unreadable.reason),
            });
        }
    }

    fn check_required(&self, draft: &SubmissionDraft, out: &mut Vec<ViolationDraft>) {
        let Some(required) = &self.required_files else {
            return;
        };
        if draft.files.is_empty() {
            return;
        }

        for pattern in required {
            let present = draft
                .files
                .iter()
                .any(|f| pattern.matches_with(&f.name, MATCH_OPTIONS));
            if !present {
                out.push(ViolationDraft {
                    kind: ViolationType::MissingRequiredFile,
                    severity: Severity::Flag,
                    subject: pattern.as_str().to_string(),
                    description: format!(
                        "No file matching '{}' was submitted by {}",
                        pattern.as_str(),
                        draft.student_id
                    ),
                });
            }
        }
    }
}
