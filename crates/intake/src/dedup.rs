//! Job-scoped content deduplication.
//!
//! The deduplicator never looks at earlier jobs: re-uploading a file in a
//! later job is a resubmission, not a duplicate.

use std::collections::HashMap;
use std::fmt;

use sha2::{Digest, Sha256};

use crate::unpacker::Entry;

/// SHA-256 of an entry's raw bytes, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Fingerprint {
    fn from(hex: String) -> Self {
        Self(hex)
    }
}

/// Where a fingerprint was first seen in this job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstSeen {
    pub path: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    First,
    DuplicateOf(FirstSeen),
}

#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: HashMap<Fingerprint, FirstSeen>,
    duplicates: usize,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an entry and reports whether its content was already seen.
    pub fn observe(&mut self, entry: &Entry) -> (Fingerprint, Observation) {
        let fingerprint = Fingerprint::of(&entry.content);
        let observation = self.observe_fingerprint(&fingerprint, entry);
        (fingerprint, observation)
    }

    pub fn observe_fingerprint(&mut self, fingerprint: &Fingerprint, entry: &Entry) -> Observation {
        if let Some(first) = self.seen.get(fingerprint) {
            self.duplicates += 1;
            return Observation::DuplicateOf(first.clone());
        }

        self.seen.insert(
            fingerprint.clone(),
            FirstSeen {
                path: entry.display_path(),
                name: entry.name.clone(),
            },
        );
        Observation::First
    }

    pub fn duplicate_count(&self) -> usize {
        self.duplicates
    }

    pub fn distinct_count(&self) -> usize {
        self.seen.len()
    }
}
