//! Per-run duplicate suppression.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::invites::normalize_invite_link;

/// Normalized identity of a collected entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum IdentityKey {
    Id(i64),
    Link(String),
}

impl IdentityKey {
    /// Numeric identity from loosely formatted input (`@123`, ` 123 `, `+123`).
    pub fn numeric(raw: &str) -> Option<Self> {
        let cleaned = raw.trim().trim_start_matches(['@', '+']);
        cleaned.parse::<i64>().ok().map(IdentityKey::Id)
    }

    /// Normalized invite link identity; `None` when the link is malformed.
    pub fn link(raw: &str) -> Option<Self> {
        normalize_invite_link(raw).ok().map(IdentityKey::Link)
    }
}

impl From<i64> for IdentityKey {
    fn from(id: i64) -> Self {
        IdentityKey::Id(id)
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKey::Id(id) => write!(f, "{}", id),
            IdentityKey::Link(link) => f.write_str(link),
        }
    }
}

/// Keys seen in one (target, mode) scope. Only grows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenSet {
    keys: HashSet<IdentityKey>,
}

impl SeenSet {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.keys.contains(key)
    }
}

/// Answers "first time seeing this key?" for the duration of a run.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: SeenSet,
    duplicates: u64,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume with keys already emitted by an earlier run.
    pub fn from_snapshot(seen: SeenSet) -> Self {
        Self {
            seen,
            duplicates: 0,
        }
    }

    /// True the first time `key` is observed, false afterwards.
    pub fn observe(&mut self, key: &IdentityKey) -> bool {
        if self.seen.keys.contains(key) {
            self.duplicates += 1;
            false
        } else {
            self.seen.keys.insert(key.clone());
            true
        }
    }

    pub fn snapshot(&self) -> SeenSet {
        self.seen.clone()
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }
}
