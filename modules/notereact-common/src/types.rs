use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ReactionError, Result};

// ---------------------------------------------------------------------------
// ReactionKind
// ---------------------------------------------------------------------------

/// The closed set of reactions a user can leave on a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionKind {
    Like,
    Love,
    Haha,
    Wow,
    Sad,
    Angry,
}

impl ReactionKind {
    pub const ALL: [ReactionKind; 6] = [
        ReactionKind::Like,
        ReactionKind::Love,
        ReactionKind::Haha,
        ReactionKind::Wow,
        ReactionKind::Sad,
        ReactionKind::Angry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReactionKind::Like => "like",
            ReactionKind::Love => "love",
            ReactionKind::Haha => "haha",
            ReactionKind::Wow => "wow",
            ReactionKind::Sad => "sad",
            ReactionKind::Angry => "angry",
        }
    }
}

impl fmt::Display for ReactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a reaction name is not one of [`ReactionKind::ALL`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown reaction kind: {0:?}")]
pub struct UnknownReactionKind(pub String);

impl FromStr for ReactionKind {
    type Err = UnknownReactionKind;

    /// Case-insensitive, surrounding whitespace ignored.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let sanitized = s.trim().to_ascii_lowercase();
        ReactionKind::ALL
            .into_iter()
            .find(|k| k.as_str() == sanitized)
            .ok_or_else(|| UnknownReactionKind(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ReactionChange
// ---------------------------------------------------------------------------

/// The resolved outcome for one (note, user) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionChange {
    Set(ReactionKind),
    Removed,
}

impl ReactionChange {
    /// Interpret the producer's `type` field. Absent, empty and the literal
    /// `null` all mean the reaction was withdrawn.
    pub fn from_raw(raw: Option<&str>) -> std::result::Result<Self, UnknownReactionKind> {
        match raw.map(str::trim) {
            None | Some("") => Ok(ReactionChange::Removed),
            Some(s) if s.eq_ignore_ascii_case("null") => Ok(ReactionChange::Removed),
            Some(s) => s.parse().map(ReactionChange::Set),
        }
    }

    pub fn kind(&self) -> Option<ReactionKind> {
        match self {
            ReactionChange::Set(kind) => Some(*kind),
            ReactionChange::Removed => None,
        }
    }
}

// ---------------------------------------------------------------------------
// NoteCounts
// ---------------------------------------------------------------------------

/// Per-kind counters for one note. Used both for absolute totals and for
/// signed deltas. Kinds that are absent read as zero, so two values compare
/// equal when every kind has the same count.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteCounts(BTreeMap<ReactionKind, i64>);

impl NoteCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every kind present with a zero count.
    pub fn zeroed() -> Self {
        Self(ReactionKind::ALL.into_iter().map(|k| (k, 0)).collect())
    }

    pub fn get(&self, kind: ReactionKind) -> i64 {
        self.0.get(&kind).copied().unwrap_or(0)
    }

    pub fn add(&mut self, kind: ReactionKind, delta: i64) {
        *self.0.entry(kind).or_insert(0) += delta;
    }

    pub fn with(mut self, kind: ReactionKind, count: i64) -> Self {
        self.0.insert(kind, count);
        self
    }

    /// Add every counter of `other` into `self`.
    pub fn merge(&mut self, other: &NoteCounts) {
        for (kind, delta) in other.iter() {
            self.add(kind, delta);
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0.values().all(|v| *v == 0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total(&self) -> i64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReactionKind, i64)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }

    /// Encode as flat string fields (kind name → decimal count), the layout
    /// used for cached hashes.
    pub fn to_fields(&self) -> HashMap<String, String> {
        self.0
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_string()))
            .collect()
    }

    /// Decode flat string fields. Unknown kinds and non-numeric counts are
    /// rejected rather than silently dropped.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let mut counts = NoteCounts::new();
        for (name, value) in fields {
            let kind: ReactionKind = name
                .parse()
                .map_err(|e: UnknownReactionKind| ReactionError::Cache(e.to_string()))?;
            let count: i64 = value.parse().map_err(|_| {
                ReactionError::Cache(format!("non-numeric count {value:?} for {kind}"))
            })?;
            counts.0.insert(kind, count);
        }
        Ok(counts)
    }
}

impl PartialEq for NoteCounts {
    fn eq(&self, other: &Self) -> bool {
        ReactionKind::ALL
            .into_iter()
            .all(|k| self.get(k) == other.get(k))
    }
}

impl Eq for NoteCounts {}

impl FromIterator<(ReactionKind, i64)> for NoteCounts {
    fn from_iter<T: IntoIterator<Item = (ReactionKind, i64)>>(iter: T) -> Self {
        let mut counts = NoteCounts::new();
        for (kind, n) in iter {
            counts.add(kind, n);
        }
        counts
    }
}

// ---------------------------------------------------------------------------
// Batch shapes
// ---------------------------------------------------------------------------

/// noteId → userId → resolved change. Ordered so bulk writes visit rows in a
/// stable order across concurrent batches.
pub type NotesMap = BTreeMap<String, BTreeMap<String, ReactionChange>>;

/// What a bulk apply reports back: the signed change per note and the
/// post-increment counters per note.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkApplyOutcome {
    pub note_deltas: BTreeMap<String, NoteCounts>,
    pub note_totals: BTreeMap<String, NoteCounts>,
}

/// Parse a note or user identifier. Only the canonical lowercase hyphenated
/// UUID form is accepted, so one note never appears under two spellings.
pub fn parse_id(field: &str, raw: &str) -> Result<Uuid> {
    match Uuid::parse_str(raw) {
        Ok(id) if id.hyphenated().to_string() == raw => Ok(id),
        _ => Err(ReactionError::Validation(format!("invalid {field}: {raw:?}"))),
    }
}
