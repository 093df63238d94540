//! Classification of incoming records against what the store already holds.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// How an incoming record that already exists for the owner is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConflictMode {
    /// Leave the stored record untouched and count it as skipped.
    #[default]
    #[serde(rename = "skip", alias = "skip-existing")]
    SkipExisting,
    /// Overwrite the stored record and count it as updated.
    #[serde(rename = "override", alias = "overwrite-existing", alias = "overwrite")]
    OverwriteExisting,
}

impl fmt::Display for ConflictMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictMode::SkipExisting => write!(f, "skip-existing"),
            ConflictMode::OverwriteExisting => write!(f, "overwrite-existing"),
        }
    }
}

/// What to do with one incoming record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Insert,
    Skip { existing_id: String },
    Update { existing_id: String },
}

impl Disposition {
    /// Authoritative id of the matched stored record, if any.
    pub fn existing_id(&self) -> Option<&str> {
        match self {
            Disposition::Insert => None,
            Disposition::Skip { existing_id } | Disposition::Update { existing_id } => {
                Some(existing_id.as_str())
            }
        }
    }
}

/// Classify a record given its `(local id, owner)` match in the store.
pub fn classify(existing: Option<&str>, mode: ConflictMode) -> Disposition {
    match (existing, mode) {
        (None, _) => Disposition::Insert,
        (Some(id), ConflictMode::SkipExisting) => Disposition::Skip {
            existing_id: id.to_string(),
        },
        (Some(id), ConflictMode::OverwriteExisting) => Disposition::Update {
            existing_id: id.to_string(),
        },
    }
}

/// Classification of a whole entity batch, in input order.
///
/// `None` marks a record whose local id already appeared earlier in the same
/// batch; the first occurrence wins and repeats are counted as skipped.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub entries: Vec<Option<Disposition>>,
}

impl Plan {
    pub fn inserts(&self) -> usize {
        self.count(|d| matches!(d, Disposition::Insert))
    }

    pub fn updates(&self) -> usize {
        self.count(|d| matches!(d, Disposition::Update { .. }))
    }

    /// Skipped existing records plus in-batch repeats.
    pub fn skips(&self) -> usize {
        self.count(|d| matches!(d, Disposition::Skip { .. })) + self.duplicates()
    }

    pub fn duplicates(&self) -> usize {
        self.entries.iter().filter(|e| e.is_none()).count()
    }

    /// Number of distinct records that matched an existing row.
    pub fn preexisting(&self) -> usize {
        self.count(|d| d.existing_id().is_some())
    }

    fn count(&self, pred: impl Fn(&Disposition) -> bool) -> usize {
        self.entries.iter().flatten().filter(|d| pred(d)).count()
    }
}

/// Classify every record of a batch.
pub fn plan(local_ids: &[&str], existing: &HashMap<String, String>, mode: ConflictMode) -> Plan {
    let mut seen = HashSet::new();
    let entries = local_ids
        .iter()
        .map(|local| {
            if !seen.insert(*local) {
                return None;
            }
            Some(classify(existing.get(*local).map(String::as_str), mode))
        })
        .collect();
    Plan { entries }
}
