use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::path::PathBuf;

use prmetrics_core::IdentityKey;
use serde::Serialize;

use crate::StoredRow;

/// Two copies of one pull request disagree on a field that should never change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityConflict {
    pub identity: IdentityKey,
    pub field: &'static str,
    pub kept: String,
    pub discarded: String,
    pub kept_source: PathBuf,
    pub discarded_source: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct DedupReport {
    /// One row per identity, ordered by identity.
    pub rows: Vec<StoredRow>,
    pub input_rows: usize,
    pub duplicates_removed: usize,
    pub conflicts: Vec<IntegrityConflict>,
}

/// Total order over copies of the same identity; the greater copy is the one shown.
fn rank(left: &StoredRow, right: &StoredRow) -> Ordering {
    left.batch_collected_at
        .cmp(&right.batch_collected_at)
        .then_with(|| left.columns().len().cmp(&right.columns().len()))
        .then_with(|| {
            left.record
                .update_marker()
                .cmp(&right.record.update_marker())
        })
        .then_with(|| left.record.fingerprint().cmp(&right.record.fingerprint()))
        .then_with(|| left.batch_id.cmp(&right.batch_id))
        .then_with(|| left.source.cmp(&right.source))
}

/// Picks the winning copy. Commutative and associative, so folding it over the
/// copies of an identity gives the same winner in any order.
pub fn prefer<'a>(left: &'a StoredRow, right: &'a StoredRow) -> &'a StoredRow {
    match rank(left, right) {
        Ordering::Less => right,
        Ordering::Equal | Ordering::Greater => left,
    }
}

pub fn dedupe(rows: impl IntoIterator<Item = StoredRow>) -> DedupReport {
    let mut winners: BTreeMap<IdentityKey, StoredRow> = BTreeMap::new();
    let mut report = DedupReport::default();

    for row in rows {
        report.input_rows += 1;
        match winners.entry(row.record.identity()) {
            Entry::Vacant(slot) => {
                slot.insert(row);
            }
            Entry::Occupied(mut slot) => {
                report.duplicates_removed += 1;
                let incoming_wins = rank(&row, slot.get()) == Ordering::Greater;
                let (kept, discarded) = if incoming_wins {
                    (&row, slot.get())
                } else {
                    (slot.get(), &row)
                };
                report.conflicts.extend(integrity_conflicts(kept, discarded));
                if incoming_wins {
                    slot.insert(row);
                }
            }
        }
    }

    for conflict in &report.conflicts {
        tracing::warn!(
            identity = %conflict.identity,
            field = conflict.field,
            kept = %conflict.kept,
            discarded = %conflict.discarded,
            "integrity conflict between stored copies; keeping most recent"
        );
    }

    report.rows = winners.into_values().collect();
    report
}

fn integrity_conflicts(kept: &StoredRow, discarded: &StoredRow) -> Vec<IntegrityConflict> {
    let fields = [
        (
            "author",
            kept.record.author.clone(),
            discarded.record.author.clone(),
        ),
        (
            "created_at",
            display_timestamp(kept.record.created_at),
            display_timestamp(discarded.record.created_at),
        ),
    ];

    fields
        .into_iter()
        .filter(|(_, kept_value, discarded_value)| kept_value != discarded_value)
        .map(|(field, kept_value, discarded_value)| IntegrityConflict {
            identity: kept.record.identity(),
            field,
            kept: kept_value,
            discarded: discarded_value,
            kept_source: kept.source.clone(),
            discarded_source: discarded.source.clone(),
        })
        .collect()
}

fn display_timestamp(value: Option<chrono::DateTime<chrono::Utc>>) -> String {
    value
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "null".to_owned())
}
