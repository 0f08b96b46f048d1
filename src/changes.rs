//! Diff a fresh fetch against the stored snapshot.
use std::collections::{BTreeMap, HashSet};
use std::io;
use tracing::info;

use crate::model::RawRecord;
use crate::snapshot::SnapshotStore;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub added: Vec<RawRecord>,
    pub changed: Vec<RawRecord>,
    pub removed: Vec<RawRecord>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.changed.len() + self.removed.len()
    }
}

/// Row identity: `ID`, `Id` or `id`, else the row's position.
pub fn record_key(record: &RawRecord, index: usize) -> String {
    ["ID", "Id", "id"]
        .iter()
        .find_map(|k| match record.get(*k) {
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        })
        .unwrap_or_else(|| format!("#{}", index))
}

fn keyed(records: &[RawRecord]) -> BTreeMap<String, (usize, String)> {
    records
        .iter()
        .enumerate()
        .map(|(i, r)| (record_key(r, i), (i, r.to_string())))
        .collect()
}

/// Partition `fresh` against `old` by row identity and serialized equality.
pub fn diff(old: &[RawRecord], fresh: &[RawRecord]) -> ChangeSet {
    let old_map = keyed(old);
    let new_map = keyed(fresh);
    let mut set = ChangeSet::default();

    for (key, (old_idx, old_text)) in &old_map {
        match new_map.get(key) {
            None => set.removed.push(old[*old_idx].clone()),
            Some((new_idx, new_text)) if new_text != old_text => {
                set.changed.push(fresh[*new_idx].clone())
            }
            Some(_) => {}
        }
    }

    let old_keys: HashSet<&String> = old_map.keys().collect();
    for (i, record) in fresh.iter().enumerate() {
        if !old_keys.contains(&record_key(record, i)) {
            set.added.push(record.clone());
        }
    }
    set
}

/// A diff against the stored snapshot, not yet persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Comparison {
    pub changes: ChangeSet,
    /// The snapshot must be rewritten once the fetch is accepted.
    pub stale: bool,
}

/// Diff `fresh` against the stored snapshot for `table` without touching it.
/// With no snapshot every row counts as added.
pub fn compare(store: &SnapshotStore, table: &str, fresh: &[RawRecord]) -> io::Result<Comparison> {
    let Some(previous) = store.load(table)? else {
        info!(table, added = fresh.len(), "no snapshot, all rows new");
        return Ok(Comparison {
            changes: ChangeSet {
                added: fresh.to_vec(),
                ..Default::default()
            },
            stale: true,
        });
    };

    let changes = diff(&previous.records, fresh);
    info!(
        table,
        added = changes.added.len(),
        changed = changes.changed.len(),
        removed = changes.removed.len(),
        "changes detected"
    );
    let stale = !changes.is_empty();
    Ok(Comparison { changes, stale })
}

/// [`compare`], then persist `fresh` whenever anything differs or no
/// snapshot existed.
pub fn detect(store: &SnapshotStore, table: &str, fresh: &[RawRecord]) -> io::Result<ChangeSet> {
    let comparison = compare(store, table, fresh)?;
    if comparison.stale {
        store.save(table, fresh)?;
    }
    Ok(comparison.changes)
}
