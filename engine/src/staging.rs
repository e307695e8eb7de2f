//! ARI staging store - committed values shadowed by pending edits.
//!
//! Committed values are what the channel has confirmed (or what the
//! property derived locally, such as inventory after a booking). Staged
//! values are edits not yet delivered. Reads always see staged over
//! committed; committed is only touched by [`StagingStore::commit`],
//! [`StagingStore::commit_published`] and [`StagingStore::commit_local`].

use crate::{
    ari::{AriCell, CellKey, PushType},
    error::Result,
    Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A staged edit waiting to be published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedChange {
    pub cell: AriCell,
    /// When the edit was staged
    pub staged_at: Timestamp,
}

/// Merge a staged value over a committed one.
pub fn overlay(committed: Option<&AriCell>, staged: Option<&AriCell>) -> Option<AriCell> {
    staged.or(committed).cloned()
}

/// Outcome of committing one published cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMerge {
    /// New committed value
    pub committed: AriCell,
    /// Whether the staged edit is now fully committed
    pub clear_staged: bool,
}

/// Fold the values sent by a publish of type `push` into committed.
///
/// Returns `None` when nothing is staged or the staged value disagrees with
/// `sent` on a pushed field.
pub fn merge_published(
    committed: Option<&AriCell>,
    staged: Option<&AriCell>,
    sent: &AriCell,
    push: PushType,
) -> Option<PublishedMerge> {
    let staged = staged?;
    if !staged.pushed_eq(sent, push) {
        return None;
    }
    let merged = committed.cloned().unwrap_or_default().with_pushed(sent, push);
    Some(PublishedMerge {
        clear_staged: merged == *staged,
        committed: merged,
    })
}

/// A committed value that changed through a local commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedChange {
    pub key: CellKey,
    pub before: Option<AriCell>,
    pub after: AriCell,
}

/// Raised after a local commit so the affected cells get published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEvent {
    pub cells: Vec<CellKey>,
    pub push_type: PushType,
}

impl CommitEvent {
    /// Collapse committed changes into one event.
    ///
    /// Returns `None` if no pushed value actually changed.
    pub fn from_changes(changes: &[CommittedChange]) -> Option<Self> {
        let mut push_type: Option<PushType> = None;
        let mut cells = Vec::new();
        for change in changes {
            if let Some(kind) = PushType::for_change(change.before.as_ref(), &change.after) {
                push_type = Some(push_type.map_or(kind, |p| p.union(kind)));
                cells.push(change.key.clone());
            }
        }
        cells.sort();
        push_type.map(|push_type| CommitEvent { cells, push_type })
    }
}

/// Committed ARI values plus a sparse overlay of staged edits.
///
/// Each key has a single staging slot: staging the same key again replaces
/// the previous edit entirely.
#[derive(Debug, Clone, Default)]
pub struct StagingStore {
    committed: HashMap<CellKey, AriCell>,
    staged: HashMap<CellKey, StagedChange>,
}

impl StagingStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed committed values, e.g. from persistent storage.
    pub fn load_committed(&mut self, cells: impl IntoIterator<Item = (CellKey, AriCell)>) {
        self.committed.extend(cells);
    }

    /// Stage an edit, replacing any earlier edit for the same key.
    pub fn stage(&mut self, key: CellKey, cell: AriCell, timestamp: Timestamp) -> Result<()> {
        cell.validate()?;
        self.staged.insert(
            key,
            StagedChange {
                cell,
                staged_at: timestamp,
            },
        );
        Ok(())
    }

    /// The value a reader should see: staged if present, else committed.
    pub fn effective(&self, key: &CellKey) -> Option<AriCell> {
        overlay(self.committed(key), self.staged(key))
    }

    pub fn committed(&self, key: &CellKey) -> Option<&AriCell> {
        self.committed.get(key)
    }

    pub fn staged(&self, key: &CellKey) -> Option<&AriCell> {
        self.staged.get(key).map(|s| &s.cell)
    }

    pub fn staged_change(&self, key: &CellKey) -> Option<&StagedChange> {
        self.staged.get(key)
    }

    /// Move staged values to committed and clear them from staging.
    ///
    /// Keys with nothing staged are skipped. Returns the committed keys.
    pub fn commit(&mut self, keys: &[CellKey]) -> Vec<CellKey> {
        let mut committed = Vec::new();
        for key in keys {
            if let Some(change) = self.staged.remove(key) {
                self.committed.insert(key.clone(), change.cell);
                committed.push(key.clone());
            }
        }
        committed
    }

    /// Commit the values a publish actually delivered.
    ///
    /// Only the fields covered by `push` move to committed. A cell whose
    /// staged value no longer matches what was sent was re-staged while the
    /// publish was in flight and is skipped. The staged edit is cleared once
    /// committed holds all of it. Returns the keys whose committed value was
    /// updated.
    pub fn commit_published(
        &mut self,
        pushed: &[(CellKey, AriCell)],
        push: PushType,
    ) -> Vec<CellKey> {
        let mut committed = Vec::new();
        for (key, sent) in pushed {
            let merge = merge_published(self.committed(key), self.staged(key), sent, push);
            let Some(merge) = merge else {
                continue;
            };
            if merge.clear_staged {
                self.staged.remove(key);
            }
            self.committed.insert(key.clone(), merge.committed);
            committed.push(key.clone());
        }
        committed
    }

    /// Write committed values directly, bypassing staging.
    ///
    /// Used for locally derived values such as inventory decrements. Staged
    /// edits for the same keys are left in place.
    pub fn commit_local(&mut self, cells: Vec<(CellKey, AriCell)>) -> Vec<CommittedChange> {
        cells
            .into_iter()
            .map(|(key, after)| {
                let before = self.committed.insert(key.clone(), after.clone());
                CommittedChange { key, before, after }
            })
            .collect()
    }

    /// Drop staged edits. Returns how many were removed.
    pub fn clear(&mut self, keys: &[CellKey]) -> usize {
        keys.iter()
            .filter(|key| self.staged.remove(*key).is_some())
            .count()
    }

    /// All staged keys in key order.
    pub fn staged_keys(&self) -> Vec<CellKey> {
        let mut keys: Vec<_> = self.staged.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn pending_count(&self) -> usize {
        self.staged.len()
    }

    /// Effective values for a set of keys, skipping keys with no value.
    pub fn effective_many(&self, keys: &[CellKey]) -> BTreeMap<CellKey, AriCell> {
        keys.iter()
            .filter_map(|key| self.effective(key).map(|cell| (key.clone(), cell)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_758_758_400 + secs, 0).unwrap()
    }

    fn key(day: u32) -> CellKey {
        CellKey::new(NaiveDate::from_ymd_opt(2025, 9, day).unwrap(), "std", "bar")
    }

    fn cell(rate: i64, available: u32) -> AriCell {
        AriCell {
            rate,
            available,
            ..Default::default()
        }
    }

    #[test]
    fn effective_prefers_staged() {
        let mut store = StagingStore::new();
        store.load_committed([(key(25), cell(10000, 5))]);
        assert_eq!(store.effective(&key(25)), Some(cell(10000, 5)));

        store.stage(key(25), cell(15000, 5), at(1)).unwrap();
        assert_eq!(store.effective(&key(25)), Some(cell(15000, 5)));
        assert_eq!(store.committed(&key(25)), Some(&cell(10000, 5)));
    }

    #[test]
    fn stage_replaces_whole_cell() {
        let mut store = StagingStore::new();
        let mut first = cell(15000, 5);
        first.stop_sell = true;
        store.stage(key(25), first, at(1)).unwrap();
        store.stage(key(25), cell(16000, 3), at(2)).unwrap();

        let staged = store.staged_change(&key(25)).unwrap();
        assert_eq!(staged.cell, cell(16000, 3));
        assert_eq!(staged.staged_at, at(2));
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn stage_rejects_invalid_cell() {
        let mut store = StagingStore::new();
        assert!(store.stage(key(25), cell(-5, 1), at(1)).is_err());
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn commit_moves_staged_to_committed() {
        let mut store = StagingStore::new();
        store.stage(key(25), cell(15000, 5), at(1)).unwrap();

        let committed = store.commit(&[key(25), key(26)]);
        assert_eq!(committed, vec![key(25)]);
        assert_eq!(store.committed(&key(25)), Some(&cell(15000, 5)));
        assert!(store.staged(&key(25)).is_none());
        assert_eq!(store.effective(&key(25)), Some(cell(15000, 5)));
    }

    #[test]
    fn commit_published_skips_restaged_cells() {
        let mut store = StagingStore::new();
        store.stage(key(25), cell(15000, 5), at(1)).unwrap();
        store.stage(key(26), cell(15000, 5), at(1)).unwrap();
        let pushed = vec![(key(25), cell(15000, 5)), (key(26), cell(15000, 5))];

        // Edited again while the publish was in flight
        store.stage(key(26), cell(17000, 5), at(2)).unwrap();

        let committed = store.commit_published(&pushed, PushType::All);
        assert_eq!(committed, vec![key(25)]);
        assert_eq!(store.staged(&key(26)), Some(&cell(17000, 5)));
        assert!(store.committed(&key(26)).is_none());
    }

    #[test]
    fn partial_publish_keeps_unsent_fields_staged() {
        let mut store = StagingStore::new();
        store.load_committed([(key(25), cell(10000, 5))]);
        let mut edit = cell(15000, 5);
        edit.stop_sell = true;
        store.stage(key(25), edit.clone(), at(1)).unwrap();

        let pushed = vec![(key(25), edit.clone())];
        assert_eq!(store.commit_published(&pushed, PushType::Rate), vec![key(25)]);
        assert_eq!(store.committed(&key(25)), Some(&cell(15000, 5)));
        assert_eq!(store.staged(&key(25)), Some(&edit));

        // The restriction push delivers the rest.
        assert_eq!(store.commit_published(&pushed, PushType::Restriction), vec![key(25)]);
        assert_eq!(store.committed(&key(25)), Some(&edit));
        assert!(store.staged(&key(25)).is_none());
    }

    #[test]
    fn partial_publish_ignores_restaged_unsent_fields() {
        let mut store = StagingStore::new();
        store.stage(key(25), cell(15000, 5), at(1)).unwrap();
        let pushed = vec![(key(25), cell(15000, 5))];

        // Availability changed while a rate push was in flight.
        store.stage(key(25), cell(15000, 2), at(2)).unwrap();
        store.commit_published(&pushed, PushType::Rate);
        assert_eq!(store.committed(&key(25)).map(|c| c.rate), Some(15000));
        assert_eq!(store.staged(&key(25)), Some(&cell(15000, 2)));
    }

    #[test]
    fn commit_local_reports_changes() {
        let mut store = StagingStore::new();
        store.load_committed([(key(25), cell(10000, 5))]);

        let changes = store.commit_local(vec![(key(25), cell(10000, 4)), (key(26), cell(9000, 2))]);
        assert_eq!(changes[0].before, Some(cell(10000, 5)));
        assert_eq!(changes[1].before, None);

        let event = CommitEvent::from_changes(&changes).unwrap();
        assert_eq!(event.cells, vec![key(25), key(26)]);
        assert_eq!(event.push_type, PushType::All);

        let event = CommitEvent::from_changes(&changes[..1]).unwrap();
        assert_eq!(event.push_type, PushType::Availability);
    }

    #[test]
    fn commit_event_ignores_noop_changes() {
        let change = CommittedChange {
            key: key(25),
            before: Some(cell(10000, 5)),
            after: cell(10000, 5),
        };
        assert!(CommitEvent::from_changes(&[change]).is_none());
    }

    #[test]
    fn clear_removes_only_staged() {
        let mut store = StagingStore::new();
        store.load_committed([(key(25), cell(10000, 5))]);
        store.stage(key(25), cell(15000, 5), at(1)).unwrap();

        assert_eq!(store.clear(&[key(25), key(26)]), 1);
        assert_eq!(store.effective(&key(25)), Some(cell(10000, 5)));
        assert!(store.staged_keys().is_empty());
    }
}
