//! Historical knowledge of slow ID ranges.
//!
//! The store is read-only while workers run. Observations are merged in once,
//! after every worker has joined, and the whole store is then persisted with
//! a temp-file + rename.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::{IdRange, SlowChunkRecord};
use crate::state::{read_json_file, write_json_atomic, STATE_SCHEMA_VERSION};

/// Most recent raw observations kept alongside the aggregated entries.
pub const HISTORY_LIMIT: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotZoneEntry {
    pub datacenter: u32,
    pub id_start: u64,
    pub id_end: u64,
    pub recommended_size: u64,
    pub hit_count: u32,
}

impl HotZoneEntry {
    pub fn range(&self) -> IdRange {
        IdRange::new(self.id_start, self.id_end)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HotZoneFile {
    schema_version: u32,
    #[serde(default)]
    entries: Vec<HotZoneEntry>,
    #[serde(default)]
    history: Vec<SlowChunkRecord>,
}

#[derive(Debug, Clone)]
pub struct HotZoneStore {
    path: Option<PathBuf>,
    entries: Vec<HotZoneEntry>,
    history: Vec<SlowChunkRecord>,
}

impl HotZoneStore {
    /// A store that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Load from `path`. A missing file is an empty store; an unreadable one
    /// is logged and also treated as empty so planning falls back to density.
    pub fn load(path: &Path) -> Self {
        let mut store = Self::in_memory();
        store.path = Some(path.to_path_buf());
        if !path.exists() {
            return store;
        }
        match read_json_file::<HotZoneFile>(path) {
            Ok(file) => {
                debug!(
                    path = %path.display(),
                    entries = file.entries.len(),
                    "loaded hot zones"
                );
                store.entries = file.entries;
                store.history = file.history;
                store.coalesce();
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %format!("{err:#}"),
                    "hot zone store unreadable; planning without hot zones"
                );
            }
        }
        store
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        let file = HotZoneFile {
            schema_version: STATE_SCHEMA_VERSION,
            entries: self.entries.clone(),
            history: self.history.clone(),
        };
        write_json_atomic(path, &file)
    }

    pub fn entries(&self) -> &[HotZoneEntry] {
        &self.entries
    }

    pub fn history(&self) -> &[SlowChunkRecord] {
        &self.history
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.history.clear();
    }

    /// The covering zone with the smallest recommended size, if any.
    pub fn lookup(&self, datacenter: u32, id: u64) -> Option<&HotZoneEntry> {
        self.entries
            .iter()
            .filter(|e| e.datacenter == datacenter && e.range().contains(id))
            .min_by_key(|e| e.recommended_size)
    }

    /// Fold one run's slow observations into the store.
    pub fn record_observations<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a SlowChunkRecord>,
        threshold: Duration,
        min_size: u64,
    ) -> usize {
        let mut merged = 0usize;
        for record in records {
            self.record(record, threshold, min_size);
            merged += 1;
        }
        if merged > 0 {
            info!(
                observations = merged,
                zones = self.entries.len(),
                "updated hot zones"
            );
        }
        merged
    }

    fn record(&mut self, record: &SlowChunkRecord, threshold: Duration, min_size: u64) {
        let recommended = recommended_size(record, threshold, min_size);
        let range = record.range;

        match self
            .entries
            .iter_mut()
            .find(|e| e.datacenter == record.datacenter && e.range().overlaps(&range))
        {
            Some(entry) => {
                entry.id_start = entry.id_start.min(range.start);
                entry.id_end = entry.id_end.max(range.end);
                entry.recommended_size = entry.recommended_size.min(recommended);
                entry.hit_count = entry.hit_count.saturating_add(1);
            }
            None => self.entries.push(HotZoneEntry {
                datacenter: record.datacenter,
                id_start: range.start,
                id_end: range.end,
                recommended_size: recommended,
                hit_count: 1,
            }),
        }
        self.coalesce();

        self.history.push(record.clone());
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }
}

impl HotZoneStore {
    /// Merge same-datacenter entries whose ranges overlap, which widening an
    /// entry can produce.
    fn coalesce(&mut self) {
        self.entries
            .sort_by_key(|e| (e.datacenter, e.id_start, e.id_end));
        let mut merged: Vec<HotZoneEntry> = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            match merged.last_mut() {
                Some(last) if last.datacenter == entry.datacenter && entry.id_start < last.id_end => {
                    last.id_end = last.id_end.max(entry.id_end);
                    last.recommended_size = last.recommended_size.min(entry.recommended_size);
                    last.hit_count = last.hit_count.saturating_add(entry.hit_count);
                }
                _ => merged.push(entry),
            }
        }
        self.entries = merged;
    }
}

/// Size that would have fit the observed chunk inside the threshold.
fn recommended_size(record: &SlowChunkRecord, threshold: Duration, min_size: u64) -> u64 {
    let span = record.range.len().max(1);
    let duration = record.duration.as_secs_f64();
    if duration <= 0.0 {
        return span;
    }
    let scaled = (span as f64 * threshold.as_secs_f64() / duration).floor() as u64;
    scaled.clamp(min_size.min(span), span)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slow(start: u64, end: u64, secs: u64, dc: u32) -> SlowChunkRecord {
        SlowChunkRecord::new(
            IdRange::new(start, end),
            Duration::from_secs(secs),
            100,
            dc,
            0,
        )
    }

    #[test]
    fn overlapping_observations_widen_one_zone() {
        let mut store = HotZoneStore::in_memory();
        let threshold = Duration::from_secs(10);
        store.record_observations(
            &[slow(1_000, 101_000, 40, 2), slow(90_000, 150_000, 20, 2)],
            threshold,
            1_000,
        );

        assert_eq!(store.entries().len(), 1);
        let entry = &store.entries()[0];
        assert_eq!((entry.id_start, entry.id_end), (1_000, 150_000));
        assert_eq!(entry.hit_count, 2);
        assert_eq!(entry.recommended_size, 25_000);
        assert_eq!(store.history().len(), 2);
    }

    #[test]
    fn widened_zone_absorbs_neighbours_it_now_overlaps() {
        let mut store = HotZoneStore::in_memory();
        let threshold = Duration::from_secs(10);
        store.record_observations(
            &[
                slow(0, 10_000, 20, 1),
                slow(20_000, 30_000, 40, 1),
                slow(40_000, 50_000, 20, 2),
            ],
            threshold,
            100,
        );
        assert_eq!(store.entries().len(), 3);

        store.record_observations(&[slow(5_000, 25_000, 20, 1)], threshold, 100);
        assert_eq!(store.entries().len(), 2);
        let entry = &store.entries()[0];
        assert_eq!((entry.datacenter, entry.id_start, entry.id_end), (1, 0, 30_000));
        assert_eq!(entry.hit_count, 3);
        assert_eq!(entry.recommended_size, 2_500);
        assert_eq!(store.entries()[1].datacenter, 2);
        for pair in store.entries().windows(2) {
            assert!(pair[0].datacenter != pair[1].datacenter || pair[0].id_end <= pair[1].id_start);
        }
    }

    #[test]
    fn datacenters_are_tracked_separately() {
        let mut store = HotZoneStore::in_memory();
        let threshold = Duration::from_secs(10);
        store.record_observations(
            &[slow(0, 10_000, 20, 1), slow(0, 10_000, 20, 4)],
            threshold,
            100,
        );
        assert_eq!(store.entries().len(), 2);
        assert!(store.lookup(1, 500).is_some());
        assert!(store.lookup(2, 500).is_none());
        assert!(store.lookup(4, 10_000).is_none());
    }

    #[test]
    fn recommendation_never_drops_below_minimum() {
        let record = slow(0, 10_000, 10_000, 1);
        assert_eq!(recommended_size(&record, Duration::from_secs(10), 1_000), 1_000);
    }

    #[test]
    fn corrupt_file_degrades_to_empty_store() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("hotzones.json");
        std::fs::write(&path, b"\x00garbage")?;
        let store = HotZoneStore::load(&path);
        assert!(store.is_empty());
        Ok(())
    }

    #[test]
    fn save_and_reload_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("hotzones.json");
        let mut store = HotZoneStore::load(&path);
        store.record_observations(&[slow(5, 50_005, 30, 3)], Duration::from_secs(10), 10);
        store.save()?;

        let reloaded = HotZoneStore::load(&path);
        assert_eq!(reloaded.entries(), store.entries());
        assert_eq!(reloaded.history().len(), 1);
        Ok(())
    }
}
