//! K-way merge of per-worker shard files into one ascending stream.
//!
//! Work stealing means a worker's shard holds chunks in whatever order the
//! worker happened to pull them, so file order says nothing about ID order.
//! Each [`ShardReader`] first indexes its frames by first record ID. A frame
//! is only decoded once the shard's stream reaches its first ID, and frames
//! whose ranges overlap are merged inside the reader, so every shard is
//! individually ascending. The [`ShardMerger`] then keeps one head record per
//! shard in a min-heap and always emits the smallest.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::iter::Peekable;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::frame::{FrameError, FrameReader};
use crate::model::MessageRecord;

#[derive(Debug, Clone, Copy)]
struct FrameIndexEntry {
    offset: u64,
    first_id: u64,
}

/// Lazily replays one shard file in ascending ID order.
pub struct ShardReader {
    path: PathBuf,
    reader: FrameReader<BufReader<fs::File>>,
    frames: VecDeque<FrameIndexEntry>,
    /// Decoded frames that still hold unread records.
    open: Vec<Peekable<std::vec::IntoIter<MessageRecord>>>,
    frame_count: usize,
    damaged: bool,
}

impl ShardReader {
    /// Open and index a shard. Frames after the first truncated or corrupt
    /// one are discarded with a warning.
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = FrameReader::open(path)
            .with_context(|| format!("failed to open shard {}", path.display()))?;
        let mut frames = Vec::new();
        let mut damaged = false;

        loop {
            let frame = match reader.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    warn_damaged(path, &err);
                    damaged = true;
                    break;
                }
            };
            match frame.decode() {
                Ok(records) => {
                    if let Some(first_id) = records.iter().map(|r| r.id).min() {
                        frames.push(FrameIndexEntry {
                            offset: frame.offset,
                            first_id,
                        });
                    }
                }
                Err(err) => {
                    warn_damaged(path, &err);
                    damaged = true;
                    break;
                }
            }
        }

        frames.sort_by_key(|f| f.first_id);
        debug!(shard = %path.display(), frames = frames.len(), "indexed shard");
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            frame_count: frames.len(),
            frames: frames.into(),
            open: Vec::new(),
            damaged,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn is_damaged(&self) -> bool {
        self.damaged
    }

    fn load_next_frame(&mut self) -> Result<Option<Vec<MessageRecord>>, FrameError> {
        let Some(entry) = self.frames.pop_front() else {
            return Ok(None);
        };
        self.reader.seek_to(entry.offset)?;
        let frame = self
            .reader
            .next_frame()?
            .ok_or(FrameError::Truncated {
                offset: entry.offset,
            })?;
        let mut records = frame.decode()?;
        if records.windows(2).any(|pair| pair[0].id > pair[1].id) {
            warn!(shard = %self.path.display(), offset = entry.offset, "frame records out of order; sorting");
            records.sort_by_key(|r| r.id);
        }
        Ok(Some(records))
    }

    /// Next record in ascending order, or `None` when the shard is exhausted.
    pub fn next_record(&mut self) -> Option<MessageRecord> {
        loop {
            let head = self
                .open
                .iter_mut()
                .enumerate()
                .filter_map(|(idx, frame)| frame.peek().map(|r| (r.id, idx)))
                .min();
            let next_first = self.frames.front().map(|f| f.first_id);
            match (head, next_first) {
                // An undecoded frame may hold IDs at or below the current head.
                (Some((id, _)), Some(first)) if first <= id => self.open_next_frame(),
                (None, Some(_)) => self.open_next_frame(),
                (Some((_, idx)), _) => {
                    let record = self.open[idx].next();
                    self.open.retain_mut(|frame| frame.peek().is_some());
                    return record;
                }
                (None, None) => return None,
            }
        }
    }

    fn open_next_frame(&mut self) {
        match self.load_next_frame() {
            Ok(Some(records)) => self.open.push(records.into_iter().peekable()),
            Ok(None) => {}
            Err(err) => {
                warn_damaged(&self.path, &err);
                self.damaged = true;
                self.frames.clear();
            }
        }
    }
}

fn warn_damaged(path: &Path, err: &FrameError) {
    warn!(
        shard = %path.display(),
        error = %err,
        "discarding unreadable remainder of shard"
    );
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeStats {
    pub shards: usize,
    pub frames: usize,
    pub records_emitted: usize,
    pub duplicates_dropped: usize,
    pub out_of_order_dropped: usize,
    pub damaged_shards: usize,
}

/// Strictly ascending, duplicate-free iterator over all shards.
pub struct ShardMerger {
    readers: Vec<ShardReader>,
    heads: Vec<Option<MessageRecord>>,
    heap: BinaryHeap<Reverse<(u64, usize)>>,
    paths: Vec<PathBuf>,
    last_id: Option<u64>,
    stats: MergeStats,
    exhausted: bool,
}

impl ShardMerger {
    /// Open every shard. Shards that cannot be opened at all are skipped with
    /// a warning and left on disk.
    pub fn open(paths: &[PathBuf]) -> Self {
        let mut readers = Vec::with_capacity(paths.len());
        let mut stats = MergeStats::default();
        let mut opened = Vec::with_capacity(paths.len());
        for path in paths {
            match ShardReader::open(path) {
                Ok(reader) => {
                    stats.frames += reader.frame_count();
                    opened.push(path.clone());
                    readers.push(reader);
                }
                Err(err) => {
                    warn!(shard = %path.display(), error = %format!("{err:#}"), "skipping shard");
                    stats.damaged_shards += 1;
                }
            }
        }
        stats.shards = readers.len();

        let mut heads = Vec::with_capacity(readers.len());
        let mut heap = BinaryHeap::with_capacity(readers.len());
        for (idx, reader) in readers.iter_mut().enumerate() {
            let head = reader.next_record();
            if let Some(record) = head.as_ref() {
                heap.push(Reverse((record.id, idx)));
            }
            heads.push(head);
        }

        Self {
            readers,
            heads,
            heap,
            paths: opened,
            last_id: None,
            stats,
            exhausted: false,
        }
    }

    /// Every `*.shard` file in `dir`, sorted by name.
    pub fn shard_paths(dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_file() && path.extension().is_some_and(|ext| ext == "shard") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    pub fn stats(&self) -> &MergeStats {
        &self.stats
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Delete the consumed shard files. Only allowed once the merge has been
    /// fully drained; otherwise the shards are kept for a later run.
    pub fn finish(mut self) -> Result<MergeStats> {
        for reader in &self.readers {
            if reader.is_damaged() {
                self.stats.damaged_shards += 1;
            }
        }
        if !self.exhausted {
            warn!(shards = self.paths.len(), "merge not drained; keeping shard files");
            return Ok(self.stats);
        }
        drop(self.readers);
        for path in &self.paths {
            fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))?;
        }
        info!(
            shards = self.stats.shards,
            records = self.stats.records_emitted,
            duplicates = self.stats.duplicates_dropped,
            "merged shards"
        );
        Ok(self.stats)
    }
}

impl Iterator for ShardMerger {
    type Item = MessageRecord;

    fn next(&mut self) -> Option<MessageRecord> {
        while let Some(Reverse((id, idx))) = self.heap.pop() {
            let record = self.heads[idx].take();
            let next = self.readers[idx].next_record();
            if let Some(next_record) = next.as_ref() {
                self.heap.push(Reverse((next_record.id, idx)));
            }
            self.heads[idx] = next;

            let Some(record) = record else {
                continue;
            };
            match self.last_id {
                Some(last) if id == last => {
                    self.stats.duplicates_dropped += 1;
                    continue;
                }
                Some(last) if id < last => {
                    warn!(id, last, "record behind merge position; dropping");
                    self.stats.out_of_order_dropped += 1;
                    continue;
                }
                _ => {}
            }
            self.last_id = Some(id);
            self.stats.records_emitted += 1;
            return Some(record);
        }
        self.exhausted = true;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;

    fn records(ids: impl IntoIterator<Item = u64>) -> Vec<MessageRecord> {
        ids.into_iter().map(MessageRecord::new).collect()
    }

    fn write_shard(dir: &Path, name: &str, frames: &[Vec<MessageRecord>]) -> Result<PathBuf> {
        let path = dir.join(name);
        let mut bytes = Vec::new();
        for frame in frames {
            bytes.extend(encode_frame(frame, true)?);
        }
        fs::write(&path, bytes)?;
        Ok(path)
    }

    fn ids(merger: &mut ShardMerger) -> Vec<u64> {
        merger.by_ref().map(|r| r.id).collect()
    }

    #[test]
    fn frames_out_of_order_within_a_shard_still_merge_ascending() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let a = write_shard(
            dir.path(),
            "worker-000.shard",
            &[records(70..80), records(10..20), records(40..50)],
        )?;
        let b = write_shard(
            dir.path(),
            "worker-001.shard",
            &[records(50..70), records(0..10)],
        )?;
        let c = write_shard(dir.path(), "worker-002.shard", &[records(20..40)])?;

        let mut merger = ShardMerger::open(&[a, b, c]);
        assert_eq!(ids(&mut merger), (0..80).collect::<Vec<_>>());
        let stats = merger.finish()?;
        assert_eq!(stats.records_emitted, 80);
        assert_eq!(stats.frames, 6);
        assert!(ShardMerger::shard_paths(dir.path())?.is_empty());
        Ok(())
    }

    #[test]
    fn overlapping_frames_in_one_shard_interleave() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let a = write_shard(
            dir.path(),
            "a.shard",
            &[records([1, 5, 9]), records([3, 4]), records([4, 10, 12])],
        )?;
        let b = write_shard(dir.path(), "b.shard", &[records([2, 11])])?;

        let mut merger = ShardMerger::open(&[a, b]);
        assert_eq!(ids(&mut merger), vec![1, 2, 3, 4, 5, 9, 10, 11, 12]);
        assert_eq!(merger.stats().out_of_order_dropped, 0);
        assert_eq!(merger.stats().duplicates_dropped, 1);
        Ok(())
    }

    #[test]
    fn duplicate_ids_across_shards_are_emitted_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let a = write_shard(dir.path(), "a.shard", &[records([1, 3, 5, 7])])?;
        let b = write_shard(dir.path(), "b.shard", &[records([3, 4, 5, 8])])?;
        let mut merger = ShardMerger::open(&[a, b]);
        assert_eq!(ids(&mut merger), vec![1, 3, 4, 5, 7, 8]);
        assert_eq!(merger.stats().duplicates_dropped, 2);
        Ok(())
    }

    #[test]
    fn truncated_tail_keeps_complete_frames() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let good = write_shard(dir.path(), "good.shard", &[records(100..110)])?;
        let broken = dir.path().join("broken.shard");
        let mut bytes = encode_frame(&records(0..5), false)?;
        let partial = encode_frame(&records(5..10), false)?;
        bytes.extend_from_slice(&partial[..partial.len() / 2]);
        fs::write(&broken, bytes)?;

        let mut merger = ShardMerger::open(&[good, broken]);
        let mut expected: Vec<u64> = (0..5).collect();
        expected.extend(100..110);
        assert_eq!(ids(&mut merger), expected);
        let stats = merger.finish()?;
        assert_eq!(stats.damaged_shards, 1);
        Ok(())
    }

    #[test]
    fn undrained_merge_keeps_shards() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let a = write_shard(dir.path(), "a.shard", &[records(0..10)])?;
        let mut merger = ShardMerger::open(&[a.clone()]);
        assert_eq!(merger.next().map(|r| r.id), Some(0));
        merger.finish()?;
        assert!(a.exists());
        Ok(())
    }

    #[test]
    fn missing_shard_is_skipped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let a = write_shard(dir.path(), "a.shard", &[records(0..3)])?;
        let mut merger = ShardMerger::open(&[a, dir.path().join("gone.shard")]);
        assert_eq!(ids(&mut merger), vec![0, 1, 2]);
        assert_eq!(merger.stats().damaged_shards, 1);
        Ok(())
    }
}
