use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Half-open span `[start, end)` of record IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdRange {
    pub start: u64,
    pub end: u64,
}

impl IdRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Range covering `min_id..=max_id`. `max_id` must be below `u64::MAX`;
    /// the half-open end cannot represent one past it.
    pub fn inclusive(min_id: u64, max_id: u64) -> Self {
        Self::new(min_id, max_id.saturating_add(1))
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, id: u64) -> bool {
        id >= self.start && id < self.end
    }

    pub fn overlaps(&self, other: &IdRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Split into at most `parts` contiguous, non-empty sub-ranges of near-equal
    /// size. The sub-ranges are returned in ascending order and cover `self`
    /// exactly.
    pub fn split(&self, parts: u64) -> Vec<IdRange> {
        let len = self.len();
        let parts = parts.clamp(1, len.max(1));
        let base = len / parts;
        let remainder = len % parts;
        let mut out = Vec::with_capacity(parts as usize);
        let mut start = self.start;
        for idx in 0..parts {
            let size = base + u64::from(idx < remainder);
            if size == 0 {
                continue;
            }
            out.push(IdRange::new(start, start + size));
            start += size;
        }
        out
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Sorted set of disjoint, non-adjacent ID ranges. Inserting a range that
/// overlaps or touches existing ones coalesces them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RangeSet {
    ranges: Vec<IdRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ranges(&self) -> &[IdRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of IDs covered.
    pub fn covered_len(&self) -> u64 {
        self.ranges.iter().map(IdRange::len).sum()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(id))
    }

    pub fn insert(&mut self, range: IdRange) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for existing in self.ranges.drain(..) {
            if existing.end < merged.start || existing.start > merged.end {
                kept.push(existing);
            } else {
                merged = IdRange::new(merged.start.min(existing.start), merged.end.max(existing.end));
            }
        }
        kept.push(merged);
        kept.sort();
        self.ranges = kept;
    }

    pub fn extend(&mut self, other: &RangeSet) {
        for range in &other.ranges {
            self.insert(*range);
        }
    }

    /// The parts of `range` not covered by the set, ascending.
    pub fn gaps(&self, range: IdRange) -> Vec<IdRange> {
        let mut gaps = Vec::new();
        let mut pos = range.start;
        for covered in &self.ranges {
            if pos >= range.end || covered.start >= range.end {
                break;
            }
            if covered.end <= pos {
                continue;
            }
            if covered.start > pos {
                gaps.push(IdRange::new(pos, covered.start));
            }
            pos = covered.end;
        }
        if pos < range.end {
            gaps.push(IdRange::new(pos, range.end));
        }
        gaps
    }
}

impl FromIterator<IdRange> for RangeSet {
    fn from_iter<I: IntoIterator<Item = IdRange>>(iter: I) -> Self {
        let mut set = RangeSet::new();
        for range in iter {
            set.insert(range);
        }
        set
    }
}

/// One message as returned by the remote API.
///
/// Only `id` is interpreted by the engine; everything else is carried through
/// to the sink untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: u64,
    #[serde(default)]
    pub date: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extra: Value,
}

impl MessageRecord {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            date: 0,
            sender: None,
            text: None,
            extra: Value::Null,
        }
    }
}

/// What the transport reports about a conversation before fetching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSpan {
    pub min_id: u64,
    pub max_id: u64,
    pub datacenter_id: u32,
    #[serde(default)]
    pub estimated_total: Option<u64>,
}

impl ConversationSpan {
    pub fn range(&self) -> IdRange {
        IdRange::inclusive(self.min_id, self.max_id)
    }
}

/// One observed slow fetch, kept for hot-zone learning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowChunkRecord {
    pub range: IdRange,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub message_count: usize,
    /// Messages per 1,000 IDs.
    pub density: f64,
    pub datacenter: u32,
    pub timestamp: DateTime<Utc>,
    pub worker_id: usize,
}

impl SlowChunkRecord {
    pub fn new(
        range: IdRange,
        duration: Duration,
        message_count: usize,
        datacenter: u32,
        worker_id: usize,
    ) -> Self {
        Self {
            range,
            duration,
            message_count,
            density: density_per_thousand(message_count, range.len()),
            datacenter,
            timestamp: Utc::now(),
            worker_id,
        }
    }
}

pub fn density_per_thousand(count: usize, span: u64) -> f64 {
    if span == 0 {
        return 0.0;
    }
    count as f64 * 1000.0 / span as f64
}

/// Per-worker bookkeeping for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStat {
    pub worker_id: usize,
    pub fetched: usize,
    /// Chunks whose every ID was fetched and written.
    pub chunks_committed: usize,
    /// Chunks written with at least one range missing.
    #[serde(default)]
    pub chunks_incomplete: usize,
    pub frames_written: usize,
    pub bytes_written: u64,
    pub requests: usize,
    pub retries: usize,
    pub bisections: usize,
    #[serde(with = "duration_millis")]
    pub io_time: Duration,
    pub slow_chunks: Vec<SlowChunkRecord>,
    pub failed_ranges: Vec<IdRange>,
    pub interrupted: bool,
}

impl WorkerStat {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            ..Self::default()
        }
    }

    pub fn records_per_sec(&self) -> f64 {
        let secs = self.io_time.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.fetched as f64 / secs
    }
}

/// Aggregate statistics reported at the end of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub chunks_planned: usize,
    pub chunks_committed: usize,
    #[serde(default)]
    pub chunks_incomplete: usize,
    pub records_fetched: usize,
    pub requests: usize,
    pub retries: usize,
    pub slow_chunks: usize,
    pub bisections: usize,
    pub failed_ranges: Vec<IdRange>,
    pub interrupted: bool,
    pub workers: Vec<WorkerStat>,
}

impl RunStats {
    pub fn from_workers(chunks_planned: usize, workers: Vec<WorkerStat>) -> Self {
        let mut stats = RunStats {
            chunks_planned,
            ..RunStats::default()
        };
        for worker in &workers {
            stats.chunks_committed += worker.chunks_committed;
            stats.chunks_incomplete += worker.chunks_incomplete;
            stats.records_fetched += worker.fetched;
            stats.requests += worker.requests;
            stats.retries += worker.retries;
            stats.slow_chunks += worker.slow_chunks.len();
            stats.bisections += worker.bisections;
            stats.failed_ranges.extend(worker.failed_ranges.iter().copied());
            stats.interrupted |= worker.interrupted;
        }
        stats.failed_ranges.sort();
        stats.workers = workers;
        stats
    }

    pub fn slow_records(&self) -> impl Iterator<Item = &SlowChunkRecord> {
        self.workers.iter().flat_map(|w| w.slow_chunks.iter())
    }
}

pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_covers_range_without_gaps() {
        let range = IdRange::new(10, 113);
        let parts = range.split(4);
        assert_eq!(parts.len(), 4);
        assert_eq!(parts.first().map(|r| r.start), Some(10));
        assert_eq!(parts.last().map(|r| r.end), Some(113));
        for pair in parts.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(parts.iter().map(IdRange::len).sum::<u64>(), 103);
    }

    #[test]
    fn split_of_tiny_range_never_yields_empty_parts() {
        let parts = IdRange::new(5, 7).split(4);
        assert_eq!(parts, vec![IdRange::new(5, 6), IdRange::new(6, 7)]);
    }

    #[test]
    fn inclusive_span_includes_max_id() {
        let range = IdRange::inclusive(1, 100);
        assert!(range.contains(100));
        assert!(!range.contains(101));
        assert_eq!(range.len(), 100);
    }

    #[test]
    fn range_set_coalesces_touching_and_overlapping_ranges() {
        let mut set: RangeSet = [IdRange::new(10, 20), IdRange::new(40, 50)].into_iter().collect();
        set.insert(IdRange::new(20, 25));
        set.insert(IdRange::new(45, 60));
        set.insert(IdRange::new(5, 5));
        assert_eq!(set.ranges(), &[IdRange::new(10, 25), IdRange::new(40, 60)]);

        set.insert(IdRange::new(0, 100));
        assert_eq!(set.ranges(), &[IdRange::new(0, 100)]);
        assert_eq!(set.covered_len(), 100);
        assert!(set.contains(99));
        assert!(!set.contains(100));
    }

    #[test]
    fn range_set_gaps_are_the_uncovered_parts() {
        let set: RangeSet = [IdRange::new(10, 20), IdRange::new(30, 40)].into_iter().collect();
        assert_eq!(
            set.gaps(IdRange::new(0, 50)),
            vec![IdRange::new(0, 10), IdRange::new(20, 30), IdRange::new(40, 50)]
        );
        assert_eq!(set.gaps(IdRange::new(12, 35)), vec![IdRange::new(20, 30)]);
        assert!(set.gaps(IdRange::new(30, 40)).is_empty());
        assert_eq!(RangeSet::new().gaps(IdRange::new(3, 7)), vec![IdRange::new(3, 7)]);
    }

    #[test]
    fn run_stats_aggregate_workers() {
        let mut a = WorkerStat::new(0);
        a.fetched = 10;
        a.failed_ranges.push(IdRange::new(50, 60));
        let mut b = WorkerStat::new(1);
        b.fetched = 5;
        b.failed_ranges.push(IdRange::new(1, 2));
        b.interrupted = true;

        let stats = RunStats::from_workers(3, vec![a, b]);
        assert_eq!(stats.records_fetched, 15);
        assert_eq!(
            stats.failed_ranges,
            vec![IdRange::new(1, 2), IdRange::new(50, 60)]
        );
        assert!(stats.interrupted);
    }
}
