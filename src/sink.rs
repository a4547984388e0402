//! The consumer end of a run: merged records go through the resume filter
//! into a [`RecordSink`].

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::model::MessageRecord;
use crate::resume::ResumeFilter;

pub const OUTPUT_PART_MAX_BYTES: u64 = 128 * 1024 * 1024;

/// Destination for committed records.
pub trait RecordSink {
    fn write_record(&mut self, record: &MessageRecord) -> Result<()>;

    /// Make everything written so far durable.
    fn flush(&mut self) -> Result<()>;
}

impl RecordSink for Vec<MessageRecord> {
    fn write_record(&mut self, record: &MessageRecord) -> Result<()> {
        self.push(record.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Rotating `part-NNNNNN.jsonl` files. Appends to the newest existing part so
/// successive runs extend the same output.
pub struct JsonlSink {
    base_dir: PathBuf,
    part_index: usize,
    current_bytes: u64,
    max_part_bytes: u64,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn open(base_dir: &Path) -> Result<Self> {
        Self::with_part_limit(base_dir, OUTPUT_PART_MAX_BYTES)
    }

    pub fn with_part_limit(base_dir: &Path, max_part_bytes: u64) -> Result<Self> {
        fs::create_dir_all(base_dir)
            .with_context(|| format!("failed to create {}", base_dir.display()))?;

        let part_index = list_part_indices(base_dir)?.into_iter().max().unwrap_or(1);
        let path = part_path(base_dir, part_index);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open output file {}", path.display()))?;
        let current_bytes = file
            .metadata()
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            part_index,
            current_bytes,
            max_part_bytes: max_part_bytes.max(1),
            writer: BufWriter::new(file),
        })
    }

    pub fn part_index(&self) -> usize {
        self.part_index
    }

    fn rotate(&mut self) -> Result<()> {
        self.writer
            .flush()
            .context("failed to flush JSONL output")?;
        self.part_index += 1;
        let path = part_path(&self.base_dir, self.part_index);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("failed to open output file {}", path.display()))?;
        debug!(path = %path.display(), "rotated output part");
        self.writer = BufWriter::new(file);
        self.current_bytes = 0;
        Ok(())
    }
}

impl RecordSink for JsonlSink {
    fn write_record(&mut self, record: &MessageRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to serialize record to JSONL")?;
        let line_bytes = (line.len() + 1) as u64;
        if self.current_bytes > 0 && self.current_bytes + line_bytes > self.max_part_bytes {
            self.rotate()?;
        }
        self.writer
            .write_all(line.as_bytes())
            .context("failed to write JSONL row")?;
        self.writer
            .write_all(b"\n")
            .context("failed to write JSONL newline")?;
        self.current_bytes += line_bytes;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("failed to flush JSONL output")?;
        self.writer
            .get_ref()
            .sync_data()
            .context("failed to sync JSONL output")
    }
}

pub fn part_path(base_dir: &Path, part_index: usize) -> PathBuf {
    base_dir.join(format!("part-{part_index:06}.jsonl"))
}

pub fn list_part_indices(base_dir: &Path) -> Result<Vec<usize>> {
    if !base_dir.exists() {
        return Ok(Vec::new());
    }

    let mut indices = Vec::new();
    for entry in
        fs::read_dir(base_dir).with_context(|| format!("failed to read {}", base_dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let Some(num) = name
            .strip_prefix("part-")
            .and_then(|rest| rest.strip_suffix(".jsonl"))
        else {
            continue;
        };
        if let Ok(idx) = num.parse::<usize>() {
            indices.push(idx);
        }
    }
    indices.sort_unstable();
    Ok(indices)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitStats {
    pub committed: u64,
    pub skipped: u64,
    pub checkpoints: u64,
}

/// Applies the resume filter in front of a sink.
///
/// A record is written first and only then added to the filter. Checkpoints
/// flush the sink before persisting the filter, so a persisted filter never
/// covers a record that is not durable in the sink.
pub struct Committer<K> {
    sink: K,
    filter: ResumeFilter,
    filter_path: Option<PathBuf>,
    persist_every: u64,
    since_checkpoint: u64,
    stats: CommitStats,
}

impl<K: RecordSink> Committer<K> {
    pub fn new(sink: K, filter: ResumeFilter, filter_path: Option<PathBuf>, persist_every: usize) -> Self {
        Self {
            sink,
            filter,
            filter_path,
            persist_every: persist_every.max(1) as u64,
            since_checkpoint: 0,
            stats: CommitStats::default(),
        }
    }

    /// Commit one record unless the filter says it was already committed.
    /// Returns whether it was written.
    pub fn commit(&mut self, record: &MessageRecord) -> Result<bool> {
        if self.filter.contains(record.id) {
            self.stats.skipped += 1;
            return Ok(false);
        }
        self.sink.write_record(record)?;
        self.filter.add(record.id);
        self.stats.committed += 1;
        self.since_checkpoint += 1;
        if self.since_checkpoint >= self.persist_every {
            self.checkpoint()?;
        }
        Ok(true)
    }

    pub fn commit_all(&mut self, records: impl IntoIterator<Item = MessageRecord>) -> Result<CommitStats> {
        for record in records {
            self.commit(&record)?;
        }
        Ok(self.stats)
    }

    pub fn checkpoint(&mut self) -> Result<()> {
        self.sink.flush()?;
        if let Some(path) = &self.filter_path {
            self.filter
                .save(path)
                .with_context(|| format!("failed to persist resume filter {}", path.display()))?;
        }
        self.since_checkpoint = 0;
        self.stats.checkpoints += 1;
        Ok(())
    }

    pub fn stats(&self) -> CommitStats {
        self.stats
    }

    pub fn filter(&self) -> &ResumeFilter {
        &self.filter
    }

    /// Final checkpoint; hands back the sink and filter.
    pub fn finish(mut self) -> Result<(K, ResumeFilter, CommitStats)> {
        self.checkpoint()?;
        Ok((self.sink, self.filter, self.stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;

    fn records(ids: impl IntoIterator<Item = u64>) -> Vec<MessageRecord> {
        ids.into_iter().map(MessageRecord::new).collect()
    }

    #[test]
    fn committer_skips_ids_already_in_filter() -> Result<()> {
        let mut filter = ResumeFilter::for_conversation(Some(100), &FilterConfig::default());
        filter.add(2);
        filter.add(4);
        let mut committer = Committer::new(Vec::new(), filter, None, 100);

        let stats = committer.commit_all(records(1..=5))?;
        assert_eq!(stats.committed, 3);
        assert_eq!(stats.skipped, 2);
        let (sink, filter, _) = committer.finish()?;
        assert_eq!(sink.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3, 5]);
        assert!((1..=5).all(|id| filter.contains(id)));
        Ok(())
    }

    #[test]
    fn checkpoints_persist_filter_periodically() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let filter_path = dir.path().join("resume.filter");
        let config = FilterConfig::default();
        let filter = ResumeFilter::for_conversation(None, &FilterConfig {
            default_size: 10_000,
            ..config.clone()
        });
        let mut committer = Committer::new(Vec::new(), filter, Some(filter_path.clone()), 10);

        committer.commit_all(records(1..=25))?;
        assert_eq!(committer.stats().checkpoints, 2);
        let persisted = ResumeFilter::load_or_new(&filter_path, None, &config);
        assert_eq!(persisted.items_added(), 20);
        assert!(persisted.contains(20));
        Ok(())
    }

    #[test]
    fn jsonl_sink_rotates_and_appends_on_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sink = JsonlSink::with_part_limit(dir.path(), 64)?;
        for record in records(1..=6) {
            sink.write_record(&record)?;
        }
        sink.flush()?;
        let last_part = sink.part_index();
        assert!(last_part > 1);
        drop(sink);

        let mut reopened = JsonlSink::with_part_limit(dir.path(), 1 << 20)?;
        assert_eq!(reopened.part_index(), last_part);
        reopened.write_record(&MessageRecord::new(7))?;
        reopened.flush()?;

        let mut ids = Vec::new();
        for idx in list_part_indices(dir.path())? {
            let contents = fs::read_to_string(part_path(dir.path(), idx))?;
            for line in contents.lines() {
                ids.push(serde_json::from_str::<MessageRecord>(line)?.id);
            }
        }
        assert_eq!(ids, (1..=7).collect::<Vec<_>>());
        Ok(())
    }
}
