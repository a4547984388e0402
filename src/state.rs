//! On-disk layout of a backfill root.
//!
//! ```text
//! <root>/
//! ├── hotzones.json
//! └── <entity>-<hash>/
//!     ├── state.json        run manifest
//!     ├── resume.filter     ResumeFilter checkpoint
//!     ├── shards/           per-worker frame files (deleted after merge)
//!     └── data/             committed JSONL parts
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::model::{ConversationSpan, RangeSet, RunStats};

pub const STATE_SCHEMA_VERSION: u32 = 1;
pub const HOTZONES_FILE: &str = "hotzones.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Interrupted,
    Failed,
    Completed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Interrupted => "interrupted",
            RunStatus::Failed => "failed",
            RunStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub entity: String,
    pub run_id: String,
    pub status: RunStatus,
    pub span: Option<ConversationSpan>,
    pub records_committed: usize,
    pub records_skipped: usize,
    pub leftover_records_recovered: usize,
    pub stats: Option<RunStats>,
    /// ID ranges whose records are committed to the output.
    #[serde(default)]
    pub completed_ranges: RangeSet,
    /// ID ranges fetched into shard files that still wait for a merge.
    #[serde(default)]
    pub pending_ranges: RangeSet,
    pub message: Option<String>,
    pub started_at: u64,
    pub updated_at: u64,
    pub completed_at: Option<u64>,
}

impl RunManifest {
    pub fn new(entity: &str) -> Self {
        let now = epoch_seconds();
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            entity: entity.to_string(),
            run_id: format!("run-{now}"),
            status: RunStatus::Running,
            span: None,
            records_committed: 0,
            records_skipped: 0,
            leftover_records_recovered: 0,
            stats: None,
            completed_ranges: RangeSet::new(),
            pending_ranges: RangeSet::new(),
            message: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// A new run that carries over the range bookkeeping of the previous
    /// manifest at `path`. A missing or unreadable manifest starts from
    /// nothing, which only costs refetching.
    pub fn resume(path: &Path, entity: &str) -> Self {
        let mut manifest = Self::new(entity);
        if !path.exists() {
            return manifest;
        }
        match read_json_file::<RunManifest>(path) {
            Ok(previous) => {
                debug!(
                    run = %previous.run_id,
                    completed = previous.completed_ranges.covered_len(),
                    pending = previous.pending_ranges.covered_len(),
                    "carrying over previous run"
                );
                manifest.completed_ranges = previous.completed_ranges;
                manifest.pending_ranges = previous.pending_ranges;
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %format!("{err:#}"),
                    "previous run manifest unreadable; fetching the whole span"
                );
            }
        }
        manifest
    }

    pub fn finish(&mut self, status: RunStatus) {
        let now = epoch_seconds();
        self.status = status;
        self.updated_at = now;
        if status == RunStatus::Completed {
            self.completed_at = Some(now);
        }
    }
}

/// Paths for one conversation under a backfill root.
#[derive(Debug, Clone)]
pub struct ConversationDir {
    root: PathBuf,
    dir: PathBuf,
}

impl ConversationDir {
    pub fn new(root: &Path, entity: &str) -> Self {
        let hash = entity_hash(entity);
        let dir = root.join(format!("{}-{}", sanitize_segment(entity), &hash[..12]));
        Self {
            root: root.to_path_buf(),
            dir,
        }
    }

    pub fn create(&self) -> Result<()> {
        for dir in [self.dir.clone(), self.shards_dir(), self.data_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.dir.exists()
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    pub fn filter_path(&self) -> PathBuf {
        self.dir.join("resume.filter")
    }

    pub fn shards_dir(&self) -> PathBuf {
        self.dir.join("shards")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dir.join("data")
    }

    pub fn hotzones_path(&self) -> PathBuf {
        self.root.join(HOTZONES_FILE)
    }
}

pub fn sanitize_segment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        "_".to_string()
    } else {
        out
    }
}

fn entity_hash(entity: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

pub fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Write-temp-then-rename so a crash never leaves a half-written file behind.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to move temporary file {} to {}",
            tmp.display(),
            path.display()
        )
    })?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;
    write_bytes_atomic(path, &bytes)
}

pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IdRange;

    #[test]
    fn conversation_dirs_are_stable_and_distinct() {
        let root = Path::new("/tmp/backfill");
        let a = ConversationDir::new(root, "team/general");
        let b = ConversationDir::new(root, "team/general");
        let c = ConversationDir::new(root, "team/random");
        assert_eq!(a.path(), b.path());
        assert_ne!(a.path(), c.path());
        let name = a.path().file_name().and_then(|n| n.to_str()).unwrap_or("");
        assert!(name.starts_with("team_general-"));
        assert_eq!(a.hotzones_path(), root.join(HOTZONES_FILE));
    }

    #[test]
    fn atomic_write_replaces_without_leaving_temp_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state.json");
        write_json_atomic(&path, &RunManifest::new("a"))?;
        let mut manifest = RunManifest::new("b");
        manifest.finish(RunStatus::Completed);
        write_json_atomic(&path, &manifest)?;

        let loaded: RunManifest = read_json_file(&path)?;
        assert_eq!(loaded.entity, "b");
        assert_eq!(loaded.status, RunStatus::Completed);
        assert!(loaded.completed_at.is_some());
        assert!(!path.with_extension("tmp").exists());
        Ok(())
    }

    #[test]
    fn resume_carries_range_bookkeeping_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state.json");
        let mut previous = RunManifest::new("chat");
        previous.records_committed = 42;
        previous.completed_ranges.insert(IdRange::new(1, 100));
        previous.pending_ranges.insert(IdRange::new(200, 300));
        previous.finish(RunStatus::Interrupted);
        write_json_atomic(&path, &previous)?;

        let next = RunManifest::resume(&path, "chat");
        assert_eq!(next.status, RunStatus::Running);
        assert_eq!(next.records_committed, 0);
        assert_eq!(next.completed_ranges.ranges(), &[IdRange::new(1, 100)]);
        assert_eq!(next.pending_ranges.ranges(), &[IdRange::new(200, 300)]);

        fs::write(&path, b"{ not json")?;
        let fresh = RunManifest::resume(&path, "chat");
        assert!(fresh.completed_ranges.is_empty());
        Ok(())
    }
}
