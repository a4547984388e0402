//! Run orchestration.
//!
//! `resolve → plan → fill queue → worker pool → join → hot-zone update`,
//! followed by [`merge_into`] which turns the shard files into one ordered
//! stream for a [`Committer`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use indicatif::ProgressBar;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::BackfillConfig;
use crate::fetcher::ChunkFetcher;
use crate::frame::{FrameWriter, ShardSummary};
use crate::hotzone::HotZoneStore;
use crate::merge::{MergeStats, ShardMerger};
use crate::model::{ConversationSpan, IdRange, RangeSet, RunStats, WorkerStat};
use crate::planner::ChunkPlanner;
use crate::queue::WorkQueue;
use crate::sink::{Committer, RecordSink};
use crate::transport::Transport;

pub fn shard_path(shards_dir: &Path, worker_id: usize) -> PathBuf {
    shards_dir.join(format!("worker-{worker_id:03}.shard"))
}

/// Outcome of the fetch phase of one run.
#[derive(Debug, Clone)]
pub struct FetchReport {
    pub span: ConversationSpan,
    pub chunks_planned: usize,
    pub hot_zone_chunks: usize,
    pub density_fallback: bool,
    pub shards: Vec<ShardSummary>,
    pub stats: RunStats,
    pub hot_zone_observations: usize,
    /// IDs of the span that earlier runs had already committed.
    pub previously_completed: u64,
    /// Ranges fully fetched into this run's shards.
    pub completed: RangeSet,
}

impl FetchReport {
    pub fn interrupted(&self) -> bool {
        self.stats.interrupted
    }

    pub fn shard_paths(&self) -> Vec<PathBuf> {
        self.shards.iter().map(|s| s.path.clone()).collect()
    }
}

pub struct Engine<T: Transport> {
    transport: Arc<T>,
    config: Arc<BackfillConfig>,
    hot_zones: HotZoneStore,
    shutdown: Arc<AtomicBool>,
    progress: Option<ProgressBar>,
}

impl<T: Transport> Engine<T> {
    pub fn new(transport: T, config: BackfillConfig, hot_zones: HotZoneStore) -> Self {
        Self {
            transport: Arc::new(transport),
            config: Arc::new(config),
            hot_zones,
            shutdown: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    /// Share an externally owned shutdown flag (e.g. one set by Ctrl+C).
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    pub fn hot_zones(&self) -> &HotZoneStore {
        &self.hot_zones
    }

    pub async fn resolve(&self, entity: &str) -> Result<ConversationSpan> {
        self.transport
            .resolve(entity)
            .await
            .with_context(|| format!("failed to resolve conversation {entity}"))
    }

    /// Resolve `entity` and fetch its whole span into `shards_dir`.
    pub async fn fetch(&mut self, entity: &str, shards_dir: &Path) -> Result<FetchReport> {
        let span = self.resolve(entity).await?;
        self.fetch_span(span, shards_dir).await
    }

    pub async fn fetch_span(&mut self, span: ConversationSpan, shards_dir: &Path) -> Result<FetchReport> {
        self.fetch_remaining(span, &RangeSet::new(), shards_dir).await
    }

    /// Fetch the parts of `span` not covered by `done`. Planning starts at
    /// the first uncovered ID and planned chunks are trimmed to the gaps.
    pub async fn fetch_remaining(
        &mut self,
        span: ConversationSpan,
        done: &RangeSet,
        shards_dir: &Path,
    ) -> Result<FetchReport> {
        if span.max_id == u64::MAX {
            bail!("conversation max_id {} is not supported; IDs must stay below u64::MAX", span.max_id);
        }
        std::fs::create_dir_all(shards_dir)
            .with_context(|| format!("failed to create {}", shards_dir.display()))?;
        let leftovers = ShardMerger::shard_paths(shards_dir)?;
        if !leftovers.is_empty() {
            bail!(
                "{} leftover shard file(s) in {}; merge them before fetching again",
                leftovers.len(),
                shards_dir.display()
            );
        }

        let range = span.range();
        let gaps = done.gaps(range);
        let previously_completed = range.len() - gaps.iter().map(IdRange::len).sum::<u64>();
        let Some(effective_min_id) = gaps.first().map(|gap| gap.start) else {
            info!(span = %range, "span already complete; nothing to fetch");
            return Ok(FetchReport {
                span,
                chunks_planned: 0,
                hot_zone_chunks: 0,
                density_fallback: false,
                shards: Vec::new(),
                stats: RunStats::default(),
                hot_zone_observations: 0,
                previously_completed,
                completed: RangeSet::new(),
            });
        };

        let remaining = IdRange::new(effective_min_id, range.end);
        let mut plan = {
            let planner = ChunkPlanner::new(&self.config, &self.hot_zones);
            match self.transport.open_session(self.config.workers).await {
                Ok(mut probe) => planner.plan_with_probe(&mut probe, remaining, span.datacenter_id).await,
                Err(err) => {
                    warn!(error = %err, "could not open probe session; using default chunk size");
                    planner.plan(remaining, span.datacenter_id, None)
                }
            }
        };
        if !done.is_empty() {
            plan.chunks = plan.chunks.iter().flat_map(|chunk| done.gaps(*chunk)).collect();
            plan.hot_zone_chunks = plan
                .chunks
                .iter()
                .filter(|chunk| self.hot_zones.lookup(span.datacenter_id, chunk.start).is_some())
                .count();
            debug!(
                effective_min_id,
                previously_completed,
                chunks = plan.chunks.len(),
                "trimmed plan to uncovered ranges"
            );
        }
        let chunks_planned = plan.chunks.len();
        if let Some(progress) = &self.progress {
            progress.set_length(chunks_planned as u64);
        }

        let queue = Arc::new(WorkQueue::new(plan.chunks));
        let workers = self.config.workers.max(1).min(chunks_planned.max(1));
        info!(
            span = %range,
            datacenter = span.datacenter_id,
            chunks = chunks_planned,
            workers,
            "starting workers"
        );

        let mut join_set = JoinSet::new();
        for worker_id in 0..workers {
            let worker = Worker {
                transport: Arc::clone(&self.transport),
                config: Arc::clone(&self.config),
                queue: Arc::clone(&queue),
                shutdown: Arc::clone(&self.shutdown),
                progress: self.progress.clone(),
                datacenter: span.datacenter_id,
                worker_id,
                shard_path: shard_path(shards_dir, worker_id),
            };
            join_set.spawn(worker.run());
        }

        let mut worker_stats = Vec::with_capacity(workers);
        let mut shards = Vec::with_capacity(workers);
        let mut completed = RangeSet::new();
        let mut first_error: Option<anyhow::Error> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => {
                    completed.extend(&outcome.completed);
                    worker_stats.push(outcome.stat);
                    shards.extend(outcome.shard);
                    if let Some(err) = outcome.error {
                        first_error.get_or_insert(err);
                    }
                }
                Err(err) => {
                    self.shutdown.store(true, Ordering::SeqCst);
                    first_error.get_or_insert(anyhow!("worker task failed: {err}"));
                }
            }
        }
        worker_stats.sort_by_key(|s| s.worker_id);
        shards.sort_by(|a, b| a.path.cmp(&b.path));

        let mut stats = RunStats::from_workers(chunks_planned, worker_stats);
        stats.interrupted |= !queue.is_empty();

        // Single writer, after every worker has joined.
        let hot_zone_observations = self.hot_zones.record_observations(
            stats.slow_records(),
            self.config.slow_threshold(),
            self.config.min_bisect_span,
        );
        if hot_zone_observations > 0 {
            if let Err(err) = self.hot_zones.save() {
                warn!(error = %format!("{err:#}"), "failed to persist hot zones");
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        info!(
            chunks = stats.chunks_committed,
            records = stats.records_fetched,
            slow_chunks = stats.slow_chunks,
            bisections = stats.bisections,
            failed_ranges = stats.failed_ranges.len(),
            interrupted = stats.interrupted,
            "fetch finished"
        );
        Ok(FetchReport {
            span,
            chunks_planned,
            hot_zone_chunks: plan.hot_zone_chunks,
            density_fallback: plan.density_fallback,
            shards,
            stats,
            hot_zone_observations,
            previously_completed,
            completed,
        })
    }
}

struct WorkerOutcome {
    stat: WorkerStat,
    completed: RangeSet,
    shard: Option<ShardSummary>,
    error: Option<anyhow::Error>,
}

struct Worker<T: Transport> {
    transport: Arc<T>,
    config: Arc<BackfillConfig>,
    queue: Arc<WorkQueue>,
    shutdown: Arc<AtomicBool>,
    progress: Option<ProgressBar>,
    datacenter: u32,
    worker_id: usize,
    shard_path: PathBuf,
}

impl<T: Transport> Worker<T> {
    async fn run(self) -> WorkerOutcome {
        let mut stat = WorkerStat::new(self.worker_id);
        let mut completed = RangeSet::new();
        match self.drain(&mut stat, &mut completed).await {
            Ok(shard) => WorkerOutcome {
                stat,
                completed,
                shard: Some(shard),
                error: None,
            },
            Err(err) => {
                self.shutdown.store(true, Ordering::SeqCst);
                warn!(worker = self.worker_id, error = %format!("{err:#}"), "worker stopped");
                WorkerOutcome {
                    stat,
                    completed: RangeSet::new(),
                    shard: None,
                    error: Some(err),
                }
            }
        }
    }

    async fn drain(&self, stat: &mut WorkerStat, completed: &mut RangeSet) -> Result<ShardSummary> {
        let session = self
            .transport
            .open_session(self.worker_id)
            .await
            .with_context(|| format!("worker {} could not open a session", self.worker_id))?;
        let mut writer = FrameWriter::create(&self.shard_path, self.config.compress_frames).await?;
        let mut fetcher = ChunkFetcher::new(session, &self.config, self.datacenter, self.worker_id);

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                stat.interrupted = !self.queue.is_empty();
                debug!(worker = self.worker_id, "shutdown requested; leaving queue");
                break;
            }
            let Some(chunk) = self.queue.try_pop() else {
                break;
            };

            let failed_before = stat.failed_ranges.len();
            let batches = fetcher
                .fetch_chunk(chunk, stat)
                .await
                .with_context(|| format!("worker {} failed on chunk {chunk}", self.worker_id))?;
            for batch in batches.iter().filter(|b| !b.records.is_empty()) {
                let bytes = writer.write_batch(&batch.records).await?;
                stat.frames_written += 1;
                stat.bytes_written += bytes;
            }
            for batch in &batches {
                completed.insert(batch.range);
            }
            if stat.failed_ranges.len() == failed_before {
                stat.chunks_committed += 1;
            } else {
                stat.chunks_incomplete += 1;
            }
            if let Some(progress) = &self.progress {
                progress.inc(1);
            }
        }

        let summary = writer.finish().await?;
        debug!(
            worker = self.worker_id,
            frames = summary.frames,
            bytes = summary.bytes,
            "worker done"
        );
        Ok(summary)
    }
}

/// Merge every shard in `shards_dir` through `committer`.
///
/// The committer is checkpointed before any shard file is removed, so shards
/// only disappear once their records are durable downstream. Returns `None`
/// when there is nothing to merge.
pub fn merge_into<K: RecordSink>(
    shards_dir: &Path,
    committer: &mut Committer<K>,
) -> Result<Option<MergeStats>> {
    let paths = ShardMerger::shard_paths(shards_dir)?;
    if paths.is_empty() {
        return Ok(None);
    }
    let mut merger = ShardMerger::open(&paths);
    committer.commit_all(&mut merger)?;
    committer.checkpoint()?;
    merger.finish().map(Some)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::FilterConfig;
    use crate::model::IdRange;
    use crate::resume::ResumeFilter;
    use crate::transport::MemoryTransport;

    fn small_config(workers: usize) -> BackfillConfig {
        BackfillConfig {
            workers,
            page_size: 10,
            default_chunk_size: 50,
            density_bands: vec![crate::config::DensityBand {
                min_density: 0.0,
                chunk_size: 50,
            }],
            ..BackfillConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_writes_one_shard_per_worker() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let transport = MemoryTransport::dense(1, 400, 1);
        let mut engine = Engine::new(transport, small_config(3), HotZoneStore::in_memory());

        let report = engine.fetch("chat", dir.path()).await?;
        assert_eq!(report.chunks_planned, 8);
        assert_eq!(report.stats.chunks_committed, 8);
        assert_eq!(report.stats.records_fetched, 400);
        assert_eq!(report.shards.len(), 3);
        assert!(!report.interrupted());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_before_start_leaves_queue_untouched() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let transport = MemoryTransport::dense(1, 400, 1);
        let mut engine = Engine::new(transport, small_config(2), HotZoneStore::in_memory());
        engine.shutdown_handle().store(true, Ordering::SeqCst);

        let report = engine.fetch("chat", dir.path()).await?;
        assert!(report.interrupted());
        assert_eq!(report.stats.chunks_committed, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn slow_chunks_feed_hot_zones_after_join() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let transport = MemoryTransport::dense(1, 2_000, 7)
            .with_slow_zone(IdRange::new(1, 501), Duration::from_secs(12));
        let config = BackfillConfig {
            workers: 2,
            max_bisect_retries: 0,
            min_bisect_span: 100,
            default_chunk_size: 500,
            density_bands: vec![crate::config::DensityBand {
                min_density: 0.0,
                chunk_size: 500,
            }],
            ..BackfillConfig::default()
        };
        let mut engine = Engine::new(transport, config, HotZoneStore::in_memory());

        let report = engine.fetch("chat", dir.path()).await?;
        assert_eq!(report.stats.slow_chunks, 1);
        assert_eq!(report.hot_zone_observations, 1);
        let zone = engine.hot_zones().lookup(7, 100);
        assert_eq!(zone.map(|z| (z.id_start, z.id_end, z.recommended_size)), Some((1, 501, 100)));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_remaining_plans_only_uncovered_ranges() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let transport = MemoryTransport::dense(1, 2_000, 1);
        let counters = transport.counters();
        let mut engine = Engine::new(transport, small_config(2), HotZoneStore::in_memory());
        let span = engine.resolve("chat").await?;

        let done: RangeSet = [IdRange::new(1, 500), IdRange::new(800, 2_001)].into_iter().collect();
        let report = engine.fetch_remaining(span.clone(), &done, dir.path()).await?;
        assert_eq!(report.chunks_planned, 6);
        assert_eq!(report.previously_completed, 1_700);
        assert_eq!(report.stats.records_fetched, 300);
        assert_eq!(report.completed.ranges(), &[IdRange::new(500, 800)]);
        let merged: Vec<u64> = ShardMerger::open(&report.shard_paths()).map(|r| r.id).collect();
        assert_eq!(merged, (500..800).collect::<Vec<_>>());
        for path in report.shard_paths() {
            std::fs::remove_file(path)?;
        }

        let pages_before = counters.pages.load(Ordering::Relaxed);
        let everything: RangeSet = std::iter::once(span.range()).collect();
        let report = engine.fetch_remaining(span, &everything, dir.path()).await?;
        assert_eq!(report.chunks_planned, 0);
        assert_eq!(report.previously_completed, 2_000);
        assert_eq!(counters.pages.load(Ordering::Relaxed), pages_before);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn chunk_with_missing_range_is_not_counted_as_committed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let transport = MemoryTransport::dense(1, 400, 1).with_failing_range(IdRange::new(120, 130));
        let config = BackfillConfig {
            max_bisect_retries: 0,
            page_max_attempts: 2,
            retry_base_delay_ms: 10,
            ..small_config(2)
        };
        let mut engine = Engine::new(transport, config, HotZoneStore::in_memory());

        let report = engine.fetch("chat", dir.path()).await?;
        assert_eq!(report.chunks_planned, 8);
        assert_eq!(report.stats.chunks_committed, 7);
        assert_eq!(report.stats.chunks_incomplete, 1);
        assert_eq!(report.stats.failed_ranges, vec![IdRange::new(101, 151)]);
        assert_eq!(
            report.completed.ranges(),
            &[IdRange::new(1, 101), IdRange::new(151, 401)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn span_ending_at_u64_max_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let transport = MemoryTransport::dense(1, 10, 1).with_span(1, u64::MAX);
        let mut engine = Engine::new(transport, small_config(1), HotZoneStore::in_memory());
        let err = match engine.fetch("chat", dir.path()).await {
            Ok(_) => anyhow::bail!("a span ending at u64::MAX must be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("u64::MAX"));
        Ok(())
    }

    #[tokio::test]
    async fn refuses_to_overwrite_leftover_shards() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(shard_path(dir.path(), 0), b"")?;
        let transport = MemoryTransport::dense(1, 10, 1);
        let mut engine = Engine::new(transport, small_config(1), HotZoneStore::in_memory());
        assert!(engine.fetch("chat", dir.path()).await.is_err());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn merge_into_commits_and_removes_shards() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let transport = MemoryTransport::dense(1, 300, 1);
        let mut engine = Engine::new(transport, small_config(4), HotZoneStore::in_memory());
        engine.fetch("chat", dir.path()).await?;

        let filter = ResumeFilter::for_conversation(Some(300), &FilterConfig::default());
        let mut committer = Committer::new(Vec::new(), filter, None, 1_000);
        let stats = merge_into(dir.path(), &mut committer)?;
        assert_eq!(stats.map(|s| s.records_emitted), Some(300));
        assert!(ShardMerger::shard_paths(dir.path())?.is_empty());

        let (sink, _, _) = committer.finish()?;
        assert_eq!(sink.iter().map(|r| r.id).collect::<Vec<_>>(), (1..=300).collect::<Vec<_>>());

        let mut empty = Committer::new(Vec::new(), ResumeFilter::with_capacity(10, 0.01), None, 1);
        assert!(merge_into(dir.path(), &mut empty)?.is_none());
        Ok(())
    }
}
