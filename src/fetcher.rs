//! Fetching one chunk: backward paging, page retries, slow detection and
//! bisection.
//!
//! A chunk is downloaded into memory and only handed back once every page of
//! it arrived. When it takes longer than the slow threshold and is still
//! allowed to split, the buffer is thrown away and the range is re-queued as
//! `bisect_fanout` smaller pieces with one credit less. Pieces are processed
//! from an explicit stack in ascending order.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BackfillConfig;
use crate::model::{IdRange, MessageRecord, SlowChunkRecord, WorkerStat};
use crate::transport::{Session, TransportError};

/// Records for one committed range, ascending and free of duplicates.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedBatch {
    pub range: IdRange,
    pub records: Vec<MessageRecord>,
    /// Committed over the threshold because it could not be split further.
    pub slow: bool,
}

#[derive(Debug, Clone)]
struct FetchSettings {
    page_size: usize,
    slow_threshold: Duration,
    max_bisect_retries: u32,
    bisect_fanout: u64,
    min_bisect_span: u64,
    page_max_attempts: usize,
    retry_base_delay: Duration,
    retry_max_backoff: Duration,
}

impl FetchSettings {
    fn from_config(config: &BackfillConfig) -> Self {
        Self {
            page_size: config.page_size.max(1),
            slow_threshold: config.slow_threshold(),
            max_bisect_retries: config.max_bisect_retries,
            bisect_fanout: config.bisect_fanout.max(2),
            min_bisect_span: config.min_bisect_span,
            page_max_attempts: config.page_max_attempts.max(1),
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            retry_max_backoff: Duration::from_secs(config.retry_max_backoff_secs),
        }
    }
}

enum RangeFetch {
    Complete {
        records: Vec<MessageRecord>,
        elapsed: Duration,
    },
    /// Abandoned over the threshold; the partial buffer was dropped.
    Slow { elapsed: Duration, fetched: usize },
    /// A page kept failing with retryable errors.
    Exhausted { error: TransportError },
}

pub struct ChunkFetcher<S> {
    session: S,
    settings: FetchSettings,
    datacenter: u32,
    worker_id: usize,
}

impl<S: Session> ChunkFetcher<S> {
    pub fn new(session: S, config: &BackfillConfig, datacenter: u32, worker_id: usize) -> Self {
        Self {
            session,
            settings: FetchSettings::from_config(config),
            datacenter,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Fetch `chunk` completely. Returns the committed batches in ascending
    /// range order. Ranges that could not be fetched at all are appended to
    /// `stat.failed_ranges`; only a fatal transport error is returned as `Err`.
    pub async fn fetch_chunk(
        &mut self,
        chunk: IdRange,
        stat: &mut WorkerStat,
    ) -> Result<Vec<FetchedBatch>, TransportError> {
        let mut batches = Vec::new();
        let mut pending = vec![(chunk, self.settings.max_bisect_retries)];

        while let Some((range, credits)) = pending.pop() {
            let can_bisect = credits > 0 && range.len() > self.settings.min_bisect_span;
            match self.fetch_range(range, can_bisect, stat).await? {
                RangeFetch::Complete { mut records, elapsed } => {
                    let slow = elapsed > self.settings.slow_threshold;
                    if slow {
                        warn!(
                            worker = self.worker_id,
                            range = %range,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "committing slow chunk; no bisection credit left"
                        );
                        stat.slow_chunks.push(self.slow_record(range, elapsed, records.len()));
                    }
                    records.sort_unstable_by_key(|r| r.id);
                    records.dedup_by_key(|r| r.id);
                    stat.fetched += records.len();
                    batches.push(FetchedBatch {
                        range,
                        records,
                        slow,
                    });
                }
                RangeFetch::Slow { elapsed, fetched } => {
                    info!(
                        worker = self.worker_id,
                        range = %range,
                        elapsed_ms = elapsed.as_millis() as u64,
                        credits,
                        "slow chunk; discarding buffer and bisecting"
                    );
                    stat.slow_chunks.push(self.slow_record(range, elapsed, fetched));
                    self.bisect(range, credits, &mut pending, stat);
                }
                RangeFetch::Exhausted { error } if can_bisect => {
                    info!(
                        worker = self.worker_id,
                        range = %range,
                        error = %error,
                        "page retries exhausted; bisecting"
                    );
                    self.bisect(range, credits, &mut pending, stat);
                }
                RangeFetch::Exhausted { error } => {
                    warn!(
                        worker = self.worker_id,
                        range = %range,
                        error = %error,
                        "giving up on range; it will be missing from this run"
                    );
                    stat.failed_ranges.push(range);
                }
            }
        }

        Ok(batches)
    }

    fn bisect(
        &self,
        range: IdRange,
        credits: u32,
        pending: &mut Vec<(IdRange, u32)>,
        stat: &mut WorkerStat,
    ) {
        stat.bisections += 1;
        let next = credits.saturating_sub(1);
        for part in range.split(self.settings.bisect_fanout).into_iter().rev() {
            pending.push((part, next));
        }
    }

    fn slow_record(&self, range: IdRange, elapsed: Duration, count: usize) -> SlowChunkRecord {
        SlowChunkRecord::new(range, elapsed, count, self.datacenter, self.worker_id)
    }

    async fn fetch_range(
        &mut self,
        range: IdRange,
        can_bisect: bool,
        stat: &mut WorkerStat,
    ) -> Result<RangeFetch, TransportError> {
        let started = Instant::now();
        let mut buffer: Vec<MessageRecord> = Vec::new();
        let mut before_id = range.end;

        let outcome = loop {
            let page = match self.fetch_page_with_retry(range, before_id, stat).await {
                Ok(page) => page,
                Err(err @ TransportError::Fatal(_)) => {
                    stat.io_time += started.elapsed();
                    return Err(err);
                }
                Err(error) => break RangeFetch::Exhausted { error },
            };

            let returned = page.len();
            let lowest = page.iter().map(|r| r.id).min();
            buffer.extend(page.into_iter().filter(|r| range.contains(r.id)));

            let elapsed = started.elapsed();
            if can_bisect && elapsed > self.settings.slow_threshold {
                break RangeFetch::Slow {
                    elapsed,
                    fetched: buffer.len(),
                };
            }

            match lowest {
                Some(lowest)
                    if returned >= self.settings.page_size
                        && lowest > range.start
                        && lowest < before_id =>
                {
                    before_id = lowest;
                }
                _ => {
                    break RangeFetch::Complete {
                        records: buffer,
                        elapsed,
                    }
                }
            }
        };

        stat.io_time += started.elapsed();
        Ok(outcome)
    }

    async fn fetch_page_with_retry(
        &mut self,
        range: IdRange,
        before_id: u64,
        stat: &mut WorkerStat,
    ) -> Result<Vec<MessageRecord>, TransportError> {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.settings.retry_base_delay)
            .with_multiplier(2.0)
            .with_randomization_factor(0.2)
            .with_max_interval(self.settings.retry_max_backoff)
            .with_max_elapsed_time(None)
            .build();
        let max_attempts = self.settings.page_max_attempts;

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            stat.requests += 1;
            match self
                .session
                .fetch_page(range, before_id, self.settings.page_size)
                .await
            {
                Ok(page) => return Ok(page),
                Err(err) if !err.is_retryable() || attempt >= max_attempts => return Err(err),
                Err(err) => {
                    stat.retries += 1;
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(self.settings.retry_max_backoff);
                    debug!(
                        worker = self.worker_id,
                        range = %range,
                        before_id,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying page"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, Transport};

    fn ids(batches: &[FetchedBatch]) -> Vec<u64> {
        batches
            .iter()
            .flat_map(|b| b.records.iter().map(|r| r.id))
            .collect()
    }

    async fn fetcher(
        transport: &MemoryTransport,
        config: &BackfillConfig,
    ) -> anyhow::Result<ChunkFetcher<<MemoryTransport as Transport>::Session>> {
        let session = transport.open_session(0).await?;
        Ok(ChunkFetcher::new(session, config, 2, 0))
    }

    #[tokio::test(start_paused = true)]
    async fn fast_chunk_commits_one_sorted_batch() -> anyhow::Result<()> {
        let transport = MemoryTransport::dense(1, 250, 2);
        let config = BackfillConfig::default();
        let mut fetcher = fetcher(&transport, &config).await?;
        let mut stat = WorkerStat::new(0);

        let batches = fetcher.fetch_chunk(IdRange::inclusive(1, 250), &mut stat).await?;
        assert_eq!(batches.len(), 1);
        assert!(!batches[0].slow);
        assert_eq!(ids(&batches), (1..=250).collect::<Vec<_>>());
        assert_eq!(stat.requests, 3);
        assert_eq!(stat.fetched, 250);
        assert!(stat.slow_chunks.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn persistently_slow_chunk_terminates_after_credits() -> anyhow::Result<()> {
        let span = IdRange::inclusive(1, 8_000);
        let transport = MemoryTransport::dense(1, 8_000, 2).with_slow_zone(span, Duration::from_secs(20));
        let config = BackfillConfig::default();
        let mut fetcher = fetcher(&transport, &config).await?;
        let mut stat = WorkerStat::new(0);

        let batches = fetcher.fetch_chunk(span, &mut stat).await?;

        // 1 split into 4, each split into 4 again, then committed as-is.
        assert_eq!(stat.bisections, 5);
        assert_eq!(batches.len(), 16);
        assert!(batches.iter().all(|b| b.slow && b.range.len() == 500));
        assert_eq!(stat.slow_chunks.len(), 1 + 4 + 16);
        assert_eq!(ids(&batches), (1..=8_000).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn small_slow_chunk_is_committed_without_bisection() -> anyhow::Result<()> {
        let span = IdRange::inclusive(1, 300);
        let transport = MemoryTransport::dense(1, 300, 2).with_slow_zone(span, Duration::from_secs(11));
        let config = BackfillConfig::default();
        let mut fetcher = fetcher(&transport, &config).await?;
        let mut stat = WorkerStat::new(0);

        let batches = fetcher.fetch_chunk(span, &mut stat).await?;
        assert_eq!(batches.len(), 1);
        assert!(batches[0].slow);
        assert_eq!(stat.bisections, 0);
        assert_eq!(stat.slow_chunks.len(), 1);
        assert_eq!(stat.slow_chunks[0].message_count, 300);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() -> anyhow::Result<()> {
        let transport = MemoryTransport::dense(1, 250, 2).with_transient_failures(2);
        let config = BackfillConfig::default();
        let mut fetcher = fetcher(&transport, &config).await?;
        let mut stat = WorkerStat::new(0);

        let batches = fetcher.fetch_chunk(IdRange::inclusive(1, 250), &mut stat).await?;
        assert_eq!(ids(&batches).len(), 250);
        assert_eq!(stat.retries, 2);
        assert!(stat.failed_ranges.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_bisect_then_record_gap() -> anyhow::Result<()> {
        let transport = MemoryTransport::dense(1, 4_000, 2).with_failing_range(IdRange::new(1_500, 1_600));
        let config = BackfillConfig {
            page_max_attempts: 2,
            ..BackfillConfig::default()
        };
        let mut fetcher = fetcher(&transport, &config).await?;
        let mut stat = WorkerStat::new(0);

        let batches = fetcher.fetch_chunk(IdRange::inclusive(1, 4_000), &mut stat).await?;
        assert_eq!(stat.bisections, 1);
        assert_eq!(stat.failed_ranges, vec![IdRange::new(1_001, 2_001)]);
        let fetched = ids(&batches);
        assert_eq!(fetched.len(), 3_000);
        assert!(fetched.iter().all(|id| !(1_001..2_001).contains(id)));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_is_returned() -> anyhow::Result<()> {
        let transport = MemoryTransport::dense(1, 500, 2).with_fatal_after(1);
        let config = BackfillConfig::default();
        let mut fetcher = fetcher(&transport, &config).await?;
        let mut stat = WorkerStat::new(0);

        let result = fetcher.fetch_chunk(IdRange::inclusive(1, 500), &mut stat).await;
        assert!(matches!(result, Err(TransportError::Fatal(_))));
        Ok(())
    }
}
