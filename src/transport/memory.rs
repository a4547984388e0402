use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{Session, Transport, TransportError};
use crate::model::{ConversationSpan, IdRange, MessageRecord};

#[derive(Debug, Clone)]
struct SlowZone {
    range: IdRange,
    page_delay: Duration,
}

#[derive(Debug, Default)]
struct Faults {
    transient_remaining: usize,
    fatal_after: Option<usize>,
    failing_ranges: Vec<IdRange>,
}

/// Request counters shared between a [`MemoryTransport`] and its sessions.
#[derive(Debug, Default)]
pub struct MemoryTransportCounters {
    pub pages: AtomicUsize,
    pub failures: AtomicUsize,
    pub sessions: AtomicUsize,
}

/// In-process corpus served through the [`Transport`] traits.
///
/// Delays use `tokio::time::sleep`, so tests running on a paused clock see
/// exact, instant slow zones.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    records: Arc<Vec<MessageRecord>>,
    span: ConversationSpan,
    base_delay: Duration,
    slow_zones: Arc<Vec<SlowZone>>,
    faults: Arc<Mutex<Faults>>,
    counters: Arc<MemoryTransportCounters>,
}

impl MemoryTransport {
    pub fn new(mut records: Vec<MessageRecord>, datacenter_id: u32) -> Self {
        records.sort_by_key(|r| r.id);
        records.dedup_by_key(|r| r.id);
        let min_id = records.first().map(|r| r.id).unwrap_or(1);
        let max_id = records.last().map(|r| r.id).unwrap_or(min_id);
        let span = ConversationSpan {
            min_id,
            max_id,
            datacenter_id,
            estimated_total: Some(records.len() as u64),
        };
        Self {
            records: Arc::new(records),
            span,
            base_delay: Duration::ZERO,
            slow_zones: Arc::new(Vec::new()),
            faults: Arc::new(Mutex::new(Faults::default())),
            counters: Arc::new(MemoryTransportCounters::default()),
        }
    }

    /// Contiguous corpus with one record per ID in `min_id..=max_id`.
    pub fn dense(min_id: u64, max_id: u64, datacenter_id: u32) -> Self {
        let records = (min_id..=max_id).map(MessageRecord::new).collect();
        Self::new(records, datacenter_id)
    }

    /// Override the span reported by `resolve`.
    pub fn with_span(mut self, min_id: u64, max_id: u64) -> Self {
        self.span.min_id = min_id;
        self.span.max_id = max_id;
        self
    }

    pub fn without_estimate(mut self) -> Self {
        self.span.estimated_total = None;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Every page touching `range` takes `page_delay` to return.
    pub fn with_slow_zone(mut self, range: IdRange, page_delay: Duration) -> Self {
        Arc::make_mut(&mut self.slow_zones).push(SlowZone { range, page_delay });
        self
    }

    /// The next `count` page requests fail with a retryable error.
    pub fn with_transient_failures(self, count: usize) -> Self {
        self.lock_faults().transient_remaining = count;
        self
    }

    /// Page requests after the first `pages` fail fatally.
    pub fn with_fatal_after(self, pages: usize) -> Self {
        self.lock_faults().fatal_after = Some(pages);
        self
    }

    /// Any page request intersecting `range` fails with a retryable error.
    pub fn with_failing_range(self, range: IdRange) -> Self {
        self.lock_faults().failing_ranges.push(range);
        self
    }

    pub fn counters(&self) -> Arc<MemoryTransportCounters> {
        Arc::clone(&self.counters)
    }

    pub fn records(&self) -> &[MessageRecord] {
        &self.records
    }

    fn lock_faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        match self.faults.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn page_delay(&self, window: IdRange) -> Duration {
        self.slow_zones
            .iter()
            .filter(|zone| zone.range.overlaps(&window))
            .map(|zone| zone.page_delay)
            .max()
            .unwrap_or(Duration::ZERO)
            .max(self.base_delay)
    }

    fn check_faults(&self, window: IdRange, page_number: usize) -> Result<(), TransportError> {
        let mut faults = self.lock_faults();
        if let Some(limit) = faults.fatal_after {
            if page_number > limit {
                return Err(TransportError::Fatal("session revoked".to_string()));
            }
        }
        if faults.transient_remaining > 0 {
            faults.transient_remaining -= 1;
            return Err(TransportError::Retryable("flood wait".to_string()));
        }
        if faults.failing_ranges.iter().any(|r| r.overlaps(&window)) {
            return Err(TransportError::Retryable(format!(
                "datacenter timeout for {window}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Session = MemorySession;

    async fn resolve(&self, _entity: &str) -> Result<ConversationSpan, TransportError> {
        Ok(self.span.clone())
    }

    async fn open_session(&self, _index: usize) -> Result<Self::Session, TransportError> {
        self.counters.sessions.fetch_add(1, Ordering::Relaxed);
        Ok(MemorySession {
            transport: self.clone(),
        })
    }
}

pub struct MemorySession {
    transport: MemoryTransport,
}

#[async_trait]
impl Session for MemorySession {
    async fn fetch_page(
        &mut self,
        range: IdRange,
        before_id: u64,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, TransportError> {
        let transport = &self.transport;
        let window = IdRange::new(range.start, before_id.min(range.end));
        let page_number = transport.counters.pages.fetch_add(1, Ordering::Relaxed) + 1;

        let delay = transport.page_delay(window);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Err(err) = transport.check_faults(window, page_number) {
            transport.counters.failures.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }

        let records = &transport.records;
        let lower = records.partition_point(|r| r.id < window.start);
        let upper = records.partition_point(|r| r.id < window.end);
        Ok(records[lower..upper]
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}
