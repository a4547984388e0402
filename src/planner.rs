//! Adaptive chunk planning.
//!
//! The span is first probed at a handful of evenly spaced points to estimate
//! message density. Chunks are then laid out left to right: a position inside
//! a known hot zone takes the zone's recommended size, anything else takes
//! the size of its density band.

use tracing::{debug, info, warn};

use crate::config::BackfillConfig;
use crate::hotzone::HotZoneStore;
use crate::model::{density_per_thousand, IdRange};
use crate::transport::{Session, TransportError};

/// Sampled densities, one per equal-width segment of the span.
#[derive(Debug, Clone, PartialEq)]
pub struct DensityProfile {
    span: IdRange,
    segments: Vec<f64>,
}

impl DensityProfile {
    pub fn new(span: IdRange, segments: Vec<f64>) -> Self {
        Self { span, segments }
    }

    pub fn segments(&self) -> &[f64] {
        &self.segments
    }

    pub fn density_at(&self, id: u64) -> f64 {
        if self.segments.is_empty() || self.span.is_empty() {
            return 0.0;
        }
        let offset = id.saturating_sub(self.span.start).min(self.span.len() - 1);
        let idx = (offset as u128 * self.segments.len() as u128 / self.span.len() as u128) as usize;
        self.segments[idx.min(self.segments.len() - 1)]
    }
}

/// Probe `samples` segments of `span` with one small page each.
pub async fn sample_density<S: Session>(
    session: &mut S,
    span: IdRange,
    samples: usize,
    probe_limit: usize,
) -> Result<DensityProfile, TransportError> {
    let segments = span.split(samples.max(1) as u64);
    let mut densities = Vec::with_capacity(segments.len());
    for segment in &segments {
        let page = session.fetch_page(*segment, segment.end, probe_limit).await?;
        let covered = if page.len() >= probe_limit {
            let lowest = page.iter().map(|r| r.id).min().unwrap_or(segment.start);
            segment.end.saturating_sub(lowest).max(1)
        } else {
            segment.len()
        };
        let density = density_per_thousand(page.len(), covered);
        debug!(segment = %segment, records = page.len(), density, "density probe");
        densities.push(density);
    }
    Ok(DensityProfile::new(span, densities))
}

#[derive(Debug, Clone, Default)]
pub struct ChunkPlan {
    pub chunks: Vec<IdRange>,
    pub hot_zone_chunks: usize,
    pub density_fallback: bool,
}

pub struct ChunkPlanner<'a> {
    config: &'a BackfillConfig,
    hot_zones: &'a HotZoneStore,
}

impl<'a> ChunkPlanner<'a> {
    pub fn new(config: &'a BackfillConfig, hot_zones: &'a HotZoneStore) -> Self {
        Self { config, hot_zones }
    }

    /// Probe density through `session`, then lay out chunks. A failed probe
    /// falls back to `default_chunk_size` for the whole span.
    pub async fn plan_with_probe<S: Session>(
        &self,
        session: &mut S,
        span: IdRange,
        datacenter: u32,
    ) -> ChunkPlan {
        let profile = match sample_density(
            session,
            span,
            self.config.density_samples,
            self.config.probe_limit,
        )
        .await
        {
            Ok(profile) => Some(profile),
            Err(err) => {
                warn!(error = %err, "density sampling failed; using default chunk size");
                None
            }
        };
        self.plan(span, datacenter, profile.as_ref())
    }

    pub fn plan(&self, span: IdRange, datacenter: u32, density: Option<&DensityProfile>) -> ChunkPlan {
        let mut plan = ChunkPlan {
            density_fallback: density.is_none(),
            ..ChunkPlan::default()
        };
        let mut pos = span.start;
        while pos < span.end {
            let (size, limit) = match self.hot_zones.lookup(datacenter, pos) {
                Some(zone) => {
                    plan.hot_zone_chunks += 1;
                    (zone.recommended_size, zone.id_end)
                }
                None => {
                    let size = match density {
                        Some(profile) => self.config.chunk_size_for_density(profile.density_at(pos)),
                        None => self.config.default_chunk_size,
                    };
                    (size, self.next_zone_start(datacenter, pos).unwrap_or(u64::MAX))
                }
            };
            let end = pos.saturating_add(size.max(1)).min(limit).min(span.end);
            plan.chunks.push(IdRange::new(pos, end));
            pos = end;
        }
        info!(
            span = %span,
            chunks = plan.chunks.len(),
            hot_zone_chunks = plan.hot_zone_chunks,
            density_fallback = plan.density_fallback,
            "planned chunks"
        );
        plan
    }

    fn next_zone_start(&self, datacenter: u32, pos: u64) -> Option<u64> {
        self.hot_zones
            .entries()
            .iter()
            .filter(|e| e.datacenter == datacenter && e.id_start > pos)
            .map(|e| e.id_start)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::SlowChunkRecord;
    use crate::transport::{MemoryTransport, Transport};

    fn assert_exact_cover(chunks: &[IdRange], span: IdRange) {
        assert_eq!(chunks.first().map(|c| c.start), Some(span.start));
        assert_eq!(chunks.last().map(|c| c.end), Some(span.end));
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start, "gap or overlap at {}", pair[0]);
        }
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[test]
    fn plan_covers_span_exactly_for_many_shapes() {
        let config = BackfillConfig {
            default_chunk_size: 7,
            ..BackfillConfig::default()
        };
        let store = HotZoneStore::in_memory();
        let planner = ChunkPlanner::new(&config, &store);
        for (min, max) in [(1, 1), (1, 100), (5, 6), (0, 1_000), (999, 12_345)] {
            let span = IdRange::inclusive(min, max);
            let plan = planner.plan(span, 1, None);
            assert_exact_cover(&plan.chunks, span);
            assert!(plan.density_fallback);
        }
    }

    #[test]
    fn hot_zone_overrides_density_inside_its_range() {
        let config = BackfillConfig::default();
        let mut store = HotZoneStore::in_memory();
        store.record_observations(
            &[SlowChunkRecord::new(
                IdRange::new(200_000, 400_000),
                Duration::from_secs(40),
                5_000,
                2,
                0,
            )],
            config.slow_threshold(),
            config.min_bisect_span,
        );
        let planner = ChunkPlanner::new(&config, &store);
        let span = IdRange::inclusive(0, 999_999);
        let profile = DensityProfile::new(span, vec![1.0]);
        let plan = planner.plan(span, 2, Some(&profile));

        assert_exact_cover(&plan.chunks, span);
        assert_eq!(plan.chunks[0], IdRange::new(0, 200_000));
        assert_eq!(plan.chunks[1], IdRange::new(200_000, 250_000));
        assert_eq!(plan.hot_zone_chunks, 4);
        assert_eq!(plan.chunks[4], IdRange::new(350_000, 400_000));
        assert_eq!(plan.chunks[5], IdRange::new(400_000, 1_000_000));
    }

    #[test]
    fn density_profile_maps_ids_to_segments() {
        let profile = DensityProfile::new(IdRange::new(0, 100), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(profile.density_at(0), 1.0);
        assert_eq!(profile.density_at(26), 2.0);
        assert_eq!(profile.density_at(99), 4.0);
        assert_eq!(profile.density_at(5_000), 4.0);
    }

    #[tokio::test]
    async fn probe_measures_dense_and_sparse_segments() -> anyhow::Result<()> {
        let mut records: Vec<_> = (0..10_000).map(crate::model::MessageRecord::new).collect();
        records.extend((10_000..20_000).step_by(100).map(crate::model::MessageRecord::new));
        let transport = MemoryTransport::new(records, 1);
        let mut session = transport.open_session(0).await?;

        let profile = sample_density(&mut session, IdRange::new(0, 20_000), 2, 50).await?;
        assert_eq!(profile.segments(), &[1000.0, 10.0]);
        Ok(())
    }

    #[tokio::test]
    async fn failed_probe_falls_back_to_default_size() -> anyhow::Result<()> {
        let transport = MemoryTransport::dense(1, 1_000, 1).with_transient_failures(1);
        let mut session = transport.open_session(0).await?;
        let config = BackfillConfig {
            default_chunk_size: 300,
            ..BackfillConfig::default()
        };
        let store = HotZoneStore::in_memory();
        let plan = ChunkPlanner::new(&config, &store)
            .plan_with_probe(&mut session, IdRange::inclusive(1, 1_000), 1)
            .await;
        assert!(plan.density_fallback);
        assert_eq!(plan.chunks.len(), 4);
        Ok(())
    }
}
