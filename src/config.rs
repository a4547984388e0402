use std::{
    fs, io,
    path::Path,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One row of the density → chunk size table. A band applies when the sampled
/// density (messages per 1,000 IDs) is at least `min_density`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DensityBand {
    pub min_density: f64,
    pub chunk_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub safety_multiplier: f64,
    pub min_size: u64,
    pub max_size: u64,
    /// Used when the transport cannot estimate the conversation size.
    pub default_size: u64,
    pub false_positive_rate: f64,
    /// Commits between two filter checkpoints.
    pub persist_every: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            safety_multiplier: 1.1,
            min_size: 10_000,
            max_size: 10_000_000,
            default_size: 1_000_000,
            false_positive_rate: 0.01,
            persist_every: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    pub workers: usize,
    pub page_size: usize,
    pub slow_chunk_threshold_secs: f64,
    pub max_bisect_retries: u32,
    pub bisect_fanout: u64,
    /// Chunks spanning this many IDs or fewer are never bisected.
    pub min_bisect_span: u64,
    pub density_samples: usize,
    pub probe_limit: usize,
    /// Ordered from densest to sparsest when applied.
    pub density_bands: Vec<DensityBand>,
    pub default_chunk_size: u64,
    pub page_max_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_backoff_secs: u64,
    pub compress_frames: bool,
    pub filter: FilterConfig,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            page_size: 100,
            slow_chunk_threshold_secs: 10.0,
            max_bisect_retries: 2,
            bisect_fanout: 4,
            min_bisect_span: 1_000,
            density_samples: 5,
            probe_limit: 100,
            density_bands: default_density_bands(),
            default_chunk_size: 100_000,
            page_max_attempts: 5,
            retry_base_delay_ms: 300,
            retry_max_backoff_secs: 8,
            compress_frames: true,
            filter: FilterConfig::default(),
            extra: serde_json::Map::new(),
        }
    }
}

pub fn default_density_bands() -> Vec<DensityBand> {
    vec![
        DensityBand {
            min_density: 500.0,
            chunk_size: 20_000,
        },
        DensityBand {
            min_density: 100.0,
            chunk_size: 50_000,
        },
        DensityBand {
            min_density: 20.0,
            chunk_size: 200_000,
        },
        DensityBand {
            min_density: 0.0,
            chunk_size: 1_000_000,
        },
    ]
}

impl BackfillConfig {
    pub fn slow_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.slow_chunk_threshold_secs.max(0.0))
    }

    /// Chunk size for a sampled density, walking the bands densest-first.
    pub fn chunk_size_for_density(&self, density: f64) -> u64 {
        let mut bands = self.density_bands.clone();
        bands.sort_by(|a, b| b.min_density.total_cmp(&a.min_density));
        bands
            .iter()
            .find(|band| density >= band.min_density)
            .map(|band| band.chunk_size)
            .unwrap_or(self.default_chunk_size)
            .max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.page_size == 0 || self.probe_limit == 0 {
            bail!("page_size and probe_limit must be at least 1");
        }
        if !(self.slow_chunk_threshold_secs > 0.0) {
            bail!("slow_chunk_threshold_secs must be positive");
        }
        if self.bisect_fanout < 2 {
            bail!("bisect_fanout must be at least 2");
        }
        if self.default_chunk_size == 0 || self.density_bands.iter().any(|b| b.chunk_size == 0) {
            bail!("chunk sizes must be at least 1");
        }
        if self.page_max_attempts == 0 {
            bail!("page_max_attempts must be at least 1");
        }
        let filter = &self.filter;
        if !(filter.false_positive_rate > 0.0 && filter.false_positive_rate < 1.0) {
            bail!("filter.false_positive_rate must be between 0 and 1");
        }
        if filter.min_size == 0 || filter.min_size > filter.max_size {
            bail!(
                "filter.min_size ({}) must be non-zero and not exceed filter.max_size ({})",
                filter.min_size,
                filter.max_size
            );
        }
        if !(filter.safety_multiplier >= 1.0) {
            bail!("filter.safety_multiplier must be at least 1.0");
        }
        Ok(())
    }
}

pub const CONFIG_FILE: &str = "config.json";

/// Load a config file, falling back to defaults when it is missing or broken.
pub fn load_file(path: &Path) -> BackfillConfig {
    let file_contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return BackfillConfig::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not read config, using defaults");
            return BackfillConfig::default();
        }
    };

    let config: BackfillConfig = match serde_json::from_str(&file_contents) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not parse config, using defaults");
            return BackfillConfig::default();
        }
    };

    for key in config.extra.keys() {
        warn!(path = %path.display(), key = %key, "unknown config key");
    }

    debug!(path = %path.display(), "loaded config");
    config
}

/// Load the explicit config file, or `<root>/config.json` when none was
/// given. An explicit path that does not exist is an error.
pub fn load(explicit: Option<&Path>, root: &Path) -> Result<BackfillConfig> {
    match explicit {
        Some(path) => {
            if !path.exists() {
                bail!("config file {} does not exist", path.display());
            }
            Ok(load_file(path))
        }
        None => Ok(load_file(&root.join(CONFIG_FILE))),
    }
}

pub fn save_file(path: &Path, config: &BackfillConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(config).context("failed to serialize config")?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;

    Ok(())
}
