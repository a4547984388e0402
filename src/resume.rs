//! Probabilistic "already committed" set for idempotent resume.
//!
//! A classic Bloom filter over record IDs with double hashing
//! (`h1 + i * h2`). Sized once per conversation from the expected message
//! count; membership answers never produce false negatives.
//!
//! Persisted layout, all integers big-endian:
//!
//! ```text
//! "RFLT" | version u8 | size u64 | hash_count u32 | items_added u64
//!        | word_count u64 | words [u64; word_count] | xxh3(words) u64
//! ```

use std::f64::consts::LN_2;
use std::path::Path;

use anyhow::{bail, Result};
use tracing::{debug, warn};
use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

use crate::config::FilterConfig;
use crate::state::write_bytes_atomic;

const MAGIC: &[u8; 4] = b"RFLT";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 8 + 4 + 8 + 8;
const MAX_HASHES: u32 = 16;

/// Expected item count for a conversation of `estimated_total` messages.
pub fn expected_items(estimated_total: Option<u64>, config: &FilterConfig) -> u64 {
    let raw = match estimated_total {
        Some(total) => (total as f64 * config.safety_multiplier).ceil() as u64,
        None => config.default_size,
    };
    raw.clamp(config.min_size, config.max_size.max(config.min_size))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeFilter {
    size: u64,
    hash_count: u32,
    items_added: u64,
    bits: Vec<u64>,
}

impl ResumeFilter {
    /// Filter for `expected_items` entries at the given false positive rate.
    pub fn with_capacity(expected_items: u64, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);
        let bit_count = (-(n * p.ln()) / (LN_2 * LN_2)).ceil().max(64.0) as u64;
        let hash_count = ((bit_count as f64 / n) * LN_2)
            .round()
            .clamp(1.0, MAX_HASHES as f64) as u32;
        let words = bit_count.div_ceil(64) as usize;
        Self {
            size: expected_items.max(1),
            hash_count,
            items_added: 0,
            bits: vec![0u64; words],
        }
    }

    /// Sized from the conversation estimate with the configured clamps.
    pub fn for_conversation(estimated_total: Option<u64>, config: &FilterConfig) -> Self {
        let size = expected_items(estimated_total, config);
        debug!(estimated_total, size, "sizing resume filter");
        Self::with_capacity(size, config.false_positive_rate)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn items_added(&self) -> u64 {
        self.items_added
    }

    pub fn bit_count(&self) -> u64 {
        self.bits.len() as u64 * 64
    }

    fn positions(&self, id: u64) -> impl Iterator<Item = u64> {
        let bytes = id.to_le_bytes();
        let h1 = xxh3_64_with_seed(&bytes, 0);
        let h2 = xxh3_64_with_seed(&bytes, 0x9e37_79b9_7f4a_7c15) | 1;
        let m = self.bit_count();
        (0..u64::from(self.hash_count)).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.positions(id)
            .all(|bit| self.bits[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0)
    }

    pub fn add(&mut self, id: u64) {
        let positions: Vec<u64> = self.positions(id).collect();
        for bit in positions {
            self.bits[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
        self.items_added += 1;
    }

    /// Expected false positive rate at the current fill.
    pub fn estimated_fpr(&self) -> f64 {
        let k = f64::from(self.hash_count);
        let m = self.bit_count() as f64;
        let n = self.items_added as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.bits.len() * 8 + 8);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&self.size.to_be_bytes());
        out.extend_from_slice(&self.hash_count.to_be_bytes());
        out.extend_from_slice(&self.items_added.to_be_bytes());
        out.extend_from_slice(&(self.bits.len() as u64).to_be_bytes());
        let start = out.len();
        for word in &self.bits {
            out.extend_from_slice(&word.to_be_bytes());
        }
        let checksum = xxh3_64(&out[start..]);
        out.extend_from_slice(&checksum.to_be_bytes());
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN + 8 {
            bail!("resume filter too short ({} bytes)", bytes.len());
        }
        if &bytes[..4] != MAGIC {
            bail!("resume filter has invalid magic");
        }
        if bytes[4] != VERSION {
            bail!("unsupported resume filter version {}", bytes[4]);
        }
        let size = read_u64(bytes, 5);
        let hash_count = u32::from_be_bytes([bytes[13], bytes[14], bytes[15], bytes[16]]);
        let items_added = read_u64(bytes, 17);
        let word_count = read_u64(bytes, 25);

        let words_len = usize::try_from(word_count)
            .ok()
            .and_then(|w| w.checked_mul(8))
            .filter(|len| HEADER_LEN + len + 8 == bytes.len());
        let Some(words_len) = words_len else {
            bail!("resume filter length does not match its word count {word_count}");
        };
        if word_count == 0 || hash_count == 0 || hash_count > MAX_HASHES || size == 0 {
            bail!("resume filter header is inconsistent");
        }

        let words = &bytes[HEADER_LEN..HEADER_LEN + words_len];
        let checksum = read_u64(bytes, HEADER_LEN + words_len);
        if xxh3_64(words) != checksum {
            bail!("resume filter checksum mismatch");
        }
        let bits = words
            .chunks_exact(8)
            .map(|chunk| read_u64(chunk, 0))
            .collect();
        Ok(Self {
            size,
            hash_count,
            items_added,
            bits,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_bytes_atomic(path, &self.serialize())
    }

    /// Load a persisted filter, or build a fresh one when none exists or the
    /// stored bytes cannot be trusted. A fresh filter only costs redundant
    /// work; it can never hide a record.
    pub fn load_or_new(path: &Path, estimated_total: Option<u64>, config: &FilterConfig) -> Self {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Self::for_conversation(estimated_total, config);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not read resume filter; starting fresh");
                return Self::for_conversation(estimated_total, config);
            }
        };
        match Self::deserialize(&bytes) {
            Ok(filter) => {
                debug!(
                    path = %path.display(),
                    items = filter.items_added,
                    size = filter.size,
                    "loaded resume filter"
                );
                filter
            }
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "corrupt resume filter; starting fresh");
                Self::for_conversation(estimated_total, config)
            }
        }
    }
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_estimates_clamp_to_min_size() {
        let config = FilterConfig::default();
        let filter = ResumeFilter::for_conversation(Some(1_000), &config);
        assert_eq!(filter.size(), 10_000);
    }

    #[test]
    fn sizing_applies_multiplier_and_bounds() {
        let config = FilterConfig::default();
        assert_eq!(expected_items(Some(100_000), &config), 110_000);
        assert_eq!(expected_items(Some(50_000_000), &config), 10_000_000);
        assert_eq!(expected_items(None, &config), 1_000_000);
    }

    #[test]
    fn no_false_negatives_and_bounded_false_positives() {
        let mut filter = ResumeFilter::with_capacity(10_000, 0.01);
        for id in (0..10_000u64).map(|i| i * 7 + 3) {
            filter.add(id);
        }
        for id in (0..10_000u64).map(|i| i * 7 + 3) {
            assert!(filter.contains(id), "false negative for {id}");
        }

        let probes = 100_000u64;
        let false_positives = (1_000_000..1_000_000 + probes)
            .filter(|id| filter.contains(*id))
            .count();
        let rate = false_positives as f64 / probes as f64;
        assert!(rate <= 0.02, "false positive rate {rate} above 2x target");
        assert!(filter.estimated_fpr() <= 0.02);
    }

    #[test]
    fn serialization_round_trips_all_fields() -> Result<()> {
        let mut filter = ResumeFilter::with_capacity(20_000, 0.01);
        for id in 0..500 {
            filter.add(id * 31);
        }
        let restored = ResumeFilter::deserialize(&filter.serialize())?;
        assert_eq!(restored, filter);
        assert_eq!(restored.items_added(), 500);
        Ok(())
    }

    #[test]
    fn flipped_bit_is_detected() {
        let mut filter = ResumeFilter::with_capacity(10_000, 0.01);
        filter.add(42);
        let mut bytes = filter.serialize();
        bytes[HEADER_LEN + 3] ^= 0x10;
        assert!(ResumeFilter::deserialize(&bytes).is_err());
    }

    #[test]
    fn corrupt_file_loads_as_fresh_filter() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("resume.filter");
        std::fs::write(&path, b"RFLT\x01garbage")?;
        let config = FilterConfig::default();
        let filter = ResumeFilter::load_or_new(&path, Some(5), &config);
        assert_eq!(filter.items_added(), 0);
        assert_eq!(filter.size(), config.min_size);
        Ok(())
    }

    #[test]
    fn saved_filter_is_reloaded() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("resume.filter");
        let config = FilterConfig::default();
        let mut filter = ResumeFilter::for_conversation(Some(20_000), &config);
        filter.add(7);
        filter.save(&path)?;

        let loaded = ResumeFilter::load_or_new(&path, Some(20_000), &config);
        assert!(loaded.contains(7));
        assert_eq!(loaded, filter);
        Ok(())
    }
}
