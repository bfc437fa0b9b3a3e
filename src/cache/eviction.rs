//! Pressure-driven eviction support.
//!
//! The backing store is configured for allkeys-lru at init; this module adds
//! active eviction so sustained ingest cannot park memory at the ceiling.
//! Victim selection samples random keys, reads each key's idle time, and
//! deletes the coldest 20 % per iteration.

#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// Random keys sampled per iteration
    pub sample_size: usize,
    /// Share of the sample deleted per iteration, coldest first
    pub evict_fraction: f64,
    /// Iteration cap per eviction run
    pub max_iterations: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            sample_size: 100,
            evict_fraction: 0.20,
            max_iterations: 10,
        }
    }
}

/// Pick eviction victims from (key, idle seconds) samples: sort idle
/// descending and take the top `fraction` share (at least one key when the
/// sample is non-empty).
pub fn select_victims(samples: &[(String, i64)], fraction: f64) -> Vec<String> {
    if samples.is_empty() {
        return Vec::new();
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| b.1.cmp(&a.1));
    let count = ((samples.len() as f64) * fraction).ceil() as usize;
    sorted.truncate(count.clamp(1, samples.len()));
    sorted.into_iter().map(|(key, _)| key).collect()
}

/// Parse used_memory / maxmemory out of an INFO memory reply.
pub fn parse_memory_info(info: &str) -> (u64, u64) {
    let mut used = 0u64;
    let mut max = 0u64;
    for line in info.lines() {
        let line = line.trim();
        if let Some(v) = line.strip_prefix("used_memory:") {
            used = v.trim().parse().unwrap_or(0);
        } else if let Some(v) = line.strip_prefix("maxmemory:") {
            max = v.trim().parse().unwrap_or(0);
        }
    }
    (used, max)
}

/// Memory pressure ratio; an unlimited instance (maxmemory = 0) reports 0.
pub fn pressure_ratio(used: u64, max: u64) -> f64 {
    if max == 0 {
        0.0
    } else {
        used as f64 / max as f64
    }
}
