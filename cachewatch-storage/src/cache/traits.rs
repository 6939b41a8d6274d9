//! Cache outcomes, statistics and the statistics callback.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

/// How a cached call was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheOutcome {
    /// Joined an existing entry.
    Hit,
    /// Created a new entry and started the computation.
    Miss,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Miss => "miss",
        }
    }
}

impl fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invoked once per cached call with its outcome. Never invoked for calls
/// that bypass the cache.
pub type StatisticsCallback = Arc<dyn Fn(CacheOutcome) + Send + Sync>;

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Calls served uncached because the connection was unhealthy or the
    /// arguments could not be fingerprinted.
    pub bypasses: u64,
    /// Number of times the whole mapping was discarded.
    pub clears: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            bypasses: 1_000,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_outcome_strings() {
        assert_eq!(CacheOutcome::Hit.to_string(), "hit");
        assert_eq!(
            serde_json::to_string(&CacheOutcome::Miss).unwrap(),
            "\"miss\""
        );
    }
}
