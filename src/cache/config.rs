//! Cache configuration.

use std::num::NonZeroUsize;

use time::Duration;

pub(crate) const DEFAULT_TTL_SECONDS: u64 = 86_400;
pub(crate) const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Runtime cache configuration derived from the `[cache]` settings section.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Lifetime of both the marker and the verse slot.
    pub ttl: Duration,
    /// Upper bound on visitor entries (marker and verse together) before the
    /// least recently used one is evicted.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::seconds(DEFAULT_TTL_SECONDS as i64),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            ttl: settings.ttl,
            max_entries: settings.max_entries.get(),
        }
    }
}

impl CacheConfig {
    /// Returns the entry limit as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }
}
