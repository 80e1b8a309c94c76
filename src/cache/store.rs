//! Cache storage.
//!
//! [`DailyStore`] is the seam the daily verse flow talks to; [`MemoryStore`]
//! is the in-process implementation used by the server.
//!
//! The marker and the verse for one visitor and language share a single
//! entry, so capacity eviction always removes them together.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use lru::LruCache;
use metrics::counter;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::debug;

use crate::application::daily_verse::DailyVerseError;
use crate::domain::verse::Verse;

use super::clock::{Clock, SystemClock};
use super::config::CacheConfig;
use super::keys::{DailyKey, SlotKind};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

const METRIC_CACHE_HIT: &str = "qrverse_cache_hit_total";
const METRIC_CACHE_MISS: &str = "qrverse_cache_miss_total";
const METRIC_CACHE_EVICT: &str = "qrverse_cache_evict_total";

/// How many least-recently-used entries are checked for expiry before a live
/// entry is evicted to make room.
const EXPIRY_SWEEP_BATCH: usize = 64;

/// Whether a lookup replayed a stored value or produced it just now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Cached,
    Computed,
}

impl Origin {
    pub fn was_cached(self) -> bool {
        self == Origin::Cached
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup<T> {
    pub value: T,
    pub origin: Origin,
}

impl<T> Lookup<T> {
    pub fn cached(value: T) -> Self {
        Self {
            value,
            origin: Origin::Cached,
        }
    }

    pub fn computed(value: T) -> Self {
        Self {
            value,
            origin: Origin::Computed,
        }
    }

    pub fn was_cached(&self) -> bool {
        self.origin.was_cached()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store unavailable: {message}")]
    Unavailable { message: String },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// Deferred producer for a verse slot that missed.
pub type ComputeFuture<'a> = BoxFuture<'a, Result<Verse, DailyVerseError>>;

/// Key-scoped memoizing store with per-slot expiry.
#[async_trait]
pub trait DailyStore: Send + Sync {
    /// Set the marker under `key` for `ttl` unless a live one is present.
    ///
    /// Returns [`Origin::Cached`] when the marker already existed.
    async fn get_or_compute_marker(
        &self,
        key: &DailyKey,
        ttl: Duration,
    ) -> Result<Origin, StoreError>;

    /// Return the live verse under `key`, or run `compute`, keep its result for
    /// `ttl` and return it.
    ///
    /// A failing `compute` leaves the slot empty and its error is returned
    /// untouched. Concurrent misses on one key should converge on a single
    /// stored value; whether `compute` may run more than once during such a
    /// race is up to the implementation.
    async fn get_or_compute_verse<'a>(
        &'a self,
        key: &'a DailyKey,
        ttl: Duration,
        compute: ComputeFuture<'a>,
    ) -> Result<Lookup<Verse>, DailyVerseError>;
}

/// Both slots for one visitor and language, each with its own expiry.
struct Entry {
    marker: Option<OffsetDateTime>,
    verse: Option<(Verse, OffsetDateTime)>,
}

impl Entry {
    fn live_marker(&self, now: OffsetDateTime) -> bool {
        self.marker.is_some_and(|expires_at| expires_at > now)
    }

    fn live_verse(&self, now: OffsetDateTime) -> Option<&Verse> {
        self.verse
            .as_ref()
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(verse, _)| verse)
    }

    fn is_expired(&self, now: OffsetDateTime) -> bool {
        !self.live_marker(now) && self.live_verse(now).is_none()
    }
}

/// In-process [`DailyStore`] bounded by an LRU limit on visitor entries.
///
/// Concurrent verse misses on the same key queue behind a per-key async lock,
/// so only the first caller computes and the rest observe its result.
pub struct MemoryStore {
    entries: RwLock<LruCache<DailyKey, Entry>>,
    in_flight: DashMap<DailyKey, Arc<AsyncMutex<()>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(config.max_entries_non_zero())),
            in_flight: DashMap::new(),
            clock,
        }
    }

    /// Drop one slot ahead of its expiry, leaving the other in place.
    pub fn invalidate(&self, key: &DailyKey, kind: SlotKind) {
        let mut entries = rw_write(&self.entries, SOURCE, "invalidate");
        let Some(entry) = entries.peek_mut(key) else {
            return;
        };
        match kind {
            SlotKind::Marker => entry.marker = None,
            SlotKind::Verse => entry.verse = None,
        }
        if entry.marker.is_none() && entry.verse.is_none() {
            entries.pop(key);
        }
    }

    pub fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
    }

    /// Whether `key` holds a live value in the `kind` slot. Does not touch
    /// recency.
    pub fn contains(&self, key: &DailyKey, kind: SlotKind) -> bool {
        let now = self.clock.now();
        rw_read(&self.entries, SOURCE, "contains")
            .peek(key)
            .is_some_and(|entry| match kind {
                SlotKind::Marker => entry.live_marker(now),
                SlotKind::Verse => entry.live_verse(now).is_some(),
            })
    }

    /// Number of stored visitor entries, including expired ones not yet read.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mark(&self, key: &DailyKey, ttl: Duration) -> Origin {
        let now = self.clock.now();
        let expires_at = now.saturating_add(ttl);
        let mut entries = rw_write(&self.entries, SOURCE, "mark");

        if let Some(entry) = entries.get_mut(key) {
            if entry.live_marker(now) {
                return Origin::Cached;
            }
            entry.marker = Some(expires_at);
            return Origin::Computed;
        }

        let entry = Entry {
            marker: Some(expires_at),
            verse: None,
        };
        admit(&mut entries, key.clone(), entry, now);
        Origin::Computed
    }

    fn live_verse(&self, key: &DailyKey) -> Option<Verse> {
        let now = self.clock.now();
        let mut entries = rw_write(&self.entries, SOURCE, "live_verse");
        let entry = entries.get_mut(key)?;
        if let Some(verse) = entry.live_verse(now) {
            return Some(verse.clone());
        }

        entry.verse = None;
        if entry.is_expired(now) {
            entries.pop(key);
        }
        None
    }

    fn store_verse(&self, key: &DailyKey, verse: Verse, ttl: Duration) {
        let now = self.clock.now();
        let expires_at = now.saturating_add(ttl);
        let mut entries = rw_write(&self.entries, SOURCE, "store_verse");

        if let Some(entry) = entries.get_mut(key) {
            entry.verse = Some((verse, expires_at));
            return;
        }

        let entry = Entry {
            marker: None,
            verse: Some((verse, expires_at)),
        };
        admit(&mut entries, key.clone(), entry, now);
    }
}

/// Insert a new visitor entry, making room first by dropping expired entries
/// at the cold end and only then evicting the least recently used live one.
fn admit(
    entries: &mut LruCache<DailyKey, Entry>,
    key: DailyKey,
    entry: Entry,
    now: OffsetDateTime,
) {
    if entries.len() >= entries.cap().get() {
        let expired: Vec<DailyKey> = entries
            .iter()
            .rev()
            .take(EXPIRY_SWEEP_BATCH)
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for stale in &expired {
            entries.pop(stale);
        }
    }

    if let Some((evicted, _)) = entries.push(key.clone(), entry) {
        if evicted != key {
            counter!(METRIC_CACHE_EVICT).increment(1);
            debug!(
                target = SOURCE,
                evicted = %evicted,
                capacity = entries.cap().get(),
                "cache full; evicted least recently used visitor entry"
            );
        }
    }
}

/// A clone of one key's gate. Dropping it removes the gate from `in_flight`
/// once no other lookup holds it, including when the lookup is cancelled.
struct Gate<'s> {
    store: &'s MemoryStore,
    key: &'s DailyKey,
    lock: Arc<AsyncMutex<()>>,
}

impl<'s> Gate<'s> {
    fn acquire(store: &'s MemoryStore, key: &'s DailyKey) -> Self {
        let lock = Arc::clone(&*store.in_flight.entry(key.clone()).or_default());
        Self { store, key, lock }
    }

    async fn enter(&self) -> AsyncMutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for Gate<'_> {
    fn drop(&mut self) {
        // One reference lives in the map and one here; anything beyond that is a waiter.
        self.store.in_flight.remove_if(self.key, |_, current| {
            Arc::ptr_eq(current, &self.lock) && Arc::strong_count(current) <= 2
        });
    }
}

#[async_trait]
impl DailyStore for MemoryStore {
    async fn get_or_compute_marker(
        &self,
        key: &DailyKey,
        ttl: Duration,
    ) -> Result<Origin, StoreError> {
        let slot_label = SlotKind::Marker.as_str();
        let origin = self.mark(key, ttl);
        match origin {
            Origin::Cached => counter!(METRIC_CACHE_HIT, "slot" => slot_label).increment(1),
            Origin::Computed => counter!(METRIC_CACHE_MISS, "slot" => slot_label).increment(1),
        }
        Ok(origin)
    }

    async fn get_or_compute_verse<'a>(
        &'a self,
        key: &'a DailyKey,
        ttl: Duration,
        compute: ComputeFuture<'a>,
    ) -> Result<Lookup<Verse>, DailyVerseError> {
        let slot_label = SlotKind::Verse.as_str();

        if let Some(verse) = self.live_verse(key) {
            counter!(METRIC_CACHE_HIT, "slot" => slot_label).increment(1);
            return Ok(Lookup::cached(verse));
        }

        let gate = Gate::acquire(self, key);
        let _entered = gate.enter().await;

        if let Some(verse) = self.live_verse(key) {
            counter!(METRIC_CACHE_HIT, "slot" => slot_label).increment(1);
            return Ok(Lookup::cached(verse));
        }

        counter!(METRIC_CACHE_MISS, "slot" => slot_label).increment(1);
        debug!(
            target = SOURCE,
            slot = %key.slot_name(SlotKind::Verse),
            "verse slot empty; computing"
        );
        let verse = compute.await?;
        self.store_verse(key, verse.clone(), ttl);
        Ok(Lookup::computed(verse))
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;
    use time::macros::datetime;

    use super::*;
    use crate::application::generator::GenerationError;
    use crate::cache::ManualClock;
    use crate::domain::language::Language;

    fn sample_verse() -> Verse {
        Verse::new("John", 3, 16, "For God so loved the world...").expect("valid verse")
    }

    fn store_with_clock(config: &CacheConfig) -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(datetime!(2026-10-19 08:00 UTC)));
        let store = MemoryStore::with_clock(config, clock.clone());
        (store, clock)
    }

    fn verse_compute<'a>(calls: &'a AtomicUsize) -> ComputeFuture<'a> {
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(sample_verse())
        }
        .boxed()
    }

    fn capped(max_entries: usize) -> CacheConfig {
        CacheConfig {
            max_entries,
            ..Default::default()
        }
    }

    async fn seed_pair(store: &MemoryStore, key: &DailyKey, ttl: Duration) {
        let calls = AtomicUsize::new(0);
        store
            .get_or_compute_marker(key, ttl)
            .await
            .expect("seed marker");
        store
            .get_or_compute_verse(key, ttl, verse_compute(&calls))
            .await
            .expect("seed verse");
    }

    #[tokio::test]
    async fn marker_is_set_once_per_window() {
        let (store, _clock) = store_with_clock(&CacheConfig::default());
        let key = DailyKey::new("203.0.113.5", Language::English);
        let ttl = Duration::days(1);

        let first = store
            .get_or_compute_marker(&key, ttl)
            .await
            .expect("first lookup");
        let second = store
            .get_or_compute_marker(&key, ttl)
            .await
            .expect("second lookup");

        assert_eq!(first, Origin::Computed);
        assert!(second.was_cached());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn first_verse_lookup_computes_then_replays() {
        let (store, _clock) = store_with_clock(&CacheConfig::default());
        let key = DailyKey::new("203.0.113.5", Language::English);
        let calls = AtomicUsize::new(0);
        let ttl = Duration::days(1);

        let first = store
            .get_or_compute_verse(&key, ttl, verse_compute(&calls))
            .await
            .expect("first lookup");
        let second = store
            .get_or_compute_verse(&key, ttl, verse_compute(&calls))
            .await
            .expect("second lookup");

        assert_eq!(first, Lookup::computed(sample_verse()));
        assert_eq!(second, Lookup::cached(sample_verse()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let (store, clock) = store_with_clock(&CacheConfig::default());
        let key = DailyKey::new("203.0.113.5", Language::English);
        let calls = AtomicUsize::new(0);
        let ttl = Duration::days(1);

        store
            .get_or_compute_verse(&key, ttl, verse_compute(&calls))
            .await
            .expect("seed");

        clock.advance(Duration::hours(23) + Duration::minutes(59));
        let before = store
            .get_or_compute_verse(&key, ttl, verse_compute(&calls))
            .await
            .expect("still live");
        assert!(before.was_cached());

        clock.advance(Duration::minutes(1));
        let after = store
            .get_or_compute_verse(&key, ttl, verse_compute(&calls))
            .await
            .expect("expired");
        assert_eq!(after.origin, Origin::Computed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_compute_stores_nothing() {
        let (store, _clock) = store_with_clock(&CacheConfig::default());
        let key = DailyKey::new("203.0.113.5", Language::Spanish);

        let failing: ComputeFuture<'_> = async {
            Err(DailyVerseError::from(GenerationError::transport(
                "connection reset",
            )))
        }
        .boxed();
        let err = store
            .get_or_compute_verse(&key, Duration::days(1), failing)
            .await
            .expect_err("compute failure surfaces");
        assert!(matches!(err, DailyVerseError::Generation(_)));
        assert!(store.is_empty());

        let calls = AtomicUsize::new(0);
        let lookup = store
            .get_or_compute_verse(&key, Duration::days(1), verse_compute(&calls))
            .await
            .expect("retry succeeds");
        assert_eq!(lookup, Lookup::computed(sample_verse()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_compute_once() {
        let store = Arc::new(MemoryStore::new(&CacheConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = DailyKey::new("198.51.100.20", Language::BrazilianPortuguese);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let calls = Arc::clone(&calls);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let compute: ComputeFuture<'_> = async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok::<_, DailyVerseError>(sample_verse())
                }
                .boxed();
                store
                    .get_or_compute_verse(&key, Duration::days(1), compute)
                    .await
                    .expect("lookup")
            }));
        }

        let mut computed = 0;
        for handle in handles {
            let lookup = handle.await.expect("task joined");
            assert_eq!(lookup.value, sample_verse());
            if lookup.origin == Origin::Computed {
                computed += 1;
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(computed, 1);
        assert!(store.in_flight.is_empty());
    }

    #[tokio::test]
    async fn cancelled_lookups_release_their_gates() {
        let store = Arc::new(MemoryStore::new(&CacheConfig::default()));

        let mut handles = Vec::new();
        for host in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let key = DailyKey::new(&format!("198.51.100.{host}"), Language::English);
                let stalled: ComputeFuture<'_> = async {
                    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                    Ok::<_, DailyVerseError>(sample_verse())
                }
                .boxed();
                store
                    .get_or_compute_verse(&key, Duration::days(1), stalled)
                    .await
            }));
        }

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!store.in_flight.is_empty());

        for handle in handles {
            handle.abort();
            let joined = handle.await;
            assert!(joined.expect_err("lookup was aborted").is_cancelled());
        }

        assert!(store.in_flight.is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_keeps_gate_for_the_computing_lookup() {
        let store = Arc::new(MemoryStore::new(&CacheConfig::default()));
        let key = DailyKey::new("203.0.113.5", Language::Spanish);
        let calls = Arc::new(AtomicUsize::new(0));

        let spawn_lookup = |delay_ms: u64| {
            let store = Arc::clone(&store);
            let key = key.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                let compute: ComputeFuture<'_> = async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    Ok::<_, DailyVerseError>(sample_verse())
                }
                .boxed();
                store
                    .get_or_compute_verse(&key, Duration::days(1), compute)
                    .await
            })
        };

        let computing = spawn_lookup(50);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let waiter = spawn_lookup(50);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        waiter.abort();
        assert!(waiter.await.expect_err("waiter aborted").is_cancelled());
        assert_eq!(store.in_flight.len(), 1);

        let lookup = computing
            .await
            .expect("task joined")
            .expect("computing lookup finishes");
        assert_eq!(lookup.origin, Origin::Computed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.in_flight.is_empty());
    }

    #[tokio::test]
    async fn lru_limit_evicts_oldest_visitor() {
        let (store, _clock) = store_with_clock(&capped(2));
        let ttl = Duration::days(1);

        let first = DailyKey::new("192.0.2.1", Language::English);
        let second = DailyKey::new("192.0.2.2", Language::English);
        let third = DailyKey::new("192.0.2.3", Language::English);

        for key in [&first, &second, &third] {
            store
                .get_or_compute_marker(key, ttl)
                .await
                .expect("seed");
        }
        assert_eq!(store.len(), 2);

        let replay = store
            .get_or_compute_marker(&first, ttl)
            .await
            .expect("recompute");
        assert_eq!(replay, Origin::Computed);
    }

    #[tokio::test]
    async fn eviction_never_separates_marker_and_verse() {
        let (store, _clock) = store_with_clock(&capped(3));
        let ttl = Duration::days(1);
        let keys: Vec<DailyKey> = (1..=8)
            .map(|host| DailyKey::new(&format!("192.0.2.{host}"), Language::English))
            .collect();

        for key in &keys {
            seed_pair(&store, key, ttl).await;
        }

        assert_eq!(store.len(), 3);
        for key in &keys {
            assert_eq!(
                store.contains(key, SlotKind::Marker),
                store.contains(key, SlotKind::Verse),
                "slots for {key} drifted apart"
            );
        }
        assert!(store.contains(&keys[7], SlotKind::Verse));
        assert!(!store.contains(&keys[0], SlotKind::Marker));
    }

    #[tokio::test]
    async fn full_store_drops_expired_entries_before_live_ones() {
        let (store, clock) = store_with_clock(&capped(2));
        let regular = DailyKey::new("192.0.2.1", Language::English);
        let short_lived = DailyKey::new("192.0.2.2", Language::English);
        let newcomer = DailyKey::new("192.0.2.3", Language::English);

        seed_pair(&store, &regular, Duration::days(1)).await;
        seed_pair(&store, &short_lived, Duration::hours(1)).await;

        // `regular` is the least recently used entry but still live.
        clock.advance(Duration::hours(2));
        seed_pair(&store, &newcomer, Duration::days(1)).await;

        assert!(store.contains(&regular, SlotKind::Marker));
        assert!(store.contains(&regular, SlotKind::Verse));
        assert!(store.contains(&newcomer, SlotKind::Verse));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn invalidate_drops_single_slot() {
        let (store, _clock) = store_with_clock(&CacheConfig::default());
        let key = DailyKey::new("192.0.2.9", Language::English);
        seed_pair(&store, &key, Duration::days(1)).await;

        store.invalidate(&key, SlotKind::Marker);
        assert!(!store.contains(&key, SlotKind::Marker));
        assert!(store.contains(&key, SlotKind::Verse));
        assert_eq!(store.len(), 1);

        store.invalidate(&key, SlotKind::Verse);
        assert!(store.is_empty());

        seed_pair(&store, &key, Duration::days(1)).await;
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn store_recovers_from_poisoned_lock() {
        let store = MemoryStore::new(&CacheConfig::default());

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store
                .entries
                .write()
                .expect("entries lock should be acquired");
            panic!("poison entries lock");
        }));

        assert!(store.is_empty());
        store.clear();
    }
}
