//! Daily verse orchestration.
//!
//! Per visitor and language, at most one verse is generated per window; every
//! later request inside the window replays it. Two independent cache slots
//! carry the state:
//!
//! - the marker, whose prior presence is the only signal that a request is a
//!   repeat
//! - the verse itself
//!
//! Because the slots are populated independently, they can drift apart (for
//! example when a generation fails after the marker was written, or when a
//! store drops one slot early). In that case `is_new` reflects the marker alone, not whether a
//! generation happened.
//!
//! Visitors without a resolvable identity are never memoized: each request
//! generates a new verse and reports it as new.

use std::{sync::Arc, time::Instant};

use futures::FutureExt;
use metrics::{counter, histogram};
use thiserror::Error;
use time::Duration;
use tracing::{debug, warn};

use crate::application::{
    generator::{GenerationError, VerseGenerator},
    identity::Identity,
};
use crate::cache::{CacheConfig, DailyKey, DailyStore, StoreError};
use crate::domain::{
    language::Language,
    verse::{DailyVerse, Verse},
};

const SOURCE: &str = "application::daily_verse";

const METRIC_CACHE_BYPASS: &str = "qrverse_cache_bypass_total";
const METRIC_GENERATION_MS: &str = "qrverse_generation_ms";
const METRIC_GENERATION_FAILED: &str = "qrverse_generation_failed_total";

#[derive(Debug, Error)]
pub enum DailyVerseError {
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct DailyVerseService {
    store: Arc<dyn DailyStore>,
    generator: Arc<dyn VerseGenerator>,
    ttl: Duration,
}

impl DailyVerseService {
    pub fn new(
        store: Arc<dyn DailyStore>,
        generator: Arc<dyn VerseGenerator>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            store,
            generator,
            ttl: config.ttl,
        }
    }

    /// Today's verse for `identity` in `language`.
    pub async fn daily_verse(
        &self,
        identity: &Identity,
        language: Language,
    ) -> Result<DailyVerse, DailyVerseError> {
        let Identity::Known(identity) = identity else {
            counter!(METRIC_CACHE_BYPASS, "language" => language.tag()).increment(1);
            debug!(
                target = SOURCE,
                language = %language,
                "caller identity unavailable; generating without daily cache"
            );
            let verse = self.generate(language).await?;
            return Ok(DailyVerse::fresh(verse));
        };

        let key = DailyKey::new(identity, language);

        let marker = self.store.get_or_compute_marker(&key, self.ttl).await?;
        let lookup = self
            .store
            .get_or_compute_verse(
                &key,
                self.ttl,
                async move {
                    self.generate(language)
                        .await
                        .map_err(DailyVerseError::from)
                }
                .boxed(),
            )
            .await?;

        debug!(
            target = SOURCE,
            language = %language,
            marker_cached = marker.was_cached(),
            verse_cached = lookup.was_cached(),
            "daily verse resolved"
        );

        Ok(if marker.was_cached() {
            DailyVerse::replayed(lookup.value)
        } else {
            DailyVerse::fresh(lookup.value)
        })
    }

    async fn generate(&self, language: Language) -> Result<Verse, GenerationError> {
        let started = Instant::now();
        let result = self.generator.generate(language).await;
        histogram!(METRIC_GENERATION_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        if let Err(err) = &result {
            counter!(METRIC_GENERATION_FAILED).increment(1);
            warn!(
                target = SOURCE,
                language = %language,
                error = %err,
                "verse generation failed"
            );
        }
        result
    }
}
