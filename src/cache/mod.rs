//! Daily cache
//!
//! Holds the two slots the daily verse flow needs per visitor and language:
//!
//! - **Marker**: presence-only entry recording that today's verse was already
//!   handed out
//! - **Verse**: the generated verse itself
//!
//! Both slots live in one entry per visitor and language and expire after the
//! configured window (24 hours by default). Entries are dropped lazily when
//! read past their expiry; there is no background sweeper.
//!
//! `max_entries` bounds the number of visitor entries. When the store is full,
//! expired entries are dropped first; if none are found, the least recently
//! used visitor loses both slots at once and is treated as new on their next
//! request.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! ttl_seconds = 86400
//! max_entries = 10000
//! ```

mod clock;
mod config;
mod keys;
mod lock;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub(crate) use config::{DEFAULT_MAX_ENTRIES, DEFAULT_TTL_SECONDS};
pub use keys::{DailyKey, SlotKind};
pub use store::{ComputeFuture, DailyStore, Lookup, MemoryStore, Origin, StoreError};
