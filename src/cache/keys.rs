//! Cache key definitions.
//!
//! A `DailyKey` names the entry for one visitor and language. The visitor is
//! stored as a SHA-256 digest so raw client addresses never sit in the store.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::domain::language::Language;

/// The two slots kept per visitor and language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// "A verse was already handed out in this window."
    Marker,
    /// The verse itself.
    Verse,
}

impl SlotKind {
    /// Namespace tag prefixed to the slot name of this kind.
    pub fn namespace(self) -> &'static str {
        match self {
            SlotKind::Marker => "daily-verse-flag",
            SlotKind::Verse => "daily-verse",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SlotKind::Marker => "marker",
            SlotKind::Verse => "verse",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DailyKey {
    language: Language,
    identity_digest: String,
}

impl DailyKey {
    pub fn new(identity: &str, language: Language) -> Self {
        Self {
            language,
            identity_digest: digest_identity(identity),
        }
    }

    /// Flat name of one slot, as a shared key-value backend would store it.
    pub fn slot_name(&self, kind: SlotKind) -> String {
        format!("{}:{}", kind.namespace(), self)
    }
}

impl fmt::Display for DailyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.language.tag(), self.identity_digest)
    }
}

fn digest_identity(identity: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hex::encode(hasher.finalize().to_vec())
}
