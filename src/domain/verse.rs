//! Verse records and the per-request daily result.

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// A single quotation as returned to visitors.
///
/// Construction always goes through [`Verse::new`] (or deserialization, which
/// delegates to it), so a `Verse` in hand is known to carry a non-empty book
/// and text and strictly positive chapter and verse numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "VerseDraft")]
pub struct Verse {
    book: String,
    chapter: u32,
    verse: u32,
    text: String,
}

impl Verse {
    pub fn new(
        book: impl Into<String>,
        chapter: u32,
        verse: u32,
        text: impl Into<String>,
    ) -> Result<Self, DomainError> {
        let book = book.into().trim().to_string();
        let text = text.into().trim().to_string();

        if book.is_empty() {
            return Err(DomainError::validation("verse book must not be empty"));
        }
        if chapter == 0 {
            return Err(DomainError::validation("verse chapter must be positive"));
        }
        if verse == 0 {
            return Err(DomainError::validation("verse number must be positive"));
        }
        if text.is_empty() {
            return Err(DomainError::validation("verse text must not be empty"));
        }

        Ok(Self {
            book,
            chapter,
            verse,
            text,
        })
    }

    pub fn book(&self) -> &str {
        &self.book
    }

    pub fn chapter(&self) -> u32 {
        self.chapter
    }

    pub fn verse(&self) -> u32 {
        self.verse
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Citation in `Book chapter:verse` form.
    pub fn reference(&self) -> String {
        format!("{} {}:{}", self.book, self.chapter, self.verse)
    }
}

/// Unvalidated verse shape, as produced by a generator or read back from a store.
#[derive(Debug, Clone, Deserialize)]
pub struct VerseDraft {
    pub book: String,
    pub chapter: i64,
    pub verse: i64,
    pub text: String,
}

impl TryFrom<VerseDraft> for Verse {
    type Error = DomainError;

    fn try_from(draft: VerseDraft) -> Result<Self, Self::Error> {
        let chapter = u32::try_from(draft.chapter)
            .map_err(|_| DomainError::validation("verse chapter must be positive"))?;
        let verse = u32::try_from(draft.verse)
            .map_err(|_| DomainError::validation("verse number must be positive"))?;
        Verse::new(draft.book, chapter, verse, draft.text)
    }
}

/// The answer to "what is my verse today?".
///
/// `is_new` is derived from cache state on every request and never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyVerse {
    pub verse: Verse,
    #[serde(rename = "isNew")]
    pub is_new: bool,
}

impl DailyVerse {
    pub fn fresh(verse: Verse) -> Self {
        Self {
            verse,
            is_new: true,
        }
    }

    pub fn replayed(verse: Verse) -> Self {
        Self {
            verse,
            is_new: false,
        }
    }
}
