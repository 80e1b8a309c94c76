//! Contract for the external text generator that writes verses.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{error::DomainError, language::Language, verse::Verse};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generator request failed: {message}")]
    Transport { message: String },
    #[error("generator returned status {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("generator output was malformed: {message}")]
    Malformed { message: String },
    #[error("generator output violated verse invariants")]
    Invalid(#[from] DomainError),
}

impl GenerationError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn upstream(status: u16, body: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            body: body.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }
}

/// Produces one verse in the requested language.
///
/// Implementations neither cache nor retry; each call is a fresh generation.
#[async_trait]
pub trait VerseGenerator: Send + Sync {
    async fn generate(&self, language: Language) -> Result<Verse, GenerationError>;
}
