use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("domain validation failed: {message}")]
    Validation { message: String },
    #[error("unsupported language `{tag}`")]
    UnsupportedLanguage { tag: String },
}

impl DomainError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn unsupported_language(tag: impl Into<String>) -> Self {
        Self::UnsupportedLanguage { tag: tag.into() }
    }
}
