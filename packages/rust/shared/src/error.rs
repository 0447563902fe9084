//! Error types for kbforge.
//!
//! Library crates use [`KbForgeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all kbforge operations.
#[derive(Debug, thiserror::Error)]
pub enum KbForgeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A source file could not be turned into a heading stream.
    #[error("extraction error at {path:?}: {message}")]
    Extraction { path: PathBuf, message: String },

    /// Malformed structured text (collaborator replies, state documents).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Knowledge store or state document persistence error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Classification/description service failure (network, HTTP status, retries exhausted).
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (missing required field, invalid level, bad input root).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// HTML-to-Markdown conversion error.
    #[error("conversion error: {0}")]
    Conversion(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, KbForgeError>;

impl KbForgeError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an extraction error for a specific source file.
    pub fn extraction(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Extraction {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error should terminate a run rather than skip one file.
    ///
    /// Only persistence failures qualify; everything else is scoped to a single source file.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = KbForgeError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = KbForgeError::validation("level -1 is not allowed");
        assert!(err.to_string().contains("level -1"));

        let err = KbForgeError::extraction("docs/a.pdf", "corrupt xref table");
        assert!(err.to_string().contains("docs/a.pdf"));
        assert!(err.to_string().contains("corrupt xref table"));
    }

    #[test]
    fn only_storage_errors_are_fatal() {
        assert!(KbForgeError::Storage("disk full".into()).is_fatal());
        assert!(!KbForgeError::Collaborator("timeout".into()).is_fatal());
        assert!(!KbForgeError::parse("bad json").is_fatal());
    }
}
