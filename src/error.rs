//! Centralized error types for emlxconv.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the emlxconv library.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// I/O error with the associated file path.
    #[error("I/O error reading '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The specified file does not exist.
    #[error("Container file not found: {0}")]
    FileNotFound(PathBuf),

    /// The leading byte-count header is missing, unparseable, or the
    /// container is shorter than the declared payload.
    #[error("Invalid structure; {0}")]
    MalformedContainer(String),

    /// Sibling parts of one multipart declare different boundary tokens.
    #[error("Different boundary strings (expected '{expected}', got: '{found}')")]
    InconsistentBoundary { expected: String, found: String },

    /// None of the candidate attachment files could be opened.
    #[error("Could not get attachment file (tried {})", .tried.join(", "))]
    AttachmentUnresolvable { tried: Vec<String> },

    /// The Content-Transfer-Encoding is not one we can produce.
    #[error("Unimplemented encoding: {0}")]
    UnsupportedEncoding(String),

    /// The message carries the `deleted` flag and skipping was requested.
    #[error("Message is flagged as deleted: {0}")]
    DeletedMessageSkipped(PathBuf),

    /// An invalid path was provided.
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// Convenience alias for `Result<T, ConvertError>`.
pub type Result<T> = std::result::Result<T, ConvertError>;

impl ConvertError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// `true` for the control signal that means "skip this file", not "fail".
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::DeletedMessageSkipped(_))
    }
}

/// Allow `?` on `std::io::Error` inside functions returning `ConvertError`
/// when no path context is available (rare, prefer `ConvertError::io`).
impl From<std::io::Error> for ConvertError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}
