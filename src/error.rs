//! Structured error types for import operations.

use serde::Serialize;
use thiserror::Error;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Rejected before any write
    IncompatibleVersion,
    UnknownEntity,

    // Payload problems
    MalformedRecord,

    // Store failures
    PersistenceError,
}

/// Errors raised by the importer.
///
/// Functions in the import pipeline return `anyhow::Result`; these variants
/// travel inside it and can be recovered with `downcast_ref::<ImportError>()`.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("unsupported snapshot version {found} (importer supports up to {supported})")]
    IncompatibleVersion { found: u32, supported: u32 },

    #[error("unknown entity type: {0}")]
    UnknownEntity(String),

    #[error("malformed {entity} record #{index}: {reason}")]
    MalformedRecord {
        entity: String,
        index: usize,
        reason: String,
    },

    #[error("failed to write {entity}: {source}")]
    Persistence {
        entity: String,
        #[source]
        source: rusqlite::Error,
    },
}

impl ImportError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ImportError::IncompatibleVersion { .. } => ErrorCode::IncompatibleVersion,
            ImportError::UnknownEntity(_) => ErrorCode::UnknownEntity,
            ImportError::MalformedRecord { .. } => ErrorCode::MalformedRecord,
            ImportError::Persistence { .. } => ErrorCode::PersistenceError,
        }
    }

    pub fn malformed(entity: &str, index: usize, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            entity: entity.to_string(),
            index,
            reason: reason.into(),
        }
    }

    pub fn persistence(entity: &str, source: rusqlite::Error) -> Self {
        Self::Persistence {
            entity: entity.to_string(),
            source,
        }
    }

    /// One-line description without statement text.
    ///
    /// Store failures keep SQLite's own message and drop the SQL that
    /// produced it, which for a batched insert can be very large.
    pub fn summary(&self) -> String {
        match self {
            ImportError::Persistence { entity, source } => {
                format!("failed to write {entity}: {}", sqlite_message(source))
            }
            other => other.to_string(),
        }
    }
}

fn sqlite_message(err: &rusqlite::Error) -> String {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(message)) => message.clone(),
        other => match other.sqlite_error() {
            Some(code) => code.to_string(),
            None => other.to_string(),
        },
    }
}

/// Extract the [`ErrorCode`] from an `anyhow` error chain, if any link is an
/// [`ImportError`].
pub fn error_code(err: &anyhow::Error) -> Option<ErrorCode> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ImportError>())
        .map(ImportError::code)
}

/// Short failure text for warnings and logs.
pub fn failure_summary(err: &anyhow::Error) -> String {
    match err.chain().find_map(|cause| cause.downcast_ref::<ImportError>()) {
        Some(import) => import.summary(),
        None => err.to_string(),
    }
}
