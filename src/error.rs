//! Error types for the dump/restore engine.
//!
//! Nothing is retried inside the engine; every error is fatal for the
//! current session and the orchestrator is expected to retry at the
//! session level.

use std::io;

pub type Result<T> = std::result::Result<T, DumpError>;

#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    /// Missing or malformed configuration: work-file keys, disk type,
    /// sectors-per-call and friends.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failure reported by the disk backend, with the driver's verbatim
    /// error text and numeric code.
    #[error("backend error: {text} [{code}]")]
    Backend { code: u64, text: String },

    /// Unrecoverable fault raised by the backend library itself.
    #[error("backend panic: {0}")]
    BackendPanic(String),

    /// Corrupt record on the backup stream: short header, bad magic,
    /// or an impossible length field.
    #[error("framing error: {0}")]
    Framing(String),

    /// The restore target is smaller than the source in a checked
    /// geometry dimension.
    #[error("disk geometry mismatch: {0}")]
    Geometry(String),

    /// Stream or raw-file I/O failure, including truncated payloads.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// First error observed by a copy-pipeline worker.
    #[error("copy pipeline failed: {0}")]
    Pipeline(String),
}

impl DumpError {
    pub fn backend(code: u64, text: impl Into<String>) -> Self {
        Self::Backend {
            code,
            text: text.into(),
        }
    }

    /// Process exit code reported to the invoking orchestrator.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::BackendPanic(_) => 10,
            _ => 1,
        }
    }
}
