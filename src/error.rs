//! Error types for the CoW AVL+ Merkle tree core.

use thiserror::Error;

/// A trait for assigning a stable, machine-readable string code to an error.
///
/// No exporter in this core consumes the code, but it is useful for log
/// correlation and keeps error identity stable across message-text changes.
pub trait ErrorCode {
    /// Returns the unique, stable string identifier for this error variant.
    fn code(&self) -> &'static str;
}

/// Errors emitted by the tree, buffer pool, WAL, and commitment store.
#[derive(Debug, Error)]
pub enum Error {
    /// A nil value on `Set`, or a structurally malformed key.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The commitment store returned nothing for a node key expected to exist.
    #[error("node not found for key {0}")]
    NotFound(String),

    /// A serialized node failed to decode, an out-of-range mode/height/nonce
    /// was encountered, or a child hash was missing while hashing.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The clock evictor scanned its full budget without finding a clean frame.
    #[error("pool exhausted: dirty set exceeds pool capacity")]
    PoolExhausted,

    /// A WAL append or commitment-store I/O operation failed.
    #[error("io failure: {0}")]
    IoFailure(String),

    /// The version counter would exceed its representable range.
    #[error("version overflow")]
    VersionOverflow,
}

impl ErrorCode for Error {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "COWAVL_INVALID_ARGUMENT",
            Self::NotFound(_) => "COWAVL_NOT_FOUND",
            Self::Corruption(_) => "COWAVL_CORRUPTION",
            Self::PoolExhausted => "COWAVL_POOL_EXHAUSTED",
            Self::IoFailure(_) => "COWAVL_IO_FAILURE",
            Self::VersionOverflow => "COWAVL_VERSION_OVERFLOW",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoFailure(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
