//! Error types.
//!
//! The crate uses a hierarchical error system: [`GatedHnswError`] is the
//! top-level error returned by all public APIs, and specific error types
//! (`IndexError`, `StoreError`, `ChunkingError`, `ConfigError`) provide
//! detail and round-trip through `#[from]` conversions.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GatedHnswError>;

/// Top-level error enum for all public operations.
///
/// Matches the error kinds named in the spec: `NotFound`, `InvalidInput`,
/// `Conflict`, `Dependency`, `Corruption`, `Cancelled`.
#[derive(Debug, Error)]
pub enum GatedHnswError {
    /// HNSW graph operation error (insert, search, persistence).
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// External-collaborator error (store, embedder, LLM).
    #[error("dependency error: {0}")]
    Store(#[from] StoreError),

    /// Chunking/contextualization/metadata-extraction pipeline error.
    #[error("chunking error: {0}")]
    Chunking(#[from] ChunkingError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Requested tenant or chunk does not exist and auto-build is disabled.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed filter, missing permissions, bad `k`, or dimension mismatch at insert.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A concurrent operation raced this one (e.g. destroy raced a build).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The caller cancelled the operation.
    #[error("cancelled")]
    Cancelled,

    /// General I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatedHnswError {
    /// Creates a `NotFound` error with the given message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Creates an `InvalidInput` error with the given message.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Creates a `Conflict` error with the given message.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Returns true if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if this is an invalid-input error.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }

    /// Returns true if this wraps a dependency (external collaborator) failure.
    pub fn is_dependency(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Returns true if this wraps a persisted-index corruption error.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Index(IndexError::Corrupted(_)))
    }

    /// Returns true if the caller cancelled the operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// HNSW graph errors (C1/C2/C3).
#[derive(Debug, Error)]
pub enum IndexError {
    /// Insert vector dimension disagrees with the index's established dimension.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension established by the index's first insert.
        expected: usize,
        /// Dimension of the vector that was rejected.
        got: usize,
    },

    /// Persisted index file failed a structural or version check on load.
    #[error("corrupted index: {0}")]
    Corrupted(String),

    /// Persisted index file format/version does not match what this build understands.
    #[error("unsupported index format version: expected {expected}, found {found}")]
    UnsupportedVersion {
        /// Version this build knows how to read.
        expected: u32,
        /// Version found in the file.
        found: u32,
    },

    /// `HnswParams` value was out of the allowed range (e.g. `M` outside `[4,64]`).
    #[error("invalid parameter '{param}': {reason}")]
    InvalidParam {
        /// Name of the out-of-range parameter.
        param: String,
        /// Why the value is invalid.
        reason: String,
    },

    /// A referenced chunk id does not exist in the index.
    #[error("chunk not found: {0}")]
    ChunkNotFound(String),
}

impl IndexError {
    /// Creates a corruption error with the given message.
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Creates an invalid-parameter error.
    pub fn invalid_param(param: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParam {
            param: param.into(),
            reason: reason.into(),
        }
    }
}

impl From<bincode::Error> for IndexError {
    fn from(err: bincode::Error) -> Self {
        IndexError::Corrupted(format!("bincode: {err}"))
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(err: serde_json::Error) -> Self {
        IndexError::Corrupted(format!("json: {err}"))
    }
}

/// External-collaborator errors: the metadata store, the embedder, the LLM.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Tenant has no row in the external store.
    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    /// The embedder failed to produce a vector.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// The LLM collaborator failed after exhausting its retry budget.
    #[error("LLM call failed: {0}")]
    Llm(String),

    /// The underlying store transport (e.g. redb) failed.
    #[error("store backend error: {0}")]
    Backend(String),

    /// Query or mutation hit the external store's connection pool exhausted.
    #[error("store connection pool exhausted")]
    PoolExhausted,
}

impl StoreError {
    /// Creates a backend error with the given message.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

#[cfg(feature = "redb-store")]
impl From<redb::Error> for StoreError {
    fn from(err: redb::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[cfg(feature = "redb-store")]
impl From<redb::DatabaseError> for StoreError {
    fn from(err: redb::DatabaseError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[cfg(feature = "redb-store")]
impl From<redb::TransactionError> for StoreError {
    fn from(err: redb::TransactionError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[cfg(feature = "redb-store")]
impl From<redb::CommitError> for StoreError {
    fn from(err: redb::CommitError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[cfg(feature = "redb-store")]
impl From<redb::TableError> for StoreError {
    fn from(err: redb::TableError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[cfg(feature = "redb-store")]
impl From<redb::StorageError> for StoreError {
    fn from(err: redb::StorageError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Chunking / contextualization / metadata-extraction errors.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Input document text was empty where non-empty content was required.
    #[error("empty document")]
    EmptyDocument,

    /// LLM split-after response could not be parsed.
    #[error("unparseable split-after response: {0}")]
    UnparseableSplitResponse(String),
}

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configured value is outside its allowed range.
    #[error("invalid configuration for '{field}': {reason}")]
    Invalid {
        /// Name of the offending field.
        field: String,
        /// Why the value is invalid.
        reason: String,
    },
}

impl ConfigError {
    /// Creates an invalid-configuration error.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
