//! Error types for the knowledge-cache engine
//!
//! Record-level errors (`MalformedRecord`) are absorbed by the normalizer;
//! build and store errors propagate to `build_or_get_cache`; generation errors
//! propagate to `query` without touching the stored entry.

use thiserror::Error;

/// Main error type for cache-augmented generation
#[derive(Error, Debug)]
pub enum CagError {
    /// A raw event lacks a required field or carries an unusable value
    #[error("Malformed record: `{field}` {reason}")]
    MalformedRecord {
        field: &'static str,
        reason: String,
    },

    /// The knowledge cache could not be built; nothing was published
    #[error("Cache build error: {0}")]
    CacheBuild(String),

    /// A stored prefix state could not be restored; the entry must be rebuilt
    #[error("State corruption in cache entry {fingerprint}: {reason}")]
    StateCorruption { fingerprint: String, reason: String },

    /// The generation backend timed out before producing any output
    #[error("Generation timed out after {timeout_ms}ms")]
    GenerationTimeout { timeout_ms: u64 },

    /// The caller cancelled generation
    #[error("Generation cancelled")]
    Cancelled,

    /// Store lookup miss
    #[error("Cache entry not found: {0}")]
    NotFound(String),

    /// The query itself is unusable (e.g. empty question)
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Generation backend failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// Durable storage failure
    #[error("Persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

impl CagError {
    /// Whether the error means the cache entry itself is unusable
    pub fn requires_rebuild(&self) -> bool {
        matches!(self, CagError::StateCorruption { .. })
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, CagError>;

impl From<serde_json::Error> for CagError {
    fn from(e: serde_json::Error) -> Self {
        CagError::Serialization(e.to_string())
    }
}

impl From<String> for CagError {
    fn from(s: String) -> Self {
        CagError::Other(s)
    }
}

impl From<&str> for CagError {
    fn from(s: &str) -> Self {
        CagError::Other(s.to_string())
    }
}
