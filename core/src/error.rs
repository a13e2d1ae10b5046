use thiserror::Error;

/// Casket error types
#[derive(Error, Debug)]
pub enum CasketError {
    /// Blob or reference is absent from the store
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Stored bytes do not hash to the digest they are keyed by
    #[error("Digest mismatch for {expected}: content hashes to {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Descriptor media type is not one the engine can decode
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Reference resolves to more than one manifest
    #[error("Reference is ambiguous: {name} resolves to {count} manifests")]
    AmbiguousReference { name: String, count: usize },

    /// Operation is not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Reference name cannot be stored
    #[error("Invalid reference name: {0:?}")]
    InvalidReference(String),

    /// Digest string is malformed
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// Layer packaging or unpacking failed
    #[error("Layer error: {0}")]
    LayerError(String),

    /// I/O error with the operation and identifier it happened on
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CasketError {
    /// Wrap an I/O error with the operation that produced it.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CasketError::Io {
            context: context.into(),
            source,
        }
    }

    /// Build a `NotFound` for the given object kind and identifier.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CasketError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether this error reports a missing blob or reference.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CasketError::NotFound { .. })
    }
}

impl From<serde_json::Error> for CasketError {
    fn from(err: serde_json::Error) -> Self {
        CasketError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CasketError {
    fn from(err: serde_yaml::Error) -> Self {
        CasketError::SerializationError(err.to_string())
    }
}

/// Result type alias for casket operations
pub type Result<T> = std::result::Result<T, CasketError>;
