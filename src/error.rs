//! Error types for distconfig.

use crate::core::ValueKind;

/// Result type alias for distconfig operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Error type returned by listener callbacks.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur when working with configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A configuration tree was built from something that is not a mapping.
    #[error("Need a mapping-like value, instead got {0}")]
    InvalidInput(ValueKind),

    /// Path traversal hit a missing key or a non-mapping intermediate value.
    #[error("No key '{key}' under path '{path}'")]
    KeyNotFound {
        /// The key that could not be resolved
        key: String,
        /// The keys traversed before it, joined with `.`
        path: String,
    },

    /// The resolved value does not have the requested type.
    #[error("Value at '{path}' is {found}, expected {expected}")]
    TypeMismatch {
        /// The requested path
        path: String,
        /// The requested type
        expected: ValueKind,
        /// The type actually found
        found: ValueKind,
    },

    /// A raw backend payload could not be decoded.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Attempted to remove a listener that is not registered.
    #[error("Listener is not registered")]
    ListenerNotFound,

    /// One or more listeners failed during a broadcast.
    ///
    /// Every listener ran; `source` is the last failure observed.
    #[error("{failures} listener(s) failed while notifying changes of '{key}'")]
    ListenerFailed {
        /// The key whose change was being broadcast
        key: String,
        /// Number of listeners that failed
        failures: usize,
        /// The last failure
        #[source]
        source: ListenerError,
    },

    /// Reading a value from the backend failed.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Waiting for a remote change failed. Watch loops log it and retry.
    #[error("Watch error: {0}")]
    WatchError(String),

    /// Failed to load proxy settings.
    #[error("Failed to load settings: {0}")]
    LoadError(String),

    /// Failed to deserialize configuration into a typed value.
    #[error("Failed to deserialize configuration: {0}")]
    DeserializationError(String),

    /// Attempted to use a feature that is not enabled.
    #[error("Feature not enabled: {0}")]
    FeatureNotEnabled(&'static str),

    /// IO error occurred.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error for other cases.
    #[error("Configuration error: {0}")]
    Other(String),
}

impl ConfigError {
    /// Whether this error reports a missing path.
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound { .. })
    }

    /// Whether this error reports a type mismatch.
    pub fn is_type_mismatch(&self) -> bool {
        matches!(self, Self::TypeMismatch { .. })
    }
}
