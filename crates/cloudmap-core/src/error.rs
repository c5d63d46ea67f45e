//! Unified error types for cloudmap.
//!
//! All errors are represented by [`CloudMapError`], using `thiserror` for
//! ergonomic error definitions. The variants keep the conflict taxonomy
//! distinguishable: a caller can always tell "resync and retry"
//! ([`CloudMapError::KeySync`]) apart from "try a smaller value"
//! ([`CloudMapError::ValueSize`]) and from a plain storage failure.

use thiserror::Error;

use crate::types::Etag;

/// The unified error type for all cloudmap operations.
#[derive(Error, Debug)]
pub enum CloudMapError {
    /// A caller-side contract violation, detected without any network call.
    #[error("Usage error: {message}")]
    Usage {
        /// Description of the violated contract.
        message: String,
    },

    /// The mapping has no knowledge of the key.
    #[error("Key not found: {key}")]
    NotFound {
        /// The logical key that was requested.
        key: String,
    },

    /// The remote version of a key does not match the expected version.
    ///
    /// This is the optimistic-concurrency conflict. It is never retried
    /// internally; callers resolve it with an explicit `sync_with_cloud`.
    #[error(
        "Mapping is out of sync with cloud data. Cloud storage: '{provider}', key: '{key}', etag: '{}'",
        .etag.as_ref().map(Etag::as_str).unwrap_or("<none>")
    )]
    KeySync {
        /// Identity of the storage provider that rejected the operation.
        provider: String,
        /// The encoded storage key.
        key: String,
        /// The version the caller expected, if any.
        etag: Option<Etag>,
    },

    /// The storage provider rejected a value purely because of its size.
    #[error("Value is too big to fit in cloud. Cloud storage: '{provider}', key: '{key}', size: {size}")]
    ValueSize {
        /// Identity of the storage provider that rejected the value.
        provider: String,
        /// The encoded storage key.
        key: String,
        /// Size of the rejected payload in bytes.
        size: usize,
    },

    /// A storage operation failed for a reason outside the conflict taxonomy.
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable description of the failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A value could not be serialised or deserialised.
    #[error("Serialisation error: {message}")]
    Serialisation {
        /// Description of the failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid configuration was provided.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },
}

/// Coarse classification of a [`CloudMapError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`CloudMapError::Usage`].
    Usage,
    /// See [`CloudMapError::NotFound`].
    NotFound,
    /// See [`CloudMapError::KeySync`].
    Conflict,
    /// See [`CloudMapError::ValueSize`].
    SizeLimit,
    /// Storage, serialisation and configuration failures.
    Backend,
}

impl CloudMapError {
    /// Create a storage error from a message and source error.
    pub fn storage(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error from a message only.
    pub fn storage_msg(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a serialisation error from a message and source error.
    pub fn serialisation(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialisation {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a usage error.
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    /// Create a key sync (conflict) error.
    pub fn key_sync(provider: impl Into<String>, key: impl Into<String>, etag: Option<&Etag>) -> Self {
        Self::KeySync {
            provider: provider.into(),
            key: key.into(),
            etag: etag.cloned(),
        }
    }

    /// The coarse kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Usage { .. } => ErrorKind::Usage,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::KeySync { .. } => ErrorKind::Conflict,
            Self::ValueSize { .. } => ErrorKind::SizeLimit,
            Self::Storage { .. } | Self::Serialisation { .. } | Self::Config { .. } => {
                ErrorKind::Backend
            }
        }
    }

    /// True for optimistic-concurrency conflicts.
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// True when the mapping has no knowledge of the key.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// True when the value was rejected for its size.
    pub fn is_size_limit(&self) -> bool {
        self.kind() == ErrorKind::SizeLimit
    }

    /// True for local contract violations.
    pub fn is_usage(&self) -> bool {
        self.kind() == ErrorKind::Usage
    }
}
