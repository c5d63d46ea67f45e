//! cloudmap core types, traits, configuration, and errors.
//!
//! This crate provides the building blocks for etag-checked key-value
//! mappings over cloud storage: the [`StorageBackend`] trait every backend
//! implements, the key codecs, the version cache, value serialisation
//! strategies, and the [`CloudMapping`] facade that runs the optimistic
//! concurrency protocol on top of them.

pub mod codec;
pub mod config;
pub mod error;
pub mod etags;
pub mod mapping;
pub mod serialisation;
pub mod storage;
pub mod types;

pub use config::MappingConfig;
pub use error::{CloudMapError, ErrorKind};
pub use etags::EtagCache;
pub use mapping::{CloudMapping, CloudStorage};
pub use serialisation::{ByteTransform, Pipeline, Serialisation};
pub use storage::StorageBackend;
pub use types::*;

/// Convenience Result type using [`CloudMapError`].
pub type Result<T> = std::result::Result<T, CloudMapError>;
