//! Version tokens and provider identities.
//!
//! An [`Etag`] is an opaque newtype over `String`. Two etags are equal iff
//! the remote content generation they describe is identical; no ordering
//! is defined between them.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// An opaque version token minted by a storage backend on every write.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Etag(pub String);

impl Etag {
    /// Create an etag from a backend-provided string.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Mint a fresh client-side etag using UUID v4.
    ///
    /// Used by backends without a server-assigned version that changes on
    /// every write.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Return the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Etag {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Etag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A credential-free description of the remote resource a backend is bound to.
///
/// Renders as `CloudStorageProvider=<Kind>,<Attr>=<Value>,...`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderIdentity {
    provider: &'static str,
    attributes: Vec<(&'static str, String)>,
}

impl ProviderIdentity {
    /// Start an identity for the given provider kind.
    pub fn new(provider: &'static str) -> Self {
        Self {
            provider,
            attributes: Vec::new(),
        }
    }

    /// Append an attribute. Attributes render in insertion order.
    pub fn with(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.attributes.push((name, value.into()));
        self
    }

    /// The provider kind, e.g. `AzureBlobStorage`.
    pub fn provider(&self) -> &str {
        self.provider
    }
}

impl fmt::Display for ProviderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CloudStorageProvider={}", self.provider)?;
        for (name, value) in &self.attributes {
            write!(f, ",{name}={value}")?;
        }
        Ok(())
    }
}
