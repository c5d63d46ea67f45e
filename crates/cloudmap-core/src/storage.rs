//! The StorageBackend trait: the single interface between a mapping and
//! the remote service holding its values.
//!
//! Every backend translates the same create/read/update/delete/list
//! contract onto whatever conflict primitive its service offers:
//! conditional headers, row versions, or client-minted markers kept in
//! object metadata. Mappings never talk to a service directly.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::codec;
use crate::types::{Etag, ProviderIdentity};
use crate::Result;

/// The uniform, version-checked storage interface.
///
/// Keys passed to the async methods are already encoded with
/// [`encode_key`](StorageBackend::encode_key). Implementations must be
/// `Send + Sync` so a single backend can be shared between mappings.
///
/// # Conflicts
///
/// Every conditional operation fails with
/// [`CloudMapError::KeySync`](crate::CloudMapError::KeySync) when the
/// remote version differs from the expected one, including the cases
/// "expected nothing, found a value" and "expected a version, found
/// nothing". Backends never retry.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Credential-free description of the bound remote resource.
    fn identity(&self) -> ProviderIdentity;

    /// Encode a logical key into this backend's key space.
    fn encode_key(&self, key: &str) -> Result<String> {
        Ok(codec::encode_key(key))
    }

    /// Encode a logical key prefix for use with [`list`](StorageBackend::list).
    ///
    /// Every key starting with `prefix` must be returned by a listing
    /// against the encoded prefix.
    fn encode_prefix(&self, prefix: &str) -> Result<String> {
        self.encode_key(prefix)
    }

    /// Decode a key returned by [`list`](StorageBackend::list).
    fn decode_key(&self, encoded: &str) -> Result<String> {
        codec::decode_key(encoded)
    }

    /// Idempotently create the top-level resource (container, table, bucket root).
    ///
    /// Returns `true` if it already existed and `false` if this call created it.
    async fn ensure_container(&self) -> Result<bool>;

    /// Read a value.
    ///
    /// Without `expected`, returns the latest value or `None`. With
    /// `expected`, succeeds only if the remote version equals it.
    async fn download(&self, key: &str, expected: Option<&Etag>) -> Result<Option<Bytes>>;

    /// Write a value and return its new version.
    ///
    /// Without `expected`, the caller asserts that no value exists yet.
    /// The returned etag differs from every earlier one for this key, even
    /// for identical payloads.
    async fn upload(&self, key: &str, expected: Option<&Etag>, data: Bytes) -> Result<Etag>;

    /// Delete a value whose remote version must equal `expected`.
    async fn delete(&self, key: &str, expected: &Etag) -> Result<()>;

    /// List encoded keys with their current versions.
    ///
    /// With `prefix` (already encoded with
    /// [`encode_prefix`](StorageBackend::encode_prefix)) only keys whose
    /// logical form starts with the prefix's logical form are returned.
    /// Multi-page results are merged into one snapshot; backend
    /// pseudo-entries are never included.
    async fn list(&self, prefix: Option<&str>) -> Result<HashMap<String, Etag>>;
}
