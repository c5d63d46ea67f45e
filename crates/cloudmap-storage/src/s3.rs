//! S3-compatible object storage backend with client-side conflict checks.
//!
//! [`S3Backend`] implements the [`StorageBackend`] trait for stores that
//! offer no conditional writes. Every write stores a client-minted UUID in
//! the object's user metadata (`cloudmap-etag`), and conditional
//! operations read that marker first and proceed only if it matches.
//!
//! The read and the write are separate requests. Two writers that both
//! pass the check before either writes will both succeed, and the later
//! write silently wins. A warning is logged when the backend is created
//! unless it is silenced.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, AttributeValue, Attributes, GetOptions, GetResult, ObjectStore, PutMode,
    PutOptions, PutPayload,
};
use tracing::{debug, info, instrument, warn};

use cloudmap_core::codec;
use cloudmap_core::error::CloudMapError;
use cloudmap_core::storage::StorageBackend;
use cloudmap_core::types::{Etag, ProviderIdentity};
use cloudmap_core::Result;

use crate::objects::{normalise_etag, ObjectRoot};

/// User metadata key holding the client-minted version.
pub const ETAG_METADATA_KEY: &str = "cloudmap-etag";

/// Connection options for [`S3Backend::new`].
#[derive(Debug, Clone, Default)]
pub struct S3Options {
    /// AWS region. Falls back to `AWS_REGION`.
    pub region: Option<String>,
    /// Custom endpoint for MinIO and other S3-compatible services.
    pub endpoint: Option<String>,
    /// Do not log the race-window warning.
    pub silence_warning: bool,
}

/// A [`StorageBackend`] backed by any S3-compatible object storage.
pub struct S3Backend {
    objects: ObjectRoot,
    bucket: String,
}

impl S3Backend {
    /// Connect to `bucket`, keeping all keys under `root`.
    ///
    /// Environment variables `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
    /// and `AWS_REGION` are used as fallbacks for credentials and region.
    pub fn new(bucket: &str, root: &str, options: S3Options) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);

        if let Some(region) = &options.region {
            builder = builder.with_region(region);
        }

        if let Some(endpoint) = &options.endpoint {
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }

        let store = builder.build().map_err(|e| {
            CloudMapError::storage(format!("Failed to create S3 client for {bucket}"), e)
        })?;

        debug!(bucket = %bucket, root = %root, "S3Backend initialised");
        Self::with_store(Arc::new(store), bucket, root, options.silence_warning)
    }

    /// Wrap an existing store, e.g. an in-process one for tests.
    pub fn with_store(
        store: Arc<dyn ObjectStore>,
        bucket: &str,
        root: &str,
        silence_warning: bool,
    ) -> Result<Self> {
        if !silence_warning {
            warn!(
                bucket = %bucket,
                "S3 does not support server-side conditional requests; concurrent writers may \
                 overwrite each other. Silence this warning with silence_warning=true."
            );
        }
        Ok(Self {
            objects: ObjectRoot::new(store, root)?,
            bucket: bucket.to_string(),
        })
    }

    fn conflict(&self, key: &str, expected: Option<&Etag>) -> CloudMapError {
        CloudMapError::key_sync(self.identity().to_string(), key, expected)
    }

    fn marker_attribute() -> Attribute {
        Attribute::Metadata(Cow::Borrowed(ETAG_METADATA_KEY))
    }

    /// The version recorded on a fetched object: its marker, or the
    /// store's own etag for objects written by other tools.
    fn version_of(result: &GetResult) -> Option<Etag> {
        match result.attributes.get(&Self::marker_attribute()) {
            Some(marker) => {
                let marker: &str = marker.as_ref();
                Some(Etag::new(marker))
            }
            None => result
                .meta
                .e_tag
                .as_deref()
                .map(|e| Etag::new(normalise_etag(e))),
        }
    }

    async fn fetch(&self, path: &ObjectPath, head: bool) -> Result<Option<GetResult>> {
        let opts = GetOptions {
            head,
            ..Default::default()
        };
        match self.objects.store().get_opts(path, opts).await {
            Ok(result) => Ok(Some(result)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(CloudMapError::storage(format!("S3 get failed for {path}"), e)),
        }
    }

    async fn current_version(&self, path: &ObjectPath) -> Result<Option<Etag>> {
        Ok(self
            .fetch(path, true)
            .await?
            .and_then(|result| Self::version_of(&result)))
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn identity(&self) -> ProviderIdentity {
        ProviderIdentity::new("AWSS3").with("BucketName", self.bucket.as_str())
    }

    fn encode_key(&self, key: &str) -> Result<String> {
        if key.is_empty() {
            return Err(CloudMapError::usage(
                "The empty key cannot be stored in object storage",
            ));
        }
        Ok(codec::encode_object_path(key, false))
    }

    fn encode_prefix(&self, prefix: &str) -> Result<String> {
        Ok(codec::encode_object_path(prefix, true))
    }

    #[instrument(skip(self))]
    async fn ensure_container(&self) -> Result<bool> {
        let path = self.objects.marker_path()?;
        if self.fetch(&path, true).await?.is_some() {
            return Ok(true);
        }
        self.objects
            .store()
            .put(&path, PutPayload::from_static(b"cloudmap"))
            .await
            .map_err(|e| {
                CloudMapError::storage(format!("Failed to create container marker at {path}"), e)
            })?;
        info!(bucket = %self.bucket, "Created container marker");
        Ok(false)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn download(&self, key: &str, expected: Option<&Etag>) -> Result<Option<Bytes>> {
        let path = self.objects.path_for(key)?;
        let Some(result) = self.fetch(&path, false).await? else {
            return match expected {
                Some(_) => Err(self.conflict(key, expected)),
                None => Ok(None),
            };
        };

        if let Some(expected) = expected {
            if Self::version_of(&result).as_ref() != Some(expected) {
                return Err(self.conflict(key, Some(expected)));
            }
        }

        let data = result
            .bytes()
            .await
            .map_err(|e| CloudMapError::storage(format!("S3 get bytes failed for {key}"), e))?;
        Ok(Some(data))
    }

    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn upload(&self, key: &str, expected: Option<&Etag>, data: Bytes) -> Result<Etag> {
        let path = self.objects.path_for(key)?;
        let current = self.current_version(&path).await?;
        if current.as_ref() != expected {
            return Err(self.conflict(key, expected));
        }

        let etag = Etag::generate();
        let mut attributes = Attributes::new();
        attributes.insert(
            Attribute::ContentType,
            AttributeValue::from("application/octet-stream"),
        );
        attributes.insert(
            Self::marker_attribute(),
            AttributeValue::from(etag.as_str().to_string()),
        );
        let opts = PutOptions {
            mode: PutMode::Overwrite,
            attributes,
            ..Default::default()
        };

        self.objects
            .store()
            .put_opts(&path, PutPayload::from(data), opts)
            .await
            .map_err(|e| CloudMapError::storage(format!("S3 put failed for {key}"), e))?;
        Ok(etag)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str, expected: &Etag) -> Result<()> {
        let path = self.objects.path_for(key)?;
        if self.current_version(&path).await?.as_ref() != Some(expected) {
            return Err(self.conflict(key, Some(expected)));
        }
        self.objects
            .store()
            .delete(&path)
            .await
            .map_err(|e| CloudMapError::storage(format!("S3 delete failed for {key}"), e))
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: Option<&str>) -> Result<HashMap<String, Etag>> {
        let mut results = HashMap::new();
        // Listings carry no user metadata, so each marker costs a HEAD.
        for (key, meta) in self.objects.list(prefix).await? {
            if let Some(etag) = self.current_version(&meta.location).await? {
                results.insert(key, etag);
            }
        }
        debug!(count = results.len(), "Listed keys");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn backend() -> S3Backend {
        S3Backend::with_store(Arc::new(InMemory::new()), "unit-bucket", "", true).unwrap()
    }

    #[tokio::test]
    async fn test_ensure_container_idempotent() {
        let backend = backend();
        assert!(!backend.ensure_container().await.unwrap());
        assert!(backend.ensure_container().await.unwrap());
        assert!(backend.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_marker_versions() {
        let backend = backend();
        let key = backend.encode_key("a/b").unwrap();

        let v1 = backend
            .upload(&key, None, Bytes::from_static(b"same"))
            .await
            .unwrap();
        let v2 = backend
            .upload(&key, Some(&v1), Bytes::from_static(b"same"))
            .await
            .unwrap();
        assert_ne!(v1, v2);

        assert!(backend
            .upload(&key, Some(&v1), Bytes::from_static(b"x"))
            .await
            .unwrap_err()
            .is_conflict());
        assert!(backend
            .upload(&key, None, Bytes::from_static(b"x"))
            .await
            .unwrap_err()
            .is_conflict());

        let listed = backend.list(None).await.unwrap();
        assert_eq!(listed.get(&key), Some(&v2));
    }

    #[tokio::test]
    async fn test_download_and_delete_check_marker() {
        let backend = backend();
        let key = backend.encode_key("k").unwrap();
        let v1 = backend
            .upload(&key, None, Bytes::from_static(b"data"))
            .await
            .unwrap();

        assert_eq!(
            backend.download(&key, Some(&v1)).await.unwrap(),
            Some(Bytes::from_static(b"data"))
        );
        let stale = Etag::generate();
        assert!(backend.download(&key, Some(&stale)).await.unwrap_err().is_conflict());
        assert!(backend.delete(&key, &stale).await.unwrap_err().is_conflict());

        backend.delete(&key, &v1).await.unwrap();
        assert_eq!(backend.download(&key, None).await.unwrap(), None);
        assert!(backend.download(&key, Some(&v1)).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_foreign_object_uses_store_etag() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let backend = S3Backend::with_store(Arc::clone(&store), "b", "", true).unwrap();
        let key = backend.encode_key("foreign").unwrap();
        store
            .put(&ObjectPath::parse(&key).unwrap(), PutPayload::from_static(b"raw"))
            .await
            .unwrap();

        let listed = backend.list(None).await.unwrap();
        let etag = listed.get(&key).cloned().unwrap();
        assert_eq!(
            backend.download(&key, Some(&etag)).await.unwrap(),
            Some(Bytes::from_static(b"raw"))
        );
    }

    #[test]
    fn test_identity() {
        assert_eq!(
            backend().identity().to_string(),
            "CloudStorageProvider=AWSS3,BucketName=unit-bucket"
        );
    }
}
