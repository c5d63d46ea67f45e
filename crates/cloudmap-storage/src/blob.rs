//! Blob storage backend with native conditional requests.
//!
//! [`BlobBackend`] implements the [`StorageBackend`] trait on any
//! `object_store` implementation with conditional put and get: Azure Blob
//! Storage, Google Cloud Storage, and the in-process [`InMemory`] store.
//!
//! - "Expected nothing" writes use `PutMode::Create` (`If-None-Match: *`).
//! - Updates use `PutMode::Update` (`If-Match: <etag>`).
//! - Reads with an expected etag use `If-Match`.
//!
//! `object_store` has no conditional delete, so deletes compare the etag
//! from a `HEAD` request before deleting. A write landing between the two
//! calls is lost.
//!
//! Google Cloud Storage derives etags from content and conditions updates on
//! the object generation instead. Under [`Versioning::Generation`] the
//! generation is the version token: it is sent as the update condition and
//! compared client-side on reads.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, AttributeValue, Attributes, GetOptions, ObjectStore, PutMode, PutOptions,
    PutPayload, UpdateVersion,
};
use tracing::{debug, info, instrument};

use cloudmap_core::codec;
use cloudmap_core::error::CloudMapError;
use cloudmap_core::storage::StorageBackend;
use cloudmap_core::types::{Etag, ProviderIdentity};
use cloudmap_core::Result;

use crate::objects::{normalise_etag, ObjectRoot};

const OCTET_STREAM: &str = "application/octet-stream";

/// Which store-assigned value identifies a version of an object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Versioning {
    /// The etag, which changes on every write and is honoured by `If-Match`.
    #[default]
    ETag,
    /// The object generation. Conditional updates must name it.
    Generation,
}

/// A [`StorageBackend`] over an object store with conditional requests.
pub struct BlobBackend {
    objects: ObjectRoot,
    identity: ProviderIdentity,
    versioning: Versioning,
}

impl BlobBackend {
    /// Wrap an existing store. All keys live under `root`.
    pub fn new(store: Arc<dyn ObjectStore>, root: &str, identity: ProviderIdentity) -> Result<Self> {
        Ok(Self {
            objects: ObjectRoot::new(store, root)?,
            identity,
            versioning: Versioning::ETag,
        })
    }

    /// Use `versioning` to derive version tokens.
    pub fn with_versioning(mut self, versioning: Versioning) -> Self {
        self.versioning = versioning;
        self
    }

    pub fn versioning(&self) -> Versioning {
        self.versioning
    }

    /// A blob backend over a fresh in-process store.
    pub fn in_memory(name: &str) -> Self {
        Self {
            objects: ObjectRoot::unrooted(Arc::new(InMemory::new())),
            identity: ProviderIdentity::new("InMemory").with("Name", name),
            versioning: Versioning::ETag,
        }
    }

    /// Azure Blob Storage.
    ///
    /// Credentials are taken from the `AZURE_STORAGE_*` environment
    /// variables. With `use_emulator` the backend targets Azurite.
    pub fn azure(account: &str, container: &str, root: &str, use_emulator: bool) -> Result<Self> {
        let store = MicrosoftAzureBuilder::from_env()
            .with_account(account)
            .with_container_name(container)
            .with_use_emulator(use_emulator)
            .build()
            .map_err(|e| {
                CloudMapError::storage(
                    format!("Failed to create Azure Blob client for {account}/{container}"),
                    e,
                )
            })?;

        debug!(account = %account, container = %container, root = %root, "Azure blob backend initialised");
        Self::new(
            Arc::new(store),
            root,
            ProviderIdentity::new("AzureBlobStorage")
                .with("StorageAccountName", account)
                .with("ContainerName", container),
        )
    }

    /// Google Cloud Storage.
    ///
    /// Credentials are taken from `GOOGLE_SERVICE_ACCOUNT` and related
    /// environment variables. `project` only appears in the identity.
    /// Versions are object generations.
    pub fn gcs(project: &str, bucket: &str, root: &str) -> Result<Self> {
        let store = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(|e| {
                CloudMapError::storage(format!("Failed to create GCS client for {bucket}"), e)
            })?;

        debug!(project = %project, bucket = %bucket, root = %root, "GCS blob backend initialised");
        let backend = Self::new(
            Arc::new(store),
            root,
            ProviderIdentity::new("GoogleCloudStorage")
                .with("Project", project)
                .with("BucketName", bucket),
        )?;
        Ok(backend.with_versioning(Versioning::Generation))
    }

    fn conflict(&self, key: &str, expected: Option<&Etag>) -> CloudMapError {
        CloudMapError::key_sync(self.identity.to_string(), key, expected)
    }

    /// The version token for an object's etag and generation.
    fn token(&self, e_tag: Option<&str>, version: Option<&str>) -> Option<Etag> {
        match self.versioning {
            Versioning::ETag => e_tag.map(|e| Etag::new(normalise_etag(e))),
            Versioning::Generation => version.map(Etag::new),
        }
    }

    fn update_condition(&self, expected: &Etag) -> UpdateVersion {
        let token = Some(expected.as_str().to_string());
        match self.versioning {
            Versioning::ETag => UpdateVersion {
                e_tag: token,
                version: None,
            },
            Versioning::Generation => UpdateVersion {
                e_tag: None,
                version: token,
            },
        }
    }

    async fn current_token(&self, path: &ObjectPath) -> Result<Option<Etag>> {
        match self.objects.store().head(path).await {
            Ok(meta) => Ok(self.token(meta.e_tag.as_deref(), meta.version.as_deref())),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(CloudMapError::storage(format!("Head failed for {path}"), e)),
        }
    }
}

#[async_trait]
impl StorageBackend for BlobBackend {
    fn identity(&self) -> ProviderIdentity {
        self.identity.clone()
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
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        match self
            .objects
            .store()
            .put_opts(&path, PutPayload::from_static(b"cloudmap"), opts)
            .await
        {
            Ok(_) => {
                info!(storage = %self.identity, "Created container marker");
                Ok(false)
            }
            Err(object_store::Error::AlreadyExists { .. })
            | Err(object_store::Error::Precondition { .. }) => Ok(true),
            Err(e) => Err(CloudMapError::storage(
                format!("Failed to create container marker at {path}"),
                e,
            )),
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn download(&self, key: &str, expected: Option<&Etag>) -> Result<Option<Bytes>> {
        let path = self.objects.path_for(key)?;
        let if_match = match self.versioning {
            Versioning::ETag => expected.map(|e| e.as_str().to_string()),
            Versioning::Generation => None,
        };
        let opts = GetOptions {
            if_match,
            ..Default::default()
        };

        match self.objects.store().get_opts(&path, opts).await {
            Ok(result) => {
                if let (Versioning::Generation, Some(expected)) = (self.versioning, expected) {
                    let current =
                        self.token(result.meta.e_tag.as_deref(), result.meta.version.as_deref());
                    if current.as_ref() != Some(expected) {
                        return Err(self.conflict(key, Some(expected)));
                    }
                }
                let data = result
                    .bytes()
                    .await
                    .map_err(|e| CloudMapError::storage(format!("Read failed for {key}"), e))?;
                debug!(size = data.len(), "Downloaded value");
                Ok(Some(data))
            }
            Err(object_store::Error::NotFound { .. }) if expected.is_none() => Ok(None),
            Err(object_store::Error::NotFound { .. })
            | Err(object_store::Error::Precondition { .. }) => Err(self.conflict(key, expected)),
            Err(e) => Err(CloudMapError::storage(format!("Get failed for {key}"), e)),
        }
    }

    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn upload(&self, key: &str, expected: Option<&Etag>, data: Bytes) -> Result<Etag> {
        let path = self.objects.path_for(key)?;
        let mode = match expected {
            None => PutMode::Create,
            Some(etag) => PutMode::Update(self.update_condition(etag)),
        };
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, AttributeValue::from(OCTET_STREAM));
        let opts = PutOptions {
            mode,
            attributes,
            ..Default::default()
        };

        match self
            .objects
            .store()
            .put_opts(&path, PutPayload::from(data), opts)
            .await
        {
            Ok(result) => self
                .token(result.e_tag.as_deref(), result.version.as_deref())
                .ok_or_else(|| {
                    CloudMapError::storage_msg(format!(
                        "Store returned no {:?} version for {key}",
                        self.versioning
                    ))
                }),
            Err(object_store::Error::AlreadyExists { .. })
            | Err(object_store::Error::Precondition { .. })
            | Err(object_store::Error::NotFound { .. }) => Err(self.conflict(key, expected)),
            Err(e) => Err(CloudMapError::storage(format!("Put failed for {key}"), e)),
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str, expected: &Etag) -> Result<()> {
        let path = self.objects.path_for(key)?;
        if self.current_token(&path).await?.as_ref() != Some(expected) {
            return Err(self.conflict(key, Some(expected)));
        }

        self.objects
            .store()
            .delete(&path)
            .await
            .map_err(|e| CloudMapError::storage(format!("Delete failed for {key}"), e))
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: Option<&str>) -> Result<HashMap<String, Etag>> {
        let mut results = HashMap::new();
        for (key, meta) in self.objects.list(prefix).await? {
            let mut token = self.token(meta.e_tag.as_deref(), meta.version.as_deref());
            // Listings may omit generations; fetch them per object.
            if token.is_none() && self.versioning == Versioning::Generation {
                token = self.current_token(&meta.location).await?;
            }
            match token {
                Some(etag) => {
                    results.insert(key, etag);
                }
                None => debug!(key = %key, "Skipping object without a version"),
            }
        }
        debug!(count = results.len(), "Listed keys");
        Ok(results)
    }
}

#[cfg(test)]
#[path = "../tests/support/generation_store.rs"]
mod generation_store;
