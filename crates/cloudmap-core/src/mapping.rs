//! The mapping facade.
//!
//! A [`CloudMapping`] is a key-value view over a [`StorageBackend`] that
//! detects conflicting writes with etags. It keeps a private cache of the
//! last etag it observed for every key; every remote read, write and
//! delete is conditional on that etag. A key moves from unknown to known
//! only through a successful [`set`](CloudMapping::set) or through
//! [`sync_with_cloud`](CloudMapping::sync_with_cloud).
//!
//! Conflicts are never retried here. A caller that receives
//! [`CloudMapError::KeySync`] decides whether to resynchronise and retry.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::MappingConfig;
use crate::error::CloudMapError;
use crate::etags::EtagCache;
use crate::serialisation::Serialisation;
use crate::storage::StorageBackend;
use crate::types::ProviderIdentity;
use crate::Result;

/// Entry point that binds a backend and creates mappings over it.
#[derive(Clone)]
pub struct CloudStorage {
    storage: Arc<dyn StorageBackend>,
}

impl CloudStorage {
    /// Bind `storage`. No requests are made until a mapping is created.
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// The underlying backend, for direct access or for building further mappings.
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Create a mapping over this storage.
    ///
    /// Ensures the container exists. If it already existed and
    /// `config.sync_initially` is set, the new mapping is synchronised with
    /// every key under its prefix before being returned.
    pub async fn create_mapping<T>(
        &self,
        config: MappingConfig,
        serialisation: impl Serialisation<T> + 'static,
    ) -> Result<CloudMapping<T>> {
        let existed = self.storage.ensure_container().await?;
        if !existed {
            info!(storage = %self.storage.identity(), "Created storage container");
        }

        let mut mapping = CloudMapping {
            storage: Arc::clone(&self.storage),
            etags: EtagCache::new(),
            serialisation: Arc::new(serialisation),
            key_prefix: config.key_prefix,
            read_blindly: config.read_blindly,
            read_blindly_error: config.read_blindly_error,
            read_blindly_default: None,
        };

        if existed && config.sync_initially {
            mapping.sync_with_cloud(None).await?;
        }
        Ok(mapping)
    }
}

/// An etag-checked key-value mapping over cloud storage.
pub struct CloudMapping<T> {
    storage: Arc<dyn StorageBackend>,
    etags: EtagCache,
    serialisation: Arc<dyn Serialisation<T>>,
    key_prefix: Option<String>,
    read_blindly: bool,
    read_blindly_error: bool,
    read_blindly_default: Option<T>,
}

impl<T> CloudMapping<T> {
    /// Read the value at `key`.
    ///
    /// With blind reads off, the key must be known and the remote value
    /// must still carry the cached etag. With blind reads on, the latest
    /// remote value is returned; a missing value yields the configured
    /// default, or `NotFound` when `read_blindly_error` is set.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get(&self, key: &str) -> Result<Option<T>>
    where
        T: Clone,
    {
        let encoded = self.encode(key)?;

        if self.read_blindly {
            return match self.storage.download(&encoded, None).await? {
                Some(data) => self.serialisation.loads(data).map(Some),
                None if self.read_blindly_error => Err(not_found(key)),
                None => {
                    debug!("No remote value, returning blind read default");
                    Ok(self.read_blindly_default.clone())
                }
            };
        }

        let etag = self.etags.get(key).ok_or_else(|| not_found(key))?;
        match self.storage.download(&encoded, Some(etag)).await {
            Ok(Some(data)) => self.serialisation.loads(data).map(Some),
            Ok(None) => Err(CloudMapError::key_sync(
                self.storage.identity().to_string(),
                encoded,
                Some(etag),
            )),
            Err(e) => {
                if e.is_conflict() {
                    warn!(error = %e, "Conditional read rejected");
                }
                Err(e)
            }
        }
    }

    /// Write `value` at `key`.
    ///
    /// An unknown key is created and fails if a remote value already
    /// exists; a known key is replaced only if its remote etag is unchanged.
    #[instrument(skip(self, value), fields(key = %key))]
    pub async fn set(&mut self, key: &str, value: &T) -> Result<()> {
        let data = self.serialisation.dumps(value)?;
        let encoded = self.encode(key)?;
        let size = data.len();

        let etag = self
            .storage
            .upload(&encoded, self.etags.get(key), data)
            .await
            .inspect_err(|e| {
                if e.is_conflict() {
                    warn!(error = %e, "Conditional write rejected");
                }
            })?;

        debug!(size, etag = %etag, "Stored value");
        self.etags.insert(key, etag);
        Ok(())
    }

    /// Delete the value at `key`, which must be known and unchanged remotely.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn delete(&mut self, key: &str) -> Result<()> {
        let etag = self.etags.get(key).ok_or_else(|| not_found(key))?;
        let encoded = self.encode(key)?;

        self.storage
            .delete(&encoded, etag)
            .await
            .inspect_err(|e| {
                if e.is_conflict() {
                    warn!(error = %e, "Conditional delete rejected");
                }
            })?;

        self.etags.remove(key);
        debug!("Deleted value");
        Ok(())
    }

    /// Whether `key` is present.
    ///
    /// Answers from the etag cache unless blind reads are on, in which case
    /// the backend is asked for the latest value.
    pub async fn contains(&self, key: &str) -> Result<bool> {
        if !self.read_blindly {
            return Ok(self.etags.contains(key));
        }
        let encoded = self.encode(key)?;
        Ok(self.storage.download(&encoded, None).await?.is_some())
    }

    /// Known keys, in arbitrary order. Never touches the network.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.etags.keys()
    }

    /// Number of known keys.
    pub fn len(&self) -> usize {
        self.etags.len()
    }

    /// Whether no keys are known.
    pub fn is_empty(&self) -> bool {
        self.etags.is_empty()
    }

    /// Refresh the etag cache from the backend.
    ///
    /// Lists every key under the mapping's key prefix followed by `prefix`
    /// and records its current etag. Keys that are no longer listed are
    /// kept; the merge is additive. Returns the number of keys listed.
    #[instrument(skip(self))]
    pub async fn sync_with_cloud(&mut self, prefix: Option<&str>) -> Result<usize> {
        let full_prefix = match (&self.key_prefix, prefix) {
            (None, None) => None,
            (Some(base), None) => Some(base.clone()),
            (None, Some(p)) => Some(p.to_string()),
            (Some(base), Some(p)) => Some(format!("{base}{p}")),
        };

        let encoded_prefix = full_prefix
            .as_deref()
            .map(|p| self.storage.encode_prefix(p))
            .transpose()?;
        let listing = self.storage.list(encoded_prefix.as_deref()).await?;

        let mut synced = Vec::with_capacity(listing.len());
        for (encoded, etag) in listing {
            let decoded = self.storage.decode_key(&encoded)?;
            if let Some(p) = &full_prefix {
                if !decoded.starts_with(p.as_str()) {
                    continue;
                }
            }
            let logical = match &self.key_prefix {
                Some(base) => match decoded.strip_prefix(base.as_str()) {
                    Some(rest) => rest.to_string(),
                    None => continue,
                },
                None => decoded,
            };
            synced.push((logical, etag));
        }

        let count = synced.len();
        self.etags.merge(synced);
        debug!(count, "Synchronised with cloud");
        Ok(count)
    }

    /// The etag cache: known keys and their last observed versions.
    pub fn etags(&self) -> &EtagCache {
        &self.etags
    }

    /// Prefix prepended to every key before it reaches the backend.
    pub fn key_prefix(&self) -> Option<&str> {
        self.key_prefix.as_deref()
    }

    /// The backend this mapping reads and writes through.
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Identity of the bound backend.
    pub fn identity(&self) -> ProviderIdentity {
        self.storage.identity()
    }

    /// Whether reads of unknown keys go to the backend.
    pub fn read_blindly(&self) -> bool {
        self.read_blindly
    }

    /// Enable or disable backend reads of keys missing from the etag cache.
    pub fn set_read_blindly(&mut self, read_blindly: bool) {
        self.read_blindly = read_blindly;
    }

    /// Whether a blind read of a missing key is an error.
    pub fn read_blindly_error(&self) -> bool {
        self.read_blindly_error
    }

    /// Choose whether blind reads of missing keys fail with a not-found error.
    pub fn set_read_blindly_error(&mut self, error: bool) {
        self.read_blindly_error = error;
    }

    /// Value returned by blind reads of missing keys, if any.
    pub fn read_blindly_default(&self) -> Option<&T> {
        self.read_blindly_default.as_ref()
    }

    /// Value returned by blind reads of missing keys. `None` means "no value".
    pub fn set_read_blindly_default(&mut self, default: Option<T>) {
        self.read_blindly_default = default;
    }

    /// Builder form of [`set_read_blindly_default`](Self::set_read_blindly_default).
    pub fn with_read_blindly_default(mut self, default: T) -> Self {
        self.read_blindly_default = Some(default);
        self
    }

    fn encode(&self, key: &str) -> Result<String> {
        match &self.key_prefix {
            Some(prefix) => self.storage.encode_key(&format!("{prefix}{key}")),
            None => self.storage.encode_key(key),
        }
    }
}

impl<T> fmt::Display for CloudMapping<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cloudmapping<{}>", self.storage.identity())
    }
}

impl<T> fmt::Debug for CloudMapping<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudMapping")
            .field("storage", &self.storage.identity().to_string())
            .field("key_prefix", &self.key_prefix)
            .field("known_keys", &self.etags.len())
            .field("read_blindly", &self.read_blindly)
            .field("read_blindly_error", &self.read_blindly_error)
            .finish()
    }
}

fn not_found(key: &str) -> CloudMapError {
    CloudMapError::NotFound {
        key: key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialisation::{raw_bytes, raw_string};
    use crate::types::Etag;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    // Simple in-memory storage backend for testing
    struct MemoryBackend {
        data: Mutex<HashMap<String, (Bytes, Etag)>>,
        created: AtomicBool,
        counter: AtomicU64,
    }

    impl MemoryBackend {
        fn new() -> Self {
            Self {
                data: Mutex::new(HashMap::new()),
                created: AtomicBool::new(false),
                counter: AtomicU64::new(0),
            }
        }

        fn next_etag(&self) -> Etag {
            Etag::new(self.counter.fetch_add(1, Ordering::SeqCst).to_string())
        }

        fn conflict(&self, key: &str, expected: Option<&Etag>) -> CloudMapError {
            CloudMapError::key_sync(self.identity().to_string(), key, expected)
        }
    }

    #[async_trait]
    impl StorageBackend for MemoryBackend {
        fn identity(&self) -> ProviderIdentity {
            ProviderIdentity::new("InMemory").with("Name", "unit")
        }

        async fn ensure_container(&self) -> Result<bool> {
            Ok(self.created.swap(true, Ordering::SeqCst))
        }

        async fn download(&self, key: &str, expected: Option<&Etag>) -> Result<Option<Bytes>> {
            let data = self.data.lock().unwrap();
            match (data.get(key), expected) {
                (None, None) => Ok(None),
                (Some((bytes, _)), None) => Ok(Some(bytes.clone())),
                (Some((bytes, etag)), Some(e)) if etag == e => Ok(Some(bytes.clone())),
                _ => Err(self.conflict(key, expected)),
            }
        }

        async fn upload(&self, key: &str, expected: Option<&Etag>, bytes: Bytes) -> Result<Etag> {
            let mut data = self.data.lock().unwrap();
            let current = data.get(key).map(|(_, etag)| etag);
            if current != expected {
                return Err(self.conflict(key, expected));
            }
            let etag = self.next_etag();
            data.insert(key.to_string(), (bytes, etag.clone()));
            Ok(etag)
        }

        async fn delete(&self, key: &str, expected: &Etag) -> Result<()> {
            let mut data = self.data.lock().unwrap();
            match data.get(key) {
                Some((_, etag)) if etag == expected => {
                    data.remove(key);
                    Ok(())
                }
                _ => Err(self.conflict(key, Some(expected))),
            }
        }

        async fn list(&self, prefix: Option<&str>) -> Result<HashMap<String, Etag>> {
            let data = self.data.lock().unwrap();
            Ok(data
                .iter()
                .filter(|(k, _)| prefix.map_or(true, |p| k.starts_with(p)))
                .map(|(k, (_, etag))| (k.clone(), etag.clone()))
                .collect())
        }
    }

    fn storage() -> CloudStorage {
        CloudStorage::new(Arc::new(MemoryBackend::new()))
    }

    async fn string_mapping(storage: &CloudStorage) -> CloudMapping<String> {
        storage
            .create_mapping(MappingConfig::default(), raw_string())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let storage = storage();
        let mut cm = string_mapping(&storage).await;

        cm.set("key-A", &"100".to_string()).await.unwrap();
        cm.set("key-a", &"uncapitalised".to_string()).await.unwrap();

        assert_eq!(cm.get("key-A").await.unwrap().as_deref(), Some("100"));
        assert_eq!(cm.get("key-a").await.unwrap().as_deref(), Some("uncapitalised"));
        assert_eq!(cm.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_key_errors() {
        let storage = storage();
        let mut cm = string_mapping(&storage).await;

        assert!(cm.get("missing").await.unwrap_err().is_not_found());
        assert!(cm.delete("missing").await.unwrap_err().is_not_found());
        assert!(!cm.contains("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_overwrite_updates_etag() {
        let storage = storage();
        let mut cm = string_mapping(&storage).await;

        cm.set("k", &"same".to_string()).await.unwrap();
        let first = cm.etags().get("k").cloned().unwrap();
        cm.set("k", &"same".to_string()).await.unwrap();
        let second = cm.etags().get("k").cloned().unwrap();

        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_stale_writer_conflicts() {
        let storage = storage();
        let mut cm1 = string_mapping(&storage).await;
        let mut cm2 = string_mapping(&storage).await;

        cm1.set("shared", &"from-1".to_string()).await.unwrap();

        assert!(cm2.set("shared", &"from-2".to_string()).await.unwrap_err().is_conflict());
        assert!(cm2.get("shared").await.unwrap_err().is_not_found());
        assert!(cm2.delete("shared").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_external_change_conflicts_until_sync() {
        let storage = storage();
        let mut cm1 = string_mapping(&storage).await;
        let mut cm2 = string_mapping(&storage).await;

        cm1.set("k", &"v1".to_string()).await.unwrap();
        cm2.sync_with_cloud(None).await.unwrap();
        cm2.set("k", &"v2".to_string()).await.unwrap();

        assert!(cm1.get("k").await.unwrap_err().is_conflict());
        assert!(cm1.set("k", &"v3".to_string()).await.unwrap_err().is_conflict());
        assert!(cm1.delete("k").await.unwrap_err().is_conflict());

        cm1.sync_with_cloud(None).await.unwrap();
        assert_eq!(cm1.get("k").await.unwrap().as_deref(), Some("v2"));
        cm1.set("k", &"v3".to_string()).await.unwrap();
        cm1.delete("k").await.unwrap();
        assert!(!cm1.contains("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_removes_membership() {
        let storage = storage();
        let mut cm = string_mapping(&storage).await;

        cm.set("gone", &"x".to_string()).await.unwrap();
        assert!(cm.contains("gone").await.unwrap());
        cm.delete("gone").await.unwrap();

        assert!(!cm.contains("gone").await.unwrap());
        assert!(cm.get("gone").await.unwrap_err().is_not_found());
        assert!(cm.is_empty());
    }

    #[tokio::test]
    async fn test_sync_is_additive() {
        let storage = storage();
        let mut cm1 = string_mapping(&storage).await;
        let mut cm2 = string_mapping(&storage).await;

        cm1.set("k", &"v".to_string()).await.unwrap();
        cm2.sync_with_cloud(None).await.unwrap();
        cm1.delete("k").await.unwrap();

        cm2.sync_with_cloud(None).await.unwrap();
        assert!(cm2.contains("k").await.unwrap());
        assert!(cm2.get("k").await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_sync_initially_only_when_container_existed() {
        let storage = storage();
        let mut first = string_mapping(&storage).await;
        first.set("existing", &"v".to_string()).await.unwrap();

        let second = string_mapping(&storage).await;
        assert!(second.contains("existing").await.unwrap());

        let third = storage
            .create_mapping(MappingConfig::default().with_sync_initially(false), raw_string())
            .await
            .unwrap();
        assert!(third.is_empty());
    }

    #[tokio::test]
    async fn test_key_prefix_scoping() {
        let storage = storage();
        let config = MappingConfig::default().with_key_prefix("tenant-1/");
        let mut scoped = storage
            .create_mapping(config.clone(), raw_string())
            .await
            .unwrap();
        scoped.set("a", &"1".to_string()).await.unwrap();

        let mut root = string_mapping(&storage).await;
        root.set("tenant-2/b", &"2".to_string()).await.unwrap();
        root.sync_with_cloud(None).await.unwrap();
        assert!(root.contains("tenant-1/a").await.unwrap());

        let mut other = storage.create_mapping(config, raw_string()).await.unwrap();
        other.sync_with_cloud(None).await.unwrap();
        let keys: Vec<&str> = other.keys().collect();
        assert_eq!(keys, vec!["a"]);
        assert_eq!(other.key_prefix(), Some("tenant-1/"));
        assert_eq!(other.get("a").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_sync_with_prefix() {
        let storage = storage();
        let mut cm1 = string_mapping(&storage).await;
        for key in ["p/a", "p/b/c", "q/a"] {
            cm1.set(key, &key.to_string()).await.unwrap();
        }

        let mut cm2 = storage
            .create_mapping(MappingConfig::default().with_sync_initially(false), raw_string())
            .await
            .unwrap();
        assert_eq!(cm2.sync_with_cloud(Some("p/b/")).await.unwrap(), 1);
        assert!(cm2.contains("p/b/c").await.unwrap());
        assert!(!cm2.contains("p/a").await.unwrap());
    }

    #[tokio::test]
    async fn test_read_blindly_default() {
        let storage = storage();
        let mut writer = string_mapping(&storage).await;
        writer.set("present", &"here".to_string()).await.unwrap();

        let config = MappingConfig::default()
            .with_sync_initially(false)
            .with_read_blindly(true);
        let mut reader = storage
            .create_mapping(config, raw_string())
            .await
            .unwrap()
            .with_read_blindly_default("fallback".to_string());
        assert!(reader.read_blindly());
        assert!(!reader.read_blindly_error());
        assert_eq!(reader.read_blindly_default().map(String::as_str), Some("fallback"));
        assert!(reader.is_empty());

        assert_eq!(reader.get("present").await.unwrap().as_deref(), Some("here"));
        assert_eq!(reader.get("absent").await.unwrap().as_deref(), Some("fallback"));
        assert!(reader.contains("present").await.unwrap());
        assert!(!reader.contains("absent").await.unwrap());

        reader.set_read_blindly_default(None);
        assert_eq!(reader.get("absent").await.unwrap(), None);

        reader.set_read_blindly_error(true);
        assert!(reader.read_blindly_error());
        assert!(reader.get("absent").await.unwrap_err().is_not_found());

        reader.set_read_blindly(false);
        assert!(!reader.read_blindly());
        assert!(reader.get("present").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_read_blindly_ignores_stale_cache() {
        let storage = storage();
        let mut cm1 = string_mapping(&storage).await;
        let mut cm2 = string_mapping(&storage).await;

        cm1.set("k", &"v1".to_string()).await.unwrap();
        cm2.sync_with_cloud(None).await.unwrap();
        cm2.set("k", &"v2".to_string()).await.unwrap();

        cm1.set_read_blindly(true);
        assert_eq!(cm1.get("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_raw_bytes_mapping() {
        let storage = storage();
        let mut cm = storage
            .create_mapping(MappingConfig::default(), raw_bytes())
            .await
            .unwrap();
        let data = Bytes::from_static(b"\x00binary\xff");
        cm.set("bin", &data).await.unwrap();
        assert_eq!(cm.get("bin").await.unwrap(), Some(data));
    }

    #[tokio::test]
    async fn test_display() {
        let storage = storage();
        let cm = string_mapping(&storage).await;
        assert_eq!(
            cm.to_string(),
            "cloudmapping<CloudStorageProvider=InMemory,Name=unit>"
        );
    }
}
