//! Wide-column table backend.
//!
//! [`TableBackend`] stores one entity per key: the partition key is the
//! encoded key and the row key is fixed. Values are split into binary
//! properties `d_0`, `d_1`, … of at most [`CHUNK_SIZE`] bytes each and
//! reassembled in index order on read. Conflict detection uses the
//! service's own entity etags through the [`TableService`] seam.

mod memory;

#[cfg(feature = "azure-table")]
mod azure;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, info, instrument};

use cloudmap_core::codec;
use cloudmap_core::error::CloudMapError;
use cloudmap_core::storage::StorageBackend;
use cloudmap_core::types::{Etag, ProviderIdentity};
use cloudmap_core::Result;

#[cfg(feature = "azure-table")]
pub use azure::AzureTableService;
pub use memory::MemoryTableService;

/// Row key shared by every entity.
pub const ROW_KEY: &str = "cm";

/// Maximum size of a single binary property.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Number of chunk properties an entity may carry while staying under the
/// service's 1 MiB entity limit.
pub const MAX_CHUNKS: usize = 15;

/// Maximum size of a partition key.
pub const MAX_PARTITION_KEY_SIZE: usize = 1024;

const CHUNK_PREFIX: &str = "d_";

/// Errors returned by a [`TableService`].
#[derive(Error, Debug)]
pub enum TableError {
    #[error("Table or entity already exists")]
    AlreadyExists,

    #[error("Table or entity not found")]
    NotFound,

    #[error("The update condition specified in the request was not satisfied")]
    PreconditionFailed,

    #[error("The entity is larger than the service allows")]
    EntityTooLarge,

    #[error("Table service returned {status}: {code}: {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Table service request failed: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// A table entity with binary properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entity {
    pub partition_key: String,
    pub row_key: String,
    pub properties: BTreeMap<String, Bytes>,
    /// Set on entities read from the service.
    pub etag: Option<Etag>,
}

/// Partition-key range for queries: `start <= pk < end`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

/// Position to resume a paged query from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuation {
    pub next_partition_key: String,
    pub next_row_key: Option<String>,
}

/// One page of a key query.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub keys: Vec<(String, Etag)>,
    pub continuation: Option<Continuation>,
}

/// The operations a table service must offer.
#[async_trait]
pub trait TableService: Send + Sync {
    fn identity(&self) -> ProviderIdentity;

    /// Fails with [`TableError::AlreadyExists`] if the table exists.
    async fn create_table(&self) -> std::result::Result<(), TableError>;

    async fn get_entity(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> std::result::Result<Entity, TableError>;

    /// Fails with [`TableError::AlreadyExists`] if the entity exists.
    async fn insert_entity(&self, entity: &Entity) -> std::result::Result<Etag, TableError>;

    /// Replace an entity whose etag must equal `if_match`.
    async fn replace_entity(
        &self,
        entity: &Entity,
        if_match: &Etag,
    ) -> std::result::Result<Etag, TableError>;

    async fn delete_entity(
        &self,
        partition_key: &str,
        row_key: &str,
        if_match: &Etag,
    ) -> std::result::Result<(), TableError>;

    /// One page of `(partition key, etag)` pairs within `range`.
    async fn query_keys(
        &self,
        range: &PartitionRange,
        continuation: Option<&Continuation>,
    ) -> std::result::Result<QueryPage, TableError>;
}

/// A [`StorageBackend`] over a [`TableService`].
pub struct TableBackend {
    service: Arc<dyn TableService>,
}

impl TableBackend {
    pub fn new(service: Arc<dyn TableService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<dyn TableService> {
        &self.service
    }

    fn conflict(&self, key: &str, expected: Option<&Etag>) -> CloudMapError {
        CloudMapError::key_sync(self.service.identity().to_string(), key, expected)
    }

    fn value_size(&self, key: &str, size: usize) -> CloudMapError {
        CloudMapError::ValueSize {
            provider: self.service.identity().to_string(),
            key: key.to_string(),
            size,
        }
    }

    fn service_error(&self, operation: &str, key: &str, err: TableError) -> CloudMapError {
        CloudMapError::storage(format!("Table {operation} failed for {key}"), err)
    }
}

/// Split a payload into chunk properties.
pub fn chunk_bytes(data: &Bytes) -> BTreeMap<String, Bytes> {
    (0..data.len())
        .step_by(CHUNK_SIZE)
        .enumerate()
        .map(|(index, start)| {
            let end = (start + CHUNK_SIZE).min(data.len());
            (format!("{CHUNK_PREFIX}{index}"), data.slice(start..end))
        })
        .collect()
}

/// Reassemble chunk properties in index order, ignoring other properties.
pub fn dechunk_entity(entity: &Entity) -> Bytes {
    let mut chunks: Vec<(usize, &Bytes)> = entity
        .properties
        .iter()
        .filter_map(|(name, value)| {
            let index = name.strip_prefix(CHUNK_PREFIX)?.parse::<usize>().ok()?;
            Some((index, value))
        })
        .collect();
    chunks.sort_by_key(|(index, _)| *index);

    let mut data = BytesMut::with_capacity(chunks.iter().map(|(_, c)| c.len()).sum());
    for (_, chunk) in chunks {
        data.extend_from_slice(chunk);
    }
    data.freeze()
}

/// Exclusive upper bound of the keys starting with `prefix`.
///
/// Increments the last character that can be incremented, dropping any
/// after it. `None` means the range is unbounded above.
pub fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let next = (last as u32 + 1..=char::MAX as u32).find_map(char::from_u32);
        if let Some(next) = next {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

#[async_trait]
impl StorageBackend for TableBackend {
    fn identity(&self) -> ProviderIdentity {
        self.service.identity()
    }

    fn encode_key(&self, key: &str) -> Result<String> {
        let encoded = codec::encode_segment(key);
        if encoded.len() > MAX_PARTITION_KEY_SIZE {
            return Err(CloudMapError::usage(format!(
                "Encoded key is {} bytes, table keys are limited to {MAX_PARTITION_KEY_SIZE}",
                encoded.len()
            )));
        }
        Ok(encoded)
    }

    fn encode_prefix(&self, prefix: &str) -> Result<String> {
        Ok(codec::encode_segment(prefix))
    }

    #[instrument(skip(self))]
    async fn ensure_container(&self) -> Result<bool> {
        match self.service.create_table().await {
            Ok(()) => {
                info!(storage = %self.service.identity(), "Created table");
                Ok(false)
            }
            Err(TableError::AlreadyExists) => Ok(true),
            Err(e) => Err(CloudMapError::storage("Failed to create table", e)),
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn download(&self, key: &str, expected: Option<&Etag>) -> Result<Option<Bytes>> {
        let entity = match self.service.get_entity(key, ROW_KEY).await {
            Ok(entity) => entity,
            Err(TableError::NotFound) => {
                return match expected {
                    Some(_) => Err(self.conflict(key, expected)),
                    None => Ok(None),
                };
            }
            Err(e) => return Err(self.service_error("get", key, e)),
        };

        if let Some(expected) = expected {
            if entity.etag.as_ref() != Some(expected) {
                return Err(self.conflict(key, Some(expected)));
            }
        }
        Ok(Some(dechunk_entity(&entity)))
    }

    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn upload(&self, key: &str, expected: Option<&Etag>, data: Bytes) -> Result<Etag> {
        if data.len() > CHUNK_SIZE * MAX_CHUNKS {
            return Err(self.value_size(key, data.len()));
        }

        let entity = Entity {
            partition_key: key.to_string(),
            row_key: ROW_KEY.to_string(),
            properties: chunk_bytes(&data),
            etag: None,
        };
        let result = match expected {
            None => self.service.insert_entity(&entity).await,
            Some(etag) => self.service.replace_entity(&entity, etag).await,
        };

        match result {
            Ok(etag) => {
                debug!(chunks = entity.properties.len(), "Stored entity");
                Ok(etag)
            }
            Err(TableError::AlreadyExists)
            | Err(TableError::PreconditionFailed)
            | Err(TableError::NotFound) => Err(self.conflict(key, expected)),
            Err(TableError::EntityTooLarge) => Err(self.value_size(key, data.len())),
            Err(e) => Err(self.service_error("upload", key, e)),
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str, expected: &Etag) -> Result<()> {
        match self.service.delete_entity(key, ROW_KEY, expected).await {
            Ok(()) => Ok(()),
            Err(TableError::PreconditionFailed) | Err(TableError::NotFound) => {
                Err(self.conflict(key, Some(expected)))
            }
            Err(e) => Err(self.service_error("delete", key, e)),
        }
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: Option<&str>) -> Result<HashMap<String, Etag>> {
        let range = match prefix {
            None | Some("") => PartitionRange::default(),
            Some(p) => PartitionRange {
                start: Some(p.to_string()),
                end: prefix_upper_bound(p),
            },
        };

        let mut results = HashMap::new();
        let mut continuation = None;
        loop {
            let page = self
                .service
                .query_keys(&range, continuation.as_ref())
                .await
                .map_err(|e| CloudMapError::storage("Table query failed", e))?;
            results.extend(page.keys);
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        debug!(count = results.len(), "Listed keys");
        Ok(results)
    }
}
