//! In-process table service.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;

use cloudmap_core::types::{Etag, ProviderIdentity};

use super::{Continuation, Entity, PartitionRange, QueryPage, TableError, TableService};

const DEFAULT_PAGE_SIZE: usize = 1000;
const DEFAULT_MAX_ENTITY_SIZE: usize = 1024 * 1024;

#[derive(Debug, Default)]
struct MemoryTable {
    created: bool,
    rows: BTreeMap<(String, String), (BTreeMap<String, Bytes>, Etag)>,
    generation: u64,
}

impl MemoryTable {
    fn next_etag(&mut self) -> Etag {
        self.generation += 1;
        Etag::new(format!("W/\"{}\"", self.generation))
    }
}

/// A single table held in memory, with the service's conditional
/// semantics, paging and entity size limit.
///
/// Shared between backends through `Arc` to model several clients of one
/// table.
#[derive(Debug)]
pub struct MemoryTableService {
    account: String,
    table: String,
    page_size: usize,
    max_entity_size: usize,
    state: Mutex<MemoryTable>,
}

impl MemoryTableService {
    pub fn new(account: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            table: table.into(),
            page_size: DEFAULT_PAGE_SIZE,
            max_entity_size: DEFAULT_MAX_ENTITY_SIZE,
            state: Mutex::new(MemoryTable::default()),
        }
    }

    /// Maximum number of keys per query page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Maximum total property size per entity.
    pub fn with_max_entity_size(mut self, size: usize) -> Self {
        self.max_entity_size = size;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryTable> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn existing_table(&self) -> Result<MutexGuard<'_, MemoryTable>, TableError> {
        let table = self.lock();
        if !table.created {
            return Err(TableError::NotFound);
        }
        Ok(table)
    }

    fn check_size(&self, entity: &Entity) -> Result<(), TableError> {
        let size: usize = entity
            .properties
            .iter()
            .map(|(name, value)| name.len() + value.len())
            .sum();
        if size > self.max_entity_size {
            return Err(TableError::EntityTooLarge);
        }
        Ok(())
    }
}

fn row_id(partition_key: &str, row_key: &str) -> (String, String) {
    (partition_key.to_string(), row_key.to_string())
}

#[async_trait]
impl TableService for MemoryTableService {
    fn identity(&self) -> ProviderIdentity {
        ProviderIdentity::new("InMemoryTable")
            .with("StorageAccountName", self.account.as_str())
            .with("TableName", self.table.as_str())
    }

    async fn create_table(&self) -> Result<(), TableError> {
        let mut table = self.lock();
        if table.created {
            return Err(TableError::AlreadyExists);
        }
        table.created = true;
        Ok(())
    }

    async fn get_entity(&self, partition_key: &str, row_key: &str) -> Result<Entity, TableError> {
        let table = self.existing_table()?;
        let (properties, etag) = table
            .rows
            .get(&row_id(partition_key, row_key))
            .ok_or(TableError::NotFound)?;
        Ok(Entity {
            partition_key: partition_key.to_string(),
            row_key: row_key.to_string(),
            properties: properties.clone(),
            etag: Some(etag.clone()),
        })
    }

    async fn insert_entity(&self, entity: &Entity) -> Result<Etag, TableError> {
        self.check_size(entity)?;
        let mut table = self.existing_table()?;
        let id = row_id(&entity.partition_key, &entity.row_key);
        if table.rows.contains_key(&id) {
            return Err(TableError::AlreadyExists);
        }
        let etag = table.next_etag();
        table
            .rows
            .insert(id, (entity.properties.clone(), etag.clone()));
        Ok(etag)
    }

    async fn replace_entity(&self, entity: &Entity, if_match: &Etag) -> Result<Etag, TableError> {
        self.check_size(entity)?;
        let mut table = self.existing_table()?;
        let id = row_id(&entity.partition_key, &entity.row_key);
        let current = table.rows.get(&id).map(|(_, etag)| etag.clone());
        match current {
            None => return Err(TableError::NotFound),
            Some(current) if &current != if_match => return Err(TableError::PreconditionFailed),
            Some(_) => {}
        }
        let etag = table.next_etag();
        table
            .rows
            .insert(id, (entity.properties.clone(), etag.clone()));
        Ok(etag)
    }

    async fn delete_entity(
        &self,
        partition_key: &str,
        row_key: &str,
        if_match: &Etag,
    ) -> Result<(), TableError> {
        let mut table = self.existing_table()?;
        let id = row_id(partition_key, row_key);
        let current = table.rows.get(&id).map(|(_, etag)| etag.clone());
        match current {
            None => Err(TableError::NotFound),
            Some(current) if &current != if_match => Err(TableError::PreconditionFailed),
            Some(_) => {
                table.rows.remove(&id);
                Ok(())
            }
        }
    }

    async fn query_keys(
        &self,
        range: &PartitionRange,
        continuation: Option<&Continuation>,
    ) -> Result<QueryPage, TableError> {
        let table = self.existing_table()?;

        let lower = match (continuation, &range.start) {
            (Some(c), _) => Bound::Included(row_id(
                &c.next_partition_key,
                c.next_row_key.as_deref().unwrap_or(""),
            )),
            (None, Some(start)) => Bound::Included(row_id(start, "")),
            (None, None) => Bound::Unbounded,
        };

        let rows = table
            .rows
            .range((lower, Bound::Unbounded))
            .take_while(|((pk, _), _)| range.end.as_ref().map_or(true, |end| pk < end));

        let mut page = QueryPage::default();
        for ((pk, rk), (_, etag)) in rows {
            if page.keys.len() == self.page_size {
                page.continuation = Some(Continuation {
                    next_partition_key: pk.clone(),
                    next_row_key: Some(rk.clone()),
                });
                break;
            }
            page.keys.push((pk.clone(), etag.clone()));
        }
        Ok(page)
    }
}
