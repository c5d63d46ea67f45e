//! Azure Table Storage over its REST API.
//!
//! Requests are authorised with a SAS token appended to every URL. Binary
//! properties travel base64-encoded with an `Edm.Binary` type annotation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{header::HeaderMap, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use cloudmap_core::error::CloudMapError;
use cloudmap_core::types::{Etag, ProviderIdentity};

use super::{Continuation, Entity, PartitionRange, QueryPage, TableError, TableService};

/// Environment variable holding the SAS token.
pub const SAS_TOKEN_ENV: &str = "AZURE_STORAGE_SAS_TOKEN";

const API_VERSION: &str = "2019-02-02";
const ACCEPT: &str = "application/json;odata=minimalmetadata";
const DATA_SERVICE_VERSION: &str = "3.0;NetFx";
const BINARY_TYPE: &str = "Edm.Binary";
const TYPE_SUFFIX: &str = "@odata.type";
const CONTINUATION_PARTITION: &str = "x-ms-continuation-NextPartitionKey";
const CONTINUATION_ROW: &str = "x-ms-continuation-NextRowKey";

/// Escaped in URL components: everything but `A-Z a-z 0-9 - . _ ~`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Deserialize)]
struct ODataErrorBody {
    #[serde(rename = "odata.error")]
    error: ODataError,
}

#[derive(Debug, Deserialize)]
struct ODataError {
    code: String,
    message: ODataMessage,
}

#[derive(Debug, Deserialize)]
struct ODataMessage {
    value: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    value: Vec<QueryRow>,
}

#[derive(Debug, Deserialize)]
struct QueryRow {
    #[serde(rename = "odata.etag")]
    etag: String,
    #[serde(rename = "PartitionKey")]
    partition_key: String,
}

/// A [`TableService`] talking to one Azure Storage table.
#[derive(Debug, Clone)]
pub struct AzureTableService {
    client: reqwest::Client,
    account: String,
    table: String,
    endpoint: String,
    sas_token: String,
}

impl AzureTableService {
    /// Bind to `table` in `account`, authorising with `sas_token`.
    pub fn new(
        account: impl Into<String>,
        table: impl Into<String>,
        sas_token: impl Into<String>,
    ) -> Self {
        let account = account.into();
        let endpoint = format!("https://{account}.table.core.windows.net");
        Self {
            client: reqwest::Client::new(),
            account,
            table: table.into(),
            endpoint,
            sas_token: sas_token.into().trim_start_matches('?').to_string(),
        }
    }

    /// Bind using the SAS token in `AZURE_STORAGE_SAS_TOKEN`.
    pub fn from_env(
        account: impl Into<String>,
        table: impl Into<String>,
    ) -> cloudmap_core::Result<Self> {
        let token = std::env::var(SAS_TOKEN_ENV).map_err(|_| CloudMapError::Config {
            message: format!("{SAS_TOKEN_ENV} must be set to use Azure Table Storage"),
        })?;
        Ok(Self::new(account, table, token))
    }

    /// Use a custom endpoint, such as Azurite's `http://127.0.0.1:10002/<account>`.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> String {
        let mut params: Vec<String> = query
            .iter()
            .map(|(name, value)| format!("{name}={}", utf8_percent_encode(value, COMPONENT)))
            .collect();
        if !self.sas_token.is_empty() {
            params.push(self.sas_token.clone());
        }
        format!("{}/{}?{}", self.endpoint, path, params.join("&"))
    }

    fn entity_path(&self, partition_key: &str, row_key: &str) -> String {
        format!(
            "{}(PartitionKey={},RowKey={})",
            self.table,
            utf8_percent_encode(&odata_literal(partition_key), COMPONENT),
            utf8_percent_encode(&odata_literal(row_key), COMPONENT),
        )
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("x-ms-version", API_VERSION)
            .header("Accept", ACCEPT)
            .header("DataServiceVersion", DATA_SERVICE_VERSION)
            .header("MaxDataServiceVersion", DATA_SERVICE_VERSION)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, TableError> {
        let response = self.request(builder).send().await.map_err(transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match response.text().await {
            Ok(body) => Err(classify_error(status, &body)),
            Err(e) => Err(TableError::Transport {
                message: format!("Failed to read error response ({status}): {e}"),
                source: Some(Box::new(e)),
            }),
        }
    }
}

fn transport(err: reqwest::Error) -> TableError {
    TableError::Transport {
        message: err.to_string(),
        source: Some(Box::new(err)),
    }
}

fn etag_header(headers: &HeaderMap) -> Result<Etag, TableError> {
    headers
        .get("ETag")
        .and_then(|v| v.to_str().ok())
        .map(Etag::new)
        .ok_or_else(|| TableError::Transport {
            message: "Response carried no ETag header".to_string(),
            source: None,
        })
}

/// Quote a string as an OData literal.
fn odata_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `$filter` expression for a partition-key range.
fn range_filter(range: &PartitionRange) -> Option<String> {
    let mut clauses = Vec::new();
    if let Some(start) = &range.start {
        clauses.push(format!("PartitionKey ge {}", odata_literal(start)));
    }
    if let Some(end) = &range.end {
        clauses.push(format!("PartitionKey lt {}", odata_literal(end)));
    }
    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" and "))
    }
}

/// Map a failed response onto [`TableError`].
fn classify_error(status: StatusCode, body: &str) -> TableError {
    let (code, message) = match serde_json::from_str::<ODataErrorBody>(body) {
        Ok(parsed) => (parsed.error.code, parsed.error.message.value),
        Err(_) => (String::new(), body.to_string()),
    };

    match code.as_str() {
        "TableAlreadyExists" | "EntityAlreadyExists" | "TableBeingDeleted" => {
            return TableError::AlreadyExists
        }
        "UpdateConditionNotSatisfied" => return TableError::PreconditionFailed,
        "EntityTooLarge" | "PropertyValueTooLarge" | "RequestBodyTooLarge" => {
            return TableError::EntityTooLarge
        }
        _ => {}
    }
    // A malformed If-Match value means the caller's etag is not one the
    // service ever issued for this entity.
    if message.contains("etag value") && message.contains("is not valid") {
        return TableError::PreconditionFailed;
    }

    match status {
        StatusCode::CONFLICT => TableError::AlreadyExists,
        StatusCode::NOT_FOUND => TableError::NotFound,
        StatusCode::PRECONDITION_FAILED => TableError::PreconditionFailed,
        StatusCode::PAYLOAD_TOO_LARGE => TableError::EntityTooLarge,
        _ => TableError::Service {
            status: status.as_u16(),
            code,
            message,
        },
    }
}

/// JSON body for an entity, with binary properties annotated.
fn entity_body(entity: &Entity) -> Value {
    let mut body = Map::new();
    body.insert("PartitionKey".into(), Value::String(entity.partition_key.clone()));
    body.insert("RowKey".into(), Value::String(entity.row_key.clone()));
    for (name, value) in &entity.properties {
        body.insert(format!("{name}{TYPE_SUFFIX}"), Value::String(BINARY_TYPE.into()));
        body.insert(name.clone(), Value::String(STANDARD.encode(value)));
    }
    Value::Object(body)
}

/// Parse a fetched entity, keeping only its binary properties.
fn parse_entity(
    partition_key: &str,
    row_key: &str,
    etag: Etag,
    body: &[u8],
) -> Result<Entity, TableError> {
    let object: Map<String, Value> = serde_json::from_slice(body).map_err(|e| {
        TableError::Transport {
            message: "Invalid entity JSON".to_string(),
            source: Some(Box::new(e)),
        }
    })?;

    let mut properties = BTreeMap::new();
    for (name, value) in &object {
        let annotation = object
            .get(&format!("{name}{TYPE_SUFFIX}"))
            .and_then(Value::as_str);
        if annotation != Some(BINARY_TYPE) {
            continue;
        }
        let Some(encoded) = value.as_str() else {
            continue;
        };
        let decoded = STANDARD.decode(encoded).map_err(|e| TableError::Transport {
            message: format!("Invalid base64 in property {name}"),
            source: Some(Box::new(e)),
        })?;
        properties.insert(name.clone(), Bytes::from(decoded));
    }

    Ok(Entity {
        partition_key: partition_key.to_string(),
        row_key: row_key.to_string(),
        properties,
        etag: Some(etag),
    })
}

#[async_trait]
impl TableService for AzureTableService {
    fn identity(&self) -> ProviderIdentity {
        ProviderIdentity::new("AzureTableStorage")
            .with("StorageAccountName", self.account.as_str())
            .with("TableName", self.table.as_str())
    }

    async fn create_table(&self) -> Result<(), TableError> {
        let body = serde_json::json!({ "TableName": self.table });
        self.send(
            self.client
                .post(self.url("Tables", &[]))
                .header("Prefer", "return-no-content")
                .json(&body),
        )
        .await?;
        debug!(table = %self.table, "Created Azure table");
        Ok(())
    }

    async fn get_entity(&self, partition_key: &str, row_key: &str) -> Result<Entity, TableError> {
        let url = self.url(&self.entity_path(partition_key, row_key), &[]);
        let response = self.send(self.client.get(url)).await?;
        let etag = etag_header(response.headers())?;
        let body = response.bytes().await.map_err(transport)?;
        parse_entity(partition_key, row_key, etag, &body)
    }

    async fn insert_entity(&self, entity: &Entity) -> Result<Etag, TableError> {
        let response = self
            .send(
                self.client
                    .post(self.url(&self.table, &[]))
                    .header("Prefer", "return-no-content")
                    .json(&entity_body(entity)),
            )
            .await?;
        etag_header(response.headers())
    }

    async fn replace_entity(&self, entity: &Entity, if_match: &Etag) -> Result<Etag, TableError> {
        let url = self.url(&self.entity_path(&entity.partition_key, &entity.row_key), &[]);
        let response = self
            .send(
                self.client
                    .put(url)
                    .header("If-Match", if_match.as_str())
                    .json(&entity_body(entity)),
            )
            .await?;
        etag_header(response.headers())
    }

    async fn delete_entity(
        &self,
        partition_key: &str,
        row_key: &str,
        if_match: &Etag,
    ) -> Result<(), TableError> {
        let url = self.url(&self.entity_path(partition_key, row_key), &[]);
        self.send(self.client.delete(url).header("If-Match", if_match.as_str()))
            .await?;
        Ok(())
    }

    async fn query_keys(
        &self,
        range: &PartitionRange,
        continuation: Option<&Continuation>,
    ) -> Result<QueryPage, TableError> {
        let filter = range_filter(range);
        let mut query: Vec<(&str, &str)> = vec![("$select", "PartitionKey,RowKey")];
        if let Some(filter) = &filter {
            query.push(("$filter", filter.as_str()));
        }
        if let Some(c) = continuation {
            query.push(("NextPartitionKey", c.next_partition_key.as_str()));
            if let Some(row) = &c.next_row_key {
                query.push(("NextRowKey", row.as_str()));
            }
        }

        let path = format!("{}()", self.table);
        let response = self.send(self.client.get(self.url(&path, &query))).await?;

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let continuation = header(CONTINUATION_PARTITION).map(|next_partition_key| Continuation {
            next_partition_key,
            next_row_key: header(CONTINUATION_ROW),
        });

        let body = response.bytes().await.map_err(transport)?;
        let parsed: QueryResponse =
            serde_json::from_slice(&body).map_err(|e| TableError::Transport {
                message: "Invalid query response JSON".to_string(),
                source: Some(Box::new(e)),
            })?;

        Ok(QueryPage {
            keys: parsed
                .value
                .into_iter()
                .map(|row| (row.partition_key, Etag::new(row.etag)))
                .collect(),
            continuation,
        })
    }
}
