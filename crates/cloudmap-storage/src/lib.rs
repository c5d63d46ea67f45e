//! Storage backend implementations for cloudmap.
//!
//! This crate provides concrete implementations of the
//! [`StorageBackend`](cloudmap_core::StorageBackend) trait:
//!
//! - [`BlobBackend`]: object stores with native conditional writes
//!   (Azure Blob Storage, Google Cloud Storage, in-memory)
//! - [`S3Backend`]: S3-compatible storage with client-side version markers
//! - [`TableBackend`]: wide-column tables with chunked binary properties
//!
//! [`open_backend`] builds one of them from a storage URI.

pub mod blob;
pub mod objects;
pub mod s3;
pub mod table;
pub mod uri;

use std::sync::Arc;

use tracing::debug;

use cloudmap_core::error::CloudMapError;
use cloudmap_core::storage::StorageBackend;
use cloudmap_core::Result;

pub use blob::BlobBackend;
pub use s3::{S3Backend, S3Options};
#[cfg(feature = "azure-table")]
pub use table::AzureTableService;
pub use table::{MemoryTableService, TableBackend, TableService};
pub use uri::StorageUri;

/// Open a storage backend from a URI.
///
/// | URI | Backend |
/// |-----|---------|
/// | `memory://<name>` | [`BlobBackend`] over a fresh in-process store |
/// | `az://<account>/<container>[/<root>][?emulator=true]` | [`BlobBackend`] over Azure Blob Storage |
/// | `gs://<bucket>[/<root>]?project=<project>` | [`BlobBackend`] over Google Cloud Storage |
/// | `s3://<bucket>[/<root>][?region=..&endpoint=..&silence_warning=true]` | [`S3Backend`] |
/// | `aztable://<account>/<table>[?endpoint=..]` | [`TableBackend`] over Azure Table Storage |
/// | `memtable://<account>/<table>` | [`TableBackend`] over a fresh in-process table |
///
/// Credentials come from the environment, never from the URI.
pub fn open_backend(uri: &str) -> Result<Arc<dyn StorageBackend>> {
    let parsed = StorageUri::parse(uri)?;
    debug!(scheme = %parsed.scheme, name = %parsed.authority, "Opening storage backend");

    let backend: Arc<dyn StorageBackend> = match parsed.scheme.as_str() {
        "memory" => Arc::new(BlobBackend::in_memory(&parsed.authority)),
        "az" => {
            let (container, root) = parsed.require_first_segment("container")?;
            Arc::new(BlobBackend::azure(
                &parsed.authority,
                container,
                root,
                parsed.flag("emulator"),
            )?)
        }
        "gs" => {
            let project = parsed.param("project").ok_or_else(|| CloudMapError::Config {
                message: format!("gs:// URI must include ?project=<project>: {uri}"),
            })?;
            Arc::new(BlobBackend::gcs(&project, &parsed.authority, &parsed.path)?)
        }
        "s3" => {
            let options = S3Options {
                region: parsed.param("region"),
                endpoint: parsed.param("endpoint"),
                silence_warning: parsed.flag("silence_warning"),
            };
            Arc::new(S3Backend::new(&parsed.authority, &parsed.path, options)?)
        }
        #[cfg(feature = "azure-table")]
        "aztable" => {
            let (table, _) = parsed.require_first_segment("table")?;
            let mut service = AzureTableService::from_env(parsed.authority.as_str(), table)?;
            if let Some(endpoint) = parsed.param("endpoint") {
                service = service.with_endpoint(endpoint);
            }
            Arc::new(TableBackend::new(Arc::new(service)))
        }
        "memtable" => {
            let (table, _) = parsed.require_first_segment("table")?;
            let service = MemoryTableService::new(parsed.authority.as_str(), table);
            Arc::new(TableBackend::new(Arc::new(service)))
        }
        other => {
            return Err(CloudMapError::Config {
                message: format!("Unsupported storage scheme '{other}://'"),
            })
        }
    };

    Ok(backend)
}
