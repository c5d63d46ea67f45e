//! An object store that versions objects by generation, the way Google
//! Cloud Storage does.
//!
//! Etags are derived from content, so rewriting identical bytes keeps the
//! etag. Every write assigns a fresh generation, and `PutMode::Update` must
//! name the current generation. Listings carry no generations.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{
    Error, GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore,
    PutMode, PutMultipartOpts, PutOptions, PutPayload, PutResult, Result,
};
use tokio::sync::Mutex;

const STORE: &str = "GenerationStore";

#[derive(Debug, Clone)]
struct Version {
    generation: String,
    e_tag: String,
}

#[derive(Debug, Default)]
struct State {
    next_generation: u64,
    objects: HashMap<Path, Version>,
}

#[derive(Debug, Default)]
pub struct GenerationStore {
    inner: InMemory,
    // Held across inner calls so the generation check and the write are one step.
    state: Mutex<State>,
}

impl GenerationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Display for GenerationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{STORE}")
    }
}

fn content_etag(payload: &PutPayload) -> String {
    let mut hasher = DefaultHasher::new();
    for chunk in payload.iter() {
        chunk.hash(&mut hasher);
    }
    format!("\"{:016x}\"", hasher.finish())
}

#[async_trait]
impl ObjectStore for GenerationStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> Result<PutResult> {
        let mut state = self.state.lock().await;
        let inner_mode = match opts.mode {
            PutMode::Update(version) => {
                let requested = version.version.ok_or_else(|| Error::Generic {
                    store: STORE,
                    source: "Version required for conditional update".into(),
                })?;
                let current = state.objects.get(location).map(|v| v.generation.as_str());
                if current != Some(requested.as_str()) {
                    return Err(Error::Precondition {
                        path: location.to_string(),
                        source: format!("Generation {requested} is not current").into(),
                    });
                }
                PutMode::Overwrite
            }
            mode => mode,
        };

        let e_tag = content_etag(&payload);
        let opts = PutOptions {
            mode: inner_mode,
            ..opts
        };
        self.inner.put_opts(location, payload, opts).await?;

        state.next_generation += 1;
        let generation = state.next_generation.to_string();
        state.objects.insert(
            location.clone(),
            Version {
                generation: generation.clone(),
                e_tag: e_tag.clone(),
            },
        );
        Ok(PutResult {
            e_tag: Some(e_tag),
            version: Some(generation),
        })
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOpts,
    ) -> Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(&self, location: &Path, options: GetOptions) -> Result<GetResult> {
        let state = self.state.lock().await;
        let mut result = self.inner.get_opts(location, options).await?;
        let version = state.objects.get(location).cloned();
        result.meta.e_tag = version.as_ref().map(|v| v.e_tag.clone());
        result.meta.version = version.map(|v| v.generation);
        Ok(result)
    }

    async fn delete(&self, location: &Path) -> Result<()> {
        let mut state = self.state.lock().await;
        self.inner.delete(location).await?;
        state.objects.remove(location);
        Ok(())
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, Result<ObjectMeta>> {
        self.inner
            .list(prefix)
            .map_ok(|meta| ObjectMeta {
                version: None,
                ..meta
            })
            .boxed()
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}
