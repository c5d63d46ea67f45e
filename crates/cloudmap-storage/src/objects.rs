//! Shared plumbing for backends built on `object_store`.
//!
//! [`ObjectRoot`] binds a store to a root path inside a bucket or
//! container, translates encoded keys into object paths below it, and
//! materialises the "container" as a reserved marker object at the root.

use std::sync::Arc;

use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore};

use cloudmap_core::codec;
use cloudmap_core::error::CloudMapError;
use cloudmap_core::Result;

/// Name of the marker object that stands in for the container. Encoded
/// keys never contain `$`, so it cannot collide with a stored key.
pub const CONTAINER_MARKER: &str = "$cloudmap";

/// An object store plus the root path all keys live under.
#[derive(Clone)]
pub struct ObjectRoot {
    store: Arc<dyn ObjectStore>,
    root: ObjectPath,
}

impl ObjectRoot {
    pub fn new(store: Arc<dyn ObjectStore>, root: &str) -> Result<Self> {
        let root = ObjectPath::parse(root).map_err(|e| CloudMapError::Config {
            message: format!("Invalid object store root '{root}': {e}"),
        })?;
        Ok(Self { store, root })
    }

    /// Keys live directly at the top of the store.
    pub fn unrooted(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            root: ObjectPath::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Object path for an encoded key or directory relative to the root.
    pub fn path_for(&self, relative: &str) -> Result<ObjectPath> {
        let full = match (self.root.as_ref(), relative) {
            (root, "") => root.to_string(),
            ("", rel) => rel.to_string(),
            (root, rel) => format!("{root}/{rel}"),
        };
        ObjectPath::parse(&full).map_err(|e| {
            CloudMapError::usage(format!("Key '{relative}' is not a valid object path: {e}"))
        })
    }

    pub fn marker_path(&self) -> Result<ObjectPath> {
        self.path_for(CONTAINER_MARKER)
    }

    /// The encoded key of an object below the root, or `None` for objects
    /// outside it and for the container marker.
    pub fn relative_key(&self, location: &ObjectPath) -> Option<String> {
        let parts = location.prefix_match(&self.root)?;
        let key = parts
            .map(|part| part.as_ref().to_string())
            .collect::<Vec<_>>()
            .join("/");
        if key.is_empty() || key == CONTAINER_MARKER {
            return None;
        }
        Some(key)
    }

    /// List every object whose key starts with the encoded, open-ended
    /// `prefix`, returning `(encoded key, metadata)` pairs.
    ///
    /// Object stores list by whole path segments, so the listing is issued
    /// against [`codec::object_path_parent`] of the prefix and filtered on
    /// decoded keys. A key equal to a prefix ending in `/` lives beside that
    /// directory, not in it, and is still found.
    pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<(String, ObjectMeta)>> {
        let (dir, wanted) = match prefix {
            Some(p) => (codec::object_path_parent(p), Some(codec::decode_key(p)?)),
            None => ("", None),
        };
        let dir_path = self.path_for(dir)?;
        let list_from = if dir_path.as_ref().is_empty() {
            None
        } else {
            Some(&dir_path)
        };

        let mut results = Vec::new();
        let mut stream = self.store.list(list_from);
        while let Some(meta) = stream.try_next().await.map_err(|e| {
            CloudMapError::storage(format!("List failed under '{}'", dir_path), e)
        })? {
            let Some(key) = self.relative_key(&meta.location) else {
                continue;
            };
            if let Some(wanted) = &wanted {
                if !codec::decode_key(&key)?.starts_with(wanted.as_str()) {
                    continue;
                }
            }
            results.push((key, meta));
        }
        Ok(results)
    }
}

/// Strip the quotes some services put around etag values.
pub fn normalise_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use object_store::PutPayload;

    fn root(path: &str) -> ObjectRoot {
        ObjectRoot::new(Arc::new(InMemory::new()), path).unwrap()
    }

    #[test]
    fn test_path_for() {
        let r = root("data/run");
        assert_eq!(r.path_for("a/b").unwrap().as_ref(), "data/run/a/b");
        assert_eq!(r.path_for("").unwrap().as_ref(), "data/run");
        assert_eq!(root("").path_for("a%2F").unwrap().as_ref(), "a%2F");
        assert!(r.path_for("a//b").unwrap_err().is_usage());
    }

    #[test]
    fn test_relative_key_excludes_marker() {
        let r = root("data");
        let inside = ObjectPath::parse("data/p/a").unwrap();
        let outside = ObjectPath::parse("other/p/a").unwrap();
        assert_eq!(r.relative_key(&inside), Some("p/a".to_string()));
        assert_eq!(r.relative_key(&outside), None);
        assert_eq!(r.relative_key(&r.marker_path().unwrap()), None);
    }

    #[test]
    fn test_normalise_etag() {
        assert_eq!(normalise_etag("\"0x8DB\""), "0x8DB");
        assert_eq!(normalise_etag("12"), "12");
    }

    #[tokio::test]
    async fn test_list_filters_on_decoded_prefix() {
        let r = root("");
        for key in ["p/a", "p/b/c", "q/a", "pa", "p%2F", "p/b%2F"] {
            let path = r.path_for(key).unwrap();
            r.store()
                .put(&path, PutPayload::from_static(b"x"))
                .await
                .unwrap();
        }

        let mut keys: Vec<String> = r
            .list(Some(&codec::encode_object_path("p/", true)))
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["p%2F", "p/a", "p/b%2F", "p/b/c"]);

        let mut keys: Vec<String> = r
            .list(Some(&codec::encode_object_path("p/b/", true)))
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["p/b%2F", "p/b/c"]);

        assert_eq!(r.list(None).await.unwrap().len(), 6);
    }
}
