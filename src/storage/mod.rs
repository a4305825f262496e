//! URI-schemed blob I/O.
//!
//! Pipeline specs, manifest templates and the state checkpoint are all
//! addressed by URI. `Storage` maps a URI scheme to an [`ObjectStore`]
//! implementation; `file://` and `gs://` are registered by default and
//! tests swap in the in-memory store.

mod gcs;
mod local;
mod mem;

pub use gcs::GcsStore;
pub use local::LocalStore;
pub use mem::MemStore;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::warn;
use regex::Regex;

/// A parsed `scheme://path` reference. For `gs://` the path is
/// `bucket/object`; for `file://` it is a host filesystem path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: String,
    pub path: String,
}

impl Uri {
    pub fn parse(uri: &str) -> Result<Uri> {
        let sep = uri
            .find("://")
            .ok_or_else(|| anyhow!("unsupported uri scheme: {uri}"))?;
        Ok(Uri {
            scheme: uri[..sep].to_string(),
            path: uri[sep + 3..].to_string(),
        })
    }

    /// Split a `bucket/object` path into its two components.
    pub fn split_bucket(&self) -> Result<(&str, &str)> {
        match self.path.split_once('/') {
            Some((bucket, object)) if !bucket.is_empty() => Ok((bucket, object)),
            _ => Err(anyhow!("invalid object store uri: {}://{}", self.scheme, self.path)),
        }
    }
}

impl std::fmt::Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.path)
    }
}

/// Byte-level access to one URI scheme. Object names returned by `list`
/// are store-absolute paths (the `path` component of a `Uri`).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn read(&self, uri: &Uri) -> Result<Vec<u8>>;
    async fn write(&self, uri: &Uri, data: &[u8]) -> Result<()>;
    async fn list(&self, prefix: &Uri) -> Result<Vec<String>>;
    async fn copy(&self, src: &Uri, dst: &Uri) -> Result<()>;
}

/// Scheme registry. Cloning is cheap; all stores are shared.
#[derive(Clone)]
pub struct Storage {
    stores: Arc<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl Storage {
    /// Registry with the production schemes: `file://` and `gs://`.
    pub fn new() -> Storage {
        let mut stores: HashMap<String, Arc<dyn ObjectStore>> = HashMap::new();
        stores.insert("file".to_string(), Arc::new(LocalStore::new()));
        stores.insert("gs".to_string(), Arc::new(GcsStore::new()));
        Storage {
            stores: Arc::new(stores),
        }
    }

    /// Registry with a single store bound to `scheme`, for tests.
    pub fn single(scheme: &str, store: Arc<dyn ObjectStore>) -> Storage {
        let mut stores: HashMap<String, Arc<dyn ObjectStore>> = HashMap::new();
        stores.insert(scheme.to_string(), store);
        Storage {
            stores: Arc::new(stores),
        }
    }

    /// Replace or add the store for one scheme.
    pub fn with_store(&self, scheme: &str, store: Arc<dyn ObjectStore>) -> Storage {
        let mut stores: HashMap<String, Arc<dyn ObjectStore>> =
            self.stores.as_ref().clone();
        stores.insert(scheme.to_string(), store);
        Storage {
            stores: Arc::new(stores),
        }
    }

    fn store_for(&self, uri: &Uri) -> Result<&Arc<dyn ObjectStore>> {
        self.stores
            .get(&uri.scheme)
            .ok_or_else(|| anyhow!("unsupported uri scheme: {uri}"))
    }

    pub async fn read(&self, uri: &str) -> Result<Vec<u8>> {
        let uri = Uri::parse(uri)?;
        self.store_for(&uri)?.read(&uri).await
    }

    pub async fn write(&self, uri: &str, data: &[u8]) -> Result<()> {
        let uri = Uri::parse(uri)?;
        self.store_for(&uri)?.write(&uri, data).await
    }

    /// Copy every object under `src` to the same relative name under `dst`,
    /// keeping names that match `include` (when given) and do not match
    /// `exclude` (when given). Individual copy failures are logged and
    /// skipped; the walk itself is best-effort.
    pub async fn copy_dir(
        &self,
        src: &str,
        dst: &str,
        include: Option<&Regex>,
        exclude: Option<&Regex>,
    ) -> Result<()> {
        let src = Uri::parse(src)?;
        let dst = Uri::parse(dst)?;
        if src.scheme != dst.scheme {
            return Err(anyhow!(
                "cannot copy across uri schemes: {} -> {}",
                src.scheme,
                dst.scheme
            ));
        }
        let store = self.store_for(&src)?;

        for name in store.list(&src).await? {
            let rel = name
                .strip_prefix(&src.path)
                .unwrap_or(&name)
                .trim_start_matches('/');
            if let Some(re) = include {
                if !re.is_match(rel) {
                    continue;
                }
            }
            if let Some(re) = exclude {
                if re.is_match(rel) {
                    continue;
                }
            }
            let from = Uri {
                scheme: src.scheme.clone(),
                path: name.clone(),
            };
            let to = Uri {
                scheme: dst.scheme.clone(),
                path: format!("{}/{}", dst.path.trim_end_matches('/'), rel),
            };
            if let Err(e) = store.copy(&from, &to).await {
                warn!("copy {from} -> {to}: {e}");
            }
        }
        Ok(())
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalize the path component of a URI without touching the scheme's
/// `//`. `gs://b/p/../q` becomes `gs://b/q`; a bare path is cleaned as-is.
pub fn clean_uri(uri: &str) -> String {
    match uri.find("://") {
        Some(sep) => format!("{}{}", &uri[..sep + 3], clean_path(&uri[sep + 3..])),
        None => clean_path(uri),
    }
}

fn clean_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_uri_splits_scheme() {
        let uri = Uri::parse("gs://bucket/dir/obj").unwrap();
        assert_eq!(uri.scheme, "gs");
        assert_eq!(uri.path, "bucket/dir/obj");
        assert_eq!(uri.split_bucket().unwrap(), ("bucket", "dir/obj"));
    }

    #[test]
    fn parse_uri_rejects_schemeless() {
        assert!(Uri::parse("/plain/path").is_err());
    }

    #[test]
    fn clean_uri_normalizes_path_only() {
        assert_eq!(clean_uri("gs://b/p/"), "gs://b/p");
        assert_eq!(clean_uri("gs://b/p/../q"), "gs://b/q");
        assert_eq!(clean_uri("gs://b//p//x"), "gs://b/p/x");
        assert_eq!(clean_uri("file:///etc/./conf"), "file:///etc/conf");
        assert_eq!(clean_uri(""), ".");
    }

    #[tokio::test]
    async fn copy_dir_filters_by_include_and_exclude() {
        let mem = Arc::new(MemStore::new());
        let storage = Storage::single("gs", mem.clone());
        storage.write("gs://b/p/3/of-00001", b"a").await.unwrap();
        storage.write("gs://b/p/3/of-00002", b"b").await.unwrap();
        storage.write("gs://b/p/3/tmp/scratch", b"c").await.unwrap();

        let include = Regex::new("of-").unwrap();
        let exclude = Regex::new("00002").unwrap();
        storage
            .copy_dir("gs://b/p/3", "gs://b/p/4", Some(&include), Some(&exclude))
            .await
            .unwrap();

        assert_eq!(storage.read("gs://b/p/4/of-00001").await.unwrap(), b"a");
        assert!(storage.read("gs://b/p/4/of-00002").await.is_err());
        assert!(storage.read("gs://b/p/4/tmp/scratch").await.is_err());
    }

    #[tokio::test]
    async fn copy_dir_crosses_buckets() {
        let storage = Storage::single("gs", Arc::new(MemStore::new()));
        storage.write("gs://src/p/1/out", b"x").await.unwrap();
        storage
            .copy_dir("gs://src/p/1", "gs://dst/p/2", None, None)
            .await
            .unwrap();
        assert_eq!(storage.read("gs://dst/p/2/out").await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn unknown_scheme_is_an_error() {
        let storage = Storage::single("gs", Arc::new(MemStore::new()));
        let err = storage.read("s3://b/o").await.unwrap_err();
        assert!(err.to_string().contains("unsupported uri scheme"));
    }
}
