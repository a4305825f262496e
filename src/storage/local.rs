use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tokio::fs;

use super::{ObjectStore, Uri};

/// Host-filesystem store backing the `file://` scheme.
pub struct LocalStore;

impl LocalStore {
    pub fn new() -> LocalStore {
        LocalStore
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn read(&self, uri: &Uri) -> Result<Vec<u8>> {
        Ok(fs::read(&uri.path).await?)
    }

    async fn write(&self, uri: &Uri, data: &[u8]) -> Result<()> {
        if let Some(parent) = Path::new(&uri.path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(&uri.path, data).await?;
        Ok(())
    }

    async fn list(&self, prefix: &Uri) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let root = PathBuf::from(&prefix.path);
        let mut pending = vec![root];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else {
                    names.push(path.to_string_lossy().into_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn copy(&self, src: &Uri, dst: &Uri) -> Result<()> {
        if let Some(parent) = Path::new(&dst.path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::copy(&src.path, &dst.path).await?;
        Ok(())
    }
}
