use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{ObjectStore, Uri};

/// In-memory store used by tests in place of the remote object store.
/// Keys are full store paths (`bucket/object`).
pub struct MemStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore {
            objects: Mutex::new(BTreeMap::new()),
        }
    }

    /// Snapshot of all object names, for assertions.
    pub fn names(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn read(&self, uri: &Uri) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&uri.path)
            .cloned()
            .ok_or_else(|| anyhow!("object not found: {uri}"))
    }

    async fn write(&self, uri: &Uri, data: &[u8]) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(uri.path.clone(), data.to_vec());
        Ok(())
    }

    async fn list(&self, prefix: &Uri) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(&prefix.path))
            .cloned()
            .collect())
    }

    async fn copy(&self, src: &Uri, dst: &Uri) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        let data = objects
            .get(&src.path)
            .cloned()
            .ok_or_else(|| anyhow!("object not found: {src}"))?;
        objects.insert(dst.path.clone(), data);
        Ok(())
    }
}
