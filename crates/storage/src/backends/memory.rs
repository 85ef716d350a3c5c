//! In-memory chunk store for tests and ephemeral deployments.

use crate::chunk::{slice_range, ChunkHash, ChunkStore, HashStream};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Chunk store backed by a process-local map.
#[derive(Default)]
pub struct MemoryBackend {
    chunks: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored chunks.
    pub fn len(&self) -> usize {
        self.chunks.read().expect("chunk map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ChunkStore for MemoryBackend {
    async fn put(&self, data: Bytes) -> StorageResult<ChunkHash> {
        let hash = ChunkHash::compute(&data);
        self.chunks
            .write()
            .expect("chunk map poisoned")
            .insert(hash.as_str().to_string(), data);
        Ok(hash)
    }

    async fn get(&self, hash: &ChunkHash) -> StorageResult<Bytes> {
        self.chunks
            .read()
            .expect("chunk map poisoned")
            .get(hash.as_str())
            .cloned()
            .ok_or_else(|| StorageError::ChunkNotFound(hash.to_string()))
    }

    async fn get_range(
        &self,
        hash: &ChunkHash,
        offset: u64,
        length: Option<u64>,
    ) -> StorageResult<Bytes> {
        let data = self.get(hash).await?;
        slice_range(&data, offset, length)
    }

    async fn exists(&self, hash: &ChunkHash) -> StorageResult<bool> {
        Ok(self
            .chunks
            .read()
            .expect("chunk map poisoned")
            .contains_key(hash.as_str()))
    }

    async fn walk(&self, prefix: &str) -> StorageResult<HashStream> {
        let hashes: Vec<StorageResult<ChunkHash>> = self
            .chunks
            .read()
            .expect("chunk map poisoned")
            .keys()
            .filter(|key| key.starts_with(prefix))
            .map(|key| ChunkHash::parse(key))
            .collect();
        Ok(Box::pin(stream::iter(hashes)))
    }

    async fn delete(&self, hash: &ChunkHash) -> StorageResult<()> {
        self.chunks
            .write()
            .expect("chunk map poisoned")
            .remove(hash.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = MemoryBackend::new();
        let data = Bytes::from_static(b"some chunk");
        let hash = store.put(data.clone()).await.unwrap();
        assert_eq!(store.get(&hash).await.unwrap(), data);
        assert!(store.exists(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_put_collapses() {
        let store = MemoryBackend::new();
        let a = store.put(Bytes::from_static(b"same")).await.unwrap();
        let b = store.put(Bytes::from_static(b"same")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_walk_and_delete() {
        let store = MemoryBackend::new();
        let hash = store.put(Bytes::from_static(b"walkme")).await.unwrap();
        let walked: Vec<ChunkHash> = store
            .walk(&hash.as_str()[..2])
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(walked.contains(&hash));

        store.delete(&hash).await.unwrap();
        assert!(!store.exists(&hash).await.unwrap());
        assert!(store.get(&hash).await.is_err());
        // deleting again is fine
        store.delete(&hash).await.unwrap();
    }
}
