//! Local filesystem chunk store.
//!
//! Chunks land under `root/<first two hex chars>/<hash>`. Writes go through
//! a temp file and an atomic rename, so concurrent writers of the same chunk
//! race harmlessly to the same content.

use crate::chunk::{slice_range, ChunkHash, ChunkStore, HashStream};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

/// Chunk store rooted at a local directory.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn chunk_path(&self, hash: &ChunkHash) -> PathBuf {
        self.root.join(&hash.as_str()[..2]).join(hash.as_str())
    }
}

#[async_trait]
impl ChunkStore for FilesystemBackend {
    async fn put(&self, data: Bytes) -> StorageResult<ChunkHash> {
        let hash = ChunkHash::compute(&data);
        let path = self.chunk_path(&hash);
        if fs::try_exists(&path).await? {
            return Ok(hash);
        }
        let parent = path.parent().expect("chunk path has a shard directory");
        fs::create_dir_all(parent).await?;

        let tmp = parent.join(format!(".tmp-{}", Uuid::new_v4().simple()));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        Ok(hash)
    }

    async fn get(&self, hash: &ChunkHash) -> StorageResult<Bytes> {
        match fs::read(self.chunk_path(hash)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::ChunkNotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_range(
        &self,
        hash: &ChunkHash,
        offset: u64,
        length: Option<u64>,
    ) -> StorageResult<Bytes> {
        let path = self.chunk_path(hash);
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::ChunkNotFound(hash.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata().await?.len();
        if offset > file_len {
            return Err(StorageError::InvalidRange(format!(
                "offset {offset} past end {file_len}"
            )));
        }
        match length {
            Some(length) => {
                let end = (offset + length).min(file_len);
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; (end - offset) as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
            None => {
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                let mut buf = Vec::with_capacity((file_len - offset) as usize);
                file.read_to_end(&mut buf).await?;
                let data = Bytes::from(buf);
                slice_range(&data, 0, None)
            }
        }
    }

    async fn exists(&self, hash: &ChunkHash) -> StorageResult<bool> {
        Ok(fs::try_exists(self.chunk_path(hash)).await?)
    }

    async fn walk(&self, prefix: &str) -> StorageResult<HashStream> {
        let mut hashes = Vec::new();
        let mut shards = fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with('.') || !name.starts_with(prefix) {
                    continue;
                }
                if let Ok(hash) = ChunkHash::parse(name) {
                    hashes.push(hash);
                }
            }
        }
        hashes.sort();
        Ok(Box::pin(stream::iter(hashes.into_iter().map(Ok))))
    }

    async fn delete(&self, hash: &ChunkHash) -> StorageResult<()> {
        match fs::remove_file(self.chunk_path(hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn backend() -> (tempfile::TempDir, FilesystemBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path().join("chunks")).await.unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_dir, store) = backend().await;
        let data = Bytes::from(vec![7u8; 1024]);
        let hash = store.put(data.clone()).await.unwrap();
        assert_eq!(store.get(&hash).await.unwrap(), data);
        assert_eq!(
            store.get_range(&hash, 10, Some(4)).await.unwrap(),
            data.slice(10..14)
        );
    }

    #[tokio::test]
    async fn test_missing_chunk_errors() {
        let (_dir, store) = backend().await;
        let hash = ChunkHash::compute(b"never stored");
        assert!(matches!(
            store.get(&hash).await,
            Err(StorageError::ChunkNotFound(_))
        ));
        assert!(!store.exists(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_walk_skips_temp_files() {
        let (_dir, store) = backend().await;
        let hash = store.put(Bytes::from_static(b"chunk")).await.unwrap();
        // simulate a crashed writer
        let shard = store.root.join(&hash.as_str()[..2]);
        std::fs::write(shard.join(".tmp-leftover"), b"junk").unwrap();

        let walked: Vec<ChunkHash> =
            store.walk("").await.unwrap().try_collect().await.unwrap();
        assert_eq!(walked, vec![hash]);
    }
}
