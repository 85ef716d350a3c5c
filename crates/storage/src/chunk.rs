//! The chunk store contract: write-once, content-addressed blobs.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::pin::Pin;

/// A boxed stream of chunk hashes for walk operations.
pub type HashStream = Pin<Box<dyn Stream<Item = StorageResult<ChunkHash>> + Send>>;

/// SHA-256 content hash of a chunk, hex encoded.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkHash(String);

impl ChunkHash {
    /// Compute the hash of chunk data.
    pub fn compute(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        Self(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    /// Wrap an existing hex digest, validating shape.
    pub fn parse(hex: &str) -> StorageResult<Self> {
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidHash(hex.to_string()));
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash({})", self.0)
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A content-addressed blob store.
///
/// Writes of the same bytes collapse to one object; chunks are immutable
/// once written. Everything above this trait (filesets, commits) is built
/// from these four operations plus ranged reads.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Store a chunk, returning its content hash. Idempotent.
    async fn put(&self, data: Bytes) -> StorageResult<ChunkHash>;

    /// Fetch a whole chunk.
    async fn get(&self, hash: &ChunkHash) -> StorageResult<Bytes>;

    /// Fetch `length` bytes of a chunk starting at `offset`. A `None`
    /// length reads to the end.
    async fn get_range(
        &self,
        hash: &ChunkHash,
        offset: u64,
        length: Option<u64>,
    ) -> StorageResult<Bytes>;

    /// Whether the chunk exists.
    async fn exists(&self, hash: &ChunkHash) -> StorageResult<bool>;

    /// Stream all chunk hashes starting with `prefix` (hex), in hash order.
    async fn walk(&self, prefix: &str) -> StorageResult<HashStream>;

    /// Delete a chunk. Deleting a missing chunk is not an error.
    async fn delete(&self, hash: &ChunkHash) -> StorageResult<()>;
}

pub(crate) fn slice_range(data: &Bytes, offset: u64, length: Option<u64>) -> StorageResult<Bytes> {
    let len = data.len() as u64;
    if offset > len {
        return Err(StorageError::InvalidRange(format!(
            "offset {offset} past end {len}"
        )));
    }
    let end = match length {
        Some(length) => (offset + length).min(len),
        None => len,
    };
    Ok(data.slice(offset as usize..end as usize))
}
