//! Content-addressed storage for watershed: the chunk store contract and
//! the fileset manifests built on top of it.

pub mod backends;
pub mod chunk;
pub mod error;
pub mod fileset;
pub mod tar;

pub use backends::{FilesystemBackend, MemoryBackend};
pub use chunk::{ChunkHash, ChunkStore, HashStream};
pub use error::{StorageError, StorageResult};
pub use fileset::{ChunkRef, FileDiff, FileEntry, FileMetadata, FilesetStore, Manifest};
