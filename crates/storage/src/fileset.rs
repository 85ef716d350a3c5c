//! Filesets: content-addressed manifests of a commit's files.
//!
//! A manifest maps cleaned paths to chunk lists. The manifest's own bytes
//! are stored as a chunk, and that chunk's hash is the fileset handle, so
//! equal trees get equal handles and layers compose deterministically.

use crate::chunk::{ChunkHash, ChunkStore};
use crate::error::{StorageError, StorageResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use watershed_core::fileset::{clean_path, parent_dir};
use watershed_core::{FilesetId, Glob};

/// Files larger than this are split into multiple chunks.
pub const MAX_CHUNK_BYTES: usize = 8 * 1024 * 1024;

/// One chunk of a file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub hash: ChunkHash,
    pub size: u64,
}

/// One file in a manifest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub chunks: Vec<ChunkRef>,
    pub size: u64,
}

/// Metadata returned by listing and glob operations. Directories are
/// implicit: they exist exactly where files exist under them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
}

/// Differences between two manifests.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub added: Vec<FileMetadata>,
    pub removed: Vec<FileMetadata>,
    /// `(old, new)` pairs for paths present in both with different content.
    pub changed: Vec<(FileMetadata, FileMetadata)>,
}

/// A fileset manifest: cleaned path → file entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub files: BTreeMap<String, FileEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Total bytes across all files.
    pub fn size_bytes(&self) -> u64 {
        self.files.values().map(|entry| entry.size).sum()
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(path)
    }

    /// Insert or replace a file.
    pub fn put_file(&mut self, path: &str, chunks: Vec<ChunkRef>) -> StorageResult<()> {
        let path = clean_path(path)?;
        if path == "/" {
            return Err(StorageError::InvalidManifest(
                "cannot store a file at /".to_string(),
            ));
        }
        let size = chunks.iter().map(|c| c.size).sum();
        self.files.insert(path, FileEntry { chunks, size });
        Ok(())
    }

    /// Remove `path`, a single file or a whole directory subtree. Returns
    /// how many files went away.
    pub fn delete_path(&mut self, path: &str) -> StorageResult<u64> {
        let path = clean_path(path)?;
        if path == "/" {
            let removed = self.files.len() as u64;
            self.files.clear();
            return Ok(removed);
        }
        let prefix = format!("{path}/");
        let before = self.files.len();
        self.files
            .retain(|p, _| p != &path && !p.starts_with(&prefix));
        Ok((before - self.files.len()) as u64)
    }

    /// All implicit directories, always including the root.
    pub fn dirs(&self) -> BTreeSet<String> {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());
        for path in self.files.keys() {
            let mut dir = parent_dir(path);
            while dir != "/" {
                dirs.insert(dir.to_string());
                dir = parent_dir(dir);
            }
        }
        dirs
    }

    /// Bytes under a directory (or of a single file).
    pub fn size_under(&self, path: &str) -> u64 {
        if path == "/" {
            return self.size_bytes();
        }
        if let Some(entry) = self.files.get(path) {
            return entry.size;
        }
        let prefix = format!("{path}/");
        self.files
            .iter()
            .filter(|(p, _)| p.starts_with(&prefix))
            .map(|(_, e)| e.size)
            .sum()
    }

    /// Metadata for a file or implicit directory, if present.
    pub fn metadata(&self, path: &str) -> StorageResult<Option<FileMetadata>> {
        let path = clean_path(path)?;
        if let Some(entry) = self.files.get(&path) {
            return Ok(Some(FileMetadata {
                path,
                size: entry.size,
                is_dir: false,
            }));
        }
        if self.dirs().contains(&path) {
            let size = self.size_under(&path);
            return Ok(Some(FileMetadata {
                path,
                size,
                is_dir: true,
            }));
        }
        Ok(None)
    }

    /// Entries directly under a directory, files and subdirectories, in
    /// path order.
    pub fn list_dir(&self, path: &str) -> StorageResult<Vec<FileMetadata>> {
        let path = clean_path(path)?;
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let mut out = Vec::new();
        let mut seen_dirs = BTreeSet::new();
        for (file_path, entry) in &self.files {
            let Some(rest) = file_path.strip_prefix(&prefix) else {
                continue;
            };
            match rest.find('/') {
                None => out.push(FileMetadata {
                    path: file_path.clone(),
                    size: entry.size,
                    is_dir: false,
                }),
                Some(i) => {
                    let dir = format!("{prefix}{}", &rest[..i]);
                    if seen_dirs.insert(dir.clone()) {
                        let size = self.size_under(&dir);
                        out.push(FileMetadata {
                            path: dir,
                            size,
                            is_dir: true,
                        });
                    }
                }
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    /// Every file under a path (recursive), in path order.
    pub fn walk(&self, path: &str) -> StorageResult<Vec<FileMetadata>> {
        let path = clean_path(path)?;
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        Ok(self
            .files
            .iter()
            .filter(|(p, _)| *p == &path || p.starts_with(&prefix))
            .map(|(p, e)| FileMetadata {
                path: p.clone(),
                size: e.size,
                is_dir: false,
            })
            .collect())
    }

    /// Files and directories matching a glob, in path order. The root glob
    /// `/` matches the root directory itself, even in an empty manifest.
    pub fn glob(&self, glob: &Glob) -> Vec<FileMetadata> {
        let mut out = Vec::new();
        for dir in self.dirs() {
            if glob.is_match(&dir) {
                let size = self.size_under(&dir);
                out.push(FileMetadata {
                    path: dir,
                    size,
                    is_dir: true,
                });
            }
        }
        for (path, entry) in &self.files {
            if glob.is_match(path) {
                out.push(FileMetadata {
                    path: path.clone(),
                    size: entry.size,
                    is_dir: false,
                });
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    /// Content hash of an entry: the files under `path` and their chunk
    /// hashes, in path order. Equal bytes reached through different commits
    /// hash identically, which is what makes datum skipping sound.
    pub fn content_hash(&self, path: &str) -> StorageResult<String> {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        for file in self.walk(path)? {
            let entry = &self.files[&file.path];
            hasher.update(file.path.as_bytes());
            hasher.update([0]);
            for chunk in &entry.chunks {
                hasher.update(chunk.hash.as_str().as_bytes());
            }
            hasher.update([0]);
        }
        let digest = hasher.finalize();
        Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    /// Structural diff against `new`.
    pub fn diff(&self, new: &Manifest) -> FileDiff {
        let mut diff = FileDiff::default();
        for (path, old_entry) in &self.files {
            match new.files.get(path) {
                None => diff.removed.push(FileMetadata {
                    path: path.clone(),
                    size: old_entry.size,
                    is_dir: false,
                }),
                Some(new_entry) if new_entry != old_entry => diff.changed.push((
                    FileMetadata {
                        path: path.clone(),
                        size: old_entry.size,
                        is_dir: false,
                    },
                    FileMetadata {
                        path: path.clone(),
                        size: new_entry.size,
                        is_dir: false,
                    },
                )),
                Some(_) => {}
            }
        }
        for (path, entry) in &new.files {
            if !self.files.contains_key(path) {
                diff.added.push(FileMetadata {
                    path: path.clone(),
                    size: entry.size,
                    is_dir: false,
                });
            }
        }
        diff
    }

    /// Later-wins union of layers.
    pub fn merge(layers: &[Manifest]) -> Manifest {
        let mut out = Manifest::new();
        for layer in layers {
            for (path, entry) in &layer.files {
                out.files.insert(path.clone(), entry.clone());
            }
        }
        out
    }
}

/// Fileset operations over a chunk store.
#[derive(Clone)]
pub struct FilesetStore {
    chunks: Arc<dyn ChunkStore>,
}

impl FilesetStore {
    pub fn new(chunks: Arc<dyn ChunkStore>) -> Self {
        Self { chunks }
    }

    pub fn chunk_store(&self) -> &Arc<dyn ChunkStore> {
        &self.chunks
    }

    /// Persist a manifest, returning its content-addressed handle.
    pub async fn write_manifest(&self, manifest: &Manifest) -> StorageResult<FilesetId> {
        let bytes = serde_json::to_vec(manifest)
            .map_err(|e| StorageError::InvalidManifest(e.to_string()))?;
        let hash = self.chunks.put(Bytes::from(bytes)).await?;
        Ok(FilesetId::from_hex(hash.as_str()))
    }

    /// Load a manifest by handle.
    pub async fn read_manifest(&self, id: &FilesetId) -> StorageResult<Manifest> {
        let hash = ChunkHash::parse(id.as_str())
            .map_err(|_| StorageError::InvalidManifest(format!("bad fileset id {id}")))?;
        let bytes = self.chunks.get(&hash).await?;
        serde_json::from_slice(&bytes).map_err(|e| StorageError::InvalidManifest(e.to_string()))
    }

    /// Handle of the empty fileset.
    pub async fn empty(&self) -> StorageResult<FilesetId> {
        self.write_manifest(&Manifest::new()).await
    }

    /// Store file content and record it in the manifest, splitting large
    /// files into chunks.
    pub async fn put_file(
        &self,
        manifest: &mut Manifest,
        path: &str,
        data: Bytes,
    ) -> StorageResult<()> {
        let mut refs = Vec::new();
        if data.is_empty() {
            // zero-byte files still need an entry
            manifest.put_file(path, refs)?;
            return Ok(());
        }
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + MAX_CHUNK_BYTES).min(data.len());
            let chunk = data.slice(offset..end);
            let size = chunk.len() as u64;
            let hash = self.chunks.put(chunk).await?;
            refs.push(ChunkRef { hash, size });
            offset = end;
        }
        manifest.put_file(path, refs)?;
        Ok(())
    }

    /// Read a whole file.
    pub async fn read_file(&self, manifest: &Manifest, path: &str) -> StorageResult<Bytes> {
        let path = clean_path(path)?;
        let entry = manifest
            .get(&path)
            .ok_or_else(|| StorageError::FileNotFound(path.clone()))?;
        let mut out = Vec::with_capacity(entry.size as usize);
        for chunk in &entry.chunks {
            out.extend_from_slice(&self.chunks.get(&chunk.hash).await?);
        }
        Ok(Bytes::from(out))
    }

    /// Read `length` bytes of a file starting at `offset`, crossing chunk
    /// boundaries as needed.
    pub async fn read_file_range(
        &self,
        manifest: &Manifest,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> StorageResult<Bytes> {
        let path = clean_path(path)?;
        let entry = manifest
            .get(&path)
            .ok_or_else(|| StorageError::FileNotFound(path.clone()))?;
        if offset > entry.size {
            return Err(StorageError::InvalidRange(format!(
                "offset {offset} past end {}",
                entry.size
            )));
        }
        let end = match length {
            Some(length) => (offset + length).min(entry.size),
            None => entry.size,
        };
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut chunk_start = 0u64;
        for chunk in &entry.chunks {
            let chunk_end = chunk_start + chunk.size;
            if chunk_end > offset && chunk_start < end {
                let read_from = offset.saturating_sub(chunk_start);
                let read_to = (end - chunk_start).min(chunk.size);
                let data = self
                    .chunks
                    .get_range(&chunk.hash, read_from, Some(read_to - read_from))
                    .await?;
                out.extend_from_slice(&data);
            }
            chunk_start = chunk_end;
            if chunk_start >= end {
                break;
            }
        }
        Ok(Bytes::from(out))
    }

    /// Merge layers into one fileset, later layers overriding earlier paths.
    pub async fn compose(&self, layers: &[FilesetId]) -> StorageResult<FilesetId> {
        let mut manifests = Vec::with_capacity(layers.len());
        for id in layers {
            manifests.push(self.read_manifest(id).await?);
        }
        self.write_manifest(&Manifest::merge(&manifests)).await
    }
}
