//! File operations over commits.
//!
//! Writes apply an op batch to an open commit's staged manifest with a
//! compare-and-swap on the staged fileset handle, so concurrent writers to
//! one commit merge instead of clobbering each other.

use crate::error::{GraphError, GraphResult};
use crate::graph::{get_commit_tx, CommitGraph};
use bytes::Bytes;
use watershed_core::fileset::clean_path;
use watershed_core::ids::RepoName;
use watershed_core::{CommitInfo, Glob};
use watershed_storage::{FileDiff, FileMetadata, Manifest, StorageError};

/// One step of a `modify_file` batch.
#[derive(Clone, Debug)]
pub enum FileOp {
    /// Write `data` at `path`, replacing any existing file.
    Add { path: String, data: Bytes },
    /// Remove a file or a whole directory. Removing nothing is a no-op.
    Delete { path: String },
    /// Copy a file or directory from another (or the same) commit.
    Copy {
        src_repo: RepoName,
        src_reference: String,
        src_path: String,
        dst_path: String,
    },
}

impl CommitGraph {
    /// Apply an ordered batch of file ops to an open commit, atomically.
    pub async fn modify_file(
        &self,
        repo: &RepoName,
        reference: &str,
        ops: Vec<FileOp>,
    ) -> GraphResult<()> {
        loop {
            let commit = self.resolve_commit(repo, reference).await?;
            if commit.is_finished() {
                return Err(GraphError::CommitFinished(commit.commit_ref()));
            }
            let base = commit.fileset.clone();
            let mut manifest = self.commit_manifest(&commit).await?;
            for op in &ops {
                self.apply_op(&mut manifest, op).await?;
            }
            let staged = self.filesets().write_manifest(&manifest).await?;

            let commit_ref = commit.commit_ref();
            let swapped = self
                .store()
                .transact(move |tx| {
                    let commit_ref = commit_ref.clone();
                    let base = base.clone();
                    let staged = staged.clone();
                    Box::pin(async move {
                        let mut current = get_commit_tx(tx, &commit_ref).await?;
                        if current.is_finished() {
                            return Err(GraphError::CommitFinished(commit_ref));
                        }
                        if current.fileset != base {
                            // another writer staged first; replay onto theirs
                            return Ok(false);
                        }
                        current.fileset = Some(staged);
                        tx.put(&current).await?;
                        Ok(true)
                    })
                })
                .await?;
            if swapped {
                return Ok(());
            }
        }
    }

    async fn apply_op(&self, manifest: &mut Manifest, op: &FileOp) -> GraphResult<()> {
        match op {
            FileOp::Add { path, data } => {
                self.filesets()
                    .put_file(manifest, path, data.clone())
                    .await?;
            }
            FileOp::Delete { path } => {
                manifest.delete_path(path)?;
            }
            FileOp::Copy {
                src_repo,
                src_reference,
                src_path,
                dst_path,
            } => {
                let src_commit = self.resolve_commit(src_repo, src_reference).await?;
                let src_manifest = self.commit_manifest(&src_commit).await?;
                let src_path = clean_path(src_path)?;
                let dst_path = clean_path(dst_path)?;
                if let Some(entry) = src_manifest.get(&src_path) {
                    manifest.files.insert(dst_path, entry.clone());
                } else {
                    let prefix = if src_path == "/" {
                        "/".to_string()
                    } else {
                        format!("{src_path}/")
                    };
                    let mut copied = false;
                    for (path, entry) in &src_manifest.files {
                        if let Some(rest) = path.strip_prefix(&prefix) {
                            let target = if dst_path == "/" {
                                format!("/{rest}")
                            } else {
                                format!("{dst_path}/{rest}")
                            };
                            manifest.files.insert(target, entry.clone());
                            copied = true;
                        }
                    }
                    if !copied {
                        return Err(GraphError::Storage(StorageError::FileNotFound(format!(
                            "{src_repo}@{src_reference}:{src_path}"
                        ))));
                    }
                }
            }
        }
        Ok(())
    }

    /// Read file bytes, optionally a byte range.
    pub async fn get_file(
        &self,
        repo: &RepoName,
        reference: &str,
        path: &str,
        offset: u64,
        length: Option<u64>,
    ) -> GraphResult<Bytes> {
        let (_, manifest) = self.resolve_manifest(repo, reference).await?;
        if offset == 0 && length.is_none() {
            Ok(self.filesets().read_file(&manifest, path).await?)
        } else {
            Ok(self
                .filesets()
                .read_file_range(&manifest, path, offset, length)
                .await?)
        }
    }

    /// Export a subtree as a ustar archive.
    pub async fn get_file_tar(
        &self,
        repo: &RepoName,
        reference: &str,
        path: &str,
    ) -> GraphResult<Bytes> {
        let (_, manifest) = self.resolve_manifest(repo, reference).await?;
        Ok(watershed_storage::tar::write_tar(self.filesets(), &manifest, path).await?)
    }

    pub async fn inspect_file(
        &self,
        repo: &RepoName,
        reference: &str,
        path: &str,
    ) -> GraphResult<FileMetadata> {
        let (_, manifest) = self.resolve_manifest(repo, reference).await?;
        manifest
            .metadata(path)?
            .ok_or_else(|| GraphError::Storage(StorageError::FileNotFound(path.to_string())))
    }

    /// Entries directly under a directory.
    pub async fn list_file(
        &self,
        repo: &RepoName,
        reference: &str,
        path: &str,
    ) -> GraphResult<Vec<FileMetadata>> {
        let (_, manifest) = self.resolve_manifest(repo, reference).await?;
        if let Some(meta) = manifest.metadata(path)? {
            if !meta.is_dir {
                return Ok(vec![meta]);
            }
        }
        Ok(manifest.list_dir(path)?)
    }

    /// Every file under a path, recursively.
    pub async fn walk_file(
        &self,
        repo: &RepoName,
        reference: &str,
        path: &str,
    ) -> GraphResult<Vec<FileMetadata>> {
        let (_, manifest) = self.resolve_manifest(repo, reference).await?;
        Ok(manifest.walk(path)?)
    }

    /// Files and directories matching a glob.
    pub async fn glob_file(
        &self,
        repo: &RepoName,
        reference: &str,
        pattern: &str,
    ) -> GraphResult<Vec<FileMetadata>> {
        let (_, manifest) = self.resolve_manifest(repo, reference).await?;
        let glob = Glob::compile(pattern)?;
        Ok(manifest.glob(&glob))
    }

    /// Diff two commits; with no `old` reference, diff against the new
    /// commit's parent.
    pub async fn diff_file(
        &self,
        repo: &RepoName,
        new_reference: &str,
        old: Option<(&RepoName, &str)>,
    ) -> GraphResult<FileDiff> {
        let (new_commit, new_manifest) = self.resolve_manifest(repo, new_reference).await?;
        let old_manifest = match old {
            Some((old_repo, old_reference)) => {
                let (_, manifest) = self.resolve_manifest(old_repo, old_reference).await?;
                manifest
            }
            None => match new_commit.parent {
                Some(parent) => {
                    let (_, manifest) =
                        self.resolve_manifest(repo, &parent.to_string()).await?;
                    manifest
                }
                None => Manifest::new(),
            },
        };
        Ok(old_manifest.diff(&new_manifest))
    }

    async fn resolve_manifest(
        &self,
        repo: &RepoName,
        reference: &str,
    ) -> GraphResult<(CommitInfo, Manifest)> {
        let commit = self.resolve_commit(repo, reference).await?;
        let manifest = self.commit_manifest(&commit).await?;
        Ok((commit, manifest))
    }
}
