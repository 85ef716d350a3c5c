//! The commit graph engine.
//!
//! `CommitGraph` owns the repo, branch, and commit collections and enforces
//! the graph invariants. All mutations run inside metadata transactions;
//! chunk I/O (manifest reads, size computation) happens outside them.

use crate::error::{GraphError, GraphResult};
use std::sync::Arc;
use watershed_core::ids::{BranchRef, CommitId, CommitRef, RepoName};
use watershed_core::{BranchInfo, CommitInfo, FilesetId};
use watershed_metadata::domain::{branch_key, commit_key};
use watershed_metadata::store::TxError;
use watershed_metadata::{MetadataError, MetadataStore, Transaction};
use watershed_storage::{FilesetStore, Manifest};

impl TxError for GraphError {
    fn as_metadata(&self) -> Option<&MetadataError> {
        match self {
            GraphError::Metadata(e) => Some(e),
            _ => None,
        }
    }
}

/// The commit/branch graph engine.
#[derive(Clone)]
pub struct CommitGraph {
    store: Arc<MetadataStore>,
    filesets: FilesetStore,
    /// Handle of the empty fileset, written once at startup so propagation
    /// never touches the chunk store inside a transaction.
    empty_fileset: FilesetId,
}

impl CommitGraph {
    pub async fn new(store: Arc<MetadataStore>, filesets: FilesetStore) -> GraphResult<Self> {
        let empty_fileset = filesets.empty().await?;
        Ok(Self {
            store,
            filesets,
            empty_fileset,
        })
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn filesets(&self) -> &FilesetStore {
        &self.filesets
    }

    pub fn empty_fileset(&self) -> &FilesetId {
        &self.empty_fileset
    }

    /// Resolve a commit reference (a commit id or a branch name) to the
    /// commit it names right now.
    pub async fn resolve_commit(
        &self,
        repo: &RepoName,
        reference: &str,
    ) -> GraphResult<CommitInfo> {
        if let Ok(id) = CommitId::parse(reference) {
            let commit_ref = CommitRef::new(repo.clone(), id);
            if let Some(commit) = self
                .store
                .try_get::<CommitInfo>(&commit_key(&commit_ref))
                .await?
            {
                return Ok(commit);
            }
            return Err(GraphError::CommitNotFound(commit_ref.to_string()));
        }

        let name = reference
            .parse()
            .map_err(|_| GraphError::CommitNotFound(format!("{repo}@{reference}")))?;
        let branch = BranchRef::new(repo.clone(), name);
        let info: BranchInfo = self
            .store
            .try_get(&branch_key(&branch))
            .await?
            .ok_or_else(|| GraphError::BranchNotFound(branch.clone()))?;
        let head = info
            .head
            .ok_or_else(|| GraphError::CommitNotFound(format!("{branch} has no commits")))?;
        let commit_ref = CommitRef::new(repo.clone(), head);
        self.store
            .try_get(&commit_key(&commit_ref))
            .await?
            .ok_or(GraphError::CommitDeleted(commit_ref))
    }

    /// The staged (open) or final (finished) manifest of a commit.
    pub async fn commit_manifest(&self, commit: &CommitInfo) -> GraphResult<Manifest> {
        match &commit.fileset {
            Some(id) => Ok(self.filesets.read_manifest(id).await?),
            None => Ok(Manifest::new()),
        }
    }
}

/// Transactional lookup helpers shared by the graph modules.
pub(crate) async fn get_branch_tx(
    tx: &mut Transaction,
    branch: &BranchRef,
) -> GraphResult<BranchInfo> {
    tx.try_get(&branch_key(branch))
        .await?
        .ok_or_else(|| GraphError::BranchNotFound(branch.clone()))
}

pub(crate) async fn get_commit_tx(
    tx: &mut Transaction,
    commit: &CommitRef,
) -> GraphResult<CommitInfo> {
    tx.try_get(&commit_key(commit))
        .await?
        .ok_or_else(|| GraphError::CommitNotFound(commit.to_string()))
}
