//! Shared helpers for the graph tests.

use crate::graph::CommitGraph;
use bytes::Bytes;
use std::sync::Arc;
use watershed_core::ids::{BranchRef, RepoName};
use watershed_core::{CommitInfo, RepoType};
use watershed_metadata::MetadataStore;
use watershed_storage::{FilesetStore, MemoryBackend};

pub(crate) async fn graph() -> CommitGraph {
    let store = Arc::new(MetadataStore::open_in_memory().await.unwrap());
    let filesets = FilesetStore::new(Arc::new(MemoryBackend::new()));
    CommitGraph::new(store, filesets).await.unwrap()
}

pub(crate) async fn repo(graph: &CommitGraph, name: &str, typ: RepoType) -> RepoName {
    let name = RepoName::new(name).unwrap();
    graph
        .create_repo(name.clone(), typ, String::new(), false)
        .await
        .unwrap();
    name
}

pub(crate) fn branch_ref(repo: &str, name: &str) -> BranchRef {
    BranchRef::parse(&format!("{repo}@{name}")).unwrap()
}

/// Start a commit on `repo@branch`, write the given files, and finish it.
pub(crate) async fn commit_files(
    graph: &CommitGraph,
    repo: &str,
    branch: &str,
    files: &[(&str, &[u8])],
) -> CommitInfo {
    let branch = branch_ref(repo, branch);
    let commit = graph
        .start_commit(branch.clone(), None, String::new())
        .await
        .unwrap();
    let ops = files
        .iter()
        .map(|(path, data)| crate::files::FileOp::Add {
            path: path.to_string(),
            data: Bytes::copy_from_slice(data),
        })
        .collect();
    graph
        .modify_file(&branch.repo, &commit.id.to_string(), ops)
        .await
        .unwrap();
    graph
        .finish_commit(&branch.repo, &commit.id.to_string(), None, false)
        .await
        .unwrap()
}
