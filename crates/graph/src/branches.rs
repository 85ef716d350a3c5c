//! Branch operations: creation, provenance wiring, deletion.

use crate::error::{GraphError, GraphResult};
use crate::graph::{get_branch_tx, get_commit_tx, CommitGraph};
use crate::propagate::propagate;
use crate::triggers::fire_triggers;
use std::collections::{BTreeSet, VecDeque};
use watershed_core::ids::{BranchRef, CommitId, CommitRef, CommitSetId, RepoName};
use watershed_core::{BranchInfo, RepoInfo, Trigger};
use watershed_metadata::domain::{branch_key, index};
use watershed_metadata::Transaction;

impl CommitGraph {
    /// Create or update a branch.
    ///
    /// Provenance edits recompute subvenance on the affected branches in the
    /// same transaction. A provided `head` moves the pointer and triggers
    /// propagation; the propagated commit-set is the head's unless
    /// `new_commit_set` forces a fresh one.
    pub async fn create_branch(
        &self,
        branch: BranchRef,
        head: Option<CommitId>,
        provenance: Vec<BranchRef>,
        trigger: Option<Trigger>,
        new_commit_set: bool,
    ) -> GraphResult<BranchInfo> {
        let empty = self.empty_fileset().clone();
        self.store()
            .transact(move |tx| {
                let branch = branch.clone();
                let provenance = provenance.clone();
                let trigger = trigger.clone();
                let empty = empty.clone();
                Box::pin(async move {
                    create_branch_tx(tx, &empty, branch, head, provenance, trigger, new_commit_set)
                        .await
                })
            })
            .await
    }

    pub async fn inspect_branch(&self, branch: &BranchRef) -> GraphResult<BranchInfo> {
        self.store()
            .try_get(&branch_key(branch))
            .await?
            .ok_or_else(|| GraphError::BranchNotFound(branch.clone()))
    }

    /// All branches of a repo in creation order.
    pub async fn list_branch(&self, repo: &RepoName) -> GraphResult<Vec<BranchInfo>> {
        if self.store().try_get::<RepoInfo>(repo.as_str()).await?.is_none() {
            return Err(GraphError::RepoNotFound(repo.clone()));
        }
        Ok(self
            .store()
            .get_by_index(index::branches::REPO, repo.as_str())
            .await?)
    }

    /// Re-run propagation from a branch under a fresh commit-set, as if its
    /// provenance heads had just moved. Used to force a pipeline run over
    /// the current inputs.
    pub async fn propagate_branch(
        &self,
        branch: BranchRef,
        commit_set: CommitSetId,
    ) -> GraphResult<Vec<CommitRef>> {
        let empty = self.empty_fileset().clone();
        self.store()
            .transact(move |tx| {
                let branch = branch.clone();
                let empty = empty.clone();
                Box::pin(async move { propagate(tx, &empty, &[branch], commit_set).await })
            })
            .await
    }

    /// Delete a branch. Commits stay; downstream branches block deletion
    /// unless `force`, which severs their provenance edges instead.
    pub async fn delete_branch(&self, branch: &BranchRef, force: bool) -> GraphResult<()> {
        let branch = branch.clone();
        self.store()
            .transact(move |tx| {
                let branch = branch.clone();
                Box::pin(async move {
                    let key = branch_key(&branch);
                    let Some(info) = tx.try_get::<BranchInfo>(&key).await? else {
                        return Err(GraphError::BranchNotFound(branch));
                    };
                    if !info.subvenance.is_empty() && !force {
                        return Err(GraphError::Precondition(format!(
                            "branch {branch} has {} dependent branches; delete them first \
                             or pass force",
                            info.subvenance.len()
                        )));
                    }
                    for downstream_ref in &info.subvenance {
                        if let Some(mut downstream) =
                            tx.try_get::<BranchInfo>(&branch_key(downstream_ref)).await?
                        {
                            downstream.direct_provenance.retain(|b| *b != branch);
                            tx.put(&downstream).await?;
                        }
                    }
                    for upstream_ref in &info.direct_provenance {
                        if let Some(mut upstream) =
                            tx.try_get::<BranchInfo>(&branch_key(upstream_ref)).await?
                        {
                            upstream.subvenance.retain(|b| *b != branch);
                            tx.put(&upstream).await?;
                        }
                    }
                    tx.delete::<BranchInfo>(&key).await?;
                    Ok(())
                })
            })
            .await
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn create_branch_tx(
    tx: &mut Transaction,
    empty_fileset: &watershed_core::FilesetId,
    branch_ref: BranchRef,
    head: Option<CommitId>,
    provenance: Vec<BranchRef>,
    trigger: Option<Trigger>,
    new_commit_set: bool,
) -> GraphResult<BranchInfo> {
    if tx
        .try_get::<RepoInfo>(branch_ref.repo.as_str())
        .await?
        .is_none()
    {
        return Err(GraphError::RepoNotFound(branch_ref.repo.clone()));
    }

    let key = branch_key(&branch_ref);
    let mut branch = match tx.try_get::<BranchInfo>(&key).await? {
        Some(existing) => existing,
        None => BranchInfo::new(branch_ref.repo.clone(), branch_ref.name.clone()),
    };

    if let Some(trigger) = &trigger {
        trigger.validate()?;
        if trigger.source_branch == branch_ref.name {
            return Err(GraphError::Precondition(format!(
                "branch {branch_ref} cannot trigger on itself"
            )));
        }
    }

    let mut new_provenance: Vec<BranchRef> = Vec::new();
    for upstream in provenance {
        if upstream == branch_ref {
            return Err(GraphError::ProvenanceCycle {
                branch: branch_ref.clone(),
            });
        }
        if !new_provenance.contains(&upstream) {
            new_provenance.push(upstream);
        }
    }
    ensure_acyclic(tx, &branch_ref, &new_provenance).await?;

    // auto-create missing provenance branches, then rewire subvenance
    let old_provenance: BTreeSet<BranchRef> =
        branch.direct_provenance.iter().cloned().collect();
    let new_set: BTreeSet<BranchRef> = new_provenance.iter().cloned().collect();
    for removed in old_provenance.difference(&new_set) {
        if let Some(mut upstream) = tx.try_get::<BranchInfo>(&branch_key(removed)).await? {
            upstream.subvenance.retain(|b| *b != branch_ref);
            tx.put(&upstream).await?;
        }
    }
    for added in new_set.difference(&old_provenance) {
        if tx.try_get::<RepoInfo>(added.repo.as_str()).await?.is_none() {
            return Err(GraphError::RepoNotFound(added.repo.clone()));
        }
        let mut upstream = match tx.try_get::<BranchInfo>(&branch_key(added)).await? {
            Some(upstream) => upstream,
            None => BranchInfo::new(added.repo.clone(), added.name.clone()),
        };
        if !upstream.subvenance.contains(&branch_ref) {
            upstream.subvenance.push(branch_ref.clone());
        }
        tx.put(&upstream).await?;
    }
    let provenance_changed = old_provenance != new_set;
    branch.direct_provenance = new_provenance;
    branch.trigger = trigger;

    // head move
    let mut moved_head: Option<CommitRef> = None;
    if let Some(head_id) = head {
        let head_ref = CommitRef::new(branch_ref.repo.clone(), head_id);
        get_commit_tx(tx, &head_ref).await?;
        if branch.head != Some(head_id) {
            branch.head = Some(head_id);
            moved_head = Some(head_ref);
        }
    }
    tx.put(&branch).await?;

    if let Some(head_ref) = moved_head {
        let head = get_commit_tx(tx, &head_ref).await?;
        let commit_set = if new_commit_set {
            CommitSetId::new()
        } else {
            head.commit_set
        };
        let mut seeds = vec![branch_ref.clone()];
        if head.is_finished() {
            seeds.extend(fire_triggers(tx, &branch_ref, &head).await?);
        }
        propagate(tx, empty_fileset, &seeds, commit_set).await?;
    } else if provenance_changed && !branch.direct_provenance.is_empty() {
        // A new derived branch backfills a commit from the current upstream
        // heads. An upstream commit that is still open defers the backfill:
        // finishing it propagates into this branch anyway.
        let mut upstream_open = false;
        for upstream_ref in &branch.direct_provenance {
            let upstream = get_branch_tx(tx, upstream_ref).await?;
            if let Some(head_id) = upstream.head {
                let head =
                    get_commit_tx(tx, &CommitRef::new(upstream_ref.repo.clone(), head_id))
                        .await?;
                if head.is_open() {
                    tracing::debug!(
                        branch = %branch_ref,
                        head = %head.commit_ref(),
                        "Deferring backfill until the open upstream commit finishes"
                    );
                    upstream_open = true;
                    break;
                }
            }
        }
        if !upstream_open {
            propagate(tx, empty_fileset, &[branch_ref.clone()], CommitSetId::new()).await?;
        }
    }

    let branch = tx.get::<BranchInfo>(&key).await?;
    Ok(branch)
}

/// Reject provenance that would close a cycle: nothing reachable from the
/// proposed provenance may lead back to the branch itself.
async fn ensure_acyclic(
    tx: &mut Transaction,
    branch: &BranchRef,
    provenance: &[BranchRef],
) -> GraphResult<()> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<BranchRef> = provenance.iter().cloned().collect();
    while let Some(current) = queue.pop_front() {
        if current == *branch {
            return Err(GraphError::ProvenanceCycle {
                branch: branch.clone(),
            });
        }
        if !seen.insert(branch_key(&current)) {
            continue;
        }
        if let Some(info) = tx.try_get::<BranchInfo>(&branch_key(&current)).await? {
            for upstream in info.direct_provenance {
                queue.push_back(upstream);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{branch_ref, graph, repo};
    use watershed_core::RepoType;

    #[tokio::test]
    async fn test_create_and_inspect_branch() {
        let graph = graph().await;
        repo(&graph, "data", RepoType::User).await;
        let b = branch_ref("data", "master");
        graph
            .create_branch(b.clone(), None, vec![], None, false)
            .await
            .unwrap();
        let info = graph.inspect_branch(&b).await.unwrap();
        assert!(info.head.is_none());
        assert_eq!(graph.list_branch(&b.repo).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_provenance_maintains_subvenance() {
        let graph = graph().await;
        repo(&graph, "a", RepoType::User).await;
        repo(&graph, "b", RepoType::User).await;
        let a = branch_ref("a", "master");
        let b = branch_ref("b", "master");
        graph
            .create_branch(b.clone(), None, vec![a.clone()], None, false)
            .await
            .unwrap();

        // the provenance branch was auto-created and back-linked
        let upstream = graph.inspect_branch(&a).await.unwrap();
        assert_eq!(upstream.subvenance, vec![b.clone()]);

        // dropping the edge clears subvenance
        graph
            .create_branch(b.clone(), None, vec![], None, false)
            .await
            .unwrap();
        let upstream = graph.inspect_branch(&a).await.unwrap();
        assert!(upstream.subvenance.is_empty());
    }

    #[tokio::test]
    async fn test_cycles_are_rejected() {
        let graph = graph().await;
        repo(&graph, "a", RepoType::User).await;
        repo(&graph, "b", RepoType::User).await;
        let a = branch_ref("a", "master");
        let b = branch_ref("b", "master");
        graph
            .create_branch(b.clone(), None, vec![a.clone()], None, false)
            .await
            .unwrap();

        // a -> b -> a
        assert!(matches!(
            graph
                .create_branch(a.clone(), None, vec![b.clone()], None, false)
                .await,
            Err(GraphError::ProvenanceCycle { .. })
        ));
        // self-loop
        assert!(matches!(
            graph
                .create_branch(a.clone(), None, vec![a.clone()], None, false)
                .await,
            Err(GraphError::ProvenanceCycle { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_branch_guards_subvenance() {
        let graph = graph().await;
        repo(&graph, "a", RepoType::User).await;
        repo(&graph, "b", RepoType::User).await;
        let a = branch_ref("a", "master");
        let b = branch_ref("b", "master");
        graph
            .create_branch(b.clone(), None, vec![a.clone()], None, false)
            .await
            .unwrap();

        assert!(matches!(
            graph.delete_branch(&a, false).await,
            Err(GraphError::Precondition(_))
        ));
        graph.delete_branch(&a, true).await.unwrap();
        let downstream = graph.inspect_branch(&b).await.unwrap();
        assert!(downstream.direct_provenance.is_empty());
    }
}
