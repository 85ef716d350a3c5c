//! Branch propagation: materializing new commits downstream of a moved head.
//!
//! Runs entirely inside the caller's metadata transaction. The propagator
//! only moves pointers and inserts rows; it never blocks on user work and
//! never touches the chunk store.

use crate::error::{GraphError, GraphResult};
use crate::graph::{get_branch_tx, get_commit_tx};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use time::OffsetDateTime;
use watershed_core::ids::{BranchRef, CommitId, CommitRef, CommitSetId};
use watershed_core::{BranchInfo, CommitInfo, CommitOrigin, FilesetId, RepoInfo};
use watershed_metadata::domain::{branch_key, index};
use watershed_metadata::Transaction;

/// Propagate a head move to every downstream branch, creating commits in
/// `commit_set`. `seeds` are the branches that just moved (or were just
/// created with provenance). Returns the commits created, aliases included.
pub(crate) async fn propagate(
    tx: &mut Transaction,
    empty_fileset: &FilesetId,
    seeds: &[BranchRef],
    commit_set: CommitSetId,
) -> GraphResult<Vec<CommitRef>> {
    let order = downstream_order(tx, seeds).await?;
    let mut created = Vec::new();

    'branches: for branch_ref in order {
        // Re-read: earlier iterations may have moved this branch's
        // provenance heads.
        let mut branch = get_branch_tx(tx, &branch_ref).await?;
        if branch.direct_provenance.is_empty() {
            // only explicit commits move provenance-less branches
            continue;
        }

        // At most one commit per repo per commit-set. Kept current as this
        // pass adds aliases and commits of its own.
        let mut set_commits: Vec<CommitInfo> = tx
            .get_by_index(index::commits::COMMIT_SET, &commit_set.to_string())
            .await?;
        if let Some(existing) = set_commits.iter().find(|c| c.repo == branch.repo) {
            if Some(existing.id) != branch.head {
                tracing::debug!(
                    branch = %branch_ref,
                    commit = %existing.id,
                    "Repo already carries a commit in this commit set on another branch"
                );
            }
            continue;
        }

        // Gather the provenance commits for this set. A provenance repo that
        // already carries a commit in the set contributes that commit even
        // if its branch head has moved on to a newer set; otherwise the
        // current head joins the set, aliased in when it predates it.
        let mut heads: Vec<CommitInfo> = Vec::new();
        for upstream_ref in branch.direct_provenance.clone() {
            if let Some(member) = set_commits
                .iter()
                .find(|c| c.repo == upstream_ref.repo)
            {
                if member.is_open() {
                    // it will finish inside this set; propagation resumes then
                    continue 'branches;
                }
                heads.push(member.clone());
                continue;
            }
            let upstream = get_branch_tx(tx, &upstream_ref).await?;
            let Some(head_id) = upstream.head else {
                continue;
            };
            let head = get_commit_tx(tx, &CommitRef::new(upstream_ref.repo.clone(), head_id))
                .await?;

            if head.is_open() {
                // open in this set would have been found above
                return Err(GraphError::Unpropagatable {
                    branch: branch_ref.clone(),
                    head: head.commit_ref(),
                });
            }
            let alias = alias_commit(tx, upstream, head, commit_set).await?;
            created.push(alias.commit_ref());
            set_commits.push(alias.clone());
            heads.push(alias);
        }
        if heads.is_empty() {
            continue;
        }

        let repo: RepoInfo = tx
            .try_get(branch.repo.as_str())
            .await?
            .ok_or_else(|| GraphError::RepoNotFound(branch.repo.clone()))?;

        let now = OffsetDateTime::now_utc();
        let mut commit = CommitInfo {
            repo: branch.repo.clone(),
            id: CommitId::new(),
            branch: branch.name.clone(),
            parent: branch.head,
            children: Vec::new(),
            commit_set,
            origin: CommitOrigin::Auto,
            direct_provenance: heads.iter().map(CommitInfo::commit_ref).collect(),
            started: now,
            finished: None,
            size_bytes: None,
            fileset: None,
            error: String::new(),
            description: String::new(),
        };
        if !repo.typ.finished_by_controller() {
            // nothing will run a transform here; finish by aliasing content
            commit.finished = Some(now);
            if let [only] = heads.as_slice() {
                commit.fileset = only.fileset.clone();
                commit.size_bytes = only.size_bytes;
                commit.error = only.error.clone();
            } else {
                commit.fileset = Some(empty_fileset.clone());
                commit.size_bytes = Some(0);
            }
        }

        link_parent(tx, &commit).await?;
        tx.insert(&commit).await?;
        branch.head = Some(commit.id);
        tx.put(&branch).await?;
        created.push(commit.commit_ref());
        tracing::debug!(
            branch = %branch_ref,
            commit = %commit.id,
            commit_set = %commit_set,
            open = commit.is_open(),
            "Propagated commit"
        );
    }
    Ok(created)
}

/// Create an alias on `branch`: a finished commit sharing `head`'s content,
/// pulling the branch into `commit_set`.
async fn alias_commit(
    tx: &mut Transaction,
    mut branch: BranchInfo,
    head: CommitInfo,
    commit_set: CommitSetId,
) -> GraphResult<CommitInfo> {
    let now = OffsetDateTime::now_utc();
    let alias = CommitInfo {
        repo: branch.repo.clone(),
        id: CommitId::new(),
        branch: branch.name.clone(),
        parent: Some(head.id),
        children: Vec::new(),
        commit_set,
        origin: CommitOrigin::Alias,
        direct_provenance: Vec::new(),
        started: now,
        finished: Some(now),
        size_bytes: head.size_bytes,
        fileset: head.fileset.clone(),
        error: head.error.clone(),
        description: String::new(),
    };
    link_parent(tx, &alias).await?;
    tx.insert(&alias).await?;
    branch.head = Some(alias.id);
    tx.put(&branch).await?;
    Ok(alias)
}

async fn link_parent(tx: &mut Transaction, commit: &CommitInfo) -> GraphResult<()> {
    if let Some(parent_id) = commit.parent {
        let parent_ref = CommitRef::new(commit.repo.clone(), parent_id);
        let mut parent = get_commit_tx(tx, &parent_ref).await?;
        parent.children.push(commit.id);
        tx.put(&parent).await?;
    }
    Ok(())
}

/// The subvenance closure of `seeds`, deepest dependency first: every
/// branch appears after all of its in-closure provenance.
async fn downstream_order(
    tx: &mut Transaction,
    seeds: &[BranchRef],
) -> GraphResult<Vec<BranchRef>> {
    let mut closure: BTreeMap<String, BranchInfo> = BTreeMap::new();
    let mut queue: VecDeque<BranchRef> = seeds.iter().cloned().collect();
    while let Some(branch_ref) = queue.pop_front() {
        let key = branch_key(&branch_ref);
        if closure.contains_key(&key) {
            continue;
        }
        let branch = get_branch_tx(tx, &branch_ref).await?;
        for downstream in &branch.subvenance {
            queue.push_back(downstream.clone());
        }
        closure.insert(key, branch);
    }

    // Kahn's algorithm over the in-closure provenance edges; ready set kept
    // sorted so the order is deterministic.
    let mut indegree: BTreeMap<String, usize> = BTreeMap::new();
    for (key, branch) in &closure {
        let degree = branch
            .direct_provenance
            .iter()
            .filter(|p| closure.contains_key(&branch_key(p)))
            .count();
        indegree.insert(key.clone(), degree);
    }
    let mut ready: BTreeSet<String> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(k, _)| k.clone())
        .collect();
    let mut placed: BTreeSet<String> = BTreeSet::new();
    let mut order = Vec::with_capacity(closure.len());
    while let Some(key) = ready.iter().next().cloned() {
        ready.remove(&key);
        if !placed.insert(key.clone()) {
            continue;
        }
        let branch = &closure[&key];
        order.push(branch.branch_ref());
        for downstream in &branch.subvenance {
            let downstream_key = branch_key(downstream);
            if let Some(degree) = indegree.get_mut(&downstream_key) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 && !placed.contains(&downstream_key) {
                    ready.insert(downstream_key);
                }
            }
        }
    }
    debug_assert_eq!(order.len(), closure.len(), "provenance closure has a cycle");
    Ok(order)
}
