//! Commit operations: start, finish, inspect, squash.

use crate::error::{GraphError, GraphResult};
use crate::graph::{get_commit_tx, CommitGraph};
use crate::propagate::propagate;
use crate::triggers::fire_triggers;
use std::collections::{BTreeMap, BTreeSet};
use time::OffsetDateTime;
use watershed_core::ids::{BranchName, BranchRef, CommitId, CommitRef, CommitSetId, RepoName};
use watershed_core::{BranchInfo, CommitInfo, CommitOrigin, CommitSetInfo, FilesetId, JobInfo, RepoInfo};
use watershed_metadata::domain::{branch_key, index};
use watershed_metadata::{Order, Transaction, WatchFilter, Watcher};

impl CommitGraph {
    /// Open a new commit on a branch.
    ///
    /// The branch is created on first use. An explicit `parent` wins over
    /// the branch head; the staged content starts from the parent's.
    pub async fn start_commit(
        &self,
        branch_ref: BranchRef,
        parent: Option<CommitId>,
        description: String,
    ) -> GraphResult<CommitInfo> {
        let empty = self.empty_fileset().clone();
        self.store()
            .transact(move |tx| {
                let branch_ref = branch_ref.clone();
                let description = description.clone();
                let empty = empty.clone();
                Box::pin(async move {
                    if tx
                        .try_get::<RepoInfo>(branch_ref.repo.as_str())
                        .await?
                        .is_none()
                    {
                        return Err(GraphError::RepoNotFound(branch_ref.repo.clone()));
                    }
                    let key = branch_key(&branch_ref);
                    let mut branch = match tx.try_get::<BranchInfo>(&key).await? {
                        Some(branch) => branch,
                        None => BranchInfo::new(branch_ref.repo.clone(), branch_ref.name.clone()),
                    };
                    if !branch.direct_provenance.is_empty() {
                        return Err(GraphError::Precondition(format!(
                            "cannot start a commit on {branch_ref}: it is derived from {} \
                             other branches",
                            branch.direct_provenance.len()
                        )));
                    }

                    let parent_id = match parent {
                        Some(id) => {
                            let parent_ref = CommitRef::new(branch_ref.repo.clone(), id);
                            if tx
                                .try_get::<CommitInfo>(
                                    &watershed_metadata::domain::commit_key(&parent_ref),
                                )
                                .await?
                                .is_none()
                            {
                                return Err(GraphError::InvalidParent(parent_ref.to_string()));
                            }
                            Some(id)
                        }
                        None => branch.head,
                    };
                    let staged = match parent_id {
                        Some(id) => {
                            get_commit_tx(tx, &CommitRef::new(branch_ref.repo.clone(), id))
                                .await?
                                .fileset
                        }
                        None => None,
                    };

                    let commit = CommitInfo {
                        repo: branch_ref.repo.clone(),
                        id: CommitId::new(),
                        branch: branch_ref.name.clone(),
                        parent: parent_id,
                        children: Vec::new(),
                        commit_set: CommitSetId::new(),
                        origin: CommitOrigin::User,
                        direct_provenance: Vec::new(),
                        started: OffsetDateTime::now_utc(),
                        finished: None,
                        size_bytes: None,
                        fileset: staged,
                        error: String::new(),
                        description,
                    };
                    if let Some(parent_id) = commit.parent {
                        let parent_ref = CommitRef::new(commit.repo.clone(), parent_id);
                        let mut parent = get_commit_tx(tx, &parent_ref).await?;
                        parent.children.push(commit.id);
                        tx.put(&parent).await?;
                    }
                    tx.insert(&commit).await?;
                    branch.head = Some(commit.id);
                    tx.put(&branch).await?;

                    propagate(tx, &empty, &[branch_ref], commit.commit_set).await?;
                    Ok(commit)
                })
            })
            .await
    }

    /// Finish an open commit, freezing its staged content.
    ///
    /// The content size is computed outside the transaction; if a concurrent
    /// write moves the staged fileset meanwhile, the whole step retries.
    pub async fn finish_commit(
        &self,
        repo: &RepoName,
        reference: &str,
        error: Option<String>,
        force: bool,
    ) -> GraphResult<CommitInfo> {
        loop {
            let commit = self.resolve_commit(repo, reference).await?;
            if commit.is_finished() {
                return Err(GraphError::CommitFinished(commit.commit_ref()));
            }
            let fileset = match &commit.fileset {
                Some(id) => id.clone(),
                None => self.empty_fileset().clone(),
            };
            let size = self.filesets().read_manifest(&fileset).await?.size_bytes();

            let empty = self.empty_fileset().clone();
            let commit_ref = commit.commit_ref();
            let expected = commit.fileset.clone();
            let error = error.clone();
            let finished = self
                .store()
                .transact(move |tx| {
                    let empty = empty.clone();
                    let commit_ref = commit_ref.clone();
                    let expected = expected.clone();
                    let fileset = fileset.clone();
                    let error = error.clone();
                    Box::pin(async move {
                        let current = get_commit_tx(tx, &commit_ref).await?;
                        if current.fileset != expected {
                            // staged content moved under us; re-size and retry
                            return Ok::<Option<CommitInfo>, GraphError>(None);
                        }
                        let commit = finish_commit_tx(
                            tx,
                            &empty,
                            &commit_ref,
                            Some(fileset),
                            size,
                            error,
                            force,
                        )
                        .await?;
                        Ok(Some(commit))
                    })
                })
                .await?;
            if let Some(commit) = finished {
                return Ok(commit);
            }
        }
    }

    /// Fetch a commit; with `wait`, block until it reaches a terminal
    /// (finished) state.
    pub async fn inspect_commit(
        &self,
        repo: &RepoName,
        reference: &str,
        wait: bool,
    ) -> GraphResult<CommitInfo> {
        let commit = self.resolve_commit(repo, reference).await?;
        if !wait || commit.is_finished() {
            return Ok(commit);
        }
        let key = watershed_metadata::domain::commit_key(&commit.commit_ref());
        let mut watcher: Watcher<CommitInfo> =
            self.store().watch(WatchFilter::Key(key.clone()));
        // the commit may have finished between the read and the subscribe
        let commit: CommitInfo = self.store().get(&key).await?;
        if commit.is_finished() {
            return Ok(commit);
        }
        loop {
            match watcher.next().await {
                Ok(event) => {
                    if event.record.is_finished() {
                        return Ok(event.record);
                    }
                }
                Err(watershed_metadata::MetadataError::WatchLagged) => {
                    let commit: CommitInfo = self.store().get(&key).await?;
                    if commit.is_finished() {
                        return Ok(commit);
                    }
                    watcher = self.store().watch(WatchFilter::Key(key.clone()));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Commits of a repo (optionally one branch), newest first unless
    /// `reverse`.
    pub async fn list_commit(
        &self,
        repo: &RepoName,
        branch: Option<&BranchName>,
        number: Option<u64>,
        reverse: bool,
    ) -> GraphResult<Vec<CommitInfo>> {
        if self.store().try_get::<RepoInfo>(repo.as_str()).await?.is_none() {
            return Err(GraphError::RepoNotFound(repo.clone()));
        }
        let mut commits: Vec<CommitInfo> = match branch {
            Some(branch) => {
                self.store()
                    .get_by_index(index::commits::BRANCH, &format!("{repo}@{branch}"))
                    .await?
            }
            None => {
                self.store()
                    .get_by_index(index::commits::REPO, repo.as_str())
                    .await?
            }
        };
        if !reverse {
            commits.reverse();
        }
        if let Some(number) = number {
            commits.truncate(number as usize);
        }
        Ok(commits)
    }

    /// Watch commit changes on a repo or a single branch.
    pub fn subscribe_commit(
        &self,
        repo: &RepoName,
        branch: Option<&BranchName>,
    ) -> Watcher<CommitInfo> {
        let filter = match branch {
            Some(branch) => {
                WatchFilter::Index(index::commits::BRANCH, format!("{repo}@{branch}"))
            }
            None => WatchFilter::Index(index::commits::REPO, repo.to_string()),
        };
        self.store().watch(filter)
    }

    pub async fn inspect_commit_set(&self, id: CommitSetId) -> GraphResult<CommitSetInfo> {
        let commits: Vec<CommitInfo> = self
            .store()
            .get_by_index(index::commits::COMMIT_SET, &id.to_string())
            .await?;
        if commits.is_empty() {
            return Err(GraphError::CommitSetNotFound(id));
        }
        Ok(CommitSetInfo { id, commits })
    }

    /// All commit-sets, oldest first.
    pub async fn list_commit_set(&self) -> GraphResult<Vec<CommitSetInfo>> {
        let commits: Vec<CommitInfo> = self.store().list(Order::Asc).await?;
        let mut sets: Vec<CommitSetInfo> = Vec::new();
        let mut by_id: BTreeMap<String, usize> = BTreeMap::new();
        for commit in commits {
            let key = commit.commit_set.to_string();
            match by_id.get(&key) {
                Some(i) => sets[*i].commits.push(commit),
                None => {
                    by_id.insert(key, sets.len());
                    sets.push(CommitSetInfo {
                        id: commit.commit_set,
                        commits: vec![commit],
                    });
                }
            }
        }
        Ok(sets)
    }

    /// Remove every commit in a set, reparenting children onto the squashed
    /// commits' parents.
    pub async fn squash_commit_set(&self, id: CommitSetId) -> GraphResult<()> {
        self.remove_commit_set(id, true).await
    }

    /// Remove a commit-set that nothing observes: no downstream commits in
    /// other sets, no children parented on its commits.
    pub async fn drop_commit_set(&self, id: CommitSetId) -> GraphResult<()> {
        self.remove_commit_set(id, false).await
    }

    async fn remove_commit_set(&self, id: CommitSetId, reparent: bool) -> GraphResult<()> {
        self.store()
            .transact(move |tx| {
                Box::pin(async move { remove_commit_set_tx(tx, id, reparent).await })
            })
            .await
    }
}

/// Finish a commit inside an existing transaction. The pipeline controller
/// uses this to finish output commits and job rows atomically; `size` must
/// be precomputed because transactions never touch the chunk store.
pub async fn finish_commit_tx(
    tx: &mut Transaction,
    empty_fileset: &FilesetId,
    commit_ref: &CommitRef,
    fileset: Option<FilesetId>,
    size: u64,
    error: Option<String>,
    force: bool,
) -> GraphResult<CommitInfo> {
    let mut commit = get_commit_tx(tx, commit_ref).await?;
    if commit.is_finished() {
        return Err(GraphError::CommitFinished(commit_ref.clone()));
    }
    if !force {
        for upstream in &commit.direct_provenance {
            let upstream = get_commit_tx(tx, upstream).await?;
            if upstream.is_open() {
                return Err(GraphError::Precondition(format!(
                    "provenance commit {} is not finished",
                    upstream.commit_ref()
                )));
            }
        }
    }

    commit.finished = Some(OffsetDateTime::now_utc());
    commit.error = error.unwrap_or_default();
    commit.fileset = fileset.or(commit.fileset).or(Some(empty_fileset.clone()));
    commit.size_bytes = Some(size);
    tx.put(&commit).await?;

    refresh_repo_size(tx, &commit.repo).await?;

    let source = BranchRef::new(commit.repo.clone(), commit.branch.clone());
    let mut seeds = vec![source.clone()];
    seeds.extend(fire_triggers(tx, &source, &commit).await?);
    propagate(tx, empty_fileset, &seeds, commit.commit_set).await?;
    Ok(commit)
}

/// Recompute a repo's size upper bound: the sum of its branch-head sizes.
async fn refresh_repo_size(tx: &mut Transaction, repo: &RepoName) -> GraphResult<()> {
    let Some(mut info) = tx.try_get::<RepoInfo>(repo.as_str()).await? else {
        return Ok(());
    };
    let branches: Vec<BranchInfo> = tx
        .get_by_index(index::branches::REPO, repo.as_str())
        .await?;
    let mut total = 0u64;
    for branch in branches {
        if let Some(head) = branch.head {
            let head = get_commit_tx(tx, &CommitRef::new(repo.clone(), head)).await?;
            total += head.size_bytes.unwrap_or(0);
        }
    }
    if info.size_bytes_upper_bound != total {
        info.size_bytes_upper_bound = total;
        tx.put(&info).await?;
    }
    Ok(())
}

async fn remove_commit_set_tx(
    tx: &mut Transaction,
    id: CommitSetId,
    reparent: bool,
) -> GraphResult<()> {
    let commits: Vec<CommitInfo> = tx
        .get_by_index(index::commits::COMMIT_SET, &id.to_string())
        .await?;
    if commits.is_empty() {
        return Err(GraphError::CommitSetNotFound(id));
    }
    let set_ids: BTreeSet<CommitId> = commits.iter().map(|c| c.id).collect();

    // Provenance never crosses commit-sets directly; dependency on this set
    // from later sets shows up as alias commits parented on its members.
    // Those sets must be squashed first.
    for commit in &commits {
        for child_id in &commit.children {
            if set_ids.contains(child_id) {
                continue;
            }
            let child_ref = CommitRef::new(commit.repo.clone(), *child_id);
            let child = get_commit_tx(tx, &child_ref).await?;
            if child.origin == CommitOrigin::Alias {
                return Err(GraphError::Precondition(format!(
                    "commit set {} is still referenced by alias {} in set {}; \
                     squash that set first",
                    id,
                    child.commit_ref(),
                    child.commit_set
                )));
            }
        }
    }

    // nearest surviving ancestor per squashed commit
    let by_id: BTreeMap<CommitId, CommitInfo> =
        commits.iter().map(|c| (c.id, c.clone())).collect();
    let surviving_parent = |commit: &CommitInfo| -> Option<CommitId> {
        let mut commit = commit.clone();
        loop {
            match commit.parent {
                Some(parent) if set_ids.contains(&parent) => {
                    commit = by_id[&parent].clone();
                }
                other => return other,
            }
        }
    };

    for commit in &commits {
        let replacement = surviving_parent(commit);
        let outside_children: Vec<CommitId> = commit
            .children
            .iter()
            .copied()
            .filter(|child| !set_ids.contains(child))
            .collect();
        if !reparent && !outside_children.is_empty() {
            return Err(GraphError::Precondition(format!(
                "commit {} has {} descendants outside the set",
                commit.commit_ref(),
                outside_children.len()
            )));
        }
        for child_id in &outside_children {
            let child_ref = CommitRef::new(commit.repo.clone(), *child_id);
            let mut child = get_commit_tx(tx, &child_ref).await?;
            child.parent = replacement;
            tx.put(&child).await?;
        }
        if let Some(replacement_id) = replacement {
            let parent_ref = CommitRef::new(commit.repo.clone(), replacement_id);
            let mut parent = get_commit_tx(tx, &parent_ref).await?;
            parent.children.retain(|c| !set_ids.contains(c));
            parent.children.extend(&outside_children);
            tx.put(&parent).await?;
        }

        // branch heads pointing into the set fall back to the survivor
        let branches: Vec<BranchInfo> = tx
            .get_by_index(index::branches::REPO, commit.repo.as_str())
            .await?;
        for mut branch in branches {
            if branch.head == Some(commit.id) {
                branch.head = replacement;
                tx.put(&branch).await?;
            }
        }
    }

    for commit in &commits {
        tx.delete::<CommitInfo>(&watershed_metadata::domain::commit_key(&commit.commit_ref()))
            .await?;
    }

    // a squashed output commit takes its job record with it
    let jobs: Vec<JobInfo> = tx
        .get_by_index(index::jobs::COMMIT_SET, &id.to_string())
        .await?;
    for job in jobs {
        tx.delete::<JobInfo>(&watershed_metadata::domain::job_key(&job.pipeline, &job.id))
            .await?;
    }
    Ok(())
}
