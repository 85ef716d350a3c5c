//! Repository operations.

use crate::error::{GraphError, GraphResult};
use crate::graph::CommitGraph;
use watershed_core::ids::RepoName;
use watershed_core::{BranchInfo, CommitInfo, RepoInfo, RepoType};
use watershed_metadata::domain::index;
use watershed_metadata::Order;

impl CommitGraph {
    /// Create a repo, or patch its description when `update` is set.
    ///
    /// A repo may be re-created with `update` only under its original type;
    /// type changes would silently re-home existing commits.
    pub async fn create_repo(
        &self,
        name: RepoName,
        typ: RepoType,
        description: String,
        update: bool,
    ) -> GraphResult<RepoInfo> {
        self.store()
            .transact(move |tx| {
                let name = name.clone();
                let description = description.clone();
                Box::pin(async move {
                    match tx.try_get::<RepoInfo>(name.as_str()).await? {
                        Some(mut existing) => {
                            if !update {
                                return Err(GraphError::AlreadyExists(format!("repo {name}")));
                            }
                            if existing.typ != typ {
                                return Err(GraphError::Precondition(format!(
                                    "repo {name} already exists with type {}",
                                    existing.typ.as_str()
                                )));
                            }
                            existing.description = description;
                            tx.put(&existing).await?;
                            Ok(existing)
                        }
                        None => {
                            let repo = RepoInfo::new(name, typ, description);
                            tx.insert(&repo).await?;
                            Ok(repo)
                        }
                    }
                })
            })
            .await
    }

    pub async fn inspect_repo(&self, name: &RepoName) -> GraphResult<RepoInfo> {
        self.store()
            .try_get(name.as_str())
            .await?
            .ok_or_else(|| GraphError::RepoNotFound(name.clone()))
    }

    /// All repos in creation order, optionally filtered by type.
    pub async fn list_repo(&self, typ: Option<RepoType>) -> GraphResult<Vec<RepoInfo>> {
        let repos = match typ {
            Some(typ) => {
                self.store()
                    .get_by_index(index::repos::TYPE, typ.as_str())
                    .await?
            }
            None => self.store().list(Order::Asc).await?,
        };
        Ok(repos)
    }

    /// Delete a repo. Without `force` the repo must already be empty;
    /// with it, branches and commits cascade. Branches in other repos
    /// depending on this one block deletion either way.
    pub async fn delete_repo(&self, name: &RepoName, force: bool) -> GraphResult<()> {
        let name = name.clone();
        self.store()
            .transact(move |tx| {
                let name = name.clone();
                Box::pin(async move {
                    if tx.try_get::<RepoInfo>(name.as_str()).await?.is_none() {
                        return Err(GraphError::RepoNotFound(name));
                    }
                    let branches: Vec<BranchInfo> = tx
                        .get_by_index(index::branches::REPO, name.as_str())
                        .await?;
                    let commits: Vec<CommitInfo> = tx
                        .get_by_index(index::commits::REPO, name.as_str())
                        .await?;

                    for branch in &branches {
                        if let Some(external) = branch
                            .subvenance
                            .iter()
                            .find(|b| b.repo != name)
                        {
                            return Err(GraphError::Precondition(format!(
                                "branch {external} still depends on {}",
                                branch.branch_ref()
                            )));
                        }
                    }
                    if !force && (!branches.is_empty() || !commits.is_empty()) {
                        return Err(GraphError::Precondition(format!(
                            "repo {name} is not empty ({} branches, {} commits); \
                             delete them first or pass force",
                            branches.len(),
                            commits.len()
                        )));
                    }

                    // detach this repo's provenance edges from upstream branches
                    for branch in &branches {
                        for upstream_ref in &branch.direct_provenance {
                            if upstream_ref.repo == name {
                                continue;
                            }
                            if let Some(mut upstream) = tx
                                .try_get::<BranchInfo>(
                                    &watershed_metadata::domain::branch_key(upstream_ref),
                                )
                                .await?
                            {
                                let me = branch.branch_ref();
                                upstream.subvenance.retain(|b| *b != me);
                                tx.put(&upstream).await?;
                            }
                        }
                    }

                    tx.delete_prefix::<BranchInfo>(&format!("{name}@")).await?;
                    tx.delete_prefix::<CommitInfo>(&format!("{name}@")).await?;
                    tx.delete::<RepoInfo>(name.as_str()).await?;
                    Ok(())
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::graph;

    #[tokio::test]
    async fn test_create_inspect_list_delete() {
        let graph = graph().await;
        let name = RepoName::new("data").unwrap();
        graph
            .create_repo(name.clone(), RepoType::User, "raw data".to_string(), false)
            .await
            .unwrap();

        let info = graph.inspect_repo(&name).await.unwrap();
        assert_eq!(info.description, "raw data");
        assert_eq!(info.typ, RepoType::User);

        let all = graph.list_repo(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(graph
            .list_repo(Some(RepoType::Output))
            .await
            .unwrap()
            .is_empty());

        graph.delete_repo(&name, false).await.unwrap();
        assert!(matches!(
            graph.inspect_repo(&name).await,
            Err(GraphError::RepoNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_create_needs_update() {
        let graph = graph().await;
        let name = RepoName::new("data").unwrap();
        graph
            .create_repo(name.clone(), RepoType::User, String::new(), false)
            .await
            .unwrap();
        assert!(matches!(
            graph
                .create_repo(name.clone(), RepoType::User, String::new(), false)
                .await,
            Err(GraphError::AlreadyExists(_))
        ));

        graph
            .create_repo(name.clone(), RepoType::User, "patched".to_string(), true)
            .await
            .unwrap();
        assert_eq!(graph.inspect_repo(&name).await.unwrap().description, "patched");

        // update cannot change the type
        assert!(matches!(
            graph
                .create_repo(name, RepoType::Output, String::new(), true)
                .await,
            Err(GraphError::Precondition(_))
        ));
    }
}
