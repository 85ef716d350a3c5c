//! End-to-end tests for propagation, triggers, and commit-set surgery.

use crate::error::GraphError;
use crate::files::FileOp;
use crate::testutil::{branch_ref, commit_files, graph, repo};
use bytes::Bytes;
use watershed_core::ids::CommitSetId;
use watershed_core::{CommitOrigin, RepoType, Trigger};

#[tokio::test]
async fn test_propagation_opens_output_commit() {
    let graph = graph().await;
    repo(&graph, "data", RepoType::User).await;
    let out_repo = repo(&graph, "out", RepoType::Output).await;
    graph
        .create_branch(
            branch_ref("out", "master"),
            None,
            vec![branch_ref("data", "master")],
            None,
            false,
        )
        .await
        .unwrap();

    let input = commit_files(&graph, "data", "master", &[("/f", b"foo\n")]).await;

    // the output branch grew an open auto-commit in the same commit-set
    let out_head = graph.resolve_commit(&out_repo, "master").await.unwrap();
    assert_eq!(out_head.commit_set, input.commit_set);
    assert_eq!(out_head.origin, CommitOrigin::Auto);
    assert!(out_head.is_open());
    assert_eq!(out_head.direct_provenance.len(), 1);
    assert_eq!(out_head.direct_provenance[0].id, input.id);
}

#[tokio::test]
async fn test_propagation_waits_for_open_input() {
    let graph = graph().await;
    repo(&graph, "data", RepoType::User).await;
    let out_repo = repo(&graph, "out", RepoType::Output).await;
    graph
        .create_branch(
            branch_ref("out", "master"),
            None,
            vec![branch_ref("data", "master")],
            None,
            false,
        )
        .await
        .unwrap();

    let open = graph
        .start_commit(branch_ref("data", "master"), None, String::new())
        .await
        .unwrap();
    // nothing downstream yet: the input commit is still open
    assert!(matches!(
        graph.resolve_commit(&out_repo, "master").await,
        Err(GraphError::CommitNotFound(_))
    ));

    graph
        .finish_commit(&open.repo, &open.id.to_string(), None, false)
        .await
        .unwrap();
    let out_head = graph.resolve_commit(&out_repo, "master").await.unwrap();
    assert_eq!(out_head.commit_set, open.commit_set);
}

#[tokio::test]
async fn test_aliases_complete_the_commit_set() {
    let graph = graph().await;
    repo(&graph, "a", RepoType::User).await;
    repo(&graph, "b", RepoType::User).await;
    repo(&graph, "out", RepoType::Output).await;

    graph
        .create_branch(
            branch_ref("out", "master"),
            None,
            vec![branch_ref("a", "master"), branch_ref("b", "master")],
            None,
            false,
        )
        .await
        .unwrap();
    let first_b = commit_files(&graph, "b", "master", &[("/b", b"b")]).await;
    let input_a = commit_files(&graph, "a", "master", &[("/a", b"a")]).await;

    // b's head was aliased into a's commit-set so every provenance head of
    // the output commit lives in one set
    let out_head = graph
        .resolve_commit(&branch_ref("out", "master").repo, "master")
        .await
        .unwrap();
    assert_eq!(out_head.commit_set, input_a.commit_set);
    for upstream in &out_head.direct_provenance {
        let commit = graph
            .resolve_commit(&upstream.repo, &upstream.id.to_string())
            .await
            .unwrap();
        assert_eq!(commit.commit_set, input_a.commit_set);
    }
    let b_head = graph
        .resolve_commit(&branch_ref("b", "master").repo, "master")
        .await
        .unwrap();
    assert_eq!(b_head.origin, CommitOrigin::Alias);
    assert_eq!(b_head.parent, Some(first_b.id));
    assert_eq!(b_head.fileset, first_b.fileset);
}

#[tokio::test]
async fn test_chain_propagates_in_topological_order() {
    let graph = graph().await;
    repo(&graph, "data", RepoType::User).await;
    repo(&graph, "mid", RepoType::User).await;
    repo(&graph, "tail", RepoType::User).await;
    // user-typed derived repos alias content straight through
    graph
        .create_branch(
            branch_ref("mid", "master"),
            None,
            vec![branch_ref("data", "master")],
            None,
            false,
        )
        .await
        .unwrap();
    graph
        .create_branch(
            branch_ref("tail", "master"),
            None,
            vec![branch_ref("mid", "master")],
            None,
            false,
        )
        .await
        .unwrap();

    let input = commit_files(&graph, "data", "master", &[("/f", b"x")]).await;

    let mid = graph
        .resolve_commit(&branch_ref("mid", "master").repo, "master")
        .await
        .unwrap();
    let tail = graph
        .resolve_commit(&branch_ref("tail", "master").repo, "master")
        .await
        .unwrap();
    assert_eq!(mid.commit_set, input.commit_set);
    assert_eq!(tail.commit_set, input.commit_set);
    // both finished by aliasing the unique provenance content
    assert!(mid.is_finished());
    assert!(tail.is_finished());
    assert_eq!(mid.fileset, input.fileset);
    assert_eq!(tail.fileset, input.fileset);
    // tail's provenance is mid's commit, which already existed when tail ran
    assert_eq!(tail.direct_provenance[0].id, mid.id);
}

#[tokio::test]
async fn test_start_commit_rejected_on_derived_branch() {
    let graph = graph().await;
    repo(&graph, "data", RepoType::User).await;
    repo(&graph, "out", RepoType::Output).await;
    graph
        .create_branch(
            branch_ref("out", "master"),
            None,
            vec![branch_ref("data", "master")],
            None,
            false,
        )
        .await
        .unwrap();
    assert!(matches!(
        graph
            .start_commit(branch_ref("out", "master"), None, String::new())
            .await,
        Err(GraphError::Precondition(_))
    ));
}

#[tokio::test]
async fn test_finish_requires_finished_provenance() {
    let graph = graph().await;
    repo(&graph, "data", RepoType::User).await;
    let out_repo = repo(&graph, "out", RepoType::Output).await;
    graph
        .create_branch(
            branch_ref("out", "master"),
            None,
            vec![branch_ref("data", "master")],
            None,
            false,
        )
        .await
        .unwrap();
    commit_files(&graph, "data", "master", &[("/f", b"1")]).await;

    let out_head = graph.resolve_commit(&out_repo, "master").await.unwrap();
    assert!(out_head.is_open());
    // its provenance is finished, so finishing works (force not needed)
    graph
        .finish_commit(&out_repo, &out_head.id.to_string(), None, false)
        .await
        .unwrap();
    // double-finish is rejected
    assert!(matches!(
        graph
            .finish_commit(&out_repo, &out_head.id.to_string(), None, false)
            .await,
        Err(GraphError::CommitFinished(_))
    ));
}

#[tokio::test]
async fn test_finish_monotonicity() {
    let graph = graph().await;
    repo(&graph, "data", RepoType::User).await;
    let commit = commit_files(&graph, "data", "master", &[("/f", b"bytes")]).await;
    let finished_at = commit.finished.unwrap();

    let again = graph
        .resolve_commit(&commit.repo, &commit.id.to_string())
        .await
        .unwrap();
    assert_eq!(again.finished, Some(finished_at));
    assert_eq!(again.size_bytes, Some(5));
}

#[tokio::test]
async fn test_incremental_commits_stack_content() {
    let graph = graph().await;
    repo(&graph, "data", RepoType::User).await;
    let first = commit_files(&graph, "data", "master", &[("/a", b"foo\n")]).await;
    let second = commit_files(&graph, "data", "master", &[("/b", b"bar\n")]).await;

    assert_eq!(second.parent, Some(first.id));
    // the second commit inherits the first's files
    let data = graph
        .get_file(&second.repo, &second.id.to_string(), "/a", 0, None)
        .await
        .unwrap();
    assert_eq!(data.as_ref(), b"foo\n");
    assert_eq!(second.size_bytes, Some(8));
}

#[tokio::test]
async fn test_concurrent_writers_one_commit() {
    let graph = graph().await;
    repo(&graph, "data", RepoType::User).await;
    let commit = graph
        .start_commit(branch_ref("data", "master"), None, String::new())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..25 {
        let graph = graph.clone();
        let repo = commit.repo.clone();
        let id = commit.id.to_string();
        handles.push(tokio::spawn(async move {
            let data = Bytes::from(vec![i as u8; 1024]);
            graph
                .modify_file(
                    &repo,
                    &id,
                    vec![FileOp::Add {
                        path: format!("/file{i}"),
                        data,
                    }],
                )
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let finished = graph
        .finish_commit(&commit.repo, &commit.id.to_string(), None, false)
        .await
        .unwrap();
    assert_eq!(finished.size_bytes, Some(25 * 1024));
    for i in 0..25 {
        let data = graph
            .get_file(&finished.repo, &finished.id.to_string(), &format!("/file{i}"), 0, None)
            .await
            .unwrap();
        assert_eq!(data, Bytes::from(vec![i as u8; 1024]));
    }
}

#[tokio::test]
async fn test_trigger_on_commit_count() {
    let graph = graph().await;
    repo(&graph, "data", RepoType::User).await;
    // staging advances on every commit; master follows every second commit
    graph
        .create_branch(
            branch_ref("data", "master"),
            None,
            vec![],
            Some(Trigger {
                source_branch: "staging".parse().unwrap(),
                cron_spec: None,
                size: None,
                commits: Some(2),
                all: false,
            }),
            false,
        )
        .await
        .unwrap();

    let c1 = commit_files(&graph, "data", "staging", &[("/1", b"1")]).await;
    let master = graph.inspect_branch(&branch_ref("data", "master")).await.unwrap();
    // first commit fires unconditionally (no trigger point yet)
    assert_eq!(master.head, Some(c1.id));

    let _c2 = commit_files(&graph, "data", "staging", &[("/2", b"2")]).await;
    let master = graph.inspect_branch(&branch_ref("data", "master")).await.unwrap();
    assert_eq!(master.head, Some(c1.id), "one new commit is below the threshold");

    let c3 = commit_files(&graph, "data", "staging", &[("/3", b"3")]).await;
    let master = graph.inspect_branch(&branch_ref("data", "master")).await.unwrap();
    assert_eq!(master.head, Some(c3.id));
}

#[tokio::test]
async fn test_trigger_on_size() {
    let graph = graph().await;
    repo(&graph, "data", RepoType::User).await;
    graph
        .create_branch(
            branch_ref("data", "big"),
            None,
            vec![],
            Some(Trigger {
                source_branch: "master".parse().unwrap(),
                cron_spec: None,
                size: Some("1KB".to_string()),
                commits: None,
                all: false,
            }),
            false,
        )
        .await
        .unwrap();

    let c1 = commit_files(&graph, "data", "master", &[("/small", b"tiny")]).await;
    let big = graph.inspect_branch(&branch_ref("data", "big")).await.unwrap();
    assert_eq!(big.head, Some(c1.id));

    commit_files(&graph, "data", "master", &[("/more", &[0u8; 100])]).await;
    let big = graph.inspect_branch(&branch_ref("data", "big")).await.unwrap();
    assert_eq!(big.head, Some(c1.id), "100 bytes of growth is below 1KB");

    let c3 = commit_files(&graph, "data", "master", &[("/blob", &[0u8; 2000])]).await;
    let big = graph.inspect_branch(&branch_ref("data", "big")).await.unwrap();
    assert_eq!(big.head, Some(c3.id));
}

#[tokio::test]
async fn test_squash_reparents_and_vanishes() {
    let graph = graph().await;
    repo(&graph, "data", RepoType::User).await;
    let first = commit_files(&graph, "data", "master", &[("/1", b"1")]).await;
    let second = commit_files(&graph, "data", "master", &[("/2", b"2")]).await;
    let third = commit_files(&graph, "data", "master", &[("/3", b"3")]).await;

    graph.squash_commit_set(second.commit_set).await.unwrap();

    assert!(matches!(
        graph.inspect_commit_set(second.commit_set).await,
        Err(GraphError::CommitSetNotFound(_))
    ));
    let third = graph
        .resolve_commit(&third.repo, &third.id.to_string())
        .await
        .unwrap();
    assert_eq!(third.parent, Some(first.id));
    let first = graph
        .resolve_commit(&first.repo, &first.id.to_string())
        .await
        .unwrap();
    assert_eq!(first.children, vec![third.id]);
}

#[tokio::test]
async fn test_squash_head_falls_back_to_parent() {
    let graph = graph().await;
    repo(&graph, "data", RepoType::User).await;
    let first = commit_files(&graph, "data", "master", &[("/1", b"1")]).await;
    let second = commit_files(&graph, "data", "master", &[("/2", b"2")]).await;

    graph.squash_commit_set(second.commit_set).await.unwrap();
    let branch = graph.inspect_branch(&branch_ref("data", "master")).await.unwrap();
    assert_eq!(branch.head, Some(first.id));
}

#[tokio::test]
async fn test_drop_refuses_observed_sets() {
    let graph = graph().await;
    repo(&graph, "data", RepoType::User).await;
    let first = commit_files(&graph, "data", "master", &[("/1", b"1")]).await;
    let second = commit_files(&graph, "data", "master", &[("/2", b"2")]).await;

    // the first set has a child in the second set
    assert!(matches!(
        graph.drop_commit_set(first.commit_set).await,
        Err(GraphError::Precondition(_))
    ));
    // the newest set is unobserved and drops fine
    graph.drop_commit_set(second.commit_set).await.unwrap();
    assert!(matches!(
        graph.inspect_commit_set(second.commit_set).await,
        Err(GraphError::CommitSetNotFound(_))
    ));
}

#[tokio::test]
async fn test_squash_blocks_on_downstream_aliases() {
    let graph = graph().await;
    repo(&graph, "a", RepoType::User).await;
    repo(&graph, "b", RepoType::User).await;
    repo(&graph, "out", RepoType::Output).await;
    graph
        .create_branch(
            branch_ref("out", "master"),
            None,
            vec![branch_ref("a", "master"), branch_ref("b", "master")],
            None,
            false,
        )
        .await
        .unwrap();
    let input_a = commit_files(&graph, "a", "master", &[("/a", b"a")]).await;
    // this pulls a's head into b's new commit-set via an alias
    commit_files(&graph, "b", "master", &[("/b", b"b")]).await;

    let err = graph.squash_commit_set(input_a.commit_set).await;
    assert!(matches!(err, Err(GraphError::Precondition(_))), "{err:?}");
}

#[tokio::test]
async fn test_inspect_commit_wait() {
    let graph = graph().await;
    repo(&graph, "data", RepoType::User).await;
    let commit = graph
        .start_commit(branch_ref("data", "master"), None, String::new())
        .await
        .unwrap();

    let waiter = {
        let graph = graph.clone();
        let repo = commit.repo.clone();
        let id = commit.id.to_string();
        tokio::spawn(async move { graph.inspect_commit(&repo, &id, true).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    graph
        .finish_commit(&commit.repo, &commit.id.to_string(), None, false)
        .await
        .unwrap();

    let waited = waiter.await.unwrap().unwrap();
    assert!(waited.is_finished());
}

#[tokio::test]
async fn test_commit_set_listing() {
    let graph = graph().await;
    repo(&graph, "data", RepoType::User).await;
    commit_files(&graph, "data", "master", &[("/1", b"1")]).await;
    commit_files(&graph, "data", "master", &[("/2", b"2")]).await;

    let sets = graph.list_commit_set().await.unwrap();
    assert_eq!(sets.len(), 2);
    assert!(sets.iter().all(|s| s.is_successful()));
    assert!(matches!(
        graph.inspect_commit_set(CommitSetId::new()).await,
        Err(GraphError::CommitSetNotFound(_))
    ));
}
