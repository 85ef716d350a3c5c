//! End-to-end pipeline scenarios: real workers, real shell transforms.

mod common;

use common::{shell_pipeline, TestCluster};
use watershed_core::{CommitOrigin, DatumState, JobState};

/// A single pipeline copies a file from its input to its output.
#[tokio::test(flavor = "multi_thread")]
async fn test_pipeline_copies_file() {
    let cluster = TestCluster::start().await;
    cluster.create_repo("data").await;
    let input = cluster.put_files("data", "master", &[("/f", b"foo\n")]).await;

    let pipeline = cluster
        .create_pipeline(shell_pipeline(
            "copy",
            "data",
            "/",
            "cp /pfs/data/f /pfs/out/f",
        ))
        .await;

    let job = cluster
        .wait_job(&pipeline, |job| job.state.is_terminal())
        .await;
    assert_eq!(job.state, JobState::Success, "reason: {}", job.reason);
    assert_eq!(job.data_total, 1);
    assert_eq!(job.data_processed, 1);

    let output = cluster.wait_finished_head("copy", "master").await;
    assert_eq!(output.size_bytes, Some(4));
    assert!(output.error.is_empty());
    assert_eq!(output.commit_set, job.id);
    let data = cluster.read_file("copy", "master", "/f").await;
    assert_eq!(data.as_ref(), b"foo\n");

    // the output's provenance stands in for the input commit within the
    // job's commit-set: an alias parented on the user commit
    let from_data = output
        .direct_provenance
        .iter()
        .find(|p| p.repo == input.repo)
        .expect("output commit has data provenance");
    let alias = cluster
        .graph()
        .resolve_commit(&from_data.repo, &from_data.id.to_string())
        .await
        .unwrap();
    assert_eq!(alias.commit_set, output.commit_set);
    assert_eq!(alias.origin, CommitOrigin::Alias);
    assert_eq!(alias.parent, Some(input.id));
    assert_eq!(alias.fileset, input.fileset);
}

/// A second input commit produces a second output commit parented on the
/// first, and unchanged datums are skipped instead of re-run.
#[tokio::test(flavor = "multi_thread")]
async fn test_incremental_pipeline_skips_unchanged_datums() {
    let cluster = TestCluster::start().await;
    cluster.create_repo("data").await;
    cluster.put_files("data", "master", &[("/f", b"foo\n")]).await;

    let pipeline = cluster
        .create_pipeline(shell_pipeline(
            "incr",
            "data",
            "/*",
            "cp /pfs/data/* /pfs/out/",
        ))
        .await;
    let first_job = cluster
        .wait_job(&pipeline, |job| job.state.is_terminal())
        .await;
    assert_eq!(first_job.state, JobState::Success, "reason: {}", first_job.reason);
    let first_output = cluster.wait_finished_head("incr", "master").await;

    cluster.put_files("data", "master", &[("/g", b"bar\n")]).await;
    let second_job = cluster
        .wait_job(&pipeline, |job| {
            job.id != first_job.id && job.state.is_terminal()
        })
        .await;
    assert_eq!(second_job.state, JobState::Success, "reason: {}", second_job.reason);
    // /f hashed identically and was skipped; only /g ran
    assert_eq!(second_job.data_total, 2);
    assert_eq!(second_job.data_skipped, 1);
    assert_eq!(second_job.data_processed, 1);

    let second_output = cluster.wait_finished_head("incr", "master").await;
    assert_eq!(second_output.parent, Some(first_output.id));
    assert_eq!(
        cluster.read_file("incr", "master", "/f").await.as_ref(),
        b"foo\n"
    );
    assert_eq!(
        cluster.read_file("incr", "master", "/g").await.as_ref(),
        b"bar\n"
    );

    let datums = watershed_pipeline::pipelines::list_datum(
        cluster.graph(),
        &pipeline,
        second_job.id,
    )
    .await
    .unwrap();
    assert_eq!(datums.len(), 2);
    assert!(datums.iter().any(|d| d.state == DatumState::Skipped));
    assert!(datums.iter().any(|d| d.state == DatumState::Success));
}

/// A failing upstream pipeline poisons its commit-set downstream: the
/// downstream job never runs a transform and finishes with the propagated
/// error.
#[tokio::test(flavor = "multi_thread")]
async fn test_failure_propagates_downstream() {
    let cluster = TestCluster::start().await;
    cluster.create_repo("data").await;

    let failing = cluster
        .create_pipeline(shell_pipeline("fails", "data", "/*", "echo boom >&2; exit 1"))
        .await;
    // downstream reads the failing pipeline's output repo
    let downstream = cluster
        .create_pipeline(shell_pipeline(
            "after",
            "fails",
            "/*",
            "cp /pfs/fails/* /pfs/out/",
        ))
        .await;

    cluster.put_files("data", "master", &[("/f", b"x")]).await;

    let failed = cluster
        .wait_job(&failing, |job| job.state.is_terminal())
        .await;
    assert_eq!(failed.state, JobState::Failure);
    assert!(failed.reason.contains("boom"), "reason: {}", failed.reason);
    assert_eq!(failed.data_failed, 1);

    let unrunnable = cluster
        .wait_job(&downstream, |job| job.state.is_terminal())
        .await;
    assert_eq!(unrunnable.state, JobState::Unrunnable);
    assert!(
        unrunnable.reason.contains("provenance commit"),
        "reason: {}",
        unrunnable.reason
    );

    // both output commits carry non-empty errors in the graph
    let failed_output = cluster.wait_finished_head("fails", "master").await;
    assert!(!failed_output.error.is_empty());
    let downstream_output = cluster.wait_finished_head("after", "master").await;
    assert!(!downstream_output.error.is_empty());
}

/// A newer commit-set supersedes a running job: the old job is killed, its
/// output commit finishes with an error, and the new set processes cleanly.
#[tokio::test(flavor = "multi_thread")]
async fn test_superseded_job_is_killed() {
    let cluster = TestCluster::start().await;
    cluster.create_repo("data").await;

    let pipeline = cluster
        .create_pipeline(shell_pipeline(
            "slow",
            "data",
            "/*",
            "sleep 15; cp /pfs/data/* /pfs/out/",
        ))
        .await;

    cluster.put_files("data", "master", &[("/a", b"first")]).await;
    let running = cluster
        .wait_job(&pipeline, |job| job.state == JobState::Running)
        .await;

    cluster.put_files("data", "master", &[("/b", b"second")]).await;

    let killed = cluster
        .wait_job(&pipeline, |job| {
            job.id == running.id && job.state.is_terminal()
        })
        .await;
    assert_eq!(killed.state, JobState::Killed);
    assert!(killed.reason.contains("superseded"), "reason: {}", killed.reason);

    let old_output = cluster
        .graph()
        .resolve_commit(
            &killed.output_commit.repo,
            &killed.output_commit.id.to_string(),
        )
        .await
        .unwrap();
    assert!(old_output.is_finished());
    assert!(!old_output.error.is_empty());

    let fresh = cluster
        .wait_job(&pipeline, |job| {
            job.id != killed.id && job.state == JobState::Success
        })
        .await;
    assert_ne!(fresh.id, killed.id);
    let output = cluster.wait_finished_head("slow", "master").await;
    assert_eq!(output.commit_set, fresh.id);
    assert!(output.error.is_empty());
}

/// The recovery hook downgrades exhausted failures to recovered datums.
#[tokio::test(flavor = "multi_thread")]
async fn test_recovery_hook_marks_datum_recovered() {
    let cluster = TestCluster::start().await;
    cluster.create_repo("data").await;

    let mut config = shell_pipeline("recovers", "data", "/*", "exit 1");
    config.transform.err_cmd = vec!["true".to_string()];
    let pipeline = cluster.create_pipeline(config).await;

    cluster.put_files("data", "master", &[("/f", b"x")]).await;
    let job = cluster
        .wait_job(&pipeline, |job| job.state.is_terminal())
        .await;
    assert_eq!(job.state, JobState::Success, "reason: {}", job.reason);
    assert_eq!(job.data_recovered, 1);
    assert_eq!(job.data_processed, 0);

    let output = cluster.wait_finished_head("recovers", "master").await;
    assert!(output.error.is_empty());
    assert_eq!(output.size_bytes, Some(0));
}

/// Stopping a pipeline kills in-flight work; restarting resumes it.
#[tokio::test(flavor = "multi_thread")]
async fn test_stop_pipeline_kills_running_job() {
    let cluster = TestCluster::start().await;
    cluster.create_repo("data").await;

    let pipeline = cluster
        .create_pipeline(shell_pipeline("stoppable", "data", "/*", "sleep 15"))
        .await;
    cluster.put_files("data", "master", &[("/f", b"x")]).await;
    let running = cluster
        .wait_job(&pipeline, |job| job.state == JobState::Running)
        .await;

    watershed_pipeline::pipelines::stop_pipeline(cluster.graph(), &pipeline)
        .await
        .unwrap();
    let killed = cluster
        .wait_job(&pipeline, |job| {
            job.id == running.id && job.state.is_terminal()
        })
        .await;
    assert_eq!(killed.state, JobState::Killed);
}

/// Identical re-creation of a pipeline is a no-op: same version, same salt.
#[tokio::test(flavor = "multi_thread")]
async fn test_identical_pipeline_update_is_noop() {
    let cluster = TestCluster::start().await;
    cluster.create_repo("data").await;
    let config = shell_pipeline("idem", "data", "/*", "true");
    let pipeline = cluster.create_pipeline(config.clone()).await;

    let before =
        watershed_pipeline::pipelines::inspect_pipeline(cluster.graph(), &pipeline)
            .await
            .unwrap();
    let after = watershed_pipeline::pipelines::create_pipeline(cluster.graph(), config, true)
        .await
        .unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.salt, before.salt);
    assert_eq!(after.spec_commit, before.spec_commit);

    // a real change bumps both
    let mut changed = shell_pipeline("idem", "data", "/*", "echo changed");
    changed.transform.cmd[2] = "echo changed".to_string();
    let bumped =
        watershed_pipeline::pipelines::create_pipeline(cluster.graph(), changed, true)
            .await
            .unwrap();
    assert_eq!(bumped.version, before.version + 1);
    assert_ne!(bumped.salt, before.salt);
}
