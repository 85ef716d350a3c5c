//! Trigger evaluation: auto-advancing branch heads.

use crate::error::GraphResult;
use crate::graph::get_commit_tx;
use watershed_core::branch::{parse_rate_spec, parse_size};
use watershed_core::ids::{BranchRef, CommitRef};
use watershed_core::{BranchInfo, CommitInfo, Trigger};
use watershed_metadata::domain::index;
use watershed_metadata::Transaction;

/// Evaluate every trigger whose source is `source` against its freshly
/// finished `head`. Matching branches get their head moved to `head` inside
/// this transaction; the caller propagates them under the same commit-set.
pub(crate) async fn fire_triggers(
    tx: &mut Transaction,
    source: &BranchRef,
    head: &CommitInfo,
) -> GraphResult<Vec<BranchRef>> {
    let mut fired = Vec::new();
    let siblings: Vec<BranchInfo> = tx
        .get_by_index(index::branches::REPO, source.repo.as_str())
        .await?;
    for mut target in siblings {
        let Some(trigger) = target.trigger.clone() else {
            continue;
        };
        if trigger.source_branch != source.name || target.name == source.name {
            continue;
        }
        let old_head = match target.head {
            Some(id) if Some(id) != Some(head.id) => Some(
                get_commit_tx(tx, &CommitRef::new(target.repo.clone(), id)).await?,
            ),
            Some(_) => continue, // already at the head
            None => None,
        };
        if !should_fire(tx, &trigger, head, old_head.as_ref()).await? {
            continue;
        }
        target.head = Some(head.id);
        tx.put(&target).await?;
        tracing::debug!(
            branch = %target.branch_ref(),
            head = %head.id,
            "Trigger fired"
        );
        fired.push(target.branch_ref());
    }
    Ok(fired)
}

/// Evaluate the trigger's conditions against the delta between the old
/// trigger point and the new head. `all` demands every set condition;
/// otherwise any one suffices. A branch with no trigger point yet always
/// fires.
async fn should_fire(
    tx: &mut Transaction,
    trigger: &Trigger,
    new: &CommitInfo,
    old: Option<&CommitInfo>,
) -> GraphResult<bool> {
    let Some(old) = old else {
        return Ok(true);
    };

    let mut results = Vec::new();
    if let Some(want) = trigger.commits {
        let have = commits_between(tx, new, old).await?;
        results.push(have >= want);
    }
    if let Some(size) = &trigger.size {
        let want = parse_size(size)?;
        let have = new
            .size_bytes
            .unwrap_or(0)
            .saturating_sub(old.size_bytes.unwrap_or(0));
        results.push(have >= want);
    }
    if let Some(spec) = &trigger.cron_spec {
        let want = parse_rate_spec(spec)?;
        let have = match (new.finished, old.finished) {
            (Some(new_at), Some(old_at)) => new_at - old_at >= want,
            _ => true,
        };
        results.push(have);
    }

    Ok(if trigger.all {
        results.iter().all(|r| *r)
    } else {
        results.iter().any(|r| *r)
    })
}

/// Number of commits on `new`'s parent chain since `old` (exclusive).
async fn commits_between(
    tx: &mut Transaction,
    new: &CommitInfo,
    old: &CommitInfo,
) -> GraphResult<u64> {
    let mut count = 1u64;
    let mut cursor = new.parent;
    while let Some(id) = cursor {
        if id == old.id {
            return Ok(count);
        }
        let commit = get_commit_tx(tx, &CommitRef::new(new.repo.clone(), id)).await?;
        cursor = commit.parent;
        count += 1;
    }
    Ok(count)
}
