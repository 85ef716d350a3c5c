//! Datum planning: turning an input tree plus concrete commits into the
//! deterministic sequence of work units.

use crate::error::{PipelineError, PipelineResult};
use std::collections::BTreeMap;
use watershed_core::datum::{Datum, DatumInput, DatumMeta, FileIdentity};
use watershed_core::input::{Input, PfsInput};
use watershed_core::{CommitInfo, DatumState, Glob};
use watershed_storage::FilesetStore;

/// Planner output partitioned against the previous run.
#[derive(Debug, Default)]
pub struct DatumDiff {
    /// Datums with no prior successful run; these execute.
    pub fresh: Vec<Datum>,
    /// Prior metas whose datum ids reappear; their outputs copy forward.
    pub skip: Vec<DatumMeta>,
    /// Prior datums that no longer exist.
    pub removed: u64,
}

/// Plan the full datum sequence for one job.
///
/// `provenance` is the output commit's direct provenance: the exact input
/// commits of this run. Planning is deterministic: equal inputs and salt
/// yield the same datum ids in the same order.
pub async fn plan_datums(
    filesets: &FilesetStore,
    salt: &str,
    input: &Input,
    provenance: &[CommitInfo],
) -> PipelineResult<Vec<Datum>> {
    let leaves = input.leaves();
    let mut leaf_entries: Vec<Vec<DatumInput>> = Vec::with_capacity(leaves.len());
    for leaf in &leaves {
        leaf_entries.push(leaf_datums(filesets, leaf, provenance).await?);
    }

    let keys = KeyTemplates::new(&leaves)?;
    let mut next_leaf = 0usize;
    let combos = combine(input, &mut next_leaf, &leaf_entries, &keys)?;
    Ok(combos
        .into_iter()
        .map(|inputs| Datum::new(salt, inputs))
        .collect())
}

/// Partition planned datums against the previous successful job's metas.
pub fn diff_datums(planned: Vec<Datum>, previous: &[DatumMeta]) -> DatumDiff {
    let mut prior: BTreeMap<&str, &DatumMeta> = previous
        .iter()
        .filter(|meta| {
            meta.output.is_some()
                && matches!(meta.state, DatumState::Success | DatumState::Skipped)
        })
        .map(|meta| (meta.datum.id.as_str(), meta))
        .collect();

    let mut diff = DatumDiff::default();
    for datum in planned {
        match prior.remove(datum.id.as_str()) {
            Some(meta) => diff.skip.push(DatumMeta {
                datum,
                state: DatumState::Skipped,
                stats: Default::default(),
                output: meta.output.clone(),
                tries: 0,
                error: String::new(),
            }),
            None => diff.fresh.push(datum),
        }
    }
    diff.removed = prior.len() as u64;
    diff
}

/// One datum candidate per glob match of the leaf's input commit.
async fn leaf_datums(
    filesets: &FilesetStore,
    leaf: &PfsInput,
    provenance: &[CommitInfo],
) -> PipelineResult<Vec<DatumInput>> {
    let commit = provenance
        .iter()
        .find(|c| c.repo == leaf.repo && c.branch == leaf.branch)
        .or_else(|| provenance.iter().find(|c| c.repo == leaf.repo))
        .ok_or_else(|| {
            PipelineError::Precondition(format!(
                "no input commit for {}@{} in the job's provenance",
                leaf.repo, leaf.branch
            ))
        })?;
    let Some(fileset) = commit.fileset.clone() else {
        return Ok(Vec::new());
    };
    let manifest = filesets.read_manifest(&fileset).await?;
    let glob = Glob::compile(&leaf.glob)?;
    let mut out = Vec::new();
    for entry in manifest.glob(&glob) {
        let content = manifest.content_hash(&entry.path)?;
        out.push(DatumInput {
            name: leaf.mount_name().to_string(),
            file: FileIdentity {
                repo: leaf.repo.clone(),
                content,
                path: entry.path,
            },
            fileset: fileset.clone(),
            lazy: leaf.lazy,
            empty_files: leaf.empty_files,
        });
    }
    Ok(out)
}

/// Per-leaf glob and key templates, addressed by mount name.
struct KeyTemplates {
    by_name: BTreeMap<String, (Glob, Option<String>, Option<String>)>,
}

impl KeyTemplates {
    fn new(leaves: &[&PfsInput]) -> PipelineResult<Self> {
        let mut by_name = BTreeMap::new();
        for leaf in leaves {
            by_name.insert(
                leaf.mount_name().to_string(),
                (
                    Glob::compile(&leaf.glob)?,
                    leaf.join_on.clone(),
                    leaf.group_by.clone(),
                ),
            );
        }
        Ok(Self { by_name })
    }

    /// Join key of a composite datum: the concatenated expansions of every
    /// input whose leaf carries `join_on`.
    fn join_key(&self, inputs: &[DatumInput]) -> Option<String> {
        self.key(inputs, |templates| templates.1.as_ref())
    }

    fn group_key(&self, inputs: &[DatumInput]) -> Option<String> {
        self.key(inputs, |templates| templates.2.as_ref())
    }

    fn key<'a>(
        &'a self,
        inputs: &[DatumInput],
        pick: impl Fn(&'a (Glob, Option<String>, Option<String>)) -> Option<&'a String>,
    ) -> Option<String> {
        let mut key = String::new();
        let mut keyed = false;
        for input in inputs {
            let Some(templates) = self.by_name.get(&input.name) else {
                continue;
            };
            let Some(template) = pick(templates) else {
                continue;
            };
            let expanded = templates.0.expand(template, &input.file.path)?;
            key.push_str(&expanded);
            key.push('\0');
            keyed = true;
        }
        keyed.then_some(key)
    }
}

/// Evaluate the tree bottom-up. `next_leaf` walks `leaf_entries` in the
/// same order `Input::leaves` produced them.
fn combine(
    node: &Input,
    next_leaf: &mut usize,
    leaf_entries: &[Vec<DatumInput>],
    keys: &KeyTemplates,
) -> PipelineResult<Vec<Vec<DatumInput>>> {
    match node {
        Input::Pfs(_) => {
            let entries = &leaf_entries[*next_leaf];
            *next_leaf += 1;
            Ok(entries.iter().map(|input| vec![input.clone()]).collect())
        }
        Input::Cross(children) => {
            let mut product: Vec<Vec<DatumInput>> = vec![Vec::new()];
            for child in children {
                let child_datums = combine(child, next_leaf, leaf_entries, keys)?;
                let mut next = Vec::with_capacity(product.len() * child_datums.len());
                for existing in &product {
                    for datum in &child_datums {
                        let mut merged = existing.clone();
                        merged.extend(datum.iter().cloned());
                        next.push(merged);
                    }
                }
                product = next;
            }
            Ok(product)
        }
        Input::Union(children) => {
            let mut out = Vec::new();
            for child in children {
                out.extend(combine(child, next_leaf, leaf_entries, keys)?);
            }
            Ok(out)
        }
        Input::Join(children) => {
            let mut buckets: Vec<BTreeMap<String, Vec<Vec<DatumInput>>>> = Vec::new();
            for child in children {
                let mut bucket: BTreeMap<String, Vec<Vec<DatumInput>>> = BTreeMap::new();
                for datum in combine(child, next_leaf, leaf_entries, keys)? {
                    if let Some(key) = keys.join_key(&datum) {
                        bucket.entry(key).or_default().push(datum);
                    }
                }
                buckets.push(bucket);
            }
            let Some((first, rest)) = buckets.split_first() else {
                return Ok(Vec::new());
            };
            let mut out = Vec::new();
            'keys: for (key, first_datums) in first {
                let mut per_child = vec![first_datums.clone()];
                for bucket in rest {
                    match bucket.get(key) {
                        Some(datums) => per_child.push(datums.clone()),
                        None => continue 'keys,
                    }
                }
                // cartesian product across children within the bucket
                let mut product: Vec<Vec<DatumInput>> = vec![Vec::new()];
                for child_datums in &per_child {
                    let mut next = Vec::new();
                    for existing in &product {
                        for datum in child_datums {
                            let mut merged = existing.clone();
                            merged.extend(datum.iter().cloned());
                            next.push(merged);
                        }
                    }
                    product = next;
                }
                out.extend(product);
            }
            Ok(out)
        }
        Input::Group(children) => {
            let mut buckets: BTreeMap<String, Vec<DatumInput>> = BTreeMap::new();
            for child in children {
                for datum in combine(child, next_leaf, leaf_entries, keys)? {
                    if let Some(key) = keys.group_key(&datum) {
                        buckets.entry(key).or_default().extend(datum);
                    }
                }
            }
            Ok(buckets.into_values().collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use time::OffsetDateTime;
    use watershed_core::ids::{BranchName, CommitId, CommitSetId, RepoName};
    use watershed_core::{CommitOrigin, FilesetId};
    use watershed_storage::{Manifest, MemoryBackend};

    async fn commit_with(
        filesets: &FilesetStore,
        repo: &str,
        files: &[(&str, &[u8])],
    ) -> CommitInfo {
        let mut manifest = Manifest::new();
        for (path, data) in files {
            filesets
                .put_file(&mut manifest, path, Bytes::copy_from_slice(data))
                .await
                .unwrap();
        }
        let fileset = filesets.write_manifest(&manifest).await.unwrap();
        CommitInfo {
            repo: RepoName::new(repo).unwrap(),
            id: CommitId::new(),
            branch: BranchName::new("master").unwrap(),
            parent: None,
            children: Vec::new(),
            commit_set: CommitSetId::new(),
            origin: CommitOrigin::User,
            direct_provenance: Vec::new(),
            started: OffsetDateTime::now_utc(),
            finished: Some(OffsetDateTime::now_utc()),
            size_bytes: Some(0),
            fileset: Some(fileset),
            error: String::new(),
            description: String::new(),
        }
    }

    fn pfs(name: &str, repo: &str, glob: &str) -> PfsInput {
        PfsInput {
            name: name.to_string(),
            repo: RepoName::new(repo).unwrap(),
            branch: BranchName::new("master").unwrap(),
            glob: glob.to_string(),
            join_on: None,
            group_by: None,
            lazy: false,
            empty_files: false,
            s3: false,
        }
    }

    fn filesets() -> FilesetStore {
        FilesetStore::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn test_pfs_glob_datums() {
        let filesets = filesets();
        let commit = commit_with(&filesets, "r", &[("/a", b"1"), ("/b", b"2")]).await;

        let input = Input::Pfs(pfs("r", "r", "/*"));
        let datums = plan_datums(&filesets, "salt", &input, &[commit.clone()])
            .await
            .unwrap();
        assert_eq!(datums.len(), 2);
        assert_eq!(datums[0].inputs[0].file.path, "/a");

        // the whole-repo glob yields one datum for the root
        let input = Input::Pfs(pfs("r", "r", "/"));
        let datums = plan_datums(&filesets, "salt", &input, &[commit]).await.unwrap();
        assert_eq!(datums.len(), 1);
        assert_eq!(datums[0].inputs[0].file.path, "/");
    }

    #[tokio::test]
    async fn test_cross_is_cartesian() {
        let filesets = filesets();
        let a = commit_with(&filesets, "a", &[("/1", b"x"), ("/2", b"x")]).await;
        let b = commit_with(&filesets, "b", &[("/1", b"y"), ("/2", b"y"), ("/3", b"y")]).await;

        let input = Input::Cross(vec![
            Input::Pfs(pfs("a", "a", "/*")),
            Input::Pfs(pfs("b", "b", "/*")),
        ]);
        let datums = plan_datums(&filesets, "salt", &input, &[a, b]).await.unwrap();
        assert_eq!(datums.len(), 6);
        assert!(datums.iter().all(|d| d.inputs.len() == 2));
    }

    #[tokio::test]
    async fn test_union_concatenates_without_collisions() {
        let filesets = filesets();
        let a = commit_with(&filesets, "a", &[("/same", b"x")]).await;
        let b = commit_with(&filesets, "b", &[("/same", b"x")]).await;

        let input = Input::Union(vec![
            Input::Pfs(pfs("left", "a", "/*")),
            Input::Pfs(pfs("right", "b", "/*")),
        ]);
        let datums = plan_datums(&filesets, "salt", &input, &[a, b]).await.unwrap();
        assert_eq!(datums.len(), 2);
        // same path, different leaf tags: distinct datum ids
        assert_ne!(datums[0].id, datums[1].id);
    }

    #[tokio::test]
    async fn test_join_buckets_by_capture() {
        let filesets = filesets();
        let a = commit_with(
            &filesets,
            "a",
            &[("/u1-left", b"x"), ("/u2-left", b"x"), ("/u3-left", b"x")],
        )
        .await;
        let b = commit_with(&filesets, "b", &[("/u1-right", b"y"), ("/u2-right", b"y")]).await;

        let mut left = pfs("left", "a", "/u*-left");
        left.join_on = Some("$1".to_string());
        let mut right = pfs("right", "b", "/u*-right");
        right.join_on = Some("$1".to_string());

        let input = Input::Join(vec![Input::Pfs(left), Input::Pfs(right)]);
        let datums = plan_datums(&filesets, "salt", &input, &[a, b]).await.unwrap();
        // u3 has no right-side partner
        assert_eq!(datums.len(), 2);
        for datum in &datums {
            assert_eq!(datum.inputs.len(), 2);
            let left_key = &datum.inputs[0].file.path[2..3];
            assert!(datum.inputs[1].file.path.contains(left_key));
        }
    }

    #[tokio::test]
    async fn test_group_collects_bucket_members() {
        let filesets = filesets();
        let commit = commit_with(
            &filesets,
            "r",
            &[("/2020-a", b"x"), ("/2020-b", b"x"), ("/2021-c", b"x")],
        )
        .await;

        let mut leaf = pfs("r", "r", "/*-*");
        leaf.group_by = Some("$1".to_string());
        let input = Input::Group(vec![Input::Pfs(leaf)]);
        let datums = plan_datums(&filesets, "salt", &input, &[commit]).await.unwrap();
        assert_eq!(datums.len(), 2);
        let sizes: Vec<usize> = datums.iter().map(|d| d.inputs.len()).collect();
        assert!(sizes.contains(&2) && sizes.contains(&1));
    }

    #[tokio::test]
    async fn test_planning_is_deterministic() {
        let filesets = filesets();
        let a = commit_with(&filesets, "a", &[("/1", b"x"), ("/2", b"x")]).await;
        let b = commit_with(&filesets, "b", &[("/1", b"y")]).await;
        let input = Input::Cross(vec![
            Input::Pfs(pfs("a", "a", "/*")),
            Input::Pfs(pfs("b", "b", "/*")),
        ]);

        let once = plan_datums(&filesets, "salt", &input, &[a.clone(), b.clone()])
            .await
            .unwrap();
        let twice = plan_datums(&filesets, "salt", &input, &[a, b]).await.unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_diff_partitions_against_previous_run() {
        let filesets = filesets();
        let commit = commit_with(&filesets, "r", &[("/keep", b"same"), ("/new", b"n")]).await;
        let input = Input::Pfs(pfs("r", "r", "/*"));
        let planned = plan_datums(&filesets, "salt", &input, &[commit]).await.unwrap();

        let keep = planned
            .iter()
            .find(|d| d.inputs[0].file.path == "/keep")
            .unwrap()
            .clone();
        let previous = vec![
            DatumMeta {
                datum: keep,
                state: DatumState::Success,
                stats: Default::default(),
                output: Some(FilesetId::from_hex("ab".repeat(32))),
                tries: 1,
                error: String::new(),
            },
            DatumMeta {
                datum: Datum::new("salt", vec![]),
                state: DatumState::Success,
                stats: Default::default(),
                output: Some(FilesetId::from_hex("cd".repeat(32))),
                tries: 1,
                error: String::new(),
            },
        ];

        let diff = diff_datums(planned, &previous);
        assert_eq!(diff.skip.len(), 1);
        assert_eq!(diff.skip[0].state, DatumState::Skipped);
        assert_eq!(diff.fresh.len(), 1);
        assert_eq!(diff.fresh[0].inputs[0].file.path, "/new");
        assert_eq!(diff.removed, 1);
    }

    #[tokio::test]
    async fn test_salt_change_invalidates_skips() {
        let filesets = filesets();
        let commit = commit_with(&filesets, "r", &[("/f", b"same")]).await;
        let input = Input::Pfs(pfs("r", "r", "/*"));

        let old = plan_datums(&filesets, "old-salt", &input, &[commit.clone()])
            .await
            .unwrap();
        let previous: Vec<DatumMeta> = old
            .into_iter()
            .map(|datum| DatumMeta {
                datum,
                state: DatumState::Success,
                stats: Default::default(),
                output: Some(FilesetId::from_hex("ab".repeat(32))),
                tries: 1,
                error: String::new(),
            })
            .collect();

        let planned = plan_datums(&filesets, "new-salt", &input, &[commit]).await.unwrap();
        let diff = diff_datums(planned, &previous);
        assert!(diff.skip.is_empty());
        assert_eq!(diff.fresh.len(), 1);
    }
}
