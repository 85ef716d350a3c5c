//! Datums: the unit of pipeline work.
//!
//! A datum is one tuple of input files, one entry per pfs leaf of the input
//! tree. Its id is a stable hash over the input-file identities, so the same
//! inputs hash to the same datum across jobs and can be skipped.

use crate::fileset::FilesetId;
use crate::ids::RepoName;
use crate::job::{DatumState, ProcessStats};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identity of one matched input entry: which bytes, independent of which
/// commit happens to reference them.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileIdentity {
    pub repo: RepoName,
    /// Hash of the matched entry's content (its files and their chunks),
    /// not of the whole commit, so unrelated changes elsewhere in the
    /// commit do not re-key this datum.
    pub content: String,
    /// Matched path (file or directory).
    pub path: String,
}

/// One input entry of a datum.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatumInput {
    /// Mount name of the originating pfs leaf.
    pub name: String,
    pub file: FileIdentity,
    /// Manifest of the source commit, for materialization. Excluded from
    /// the datum id.
    pub fileset: FilesetId,
    #[serde(default)]
    pub lazy: bool,
    #[serde(default)]
    pub empty_files: bool,
}

/// A planned datum.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datum {
    pub id: String,
    pub inputs: Vec<DatumInput>,
}

impl Datum {
    /// Build a datum from its inputs, deriving the stable id.
    ///
    /// The hash covers the pipeline salt and the sorted `(name, repo,
    /// content, path)` identity of every input, so planning twice over
    /// byte-identical inputs yields identical ids.
    pub fn new(salt: &str, mut inputs: Vec<DatumInput>) -> Self {
        inputs.sort_by(|a, b| (&a.name, &a.file).cmp(&(&b.name, &b.file)));
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        for input in &inputs {
            hasher.update([0]);
            hasher.update(input.name.as_bytes());
            hasher.update([0]);
            hasher.update(input.file.repo.as_str().as_bytes());
            hasher.update([0]);
            hasher.update(input.file.content.as_bytes());
            hasher.update([0]);
            hasher.update(input.file.path.as_bytes());
        }
        let digest = hasher.finalize();
        let id = digest.iter().map(|b| format!("{b:02x}")).collect();
        Self { id, inputs }
    }
}

/// Persisted record of one datum's outcome, written to the job's meta
/// fileset and consulted by the next job's skip pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatumMeta {
    pub datum: Datum,
    pub state: DatumState,
    #[serde(default)]
    pub stats: ProcessStats,
    /// Output fileset produced for this datum, if it succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<FilesetId>,
    /// Attempts consumed, including the successful one.
    #[serde(default)]
    pub tries: u32,
    #[serde(default)]
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str, repo: &str, content: &str, path: &str) -> DatumInput {
        DatumInput {
            name: name.to_string(),
            file: FileIdentity {
                repo: RepoName::new(repo).unwrap(),
                content: content.to_string(),
                path: path.to_string(),
            },
            fileset: FilesetId::from_hex("ab".repeat(32)),
            lazy: false,
            empty_files: false,
        }
    }

    #[test]
    fn test_id_is_stable_across_input_order() {
        let a = Datum::new(
            "salt",
            vec![input("x", "r1", "f1", "/a"), input("y", "r2", "f2", "/b")],
        );
        let b = Datum::new(
            "salt",
            vec![input("y", "r2", "f2", "/b"), input("x", "r1", "f1", "/a")],
        );
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_id_depends_on_salt_and_content() {
        let base = vec![input("x", "r1", "f1", "/a")];
        let a = Datum::new("salt1", base.clone());
        let b = Datum::new("salt2", base.clone());
        assert_ne!(a.id, b.id);

        let c = Datum::new("salt1", vec![input("x", "r1", "f2", "/a")]);
        assert_ne!(a.id, c.id);

        let d = Datum::new("salt1", base);
        assert_eq!(a.id, d.id);
    }

    #[test]
    fn test_id_ignores_source_manifest() {
        // the same bytes reached through different commits hash identically
        let mut a = input("x", "r1", "f1", "/a");
        let mut b = input("x", "r1", "f1", "/a");
        a.fileset = FilesetId::from_hex("11".repeat(32));
        b.fileset = FilesetId::from_hex("22".repeat(32));
        assert_eq!(
            Datum::new("salt", vec![a]).id,
            Datum::new("salt", vec![b]).id
        );
    }

    #[test]
    fn test_id_is_hex_sha256() {
        let d = Datum::new("s", vec![input("x", "r", "f", "/p")]);
        assert_eq!(d.id.len(), 64);
        assert!(d.id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
