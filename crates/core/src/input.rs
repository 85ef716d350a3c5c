//! Pipeline input trees.
//!
//! An input spec is a tree of `pfs` leaves combined by cross/union/join/
//! group nodes. The tree is a closed sum; the datum planner visits it
//! structurally.

use crate::glob::Glob;
use crate::ids::{BranchName, BranchRef, RepoName};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A `pfs` input leaf: one repo branch read through a glob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PfsInput {
    /// Name the transform sees under `/pfs/<name>`. Defaults to the repo.
    #[serde(default)]
    pub name: String,
    pub repo: RepoName,
    pub branch: BranchName,
    pub glob: String,
    /// Join key template over the glob's captures, e.g. `$1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_on: Option<String>,
    /// Group key template over the glob's captures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
    /// Materialize inputs as lazy placeholders instead of full downloads.
    #[serde(default)]
    pub lazy: bool,
    /// Materialize inputs as empty files (metadata-only transforms).
    #[serde(default)]
    pub empty_files: bool,
    /// Expose this input over the S3 gateway instead of the filesystem.
    #[serde(default)]
    pub s3: bool,
}

impl PfsInput {
    /// Effective mount name for this leaf.
    pub fn mount_name(&self) -> &str {
        if self.name.is_empty() {
            self.repo.as_str()
        } else {
            &self.name
        }
    }
}

/// A pipeline input tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Input {
    Pfs(PfsInput),
    Cross(Vec<Input>),
    Union(Vec<Input>),
    Join(Vec<Input>),
    Group(Vec<Input>),
}

impl Input {
    /// All `pfs` leaves in spec order.
    pub fn leaves(&self) -> Vec<&PfsInput> {
        let mut out = Vec::new();
        self.visit(&mut |input| {
            if let Input::Pfs(pfs) = input {
                out.push(pfs);
            }
        });
        out
    }

    /// The distinct branches this input reads from.
    pub fn referenced_branches(&self) -> Vec<BranchRef> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for leaf in self.leaves() {
            let branch = BranchRef::new(leaf.repo.clone(), leaf.branch.clone());
            if seen.insert(branch.clone()) {
                out.push(branch);
            }
        }
        out
    }

    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Input)) {
        f(self);
        match self {
            Input::Pfs(_) => {}
            Input::Cross(children)
            | Input::Union(children)
            | Input::Join(children)
            | Input::Group(children) => {
                for child in children {
                    child.visit(f);
                }
            }
        }
    }

    /// Validate the tree shape: globs compile, mount names are unique,
    /// join/group nodes carry the keys they bucket by.
    pub fn validate(&self) -> crate::Result<()> {
        let leaves = self.leaves();
        if leaves.is_empty() {
            return Err(crate::Error::InvalidInput(
                "input needs at least one pfs leaf".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for leaf in &leaves {
            if !names.insert(leaf.mount_name().to_string()) {
                return Err(crate::Error::InvalidInput(format!(
                    "duplicate input name {:?}",
                    leaf.mount_name()
                )));
            }
            Glob::compile(&leaf.glob)?;
            if leaf.lazy && leaf.empty_files {
                return Err(crate::Error::InvalidInput(format!(
                    "input {:?} cannot be both lazy and empty_files",
                    leaf.mount_name()
                )));
            }
        }
        self.validate_node()
    }

    fn validate_node(&self) -> crate::Result<()> {
        match self {
            Input::Pfs(_) => Ok(()),
            Input::Cross(children) | Input::Union(children) => {
                if children.is_empty() {
                    return Err(crate::Error::InvalidInput(
                        "cross/union needs at least one child".to_string(),
                    ));
                }
                children.iter().try_for_each(Input::validate_node)
            }
            Input::Join(children) => {
                if children.len() < 2 {
                    return Err(crate::Error::InvalidInput(
                        "join needs at least two children".to_string(),
                    ));
                }
                for child in children {
                    for leaf in child.leaves() {
                        if leaf.join_on.is_none() {
                            return Err(crate::Error::InvalidInput(format!(
                                "join child input {:?} is missing join_on",
                                leaf.mount_name()
                            )));
                        }
                    }
                    child.validate_node()?;
                }
                Ok(())
            }
            Input::Group(children) => {
                if children.is_empty() {
                    return Err(crate::Error::InvalidInput(
                        "group needs at least one child".to_string(),
                    ));
                }
                for child in children {
                    for leaf in child.leaves() {
                        if leaf.group_by.is_none() {
                            return Err(crate::Error::InvalidInput(format!(
                                "group child input {:?} is missing group_by",
                                leaf.mount_name()
                            )));
                        }
                    }
                    child.validate_node()?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn test_leaves_in_spec_order() {
        let input = Input::Cross(vec![
            Input::Pfs(pfs("a", "ra", "/*")),
            Input::Union(vec![Input::Pfs(pfs("b", "rb", "/"))]),
        ]);
        let names: Vec<_> = input.leaves().iter().map(|l| l.mount_name()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let input = Input::Cross(vec![
            Input::Pfs(pfs("", "data", "/*")),
            Input::Pfs(pfs("data", "other", "/*")),
        ]);
        assert!(input.validate().is_err());
    }

    #[test]
    fn test_join_requires_join_on() {
        let input = Input::Join(vec![
            Input::Pfs(pfs("a", "ra", "/*")),
            Input::Pfs(pfs("b", "rb", "/*")),
        ]);
        assert!(input.validate().is_err());

        let input = Input::Join(vec![
            Input::Pfs(PfsInput {
                join_on: Some("$1".to_string()),
                ..pfs("a", "ra", "/*")
            }),
            Input::Pfs(PfsInput {
                join_on: Some("$1".to_string()),
                ..pfs("b", "rb", "/*")
            }),
        ]);
        assert!(input.validate().is_ok());
    }

    #[test]
    fn test_referenced_branches_dedup() {
        let input = Input::Union(vec![
            Input::Pfs(pfs("a", "data", "/*")),
            Input::Pfs(pfs("b", "data", "/**")),
        ]);
        assert_eq!(input.referenced_branches().len(), 1);
    }
}
