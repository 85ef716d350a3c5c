//! Fileset handles and path normalization.
//!
//! A fileset is a content-addressed manifest naming a commit's files; the
//! manifest itself lives in the chunk store. The handle here is just the
//! manifest's content hash.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Content-addressed handle to a fileset manifest (sha256 hex).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilesetId(String);

impl FilesetId {
    /// Wrap a sha256 hex digest. The digest is assumed valid; manifests are
    /// only addressed through `watershed-storage`.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for FilesetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilesetId({})", self.0)
    }
}

impl fmt::Display for FilesetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Normalize a file path: leading `/`, no trailing `/`, no empty or dot
/// segments.
pub fn clean_path(path: &str) -> crate::Result<String> {
    if path.contains('\0') {
        return Err(crate::Error::InvalidPath("path contains NUL".to_string()));
    }
    let mut out = String::with_capacity(path.len() + 1);
    for seg in path.split('/') {
        match seg {
            "" | "." => continue,
            ".." => {
                return Err(crate::Error::InvalidPath(format!(
                    "path may not contain '..': {path}"
                )))
            }
            _ => {
                out.push('/');
                out.push_str(seg);
            }
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Parent directory of a cleaned path, or `/` for top-level entries.
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}
