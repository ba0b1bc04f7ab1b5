use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path};
use std::time::SystemTime;

use sha2::{Digest, Sha256};

use crate::error::CacheError;

/// SHA-256 hex of a source file, or `None` when it cannot be read
/// (deleted, permissions). A missing file is a distinct state, not an error.
pub fn hash_file(root: &Path, rel: &str) -> Option<String> {
    let contents = fs::read(root.join(rel)).ok()?;
    Some(format!("{:x}", Sha256::digest(&contents)))
}

/// Hash every file in `files`.
pub fn hash_all<'a>(
    root: &Path,
    files: impl IntoIterator<Item = &'a String>,
) -> BTreeMap<String, Option<String>> {
    files
        .into_iter()
        .map(|f| (f.clone(), hash_file(root, f)))
        .collect()
}

/// Whether the file was modified at or after `since`. Unreadable metadata
/// counts as no.
pub fn modified_since(root: &Path, rel: &str, since: SystemTime) -> bool {
    fs::metadata(root.join(rel))
        .and_then(|m| m.modified())
        .map(|t| t >= since)
        .unwrap_or(false)
}

/// Normalize a source path to the repository-relative, `/`-separated form
/// manifests declare. Absolute paths must live under `root`.
pub fn normalize_path(root: &Path, path: &str) -> Result<String, CacheError> {
    let unified = path.replace('\\', "/");
    let p = Path::new(&unified);
    let rel = if p.is_absolute() {
        p.strip_prefix(root)
            .or_else(|_| {
                // Tolerate symlinked temp dirs (e.g. /var -> /private/var)
                let canon_root = root.canonicalize().map_err(|_| ())?;
                p.strip_prefix(&canon_root).map_err(|_| ())
            })
            .map_err(|_| {
                CacheError::InvalidPath(format!("{path} is outside {}", root.display()))
            })?
            .to_path_buf()
    } else {
        p.to_path_buf()
    };

    let mut parts: Vec<String> = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(s) => parts.push(s.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(CacheError::InvalidPath(format!(
                        "{path} escapes the repository root"
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    if parts.is_empty() {
        return Err(CacheError::InvalidPath(format!("{path} names no file")));
    }
    Ok(parts.join("/"))
}

/// Normalize a declared source-file set, dropping entries that cannot be
/// normalized (logged).
pub fn normalize_all(root: &Path, files: &BTreeSet<String>) -> BTreeSet<String> {
    files
        .iter()
        .filter_map(|f| match normalize_path(root, f) {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(path = %f, "Ignoring source file: {e}");
                None
            }
        })
        .collect()
}
