use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Identifier of a manifest, e.g. `project-manifest`.
/// Used verbatim as a file name in the content store, so it is restricted
/// to ASCII alphanumerics plus `-`, `_` and `.`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestId(pub String);

impl ManifestId {
    /// Parse and validate an ID string.
    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if s.is_empty() {
            return Err(CoreError::InvalidId("ID must not be empty".into()));
        }
        if s.starts_with('.') {
            return Err(CoreError::InvalidId(format!(
                "ID must not start with '.': {s}"
            )));
        }
        if let Some(bad) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(CoreError::InvalidId(format!(
                "ID contains invalid character {bad:?}: {s}"
            )));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ManifestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ManifestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ManifestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A generated codebase-description document plus the bookkeeping needed
/// to decide whether it is still fresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub id: ManifestId,
    pub content: serde_json::Value,
    #[serde(default)]
    pub domain_tags: BTreeSet<String>,
    #[serde(default)]
    pub source_files: BTreeSet<String>,
    /// SHA-256 hex per source file at generation time. A file that could not
    /// be read at generation time maps to `None`.
    #[serde(default)]
    pub hash_set: BTreeMap<String, Option<String>>,
    pub size_bytes: u64,
    pub updated_at: DateTime<Utc>,
}

impl Manifest {
    /// Build a manifest, deriving `size_bytes` from the serialized content.
    pub fn new(
        id: ManifestId,
        content: serde_json::Value,
        domain_tags: BTreeSet<String>,
        source_files: BTreeSet<String>,
        hash_set: BTreeMap<String, Option<String>>,
    ) -> Self {
        let size_bytes = content_size(&content);
        Self {
            id,
            content,
            domain_tags,
            source_files,
            hash_set,
            size_bytes,
            updated_at: Utc::now(),
        }
    }

    /// True if `current` (path → hash) disagrees with the recorded hash of
    /// any source file. Paths absent from `current` are not compared.
    pub fn is_stale_against(&self, current: &BTreeMap<String, Option<String>>) -> bool {
        self.source_files.iter().any(|path| match current.get(path) {
            Some(now) => self.hash_set.get(path) != Some(now),
            None => false,
        })
    }

    /// Split into the persisted metadata row and the content blob.
    pub fn metadata(&self) -> ManifestMeta {
        ManifestMeta {
            id: self.id.clone(),
            domain_tags: self.domain_tags.clone(),
            source_files: self.source_files.clone(),
            hash_set: self.hash_set.clone(),
            size_bytes: self.size_bytes,
            updated_at: self.updated_at,
            stale: false,
        }
    }
}

/// One row of the manifest metadata table. Content is stored separately.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestMeta {
    pub id: ManifestId,
    #[serde(default)]
    pub domain_tags: BTreeSet<String>,
    #[serde(default)]
    pub source_files: BTreeSet<String>,
    #[serde(default)]
    pub hash_set: BTreeMap<String, Option<String>>,
    pub size_bytes: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub stale: bool,
}

impl ManifestMeta {
    pub fn into_manifest(self, content: serde_json::Value) -> Manifest {
        Manifest {
            id: self.id,
            content,
            domain_tags: self.domain_tags,
            source_files: self.source_files,
            hash_set: self.hash_set,
            size_bytes: self.size_bytes,
            updated_at: self.updated_at,
        }
    }
}

/// Serialized size of a content document in bytes.
pub fn content_size(content: &serde_json::Value) -> u64 {
    serde_json::to_vec(content)
        .map(|v| v.len() as u64)
        .unwrap_or(0)
}
