use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::error::CoreError;
use crate::model::{Manifest, ManifestId, ManifestMeta};

use super::table::JsonTable;

/// Persisted manifest metadata table plus one content blob per manifest.
///
/// The metadata table (`id` → hash set, size, tags, staleness) is what
/// external dashboards read; content blobs live at `content/<id>.json`.
#[derive(Debug)]
pub struct ManifestTable {
    table: JsonTable,
    content_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl ManifestTable {
    pub fn new(table_path: impl Into<PathBuf>, content_dir: impl Into<PathBuf>) -> Self {
        Self {
            table: JsonTable::new(table_path, "manifests"),
            content_dir: content_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn content_path(&self, id: &ManifestId) -> PathBuf {
        self.content_dir.join(format!("{}.json", id.as_str()))
    }

    pub fn load_meta(&self) -> Result<BTreeMap<ManifestId, ManifestMeta>, CoreError> {
        let rows: BTreeMap<ManifestId, ManifestMeta> = self.table.read()?;
        for (key, meta) in &rows {
            if key != &meta.id {
                return Err(CoreError::StoreCorruption {
                    store: "manifests".into(),
                    detail: format!("row key '{key}' does not match id '{}'", meta.id),
                });
            }
        }
        Ok(rows)
    }

    /// Load every manifest with its content and persisted staleness flag.
    /// Rows whose content blob is missing are skipped with a warning; the
    /// cache will regenerate them on demand.
    pub fn load_all(&self) -> Result<Vec<(Manifest, bool)>, CoreError> {
        let rows = self.load_meta()?;
        let mut out = Vec::with_capacity(rows.len());
        for (id, meta) in rows {
            match self.read_content(&id) {
                Ok(Some(content)) => {
                    let stale = meta.stale;
                    out.push((meta.into_manifest(content), stale));
                }
                Ok(None) => {
                    tracing::warn!(manifest_id = %id, "Content blob missing; will regenerate");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn read_content(&self, id: &ManifestId) -> Result<Option<serde_json::Value>, CoreError> {
        let path = self.content_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CoreError::StoreCorruption {
                store: "manifest content".into(),
                detail: format!("{}: {e}", path.display()),
            })
    }

    /// Write a manifest's content blob and upsert its metadata row.
    pub fn save(&self, manifest: &Manifest, stale: bool) -> Result<(), CoreError> {
        let _guard = self.write_lock.lock();
        fs::create_dir_all(&self.content_dir)?;
        let blob = serde_json::to_vec(&manifest.content)?;
        let path = self.content_path(&manifest.id);
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, blob)?;
        fs::rename(&tmp, &path)?;

        let mut rows = self.load_meta()?;
        let mut meta = manifest.metadata();
        meta.stale = stale;
        rows.insert(manifest.id.clone(), meta);
        self.table.write(&rows)
    }

    /// Flip the persisted staleness flag for the given ids.
    pub fn mark_stale(&self, ids: &[ManifestId]) -> Result<(), CoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        let mut rows = self.load_meta()?;
        let mut changed = false;
        for id in ids {
            if let Some(meta) = rows.get_mut(id) {
                if !meta.stale {
                    meta.stale = true;
                    changed = true;
                }
            }
        }
        if changed {
            self.table.write(&rows)?;
        }
        Ok(())
    }

    pub fn remove(&self, id: &ManifestId) -> Result<bool, CoreError> {
        let _guard = self.write_lock.lock();
        let mut rows = self.load_meta()?;
        let existed = rows.remove(id).is_some();
        if existed {
            self.table.write(&rows)?;
        }
        let path = self.content_path(id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest(id: &str) -> Manifest {
        Manifest::new(
            ManifestId::from(id),
            serde_json::json!({"summary": id}),
            ["backend".to_string()].into_iter().collect(),
            ["src/db.rs".to_string()].into_iter().collect(),
            [("src/db.rs".to_string(), Some("abc".to_string()))]
                .into_iter()
                .collect(),
        )
    }

    fn table(tmp: &TempDir) -> ManifestTable {
        ManifestTable::new(tmp.path().join("manifests.json"), tmp.path().join("content"))
    }

    #[test]
    fn test_save_load_and_mark_stale() {
        let tmp = TempDir::new().unwrap();
        let t = table(&tmp);
        let m = manifest("database-manifest");
        t.save(&m, false).unwrap();

        let all = t.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, m);
        assert!(!all[0].1);

        t.mark_stale(&[m.id.clone()]).unwrap();
        let all = t.load_all().unwrap();
        assert!(all[0].1);
    }

    #[test]
    fn test_missing_blob_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let t = table(&tmp);
        let m = manifest("api-manifest");
        t.save(&m, false).unwrap();
        fs::remove_file(tmp.path().join("content/api-manifest.json")).unwrap();
        assert!(t.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_remove() {
        let tmp = TempDir::new().unwrap();
        let t = table(&tmp);
        let m = manifest("api-manifest");
        t.save(&m, false).unwrap();
        assert!(t.remove(&m.id).unwrap());
        assert!(!t.remove(&m.id).unwrap());
        assert!(t.load_meta().unwrap().is_empty());
    }
}
