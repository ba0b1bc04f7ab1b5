use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CoreError;

/// Modification time and length of a table file, used to notice writes
/// made by other processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStamp {
    modified: SystemTime,
    len: u64,
}

/// A JSON document on disk guarded by a sidecar `.lock` file.
///
/// Writers hold an exclusive lock and replace the file via rename, so a
/// reader never observes a half-written table. Readers take a shared lock.
#[derive(Debug, Clone)]
pub struct JsonTable {
    path: PathBuf,
    name: &'static str,
}

impl JsonTable {
    pub fn new(path: impl Into<PathBuf>, name: &'static str) -> Self {
        Self {
            path: path.into(),
            name,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_file(&self) -> Result<File, CoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut lock_path = self.path.clone().into_os_string();
        lock_path.push(".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(PathBuf::from(lock_path))?;
        Ok(file)
    }

    pub fn stamp(&self) -> Option<TableStamp> {
        let meta = fs::metadata(&self.path).ok()?;
        Some(TableStamp {
            modified: meta.modified().ok()?,
            len: meta.len(),
        })
    }

    /// Read the table, returning `T::default()` when it does not exist yet.
    pub fn read<T: DeserializeOwned + Default>(&self) -> Result<T, CoreError> {
        if !self.path.exists() {
            return Ok(T::default());
        }
        let lock = self.lock_file()?;
        fs2::FileExt::lock_shared(&lock).map_err(CoreError::Io)?;
        let result = self.read_locked();
        fs2::FileExt::unlock(&lock).map_err(CoreError::Io)?;
        result
    }

    fn read_locked<T: DeserializeOwned + Default>(&self) -> Result<T, CoreError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(e.into()),
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        serde_json::from_slice(&data).map_err(|e| CoreError::StoreCorruption {
            store: self.name.to_string(),
            detail: format!("{}: {e}", self.path.display()),
        })
    }

    /// Read, modify and write back under a single exclusive lock, so writers
    /// in other processes cannot interleave. Returns what was written and
    /// the stamp of the file it left behind.
    pub fn update<T, F>(&self, apply: F) -> Result<(T, Option<TableStamp>), CoreError>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> Result<(), CoreError>,
    {
        let lock = self.lock_file()?;
        fs2::FileExt::lock_exclusive(&lock).map_err(CoreError::Io)?;
        let result = self.read_locked().and_then(|mut value: T| {
            apply(&mut value)?;
            let json = serde_json::to_vec_pretty(&value)?;
            self.replace(&json)?;
            Ok((value, self.stamp()))
        });
        fs2::FileExt::unlock(&lock).map_err(CoreError::Io)?;
        result
    }

    /// Replace the table contents atomically.
    pub fn write<T: Serialize>(&self, value: &T) -> Result<(), CoreError> {
        let json = serde_json::to_vec_pretty(value)?;
        let lock = self.lock_file()?;
        fs2::FileExt::lock_exclusive(&lock).map_err(CoreError::Io)?;
        let result = self.replace(&json);
        fs2::FileExt::unlock(&lock).map_err(CoreError::Io)?;
        result
    }

    fn replace(&self, bytes: &[u8]) -> Result<(), CoreError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
