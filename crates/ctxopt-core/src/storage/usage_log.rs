use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write as _};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::CoreError;
use crate::model::{UsageEvent, UsageLogEntry};

/// Append-only log of routing decisions and outcome reports.
///
/// File-backed logs write one JSON object per line under an exclusive
/// `fs2` lock so concurrent processes never interleave partial lines.
#[derive(Debug)]
pub struct UsageLog {
    path: Option<PathBuf>,
    memory: RwLock<Vec<UsageLogEntry>>,
}

impl UsageLog {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            memory: RwLock::new(Vec::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            memory: RwLock::new(Vec::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn append(&self, event: UsageEvent) -> Result<UsageLogEntry, CoreError> {
        let entry = UsageLogEntry::new(event);
        match &self.path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut line = serde_json::to_string(&entry)?;
                line.push('\n');
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                fs2::FileExt::lock_exclusive(&file).map_err(CoreError::Io)?;
                let written = (&file).write_all(line.as_bytes());
                fs2::FileExt::unlock(&file).map_err(CoreError::Io)?;
                written?;
            }
            None => self.memory.write().push(entry.clone()),
        }
        Ok(entry)
    }

    /// Read every entry. A malformed line means the log is corrupt.
    pub fn load(&self) -> Result<Vec<UsageLogEntry>, CoreError> {
        let Some(path) = &self.path else {
            return Ok(self.memory.read().clone());
        };
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = OpenOptions::new().read(true).open(path)?;
        fs2::FileExt::lock_shared(&file).map_err(CoreError::Io)?;
        let reader = BufReader::new(&file);
        let mut entries = Vec::new();
        let mut result = Ok(());
        for (n, line) in reader.lines().enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    result = Err(CoreError::Io(e));
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<UsageLogEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    result = Err(CoreError::StoreCorruption {
                        store: "usage log".into(),
                        detail: format!("{} line {}: {e}", path.display(), n + 1),
                    });
                    break;
                }
            }
        }
        fs2::FileExt::unlock(&file).map_err(CoreError::Io)?;
        result.map(|_| entries)
    }

    /// The most recent `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Result<Vec<UsageLogEntry>, CoreError> {
        let mut all = self.load()?;
        let skip = all.len().saturating_sub(n);
        Ok(all.split_off(skip))
    }
}
