//! On-disk store for attachment records.

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::debug;

use crate::config::CachedNetConf;

/// Keyed persistence for [`CachedNetConf`] records.
pub trait CacheStore {
    fn save(&self, key: &str, record: &CachedNetConf) -> Result<()>;

    /// `Ok(None)` when no record exists for `key`.
    fn load(&self, key: &str) -> Result<Option<CachedNetConf>>;

    /// Removing an absent record succeeds.
    fn delete(&self, key: &str) -> Result<()>;
}

/// One JSON file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Keys of every stored record, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", self.dir.display())),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

impl CacheStore for FileCache {
    fn save(&self, key: &str, record: &CachedNetConf) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create cache directory {}", self.dir.display()))?;
        let tmp = self.dir.join(format!(".{}.tmp", key));
        fs::write(&tmp, serde_json::to_vec(record)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, self.path(key)).with_context(|| format!("Failed to store cache {}", key))?;
        debug!(key, "saved cache record");
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<CachedNetConf>> {
        let data = match fs::read(self.path(key)) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read cache {}", key)),
        };
        let record = serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse cache {}", key))?;
        Ok(Some(record))
    }

    fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove cache {}", key)),
        }
    }
}
