//! In-memory file cache shared by loader jobs.
//!
//! While active, every file is read from disk once and later reads hand out
//! the same bytes. While inactive, reads go straight to disk.

use super::{AssetError, Result};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct FileCache {
    active: AtomicBool,
    entries: DashMap<PathBuf, Arc<[u8]>>,
}

impl FileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts caching. Entries kept from an earlier session are reused.
    pub fn init(&self) {
        self.active.store(true, Ordering::Release);
    }

    /// Stops caching and drops every entry.
    pub fn clear(&self) {
        self.active.store(false, Ordering::Release);
        self.entries.clear();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the whole file.
    pub fn read(&self, path: &Path) -> Result<Arc<[u8]>> {
        if !self.is_active() {
            return read_file(path);
        }
        // The shard stays locked during the read so a file is never read twice.
        let entry = self
            .entries
            .entry(path.to_path_buf())
            .or_try_insert_with(|| read_file(path))?;
        Ok(Arc::clone(entry.value()))
    }
}

fn read_file(path: &Path) -> Result<Arc<[u8]>> {
    log::trace!("reading {}", path.display());
    std::fs::read(path)
        .map(Arc::from)
        .map_err(|err| AssetError::io(path, err))
}
