use std::fs::{read_dir, remove_dir, remove_file};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tempfile::NamedTempFile;

use super::{CacheEntry, CacheStore};
use crate::caching::freshness::{Clock, Freshness, system_clock};
use crate::caching::{CacheKey, CachingStrategy, StoreError};

/// The layout version of entries written by [`FilesystemStore`].
///
/// Bump this whenever the on-disk format of [`CacheEntry`] changes.
const CACHE_VERSION: u32 = 1;

/// A [`CacheStore`] that keeps one JSON file per entry on disk.
///
/// Entries survive restarts and may be shared by several processes on one host. Writes go to a
/// temporary file in a sibling directory which is then atomically moved into place, so readers
/// never observe partially written entries.
#[derive(Clone)]
pub struct FilesystemStore {
    /// Directory holding the entries, one file per key.
    cache_dir: PathBuf,
    /// Directory for temporary files.
    tmp_dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FilesystemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesystemStore")
            .field("cache_dir", &self.cache_dir)
            .field("tmp_dir", &self.tmp_dir)
            .finish()
    }
}

/// Counters collected by [`FilesystemStore::cleanup`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_dirs: usize,
    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl FilesystemStore {
    /// Creates a store below `root`, creating the directories if they do not exist.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref();
        let cache_dir = root.join("subrequests");
        let tmp_dir = root.join("tmp");
        std::fs::create_dir_all(&cache_dir)?;
        std::fs::create_dir_all(&tmp_dir)?;

        Ok(Self {
            cache_dir,
            tmp_dir,
            clock: system_clock(),
        })
    }

    /// Replaces the clock used to stamp and classify entries.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// The file that holds the entry for `key`.
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.cache_path(CACHE_VERSION))
    }

    /// Clear the temporary files.
    ///
    /// Call this on startup, to get rid of temporary files left behind by a hard crash.
    pub fn clear_tmp(&self) -> io::Result<()> {
        if self.tmp_dir.exists() {
            std::fs::remove_dir_all(&self.tmp_dir)?;
        }
        std::fs::create_dir_all(&self.tmp_dir)
    }

    /// Removes all expired and malformed entries.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool) -> Result<CleanupStats> {
        tracing::info!("Cleaning up `{}`", self.cache_dir.display());

        let mut stats = CleanupStats::default();
        self.cleanup_directory_recursive(&self.cache_dir, &mut stats, dry_run)?;

        tracing::info!(
            "Retained {} directories and {} files, totaling {} bytes",
            stats.retained_dirs,
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} directories and {} files, totaling {} bytes",
            stats.removed_dirs,
            stats.removed_files,
            stats.removed_bytes
        );

        metric!(gauge("caches.size.files") = stats.retained_files as u64);
        metric!(gauge("caches.size.bytes") = stats.retained_bytes);
        metric!(counter("caches.size.files_removed") += stats.removed_files as i64);
        metric!(counter("caches.size.bytes_removed") += stats.removed_bytes as i64);

        Ok(stats)
    }

    /// Cleans up the directory recursively, returning `true` if the directory is left empty.
    fn cleanup_directory_recursive(
        &self,
        directory: &Path,
        stats: &mut CleanupStats,
        dry_run: bool,
    ) -> Result<bool> {
        let Some(entries) = catch_not_found(|| read_dir(directory))? else {
            tracing::warn!("Directory not found: `{}`", directory.display());
            return Ok(true);
        };
        tracing::debug!("Cleaning directory `{}`", directory.display());

        let mut is_empty = true;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                let mut dir_is_empty = self.cleanup_directory_recursive(&path, stats, dry_run)?;
                if dir_is_empty && !dry_run {
                    if let Err(e) = remove_dir(&path) {
                        tracing::error!(
                            error = &e as &dyn std::error::Error,
                            path = %path.display(),
                            "Failed to clean cache directory",
                        );
                        dir_is_empty = false;
                    }
                }
                if dir_is_empty {
                    stats.removed_dirs += 1;
                } else {
                    stats.retained_dirs += 1;
                }
                is_empty &= dir_is_empty;
            } else {
                match self.try_cleanup_path(&path, stats, dry_run) {
                    Err(e) => {
                        tracing::error!(
                            error = &*e as &dyn std::error::Error,
                            path = %path.display(),
                            "Failed to clean cache file",
                        );
                        is_empty = false;
                    }
                    Ok(file_removed) => is_empty &= file_removed,
                }
            }
        }

        Ok(is_empty)
    }

    /// Tries to clean up the file at `path`, returning `true` if it was removed.
    fn try_cleanup_path(&self, path: &Path, stats: &mut CleanupStats, dry_run: bool) -> Result<bool> {
        tracing::trace!("Checking file `{}`", path.display());
        let Some(metadata) = catch_not_found(|| path.metadata())? else {
            return Ok(true);
        };
        anyhow::ensure!(metadata.is_file(), "not a file");
        let size = metadata.len();

        let keep = match catch_not_found(|| read_entry(path)) {
            Ok(Some(entry)) => entry.freshness(self.clock.now()) != Freshness::Expired,
            Ok(None) => return Ok(true),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => false,
            Err(e) => return Err(e.into()),
        };

        if keep {
            stats.retained_bytes += size;
            stats.retained_files += 1;
            return Ok(false);
        }

        tracing::debug!("Removing file `{}`", path.display());
        if !dry_run {
            catch_not_found(|| remove_file(path))?;
        }
        stats.removed_bytes += size;
        stats.removed_files += 1;

        Ok(true)
    }
}

#[async_trait]
impl CacheStore for FilesystemStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let path = self.entry_path(key);
        let Some(bytes) = catch_not_found(|| std::fs::read(&path))? else {
            return Ok(None);
        };
        let entry: CacheEntry = serde_json::from_slice(&bytes)?;

        if entry.freshness(self.clock.now()) == Freshness::Expired {
            tracing::trace!(%key, "Removing expired cache file");
            catch_not_found(|| remove_file(&path))?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: Value,
        strategy: &CachingStrategy,
    ) -> Result<(), StoreError> {
        if strategy.is_no_store() {
            return Ok(());
        }

        let entry = CacheEntry::new(value, strategy, self.clock.now());

        std::fs::create_dir_all(&self.tmp_dir)?;
        let mut temp_file = NamedTempFile::new_in(&self.tmp_dir)?;
        serde_json::to_writer(&mut temp_file, &entry)?;
        temp_file.flush()?;

        let path = self.entry_path(key);
        persist_tempfile(temp_file, &path)?;
        metric!(counter("caches.file.write") += 1);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, StoreError> {
        let removed = catch_not_found(|| remove_file(self.entry_path(key)))?;
        Ok(removed.is_some())
    }
}

/// Reads and parses the entry at `path`.
///
/// A file that is not a valid entry is reported as [`io::ErrorKind::InvalidData`].
fn read_entry(path: &Path) -> io::Result<CacheEntry> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Moves `temp_file` to `cache_path`, creating parent directories as needed.
fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<()> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    // A concurrent cleanup can remove the parent directories we are operating in.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %parent.display(),
                "Failed to create cache directory",
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    path = %cache_path.display(),
                    "Failed to persist cache file",
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}

fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
