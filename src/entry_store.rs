//! Entry Store Module
//!
//! Maps cache keys to files below one namespace root and performs the raw
//! filesystem work: existence checks, reads, atomic writes, deletes and the
//! full-tree scan that is the ground truth whenever the size ledger is unknown.
//!
//! There is no index or manifest file. A stored entry exists only as a file
//! whose relative path is derived from exactly one key.
//!
//! # Atomic writes
//!
//! Payloads are written to a hidden sibling (`.<name>.<uuid>.tmp`), synced and
//! then renamed over the final path. A crash mid-write can leave only a hidden
//! temp file, which `exists()` never reports and `scan()` never counts.
//!
//! # Entry locks
//!
//! Writes, deletes and eviction removals of one path are serialized by a
//! per-path lock, so the prior size a write observes is still current when
//! its rename lands. Subtree and whole-namespace removals take the namespace
//! lock exclusively and so never overlap any single-entry operation.

use crate::cache_types::{CacheKey, ScanResult, ScannedFile, SubtreePrefix};
use crate::{CacheError, Result};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};
use walkdir::WalkDir;

const TEMP_SUFFIX: &str = ".tmp";

/// What occupied the target path before a write replaced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorEntry {
    Absent,
    Present(u64),
    /// A file may have existed but its size could not be read
    Indeterminate,
}

/// Result of a successful write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub prior: PriorEntry,
    pub new_size: u64,
}

impl WriteOutcome {
    /// Exact `(bytes, count)` change caused by the write, if it can be known.
    pub fn ledger_delta(&self) -> Option<(i64, i64)> {
        let new_size = self.new_size as i64;
        match self.prior {
            PriorEntry::Absent => Some((new_size, 1)),
            PriorEntry::Present(old) => Some((new_size - old as i64, 0)),
            PriorEntry::Indeterminate => None,
        }
    }
}

/// Result of a single-entry delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Nothing was stored under the key
    Absent,
    Removed(u64),
    /// The file was removed but its size could not be read first
    RemovedUnknownSize,
}

impl DeleteOutcome {
    pub fn ledger_delta(&self) -> Option<(i64, i64)> {
        match *self {
            DeleteOutcome::Absent => Some((0, 0)),
            DeleteOutcome::Removed(size) => Some((-(size as i64), -1)),
            DeleteOutcome::RemovedUnknownSize => None,
        }
    }
}

/// Totals removed by a subtree delete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubtreeRemoval {
    pub bytes: u64,
    pub files: u64,
}

#[derive(Debug, Default)]
struct EntryLocks {
    namespace: RwLock<()>,
    entries: DashMap<PathBuf, Arc<Mutex<()>>>,
}

/// Exclusive access to one entry path; shared access to the namespace
pub struct EntryLock<'a> {
    locks: &'a EntryLocks,
    path: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
    _namespace: RwLockReadGuard<'a, ()>,
}

impl Drop for EntryLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map holds the mutex once no one else waits on it
        self.locks
            .entries
            .remove_if(&self.path, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Filesystem side of one cache namespace
///
/// Clones share the same root and the same entry locks.
#[derive(Debug, Clone)]
pub struct EntryStore {
    root: PathBuf,
    locks: Arc<EntryLocks>,
}

impl EntryStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            locks: Arc::new(EntryLocks::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of `key`. Pure; does not touch disk.
    pub fn path<K: CacheKey>(&self, key: &K) -> PathBuf {
        self.root.join(key.relative_path())
    }

    /// Hold the entry lock of `path` until the returned guard drops.
    pub async fn lock_path(&self, path: &Path) -> EntryLock<'_> {
        let namespace = self.locks.namespace.read().await;
        let lock = self
            .locks
            .entries
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        EntryLock {
            locks: &self.locks,
            path: path.to_path_buf(),
            guard: Some(guard),
            _namespace: namespace,
        }
    }

    /// Exclude every single-entry operation until the returned guard drops.
    pub async fn lock_namespace(&self) -> RwLockWriteGuard<'_, ()> {
        self.locks.namespace.write().await
    }

    pub async fn exists<K: CacheKey>(&self, key: &K) -> bool {
        match tokio::fs::metadata(self.path(key)).await {
            Ok(metadata) => metadata.is_file(),
            Err(_) => false,
        }
    }

    /// Read a stored payload, `None` when the entry is missing.
    pub async fn read<K: CacheKey>(&self, key: &K) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.path(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::IoError(format!(
                "Failed to read cache entry {:?}: {}",
                key, e
            ))),
        }
    }

    /// Size of the file currently stored for `key`.
    pub async fn prior_entry<K: CacheKey>(&self, key: &K) -> PriorEntry {
        stat_prior(&self.path(key)).await
    }

    /// Persist `data` under `key`, replacing any previous payload atomically.
    ///
    /// The prior size is read under the entry lock, so concurrent writes and
    /// deletes of the same path each report an exact delta.
    pub async fn write<K: CacheKey>(&self, key: &K, data: &[u8]) -> Result<WriteOutcome> {
        let final_path = self.path(key);
        let parent = final_path
            .parent()
            .ok_or_else(|| {
                CacheError::WriteError(format!("Cache path has no parent: {:?}", final_path))
            })?
            .to_path_buf();

        let _entry = self.lock_path(&final_path).await;

        let prior = stat_prior(&final_path).await;
        let temp_path = temp_path_for(&final_path);

        let mut written = create_parent_and_write(&parent, &temp_path, data).await;
        if matches!(&written, Err(e) if e.kind() == ErrorKind::NotFound) {
            // A concurrent delete of a sibling pruned the parent directory
            written = create_parent_and_write(&parent, &temp_path, data).await;
        }
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(CacheError::WriteError(format!(
                "Failed to write temp file {:?}: {}",
                temp_path, e
            )));
        }

        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(CacheError::WriteError(format!(
                "Failed to rename {:?} -> {:?}: {}",
                temp_path, final_path, e
            )));
        }

        debug!(
            "Stored cache entry: path={:?}, size={}, prior={:?}",
            final_path,
            data.len(),
            prior
        );

        Ok(WriteOutcome {
            prior,
            new_size: data.len() as u64,
        })
    }

    /// Best-effort remove; a missing file is not an error.
    pub async fn delete<K: CacheKey>(&self, key: &K) -> Result<DeleteOutcome> {
        let path = self.path(key);
        let entry = self.lock_path(&path).await;
        let prior = stat_prior(&path).await;
        let removed = tokio::fs::remove_file(&path).await;
        drop(entry);

        match removed {
            Ok(()) => {
                self.prune_empty_dirs(&[path]).await;
                Ok(match prior {
                    PriorEntry::Present(size) => DeleteOutcome::Removed(size),
                    _ => DeleteOutcome::RemovedUnknownSize,
                })
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(DeleteOutcome::Absent),
            Err(e) => Err(CacheError::DeleteError(format!(
                "Failed to delete {:?}: {}",
                path, e
            ))),
        }
    }

    /// Remove every entry below `prefix`, returning what was removed.
    ///
    /// Runs under the exclusive namespace lock, so no write can land in the
    /// subtree between the scan and the removal.
    pub async fn delete_subtree(&self, prefix: &SubtreePrefix) -> Result<SubtreeRemoval> {
        let dir = self.root.join(prefix.as_path());
        if dir == self.root {
            return Err(CacheError::InvalidKey(
                "Subtree prefix resolves to the namespace root".to_string(),
            ));
        }

        let _exclusive = self.lock_namespace().await;

        let subtree = scan_dir(dir.clone()).await?;

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(SubtreeRemoval::default()),
            Err(e) => {
                return Err(CacheError::DeleteError(format!(
                    "Failed to remove subtree {:?}: {}",
                    dir, e
                )))
            }
        }

        self.prune_empty_dirs(&[dir]).await;

        Ok(SubtreeRemoval {
            bytes: subtree.total_size,
            files: subtree.file_count(),
        })
    }

    /// Remove the whole namespace and recreate an empty root.
    pub async fn remove_all(&self) -> Result<()> {
        let _exclusive = self.lock_namespace().await;
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CacheError::DeleteError(format!(
                    "Failed to remove namespace {:?}: {}",
                    self.root, e
                )))
            }
        }
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Remove a file reported by [`EntryStore::scan`], returning the bytes freed.
    ///
    /// The size is read again under the entry lock, so a file replaced since
    /// the scan is accounted at its current size.
    pub async fn remove_scanned(&self, path: &Path) -> std::io::Result<u64> {
        let _entry = self.lock_path(path).await;
        let size = tokio::fs::symlink_metadata(path).await?.len();
        tokio::fs::remove_file(path).await?;
        Ok(size)
    }

    /// Recursive walk of the namespace root, skipping hidden entries.
    ///
    /// A missing root is an empty namespace. An unreadable root, or any entry
    /// whose metadata cannot be read for a reason other than having just been
    /// removed, fails the scan rather than under-reporting.
    pub async fn scan(&self) -> Result<ScanResult> {
        scan_dir(self.root.clone()).await
    }

    /// Delete orphaned temp files left behind by interrupted writes.
    pub async fn sweep_temp_files(&self) -> usize {
        let root = self.root.clone();
        let removed = tokio::task::spawn_blocking(move || {
            let mut removed = 0;
            for entry in WalkDir::new(&root).follow_links(false).into_iter().flatten() {
                let is_temp = entry.file_type().is_file()
                    && entry
                        .file_name()
                        .to_str()
                        .map_or(false, |name| name.starts_with('.') && name.ends_with(TEMP_SUFFIX));
                if is_temp && std::fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
            removed
        })
        .await
        .unwrap_or(0);

        if removed > 0 {
            debug!("Removed {} orphaned temp files under {:?}", removed, self.root);
        }
        removed
    }

    /// Remove directories emptied by deletes, bottom-up, never the root itself.
    pub async fn prune_empty_dirs(&self, deleted_paths: &[PathBuf]) -> usize {
        if deleted_paths.is_empty() {
            return 0;
        }

        let root = self.root.clone();
        let paths = deleted_paths.to_vec();
        tokio::task::spawn_blocking(move || prune_empty_dirs_blocking(&root, &paths))
            .await
            .unwrap_or(0)
    }
}

async fn stat_prior(path: &Path) -> PriorEntry {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => PriorEntry::Present(metadata.len()),
        Ok(_) => PriorEntry::Indeterminate,
        Err(e) if e.kind() == ErrorKind::NotFound => PriorEntry::Absent,
        Err(_) => PriorEntry::Indeterminate,
    }
}

fn temp_path_for(final_path: &Path) -> PathBuf {
    let file_name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!(
        ".{}.{}{}",
        file_name,
        uuid::Uuid::new_v4().simple(),
        TEMP_SUFFIX
    ))
}

async fn create_parent_and_write(parent: &Path, path: &Path, data: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(parent).await?;
    write_and_sync(path, data).await
}

async fn write_and_sync(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}

async fn scan_dir(dir: PathBuf) -> Result<ScanResult> {
    tokio::task::spawn_blocking(move || scan_dir_blocking(&dir))
        .await
        .map_err(|e| CacheError::ScanError(format!("Scan task failed: {}", e)))?
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map_or(false, |name| name.starts_with('.'))
}

fn scan_dir_blocking(dir: &Path) -> Result<ScanResult> {
    match std::fs::metadata(dir) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ScanResult::default()),
        Err(e) => {
            return Err(CacheError::ScanError(format!(
                "Namespace root {:?} unreadable: {}",
                dir, e
            )))
        }
    }

    let mut result = ScanResult::default();

    for entry in WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if e.io_error().map_or(false, |io| io.kind() == ErrorKind::NotFound) {
                    continue;
                }
                return Err(CacheError::ScanError(format!(
                    "Directory walk failed under {:?}: {}",
                    dir, e
                )));
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                if e.io_error().map_or(false, |io| io.kind() == ErrorKind::NotFound) {
                    continue;
                }
                return Err(CacheError::ScanError(format!(
                    "Failed to stat {:?}: {}",
                    entry.path(),
                    e
                )));
            }
        };

        result.total_size += metadata.len();
        result.files.push(ScannedFile {
            path: entry.into_path(),
            size: metadata.len(),
            modified: metadata.modified().ok(),
        });
    }

    Ok(result)
}

fn prune_empty_dirs_blocking(root: &Path, deleted_paths: &[PathBuf]) -> usize {
    let mut dirs_to_check: HashSet<PathBuf> = deleted_paths
        .iter()
        .filter_map(|p| p.parent().map(Path::to_path_buf))
        .filter(|d| d.starts_with(root) && d != root)
        .collect();

    let mut removed_count = 0;

    while !dirs_to_check.is_empty() {
        // Deepest first so children are gone before their parents are checked
        let mut dirs: Vec<PathBuf> = dirs_to_check.drain().collect();
        dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));

        for dir in dirs {
            let is_empty = match std::fs::read_dir(&dir) {
                Ok(mut entries) => entries.next().is_none(),
                Err(_) => continue,
            };
            if !is_empty {
                continue;
            }

            match std::fs::remove_dir(&dir) {
                Ok(()) => {
                    removed_count += 1;
                    if let Some(parent) = dir.parent() {
                        if parent.starts_with(root) && parent != root {
                            dirs_to_check.insert(parent.to_path_buf());
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to remove empty cache directory {:?}: {}", dir, e);
                }
            }
        }
    }

    removed_count
}
