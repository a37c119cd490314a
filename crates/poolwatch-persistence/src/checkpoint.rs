//! Checkpoint store.
//!
//! Crash consistency: the checkpoint is only written after a block is fully
//! processed, and each write replaces the file atomically (temp file, fsync,
//! rename). A crash before the rename leaves the previous height in place, so
//! the block is reprocessed on restart instead of skipped.

use crate::error::{PersistenceError, PersistenceResult};
use parking_lot::Mutex;
use poolwatch_core::Checkpoint;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Persistent last-processed block height.
pub trait CheckpointStore: Send {
    /// Current last processed block.
    fn get(&self) -> u64;

    /// Persist a new height.
    ///
    /// Fails with [`PersistenceError::NonMonotonic`] and leaves the stored
    /// value untouched when `height` is below the current value. Setting the
    /// current value again is a no-op.
    fn set(&mut self, height: u64) -> PersistenceResult<()>;
}

/// JSON file checkpoint store.
pub struct FileCheckpointStore {
    path: PathBuf,
    current: Checkpoint,
}

impl FileCheckpointStore {
    /// Read an existing checkpoint file, `None` on first run.
    pub fn load(path: impl AsRef<Path>) -> PersistenceResult<Option<Checkpoint>> {
        match fs::read_to_string(path.as_ref()) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Open the store, starting from `default_last_processed` if no
    /// checkpoint file exists yet.
    pub fn open(path: impl Into<PathBuf>, default_last_processed: u64) -> PersistenceResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let current = match Self::load(&path)? {
            Some(checkpoint) => {
                info!(
                    path = %path.display(),
                    last_processed_block = checkpoint.last_processed_block,
                    "Loaded checkpoint"
                );
                checkpoint
            }
            None => {
                info!(
                    path = %path.display(),
                    last_processed_block = default_last_processed,
                    "No checkpoint found, starting from default height"
                );
                Checkpoint::new(default_last_processed)
            }
        };

        Ok(Self { path, current })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_atomic(&self, checkpoint: &Checkpoint) -> PersistenceResult<()> {
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            serde_json::to_writer_pretty(&mut file, checkpoint)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        // Persist the rename itself. Not every platform can fsync a directory.
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
                warn!(?e, dir = %parent.display(), "Failed to sync checkpoint directory");
            }
        }
        Ok(())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn get(&self) -> u64 {
        self.current.last_processed_block
    }

    fn set(&mut self, height: u64) -> PersistenceResult<()> {
        let current = self.current.last_processed_block;
        if height < current {
            return Err(PersistenceError::NonMonotonic {
                current,
                requested: height,
            });
        }
        if height == current {
            return Ok(());
        }

        let next = Checkpoint::new(height);
        self.write_atomic(&next)?;
        self.current = next;
        debug!(last_processed_block = height, "Checkpoint advanced");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryCheckpointState {
    current: u64,
    history: Vec<u64>,
    fail_writes: bool,
}

/// In-memory checkpoint store.
///
/// Clones share state so a test can keep a handle while the monitor owns the
/// store. `history` records every successful advance.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    state: Arc<Mutex<MemoryCheckpointState>>,
}

impl MemoryCheckpointStore {
    pub fn new(initial: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryCheckpointState {
                current: initial,
                ..Default::default()
            })),
        }
    }

    /// Every height successfully written, in order.
    pub fn history(&self) -> Vec<u64> {
        self.state.lock().history.clone()
    }

    /// Make subsequent writes fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(&self) -> u64 {
        self.state.lock().current
    }

    fn set(&mut self, height: u64) -> PersistenceResult<()> {
        let mut state = self.state.lock();
        if height < state.current {
            return Err(PersistenceError::NonMonotonic {
                current: state.current,
                requested: height,
            });
        }
        if height == state.current {
            return Ok(());
        }
        if state.fail_writes {
            return Err(PersistenceError::Io(std::io::Error::new(
                ErrorKind::Other,
                "injected checkpoint write failure",
            )));
        }
        state.current = height;
        state.history.push(height);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_first_run_uses_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        let store = FileCheckpointStore::open(&path, 99).unwrap();
        assert_eq!(store.get(), 99);
        // Nothing is written until the first advance
        assert!(!path.exists());
    }

    #[test]
    fn test_set_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/checkpoint.json");

        {
            let mut store = FileCheckpointStore::open(&path, 0).unwrap();
            store.set(10).unwrap();
            store.set(12).unwrap();
        }

        let store = FileCheckpointStore::open(&path, 0).unwrap();
        assert_eq!(store.get(), 12);
        let loaded = FileCheckpointStore::load(&path).unwrap().unwrap();
        assert_eq!(loaded.last_processed_block, 12);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_backwards_set_fails_without_mutation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        let mut store = FileCheckpointStore::open(&path, 0).unwrap();
        store.set(20).unwrap();

        let err = store.set(19).unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::NonMonotonic {
                current: 20,
                requested: 19
            }
        ));
        assert_eq!(store.get(), 20);
        assert_eq!(FileCheckpointStore::load(&path).unwrap().unwrap().last_processed_block, 20);
    }

    #[test]
    fn test_same_height_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut store = FileCheckpointStore::open(dir.path().join("checkpoint.json"), 5).unwrap();
        store.set(5).unwrap();
        assert_eq!(store.get(), 5);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FileCheckpointStore::open(&path, 0),
            Err(PersistenceError::Json(_))
        ));
    }

    #[test]
    fn test_memory_store_monotonic_and_shared() {
        let handle = MemoryCheckpointStore::new(3);
        let mut store = handle.clone();
        store.set(4).unwrap();
        assert!(store.set(2).is_err());
        assert_eq!(handle.get(), 4);
        assert_eq!(handle.history(), vec![4]);
    }

    #[test]
    fn test_memory_store_injected_failure() {
        let handle = MemoryCheckpointStore::new(0);
        let mut store = handle.clone();
        handle.set_fail_writes(true);
        assert!(matches!(store.set(1), Err(PersistenceError::Io(_))));
        assert_eq!(handle.get(), 0);
    }
}
