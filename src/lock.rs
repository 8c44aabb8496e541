//! File-backed advisory locks shared between processes.
//!
//! Lock files are created on demand inside a namespace directory, one per
//! key, and are never deleted; re-acquisition is cheap. Dropping a handle
//! releases its lock on every exit path.

use std::fs::{self, File, OpenOptions};
use std::path::Path;

use anyhow::{Context, Result};
use fs4::FileExt;

/// Handle to an advisory lock on a single `(namespace, key)` pair.
#[derive(Debug)]
pub struct KeyLock {
    _file: File,
}

impl KeyLock {
    /// Block until a shared lock on `key` is granted. Multiple shared
    /// holders may coexist across processes.
    pub fn shared(ns_dir: &Path, key: &str) -> Result<Self> {
        Self::acquire(ns_dir, key, false)
    }

    /// Block until the exclusive lock on `key` is granted, excluding every
    /// other holder of the same pair.
    pub fn exclusive(ns_dir: &Path, key: &str) -> Result<Self> {
        Self::acquire(ns_dir, key, true)
    }

    fn acquire(ns_dir: &Path, key: &str, exclusive: bool) -> Result<Self> {
        fs::create_dir_all(ns_dir)
            .with_context(|| format!("failed to create lock directory {}", ns_dir.display()))?;
        let path = ns_dir.join(key);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;
        if exclusive {
            file.lock_exclusive()
                .with_context(|| format!("failed to lock {}", path.display()))?;
        } else {
            file.lock_shared()
                .with_context(|| format!("failed to lock {}", path.display()))?;
        }
        Ok(Self { _file: file })
    }
}

/// Lock over the whole store, held shared during normal use and upgraded to
/// exclusive around schema migration.
///
/// Both methods re-lock the same descriptor, so a holder converts between
/// modes without ever being unlocked in between.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
}

impl StoreLock {
    /// Open (creating if needed) the store-wide lock file without taking
    /// any lock yet.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open store lock {}", path.display()))?;
        Ok(Self { file })
    }

    /// Block until the shared store lock is held.
    pub fn shared(&self) -> Result<()> {
        self.file
            .lock_shared()
            .context("failed to take the shared store lock")
    }

    /// Block until the exclusive store lock is held.
    pub fn exclusive(&self) -> Result<()> {
        self.file
            .lock_exclusive()
            .context("failed to take the exclusive store lock")
    }
}
