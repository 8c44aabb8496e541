//! Sharded on-disk file store for opaque byte blobs.
//!
//! One instance exists per stored family (image blobs, image manifests).
//! Keys map to `<base>/<shard>/<shard>/<key>` where the shards are the two
//! leading 2-character groups of the key's hex digest, keeping any one
//! directory below a practical fanout.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::error::StoreError;
use crate::keys::KEY_PREFIX;

/// Width of one shard directory name.
const SHARD_WIDTH: usize = 2;
/// Shard levels between the family root and the stored file.
const SHARD_DEPTH: usize = 2;

#[derive(Debug)]
pub(crate) struct FileStore {
    base: PathBuf,
}

impl FileStore {
    pub(crate) fn new(base: PathBuf) -> Self {
        Self { base }
    }

    pub(crate) fn base(&self) -> &Path {
        &self.base
    }

    fn stored_path(&self, key: &str) -> PathBuf {
        let mut path = self.base.clone();
        // Shard on the digest: the algorithm prefix is identical across
        // every key and would collapse the fanout to one directory.
        for level in 0..SHARD_DEPTH {
            let start = KEY_PREFIX.len() + level * SHARD_WIDTH;
            path.push(key.get(start..start + SHARD_WIDTH).unwrap_or("xx"));
        }
        path.push(key);
        path
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.stored_path(key).is_file()
    }

    /// Atomically move a file from `src` into the layout at `key`.
    ///
    /// `src` must live on the same filesystem (the store's `tmp/`), so the
    /// move is a rename and a reader never observes a torn blob.
    pub(crate) fn import(&self, src: &Path, key: &str) -> Result<()> {
        let dest = self.stored_path(key);
        self.ensure_parent(&dest)?;
        fs::rename(src, &dest).map_err(|err| {
            StoreError::Import(format!(
                "failed to move {} into place at {}: {err}",
                src.display(),
                dest.display()
            ))
        })?;
        if let Some(parent) = dest.parent() {
            fsync_dir(parent).ok();
        }
        Ok(())
    }

    /// Write bytes under `key` with the same atomicity as [`import`]:
    /// a temp file in `tmp_dir` followed by a rename.
    ///
    /// [`import`]: Self::import
    pub(crate) fn write(&self, tmp_dir: &Path, key: &str, bytes: &[u8]) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(tmp_dir)
            .with_context(|| format!("failed to create temp file in {}", tmp_dir.display()))?;
        tmp.write_all(bytes)
            .with_context(|| format!("failed to write temp file for key {key}"))?;
        tmp.as_file()
            .sync_all()
            .with_context(|| format!("failed to flush temp file for key {key}"))?;
        let dest = self.stored_path(key);
        self.ensure_parent(&dest)?;
        tmp.persist(&dest).map_err(|err| {
            StoreError::Import(format!(
                "failed to move key {key} into place at {}: {err}",
                dest.display()
            ))
        })?;
        if let Some(parent) = dest.parent() {
            fsync_dir(parent).ok();
        }
        Ok(())
    }

    pub(crate) fn read_stream(&self, key: &str) -> Result<File> {
        let path = self.stored_path(key);
        match File::open(&path) {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()).into())
            }
            Err(err) => {
                Err(err).with_context(|| format!("failed to open blob at {}", path.display()))
            }
        }
    }

    pub(crate) fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.stored_path(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()).into())
            }
            Err(err) => {
                Err(err).with_context(|| format!("failed to read blob at {}", path.display()))
            }
        }
    }

    /// Remove the stored file for `key`. A missing file is an error; the
    /// caller aggregates erasure failures.
    pub(crate) fn erase(&self, key: &str) -> Result<()> {
        let path = self.stored_path(key);
        fs::remove_file(&path)
            .with_context(|| format!("failed to remove blob at {}", path.display()))
    }

    /// All keys currently stored, in lexical order.
    pub(crate) fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        if !self.base.exists() {
            return Ok(keys);
        }
        for entry in WalkDir::new(&self.base)
            .min_depth(SHARD_DEPTH + 1)
            .max_depth(SHARD_DEPTH + 1)
            .sort_by(|a, b| a.path().cmp(b.path()))
        {
            let entry = entry.with_context(|| {
                format!("failed to walk file store at {}", self.base.display())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                keys.push(name.to_string());
            }
        }
        Ok(keys)
    }

    fn ensure_parent(&self, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create shard directory {}", parent.display())
            })?;
        }
        Ok(())
    }
}

pub(crate) fn fsync_dir(dir: &Path) -> Result<()> {
    let file = File::open(dir)?;
    file.sync_all()?;
    Ok(())
}
