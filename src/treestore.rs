//! Rendered filesystem trees, one directory per top-level image key.
//!
//! A tree holds the image's `manifest` and `rootfs/` exactly as composed
//! from its dependency chain. The sentinel file is written as the very last
//! step of a successful rendering, so its presence (with the right
//! contents) is the completeness mark; anything else is a partial tree.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use crate::render::{self, ImageRegistry};
use crate::store::Store;
use crate::uid::UidRange;

/// Written as the final step of a rendering; holds the rendered image key.
const RENDERED_SENTINEL: &str = ".rendered";
const ROOTFS_DIR: &str = "rootfs";

#[derive(Debug)]
pub(crate) struct TreeStore {
    path: PathBuf,
}

impl TreeStore {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub(crate) fn tree_path(&self, key: &str) -> PathBuf {
        self.path.join(key)
    }

    pub(crate) fn rootfs_path(&self, key: &str) -> PathBuf {
        self.tree_path(key).join(ROOTFS_DIR)
    }

    fn sentinel_path(&self, key: &str) -> PathBuf {
        self.tree_path(key).join(RENDERED_SENTINEL)
    }

    pub(crate) fn is_rendered(&self, key: &str) -> bool {
        self.sentinel_path(key).is_file()
    }

    /// Render the image into the tree directory and mark it complete.
    pub(crate) fn write(
        &self,
        key: &str,
        store: &Store,
        registry: &dyn ImageRegistry,
        uid_range: &UidRange,
    ) -> Result<()> {
        let dir = self.tree_path(key);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create tree directory {}", dir.display()))?;
        let entries = registry.rendered_by_id(key)?;
        render::render_image(store, &entries, &dir, uid_range)?;
        self.mark_rendered(key)?;
        debug!(%key, "tree store rendered");
        Ok(())
    }

    // The sentinel appears atomically: temp file in the tree dir, fsync,
    // rename.
    fn mark_rendered(&self, key: &str) -> Result<()> {
        let tmp = self.tree_path(key).join(".rendered.tmp");
        {
            let mut file = File::create(&tmp)
                .with_context(|| format!("failed to create sentinel at {}", tmp.display()))?;
            file.write_all(key.as_bytes())
                .context("failed to write the rendered sentinel")?;
            file.sync_all()
                .context("failed to flush the rendered sentinel")?;
        }
        fs::rename(&tmp, self.sentinel_path(key))
            .context("failed to move the rendered sentinel into place")
    }

    /// Verify that the tree for `key` is fully rendered.
    pub(crate) fn check(&self, key: &str) -> Result<()> {
        let sentinel = self.sentinel_path(key);
        let contents = fs::read_to_string(&sentinel).map_err(|err| {
            anyhow!(
                "tree store for {key} is not fully rendered ({}: {err})",
                sentinel.display()
            )
        })?;
        if contents != key {
            return Err(anyhow!(
                "tree store sentinel for {key} names a different image ({contents})"
            ));
        }
        Ok(())
    }

    /// Remove the tree for `key`, sentinel first so a crashed removal is
    /// never mistaken for a complete rendering.
    pub(crate) fn remove(&self, key: &str) -> Result<()> {
        let sentinel = self.sentinel_path(key);
        match fs::remove_file(&sentinel) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to remove sentinel {}", sentinel.display())
                })
            }
        }
        let dir = self.tree_path(key);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to remove tree {}", dir.display()))?;
            debug!(%key, "tree store removed");
        }
        Ok(())
    }
}
