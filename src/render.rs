//! Dependency-ordered image rendering.
//!
//! A registry resolves an image into the topologically ordered list of
//! source blobs and per-source file maps; the renderer streams each source
//! out of the store and extracts its subset into the destination. The file
//! maps are disjoint by construction, so the extraction runs with
//! overwrites refused: a collision means the registry is broken, not the
//! destination.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::extract::extract_tar;
use crate::manifest::Label;
use crate::store::Store;
use crate::uid::UidRange;

/// One element of a rendering sequence: the source blob key and the subset
/// of its paths to materialize.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedAci {
    pub key: String,
    pub file_map: HashSet<String>,
}

/// Produces ordered rendering sequences for an image and its transitive
/// dependencies.
///
/// Implementations consult the store through [`Store::read_stream`] and
/// [`Store::get_image_manifest`] and must order the sequence so that the
/// top image's files are never shadowed; the renderer trusts the order and
/// never overwrites.
pub trait ImageRegistry {
    /// Sequence for the image with the given full blob key.
    fn rendered_by_id(&self, key: &str) -> Result<Vec<RenderedAci>>;

    /// Sequence for the best image matching a name and labels.
    fn rendered_by_name(&self, name: &str, labels: &[Label]) -> Result<Vec<RenderedAci>>;

    /// Sequence for an already-resolved dependency list.
    fn rendered_from_list(&self, keys: &[String]) -> Result<Vec<RenderedAci>>;
}

/// Render the image with the given key, and its dependency chain, into
/// `dir`.
pub fn render_aci_with_image_id(
    store: &Store,
    key: &str,
    dir: &Path,
    registry: &dyn ImageRegistry,
    uid_range: &UidRange,
) -> Result<()> {
    let entries = registry.rendered_by_id(key)?;
    render_image(store, &entries, dir, uid_range)
}

/// Render the best image matching `name` and `labels`, and its dependency
/// chain, into `dir`.
pub fn render_aci(
    store: &Store,
    name: &str,
    labels: &[Label],
    dir: &Path,
    registry: &dyn ImageRegistry,
    uid_range: &UidRange,
) -> Result<()> {
    let entries = registry.rendered_by_name(name, labels)?;
    render_image(store, &entries, dir, uid_range)
}

/// Render an already-resolved dependency list into `dir`.
pub fn render_aci_from_list(
    store: &Store,
    keys: &[String],
    dir: &Path,
    registry: &dyn ImageRegistry,
    uid_range: &UidRange,
) -> Result<()> {
    let entries = registry.rendered_from_list(keys)?;
    render_image(store, &entries, dir, uid_range)
}

pub(crate) fn render_image(
    store: &Store,
    entries: &[RenderedAci],
    dir: &Path,
    uid_range: &UidRange,
) -> Result<()> {
    for entry in entries {
        let stream = store.read_stream(&entry.key)?;
        extract_tar(stream, dir, false, uid_range, Some(&entry.file_map))
            .with_context(|| format!("error extracting {}", entry.key))?;
    }
    debug!(
        sources = entries.len(),
        dir = %dir.display(),
        "image rendered"
    );
    Ok(())
}
