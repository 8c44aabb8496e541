//! Content-addressable storage for immutable application container images.
//!
//! Images enter through an ingest pipeline (decompress, hash, atomic
//! import), are identified by a content-derived key, and are tracked in a
//! transactional metadata index so human-readable queries resolve back to
//! that identity. A rendering engine composes an image with its transitive
//! dependencies into a runnable filesystem tree. Multiple processes over
//! the same store cooperate through advisory file locks.

mod blob;
mod compression;
mod db;
mod error;
mod extract;
mod keys;
mod lock;
mod manifest;
mod render;
mod store;
mod treestore;
mod uid;

pub use compression::{decompressing_reader, DecompressingReader};
pub use db::{AciInfo, AciInfoSort, Remote};
pub use error::StoreError;
pub use extract::extract_tar;
pub use keys::{digest_to_key, hash_to_key, DIGEST_LEN, KEY_LEN, KEY_PREFIX};
pub use lock::{KeyLock, StoreLock};
pub use manifest::{Dependency, ImageManifest, Label};
pub use render::{
    render_aci, render_aci_from_list, render_aci_with_image_id, ImageRegistry, RenderedAci,
};
pub use store::{BlobFetcher, ReadStream, Store};
pub use uid::UidRange;
