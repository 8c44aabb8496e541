//! The store façade: content-addressable blobs, the metadata index, and
//! rendered trees behind one handle.
//!
//! A `Store` is not a singleton; several handles over the same directory,
//! in one process or many, cooperate through the advisory lock discipline.
//! Nothing is cached across handles.

use std::env;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use sha2::{Digest, Sha512};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::blob::FileStore;
use crate::compression::decompressing_reader;
use crate::db::{self, AciInfo, AciInfoSort, Db, Remote};
use crate::error::StoreError;
use crate::keys::{self, KeyForm};
use crate::lock::{KeyLock, StoreLock};
use crate::manifest::{ImageManifest, Label};
use crate::render::ImageRegistry;
use crate::treestore::TreeStore;
use crate::uid::UidRange;

const CAS_DIR: &str = "cas";
const BLOB_DIR: &str = "blob";
const MANIFEST_DIR: &str = "imageManifest";
const TREE_DIR: &str = "tree";
const TMP_DIR: &str = "tmp";
const IMAGE_LOCKS_DIR: &str = "imagelocks";
const TREE_LOCKS_DIR: &str = "treestorelocks";
const DB_DIR: &str = "db";
const DB_BACKUPS_DIR: &str = "db-backups";
const STORE_LOCK_FILE: &str = "store.lock";
/// Backups kept when migrating to a new schema version.
const BACKUPS_KEPT: usize = 5;

/// Optional secondary source consulted when a blob is missing locally.
///
/// The digest handed over is the truncated raw digest a key encodes (the
/// first half of the sha512 sum). `Ok(None)` means the source has nothing;
/// any failure simply restores the local miss.
pub trait BlobFetcher {
    fn fetch_by_digest(&self, digest: &[u8]) -> Result<Option<Box<dyn Read + Send>>>;
}

/// Streaming handle over a blob. Holds the shared image lock until dropped,
/// so the bytes read are always those of one committed import.
pub struct ReadStream {
    inner: Box<dyn Read + Send>,
    _lock: KeyLock,
}

impl std::fmt::Debug for ReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadStream").finish_non_exhaustive()
    }
}

impl Read for ReadStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// A content-addressable store for immutable application container images.
pub struct Store {
    dir: PathBuf,
    blobs: FileStore,
    manifests: FileStore,
    db: Db,
    treestore: TreeStore,
    image_lock_dir: PathBuf,
    tree_lock_dir: PathBuf,
    fetcher: Option<Box<dyn BlobFetcher + Send + Sync>>,
    // Shared for the lifetime of the handle; upgraded to exclusive only
    // around schema migration inside `new`.
    _store_lock: StoreLock,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("dir", &self.dir)
            .field("has_fetcher", &self.fetcher.is_some())
            .finish()
    }
}

fn default_root() -> Result<PathBuf> {
    if let Some(path) = env::var_os("ACI_STORE_PATH") {
        return Ok(PathBuf::from(path));
    }
    let home = dirs_next::home_dir().context("failed to resolve HOME for the store")?;
    Ok(home.join(".aci-store"))
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn labels_to_string(labels: &[Label]) -> String {
    labels
        .iter()
        .map(|l| format!("{}={}", l.name, l.value))
        .collect::<Vec<_>>()
        .join(",")
}

impl Store {
    /// Open (creating if necessary) the store under the provided base
    /// directory, or the default root when `None` is supplied.
    ///
    /// Takes the shared store-wide lock and brings the index schema up to
    /// date, which may momentarily upgrade to the exclusive lock.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::FutureSchema`] when the on-disk schema is
    /// newer than this crate expects, and on any layout or index failure.
    pub fn new(base: Option<PathBuf>) -> Result<Self> {
        let base = match base {
            Some(base) => base,
            None => default_root()?,
        };
        let dir = base.join(CAS_DIR);
        for sub in [
            BLOB_DIR,
            MANIFEST_DIR,
            TREE_DIR,
            TMP_DIR,
            IMAGE_LOCKS_DIR,
            TREE_LOCKS_DIR,
            DB_BACKUPS_DIR,
        ] {
            fs::create_dir_all(dir.join(sub)).with_context(|| {
                format!("failed to create store directory {}", dir.join(sub).display())
            })?;
        }

        let store_lock = StoreLock::open(&dir.join(STORE_LOCK_FILE))?;
        store_lock.shared()?;

        let db = Db::new(dir.join(DB_DIR))?;
        let mut needs_migrate = false;
        db.write_tx(|tx| {
            if !db::schema::is_populated(tx)? {
                return db::schema::init(tx);
            }
            let stored = db::schema::version(tx)?;
            if stored > db::DB_VERSION {
                return Err(StoreError::FutureSchema {
                    stored,
                    expected: db::DB_VERSION,
                }
                .into());
            }
            if stored < db::DB_VERSION {
                needs_migrate = true;
            }
            Ok(())
        })?;

        if needs_migrate {
            // Another process may have migrated between the check above and
            // this exclusive section; `migrate` re-reads the stored version
            // inside the transaction, so the loser of the race is a no-op.
            store_lock.exclusive()?;
            db.backup(&dir.join(DB_BACKUPS_DIR), BACKUPS_KEPT)
                .context("failed to back up the index before migration")?;
            db.write_tx(|tx| db::schema::migrate(tx, db::DB_VERSION))?;
            store_lock.shared()?;
            debug!(dir = %dir.display(), version = db::DB_VERSION, "store schema migrated");
        }

        Ok(Self {
            blobs: FileStore::new(dir.join(BLOB_DIR)),
            manifests: FileStore::new(dir.join(MANIFEST_DIR)),
            treestore: TreeStore::new(dir.join(TREE_DIR)),
            image_lock_dir: dir.join(IMAGE_LOCKS_DIR),
            tree_lock_dir: dir.join(TREE_LOCKS_DIR),
            db,
            fetcher: None,
            _store_lock: store_lock,
            dir,
        })
    }

    /// Attach a secondary blob source consulted on local misses.
    #[must_use]
    pub fn with_blob_fetcher(mut self, fetcher: Box<dyn BlobFetcher + Send + Sync>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Root of the store layout (the `cas` directory).
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.dir
    }

    /// Resolve a possibly partial key to the full key of a stored image.
    ///
    /// Over-long input is truncated to the full key length and full keys
    /// pass through without an existence check; the subsequent read
    /// surfaces any miss. Callers must hold a lock spanning the read if
    /// they need the key to keep existing.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidKey`] for malformed input,
    /// [`StoreError::NotFound`] when no stored key has the prefix, and
    /// [`StoreError::AmbiguousKey`] when more than one does.
    pub fn resolve_key(&self, key: &str) -> Result<String> {
        match keys::classify(key)? {
            KeyForm::Full(full) => Ok(full),
            KeyForm::Partial(prefix) => {
                let mut infos = self
                    .db
                    .read_tx(|tx| db::aci_infos_by_key_prefix(tx, &prefix))
                    .context("error retrieving ACI infos")?;
                match infos.len() {
                    0 => Err(StoreError::NotFound(prefix).into()),
                    1 => Ok(infos.remove(0).blob_key),
                    _ => Err(StoreError::AmbiguousKey(prefix).into()),
                }
            }
        }
    }

    /// Open a streaming read over the blob for a (possibly partial) key.
    ///
    /// The returned handle owns a shared lock on the image key; drop it to
    /// release. When the blob is missing locally and a secondary source is
    /// attached, its stream is served instead; a secondary failure
    /// restores the local miss.
    pub fn read_stream(&self, key: &str) -> Result<ReadStream> {
        let key = self.resolve_key(key).context("error resolving key")?;
        let lock = KeyLock::shared(&self.image_lock_dir, &key)?;
        match self.blobs.read_stream(&key) {
            Ok(file) => {
                debug!(%key, "blob opened for reading");
                Ok(ReadStream {
                    inner: Box::new(file),
                    _lock: lock,
                })
            }
            Err(err) if StoreError::is_not_found(&err) => {
                if let Some(stream) = self.fetch_from_secondary(&key) {
                    return Ok(ReadStream {
                        inner: stream,
                        _lock: lock,
                    });
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn fetch_from_secondary(&self, key: &str) -> Option<Box<dyn Read + Send>> {
        let fetcher = self.fetcher.as_ref()?;
        let digest = hex::decode(key.strip_prefix(keys::KEY_PREFIX)?).ok()?;
        match fetcher.fetch_by_digest(&digest) {
            Ok(found) => {
                if found.is_some() {
                    debug!(%key, "blob served from the secondary source");
                }
                found
            }
            Err(err) => {
                warn!(%key, %err, "secondary blob source failed");
                None
            }
        }
    }

    /// Import an image archive, decompressing as needed, and return the
    /// full key derived from the uncompressed bytes.
    ///
    /// `latest` marks an import that answered an unversioned query; a
    /// re-import of the same bytes updates the flag, last write wins.
    pub fn write_aci<R: Read + Seek>(&self, aci: R, latest: bool) -> Result<String> {
        let mut decompressed = decompressing_reader(aci)?;

        // Tee the uncompressed bytes into a temp file on the store
        // filesystem and a running sha512.
        let mut tmp = self
            .tmp_file()
            .context("error creating temp file for the image")?;
        let mut hasher = Sha512::new();
        let mut buf = [0u8; 32 * 1024];
        loop {
            let read = decompressed
                .read(&mut buf)
                .map_err(|err| StoreError::Decompression(err.to_string()))?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            tmp.write_all(&buf[..read]).context("error copying image")?;
        }
        tmp.as_file()
            .sync_all()
            .context("error flushing the image")?;

        tmp.as_file_mut()
            .seek(SeekFrom::Start(0))
            .context("error rewinding the image")?;
        let manifest = ImageManifest::from_archive(tmp.as_file_mut())?;

        let key = keys::hash_to_key(hasher);
        let _lock = KeyLock::exclusive(&self.image_lock_dir, &key)?;

        let tmp_path = tmp
            .into_temp_path()
            .keep()
            .context("error detaching the temp image")?;
        self.blobs
            .import(&tmp_path, &key)
            .context("error importing image")?;

        let manifest_json =
            serde_json::to_vec(&manifest).context("error marshalling image manifest")?;
        self.manifests
            .write(&self.tmp_dir()?, &key, &manifest_json)
            .context("error importing image manifest")?;

        let info = AciInfo {
            blob_key: key.clone(),
            app_name: manifest.name.clone(),
            import_time: now_millis(),
            latest,
        };
        self.db
            .write_tx(|tx| db::write_aci_info(tx, &info))
            .context("error writing ACI info")?;

        debug!(%key, app = %manifest.name, latest, "aci imported");
        Ok(key)
    }

    /// Remove the image with the given full key.
    ///
    /// The index row and the matching remote row go first, in one
    /// transaction; the blob and manifest files are erased best-effort
    /// afterwards. Erasure failures surface as [`StoreError::Removal`] but
    /// never roll the transaction back: the index is authoritative and
    /// leftover bytes wait for an external collector.
    pub fn remove_aci(&self, key: &str) -> Result<()> {
        let _lock = KeyLock::exclusive(&self.image_lock_dir, key)?;

        self.db
            .write_tx(|tx| {
                if db::aci_info_by_blob_key(tx, key)?.is_none() {
                    return Err(StoreError::NotFound(key.to_string()).into());
                }
                db::remove_aci_info(tx, key)?;
                db::remove_remote(tx, key)?;
                Ok(())
            })
            .with_context(|| format!("cannot remove image with key {key}"))?;

        let mut erase_errors = Vec::new();
        for (family, files) in [("blob", &self.blobs), ("imageManifest", &self.manifests)] {
            if let Err(err) = files.erase(key) {
                erase_errors.push(format!("{family}: {err:#}"));
            }
        }
        if !erase_errors.is_empty() {
            warn!(%key, failures = erase_errors.len(), "aci removed with leftover disk entries");
            return Err(StoreError::Removal(erase_errors).into());
        }
        debug!(%key, "aci removed");
        Ok(())
    }

    /// Fetch and parse the manifest stored for a (possibly partial) key.
    pub fn get_image_manifest(&self, key: &str) -> Result<ImageManifest> {
        let key = self.resolve_key(key).context("error resolving key")?;
        let _lock = KeyLock::shared(&self.image_lock_dir, &key)?;
        let bytes = self
            .manifests
            .read(&key)
            .context("error retrieving image manifest")?;
        let manifest = serde_json::from_slice(&bytes)
            .map_err(|err| StoreError::Manifest(format!("failed to parse stored manifest: {err}")))?;
        Ok(manifest)
    }

    /// Key of the stored image best matching `name` and `labels`.
    ///
    /// Every requested label must appear on the image manifest. Among the
    /// matches the most recent import wins, except that when no `version`
    /// label is requested, imports marked latest are preferred first.
    pub fn get_aci(&self, name: &str, labels: &[Label]) -> Result<String> {
        let version_requested = labels.iter().any(|l| l.name == "version");
        let infos = self
            .db
            .read_tx(|tx| db::aci_infos_by_app_name(tx, name))?;

        let mut best: Option<AciInfo> = None;
        for info in infos {
            let manifest = self
                .get_image_manifest(&info.blob_key)
                .context("error getting image manifest")?;
            if !labels.iter().all(|l| manifest.labels.contains(l)) {
                continue;
            }
            match &best {
                None => best = Some(info),
                Some(current) => {
                    if !version_requested {
                        if !current.latest && info.latest {
                            best = Some(info);
                            continue;
                        }
                        if current.latest && !info.latest {
                            continue;
                        }
                    }
                    if info.import_time > current.import_time {
                        best = Some(info);
                    }
                }
            }
        }

        match best {
            Some(info) => Ok(info.blob_key),
            None => Err(StoreError::NotFound(format!(
                "aci satisfying name {name:?} and labels {}",
                labels_to_string(labels)
            ))
            .into()),
        }
    }

    /// All index rows, ordered by the given fields.
    pub fn get_all_aci_infos(
        &self,
        sort: &[AciInfoSort],
        ascending: bool,
    ) -> Result<Vec<AciInfo>> {
        self.db.read_tx(|tx| db::all_aci_infos(tx, sort, ascending))
    }

    /// The remote recorded for a source URL, if any.
    pub fn get_remote(&self, aci_url: &str) -> Result<Option<Remote>> {
        self.db.read_tx(|tx| db::get_remote(tx, aci_url))
    }

    /// Add or update a remote.
    pub fn write_remote(&self, remote: &Remote) -> Result<()> {
        self.db.write_tx(|tx| db::write_remote(tx, remote))
    }

    /// Render the tree for `key` unless it is already complete.
    ///
    /// With `rebuild` any existing rendering is discarded first; without
    /// it, a completely rendered tree returns immediately. A partial tree
    /// (for example after a failed removal) is always discarded before
    /// rendering starts.
    pub fn render_tree_store(
        &self,
        key: &str,
        registry: &dyn ImageRegistry,
        uid_range: &UidRange,
        rebuild: bool,
    ) -> Result<()> {
        // The tree key is locked before any image key; extraction takes
        // the image locks through `read_stream`.
        let _lock = KeyLock::exclusive(&self.tree_lock_dir, key)?;
        if !rebuild && self.treestore.is_rendered(key) {
            return Ok(());
        }
        self.treestore.remove(key)?;
        self.treestore.write(key, self, registry, uid_range)?;
        Ok(())
    }

    /// Verify the tree rendering for `key` under a shared tree lock.
    pub fn check_tree_store(&self, key: &str) -> Result<()> {
        let _lock = KeyLock::shared(&self.tree_lock_dir, key)?;
        self.treestore.check(key)
    }

    /// Remove the rendered tree for `key`.
    pub fn remove_tree_store(&self, key: &str) -> Result<()> {
        let _lock = KeyLock::exclusive(&self.tree_lock_dir, key)?;
        self.treestore
            .remove(key)
            .context("error removing the tree store")
    }

    /// Absolute path of the tree for `key`; existence and completeness are
    /// the caller's concern (see [`Store::check_tree_store`]).
    #[must_use]
    pub fn tree_store_path(&self, key: &str) -> PathBuf {
        self.treestore.tree_path(key)
    }

    /// Absolute path of the rootfs inside the tree for `key`.
    #[must_use]
    pub fn tree_store_rootfs(&self, key: &str) -> PathBuf {
        self.treestore.rootfs_path(key)
    }

    /// A new temp file on the same filesystem as the store, so an import
    /// can be a rename rather than a cross-device copy.
    pub fn tmp_file(&self) -> Result<NamedTempFile> {
        let dir = self.tmp_dir()?;
        NamedTempFile::new_in(&dir)
            .with_context(|| format!("failed to create a temp file in {}", dir.display()))
    }

    /// The store's temp directory, created on demand.
    pub fn tmp_dir(&self) -> Result<PathBuf> {
        let dir = self.dir.join(TMP_DIR);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create temp directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Derive the storage key for a finalized sha512 hasher.
    #[must_use]
    pub fn hash_to_key(&self, hasher: Sha512) -> String {
        keys::hash_to_key(hasher)
    }

    /// Listing of every stored blob and manifest, values truncated to 128
    /// bytes, hex-encoded on request.
    pub fn dump(&self, hex_output: bool) -> Result<String> {
        use std::fmt::Write as _;

        let mut out = String::new();
        for files in [&self.blobs, &self.manifests] {
            let mut count = 0usize;
            for key in files.keys()? {
                let mut value = files.read(&key)?;
                value.truncate(128);
                let rendered = if hex_output {
                    hex::encode(&value)
                } else {
                    String::from_utf8_lossy(&value).into_owned()
                };
                let _ = writeln!(out, "{}/{key}: {rendered}", files.base().display());
                count += 1;
            }
            let _ = writeln!(out, "{count} total keys");
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests;
