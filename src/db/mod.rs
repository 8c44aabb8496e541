//! Transactional metadata index over the store's SQLite database.
//!
//! The database lives in its own directory so migration backups can copy
//! the directory wholesale. Row operations are free functions over an open
//! transaction, composed by the store into single-transaction units.

mod aciinfo;
mod remote;
pub(crate) mod schema;

pub use aciinfo::{AciInfo, AciInfoSort};
pub use remote::Remote;

pub(crate) use aciinfo::{
    aci_info_by_blob_key, aci_infos_by_app_name, aci_infos_by_key_prefix, all_aci_infos,
    remove_aci_info, write_aci_info,
};
pub(crate) use remote::{get_remote, remove_remote, write_remote};
pub(crate) use schema::DB_VERSION;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};

const DB_FILENAME: &str = "store.sqlite";

#[derive(Debug)]
pub(crate) struct Db {
    dir: PathBuf,
}

impl Db {
    pub(crate) fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create index directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn connection(&self) -> Result<Connection> {
        let path = self.dir.join(DB_FILENAME);
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open index at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL for the index")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign keys for the index")?;
        conn.busy_timeout(Duration::from_secs(10))
            .context("failed to set busy timeout for the index")?;
        Ok(conn)
    }

    /// Run `f` inside a read transaction; observers see one consistent
    /// snapshot for the whole closure.
    pub(crate) fn read_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .context("failed to start index read transaction")?;
        let out = f(&tx)?;
        tx.commit()
            .context("failed to finish index read transaction")?;
        Ok(out)
    }

    /// Run `f` inside a single `BEGIN IMMEDIATE` transaction, committing on
    /// success.
    pub(crate) fn write_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start index transaction")?;
        let out = f(&tx)?;
        tx.commit().context("failed to commit index transaction")?;
        Ok(out)
    }

    /// Copy the index directory into `backups_dir/0`, rotating existing
    /// numbered backups so at most `keep` remain.
    pub(crate) fn backup(&self, backups_dir: &Path, keep: usize) -> Result<()> {
        fs::create_dir_all(backups_dir).with_context(|| {
            format!("failed to create backup directory {}", backups_dir.display())
        })?;

        // Drop backups that would rotate past the retention limit, then
        // shift the survivors up by one.
        for id in (0..keep).rev() {
            let path = backups_dir.join(id.to_string());
            if !path.exists() {
                continue;
            }
            if id + 1 >= keep {
                fs::remove_dir_all(&path).with_context(|| {
                    format!("failed to remove old backup {}", path.display())
                })?;
            } else {
                let next = backups_dir.join((id + 1).to_string());
                fs::rename(&path, &next).with_context(|| {
                    format!("failed to rotate backup {}", path.display())
                })?;
            }
        }

        let target = backups_dir.join("0");
        fs::create_dir_all(&target)
            .with_context(|| format!("failed to create backup {}", target.display()))?;
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list index directory {}", self.dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let dest = target.join(entry.file_name());
            fs::copy(entry.path(), &dest).with_context(|| {
                format!("failed to back up {}", entry.path().display())
            })?;
        }
        Ok(())
    }
}
