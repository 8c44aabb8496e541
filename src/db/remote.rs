use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Transaction};

/// A source URL a blob was fetched from, kept so higher-level fetchers can
/// deduplicate downloads and revalidate with the origin. Lifecycle is
/// entirely caller-driven.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Remote {
    pub aci_url: String,
    pub sig_url: String,
    pub etag: String,
    pub blob_key: String,
}

pub(crate) fn get_remote(tx: &Transaction<'_>, aci_url: &str) -> Result<Option<Remote>> {
    tx.query_row(
        "SELECT aciurl, sigurl, etag, blobkey FROM remote WHERE aciurl = ?1",
        params![aci_url],
        |row| {
            Ok(Remote {
                aci_url: row.get(0)?,
                sig_url: row.get(1)?,
                etag: row.get(2)?,
                blob_key: row.get(3)?,
            })
        },
    )
    .optional()
    .context("failed to query remote")
}

/// Upsert by source URL.
pub(crate) fn write_remote(tx: &Transaction<'_>, remote: &Remote) -> Result<()> {
    tx.execute(
        "INSERT INTO remote (aciurl, sigurl, etag, blobkey) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(aciurl) DO UPDATE SET \
            sigurl = excluded.sigurl, \
            etag = excluded.etag, \
            blobkey = excluded.blobkey",
        params![remote.aci_url, remote.sig_url, remote.etag, remote.blob_key],
    )
    .context("failed to write remote")?;
    Ok(())
}

/// Remove every remote row pointing at a blob key, alongside ACI removal so
/// no remote keeps referencing a dropped image.
pub(crate) fn remove_remote(tx: &Transaction<'_>, blob_key: &str) -> Result<()> {
    tx.execute("DELETE FROM remote WHERE blobkey = ?1", params![blob_key])
        .context("failed to remove remote")?;
    Ok(())
}
