use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row, Transaction};

/// One imported image as tracked by the metadata index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AciInfo {
    pub blob_key: String,
    pub app_name: String,
    /// Import wall-clock time in unix milliseconds.
    pub import_time: i64,
    /// Whether the import answered an unversioned ("latest") query.
    pub latest: bool,
}

/// Sort fields accepted by [`Store::get_all_aci_infos`].
///
/// [`Store::get_all_aci_infos`]: crate::Store::get_all_aci_infos
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AciInfoSort {
    BlobKey,
    AppName,
    ImportTime,
    Latest,
}

impl AciInfoSort {
    fn column(self) -> &'static str {
        match self {
            Self::BlobKey => "blobkey",
            Self::AppName => "appname",
            Self::ImportTime => "importtime",
            Self::Latest => "latest",
        }
    }
}

fn row_to_info(row: &Row<'_>) -> rusqlite::Result<AciInfo> {
    Ok(AciInfo {
        blob_key: row.get(0)?,
        app_name: row.get(1)?,
        import_time: row.get(2)?,
        latest: row.get::<_, i64>(3)? != 0,
    })
}

const INFO_COLUMNS: &str = "blobkey, appname, importtime, latest";

/// Upsert by blob key; a re-import updates the row in place.
pub(crate) fn write_aci_info(tx: &Transaction<'_>, info: &AciInfo) -> Result<()> {
    tx.execute(
        "INSERT INTO aciinfo (blobkey, appname, importtime, latest) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(blobkey) DO UPDATE SET \
            appname = excluded.appname, \
            importtime = excluded.importtime, \
            latest = excluded.latest",
        params![
            info.blob_key,
            info.app_name,
            info.import_time,
            info.latest as i64
        ],
    )
    .context("failed to write ACI info")?;
    Ok(())
}

pub(crate) fn aci_info_by_blob_key(tx: &Transaction<'_>, key: &str) -> Result<Option<AciInfo>> {
    tx.query_row(
        &format!("SELECT {INFO_COLUMNS} FROM aciinfo WHERE blobkey = ?1"),
        params![key],
        row_to_info,
    )
    .optional()
    .context("failed to query ACI info by blob key")
}

/// All rows for an app name, oldest import first.
pub(crate) fn aci_infos_by_app_name(tx: &Transaction<'_>, name: &str) -> Result<Vec<AciInfo>> {
    let mut stmt = tx.prepare(&format!(
        "SELECT {INFO_COLUMNS} FROM aciinfo WHERE appname = ?1 ORDER BY importtime ASC"
    ))?;
    let rows = stmt
        .query_map(params![name], row_to_info)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to query ACI infos by app name")?;
    Ok(rows)
}

pub(crate) fn aci_infos_by_key_prefix(tx: &Transaction<'_>, prefix: &str) -> Result<Vec<AciInfo>> {
    // Keys are prefix + hex, so the LIKE pattern cannot contain wildcards.
    let mut stmt = tx.prepare(&format!(
        "SELECT {INFO_COLUMNS} FROM aciinfo WHERE blobkey LIKE ?1 ORDER BY blobkey ASC"
    ))?;
    let rows = stmt
        .query_map(params![format!("{prefix}%")], row_to_info)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to query ACI infos by key prefix")?;
    Ok(rows)
}

pub(crate) fn remove_aci_info(tx: &Transaction<'_>, key: &str) -> Result<()> {
    tx.execute("DELETE FROM aciinfo WHERE blobkey = ?1", params![key])
        .context("failed to remove ACI info")?;
    Ok(())
}

pub(crate) fn all_aci_infos(
    tx: &Transaction<'_>,
    sort: &[AciInfoSort],
    ascending: bool,
) -> Result<Vec<AciInfo>> {
    let mut query = format!("SELECT {INFO_COLUMNS} FROM aciinfo");
    if !sort.is_empty() {
        let direction = if ascending { "ASC" } else { "DESC" };
        let order = sort
            .iter()
            .map(|field| format!("{} {direction}", field.column()))
            .collect::<Vec<_>>()
            .join(", ");
        query.push_str(&format!(" ORDER BY {order}"));
    }
    let mut stmt = tx.prepare(&query)?;
    let rows = stmt
        .query_map([], row_to_info)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to query all ACI infos")?;
    Ok(rows)
}
