use super::*;
use crate::db::schema;
use crate::db::Db;

fn v1_store_base() -> Result<TempDir> {
    let temp = tempdir()?;
    let db = Db::new(temp.path().join("cas").join("db"))?;
    db.write_tx(schema::init_v1)?;
    db.write_tx(|tx| {
        tx.execute(
            "INSERT INTO aciinfo (blobkey, appname, importtime) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                format!("{KEY_PREFIX}{}", "11".repeat(32)),
                "example.com/old",
                42i64
            ],
        )?;
        Ok(())
    })?;
    Ok(temp)
}

#[test]
fn opening_a_v1_store_migrates_and_backs_up() -> Result<()> {
    let temp = v1_store_base()?;
    let store = Store::new(Some(temp.path().to_path_buf()))?;

    let version = store.db.read_tx(|tx| schema::version(tx))?;
    assert_eq!(version, db::DB_VERSION);

    // Pre-migration rows gain the latest column at its default.
    let infos = store.get_all_aci_infos(&[], true)?;
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].app_name, "example.com/old");
    assert!(!infos[0].latest);

    let backup = temp.path().join("cas").join("db-backups").join("0");
    assert!(
        backup.join("store.sqlite").is_file(),
        "migration must back up the index first"
    );
    Ok(())
}

#[test]
fn migration_is_idempotent_per_stored_version() -> Result<()> {
    let temp = v1_store_base()?;
    let db = Db::new(temp.path().join("cas").join("db"))?;
    db.write_tx(|tx| schema::migrate(tx, db::DB_VERSION))?;
    // A second run re-reads the stored version and does nothing.
    db.write_tx(|tx| schema::migrate(tx, db::DB_VERSION))?;
    assert_eq!(db.read_tx(|tx| schema::version(tx))?, db::DB_VERSION);
    Ok(())
}

#[test]
fn concurrent_openers_of_an_old_store_both_succeed() -> Result<()> {
    let temp = v1_store_base()?;
    let base = temp.path().to_path_buf();

    thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let base = base.clone();
                scope.spawn(move || Store::new(Some(base)).map(|_| ()))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("opener thread panicked"))
            .collect::<Result<Vec<_>>>()
    })?;

    let store = Store::new(Some(base))?;
    assert_eq!(store.db.read_tx(|tx| schema::version(tx))?, db::DB_VERSION);
    Ok(())
}

#[test]
fn future_schemas_are_refused() -> Result<()> {
    let temp = tempdir()?;
    let db = Db::new(temp.path().join("cas").join("db"))?;
    db.write_tx(|tx| {
        schema::init(tx)?;
        schema::force_version(tx, db::DB_VERSION + 7)
    })?;

    let err = Store::new(Some(temp.path().to_path_buf())).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::FutureSchema { stored, .. }) if *stored == db::DB_VERSION + 7
    ));
    Ok(())
}

#[test]
fn backups_rotate_out_the_oldest() -> Result<()> {
    let temp = tempdir()?;
    let db = Db::new(temp.path().join("db"))?;
    db.write_tx(schema::init)?;

    let backups = temp.path().join("db-backups");
    for round in 0..7 {
        db.write_tx(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO remote (aciurl, sigurl, etag, blobkey) \
                 VALUES ('marker', '', ?1, 'sha512-00')",
                rusqlite::params![round.to_string()],
            )?;
            Ok(())
        })?;
        db.backup(&backups, 5)?;
    }

    let mut found: Vec<String> = std::fs::read_dir(&backups)?
        .map(|entry| Ok(entry?.file_name().to_string_lossy().into_owned()))
        .collect::<Result<Vec<_>>>()?;
    found.sort();
    assert_eq!(found, vec!["0", "1", "2", "3", "4"]);
    Ok(())
}
