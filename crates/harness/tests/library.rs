use std::thread;
use std::time::{Duration, Instant};

use shelfmark_cache::backup::{backup_all, backup_one};
use shelfmark_cache::{
    BackupStep, BookMetadata, CacheError, Library, LibraryConfig, MaintenanceBot, MetadataBackup,
};
use shelfmark_core::{
    FieldValue, MainId,
    naming::{self, MAIN_TABLE},
    shape::{Cardinality, TableShape, ValueKind},
};
use shelfmark_storage::{DriverWrapper, LinkChange, Statement, StorageError};
use shelfmark_harness::TestLibrary;

fn stored_payload(lib: &Library, id: MainId) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let rows = lib.with_raw_store(|store| {
        store.execute(
            &Statement::new("SELECT payload FROM title_backups WHERE title_id = ?1").bind(id.get()),
        )
    })?;
    match rows.first().and_then(|row| row.first()) {
        Some(FieldValue::Bytes(payload)) => Ok(payload.clone()),
        other => Err(format!("no backup payload for {id}: {other:?}").into()),
    }
}

#[test]
fn custom_column_is_usable_and_persists() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::on_disk()?;
    let book = lib.create_title("Making Money")?;
    let link_table = lib.create_custom_column(
        "shelf",
        TableShape::new(Cardinality::ManyToMany).prioritized(),
        ValueKind::Text,
    )?;
    assert_eq!(link_table, naming::link_table_name(MAIN_TABLE, "custom_column_1"));

    lib.link("#shelf", book, &["to-read", "favourites"])?;
    lib.link("#shelf", book, &["favourites", "to-read"])?;
    assert_eq!(lib.names("#shelf", book)?, vec!["favourites", "to-read"]);

    let err = lib
        .create_custom_column("shelf", TableShape::new(Cardinality::ManyToOne), ValueKind::Text)
        .unwrap_err();
    assert!(matches!(err, CacheError::Storage(StorageError::ConstraintViolation(_))));

    let reopened = lib.reopen()?;
    let cache = reopened.read()?;
    let shelf = cache.table("#shelf")?;
    let names: Vec<String> = shelf
        .main_links(book)
        .into_iter()
        .filter_map(|item| shelf.item_value(item).map(FieldValue::display))
        .collect();
    assert_eq!(names, vec!["favourites", "to-read"]);
    Ok(())
}

#[test]
fn stale_sequence_does_not_clear_mark() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    let book = lib.create_title("Unseen Academicals")?;
    assert_eq!(lib.get_a_dirtied_book()?, Some(book));

    let (metadata, first_sequence) = lib
        .get_metadata_for_dump(book)?
        .ok_or("freshly created title should be dirtied")?;
    assert_eq!(metadata.title, "Unseen Academicals");

    lib.link("tags", book, &["Football"])?;
    assert!(!lib.clear_dirtied(book, first_sequence)?);
    assert!(lib.read()?.dirtied().is_dirty(book));

    let (_, latest) = lib.get_metadata_for_dump(book)?.ok_or("still dirtied")?;
    assert!(latest > first_sequence);
    assert!(lib.clear_dirtied(book, latest)?);
    assert_eq!(lib.get_a_dirtied_book()?, None);
    assert!(lib.get_metadata_for_dump(book)?.is_none());
    Ok(())
}

#[test]
fn dirtied_marks_survive_reopen() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::on_disk()?;
    let [kept, cleared] = lib.titles(&["Snuff", "Raising Steam"])?[..] else {
        unreachable!()
    };
    let sequence = lib.read()?.dirtied().sequence(cleared).ok_or("not dirtied")?;
    lib.clear_dirtied(cleared, sequence)?;

    let reopened = lib.reopen()?;
    let cache = reopened.read()?;
    assert!(cache.dirtied().is_dirty(kept));
    assert!(!cache.dirtied().is_dirty(cleared));
    Ok(())
}

#[test]
fn backups_round_trip_and_clear_marks() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    let [first, second] = lib.titles(&["The Truth", "Thief of Time"])?[..] else {
        unreachable!()
    };
    lib.link_typed("authors", first, "author", &["Terry Pratchett"])?;
    let series = lib.link("series", second, &["Death"])?[0];
    lib.set_link_attribute("series", "index", second, series, FieldValue::Float(5.0))?;

    assert_eq!(backup_all(&lib, 10)?, 2);
    assert_eq!(backup_one(&lib)?, BackupStep::Idle);
    assert!(lib.read()?.dirtied().is_empty());

    for id in [first, second] {
        assert_eq!(lib.read_backup(id)?, lib.book_metadata(id)?);
    }
    let raw: BookMetadata = rmp_serde::from_slice(&stored_payload(&lib, second)?)?;
    assert_eq!(
        raw.link_attributes.get("series.index").and_then(|v| v.get("Death")),
        Some(&FieldValue::Float(5.0))
    );
    Ok(())
}

#[test]
fn identical_backup_is_skipped() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    let book = lib.create_title("Monstrous Regiment")?;
    let payload = lib
        .book_metadata(book)?
        .ok_or("title has metadata")?
        .to_msgpack()?;

    assert!(lib.write_backup(book, &payload)?);
    assert!(!lib.write_backup(book, &payload)?);

    lib.link("tags", book, &["War"])?;
    let changed = lib.book_metadata(book)?.ok_or("title has metadata")?.to_msgpack()?;
    assert!(lib.write_backup(book, &changed)?);
    assert_eq!(stored_payload(&lib, book)?, changed);

    assert!(matches!(
        lib.write_backup(MainId::new(404), &payload),
        Err(CacheError::UnknownTitle(_))
    ));
    Ok(())
}

#[test]
fn backup_worker_exits_when_library_is_dropped() -> Result<(), Box<dyn std::error::Error>> {
    let library = Library::open_in_memory(LibraryConfig::manual())?;
    let book = library.create_title("Lords and Ladies")?;
    let worker = MetadataBackup::spawn(&library, Duration::from_millis(5))?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while library.read_backup(book)?.is_none() {
        assert!(Instant::now() < deadline, "backup never written");
        thread::sleep(Duration::from_millis(5));
    }

    drop(library);
    while !worker.is_finished() {
        assert!(Instant::now() < deadline, "backup worker outlived its library");
        thread::sleep(Duration::from_millis(5));
    }
    worker.join();
    Ok(())
}

#[test]
fn intralinks_connect_titles() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    let [original, translation, other] =
        lib.titles(&["Equal Rites", "Gleiche Rechte", "Moving Pictures"])?[..]
    else {
        unreachable!()
    };
    lib.add_intralink(original, translation, "translation")?;

    {
        let cache = lib.read()?;
        let links = cache.intralinks();
        assert!(links.linked(original).contains(&translation));
        assert!(links.linked(translation).contains(&original));
        assert_eq!(links.link_type(original, translation), Some("translation"));
    }
    assert_eq!(
        lib.book_metadata(translation)?.map(|m| m.intralinks),
        Some(vec![original])
    );

    assert!(matches!(
        lib.add_intralink(other, other, "self"),
        Err(CacheError::InvalidCacheUpdate(_))
    ));
    assert!(matches!(
        lib.add_intralink(translation, original, "translation"),
        Err(CacheError::InvalidCacheUpdate(_))
    ));
    assert!(matches!(
        lib.add_intralink(original, MainId::new(404), "sequel"),
        Err(CacheError::UnknownTitle(_))
    ));

    lib.remove_titles(&[translation])?;
    assert!(lib.read()?.intralinks().linked(original).is_empty());
    Ok(())
}

#[test]
fn raw_intralink_is_reconciled() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    let [first, second] = lib.titles(&["Pyramids", "Djelibeybi"])?[..] else {
        unreachable!()
    };
    lib.with_raw_store(|store| {
        store.execute_atomic(&[Statement::new(
            "INSERT INTO title_title_intralinks (title_title_intralink_primary_id, title_title_intralink_secondary_id, title_title_intralink_type) VALUES (?1, ?2, 'related')",
        )
        .bind(first.get())
        .bind(second.get())])
    })?;
    assert!(lib.read()?.intralinks().linked(first).is_empty());

    let bot = MaintenanceBot::attach(&lib);
    bot.dirty_interlink_record(
        LinkChange::Add,
        MAIN_TABLE,
        MAIN_TABLE,
        first.get(),
        second.get(),
    )?;
    bot.run_pending()?;
    assert_eq!(lib.read()?.intralinks().link_type(first, second), Some("related"));
    Ok(())
}

#[test]
fn book_metadata_collects_every_field() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    let book = lib.create_title("The Science of Discworld")?;
    lib.link_typed("authors", book, "author", &["Terry Pratchett", "Ian Stewart", "Jack Cohen"])?;
    lib.link("tags", book, &["Science", "Humour"])?;
    lib.link("genre", book, &["Popular science"])?;

    let metadata = lib.book_metadata(book)?.ok_or("title has metadata")?;
    assert_eq!(metadata.sort, "Science of Discworld, The");
    assert_eq!(
        metadata.typed_fields.get("authors").and_then(|g| g.get("author")),
        Some(&vec![
            "Terry Pratchett".to_string(),
            "Ian Stewart".to_string(),
            "Jack Cohen".to_string()
        ])
    );
    assert_eq!(
        metadata.fields.get("tags"),
        Some(&vec!["Science".to_string(), "Humour".to_string()])
    );
    assert_eq!(
        metadata.fields.get("genre"),
        Some(&vec!["Popular science".to_string()])
    );
    assert!(!metadata.fields.contains_key("publishers"));
    assert!(lib.book_metadata(MainId::new(404))?.is_none());
    Ok(())
}
