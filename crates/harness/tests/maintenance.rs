use std::thread;
use std::time::{Duration, Instant};

use shelfmark_cache::{BotState, CacheError, Library, LibraryConfig, MaintenanceBot};
use shelfmark_core::{AuxId, FieldValue, MainId};
use shelfmark_storage::{DriverWrapper, Statement};
use shelfmark_harness::TestLibrary;

fn aggregate(lib: &Library, id: MainId, field: &str) -> Result<Option<String>, CacheError> {
    let rows = lib.with_raw_store(|store| {
        store.execute(
            &Statement::new("SELECT value FROM title_aggregates WHERE title_id = ?1 AND field = ?2")
                .bind(id.get())
                .bind(field),
        )
    })?;
    Ok(rows
        .first()
        .and_then(|row| row.first())
        .and_then(FieldValue::as_text)
        .map(str::to_string))
}

#[test]
fn bypassing_link_is_reconciled() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    let book = lib.create_title("Mort")?;
    let death = lib.raw_item("creators", "Terry Pratchett")?;
    lib.raw_link("creators", book, death, Some(1), Some("author"))?;

    // Nothing changes until the queue is drained.
    assert!(lib.names("authors", book)?.is_empty());
    assert_eq!(lib.maintenance_state(), BotState::Queued);

    assert_eq!(lib.run_maintenance()?, 2);
    assert_eq!(lib.names("authors", book)?, vec!["Terry Pratchett"]);
    assert_eq!(
        lib.read()?.table("authors")?.typed_main_links(book).get("author"),
        Some(&vec![death])
    );
    assert_eq!(aggregate(&lib, book, "authors")?.as_deref(), Some("Terry Pratchett"));
    assert!(lib.read()?.dirtied().is_dirty(book));
    assert_eq!(lib.maintenance_state(), BotState::Idle);
    assert!(lib.read()?.is_consistent());
    Ok(())
}

#[test]
fn raw_title_writes_are_picked_up() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    let id = MainId::new(lib.with_raw_store(|store| store.insert_title("Reaper Man"))?);
    lib.run_maintenance()?;
    assert_eq!(lib.read()?.title(id).map(|t| t.title.clone()).as_deref(), Some("Reaper Man"));
    assert!(lib.read()?.table("tags")?.has_main(id));

    lib.with_raw_store(|store| store.update_title(id.get(), "Soul Music"))?;
    lib.run_maintenance()?;
    assert_eq!(lib.read()?.title(id).map(|t| t.title.clone()).as_deref(), Some("Soul Music"));
    assert!(lib.read()?.dirtied().is_dirty(id));
    Ok(())
}

#[test]
fn repeated_notification_is_coalesced() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    let bot = MaintenanceBot::attach(&lib);
    assert!(bot.dirty_record("tags", 7)?);
    assert!(!bot.dirty_record("tags", 7)?);
    assert_eq!(bot.run_pending()?, 1);
    Ok(())
}

#[test]
fn item_rename_reaches_every_owner() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    let [first, second] = lib.titles(&["Hogfather", "Jingo"])?[..] else {
        unreachable!()
    };
    let tag = lib.link("tags", first, &["Holiday"])?[0];
    lib.link("tags", second, &["Holiday"])?;

    lib.with_raw_store(|store| store.update_item("tags", tag.get(), &FieldValue::from("Hogswatch")))?;
    lib.run_maintenance()?;

    assert_eq!(lib.names("tags", first)?, vec!["Hogswatch"]);
    assert_eq!(lib.names("tags", second)?, vec!["Hogswatch"]);
    assert_eq!(aggregate(&lib, second, "tags")?.as_deref(), Some("Hogswatch"));
    Ok(())
}

#[test]
fn case_duplicates_merge_into_lowest_id() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    let [first, second] = lib.titles(&["Thud!", "Snuff"])?[..] else {
        unreachable!()
    };
    let original = lib.link("tags", first, &["Fantasy"])?[0];
    let duplicate = lib.raw_item("tags", "fantasy")?;
    lib.raw_link("tags", second, duplicate, None, None)?;
    lib.run_maintenance()?;

    assert_eq!(lib.item_value("tags", duplicate)?, None);
    assert_eq!(lib.books_for_field("tags", original)?, vec![first, second]);
    assert_eq!(lib.names("tags", second)?, vec!["Fantasy"]);

    assert!(lib.read()?.is_consistent());
    Ok(())
}

#[test]
fn case_duplicates_kept_when_merging_disabled() -> Result<(), Box<dyn std::error::Error>> {
    let config = LibraryConfig {
        merge_case_duplicates: false,
        ..LibraryConfig::manual()
    };
    let lib = TestLibrary::with_config(config)?;
    let [first, second] = lib.titles(&["Thud!", "Snuff"])?[..] else {
        unreachable!()
    };
    let original = lib.link("tags", first, &["Fantasy"])?[0];
    let duplicate = lib.raw_item("tags", "fantasy")?;
    lib.raw_link("tags", second, duplicate, None, None)?;
    lib.run_maintenance()?;
    assert_eq!(lib.item_value("tags", duplicate)?, Some(FieldValue::from("fantasy")));

    // An explicit merge still folds them together.
    let bot = MaintenanceBot::attach(&lib);
    let touched = bot.merge("tags", original, duplicate)?;
    assert_eq!(touched.into_iter().collect::<Vec<_>>(), vec![second]);
    assert_eq!(lib.books_for_field("tags", original)?, vec![first, second]);
    assert_eq!(lib.item_value("tags", duplicate)?, None);
    Ok(())
}

#[test]
fn unlinked_items_cleaned_in_auto_clean_tables() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    let book = lib.create_title("Maskerade")?;
    let tag = lib.link("tags", book, &["Opera"])?[0];
    let genre = lib.link("genre", book, &["Comic fantasy"])?[0];

    lib.with_raw_store(|store| {
        store.delete_link("tags", book.get(), tag.get())?;
        store.delete_link("genres", book.get(), genre.get())
    })?;
    lib.run_maintenance()?;

    assert!(lib.names("tags", book)?.is_empty());
    assert!(lib.names("genre", book)?.is_empty());
    assert_eq!(lib.item_value("tags", tag)?, None);
    // Genres are not auto-cleaned; the unused item stays until cleaned.
    assert_eq!(lib.item_value("genre", genre)?, Some(FieldValue::from("Comic fantasy")));
    assert_eq!(lib.clean("genres", &[genre])?.into_iter().collect::<Vec<_>>(), vec![genre]);
    assert_eq!(lib.item_value("genre", genre)?, None);
    Ok(())
}

#[test]
fn clean_keeps_linked_items() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    let book = lib.create_title("Eric")?;
    let used = lib.link("publishers", book, &["Gollancz"])?[0];
    let unused = lib.raw_item("publishers", "Corgi")?;
    lib.run_maintenance()?;

    let deleted = lib.clean("publishers", &[used, unused, AuxId::new(999)])?;
    assert_eq!(deleted.into_iter().collect::<Vec<_>>(), vec![unused]);
    assert_eq!(lib.names("publishers", book)?, vec!["Gollancz"]);
    Ok(())
}

#[test]
fn stopped_bot_rejects_work() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    let book = lib.create_title("Feet of Clay")?;
    let ids = lib.link("tags", book, &["Golems", "Mystery"])?;
    let bot = MaintenanceBot::attach(&lib);
    bot.stop();

    assert_eq!(bot.state(), BotState::Stopped);
    assert!(matches!(bot.dirty_record("tags", 1), Err(CacheError::MaintenanceStopped)));
    assert!(matches!(bot.clean("tags", &ids), Err(CacheError::MaintenanceStopped)));
    assert!(matches!(
        bot.merge("tags", ids[0], ids[1]),
        Err(CacheError::MaintenanceStopped)
    ));

    // Raw writes still land; they are simply no longer reconciled.
    let extra = lib.raw_item("tags", "Dwarfs")?;
    assert_eq!(lib.run_maintenance()?, 0);
    assert_eq!(lib.item_value("tags", extra)?, None);
    Ok(())
}

#[test]
fn background_bot_reconciles_until_closed() -> Result<(), Box<dyn std::error::Error>> {
    let config = LibraryConfig {
        maintenance_poll_ms: 10,
        backup_interval_ms: 10,
        ..LibraryConfig::default()
    };
    let library = Library::open_in_memory(config)?;
    let id = MainId::new(library.with_raw_store(|store| store.insert_title("Going Postal"))?);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !library.read()?.contains_title(id) {
        assert!(Instant::now() < deadline, "bot never reconciled the title");
        thread::sleep(Duration::from_millis(5));
    }

    let weak = library.downgrade();
    library.close();
    assert!(!weak.is_alive());
    Ok(())
}
