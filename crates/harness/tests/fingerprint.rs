use shelfmark_cache::CacheError;
use shelfmark_core::MainId;
use shelfmark_harness::TestLibrary;

#[test]
fn same_work_scores_higher_than_a_neighbour() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    let [original, reprint, sequel] =
        lib.titles(&["The Light Fantastic", "Light Fantastic!", "Equal Rites"])?[..]
    else {
        unreachable!()
    };
    for book in [original, reprint, sequel] {
        lib.link_typed("authors", book, "author", &["Terry Pratchett"])?;
        lib.link("series", book, &["Discworld"])?;
    }
    lib.link("tags", original, &["Rincewind"])?;
    lib.link("tags", reprint, &["Rincewind"])?;

    let print = lib.fingerprint(original)?;
    assert!(print.contains("title_light fantastic"));
    assert_eq!(print, lib.fingerprint(reprint)?);

    let matches = lib.probable_duplicates(original, 0.5)?;
    assert_eq!(matches.first().map(|(id, _)| *id), Some(reprint));
    assert_eq!(matches.first().map(|(_, score)| *score), Some(1.0));
    assert!(matches.iter().all(|(id, _)| *id != sequel));

    let loose = lib.probable_duplicates(original, 0.1)?;
    assert_eq!(loose.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![reprint, sequel]);
    Ok(())
}

#[test]
fn intralinked_titles_share_entries() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    let [omnibus, part_one, part_two] =
        lib.titles(&["The Witches Trilogy", "Wyrd Sisters", "Witches Abroad"])?[..]
    else {
        unreachable!()
    };
    let first = lib.link("tags", part_one, &["Shakespeare"])?[0];
    let second = lib.link("tags", part_two, &["Fairy tales"])?[0];
    lib.add_intralink(omnibus, part_one, "contains")?;
    lib.add_intralink(part_one, part_two, "sequel")?;

    // Reachable through two hops, in either direction.
    let print = lib.fingerprint(omnibus)?;
    assert!(print.contains(&format!("tags_{}", first.get())));
    assert!(print.contains(&format!("tags_{}", second.get())));
    assert!(print.contains("title_wyrd sisters"));
    assert_eq!(print, lib.fingerprint(part_two)?);
    Ok(())
}

#[test]
fn unknown_title_has_no_fingerprint() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    assert!(matches!(
        lib.fingerprint(MainId::new(1)),
        Err(CacheError::UnknownTitle(_))
    ));
    assert!(matches!(
        lib.probable_duplicates(MainId::new(1), 0.5),
        Err(CacheError::UnknownTitle(_))
    ));
    Ok(())
}
