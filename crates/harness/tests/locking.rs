use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use shelfmark_cache::{CacheError, DowngradeLockError};
use shelfmark_harness::TestLibrary;

#[test]
fn downgraded_lock_admits_readers_not_writers() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    let guard = lib.write_and_downgrade(|cache, store| {
        cache.create_title("Interesting Times", store).map(|_| ())
    })?;
    assert_eq!(guard.all_title_ids().len(), 1);

    let reader = lib.library.clone();
    let (tx, rx) = mpsc::channel();
    let read_thread = thread::spawn(move || {
        let count = reader.read().map(|cache| cache.all_title_ids().len());
        let _ = tx.send(count);
    });
    let seen = rx.recv_timeout(Duration::from_secs(5))??;
    assert_eq!(seen, 1);
    read_thread.join().map_err(|_| "reader panicked")?;

    let writer = lib.library.clone();
    let written = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&written);
    let write_thread = thread::spawn(move || {
        let result = writer.create_title("The Last Continent");
        flag.store(true, Ordering::SeqCst);
        result
    });
    thread::sleep(Duration::from_millis(100));
    assert!(!written.load(Ordering::SeqCst));

    drop(guard);
    write_thread.join().map_err(|_| "writer panicked")??;
    assert!(written.load(Ordering::SeqCst));
    assert_eq!(lib.all_title_ids()?.len(), 2);
    Ok(())
}

#[test]
fn writing_while_reading_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    let guard = lib.read()?;
    let err = lib.create_title("Carpe Jugulum").unwrap_err();
    assert!(matches!(
        err,
        CacheError::DowngradeLock(DowngradeLockError::HoldingRead)
    ));
    drop(guard);
    lib.create_title("Carpe Jugulum")?;
    Ok(())
}

#[test]
fn reading_inside_a_write_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    let result = lib.write_and_downgrade(|_, _| {
        assert!(matches!(
            lib.read(),
            Err(CacheError::DowngradeLock(DowngradeLockError::HoldingWrite))
        ));
        Ok(())
    });
    assert!(result.is_ok());
    Ok(())
}

#[test]
fn failed_closure_releases_the_write_lock() -> Result<(), Box<dyn std::error::Error>> {
    let lib = TestLibrary::new()?;
    let result = lib.write_and_downgrade(|_, _| Err(CacheError::NotImplemented("nothing".into())));
    assert!(matches!(result, Err(CacheError::NotImplemented(_))));
    lib.create_title("The Fifth Elephant")?;
    Ok(())
}
