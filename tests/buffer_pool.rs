/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

use bitstore::buffer::replacement::ReplacerAlgorithm;
use bitstore::buffer::{BufferError, BufferPoolManager};
use bitstore::common::{BufferFrameIdT, PAGE_SIZE};
use bitstore::disk::{FileStore, FileType};

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

mod common;

fn setup(base: &Path, pool_size: BufferFrameIdT, wait_on_exhaustion: bool) -> BufferPoolManager {
    common::init_logging();
    let file_store = FileStore::open(base).unwrap();
    BufferPoolManager::new(
        pool_size,
        file_store,
        ReplacerAlgorithm::Lru,
        wait_on_exhaustion,
    )
}

#[test]
fn test_append_and_fetch_page() {
    let dir = tempdir().unwrap();
    let manager = setup(&dir.path().join("pool_db"), common::TEST_BUFFER_SIZE, false);

    let frame = manager.append_new_page(FileType::Table, 0).unwrap();
    assert_eq!(frame.pin_count(), 1);
    assert_eq!(frame.is_dirty(), false);
    assert!(frame.data().iter().all(|byte| *byte == 0));

    // A second fetch of a resident page pins the same frame again.
    let again = manager.fetch_page(FileType::Table, 0).unwrap();
    assert_eq!(again.id(), frame.id());
    assert_eq!(again.pin_count(), 2);

    assert!(manager.unpin_page(FileType::Table, 0, false));
    assert!(manager.unpin_page(FileType::Table, 0, false));
}

#[test]
fn test_fetching_missing_page_fails() {
    let dir = tempdir().unwrap();
    let manager = setup(&dir.path().join("pool_db"), common::TEST_BUFFER_SIZE, false);

    // Nothing has ever been appended, so page 3 does not exist on disk.
    assert!(manager.fetch_page(FileType::Table, 3).is_err());

    // The failed fetch leaks no frame.
    assert_eq!(manager.free_count(), common::TEST_BUFFER_SIZE as usize);
    assert_eq!(manager.resident_count(), 0);
}

#[test]
fn test_frame_accounting() {
    let dir = tempdir().unwrap();
    let manager = setup(&dir.path().join("pool_db"), common::TEST_BUFFER_SIZE, false);
    let pool_size = common::TEST_BUFFER_SIZE as usize;

    // Every frame starts in the free list.
    assert_eq!(manager.free_count(), pool_size);
    assert_eq!(manager.resident_count(), 0);
    assert_eq!(manager.evictable_count(), 0);

    for page_id in 0..3 {
        manager.append_new_page(FileType::Table, page_id).unwrap();
    }
    assert_eq!(manager.free_count(), pool_size - 3);
    assert_eq!(manager.resident_count(), 3);
    assert_eq!(manager.evictable_count(), 0);

    manager.unpin_page(FileType::Table, 1, false);
    assert_eq!(manager.evictable_count(), 1);

    // At any quiescent moment, residents and free frames cover the pool.
    assert_eq!(manager.free_count() + manager.resident_count(), pool_size);
}

#[test]
fn test_unpin_misuse_and_missing_page() {
    let dir = tempdir().unwrap();
    let manager = setup(&dir.path().join("pool_db"), common::TEST_BUFFER_SIZE, false);

    manager.append_new_page(FileType::Table, 0).unwrap();
    assert!(manager.unpin_page(FileType::Table, 0, false));

    // The pin count is already zero: misuse reports false.
    assert_eq!(manager.unpin_page(FileType::Table, 0, false), false);

    // Unpinning a page that is not resident is a documented no-op.
    assert_eq!(manager.unpin_page(FileType::Table, 99, true), true);
}

#[test]
fn test_pin_count_gates_eviction() {
    let dir = tempdir().unwrap();
    let manager = setup(&dir.path().join("pool_db"), common::TEST_BUFFER_SIZE, false);

    let frame = manager.append_new_page(FileType::Table, 0).unwrap();
    for _ in 0..2 {
        manager.fetch_page(FileType::Table, 0).unwrap();
    }
    assert_eq!(frame.pin_count(), 3);

    // A page fetched N times must be unpinned N times before it becomes
    // evictable.
    manager.unpin_page(FileType::Table, 0, false);
    manager.unpin_page(FileType::Table, 0, false);
    assert_eq!(manager.evictable_count(), 0);
    manager.unpin_page(FileType::Table, 0, false);
    assert_eq!(manager.evictable_count(), 1);
}

#[test]
fn test_eviction_writes_back_dirty_page() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("pool_db");
    let manager = setup(&base, 2, false);

    // Write recognizable bytes into page 0 and unpin it dirty.
    let frame = manager.append_new_page(FileType::Table, 0).unwrap();
    {
        let mut data = frame.data_mut();
        for (pos, byte) in data.iter_mut().enumerate() {
            *byte = pos as u8;
        }
    }
    drop(frame);
    manager.unpin_page(FileType::Table, 0, true);

    manager.append_new_page(FileType::Table, 1).unwrap();
    manager.unpin_page(FileType::Table, 1, false);

    // The pool holds two frames, so page 2 must evict page 0 (the least
    // recently unpinned), forcing its dirty bytes out to disk.
    manager.append_new_page(FileType::Table, 2).unwrap();
    manager.unpin_page(FileType::Table, 2, false);
    assert_eq!(manager.resident_count(), 2);

    // Fetching page 0 again reads the written bytes back from disk.
    let frame = manager.fetch_page(FileType::Table, 0).unwrap();
    {
        let data = frame.data();
        for (pos, byte) in data.iter().enumerate() {
            assert_eq!(*byte, pos as u8);
        }
    }
    drop(frame);
    manager.unpin_page(FileType::Table, 0, false);
}

#[test]
fn test_flush_page_reaches_disk() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("pool_db");
    let manager = setup(&base, common::TEST_BUFFER_SIZE, false);

    let frame = manager.append_new_page(FileType::Table, 0).unwrap();
    {
        let mut data = frame.data_mut();
        data[0] = 42;
        data[PAGE_SIZE as usize - 1] = 24;
    }
    drop(frame);
    manager.unpin_page(FileType::Table, 0, true);

    assert!(manager.flush_page(FileType::Table, 0).unwrap());
    assert_eq!(manager.flush_page(FileType::Table, 9).unwrap(), false);

    // Verify through an independent handle on the same heap file.
    let verifier = FileStore::open(&base).unwrap();
    let mut data = [0; PAGE_SIZE as usize];
    verifier.read_raw_page(FileType::Table, 0, &mut data).unwrap();
    assert_eq!(data[0], 42);
    assert_eq!(data[PAGE_SIZE as usize - 1], 24);
}

#[test]
fn test_pool_exhaustion_fails_without_wait() {
    let dir = tempdir().unwrap();
    let manager = setup(&dir.path().join("pool_db"), 2, false);

    manager.append_new_page(FileType::Table, 0).unwrap();
    manager.append_new_page(FileType::Table, 1).unwrap();

    // Every frame is pinned and the pool was not configured to wait.
    match manager.append_new_page(FileType::Table, 2) {
        Err(BufferError::PoolExhausted) => (),
        other => panic!("expected pool exhaustion, got {:?}", other.map(|_| ())),
    }

    // Unpinning a page makes a victim available again.
    manager.unpin_page(FileType::Table, 0, false);
    assert!(manager.append_new_page(FileType::Table, 2).is_ok());
}

#[test]
fn test_wait_on_exhaustion_blocks_until_unpin() {
    let dir = tempdir().unwrap();
    let manager = Arc::new(setup(&dir.path().join("pool_db"), 1, true));

    manager.append_new_page(FileType::Table, 0).unwrap();

    let unpinned = Arc::new(AtomicBool::new(false));
    let manager_c = Arc::clone(&manager);
    let unpinned_c = Arc::clone(&unpinned);

    let handle = thread::spawn(move || {
        // Blocks until the only frame is unpinned by the main thread.
        manager_c.append_new_page(FileType::Table, 1).unwrap();
        assert!(unpinned_c.load(Ordering::SeqCst));
        manager_c.unpin_page(FileType::Table, 1, false);
    });

    thread::sleep(Duration::from_millis(50));
    unpinned.store(true, Ordering::SeqCst);
    manager.unpin_page(FileType::Table, 0, false);

    handle.join().unwrap();
}
