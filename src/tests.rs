//! End-to-end scenarios across the whole substrate: transactions, crash
//! simulations, reader isolation. Byte-level and structural unit tests live
//! next to their modules.

use std::path::PathBuf;

use crate::*;

fn test_key() -> EncryptionKey {
    let mut key = [0u8; ENCRYPTION_KEY_LEN];
    for (i, b) in key.iter_mut().enumerate() {
        *b = (i * 13 + 5) as u8;
    }
    EncryptionKey::new(key)
}

fn scratch(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(name);
    (dir, path)
}

#[test]
fn fresh_store_has_a_null_top_ref() {
    let (_dir, path) = scratch("fresh.coffer");
    let store = Store::open(&path, StoreOptions::new()).unwrap();
    let txn = store.begin_read().unwrap();
    assert_eq!(txn.top_ref(), NULL_REF);
    txn.verify().unwrap();
}

#[test]
fn commit_then_reopen_round_trips_a_blob() {
    let (_dir, path) = scratch("blob.coffer");
    {
        let store = Store::open(&path, StoreOptions::new()).unwrap();
        let mut txn = store.begin_write().unwrap();
        let blob = txn.create_blob(b"the quick brown fox").unwrap();
        txn.set_top_ref(blob);
        txn.commit().unwrap();
    }
    let store = Store::open(&path, StoreOptions::new()).unwrap();
    let txn = store.begin_read().unwrap();
    assert_eq!(txn.blob(txn.top_ref()).unwrap(), b"the quick brown fox");
}

#[test]
fn crash_before_selector_flip_preserves_the_previous_version() {
    // T1 commits 0xAA, T2 commits 0xBB but the "crash" (a byte poke putting
    // the selector back) lands between the alternate-slot write and the
    // selector flip. The next open must see T1's state.
    let (_dir, path) = scratch("crash.coffer");
    let t1_top;
    {
        let store = Store::open(&path, StoreOptions::new()).unwrap();
        let mut txn = store.begin_write().unwrap();
        let blob = txn.create_blob(&[0xAA; 32]).unwrap();
        txn.set_top_ref(blob);
        t1_top = blob;
        txn.commit().unwrap();

        let mut txn = store.begin_write().unwrap();
        let old = txn.top_ref();
        let new = txn.update_blob(old, &[0xBB; 32]).unwrap();
        assert_ne!(new, old, "copy-on-write must move the node");
        txn.set_top_ref(new);
        txn.commit().unwrap();
    }

    // undo the flip: T1 lives in slot 1 (first commit), T2 in slot 0
    let mut raw = std::fs::read(&path).unwrap();
    assert_eq!(raw[16], 0);
    raw[16] = 1;
    std::fs::write(&path, &raw).unwrap();

    let store = Store::open(&path, StoreOptions::new()).unwrap();
    let txn = store.begin_read().unwrap();
    assert_eq!(txn.top_ref(), t1_top);
    assert_eq!(txn.blob(txn.top_ref()).unwrap(), &[0xAA; 32]);
    txn.verify().unwrap();
}

#[test]
fn pinned_reader_is_isolated_from_later_commits() {
    let (_dir, path) = scratch("mvcc.coffer");
    let store = Store::open(&path, StoreOptions::new()).unwrap();

    let mut txn = store.begin_write().unwrap();
    let blob = txn.create_blob(&[0xAA; 32]).unwrap();
    txn.set_top_ref(blob);
    txn.commit().unwrap();

    let pinned = store.begin_read().unwrap();

    let mut txn = store.begin_write().unwrap();
    let new = txn.update_blob(txn.top_ref(), &[0xBB; 32]).unwrap();
    txn.set_top_ref(new);
    txn.commit().unwrap();

    // the old reader still sees its version, a new one sees the commit
    assert_eq!(pinned.blob(pinned.top_ref()).unwrap(), &[0xAA; 32]);
    let fresh = store.begin_read().unwrap();
    assert_eq!(fresh.blob(fresh.top_ref()).unwrap(), &[0xBB; 32]);
    assert!(fresh.version() > pinned.version());
}

#[test]
fn freed_space_is_not_reused_while_a_reader_pins_it() {
    let (_dir, path) = scratch("pin.coffer");
    let store = Store::open(&path, StoreOptions::new()).unwrap();

    let mut txn = store.begin_write().unwrap();
    let blob = txn.create_blob(&[0x11; 64]).unwrap();
    txn.set_top_ref(blob);
    txn.commit().unwrap();

    let pinned = store.begin_read().unwrap();
    let old_top = pinned.top_ref();

    let mut txn = store.begin_write().unwrap();
    let new = txn.update_blob(txn.top_ref(), &[0x22; 64]).unwrap();
    txn.set_top_ref(new);
    txn.commit().unwrap();

    // while pinned, new transactions must not overwrite the old blob
    let mut txn = store.begin_write().unwrap();
    let unrelated = txn.create_blob(&[0x33; 64]).unwrap();
    assert_ne!(unrelated, old_top);
    txn.free_node(unrelated).unwrap();
    txn.abort();
    assert_eq!(pinned.blob(old_top).unwrap(), &[0x11; 64]);

    // once the pin is gone, the quarantined space comes back
    drop(pinned);
    let mut txn = store.begin_write().unwrap();
    let reused = txn.create_blob(&[0x44; 64]).unwrap();
    assert_eq!(reused, old_top);
    txn.abort();
}

#[test]
fn abort_unwinds_every_allocation() {
    let (_dir, path) = scratch("abort.coffer");
    let store = Store::open(&path, StoreOptions::new()).unwrap();

    let mut txn = store.begin_write().unwrap();
    let blob = txn.create_blob(b"keep me").unwrap();
    txn.set_top_ref(blob);
    txn.commit().unwrap();
    let before = std::fs::read(&path).unwrap();

    let mut txn = store.begin_write().unwrap();
    let alloc = txn.allocator();
    let mut tree = BpTree::<4>::create(alloc).unwrap();
    for i in 0..100i64 {
        tree.add(alloc, i).unwrap();
    }
    let doomed = txn.create_blob(&[0xEE; 1000]).unwrap();
    txn.set_top_ref(doomed);
    txn.abort();

    let txn = store.begin_read().unwrap();
    assert_eq!(txn.blob(txn.top_ref()).unwrap(), b"keep me");
    txn.verify().unwrap();
    drop(txn);
    drop(store);

    // an aborted transaction must not have advanced the durable state
    let after = std::fs::read(&path).unwrap();
    assert_eq!(before[..FILE_HEADER_SIZE], after[..FILE_HEADER_SIZE]);
}

#[test]
fn open_commit_close_open_is_bit_identical() {
    let (_dir, path) = scratch("idempotent.coffer");
    {
        let store = Store::open(&path, StoreOptions::new()).unwrap();
        let mut txn = store.begin_write().unwrap();
        let blob = txn.create_blob(b"stable").unwrap();
        txn.set_top_ref(blob);
        txn.commit().unwrap();
    }
    let image1 = std::fs::read(&path).unwrap();
    {
        let store = Store::open(&path, StoreOptions::new()).unwrap();
        let txn = store.begin_write().unwrap();
        txn.commit().unwrap(); // no mutations
    }
    let image2 = std::fs::read(&path).unwrap();
    assert_eq!(image1, image2);
}

#[test]
fn trees_survive_commit_and_reopen() {
    let (_dir, path) = scratch("tree.coffer");
    {
        let store = Store::open(&path, StoreOptions::new()).unwrap();
        let mut txn = store.begin_write().unwrap();
        let alloc = txn.allocator();
        let mut tree = BpTree::<BP_ORDER>::create(alloc).unwrap();
        for i in 0..10_000i64 {
            tree.add(alloc, i * 7).unwrap();
        }
        let root = tree.root_ref();
        txn.set_top_ref(root);
        txn.commit().unwrap();
    }
    let store = Store::open(&path, StoreOptions::new()).unwrap();
    let txn = store.begin_read().unwrap();
    txn.verify().unwrap();
    let tree = txn.tree(txn.top_ref());
    assert_eq!(tree.len().unwrap(), 10_000);
    for i in (0..10_000usize).step_by(613) {
        assert_eq!(tree.get(i).unwrap(), (i as i64) * 7);
    }
}

#[test]
fn arrays_compose_with_trees_under_one_top_ref() {
    // a has_refs array as a tiny "table of contents": one tree, one blob
    let (_dir, path) = scratch("toc.coffer");
    {
        let store = Store::open(&path, StoreOptions::new()).unwrap();
        let mut txn = store.begin_write().unwrap();
        let blob = txn.create_blob(b"metadata").unwrap();
        let alloc = txn.allocator();
        let mut tree = BpTree::<BP_ORDER>::create(alloc).unwrap();
        for i in 0..500i64 {
            tree.add(alloc, i).unwrap();
        }
        let mut toc = Array::create(alloc, NodeFlags::HAS_REFS).unwrap();
        toc.add(alloc, tree.root_ref() as i64).unwrap();
        toc.add(alloc, blob as i64).unwrap();
        let top = toc.node_ref();
        txn.set_top_ref(top);
        txn.commit().unwrap();
    }
    let store = Store::open(&path, StoreOptions::new()).unwrap();
    let txn = store.begin_read().unwrap();
    txn.verify().unwrap();
    let toc = txn.array(txn.top_ref()).unwrap();
    let tree_root = toc.get_slot(0).unwrap().as_ref().unwrap();
    let blob_ref = toc.get_slot(1).unwrap().as_ref().unwrap();
    assert_eq!(txn.tree(tree_root).get(123).unwrap(), 123);
    assert_eq!(txn.blob(blob_ref).unwrap(), b"metadata");
}

#[test]
fn try_begin_write_reports_a_busy_writer() {
    let (_dir, path) = scratch("busy.coffer");
    let store = Store::open(&path, StoreOptions::new()).unwrap();
    let txn = store.begin_write().unwrap();
    assert!(matches!(store.try_begin_write(), Err(Error::WriterLockUnavailable)));
    txn.abort();
    let txn = store.try_begin_write().unwrap();
    txn.abort();
}

#[test]
fn wait_for_commit_wakes_a_blocked_reader() {
    let (_dir, path) = scratch("notify.coffer");
    let store = std::sync::Arc::new(Store::open(&path, StoreOptions::new()).unwrap());
    let seen = store.current_version();

    let writer = {
        let store = store.clone();
        std::thread::spawn(move || {
            let mut txn = store.begin_write().unwrap();
            let blob = txn.create_blob(b"ping").unwrap();
            txn.set_top_ref(blob);
            txn.commit().unwrap()
        })
    };
    let new_version = store.wait_for_commit(seen);
    let committed = writer.join().unwrap();
    assert!(new_version >= committed);
    let txn = store.begin_read().unwrap();
    assert_eq!(txn.blob(txn.top_ref()).unwrap(), b"ping");
}

#[test]
fn concurrent_readers_see_consistent_snapshots() {
    let (_dir, path) = scratch("readers.coffer");
    let store = std::sync::Arc::new(Store::open(&path, StoreOptions::new()).unwrap());
    {
        let mut txn = store.begin_write().unwrap();
        let alloc = txn.allocator();
        let mut tree = BpTree::<BP_ORDER>::create(alloc).unwrap();
        for i in 0..1000i64 {
            tree.add(alloc, i).unwrap();
        }
        let root = tree.root_ref();
        txn.set_top_ref(root);
        txn.commit().unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..50 {
                let txn = store.begin_read().unwrap();
                let tree = txn.tree(txn.top_ref());
                let len = tree.len().unwrap();
                // within one snapshot the sequence is fully consistent
                assert!(len >= 1000);
                for i in (0..1000usize).step_by(111) {
                    assert_eq!(tree.get(i).unwrap(), i as i64);
                }
            }
        }));
    }
    // a writer appends concurrently; readers must never observe a torn tree
    for round in 0..20i64 {
        let mut txn = store.begin_write().unwrap();
        let root = txn.top_ref();
        let alloc = txn.allocator();
        let mut tree = BpTree::<BP_ORDER>::from_ref(root);
        tree.add(alloc, 1000 + round).unwrap();
        let root = tree.root_ref();
        txn.set_top_ref(root);
        txn.commit().unwrap();
    }
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn encrypted_store_round_trips_and_hides_plaintext() {
    let (_dir, path) = scratch("enc.coffer");
    {
        let store =
            Store::open(&path, StoreOptions::new().encryption_key(test_key())).unwrap();
        let mut txn = store.begin_write().unwrap();
        let blob = txn.create_blob(b"very secret payload").unwrap();
        txn.set_top_ref(blob);
        txn.commit().unwrap();
    }
    let raw = std::fs::read(&path).unwrap();
    assert!(!raw.windows(11).any(|w| w == b"very secret"));

    let store =
        Store::open(&path, StoreOptions::new().encryption_key(test_key())).unwrap();
    let txn = store.begin_read().unwrap();
    assert_eq!(txn.blob(txn.top_ref()).unwrap(), b"very secret payload");
    txn.verify().unwrap();
}

#[test]
fn wrong_key_fails_to_decrypt() {
    let (_dir, path) = scratch("enc-wrong.coffer");
    {
        let store =
            Store::open(&path, StoreOptions::new().encryption_key(test_key())).unwrap();
        let mut txn = store.begin_write().unwrap();
        let blob = txn.create_blob(b"sealed").unwrap();
        txn.set_top_ref(blob);
        txn.commit().unwrap();
    }
    let wrong = EncryptionKey::new([0x55; ENCRYPTION_KEY_LEN]);
    assert!(matches!(
        Store::open(&path, StoreOptions::new().encryption_key(wrong)),
        Err(Error::DecryptionFailed)
    ));
}

#[test]
fn encrypted_commit_survives_reopen_after_many_pages() {
    let (_dir, path) = scratch("enc-big.coffer");
    {
        let store =
            Store::open(&path, StoreOptions::new().encryption_key(test_key())).unwrap();
        let mut txn = store.begin_write().unwrap();
        let alloc = txn.allocator();
        let mut tree = BpTree::<BP_ORDER>::create(alloc).unwrap();
        for i in 0..20_000i64 {
            tree.add(alloc, i ^ 0x5A5A).unwrap();
        }
        let root = tree.root_ref();
        txn.set_top_ref(root);
        txn.commit().unwrap();
    }
    let store =
        Store::open(&path, StoreOptions::new().encryption_key(test_key())).unwrap();
    let txn = store.begin_read().unwrap();
    let tree = txn.tree(txn.top_ref());
    assert_eq!(tree.len().unwrap(), 20_000);
    for i in (0..20_000usize).step_by(1999) {
        assert_eq!(tree.get(i).unwrap(), (i as i64) ^ 0x5A5A);
    }
}

#[test]
fn corrupted_top_ref_is_rejected_at_open() {
    let (_dir, path) = scratch("corrupt.coffer");
    {
        let store = Store::open(&path, StoreOptions::new()).unwrap();
        let mut txn = store.begin_write().unwrap();
        let blob = txn.create_blob(b"x").unwrap();
        txn.set_top_ref(blob);
        txn.commit().unwrap();
    }
    let mut raw = std::fs::read(&path).unwrap();
    // point the live slot at an unaligned offset
    let live = raw[16] as usize;
    raw[live * 8..live * 8 + 8].copy_from_slice(&37u64.to_le_bytes());
    std::fs::write(&path, &raw).unwrap();
    assert!(matches!(
        Store::open(&path, StoreOptions::new()),
        Err(Error::CorruptedFile(_))
    ));
}
