//! End-to-end tests for the B-tree directory: geometry, draining, free-list
//! accounting, corruption detection, and operation over an encrypted stream.

use sealfs_core::crypto::MasterKeys;
use sealfs_core::dir::{BtreeDirectory, DirectoryError, FileId, BLOCK_SIZE};
use sealfs_core::fs::{StreamOpener, StreamParams};
use sealfs_core::stream::{MemoryStream, StreamError};

fn entry_id(tag: u8) -> FileId {
    [tag; 32]
}

fn small_dir(backing: MemoryStream) -> BtreeDirectory<MemoryStream> {
    BtreeDirectory::open_with_max_entries(backing, 4).unwrap()
}

fn assert_valid(dir: &mut BtreeDirectory<MemoryStream>) {
    assert!(dir.validate_btree_structure().unwrap(), "tree invariants");
    assert!(dir.validate_free_list().unwrap(), "free-list invariants");
}

fn collect_names(dir: &mut BtreeDirectory<MemoryStream>) -> Vec<String> {
    let mut collected = Vec::new();
    dir.iterate(|e| collected.push(e.name.clone())).unwrap();
    collected
}

// =============================================================================
// Split geometry at max_entries = 4
// =============================================================================

#[test]
fn eight_inserts_split_into_expected_shape() {
    let backing = MemoryStream::new();
    let mut dir = small_dir(backing);

    for (i, name) in ["a", "b", "c", "d", "e"].iter().enumerate() {
        assert!(dir.add(name, entry_id(i as u8), 0).unwrap());
        assert_valid(&mut dir);
    }
    // The 5th insert split the root: header + 2 leaves + 1 root.
    let stats = dir.stats().unwrap();
    assert_eq!(stats.total_pages, 4);
    assert_eq!(stats.free_pages, 0);
    assert!(stats.root_present);

    for (i, name) in ["f", "g", "h"].iter().enumerate() {
        assert!(dir.add(name, entry_id(5 + i as u8), 0).unwrap());
        assert_valid(&mut dir);
    }
    assert_eq!(
        collect_names(&mut dir),
        vec!["a", "b", "c", "d", "e", "f", "g", "h"]
    );
}

// =============================================================================
// Draining the tree
// =============================================================================

#[test]
fn draining_leaves_root_absent_and_pages_accounted() {
    let backing = MemoryStream::new();
    let mut dir = small_dir(backing);
    let all = ["a", "b", "c", "d", "e", "f", "g", "h"];
    for name in all {
        dir.add(name, entry_id(name.as_bytes()[0]), 0).unwrap();
    }

    for name in all {
        assert!(dir.remove(name).unwrap().is_some());
        assert_valid(&mut dir);
    }

    let stats = dir.stats().unwrap();
    assert!(!stats.root_present);
    assert!(collect_names(&mut dir).is_empty());
    // Every page is the header or on the free list; tail pages were
    // reclaimed by shrinking.
    assert_eq!(stats.total_pages, 1 + stats.free_pages);
}

// =============================================================================
// Corruption detection
// =============================================================================

/// Find the page holding the leaf whose first entry is named `name`.
fn find_leaf_page(backing: &MemoryStream, name: u8) -> usize {
    backing.with_raw(|raw| {
        let pages = raw.len() / BLOCK_SIZE;
        for page in 1..pages {
            let at = page * BLOCK_SIZE;
            let flag = u32::from_le_bytes(raw[at..at + 4].try_into().unwrap());
            let children = u16::from_le_bytes(raw[at + 4..at + 6].try_into().unwrap());
            if flag == 1 && children == 0 && raw[at + 8] == name {
                return page;
            }
        }
        panic!("leaf not found");
    })
}

#[test]
fn corrupted_leaf_page_fails_lookup() {
    let backing = MemoryStream::new();
    {
        let mut dir = small_dir(backing.clone());
        for name in ["a", "b", "c", "d", "e", "f", "g", "h"] {
            dir.add(name, entry_id(1), 0).unwrap();
        }
        dir.flush().unwrap();
    }

    let leaf = find_leaf_page(&backing, b'a');
    backing.with_raw(|raw| raw[leaf * BLOCK_SIZE] ^= 0x06);

    let mut dir = small_dir(backing);
    let err = dir.get("a").unwrap_err();
    assert!(
        matches!(err, DirectoryError::Corrupted { .. }),
        "expected corruption error, got: {err:?}"
    );
}

#[test]
fn corrupted_free_list_fails_validation() {
    let backing = MemoryStream::new();
    {
        let mut dir = small_dir(backing.clone());
        for name in ["a", "b", "c", "d", "e", "f", "g", "h"] {
            dir.add(name, entry_id(1), 0).unwrap();
        }
        for name in ["a", "b", "c", "d", "e", "f"] {
            dir.remove(name).unwrap();
        }
        dir.flush().unwrap();
        let stats = dir.stats().unwrap();
        if stats.free_pages < 2 {
            // Geometry gave us too short a free list to damage; nothing to
            // assert against.
            return;
        }
    }
    // Break a back-link: the second cell's prev pointer.
    let mut dir = {
        // Locate the free-list head via the header page.
        let head = backing.with_raw(|raw| {
            u32::from_le_bytes(raw[4..8].try_into().unwrap())
        });
        let second = backing.with_raw(|raw| {
            let at = head as usize * BLOCK_SIZE;
            u32::from_le_bytes(raw[at + 4..at + 8].try_into().unwrap())
        });
        backing.with_raw(|raw| {
            let at = second as usize * BLOCK_SIZE;
            raw[at + 8] ^= 0xff;
        });
        small_dir(backing)
    };
    assert!(!dir.validate_free_list().unwrap());
}

// =============================================================================
// Insert/remove idempotence with per-step validation
// =============================================================================

#[test]
fn insert_then_remove_returns_to_empty() {
    let mut names: Vec<String> = (0..40u32).map(|i| format!("file-{:03}.dat", i * 7 % 40)).collect();
    let backing = MemoryStream::new();
    let mut dir = small_dir(backing);

    for (i, name) in names.iter().enumerate() {
        assert!(dir.add(name, entry_id(i as u8), i as u32).unwrap());
        assert_valid(&mut dir);
    }
    let listed = {
        let mut sorted = names.clone();
        sorted.sort();
        sorted
    };
    assert_eq!(collect_names(&mut dir), listed);

    // Remove in a different order than insertion.
    names.reverse();
    names.rotate_left(13);
    for name in &names {
        assert!(dir.remove(name).unwrap().is_some());
        assert_valid(&mut dir);
    }

    let stats = dir.stats().unwrap();
    assert!(!stats.root_present);
    assert_eq!(stats.total_pages, 1 + stats.free_pages);
    assert_valid(&mut dir);
}

#[test]
fn freed_pages_are_recycled() {
    let backing = MemoryStream::new();
    let mut dir = small_dir(backing);
    for round in 0..3 {
        for i in 0..25u8 {
            dir.add(&format!("n{round}-{i:02}"), entry_id(i), 0).unwrap();
        }
        for i in 0..25u8 {
            dir.remove(&format!("n{round}-{i:02}")).unwrap();
        }
        assert_valid(&mut dir);
    }
    // Page usage must not grow unboundedly across rounds: everything left
    // is the header plus free-listed pages.
    let stats = dir.stats().unwrap();
    assert_eq!(stats.total_pages, 1 + stats.free_pages);
}

// =============================================================================
// Iteration order and payload integrity
// =============================================================================

#[test]
fn iteration_is_sorted_and_complete() {
    let backing = MemoryStream::new();
    let mut dir = small_dir(backing);
    let input = [
        "zebra", "apple", "mango", "kiwi", "banana", "cherry", "fig", "date", "elder", "grape",
    ];
    for (i, name) in input.iter().enumerate() {
        dir.add(name, entry_id(i as u8), i as u32).unwrap();
    }

    let mut collected = Vec::new();
    dir.iterate(|e| collected.push((e.name.clone(), e.id, e.kind)))
        .unwrap();

    let mut expected: Vec<&str> = input.to_vec();
    expected.sort_unstable();
    assert_eq!(
        collected.iter().map(|(n, _, _)| n.as_str()).collect::<Vec<_>>(),
        expected
    );
    for (name, id, kind) in &collected {
        let position = input.iter().position(|n| n == name).unwrap();
        assert_eq!(id, &entry_id(position as u8));
        assert_eq!(*kind, position as u32);
    }
}

// =============================================================================
// Directory over an encrypted stream
// =============================================================================

#[test]
fn directory_over_encrypted_stream_round_trips() {
    let keys = MasterKeys::random();
    let opener = StreamOpener::new(&keys, StreamParams::default()).unwrap();
    let backing = MemoryStream::new();

    {
        let stream = opener.open(backing.clone()).unwrap();
        let mut dir = BtreeDirectory::open(stream).unwrap();
        for i in 0..30u8 {
            assert!(dir.add(&format!("doc-{i:02}"), entry_id(i), 1).unwrap());
        }
        dir.flush().unwrap();
    }

    let stream = opener.open(backing.clone()).unwrap();
    let mut dir = BtreeDirectory::open(stream).unwrap();
    for i in 0..30u8 {
        assert_eq!(dir.get(&format!("doc-{i:02}")).unwrap(), Some((entry_id(i), 1)));
    }
    assert!(dir.validate_btree_structure().unwrap());
}

#[test]
fn tampering_with_encrypted_directory_is_detected() {
    let keys = MasterKeys::random();
    let opener = StreamOpener::new(&keys, StreamParams::default()).unwrap();
    let backing = MemoryStream::new();

    {
        let stream = opener.open(backing.clone()).unwrap();
        let mut dir = BtreeDirectory::open(stream).unwrap();
        for i in 0..30u8 {
            dir.add(&format!("doc-{i:02}"), entry_id(i), 1).unwrap();
        }
        dir.flush().unwrap();
    }

    // Flip a byte inside the ciphertext of directory page 1.
    backing.with_raw(|raw| {
        let at = 44 + 12 + BLOCK_SIZE + 200;
        raw[at] ^= 0x80;
    });

    let stream = opener.open(backing).unwrap();
    let mut dir = BtreeDirectory::open(stream).unwrap();
    let err = dir.get("doc-00").unwrap_err();
    assert!(
        matches!(
            err,
            DirectoryError::Stream(StreamError::Integrity { .. })
        ),
        "expected integrity failure from the stream, got: {err:?}"
    );
}

// =============================================================================
// Name constraints
// =============================================================================

#[test]
fn over_long_names_are_rejected_everywhere() {
    let backing = MemoryStream::new();
    let mut dir = small_dir(backing);
    let long = "n".repeat(256);
    for result in [
        dir.add(&long, entry_id(0), 0).err(),
        dir.get(&long).err(),
        dir.remove(&long).err(),
    ] {
        match result {
            Some(DirectoryError::NameTooLong { length }) => assert_eq!(length, 256),
            other => panic!("expected NameTooLong, got: {other:?}"),
        }
    }
    // 255 bytes is exactly at the limit.
    let edge = "n".repeat(255);
    assert!(dir.add(&edge, entry_id(1), 0).unwrap());
    assert_eq!(dir.get(&edge).unwrap(), Some((entry_id(1), 0)));
}
