//! End-to-end scenarios over a live filesystem: namespace shape, data
//! paths, permission gating, and defragmentation invariants.

use cfs_core::Filesystem;
use cfs_error::FsError;
use cfs_types::{Geometry, InodeId};

fn fs_with_blocks(blocks: u64) -> Filesystem {
    Filesystem::create(Geometry::metadata_bytes() + blocks * 1024, "").unwrap()
}

#[test]
fn docs_scenario_spans_three_blocks() {
    let mut fs = fs_with_blocks(64);
    let before = fs.stats().used_blocks;

    let docs = fs.create_entry(InodeId::ROOT, "docs", true).unwrap();
    let file = fs.create_entry(docs, "a.txt", false).unwrap();

    let payload: Vec<u8> = (0..2500u32).map(|i| (i % 199) as u8).collect();
    fs.write_range(file, 0, &payload).unwrap();

    assert_eq!(fs.inode(file).unwrap().size, 2500);
    assert_eq!(fs.inode(file).unwrap().block_count(1024), 3);
    assert_eq!(fs.stats().used_blocks, before + 3);
    assert_eq!(fs.read_range(file, 0, 2500).unwrap(), payload);
    fs.check_consistency().unwrap();
}

#[test]
fn read_only_file_rejects_writes_and_keeps_contents() {
    let mut fs = fs_with_blocks(16);
    let file = fs.create_entry(InodeId::ROOT, "a.txt", false).unwrap();
    fs.write_range(file, 0, b"original").unwrap();

    fs.set_permission(file, 4).unwrap();
    assert!(matches!(
        fs.write_range(file, 0, b"clobber!"),
        Err(FsError::PermissionDenied)
    ));
    assert!(matches!(fs.append(file, b"x"), Err(FsError::PermissionDenied)));
    assert!(matches!(fs.truncate(file), Err(FsError::PermissionDenied)));
    assert_eq!(fs.read_range(file, 0, 8).unwrap(), b"original");
}

#[test]
fn deep_tree_recursive_delete_leaves_no_orphans() {
    let mut fs = fs_with_blocks(64);
    let a = fs.create_entry(InodeId::ROOT, "a", true).unwrap();
    let b = fs.create_entry(a, "b", true).unwrap();
    let c = fs.create_entry(b, "c", true).unwrap();
    for (dir, name) in [(a, "f1"), (b, "f2"), (c, "f3")] {
        let f = fs.create_entry(dir, name, false).unwrap();
        fs.write_range(f, 0, &[0xAB; 1500]).unwrap();
    }
    assert_eq!(fs.stats().used_inodes, 7);
    assert_eq!(fs.stats().used_blocks, 6);

    fs.remove(a).unwrap();

    assert_eq!(fs.stats().used_inodes, 1);
    assert_eq!(fs.stats().used_blocks, 0);
    assert!(fs.children(InodeId::ROOT).unwrap().is_empty());
    fs.check_consistency().unwrap();
}

#[test]
fn resolve_navigates_like_a_shell() {
    let mut fs = fs_with_blocks(16);
    let docs = fs.create_entry(InodeId::ROOT, "docs", true).unwrap();
    let notes = fs.create_entry(docs, "notes", true).unwrap();

    assert_eq!(fs.resolve(InodeId::ROOT, "docs").unwrap(), docs);
    assert_eq!(fs.resolve(docs, "notes").unwrap(), notes);
    assert_eq!(fs.resolve(notes, "..").unwrap(), docs);
    assert_eq!(fs.resolve(docs, "..").unwrap(), InodeId::ROOT);
    // `..` above the root stays at the root.
    assert_eq!(fs.resolve(InodeId::ROOT, "..").unwrap(), InodeId::ROOT);
}

#[test]
fn children_lists_in_table_order() {
    let mut fs = fs_with_blocks(16);
    let d = fs.create_entry(InodeId::ROOT, "d", true).unwrap();
    let x = fs.create_entry(d, "x", false).unwrap();
    let y = fs.create_entry(d, "y", true).unwrap();

    assert_eq!(fs.children(d).unwrap(), vec![x, y]);
    assert!(matches!(fs.children(x), Err(FsError::NotDirectory)));
}

#[test]
fn exhausting_the_inode_table_reports_no_free_inodes() {
    let mut fs = fs_with_blocks(16);
    let capacity = fs.stats().total_inodes;
    for i in 1..capacity {
        fs.create_entry(InodeId::ROOT, &format!("f{i}"), false).unwrap();
    }
    assert!(matches!(
        fs.create_entry(InodeId::ROOT, "one-more", false),
        Err(FsError::NoFreeInodes)
    ));
}

// ── Defragmentation ─────────────────────────────────────────────────────────

#[test]
fn defragment_compacts_without_changing_contents() {
    let mut fs = fs_with_blocks(64);

    // Interleave three files so their blocks alternate, then punch a hole.
    let names = ["a", "b", "c"];
    let mut ids = Vec::new();
    for name in names {
        ids.push(fs.create_entry(InodeId::ROOT, name, false).unwrap());
    }
    for round in 0..3u8 {
        for (i, &id) in ids.iter().enumerate() {
            fs.append(id, &vec![round * 10 + i as u8; 1024]).unwrap();
        }
    }
    let middle = ids[1];
    let expected_a = fs.read_range(ids[0], 0, 4096).unwrap();
    let expected_c = fs.read_range(ids[2], 0, 4096).unwrap();
    fs.remove(middle).unwrap();
    assert_eq!(fs.stats().used_blocks, 6);

    fs.defragment();

    // Contents and sizes survive.
    assert_eq!(fs.read_range(ids[0], 0, 4096).unwrap(), expected_a);
    assert_eq!(fs.read_range(ids[2], 0, 4096).unwrap(), expected_c);
    assert_eq!(fs.stats().used_blocks, 6);

    // Every live file owns a contiguous ascending run, and the runs are
    // packed from block 0 in ascending inode-id order.
    let mut expected_next = 0u32;
    for &id in &[ids[0], ids[2]] {
        let ino = fs.inode(id).unwrap();
        let blocks: Vec<u32> = ino.referenced_blocks(1024).map(|b| b.0).collect();
        assert_eq!(blocks.len(), 3);
        for &b in &blocks {
            assert_eq!(b, expected_next);
            expected_next += 1;
        }
    }
    fs.check_consistency().unwrap();
}

#[test]
fn defragment_skips_directories_and_empty_files() {
    let mut fs = fs_with_blocks(32);
    fs.create_entry(InodeId::ROOT, "dir", true).unwrap();
    fs.create_entry(InodeId::ROOT, "empty", false).unwrap();
    let full = fs.create_entry(InodeId::ROOT, "full", false).unwrap();
    fs.write_range(full, 0, b"payload").unwrap();

    fs.defragment();

    assert_eq!(fs.stats().used_blocks, 1);
    assert_eq!(
        fs.inode(full).unwrap().referenced_blocks(1024).next().unwrap().0,
        0
    );
    assert_eq!(fs.read_range(full, 0, 7).unwrap(), b"payload");
    fs.check_consistency().unwrap();
}

#[test]
fn defragment_of_an_empty_filesystem_is_a_noop() {
    let mut fs = fs_with_blocks(8);
    fs.defragment();
    assert_eq!(fs.stats().used_blocks, 0);
    fs.check_consistency().unwrap();
}
