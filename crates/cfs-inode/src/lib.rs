#![forbid(unsafe_code)]
//! Inode table operations.
//!
//! The namespace is a parent-pointer tree over a fixed-capacity array of
//! inode records: no child lists, every query is a linear scan. Scan order
//! is load-bearing — free-slot allocation is first-fit and name lookup is
//! first-match, which keeps behavior deterministic for tests.
//!
//! Name uniqueness within a directory is a caller obligation: the store
//! returns the first match and `cfs-core` checks for collisions before
//! creating entries.

use cfs_error::{FsError, Result};
use cfs_ondisk::{Inode, Superblock};
use cfs_types::{Access, BlockId, InodeId, NAME_MAX};

/// First not-in-use slot in the table.
pub fn find_free(table: &[Inode]) -> Result<InodeId> {
    table
        .iter()
        .position(|ino| !ino.used)
        .map(|idx| InodeId(idx as u32))
        .ok_or(FsError::NoFreeInodes)
}

/// First in-use inode under `parent` whose name is byte-equal to `name`.
#[must_use]
pub fn lookup(table: &[Inode], parent: InodeId, name: &str) -> Option<InodeId> {
    table
        .iter()
        .enumerate()
        .find(|(idx, ino)| {
            ino.used && ino.parent == parent && *idx as u32 != parent.0 && ino.name == name
        })
        .map(|(idx, _)| InodeId(idx as u32))
}

/// Resolve a single path component relative to `current`.
///
/// `".."` resolves to the parent; the root is its own parent, so moving
/// above it is a no-op. Anything else is a plain name lookup.
pub fn resolve(table: &[Inode], current: InodeId, name: &str) -> Result<InodeId> {
    let idx = current.0 as usize;
    if idx >= table.len() || !table[idx].used {
        return Err(FsError::NotFound(name.to_owned()));
    }
    if name == ".." {
        return Ok(table[idx].parent);
    }
    lookup(table, current, name).ok_or_else(|| FsError::NotFound(name.to_owned()))
}

/// Whether the inode's permission bits grant the given capability.
///
/// A denied check aborts the caller's whole operation; nothing is mutated
/// before this passes.
pub fn check_access(ino: &Inode, access: Access) -> Result<()> {
    if ino.perm.allows(access) {
        Ok(())
    } else {
        Err(FsError::PermissionDenied)
    }
}

/// Entry names must fit the fixed on-disk field and cannot collide with
/// the path syntax. NUL is rejected because the on-disk field is
/// NUL-padded — an interior NUL would silently rename the entry across a
/// save/load.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(FsError::Format(format!("invalid entry name: {name:?}")));
    }
    if name.len() > NAME_MAX {
        return Err(FsError::NameTooLong);
    }
    Ok(())
}

/// In-use children of `dir`, in table order.
///
/// The root is its own parent; the self-edge is skipped so the root never
/// lists itself.
#[must_use]
pub fn children(table: &[Inode], dir: InodeId) -> Vec<InodeId> {
    table
        .iter()
        .enumerate()
        .filter(|(idx, ino)| ino.used && ino.parent == dir && *idx as u32 != dir.0)
        .map(|(idx, _)| InodeId(idx as u32))
        .collect()
}

/// Post-order recursive delete.
///
/// Directories release every in-use child before themselves, so a
/// partially-deleted subtree is never observable. Files free every block
/// their size spans. The freed slot is reset to the zeroed record —
/// reusing it can never pick up a stale block list.
pub fn recursive_delete(table: &mut [Inode], bitmap: &mut [u8], sb: &mut Superblock, id: InodeId) {
    let idx = id.0 as usize;
    if idx >= table.len() || !table[idx].used {
        return;
    }

    if table[idx].dir {
        for child in 0..table.len() {
            if table[child].used && table[child].parent == id && child as u32 != id.0 {
                recursive_delete(table, bitmap, sb, InodeId(child as u32));
            }
        }
    } else {
        let blocks: Vec<BlockId> = table[idx].referenced_blocks(sb.block_size).collect();
        for block in blocks {
            cfs_alloc::free(bitmap, sb.block_capacity, &mut sb.used_blocks, block);
        }
    }

    table[idx] = Inode::default();
    sb.used_inodes -= 1;
}

// ── Tests ───────────────────────────────────────────────────────────────────
