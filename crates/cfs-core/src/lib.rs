#![forbid(unsafe_code)]
//! The CapsuleFS storage engine.
//!
//! [`Filesystem`] owns the four regions of an image — superblock, inode
//! table, block pool, bitmap — and exposes the whole operation surface
//! consumed by shells and editors: entry creation and lookup, byte-range
//! reads and writes over block-mapped files, recursive delete, permission
//! changes, defragmentation, and image load/save with the at-rest cipher.
//!
//! One instance per process; every operation runs to completion before
//! the next — there is no locking because there is no concurrency.
//! Operations never terminate the process: everything returns
//! [`cfs_error::Result`] and the caller decides what is fatal.

use cfs_error::{FsError, Result};
use cfs_ondisk::image::{decode_body, encode_image};
use cfs_ondisk::{Inode, Superblock, cipher::xor_cipher};
use cfs_types::{
    Access, BLOCK_SLOTS, BlockId, Geometry, InodeId, PASSPHRASE_MAX, ParseError,
};
use serde::Serialize;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Usage summary for status displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FsStats {
    pub total_bytes: u64,
    pub block_size: u32,
    pub total_inodes: u32,
    pub used_inodes: u32,
    pub total_blocks: u32,
    pub used_blocks: u32,
}

/// The filesystem context: exclusive owner of all shared state.
#[derive(Debug, Clone)]
pub struct Filesystem {
    sb: Superblock,
    table: Vec<Inode>,
    pool: Vec<u8>,
    bitmap: Vec<u8>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn parse_to_fs(err: ParseError) -> FsError {
    FsError::Format(err.to_string())
}

impl Filesystem {
    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Create a fresh filesystem for `total_bytes` of capacity.
    ///
    /// The root directory occupies inode slot 0 with full permissions and
    /// itself as parent. An empty passphrase disables the at-rest cipher.
    pub fn create(total_bytes: u64, passphrase: &str) -> Result<Self> {
        if passphrase.len() > PASSPHRASE_MAX {
            return Err(FsError::NameTooLong);
        }
        // The superblock field is NUL-padded; an interior NUL would be
        // silently truncated and the saved image could never be reopened
        // with the passphrase that created it.
        if passphrase.contains('\0') {
            return Err(FsError::Format(
                "passphrase must not contain NUL bytes".to_owned(),
            ));
        }
        let geo = Geometry::plan(total_bytes).ok_or(FsError::TooSmall {
            total_bytes,
            metadata_bytes: Geometry::metadata_bytes(),
        })?;

        let mut table = vec![Inode::default(); geo.inode_capacity as usize];
        table[0] = Inode::new("root".to_owned(), InodeId::ROOT, true, unix_now());

        let fs = Self {
            sb: Superblock::new(&geo, passphrase.to_owned()),
            table,
            pool: vec![0u8; geo.pool_bytes()],
            bitmap: vec![0u8; geo.bitmap_bytes()],
        };
        info!(
            total_bytes,
            blocks = geo.block_capacity,
            ciphered = fs.sb.cipher_enabled(),
            "filesystem created"
        );
        Ok(fs)
    }

    /// Reconstruct a filesystem from a serialized image.
    ///
    /// An image saved with a passphrase requires the exact same bytes to
    /// load; mismatch fails with [`FsError::BadPassword`] before any part
    /// of the body is decoded.
    pub fn from_bytes(bytes: &[u8], passphrase: &str) -> Result<Self> {
        let sb = Superblock::parse_from_bytes(bytes).map_err(parse_to_fs)?;
        if sb.cipher_enabled() && passphrase != sb.passphrase {
            return Err(FsError::BadPassword);
        }
        let (table, pool, bitmap) = decode_body(bytes, &sb).map_err(parse_to_fs)?;
        let fs = Self {
            sb,
            table,
            pool,
            bitmap,
        };
        // Mount-time validation: a structurally damaged (or wrongly
        // deciphered) body must not become a live filesystem.
        fs.check_consistency()?;
        Ok(fs)
    }

    /// Serialize the whole filesystem into one image buffer, applying the
    /// at-rest cipher to the copy when a passphrase is set.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode_image(&self.sb, &self.table, &self.pool, &self.bitmap).map_err(parse_to_fs)
    }

    /// Load an image from a host file.
    pub fn load(path: impl AsRef<Path>, passphrase: &str) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let fs = Self::from_bytes(&bytes, passphrase)?;
        info!(
            path = %path.as_ref().display(),
            used_inodes = fs.sb.used_inodes,
            used_blocks = fs.sb.used_blocks,
            "filesystem loaded"
        );
        Ok(fs)
    }

    /// Save the image to a host file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path.as_ref(), &bytes)?;
        info!(path = %path.as_ref().display(), bytes = bytes.len(), "filesystem saved");
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    #[must_use]
    pub fn stats(&self) -> FsStats {
        FsStats {
            total_bytes: self.sb.total_bytes,
            block_size: self.sb.block_size,
            total_inodes: self.sb.inode_capacity,
            used_inodes: self.sb.used_inodes,
            total_blocks: self.sb.block_capacity,
            used_blocks: self.sb.used_blocks,
        }
    }

    /// Metadata view of an in-use inode.
    pub fn inode(&self, id: InodeId) -> Result<&Inode> {
        self.table
            .get(id.0 as usize)
            .filter(|ino| ino.used)
            .ok_or_else(|| FsError::NotFound(format!("inode {id}")))
    }

    pub fn lookup(&self, parent: InodeId, name: &str) -> Result<InodeId> {
        cfs_inode::lookup(&self.table, parent, name)
            .ok_or_else(|| FsError::NotFound(name.to_owned()))
    }

    /// Resolve a single component (`".."` included) relative to a directory.
    pub fn resolve(&self, current: InodeId, name: &str) -> Result<InodeId> {
        cfs_inode::resolve(&self.table, current, name)
    }

    /// In-use children of a directory, in table order.
    pub fn children(&self, dir: InodeId) -> Result<Vec<InodeId>> {
        if !self.inode(dir)?.dir {
            return Err(FsError::NotDirectory);
        }
        Ok(cfs_inode::children(&self.table, dir))
    }

    // ── Namespace mutation ──────────────────────────────────────────────

    /// Create a file or directory under `parent`.
    ///
    /// Sibling names are kept unique here — the inode store itself does
    /// not enforce uniqueness.
    pub fn create_entry(&mut self, parent: InodeId, name: &str, is_dir: bool) -> Result<InodeId> {
        cfs_inode::validate_name(name)?;
        if !self.inode(parent)?.dir {
            return Err(FsError::NotDirectory);
        }
        if cfs_inode::lookup(&self.table, parent, name).is_some() {
            return Err(FsError::Exists(name.to_owned()));
        }

        let id = cfs_inode::find_free(&self.table)?;
        self.table[id.0 as usize] = Inode::new(name.to_owned(), parent, is_dir, unix_now());
        self.sb.used_inodes += 1;
        debug!(%id, %parent, name, is_dir, "entry created");
        Ok(id)
    }

    /// Recursively delete an entry and everything beneath it.
    ///
    /// Requires the write bit. The root directory is not removable.
    pub fn remove(&mut self, id: InodeId) -> Result<()> {
        if id == InodeId::ROOT {
            return Err(FsError::PermissionDenied);
        }
        let ino = self.inode(id)?;
        cfs_inode::check_access(ino, Access::Write)?;

        cfs_inode::recursive_delete(&mut self.table, &mut self.bitmap, &mut self.sb, id);
        debug!(%id, "entry removed");
        Ok(())
    }

    /// Remove an empty directory. Non-leaf directories need [`Self::remove`].
    pub fn remove_dir(&mut self, id: InodeId) -> Result<()> {
        if id == InodeId::ROOT {
            return Err(FsError::PermissionDenied);
        }
        let ino = self.inode(id)?;
        if !ino.dir {
            return Err(FsError::NotDirectory);
        }
        cfs_inode::check_access(ino, Access::Write)?;
        if !cfs_inode::children(&self.table, id).is_empty() {
            return Err(FsError::NotEmpty);
        }

        self.table[id.0 as usize] = Inode::default();
        self.sb.used_inodes -= 1;
        Ok(())
    }

    /// Replace an inode's permission value (masked to `0..=7`).
    pub fn set_permission(&mut self, id: InodeId, mode: u8) -> Result<()> {
        self.inode(id)?;
        self.table[id.0 as usize].perm = cfs_types::Perm::new(mode);
        Ok(())
    }

    // ── File data access ────────────────────────────────────────────────

    /// Read up to `len` bytes starting at `offset`, clamped to the file
    /// size. Requires the read bit. Unwritten stretches read as zeroes.
    pub fn read_range(&self, id: InodeId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let ino = self.inode(id)?;
        if ino.dir {
            return Err(FsError::IsDirectory);
        }
        cfs_inode::check_access(ino, Access::Read)?;

        let bs = u64::from(self.sb.block_size);
        let end = ino
            .size
            .min(offset.saturating_add(len as u64))
            .min(BLOCK_SLOTS as u64 * bs);
        let mut out = Vec::with_capacity(end.saturating_sub(offset) as usize);

        let mut pos = offset;
        while pos < end {
            let slot = (pos / bs) as usize;
            let in_block = (pos % bs) as usize;
            let take = ((bs as usize) - in_block).min((end - pos) as usize);
            match ino.blocks[slot] {
                Some(block) => {
                    let start = self.block_offset(block) + in_block;
                    out.extend_from_slice(&self.pool[start..start + take]);
                }
                None => out.extend(std::iter::repeat_n(0u8, take)),
            }
            pos += take as u64;
        }
        Ok(out)
    }

    /// Write `data` at `offset`, allocating blocks lazily and splitting at
    /// block boundaries. Requires the write bit.
    ///
    /// On pool exhaustion mid-write the size is advanced to cover exactly
    /// the bytes written and [`FsError::PartialWrite`] reports how far the
    /// write got — the prefix and the inode stay mutually consistent.
    pub fn write_range(&mut self, id: InodeId, offset: u64, data: &[u8]) -> Result<()> {
        let ino = self.inode(id)?;
        if ino.dir {
            return Err(FsError::IsDirectory);
        }
        cfs_inode::check_access(ino, Access::Write)?;

        let bs = u64::from(self.sb.block_size);
        let max = BLOCK_SLOTS as u64 * bs;
        let end = offset.saturating_add(data.len() as u64);
        if end > max {
            return Err(FsError::FileTooLarge {
                requested: end,
                max,
            });
        }

        let idx = id.0 as usize;
        let mut written = 0usize;
        while written < data.len() {
            let pos = offset + written as u64;
            let slot = (pos / bs) as usize;
            let in_block = (pos % bs) as usize;
            let take = ((bs as usize) - in_block).min(data.len() - written);

            let block = match self.table[idx].blocks[slot] {
                Some(block) => block,
                None => {
                    let block = match cfs_alloc::allocate(
                        &mut self.bitmap,
                        self.sb.block_capacity,
                        &mut self.sb.used_blocks,
                    ) {
                        Ok(block) => block,
                        Err(_) => {
                            if written > 0 {
                                let reached = offset + written as u64;
                                let ino = &mut self.table[idx];
                                ino.size = ino.size.max(reached);
                            }
                            return Err(FsError::PartialWrite {
                                written,
                                requested: data.len(),
                            });
                        }
                    };
                    self.table[idx].blocks[slot] = Some(block);
                    block
                }
            };

            let start = self.block_offset(block) + in_block;
            self.pool[start..start + take].copy_from_slice(&data[written..written + take]);
            written += take;
        }

        let ino = &mut self.table[idx];
        ino.size = ino.size.max(end);
        Ok(())
    }

    /// Append at the current end of file.
    pub fn append(&mut self, id: InodeId, data: &[u8]) -> Result<()> {
        let size = self.inode(id)?.size;
        self.write_range(id, size, data)
    }

    /// Free every block and reset the size to zero, keeping the inode id.
    ///
    /// This is the name-collision import path: re-writing under the same
    /// id reuses the inode, not just the name.
    pub fn truncate(&mut self, id: InodeId) -> Result<()> {
        let ino = self.inode(id)?;
        if ino.dir {
            return Err(FsError::IsDirectory);
        }
        cfs_inode::check_access(ino, Access::Write)?;

        let idx = id.0 as usize;
        let blocks: Vec<BlockId> = self.table[idx]
            .referenced_blocks(self.sb.block_size)
            .collect();
        for block in blocks {
            cfs_alloc::free(
                &mut self.bitmap,
                self.sb.block_capacity,
                &mut self.sb.used_blocks,
                block,
            );
        }
        let ino = &mut self.table[idx];
        ino.blocks = [None; BLOCK_SLOTS];
        ino.size = 0;
        Ok(())
    }

    /// Duplicate a file under `parent` with fresh blocks — the copy never
    /// aliases the source's storage. Requires the read bit on the source.
    ///
    /// Runs out of blocks cleanly: everything allocated for the copy is
    /// released again and no new entry appears.
    pub fn copy_file(&mut self, src: InodeId, parent: InodeId, name: &str) -> Result<InodeId> {
        let src_ino = self.inode(src)?;
        if src_ino.dir {
            return Err(FsError::IsDirectory);
        }
        cfs_inode::check_access(src_ino, Access::Read)?;
        cfs_inode::validate_name(name)?;
        if !self.inode(parent)?.dir {
            return Err(FsError::NotDirectory);
        }
        if cfs_inode::lookup(&self.table, parent, name).is_some() {
            return Err(FsError::Exists(name.to_owned()));
        }
        let dst = cfs_inode::find_free(&self.table)?;

        let src_blocks = self.table[src.0 as usize].blocks;
        let count = self.table[src.0 as usize].block_count(self.sb.block_size);
        let bs = self.sb.block_size as usize;

        let mut new_blocks = [None; BLOCK_SLOTS];
        let mut allocated: Vec<BlockId> = Vec::with_capacity(count);
        for slot in 0..count {
            let Some(old) = src_blocks[slot] else {
                continue;
            };
            match cfs_alloc::allocate(
                &mut self.bitmap,
                self.sb.block_capacity,
                &mut self.sb.used_blocks,
            ) {
                Ok(fresh) => {
                    let from = self.block_offset(old);
                    let to = self.block_offset(fresh);
                    self.pool.copy_within(from..from + bs, to);
                    new_blocks[slot] = Some(fresh);
                    allocated.push(fresh);
                }
                Err(err) => {
                    for block in allocated {
                        cfs_alloc::free(
                            &mut self.bitmap,
                            self.sb.block_capacity,
                            &mut self.sb.used_blocks,
                            block,
                        );
                    }
                    return Err(err);
                }
            }
        }

        let mut copy = self.table[src.0 as usize].clone();
        copy.name = name.to_owned();
        copy.parent = parent;
        copy.blocks = new_blocks;
        copy.created_at = unix_now();
        self.table[dst.0 as usize] = copy;
        self.sb.used_inodes += 1;
        debug!(%src, %dst, name, "file copied");
        Ok(dst)
    }

    /// XOR every allocated block of a file in place with `key`.
    ///
    /// The same call with the same key reverses it. Requires the write bit
    /// and a non-empty key.
    pub fn encrypt_file(&mut self, id: InodeId, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(FsError::Format("cipher key must not be empty".to_owned()));
        }
        let ino = self.inode(id)?;
        if ino.dir {
            return Err(FsError::IsDirectory);
        }
        cfs_inode::check_access(ino, Access::Write)?;

        let bs = self.sb.block_size as usize;
        let blocks: Vec<BlockId> = self.table[id.0 as usize]
            .blocks
            .iter()
            .flatten()
            .copied()
            .collect();
        for block in blocks {
            let start = self.block_offset(block);
            xor_cipher(&mut self.pool[start..start + bs], key.as_bytes());
        }
        Ok(())
    }

    // ── Defragmentation ─────────────────────────────────────────────────

    /// Stop-the-world compaction: every block of every used, non-directory
    /// inode is rewritten contiguously from block 0 upward, in ascending
    /// inode-id order and current list order, onto a fresh pool and a
    /// fresh bitmap. File contents and sizes are untouched.
    pub fn defragment(&mut self) {
        let bs = self.sb.block_size as usize;
        let mut new_pool = vec![0u8; self.pool.len()];
        let mut new_bitmap = vec![0u8; self.bitmap.len()];
        let mut next: u32 = 0;

        for ino in self.table.iter_mut() {
            if !ino.used || ino.dir || ino.size == 0 {
                continue;
            }
            let needs = ino.block_count(self.sb.block_size);
            for slot in ino.blocks.iter_mut().take(needs) {
                let Some(old) = *slot else {
                    continue;
                };
                let from = old.0 as usize * bs;
                let to = next as usize * bs;
                new_pool[to..to + bs].copy_from_slice(&self.pool[from..from + bs]);
                cfs_alloc::bitmap_set(&mut new_bitmap, next);
                *slot = Some(BlockId(next));
                next += 1;
            }
        }

        self.pool = new_pool;
        self.bitmap = new_bitmap;
        self.sb.used_blocks = next;
        info!(live_blocks = next, "defragmentation complete");
    }

    // ── Invariant checking ──────────────────────────────────────────────

    /// Verify the cross-region invariants: the bitmap is exactly the union
    /// of in-use inodes' block lists, counters match their populations,
    /// no block is shared, parents are in-use directories, and directories
    /// own no blocks.
    pub fn check_consistency(&self) -> Result<()> {
        let fail = |detail: String| Err(FsError::Format(detail));

        let mut referenced = vec![false; self.sb.block_capacity as usize];
        let mut used_inodes = 0u32;

        for (idx, ino) in self.table.iter().enumerate() {
            if !ino.used {
                continue;
            }
            used_inodes += 1;

            if idx != 0 {
                match self.table.get(ino.parent.0 as usize) {
                    Some(parent) if parent.used && parent.dir => {}
                    _ => {
                        return fail(format!(
                            "inode {idx}: parent {} is not a live directory",
                            ino.parent
                        ));
                    }
                }
            }
            if ino.dir {
                if ino.size != 0 || ino.blocks.iter().any(Option::is_some) {
                    return fail(format!("directory inode {idx} owns blocks"));
                }
                continue;
            }
            for block in ino.referenced_blocks(self.sb.block_size) {
                let b = block.0 as usize;
                if b >= referenced.len() {
                    return fail(format!("inode {idx}: block {block} out of range"));
                }
                if referenced[b] {
                    return fail(format!("block {block} referenced by two inodes"));
                }
                referenced[b] = true;
                if !cfs_alloc::bitmap_get(&self.bitmap, block.0) {
                    return fail(format!("block {block} referenced but not marked used"));
                }
            }
        }

        for b in 0..self.sb.block_capacity {
            if cfs_alloc::bitmap_get(&self.bitmap, b) && !referenced[b as usize] {
                return fail(format!("block {b} marked used but unreferenced"));
            }
        }
        if self.sb.used_inodes != used_inodes {
            return fail(format!(
                "used_inodes counter {} != live inode count {used_inodes}",
                self.sb.used_inodes
            ));
        }
        let popcount = cfs_alloc::bitmap_count_used(&self.bitmap, self.sb.block_capacity);
        if self.sb.used_blocks != popcount {
            return fail(format!(
                "used_blocks counter {} != bitmap popcount {popcount}",
                self.sb.used_blocks
            ));
        }
        Ok(())
    }

    fn block_offset(&self, block: BlockId) -> usize {
        block.0 as usize * self.sb.block_size as usize
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
