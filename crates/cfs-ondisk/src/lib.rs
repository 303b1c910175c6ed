#![forbid(unsafe_code)]
//! On-disk format for CapsuleFS images.
//!
//! Pure serialization crate — no I/O, no side effects. Encodes and parses
//! the superblock record, fixed-size inode records, and the full image
//! layout (superblock, inode table, block pool, bitmap), plus the XOR
//! at-rest cipher applied to the table and pool regions.
//!
//! All fields are little-endian with no padding beyond the fixed-width
//! string fields.

pub mod cipher;
pub mod image;

use cfs_types::{
    BLOCK_SLOTS, BlockId, CAPSULE_MAGIC, Geometry, INODE_DISK_SIZE, InodeId, NAME_MAX, NO_BLOCK,
    PASSPHRASE_MAX, ParseError, Perm, SUPERBLOCK_DISK_SIZE, nul_padded, read_fixed, read_le_u32,
    read_le_u64, trim_nul_padded,
};

// ── Superblock ──────────────────────────────────────────────────────────────

/// The single metadata record describing the whole image: capacity, usage
/// counters, and the at-rest passphrase (empty = cipher disabled).
///
/// The passphrase is stored in plaintext beside the data it protects.
/// That is the documented behavior of this format, kept as-is; hardening
/// it is an explicit non-goal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub total_bytes: u64,
    pub block_size: u32,
    pub inode_capacity: u32,
    pub used_inodes: u32,
    pub block_capacity: u32,
    pub used_blocks: u32,
    pub passphrase: String,
}

impl Superblock {
    pub const DISK_SIZE: usize = SUPERBLOCK_DISK_SIZE;

    /// Fresh superblock for a newly planned image. The root directory is
    /// created alongside, so one inode starts out used.
    #[must_use]
    pub fn new(geo: &Geometry, passphrase: String) -> Self {
        Self {
            total_bytes: geo.total_bytes,
            block_size: geo.block_size,
            inode_capacity: geo.inode_capacity,
            used_inodes: 1,
            block_capacity: geo.block_capacity,
            used_blocks: 0,
            passphrase,
        }
    }

    /// Whether the at-rest cipher applies to this image.
    #[must_use]
    pub fn cipher_enabled(&self) -> bool {
        !self.passphrase.is_empty()
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&CAPSULE_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.total_bytes.to_le_bytes());
        out.extend_from_slice(&self.block_size.to_le_bytes());
        out.extend_from_slice(&self.inode_capacity.to_le_bytes());
        out.extend_from_slice(&self.used_inodes.to_le_bytes());
        out.extend_from_slice(&self.block_capacity.to_le_bytes());
        out.extend_from_slice(&self.used_blocks.to_le_bytes());
        out.extend_from_slice(&nul_padded::<PASSPHRASE_MAX>(&self.passphrase));
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(bytes, 0)?;
        if magic != CAPSULE_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: CAPSULE_MAGIC,
                actual: magic,
            });
        }

        let sb = Self {
            total_bytes: read_le_u64(bytes, 4)?,
            block_size: read_le_u32(bytes, 12)?,
            inode_capacity: read_le_u32(bytes, 16)?,
            used_inodes: read_le_u32(bytes, 20)?,
            block_capacity: read_le_u32(bytes, 24)?,
            used_blocks: read_le_u32(bytes, 28)?,
            passphrase: trim_nul_padded(&read_fixed::<PASSPHRASE_MAX>(bytes, 32)?),
        };

        if sb.block_size == 0 {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be nonzero",
            });
        }
        if sb.inode_capacity == 0 {
            return Err(ParseError::InvalidField {
                field: "inode_capacity",
                reason: "must be nonzero",
            });
        }
        Ok(sb)
    }
}

// ── Inode record ────────────────────────────────────────────────────────────

/// One file or directory: flags, name, parent link, byte size, and the
/// ordered list of block references.
///
/// Block-list slots are `Option<BlockId>`; a slot only becomes `Some` when
/// that stretch of the file has been written. On disk, `None` serializes
/// as [`NO_BLOCK`], so a legitimately allocated block 0 is never mistaken
/// for "unallocated".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub used: bool,
    pub dir: bool,
    pub perm: Perm,
    pub name: String,
    pub parent: InodeId,
    pub size: u64,
    /// Unix seconds. Informational only.
    pub created_at: u64,
    pub blocks: [Option<BlockId>; BLOCK_SLOTS],
}

impl Default for Inode {
    fn default() -> Self {
        Self {
            used: false,
            dir: false,
            perm: Perm::new(0),
            name: String::new(),
            parent: InodeId::ROOT,
            size: 0,
            created_at: 0,
            blocks: [None; BLOCK_SLOTS],
        }
    }
}

impl Inode {
    pub const DISK_SIZE: usize = INODE_DISK_SIZE;

    /// Freshly allocated entry. The block list starts empty — reused inode
    /// slots never carry stale references.
    #[must_use]
    pub fn new(name: String, parent: InodeId, dir: bool, created_at: u64) -> Self {
        Self {
            used: true,
            dir,
            perm: Perm::ALL,
            name,
            parent,
            created_at,
            ..Self::default()
        }
    }

    /// Number of blocks this inode's size spans: `ceil(size / block_size)`.
    #[must_use]
    pub fn block_count(&self, block_size: u32) -> usize {
        (self.size.div_ceil(u64::from(block_size))) as usize
    }

    /// The referenced blocks, in list order, up to `block_count`.
    pub fn referenced_blocks(&self, block_size: u32) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks
            .iter()
            .take(self.block_count(block_size))
            .filter_map(|slot| *slot)
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(u8::from(self.used));
        out.push(u8::from(self.dir));
        out.push(self.perm.bits());
        out.extend_from_slice(&nul_padded::<NAME_MAX>(&self.name));
        out.extend_from_slice(&self.parent.0.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.created_at.to_le_bytes());
        for slot in &self.blocks {
            let raw = slot.map_or(NO_BLOCK, |b| b.0);
            out.extend_from_slice(&raw.to_le_bytes());
        }
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let header = cfs_types::ensure_slice(bytes, 0, 3)?;
        let used = header[0] != 0;
        let dir = header[1] != 0;
        let perm = Perm::new(header[2]);

        let name = trim_nul_padded(&read_fixed::<NAME_MAX>(bytes, 3)?);
        let parent = InodeId(read_le_u32(bytes, 3 + NAME_MAX)?);
        let size = read_le_u64(bytes, 7 + NAME_MAX)?;
        let created_at = read_le_u64(bytes, 15 + NAME_MAX)?;

        let mut blocks = [None; BLOCK_SLOTS];
        let base = 23 + NAME_MAX;
        for (i, slot) in blocks.iter_mut().enumerate() {
            let raw = read_le_u32(bytes, base + i * 4)?;
            if raw != NO_BLOCK {
                *slot = Some(BlockId(raw));
            }
        }

        Ok(Self {
            used,
            dir,
            perm,
            name,
            parent,
            size,
            created_at,
            blocks,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
