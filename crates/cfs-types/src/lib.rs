#![forbid(unsafe_code)]
//! Core types for CapsuleFS: identifier newtypes, permission bits,
//! image geometry, and the little-endian byte helpers shared by the
//! on-disk codecs.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Image magic: `b"CFS1"` little-endian.
pub const CAPSULE_MAGIC: u32 = u32::from_le_bytes(*b"CFS1");

/// Default data-block size in bytes.
pub const BLOCK_SIZE: u32 = 1024;

/// Number of inode slots in the table. Slot 0 is the root directory.
pub const INODE_CAPACITY: u32 = 100;

/// Block references per inode. Caps file size at
/// `BLOCK_SLOTS * block_size` bytes (128 KiB at the default block size).
pub const BLOCK_SLOTS: usize = 128;

/// Maximum length of an entry name, in bytes.
pub const NAME_MAX: usize = 32;

/// Maximum length of the image passphrase, in bytes.
pub const PASSPHRASE_MAX: usize = 32;

/// Serialized superblock size: magic + total_bytes + five `u32` counters
/// + the passphrase field.
pub const SUPERBLOCK_DISK_SIZE: usize = 4 + 8 + 4 + 4 + 4 + 4 + 4 + PASSPHRASE_MAX;

/// Serialized inode record size: three flag bytes, the name field, parent,
/// size, creation time, and `BLOCK_SLOTS` block references.
pub const INODE_DISK_SIZE: usize = 3 + NAME_MAX + 4 + 8 + 8 + BLOCK_SLOTS * 4;

/// On-disk marker for an empty block-list slot.
///
/// The in-memory representation uses `Option<BlockId>`; `NO_BLOCK` is what
/// `None` serializes to. Block 0 is an ordinary allocatable block.
pub const NO_BLOCK: u32 = u32::MAX;

// ── Identifier newtypes ─────────────────────────────────────────────────────

/// Index of a block in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

/// Index of an inode in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeId(pub u32);

impl InodeId {
    /// The root directory lives in slot 0 and is its own parent.
    pub const ROOT: Self = Self(0);
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Permissions ─────────────────────────────────────────────────────────────

/// Capability required by an operation, mapped to one permission bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    #[must_use]
    pub fn bit(self) -> u8 {
        match self {
            Self::Read => 0o4,
            Self::Write => 0o2,
            Self::Execute => 0o1,
        }
    }
}

/// An octal permission value in `0..=7` (4=read, 2=write, 1=execute).
///
/// Construction masks to the low three bits, so `Perm::new(9)` is
/// `Perm::new(1)` — mirrors chmod-style numeric input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Perm(u8);

impl Perm {
    /// Read, write, and execute. Default for newly created entries.
    pub const ALL: Self = Self(0o7);
    pub const READ_ONLY: Self = Self(0o4);

    #[must_use]
    pub fn new(mode: u8) -> Self {
        Self(mode & 0o7)
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether this permission grants the given capability.
    #[must_use]
    pub fn allows(self, access: Access) -> bool {
        self.0 & access.bit() != 0
    }
}

impl fmt::Display for Perm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Geometry / capacity planning ────────────────────────────────────────────

/// Image geometry fixed at creation time and recorded in the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Requested total image capacity in bytes.
    pub total_bytes: u64,
    /// Data-block size in bytes.
    pub block_size: u32,
    /// Number of inode slots.
    pub inode_capacity: u32,
    /// Number of data blocks in the pool.
    pub block_capacity: u32,
}

impl Geometry {
    /// Bytes reserved for metadata ahead of the block pool.
    ///
    /// The bitmap is deliberately excluded from the reservation; the
    /// planner only accounts for the superblock and the inode table.
    #[must_use]
    pub fn metadata_bytes() -> u64 {
        (SUPERBLOCK_DISK_SIZE + INODE_CAPACITY as usize * INODE_DISK_SIZE) as u64
    }

    /// Plan a layout for `total_bytes` of capacity.
    ///
    /// Returns `None` when not even one data block fits after the
    /// metadata reservation.
    #[must_use]
    pub fn plan(total_bytes: u64) -> Option<Self> {
        let usable = total_bytes.checked_sub(Self::metadata_bytes())?;
        let block_capacity = u32::try_from(usable / u64::from(BLOCK_SIZE)).ok()?;
        if block_capacity == 0 {
            return None;
        }
        Some(Self {
            total_bytes,
            block_size: BLOCK_SIZE,
            inode_capacity: INODE_CAPACITY,
            block_capacity,
        })
    }

    /// Size of the block pool in bytes.
    #[must_use]
    pub fn pool_bytes(&self) -> usize {
        self.block_capacity as usize * self.block_size as usize
    }

    /// Size of the block bitmap in bytes.
    #[must_use]
    pub fn bitmap_bytes(&self) -> usize {
        (self.block_capacity as usize).div_ceil(8)
    }
}

// ── Parse errors & byte helpers ─────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Decode a NUL-padded fixed-width string field.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Encode a string into a NUL-padded fixed-width field of `N` bytes.
///
/// Callers validate length beforehand; overflow here truncates at the
/// field boundary rather than corrupting adjacent fields.
#[must_use]
pub fn nul_padded<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0_u8; N];
    let src = s.as_bytes();
    let len = src.len().min(N);
    out[..len].copy_from_slice(&src[..len]);
    out
}

// ── Tests ───────────────────────────────────────────────────────────────────
