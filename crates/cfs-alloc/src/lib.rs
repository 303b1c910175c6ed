#![forbid(unsafe_code)]
//! Block allocation for CapsuleFS.
//!
//! One bit per block in the pool, bit set ⇔ the block is referenced by
//! some in-use inode's block list. Allocation is a first-fit linear scan
//! from block 0 — deterministic on purpose, so tests can rely on the
//! allocation order.
//!
//! The allocator and the defragmenter are the only writers of the bitmap;
//! the superblock's `used_blocks` counter moves with every set/clear so it
//! always equals the bitmap's popcount.

use cfs_error::{FsError, Result};
use cfs_types::BlockId;

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice. Out-of-range reads as unset.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count set (used) bits among the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_used(bitmap: &[u8], count: u32) -> u32 {
    (0..count).filter(|&idx| bitmap_get(bitmap, idx)).count() as u32
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// First-fit scan from block 0 for a clear bit; sets it and increments
/// `used_blocks`.
///
/// Exhaustion leaves the bitmap and counter untouched.
pub fn allocate(bitmap: &mut [u8], block_capacity: u32, used_blocks: &mut u32) -> Result<BlockId> {
    for idx in 0..block_capacity {
        if !bitmap_get(bitmap, idx) {
            bitmap_set(bitmap, idx);
            *used_blocks += 1;
            return Ok(BlockId(idx));
        }
    }
    Err(FsError::NoFreeBlocks)
}

/// Release a block. Out-of-range ids and double-frees are safe no-ops.
pub fn free(bitmap: &mut [u8], block_capacity: u32, used_blocks: &mut u32, id: BlockId) {
    if id.0 >= block_capacity {
        return;
    }
    if bitmap_get(bitmap, id.0) {
        bitmap_clear(bitmap, id.0);
        *used_blocks -= 1;
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_get_set_clear() {
        let mut bm = vec![0u8; 2];
        assert!(!bitmap_get(&bm, 0));
        bitmap_set(&mut bm, 0);
        assert!(bitmap_get(&bm, 0));
        bitmap_clear(&mut bm, 0);
        assert!(!bitmap_get(&bm, 0));

        bitmap_set(&mut bm, 7);
        assert_eq!(bm[0], 0x80);
        bitmap_set(&mut bm, 8);
        assert_eq!(bm[1], 0x01);
    }

    #[test]
    fn bitmap_out_of_range_is_harmless() {
        let mut bm = vec![0u8; 1];
        bitmap_set(&mut bm, 64);
        assert_eq!(bm[0], 0);
        assert!(!bitmap_get(&bm, 64));
    }

    #[test]
    fn allocation_is_first_fit_from_zero() {
        let mut bm = vec![0u8; 2];
        let mut used = 0;

        let a = allocate(&mut bm, 16, &mut used).unwrap();
        let b = allocate(&mut bm, 16, &mut used).unwrap();
        assert_eq!(a, BlockId(0));
        assert_eq!(b, BlockId(1));
        assert_eq!(used, 2);

        // Freeing the first block makes it the next candidate again.
        free(&mut bm, 16, &mut used, a);
        assert_eq!(used, 1);
        let c = allocate(&mut bm, 16, &mut used).unwrap();
        assert_eq!(c, BlockId(0));
    }

    #[test]
    fn exhaustion_leaves_state_unchanged() {
        let mut bm = vec![0u8; 1];
        let mut used = 0;
        for _ in 0..8 {
            allocate(&mut bm, 8, &mut used).unwrap();
        }
        assert_eq!(used, 8);

        let err = allocate(&mut bm, 8, &mut used);
        assert!(matches!(err, Err(FsError::NoFreeBlocks)));
        assert_eq!(used, 8);
        assert_eq!(bm[0], 0xFF);
    }

    #[test]
    fn double_free_and_out_of_range_free_are_noops() {
        let mut bm = vec![0u8; 1];
        let mut used = 0;
        let a = allocate(&mut bm, 8, &mut used).unwrap();

        free(&mut bm, 8, &mut used, a);
        assert_eq!(used, 0);
        free(&mut bm, 8, &mut used, a);
        assert_eq!(used, 0);

        free(&mut bm, 8, &mut used, BlockId(999));
        assert_eq!(used, 0);
    }

    #[test]
    fn used_counter_matches_popcount() {
        let mut bm = vec![0u8; 4];
        let mut used = 0;
        for _ in 0..13 {
            allocate(&mut bm, 32, &mut used).unwrap();
        }
        free(&mut bm, 32, &mut used, BlockId(4));
        free(&mut bm, 32, &mut used, BlockId(9));
        assert_eq!(used, bitmap_count_used(&bm, 32));
    }
}
