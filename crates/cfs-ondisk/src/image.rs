//! Full-image encode/decode.
//!
//! Layout, in order and with no gaps:
//!
//! 1. Superblock ([`Superblock::DISK_SIZE`] bytes, always plaintext).
//! 2. Inode table: `inode_capacity` records of [`Inode::DISK_SIZE`] bytes.
//! 3. Block pool: `block_capacity * block_size` bytes.
//! 4. Bitmap: `ceil(block_capacity / 8)` bytes, never ciphered.
//!
//! With a non-empty passphrase, regions 2 and 3 are each XOR-ciphered with
//! the key restarting at the region boundary — the same two passes the
//! cipher makes when decoding. Trailing bytes past the computed image
//! length are ignored on decode.

use crate::cipher::xor_cipher;
use crate::{Inode, Superblock};
use cfs_types::ParseError;

/// Byte length of a well-formed image for this superblock.
#[must_use]
pub fn image_len(sb: &Superblock) -> usize {
    Superblock::DISK_SIZE
        + sb.inode_capacity as usize * Inode::DISK_SIZE
        + sb.block_capacity as usize * sb.block_size as usize
        + (sb.block_capacity as usize).div_ceil(8)
}

/// Serialize the whole filesystem state into one image buffer.
///
/// The cipher is applied to the serialized copy, never to the caller's
/// live state, so the running process keeps working on plaintext.
pub fn encode_image(
    sb: &Superblock,
    inodes: &[Inode],
    pool: &[u8],
    bitmap: &[u8],
) -> Result<Vec<u8>, ParseError> {
    if inodes.len() != sb.inode_capacity as usize {
        return Err(ParseError::InvalidField {
            field: "inode_table",
            reason: "length does not match superblock inode_capacity",
        });
    }
    if pool.len() != sb.block_capacity as usize * sb.block_size as usize {
        return Err(ParseError::InvalidField {
            field: "block_pool",
            reason: "length does not match superblock geometry",
        });
    }
    if bitmap.len() != (sb.block_capacity as usize).div_ceil(8) {
        return Err(ParseError::InvalidField {
            field: "bitmap",
            reason: "length does not match superblock block_capacity",
        });
    }

    let mut out = Vec::with_capacity(image_len(sb));
    sb.write_to(&mut out);

    let table_start = out.len();
    for ino in inodes {
        ino.write_to(&mut out);
    }
    let pool_start = out.len();
    out.extend_from_slice(pool);
    let pool_end = out.len();

    if sb.cipher_enabled() {
        xor_cipher(&mut out[table_start..pool_start], sb.passphrase.as_bytes());
        xor_cipher(&mut out[pool_start..pool_end], sb.passphrase.as_bytes());
    }

    out.extend_from_slice(bitmap);
    Ok(out)
}

/// Decode the inode table, block pool, and bitmap from a full image whose
/// superblock has already been parsed (and its passphrase verified).
pub fn decode_body(
    bytes: &[u8],
    sb: &Superblock,
) -> Result<(Vec<Inode>, Vec<u8>, Vec<u8>), ParseError> {
    let table_len = sb.inode_capacity as usize * Inode::DISK_SIZE;
    let pool_len = sb.block_capacity as usize * sb.block_size as usize;
    let bitmap_len = (sb.block_capacity as usize).div_ceil(8);

    let table_start = Superblock::DISK_SIZE;
    let pool_start = table_start + table_len;
    let bitmap_start = pool_start + pool_len;

    let mut table = cfs_types::ensure_slice(bytes, table_start, table_len)?.to_vec();
    let mut pool = cfs_types::ensure_slice(bytes, pool_start, pool_len)?.to_vec();
    let bitmap = cfs_types::ensure_slice(bytes, bitmap_start, bitmap_len)?.to_vec();

    if sb.cipher_enabled() {
        xor_cipher(&mut table, sb.passphrase.as_bytes());
        xor_cipher(&mut pool, sb.passphrase.as_bytes());
    }

    let mut inodes = Vec::with_capacity(sb.inode_capacity as usize);
    for i in 0..sb.inode_capacity as usize {
        inodes.push(Inode::parse_from_bytes(&table[i * Inode::DISK_SIZE..])?);
    }

    Ok((inodes, pool, bitmap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_types::{BlockId, Geometry, InodeId};

    fn tiny_fs(passphrase: &str) -> (Superblock, Vec<Inode>, Vec<u8>, Vec<u8>) {
        let geo = Geometry::plan(Geometry::metadata_bytes() + 8 * 1024).unwrap();
        let sb = Superblock::new(&geo, passphrase.to_owned());

        let mut inodes = vec![Inode::default(); geo.inode_capacity as usize];
        inodes[0] = Inode::new("root".to_owned(), InodeId::ROOT, true, 0);

        let mut file = Inode::new("a.txt".to_owned(), InodeId::ROOT, false, 42);
        file.size = 5;
        file.blocks[0] = Some(BlockId(0));
        inodes[1] = file;

        let mut pool = vec![0u8; geo.pool_bytes()];
        pool[..5].copy_from_slice(b"hello");
        let mut bitmap = vec![0u8; geo.bitmap_bytes()];
        bitmap[0] = 0b0000_0001;

        (sb, inodes, pool, bitmap)
    }

    #[test]
    fn plaintext_image_round_trips() {
        let (mut sb, inodes, pool, bitmap) = tiny_fs("");
        sb.used_inodes = 2;
        sb.used_blocks = 1;

        let img = encode_image(&sb, &inodes, &pool, &bitmap).unwrap();
        assert_eq!(img.len(), image_len(&sb));

        let parsed_sb = Superblock::parse_from_bytes(&img).unwrap();
        assert_eq!(parsed_sb, sb);
        let (inodes2, pool2, bitmap2) = decode_body(&img, &parsed_sb).unwrap();
        assert_eq!(inodes2, inodes);
        assert_eq!(pool2, pool);
        assert_eq!(bitmap2, bitmap);
    }

    #[test]
    fn ciphered_image_round_trips_and_hides_contents() {
        let (sb, inodes, pool, bitmap) = tiny_fs("k3y");

        let img = encode_image(&sb, &inodes, &pool, &bitmap).unwrap();

        // The pool region on disk must not contain the plaintext.
        let pool_start =
            Superblock::DISK_SIZE + sb.inode_capacity as usize * Inode::DISK_SIZE;
        assert_ne!(&img[pool_start..pool_start + 5], b"hello");

        let parsed_sb = Superblock::parse_from_bytes(&img).unwrap();
        let (inodes2, pool2, bitmap2) = decode_body(&img, &parsed_sb).unwrap();
        assert_eq!(inodes2, inodes);
        assert_eq!(&pool2[..5], b"hello");
        assert_eq!(bitmap2, bitmap);
    }

    #[test]
    fn bitmap_region_is_never_ciphered() {
        let (sb, inodes, pool, bitmap) = tiny_fs("k3y");
        let img = encode_image(&sb, &inodes, &pool, &bitmap).unwrap();
        assert_eq!(&img[img.len() - bitmap.len()..], &bitmap[..]);
    }

    #[test]
    fn encode_rejects_mismatched_regions() {
        let (sb, inodes, pool, bitmap) = tiny_fs("");
        assert!(encode_image(&sb, &inodes[1..], &pool, &bitmap).is_err());
        assert!(encode_image(&sb, &inodes, &pool[1..], &bitmap).is_err());
        assert!(encode_image(&sb, &inodes, &pool, &bitmap[1..]).is_err());
    }

    #[test]
    fn decode_rejects_truncated_image() {
        let (sb, inodes, pool, bitmap) = tiny_fs("");
        let img = encode_image(&sb, &inodes, &pool, &bitmap).unwrap();
        let sb2 = Superblock::parse_from_bytes(&img).unwrap();
        assert!(matches!(
            decode_body(&img[..img.len() - 1], &sb2),
            Err(ParseError::InsufficientData { .. })
        ));
    }
}
