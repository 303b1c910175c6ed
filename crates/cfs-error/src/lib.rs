#![forbid(unsafe_code)]
//! Error types for CapsuleFS.
//!
//! `FsError` is the single user-facing error type returned by the public
//! API in `cfs-core`. Crate-internal errors (`ParseError` in `cfs-types`)
//! convert into `FsError` at the `cfs-core` boundary; this crate stays
//! independent of every other CapsuleFS crate so no dependency cycle can
//! form.
//!
//! Every core operation returns a `Result` — nothing in the storage engine
//! terminates the process. Whether a failed image load at startup is fatal
//! is the surrounding shell's decision.

use thiserror::Error;

/// Unified error type for all CapsuleFS operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// Host file open/read/write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested capacity cannot hold even one data block after the
    /// superblock and inode table are reserved.
    #[error("image too small: {total_bytes} bytes requested, {metadata_bytes} reserved for metadata")]
    TooSmall {
        total_bytes: u64,
        metadata_bytes: u64,
    },

    /// The block pool is exhausted.
    #[error("no free blocks")]
    NoFreeBlocks,

    /// The inode table is exhausted.
    #[error("no free inodes")]
    NoFreeInodes,

    /// A multi-block write ran out of blocks partway through.
    ///
    /// The file's size reflects exactly the bytes that were written; the
    /// written prefix and the inode remain mutually consistent.
    #[error("disk full: wrote {written} of {requested} bytes")]
    PartialWrite { written: usize, requested: usize },

    /// A write would extend the file past its block-list capacity.
    #[error("file too large: {requested} bytes exceeds the {max} byte limit")]
    FileTooLarge { requested: u64, max: u64 },

    /// Name does not resolve in the given directory.
    #[error("not found: {0}")]
    NotFound(String),

    /// An entry with this name already exists in the directory.
    #[error("already exists: {0}")]
    Exists(String),

    /// The required read/write/execute permission bit is unset.
    #[error("permission denied")]
    PermissionDenied,

    /// A directory operation was applied to a file.
    #[error("not a directory")]
    NotDirectory,

    /// A file operation was applied to a directory.
    #[error("is a directory")]
    IsDirectory,

    /// Non-recursive removal of a directory that still has children.
    #[error("directory not empty")]
    NotEmpty,

    /// Entry name or passphrase exceeds its fixed on-disk field.
    #[error("name too long")]
    NameTooLong,

    /// Load-time passphrase mismatch.
    #[error("wrong passphrase")]
    BadPassword,

    /// Structurally invalid image (bad magic, truncated regions,
    /// inconsistent lengths).
    #[error("invalid image format: {0}")]
    Format(String),
}

/// Result alias using `FsError`.
pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable() {
        assert_eq!(FsError::NoFreeBlocks.to_string(), "no free blocks");
        assert_eq!(
            FsError::PartialWrite {
                written: 1024,
                requested: 4096,
            }
            .to_string(),
            "disk full: wrote 1024 of 4096 bytes"
        );
        assert_eq!(
            FsError::NotFound("a.txt".to_owned()).to_string(),
            "not found: a.txt"
        );
        assert_eq!(FsError::BadPassword.to_string(), "wrong passphrase");
    }

    #[test]
    fn io_errors_convert() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(FsError::Io(_))));
    }
}
