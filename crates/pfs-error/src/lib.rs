#![forbid(unsafe_code)]
//! Error types for polyfsck.
//!
//! Defines `FsckError` and a `Result<T>` alias used throughout the
//! workspace. Every error is fatal; `FsckError::exit_code` maps each kind to
//! the conventional fsck exit code.

use pfs_types::ParseError;
use thiserror::Error;

/// No errors.
pub const FSCK_OK: i32 = 0;
/// File system errors corrected (reserved for fsck compatibility).
pub const FSCK_NONDESTRUCT: i32 = 1;
/// System should be rebooted (reserved).
pub const FSCK_REBOOT: i32 = 2;
/// File system errors left uncorrected.
pub const FSCK_UNCORRECTED: i32 = 4;
/// Operational error.
pub const FSCK_ERROR: i32 = 8;
/// Usage or syntax error.
pub const FSCK_USAGE: i32 = 16;
/// Shared library error (reserved).
pub const FSCK_LIBRARY: i32 = 128;

/// Unified error type for every polyfsck failure.
#[derive(Debug, Error)]
pub enum FsckError {
    #[error("{message}")]
    Usage { message: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("not a block device or file: {path}")]
    InvalidImageType { path: String },

    #[error("truncated record: {0}")]
    Parse(#[from] ParseError),

    #[error("superblock magic not found")]
    BadMagic,

    #[error("filesystem smaller than a polyfs superblock")]
    ImageTooSmall,

    #[error("superblock size ({size}) too small")]
    SuperblockTooSmall { size: u32 },

    #[error("unsupported filesystem features")]
    UnsupportedFeature,

    #[error("invalid filesystem version")]
    InvalidVersion,

    #[error("zero file count")]
    ZeroFileCount,

    #[error("file length too short, {file_len} is smaller than {fs_size}")]
    TruncatedImage { file_len: u64, fs_size: u64 },

    #[error("crc error")]
    CrcMismatch,

    #[error("directory inode has zero offset and non-zero size: {path}")]
    BadDirInode { path: String },

    #[error("filename length is zero")]
    EmptyName,

    #[error("bad filename length")]
    BadNameLength,

    #[error("bad inode offset")]
    BadChildOffset,

    #[error("root inode is not directory")]
    RootNotDirectory,

    #[error("bad root offset ({offset})")]
    BadRootOffset { offset: u64 },

    #[error("file inode has {detail}")]
    FileInodeInconsistent { detail: &'static str },

    #[error("symbolic link has zero offset")]
    SymlinkZeroOffset,

    #[error("symbolic link has zero size")]
    SymlinkZeroSize,

    #[error("size error in symlink: {path}")]
    SymlinkSizeMismatch { path: String },

    #[error("special file has non-zero offset: {path}")]
    SpecialHasOffset { path: String },

    #[error("fifo has non-zero size: {path}")]
    FifoHasSize { path: String },

    #[error("socket has non-zero size: {path}")]
    SocketHasSize { path: String },

    #[error("bogus mode: {path} ({mode:o})")]
    BogusMode { path: String, mode: u16 },

    #[error("data block too large")]
    BlockTooLarge,

    #[error("uncompressed block is {actual} bytes, expected {expected}")]
    BlockSizeMismatch { actual: u64, expected: u64 },

    #[error("decompression error: {detail}")]
    DecompressError { detail: String },

    #[error("LZO overlap decompression failed")]
    LzoOverlapError,

    #[error("directory data start ({start_data}) < superblock end ({min})")]
    DataBeforeSuper { start_data: u64, min: u64 },

    #[error("directory data end ({end_dir}) != file data start ({start_data})")]
    DirDataGap { end_dir: u64, start_data: u64 },

    #[error("invalid file data offset")]
    DataPastEnd,
}

impl FsckError {
    /// Wrap an I/O error with a `"<op> failed: <path>"` context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Map this error to its fsck exit code.
    ///
    /// Usage errors exit 16, operational errors 8, and every filesystem
    /// content error 4 ("errors left uncorrected").
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage { .. } => FSCK_USAGE,
            Self::Io { .. } | Self::InvalidImageType { .. } => FSCK_ERROR,
            _ => FSCK_UNCORRECTED,
        }
    }
}

/// Result alias using `FsckError`.
pub type Result<T> = std::result::Result<T, FsckError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_by_kind() {
        assert_eq!(
            FsckError::Usage {
                message: "bad".into()
            }
            .exit_code(),
            FSCK_USAGE
        );
        assert_eq!(
            FsckError::io("open failed: img", std::io::Error::other("boom")).exit_code(),
            FSCK_ERROR
        );
        assert_eq!(FsckError::BadMagic.exit_code(), FSCK_UNCORRECTED);
        assert_eq!(FsckError::CrcMismatch.exit_code(), FSCK_UNCORRECTED);
        assert_eq!(FsckError::LzoOverlapError.exit_code(), FSCK_UNCORRECTED);
    }

    #[test]
    fn reference_messages() {
        assert_eq!(FsckError::BadMagic.to_string(), "superblock magic not found");
        assert_eq!(FsckError::CrcMismatch.to_string(), "crc error");
        assert_eq!(
            FsckError::TruncatedImage {
                file_len: 4095,
                fs_size: 4096
            }
            .to_string(),
            "file length too short, 4095 is smaller than 4096"
        );
        assert_eq!(
            FsckError::BadRootOffset { offset: 60 }.to_string(),
            "bad root offset (60)"
        );
    }
}
