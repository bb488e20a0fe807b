#![forbid(unsafe_code)]
//! On-disk format parsing for polyfs structures.
//!
//! Pure parsing crate — no I/O, no side effects. Decodes byte slices into
//! typed superblock and inode records, and validates superblock fields.
//! All on-disk integers are little-endian and are decoded explicitly; no
//! host layout is reinterpreted.

use pfs_error::FsckError;
use pfs_types::{
    BLOCK_SIZE, FLAG_FSID_VERSION_1, FLAG_LZO_COMPRESSION, FLAG_ZLIB_COMPRESSION, INODE_SIZE,
    POLYFS_MAGIC, ParseError, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG,
    S_IFSOCK, SUPER_SIZE, SUPPORTED_FLAGS, read_le_u16, read_le_u24, read_le_u32,
};
use serde::{Deserialize, Serialize};

/// Width of the `namelen` bitfield in the packed inode tail word.
const NAMELEN_WIDTH: u32 = 6;

/// File-type classification of an inode, from the mode's `S_IFMT` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Dir,
    File,
    Symlink,
    CharDev,
    BlockDev,
    Fifo,
    Socket,
    Unknown,
}

impl FileKind {
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFDIR => Self::Dir,
            S_IFREG => Self::File,
            S_IFLNK => Self::Symlink,
            S_IFCHR => Self::CharDev,
            S_IFBLK => Self::BlockDev,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Socket,
            _ => Self::Unknown,
        }
    }

    /// Single-letter tag used by the verbose listing.
    #[must_use]
    pub fn tag(self) -> char {
        match self {
            Self::Dir => 'd',
            Self::File => 'f',
            Self::Symlink => 'l',
            Self::CharDev => 'c',
            Self::BlockDev => 'b',
            Self::Fifo => 'p',
            Self::Socket => 's',
            Self::Unknown => '?',
        }
    }
}

/// A decoded inode record.
///
/// `size` is the 24-bit on-disk field: content bytes for regular files,
/// directory entry bytes for directories, the packed device number for
/// char/block devices. `namelen` and `offset` are in 4-byte units, split
/// out of the packed tail word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub mode: u16,
    pub uid: u16,
    pub size: u32,
    pub gid: u8,
    pub namelen: u8,
    pub offset: u32,
}

impl Inode {
    /// Decode one 12-byte inode record.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < INODE_SIZE {
            return Err(ParseError::InsufficientData {
                needed: INODE_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let word = read_le_u32(bytes, 0x08)?;

        Ok(Self {
            mode: read_le_u16(bytes, 0x00)?,
            uid: read_le_u16(bytes, 0x02)?,
            size: read_le_u24(bytes, 0x04)?,
            gid: bytes[0x07],
            namelen: (word & ((1 << NAMELEN_WIDTH) - 1)) as u8,
            offset: word >> NAMELEN_WIDTH,
        })
    }

    #[must_use]
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    /// Byte offset of this inode's content in the image.
    #[must_use]
    pub fn byte_offset(&self) -> u64 {
        u64::from(self.offset) * 4
    }

    /// Declared on-disk length of the name, NUL padding included.
    #[must_use]
    pub fn name_bytes(&self) -> usize {
        usize::from(self.namelen) * 4
    }
}

/// Filesystem id block of the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fsid {
    pub crc: u32,
    pub edition: u32,
    pub blocks: u32,
    pub files: u32,
}

/// A decoded superblock record.
///
/// `size` is the absolute end offset of the filesystem within the image:
/// the CRC covers `[start, size)` and every data pointer must stay below
/// it, including for pad-offset images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub magic: u32,
    pub size: u32,
    pub flags: u32,
    pub future: u32,
    pub fsid: Fsid,
    pub root: Inode,
}

impl Superblock {
    /// Whether a candidate record carries the polyfs magic.
    #[must_use]
    pub fn magic_matches(bytes: &[u8]) -> bool {
        read_le_u32(bytes, 0x00).is_ok_and(|magic| magic == POLYFS_MAGIC)
    }

    /// Decode one 44-byte superblock record.
    ///
    /// Rejects a wrong magic; everything else is deferred to [`validate`].
    ///
    /// [`validate`]: Superblock::validate
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < SUPER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPER_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let magic = read_le_u32(bytes, 0x00)?;
        if magic != POLYFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: POLYFS_MAGIC,
                actual: magic,
            });
        }

        Ok(Self {
            magic,
            size: read_le_u32(bytes, 0x04)?,
            flags: read_le_u32(bytes, 0x08)?,
            future: read_le_u32(bytes, 0x0C)?,
            fsid: Fsid {
                crc: read_le_u32(bytes, 0x10)?,
                edition: read_le_u32(bytes, 0x14)?,
                blocks: read_le_u32(bytes, 0x18)?,
                files: read_le_u32(bytes, 0x1C)?,
            },
            root: Inode::parse(&bytes[0x20..SUPER_SIZE])?,
        })
    }

    /// Validate superblock fields against the image length.
    ///
    /// Checks run in the reference order: unknown feature bits, size floor,
    /// version flag, file count, image length. An image longer than
    /// `size` is legal (the caller may warn); shorter is fatal.
    pub fn validate(&self, image_len: u64) -> Result<(), FsckError> {
        if self.flags & !SUPPORTED_FLAGS != 0 {
            return Err(FsckError::UnsupportedFeature);
        }
        let compression = FLAG_LZO_COMPRESSION | FLAG_ZLIB_COMPRESSION;
        if self.flags & compression == compression {
            return Err(FsckError::UnsupportedFeature);
        }
        if (self.size as usize) < BLOCK_SIZE {
            return Err(FsckError::SuperblockTooSmall { size: self.size });
        }
        if self.flags & FLAG_FSID_VERSION_1 == 0 {
            return Err(FsckError::InvalidVersion);
        }
        if self.fsid.files == 0 {
            return Err(FsckError::ZeroFileCount);
        }
        if image_len < u64::from(self.size) {
            return Err(FsckError::TruncatedImage {
                file_len: image_len,
                fs_size: u64::from(self.size),
            });
        }
        Ok(())
    }

    /// Whether the image extends past the declared filesystem end.
    ///
    /// This is the single non-fatal diagnostic.
    #[must_use]
    pub fn image_oversized(&self, image_len: u64) -> bool {
        image_len > u64::from(self.size)
    }
}
