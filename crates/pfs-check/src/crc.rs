//! The image CRC pass.
//!
//! CRC-32 (zlib polynomial) over `[start, size)` with the stored CRC slot
//! logically zeroed. The image is never mapped writable: chunks stream
//! through a private buffer and only that copy has the slot cleared.

use pfs_block::Image;
use pfs_error::{FsckError, Result};
use pfs_ondisk::Superblock;
use pfs_types::{BLOCK_SIZE, CRC_SLOT_OFFSET};
use tracing::debug;

/// Verify the stored filesystem CRC.
pub fn verify_crc(image: &Image, start: u64, sb: &Superblock) -> Result<()> {
    let end = u64::from(sb.size);
    let mut hasher = crc32fast::Hasher::new();
    let mut chunk = vec![0_u8; BLOCK_SIZE];
    let mut pos = start;

    while pos < end {
        let len = usize::try_from((end - pos).min(BLOCK_SIZE as u64)).unwrap_or(BLOCK_SIZE);
        image.read_exact_at(pos, &mut chunk[..len])?;
        if pos == start {
            // The first chunk holds the superblock; blank the CRC slot in
            // the private copy before accumulating.
            chunk[CRC_SLOT_OFFSET..CRC_SLOT_OFFSET + 4].fill(0);
        }
        hasher.update(&chunk[..len]);
        pos += len as u64;
    }

    let computed = hasher.finalize();
    debug!(target: "pfs::crc", computed, stored = sb.fsid.crc);
    if computed != sb.fsid.crc {
        return Err(FsckError::CrcMismatch);
    }
    Ok(())
}
