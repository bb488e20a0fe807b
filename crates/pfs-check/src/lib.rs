#![forbid(unsafe_code)]
//! polyfs image validation and extraction.
//!
//! The full pass over an image: superblock discovery and validation, the
//! CRC sweep, then the recursive tree walk that checks every structural
//! invariant and decodes every content block. With an extraction directory
//! configured, the walk also materializes the tree on the host filesystem.

pub mod crc;
pub mod decompress;
pub mod extract;
mod lzo;
pub mod walk;

use pfs_block::Image;
use pfs_error::{FsckError, Result};
use pfs_ondisk::Superblock;
use pfs_types::{PAD_SIZE, SUPER_SIZE};
use std::path::{Path, PathBuf};
use tracing::debug;

pub use crate::decompress::{Codec, Decompressor};
pub use crate::extract::{HostSink, NullSink, Sink};
pub use crate::walk::Walker;

/// What a check run should do beyond validating.
#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    /// 0 = silent, 1 = list inodes, 2+ = add per-block traces.
    pub verbosity: u8,
    /// Extract the tree into this directory as well.
    pub extract: Option<PathBuf>,
}

/// Find the superblock at offset 0 or at the pad offset.
pub fn locate_superblock(image: &Image) -> Result<(u64, Superblock)> {
    let mut raw = [0_u8; SUPER_SIZE];
    image.read_exact_at(0, &mut raw)?;
    if Superblock::magic_matches(&raw) {
        return Ok((0, Superblock::parse(&raw)?));
    }

    if image.len() >= (PAD_SIZE + SUPER_SIZE) as u64 {
        image.read_exact_at(PAD_SIZE as u64, &mut raw)?;
        if Superblock::magic_matches(&raw) {
            return Ok((PAD_SIZE as u64, Superblock::parse(&raw)?));
        }
    }

    Err(FsckError::BadMagic)
}

/// Run the complete check: locate, validate, CRC, walk, and optionally
/// extract. The only non-fatal diagnostic (an image longer than the
/// filesystem) goes to stderr; everything else aborts with an error.
pub fn run(path: &Path, opts: &CheckOptions) -> Result<()> {
    let image = Image::open(path)?;
    if image.len() < SUPER_SIZE as u64 {
        return Err(FsckError::ImageTooSmall);
    }

    let (start, sb) = locate_superblock(&image)?;
    debug!(
        target: "pfs::check",
        event = "superblock",
        start = start,
        size = sb.size,
        flags = sb.flags,
        files = sb.fsid.files,
    );
    sb.validate(image.len())?;
    if sb.image_oversized(image.len()) {
        eprintln!("warning: file extends past end of filesystem");
    }

    crc::verify_crc(&image, start, &sb)?;

    let mut host;
    let mut null;
    let sink: &mut dyn Sink = match &opts.extract {
        Some(_) => {
            host = HostSink::new();
            &mut host
        }
        None => {
            null = NullSink;
            &mut null
        }
    };
    let root_path = opts
        .extract
        .clone()
        .unwrap_or_else(|| PathBuf::from("/"));

    Walker::new(&image, sb, start, sink, opts.verbosity).run(&root_path)
}
