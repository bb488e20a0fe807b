//! Recursive descent over the directory tree.
//!
//! The walker validates structural invariants per inode kind, decodes every
//! content block, and drives the extraction sink. The four region
//! watermarks travel in a context value owned by the walker rather than as
//! globals; their final cross-checks run after the tree is done.

use crate::decompress::{Codec, Decompressor, MAX_OUT};
use crate::extract::Sink;
use pfs_block::{Image, WindowReader};
use pfs_error::{FsckError, Result};
use pfs_ondisk::{FileKind, Inode, Superblock};
use pfs_types::{
    BLOCK_SIZE, FLAG_SHIFTED_ROOT_OFFSET, INODE_SIZE, PAD_SIZE, S_IFMT, SUPER_SIZE, dev_major,
    dev_minor,
};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::debug;

const ZERO_BLOCK: [u8; BLOCK_SIZE] = [0_u8; BLOCK_SIZE];

/// Sentinel for a watermark no inode has touched yet.
const UNSET: u64 = u64::MAX;

/// The four layout watermarks.
///
/// Invariant while walking: `super end <= start_dir <= end_dir` and
/// `start_data <= end_data`; the boundary equalities are checked in
/// [`Regions::finish`] once the walk completes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Regions {
    start_dir: u64,
    end_dir: u64,
    start_data: u64,
    end_data: u64,
}

impl Regions {
    fn new() -> Self {
        Self {
            start_dir: UNSET,
            end_dir: 0,
            start_data: UNSET,
            end_data: 0,
        }
    }

    /// Global layout checks after the walk.
    fn finish(&self, start: u64, fs_size: u64) -> Result<()> {
        if self.start_data != UNSET {
            let min = start + SUPER_SIZE as u64;
            if self.start_data < min {
                return Err(FsckError::DataBeforeSuper {
                    start_data: self.start_data,
                    min,
                });
            }
            if self.end_dir != self.start_data {
                return Err(FsckError::DirDataGap {
                    end_dir: self.end_dir,
                    start_data: self.start_data,
                });
            }
        }
        if self.end_data > fs_size {
            return Err(FsckError::DataPastEnd);
        }
        Ok(())
    }
}

pub struct Walker<'a> {
    reader: WindowReader<'a>,
    sb: Superblock,
    start: u64,
    decomp: Decompressor,
    regions: Regions,
    sink: &'a mut dyn Sink,
    verbosity: u8,
}

impl<'a> Walker<'a> {
    #[must_use]
    pub fn new(
        image: &'a Image,
        sb: Superblock,
        start: u64,
        sink: &'a mut dyn Sink,
        verbosity: u8,
    ) -> Self {
        Self {
            reader: WindowReader::new(image),
            sb,
            start,
            decomp: Decompressor::new(Codec::from_flags(sb.flags)),
            regions: Regions::new(),
            sink,
            verbosity,
        }
    }

    /// Walk the whole tree from the root inode and run the final region
    /// checks.
    pub fn run(mut self, root_path: &Path) -> Result<()> {
        let root = self.sb.root;
        if root.kind() != FileKind::Dir {
            return Err(FsckError::RootNotDirectory);
        }
        let root_offset = root.byte_offset();
        if self.sb.flags & FLAG_SHIFTED_ROOT_OFFSET == 0
            && root_offset != SUPER_SIZE as u64
            && root_offset != (PAD_SIZE + SUPER_SIZE) as u64
        {
            return Err(FsckError::BadRootOffset {
                offset: root_offset,
            });
        }

        self.walk(&root, root_path)?;
        debug!(
            target: "pfs::walk",
            event = "walk_done",
            start_dir = self.regions.start_dir,
            end_dir = self.regions.end_dir,
            start_data = self.regions.start_data,
            end_data = self.regions.end_data,
        );
        self.regions.finish(self.start, u64::from(self.sb.size))
    }

    fn walk(&mut self, inode: &Inode, path: &Path) -> Result<()> {
        match inode.kind() {
            FileKind::Dir => self.walk_dir(inode, path),
            FileKind::File => self.walk_file(inode, path),
            FileKind::Symlink => self.walk_symlink(inode, path),
            _ => self.walk_special(inode, path),
        }
    }

    fn walk_dir(&mut self, inode: &Inode, path: &Path) -> Result<()> {
        let offset = inode.byte_offset();
        if offset == 0 && inode.size != 0 {
            return Err(FsckError::BadDirInode {
                path: path.display().to_string(),
            });
        }
        if offset != 0 && offset < self.regions.start_dir {
            self.regions.start_dir = offset;
        }
        if self.verbosity > 0 {
            self.print_node(inode, &path.display().to_string());
        }
        self.sink.mkdir(path, inode.mode)?;
        self.sink.apply_metadata(path, inode)?;

        let mut cursor = offset;
        let mut remaining = i64::from(inode.size);
        while remaining > 0 {
            let child = Inode::parse(self.reader.read_at(cursor, INODE_SIZE)?)?;
            cursor += INODE_SIZE as u64;

            let declared = child.name_bytes();
            if declared == 0 {
                return Err(FsckError::EmptyName);
            }
            let name = self.reader.read_at(cursor, declared)?.to_vec();
            let name_len = name.iter().position(|&b| b == 0).unwrap_or(declared);
            if declared - name_len > 3 {
                return Err(FsckError::BadNameLength);
            }

            let child_path = path.join(OsStr::from_bytes(&name[..name_len]));
            self.walk(&child, &child_path)?;

            cursor += declared as u64;
            if cursor <= self.regions.start_dir {
                return Err(FsckError::BadChildOffset);
            }
            if cursor > self.regions.end_dir {
                self.regions.end_dir = cursor;
            }
            remaining -= (INODE_SIZE + declared) as i64;
        }
        Ok(())
    }

    fn walk_file(&mut self, inode: &Inode, path: &Path) -> Result<()> {
        let offset = inode.byte_offset();
        if offset == 0 && inode.size != 0 {
            return Err(FsckError::FileInodeInconsistent {
                detail: "zero offset and non-zero size",
            });
        }
        if inode.size == 0 && offset != 0 {
            return Err(FsckError::FileInodeInconsistent {
                detail: "zero size and non-zero offset",
            });
        }
        if offset != 0 && offset < self.regions.start_data {
            self.regions.start_data = offset;
        }
        if self.verbosity > 0 {
            self.print_node(inode, &path.display().to_string());
        }
        self.sink.begin_file(path, inode.mode)?;
        if inode.size != 0 {
            self.stream_file_blocks(offset, u64::from(inode.size))?;
        }
        self.sink.end_file()?;
        self.sink.apply_metadata(path, inode)
    }

    /// Decode a regular file's pointer table and payload blocks.
    ///
    /// Each table entry names the end of its block's stored bytes; the
    /// start is the previous entry (the table end for block zero). Equal
    /// consecutive pointers mark a hole.
    fn stream_file_blocks(&mut self, offset: u64, size: u64) -> Result<()> {
        const BS: u64 = BLOCK_SIZE as u64;
        let nblocks = size.div_ceil(BS);
        let mut ptr_pos = offset;
        let mut cur = offset + 4 * nblocks;
        let mut remaining = size;

        for _ in 0..nblocks {
            let next = u64::from(self.reader.read_u32_at(ptr_pos)?);
            ptr_pos += 4;
            if next > self.regions.end_data {
                self.regions.end_data = next;
            }

            let expected = remaining.min(BS);
            if cur == next {
                if self.verbosity > 1 {
                    println!("  hole at {cur} ({expected})");
                }
                self.sink.file_data(&ZERO_BLOCK[..expected as usize])?;
            } else {
                let len = next.checked_sub(cur).ok_or(FsckError::BlockTooLarge)?;
                if len > MAX_OUT as u64 {
                    return Err(FsckError::BlockTooLarge);
                }
                if self.verbosity > 1 {
                    println!("  uncompressing block at {cur} to {next} ({len})");
                }
                let src = self.reader.read_at(cur, len as usize)?;
                let out = self.decomp.block(src)?;
                if out.len() as u64 != expected {
                    return Err(FsckError::BlockSizeMismatch {
                        actual: out.len() as u64,
                        expected,
                    });
                }
                self.sink.file_data(out)?;
            }
            remaining -= expected;
            cur = next;
        }
        Ok(())
    }

    fn walk_symlink(&mut self, inode: &Inode, path: &Path) -> Result<()> {
        let offset = inode.byte_offset();
        if offset == 0 {
            return Err(FsckError::SymlinkZeroOffset);
        }
        if inode.size == 0 {
            return Err(FsckError::SymlinkZeroSize);
        }
        if offset < self.regions.start_data {
            self.regions.start_data = offset;
        }

        let next = u64::from(self.reader.read_u32_at(offset)?);
        if next > self.regions.end_data {
            self.regions.end_data = next;
        }
        let payload = offset + 4;
        let len = next.checked_sub(payload).ok_or(FsckError::BlockTooLarge)?;
        if len > MAX_OUT as u64 {
            return Err(FsckError::BlockTooLarge);
        }
        let src = self.reader.read_at(payload, len as usize)?;
        let target = self.decomp.block(src)?.to_vec();
        if target.len() as u64 != u64::from(inode.size) {
            return Err(FsckError::SymlinkSizeMismatch {
                path: path.display().to_string(),
            });
        }

        if self.verbosity > 0 {
            let shown = format!("{} -> {}", path.display(), String::from_utf8_lossy(&target));
            self.print_node(inode, &shown);
            if self.verbosity > 1 {
                println!("  uncompressing block at {payload} to {next} ({len})");
            }
        }
        self.sink.symlink(OsStr::from_bytes(&target), path)?;
        self.sink.apply_metadata(path, inode)
    }

    fn walk_special(&mut self, inode: &Inode, path: &Path) -> Result<()> {
        if inode.offset != 0 {
            return Err(FsckError::SpecialHasOffset {
                path: path.display().to_string(),
            });
        }
        match inode.kind() {
            FileKind::Fifo if inode.size != 0 => {
                return Err(FsckError::FifoHasSize {
                    path: path.display().to_string(),
                });
            }
            FileKind::Socket if inode.size != 0 => {
                return Err(FsckError::SocketHasSize {
                    path: path.display().to_string(),
                });
            }
            FileKind::CharDev | FileKind::BlockDev | FileKind::Fifo | FileKind::Socket => {}
            _ => {
                return Err(FsckError::BogusMode {
                    path: path.display().to_string(),
                    mode: inode.mode,
                });
            }
        }
        if self.verbosity > 0 {
            self.print_node(inode, &path.display().to_string());
        }
        self.sink.mknod(path, inode)?;
        self.sink.apply_metadata(path, inode)
    }

    /// One listing line: `<type> <mode> <info> <uid>:<gid> <name>`.
    fn print_node(&self, inode: &Inode, name: &str) {
        let kind = inode.kind();
        let info = match kind {
            FileKind::CharDev | FileKind::BlockDev => {
                format!("{:4},{:4}", dev_major(inode.size), dev_minor(inode.size))
            }
            _ => format!("{:9}", inode.size),
        };
        println!(
            "{} {:04o} {} {:5}:{:<3} {}",
            kind.tag(),
            inode.mode & !S_IFMT,
            info,
            inode.uid,
            inode.gid,
            name
        );
    }
}
