#![forbid(unsafe_code)]
//! Test-support builder for polyfs images.
//!
//! `ImageBuilder` produces byte-exact valid images in memory — directory
//! region laid out breadth-first behind the superblock, per-file pointer
//! tables and payloads behind it, correct CRC in the slot — plus targeted
//! corruption helpers for the negative tests. Test tooling only; the
//! checker itself never writes an image.

use pfs_types::{
    BLOCK_SIZE, CRC_SLOT_OFFSET, FLAG_FSID_VERSION_1, FLAG_LZO_COMPRESSION,
    FLAG_ZLIB_COMPRESSION, INODE_SIZE, PAD_SIZE, POLYFS_MAGIC, S_IFBLK, S_IFCHR, S_IFDIR,
    S_IFIFO, S_IFLNK, S_IFREG, S_IFSOCK, SUPER_SIZE, dev_pack,
};
use std::collections::VecDeque;
use std::io::Write;

/// Block encoding for the built image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zlib,
    Lzo,
}

impl Compression {
    fn flag(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Zlib => FLAG_ZLIB_COMPRESSION,
            Self::Lzo => FLAG_LZO_COMPRESSION,
        }
    }
}

/// Regular-file content: plain bytes (compressed by the builder, all-zero
/// blocks stored as holes) or a single pre-compressed block written
/// verbatim for decoder-level negative tests.
#[derive(Debug, Clone)]
pub enum FileData {
    Bytes(Vec<u8>),
    PreCompressed { size: u32, block: Vec<u8> },
}

/// One node of the tree to build.
#[derive(Debug, Clone)]
pub enum NodeSpec {
    Dir(DirSpec),
    File {
        mode: u16,
        uid: u16,
        gid: u8,
        data: FileData,
    },
    Symlink {
        uid: u16,
        gid: u8,
        target: Vec<u8>,
    },
    Char {
        perm: u16,
        major: u32,
        minor: u32,
    },
    Block {
        perm: u16,
        major: u32,
        minor: u32,
    },
    Fifo {
        perm: u16,
    },
    Socket {
        perm: u16,
    },
}

impl NodeSpec {
    #[must_use]
    pub fn file(perm: u16, content: &[u8]) -> Self {
        Self::File {
            mode: S_IFREG | perm,
            uid: 0,
            gid: 0,
            data: FileData::Bytes(content.to_vec()),
        }
    }

    #[must_use]
    pub fn symlink(target: &[u8]) -> Self {
        Self::Symlink {
            uid: 0,
            gid: 0,
            target: target.to_vec(),
        }
    }
}

/// A directory and its entries, in on-disk order.
#[derive(Debug, Clone)]
pub struct DirSpec {
    pub mode: u16,
    pub uid: u16,
    pub gid: u8,
    entries: Vec<(String, NodeSpec)>,
}

impl DirSpec {
    #[must_use]
    pub fn new(perm: u16) -> Self {
        Self {
            mode: S_IFDIR | perm,
            uid: 0,
            gid: 0,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, name: &str, node: NodeSpec) -> &mut Self {
        assert!(!name.is_empty(), "entry names cannot be empty");
        assert!(name.len() <= 63 * 4, "entry name too long for the format");
        self.entries.push((name.to_string(), node));
        self
    }
}

pub struct ImageBuilder {
    compression: Compression,
    pad: bool,
    edition: u32,
    root: DirSpec,
}

/// A finished image plus the offsets the negative tests need.
pub struct BuiltImage {
    pub bytes: Vec<u8>,
    /// Superblock offset: 0 or `PAD_SIZE`.
    pub start: usize,
    /// End of the directory region == start of the data region.
    pub dir_end: usize,
}

impl BuiltImage {
    /// Recompute and store the CRC slot, for images patched after build.
    pub fn recompute_crc(&mut self) {
        let slot = self.start + CRC_SLOT_OFFSET;
        self.bytes[slot..slot + 4].fill(0);
        let crc = crc32fast::hash(&self.bytes[self.start..]);
        self.bytes[slot..slot + 4].copy_from_slice(&crc.to_le_bytes());
    }

    /// Overwrite bytes at `at`, without touching the CRC.
    pub fn patch(&mut self, at: usize, with: &[u8]) {
        self.bytes[at..at + with.len()].copy_from_slice(with);
    }

    /// Destroy the superblock magic.
    pub fn zero_magic(&mut self) {
        self.bytes[self.start..self.start + 4].fill(0);
    }

    /// Flip one byte in the data region (the CRC pass must notice).
    pub fn flip_data_byte(&mut self) {
        self.bytes[self.dir_end] ^= 0xFF;
    }

    /// Byte offset of the root directory's first child inode record.
    #[must_use]
    pub fn first_child_inode(&self) -> usize {
        self.start + SUPER_SIZE
    }

    /// Write the image to a temp file for checker runs.
    pub fn write_temp(&self) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp image");
        tmp.write_all(&self.bytes).expect("write temp image");
        tmp.flush().expect("flush temp image");
        tmp
    }
}

// ── Flattened tree ──────────────────────────────────────────────────────────

#[derive(Debug)]
enum Payload {
    Dir,
    FileBytes(Vec<u8>),
    FilePre { size: u32, block: Vec<u8> },
    Symlink(Vec<u8>),
    None,
}

#[derive(Debug)]
struct FlatNode {
    mode: u16,
    uid: u16,
    gid: u8,
    size: u32,
    offset: u64,
    payload: Payload,
    children: Vec<(String, usize)>,
}

fn flatten(spec: NodeSpec, arena: &mut Vec<FlatNode>) -> usize {
    let node = match spec {
        NodeSpec::Dir(dir) => return flatten_dir(dir, arena),
        NodeSpec::File {
            mode,
            uid,
            gid,
            data,
        } => {
            let payload = match data {
                FileData::Bytes(bytes) => Payload::FileBytes(bytes),
                FileData::PreCompressed { size, block } => Payload::FilePre { size, block },
            };
            FlatNode {
                mode,
                uid,
                gid,
                size: 0,
                offset: 0,
                payload,
                children: Vec::new(),
            }
        }
        NodeSpec::Symlink { uid, gid, target } => FlatNode {
            mode: S_IFLNK | 0o777,
            uid,
            gid,
            size: 0,
            offset: 0,
            payload: Payload::Symlink(target),
            children: Vec::new(),
        },
        NodeSpec::Char { perm, major, minor } => FlatNode {
            mode: S_IFCHR | perm,
            uid: 0,
            gid: 0,
            size: dev_pack(major, minor),
            offset: 0,
            payload: Payload::None,
            children: Vec::new(),
        },
        NodeSpec::Block { perm, major, minor } => FlatNode {
            mode: S_IFBLK | perm,
            uid: 0,
            gid: 0,
            size: dev_pack(major, minor),
            offset: 0,
            payload: Payload::None,
            children: Vec::new(),
        },
        NodeSpec::Fifo { perm } => FlatNode {
            mode: S_IFIFO | perm,
            uid: 0,
            gid: 0,
            size: 0,
            offset: 0,
            payload: Payload::None,
            children: Vec::new(),
        },
        NodeSpec::Socket { perm } => FlatNode {
            mode: S_IFSOCK | perm,
            uid: 0,
            gid: 0,
            size: 0,
            offset: 0,
            payload: Payload::None,
            children: Vec::new(),
        },
    };
    arena.push(node);
    arena.len() - 1
}

fn flatten_dir(dir: DirSpec, arena: &mut Vec<FlatNode>) -> usize {
    let idx = arena.len();
    arena.push(FlatNode {
        mode: dir.mode,
        uid: dir.uid,
        gid: dir.gid,
        size: 0,
        offset: 0,
        payload: Payload::Dir,
        children: Vec::new(),
    });
    let mut children = Vec::with_capacity(dir.entries.len());
    for (name, node) in dir.entries {
        let child = flatten(node, arena);
        children.push((name, child));
    }
    arena[idx].children = children;
    idx
}

fn padded_name_len(name: &str) -> usize {
    name.len().next_multiple_of(4)
}

fn align4(value: u64) -> u64 {
    value.next_multiple_of(4)
}

impl ImageBuilder {
    #[must_use]
    pub fn new(compression: Compression) -> Self {
        Self {
            compression,
            pad: false,
            edition: 0,
            root: DirSpec::new(0o755),
        }
    }

    /// Place the superblock at `PAD_SIZE`, as for bootloader-prefixed
    /// images.
    #[must_use]
    pub fn padded(mut self) -> Self {
        self.pad = true;
        self
    }

    #[must_use]
    pub fn edition(mut self, edition: u32) -> Self {
        self.edition = edition;
        self
    }

    #[must_use]
    pub fn root(mut self, root: DirSpec) -> Self {
        self.root = root;
        self
    }

    pub fn build(self) -> BuiltImage {
        let start = if self.pad { PAD_SIZE } else { 0 };
        let compression = self.compression;

        let mut arena = Vec::new();
        let root_idx = flatten_dir(self.root, &mut arena);

        // Directory region: breadth-first, root's entries right behind the
        // superblock. The root keeps a real offset even when empty; other
        // empty directories store zero.
        let mut cur = (start + SUPER_SIZE) as u64;
        let mut dir_order = Vec::new();
        let mut queue = VecDeque::from([root_idx]);
        while let Some(idx) = queue.pop_front() {
            dir_order.push(idx);
            let blob: u64 = arena[idx]
                .children
                .iter()
                .map(|(name, _)| (INODE_SIZE + padded_name_len(name)) as u64)
                .sum();
            arena[idx].size = u32::try_from(blob).expect("directory region too large");
            arena[idx].offset = if blob > 0 || idx == root_idx { cur } else { 0 };
            cur += blob;

            let children: Vec<usize> = arena[idx].children.iter().map(|&(_, c)| c).collect();
            for child in children {
                if matches!(arena[child].payload, Payload::Dir) {
                    queue.push_back(child);
                }
            }
        }
        let dir_end = cur;

        // Data region: per-file pointer tables and payloads, then symlink
        // blocks, in the same traversal order.
        let mut data_blobs: Vec<(u64, Vec<u8>)> = Vec::new();
        for &dir in &dir_order {
            let children: Vec<usize> = arena[dir].children.iter().map(|&(_, c)| c).collect();
            for idx in children {
                match std::mem::replace(&mut arena[idx].payload, Payload::None) {
                    Payload::FileBytes(content) => {
                        arena[idx].size =
                            u32::try_from(content.len()).expect("file too large for the format");
                        if content.is_empty() {
                            continue;
                        }
                        cur = align4(cur);
                        let table_pos = cur;
                        let nblocks = content.len().div_ceil(BLOCK_SIZE);
                        let mut payload_pos = table_pos + (4 * nblocks) as u64;
                        let mut table = Vec::with_capacity(nblocks * 4);
                        let mut payload = Vec::new();
                        for chunk in content.chunks(BLOCK_SIZE) {
                            if chunk.iter().all(|&b| b == 0) {
                                // Hole: the pointer repeats the running end.
                            } else {
                                let packed = compress_chunk(compression, chunk);
                                payload_pos += packed.len() as u64;
                                payload.extend_from_slice(&packed);
                            }
                            let end = u32::try_from(payload_pos).expect("image too large");
                            table.extend_from_slice(&end.to_le_bytes());
                        }
                        table.extend_from_slice(&payload);
                        arena[idx].offset = table_pos;
                        data_blobs.push((table_pos, table));
                        cur = payload_pos;
                    }
                    Payload::FilePre { size, block } => {
                        assert!(
                            size as usize <= BLOCK_SIZE,
                            "pre-compressed data is limited to one block"
                        );
                        arena[idx].size = size;
                        cur = align4(cur);
                        let table_pos = cur;
                        let end = table_pos + 4 + block.len() as u64;
                        let mut blob = u32::try_from(end)
                            .expect("image too large")
                            .to_le_bytes()
                            .to_vec();
                        blob.extend_from_slice(&block);
                        arena[idx].offset = table_pos;
                        data_blobs.push((table_pos, blob));
                        cur = end;
                    }
                    Payload::Symlink(target) => {
                        arena[idx].size =
                            u32::try_from(target.len()).expect("symlink target too large");
                        cur = align4(cur);
                        let packed = compress_chunk(compression, &target);
                        let end = cur + 4 + packed.len() as u64;
                        let mut blob = u32::try_from(end)
                            .expect("image too large")
                            .to_le_bytes()
                            .to_vec();
                        blob.extend_from_slice(&packed);
                        arena[idx].offset = cur;
                        data_blobs.push((cur, blob));
                        cur = end;
                    }
                    other => {
                        arena[idx].payload = other;
                    }
                }
            }
        }

        // Pad to a block multiple; the size field is the absolute image end.
        let total = cur
            .max((start + SUPER_SIZE) as u64)
            .next_multiple_of(BLOCK_SIZE as u64)
            .max(BLOCK_SIZE as u64) as usize;
        let mut bytes = vec![0_u8; total];

        // Superblock and embedded root inode.
        let flags = FLAG_FSID_VERSION_1 | compression.flag();
        bytes[start..start + 4].copy_from_slice(&POLYFS_MAGIC.to_le_bytes());
        bytes[start + 4..start + 8].copy_from_slice(&(total as u32).to_le_bytes());
        bytes[start + 8..start + 12].copy_from_slice(&flags.to_le_bytes());
        bytes[start + 20..start + 24].copy_from_slice(&self.edition.to_le_bytes());
        let blocks = (total / BLOCK_SIZE) as u32;
        bytes[start + 24..start + 28].copy_from_slice(&blocks.to_le_bytes());
        let files = arena.len() as u32;
        bytes[start + 28..start + 32].copy_from_slice(&files.to_le_bytes());
        write_inode(&mut bytes, start + 0x20, &arena[root_idx], 0);

        // Directory entry records.
        for &dir in &dir_order {
            let mut at = arena[dir].offset as usize;
            if at == 0 {
                continue;
            }
            let children = std::mem::take(&mut arena[dir].children);
            for (name, child) in &children {
                let namelen = (padded_name_len(name) / 4) as u32;
                write_inode(&mut bytes, at, &arena[*child], namelen);
                at += INODE_SIZE;
                bytes[at..at + name.len()].copy_from_slice(name.as_bytes());
                at += padded_name_len(name);
            }
            arena[dir].children = children;
        }

        // Data region.
        for (offset, blob) in data_blobs {
            let at = offset as usize;
            bytes[at..at + blob.len()].copy_from_slice(&blob);
        }

        let mut built = BuiltImage {
            bytes,
            start,
            dir_end: dir_end as usize,
        };
        built.recompute_crc();
        built
    }
}

fn write_inode(buf: &mut [u8], at: usize, node: &FlatNode, namelen: u32) {
    buf[at..at + 2].copy_from_slice(&node.mode.to_le_bytes());
    buf[at + 2..at + 4].copy_from_slice(&node.uid.to_le_bytes());
    buf[at + 4..at + 7].copy_from_slice(&node.size.to_le_bytes()[..3]);
    buf[at + 7] = node.gid;
    assert_eq!(node.offset % 4, 0, "content offsets must be 4-byte aligned");
    let units = u32::try_from(node.offset / 4).expect("offset overflow");
    assert!(units < (1 << 26), "offset does not fit 26 bits");
    assert!(namelen < (1 << 6), "name length does not fit 6 bits");
    let word = (units << 6) | namelen;
    buf[at + 8..at + 12].copy_from_slice(&word.to_le_bytes());
}

fn compress_chunk(compression: Compression, chunk: &[u8]) -> Vec<u8> {
    match compression {
        Compression::None => chunk.to_vec(),
        Compression::Zlib => {
            let mut enc =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(chunk).expect("deflate chunk");
            enc.finish().expect("finish deflate")
        }
        Compression::Lzo => lzo_literal_stream(chunk),
    }
}

/// Encode `payload` as a literal-only LZO1X stream.
///
/// Always valid and always overlap-safe, which is exactly what the good
/// images need; crafted non-literal streams come from the tests directly.
#[must_use]
pub fn lzo_literal_stream(payload: &[u8]) -> Vec<u8> {
    assert!(!payload.is_empty(), "LZO blocks are never empty");
    let mut stream = Vec::with_capacity(payload.len() + 20);
    if payload.len() <= 238 {
        stream.push(17 + payload.len() as u8);
    } else {
        let rem = payload.len() - 18;
        let (zeros, last) = if rem % 255 == 0 {
            (rem / 255 - 1, 255)
        } else {
            (rem / 255, rem % 255)
        };
        stream.push(0x00);
        stream.extend(std::iter::repeat(0x00).take(zeros));
        stream.push(last as u8);
    }
    stream.extend_from_slice(payload);
    stream.extend_from_slice(&[0x11, 0x00, 0x00]);
    stream
}
