#![forbid(unsafe_code)]
//! Byte access to the image under test.
//!
//! `Image` opens a regular file or block device read-only and exposes
//! positioned reads (`pread` semantics, no shared seek position).
//! `WindowReader` layers the buffered window the tree walker relies on:
//! any read of up to 8 KiB returns one contiguous slice without re-issuing
//! host I/O when the window already covers it.

use pfs_error::{FsckError, Result};
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::Path;
use tracing::trace;

/// Window granularity: reads are served from two 8 KiB-aligned halves.
const WINDOW_BITS: u32 = 13;
/// Guaranteed contiguous view for a single read.
pub const WINDOW_SIZE: usize = 1 << WINDOW_BITS;
const WINDOW_MASK: u64 = (WINDOW_SIZE as u64) - 1;

/// A read-only handle to the image file or block device.
#[derive(Debug)]
pub struct Image {
    file: File,
    len: u64,
    path: String,
}

impl Image {
    /// Open `path` read-only and determine its length.
    ///
    /// Regular files report their stat size; block devices report the
    /// device size via seek-to-end. Anything else is rejected.
    pub fn open(path: &Path) -> Result<Self> {
        let display = path.display().to_string();
        let file = File::open(path)
            .map_err(|err| FsckError::io(format!("open failed: {display}"), err))?;
        let meta = file
            .metadata()
            .map_err(|err| FsckError::io(format!("stat failed: {display}"), err))?;

        let file_type = meta.file_type();
        let len = if file_type.is_file() {
            meta.len()
        } else if file_type.is_block_device() {
            (&file)
                .seek(SeekFrom::End(0))
                .map_err(|err| {
                    FsckError::io(format!("unable to determine device size: {display}"), err)
                })?
        } else {
            return Err(FsckError::InvalidImageType { path: display });
        };

        Ok(Self {
            file,
            len,
            path: display,
        })
    }

    /// Total image length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buf, offset)
            .map_err(|err| FsckError::io(format!("read failed: {}", self.path), err))
    }

    /// Read up to `buf.len()` bytes at `offset`, stopping at end of image.
    ///
    /// Returns the number of bytes read; the remainder of `buf` is left
    /// untouched.
    pub fn read_at_most(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .file
                .read_at(&mut buf[filled..], offset + filled as u64)
                .map_err(|err| FsckError::io(format!("read failed: {}", self.path), err))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

/// Buffered reader guaranteeing access to at least 8 KiB at a time.
///
/// Holds a 16 KiB buffer of two aligned 8 KiB halves keyed by
/// `offset >> 13`, so any read of up to [`WINDOW_SIZE`] bytes is one
/// contiguous slice. Bytes past the image end read as zero; bounds against
/// the declared filesystem size are the walker's concern.
pub struct WindowReader<'a> {
    image: &'a Image,
    buf: Vec<u8>,
    window: Option<u64>,
}

impl<'a> WindowReader<'a> {
    #[must_use]
    pub fn new(image: &'a Image) -> Self {
        Self {
            image,
            buf: vec![0_u8; WINDOW_SIZE * 2],
            window: None,
        }
    }

    /// Borrow `len` contiguous bytes starting at `offset`.
    ///
    /// `len` must not exceed [`WINDOW_SIZE`].
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<&[u8]> {
        debug_assert!(len <= WINDOW_SIZE, "window read of {len} bytes");

        let window = offset >> WINDOW_BITS;
        if self.window != Some(window) {
            let base = window << WINDOW_BITS;
            self.buf.fill(0);
            let filled = self.image.read_at_most(base, &mut self.buf)?;
            trace!(
                target: "pfs::block",
                event = "window_fill",
                base = base,
                filled = filled
            );
            self.window = Some(window);
        }

        let start = (offset & WINDOW_MASK) as usize;
        Ok(&self.buf[start..start + len])
    }

    /// Read one little-endian u32 at `offset` (block pointer tables).
    pub fn read_u32_at(&mut self, offset: u64) -> Result<u32> {
        let bytes = self.read_at(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn image_with(bytes: &[u8]) -> (NamedTempFile, Image) {
        let mut tmp = NamedTempFile::new().expect("tempfile");
        tmp.write_all(bytes).expect("write");
        tmp.flush().expect("flush");
        let image = Image::open(tmp.path()).expect("open");
        (tmp, image)
    }

    #[test]
    fn open_reports_length() {
        let (_tmp, image) = image_with(&[0xAA_u8; 100]);
        assert_eq!(image.len(), 100);
        assert!(!image.is_empty());
    }

    #[test]
    fn open_missing_file_is_io_error() {
        let err = Image::open(Path::new("/nonexistent/polyfs.img")).unwrap_err();
        assert!(matches!(err, FsckError::Io { .. }));
        assert!(err.to_string().starts_with("open failed:"));
    }

    #[test]
    fn read_exact_at_positions() {
        let data: Vec<u8> = (0..=255).collect();
        let (_tmp, image) = image_with(&data);
        let mut buf = [0_u8; 4];
        image.read_exact_at(10, &mut buf).expect("read");
        assert_eq!(buf, [10, 11, 12, 13]);
    }

    #[test]
    fn read_at_most_stops_at_eof() {
        let (_tmp, image) = image_with(&[1_u8, 2, 3]);
        let mut buf = [0xFF_u8; 8];
        let n = image.read_at_most(1, &mut buf).expect("read");
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], &[2, 3]);
        assert_eq!(buf[2], 0xFF);
    }

    #[test]
    fn window_serves_contiguous_views() {
        let mut data = vec![0_u8; WINDOW_SIZE * 3];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let (_tmp, image) = image_with(&data);
        let mut reader = WindowReader::new(&image);

        // A read straddling the first 8 KiB boundary stays contiguous.
        let straddle = reader
            .read_at(WINDOW_SIZE as u64 - 100, 200)
            .expect("read")
            .to_vec();
        assert_eq!(straddle, data[WINDOW_SIZE - 100..WINDOW_SIZE + 100]);

        // A later window still resolves correctly.
        let far = reader
            .read_at(2 * WINDOW_SIZE as u64 + 17, 64)
            .expect("read")
            .to_vec();
        assert_eq!(far, data[2 * WINDOW_SIZE + 17..2 * WINDOW_SIZE + 17 + 64]);
    }

    #[test]
    fn window_zero_fills_past_eof() {
        let (_tmp, image) = image_with(&[7_u8; 10]);
        let mut reader = WindowReader::new(&image);
        let view = reader.read_at(4, 16).expect("read");
        assert_eq!(&view[..6], &[7_u8; 6]);
        assert_eq!(&view[6..], &[0_u8; 10]);
    }

    #[test]
    fn read_u32_at_is_little_endian() {
        let (_tmp, image) = image_with(&[0x78, 0x56, 0x34, 0x12, 0xFF]);
        let mut reader = WindowReader::new(&image);
        assert_eq!(reader.read_u32_at(0).expect("read"), 0x1234_5678);
    }
}
