//! Per-block decompression for the three on-disk encodings.
//!
//! One `Decompressor` lives for the whole walk: it owns the zlib inflate
//! state (reset before every block, as the reference does) and the output
//! buffer. LZO blocks additionally run the overlap-safety check, rejecting
//! any block a kernel in-place decode would corrupt.

use crate::lzo;
use pfs_error::{FsckError, Result};
use pfs_types::{BLOCK_SIZE, FLAG_LZO_COMPRESSION, FLAG_ZLIB_COMPRESSION, MAX_BLOCK_OVERHEAD};

/// Upper bound on the decompressed size of one block.
pub const MAX_OUT: usize = 2 * BLOCK_SIZE;

/// Block encoding selected by the superblock flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Raw,
    Zlib,
    Lzo,
}

impl Codec {
    /// Select the codec from validated superblock flags.
    ///
    /// Flag validation has already rejected images with both compression
    /// bits set; with neither, blocks are stored raw.
    #[must_use]
    pub fn from_flags(flags: u32) -> Self {
        if flags & FLAG_LZO_COMPRESSION != 0 {
            Self::Lzo
        } else if flags & FLAG_ZLIB_COMPRESSION != 0 {
            Self::Zlib
        } else {
            Self::Raw
        }
    }
}

pub struct Decompressor {
    codec: Codec,
    inflater: flate2::Decompress,
    out: Vec<u8>,
    overlap: Vec<u8>,
}

impl Decompressor {
    #[must_use]
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            inflater: flate2::Decompress::new(true),
            out: vec![0_u8; MAX_OUT],
            overlap: vec![0_u8; MAX_BLOCK_OVERHEAD],
        }
    }

    #[must_use]
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Decode one stored block, returning a view of the decompressed bytes.
    pub fn block(&mut self, src: &[u8]) -> Result<&[u8]> {
        let written = match self.codec {
            Codec::Raw => {
                if src.len() > BLOCK_SIZE {
                    return Err(FsckError::BlockTooLarge);
                }
                self.out[..src.len()].copy_from_slice(src);
                src.len()
            }
            Codec::Zlib => {
                if src.len() > MAX_OUT {
                    return Err(FsckError::BlockTooLarge);
                }
                self.inflater.reset(true);
                let status = self
                    .inflater
                    .decompress(src, &mut self.out, flate2::FlushDecompress::Finish)
                    .map_err(|err| FsckError::DecompressError {
                        detail: err.to_string(),
                    })?;
                if status != flate2::Status::StreamEnd {
                    return Err(FsckError::DecompressError {
                        detail: "stream did not reach its end".into(),
                    });
                }
                usize::try_from(self.inflater.total_out()).unwrap_or(MAX_OUT)
            }
            Codec::Lzo => self.lzo_block(src)?,
        };
        Ok(&self.out[..written])
    }

    /// LZO path: ordinary decode, then the overlap-safety re-decode.
    fn lzo_block(&mut self, src: &[u8]) -> Result<usize> {
        if src.len() > MAX_BLOCK_OVERHEAD {
            return Err(FsckError::BlockTooLarge);
        }

        let written =
            lzo::decompress(src, &mut self.out).map_err(|err| FsckError::DecompressError {
                detail: err.to_string(),
            })?;
        let first_crc = crc32fast::hash(&self.out[..written]);

        // Re-decode in place: input at the tail of a MAX_BLOCK_OVERHEAD
        // scratch buffer, output growing from the front over it. The claimed
        // output length follows the kernel contract: the true length for
        // small inputs, one block otherwise.
        self.overlap.fill(0);
        let tail = MAX_BLOCK_OVERHEAD - src.len();
        self.overlap[tail..].copy_from_slice(src);
        let claimed = if src.len() < BLOCK_SIZE {
            written
        } else {
            BLOCK_SIZE
        };
        let in_place = lzo::decompress_within(&mut self.overlap, tail, src.len(), claimed)
            .map_err(|_| FsckError::LzoOverlapError)?;

        if in_place != written || crc32fast::hash(&self.overlap[..in_place]) != first_crc {
            return Err(FsckError::LzoOverlapError);
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zlib_pack(payload: &[u8]) -> Vec<u8> {
        let mut enc =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(payload).expect("deflate");
        enc.finish().expect("finish")
    }

    fn lzo_literal_pack(payload: &[u8]) -> Vec<u8> {
        let mut stream = Vec::with_capacity(payload.len() + 8);
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

    #[test]
    fn codec_selection_from_flags() {
        assert_eq!(Codec::from_flags(0), Codec::Raw);
        assert_eq!(Codec::from_flags(FLAG_ZLIB_COMPRESSION), Codec::Zlib);
        assert_eq!(Codec::from_flags(FLAG_LZO_COMPRESSION), Codec::Lzo);
    }

    #[test]
    fn raw_block_passes_through() {
        let mut d = Decompressor::new(Codec::Raw);
        let out = d.block(b"stored bytes").expect("raw");
        assert_eq!(out, b"stored bytes");
    }

    #[test]
    fn raw_block_over_one_block_is_too_large() {
        let mut d = Decompressor::new(Codec::Raw);
        let src = vec![0_u8; BLOCK_SIZE + 1];
        assert!(matches!(d.block(&src), Err(FsckError::BlockTooLarge)));
    }

    #[test]
    fn zlib_round_trip_and_reset() {
        let mut d = Decompressor::new(Codec::Zlib);
        let first = zlib_pack(b"first block");
        assert_eq!(d.block(&first).expect("inflate"), b"first block");
        // The state must reset cleanly between blocks.
        let second = zlib_pack(&[0xAB_u8; BLOCK_SIZE]);
        assert_eq!(d.block(&second).expect("inflate"), &[0xAB_u8; BLOCK_SIZE]);
    }

    #[test]
    fn zlib_garbage_is_decompress_error() {
        let mut d = Decompressor::new(Codec::Zlib);
        assert!(matches!(
            d.block(&[0x00, 0x01, 0x02, 0x03]),
            Err(FsckError::DecompressError { .. })
        ));
    }

    #[test]
    fn zlib_truncated_stream_is_decompress_error() {
        let mut d = Decompressor::new(Codec::Zlib);
        let mut packed = zlib_pack(&[0x5C_u8; 512]);
        packed.truncate(packed.len() / 2);
        assert!(matches!(
            d.block(&packed),
            Err(FsckError::DecompressError { .. })
        ));
    }

    #[test]
    fn lzo_round_trip_passes_overlap_check() {
        let mut d = Decompressor::new(Codec::Lzo);
        let payload: Vec<u8> = (0..1000_u32).map(|i| (i % 251) as u8).collect();
        let packed = lzo_literal_pack(&payload);
        assert_eq!(d.block(&packed).expect("lzo"), &payload[..]);
    }

    #[test]
    fn lzo_full_block_passes_overlap_check() {
        // A stored-length input >= BLOCK_SIZE exercises the claimed-length
        // branch of the overlap pass.
        let mut d = Decompressor::new(Codec::Lzo);
        let payload: Vec<u8> = (0..BLOCK_SIZE as u32).map(|i| (i % 249) as u8).collect();
        let packed = lzo_literal_pack(&payload);
        assert!(packed.len() >= BLOCK_SIZE);
        assert!(packed.len() <= MAX_BLOCK_OVERHEAD);
        assert_eq!(d.block(&packed).expect("lzo"), &payload[..]);
    }

    #[test]
    fn lzo_oversized_input_is_too_large() {
        let mut d = Decompressor::new(Codec::Lzo);
        let src = vec![0_u8; MAX_BLOCK_OVERHEAD + 1];
        assert!(matches!(d.block(&src), Err(FsckError::BlockTooLarge)));
    }

    #[test]
    fn lzo_overlap_violation_is_detected() {
        // A stream that decodes fine out of place but claims more output
        // than one block while its stored form is at least a block long:
        // the in-place pass is capped at BLOCK_SIZE and must fail.
        let mut d = Decompressor::new(Codec::Lzo);
        let payload = vec![0x3D_u8; BLOCK_SIZE + 104];
        let packed = lzo_literal_pack(&payload);
        assert!(packed.len() >= BLOCK_SIZE);
        assert!(matches!(
            d.block(&packed),
            Err(FsckError::LzoOverlapError)
        ));
    }
}
