//! Native LZO1X safe decoder.
//!
//! The kernel driver decodes LZO blocks in place, input at the tail of the
//! output buffer, so the validator must decode with input and output ranges
//! that may alias. No slice-based decoder API can express that, so the
//! engine here works over a single buffer with index-based input and output
//! windows: the ordinary pass keeps them disjoint, the overlap pass lets
//! them collide exactly as the kernel would.
//!
//! Instruction encoding follows the LZO1X stream format: an optional long
//! initial literal run, then matches M1 (2-3 bytes, short distance),
//! M2 (3-8 bytes), M3 (16 KiB window), M4 (48 KiB window, doubles as the
//! end-of-stream marker), each optionally followed by up to three trailing
//! literals encoded in the low bits of the instruction.

use std::fmt;

/// Distance base for the M1 match following a literal run.
const M2_MAX_OFFSET: usize = 0x0800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LzoError {
    InputOverrun,
    OutputOverrun,
    LookbehindOverrun,
    EofNotFound,
    InputNotConsumed,
}

impl fmt::Display for LzoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InputOverrun => write!(f, "input overrun"),
            Self::OutputOverrun => write!(f, "output overrun"),
            Self::LookbehindOverrun => write!(f, "lookbehind overrun"),
            Self::EofNotFound => write!(f, "end-of-stream marker not found"),
            Self::InputNotConsumed => write!(f, "trailing bytes after end-of-stream marker"),
        }
    }
}

/// Decompress `src` into `out`, returning the decompressed length.
pub(crate) fn decompress(src: &[u8], out: &mut [u8]) -> Result<usize, LzoError> {
    let out_cap = out.len();
    let mut work = vec![0_u8; out_cap + src.len()];
    work[out_cap..].copy_from_slice(src);
    let written = decompress_within(&mut work, out_cap, src.len(), out_cap)?;
    out[..written].copy_from_slice(&work[..written]);
    Ok(written)
}

/// Decompress within one buffer: input at `[ip_start, ip_start + ip_len)`,
/// output written from index 0 up to at most `op_limit`.
///
/// The windows may overlap; a write that clobbers not-yet-consumed input
/// corrupts the stream exactly as an in-place kernel decode would, which is
/// what the overlap-safety check observes.
pub(crate) fn decompress_within(
    buf: &mut [u8],
    ip_start: usize,
    ip_len: usize,
    op_limit: usize,
) -> Result<usize, LzoError> {
    let ip_end = ip_start + ip_len;
    debug_assert!(ip_end <= buf.len());
    debug_assert!(op_limit <= buf.len());

    let mut ip = ip_start;
    let mut op = 0_usize;
    let op_end = op_limit;

    // Number of literals the previous instruction produced: 0 = none,
    // 1-3 = short trailing copy, 4 = a full literal run. Decides what an
    // instruction byte below 16 means.
    let mut state = 0_usize;

    if ip >= ip_end {
        return Err(LzoError::InputOverrun);
    }

    if buf[ip] > 17 {
        let t = usize::from(buf[ip]) - 17;
        ip += 1;
        if t > ip_end - ip {
            return Err(LzoError::InputOverrun);
        }
        if t > op_end - op {
            return Err(LzoError::OutputOverrun);
        }
        for _ in 0..t {
            buf[op] = buf[ip];
            op += 1;
            ip += 1;
        }
        state = if t < 4 { t } else { 4 };
    }

    loop {
        if ip >= ip_end {
            return Err(LzoError::EofNotFound);
        }
        let insn = usize::from(buf[ip]);
        ip += 1;

        let m_dist;
        let m_len;

        if insn < 16 {
            match state {
                0 => {
                    // Literal run of insn + 3 bytes, zero-extended.
                    let mut t = insn;
                    if t == 0 {
                        loop {
                            if ip >= ip_end {
                                return Err(LzoError::InputOverrun);
                            }
                            let b = usize::from(buf[ip]);
                            ip += 1;
                            if b != 0 {
                                t += 15 + b;
                                break;
                            }
                            t += 255;
                        }
                    }
                    let run = t + 3;
                    if run > ip_end - ip {
                        return Err(LzoError::InputOverrun);
                    }
                    if run > op_end - op {
                        return Err(LzoError::OutputOverrun);
                    }
                    for _ in 0..run {
                        buf[op] = buf[ip];
                        op += 1;
                        ip += 1;
                    }
                    state = 4;
                    continue;
                }
                4 => {
                    // M1 after a literal run: 3-byte match past the M2 window.
                    if ip >= ip_end {
                        return Err(LzoError::InputOverrun);
                    }
                    m_dist = 1 + M2_MAX_OFFSET + (insn >> 2) + (usize::from(buf[ip]) << 2);
                    ip += 1;
                    m_len = 3;
                }
                _ => {
                    // M1 after trailing literals: 2-byte short-distance match.
                    if ip >= ip_end {
                        return Err(LzoError::InputOverrun);
                    }
                    m_dist = 1 + (insn >> 2) + (usize::from(buf[ip]) << 2);
                    ip += 1;
                    m_len = 2;
                }
            }
        } else if insn >= 64 {
            // M2: length 3-8, distance up to 2 KiB.
            if ip >= ip_end {
                return Err(LzoError::InputOverrun);
            }
            m_dist = 1 + ((insn >> 2) & 7) + (usize::from(buf[ip]) << 3);
            ip += 1;
            m_len = (insn >> 5) + 1;
        } else if insn >= 32 {
            // M3: distance up to 16 KiB, zero-extended length.
            let mut t = insn & 31;
            if t == 0 {
                loop {
                    if ip >= ip_end {
                        return Err(LzoError::InputOverrun);
                    }
                    let b = usize::from(buf[ip]);
                    ip += 1;
                    if b != 0 {
                        t += 31 + b;
                        break;
                    }
                    t += 255;
                }
            }
            if ip_end - ip < 2 {
                return Err(LzoError::InputOverrun);
            }
            m_dist = 1 + (usize::from(buf[ip]) >> 2) + (usize::from(buf[ip + 1]) << 6);
            ip += 2;
            m_len = t + 2;
        } else {
            // M4: distance 16 KiB-48 KiB, also the end-of-stream marker.
            let high = (insn & 8) << 11;
            let mut t = insn & 7;
            if t == 0 {
                loop {
                    if ip >= ip_end {
                        return Err(LzoError::InputOverrun);
                    }
                    let b = usize::from(buf[ip]);
                    ip += 1;
                    if b != 0 {
                        t += 7 + b;
                        break;
                    }
                    t += 255;
                }
            }
            if ip_end - ip < 2 {
                return Err(LzoError::InputOverrun);
            }
            let low = (usize::from(buf[ip]) >> 2) + (usize::from(buf[ip + 1]) << 6);
            ip += 2;
            if high == 0 && low == 0 {
                return if ip == ip_end {
                    Ok(op)
                } else {
                    Err(LzoError::InputNotConsumed)
                };
            }
            m_dist = 0x4000 + high + low;
            m_len = t + 2;
        }

        if m_dist > op {
            return Err(LzoError::LookbehindOverrun);
        }
        if m_len > op_end - op {
            return Err(LzoError::OutputOverrun);
        }
        let mut m_pos = op - m_dist;
        // Byte-wise so overlapping matches replicate, as the reference does.
        for _ in 0..m_len {
            buf[op] = buf[m_pos];
            op += 1;
            m_pos += 1;
        }

        // Up to three trailing literals, encoded in the low bits of the
        // second-to-last consumed instruction byte.
        let trailing = usize::from(buf[ip - 2]) & 3;
        if trailing != 0 {
            if trailing > ip_end - ip {
                return Err(LzoError::InputOverrun);
            }
            if trailing > op_end - op {
                return Err(LzoError::OutputOverrun);
            }
            for _ in 0..trailing {
                buf[op] = buf[ip];
                op += 1;
                ip += 1;
            }
        }
        state = trailing;
    }
}
