#![forbid(unsafe_code)]
//! Encoding, varint, and buffer utilities shared across storage layers.

pub mod ord {
    //! Order-preserving encoders for length prefixes.

    /// Big-endian encoding for lexicographic order preservation.
    pub fn put_u32_be(dst: &mut Vec<u8>, v: u32) {
        dst.extend_from_slice(&v.to_be_bytes());
    }
}

pub mod le {
    //! Fixed-width little-endian helpers used by the record layout.

    /// Reads a u16 stored little-endian at `off`.
    #[inline]
    pub fn read_u16(buf: &[u8], off: usize) -> u16 {
        u16::from_le_bytes([buf[off], buf[off + 1]])
    }

    /// Writes `v` little-endian at `off`.
    #[inline]
    pub fn write_u16(buf: &mut [u8], off: usize, v: u16) {
        buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }
}

pub mod var {
    //! Short unsigned varints (1 to 4 bytes, 7 bits per byte).

    use crate::types::{BigMapError, Result};

    /// Largest value representable in four varint bytes.
    pub const MAX_VALUE: u32 = (1 << 28) - 1;

    /// Number of bytes `v` occupies once encoded.
    pub fn encoded_len(v: u32) -> usize {
        debug_assert!(v <= MAX_VALUE, "varint value exceeds 28 bits");
        match v {
            0..=0x7f => 1,
            0x80..=0x3fff => 2,
            0x4000..=0x1f_ffff => 3,
            _ => 4,
        }
    }

    /// Encodes `v` and appends it to `out`.
    pub fn encode_u32(mut v: u32, out: &mut Vec<u8>) {
        assert!(v <= MAX_VALUE, "varint value exceeds 28 bits");
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Decodes a varint from `src` at `*off`, advancing the offset.
    pub fn decode_u32(src: &[u8], off: &mut usize) -> Result<u32> {
        let mut result = 0u32;
        for i in 0..4 {
            let byte = *src
                .get(*off)
                .ok_or(BigMapError::Corruption("varint decode truncated"))?;
            *off += 1;
            result |= ((byte & 0x7f) as u32) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(BigMapError::Corruption("varint longer than 4 bytes"))
    }
}

pub mod buf {
    //! A simple slice-backed cursor for ergonomic parsing.

    use core::fmt;

    use crate::types::{BigMapError, Result};

    /// A cursor for reading bytes from a slice with offset tracking.
    pub struct Cursor<'a> {
        /// The underlying byte slice.
        pub buf: &'a [u8],
        /// Current read offset.
        pub off: usize,
    }

    impl<'a> Cursor<'a> {
        /// Creates a new cursor starting at `off`.
        pub fn at(buf: &'a [u8], off: usize) -> Self {
            Self { buf, off }
        }

        /// Takes the next `n` bytes from the cursor, advancing the offset.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .ok_or(BigMapError::Corruption("cursor offset overflow"))?;
            if end > self.buf.len() {
                return Err(BigMapError::Corruption("cursor take beyond buffer"));
            }
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        /// Reads a varint at the current offset.
        pub fn varint(&mut self) -> Result<u32> {
            super::var::decode_u32(self.buf, &mut self.off)
        }

        /// Returns the number of bytes remaining in the buffer.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }
    }

    impl<'a> fmt::Debug for Cursor<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Cursor")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }
}
