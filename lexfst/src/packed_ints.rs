//! Byte-width-packed integer vectors.
//!
//! Three auxiliary tables store non-negative integers at the smallest
//! byte-aligned width (1..=8 bytes per value, big-endian): the build-time
//! node-ordinal → address table, the build-time in-degree table, and the
//! dense-id → address table carried by packed automatons. Byte-aligned
//! widths keep indexing trivial while still shrinking the common case
//! (addresses fit 3-4 bytes) well below `u64` storage.

use std::io::{Read, Write};

use crate::bytes::{read_vint_from, write_vint_to};
use crate::error::{FstError, Result};

/// Fixed-length vector of `u64` values stored at a fixed byte width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedIntVec {
    bytes_per_value: usize,
    len: usize,
    data: Vec<u8>,
}

/// Smallest byte width that can hold `max_value`.
pub fn bytes_required(max_value: u64) -> usize {
    let bits = 64 - max_value.leading_zeros() as usize;
    bits.div_ceil(8).max(1)
}

impl PackedIntVec {
    /// Zero-filled vector of `len` values at `bytes_per_value` width.
    pub fn new(len: usize, bytes_per_value: usize) -> Self {
        debug_assert!((1..=8).contains(&bytes_per_value));
        PackedIntVec {
            bytes_per_value,
            len,
            data: vec![0u8; len * bytes_per_value],
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes_per_value(&self) -> usize {
        self.bytes_per_value
    }

    #[inline]
    pub fn get(&self, index: usize) -> u64 {
        debug_assert!(index < self.len);
        let start = index * self.bytes_per_value;
        let mut v = 0u64;
        for &b in &self.data[start..start + self.bytes_per_value] {
            v = (v << 8) | b as u64;
        }
        v
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: u64) {
        debug_assert!(index < self.len);
        debug_assert!(bytes_required(value) <= self.bytes_per_value);
        let start = index * self.bytes_per_value;
        for i in 0..self.bytes_per_value {
            let shift = 8 * (self.bytes_per_value - 1 - i);
            self.data[start + i] = (value >> shift) as u8;
        }
    }

    /// Serialize as `⟨vint len, u8 width, raw values⟩`.
    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        write_vint_to(out, self.len as u32)?;
        out.write_all(&[self.bytes_per_value as u8])?;
        out.write_all(&self.data)?;
        Ok(())
    }

    pub fn load<R: Read>(reader: &mut R) -> Result<Self> {
        let len = read_vint_from(reader)? as usize;
        let mut width = [0u8; 1];
        reader.read_exact(&mut width)?;
        let bytes_per_value = width[0] as usize;
        if !(1..=8).contains(&bytes_per_value) {
            return Err(FstError::Format(format!(
                "packed ints: invalid byte width {bytes_per_value}"
            )));
        }
        let mut data = vec![0u8; len * bytes_per_value];
        reader.read_exact(&mut data)?;
        Ok(PackedIntVec {
            bytes_per_value,
            len,
            data,
        })
    }
}

/// Append-friendly packed vector that widens its value width and grows its
/// length on demand. Unset indexes read as zero.
#[derive(Debug, Clone)]
pub struct GrowableIntVec {
    inner: PackedIntVec,
}

impl GrowableIntVec {
    pub fn new() -> Self {
        GrowableIntVec {
            inner: PackedIntVec::new(0, 1),
        }
    }

    pub fn with_capacity(len: usize, bytes_per_value: usize) -> Self {
        GrowableIntVec {
            inner: PackedIntVec::new(len, bytes_per_value),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> u64 {
        if index < self.inner.len() {
            self.inner.get(index)
        } else {
            0
        }
    }

    pub fn set(&mut self, index: usize, value: u64) {
        let width = bytes_required(value).max(self.inner.bytes_per_value());
        let len = self.inner.len().max(index + 1);
        if width > self.inner.bytes_per_value() || len > self.inner.len() {
            // Grow length by half-again so repeated appends stay amortized.
            let new_len = if len > self.inner.len() {
                len + len / 2
            } else {
                self.inner.len()
            };
            let mut wider = PackedIntVec::new(new_len, width);
            for i in 0..self.inner.len() {
                wider.set(i, self.inner.get(i));
            }
            self.inner = wider;
        }
        self.inner.set(index, value);
    }
}

impl Default for GrowableIntVec {
    fn default() -> Self {
        Self::new()
    }
}
