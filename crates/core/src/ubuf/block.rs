// SPDX-FileCopyrightText: © 2026 Upipe Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Block buffers: a logical byte stream over one or more shared segments.
//!
//! Segments reference [`UmemBuf`] storage through `Arc`, so `splice` and
//! `append` are O(1) and never copy. Writing requires unique ownership of
//! the backing memory; a shared buffer must go through
//! [`UbufBlock::make_writable`] first, which performs the copy-on-write
//! merge. Mapping and unmapping are expressed as Rust borrows: a `write`
//! borrow ends where a C API would unmap.

use crate::error::{Result, UbaseError};
use crate::umem::{UmemBuf, UmemMgr};
use smallvec::SmallVec;
use std::sync::Arc;

#[derive(Clone)]
struct Seg {
    mem: Arc<UmemBuf>,
    off: usize,
    len: usize,
}

impl Seg {
    fn as_slice(&self) -> &[u8] {
        &self.mem.as_slice()[self.off..self.off + self.len]
    }
}

/// A sequence of mapped memory segments forming a single byte stream.
#[derive(Clone, Default)]
pub struct UbufBlock {
    segs: SmallVec<[Seg; 2]>,
}

impl UbufBlock {
    /// Wraps freshly allocated storage, exposing `[off, off + len)`.
    /// Bytes before `off` form the prepend reserve.
    #[must_use]
    pub fn from_umem(mem: UmemBuf, off: usize, len: usize) -> Self {
        debug_assert!(off + len <= mem.len());
        let mut segs = SmallVec::new();
        segs.push(Seg { mem: Arc::new(mem), off, len });
        Self { segs }
    }

    /// Convenience constructor copying a byte slice, for tests and codecs.
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_umem(UmemBuf::from_vec(data.to_vec()), 0, data.len())
    }

    /// Total size in bytes, the sum of segment spans.
    #[must_use]
    pub fn size(&self) -> usize {
        self.segs.iter().map(|s| s.len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of underlying segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segs.len()
    }

    /// Iterates the segment spans in stream order.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.segs.iter().map(Seg::as_slice)
    }

    /// Single byte at `offset`, if in bounds.
    #[must_use]
    pub fn byte(&self, offset: usize) -> Option<u8> {
        let mut pos = 0;
        for seg in &self.segs {
            if offset < pos + seg.len {
                return Some(seg.as_slice()[offset - pos]);
            }
            pos += seg.len;
        }
        None
    }

    /// Maps `scratch.len()` bytes starting at `offset` for reading. Returns
    /// a direct slice when the range lies within a single segment, otherwise
    /// copies into `scratch` and returns it. `None` when out of bounds.
    pub fn peek<'a>(&'a self, offset: usize, scratch: &'a mut [u8]) -> Option<&'a [u8]> {
        let len = scratch.len();
        if offset + len > self.size() {
            return None;
        }
        let mut pos = 0;
        for seg in &self.segs {
            if offset >= pos && offset + len <= pos + seg.len {
                let start = offset - pos;
                return Some(&seg.as_slice()[start..start + len]);
            }
            pos += seg.len;
        }
        self.copy_into(offset, scratch).ok()?;
        Some(&*scratch)
    }

    /// Copies `out.len()` bytes starting at `offset` into `out`.
    ///
    /// # Errors
    ///
    /// `Invalid` when the range exceeds the buffer.
    pub fn copy_into(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        if offset + out.len() > self.size() {
            return Err(UbaseError::Invalid);
        }
        let mut skip = offset;
        let mut written = 0;
        for seg in &self.segs {
            if written == out.len() {
                break;
            }
            let slice = seg.as_slice();
            if skip >= slice.len() {
                skip -= slice.len();
                continue;
            }
            let avail = &slice[skip..];
            skip = 0;
            let take = avail.len().min(out.len() - written);
            out[written..written + take].copy_from_slice(&avail[..take]);
            written += take;
        }
        Ok(())
    }

    /// Copies the whole stream into a vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0; self.size()];
        // Range is the full buffer, cannot fail.
        let _ = self.copy_into(0, &mut out);
        out
    }

    /// Maps `len` bytes at `offset` for writing.
    ///
    /// # Errors
    ///
    /// `Busy` when the backing memory is shared (use
    /// [`Self::make_writable`]), `Invalid` when the range crosses a segment
    /// boundary or exceeds the buffer.
    pub fn write(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let mut pos = 0;
        for seg in &mut self.segs {
            if offset >= pos && offset + len <= pos + seg.len {
                let start = seg.off + (offset - pos);
                let mem = Arc::get_mut(&mut seg.mem).ok_or(UbaseError::Busy)?;
                return Ok(&mut mem.as_mut_slice()[start..start + len]);
            }
            pos += seg.len;
        }
        Err(UbaseError::Invalid)
    }

    /// Ensures the buffer is a single, uniquely-owned segment, copying the
    /// contents into fresh storage from `umem` when it is shared or
    /// fragmented.
    pub fn make_writable(&mut self, umem: &UmemMgr) {
        let unique_single =
            self.segs.len() == 1 && self.segs.first().is_some_and(|s| Arc::strong_count(&s.mem) == 1);
        if unique_single {
            return;
        }
        let size = self.size();
        let mut mem = umem.alloc(size);
        let _ = self.copy_into(0, mem.as_mut_slice());
        self.segs.clear();
        self.segs.push(Seg { mem: Arc::new(mem), off: 0, len: size });
    }

    /// Creates a new buffer sharing the segments of `[offset, offset + len)`.
    ///
    /// # Errors
    ///
    /// `Invalid` when the range exceeds the buffer.
    pub fn splice(&self, offset: usize, len: usize) -> Result<Self> {
        if offset + len > self.size() {
            return Err(UbaseError::Invalid);
        }
        let mut segs = SmallVec::new();
        let mut skip = offset;
        let mut remaining = len;
        for seg in &self.segs {
            if remaining == 0 {
                break;
            }
            if skip >= seg.len {
                skip -= seg.len;
                continue;
            }
            let take = (seg.len - skip).min(remaining);
            segs.push(Seg { mem: seg.mem.clone(), off: seg.off + skip, len: take });
            skip = 0;
            remaining -= take;
        }
        Ok(Self { segs })
    }

    /// Attaches `other`'s segments after this buffer's, without copy.
    pub fn append(&mut self, other: Self) {
        self.segs.extend(other.segs);
    }

    /// Drops `n` leading bytes.
    ///
    /// # Errors
    ///
    /// `Invalid` when `n` exceeds the buffer.
    pub fn skip(&mut self, mut n: usize) -> Result<()> {
        if n > self.size() {
            return Err(UbaseError::Invalid);
        }
        while n > 0 {
            let first = &mut self.segs[0];
            if n >= first.len {
                n -= first.len;
                self.segs.remove(0);
            } else {
                first.off += n;
                first.len -= n;
                n = 0;
            }
        }
        Ok(())
    }

    /// Truncates to `len` bytes, dropping trailing data.
    pub fn truncate(&mut self, len: usize) {
        let mut pos = 0;
        let mut keep = self.segs.len();
        for (i, seg) in self.segs.iter_mut().enumerate() {
            if pos >= len {
                keep = i;
                break;
            }
            if pos + seg.len > len {
                seg.len = len - pos;
                keep = i + 1;
                break;
            }
            pos += seg.len;
        }
        self.segs.truncate(keep);
    }

    /// Grows the buffer by `n` bytes at the front, into the prepend reserve
    /// of the first segment.
    ///
    /// # Errors
    ///
    /// `Busy` when the first segment's memory is shared, `Invalid` when the
    /// reserve is too small.
    pub fn prepend(&mut self, n: usize) -> Result<()> {
        let first = self.segs.first_mut().ok_or(UbaseError::Invalid)?;
        if Arc::strong_count(&first.mem) != 1 {
            return Err(UbaseError::Busy);
        }
        if first.off < n {
            return Err(UbaseError::Invalid);
        }
        first.off -= n;
        first.len += n;
        Ok(())
    }

    /// Adjusts the logical span: a negative `offset` grows into the
    /// prepend reserve, a positive one drops leading bytes; the result is
    /// then truncated to `new_size`.
    ///
    /// # Errors
    ///
    /// As [`Self::skip`] and [`Self::prepend`].
    pub fn resize(&mut self, offset: i64, new_size: usize) -> Result<()> {
        if offset >= 0 {
            self.skip(usize::try_from(offset).map_err(|_| UbaseError::Invalid)?)?;
        } else {
            self.prepend(usize::try_from(-offset).map_err(|_| UbaseError::Invalid)?)?;
        }
        self.truncate(new_size);
        Ok(())
    }

    /// Removes `[offset, offset + len)`; the surrounding segments are
    /// retained and simply re-spanned.
    ///
    /// # Errors
    ///
    /// `Invalid` when the range exceeds the buffer.
    pub fn delete(&mut self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.size() {
            return Err(UbaseError::Invalid);
        }
        let head = self.splice(0, offset)?;
        let tail = self.splice(offset + len, self.size() - offset - len)?;
        self.segs = head.segs;
        self.segs.extend(tail.segs);
        Ok(())
    }
}

impl std::fmt::Debug for UbufBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UbufBlock")
            .field("size", &self.size())
            .field("segments", &self.segs.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn block(data: &[u8]) -> UbufBlock {
        UbufBlock::from_slice(data)
    }

    #[test]
    fn write_then_read_single_segment() {
        let mut b = block(&[0; 8]);
        b.write(2, 4).unwrap().copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(b.to_vec(), [0, 0, 1, 2, 3, 4, 0, 0]);
    }

    #[test]
    fn splice_shares_bytes() {
        let data: Vec<u8> = (0..32).collect();
        let b = block(&data);
        for (a, z) in [(0, 32), (5, 17), (31, 32), (16, 16)] {
            let s = b.splice(a, z - a).unwrap();
            assert_eq!(s.size(), z - a);
            assert_eq!(s.to_vec(), data[a..z]);
        }
    }

    #[test]
    fn append_of_splices_reproduces_original() {
        let data: Vec<u8> = (0..64).collect();
        let b = block(&data);
        for k in [0, 1, 31, 63, 64] {
            let mut prefix = b.splice(0, k).unwrap();
            let suffix = b.splice(k, data.len() - k).unwrap();
            prefix.append(suffix);
            assert_eq!(prefix.to_vec(), data);
        }
    }

    #[test]
    fn shared_memory_refuses_write() {
        let mut b = block(&[0; 16]);
        let dup = b.clone();
        assert!(matches!(b.write(0, 4), Err(UbaseError::Busy)));
        drop(dup);
        assert!(b.write(0, 4).is_ok());
    }

    #[test]
    fn make_writable_copies_when_shared() {
        let umem = UmemMgr::alloc_mgr();
        let mut b = block(&[9; 16]);
        let dup = b.clone();
        b.make_writable(&umem);
        b.write(0, 1).unwrap()[0] = 1;
        assert_eq!(b.byte(0), Some(1));
        assert_eq!(dup.byte(0), Some(9));
    }

    #[test]
    fn peek_across_segments_copies_into_scratch() {
        let mut b = block(&[1, 2, 3]);
        b.append(block(&[4, 5, 6]));
        assert_eq!(b.segment_count(), 2);

        let mut scratch = [0u8; 4];
        let got = b.peek(1, &mut scratch).unwrap();
        assert_eq!(got, &[2, 3, 4, 5]);

        // Within one segment, no copy is needed.
        let mut scratch2 = [0u8; 2];
        let got2 = b.peek(0, &mut scratch2).unwrap();
        assert_eq!(got2, &[1, 2]);
    }

    #[test]
    fn skip_and_truncate_adjust_span() {
        let mut b = block(&(0..10).collect::<Vec<u8>>());
        b.skip(3).unwrap();
        b.truncate(4);
        assert_eq!(b.to_vec(), [3, 4, 5, 6]);
        assert!(b.skip(10).is_err());
    }

    #[test]
    fn prepend_uses_reserve() {
        let mem = UmemBuf::from_vec(vec![0; 16]);
        let mut b = UbufBlock::from_umem(mem, 8, 8);
        b.prepend(4).unwrap();
        assert_eq!(b.size(), 12);
        assert!(b.prepend(8).is_err());
    }

    #[test]
    fn resize_moves_the_logical_span() {
        let mem = UmemBuf::from_vec((0..16).collect());
        let mut b = UbufBlock::from_umem(mem, 8, 8);
        b.resize(2, 4).unwrap();
        assert_eq!(b.to_vec(), [10, 11, 12, 13]);
        b.resize(-2, 6).unwrap();
        assert_eq!(b.to_vec(), [8, 9, 10, 11, 12, 13]);
    }

    #[test]
    fn delete_retains_surrounding_segments() {
        let mut b = block(&(0..10).collect::<Vec<u8>>());
        b.delete(2, 5).unwrap();
        assert_eq!(b.to_vec(), [0, 1, 7, 8, 9]);
        assert_eq!(b.segment_count(), 2);
    }
}
