#![forbid(unsafe_code)]
//! Growable circular byte buffer with write, read and commit cursors.
//!
//! Bytes move through three regions in circular order:
//!
//! ```text
//!   cp ---- unconfirmed ---- rp ---- readable ---- wp ---- free ---- cp
//! ```
//!
//! `confirm` moves `cp` forward and forgets bytes for good; `rollback` moves
//! `rp` back to `cp` so everything unconfirmed is read again. Capacity is
//! always a power of two and one byte stays unused so `wp` never catches
//! `cp`.

use std::fmt;

use crate::types::{crc32_extend, Result, SombraError};

/// Smallest buffer order (64 bytes).
pub const MIN_ORDER: u32 = 6;
/// Largest buffer order (16 GiB).
pub const MAX_ORDER: u32 = 34;

/// Byte buffer shared by the emitter, producers and consumers.
pub struct OperationBuffer {
    name: String,
    data: Vec<u8>,
    order: u32,
    cp: usize,
    rp: usize,
    wp: usize,
}

impl OperationBuffer {
    /// Creates a buffer with `1 << order` bytes of capacity.
    pub fn with_capacity_order(order: u32, name: impl Into<String>) -> Self {
        let order = order.clamp(MIN_ORDER, MAX_ORDER);
        Self {
            name: name.into(),
            data: vec![0u8; 1usize << order],
            order,
            cp: 0,
            rp: 0,
            wp: 0,
        }
    }

    /// Label used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Capacity as a power of two.
    pub fn order(&self) -> u32 {
        self.order
    }

    fn mask(&self) -> usize {
        self.data.len() - 1
    }

    fn distance(&self, from: usize, to: usize) -> usize {
        to.wrapping_sub(from) & self.mask()
    }

    /// Bytes written and not yet confirmed.
    pub fn size(&self) -> usize {
        self.distance(self.cp, self.wp)
    }

    /// Bytes written and not yet read.
    pub fn readable(&self) -> usize {
        self.distance(self.rp, self.wp)
    }

    /// Bytes read and not yet confirmed.
    pub fn unconfirmed(&self) -> usize {
        self.distance(self.cp, self.rp)
    }

    /// One slot stays free to tell full from empty.
    pub fn writable(&self) -> usize {
        self.capacity() - 1 - self.size()
    }

    pub fn has_readable(&self) -> bool {
        self.rp != self.wp
    }

    pub fn has_unconfirmed(&self) -> bool {
        self.cp != self.rp
    }

    /// Nothing written that is still unconfirmed.
    pub fn is_empty(&self) -> bool {
        self.cp == self.wp
    }

    /// The two slices covering `len` bytes starting at `from`.
    fn span(&self, from: usize, len: usize) -> (&[u8], &[u8]) {
        let first = len.min(self.capacity() - from);
        (
            &self.data[from..from + first],
            &self.data[..len - first],
        )
    }

    fn span_crc(&self, from: usize, len: usize) -> u32 {
        let (head, tail) = self.span(from, len);
        crc32_extend(crc32_extend(0, head), tail)
    }

    /// Appends `bytes`, growing the buffer if needed.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        self.reserve(bytes.len())?;
        let wp = self.wp;
        let first = bytes.len().min(self.capacity() - wp);
        self.data[wp..wp + first].copy_from_slice(&bytes[..first]);
        self.data[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        self.wp = (wp + bytes.len()) & self.mask();
        Ok(bytes.len())
    }

    /// Removes up to `n` of the most recently written, still unread bytes.
    pub fn unwrite(&mut self, n: usize) -> usize {
        let n = n.min(self.readable());
        self.wp = self.wp.wrapping_sub(n) & self.mask();
        n
    }

    /// Ensures at least `n` more bytes can be written.
    pub fn reserve(&mut self, n: usize) -> Result<()> {
        if n <= self.writable() {
            return Ok(());
        }
        let need = self
            .size()
            .checked_add(n + 1)
            .ok_or(SombraError::Invalid("operation buffer size overflow"))?;
        let order = need.next_power_of_two().trailing_zeros().max(self.order);
        self.resize(order)
    }

    /// Contiguous free space of at least `min` bytes at the write pointer.
    pub fn writable_segment(&mut self, min: usize) -> Result<&mut [u8]> {
        self.reserve(min.max(1))?;
        if self.contiguous_free() < min {
            // Free space is split by the wrap point; linearize.
            self.resize(self.order)?;
        }
        let len = self.contiguous_free();
        let wp = self.wp;
        Ok(&mut self.data[wp..wp + len])
    }

    fn contiguous_free(&self) -> usize {
        if self.wp >= self.cp {
            let end = if self.cp == 0 {
                self.capacity() - 1
            } else {
                self.capacity()
            };
            end - self.wp
        } else {
            self.cp - 1 - self.wp
        }
    }

    /// Commits `n` bytes written directly into [`writable_segment`](Self::writable_segment).
    pub fn advance_write(&mut self, n: usize) -> Result<usize> {
        if n > self.contiguous_free() {
            return Err(SombraError::Invalid("advance_write beyond writable segment"));
        }
        self.wp = (self.wp + n) & self.mask();
        Ok(n)
    }

    /// Contiguous readable bytes at the read pointer, at most `max`.
    pub fn readable_segment(&self, max: usize) -> &[u8] {
        let contiguous = if self.wp >= self.rp {
            self.wp - self.rp
        } else {
            self.capacity() - self.rp
        };
        &self.data[self.rp..self.rp + contiguous.min(max)]
    }

    /// Clamped to what is readable; returns the bytes skipped.
    pub fn advance_read(&mut self, n: usize) -> usize {
        let n = n.min(self.readable());
        self.rp = (self.rp + n) & self.mask();
        n
    }

    /// Copies readable bytes without consuming them.
    pub fn peek(&self, max: usize) -> Vec<u8> {
        let (head, tail) = self.span(self.rp, self.readable().min(max));
        let mut out = Vec::with_capacity(head.len() + tail.len());
        out.extend_from_slice(head);
        out.extend_from_slice(tail);
        out
    }

    /// Copies the last `n` written bytes (clamped to the readable bytes).
    pub fn peek_tail(&self, n: usize) -> Vec<u8> {
        let n = n.min(self.readable());
        let from = self.wp.wrapping_sub(n) & self.mask();
        let (head, tail) = self.span(from, n);
        let mut out = Vec::with_capacity(n);
        out.extend_from_slice(head);
        out.extend_from_slice(tail);
        out
    }

    /// Consumes bytes through the first `delim`, looking at most `max` bytes ahead.
    ///
    /// Returns `None` when no delim is readable yet and fewer than `max`
    /// bytes are available. When `max` bytes are scanned without a delim,
    /// those bytes are returned (the caller treats it as oversized).
    pub fn read_until(&mut self, max: usize, delim: u8) -> Option<Vec<u8>> {
        let window = self.readable().min(max);
        let (head, tail) = self.span(self.rp, window);
        let found = head
            .iter()
            .position(|b| *b == delim)
            .or_else(|| tail.iter().position(|b| *b == delim).map(|i| i + head.len()));
        let take = match found {
            Some(i) => i + 1,
            None if window >= max => window,
            None => return None,
        };
        let out = self.peek(take);
        self.advance_read(take);
        Some(out)
    }

    /// Permanently discards `n` bytes that were read.
    pub fn confirm(&mut self, n: usize) -> Result<usize> {
        if n > self.unconfirmed() {
            return Err(SombraError::Invalid("confirm beyond unconfirmed bytes"));
        }
        self.cp = (self.cp + n) & self.mask();
        Ok(n)
    }

    /// Rewinds the read pointer to the commit pointer; returns the bytes re-exposed.
    pub fn rollback(&mut self) -> usize {
        let n = self.unconfirmed();
        self.rp = self.cp;
        n
    }

    /// Drops all content and resets every cursor.
    pub fn clear(&mut self) {
        self.cp = 0;
        self.rp = 0;
        self.wp = 0;
    }

    /// Doubles the capacity.
    pub fn expand(&mut self) -> Result<()> {
        self.resize(self.order + 1)
    }

    /// Shrinks capacity down to `max_capacity` when the content allows it.
    pub fn trim(&mut self, max_capacity: usize) -> Result<bool> {
        let target = (usize::BITS - 1 - max_capacity.max(1).leading_zeros()).max(MIN_ORDER);
        if target >= self.order || self.size() + 1 > (1usize << target) {
            return Ok(false);
        }
        self.resize(target)?;
        Ok(true)
    }

    /// CRC of the readable span.
    pub fn crc_readable(&self) -> u32 {
        self.span_crc(self.rp, self.readable())
    }

    pub fn crc_unconfirmed(&self) -> u32 {
        self.span_crc(self.cp, self.unconfirmed())
    }

    /// CRC of the last `n` written bytes (clamped to the buffer content).
    pub fn crc_tail(&self, n: usize) -> u32 {
        let n = n.min(self.size());
        let from = self.wp.wrapping_sub(n) & self.mask();
        self.span_crc(from, n)
    }

    /// Moves up to `n` readable bytes out of `other` into this buffer.
    pub fn absorb(&mut self, other: &mut OperationBuffer, n: usize) -> Result<usize> {
        let bytes = other.peek(n);
        self.write(&bytes)?;
        other.advance_read(bytes.len());
        Ok(bytes.len())
    }

    fn resize(&mut self, order: u32) -> Result<()> {
        if order > MAX_ORDER {
            return Err(SombraError::Invalid("operation buffer exceeds maximum size"));
        }
        let size = self.size();
        let unconfirmed = self.unconfirmed();
        let before = self.span_crc(self.cp, size);
        let mut data = vec![0u8; 1usize << order];
        {
            let (head, tail) = self.span(self.cp, size);
            data[..head.len()].copy_from_slice(head);
            data[head.len()..size].copy_from_slice(tail);
        }
        self.data = data;
        self.order = order;
        self.cp = 0;
        self.rp = unconfirmed;
        self.wp = size & self.mask();
        if self.span_crc(0, size) != before {
            return Err(SombraError::Corruption("operation buffer resize checksum mismatch"));
        }
        Ok(())
    }
}

impl fmt::Debug for OperationBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationBuffer")
            .field("name", &self.name)
            .field("capacity", &self.capacity())
            .field("cp", &self.cp)
            .field("rp", &self.rp)
            .field("wp", &self.wp)
            .finish()
    }
}
