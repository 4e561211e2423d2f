//! Growable byte streams with partial-I/O handling.
//!
//! A `ByteStream` owns one contiguous region. Bytes in `[consumed, size)` are
//! live; the prefix before `consumed` has already been read or sent and is
//! reclaimed by compaction the next time the stream needs room.
//!
//! ## Growth
//!
//! When the spare tail is too small the live bytes are first shifted to
//! offset zero. If that still does not fit, capacity doubles (minimum
//! `MIN_CAPACITY`), or grows exactly to fit a push larger than the doubled
//! size. Growth goes through `try_reserve_exact`, so exhaustion surfaces as
//! [`ChatError::Resource`] instead of aborting.

use crate::error::{ChatError, Result};
use crate::protocol::{self, TERMINATOR};
use std::io::{self, Read, Write};

/// Smallest capacity allocated on first growth.
pub const MIN_CAPACITY: usize = 1024;

/// Outcome of draining a socket into a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    /// The source would block. Everything delivered so far is buffered.
    InProgress,
    /// The remote side closed. Everything delivered before the close is buffered.
    Closed,
}

/// Outcome of flushing a stream into a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Every pending byte was written and the stream was reset to empty.
    Complete,
    /// The sink would block. The unsent remainder is retained.
    Partial,
}

/// Growable buffer with front compaction.
///
/// Invariant: `consumed <= size <= capacity`.
#[derive(Debug, Default)]
pub struct ByteStream {
    /// Backing storage; its length is the capacity.
    data: Vec<u8>,
    /// Number of valid bytes.
    size: usize,
    /// Already-read prefix.
    consumed: usize,
}

impl ByteStream {
    /// Create an empty stream. No memory is allocated until the first push.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of valid bytes, including the consumed prefix.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Bytes not yet read or sent.
    pub fn pending(&self) -> usize {
        self.size - self.consumed
    }

    pub fn has_pending(&self) -> bool {
        self.consumed < self.size
    }

    /// All valid bytes from offset zero.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// The live region `[consumed, size)`.
    pub fn unconsumed(&self) -> &[u8] {
        &self.data[self.consumed..self.size]
    }

    /// Drop all content, keeping the allocation.
    pub fn clear(&mut self) {
        self.size = 0;
        self.consumed = 0;
    }

    /// Append bytes, compacting or growing as needed.
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.make_room(bytes.len())?;
        self.data[self.size..self.size + bytes.len()].copy_from_slice(bytes);
        self.size += bytes.len();
        Ok(())
    }

    /// Ensure at least `at_least` spare bytes after `size`.
    fn make_room(&mut self, at_least: usize) -> Result<()> {
        if self.capacity() - self.size >= at_least {
            return Ok(());
        }

        if self.consumed > 0 {
            self.data.copy_within(self.consumed..self.size, 0);
            self.size -= self.consumed;
            self.consumed = 0;
            if self.capacity() - self.size >= at_least {
                return Ok(());
            }
        }

        let needed = self
            .size
            .checked_add(at_least)
            .ok_or(ChatError::Resource(usize::MAX))?;
        let doubled = self.capacity().saturating_mul(2).max(MIN_CAPACITY);
        let new_capacity = doubled.max(needed);

        self.data
            .try_reserve_exact(new_capacity - self.data.len())
            .map_err(|_| ChatError::Resource(new_capacity))?;
        self.data.resize(new_capacity, 0);
        Ok(())
    }

    /// Read from `source` until it would block, reports end of stream, or fails.
    ///
    /// A connection reset is treated as a close. Bytes received before any
    /// outcome stay buffered.
    pub fn receive_from<R: Read>(&mut self, source: &mut R) -> Result<ReceiveStatus> {
        loop {
            self.make_room(1)?;
            match source.read(&mut self.data[self.size..]) {
                Ok(0) => return Ok(ReceiveStatus::Closed),
                Ok(n) => self.size += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReceiveStatus::InProgress)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    return Ok(ReceiveStatus::Closed)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Write the live region into `sink` until it drains or would block.
    pub fn send_to<W: Write>(&mut self, sink: &mut W) -> Result<SendStatus> {
        while self.consumed < self.size {
            match sink.write(&self.data[self.consumed..self.size]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0").into());
                }
                Ok(n) => self.consumed += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(SendStatus::Partial)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        self.clear();
        Ok(SendStatus::Complete)
    }

    /// Whether the live region holds a terminator. Consumes nothing.
    pub fn has_complete_frame(&self) -> bool {
        self.unconsumed().contains(&TERMINATOR)
    }

    /// Consume the next complete frame, returning it without its terminator.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let len = self.unconsumed().iter().position(|&b| b == TERMINATOR)?;
        let frame = self.data[self.consumed..self.consumed + len].to_vec();
        self.consumed += len + 1;
        Some(frame)
    }

    /// Turn every newline in the live region into a terminator.
    ///
    /// Running it again over already converted bytes changes nothing.
    pub fn terminate_lines(&mut self) {
        let (consumed, size) = (self.consumed, self.size);
        protocol::lines_to_frames(&mut self.data[consumed..size]);
    }
}
