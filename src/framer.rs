//! Newline framing for streamed response bodies.
//!
//! A continuous feed arrives as arbitrary byte chunks. [`LineFramer`]
//! accumulates them and hands back each `\n`-terminated line exactly once,
//! however the chunks happen to split it.

use bytes::BytesMut;

const DEFAULT_CAPACITY: usize = 8192;

/// Longest line kept by default. Changes carrying a large `doc` fit easily.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Incremental line framer.
///
/// Emitted lines are decoded as UTF-8 (invalid sequences are replaced), have
/// their delimiter stripped and surrounding whitespace trimmed. Empty lines
/// are emitted too; deciding what a blank line means is up to the caller.
///
/// A trailing fragment without its `\n` is held until a later
/// [`feed`](Self::feed) completes it, and is discarded if it never is.
///
/// Lines longer than [`max_line`](Self::max_line) bytes are dropped
/// without being buffered in full, and counted for
/// [`take_oversized`](Self::take_oversized).
#[derive(Debug)]
pub struct LineFramer {
    buffer: BytesMut,
    /// Bytes at the front of `buffer` already known to contain no `\n`
    scanned: usize,
    max_line: usize,
    /// Dropping the rest of an over-long line up to its `\n`
    skipping: bool,
    oversized: u64,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        LineFramer {
            buffer: BytesMut::with_capacity(capacity),
            scanned: 0,
            max_line: DEFAULT_MAX_LINE_LENGTH,
            skipping: false,
            oversized: 0,
        }
    }

    /// Set the longest line, in bytes, that will be emitted.
    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line.max(1);
        self
    }

    pub fn max_line(&self) -> usize {
        self.max_line
    }

    /// Append a chunk and iterate over every line it completes.
    ///
    /// The iterator is lazy: lines not pulled from it stay buffered and are
    /// returned by the next call to [`next_line`](Self::next_line) or `feed`.
    pub fn feed(&mut self, chunk: &[u8]) -> Lines<'_> {
        self.buffer.extend_from_slice(chunk);
        Lines { framer: self }
    }

    /// Pop the next complete line, if the buffer holds one.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let offset = self.buffer[self.scanned..]
                .iter()
                .position(|&b| b == b'\n');

            let Some(offset) = offset else {
                if self.buffer.len() > self.max_line {
                    if !self.skipping {
                        self.skipping = true;
                        self.oversized += 1;
                    }
                    self.buffer.clear();
                    self.scanned = 0;
                } else {
                    self.scanned = self.buffer.len();
                }
                return None;
            };

            let end = self.scanned + offset;
            let line = self.buffer.split_to(end + 1);
            self.scanned = 0;

            if self.skipping {
                self.skipping = false;
                continue;
            }
            if end > self.max_line {
                self.oversized += 1;
                continue;
            }
            return Some(String::from_utf8_lossy(&line[..end]).trim().to_string());
        }
    }

    /// Number of over-long lines dropped since the last call.
    pub fn take_oversized(&mut self) -> u64 {
        std::mem::take(&mut self.oversized)
    }

/// Number of buffered bytes that do not yet form a complete line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop the framer, returning how many bytes of unterminated tail
    /// were discarded.
    pub fn finish(self) -> usize {
        self.buffer.len()
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// Lines completed by a [`LineFramer::feed`] call.
#[must_use = "lines are only consumed from the buffer when iterated"]
pub struct Lines<'a> {
    framer: &'a mut LineFramer,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.framer.next_line()
    }
}
