//! Newline framing for the socket side of the bridge.
//!
//! [`LineReader`] pulls whatever fragment the buffered reader currently holds,
//! appends it to an accumulator and yields a [`Frame`] once a `\n` shows up.
//! Lines longer than the reader's buffer arrive as several fragments and are
//! stitched back together; lines longer than the configured maximum are
//! skipped up to their newline.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;
pub const DEFAULT_READ_BUFFER: usize = 4096;

const DELIMITER: u8 = b'\n';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramingOptions {
    /// Largest message, newline excluded, that will be relayed.
    pub max_message_size: usize,
    /// Capacity of the socket reader's internal buffer.
    pub read_buffer: usize,
    /// Publish bytes left without a newline when the socket closes.
    pub flush_trailing: bool,
}

impl Default for FramingOptions {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_buffer: DEFAULT_READ_BUFFER,
            flush_trailing: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete message, delimiter stripped.
    Line(Bytes),
    /// A line that exceeded the size limit and was dropped.
    Oversized { discarded: usize },
    /// Bytes left over when the stream ended without a final newline.
    Unterminated(Bytes),
}

pub struct LineReader<R> {
    reader: R,
    accumulator: Accumulator,
}

impl<R> LineReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R, max_message_size: usize) -> Self {
        Self {
            reader,
            accumulator: Accumulator::new(max_message_size),
        }
    }

    /// Returns the next frame, or `None` once the stream is exhausted.
    ///
    /// Read errors are returned as-is; the accumulated partial line is kept,
    /// but callers are expected to stop reading after an error.
    pub async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            let chunk = self.reader.fill_buf().await?;
            if chunk.is_empty() {
                return Ok(self.accumulator.finish());
            }

            let (fragment_len, terminated) = match chunk.iter().position(|&b| b == DELIMITER) {
                Some(index) => (index, true),
                None => (chunk.len(), false),
            };

            self.accumulator.push(&chunk[..fragment_len]);
            self.reader.consume(fragment_len + usize::from(terminated));

            if terminated {
                return Ok(Some(self.accumulator.complete()));
            }
        }
    }
}

struct Accumulator {
    buffer: BytesMut,
    max_len: usize,
    // Set while skipping the remainder of an oversized line.
    overflow: Option<usize>,
}

impl Accumulator {
    fn new(max_len: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_len,
            overflow: None,
        }
    }

    fn push(&mut self, fragment: &[u8]) {
        if let Some(discarded) = self.overflow.as_mut() {
            *discarded += fragment.len();
            return;
        }

        let total = self.buffer.len() + fragment.len();
        if total > self.max_len {
            self.overflow = Some(total);
            self.buffer.clear();
            return;
        }

        self.buffer.extend_from_slice(fragment);
    }

    fn complete(&mut self) -> Frame {
        match self.overflow.take() {
            Some(discarded) => Frame::Oversized { discarded },
            None => Frame::Line(self.buffer.split().freeze()),
        }
    }

    fn finish(&mut self) -> Option<Frame> {
        if let Some(discarded) = self.overflow.take() {
            return Some(Frame::Oversized { discarded });
        }
        if self.buffer.is_empty() {
            return None;
        }
        Some(Frame::Unterminated(self.buffer.split().freeze()))
    }
}
