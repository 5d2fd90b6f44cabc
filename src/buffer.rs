//! Receive buffer for the framer

use crate::{
    constants::{BUF_CHUNK, MAX_BUFFER_SIZE},
    error::{EslError, EslResult},
};
use bytes::{Buf, Bytes, BytesMut};

/// Location of the blank line closing a header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderEnd {
    /// Bytes belonging to header lines (terminators included).
    pub header_len: usize,
    /// Bytes to consume, blank line included.
    pub consumed: usize,
}

/// Byte accumulator fed from the socket and drained one message at a time.
pub struct EslBuffer {
    inner: BytesMut,
}

impl EslBuffer {
    pub fn new() -> Self {
        Self {
            inner: BytesMut::with_capacity(BUF_CHUNK),
        }
    }

    /// Append socket data, refusing to grow past [`MAX_BUFFER_SIZE`].
    pub fn extend_from_slice(&mut self, data: &[u8]) -> EslResult<()> {
        let size = self.inner.len() + data.len();
        if size > MAX_BUFFER_SIZE {
            tracing::error!(
                size,
                limit = MAX_BUFFER_SIZE,
                "receive buffer overflow, stream is desynchronized"
            );
            return Err(EslError::BufferOverflow {
                size,
                limit: MAX_BUFFER_SIZE,
            });
        }
        if self.inner.capacity() - self.inner.len() < data.len() {
            self.inner
                .reserve(data.len().max(BUF_CHUNK));
        }
        self.inner
            .extend_from_slice(data);
        Ok(())
    }

    /// Drop empty lines sitting at the front of the buffer.
    pub fn skip_blank_lines(&mut self) {
        loop {
            if self.inner.starts_with(b"\r\n") {
                self.inner.advance(2);
            } else if self.inner.starts_with(b"\n") {
                self.inner.advance(1);
            } else {
                return;
            }
        }
    }

    /// Find the first empty line (`\n` or `\r\n`) in the buffered data.
    pub fn find_header_end(&self) -> Option<HeaderEnd> {
        find_blank_line(&self.inner)
    }

    /// Remove and return the first `count` bytes, or `None` if fewer are buffered.
    pub fn take(&mut self, count: usize) -> Option<Bytes> {
        if self.inner.len() < count {
            return None;
        }
        Some(
            self.inner
                .split_to(count)
                .freeze(),
        )
    }
}

impl Default for EslBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Locate the blank line terminating a header block inside `data`.
pub(crate) fn find_blank_line(data: &[u8]) -> Option<HeaderEnd> {
    let mut line_start = 0;
    while let Some(offset) = data[line_start..]
        .iter()
        .position(|&b| b == b'\n')
    {
        let line_end = line_start + offset;
        let line = &data[line_start..line_end];
        let line = line
            .strip_suffix(b"\r")
            .unwrap_or(line);
        if line.is_empty() {
            return Some(HeaderEnd {
                header_len: line_start,
                consumed: line_end + 1,
            });
        }
        line_start = line_end + 1;
    }
    None
}
