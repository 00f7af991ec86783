//! Buffered byte reader with line/column tracking.

use std::io::{self, ErrorKind, Read};

const BUF_SIZE: usize = 64 * 1024;

/// Incremental single-byte reader over any [`Read`] source.
///
/// Tracks a 1-based line and column for parse diagnostics; a line feed
/// advances the line counter and resets the column.
pub(crate) struct ByteReader<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    len: usize,
    eof: bool,
    line: u32,
    col: u32,
}

impl<R: Read> ByteReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: vec![0; BUF_SIZE],
            pos: 0,
            len: 0,
            eof: false,
            line: 1,
            col: 1,
        }
    }

    /// Line of the next unconsumed byte, 1-based.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Column of the next unconsumed byte, 1-based.
    pub fn col(&self) -> u32 {
        self.col
    }

    fn fill(&mut self) -> io::Result<()> {
        if self.pos < self.len || self.eof {
            return Ok(());
        }
        loop {
            match self.inner.read(&mut self.buf) {
                Ok(0) => {
                    self.eof = true;
                    self.pos = 0;
                    self.len = 0;
                    return Ok(());
                }
                Ok(n) => {
                    self.pos = 0;
                    self.len = n;
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// The next byte without consuming it, `None` at end of input.
    pub fn peek(&mut self) -> io::Result<Option<u8>> {
        self.fill()?;
        Ok((self.pos < self.len).then(|| self.buf[self.pos]))
    }

    /// Consume and return the next byte, `None` at end of input.
    pub fn next(&mut self) -> io::Result<Option<u8>> {
        let b = self.peek()?;
        if let Some(c) = b {
            self.pos += 1;
            if c == b'\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
        }
        Ok(b)
    }
}
