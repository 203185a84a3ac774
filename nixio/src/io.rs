//! Buffered reads, line reads and writes over a [`Descriptor`].
//!
//! ```rust,no_run
//! use nixio::{BufferedIo, Descriptor};
//!
//! let (reader, writer) = Descriptor::pipe()?;
//! let mut out = BufferedIo::new(&writer);
//! out.write(b"first\nsecond\n")?;
//! out.flush()?;
//!
//! let mut input = BufferedIo::new(&reader);
//! assert_eq!(input.read_line(b'\n')?, b"first\n");
//! assert_eq!(input.read_line(b'\n')?, b"second\n");
//! # Ok::<(), nixio::Error>(())
//! ```

use std::io;

use crate::descriptor::Descriptor;
use crate::error::{Error, ErrorKind, Result};

/// Default staging buffer size.
pub const BUFFER_SIZE: usize = 8096;

/// Staging buffers in front of a handle.
///
/// Short reads are success and an empty result means end of stream;
/// [`ErrorKind::WouldBlock`] from a non-blocking handle is reported as an
/// error and never loses data: a line cut short by it is kept and completed
/// by the next [`read_line`](Self::read_line).
pub struct BufferedIo<'a> {
  handle: &'a Descriptor,
  capacity: usize,
  /// Bytes read from the handle but not yet returned: `read_buf[read_pos..]`.
  read_buf: Vec<u8>,
  read_pos: usize,
  /// A line under construction.
  line: Vec<u8>,
  write_buf: Vec<u8>,
}

impl<'a> BufferedIo<'a> {
  pub fn new(handle: &'a Descriptor) -> Self {
    Self::with_capacity(BUFFER_SIZE, handle)
  }

  pub fn with_capacity(capacity: usize, handle: &'a Descriptor) -> Self {
    let capacity = capacity.max(1);
    Self {
      handle,
      capacity,
      read_buf: Vec::with_capacity(capacity),
      read_pos: 0,
      line: Vec::new(),
      write_buf: Vec::with_capacity(capacity),
    }
  }

  pub fn get_ref(&self) -> &'a Descriptor {
    self.handle
  }

  /// Bytes staged for reading.
  pub fn buffered_read(&self) -> usize {
    self.line.len() + self.read_buf.len() - self.read_pos
  }

  /// Bytes staged for writing.
  pub fn buffered_write(&self) -> usize {
    self.write_buf.len()
  }

  /// Reads up to `max` bytes. An empty result means end of stream
  /// (`max == 0` returns empty without touching the handle).
  pub fn read(&mut self, max: usize) -> Result<Vec<u8>> {
    if max == 0 {
      return Ok(Vec::new());
    }
    if !self.line.is_empty() {
      let n = max.min(self.line.len());
      return Ok(self.line.drain(..n).collect());
    }
    if self.read_pos < self.read_buf.len() {
      return Ok(self.take_staged(max));
    }

    if max >= self.capacity {
      let mut out = vec![0u8; max];
      let n = self.handle.read(&mut out)?;
      out.truncate(n);
      return Ok(out);
    }

    self.fill()?;
    Ok(self.take_staged(max))
  }

  /// Reads one line including `delimiter`.
  ///
  /// At end of stream the remaining bytes are returned without a delimiter;
  /// an empty result means the stream is exhausted.
  pub fn read_line(&mut self, delimiter: u8) -> Result<Vec<u8>> {
    loop {
      let staged = &self.read_buf[self.read_pos..];
      if let Some(at) = staged.iter().position(|&b| b == delimiter) {
        self.line.extend_from_slice(&staged[..=at]);
        self.read_pos += at + 1;
        return Ok(std::mem::take(&mut self.line));
      }
      self.line.extend_from_slice(staged);
      self.read_pos = self.read_buf.len();

      if self.fill()? == 0 {
        return Ok(std::mem::take(&mut self.line));
      }
    }
  }

  /// Stages `data` for writing and returns how many bytes were accepted.
  ///
  /// Accepted bytes are written exactly once, by a later call, by
  /// [`flush`](Self::flush) or (best effort) on drop. Fewer bytes than
  /// offered may be accepted; `WouldBlock` is returned only when nothing
  /// could be accepted.
  pub fn write(&mut self, data: &[u8]) -> Result<usize> {
    if data.is_empty() {
      return Ok(0);
    }
    if self.write_buf.len() + data.len() > self.capacity {
      match self.flush() {
        Ok(()) => {}
        Err(err) if err.is_would_block() && self.write_buf.len() < self.capacity => {}
        Err(err) => return Err(err),
      }
    }

    if self.write_buf.is_empty() && data.len() >= self.capacity {
      return self.handle.write(data);
    }

    let n = (self.capacity - self.write_buf.len()).min(data.len());
    self.write_buf.extend_from_slice(&data[..n]);
    Ok(n)
  }

  /// Writes out every staged byte. On error the bytes not yet written stay
  /// staged.
  pub fn flush(&mut self) -> Result<()> {
    while !self.write_buf.is_empty() {
      let n = self.handle.write(&self.write_buf)?;
      if n == 0 {
        return Err(Error::new(ErrorKind::Os, "handle accepted zero bytes"));
      }
      self.write_buf.drain(..n);
    }
    Ok(())
  }

  /// Drops the staged write bytes without writing them, returning how many
  /// there were.
  pub(crate) fn discard_write(&mut self) -> usize {
    let n = self.write_buf.len();
    self.write_buf.clear();
    n
  }

  /// One read from the handle into the (drained) staging buffer.
  fn fill(&mut self) -> Result<usize> {
    self.read_buf.resize(self.capacity, 0);
    self.read_pos = 0;
    match self.handle.read(&mut self.read_buf) {
      Ok(n) => {
        self.read_buf.truncate(n);
        Ok(n)
      }
      Err(err) => {
        self.read_buf.clear();
        Err(err)
      }
    }
  }

  fn take_staged(&mut self, max: usize) -> Vec<u8> {
    let end = (self.read_pos + max).min(self.read_buf.len());
    let out = self.read_buf[self.read_pos..end].to_vec();
    self.read_pos = end;
    out
  }
}

impl Drop for BufferedIo<'_> {
  fn drop(&mut self) {
    if let Err(err) = self.flush() {
      tracing::debug!(
        token = self.handle.token().get(),
        lost = self.write_buf.len(),
        error = %err,
        "flush on drop failed"
      );
    }
  }
}

impl io::Read for BufferedIo<'_> {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    let data = BufferedIo::read(self, buf.len())?;
    buf[..data.len()].copy_from_slice(&data);
    Ok(data.len())
  }
}

impl io::Write for BufferedIo<'_> {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    Ok(BufferedIo::write(self, buf)?)
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(BufferedIo::flush(self)?)
  }
}

impl io::Read for &Descriptor {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    Ok(Descriptor::read(self, buf)?)
  }
}

impl io::Write for &Descriptor {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    Ok(Descriptor::write(self, buf)?)
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_utils::unix_stream_pair;

  #[test]
  fn short_reads_and_eof() {
    let (reader, writer) = Descriptor::pipe().unwrap();
    writer.write(b"abc").unwrap();
    writer.close().unwrap();

    let mut input = BufferedIo::new(&reader);
    assert_eq!(input.read(2).unwrap(), b"ab");
    assert_eq!(input.read(100).unwrap(), b"c");
    assert!(input.read(100).unwrap().is_empty());
  }

  #[test]
  fn lines_keep_delimiter_and_tail() {
    let (reader, writer) = Descriptor::pipe().unwrap();
    writer.write(b"one\ntwo\nthree").unwrap();
    writer.close().unwrap();

    let mut input = BufferedIo::with_capacity(4, &reader);
    assert_eq!(input.read_line(b'\n').unwrap(), b"one\n");
    assert_eq!(input.read_line(b'\n').unwrap(), b"two\n");
    assert_eq!(input.read_line(b'\n').unwrap(), b"three");
    assert!(input.read_line(b'\n').unwrap().is_empty());
  }

  #[test]
  fn partial_line_survives_would_block() {
    let (a, b) = unix_stream_pair();
    b.set_blocking(false).unwrap();
    let mut input = BufferedIo::new(&b);

    a.write(b"hel").unwrap();
    let err = input.read_line(b'\n').unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WouldBlock);
    assert_eq!(input.buffered_read(), 3);

    a.write(b"lo\nrest").unwrap();
    assert_eq!(input.read_line(b'\n').unwrap(), b"hello\n");
    assert_eq!(input.read(16).unwrap(), b"rest");
  }

  #[test]
  fn staged_writes_flush_on_drop() {
    let (reader, writer) = Descriptor::pipe().unwrap();
    {
      let mut out = BufferedIo::new(&writer);
      assert_eq!(out.write(b"staged").unwrap(), 6);
      assert_eq!(out.buffered_write(), 6);
    }
    let mut buf = [0u8; 6];
    assert_eq!(reader.read(&mut buf).unwrap(), 6);
    assert_eq!(&buf, b"staged");
  }

  #[test]
  fn write_reports_would_block_only_when_nothing_fits() {
    let (a, _b) = unix_stream_pair();
    a.set_blocking(false).unwrap();
    let mut out = BufferedIo::with_capacity(16, &a);

    let chunk = [7u8; 4096];
    let mut accepted = 0usize;
    let err = loop {
      match out.write(&chunk) {
        Ok(n) => {
          assert!(n > 0);
          accepted += n;
        }
        Err(err) => break err,
      }
    };
    assert_eq!(err.kind(), ErrorKind::WouldBlock);
    assert!(accepted > 0);
    assert!(out.buffered_write() <= 16);
  }
}
