//! Moving bytes between two handles, inside the kernel where the platform
//! allows it.
//!
//! On Linux, [`SpliceEngine::transfer`] uses splice(2) when either end is a
//! pipe and sendfile(2) when the source is a regular file. Everything else,
//! and every other platform, goes through a user-space buffer. When the
//! kernel refuses a zero-copy path before the first byte moved, the transfer
//! continues with the buffered strategy.
//!
//! ```rust,no_run
//! use nixio::{Descriptor, SpliceEngine};
//!
//! let (reader, writer) = Descriptor::pipe()?;
//! let (a, b) = Descriptor::socket_pair(nixio::Family::Unix, nixio::SockType::Stream)?;
//! writer.write(b"payload")?;
//! writer.close()?;
//!
//! let engine = SpliceEngine::new();
//! assert_eq!(engine.transfer(&reader, &a, usize::MAX)?, 7);
//! # drop(b);
//! # Ok::<(), nixio::Error>(())
//! ```

#[cfg(linux)]
use std::os::fd::RawFd;
#[cfg(linux)]
use std::ptr;

use crate::descriptor::{Descriptor, Kind};
#[cfg(linux)]
use crate::descriptor::Wait;
use crate::error::{Error, ErrorKind, Result};
use crate::io::BufferedIo;
use crate::sync::Mutex;

/// Bytes moved per syscall unless configured otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// How a transfer moved its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// splice(2) through a pipe end.
  Splice,
  /// sendfile(2) out of a regular file.
  Sendfile,
  /// read(2) and write(2) through a [`BufferedIo`] staging buffer.
  Buffered,
}

impl Strategy {
  fn is_zero_copy(self) -> bool {
    !matches!(self, Strategy::Buffered)
  }
}

#[derive(Debug, Clone)]
pub struct SpliceEngineBuilder {
  chunk_size: usize,
  zero_copy: bool,
}

impl SpliceEngineBuilder {
  /// Upper bound on the bytes moved by one syscall.
  pub const fn chunk_size(mut self, chunk_size: usize) -> Self {
    self.chunk_size = chunk_size;
    self
  }

  /// Whether splice(2)/sendfile(2) may be attempted. Defaults to `true`.
  pub const fn zero_copy(mut self, enabled: bool) -> Self {
    self.zero_copy = enabled;
    self
  }

  pub fn build(self) -> Result<SpliceEngine> {
    if self.chunk_size == 0 {
      return Err(Error::invalid("chunk size must be non-zero"));
    }
    Ok(SpliceEngine {
      chunk_size: self.chunk_size,
      zero_copy: self.zero_copy,
      last: Mutex::new(None),
    })
  }
}

/// Forwards bytes from one handle to another.
#[derive(Debug)]
pub struct SpliceEngine {
  chunk_size: usize,
  zero_copy: bool,
  last: Mutex<Option<Strategy>>,
}

impl Default for SpliceEngine {
  fn default() -> Self {
    Self::new()
  }
}

impl SpliceEngine {
  pub fn new() -> Self {
    Self { chunk_size: DEFAULT_CHUNK_SIZE, zero_copy: true, last: Mutex::new(None) }
  }

  pub const fn builder() -> SpliceEngineBuilder {
    SpliceEngineBuilder { chunk_size: DEFAULT_CHUNK_SIZE, zero_copy: true }
  }

  pub fn chunk_size(&self) -> usize {
    self.chunk_size
  }

  /// The strategy the most recent transfer finished with.
  pub fn last_strategy(&self) -> Option<Strategy> {
    *self.last.lock()
  }

  /// Moves up to `max` bytes from `source` to `destination`.
  ///
  /// Stops at `max`, at end of stream or when a non-blocking handle would
  /// block, and returns how many bytes were forwarded. An error is returned
  /// only if nothing was forwarded; a transfer that made progress reports the
  /// progress instead.
  pub fn transfer(&self, source: &Descriptor, destination: &Descriptor, max: usize) -> Result<usize> {
    let strategy = self.choose(source, destination);
    self.run(Transfer::new(source, destination, None, strategy), max)
  }

  /// Sends up to `len` bytes of `file` starting at `offset`, leaving the file
  /// offset untouched.
  pub fn sendfile(
    &self,
    destination: &Descriptor,
    file: &Descriptor,
    offset: u64,
    len: usize,
  ) -> Result<usize> {
    file.require_kind(Kind::File, "sendfile")?;
    let strategy =
      if self.zero_copy && cfg!(linux) { Strategy::Sendfile } else { Strategy::Buffered };
    self.run(Transfer::new(file, destination, Some(offset), strategy), len)
  }

  #[cfg_attr(not(linux), allow(unused_variables))]
  fn choose(&self, source: &Descriptor, destination: &Descriptor) -> Strategy {
    if !self.zero_copy {
      return Strategy::Buffered;
    }
    #[cfg(linux)]
    {
      if source.kind() == Kind::Pipe || destination.kind() == Kind::Pipe {
        return Strategy::Splice;
      }
      if source.kind() == Kind::File {
        return Strategy::Sendfile;
      }
    }
    Strategy::Buffered
  }

  fn run(&self, mut transfer: Transfer<'_>, max: usize) -> Result<usize> {
    transfer.src.acquire()?;
    transfer.dst.acquire()?;
    tracing::debug!(
      source = transfer.src.token().get(),
      destination = transfer.dst.token().get(),
      strategy = ?transfer.strategy,
      max,
      "transfer started"
    );

    let result = loop {
      if transfer.moved >= max {
        break Ok(transfer.moved);
      }
      let len = self.chunk_size.min(max - transfer.moved);
      match transfer.step(len) {
        Ok(true) => {}
        Ok(false) => break Ok(transfer.moved),
        Err(err) if transfer.moved == 0 && transfer.can_fall_back(&err) => {
          tracing::debug!(
            strategy = ?transfer.strategy,
            error = %err,
            "zero-copy refused, continuing with buffered copy"
          );
          transfer.strategy = Strategy::Buffered;
        }
        Err(err) if transfer.moved > 0 => {
          tracing::trace!(moved = transfer.moved, error = %err, "transfer stopped early");
          break Ok(transfer.moved);
        }
        Err(err) => break Err(err),
      }
    };

    *self.last.lock() = Some(transfer.strategy);
    tracing::trace!(strategy = ?transfer.strategy, moved = transfer.moved, "transfer finished");
    result
  }
}

struct Transfer<'a> {
  src: &'a Descriptor,
  dst: &'a Descriptor,
  /// Explicit source position; `None` reads at the current offset.
  offset: Option<u64>,
  strategy: Strategy,
  moved: usize,
}

impl<'a> Transfer<'a> {
  fn new(src: &'a Descriptor, dst: &'a Descriptor, offset: Option<u64>, strategy: Strategy) -> Self {
    Self { src, dst, offset, strategy, moved: 0 }
  }

  /// Moves up to `len` bytes. `Ok(false)` means the source is exhausted.
  fn step(&mut self, len: usize) -> Result<bool> {
    if self.strategy == Strategy::Buffered {
      return self.copy_chunk(len);
    }
    let n = self.zero_copy_chunk(len)?;
    self.advance(n);
    Ok(n > 0)
  }

  #[cfg(linux)]
  fn zero_copy_chunk(&self, len: usize) -> Result<usize> {
    match self.strategy {
      Strategy::Sendfile => sendfile_chunk(self.dst, self.src, self.offset, len),
      _ => splice_chunk(self.src, self.dst, len),
    }
  }

  #[cfg(not(linux))]
  fn zero_copy_chunk(&self, _len: usize) -> Result<usize> {
    Err(Error::unsupported("zero-copy transfer is not available on this platform"))
  }

  /// Reads one chunk and writes all of it through a staging buffer, waiting
  /// for the destination when it would block so that no byte read is
  /// dropped. Only bytes that reached the destination count as moved.
  fn copy_chunk(&mut self, len: usize) -> Result<bool> {
    let data = match self.offset {
      Some(offset) => {
        let mut buf = vec![0u8; len];
        let n = self.src.read_at(&mut buf, offset)?;
        buf.truncate(n);
        buf
      }
      // A capacity of `len` makes the read go straight to the handle, so
      // nothing beyond the chunk is taken from the source.
      None => BufferedIo::with_capacity(len, self.src).read(len)?,
    };
    if data.is_empty() {
      return Ok(false);
    }

    let mut out = BufferedIo::with_capacity(len, self.dst);
    let mut accepted = 0;
    let result = loop {
      let step = if accepted < data.len() {
        out.write(&data[accepted..]).and_then(|n| match n {
          0 => Err(Error::new(ErrorKind::Os, "destination accepted zero bytes")),
          n => {
            accepted += n;
            Ok(())
          }
        })
      } else {
        match out.flush() {
          Ok(()) => break Ok(true),
          Err(err) => Err(err),
        }
      };
      match step {
        Ok(()) => {}
        Err(err) if err.is_would_block() => {
          if let Err(err) = self.dst.wait_writable() {
            break Err(err);
          }
        }
        Err(err) => break Err(err),
      }
    };

    let unsent = out.discard_write();
    self.advance(accepted - unsent);
    result
  }

  fn advance(&mut self, n: usize) {
    self.moved += n;
    if let Some(offset) = self.offset.as_mut() {
      *offset += n as u64;
    }
  }

  fn can_fall_back(&self, err: &Error) -> bool {
    self.strategy.is_zero_copy()
      && !self.src.is_closed()
      && !self.dst.is_closed()
      && matches!(
        err.raw_os_error(),
        Some(libc::EINVAL | libc::ENOSYS | libc::EOPNOTSUPP | libc::EXDEV | libc::EBADF)
      )
  }
}

#[cfg(linux)]
fn splice_chunk(src: &Descriptor, dst: &Descriptor, len: usize) -> Result<usize> {
  pump(src, dst, |fd_in, fd_out| {
    syscall!(splice(fd_in, ptr::null_mut(), fd_out, ptr::null_mut(), len, libc::SPLICE_F_MOVE))
      .map(|n| n as usize)
  })
}

#[cfg(linux)]
fn sendfile_chunk(
  dst: &Descriptor,
  file: &Descriptor,
  offset: Option<u64>,
  len: usize,
) -> Result<usize> {
  let mut offset = offset
    .map(libc::off_t::try_from)
    .transpose()
    .map_err(|_| Error::invalid("file offset out of range"))?;
  pump(file, dst, |fd_in, fd_out| {
    let offset_ptr = offset.as_mut().map_or(ptr::null_mut(), |o| o as *mut libc::off_t);
    syscall!(sendfile(fd_out, fd_in, offset_ptr, len)).map(|n| n as usize)
  })
}

/// Runs one zero-copy syscall between two non-blocking descriptors.
///
/// On `WouldBlock` the stalled end decides: a blocking one is waited for
/// (cancelled by closing either handle), a non-blocking one ends the call.
#[cfg(linux)]
fn pump(
  src: &Descriptor,
  dst: &Descriptor,
  mut op: impl FnMut(RawFd, RawFd) -> std::io::Result<usize>,
) -> Result<usize> {
  let input = src.acquire()?;
  let output = dst.acquire()?;
  loop {
    match op(input.fd(), output.fd()) {
      Ok(n) => return Ok(n),
      Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
      Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
        let (stalled, wait) =
          if src.is_ready(Wait::Read)? { (dst, Wait::Write) } else { (src, Wait::Read) };
        if !stalled.waits_for_readiness() {
          return Err(err.into());
        }
        stalled.wait_for(wait)?;
        if src.is_closed() || dst.is_closed() {
          return Err(Error::closed());
        }
      }
      Err(_) if src.is_closed() || dst.is_closed() => return Err(Error::closed()),
      Err(err) => return Err(err.into()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::descriptor::OpenOptions;
  use crate::test_utils::{init_test_logging, temp_path, unix_stream_pair};
  use crate::{Family, SockType};

  fn read_all(handle: &Descriptor) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
      let n = handle.read(&mut buf).unwrap();
      if n == 0 {
        return out;
      }
      out.extend_from_slice(&buf[..n]);
    }
  }

  fn file_with(contents: &[u8]) -> (std::path::PathBuf, Descriptor) {
    let path = temp_path("splice");
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(true)
      .open(&path)
      .unwrap();
    assert_eq!(file.write(contents).unwrap(), contents.len());
    file.seek(std::io::SeekFrom::Start(0)).unwrap();
    (path, file)
  }

  #[test]
  fn pipe_to_pipe() {
    init_test_logging();
    let (src_r, src_w) = Descriptor::pipe().unwrap();
    let (dst_r, dst_w) = Descriptor::pipe().unwrap();
    src_w.write(b"through the kernel").unwrap();
    src_w.close().unwrap();

    let engine = SpliceEngine::builder().chunk_size(4).build().unwrap();
    assert_eq!(engine.transfer(&src_r, &dst_w, usize::MAX).unwrap(), 18);
    dst_w.close().unwrap();
    assert_eq!(read_all(&dst_r), b"through the kernel");

    let expected = if cfg!(linux) { Strategy::Splice } else { Strategy::Buffered };
    assert_eq!(engine.last_strategy(), Some(expected));
  }

  #[test]
  fn zero_copy_can_be_disabled() {
    let (src_r, src_w) = Descriptor::pipe().unwrap();
    let (a, b) = unix_stream_pair();
    src_w.write(b"copy").unwrap();
    src_w.close().unwrap();

    let engine = SpliceEngine::builder().zero_copy(false).build().unwrap();
    assert_eq!(engine.transfer(&src_r, &a, 100).unwrap(), 4);
    assert_eq!(engine.last_strategy(), Some(Strategy::Buffered));

    let mut buf = [0u8; 4];
    b.read(&mut buf).unwrap();
    assert_eq!(&buf, b"copy");
  }

  #[test]
  fn stops_at_max() {
    let (src_r, src_w) = Descriptor::pipe().unwrap();
    let (dst_r, dst_w) = Descriptor::pipe().unwrap();
    src_w.write(b"0123456789").unwrap();

    let engine = SpliceEngine::builder().chunk_size(3).build().unwrap();
    assert_eq!(engine.transfer(&src_r, &dst_w, 7).unwrap(), 7);
    assert_eq!(engine.transfer(&src_r, &dst_w, 0).unwrap(), 0);

    let mut buf = [0u8; 16];
    assert_eq!(dst_r.read(&mut buf).unwrap(), 7);
    assert_eq!(&buf[..7], b"0123456");
  }

  #[test]
  fn empty_non_blocking_source_would_block() {
    let (src_r, _src_w) = Descriptor::pipe().unwrap();
    let (_dst_r, dst_w) = Descriptor::pipe().unwrap();
    src_r.set_blocking(false).unwrap();

    for engine in [SpliceEngine::new(), SpliceEngine::builder().zero_copy(false).build().unwrap()] {
      let err = engine.transfer(&src_r, &dst_w, 64).unwrap_err();
      assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }
  }

  #[test]
  fn progress_wins_over_would_block() {
    let (src_r, src_w) = Descriptor::pipe().unwrap();
    let (a, _b) = unix_stream_pair();
    src_r.set_blocking(false).unwrap();
    src_w.write(b"partial").unwrap();

    let engine = SpliceEngine::new();
    assert_eq!(engine.transfer(&src_r, &a, 1024).unwrap(), 7);
  }

  #[test]
  fn closed_handles_are_rejected() {
    let (src_r, _src_w) = Descriptor::pipe().unwrap();
    let (_dst_r, dst_w) = Descriptor::pipe().unwrap();
    dst_w.close().unwrap();

    let err = SpliceEngine::new().transfer(&src_r, &dst_w, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);
  }

  #[test]
  fn file_to_socket() {
    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let (path, file) = file_with(&payload);
    let (a, b) = Descriptor::socket_pair(Family::Unix, SockType::Stream).unwrap();

    let reader = std::thread::spawn(move || read_all(&b));
    let engine = SpliceEngine::builder().chunk_size(4096).build().unwrap();
    assert_eq!(engine.transfer(&file, &a, usize::MAX).unwrap(), payload.len());
    a.close().unwrap();
    assert_eq!(reader.join().unwrap(), payload);

    let expected = if cfg!(linux) { Strategy::Sendfile } else { Strategy::Buffered };
    assert_eq!(engine.last_strategy(), Some(expected));
    std::fs::remove_file(path).ok();
  }

  #[cfg(linux)]
  #[test]
  fn refused_splice_falls_back_to_buffered() {
    init_test_logging();
    let path = temp_path("append");
    // splice(2) refuses destinations opened for appending.
    let dst = OpenOptions::new().append(true).create(true).open(&path).unwrap();
    let (src_r, src_w) = Descriptor::pipe().unwrap();
    src_w.write(b"appended").unwrap();
    src_w.close().unwrap();

    let engine = SpliceEngine::new();
    assert_eq!(engine.transfer(&src_r, &dst, usize::MAX).unwrap(), 8);
    assert_eq!(engine.last_strategy(), Some(Strategy::Buffered));
    assert_eq!(std::fs::read(&path).unwrap(), b"appended");
    std::fs::remove_file(path).ok();
  }

  #[test]
  fn sendfile_reads_at_offset() {
    let (path, file) = file_with(b"0123456789");
    let (dst_r, dst_w) = Descriptor::pipe().unwrap();

    for engine in [SpliceEngine::new(), SpliceEngine::builder().zero_copy(false).build().unwrap()] {
      assert_eq!(engine.sendfile(&dst_w, &file, 3, 4).unwrap(), 4);
      let mut buf = [0u8; 4];
      assert_eq!(dst_r.read(&mut buf).unwrap(), 4);
      assert_eq!(&buf, b"3456");
      assert_eq!(file.seek(std::io::SeekFrom::Current(0)).unwrap(), 0);
    }

    assert_eq!(SpliceEngine::new().sendfile(&dst_w, &file, 8, 100).unwrap(), 2);
    std::fs::remove_file(path).ok();
  }

  #[test]
  fn sendfile_requires_a_file() {
    let (src_r, _src_w) = Descriptor::pipe().unwrap();
    let (_dst_r, dst_w) = Descriptor::pipe().unwrap();
    let err = SpliceEngine::new().sendfile(&dst_w, &src_r, 0, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
  }

  #[test]
  fn buffered_copy_waits_out_a_full_destination() {
    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
    let (src_r, src_w) = Descriptor::pipe().unwrap();
    let (a, b) = unix_stream_pair();
    a.set_blocking(false).unwrap();

    let writer = {
      let payload = payload.clone();
      std::thread::spawn(move || {
        let mut sent = 0;
        while sent < payload.len() {
          sent += src_w.write(&payload[sent..]).unwrap();
        }
      })
    };
    let reader = std::thread::spawn(move || {
      std::thread::sleep(std::time::Duration::from_millis(50));
      read_all(&b)
    });

    let engine = SpliceEngine::builder().chunk_size(1000).zero_copy(false).build().unwrap();
    assert_eq!(engine.transfer(&src_r, &a, usize::MAX).unwrap(), payload.len());
    assert_eq!(engine.last_strategy(), Some(Strategy::Buffered));
    a.close().unwrap();

    writer.join().unwrap();
    assert_eq!(reader.join().unwrap(), payload);
  }

  #[test]
  fn zero_chunk_size_is_rejected() {
    let err = SpliceEngine::builder().chunk_size(0).build().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
  }
}
