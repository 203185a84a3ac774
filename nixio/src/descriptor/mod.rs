//! The unified descriptor handle.
//!
//! A [`Descriptor`] owns exactly one OS descriptor (a socket, a file or a pipe
//! end) together with the static metadata it was created with. Sockets, files
//! and pipes share the same handle type; operations that only make sense for
//! one kind check the [`Kind`] and fail with
//! [`ErrorKind::Unsupported`](crate::ErrorKind::Unsupported) otherwise.
//!
//! ```rust,no_run
//! use nixio::{Descriptor, Family, SockType};
//!
//! fn example() -> nixio::Result<()> {
//!     let (reader, writer) = Descriptor::pipe()?;
//!     writer.write(b"ping")?;
//!
//!     let mut buf = [0u8; 4];
//!     assert_eq!(reader.read(&mut buf)?, 4);
//!
//!     let sock = Descriptor::socket(Family::Inet, SockType::Stream, 0)?;
//!     sock.close()?;
//!     sock.close()?; // closing twice is a no-op
//!     Ok(())
//! }
//! ```
//!
//! # Release
//!
//! The raw descriptor is released deterministically: by [`Descriptor::close`]
//! or, at the latest, when the handle is dropped. An operation that is still
//! running on another thread keeps the raw descriptor alive until it returns,
//! so a closed handle can never act on a descriptor number the OS has already
//! handed out again.
//!
//! # Blocking mode
//!
//! Pipes and sockets are always non-blocking at the kernel level; a handle in
//! blocking mode waits for readiness itself, on the descriptor and on a cancel
//! pipe that [`Descriptor::close`] signals. Regular files follow the kernel
//! flag directly.
//!
//! # Threads
//!
//! A handle is meant to be driven by one thread at a time. The one exception
//! is [`Descriptor::close`]: share the handle through an `Arc` and close it from
//! another thread to cancel a blocked `accept`, `read`, `write`, `recv` or
//! `send`, which then fails with
//! [`ErrorKind::InvalidHandle`](crate::ErrorKind::InvalidHandle).

mod open_options;

pub use open_options::OpenOptions;

use std::ffi::CString;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{self, AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use std::{fmt, io};

use crate::error::{Error, ErrorKind, Result};
use crate::notifier::Notifier;
use crate::sync::Mutex;
use crate::util::{self, FileType};

/// What kind of kernel object a [`Descriptor`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
  /// A regular file, directory or device.
  File,
  /// One end of a pipe or FIFO.
  Pipe,
  Socket,
}

/// Socket address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
  /// Files, pipes and sockets of an unknown family.
  Unspecified,
  Inet,
  Inet6,
  /// Local (path addressed) sockets.
  Unix,
}

impl Family {
  pub const fn as_raw(self) -> libc::c_int {
    match self {
      Family::Unspecified => libc::AF_UNSPEC,
      Family::Inet => libc::AF_INET,
      Family::Inet6 => libc::AF_INET6,
      Family::Unix => libc::AF_UNIX,
    }
  }

  pub const fn from_raw(raw: libc::c_int) -> Option<Self> {
    match raw {
      libc::AF_UNSPEC => Some(Family::Unspecified),
      libc::AF_INET => Some(Family::Inet),
      libc::AF_INET6 => Some(Family::Inet6),
      libc::AF_UNIX => Some(Family::Unix),
      _ => None,
    }
  }
}

/// Socket type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SockType {
  /// Files, pipes and sockets of an unknown type.
  Unspecified,
  Stream,
  Datagram,
  SeqPacket,
  Raw,
}

impl SockType {
  pub const fn as_raw(self) -> libc::c_int {
    match self {
      SockType::Unspecified => 0,
      SockType::Stream => libc::SOCK_STREAM,
      SockType::Datagram => libc::SOCK_DGRAM,
      SockType::SeqPacket => libc::SOCK_SEQPACKET,
      SockType::Raw => libc::SOCK_RAW,
    }
  }

  pub const fn from_raw(raw: libc::c_int) -> Option<Self> {
    match raw {
      0 => Some(SockType::Unspecified),
      libc::SOCK_STREAM => Some(SockType::Stream),
      libc::SOCK_DGRAM => Some(SockType::Datagram),
      libc::SOCK_SEQPACKET => Some(SockType::SeqPacket),
      libc::SOCK_RAW => Some(SockType::Raw),
      _ => None,
    }
  }
}

/// Process-unique identity of a handle.
///
/// Unlike raw descriptor numbers, tokens are never reused, so a token can not
/// alias a handle created after the original was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub(crate) u64);

impl Token {
  fn next() -> Self {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    Token(NEXT.fetch_add(1, Ordering::Relaxed))
  }

  pub const fn get(self) -> u64 {
    self.0
  }
}

/// Something that must hear about a handle being closed while the raw
/// descriptor is still valid (a poller holding kernel registrations).
pub(crate) trait CloseWatcher: Send + Sync {
  fn descriptor_closed(&self, token: Token, fd: RawFd);
}

/// The raw descriptor. Released when the last in-flight user lets go.
pub(crate) struct Owned {
  fd: RawFd,
  should_close: AtomicBool,
}

impl Owned {
  fn new(fd: RawFd) -> Self {
    Self { fd, should_close: AtomicBool::new(true) }
  }

  pub(crate) fn fd(&self) -> RawFd {
    self.fd
  }

  /// Closes the descriptor now, reporting what close(2) said.
  fn release(self) -> io::Result<()> {
    self.should_close.store(false, Ordering::Release);
    match syscall!(close(self.fd)) {
      // The descriptor is gone even when close(2) is interrupted.
      Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(()),
      other => other.map(|_| ()),
    }
  }
}

impl Drop for Owned {
  fn drop(&mut self) {
    if self.should_close.load(Ordering::Acquire) {
      if let Err(err) = syscall!(close(self.fd)) {
        if err.kind() != io::ErrorKind::Interrupted {
          tracing::warn!(fd = self.fd, error = %err, "close(2) failed");
        }
      }
    }
  }
}

/// State shared by every handle referring to the same open file description
/// (the original and its duplicates).
#[derive(Debug, Default)]
pub(crate) struct Description {
  nonblocking: AtomicBool,
  read_timeout: Mutex<Option<Duration>>,
  write_timeout: Mutex<Option<Duration>>,
}

impl Description {
  pub(crate) fn new(nonblocking: bool) -> Arc<Self> {
    Arc::new(Self { nonblocking: AtomicBool::new(nonblocking), ..Default::default() })
  }
}

pub(crate) struct Shared {
  owned: Mutex<Option<Arc<Owned>>>,
  closed: AtomicBool,
  description: Arc<Description>,
  cancel: OnceLock<Notifier>,
  watchers: Mutex<Vec<Weak<dyn CloseWatcher>>>,
}

impl Shared {
  pub(crate) fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }
}

/// Direction a blocking operation waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wait {
  Read,
  Write,
}

/// A handle owning one OS descriptor.
///
/// See the [module documentation](self) for lifecycle and threading rules.
pub struct Descriptor {
  shared: Arc<Shared>,
  token: Token,
  kind: Kind,
  family: Family,
  socket_type: SockType,
  protocol: i32,
}

impl Descriptor {
  pub(crate) fn from_parts(
    fd: RawFd,
    kind: Kind,
    family: Family,
    socket_type: SockType,
    protocol: i32,
    description: Arc<Description>,
  ) -> Self {
    let token = Token::next();
    tracing::debug!(fd, token = token.0, ?kind, ?family, ?socket_type, protocol, "descriptor opened");
    Self {
      shared: Arc::new(Shared {
        owned: Mutex::new(Some(Arc::new(Owned::new(fd)))),
        closed: AtomicBool::new(false),
        description,
        cancel: OnceLock::new(),
        watchers: Mutex::new(Vec::new()),
      }),
      token,
      kind,
      family,
      socket_type,
      protocol,
    }
  }

  /// Opens the file at `path`.
  ///
  /// Shorthand for [`OpenOptions::open`].
  pub fn open(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
    options.open(path)
  }

  /// Creates a pipe, returning `(read end, write end)`.
  pub fn pipe() -> Result<(Self, Self)> {
    let [read, write] = util::pipe(true)?;
    Ok((Self::pipe_end(read), Self::pipe_end(write)))
  }

  fn pipe_end(fd: RawFd) -> Self {
    Self::from_parts(
      fd,
      Kind::Pipe,
      Family::Unspecified,
      SockType::Unspecified,
      0,
      Description::new(false),
    )
  }

  /// Wraps an existing raw descriptor, probing what it refers to.
  ///
  /// # Safety
  ///
  /// `fd` must be an open descriptor that nothing else will close.
  pub unsafe fn from_raw_fd(fd: RawFd) -> Result<Self> {
    let nonblocking = util::is_nonblocking(fd)?;
    let description = Description::new(nonblocking);
    let file_type = util::file_type(fd)?;
    if matches!(file_type, FileType::Fifo | FileType::Socket) {
      util::set_nonblocking(fd, true)?;
    }

    let handle = match file_type {
      FileType::Fifo => Self::from_parts(
        fd,
        Kind::Pipe,
        Family::Unspecified,
        SockType::Unspecified,
        0,
        description,
      ),
      FileType::Socket => {
        let (family, socket_type, protocol) = crate::net::query_socket(fd);
        Self::from_parts(fd, Kind::Socket, family, socket_type, protocol, description)
      }
      FileType::Regular | FileType::Other => Self::from_parts(
        fd,
        Kind::File,
        Family::Unspecified,
        SockType::Unspecified,
        0,
        description,
      ),
    };

    if handle.kind == Kind::Socket {
      crate::sockopt::load_timeouts(&handle);
    }
    Ok(handle)
  }

  /// Gives up ownership of the raw descriptor without closing it.
  ///
  /// The kernel blocking flag is set to match the handle's mode first. The
  /// handle counts as closed afterwards.
  pub fn into_raw_fd(self) -> Result<RawFd> {
    if self.kind != Kind::File {
      let owned = self.acquire()?;
      util::set_nonblocking(owned.fd, !self.is_blocking())?;
    }
    let owned = self.detach()?;
    owned.should_close.store(false, Ordering::Release);
    Ok(owned.fd)
  }

  pub fn token(&self) -> Token {
    self.token
  }

  pub fn kind(&self) -> Kind {
    self.kind
  }

  pub fn family(&self) -> Family {
    self.family
  }

  pub fn socket_type(&self) -> SockType {
    self.socket_type
  }

  pub fn protocol(&self) -> i32 {
    self.protocol
  }

  pub fn is_closed(&self) -> bool {
    self.shared.is_closed()
  }

  /// The raw descriptor number, or `None` once closed.
  pub fn raw_fd(&self) -> Option<RawFd> {
    self.shared.owned.lock().as_ref().map(|owned| owned.fd)
  }

  /// Closes the handle.
  ///
  /// Closing an already closed handle succeeds and does nothing. Blocked
  /// operations on other threads are woken and fail with `InvalidHandle`; if
  /// one is still running, the raw descriptor is released as soon as it
  /// returns.
  pub fn close(&self) -> Result<()> {
    let Ok(owned) = self.detach() else {
      return Ok(());
    };
    let fd = owned.fd;

    match Arc::try_unwrap(owned) {
      Ok(owned) => {
        tracing::debug!(fd, token = self.token.0, "descriptor closed");
        owned.release().map_err(Error::from)
      }
      Err(_in_flight) => {
        tracing::debug!(fd, token = self.token.0, "descriptor closed, release deferred to in-flight operation");
        Ok(())
      }
    }
  }

  /// Marks the handle closed, wakes blocked users and informs watchers, and
  /// hands back the raw descriptor which is still open at that point.
  fn detach(&self) -> Result<Arc<Owned>> {
    let owned = self.shared.owned.lock().take().ok_or_else(Error::closed)?;
    self.shared.closed.store(true, Ordering::SeqCst);
    atomic::fence(Ordering::SeqCst);

    if let Some(cancel) = self.shared.cancel.get() {
      let _ = cancel.notify();
    }

    let watchers = std::mem::take(&mut *self.shared.watchers.lock());
    for watcher in watchers.iter().filter_map(Weak::upgrade) {
      watcher.descriptor_closed(self.token, owned.fd);
    }
    Ok(owned)
  }

  /// Creates a new handle referring to the same open file description.
  ///
  /// The duplicate has its own token and lifecycle. Blocking mode lives on the
  /// shared description, so toggling it on one affects both.
  pub fn duplicate(&self) -> Result<Self> {
    let owned = self.acquire()?;
    let fd = syscall!(fcntl(owned.fd, libc::F_DUPFD_CLOEXEC, 0))?;
    Ok(Self::from_parts(
      fd,
      self.kind,
      self.family,
      self.socket_type,
      self.protocol,
      Arc::clone(&self.shared.description),
    ))
  }

  pub fn is_blocking(&self) -> bool {
    !self.shared.description.nonblocking.load(Ordering::Acquire)
  }

  /// Switches between blocking and non-blocking mode.
  pub fn set_blocking(&self, blocking: bool) -> Result<()> {
    let owned = self.acquire()?;
    if self.kind == Kind::File {
      util::set_nonblocking(owned.fd, !blocking)?;
    }
    self.shared.description.nonblocking.store(!blocking, Ordering::Release);
    Ok(())
  }

  /// Reads into `buf`. `Ok(0)` means end of stream (for a non-empty `buf`).
  pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
    if self.kind == Kind::Socket {
      return self.recv(buf, 0);
    }
    self.io_op(Wait::Read, |fd| {
      syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()))
        .map(|n| n as usize)
    })
  }

  /// Writes from `buf`, returning how many bytes the OS accepted.
  pub fn write(&self, buf: &[u8]) -> Result<usize> {
    if self.kind == Kind::Socket {
      return self.send(buf, 0);
    }
    self.io_op(Wait::Write, |fd| {
      syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len()))
        .map(|n| n as usize)
    })
  }

  /// Repositions the file offset, returning the new offset from the start.
  pub fn seek(&self, pos: io::SeekFrom) -> Result<u64> {
    self.require_kind(Kind::File, "seek")?;
    let owned = self.acquire()?;
    let (offset, whence) = match pos {
      io::SeekFrom::Start(n) => {
        let n = libc::off_t::try_from(n)
          .map_err(|_| Error::invalid("seek offset out of range"))?;
        (n, libc::SEEK_SET)
      }
      io::SeekFrom::Current(n) => (n as libc::off_t, libc::SEEK_CUR),
      io::SeekFrom::End(n) => (n as libc::off_t, libc::SEEK_END),
    };
    let res = syscall!(lseek(owned.fd, offset, whence))?;
    Ok(res as u64)
  }

  /// Reads from `offset` without moving the file offset.
  pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
    self.require_kind(Kind::File, "read_at")?;
    let offset = libc::off_t::try_from(offset)
      .map_err(|_| Error::invalid("read offset out of range"))?;
    self.io_op(Wait::Read, |fd| {
      syscall!(pread(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), offset))
        .map(|n| n as usize)
    })
  }

  /// Flushes file data and metadata to the storage device.
  pub fn sync(&self) -> Result<()> {
    let owned = self.acquire()?;
    syscall_retry!(fsync(owned.fd))?;
    Ok(())
  }

  /// Borrows the raw descriptor for the duration of one operation.
  pub(crate) fn acquire(&self) -> Result<Arc<Owned>> {
    self.shared.owned.lock().clone().ok_or_else(Error::closed)
  }

  pub(crate) fn shared(&self) -> &Arc<Shared> {
    &self.shared
  }

  pub(crate) fn require_kind(&self, kind: Kind, op: &'static str) -> Result<()> {
    if self.kind == kind {
      Ok(())
    } else {
      Err(Error::unsupported(format!("{op} is not supported on a {:?} handle", self.kind)))
    }
  }

  pub(crate) fn watch(&self, watcher: Weak<dyn CloseWatcher>) -> Result<()> {
    let mut watchers = self.shared.watchers.lock();
    if self.is_closed() {
      return Err(Error::closed());
    }
    watchers.retain(|w| w.strong_count() > 0 && !w.ptr_eq(&watcher));
    watchers.push(watcher);
    Ok(())
  }

  pub(crate) fn unwatch(&self, watcher: &Weak<dyn CloseWatcher>) {
    self.shared.watchers.lock().retain(|w| !w.ptr_eq(watcher));
  }

  pub(crate) fn set_cached_timeout(&self, wait: Wait, timeout: Option<Duration>) {
    let slot = match wait {
      Wait::Read => &self.shared.description.read_timeout,
      Wait::Write => &self.shared.description.write_timeout,
    };
    *slot.lock() = timeout;
  }

  fn cached_timeout(&self, wait: Wait) -> Option<Duration> {
    match wait {
      Wait::Read => *self.shared.description.read_timeout.lock(),
      Wait::Write => *self.shared.description.write_timeout.lock(),
    }
  }

  /// Runs one syscall against the raw descriptor, honoring the blocking mode.
  ///
  /// `op` always runs against a non-blocking descriptor (regular files
  /// aside). In blocking mode a `WouldBlock` makes the call wait for
  /// readiness on the descriptor and on the handle's cancel pipe, so that a
  /// concurrent [`close`](Self::close) can interrupt it, and then retry.
  pub(crate) fn io_op<T>(
    &self,
    wait: Wait,
    mut op: impl FnMut(RawFd) -> io::Result<T>,
  ) -> Result<T> {
    let owned = self.acquire()?;
    let fd = owned.fd;
    let emulate = self.waits_for_readiness();

    loop {
      match op(fd) {
        Ok(value) => return Ok(value),
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        Err(err) if err.kind() == io::ErrorKind::WouldBlock && emulate => {
          self.wait_ready(fd, wait)?;
        }
        Err(_) if self.is_closed() => return Err(Error::closed()),
        Err(err) => return Err(err.into()),
      }
    }
  }

  /// Whether a `WouldBlock` from the kernel should be waited out.
  pub(crate) fn waits_for_readiness(&self) -> bool {
    self.is_blocking() && self.kind != Kind::File
  }

  /// Polls the descriptor once without waiting. Regular files are always
  /// ready.
  pub(crate) fn is_ready(&self, wait: Wait) -> Result<bool> {
    if self.kind == Kind::File {
      return Ok(true);
    }
    let owned = self.acquire()?;
    let ready = util::poll_fd(owned.fd, poll_events(wait), None, Some(Duration::ZERO))?;
    Ok(ready)
  }

  /// Waits once for readiness, honoring the cached timeout, and fails with
  /// `InvalidHandle` if the handle is closed meanwhile.
  pub(crate) fn wait_for(&self, wait: Wait) -> Result<()> {
    if self.kind == Kind::File {
      return Ok(());
    }
    let owned = self.acquire()?;
    self.wait_ready(owned.fd, wait)
  }

  /// Blocks until the handle is writable, whatever its blocking mode and
  /// timeout.
  pub(crate) fn wait_writable(&self) -> Result<()> {
    let owned = self.acquire()?;
    loop {
      match self.wait_ready(owned.fd, Wait::Write) {
        Err(err) if err.is_would_block() => continue,
        other => return other,
      }
    }
  }

  fn wait_ready(&self, fd: RawFd, wait: Wait) -> Result<()> {
    let cancel = match self.shared.cancel.get() {
      Some(cancel) => cancel,
      None => {
        let _ = self.shared.cancel.set(Notifier::new()?);
        self.shared.cancel.get().ok_or_else(Error::closed)?
      }
    };
    // Pairs with the fence in `detach`: either close sees the cancel pipe and
    // notifies it, or this thread sees the closed flag.
    atomic::fence(Ordering::SeqCst);
    if self.is_closed() {
      return Err(Error::closed());
    }

    let timeout = self.cached_timeout(wait);
    let ready = util::poll_fd(fd, poll_events(wait), Some(cancel.read_fd()), timeout)?;

    if self.is_closed() {
      Err(Error::closed())
    } else if ready {
      Ok(())
    } else if timeout.is_some() {
      Err(Error::with_code(ErrorKind::WouldBlock, libc::EAGAIN, "operation timed out"))
    } else {
      // Woken without readiness; let the caller retry the syscall.
      Ok(())
    }
  }
}

impl AsRawFd for Descriptor {
  /// Returns `-1` once the handle is closed.
  fn as_raw_fd(&self) -> RawFd {
    self.raw_fd().unwrap_or(-1)
  }
}

impl Drop for Descriptor {
  fn drop(&mut self) {
    let _ = self.close();
  }
}

impl fmt::Debug for Descriptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Descriptor")
      .field("fd", &self.raw_fd())
      .field("token", &self.token.0)
      .field("kind", &self.kind)
      .field("family", &self.family)
      .field("socket_type", &self.socket_type)
      .field("protocol", &self.protocol)
      .finish()
  }
}

fn poll_events(wait: Wait) -> libc::c_short {
  match wait {
    Wait::Read => libc::POLLIN,
    Wait::Write => libc::POLLOUT,
  }
}

pub(crate) fn path_to_cstring(path: &Path) -> Result<CString> {
  CString::new(path.as_os_str().as_bytes())
    .map_err(|_| Error::invalid("path contains an interior NUL byte"))
}
