//! Self-pipe used to wake up a thread blocked in a readiness wait.
//!
//! Both the [`Poller`](crate::poll::Poller) and blocking descriptor operations
//! watch the read end; any thread can write to it to interrupt them. A pipe is
//! used on every platform so the same notifier can be watched by epoll, kqueue,
//! poll(2) and select(2) alike.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::util;

/// Special key used to identify notification events
pub const NOTIFY_KEY: u64 = u64::MAX;

pub struct Notifier {
  read_fd: OwnedFd,
  write_fd: OwnedFd,
}

impl Notifier {
  pub fn new() -> io::Result<Self> {
    let [read, write] = util::pipe(true)?;

    // SAFETY: both ends were just created and are owned by nobody else.
    Ok(Self {
      read_fd: unsafe { OwnedFd::from_raw_fd(read) },
      write_fd: unsafe { OwnedFd::from_raw_fd(write) },
    })
  }

  /// The descriptor to watch for readability.
  pub fn read_fd(&self) -> RawFd {
    self.read_fd.as_raw_fd()
  }

  /// Trigger a notification by writing to the pipe
  pub fn notify(&self) -> io::Result<()> {
    let byte: u8 = 1;
    let result = syscall!(write(
      self.write_fd.as_raw_fd(),
      &byte as *const u8 as *const libc::c_void,
      1,
    ));

    match result {
      // A full pipe already guarantees a pending wakeup.
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
      other => other.map(|_| ()),
    }
  }

  /// Consume every pending notification.
  pub fn drain(&self) {
    let mut buf = [0u8; 64];
    loop {
      match syscall!(read(
        self.read_fd.as_raw_fd(),
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
      )) {
        Ok(n) if n as usize == buf.len() => continue,
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        _ => break,
      }
    }
  }
}

impl std::fmt::Debug for Notifier {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Notifier")
      .field("read_fd", &self.read_fd.as_raw_fd())
      .field("write_fd", &self.write_fd.as_raw_fd())
      .finish()
  }
}
