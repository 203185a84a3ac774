//! OS readiness mechanisms.
//!
//! Every backend implements [`Selector`]: a level-triggered registration table
//! keyed by `u64`, plus a notifier that wakes a blocked [`Selector::wait`].
//! Readiness is reported as `(key, Readiness)` pairs; the notifier shows up
//! under [`NOTIFY_KEY`]. A key may appear more than once (kqueue reports one
//! event per filter); the [`Poller`](super::Poller) merges them.

#[cfg(epoll)]
pub(crate) mod epoll;
#[cfg(kqueue)]
pub(crate) mod kqueue;
pub(crate) mod poll;
pub(crate) mod select;

#[cfg(test)]
pub(crate) mod tests;

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::Duration;

use super::{Interest, Readiness};
use crate::error::{Error, Result};
use crate::sync::Mutex;

pub(crate) use crate::notifier::NOTIFY_KEY;

/// Regular files registered with a backend that can not wait on them.
///
/// A regular file is always ready for reading and writing; poll(2) and
/// select(2) report it that way. epoll refuses regular files and kqueue only
/// reports unread data, so those backends keep them here and report them on
/// every wait.
#[cfg(any(epoll, kqueue))]
#[derive(Default)]
pub(crate) struct RegularFiles {
  entries: Mutex<HashMap<RawFd, (u64, Interest)>>,
}

#[cfg(any(epoll, kqueue))]
impl RegularFiles {
  pub(crate) fn contains(&self, fd: RawFd) -> bool {
    self.entries.lock().contains_key(&fd)
  }

  pub(crate) fn add(&self, fd: RawFd, key: u64, interest: Interest) -> Result<()> {
    let mut entries = self.entries.lock();
    if entries.contains_key(&fd) {
      return Err(Error::from_errno(libc::EEXIST));
    }
    entries.insert(fd, (key, interest));
    Ok(())
  }

  /// Updates `fd` if it is held here.
  pub(crate) fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> bool {
    match self.entries.lock().get_mut(&fd) {
      Some(entry) => {
        *entry = (key, interest);
        true
      }
      None => false,
    }
  }

  /// Drops `fd`, reporting whether it was held here.
  pub(crate) fn remove(&self, fd: RawFd) -> bool {
    self.entries.lock().remove(&fd).is_some()
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.entries.lock().is_empty()
  }

  /// Caps `timeout` at zero while any file is held.
  pub(crate) fn timeout(&self, timeout: Option<Duration>) -> Option<Duration> {
    if self.is_empty() { timeout } else { Some(Duration::ZERO) }
  }

  pub(crate) fn report(&self, out: &mut Vec<(u64, Readiness)>) {
    for &(key, interest) in self.entries.lock().values() {
      let mut readiness = Readiness::EMPTY;
      if interest.is_readable() {
        readiness |= Readiness::READABLE;
      }
      if interest.is_writable() {
        readiness |= Readiness::WRITABLE;
      }
      if !readiness.is_empty() {
        out.push((key, readiness));
      }
    }
  }
}

/// Trait for OS-specific readiness polling implementations.
///
/// Registration is strict: `add` fails for a descriptor that is already
/// registered and `modify` for one that is not.
pub(crate) trait Selector: Send + Sync {
  /// Short backend name for diagnostics.
  fn name(&self) -> &'static str;

  /// Starts watching `fd`, reporting readiness under `key`.
  fn add(&self, fd: RawFd, key: u64, interest: Interest) -> Result<()>;

  /// Replaces the interest (and key) of a registered descriptor.
  fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> Result<()>;

  /// Stops watching `fd`. Unknown descriptors are not an error.
  fn delete(&self, fd: RawFd) -> Result<()>;

  /// Waits up to `timeout` and appends ready `(key, readiness)` pairs to
  /// `events`. Returns without events on timeout. A signal interrupting the
  /// wait surfaces as an `EINTR` error so the caller can recompute the
  /// timeout.
  fn wait(&self, events: &mut Vec<(u64, Readiness)>, timeout: Option<Duration>) -> Result<()>;

  /// Wakes up a blocked `wait`.
  fn notify(&self) -> Result<()>;
}
