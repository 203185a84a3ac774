//! select(2) backend for descriptors below `FD_SETSIZE`.
//!
//! select reports readability and writability only; hangups show up as
//! readability. A descriptor that went stale reports `ERROR | INVALID`.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::Duration;
use std::{mem, ptr};

use super::{NOTIFY_KEY, Selector};
use crate::error::{Error, ErrorKind, Result};
use crate::notifier::Notifier;
use crate::poll::{Interest, Readiness};
use crate::sync::Mutex;
use crate::util;

pub(crate) struct SelectSelector {
  entries: Mutex<HashMap<RawFd, (u64, Interest)>>,
  notifier: Notifier,
}

fn check_capacity(fd: RawFd) -> Result<()> {
  if fd < 0 || fd as usize >= libc::FD_SETSIZE as usize {
    return Err(Error::new(
      ErrorKind::CapacityExceeded,
      format!("descriptor {fd} does not fit into select(2)'s FD_SETSIZE of {}", libc::FD_SETSIZE),
    ));
  }
  Ok(())
}

fn empty_set() -> libc::fd_set {
  // SAFETY: fd_set is plain data and FD_ZERO initializes it.
  unsafe {
    let mut set: libc::fd_set = mem::zeroed();
    libc::FD_ZERO(&mut set);
    set
  }
}

impl SelectSelector {
  pub(crate) fn new() -> Result<Self> {
    let notifier = Notifier::new()?;
    check_capacity(notifier.read_fd())?;
    Ok(Self { entries: Mutex::new(HashMap::new()), notifier })
  }

  /// After `EBADF`, finds the registered descriptors that are no longer open.
  fn report_stale(
    entries: &HashMap<RawFd, (u64, Interest)>,
    out: &mut Vec<(u64, Readiness)>,
  ) {
    for (&fd, &(key, _)) in entries {
      if syscall!(fcntl(fd, libc::F_GETFD)).is_err() {
        out.push((key, Readiness::ERROR | Readiness::INVALID));
      }
    }
  }
}

impl Selector for SelectSelector {
  fn name(&self) -> &'static str {
    "select"
  }

  fn add(&self, fd: RawFd, key: u64, interest: Interest) -> Result<()> {
    check_capacity(fd)?;
    let mut entries = self.entries.lock();
    if entries.contains_key(&fd) {
      return Err(Error::from_errno(libc::EEXIST));
    }
    entries.insert(fd, (key, interest));
    Ok(())
  }

  fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> Result<()> {
    match self.entries.lock().get_mut(&fd) {
      Some(entry) => {
        *entry = (key, interest);
        Ok(())
      }
      None => Err(Error::from_errno(libc::ENOENT)),
    }
  }

  fn delete(&self, fd: RawFd) -> Result<()> {
    self.entries.lock().remove(&fd);
    Ok(())
  }

  fn wait(&self, out: &mut Vec<(u64, Readiness)>, timeout: Option<Duration>) -> Result<()> {
    let entries = self.entries.lock().clone();

    let mut read_set = empty_set();
    let mut write_set = empty_set();
    let notify_fd = self.notifier.read_fd();
    let mut max_fd = notify_fd;

    // SAFETY: every descriptor was checked against FD_SETSIZE on add.
    unsafe {
      libc::FD_SET(notify_fd, &mut read_set);
      for (&fd, &(_, interest)) in &entries {
        if interest.is_readable() {
          libc::FD_SET(fd, &mut read_set);
        }
        if interest.is_writable() {
          libc::FD_SET(fd, &mut write_set);
        }
        max_fd = max_fd.max(fd);
      }
    }

    let mut tv = timeout.map(util::duration_to_timeval);
    let tv_ptr = tv.as_mut().map_or(ptr::null_mut(), |tv| tv as *mut libc::timeval);

    match syscall!(select(max_fd + 1, &mut read_set, &mut write_set, ptr::null_mut(), tv_ptr)) {
      Ok(0) => return Ok(()),
      Ok(_) => {}
      Err(err) if err.raw_os_error() == Some(libc::EBADF) => {
        Self::report_stale(&entries, out);
        return Ok(());
      }
      Err(err) => return Err(err.into()),
    }

    // SAFETY: the sets were filled in by select above.
    unsafe {
      if libc::FD_ISSET(notify_fd, &read_set) {
        self.notifier.drain();
        out.push((NOTIFY_KEY, Readiness::READABLE));
      }
      for (&fd, &(key, _)) in &entries {
        let mut readiness = Readiness::EMPTY;
        if libc::FD_ISSET(fd, &read_set) {
          readiness |= Readiness::READABLE;
        }
        if libc::FD_ISSET(fd, &write_set) {
          readiness |= Readiness::WRITABLE;
        }
        if !readiness.is_empty() {
          out.push((key, readiness));
        }
      }
    }
    Ok(())
  }

  fn notify(&self) -> Result<()> {
    self.notifier.notify()?;
    Ok(())
  }
}
