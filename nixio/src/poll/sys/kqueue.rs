use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{mem, ptr};

use super::{NOTIFY_KEY, RegularFiles, Selector};
use crate::error::{Error, Result};
use crate::notifier::Notifier;
use crate::poll::{Interest, Readiness};
use crate::sync::Mutex;
use crate::util::{self, FileType};

/// Wrapper around a kqueue file descriptor.
pub(crate) struct KqueueSelector {
  kq_fd: OwnedFd,
  /// Registered descriptors and their interest, so `add`/`modify` keep the
  /// strict semantics epoll has natively and `modify` knows which filters to
  /// drop.
  registered: Mutex<HashMap<RawFd, Interest>>,
  notifier: Notifier,
  events: Mutex<Vec<libc::kevent>>,
  files: RegularFiles,
}

// SAFETY: kevent carries `udata` as a pointer, but it only ever holds a key.
unsafe impl Send for KqueueSelector {}
unsafe impl Sync for KqueueSelector {}

fn kevent(ident: RawFd, filter: i16, flags: u16, key: u64) -> libc::kevent {
  // SAFETY: kevent is plain data; all-zero is valid.
  let mut kev: libc::kevent = unsafe { mem::zeroed() };
  kev.ident = ident as libc::uintptr_t;
  kev.filter = filter as _;
  kev.flags = flags as _;
  kev.udata = key as _;
  kev
}

impl KqueueSelector {
  pub(crate) fn new(capacity: usize) -> Result<Self> {
    // SAFETY: kqueue returned a fresh descriptor we own.
    let kq_fd = unsafe { OwnedFd::from_raw_fd(syscall!(kqueue())?) };
    util::set_cloexec(kq_fd.as_raw_fd())?;

    let selector = Self {
      kq_fd,
      registered: Mutex::new(HashMap::new()),
      notifier: Notifier::new()?,
      // SAFETY: kevent is plain data; all-zero is valid.
      events: Mutex::new(vec![unsafe { mem::zeroed() }; capacity.max(1)]),
      files: RegularFiles::default(),
    };

    let change = kevent(
      selector.notifier.read_fd(),
      libc::EVFILT_READ as i16,
      (libc::EV_ADD | libc::EV_ENABLE) as u16,
      NOTIFY_KEY,
    );
    selector.apply(&[change])?;
    Ok(selector)
  }

  fn apply(&self, changes: &[libc::kevent]) -> Result<()> {
    if changes.is_empty() {
      return Ok(());
    }
    syscall!(kevent(
      self.kq_fd.as_raw_fd(),
      changes.as_ptr(),
      changes.len() as _,
      ptr::null_mut(),
      0,
      ptr::null(),
    ))?;
    Ok(())
  }

  /// Changes moving a descriptor from `old` to `new` interest.
  fn changes(fd: RawFd, key: u64, old: Interest, new: Interest) -> Vec<libc::kevent> {
    let filters = [
      (libc::EVFILT_READ as i16, old.is_readable(), new.is_readable()),
      (libc::EVFILT_WRITE as i16, old.is_writable(), new.is_writable()),
    ];
    filters
      .into_iter()
      .filter_map(|(filter, was, wants)| match (was, wants) {
        (_, true) => Some(kevent(fd, filter, (libc::EV_ADD | libc::EV_ENABLE) as u16, key)),
        (true, false) => Some(kevent(fd, filter, libc::EV_DELETE as u16, 0)),
        (false, false) => None,
      })
      .collect()
  }
}

impl Selector for KqueueSelector {
  fn name(&self) -> &'static str {
    "kqueue"
  }

  fn add(&self, fd: RawFd, key: u64, interest: Interest) -> Result<()> {
    let mut registered = self.registered.lock();
    if registered.contains_key(&fd) || self.files.contains(fd) {
      return Err(Error::from_errno(libc::EEXIST));
    }
    if util::file_type(fd)? == FileType::Regular {
      return self.files.add(fd, key, interest);
    }
    self.apply(&Self::changes(fd, key, Interest::EMPTY, interest))?;
    registered.insert(fd, interest);
    Ok(())
  }

  fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> Result<()> {
    if self.files.modify(fd, key, interest) {
      return Ok(());
    }
    let mut registered = self.registered.lock();
    let Some(old) = registered.get_mut(&fd) else {
      return Err(Error::from_errno(libc::ENOENT));
    };
    self.apply(&Self::changes(fd, key, *old, interest))?;
    *old = interest;
    Ok(())
  }

  fn delete(&self, fd: RawFd) -> Result<()> {
    if self.files.remove(fd) {
      return Ok(());
    }
    let Some(old) = self.registered.lock().remove(&fd) else {
      return Ok(());
    };
    // Filters are deleted one at a time so a missing one does not hide the
    // other.
    for change in Self::changes(fd, 0, old, Interest::EMPTY) {
      match self.apply(&[change]) {
        Err(err) if matches!(err.raw_os_error(), Some(libc::ENOENT | libc::EBADF)) => {}
        other => other?,
      }
    }
    Ok(())
  }

  fn wait(&self, out: &mut Vec<(u64, Readiness)>, timeout: Option<Duration>) -> Result<()> {
    let timeout = self.files.timeout(timeout).map(util::duration_to_timespec);
    let timeout_ptr = timeout.as_ref().map_or(ptr::null(), |ts| ts as *const libc::timespec);

    let mut events = self.events.lock();
    let n = syscall!(kevent(
      self.kq_fd.as_raw_fd(),
      ptr::null(),
      0,
      events.as_mut_ptr(),
      events.len() as _,
      timeout_ptr,
    ))? as usize;

    for event in &events[..n] {
      let key = event.udata as u64;
      if key == NOTIFY_KEY {
        self.notifier.drain();
        out.push((NOTIFY_KEY, Readiness::READABLE));
        continue;
      }
      out.push((key, readiness(event)));
    }
    self.files.report(out);
    Ok(())
  }

  fn notify(&self) -> Result<()> {
    self.notifier.notify()?;
    Ok(())
  }
}

fn readiness(event: &libc::kevent) -> Readiness {
  let flags = event.flags as u16;
  let mut readiness = Readiness::EMPTY;

  if flags & libc::EV_ERROR as u16 != 0 {
    readiness |= Readiness::ERROR;
    if event.data as i64 == libc::EBADF as i64 {
      readiness |= Readiness::INVALID;
    }
    return readiness;
  }

  if event.filter as i16 == libc::EVFILT_READ as i16 {
    readiness |= Readiness::READABLE;
  } else if event.filter as i16 == libc::EVFILT_WRITE as i16 {
    readiness |= Readiness::WRITABLE;
  }
  if flags & libc::EV_EOF as u16 != 0 {
    readiness |= Readiness::HANGUP;
    // On EOF `fflags` carries the pending socket error, if any.
    if event.fflags != 0 {
      readiness |= Readiness::ERROR;
    }
  }
  readiness
}
