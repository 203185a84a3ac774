use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use super::{NOTIFY_KEY, RegularFiles, Selector};
use crate::error::{Error, Result};
use crate::notifier::Notifier;
use crate::poll::{Interest, Readiness};
use crate::sync::Mutex;
use crate::util;

/// Wrapper around an epoll file descriptor.
pub(crate) struct EpollSelector {
  epoll_fd: OwnedFd,
  /// Notifier for waking up blocked epoll_wait
  notifier: Notifier,
  events: Mutex<Vec<libc::epoll_event>>,
  files: RegularFiles,
}

impl EpollSelector {
  pub(crate) fn new(capacity: usize) -> Result<Self> {
    // SAFETY: epoll_create1 returned a fresh descriptor we own.
    let epoll_fd = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
    let notifier = Notifier::new()?;

    let mut event = libc::epoll_event { events: libc::EPOLLIN as u32, u64: NOTIFY_KEY };
    syscall!(epoll_ctl(
      epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_ADD,
      notifier.read_fd(),
      &mut event as *mut libc::epoll_event,
    ))?;

    Ok(Self {
      epoll_fd,
      notifier,
      events: Mutex::new(vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)]),
      files: RegularFiles::default(),
    })
  }

  fn ctl(&self, op: libc::c_int, fd: RawFd, key: u64, interest: Interest) -> Result<()> {
    let mut events = libc::EPOLLRDHUP as u32;
    if interest.is_readable() {
      events |= (libc::EPOLLIN | libc::EPOLLPRI) as u32;
    }
    if interest.is_writable() {
      events |= libc::EPOLLOUT as u32;
    }

    let mut event = libc::epoll_event { events, u64: key };
    syscall!(epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event as *mut libc::epoll_event))?;
    Ok(())
  }
}

impl Selector for EpollSelector {
  fn name(&self) -> &'static str {
    "epoll"
  }

  fn add(&self, fd: RawFd, key: u64, interest: Interest) -> Result<()> {
    if self.files.contains(fd) {
      return Err(Error::from_errno(libc::EEXIST));
    }
    match self.ctl(libc::EPOLL_CTL_ADD, fd, key, interest) {
      // epoll refuses regular files and directories.
      Err(err) if err.raw_os_error() == Some(libc::EPERM) => self.files.add(fd, key, interest),
      other => other,
    }
  }

  fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> Result<()> {
    if self.files.modify(fd, key, interest) {
      return Ok(());
    }
    self.ctl(libc::EPOLL_CTL_MOD, fd, key, interest)
  }

  fn delete(&self, fd: RawFd) -> Result<()> {
    if self.files.remove(fd) {
      return Ok(());
    }
    match syscall!(epoll_ctl(self.epoll_fd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, ptr::null_mut())) {
      Err(err) if matches!(err.raw_os_error(), Some(libc::ENOENT | libc::EBADF)) => Ok(()),
      other => other.map(|_| ()).map_err(Into::into),
    }
  }

  fn wait(&self, out: &mut Vec<(u64, Readiness)>, timeout: Option<Duration>) -> Result<()> {
    let mut events = self.events.lock();
    let n = syscall!(epoll_wait(
      self.epoll_fd.as_raw_fd(),
      events.as_mut_ptr(),
      events.len() as libc::c_int,
      util::timeout_to_millis(self.files.timeout(timeout)),
    ))? as usize;

    for event in &events[..n] {
      let key = event.u64;
      if key == NOTIFY_KEY {
        self.notifier.drain();
        out.push((NOTIFY_KEY, Readiness::READABLE));
        continue;
      }
      out.push((key, readiness(event.events)));
    }
    self.files.report(out);
    Ok(())
  }

  fn notify(&self) -> Result<()> {
    self.notifier.notify()?;
    Ok(())
  }
}

fn readiness(events: u32) -> Readiness {
  let mut readiness = Readiness::EMPTY;
  if events & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0 {
    readiness |= Readiness::READABLE;
  }
  if events & libc::EPOLLOUT as u32 != 0 {
    readiness |= Readiness::WRITABLE;
  }
  if events & libc::EPOLLERR as u32 != 0 {
    readiness |= Readiness::ERROR;
  }
  if events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
    readiness |= Readiness::HANGUP;
  }
  readiness
}
