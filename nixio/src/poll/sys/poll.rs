//! Portable poll(2) backend.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::Duration;

use super::{NOTIFY_KEY, Selector};
use crate::error::{Error, Result};
use crate::notifier::Notifier;
use crate::poll::{Interest, Readiness};
use crate::sync::Mutex;
use crate::util;

#[derive(Default)]
struct PollSet {
  fds: Vec<libc::pollfd>,
  keys: Vec<u64>,
  index: HashMap<RawFd, usize>,
}

pub(crate) struct PollSelector {
  set: Mutex<PollSet>,
  notifier: Notifier,
}

impl PollSelector {
  pub(crate) fn new() -> Result<Self> {
    let notifier = Notifier::new()?;
    let mut set = PollSet::default();
    set.fds.push(libc::pollfd { fd: notifier.read_fd(), events: libc::POLLIN, revents: 0 });
    set.keys.push(NOTIFY_KEY);
    Ok(Self { set: Mutex::new(set), notifier })
  }
}

fn events_for(interest: Interest) -> libc::c_short {
  let mut events = 0;
  if interest.is_readable() {
    events |= libc::POLLIN | libc::POLLPRI;
  }
  if interest.is_writable() {
    events |= libc::POLLOUT;
  }
  events
}

impl Selector for PollSelector {
  fn name(&self) -> &'static str {
    "poll"
  }

  fn add(&self, fd: RawFd, key: u64, interest: Interest) -> Result<()> {
    let mut set = self.set.lock();
    if set.index.contains_key(&fd) {
      return Err(Error::from_errno(libc::EEXIST));
    }
    let slot = set.fds.len();
    set.fds.push(libc::pollfd { fd, events: events_for(interest), revents: 0 });
    set.keys.push(key);
    set.index.insert(fd, slot);
    Ok(())
  }

  fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> Result<()> {
    let mut set = self.set.lock();
    let Some(&slot) = set.index.get(&fd) else {
      return Err(Error::from_errno(libc::ENOENT));
    };
    set.fds[slot].events = events_for(interest);
    set.keys[slot] = key;
    Ok(())
  }

  fn delete(&self, fd: RawFd) -> Result<()> {
    let mut set = self.set.lock();
    let Some(slot) = set.index.remove(&fd) else {
      return Ok(());
    };
    set.fds.swap_remove(slot);
    set.keys.swap_remove(slot);
    if let Some(moved) = set.fds.get(slot).map(|p| p.fd) {
      set.index.insert(moved, slot);
    }
    Ok(())
  }

  fn wait(&self, out: &mut Vec<(u64, Readiness)>, timeout: Option<Duration>) -> Result<()> {
    // Work on a snapshot so closes on other threads can update the set
    // (and notify) while this thread is blocked.
    let (mut fds, keys) = {
      let set = self.set.lock();
      (set.fds.clone(), set.keys.clone())
    };

    let n = syscall!(poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, util::timeout_to_millis(timeout)))?;
    if n == 0 {
      return Ok(());
    }

    for (pollfd, &key) in fds.iter().zip(&keys) {
      if pollfd.revents == 0 {
        continue;
      }
      if key == NOTIFY_KEY {
        self.notifier.drain();
        out.push((NOTIFY_KEY, Readiness::READABLE));
        continue;
      }
      out.push((key, readiness(pollfd.revents)));
    }
    Ok(())
  }

  fn notify(&self) -> Result<()> {
    self.notifier.notify()?;
    Ok(())
  }
}

fn readiness(revents: libc::c_short) -> Readiness {
  let mut readiness = Readiness::EMPTY;
  if revents & (libc::POLLIN | libc::POLLPRI) != 0 {
    readiness |= Readiness::READABLE;
  }
  if revents & libc::POLLOUT != 0 {
    readiness |= Readiness::WRITABLE;
  }
  if revents & libc::POLLERR != 0 {
    readiness |= Readiness::ERROR;
  }
  if revents & libc::POLLHUP != 0 {
    readiness |= Readiness::HANGUP;
  }
  if revents & libc::POLLNVAL != 0 {
    readiness |= Readiness::ERROR | Readiness::INVALID;
  }
  readiness
}
