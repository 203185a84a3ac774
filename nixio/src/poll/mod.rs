//! Level-triggered readiness multiplexing over many handles.
//!
//! A [`Poller`] keeps a registration table of handles and their [`Interest`]
//! and reports, per [`wait`](Poller::wait), every ready handle exactly once
//! together with its [`Readiness`]. The same contract holds on every backend:
//! epoll, kqueue, poll(2) and select(2).
//!
//! Handles are identified by their [`Token`], never by the raw descriptor
//! number, so a descriptor number reused after a close can not be mistaken
//! for the registered handle. A handle closed while registered is reported
//! once as [`Readiness::ERROR`] | [`Readiness::INVALID`] and dropped from the
//! table; a `wait` in progress on another thread returns promptly.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use nixio::{Descriptor, Interest, PollResult, Poller};
//!
//! let (reader, writer) = Descriptor::pipe()?;
//! let mut poller = Poller::new()?;
//! poller.register(&reader, Interest::READABLE)?;
//!
//! writer.write(b"!")?;
//! match poller.wait(Some(Duration::from_secs(1)))? {
//!     PollResult::Ready(events) => assert_eq!(events[0].token(), reader.token()),
//!     PollResult::Timeout | PollResult::Woken => unreachable!(),
//! }
//! # Ok::<(), nixio::Error>(())
//! ```

pub(crate) mod sys;

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::descriptor::{CloseWatcher, Descriptor, Token};
use crate::error::{Error, ErrorKind, Result};
use crate::sync::Mutex;
use sys::{NOTIFY_KEY, Selector};

/// What a registration waits for. Errors and hangups are always reported,
/// whether or not [`Interest::ERROR`] is part of the interest.
///
/// [`Interest::ERROR`] on its own registers for neither direction; the handle
/// is then reported only for conditions the backend raises unasked. epoll and
/// poll(2) report errors and hangups that way, while select(2) and kqueue
/// report nothing until the handle is closed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interest(u8);

impl Interest {
  pub const EMPTY: Self = Self(0);
  pub const READABLE: Self = Self(0b001);
  pub const WRITABLE: Self = Self(0b010);
  pub const ERROR: Self = Self(0b100);

  pub const fn is_readable(self) -> bool {
    self.0 & Self::READABLE.0 != 0
  }

  pub const fn is_writable(self) -> bool {
    self.0 & Self::WRITABLE.0 != 0
  }

  pub const fn is_error(self) -> bool {
    self.0 & Self::ERROR.0 != 0
  }

  pub const fn contains(self, other: Self) -> bool {
    self.0 & other.0 == other.0
  }

  pub const fn is_empty(self) -> bool {
    self.0 == 0
  }
}

impl BitOr for Interest {
  type Output = Self;

  fn bitor(self, rhs: Self) -> Self {
    Self(self.0 | rhs.0)
  }
}

impl BitOrAssign for Interest {
  fn bitor_assign(&mut self, rhs: Self) {
    self.0 |= rhs.0;
  }
}

impl fmt::Debug for Interest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let names = [(Self::READABLE, "READABLE"), (Self::WRITABLE, "WRITABLE"), (Self::ERROR, "ERROR")];
    write_flags(f, names.iter().filter(|(flag, _)| self.contains(*flag)).map(|(_, name)| *name))
  }
}

/// What a handle is ready for.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Readiness(u8);

impl Readiness {
  pub const EMPTY: Self = Self(0);
  pub const READABLE: Self = Self(0b00001);
  pub const WRITABLE: Self = Self(0b00010);
  /// An error is pending on the descriptor.
  pub const ERROR: Self = Self(0b00100);
  /// The peer hung up (or the write end of a pipe closed).
  pub const HANGUP: Self = Self(0b01000);
  /// The handle was closed while registered.
  pub const INVALID: Self = Self(0b10000);

  pub const fn is_readable(self) -> bool {
    self.contains(Self::READABLE)
  }

  pub const fn is_writable(self) -> bool {
    self.contains(Self::WRITABLE)
  }

  pub const fn is_error(self) -> bool {
    self.contains(Self::ERROR)
  }

  pub const fn is_hangup(self) -> bool {
    self.contains(Self::HANGUP)
  }

  pub const fn is_invalid(self) -> bool {
    self.contains(Self::INVALID)
  }

  pub const fn contains(self, other: Self) -> bool {
    self.0 & other.0 == other.0
  }

  pub const fn is_empty(self) -> bool {
    self.0 == 0
  }

  /// Drops readable/writable bits the registration did not ask for.
  fn mask(self, interest: Interest) -> Self {
    let mut keep = Self::ERROR | Self::HANGUP | Self::INVALID;
    if interest.is_readable() {
      keep |= Self::READABLE;
    }
    if interest.is_writable() {
      keep |= Self::WRITABLE;
    }
    self & keep
  }
}

impl BitOr for Readiness {
  type Output = Self;

  fn bitor(self, rhs: Self) -> Self {
    Self(self.0 | rhs.0)
  }
}

impl BitOrAssign for Readiness {
  fn bitor_assign(&mut self, rhs: Self) {
    self.0 |= rhs.0;
  }
}

impl BitAnd for Readiness {
  type Output = Self;

  fn bitand(self, rhs: Self) -> Self {
    Self(self.0 & rhs.0)
  }
}

impl fmt::Debug for Readiness {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let names = [
      (Self::READABLE, "READABLE"),
      (Self::WRITABLE, "WRITABLE"),
      (Self::ERROR, "ERROR"),
      (Self::HANGUP, "HANGUP"),
      (Self::INVALID, "INVALID"),
    ];
    write_flags(f, names.iter().filter(|(flag, _)| self.contains(*flag)).map(|(_, name)| *name))
  }
}

fn write_flags<'a>(f: &mut fmt::Formatter<'_>, mut names: impl Iterator<Item = &'a str>) -> fmt::Result {
  match names.next() {
    None => f.write_str("EMPTY"),
    Some(first) => {
      f.write_str(first)?;
      names.try_for_each(|name| write!(f, " | {name}"))
    }
  }
}

/// One ready handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
  token: Token,
  readiness: Readiness,
}

impl Event {
  pub fn token(&self) -> Token {
    self.token
  }

  pub fn readiness(&self) -> Readiness {
    self.readiness
  }
}

/// The outcome of [`Poller::wait`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult {
  /// The timeout elapsed with nothing ready.
  Timeout,
  /// A [`Waker`] interrupted the wait and nothing was ready.
  Woken,
  /// Every ready handle, each exactly once.
  Ready(Vec<Event>),
}

/// Maps a host-style millisecond timeout to a `wait` timeout; negative values
/// mean "wait forever".
pub fn timeout_from_millis(millis: i64) -> Option<Duration> {
  u64::try_from(millis).ok().map(Duration::from_millis)
}

/// The OS mechanism behind a [`Poller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
  /// The best mechanism available: epoll on Linux, kqueue on Apple and BSD,
  /// poll(2) elsewhere.
  Auto,
  Epoll,
  Kqueue,
  Poll,
  Select,
}

impl Backend {
  /// The concrete backends this platform provides.
  pub fn available() -> &'static [Backend] {
    &[
      #[cfg(epoll)]
      Backend::Epoll,
      #[cfg(kqueue)]
      Backend::Kqueue,
      Backend::Poll,
      Backend::Select,
    ]
  }

  fn resolve(self) -> Backend {
    match self {
      #[cfg(epoll)]
      Backend::Auto => Backend::Epoll,
      #[cfg(kqueue)]
      Backend::Auto => Backend::Kqueue,
      #[cfg(not(any(epoll, kqueue)))]
      Backend::Auto => Backend::Poll,
      other => other,
    }
  }
}

/// Configures and builds a [`Poller`].
#[derive(Debug, Clone)]
pub struct PollerBuilder {
  backend: Backend,
  capacity: usize,
}

impl PollerBuilder {
  pub const DEFAULT_CAPACITY: usize = 1024;

  pub fn new() -> Self {
    Self { backend: Backend::Auto, capacity: Self::DEFAULT_CAPACITY }
  }

  #[must_use]
  pub fn backend(mut self, backend: Backend) -> Self {
    self.backend = backend;
    self
  }

  /// How many kernel events one wait can collect (epoll and kqueue).
  /// Readiness beyond that is reported by the next wait.
  #[must_use]
  pub fn capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity.max(1);
    self
  }

  pub fn build(&self) -> Result<Poller> {
    let backend = self.backend.resolve();
    let selector: Box<dyn Selector> = match backend {
      #[cfg(epoll)]
      Backend::Epoll => Box::new(sys::epoll::EpollSelector::new(self.capacity)?),
      #[cfg(kqueue)]
      Backend::Kqueue => Box::new(sys::kqueue::KqueueSelector::new(self.capacity)?),
      Backend::Poll => Box::new(sys::poll::PollSelector::new()?),
      Backend::Select => Box::new(sys::select::SelectSelector::new()?),
      other => {
        return Err(Error::unsupported(format!("{other:?} is not available on this platform")));
      }
    };

    tracing::debug!(backend = selector.name(), capacity = self.capacity, "poller built");
    Ok(Poller {
      registry: Arc::new(Registry {
        selector,
        entries: Mutex::new(HashMap::new()),
        closed: Mutex::new(Vec::new()),
        woken: AtomicBool::new(false),
      }),
      backend,
      raw: Vec::with_capacity(self.capacity),
    })
  }
}

impl Default for PollerBuilder {
  fn default() -> Self {
    Self::new()
  }
}

struct Registration {
  fd: RawFd,
  interest: Interest,
}

/// State shared between the poller, its wakers and the handles it watches.
struct Registry {
  selector: Box<dyn Selector>,
  entries: Mutex<HashMap<Token, Registration>>,
  /// Registered handles that were closed since the last wait.
  closed: Mutex<Vec<Token>>,
  woken: AtomicBool,
}

impl CloseWatcher for Registry {
  fn descriptor_closed(&self, token: Token, fd: RawFd) {
    if self.entries.lock().remove(&token).is_none() {
      return;
    }
    if let Err(err) = self.selector.delete(fd) {
      tracing::warn!(fd, token = token.get(), error = %err, "failed to drop closed descriptor from poller");
    }
    self.closed.lock().push(token);
    if let Err(err) = self.selector.notify() {
      tracing::warn!(error = %err, "failed to wake poller");
    }
  }
}

/// Level-triggered readiness multiplexer. See the [module docs](self).
pub struct Poller {
  registry: Arc<Registry>,
  backend: Backend,
  raw: Vec<(u64, Readiness)>,
}

impl Poller {
  /// A poller on the best backend for this platform.
  pub fn new() -> Result<Self> {
    PollerBuilder::new().build()
  }

  pub fn builder() -> PollerBuilder {
    PollerBuilder::new()
  }

  /// The concrete backend in use.
  pub fn backend(&self) -> Backend {
    self.backend
  }

  /// Number of registered handles.
  pub fn len(&self) -> usize {
    self.registry.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn watcher(&self) -> Weak<dyn CloseWatcher> {
    let weak: Weak<Registry> = Arc::downgrade(&self.registry);
    weak
  }

  /// Starts watching `handle`.
  ///
  /// Fails with `InvalidHandle` if the handle is closed, `InvalidArgument` if
  /// it is already registered or `interest` is empty, and `CapacityExceeded`
  /// if the backend can not hold it.
  pub fn register(&self, handle: &Descriptor, interest: Interest) -> Result<()> {
    check_interest(interest)?;
    let owned = handle.acquire()?;
    let token = handle.token();

    let mut entries = self.registry.entries.lock();
    let Entry::Vacant(slot) = entries.entry(token) else {
      return Err(Error::invalid("handle is already registered"));
    };

    self.registry.selector.add(owned.fd(), token.get(), interest)?;
    if let Err(err) = handle.watch(self.watcher()) {
      let _ = self.registry.selector.delete(owned.fd());
      return Err(err);
    }
    slot.insert(Registration { fd: owned.fd(), interest });
    tracing::trace!(token = token.get(), fd = owned.fd(), ?interest, "registered");
    Ok(())
  }

  /// Replaces the interest of a registered handle.
  pub fn modify(&self, handle: &Descriptor, interest: Interest) -> Result<()> {
    check_interest(interest)?;
    if handle.is_closed() {
      return Err(Error::closed());
    }
    let token = handle.token();

    let mut entries = self.registry.entries.lock();
    let Some(registration) = entries.get_mut(&token) else {
      return Err(Error::invalid("handle is not registered"));
    };
    self.registry.selector.modify(registration.fd, token.get(), interest)?;
    registration.interest = interest;
    Ok(())
  }

  /// Stops watching `handle`.
  pub fn deregister(&self, handle: &Descriptor) -> Result<()> {
    if handle.is_closed() {
      return Err(Error::closed());
    }
    let token = handle.token();

    let registration = self
      .registry
      .entries
      .lock()
      .remove(&token)
      .ok_or_else(|| Error::invalid("handle is not registered"))?;
    self.registry.selector.delete(registration.fd)?;
    handle.unwatch(&self.watcher());
    tracing::trace!(token = token.get(), "deregistered");
    Ok(())
  }

  /// A handle that can interrupt [`wait`](Self::wait) from any thread.
  pub fn waker(&self) -> Waker {
    Waker { registry: Arc::clone(&self.registry) }
  }

  /// Waits for readiness.
  ///
  /// `Some(Duration::ZERO)` polls without blocking and `None` waits until
  /// something is ready or a [`Waker`] fires. Signals do not shorten the
  /// wait. When events are ready they take precedence over a pending wake,
  /// which is then reported by a later call.
  pub fn wait(&mut self, timeout: Option<Duration>) -> Result<PollResult> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let registry = Arc::clone(&self.registry);

    loop {
      let pending = !registry.closed.lock().is_empty() || registry.woken.load(Ordering::Acquire);
      let remaining = if pending {
        Some(Duration::ZERO)
      } else {
        deadline.map(|d| d.saturating_duration_since(Instant::now()))
      };

      self.raw.clear();
      match registry.selector.wait(&mut self.raw, remaining) {
        Ok(()) => {}
        Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
        Err(err) => return Err(err),
      }
      tracing::trace!(backend = registry.selector.name(), raw = self.raw.len(), "wait returned");

      let events = self.collect(&registry);
      if !events.is_empty() {
        return Ok(PollResult::Ready(events));
      }
      if registry.woken.swap(false, Ordering::AcqRel) {
        return Ok(PollResult::Woken);
      }
      if deadline.is_some_and(|d| Instant::now() >= d) {
        return Ok(PollResult::Timeout);
      }
    }
  }

  /// Merges raw backend events by token, dropping stale keys.
  fn collect(&self, registry: &Registry) -> Vec<Event> {
    let mut events: Vec<Event> = Vec::new();
    let mut index: HashMap<Token, usize> = HashMap::new();
    let mut merge = |token: Token, readiness: Readiness| {
      if readiness.is_empty() {
        return;
      }
      match index.entry(token) {
        Entry::Occupied(slot) => events[*slot.get()].readiness |= readiness,
        Entry::Vacant(slot) => {
          slot.insert(events.len());
          events.push(Event { token, readiness });
        }
      }
    };

    {
      let entries = registry.entries.lock();
      for &(key, readiness) in &self.raw {
        if key == NOTIFY_KEY {
          continue;
        }
        let token = Token(key);
        if let Some(registration) = entries.get(&token) {
          merge(token, readiness.mask(registration.interest));
        }
      }
    }

    for token in registry.closed.lock().drain(..) {
      merge(token, Readiness::ERROR | Readiness::INVALID);
    }
    events
  }
}

impl fmt::Debug for Poller {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Poller")
      .field("backend", &self.backend)
      .field("registered", &self.len())
      .finish()
  }
}

fn check_interest(interest: Interest) -> Result<()> {
  if interest.is_empty() {
    Err(Error::invalid("interest must not be empty"))
  } else {
    Ok(())
  }
}

/// Wakes a [`Poller::wait`] from another thread.
#[derive(Clone)]
pub struct Waker {
  registry: Arc<Registry>,
}

impl Waker {
  /// Makes the current (or next) wait return [`PollResult::Woken`] unless
  /// something is ready.
  pub fn wake(&self) -> Result<()> {
    self.registry.woken.store(true, Ordering::Release);
    self.registry.selector.notify()
  }
}

impl fmt::Debug for Waker {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Waker").field("backend", &self.registry.selector.name()).finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn timeout_from_host_millis() {
    assert_eq!(timeout_from_millis(-1), None);
    assert_eq!(timeout_from_millis(i64::MIN), None);
    assert_eq!(timeout_from_millis(0), Some(Duration::ZERO));
    assert_eq!(timeout_from_millis(1500), Some(Duration::from_millis(1500)));
  }

  #[test]
  fn readiness_mask_keeps_error_bits() {
    let all = Readiness::READABLE | Readiness::WRITABLE | Readiness::ERROR | Readiness::HANGUP;
    let masked = all.mask(Interest::READABLE);
    assert!(masked.is_readable());
    assert!(!masked.is_writable());
    assert!(masked.is_error());
    assert!(masked.is_hangup());
  }

  #[test]
  fn flags_debug() {
    assert_eq!(format!("{:?}", Interest::READABLE | Interest::WRITABLE), "READABLE | WRITABLE");
    assert_eq!(format!("{:?}", Readiness::EMPTY), "EMPTY");
    assert_eq!(format!("{:?}", Readiness::ERROR | Readiness::INVALID), "ERROR | INVALID");
  }

  #[test]
  fn interest_needs_a_direction() {
    let poller = Poller::new().unwrap();
    let (reader, _writer) = Descriptor::pipe().unwrap();
    let err = poller.register(&reader, Interest::ERROR).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
  }

  #[test]
  fn unavailable_backend_is_unsupported() {
    #[cfg(epoll)]
    let missing = Backend::Kqueue;
    #[cfg(not(epoll))]
    let missing = Backend::Epoll;
    let err = Poller::builder().backend(missing).build().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
  }

  #[test]
  fn auto_resolves_to_a_concrete_backend() {
    let poller = Poller::new().unwrap();
    assert_ne!(poller.backend(), Backend::Auto);
    assert!(Backend::available().contains(&poller.backend()));
  }
}
