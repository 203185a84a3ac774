#![cfg_attr(docsrs, feature(doc_cfg))]

//! # nixio - unified Unix descriptors
//!
//! nixio puts sockets, regular files and pipes behind one handle type,
//! [`Descriptor`], and builds three things on top of it:
//!
//! - a readiness [`Poller`] that behaves the same over epoll, kqueue, poll(2)
//!   and select(2),
//! - a [`SpliceEngine`] that forwards bytes with splice(2)/sendfile(2) where
//!   the kernel allows it and falls back to a buffered copy otherwise,
//! - [`BufferedIo`] for line-oriented and staged reads and writes.
//!
//! ## Platform support
//!
//! | Platform      | Poller backends            | Zero-copy          |
//! |---------------|----------------------------|--------------------|
//! | Linux/Android | epoll, poll, select        | splice, sendfile   |
//! | macOS/iOS     | kqueue, poll, select       | buffered only      |
//! | BSDs          | kqueue, poll, select       | buffered only      |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use nixio::{Descriptor, Family, Interest, PollResult, Poller, SockType};
//!
//! fn example() -> nixio::Result<()> {
//!     let (a, b) = Descriptor::socket_pair(Family::Unix, SockType::Stream)?;
//!     let mut poller = Poller::new()?;
//!     poller.register(&a, Interest::READABLE)?;
//!
//!     b.write(b"ping")?;
//!     if let PollResult::Ready(events) = poller.wait(Some(Duration::from_secs(1)))? {
//!         assert_eq!(events[0].token(), a.token());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Error handling
//!
//! Every fallible call returns [`Result`]. [`Error`] carries an [`ErrorKind`],
//! the raw OS (or resolver) code and a message, and converts to and from
//! [`std::io::Error`].
//!
//! ## Logging
//!
//! Lifecycle events are emitted through [`tracing`]; nixio never installs a
//! subscriber.

#[macro_use]
mod macros;

mod descriptor;
mod error;
mod io;
mod net;
mod notifier;
mod poll;
pub mod sockopt;
mod splice;
mod sync;
mod util;

#[cfg(test)]
mod test_utils;

use std::path::Path;

pub use descriptor::{Descriptor, Family, Kind, OpenOptions, SockType, Token};
pub use error::{Error, ErrorKind, Result};
pub use io::{BUFFER_SIZE, BufferedIo};
pub use net::{
  Address, Candidate, Candidates, LocalAddr, MAX_LOCAL_PATH, Resolution, Resolver, decode,
  encode, lookup_name, resolve,
};
pub use poll::{
  Backend, Event, Interest, PollResult, Poller, PollerBuilder, Readiness, Waker,
  timeout_from_millis,
};
pub use sockopt::{OptValue, SockOpt, ValueKind};
pub use splice::{DEFAULT_CHUNK_SIZE, SpliceEngine, SpliceEngineBuilder, Strategy};

/// Opens the file at `path`. See [`OpenOptions`].
pub fn open(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Descriptor> {
  options.open(path)
}

/// Creates a socket. See [`Descriptor::socket`].
pub fn socket(family: Family, socket_type: SockType, protocol: i32) -> Result<Descriptor> {
  Descriptor::socket(family, socket_type, protocol)
}

/// Accepts a pending connection on `listener`.
pub fn accept(listener: &Descriptor) -> Result<(Descriptor, Address)> {
  listener.accept()
}

/// Closes `handle`; closing twice is a no-op.
pub fn close(handle: &Descriptor) -> Result<()> {
  handle.close()
}

pub fn duplicate(handle: &Descriptor) -> Result<Descriptor> {
  handle.duplicate()
}

pub fn get_option(handle: &Descriptor, opt: SockOpt) -> Result<OptValue> {
  sockopt::get(handle, opt)
}

pub fn set_option(handle: &Descriptor, opt: SockOpt, value: impl Into<OptValue>) -> Result<()> {
  sockopt::set(handle, opt, value)
}

/// Forwards up to `max` bytes with a default [`SpliceEngine`].
pub fn transfer(source: &Descriptor, destination: &Descriptor, max: usize) -> Result<usize> {
  SpliceEngine::new().transfer(source, destination, max)
}

/// Sends `len` bytes of `file` from `offset` with a default [`SpliceEngine`].
pub fn sendfile(destination: &Descriptor, file: &Descriptor, offset: u64, len: usize) -> Result<usize> {
  SpliceEngine::new().sendfile(destination, file, offset, len)
}
