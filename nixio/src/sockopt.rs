//! Typed socket options.
//!
//! Every [`SockOpt`] declares the kind of value it takes ([`ValueKind`]) and
//! the sockets it applies to. Values are never coerced: passing an
//! [`OptValue`] of the wrong kind fails with
//! [`ErrorKind::TypeMismatch`](crate::ErrorKind::TypeMismatch), and an option
//! that does not apply to the handle (not a socket, wrong family or type,
//! read-only, or missing on this platform) fails with
//! [`ErrorKind::Unsupported`](crate::ErrorKind::Unsupported).
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use nixio::{Descriptor, Family, OptValue, SockOpt, SockType};
//!
//! let sock = Descriptor::socket(Family::Inet, SockType::Stream, 0)?;
//! sock.set_option(SockOpt::NoDelay, true)?;
//! sock.set_option(SockOpt::RecvTimeout, Duration::from_secs(5))?;
//! assert_eq!(sock.get_option(SockOpt::NoDelay)?, OptValue::Bool(true));
//! # Ok::<(), nixio::Error>(())
//! ```

use std::mem;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::descriptor::{Descriptor, Family, Kind, SockType, Wait};
use crate::error::{Error, ErrorKind, Result};
use crate::util;

/// A socket option name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SockOpt {
  KeepAlive,
  ReuseAddr,
  ReusePort,
  Broadcast,
  DontRoute,
  OobInline,
  /// The kernel clamps the size to its own limits (`net.core.wmem_max` and
  /// a small minimum on Linux); reading the option back reports the size in
  /// effect, which may differ from the one requested.
  SendBuffer,
  /// Clamped like [`SockOpt::SendBuffer`], against `net.core.rmem_max`.
  RecvBuffer,
  RecvLowat,
  /// Whole microseconds; `None` disables the timeout and zero is rejected.
  RecvTimeout,
  /// Same rules as [`SockOpt::RecvTimeout`].
  SendTimeout,
  /// `None` disables lingering; `Some(d)` lingers for `d`, which must be a
  /// whole number of seconds.
  Linger,
  /// Pending socket error. Read-only; reading clears it.
  Error,
  /// Linux only.
  Priority,
  /// Linux only. The interface name as bytes; empty unbinds.
  BindToDevice,
  NoDelay,
  /// Linux only.
  Cork,
  Ttl,
  MulticastTtl,
  MulticastLoop,
  HeaderIncluded,
  V6Only,
  UnicastHops,
  MulticastHops,
  MulticastLoopV6,
}

/// The kind of value an option takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
  Bool,
  Int,
  Duration,
  Bytes,
}

/// A socket option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptValue {
  Bool(bool),
  Int(i32),
  /// `None` means disabled.
  Duration(Option<Duration>),
  Bytes(Vec<u8>),
}

impl OptValue {
  pub fn kind(&self) -> ValueKind {
    match self {
      OptValue::Bool(_) => ValueKind::Bool,
      OptValue::Int(_) => ValueKind::Int,
      OptValue::Duration(_) => ValueKind::Duration,
      OptValue::Bytes(_) => ValueKind::Bytes,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match *self {
      OptValue::Bool(b) => Some(b),
      _ => None,
    }
  }

  pub fn as_int(&self) -> Option<i32> {
    match *self {
      OptValue::Int(i) => Some(i),
      _ => None,
    }
  }

  pub fn as_duration(&self) -> Option<Option<Duration>> {
    match *self {
      OptValue::Duration(d) => Some(d),
      _ => None,
    }
  }

  pub fn as_bytes(&self) -> Option<&[u8]> {
    match self {
      OptValue::Bytes(b) => Some(b),
      _ => None,
    }
  }
}

impl From<bool> for OptValue {
  fn from(value: bool) -> Self {
    OptValue::Bool(value)
  }
}

impl From<i32> for OptValue {
  fn from(value: i32) -> Self {
    OptValue::Int(value)
  }
}

impl From<Duration> for OptValue {
  fn from(value: Duration) -> Self {
    OptValue::Duration(Some(value))
  }
}

impl From<Option<Duration>> for OptValue {
  fn from(value: Option<Duration>) -> Self {
    OptValue::Duration(value)
  }
}

impl From<Vec<u8>> for OptValue {
  fn from(value: Vec<u8>) -> Self {
    OptValue::Bytes(value)
  }
}

impl From<&[u8]> for OptValue {
  fn from(value: &[u8]) -> Self {
    OptValue::Bytes(value.to_vec())
  }
}

/// Which sockets an option applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
  Any,
  Tcp,
  Ipv4,
  RawIpv4,
  Ipv6,
}

/// How the value travels through getsockopt/setsockopt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Repr {
  Int,
  /// `u_char`, used by BSD kernels for the IPv4 multicast options.
  #[cfg_attr(not(any(apple, bsd)), allow(dead_code))]
  Byte,
  BufferSize,
  Timeval,
  Linger,
  Blob,
}

#[derive(Debug, Clone, Copy)]
struct Layout {
  level: libc::c_int,
  name: libc::c_int,
  scope: Scope,
  repr: Repr,
  read_only: bool,
}

impl Layout {
  const fn new(level: libc::c_int, name: libc::c_int, scope: Scope, repr: Repr) -> Self {
    Self { level, name, scope, repr, read_only: false }
  }
}

#[cfg(any(apple, bsd))]
const MULTICAST_REPR: Repr = Repr::Byte;
#[cfg(not(any(apple, bsd)))]
const MULTICAST_REPR: Repr = Repr::Int;

#[cfg(apple)]
const LINGER: libc::c_int = libc::SO_LINGER_SEC;
#[cfg(not(apple))]
const LINGER: libc::c_int = libc::SO_LINGER;

impl SockOpt {
  /// Every option, for callers that want to enumerate them.
  pub const ALL: &'static [SockOpt] = &[
    SockOpt::KeepAlive,
    SockOpt::ReuseAddr,
    SockOpt::ReusePort,
    SockOpt::Broadcast,
    SockOpt::DontRoute,
    SockOpt::OobInline,
    SockOpt::SendBuffer,
    SockOpt::RecvBuffer,
    SockOpt::RecvLowat,
    SockOpt::RecvTimeout,
    SockOpt::SendTimeout,
    SockOpt::Linger,
    SockOpt::Error,
    SockOpt::Priority,
    SockOpt::BindToDevice,
    SockOpt::NoDelay,
    SockOpt::Cork,
    SockOpt::Ttl,
    SockOpt::MulticastTtl,
    SockOpt::MulticastLoop,
    SockOpt::HeaderIncluded,
    SockOpt::V6Only,
    SockOpt::UnicastHops,
    SockOpt::MulticastHops,
    SockOpt::MulticastLoopV6,
  ];

  pub const fn value_kind(self) -> ValueKind {
    match self {
      SockOpt::KeepAlive
      | SockOpt::ReuseAddr
      | SockOpt::ReusePort
      | SockOpt::Broadcast
      | SockOpt::DontRoute
      | SockOpt::OobInline
      | SockOpt::NoDelay
      | SockOpt::Cork
      | SockOpt::MulticastLoop
      | SockOpt::HeaderIncluded
      | SockOpt::V6Only
      | SockOpt::MulticastLoopV6 => ValueKind::Bool,
      SockOpt::SendBuffer
      | SockOpt::RecvBuffer
      | SockOpt::RecvLowat
      | SockOpt::Error
      | SockOpt::Priority
      | SockOpt::Ttl
      | SockOpt::MulticastTtl
      | SockOpt::UnicastHops
      | SockOpt::MulticastHops => ValueKind::Int,
      SockOpt::RecvTimeout | SockOpt::SendTimeout | SockOpt::Linger => ValueKind::Duration,
      SockOpt::BindToDevice => ValueKind::Bytes,
    }
  }

  pub const fn is_read_only(self) -> bool {
    matches!(self, SockOpt::Error)
  }

  fn layout(self) -> Result<Layout> {
    use libc::{IPPROTO_IP, IPPROTO_IPV6, IPPROTO_TCP, SOL_SOCKET};

    let layout = match self {
      SockOpt::KeepAlive => Layout::new(SOL_SOCKET, libc::SO_KEEPALIVE, Scope::Any, Repr::Int),
      SockOpt::ReuseAddr => Layout::new(SOL_SOCKET, libc::SO_REUSEADDR, Scope::Any, Repr::Int),
      SockOpt::ReusePort => Layout::new(SOL_SOCKET, libc::SO_REUSEPORT, Scope::Any, Repr::Int),
      SockOpt::Broadcast => Layout::new(SOL_SOCKET, libc::SO_BROADCAST, Scope::Any, Repr::Int),
      SockOpt::DontRoute => Layout::new(SOL_SOCKET, libc::SO_DONTROUTE, Scope::Any, Repr::Int),
      SockOpt::OobInline => Layout::new(SOL_SOCKET, libc::SO_OOBINLINE, Scope::Any, Repr::Int),
      SockOpt::SendBuffer => {
        Layout::new(SOL_SOCKET, libc::SO_SNDBUF, Scope::Any, Repr::BufferSize)
      }
      SockOpt::RecvBuffer => {
        Layout::new(SOL_SOCKET, libc::SO_RCVBUF, Scope::Any, Repr::BufferSize)
      }
      SockOpt::RecvLowat => Layout::new(SOL_SOCKET, libc::SO_RCVLOWAT, Scope::Any, Repr::Int),
      SockOpt::RecvTimeout => {
        Layout::new(SOL_SOCKET, libc::SO_RCVTIMEO, Scope::Any, Repr::Timeval)
      }
      SockOpt::SendTimeout => {
        Layout::new(SOL_SOCKET, libc::SO_SNDTIMEO, Scope::Any, Repr::Timeval)
      }
      SockOpt::Linger => Layout::new(SOL_SOCKET, LINGER, Scope::Any, Repr::Linger),
      SockOpt::Error => Layout {
        read_only: true,
        ..Layout::new(SOL_SOCKET, libc::SO_ERROR, Scope::Any, Repr::Int)
      },
      #[cfg(linux)]
      SockOpt::Priority => Layout::new(SOL_SOCKET, libc::SO_PRIORITY, Scope::Any, Repr::Int),
      #[cfg(linux)]
      SockOpt::BindToDevice => {
        Layout::new(SOL_SOCKET, libc::SO_BINDTODEVICE, Scope::Any, Repr::Blob)
      }
      SockOpt::NoDelay => Layout::new(IPPROTO_TCP, libc::TCP_NODELAY, Scope::Tcp, Repr::Int),
      #[cfg(linux)]
      SockOpt::Cork => Layout::new(IPPROTO_TCP, libc::TCP_CORK, Scope::Tcp, Repr::Int),
      SockOpt::Ttl => Layout::new(IPPROTO_IP, libc::IP_TTL, Scope::Ipv4, Repr::Int),
      SockOpt::MulticastTtl => {
        Layout::new(IPPROTO_IP, libc::IP_MULTICAST_TTL, Scope::Ipv4, MULTICAST_REPR)
      }
      SockOpt::MulticastLoop => {
        Layout::new(IPPROTO_IP, libc::IP_MULTICAST_LOOP, Scope::Ipv4, MULTICAST_REPR)
      }
      SockOpt::HeaderIncluded => {
        Layout::new(IPPROTO_IP, libc::IP_HDRINCL, Scope::RawIpv4, Repr::Int)
      }
      SockOpt::V6Only => Layout::new(IPPROTO_IPV6, libc::IPV6_V6ONLY, Scope::Ipv6, Repr::Int),
      SockOpt::UnicastHops => {
        Layout::new(IPPROTO_IPV6, libc::IPV6_UNICAST_HOPS, Scope::Ipv6, Repr::Int)
      }
      SockOpt::MulticastHops => {
        Layout::new(IPPROTO_IPV6, libc::IPV6_MULTICAST_HOPS, Scope::Ipv6, Repr::Int)
      }
      SockOpt::MulticastLoopV6 => {
        Layout::new(IPPROTO_IPV6, libc::IPV6_MULTICAST_LOOP, Scope::Ipv6, Repr::Int)
      }
      #[allow(unreachable_patterns)]
      other => {
        return Err(Error::with_code(
          ErrorKind::Unsupported,
          libc::ENOPROTOOPT,
          format!("{other:?} is not available on this platform"),
        ));
      }
    };
    Ok(layout)
  }

  fn check_applies(self, layout: &Layout, handle: &Descriptor) -> Result<()> {
    if handle.kind() != Kind::Socket {
      return Err(Error::with_code(
        ErrorKind::Unsupported,
        libc::ENOTSOCK,
        format!("{self:?} needs a socket, not a {:?} handle", handle.kind()),
      ));
    }
    let applies = match layout.scope {
      Scope::Any => true,
      Scope::Tcp => {
        matches!(handle.family(), Family::Inet | Family::Inet6)
          && handle.socket_type() == SockType::Stream
      }
      Scope::Ipv4 => handle.family() == Family::Inet,
      Scope::RawIpv4 => handle.family() == Family::Inet && handle.socket_type() == SockType::Raw,
      Scope::Ipv6 => handle.family() == Family::Inet6,
    };
    if applies {
      Ok(())
    } else {
      Err(Error::with_code(
        ErrorKind::Unsupported,
        libc::ENOPROTOOPT,
        format!(
          "{self:?} does not apply to a {:?} {:?} socket",
          handle.family(),
          handle.socket_type()
        ),
      ))
    }
  }
}

/// Reads an option.
pub fn get(handle: &Descriptor, opt: SockOpt) -> Result<OptValue> {
  let layout = opt.layout()?;
  opt.check_applies(&layout, handle)?;
  let owned = handle.acquire()?;
  let fd = owned.fd();

  let value = match layout.repr {
    Repr::Int => {
      let raw: libc::c_int = getsockopt(fd, &layout)?;
      int_value(opt, raw)
    }
    Repr::Byte => {
      let raw: u8 = getsockopt(fd, &layout)?;
      int_value(opt, raw.into())
    }
    Repr::BufferSize => {
      OptValue::Int(buffer_size(getsockopt(fd, &layout)?))
    }
    Repr::Timeval => {
      let raw: libc::timeval = getsockopt(fd, &layout)?;
      let duration = util::timeval_to_duration(raw);
      OptValue::Duration((!duration.is_zero()).then_some(duration))
    }
    Repr::Linger => {
      let raw: libc::linger = getsockopt(fd, &layout)?;
      OptValue::Duration(
        (raw.l_onoff != 0).then(|| Duration::from_secs(raw.l_linger.max(0) as u64)),
      )
    }
    Repr::Blob => {
      let mut buf = [0u8; libc::IFNAMSIZ];
      let mut len = buf.len() as libc::socklen_t;
      syscall!(getsockopt(
        fd,
        layout.level,
        layout.name,
        buf.as_mut_ptr() as *mut libc::c_void,
        &mut len
      ))?;
      let end = buf[..len as usize].iter().position(|&b| b == 0).unwrap_or(len as usize);
      OptValue::Bytes(buf[..end].to_vec())
    }
  };
  Ok(value)
}

/// Writes an option.
pub fn set(handle: &Descriptor, opt: SockOpt, value: impl Into<OptValue>) -> Result<()> {
  let value = value.into();
  let layout = opt.layout()?;
  opt.check_applies(&layout, handle)?;
  if layout.read_only {
    return Err(Error::with_code(
      ErrorKind::Unsupported,
      libc::ENOPROTOOPT,
      format!("{opt:?} is read-only"),
    ));
  }
  if value.kind() != opt.value_kind() {
    return Err(Error::new(
      ErrorKind::TypeMismatch,
      format!("{opt:?} takes a {:?} value, got {:?}", opt.value_kind(), value.kind()),
    ));
  }

  let owned = handle.acquire()?;
  let fd = owned.fd();

  match (layout.repr, &value) {
    (Repr::Int, OptValue::Bool(b)) => {
      setsockopt(fd, &layout, libc::c_int::from(*b))?
    }
    (Repr::Int, OptValue::Int(i)) => setsockopt(fd, &layout, *i)?,
    (Repr::BufferSize, OptValue::Int(i)) => {
      setsockopt(fd, &layout, *i)?;
      let effective = buffer_size(getsockopt(fd, &layout)?);
      if effective != *i {
        tracing::debug!(?opt, requested = *i, effective, "kernel clamped buffer size");
      }
    }
    (Repr::Byte, OptValue::Bool(b)) => setsockopt(fd, &layout, u8::from(*b))?,
    (Repr::Byte, OptValue::Int(i)) => {
      let byte = u8::try_from(*i)
        .map_err(|_| Error::invalid(format!("{opt:?} must be within 0..=255")))?;
      setsockopt(fd, &layout, byte)?
    }
    (Repr::Timeval, OptValue::Duration(timeout)) => {
      let raw = match timeout {
        Some(d) if d.is_zero() => {
          return Err(Error::invalid("a zero timeout is not allowed, use None to disable it"));
        }
        Some(d) if d.subsec_nanos() % 1_000 != 0 => {
          return Err(Error::invalid(format!("{opt:?} must be a whole number of microseconds")));
        }
        Some(d) if d.as_secs() > libc::time_t::MAX as u64 => {
          return Err(Error::invalid(format!("{opt:?} is out of range")));
        }
        Some(d) => util::duration_to_timeval(*d),
        None => libc::timeval { tv_sec: 0, tv_usec: 0 },
      };
      setsockopt(fd, &layout, raw)?;
      let wait = if opt == SockOpt::RecvTimeout { Wait::Read } else { Wait::Write };
      handle.set_cached_timeout(wait, *timeout);
    }
    (Repr::Linger, OptValue::Duration(linger)) => {
      let raw = match linger {
        Some(d) if d.subsec_nanos() != 0 => {
          return Err(Error::invalid("linger must be a whole number of seconds"));
        }
        Some(d) => libc::linger {
          l_onoff: 1,
          l_linger: libc::c_int::try_from(d.as_secs())
            .map_err(|_| Error::invalid("linger is out of range"))?,
        },
        None => libc::linger { l_onoff: 0, l_linger: 0 },
      };
      setsockopt(fd, &layout, raw)?
    }
    (Repr::Blob, OptValue::Bytes(bytes)) => {
      syscall!(setsockopt(
        fd,
        layout.level,
        layout.name,
        bytes.as_ptr() as *const libc::c_void,
        bytes.len() as libc::socklen_t
      ))?;
    }
    _ => {
      return Err(Error::new(
        ErrorKind::TypeMismatch,
        format!("{opt:?} can not carry a {:?} value", value.kind()),
      ));
    }
  }

  tracing::trace!(token = handle.token().get(), ?opt, ?value, "socket option set");
  Ok(())
}

/// Primes the handle's cached receive/send timeouts from the kernel, for
/// sockets adopted through `from_raw_fd`.
pub(crate) fn load_timeouts(handle: &Descriptor) {
  for (opt, wait) in [(SockOpt::RecvTimeout, Wait::Read), (SockOpt::SendTimeout, Wait::Write)] {
    if let Ok(OptValue::Duration(timeout)) = get(handle, opt) {
      handle.set_cached_timeout(wait, timeout);
    }
  }
}

/// The buffer size as requested. Linux doubles the value it stores to
/// account for bookkeeping.
fn buffer_size(raw: libc::c_int) -> i32 {
  if cfg!(linux) { raw / 2 } else { raw }
}

fn int_value(opt: SockOpt, raw: libc::c_int) -> OptValue {
  match opt.value_kind() {
    ValueKind::Bool => OptValue::Bool(raw != 0),
    _ => OptValue::Int(raw),
  }
}

fn getsockopt<T: Copy>(fd: RawFd, layout: &Layout) -> Result<T> {
  // SAFETY: only used with plain C types for which all-zero is valid.
  let mut value: T = unsafe { mem::zeroed() };
  let mut len = mem::size_of::<T>() as libc::socklen_t;
  syscall!(getsockopt(
    fd,
    layout.level,
    layout.name,
    &mut value as *mut T as *mut libc::c_void,
    &mut len
  ))?;
  Ok(value)
}

fn setsockopt<T: Copy>(fd: RawFd, layout: &Layout, value: T) -> Result<()> {
  syscall!(setsockopt(
    fd,
    layout.level,
    layout.name,
    &value as *const T as *const libc::c_void,
    mem::size_of::<T>() as libc::socklen_t
  ))?;
  Ok(())
}

impl Descriptor {
  /// Reads a socket option. See [`get`].
  pub fn get_option(&self, opt: SockOpt) -> Result<OptValue> {
    get(self, opt)
  }

  /// Writes a socket option. See [`set`].
  pub fn set_option(&self, opt: SockOpt, value: impl Into<OptValue>) -> Result<()> {
    set(self, opt, value)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tcp() -> Descriptor {
    Descriptor::socket(Family::Inet, SockType::Stream, 0).unwrap()
  }

  #[test]
  fn every_option_has_a_value_kind_and_layout_or_is_unsupported() {
    for &opt in SockOpt::ALL {
      match opt.layout() {
        Ok(layout) => assert_eq!(layout.read_only, opt.is_read_only(), "{opt:?}"),
        Err(err) => assert_eq!(err.kind(), ErrorKind::Unsupported, "{opt:?}"),
      }
    }
  }

  #[test]
  fn bool_round_trip() {
    let sock = tcp();
    for opt in [SockOpt::KeepAlive, SockOpt::ReuseAddr, SockOpt::NoDelay] {
      sock.set_option(opt, true).unwrap();
      assert_eq!(sock.get_option(opt).unwrap(), OptValue::Bool(true), "{opt:?}");
      sock.set_option(opt, false).unwrap();
      assert_eq!(sock.get_option(opt).unwrap(), OptValue::Bool(false), "{opt:?}");
    }
  }

  #[test]
  fn buffer_size_reports_requested_value() {
    let sock = tcp();
    sock.set_option(SockOpt::RecvBuffer, 65536).unwrap();
    assert_eq!(sock.get_option(SockOpt::RecvBuffer).unwrap(), OptValue::Int(65536));
  }

  #[test]
  fn timeouts() {
    let sock = tcp();
    assert_eq!(sock.get_option(SockOpt::RecvTimeout).unwrap(), OptValue::Duration(None));

    sock.set_option(SockOpt::RecvTimeout, Duration::from_millis(1500)).unwrap();
    assert_eq!(
      sock.get_option(SockOpt::RecvTimeout).unwrap(),
      OptValue::Duration(Some(Duration::from_millis(1500)))
    );

    let err = sock.set_option(SockOpt::SendTimeout, Duration::ZERO).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    sock.set_option(SockOpt::RecvTimeout, None::<Duration>).unwrap();
    assert_eq!(sock.get_option(SockOpt::RecvTimeout).unwrap(), OptValue::Duration(None));
  }

  #[test]
  fn linger_round_trip() {
    let sock = tcp();
    sock.set_option(SockOpt::Linger, Duration::from_secs(3)).unwrap();
    assert_eq!(
      sock.get_option(SockOpt::Linger).unwrap(),
      OptValue::Duration(Some(Duration::from_secs(3)))
    );
    sock.set_option(SockOpt::Linger, None::<Duration>).unwrap();
    assert_eq!(sock.get_option(SockOpt::Linger).unwrap(), OptValue::Duration(None));
  }

  #[test]
  fn sub_second_linger_is_rejected() {
    let sock = tcp();
    let err = sock.set_option(SockOpt::Linger, Duration::from_millis(500)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = sock.set_option(SockOpt::Linger, Duration::from_millis(2500)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(sock.get_option(SockOpt::Linger).unwrap(), OptValue::Duration(None));
  }

  #[test]
  fn sub_microsecond_timeout_is_rejected() {
    let sock = tcp();
    for opt in [SockOpt::RecvTimeout, SockOpt::SendTimeout] {
      let err = sock.set_option(opt, Duration::from_nanos(1_500)).unwrap_err();
      assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{opt:?}");
      assert_eq!(sock.get_option(opt).unwrap(), OptValue::Duration(None), "{opt:?}");
    }
  }

  #[cfg(linux)]
  #[test]
  fn buffer_size_reads_back_the_clamped_value() {
    let sock = tcp();
    sock.set_option(SockOpt::SendBuffer, 1).unwrap();
    let effective = sock.get_option(SockOpt::SendBuffer).unwrap().as_int().unwrap();
    assert!(effective > 1, "{effective}");
  }

  #[test]
  fn type_mismatch_is_never_coerced() {
    let sock = tcp();
    let err = sock.set_option(SockOpt::NoDelay, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    let err = sock.set_option(SockOpt::Ttl, true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);
  }

  #[test]
  fn inapplicable_options_are_unsupported() {
    let (reader, _writer) = Descriptor::pipe().unwrap();
    assert_eq!(reader.get_option(SockOpt::KeepAlive).unwrap_err().kind(), ErrorKind::Unsupported);

    let udp = Descriptor::socket(Family::Inet, SockType::Datagram, 0).unwrap();
    assert_eq!(udp.get_option(SockOpt::NoDelay).unwrap_err().kind(), ErrorKind::Unsupported);
    assert_eq!(udp.get_option(SockOpt::V6Only).unwrap_err().kind(), ErrorKind::Unsupported);

    let sock = tcp();
    let err = sock.set_option(SockOpt::Error, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    assert_eq!(sock.get_option(SockOpt::Error).unwrap(), OptValue::Int(0));
  }

  #[test]
  fn ip_level_options() {
    let udp = Descriptor::socket(Family::Inet, SockType::Datagram, 0).unwrap();
    udp.set_option(SockOpt::Ttl, 42).unwrap();
    assert_eq!(udp.get_option(SockOpt::Ttl).unwrap(), OptValue::Int(42));
    udp.set_option(SockOpt::MulticastTtl, 7).unwrap();
    assert_eq!(udp.get_option(SockOpt::MulticastTtl).unwrap(), OptValue::Int(7));
    udp.set_option(SockOpt::MulticastLoop, false).unwrap();
    assert_eq!(udp.get_option(SockOpt::MulticastLoop).unwrap(), OptValue::Bool(false));

    let err = udp.set_option(SockOpt::MulticastTtl, 300);
    assert_eq!(err.unwrap_err().kind(), ErrorKind::InvalidArgument);
  }

  #[test]
  fn ipv6_level_options() {
    let udp = Descriptor::socket(Family::Inet6, SockType::Datagram, 0).unwrap();
    udp.set_option(SockOpt::V6Only, true).unwrap();
    assert_eq!(udp.get_option(SockOpt::V6Only).unwrap(), OptValue::Bool(true));
    udp.set_option(SockOpt::UnicastHops, 9).unwrap();
    assert_eq!(udp.get_option(SockOpt::UnicastHops).unwrap(), OptValue::Int(9));
  }

  #[test]
  fn closed_handle_is_invalid() {
    let sock = tcp();
    sock.close().unwrap();
    let err = sock.get_option(SockOpt::KeepAlive).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);
  }
}
