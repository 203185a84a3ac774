//! Family-tagged socket addresses and their OS wire format.
//!
//! [`encode`] turns an [`Address`] into the exact bytes of the platform's
//! `sockaddr_*` structure and [`decode`] turns such bytes back. The two are
//! inverses for IPv4, IPv6 and local addresses.
//!
//! ```rust
//! use nixio::{Address, Family};
//!
//! let addr: Address = "127.0.0.1:8080".parse::<std::net::SocketAddr>().unwrap().into();
//! let wire = nixio::encode(&addr).unwrap();
//! assert_eq!(nixio::decode(Family::Inet, &wire).unwrap(), addr);
//! ```

use std::ffi::OsStr;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::{fmt, mem, ptr};

use crate::descriptor::Family;
use crate::error::{Error, Result};

/// Offset of `sun_path` inside `sockaddr_un`.
const SUN_PATH_OFFSET: usize = mem::offset_of!(libc::sockaddr_un, sun_path);

/// Capacity of `sun_path` on this platform.
const SUN_PATH_LEN: usize = {
  // SAFETY: only used to measure the array field.
  let addr: libc::sockaddr_un = unsafe { mem::zeroed() };
  addr.sun_path.len()
};

/// Longest pathname a local address can carry; one byte is kept for the NUL
/// terminator so the kernel never reads an unterminated path.
pub const MAX_LOCAL_PATH: usize = SUN_PATH_LEN - 1;

/// A socket endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
  V4(SocketAddrV4),
  V6(SocketAddrV6),
  Local(LocalAddr),
  /// `AF_UNSPEC`; connecting a datagram socket to it dissolves the
  /// association.
  Unspecified,
}

impl Address {
  /// A local address for a filesystem path.
  pub fn local(path: impl AsRef<Path>) -> Result<Self> {
    LocalAddr::path(path).map(Address::Local)
  }

  pub fn family(&self) -> Family {
    match self {
      Address::V4(_) => Family::Inet,
      Address::V6(_) => Family::Inet6,
      Address::Local(_) => Family::Unix,
      Address::Unspecified => Family::Unspecified,
    }
  }

  pub fn port(&self) -> Option<u16> {
    match self {
      Address::V4(v4) => Some(v4.port()),
      Address::V6(v6) => Some(v6.port()),
      _ => None,
    }
  }

  /// The IP endpoint, for network addresses.
  pub fn as_socket_addr(&self) -> Option<SocketAddr> {
    match self {
      Address::V4(v4) => Some(SocketAddr::V4(*v4)),
      Address::V6(v6) => Some(SocketAddr::V6(*v6)),
      _ => None,
    }
  }
}

impl From<SocketAddr> for Address {
  fn from(addr: SocketAddr) -> Self {
    match addr {
      SocketAddr::V4(v4) => Address::V4(v4),
      SocketAddr::V6(v6) => Address::V6(v6),
    }
  }
}

impl From<SocketAddrV4> for Address {
  fn from(addr: SocketAddrV4) -> Self {
    Address::V4(addr)
  }
}

impl From<SocketAddrV6> for Address {
  fn from(addr: SocketAddrV6) -> Self {
    Address::V6(addr)
  }
}

impl fmt::Display for Address {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Address::V4(v4) => v4.fmt(f),
      Address::V6(v6) => v6.fmt(f),
      Address::Local(local) => local.fmt(f),
      Address::Unspecified => f.write_str("unspecified"),
    }
  }
}

/// The endpoint of a local (path addressed) socket.
///
/// Holds the raw `sun_path` bytes: a filesystem path, an empty (unnamed)
/// address, or on Linux an abstract name starting with a NUL byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalAddr {
  bytes: Vec<u8>,
}

impl LocalAddr {
  /// A filesystem path. Fails if the path contains a NUL byte or is longer
  /// than [`MAX_LOCAL_PATH`]; it is never truncated.
  pub fn path(path: impl AsRef<Path>) -> Result<Self> {
    let bytes = path.as_ref().as_os_str().as_bytes();
    if bytes.contains(&0) {
      return Err(Error::invalid("local address path contains a NUL byte"));
    }
    if bytes.len() > MAX_LOCAL_PATH {
      return Err(Error::with_code(
        crate::ErrorKind::InvalidArgument,
        libc::ENAMETOOLONG,
        format!("local address path is {} bytes, the limit is {MAX_LOCAL_PATH}", bytes.len()),
      ));
    }
    Ok(Self { bytes: bytes.to_vec() })
  }

  /// A Linux abstract-namespace name. Every byte, NULs included, is kept.
  #[cfg(linux)]
  pub fn abstract_name(name: &[u8]) -> Result<Self> {
    if name.len() + 1 > SUN_PATH_LEN {
      return Err(Error::with_code(
        crate::ErrorKind::InvalidArgument,
        libc::ENAMETOOLONG,
        format!("abstract name is {} bytes, the limit is {}", name.len(), SUN_PATH_LEN - 1),
      ));
    }
    let mut bytes = Vec::with_capacity(name.len() + 1);
    bytes.push(0);
    bytes.extend_from_slice(name);
    Ok(Self { bytes })
  }

  /// The address of an unbound local socket.
  pub fn unnamed() -> Self {
    Self { bytes: Vec::new() }
  }

  pub fn is_unnamed(&self) -> bool {
    self.bytes.is_empty()
  }

  pub fn is_abstract(&self) -> bool {
    self.bytes.first() == Some(&0)
  }

  /// The filesystem path, unless the address is unnamed or abstract.
  pub fn as_path(&self) -> Option<&Path> {
    if self.is_unnamed() || self.is_abstract() {
      None
    } else {
      Some(Path::new(OsStr::from_bytes(&self.bytes)))
    }
  }

  /// The raw `sun_path` bytes.
  pub fn as_bytes(&self) -> &[u8] {
    &self.bytes
  }
}

impl fmt::Display for LocalAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_unnamed() {
      f.write_str("(unnamed)")
    } else if self.is_abstract() {
      write!(f, "@{}", String::from_utf8_lossy(&self.bytes[1..]))
    } else {
      write!(f, "{}", String::from_utf8_lossy(&self.bytes))
    }
  }
}

/// A `sockaddr_storage` plus the length the kernel uses.
#[derive(Clone, Copy)]
pub(crate) struct SockAddr {
  storage: libc::sockaddr_storage,
  len: libc::socklen_t,
}

impl SockAddr {
  /// Empty storage for syscalls that fill in an address.
  pub(crate) fn zeroed() -> Self {
    // SAFETY: sockaddr_storage is plain data; all-zero is valid.
    let storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    Self { storage, len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t }
  }

  pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
    &self.storage as *const _ as *const libc::sockaddr
  }

  pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
    &mut self.storage as *mut _ as *mut libc::sockaddr
  }

  pub(crate) fn len(&self) -> libc::socklen_t {
    self.len
  }

  pub(crate) fn len_mut(&mut self) -> &mut libc::socklen_t {
    &mut self.len
  }

  pub(crate) fn as_bytes(&self) -> &[u8] {
    let len = (self.len as usize).min(mem::size_of::<libc::sockaddr_storage>());
    // SAFETY: `storage` is `len` initialized bytes long.
    unsafe { std::slice::from_raw_parts(self.as_ptr() as *const u8, len) }
  }

  pub(crate) fn encode(addr: &Address) -> Result<Self> {
    let mut out = Self::zeroed();
    let len = match addr {
      Address::V4(v4) => {
        let raw = into_sockaddr_in(v4);
        // SAFETY: sockaddr_in fits into sockaddr_storage by definition.
        unsafe { ptr::write(out.as_mut_ptr() as *mut libc::sockaddr_in, raw) };
        mem::size_of::<libc::sockaddr_in>()
      }
      Address::V6(v6) => {
        let raw = into_sockaddr_in6(v6);
        // SAFETY: sockaddr_in6 fits into sockaddr_storage by definition.
        unsafe { ptr::write(out.as_mut_ptr() as *mut libc::sockaddr_in6, raw) };
        mem::size_of::<libc::sockaddr_in6>()
      }
      Address::Local(local) => {
        let raw = into_sockaddr_un(local)?;
        let len = SUN_PATH_OFFSET + local.bytes.len() + usize::from(!local.is_abstract() && !local.is_unnamed());
        // SAFETY: sockaddr_un fits into sockaddr_storage by definition.
        unsafe { ptr::write(out.as_mut_ptr() as *mut libc::sockaddr_un, raw) };
        len
      }
      Address::Unspecified => {
        // SAFETY: sockaddr is plain data; all-zero is valid.
        let mut raw: libc::sockaddr = unsafe { mem::zeroed() };
        raw.sa_family = libc::AF_UNSPEC as libc::sa_family_t;
        // SAFETY: sockaddr fits into sockaddr_storage by definition.
        unsafe { ptr::write(out.as_mut_ptr(), raw) };
        mem::size_of::<libc::sockaddr>()
      }
    };
    out.len = len as libc::socklen_t;
    Ok(out)
  }

  pub(crate) fn decode(&self) -> Result<Address> {
    let len = self.len as usize;
    if len == 0 {
      return Ok(Address::Unspecified);
    }
    if len < mem::size_of::<libc::sa_family_t>() + usize::from(cfg!(any(apple, bsd))) {
      return Err(Error::invalid("socket address is too short"));
    }

    match self.storage.ss_family as libc::c_int {
      libc::AF_INET => {
        if len < mem::size_of::<libc::sockaddr_in>() {
          return Err(Error::invalid("IPv4 socket address is too short"));
        }
        // SAFETY: the family says this is a sockaddr_in and it is long enough.
        let raw = unsafe { *(self.as_ptr() as *const libc::sockaddr_in) };
        let ip = Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr));
        Ok(Address::V4(SocketAddrV4::new(ip, u16::from_be(raw.sin_port))))
      }
      libc::AF_INET6 => {
        if len < mem::size_of::<libc::sockaddr_in6>() {
          return Err(Error::invalid("IPv6 socket address is too short"));
        }
        // SAFETY: the family says this is a sockaddr_in6 and it is long enough.
        let raw = unsafe { *(self.as_ptr() as *const libc::sockaddr_in6) };
        Ok(Address::V6(SocketAddrV6::new(
          Ipv6Addr::from(raw.sin6_addr.s6_addr),
          u16::from_be(raw.sin6_port),
          raw.sin6_flowinfo,
          raw.sin6_scope_id,
        )))
      }
      libc::AF_UNIX => {
        if len < SUN_PATH_OFFSET {
          return Err(Error::invalid("local socket address is too short"));
        }
        // SAFETY: the family says this is a sockaddr_un; the storage is larger.
        let raw = unsafe { &*(self.as_ptr() as *const libc::sockaddr_un) };
        let path_len = (len - SUN_PATH_OFFSET).min(SUN_PATH_LEN);
        let bytes: Vec<u8> = raw.sun_path[..path_len].iter().map(|&c| c as u8).collect();

        let bytes = if cfg!(linux) && bytes.first() == Some(&0) {
          bytes
        } else {
          let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
          bytes[..end].to_vec()
        };
        Ok(Address::Local(LocalAddr { bytes }))
      }
      libc::AF_UNSPEC => Ok(Address::Unspecified),
      other => Err(Error::with_code(
        crate::ErrorKind::InvalidArgument,
        libc::EAFNOSUPPORT,
        format!("unsupported address family {other}"),
      )),
    }
  }
}

/// Encodes an address into the platform's `sockaddr` wire bytes.
pub fn encode(addr: &Address) -> Result<Vec<u8>> {
  Ok(SockAddr::encode(addr)?.as_bytes().to_vec())
}

/// Decodes `sockaddr` wire bytes of the given family.
///
/// Fails with `InvalidArgument` if the bytes are too short for the family or
/// carry a different family.
pub fn decode(family: Family, bytes: &[u8]) -> Result<Address> {
  if bytes.len() > mem::size_of::<libc::sockaddr_storage>() {
    return Err(Error::invalid("socket address is longer than sockaddr_storage"));
  }
  let mut addr = SockAddr::zeroed();
  // SAFETY: bounds checked above; source and destination do not overlap.
  unsafe {
    ptr::copy_nonoverlapping(bytes.as_ptr(), addr.as_mut_ptr() as *mut u8, bytes.len());
  }
  addr.len = bytes.len() as libc::socklen_t;

  if family == Family::Unspecified {
    return match addr.decode()? {
      Address::Unspecified => Ok(Address::Unspecified),
      _ => Err(Error::invalid("address family does not match AF_UNSPEC")),
    };
  }
  if bytes.is_empty() {
    return Err(Error::invalid("socket address is empty"));
  }
  if addr.storage.ss_family as libc::c_int != family.as_raw() {
    return Err(Error::invalid(format!(
      "address family {} does not match {family:?}",
      addr.storage.ss_family
    )));
  }
  addr.decode()
}

fn into_sockaddr_in(addr: &SocketAddrV4) -> libc::sockaddr_in {
  // SAFETY: sockaddr_in is plain data; all-zero is valid.
  let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
  #[cfg(any(apple, bsd))]
  {
    raw.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
  }
  raw.sin_family = libc::AF_INET as libc::sa_family_t;
  raw.sin_port = addr.port().to_be();
  raw.sin_addr = libc::in_addr { s_addr: u32::from(*addr.ip()).to_be() };
  raw
}

fn into_sockaddr_in6(addr: &SocketAddrV6) -> libc::sockaddr_in6 {
  // SAFETY: sockaddr_in6 is plain data; all-zero is valid.
  let mut raw: libc::sockaddr_in6 = unsafe { mem::zeroed() };
  #[cfg(any(apple, bsd))]
  {
    raw.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
  }
  raw.sin6_family = libc::AF_INET6 as libc::sa_family_t;
  raw.sin6_port = addr.port().to_be();
  raw.sin6_flowinfo = addr.flowinfo();
  raw.sin6_addr = libc::in6_addr { s6_addr: addr.ip().octets() };
  raw.sin6_scope_id = addr.scope_id();
  raw
}

fn into_sockaddr_un(addr: &LocalAddr) -> Result<libc::sockaddr_un> {
  let limit = if addr.is_abstract() { SUN_PATH_LEN } else { MAX_LOCAL_PATH };
  if addr.bytes.len() > limit {
    return Err(Error::with_code(
      crate::ErrorKind::InvalidArgument,
      libc::ENAMETOOLONG,
      "local address does not fit into sun_path",
    ));
  }
  if !addr.is_abstract() && addr.bytes.contains(&0) {
    return Err(Error::invalid("local address path contains a NUL byte"));
  }

  // SAFETY: sockaddr_un is plain data; all-zero is valid.
  let mut raw: libc::sockaddr_un = unsafe { mem::zeroed() };
  #[cfg(any(apple, bsd))]
  {
    raw.sun_len = (SUN_PATH_OFFSET + addr.bytes.len() + 1) as u8;
  }
  raw.sun_family = libc::AF_UNIX as libc::sa_family_t;
  for (dst, &src) in raw.sun_path.iter_mut().zip(&addr.bytes) {
    *dst = src as libc::c_char;
  }
  Ok(raw)
}
