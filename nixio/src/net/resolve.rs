//! Name resolution through the OS resolver (getaddrinfo/getnameinfo).

use std::ffi::{CStr, CString};
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::{fmt, io};

use super::addr::{Address, SockAddr};
use crate::descriptor::{Family, SockType};
use crate::error::{Error, ErrorKind, Result};

const NI_MAXHOST: usize = 1025;
const NI_MAXSERV: usize = 32;

/// Resolves `host` and/or `service` to addresses.
///
/// `family` restricts the result (`Family::Unspecified` accepts any). Fails
/// with [`ErrorKind::ResolutionFailed`] carrying the resolver's `EAI_*` code
/// and reason; a successful result is never empty.
///
/// ```rust,no_run
/// use nixio::Family;
///
/// let resolution = nixio::resolve(Some("localhost"), Some("80"), Family::Unspecified)?;
/// for addr in resolution.iter() {
///     println!("{addr}");
/// }
/// # Ok::<(), nixio::Error>(())
/// ```
pub fn resolve(host: Option<&str>, service: Option<&str>, family: Family) -> Result<Resolution> {
  Resolver::new().family(family).resolve(host, service)
}

/// Resolution hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolver {
  family: Family,
  socket_type: SockType,
  protocol: i32,
  passive: bool,
  numeric_host: bool,
}

impl Resolver {
  pub const fn new() -> Self {
    Self {
      family: Family::Unspecified,
      socket_type: SockType::Unspecified,
      protocol: 0,
      passive: false,
      numeric_host: false,
    }
  }

  #[must_use]
  pub const fn family(mut self, family: Family) -> Self {
    self.family = family;
    self
  }

  #[must_use]
  pub const fn socket_type(mut self, socket_type: SockType) -> Self {
    self.socket_type = socket_type;
    self
  }

  #[must_use]
  pub const fn protocol(mut self, protocol: i32) -> Self {
    self.protocol = protocol;
    self
  }

  /// Return wildcard addresses suitable for `bind` when `host` is `None`.
  #[must_use]
  pub const fn passive(mut self, passive: bool) -> Self {
    self.passive = passive;
    self
  }

  /// Only accept numeric hosts; never query the network.
  #[must_use]
  pub const fn numeric_host(mut self, numeric: bool) -> Self {
    self.numeric_host = numeric;
    self
  }

  pub fn resolve(&self, host: Option<&str>, service: Option<&str>) -> Result<Resolution> {
    let host = host.map(to_cstring).transpose()?;
    let service = service.map(to_cstring).transpose()?;

    // SAFETY: addrinfo is plain data; all-zero is a valid hints value.
    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = self.family.as_raw();
    hints.ai_socktype = self.socket_type.as_raw();
    hints.ai_protocol = self.protocol;
    if self.passive {
      hints.ai_flags |= libc::AI_PASSIVE;
    }
    if self.numeric_host {
      hints.ai_flags |= libc::AI_NUMERICHOST;
    }

    let mut res: *mut libc::addrinfo = ptr::null_mut();
    // SAFETY: every pointer is valid for the duration of the call.
    let code = unsafe {
      libc::getaddrinfo(
        host.as_ref().map_or(ptr::null(), |h| h.as_ptr()),
        service.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
        &hints,
        &mut res,
      )
    };
    if code != 0 {
      return Err(gai_error(code));
    }

    match NonNull::new(res) {
      Some(head) => {
        let resolution = Resolution { head };
        tracing::trace!(
          host = ?host,
          service = ?service,
          entries = resolution.candidates().count(),
          "resolved"
        );
        Ok(resolution)
      }
      None => Err(gai_error(libc::EAI_NONAME)),
    }
  }
}

impl Default for Resolver {
  fn default() -> Self {
    Self::new()
  }
}

/// Reverse-resolves an address to `(host, service)` names.
pub fn lookup_name(addr: &Address) -> Result<(String, String)> {
  if !matches!(addr, Address::V4(_) | Address::V6(_)) {
    return Err(Error::invalid("only network addresses can be reverse resolved"));
  }
  let raw = SockAddr::encode(addr)?;

  let mut host = [0 as libc::c_char; NI_MAXHOST];
  let mut service = [0 as libc::c_char; NI_MAXSERV];
  // SAFETY: the buffers outlive the call and their lengths are passed along.
  let code = unsafe {
    libc::getnameinfo(
      raw.as_ptr(),
      raw.len(),
      host.as_mut_ptr(),
      host.len() as libc::socklen_t,
      service.as_mut_ptr(),
      service.len() as libc::socklen_t,
      0,
    )
  };
  if code != 0 {
    return Err(gai_error(code));
  }

  // SAFETY: getnameinfo NUL-terminates both buffers on success.
  let (host, service) = unsafe {
    (
      CStr::from_ptr(host.as_ptr()).to_string_lossy().into_owned(),
      CStr::from_ptr(service.as_ptr()).to_string_lossy().into_owned(),
    )
  };
  Ok((host, service))
}

/// The result of [`resolve`]: the resolver's list, decoded lazily.
///
/// Iterating is restartable; [`iter`](Self::iter) may be called any number
/// of times and yields entries in the order the resolver returned them.
pub struct Resolution {
  head: NonNull<libc::addrinfo>,
}

// SAFETY: the list is never mutated after getaddrinfo returns and is only
// freed on drop.
unsafe impl Send for Resolution {}
unsafe impl Sync for Resolution {}

impl Resolution {
  /// The resolved addresses.
  pub fn iter(&self) -> impl Iterator<Item = Address> + '_ {
    self.candidates().map(|c| c.address)
  }

  /// The resolved entries with socket type and protocol.
  pub fn candidates(&self) -> Candidates<'_> {
    Candidates { next: self.head.as_ptr(), _marker: PhantomData }
  }
}

impl Drop for Resolution {
  fn drop(&mut self) {
    // SAFETY: the list came from getaddrinfo and is freed exactly once.
    unsafe { libc::freeaddrinfo(self.head.as_ptr()) };
  }
}

impl fmt::Debug for Resolution {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_list().entries(self.candidates()).finish()
  }
}

impl<'a> IntoIterator for &'a Resolution {
  type Item = Candidate;
  type IntoIter = Candidates<'a>;

  fn into_iter(self) -> Self::IntoIter {
    self.candidates()
  }
}

/// One resolved entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
  pub address: Address,
  pub socket_type: SockType,
  pub protocol: i32,
}

/// Iterator over a [`Resolution`].
pub struct Candidates<'a> {
  next: *const libc::addrinfo,
  _marker: PhantomData<&'a Resolution>,
}

impl Iterator for Candidates<'_> {
  type Item = Candidate;

  fn next(&mut self) -> Option<Candidate> {
    while !self.next.is_null() {
      // SAFETY: nodes stay valid while the Resolution is borrowed.
      let info = unsafe { &*self.next };
      self.next = info.ai_next;

      if info.ai_addr.is_null() {
        continue;
      }
      let mut raw = SockAddr::zeroed();
      let len = (info.ai_addrlen as usize).min(raw.len() as usize);
      // SAFETY: ai_addr points to ai_addrlen bytes; we copy at most the
      // storage size.
      unsafe {
        ptr::copy_nonoverlapping(info.ai_addr as *const u8, raw.as_mut_ptr() as *mut u8, len);
      }
      *raw.len_mut() = len as libc::socklen_t;

      let Ok(address) = raw.decode() else { continue };
      return Some(Candidate {
        address,
        socket_type: SockType::from_raw(info.ai_socktype).unwrap_or(SockType::Unspecified),
        protocol: info.ai_protocol,
      });
    }
    None
  }
}

fn to_cstring(s: &str) -> Result<CString> {
  CString::new(s).map_err(|_| Error::invalid("name contains a NUL byte"))
}

fn gai_error(code: libc::c_int) -> Error {
  if code == libc::EAI_SYSTEM {
    let err = io::Error::last_os_error();
    return Error::with_code(ErrorKind::ResolutionFailed, code, err.to_string());
  }
  // SAFETY: gai_strerror returns a static NUL-terminated string.
  let reason = unsafe { CStr::from_ptr(libc::gai_strerror(code)) };
  Error::with_code(ErrorKind::ResolutionFailed, code, reason.to_string_lossy().into_owned())
}
