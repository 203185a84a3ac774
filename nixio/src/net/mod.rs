//! Socket creation and the socket half of [`Descriptor`].

mod addr;
mod resolve;

pub use addr::{Address, LocalAddr, MAX_LOCAL_PATH, decode, encode};
pub use resolve::{Candidate, Candidates, Resolution, Resolver, lookup_name, resolve};

pub(crate) use addr::SockAddr;

use std::io;
use std::mem;
use std::net::Shutdown;
use std::os::fd::RawFd;

use crate::descriptor::{Description, Descriptor, Family, Kind, SockType, Wait};
use crate::error::{Error, ErrorKind, Result};

/// Finds out what an existing socket descriptor is. Unknown values map to
/// the `Unspecified` variants.
pub(crate) fn query_socket(fd: RawFd) -> (Family, SockType, i32) {
  let socket_type = get_int(fd, libc::SO_TYPE)
    .ok()
    .and_then(SockType::from_raw)
    .unwrap_or(SockType::Unspecified);

  #[cfg(linux)]
  let family = get_int(fd, libc::SO_DOMAIN).ok();
  #[cfg(not(linux))]
  let family = {
    let mut addr = SockAddr::zeroed();
    syscall!(getsockname(fd, addr.as_mut_ptr(), addr.len_mut()))
      .ok()
      .map(|_| addr.decode().map(|a| a.family().as_raw()).unwrap_or(libc::AF_UNSPEC))
  };
  let family = family.and_then(Family::from_raw).unwrap_or(Family::Unspecified);

  #[cfg(any(linux, target_os = "freebsd"))]
  let protocol = get_int(fd, libc::SO_PROTOCOL).unwrap_or(0);
  #[cfg(not(any(linux, target_os = "freebsd")))]
  let protocol = 0;

  (family, socket_type, protocol)
}

fn get_int(fd: RawFd, name: libc::c_int) -> io::Result<libc::c_int> {
  let mut value: libc::c_int = 0;
  let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
  syscall!(getsockopt(
    fd,
    libc::SOL_SOCKET,
    name,
    &mut value as *mut _ as *mut libc::c_void,
    &mut len
  ))?;
  Ok(value)
}

/// Flags Linux applies atomically at creation.
#[cfg(linux)]
const NEW_SOCKET_FLAGS: libc::c_int = libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK;

/// Per-platform socket setup after creation: close-on-exec and a
/// non-blocking kernel descriptor where the kernel could not set them
/// atomically, and SIGPIPE suppression on Apple/BSD.
fn configure_new_socket(fd: RawFd) -> io::Result<()> {
  #[cfg(not(linux))]
  {
    crate::util::set_cloexec(fd)?;
    // BSD-derived kernels also copy O_NONBLOCK from a listener on accept.
    crate::util::set_nonblocking(fd, true)?;
  }

  #[cfg(any(
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    target_vendor = "apple"
  ))]
  {
    let one: libc::c_int = 1;
    syscall!(setsockopt(
      fd,
      libc::SOL_SOCKET,
      libc::SO_NOSIGPIPE,
      &one as *const _ as *const libc::c_void,
      mem::size_of::<libc::c_int>() as libc::socklen_t
    ))?;
  }

  let _ = fd;
  Ok(())
}

#[cfg(linux)]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(linux))]
const SEND_FLAGS: libc::c_int = 0;

impl Descriptor {
  /// Creates a socket.
  ///
  /// `protocol` 0 picks the default protocol for the family and type.
  pub fn socket(family: Family, socket_type: SockType, protocol: i32) -> Result<Self> {
    if family == Family::Unspecified {
      return Err(Error::with_code(
        ErrorKind::InvalidArgument,
        libc::EAFNOSUPPORT,
        "a socket needs an address family",
      ));
    }
    if socket_type == SockType::Unspecified {
      return Err(Error::with_code(
        ErrorKind::InvalidArgument,
        libc::ESOCKTNOSUPPORT,
        "a socket needs a socket type",
      ));
    }

    #[cfg(linux)]
    let raw_type = socket_type.as_raw() | NEW_SOCKET_FLAGS;
    #[cfg(not(linux))]
    let raw_type = socket_type.as_raw();

    let fd = syscall!(socket(family.as_raw(), raw_type, protocol))?;
    if let Err(err) = configure_new_socket(fd) {
      let _ = syscall!(close(fd));
      return Err(err.into());
    }

    let (_, _, queried) = query_socket(fd);
    let protocol = if protocol == 0 { queried } else { protocol };
    Ok(Self::from_parts(
      fd,
      Kind::Socket,
      family,
      socket_type,
      protocol,
      Description::new(false),
    ))
  }

  /// Creates a pair of connected sockets (local family only on most systems).
  pub fn socket_pair(family: Family, socket_type: SockType) -> Result<(Self, Self)> {
    if socket_type == SockType::Unspecified {
      return Err(Error::invalid("a socket pair needs a socket type"));
    }

    #[cfg(linux)]
    let raw_type = socket_type.as_raw() | NEW_SOCKET_FLAGS;
    #[cfg(not(linux))]
    let raw_type = socket_type.as_raw();

    let mut fds = [-1 as RawFd; 2];
    syscall!(socketpair(family.as_raw(), raw_type, 0, fds.as_mut_ptr()))?;
    if let Err(err) = fds.iter().try_for_each(|&fd| configure_new_socket(fd)) {
      for fd in fds {
        let _ = syscall!(close(fd));
      }
      return Err(err.into());
    }

    let make = |fd| {
      Self::from_parts(fd, Kind::Socket, family, socket_type, 0, Description::new(false))
    };
    Ok((make(fds[0]), make(fds[1])))
  }

  /// Accepts one pending connection, returning the new socket and the peer.
  ///
  /// The new socket inherits this handle's family, type and protocol and
  /// starts out in blocking mode on every platform.
  pub fn accept(&self) -> Result<(Self, Address)> {
    self.require_kind(Kind::Socket, "accept")?;

    let mut peer = SockAddr::zeroed();
    let fd = self.io_op(Wait::Read, |fd| {
      peer = SockAddr::zeroed();

      #[cfg(linux)]
      let res = syscall!(accept4(fd, peer.as_mut_ptr(), peer.len_mut(), NEW_SOCKET_FLAGS));
      #[cfg(not(linux))]
      let res = syscall!(accept(fd, peer.as_mut_ptr(), peer.len_mut()));

      res
    })?;

    if let Err(err) = configure_new_socket(fd) {
      let _ = syscall!(close(fd));
      return Err(err.into());
    }

    let accepted = Self::from_parts(
      fd,
      Kind::Socket,
      self.family(),
      self.socket_type(),
      self.protocol(),
      Description::new(false),
    );
    let peer = peer.decode()?;
    tracing::debug!(fd, listener = self.token().get(), %peer, "connection accepted");
    Ok((accepted, peer))
  }

  /// Binds the socket to a local address.
  pub fn bind(&self, addr: &Address) -> Result<()> {
    self.require_kind(Kind::Socket, "bind")?;
    self.check_family(addr)?;
    let owned = self.acquire()?;
    let raw = SockAddr::encode(addr)?;
    syscall!(bind(owned.fd(), raw.as_ptr(), raw.len()))?;
    Ok(())
  }

  /// Marks the socket as accepting connections.
  pub fn listen(&self, backlog: i32) -> Result<()> {
    self.require_kind(Kind::Socket, "listen")?;
    let owned = self.acquire()?;
    syscall!(listen(owned.fd(), backlog))?;
    Ok(())
  }

  /// Connects the socket.
  ///
  /// On a non-blocking socket an in-progress stream connect fails with
  /// [`ErrorKind::WouldBlock`] carrying `EINPROGRESS`; wait for writability
  /// and check [`take_error`](Self::take_error). Connecting a datagram socket
  /// to [`Address::Unspecified`] dissolves its association.
  pub fn connect(&self, addr: &Address) -> Result<()> {
    self.require_kind(Kind::Socket, "connect")?;
    if *addr != Address::Unspecified {
      self.check_family(addr)?;
    } else if self.socket_type() != SockType::Datagram {
      return Err(Error::invalid("only datagram sockets can disconnect"));
    }

    let owned = self.acquire()?;
    let raw = SockAddr::encode(addr)?;
    match syscall!(connect(owned.fd(), raw.as_ptr(), raw.len())) {
      Ok(_) => Ok(()),
      // Dissolving an association may report EAFNOSUPPORT on BSD kernels even
      // though it succeeded.
      Err(err)
        if *addr == Address::Unspecified
          && err.raw_os_error() == Some(libc::EAFNOSUPPORT) =>
      {
        Ok(())
      }
      // In blocking mode the connect is finished here; it also continues in
      // the background after a signal.
      Err(err)
        if self.is_blocking()
          && matches!(err.raw_os_error(), Some(libc::EINPROGRESS | libc::EINTR)) =>
      {
        self.wait_for(Wait::Write)?;
        match self.take_error()? {
          Some(err) => Err(err),
          None => Ok(()),
        }
      }
      Err(err) => Err(err.into()),
    }
  }

  /// Shuts down the read half, write half, or both.
  pub fn shutdown(&self, how: Shutdown) -> Result<()> {
    self.require_kind(Kind::Socket, "shutdown")?;
    let owned = self.acquire()?;
    let how = match how {
      Shutdown::Read => libc::SHUT_RD,
      Shutdown::Write => libc::SHUT_WR,
      Shutdown::Both => libc::SHUT_RDWR,
    };
    syscall!(shutdown(owned.fd(), how))?;
    Ok(())
  }

  /// The address the socket is bound to.
  pub fn local_addr(&self) -> Result<Address> {
    self.require_kind(Kind::Socket, "local_addr")?;
    let owned = self.acquire()?;
    let mut addr = SockAddr::zeroed();
    syscall!(getsockname(owned.fd(), addr.as_mut_ptr(), addr.len_mut()))?;
    addr.decode()
  }

  /// The address of the connected peer.
  pub fn peer_addr(&self) -> Result<Address> {
    self.require_kind(Kind::Socket, "peer_addr")?;
    let owned = self.acquire()?;
    let mut addr = SockAddr::zeroed();
    syscall!(getpeername(owned.fd(), addr.as_mut_ptr(), addr.len_mut()))?;
    addr.decode()
  }

  /// Sends on a connected socket. Never raises SIGPIPE.
  pub fn send(&self, buf: &[u8], flags: i32) -> Result<usize> {
    self.require_kind(Kind::Socket, "send")?;
    self.io_op(Wait::Write, |fd| {
      syscall!(send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags | SEND_FLAGS))
        .map(|n| n as usize)
    })
  }

  /// Receives from a connected socket. `Ok(0)` is end of stream on stream
  /// sockets.
  pub fn recv(&self, buf: &mut [u8], flags: i32) -> Result<usize> {
    self.require_kind(Kind::Socket, "recv")?;
    self.io_op(Wait::Read, |fd| {
      syscall!(recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags))
        .map(|n| n as usize)
    })
  }

  /// Sends a datagram to `addr`.
  pub fn send_to(&self, buf: &[u8], addr: &Address) -> Result<usize> {
    self.require_kind(Kind::Socket, "send_to")?;
    self.check_family(addr)?;
    let raw = SockAddr::encode(addr)?;
    self.io_op(Wait::Write, |fd| {
      syscall!(sendto(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len(),
        SEND_FLAGS,
        raw.as_ptr(),
        raw.len()
      ))
      .map(|n| n as usize)
    })
  }

  /// Receives a datagram and the address it came from.
  ///
  /// Senders without an address (an unbound local socket) are reported as an
  /// unnamed [`LocalAddr`]; connection-oriented sockets that report no
  /// address yield [`Address::Unspecified`].
  pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
    self.require_kind(Kind::Socket, "recv_from")?;
    let mut from = SockAddr::zeroed();
    let n = self.io_op(Wait::Read, |fd| {
      from = SockAddr::zeroed();
      syscall!(recvfrom(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        0,
        from.as_mut_ptr(),
        from.len_mut()
      ))
      .map(|n| n as usize)
    })?;

    let addr = if from.len() == 0 && self.family() == Family::Unix {
      Address::Local(LocalAddr::unnamed())
    } else {
      from.decode()?
    };
    Ok((n, addr))
  }

  /// Takes the pending socket error (`SO_ERROR`), if any.
  pub fn take_error(&self) -> Result<Option<Error>> {
    self.require_kind(Kind::Socket, "take_error")?;
    let owned = self.acquire()?;
    match get_int(owned.fd(), libc::SO_ERROR)? {
      0 => Ok(None),
      code => Ok(Some(Error::from_errno(code))),
    }
  }

  fn check_family(&self, addr: &Address) -> Result<()> {
    if addr.family() == self.family() {
      Ok(())
    } else {
      Err(Error::with_code(
        ErrorKind::InvalidArgument,
        libc::EAFNOSUPPORT,
        format!("{:?} address used with a {:?} socket", addr.family(), self.family()),
      ))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::{Ipv4Addr, SocketAddrV4};

  fn loopback() -> Address {
    Address::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
  }

  #[test]
  fn socket_rejects_unspecified() {
    let err = Descriptor::socket(Family::Unspecified, SockType::Stream, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = Descriptor::socket(Family::Inet, SockType::Unspecified, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
  }

  #[test]
  fn socket_metadata_and_cloexec() {
    let sock = Descriptor::socket(Family::Inet, SockType::Stream, 0).unwrap();
    assert_eq!(sock.kind(), Kind::Socket);
    assert_eq!(sock.family(), Family::Inet);
    assert_eq!(sock.socket_type(), SockType::Stream);

    let fd = sock.raw_fd().unwrap();
    let flags = syscall!(fcntl(fd, libc::F_GETFD)).unwrap();
    assert_ne!(flags & libc::FD_CLOEXEC, 0);

    #[cfg(linux)]
    assert_eq!(sock.protocol(), libc::IPPROTO_TCP);
  }

  #[test]
  fn tcp_accept_inherits_metadata() {
    let listener = Descriptor::socket(Family::Inet, SockType::Stream, 0).unwrap();
    listener.bind(&loopback()).unwrap();
    listener.listen(8).unwrap();
    let addr = listener.local_addr().unwrap();
    assert_ne!(addr.port(), Some(0));

    let client = Descriptor::socket(Family::Inet, SockType::Stream, 0).unwrap();
    client.connect(&addr).unwrap();

    let (server, peer) = listener.accept().unwrap();
    assert_eq!(peer, client.local_addr().unwrap());
    assert_eq!(server.family(), Family::Inet);
    assert_eq!(server.socket_type(), SockType::Stream);
    assert_eq!(server.protocol(), listener.protocol());
    assert!(server.is_blocking());

    client.write(b"hello").unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(server.read(&mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");
  }

  #[test]
  fn blocking_connect_reports_refusal() {
    let listener = Descriptor::socket(Family::Inet, SockType::Stream, 0).unwrap();
    listener.bind(&loopback()).unwrap();
    let addr = listener.local_addr().unwrap();
    listener.close().unwrap();

    let client = Descriptor::socket(Family::Inet, SockType::Stream, 0).unwrap();
    let err = client.connect(&addr).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ECONNREFUSED), "{err}");
  }

  #[test]
  fn nonblocking_accept_would_block() {
    let listener = Descriptor::socket(Family::Inet, SockType::Stream, 0).unwrap();
    listener.bind(&loopback()).unwrap();
    listener.listen(1).unwrap();
    listener.set_blocking(false).unwrap();

    let err = listener.accept().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WouldBlock);
  }

  #[test]
  fn accept_on_pipe_is_unsupported() {
    let (reader, _writer) = Descriptor::pipe().unwrap();
    assert_eq!(reader.accept().unwrap_err().kind(), ErrorKind::Unsupported);
  }

  #[test]
  fn family_mismatch_is_invalid() {
    let sock = Descriptor::socket(Family::Inet6, SockType::Datagram, 0).unwrap();
    let err = sock.bind(&loopback()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
  }

  #[test]
  fn udp_send_to_recv_from() {
    let a = Descriptor::socket(Family::Inet, SockType::Datagram, 0).unwrap();
    let b = Descriptor::socket(Family::Inet, SockType::Datagram, 0).unwrap();
    a.bind(&loopback()).unwrap();
    b.bind(&loopback()).unwrap();

    let b_addr = b.local_addr().unwrap();
    assert_eq!(a.send_to(b"dgram", &b_addr).unwrap(), 5);

    let mut buf = [0u8; 16];
    let (n, from) = b.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"dgram");
    assert_eq!(from, a.local_addr().unwrap());
  }

  #[test]
  fn datagram_disconnect() {
    let a = Descriptor::socket(Family::Inet, SockType::Datagram, 0).unwrap();
    let b = Descriptor::socket(Family::Inet, SockType::Datagram, 0).unwrap();
    b.bind(&loopback()).unwrap();

    a.connect(&b.local_addr().unwrap()).unwrap();
    assert!(a.peer_addr().is_ok());
    a.connect(&Address::Unspecified).unwrap();
    assert!(a.peer_addr().is_err());
  }

  #[test]
  fn socket_pair_and_shutdown() {
    let (a, b) = Descriptor::socket_pair(Family::Unix, SockType::Stream).unwrap();
    a.send(b"x", 0).unwrap();
    a.shutdown(Shutdown::Write).unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(b.recv(&mut buf, 0).unwrap(), 1);
    assert_eq!(b.recv(&mut buf, 0).unwrap(), 0);
  }

  #[test]
  fn send_after_peer_close_is_broken_pipe() {
    let (a, b) = Descriptor::socket_pair(Family::Unix, SockType::Stream).unwrap();
    b.close().unwrap();
    let err = a.send(b"x", 0).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset));
  }

  #[test]
  fn take_error_is_empty_on_fresh_socket() {
    let sock = Descriptor::socket(Family::Inet, SockType::Stream, 0).unwrap();
    assert!(sock.take_error().unwrap().is_none());
  }

  #[test]
  fn from_raw_fd_detects_socket() {
    let sock = Descriptor::socket(Family::Inet6, SockType::Datagram, 0).unwrap();
    let raw = sock.into_raw_fd().unwrap();
    let back = unsafe { Descriptor::from_raw_fd(raw) }.unwrap();
    assert_eq!(back.kind(), Kind::Socket);
    assert_eq!(back.family(), Family::Inet6);
    assert_eq!(back.socket_type(), SockType::Datagram);
  }
}
