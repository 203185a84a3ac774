//! Error model shared by every nixio operation.
//!
//! Every failure is reported as an [`Error`]: an [`ErrorKind`] classifying the
//! failure, the originating platform code (an `errno` value, or the resolver's
//! `EAI_*` code for [`ErrorKind::ResolutionFailed`]) and a human readable
//! message. Nothing is ever downgraded to a default value.

use std::{borrow::Cow, fmt, io};

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
  /// The arguments were rejected, by nixio or by the OS.
  InvalidArgument,
  /// The caller lacks the privilege for the operation.
  PermissionDenied,
  /// The OS refused to allocate a descriptor, buffer or memory.
  ResourceExhausted,
  /// The handle is closed, or the raw descriptor is not valid.
  InvalidHandle,
  /// A non-blocking operation could not complete immediately.
  WouldBlock,
  /// A socket option value has the wrong value kind.
  TypeMismatch,
  /// The operation or option does not apply to this handle or platform.
  Unsupported,
  /// A fixed-capacity readiness mechanism is full.
  CapacityExceeded,
  /// Name or service resolution failed.
  ResolutionFailed,
  /// The peer reset the connection.
  ConnectionReset,
  /// The other end of a pipe or stream is gone.
  BrokenPipe,
  /// Any other OS failure; the raw code is preserved.
  Os,
}

impl ErrorKind {
  pub const fn as_str(self) -> &'static str {
    match self {
      ErrorKind::InvalidArgument => "invalid argument",
      ErrorKind::PermissionDenied => "permission denied",
      ErrorKind::ResourceExhausted => "resource exhausted",
      ErrorKind::InvalidHandle => "invalid handle",
      ErrorKind::WouldBlock => "operation would block",
      ErrorKind::TypeMismatch => "type mismatch",
      ErrorKind::Unsupported => "unsupported",
      ErrorKind::CapacityExceeded => "capacity exceeded",
      ErrorKind::ResolutionFailed => "resolution failed",
      ErrorKind::ConnectionReset => "connection reset",
      ErrorKind::BrokenPipe => "broken pipe",
      ErrorKind::Os => "os error",
    }
  }

  /// Classifies a raw `errno` value.
  pub fn from_errno(code: i32) -> Self {
    match code {
      libc::EINVAL
      | libc::EAFNOSUPPORT
      | libc::EPROTONOSUPPORT
      | libc::ESOCKTNOSUPPORT
      | libc::EPROTOTYPE
      | libc::ENAMETOOLONG
      | libc::EDESTADDRREQ
      | libc::EISCONN
      | libc::EFAULT => ErrorKind::InvalidArgument,
      libc::EACCES | libc::EPERM => ErrorKind::PermissionDenied,
      libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => {
        ErrorKind::ResourceExhausted
      }
      libc::EBADF => ErrorKind::InvalidHandle,
      libc::ENOPROTOOPT | libc::EOPNOTSUPP | libc::ENOSYS | libc::ENOTSOCK => {
        ErrorKind::Unsupported
      }
      libc::ECONNRESET | libc::ECONNABORTED => ErrorKind::ConnectionReset,
      libc::EPIPE => ErrorKind::BrokenPipe,
      code
        if code == libc::EAGAIN
          || code == libc::EWOULDBLOCK
          || code == libc::EINPROGRESS
          || code == libc::EALREADY =>
      {
        ErrorKind::WouldBlock
      }
      _ => ErrorKind::Os,
    }
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// The `(kind, platform code, message)` triple reported for every failure.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
  kind: ErrorKind,
  code: Option<i32>,
  message: Cow<'static, str>,
}

impl Error {
  /// Creates an error that did not originate from the OS.
  pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
    Self { kind, code: None, message: message.into() }
  }

  /// Creates an error from a raw `errno` value, classifying it.
  pub fn from_errno(code: i32) -> Self {
    let message = io::Error::from_raw_os_error(code).to_string();
    Self { kind: ErrorKind::from_errno(code), code: Some(code), message: message.into() }
  }

  /// Creates an error from the calling thread's current `errno`.
  pub fn last_os_error() -> Self {
    io::Error::last_os_error().into()
  }

  pub(crate) fn with_code(
    kind: ErrorKind,
    code: i32,
    message: impl Into<Cow<'static, str>>,
  ) -> Self {
    Self { kind, code: Some(code), message: message.into() }
  }

  pub(crate) fn closed() -> Self {
    Self::with_code(ErrorKind::InvalidHandle, libc::EBADF, "handle is closed")
  }

  pub(crate) fn invalid(message: impl Into<Cow<'static, str>>) -> Self {
    Self::with_code(ErrorKind::InvalidArgument, libc::EINVAL, message)
  }

  pub(crate) fn unsupported(message: impl Into<Cow<'static, str>>) -> Self {
    Self::with_code(ErrorKind::Unsupported, libc::EOPNOTSUPP, message)
  }

  pub fn kind(&self) -> ErrorKind {
    self.kind
  }

  /// The originating platform code, if the failure came from the OS.
  pub fn raw_os_error(&self) -> Option<i32> {
    self.code
  }

  pub fn message(&self) -> &str {
    &self.message
  }

  pub fn is_would_block(&self) -> bool {
    self.kind == ErrorKind::WouldBlock
  }
}

impl From<io::Error> for Error {
  fn from(err: io::Error) -> Self {
    match err.raw_os_error() {
      Some(code) => Error::from_errno(code),
      None => {
        let kind = match err.kind() {
          io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
            ErrorKind::InvalidArgument
          }
          io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
          io::ErrorKind::WouldBlock => ErrorKind::WouldBlock,
          io::ErrorKind::Unsupported => ErrorKind::Unsupported,
          io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
          io::ErrorKind::BrokenPipe => ErrorKind::BrokenPipe,
          io::ErrorKind::OutOfMemory => ErrorKind::ResourceExhausted,
          _ => ErrorKind::Os,
        };
        Error::new(kind, err.to_string())
      }
    }
  }
}

impl From<Error> for io::Error {
  fn from(err: Error) -> Self {
    match (err.kind, err.code) {
      (ErrorKind::ResolutionFailed, _) | (_, None) => {
        let kind = match err.kind {
          ErrorKind::InvalidArgument | ErrorKind::TypeMismatch => {
            io::ErrorKind::InvalidInput
          }
          ErrorKind::PermissionDenied => io::ErrorKind::PermissionDenied,
          ErrorKind::WouldBlock => io::ErrorKind::WouldBlock,
          ErrorKind::Unsupported => io::ErrorKind::Unsupported,
          ErrorKind::ConnectionReset => io::ErrorKind::ConnectionReset,
          ErrorKind::BrokenPipe => io::ErrorKind::BrokenPipe,
          ErrorKind::ResourceExhausted => io::ErrorKind::OutOfMemory,
          _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
      }
      (_, Some(code)) => io::Error::from_raw_os_error(code),
    }
  }
}
