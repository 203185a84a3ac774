use std::path::Path;

use super::{Description, Descriptor, Family, Kind, SockType, path_to_cstring};
use crate::error::{Error, Result};
use crate::util::{self, FileType};

/// Options and flags which can be used to configure how a file is opened.
///
/// Built either field by field or from an fopen-style mode string:
///
/// ```rust,no_run
/// use nixio::OpenOptions;
///
/// let log = OpenOptions::new().append(true).create(true).mode(0o600);
/// let same = OpenOptions::from_mode("a").unwrap().mode(0o600);
/// # let _ = (log, same);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOptions {
  read: bool,
  write: bool,
  append: bool,
  truncate: bool,
  create: bool,
  create_new: bool,
  nonblocking: bool,
  mode: u32,
}

impl OpenOptions {
  /// Creates a blank new set of options ready for configuration.
  ///
  /// All options are initially set to `false`; new files get mode `0o666`
  /// (before the umask).
  #[must_use]
  pub const fn new() -> Self {
    Self {
      read: false,
      write: false,
      append: false,
      truncate: false,
      create: false,
      create_new: false,
      nonblocking: false,
      mode: 0o666,
    }
  }

  /// Parses an fopen-style mode string.
  ///
  /// | mode | meaning |
  /// |------|---------|
  /// | `r`  | read |
  /// | `r+` | read and write |
  /// | `w`  | write, create, truncate |
  /// | `w+` | read and write, create, truncate |
  /// | `a`  | append, create |
  /// | `a+` | read and append, create |
  /// | `x` suffix | create only if missing (`wx`, `w+x`) |
  ///
  /// A `b` anywhere after the first letter is accepted and ignored.
  pub fn from_mode(mode: &str) -> Result<Self> {
    let mut chars = mode.chars();
    let mut options = match chars.next() {
      Some('r') => Self::new().read(true),
      Some('w') => Self::new().write(true).create(true).truncate(true),
      Some('a') => Self::new().append(true).create(true),
      _ => return Err(Error::invalid(format!("invalid open mode {mode:?}"))),
    };

    let mut plus = false;
    let mut exclusive = false;
    for c in chars {
      match c {
        '+' if !plus => plus = true,
        'x' if !exclusive && options.truncate => exclusive = true,
        'b' => {}
        _ => return Err(Error::invalid(format!("invalid open mode {mode:?}"))),
      }
    }

    if plus {
      options = options.read(true);
      if !options.append {
        options = options.write(true);
      }
    }
    if exclusive {
      options = options.create_new(true);
    }
    Ok(options)
  }

  /// Sets the option for read access.
  #[must_use]
  pub const fn read(mut self, read: bool) -> Self {
    self.read = read;
    self
  }

  /// Sets the option for write access.
  #[must_use]
  pub const fn write(mut self, write: bool) -> Self {
    self.write = write;
    self
  }

  /// Sets the option for the append mode.
  ///
  /// Setting `.write(true).append(true)` has the same effect as setting only
  /// `.append(true)`.
  #[must_use]
  pub const fn append(mut self, append: bool) -> Self {
    self.append = append;
    self
  }

  /// Truncates an existing file to zero length.
  #[must_use]
  pub const fn truncate(mut self, truncate: bool) -> Self {
    self.truncate = truncate;
    self
  }

  /// Creates the file if it does not exist.
  #[must_use]
  pub const fn create(mut self, create: bool) -> Self {
    self.create = create;
    self
  }

  /// Creates a new file, failing if anything (a dangling symlink included)
  /// already exists at the path.
  #[must_use]
  pub const fn create_new(mut self, create_new: bool) -> Self {
    self.create_new = create_new;
    self
  }

  /// Opens the handle in non-blocking mode (meaningful for FIFOs and devices).
  #[must_use]
  pub const fn nonblocking(mut self, nonblocking: bool) -> Self {
    self.nonblocking = nonblocking;
    self
  }

  /// Sets the permission bits a newly created file gets (before the umask).
  #[must_use]
  pub const fn mode(mut self, mode: u32) -> Self {
    self.mode = mode;
    self
  }

  /// Opens `path` with these options.
  ///
  /// The handle's kind follows what was opened: a FIFO yields a
  /// [`Kind::Pipe`] handle, anything else a [`Kind::File`] handle.
  pub fn open(&self, path: impl AsRef<Path>) -> Result<Descriptor> {
    let flags = self.make_flags()?;
    let path = path.as_ref();
    let c_path = path_to_cstring(path)?;

    let fd = syscall_retry!(open(c_path.as_ptr(), flags, self.mode as libc::c_uint))?;

    let kind = match util::file_type(fd) {
      Ok(FileType::Fifo) => util::set_nonblocking(fd, true).map(|()| Kind::Pipe),
      Ok(_) => Ok(Kind::File),
      Err(err) => Err(err),
    };
    let kind = match kind {
      Ok(kind) => kind,
      Err(err) => {
        let _ = syscall!(close(fd));
        return Err(err.into());
      }
    };

    tracing::debug!(fd, path = %path.display(), flags, "file opened");
    Ok(Descriptor::from_parts(
      fd,
      kind,
      Family::Unspecified,
      SockType::Unspecified,
      0,
      Description::new(self.nonblocking),
    ))
  }

  fn make_flags(&self) -> Result<libc::c_int> {
    let mut flags = libc::O_CLOEXEC;

    flags |= match (self.read, self.write, self.append) {
      (true, false, false) => libc::O_RDONLY,
      (false, true, false) => libc::O_WRONLY,
      (true, true, false) => libc::O_RDWR,
      (false, _, true) => libc::O_WRONLY | libc::O_APPEND,
      (true, _, true) => libc::O_RDWR | libc::O_APPEND,
      (false, false, false) => {
        return Err(Error::invalid("at least one of read, write, or append must be set"));
      }
    };

    if (self.create || self.create_new || self.truncate) && !(self.write || self.append) {
      return Err(Error::invalid("creating or truncating a file requires write access"));
    }
    if self.truncate && self.append {
      return Err(Error::invalid("truncate and append are mutually exclusive"));
    }

    if self.create_new {
      flags |= libc::O_CREAT | libc::O_EXCL;
    } else if self.create {
      flags |= libc::O_CREAT;
    }
    if self.truncate {
      flags |= libc::O_TRUNC;
    }
    if self.nonblocking {
      flags |= libc::O_NONBLOCK;
    }
    Ok(flags)
  }
}

impl Default for OpenOptions {
  fn default() -> Self {
    Self::new()
  }
}
