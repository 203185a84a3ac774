use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Convert Duration to libc::timespec
pub fn duration_to_timespec(duration: Duration) -> libc::timespec {
  libc::timespec {
    tv_sec: duration.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
    tv_nsec: duration.subsec_nanos() as libc::c_long,
  }
}

/// Convert Duration to libc::timeval, rounding sub-microsecond remainders up
/// so that a non-zero duration never becomes zero.
pub fn duration_to_timeval(duration: Duration) -> libc::timeval {
  let mut secs = duration.as_secs().min(libc::time_t::MAX as u64);
  let mut micros = duration.subsec_nanos().div_ceil(1_000);
  if micros == 1_000_000 {
    secs += 1;
    micros = 0;
  }
  libc::timeval {
    tv_sec: secs as libc::time_t,
    tv_usec: micros as libc::suseconds_t,
  }
}

pub fn timeval_to_duration(tv: libc::timeval) -> Duration {
  Duration::new(tv.tv_sec.max(0) as u64, 0)
    + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// Milliseconds for poll(2)/epoll_wait(2), rounding up; `-1` means forever.
pub fn timeout_to_millis(timeout: Option<Duration>) -> libc::c_int {
  match timeout {
    None => -1,
    Some(d) => {
      let ms = d.as_nanos().div_ceil(1_000_000);
      if ms > libc::c_int::MAX as u128 { libc::c_int::MAX } else { ms as libc::c_int }
    }
  }
}

pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
  let flags = syscall!(fcntl(fd, libc::F_GETFD))?;
  if flags & libc::FD_CLOEXEC == 0 {
    syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
  }
  Ok(())
}

pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
  let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
  let updated = if nonblocking {
    flags | libc::O_NONBLOCK
  } else {
    flags & !libc::O_NONBLOCK
  };
  if updated != flags {
    syscall!(fcntl(fd, libc::F_SETFL, updated))?;
  }
  Ok(())
}

pub fn is_nonblocking(fd: RawFd) -> io::Result<bool> {
  let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
  Ok(flags & libc::O_NONBLOCK != 0)
}

/// Creates a close-on-exec pipe, returning `[read, write]`.
pub fn pipe(nonblocking: bool) -> io::Result<[RawFd; 2]> {
  let mut fds = [-1 as RawFd; 2];

  #[cfg(linux)]
  {
    let flags =
      libc::O_CLOEXEC | if nonblocking { libc::O_NONBLOCK } else { 0 };
    syscall!(pipe2(fds.as_mut_ptr(), flags))?;
  }

  #[cfg(not(linux))]
  {
    syscall!(pipe(fds.as_mut_ptr()))?;
    let configured = fds.iter().try_for_each(|&fd| {
      set_cloexec(fd)?;
      if nonblocking {
        set_nonblocking(fd, true)?;
      }
      Ok::<_, io::Error>(())
    });
    if let Err(err) = configured {
      for fd in fds {
        let _ = syscall!(close(fd));
      }
      return Err(err);
    }
  }

  Ok(fds)
}

/// Waits until `fd` reports any of `events` or `cancel_fd` becomes readable.
///
/// Returns `Ok(true)` when `fd` is ready, `Ok(false)` on timeout or when the
/// cancel descriptor fired (the caller tells the two apart).
pub fn poll_fd(
  fd: RawFd,
  events: libc::c_short,
  cancel_fd: Option<RawFd>,
  timeout: Option<Duration>,
) -> io::Result<bool> {
  let mut fds = [
    libc::pollfd { fd, events, revents: 0 },
    libc::pollfd { fd: cancel_fd.unwrap_or(-1), events: libc::POLLIN, revents: 0 },
  ];
  let nfds = if cancel_fd.is_some() { 2 } else { 1 };
  let deadline = timeout.map(|t| std::time::Instant::now() + t);

  loop {
    let remaining = deadline
      .map(|d| d.saturating_duration_since(std::time::Instant::now()));
    match syscall!(poll(fds.as_mut_ptr(), nfds, timeout_to_millis(remaining))) {
      Ok(0) => return Ok(false),
      Ok(_) => {
        if nfds == 2 && fds[1].revents != 0 {
          return Ok(false);
        }
        return Ok(fds[0].revents != 0);
      }
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      Err(err) => return Err(err),
    }
  }
}

/// The kind of object behind a raw descriptor, as reported by fstat(2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
  Regular,
  Fifo,
  Socket,
  Other,
}

pub fn file_type(fd: RawFd) -> io::Result<FileType> {
  // SAFETY: all-zero is a valid `stat`.
  let mut stat: libc::stat = unsafe { std::mem::zeroed() };
  syscall!(fstat(fd, &mut stat))?;
  Ok(match stat.st_mode & libc::S_IFMT {
    libc::S_IFREG => FileType::Regular,
    libc::S_IFIFO => FileType::Fifo,
    libc::S_IFSOCK => FileType::Socket,
    _ => FileType::Other,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_duration_to_timespec() {
    let ts = duration_to_timespec(Duration::from_millis(1500));
    assert_eq!(ts.tv_sec, 1);
    assert_eq!(ts.tv_nsec, 500_000_000);
  }

  #[test]
  fn test_duration_to_timeval_rounds_up() {
    let tv = duration_to_timeval(Duration::from_nanos(1));
    assert_eq!((tv.tv_sec, tv.tv_usec), (0, 1));

    let tv = duration_to_timeval(Duration::new(1, 999_999_999));
    assert_eq!((tv.tv_sec, tv.tv_usec), (2, 0));

    let tv = duration_to_timeval(Duration::from_millis(2500));
    assert_eq!(timeval_to_duration(tv), Duration::from_millis(2500));
  }

  #[test]
  fn test_timeout_to_millis() {
    assert_eq!(timeout_to_millis(None), -1);
    assert_eq!(timeout_to_millis(Some(Duration::ZERO)), 0);
    assert_eq!(timeout_to_millis(Some(Duration::from_micros(10))), 1);
    assert_eq!(timeout_to_millis(Some(Duration::from_secs(u64::MAX))), libc::c_int::MAX);
  }

  #[test]
  fn test_pipe_is_cloexec_and_nonblocking() {
    let [r, w] = pipe(true).unwrap();
    assert!(is_nonblocking(r).unwrap());
    assert!(is_nonblocking(w).unwrap());
    let flags = syscall!(fcntl(r, libc::F_GETFD)).unwrap();
    assert_ne!(flags & libc::FD_CLOEXEC, 0);
    assert_eq!(file_type(r).unwrap(), FileType::Fifo);
    unsafe {
      libc::close(r);
      libc::close(w);
    }
  }
}
