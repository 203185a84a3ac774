//! Conformance suite every [`Selector`] backend must pass.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::{NOTIFY_KEY, Selector};
use crate::descriptor::{Descriptor, OpenOptions};
use crate::error::Result;
use crate::poll::{Interest, Readiness};
use crate::test_utils::{fill_send_buffer, temp_path, unix_stream_pair};

fn wait<S: Selector>(selector: &S, timeout: Duration) -> Result<Vec<(u64, Readiness)>> {
  let mut events = Vec::new();
  selector.wait(&mut events, Some(timeout))?;
  Ok(events)
}

fn readiness_of(events: &[(u64, Readiness)], key: u64) -> Readiness {
  events
    .iter()
    .filter(|(k, _)| *k == key)
    .fold(Readiness::EMPTY, |acc, (_, r)| acc | *r)
}

/// Adding read interest and waiting returns no events when no data is available.
pub fn add_read_no_data<S: Selector>(selector: S) -> Result<()> {
  let (a, _b) = unix_stream_pair();
  selector.add(a.raw_fd().unwrap(), 1, Interest::READABLE)?;

  let events = wait(&selector, Duration::from_millis(10))?;
  assert!(events.is_empty(), "expected no events, got {events:?}");
  Ok(())
}

/// Read interest triggers once the peer writes.
pub fn read_becomes_ready<S: Selector>(selector: S) -> Result<()> {
  let (a, b) = unix_stream_pair();
  selector.add(a.raw_fd().unwrap(), 1, Interest::READABLE)?;
  b.write(b"hello")?;

  let events = wait(&selector, Duration::from_millis(500))?;
  assert!(readiness_of(&events, 1).is_readable(), "{events:?}");
  Ok(())
}

/// A fresh socket is writable right away.
pub fn write_immediately_ready<S: Selector>(selector: S) -> Result<()> {
  let (a, _b) = unix_stream_pair();
  selector.add(a.raw_fd().unwrap(), 2, Interest::WRITABLE)?;

  let events = wait(&selector, Duration::from_millis(500))?;
  let readiness = readiness_of(&events, 2);
  assert!(readiness.is_writable(), "{events:?}");
  assert!(!readiness.is_readable(), "{events:?}");
  Ok(())
}

/// Readiness is level-triggered: unread data is reported again.
pub fn level_triggered<S: Selector>(selector: S) -> Result<()> {
  let (a, b) = unix_stream_pair();
  selector.add(a.raw_fd().unwrap(), 3, Interest::READABLE)?;
  b.write(b"x")?;

  for round in 0..3 {
    let events = wait(&selector, Duration::from_millis(500))?;
    assert!(readiness_of(&events, 3).is_readable(), "round {round}: {events:?}");
  }

  let mut buf = [0u8; 1];
  a.read(&mut buf)?;
  let events = wait(&selector, Duration::from_millis(10))?;
  assert!(readiness_of(&events, 3).is_empty(), "{events:?}");
  Ok(())
}

/// Modify switches the reported direction and the key.
pub fn modify_interest<S: Selector>(selector: S) -> Result<()> {
  let (a, _b) = unix_stream_pair();
  let fd = a.raw_fd().unwrap();
  selector.add(fd, 4, Interest::READABLE)?;
  assert!(wait(&selector, Duration::from_millis(10))?.is_empty());

  selector.modify(fd, 5, Interest::WRITABLE)?;
  let events = wait(&selector, Duration::from_millis(500))?;
  assert!(readiness_of(&events, 5).is_writable(), "{events:?}");
  assert!(readiness_of(&events, 4).is_empty(), "{events:?}");
  Ok(())
}

/// Both directions at once are merged or reported per direction.
pub fn both_interests<S: Selector>(selector: S) -> Result<()> {
  let (a, b) = unix_stream_pair();
  selector.add(a.raw_fd().unwrap(), 6, Interest::READABLE | Interest::WRITABLE)?;
  b.write(b"y")?;

  let events = wait(&selector, Duration::from_millis(500))?;
  let readiness = readiness_of(&events, 6);
  assert!(readiness.is_readable() && readiness.is_writable(), "{events:?}");
  Ok(())
}

/// After delete nothing is reported for the descriptor.
pub fn delete_stops_reporting<S: Selector>(selector: S) -> Result<()> {
  let (a, _b) = unix_stream_pair();
  let fd = a.raw_fd().unwrap();
  selector.add(fd, 7, Interest::WRITABLE)?;
  selector.delete(fd)?;
  selector.delete(fd)?;

  let events = wait(&selector, Duration::from_millis(10))?;
  assert!(readiness_of(&events, 7).is_empty(), "{events:?}");
  Ok(())
}

/// Registration is strict.
pub fn strict_registration<S: Selector>(selector: S) -> Result<()> {
  let (a, _b) = unix_stream_pair();
  let fd = a.raw_fd().unwrap();
  assert!(selector.modify(fd, 8, Interest::READABLE).is_err());
  selector.add(fd, 8, Interest::READABLE)?;
  assert!(selector.add(fd, 8, Interest::READABLE).is_err());
  Ok(())
}

/// The peer going away is reported, never swallowed.
pub fn hangup_reported<S: Selector>(selector: S) -> Result<()> {
  let (a, b) = unix_stream_pair();
  selector.add(a.raw_fd().unwrap(), 9, Interest::READABLE)?;
  b.close()?;

  let events = wait(&selector, Duration::from_millis(500))?;
  let readiness = readiness_of(&events, 9);
  assert!(readiness.is_readable() || readiness.is_hangup(), "{events:?}");
  Ok(())
}

/// A full send buffer is not writable until the peer drains it.
pub fn writable_after_drain<S: Selector>(selector: S) -> Result<()> {
  let (a, b) = unix_stream_pair();
  a.set_blocking(false)?;
  let filled = fill_send_buffer(&a);
  selector.add(a.raw_fd().unwrap(), 10, Interest::WRITABLE)?;
  assert!(readiness_of(&wait(&selector, Duration::from_millis(10))?, 10).is_empty());

  let mut buf = vec![0u8; filled];
  let mut drained = 0;
  while drained < filled {
    drained += b.read(&mut buf[drained..])?;
  }
  let events = wait(&selector, Duration::from_millis(500))?;
  assert!(readiness_of(&events, 10).is_writable(), "{events:?}");
  Ok(())
}

/// A regular file is ready both ways on every wait until deleted.
pub fn regular_file_always_ready<S: Selector>(selector: S) -> Result<()> {
  let path = temp_path("selector-file");
  let file = Descriptor::open(&path, &OpenOptions::new().read(true).write(true).create(true))?;
  std::fs::remove_file(&path).ok();
  let fd = file.raw_fd().unwrap();

  selector.add(fd, 12, Interest::READABLE | Interest::WRITABLE)?;
  assert!(selector.add(fd, 12, Interest::READABLE).is_err());
  let started = Instant::now();
  let mut events = Vec::new();
  selector.wait(&mut events, None)?;
  assert!(started.elapsed() < Duration::from_secs(1));
  let readiness = readiness_of(&events, 12);
  assert!(readiness.is_readable() && readiness.is_writable(), "{events:?}");

  selector.modify(fd, 13, Interest::READABLE)?;
  let events = wait(&selector, Duration::ZERO)?;
  assert!(readiness_of(&events, 13).is_readable(), "{events:?}");
  assert!(readiness_of(&events, 12).is_empty(), "{events:?}");

  selector.delete(fd)?;
  let events = wait(&selector, Duration::ZERO)?;
  assert!(events.is_empty(), "{events:?}");
  Ok(())
}

/// Error-only interest watches neither direction.
pub fn error_only_interest<S: Selector>(selector: S) -> Result<()> {
  let (a, b) = unix_stream_pair();
  let fd = a.raw_fd().unwrap();
  selector.add(fd, 14, Interest::ERROR)?;
  b.write(b"unread")?;

  let events = wait(&selector, Duration::from_millis(20))?;
  let readiness = readiness_of(&events, 14);
  assert!(!readiness.is_readable() && !readiness.is_writable(), "{events:?}");

  selector.modify(fd, 14, Interest::ERROR | Interest::WRITABLE)?;
  let events = wait(&selector, Duration::from_millis(500))?;
  assert!(readiness_of(&events, 14).is_writable(), "{events:?}");
  Ok(())
}

/// A zero timeout returns promptly.
pub fn zero_timeout_is_prompt<S: Selector>(selector: S) -> Result<()> {
  let (a, _b) = unix_stream_pair();
  selector.add(a.raw_fd().unwrap(), 11, Interest::READABLE)?;

  let started = Instant::now();
  let events = wait(&selector, Duration::ZERO)?;
  assert!(events.is_empty());
  assert!(started.elapsed() < Duration::from_millis(100));
  Ok(())
}

/// notify() wakes a wait blocked on another thread.
pub fn notify_wakes_wait<S: Selector + 'static>(selector: S) -> Result<()> {
  let selector = Arc::new(selector);
  let notifier = Arc::clone(&selector);
  let handle = thread::spawn(move || {
    thread::sleep(Duration::from_millis(50));
    notifier.notify()
  });

  let mut events = Vec::new();
  let started = Instant::now();
  selector.wait(&mut events, None)?;
  assert!(events.iter().any(|(key, _)| *key == NOTIFY_KEY), "{events:?}");
  assert!(started.elapsed() < Duration::from_secs(5));
  handle.join().expect("notifier thread panicked")?;

  // The notification was consumed.
  assert!(wait(&*selector, Duration::from_millis(10))?.is_empty());
  Ok(())
}

macro_rules! generate_tests {
  ($backend:ident, $selector:expr) => {
    generate_tests!(@each $backend, $selector;
      add_read_no_data,
      read_becomes_ready,
      write_immediately_ready,
      level_triggered,
      modify_interest,
      both_interests,
      delete_stops_reporting,
      strict_registration,
      hangup_reported,
      writable_after_drain,
      zero_timeout_is_prompt,
      regular_file_always_ready,
      error_only_interest,
      notify_wakes_wait,
    );
  };
  (@each $backend:ident, $selector:expr; $($test:ident),* $(,)?) => {
    $(
      pastey::paste! {
        #[test]
        fn [<$backend _ $test>]() {
          crate::test_utils::init_test_logging();
          let selector = $selector;
          $test(selector).expect(concat!(stringify!($backend), " ", stringify!($test), " failed"));
        }
      }
    )*
  };
}

#[cfg(epoll)]
generate_tests!(epoll, super::epoll::EpollSelector::new(64).unwrap());
#[cfg(kqueue)]
generate_tests!(kqueue, super::kqueue::KqueueSelector::new(64).unwrap());
generate_tests!(poll, super::poll::PollSelector::new().unwrap());
generate_tests!(select, super::select::SelectSelector::new().unwrap());
