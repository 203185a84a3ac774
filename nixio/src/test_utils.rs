//! Helpers shared by the unit tests.

use std::sync::Once;

use crate::{Descriptor, Family, SockType};

static INIT_LOGGING: Once = Once::new();

/// Routes `tracing` output through the test harness. The first call wins.
pub fn init_test_logging() {
  INIT_LOGGING.call_once(|| {
    let _ = tracing_subscriber::fmt()
      .with_max_level(tracing::Level::TRACE)
      .with_test_writer()
      .with_target(true)
      .with_ansi(false)
      .try_init();
  });
}

/// A connected local stream socket pair.
pub fn unix_stream_pair() -> (Descriptor, Descriptor) {
  Descriptor::socket_pair(Family::Unix, SockType::Stream).unwrap()
}

/// Fills the send buffer of a non-blocking socket until it would block.
pub fn fill_send_buffer(sock: &Descriptor) -> usize {
  let chunk = [0xAAu8; 4096];
  let mut total = 0;
  loop {
    match sock.write(&chunk) {
      Ok(n) => total += n,
      Err(err) if err.is_would_block() => return total,
      Err(err) => panic!("unexpected error while filling the send buffer: {err}"),
    }
  }
}

/// A unique path in the system temp directory; nothing is created.
pub fn temp_path(name: &str) -> std::path::PathBuf {
  std::env::temp_dir().join(format!(
    "nixio-{}-{}-{name}",
    std::process::id(),
    fastrand::u64(..)
  ))
}
