#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Once;

use nixio::{Descriptor, Family, SockType};

static INIT_LOGGING: Once = Once::new();

pub fn init_test_logging() {
  INIT_LOGGING.call_once(|| {
    let _ = tracing_subscriber::fmt()
      .with_max_level(tracing::Level::DEBUG)
      .with_test_writer()
      .with_ansi(false)
      .try_init();
  });
}

/// A unique path in the system temp directory; the file is removed on drop.
pub struct TempPath(PathBuf);

impl TempPath {
  pub fn new(name: &str) -> Self {
    Self(std::env::temp_dir().join(format!(
      "nixio-test-{}-{}-{name}",
      std::process::id(),
      fastrand::u64(..)
    )))
  }

  pub fn path(&self) -> &std::path::Path {
    &self.0
  }
}

impl Drop for TempPath {
  fn drop(&mut self) {
    let _ = std::fs::remove_file(&self.0);
  }
}

pub fn stream_pair() -> (Descriptor, Descriptor) {
  Descriptor::socket_pair(Family::Unix, SockType::Stream).expect("socket pair")
}

pub fn random_payload(len: usize) -> Vec<u8> {
  let mut rng = fastrand::Rng::with_seed(len as u64);
  (0..len).map(|_| rng.u8(..)).collect()
}

/// Reads until end of stream.
pub fn read_to_end(handle: &Descriptor) -> Vec<u8> {
  let mut out = Vec::new();
  let mut buf = [0u8; 8192];
  loop {
    let n = handle.read(&mut buf).expect("read");
    if n == 0 {
      return out;
    }
    out.extend_from_slice(&buf[..n]);
  }
}
