mod common;

use std::thread;

use common::{TempPath, init_test_logging, random_payload, read_to_end, stream_pair};
use nixio::{Descriptor, OpenOptions, SpliceEngine, Strategy};

const CHUNK: usize = 4096;

fn sizes() -> [usize; 6] {
  [0, 1, CHUNK - 1, CHUNK, CHUNK + 1, 10 * CHUNK]
}

fn engines() -> [SpliceEngine; 2] {
  [
    SpliceEngine::builder().chunk_size(CHUNK).build().unwrap(),
    SpliceEngine::builder().chunk_size(CHUNK).zero_copy(false).build().unwrap(),
  ]
}

/// Copies `payload` from `source` into a socket and returns what the peer saw.
fn forward(engine: &SpliceEngine, source: &Descriptor, len: usize) -> Vec<u8> {
  let (out, peer) = stream_pair();
  let reader = thread::spawn(move || read_to_end(&peer));
  assert_eq!(engine.transfer(source, &out, usize::MAX).unwrap(), len);
  out.close().unwrap();
  reader.join().unwrap()
}

#[test]
fn test_pipe_source_matches_buffered_copy() {
  init_test_logging();
  for engine in engines() {
    for len in sizes() {
      let payload = random_payload(len);
      let (r, w) = Descriptor::pipe().unwrap();
      let writer = {
        let payload = payload.clone();
        thread::spawn(move || {
          let mut sent = 0;
          while sent < payload.len() {
            sent += w.write(&payload[sent..]).unwrap();
          }
        })
      };

      let received = forward(&engine, &r, len);
      writer.join().unwrap();
      assert_eq!(received, payload, "len {len}");
    }
  }
}

#[test]
fn test_file_source_matches_buffered_copy() {
  for engine in engines() {
    for len in sizes() {
      let tmp = TempPath::new("src");
      let payload = random_payload(len);
      std::fs::write(tmp.path(), &payload).unwrap();
      let file = nixio::open(tmp.path(), &OpenOptions::from_mode("r").unwrap()).unwrap();

      assert_eq!(forward(&engine, &file, len), payload, "len {len}");
    }
  }
}

#[test]
fn test_socket_to_file() {
  for engine in engines() {
    let tmp = TempPath::new("dst");
    let payload = random_payload(3 * CHUNK + 7);
    let file = nixio::open(tmp.path(), &OpenOptions::from_mode("w").unwrap()).unwrap();

    let (a, b) = stream_pair();
    let writer = {
      let payload = payload.clone();
      thread::spawn(move || {
        let mut sent = 0;
        while sent < payload.len() {
          sent += a.write(&payload[sent..]).unwrap();
        }
      })
    };

    let mut total = 0;
    while total < payload.len() {
      let n = engine.transfer(&b, &file, payload.len() - total).unwrap();
      assert!(n > 0);
      total += n;
    }
    writer.join().unwrap();
    assert_eq!(std::fs::read(tmp.path()).unwrap(), payload);
  }
}

#[test]
fn test_flat_transfer_and_sendfile() {
  let tmp = TempPath::new("flat");
  std::fs::write(tmp.path(), b"abcdefghij").unwrap();
  let file = nixio::open(tmp.path(), &OpenOptions::from_mode("r").unwrap()).unwrap();
  let (r, w) = Descriptor::pipe().unwrap();

  assert_eq!(nixio::sendfile(&w, &file, 5, 3).unwrap(), 3);
  assert_eq!(nixio::transfer(&file, &w, 2).unwrap(), 2);
  w.close().unwrap();
  assert_eq!(read_to_end(&r), b"fghab");
}

#[test]
fn test_strategy_is_observable() {
  let (r, w) = Descriptor::pipe().unwrap();
  let (out, _peer) = stream_pair();
  w.write(b"x").unwrap();
  w.close().unwrap();

  let engine = SpliceEngine::new();
  assert_eq!(engine.last_strategy(), None);
  engine.transfer(&r, &out, 1).unwrap();
  let strategy = engine.last_strategy().unwrap();
  if cfg!(linux) {
    assert_eq!(strategy, Strategy::Splice);
  } else {
    assert_eq!(strategy, Strategy::Buffered);
  }
}
