//! A `std::sync::Mutex` that ignores poisoning.
//!
//! Handle state is only ever mutated by short, panic-free critical sections, so
//! a poisoned lock still guards consistent data.

use std::sync as std_sync;

pub(crate) struct Mutex<T: ?Sized> {
  inner: std_sync::Mutex<T>,
}

impl<T> Mutex<T> {
  #[inline]
  pub(crate) const fn new(value: T) -> Self {
    Self { inner: std_sync::Mutex::new(value) }
  }
}

impl<T: ?Sized> Mutex<T> {
  #[inline]
  pub(crate) fn lock(&self) -> std_sync::MutexGuard<'_, T> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl<T: ?Sized + std::fmt::Debug> std::fmt::Debug for Mutex<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Debug::fmt(&*self.lock(), f)
  }
}

impl<T: Default> Default for Mutex<T> {
  fn default() -> Self {
    Self::new(T::default())
  }
}
