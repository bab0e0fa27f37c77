//! Heap growth primitives.
//!
//! An [`Arena`](crate::Arena) never asks the host for memory in any other
//! way than through [`HeapSource::extend`]. The region it manages is the
//! contiguous run of bytes handed out by successive `extend` calls.

use core::ptr::NonNull;
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};

use crate::align::ALIGNMENT;

/// Default capacity of a [`BufferSource`] (20 MiB).
pub const DEFAULT_BUFFER_CAPACITY: usize = 20 * (1 << 20);

/// Something that can grow a contiguous memory region.
pub trait HeapSource {
  /// Grows the region by `increment` bytes and returns the previous top of
  /// the region, or `None` if the host cannot provide the bytes.
  ///
  /// The first call establishes the region's base; an unaligned base costs
  /// the arena a few bytes of padding. Every later call must return the address right after the
  /// bytes handed out so far.
  fn extend(
    &mut self,
    increment: usize,
  ) -> Option<NonNull<u8>>;
}

/// Grows the process data segment with `sbrk(2)`.
///
/// The program break is process-wide state: anything else moving it (the
/// platform allocator included) breaks contiguity, which the arena reports
/// as an out-of-memory failure.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct SbrkSource {
  started: bool,
}

#[cfg(unix)]
impl SbrkSource {
  pub fn new() -> Self {
    Self { started: false }
  }

  /// Moves the break forward so the region starts on an aligned address.
  unsafe fn align_break(&mut self) -> Option<()> {
    let current = unsafe { libc::sbrk(0) };
    if current as isize == -1 {
      return None;
    }

    let padding = crate::align!(current as usize) - current as usize;
    if padding != 0 && unsafe { libc::sbrk(padding as libc::intptr_t) } as isize == -1 {
      return None;
    }

    self.started = true;
    Some(())
  }
}

#[cfg(unix)]
impl HeapSource for SbrkSource {
  fn extend(
    &mut self,
    increment: usize,
  ) -> Option<NonNull<u8>> {
    let increment = libc::intptr_t::try_from(increment).ok()?;

    unsafe {
      if !self.started {
        self.align_break()?;
      }

      let address = libc::sbrk(increment);
      if address as isize == -1 {
        return None;
      }

      NonNull::new(address as *mut u8)
    }
  }
}

/// Grows inside a fixed-capacity buffer owned by the source.
///
/// Mirrors a bounded simulated heap: growth past the capacity fails, which
/// makes exhaustion paths testable without touching the process break. The
/// buffer is allocated once and only ever reached through its base pointer,
/// so addresses handed out stay valid until the source is dropped.
#[derive(Debug)]
pub struct BufferSource {
  base: NonNull<u8>,
  capacity: usize,
  used: usize,
}

impl Default for BufferSource {
  fn default() -> Self {
    Self::new(DEFAULT_BUFFER_CAPACITY)
  }
}

impl BufferSource {
  /// Creates a source able to hand out `capacity` bytes (rounded down to
  /// the alignment).
  pub fn new(capacity: usize) -> Self {
    let capacity = capacity & !(ALIGNMENT - 1);
    if capacity == 0 {
      return Self { base: NonNull::dangling(), capacity, used: 0 };
    }

    let Ok(layout) = Layout::from_size_align(capacity, ALIGNMENT) else {
      panic!("buffer capacity {capacity} is too large");
    };
    let Some(base) = NonNull::new(unsafe { alloc_zeroed(layout) }) else {
      handle_alloc_error(layout);
    };

    Self { base, capacity, used: 0 }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Bytes handed out so far.
  pub fn used(&self) -> usize {
    self.used
  }
}

impl HeapSource for BufferSource {
  fn extend(
    &mut self,
    increment: usize,
  ) -> Option<NonNull<u8>> {
    let new_used = self.used.checked_add(increment)?;
    if new_used > self.capacity {
      return None;
    }

    let top = unsafe { self.base.add(self.used) };
    self.used = new_used;

    Some(top)
  }
}

impl Drop for BufferSource {
  fn drop(&mut self) {
    if self.capacity == 0 {
      return;
    }

    unsafe { dealloc(self.base.as_ptr(), Layout::from_size_align_unchecked(self.capacity, ALIGNMENT)) };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_buffer_source_is_contiguous() {
    let mut source = BufferSource::new(128);

    let first = source.extend(64).unwrap();
    let second = source.extend(32).unwrap();

    assert_eq!(first.as_ptr() as usize % ALIGNMENT, 0);
    assert_eq!(second.as_ptr() as usize, first.as_ptr() as usize + 64);
    assert_eq!(source.used(), 96);
  }

  #[test]
  fn test_buffer_source_refuses_past_capacity() {
    let mut source = BufferSource::new(64);

    assert!(source.extend(48).is_some());
    assert!(source.extend(24).is_none());
    assert_eq!(source.used(), 48);
    assert!(source.extend(16).is_some());
    assert!(source.extend(usize::MAX).is_none());
  }

  #[test]
  fn test_earlier_bytes_survive_growth() {
    let mut source = BufferSource::new(256);

    let first = source.extend(64).unwrap();
    unsafe { first.as_ptr().write_bytes(0xAB, 64) };

    let second = source.extend(64).unwrap();
    unsafe {
      second.as_ptr().write_bytes(0xCD, 64);
      first.as_ptr().add(63).write(0x11);

      assert_eq!(first.as_ptr().read(), 0xAB);
      assert_eq!(first.as_ptr().add(63).read(), 0x11);
      assert_eq!(second.as_ptr().read(), 0xCD);
    }
  }

  #[test]
  fn test_empty_buffer_source() {
    let mut source = BufferSource::new(7);

    assert_eq!(source.capacity(), 0);
    assert!(source.extend(8).is_none());
  }
}
