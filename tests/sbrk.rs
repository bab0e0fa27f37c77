#![cfg(unix)]

use segalloc::{AllocError, Arena, SbrkSource};

// The platform allocator may move the break between our calls; the arena
// then refuses to grow instead of corrupting memory, so growth failures
// are tolerated here.
#[test]
fn sbrk_backed_arena() {
  let mut arena = Arena::new(SbrkSource::new());
  let mut ptrs = Vec::new();

  for size in [8, 100, 1000, 24, 4096] {
    match arena.allocate(size) {
      Ok(ptr) => {
        unsafe { ptr.as_ptr().write_bytes(0x5A, size) };
        ptrs.push(ptr.as_ptr());
      }
      Err(err) => assert_eq!(err, AllocError::OutOfMemory),
    }
  }

  for ptr in ptrs {
    assert_eq!(ptr as usize % 8, 0);
    unsafe {
      assert_eq!(ptr.read(), 0x5A);
      arena.release(ptr);
    }
  }

  assert!(arena.check().is_empty());
}
