use std::ptr;

use segalloc::{AllocError, Arena, BufferSource, HEAP_PREFIX, bucket_for};

fn arena() -> Arena<BufferSource> {
  Arena::new(BufferSource::default())
}

#[test]
fn distinct_aligned_allocations() {
  let mut arena = arena();
  let sizes = [16, 512, 4096];

  let ptrs: Vec<_> = sizes
    .iter()
    .map(|&size| arena.allocate(size).unwrap().as_ptr())
    .collect();

  for (ptr, size) in ptrs.iter().zip(sizes) {
    assert_eq!(*ptr as usize % 8, 0);
    assert!(arena.usable_size(*ptr).unwrap() >= size);
  }

  let mut spans: Vec<_> = ptrs
    .iter()
    .zip(sizes)
    .map(|(&ptr, size)| (ptr as usize, ptr as usize + size))
    .collect();
  spans.sort();
  for pair in spans.windows(2) {
    assert!(pair[0].1 <= pair[1].0, "{:?} overlaps {:?}", pair[0], pair[1]);
  }

  unsafe {
    for (ptr, size) in ptrs.iter().zip(sizes) {
      ptr.write_bytes(0xEE, size);
    }
  }
  assert!(arena.check().is_empty());
}

#[test]
fn freed_block_is_reused() {
  let mut arena = arena();
  let a = arena.allocate(32).unwrap();
  let _b = arena.allocate(32).unwrap();

  unsafe { arena.release(a.as_ptr()) };
  let c = arena.allocate(32).unwrap();

  assert_eq!(c, a);
  assert!(arena.check().is_empty());
}

#[test]
fn adjacent_frees_merge() {
  let mut arena = arena();
  let a = arena.allocate(64).unwrap().as_ptr();
  let b = arena.allocate(64).unwrap().as_ptr();
  let _fence = arena.allocate(64).unwrap();

  let a_offset = arena.offset_of(a).unwrap();
  assert_eq!(arena.offset_of(b).unwrap(), a_offset + 72);

  unsafe {
    arena.release(a);
    arena.release(b);
  }

  assert!(arena.check().is_empty());

  let merged = arena.walk().find(|block| block.offset == a_offset).unwrap();
  assert!(!merged.allocated);
  assert_eq!(merged.size, 144);
  assert!(arena.free_list(bucket_for(144)).any(|offset| offset == a_offset));
  assert_eq!(arena.walk().filter(|block| !block.allocated).count(), 2);
}

#[test]
fn reallocate_preserves_content() {
  let mut arena = arena();
  let original: Vec<u8> = (0..100).map(|i| (i * 7) as u8).collect();

  unsafe {
    let ptr = arena.allocate(100).unwrap().as_ptr();
    ptr::copy_nonoverlapping(original.as_ptr(), ptr, 100);

    let shrunk = arena.reallocate(ptr, 10).unwrap().unwrap().as_ptr();
    assert_eq!(std::slice::from_raw_parts(shrunk, 10), &original[..10]);

    let ptr = arena.allocate(100).unwrap().as_ptr();
    ptr::copy_nonoverlapping(original.as_ptr(), ptr, 100);

    let grown = arena.reallocate(ptr, 1000).unwrap().unwrap().as_ptr();
    assert_eq!(std::slice::from_raw_parts(grown, 100), &original[..]);
    assert!(arena.usable_size(grown).unwrap() >= 1000);

    grown.add(100).write_bytes(0, 900);
  }

  assert!(arena.check().is_empty());
}

#[test]
fn degenerate_requests() {
  let mut arena = arena();

  assert_eq!(arena.allocate(0), Err(AllocError::ZeroSize));
  assert_eq!(arena.stats().allocated_blocks, 0);

  unsafe { arena.release(ptr::null_mut()) };

  let mut twin = self::arena();
  let from_realloc = unsafe { arena.reallocate(ptr::null_mut(), 50) }.unwrap().unwrap();
  let from_alloc = twin.allocate(50).unwrap();

  assert_eq!(arena.offset_of(from_realloc.as_ptr()), twin.offset_of(from_alloc.as_ptr()));
  assert_eq!(arena.offset_of(from_realloc.as_ptr()), Some(HEAP_PREFIX));
  assert_eq!(arena.stats(), twin.stats());
}

#[test]
fn oversized_request_is_rejected() {
  let mut arena = arena();

  assert_eq!(arena.allocate(u32::MAX as usize + 1), Err(AllocError::Overflow));
  assert_eq!(arena.allocate(usize::MAX), Err(AllocError::Overflow));
}

#[test]
fn exhaustion_is_recoverable() {
  let mut arena = Arena::new(BufferSource::new(64 * 1024));
  let mut ptrs = Vec::new();

  let err = loop {
    match arena.allocate(1000) {
      Ok(ptr) => ptrs.push(ptr),
      Err(err) => break err,
    }
  };
  assert_eq!(err, AllocError::OutOfMemory);
  assert!(!ptrs.is_empty());
  assert!(arena.check().is_empty());

  unsafe { arena.release(ptrs.pop().unwrap().as_ptr()) };
  assert!(arena.allocate(1000).is_ok());
}

#[test]
fn stats_track_every_byte() {
  let mut arena = arena();
  let ptrs: Vec<_> = (1..50).map(|i| arena.allocate(i * 13).unwrap()).collect();

  for ptr in ptrs.iter().step_by(3) {
    unsafe { arena.release(ptr.as_ptr()) };
  }

  let stats = arena.stats();
  assert_eq!(stats.allocated_bytes + stats.free_bytes + HEAP_PREFIX, arena.heap_size());
  assert_eq!(stats.allocated_blocks, 49 - 17);
  assert!(arena.check().is_empty());
}
