//! Segregated free-list index.
//!
//! The directory lives at offset 0 of the heap: one `u32` head per bucket.
//! Every free block threads itself into its bucket through two `u32` links
//! stored in its own payload, `pred` first and `succ` right after it.
//! Links and heads are offsets from the heap base, and 0 means "none",
//! since offset 0 is the directory and never a block.
//!
//! ```text
//!   bucket:   0   1   2   3   4   5   6   7   8    9     10    ..   14     15
//!   sizes:   16  24  32  40  48  56  64  72  80  ..128  ..256  .. ..4096  4097..
//! ```

use core::ops::RangeInclusive;

use crate::block::{Block, MIN_BLOCK_SIZE, Region, WSIZE};

pub const BUCKET_COUNT: usize = 16;
/// Bytes taken by the bucket directory at the start of the heap.
pub const DIRECTORY_SIZE: usize = BUCKET_COUNT * WSIZE;

/// Largest size with a bucket of its own.
const EXACT_LIMIT: usize = 80;
/// Largest size kept out of the catch-all bucket.
const RANGE_LIMIT: usize = 4096;

fn ilog2(value: usize) -> usize {
  (usize::BITS - 1 - value.leading_zeros()) as usize
}

/// The bucket a free block of `size` bytes belongs to.
pub fn bucket_for(size: usize) -> usize {
  debug_assert!(size >= MIN_BLOCK_SIZE && size % 8 == 0, "not a block size: {size}");

  if size <= EXACT_LIMIT {
    size / 8 - 2
  } else if size <= RANGE_LIMIT {
    ilog2(size - 1) + 3
  } else {
    BUCKET_COUNT - 1
  }
}

/// The block sizes a bucket holds. The catch-all bucket ends at `usize::MAX`.
pub fn bucket_range(bucket: usize) -> RangeInclusive<usize> {
  assert!(bucket < BUCKET_COUNT, "no bucket {bucket}");

  let exact = EXACT_LIMIT / 8 - 2;
  if bucket <= exact {
    let size = (bucket + 2) * 8;
    size..=size
  } else if bucket < BUCKET_COUNT - 1 {
    let high = 1usize << (bucket - 2);
    let low = (high / 2 + 1).max(EXACT_LIMIT + 1);
    low..=high
  } else {
    RANGE_LIMIT + 1..=usize::MAX
  }
}

fn head_slot(bucket: usize) -> usize {
  bucket * WSIZE
}

fn link(raw: u32) -> Option<Block> {
  (raw != 0).then(|| Block::at(raw))
}

fn unlink(block: Option<Block>) -> u32 {
  block.map_or(0, Block::relative)
}

pub(crate) fn head(
  region: &Region,
  bucket: usize,
) -> Option<Block> {
  link(region.read_word(head_slot(bucket)))
}

pub(crate) fn pred(
  region: &Region,
  block: Block,
) -> Option<Block> {
  link(region.read_word(block.offset()))
}

pub(crate) fn succ(
  region: &Region,
  block: Block,
) -> Option<Block> {
  link(region.read_word(block.offset() + WSIZE))
}

fn set_head(
  region: &mut Region,
  bucket: usize,
  block: Option<Block>,
) {
  region.write_word(head_slot(bucket), unlink(block));
}

fn set_pred(
  region: &mut Region,
  block: Block,
  pred: Option<Block>,
) {
  region.write_word(block.offset(), unlink(pred));
}

fn set_succ(
  region: &mut Region,
  block: Block,
  succ: Option<Block>,
) {
  region.write_word(block.offset() + WSIZE, unlink(succ));
}

/// Zeroes every bucket head.
pub(crate) fn clear(region: &mut Region) {
  for bucket in 0..BUCKET_COUNT {
    set_head(region, bucket, None);
  }
}

/// Pushes a free block onto the head of its bucket.
pub(crate) fn insert(
  region: &mut Region,
  block: Block,
) {
  let bucket = bucket_for(region.header(block).size);
  let first = head(region, bucket);

  set_pred(region, block, None);
  set_succ(region, block, first);
  if let Some(first) = first {
    set_pred(region, first, Some(block));
  }
  set_head(region, bucket, Some(block));
}

/// Unlinks a block from its bucket. The block must currently be listed,
/// and its header must still carry the size it was inserted with.
pub(crate) fn remove(
  region: &mut Region,
  block: Block,
) {
  let pred = pred(region, block);
  let succ = succ(region, block);

  match pred {
    Some(pred) => set_succ(region, pred, succ),
    None => set_head(region, bucket_for(region.header(block).size), succ),
  }
  if let Some(succ) = succ {
    set_pred(region, succ, pred);
  }

  set_pred(region, block, None);
  set_succ(region, block, None);
}

/// Walks one bucket from its head.
pub(crate) struct Members<'a> {
  region: &'a Region,
  next: Option<Block>,
}

impl Iterator for Members<'_> {
  type Item = Block;

  fn next(&mut self) -> Option<Block> {
    let block = self.next?;
    self.next = succ(self.region, block);
    Some(block)
  }
}

pub(crate) fn members(
  region: &Region,
  bucket: usize,
) -> Members<'_> {
  Members { region, next: head(region, bucket) }
}
