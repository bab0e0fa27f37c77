//! Heap walking, statistics and the consistency checker.
//!
//! Nothing here runs on the allocation or release paths. The checker is
//! read-only: it reports what it finds and leaves the heap as it is.

use core::fmt;
use core::ptr::NonNull;
use std::collections::HashMap;

use log::{debug, warn};

use crate::{
  align::ALIGNMENT,
  arena::{Arena, HEAP_PREFIX, Heap, PROLOGUE},
  block::{Block, DSIZE, MIN_BLOCK_SIZE, Region, Tag, WSIZE},
  free_list::{self, BUCKET_COUNT},
  source::HeapSource,
};

/// One block seen while walking the heap from the prologue to the epilogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
  /// Payload offset from the heap base.
  pub offset: usize,
  /// Block size, header included.
  pub size: usize,
  pub allocated: bool,
  pub prev_allocated: bool,
}

/// Block counts and byte totals. Block bytes plus [`HEAP_PREFIX`] add up to
/// the heap size once the heap exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub heap_size: usize,
  pub allocated_blocks: usize,
  pub allocated_bytes: usize,
  pub free_blocks: usize,
  pub free_bytes: usize,
}

/// An invariant the checker found broken. Offsets are payload offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
  Prologue,
  Epilogue { offset: usize },
  /// The block chain runs past the end of the heap.
  Overrun { offset: usize },
  Misaligned { offset: usize },
  Undersized { offset: usize, size: usize },
  HeaderFooterMismatch { offset: usize },
  PrevAllocatedMismatch { offset: usize },
  AdjacentFree { offset: usize },
  BrokenLink { bucket: usize, offset: usize },
  Cycle { bucket: usize },
  ListedAllocated { offset: usize },
  WrongBucket { offset: usize, size: usize, bucket: usize },
  Unlisted { offset: usize },
  ListedTwice { offset: usize },
  /// A list member that the block walk never reached.
  UnknownListed { offset: usize },
  TopMismatch { walked: Option<usize>, tracked: Option<usize> },
}

impl fmt::Display for Violation {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    match self {
      Self::Prologue => write!(f, "prologue block is damaged"),
      Self::Epilogue { offset } => write!(f, "epilogue at {offset} is damaged"),
      Self::Overrun { offset } => write!(f, "block at {offset} runs past the heap end"),
      Self::Misaligned { offset } => write!(f, "block at {offset} is misaligned"),
      Self::Undersized { offset, size } => write!(f, "block at {offset} is only {size} bytes"),
      Self::HeaderFooterMismatch { offset } => write!(f, "free block at {offset} has header != footer"),
      Self::PrevAllocatedMismatch { offset } => {
        write!(f, "block at {offset} disagrees with its predecessor's allocation state")
      }
      Self::AdjacentFree { offset } => write!(f, "free block at {offset} follows another free block"),
      Self::BrokenLink { bucket, offset } => write!(f, "bucket {bucket} has a broken link at {offset}"),
      Self::Cycle { bucket } => write!(f, "bucket {bucket} loops"),
      Self::ListedAllocated { offset } => write!(f, "allocated block at {offset} is on a free list"),
      Self::WrongBucket { offset, size, bucket } => {
        write!(f, "block at {offset} of {size} bytes is filed in bucket {bucket}")
      }
      Self::Unlisted { offset } => write!(f, "free block at {offset} is on no free list"),
      Self::ListedTwice { offset } => write!(f, "free block at {offset} is listed more than once"),
      Self::UnknownListed { offset } => write!(f, "listed block at {offset} is not in the block chain"),
      Self::TopMismatch { walked, tracked } => {
        write!(f, "heap top is {walked:?} but the tracker says {tracked:?}")
      }
    }
  }
}

/// Iterator over the blocks between the prologue and the epilogue.
pub struct Blocks<'a> {
  region: Option<&'a Region>,
  next: Block,
}

impl Iterator for Blocks<'_> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    let region = self.region?;
    let block = self.next;
    let tag = region.header(block);
    if tag.size == 0 || block.offset() + tag.size > region.len() {
      self.region = None;
      return None;
    }

    self.next = region.next(block);
    Some(info(block, tag))
  }
}

fn info(
  block: Block,
  tag: Tag,
) -> BlockInfo {
  BlockInfo {
    offset: block.offset(),
    size: tag.size,
    allocated: tag.allocated,
    prev_allocated: tag.prev_allocated,
  }
}

fn first_block() -> Block {
  Block::at(HEAP_PREFIX as u32)
}

fn is_block_offset(
  region: &Region,
  offset: usize,
) -> bool {
  offset >= HEAP_PREFIX && offset < region.len() && offset % ALIGNMENT == 0
}

impl Heap {
  fn check(&self) -> Vec<Violation> {
    let mut violations = Vec::new();
    let free = self.check_blocks(&mut violations);
    self.check_lists(&free, &mut violations);
    violations
  }

  /// Walks the block chain and returns the free blocks it passed.
  fn check_blocks(
    &self,
    violations: &mut Vec<Violation>,
  ) -> Vec<Block> {
    let region = &self.region;
    let prologue = Tag::new(DSIZE, true, true);
    if region.header(PROLOGUE) != prologue || region.read_word(PROLOGUE.offset()) != prologue.pack() {
      violations.push(Violation::Prologue);
    }

    let mut free = Vec::new();
    let mut prev_allocated = true;
    let mut last = None;
    let mut block = first_block();

    loop {
      let offset = block.offset();
      if offset > region.len() {
        violations.push(Violation::Overrun { offset });
        break;
      }

      let tag = region.header(block);
      if tag.prev_allocated != prev_allocated {
        violations.push(Violation::PrevAllocatedMismatch { offset });
      }

      if tag.size == 0 {
        if offset != region.len() || !tag.allocated {
          violations.push(Violation::Epilogue { offset });
        }
        break;
      }
      if offset + tag.size > region.len() {
        violations.push(Violation::Overrun { offset });
        break;
      }
      if offset % ALIGNMENT != 0 || tag.size % ALIGNMENT != 0 {
        violations.push(Violation::Misaligned { offset });
        break;
      }
      if tag.size < MIN_BLOCK_SIZE {
        violations.push(Violation::Undersized { offset, size: tag.size });
      }

      if !tag.allocated {
        if region.footer(block) != tag {
          violations.push(Violation::HeaderFooterMismatch { offset });
        }
        if !prev_allocated {
          violations.push(Violation::AdjacentFree { offset });
        }
        free.push(block);
      }

      prev_allocated = tag.allocated;
      last = Some(block);
      block = region.next(block);
    }

    if last != self.top {
      violations.push(Violation::TopMismatch {
        walked: last.map(Block::offset),
        tracked: self.top.map(Block::offset),
      });
    }

    free
  }

  fn check_lists(
    &self,
    free: &[Block],
    violations: &mut Vec<Violation>,
  ) {
    let region = &self.region;
    let limit = region.len() / MIN_BLOCK_SIZE + 1;
    let mut listed: HashMap<Block, usize> = HashMap::new();

    for bucket in 0..BUCKET_COUNT {
      let mut prev = None;
      let mut cursor = free_list::head(region, bucket);
      let mut steps = 0;

      while let Some(block) = cursor {
        let offset = block.offset();
        steps += 1;
        if steps > limit {
          violations.push(Violation::Cycle { bucket });
          break;
        }
        if !is_block_offset(region, offset) {
          violations.push(Violation::BrokenLink { bucket, offset });
          break;
        }
        if free_list::pred(region, block) != prev {
          violations.push(Violation::BrokenLink { bucket, offset });
        }

        let tag = region.header(block);
        let filed_right = tag.size >= MIN_BLOCK_SIZE
          && tag.size % ALIGNMENT == 0
          && free_list::bucket_for(tag.size) == bucket;
        if tag.allocated {
          violations.push(Violation::ListedAllocated { offset });
        } else if !filed_right {
          violations.push(Violation::WrongBucket { offset, size: tag.size, bucket });
        }

        *listed.entry(block).or_default() += 1;
        prev = Some(block);
        cursor = free_list::succ(region, block);
      }
    }

    for &block in free {
      match listed.remove(&block) {
        None => violations.push(Violation::Unlisted { offset: block.offset() }),
        Some(1) => {}
        Some(_) => violations.push(Violation::ListedTwice { offset: block.offset() }),
      }
    }

    let mut strays: Vec<_> = listed
      .into_keys()
      .filter(|&block| !region.header(block).allocated)
      .map(Block::offset)
      .collect();
    strays.sort_unstable();
    violations.extend(strays.into_iter().map(|offset| Violation::UnknownListed { offset }));
  }
}

impl<S: HeapSource> Arena<S> {
  /// Checks every structural invariant of the heap and returns the broken
  /// ones. An empty result means the heap is consistent.
  pub fn check(&self) -> Vec<Violation> {
    let Some(heap) = &self.heap else {
      return Vec::new();
    };

    let violations = heap.check();
    for violation in &violations {
      warn!("heap check: {violation}");
    }
    violations
  }

  /// Walks every block between the sentinels, in address order.
  pub fn walk(&self) -> Blocks<'_> {
    Blocks {
      region: self.heap.as_ref().map(|heap| &heap.region),
      next: first_block(),
    }
  }

  /// Payload offsets of the members of one bucket, head first.
  pub fn free_list(
    &self,
    bucket: usize,
  ) -> impl Iterator<Item = usize> + '_ {
    assert!(bucket < BUCKET_COUNT, "no bucket {bucket}");

    self
      .heap
      .iter()
      .flat_map(move |heap| free_list::members(&heap.region, bucket))
      .map(Block::offset)
  }

  pub fn stats(&self) -> HeapStats {
    let mut stats = HeapStats { heap_size: self.heap_size(), ..HeapStats::default() };

    for block in self.walk() {
      if block.allocated {
        stats.allocated_blocks += 1;
        stats.allocated_bytes += block.size;
      } else {
        stats.free_blocks += 1;
        stats.free_bytes += block.size;
      }
    }

    stats
  }

  /// Offset of the heap-top block, the last one before the epilogue.
  pub fn heap_top(&self) -> Option<usize> {
    self.heap.as_ref()?.top.map(Block::offset)
  }

  /// Offset of an address inside the heap, relative to the heap base.
  pub fn offset_of(
    &self,
    ptr: *const u8,
  ) -> Option<usize> {
    let offset = self.heap.as_ref()?.region.relative(ptr)?;
    Some(offset as usize)
  }

  /// The address at `offset` from the heap base.
  pub fn address_of(
    &self,
    offset: usize,
  ) -> Option<NonNull<u8>> {
    let region = &self.heap.as_ref()?.region;
    let offset = u32::try_from(offset).ok().filter(|&offset| (offset as usize) < region.len())?;
    Some(region.absolute(offset))
  }

  /// Payload bytes of a live allocation.
  pub fn usable_size(
    &self,
    ptr: *const u8,
  ) -> Option<usize> {
    let heap = self.heap.as_ref()?;
    let block = heap.block_of(ptr)?;
    let tag = heap.region.header(block);

    tag.allocated.then(|| tag.size - WSIZE)
  }

  /// Logs the directory and every block at debug level.
  pub fn dump(&self) {
    let Some(heap) = &self.heap else {
      debug!("heap not initialized");
      return;
    };

    debug!("----- buckets -----");
    for bucket in 0..BUCKET_COUNT {
      let range = free_list::bucket_range(bucket);
      let head = free_list::head(&heap.region, bucket).map(Block::offset);
      debug!("{bucket:2} [{}, {}] -> {head:?}", range.start(), range.end());
    }

    debug!("----- blocks -----");
    for block in self.walk() {
      if block.allocated {
        debug!("{:8}: {:6} bytes, allocated, prev allocated: {}", block.offset, block.size, block.prev_allocated);
      } else {
        let at = Block::at(block.offset as u32);
        debug!(
          "{:8}: {:6} bytes, free, prev allocated: {}, pred: {:?}, succ: {:?}",
          block.offset,
          block.size,
          block.prev_allocated,
          free_list::pred(&heap.region, at).map(Block::offset),
          free_list::succ(&heap.region, at).map(Block::offset),
        );
      }
    }
    debug!("heap top: {:?}, heap size: {}", heap.top.map(Block::offset), heap.region.len());
  }
}
