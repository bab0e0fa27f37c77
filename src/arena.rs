use core::ptr::NonNull;

use log::{debug, trace, warn};

use crate::{
  align,
  block::{Block, DSIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, Region, Tag, WSIZE},
  config::ArenaConfig,
  error::AllocError,
  free_list::{self, DIRECTORY_SIZE},
  source::HeapSource,
};

/// Payload offset of the prologue block, right after the directory and one
/// word of padding.
pub(crate) const PROLOGUE: Block = Block::at((DIRECTORY_SIZE + DSIZE) as u32);
/// Bytes in front of the first real block: directory, padding, prologue and
/// epilogue header.
pub const HEAP_PREFIX: usize = DIRECTORY_SIZE + 2 * DSIZE;
/// Offsets are 32 bits wide, which caps the region at 4 GiB.
const MAX_HEAP_SIZE: usize = u32::MAX as usize;

/// Block size needed to serve a request of `size` payload bytes.
pub(crate) fn block_size_for(size: usize) -> Result<usize, AllocError> {
  if size > MAX_BLOCK_SIZE - WSIZE - DSIZE {
    return Err(AllocError::Overflow);
  }

  Ok(align!(size + WSIZE).max(MIN_BLOCK_SIZE))
}

/// The laid-out heap: the region plus the heap-top tracker.
#[derive(Debug)]
pub(crate) struct Heap {
  pub(crate) region: Region,
  /// The last block before the epilogue, once the heap has grown past its
  /// prefix.
  pub(crate) top: Option<Block>,
}

/// A segregated-fit allocator over one growable region.
///
/// The arena owns its [`HeapSource`]; payload pointers stay valid until
/// they are released or the arena is dropped, whichever comes first.
pub struct Arena<S: HeapSource> {
  pub(crate) source: S,
  pub(crate) config: ArenaConfig,
  pub(crate) heap: Option<Heap>,
}

impl<S: HeapSource> Arena<S> {
  pub fn new(source: S) -> Self {
    Self::with_config(source, ArenaConfig::default())
  }

  pub fn with_config(
    source: S,
    config: ArenaConfig,
  ) -> Self {
    Self { source, config, heap: None }
  }

  pub fn config(&self) -> &ArenaConfig {
    &self.config
  }

  pub fn source(&self) -> &S {
    &self.source
  }

  /// Lays out the directory and the sentinels. Called implicitly by the
  /// first allocation; calling it again is a no-op.
  pub fn init(&mut self) -> Result<(), AllocError> {
    self.parts().map(|_| ())
  }

  /// Bytes in the managed region, prefix included.
  pub fn heap_size(&self) -> usize {
    self.heap.as_ref().map_or(0, |heap| heap.region.len())
  }

  /// Allocates at least `size` bytes, aligned to 8.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    let (heap, block) = self.allocate_block(size)?;
    Ok(heap.region.payload(block))
  }

  /// Finds or makes room for `size` payload bytes and marks the block
  /// allocated.
  pub(crate) fn allocate_block(
    &mut self,
    size: usize,
  ) -> Result<(&mut Heap, Block), AllocError> {
    if size == 0 {
      return Err(AllocError::ZeroSize);
    }

    let total_size = block_size_for(size)?;
    let ArenaConfig { chunk_size, best_fit_scan } = self.config;
    let (heap, source) = self.parts()?;

    let block = match heap.find_fit(total_size, best_fit_scan) {
      Some(block) => block,
      None => heap.grow_for(source, total_size, chunk_size)?,
    };
    heap.place(block, total_size);

    trace!("allocate({size}) -> block {} of {total_size} bytes", block.offset());
    Ok((heap, block))
  }

  /// The laid-out heap and the source behind it, laying the heap out on
  /// first use.
  pub(crate) fn parts(&mut self) -> Result<(&mut Heap, &mut S), AllocError> {
    let heap = match &mut self.heap {
      Some(heap) => heap,
      slot => slot.insert(Heap::create(&mut self.source)?),
    };

    Ok((heap, &mut self.source))
  }
}

impl Heap {
  fn create<S: HeapSource>(source: &mut S) -> Result<Self, AllocError> {
    let mut base = source.extend(HEAP_PREFIX).ok_or(AllocError::OutOfMemory)?;
    let padding = align!(base.as_ptr() as usize) - base.as_ptr() as usize;
    if padding != 0 {
      warn!("heap source returned unaligned base {:p}, skipping {padding} bytes", base);

      let end = base.as_ptr().wrapping_add(HEAP_PREFIX);
      let tail = source.extend(padding).ok_or(AllocError::OutOfMemory)?;
      if tail.as_ptr() != end {
        warn!("heap source grew non-contiguously: expected {:p}, got {:p}", end, tail);
        return Err(AllocError::OutOfMemory);
      }
      base = unsafe { base.add(padding) };
    }

    let mut region = Region::new(base, HEAP_PREFIX);
    free_list::clear(&mut region);

    let prologue = Tag::new(DSIZE, true, true).pack();
    region.write_word(DIRECTORY_SIZE, 0);
    region.write_word(region.header_of(PROLOGUE), prologue);
    region.write_word(PROLOGUE.offset(), prologue);
    region.mark(Block::at(HEAP_PREFIX as u32), 0, true, true);

    debug!("heap initialized at {:p}", base);
    Ok(Self { region, top: None })
  }

  /// The epilogue is the zero-sized block whose payload offset is the end
  /// of the region.
  pub(crate) fn epilogue(&self) -> Block {
    Block::at(self.region.len() as u32)
  }

  /// Bounded best fit within the request's own bucket, then first fit over
  /// the rest of that bucket and every larger one.
  pub(crate) fn find_fit(
    &self,
    total_size: usize,
    best_fit_scan: usize,
  ) -> Option<Block> {
    let region = &self.region;
    let bucket = free_list::bucket_for(total_size);

    let mut best: Option<(Block, usize)> = None;
    for block in free_list::members(region, bucket).take(best_fit_scan) {
      let size = region.header(block).size;
      if size >= total_size && best.is_none_or(|(_, best_size)| size < best_size) {
        best = Some((block, size));
      }
    }
    if let Some((block, size)) = best {
      trace!("best fit: block {} of {size} bytes", block.offset());
      return Some(block);
    }

    let rest = free_list::members(region, bucket).skip(best_fit_scan);
    let larger = (bucket + 1..free_list::BUCKET_COUNT)
      .flat_map(move |bucket| free_list::members(region, bucket));

    rest
      .chain(larger)
      .find(|&block| region.header(block).size >= total_size)
  }

  /// Turns a free block into an allocated one of `total_size` bytes,
  /// splitting off the remainder when it can stand as a block of its own.
  pub(crate) fn place(
    &mut self,
    block: Block,
    total_size: usize,
  ) {
    free_list::remove(&mut self.region, block);
    let tag = self.region.header(block);
    debug_assert!(!tag.allocated && tag.size >= total_size);

    let remainder = tag.size - total_size;
    if remainder >= MIN_BLOCK_SIZE {
      self.region.mark(block, total_size, tag.prev_allocated, true);
      let tail = self.region.next(block);
      self.region.mark(tail, remainder, true, false);
      free_list::insert(&mut self.region, tail);

      if self.top == Some(block) {
        self.top = Some(tail);
      }
      trace!("split block {}: {total_size} + {remainder}", block.offset());
    } else {
      self.region.mark(block, tag.size, tag.prev_allocated, true);
      let next = self.region.next(block);
      self.region.set_prev_allocated(next, true);
    }
  }

  /// Grows the heap so that a block of `total_size` bytes becomes
  /// available and returns that block, already coalesced.
  fn grow_for<S: HeapSource>(
    &mut self,
    source: &mut S,
    total_size: usize,
    chunk_size: usize,
  ) -> Result<Block, AllocError> {
    let increment = match self.top {
      Some(top) if !self.region.header(top).allocated => {
        let top_size = self.region.header(top).size;
        total_size.saturating_sub(top_size).max(MIN_BLOCK_SIZE)
      }
      _ => total_size.max(chunk_size),
    };

    self.extend(source, increment)
  }

  /// Appends a free block of `increment` bytes where the epilogue was.
  pub(crate) fn extend<S: HeapSource>(
    &mut self,
    source: &mut S,
    increment: usize,
  ) -> Result<Block, AllocError> {
    debug_assert!(increment % DSIZE == 0 && increment >= MIN_BLOCK_SIZE);

    if self.region.len().saturating_add(increment) > MAX_HEAP_SIZE {
      debug!("refusing to grow heap past {MAX_HEAP_SIZE} bytes");
      return Err(AllocError::OutOfMemory);
    }

    let old_top = source.extend(increment).ok_or(AllocError::OutOfMemory)?;
    if old_top.as_ptr() != self.region.end() {
      warn!("heap source grew non-contiguously: expected {:p}, got {:p}", self.region.end(), old_top);
      return Err(AllocError::OutOfMemory);
    }

    let block = self.epilogue();
    let prev_allocated = self.region.header(block).prev_allocated;

    self.region.grow(increment);
    self.region.mark(block, increment, prev_allocated, false);
    let epilogue = self.epilogue();
    self.region.mark(epilogue, 0, false, true);

    free_list::insert(&mut self.region, block);
    self.top = Some(block);

    debug!("heap grew by {increment} bytes to {}", self.region.len());
    Ok(self.coalesce(block))
  }
}
