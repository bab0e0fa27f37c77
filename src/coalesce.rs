//! Release paths and boundary-tag coalescing.
//!
//! Coalescing is eager: a block is merged with its free neighbours the
//! moment it becomes free, so two free blocks are never adjacent.
//!
//! ```text
//!   prev   block   next          result
//!   used   free    used    ->    no merge
//!   used   free    free    ->    [block + next]
//!   free   free    used    ->    [prev + block]
//!   free   free    free    ->    [prev + block + next]
//! ```

use core::ptr::NonNull;

use log::{trace, warn};

use crate::{
  align::ALIGNMENT,
  arena::{Arena, HEAP_PREFIX, Heap},
  block::{Block, MIN_BLOCK_SIZE, WSIZE},
  error::AllocError,
  free_list,
  source::HeapSource,
};

impl Heap {
  /// Resolves a payload pointer to a block that plausibly starts there.
  ///
  /// This is a best-effort guard: it rejects addresses outside the heap,
  /// misaligned addresses and headers that cannot describe a block, but it
  /// cannot tell a real payload from an address in the middle of one.
  pub(crate) fn block_of(
    &self,
    ptr: *const u8,
  ) -> Option<Block> {
    let offset = self.region.relative(ptr)? as usize;
    if offset < HEAP_PREFIX || offset % ALIGNMENT != 0 {
      return None;
    }

    let block = Block::at(offset as u32);
    let tag = self.region.header(block);
    if tag.size < MIN_BLOCK_SIZE || tag.size % ALIGNMENT != 0 || offset + tag.size > self.region.len() {
      return None;
    }

    Some(block)
  }

  /// Marks an allocated block free, files it and merges it with its free
  /// neighbours.
  pub(crate) fn free(
    &mut self,
    block: Block,
  ) -> Block {
    let tag = self.region.header(block);
    debug_assert!(tag.allocated);

    self.region.mark(block, tag.size, tag.prev_allocated, false);
    let next = self.region.next(block);
    self.region.set_prev_allocated(next, false);
    free_list::insert(&mut self.region, block);

    self.coalesce(block)
  }

  /// Merges a listed free block with its free neighbours and returns the
  /// block that now covers it.
  pub(crate) fn coalesce(
    &mut self,
    block: Block,
  ) -> Block {
    let region = &mut self.region;
    let tag = region.header(block);
    let next = region.next(block);
    let next_tag = region.header(next);
    let prev = region.prev(block);

    let (merged, prev_allocated, size) = match (prev, next_tag.allocated) {
      (None, true) => return block,
      (None, false) => {
        free_list::remove(region, block);
        free_list::remove(region, next);
        if self.top == Some(next) {
          self.top = Some(block);
        }
        (block, tag.prev_allocated, tag.size + next_tag.size)
      }
      (Some(prev), true) => {
        let prev_tag = region.header(prev);
        free_list::remove(region, prev);
        free_list::remove(region, block);
        if self.top == Some(block) {
          self.top = Some(prev);
        }
        (prev, prev_tag.prev_allocated, prev_tag.size + tag.size)
      }
      (Some(prev), false) => {
        let prev_tag = region.header(prev);
        free_list::remove(region, prev);
        free_list::remove(region, block);
        free_list::remove(region, next);
        if self.top == Some(next) {
          self.top = Some(prev);
        }
        (prev, prev_tag.prev_allocated, prev_tag.size + tag.size + next_tag.size)
      }
    };

    region.mark(merged, size, prev_allocated, false);
    free_list::insert(region, merged);

    trace!("coalesced block {} into block {} of {size} bytes", block.offset(), merged.offset());
    merged
  }
}

impl<S: HeapSource> Arena<S> {
  /// Returns a block to the heap.
  ///
  /// Null pointers, pointers outside the heap and blocks that are already
  /// free are ignored.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a payload pointer returned by this arena. The
  /// payload must not be used after this call.
  pub unsafe fn release(
    &mut self,
    ptr: *mut u8,
  ) {
    if ptr.is_null() {
      return;
    }

    let Some(heap) = self.heap.as_mut() else {
      warn!("release of {:p} before the heap exists", ptr);
      return;
    };
    let Some(block) = heap.block_of(ptr) else {
      warn!("release of {:p}, which is not a block of this heap", ptr);
      return;
    };
    if !heap.region.header(block).allocated {
      warn!("release of block {}, which is already free", block.offset());
      return;
    }

    trace!("release block {} of {} bytes", block.offset(), heap.region.header(block).size);
    heap.free(block);
  }

  /// Resizes an allocation by moving it into a fresh block.
  ///
  /// A null `ptr` allocates; a zero `size` releases `ptr` and returns
  /// `Ok(None)`. Otherwise the first `min(old, new)` payload bytes are
  /// copied and the old block is released. On failure the old block is
  /// left untouched.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live payload pointer returned by this arena.
  /// On success the old pointer must no longer be used.
  pub unsafe fn reallocate(
    &mut self,
    ptr: *mut u8,
    size: usize,
  ) -> Result<Option<NonNull<u8>>, AllocError> {
    if ptr.is_null() {
      return self.allocate(size).map(Some);
    }
    if size == 0 {
      unsafe { self.release(ptr) };
      return Ok(None);
    }

    let heap = self.heap.as_ref().ok_or(AllocError::InvalidPointer)?;
    let old = heap
      .block_of(ptr)
      .filter(|&block| heap.region.header(block).allocated)
      .ok_or(AllocError::InvalidPointer)?;
    let old_payload = heap.region.header(old).size - WSIZE;

    let (heap, new) = self.allocate_block(size)?;
    let new_payload = heap.region.header(new).size - WSIZE;

    heap.region.copy_payload(old, new, old_payload.min(new_payload));
    heap.free(old);

    trace!("reallocate block {} -> block {}", old.offset(), new.offset());
    Ok(Some(heap.region.payload(new)))
  }

  /// Allocates `count * size` bytes, all zero.
  pub fn zero_allocate(
    &mut self,
    count: usize,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    let bytes = count.checked_mul(size).ok_or(AllocError::Overflow)?;

    let (heap, block) = self.allocate_block(bytes)?;
    heap.region.fill(block, bytes, 0);

    Ok(heap.region.payload(block))
  }
}
