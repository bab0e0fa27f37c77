//! Block layout codec.
//!
//! All byte-level access to the heap goes through [`Region`]. Everything
//! above this module works with [`Block`] handles, which are payload offsets
//! from the region base.
//!
//! ```text
//!   allocated:  [ header ][ payload ..................... ]
//!   free:       [ header ][ pred ][ succ ][ ...... ][ footer ]
//!                 4 bytes   4        4                4
//! ```
//!
//! A header packs `size | prev_allocated << 1 | allocated`. Sizes are
//! multiples of 8, so the low three bits are always available for flags.

use core::ptr::{self, NonNull};

use crate::align::ALIGNMENT;

/// Size of a header, footer or free-list link.
pub const WSIZE: usize = 4;
/// Size of a prologue block.
pub const DSIZE: usize = 8;
/// Header, two links and a footer.
pub const MIN_BLOCK_SIZE: usize = 4 * WSIZE;
/// Largest size a header can encode.
pub const MAX_BLOCK_SIZE: usize = (u32::MAX & SIZE_MASK) as usize;

const ALLOCATED: u32 = 0x1;
const PREV_ALLOCATED: u32 = 0x2;
const SIZE_MASK: u32 = !0x7;

/// A block, named by the offset of its payload from the region base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(u32);

impl Block {
  pub(crate) const fn at(offset: u32) -> Self {
    Self(offset)
  }

  pub fn offset(self) -> usize {
    self.0 as usize
  }

  pub(crate) fn relative(self) -> u32 {
    self.0
  }
}

/// The decoded contents of a header or footer word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
  pub size: usize,
  pub prev_allocated: bool,
  pub allocated: bool,
}

impl Tag {
  pub fn new(
    size: usize,
    prev_allocated: bool,
    allocated: bool,
  ) -> Self {
    Self { size, prev_allocated, allocated }
  }

  pub fn pack(self) -> u32 {
    debug_assert!(self.size % ALIGNMENT == 0, "unaligned block size {}", self.size);
    debug_assert!(self.size <= MAX_BLOCK_SIZE, "block size {} overflows a header", self.size);

    self.size as u32 | (self.prev_allocated as u32) << 1 | self.allocated as u32
  }

  pub fn unpack(word: u32) -> Self {
    Self {
      size: (word & SIZE_MASK) as usize,
      prev_allocated: word & PREV_ALLOCATED != 0,
      allocated: word & ALLOCATED != 0,
    }
  }
}

/// The managed bytes: a base address and the number of bytes grown so far.
#[derive(Debug)]
pub(crate) struct Region {
  base: NonNull<u8>,
  len: usize,
}

impl Region {
  pub fn new(
    base: NonNull<u8>,
    len: usize,
  ) -> Self {
    Self { base, len }
  }

  pub fn len(&self) -> usize {
    self.len
  }

  /// The address right after the last managed byte.
  pub fn end(&self) -> *mut u8 {
    self.base.as_ptr().wrapping_add(self.len)
  }

  pub fn grow(
    &mut self,
    increment: usize,
  ) {
    self.len += increment;
  }

  pub fn read_word(
    &self,
    offset: usize,
  ) -> u32 {
    assert!(offset + WSIZE <= self.len, "word read at {offset} past heap end {}", self.len);
    debug_assert!(offset % WSIZE == 0);

    unsafe { self.base.as_ptr().add(offset).cast::<u32>().read() }
  }

  pub fn write_word(
    &mut self,
    offset: usize,
    value: u32,
  ) {
    assert!(offset + WSIZE <= self.len, "word write at {offset} past heap end {}", self.len);
    debug_assert!(offset % WSIZE == 0);

    unsafe { self.base.as_ptr().add(offset).cast::<u32>().write(value) }
  }

  /// Converts an address inside the region into its offset from the base.
  pub fn relative(
    &self,
    address: *const u8,
  ) -> Option<u32> {
    let offset = (address as usize).checked_sub(self.base.as_ptr() as usize)?;
    if offset >= self.len {
      return None;
    }

    u32::try_from(offset).ok()
  }

  /// Converts an offset back into an address inside the region.
  pub fn absolute(
    &self,
    offset: u32,
  ) -> NonNull<u8> {
    assert!((offset as usize) <= self.len, "offset {offset} past heap end {}", self.len);

    unsafe { self.base.add(offset as usize) }
  }

  pub fn payload(
    &self,
    block: Block,
  ) -> NonNull<u8> {
    self.absolute(block.relative())
  }

  pub fn header_of(
    &self,
    block: Block,
  ) -> usize {
    block.offset() - WSIZE
  }

  /// Only meaningful for free blocks; allocated blocks carry no footer.
  pub fn footer_of(
    &self,
    block: Block,
  ) -> usize {
    block.offset() + self.header(block).size - DSIZE
  }

  pub fn header(
    &self,
    block: Block,
  ) -> Tag {
    Tag::unpack(self.read_word(self.header_of(block)))
  }

  pub fn footer(
    &self,
    block: Block,
  ) -> Tag {
    Tag::unpack(self.read_word(self.footer_of(block)))
  }

  pub fn next(
    &self,
    block: Block,
  ) -> Block {
    Block::at(block.relative() + self.header(block).size as u32)
  }

  /// The preceding block, available only when it is free: an allocated
  /// predecessor has no footer to read its size from.
  pub fn prev(
    &self,
    block: Block,
  ) -> Option<Block> {
    if self.header(block).prev_allocated {
      return None;
    }

    let footer = Tag::unpack(self.read_word(block.offset() - DSIZE));
    Some(Block::at(block.relative() - footer.size as u32))
  }

  /// Writes the header, and the footer as well when the block is free.
  pub fn mark(
    &mut self,
    block: Block,
    size: usize,
    prev_allocated: bool,
    allocated: bool,
  ) {
    let word = Tag::new(size, prev_allocated, allocated).pack();

    self.write_word(self.header_of(block), word);
    if !allocated {
      self.write_word(block.offset() + size - DSIZE, word);
    }
  }

  pub fn set_prev_allocated(
    &mut self,
    block: Block,
    prev_allocated: bool,
  ) {
    let tag = self.header(block);
    self.mark(block, tag.size, prev_allocated, tag.allocated);
  }

  pub fn fill(
    &mut self,
    block: Block,
    len: usize,
    byte: u8,
  ) {
    assert!(block.offset() + len <= self.len);

    unsafe { ptr::write_bytes(self.base.as_ptr().add(block.offset()), byte, len) }
  }

  /// Copies `len` payload bytes between two distinct blocks.
  pub fn copy_payload(
    &mut self,
    from: Block,
    to: Block,
    len: usize,
  ) {
    assert!(from.offset() + len <= self.len && to.offset() + len <= self.len);
    debug_assert!(from != to);

    unsafe {
      let base = self.base.as_ptr();
      ptr::copy_nonoverlapping(base.add(from.offset()), base.add(to.offset()), len);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::source::{BufferSource, HeapSource};

  fn region(
    source: &mut BufferSource,
    len: usize,
  ) -> Region {
    let base = source.extend(len).unwrap();
    Region::new(base, len)
  }

  #[test]
  fn test_tag_round_trip() {
    for size in (0..=4096).step_by(ALIGNMENT).chain([MAX_BLOCK_SIZE]) {
      for prev_allocated in [false, true] {
        for allocated in [false, true] {
          let tag = Tag::new(size, prev_allocated, allocated);
          assert_eq!(Tag::unpack(tag.pack()), tag);
        }
      }
    }
  }

  #[test]
  fn test_mark_free_writes_footer() {
    let mut source = BufferSource::new(256);
    let mut region = region(&mut source, 256);
    let block = Block::at(16);

    region.mark(block, 48, true, false);

    assert_eq!(region.header(block), Tag::new(48, true, false));
    assert_eq!(region.footer(block), region.header(block));
    assert_eq!(region.footer_of(block), 16 + 48 - DSIZE);
    assert_eq!(region.next(block), Block::at(64));
  }

  #[test]
  fn test_mark_allocated_leaves_footer_alone() {
    let mut source = BufferSource::new(256);
    let mut region = region(&mut source, 256);
    let block = Block::at(16);

    region.mark(block, 48, false, false);
    region.mark(block, 48, false, true);

    assert_eq!(region.header(block), Tag::new(48, false, true));
    assert_eq!(region.footer(block), Tag::new(48, false, false));
  }

  #[test]
  fn test_prev_needs_free_predecessor() {
    let mut source = BufferSource::new(256);
    let mut region = region(&mut source, 256);
    let first = Block::at(16);
    let second = Block::at(40);

    region.mark(first, 24, true, false);
    region.mark(second, 32, false, true);
    assert_eq!(region.prev(second), Some(first));

    region.mark(first, 24, true, true);
    region.set_prev_allocated(second, true);
    assert_eq!(region.prev(second), None);
  }

  #[test]
  fn test_relative_absolute_round_trip() {
    let mut source = BufferSource::new(1024);
    let region = region(&mut source, 1024);
    let base = region.absolute(0).as_ptr();

    for offset in 0..1024usize {
      let address = base.wrapping_add(offset);
      let relative = region.relative(address).unwrap();
      assert_eq!(region.absolute(relative).as_ptr(), address);
    }

    assert_eq!(region.relative(region.end()), None);
    assert_eq!(region.relative(base.wrapping_sub(1)), None);
  }

  #[test]
  #[should_panic]
  fn test_read_past_end_panics() {
    let mut source = BufferSource::new(64);
    let region = region(&mut source, 64);

    region.read_word(62);
  }
}
