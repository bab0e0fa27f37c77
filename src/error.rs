use core::fmt;

/// Why an allocation request could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
  /// A request for zero bytes.
  ZeroSize,
  /// The heap source refused to grow the region.
  OutOfMemory,
  /// The requested size does not fit in a block header.
  Overflow,
  /// The pointer does not name a live block of this arena.
  InvalidPointer,
}

impl fmt::Display for AllocError {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    match self {
      Self::ZeroSize => f.write_str("zero-sized allocation request"),
      Self::OutOfMemory => f.write_str("heap source cannot grow the region"),
      Self::Overflow => f.write_str("requested size exceeds the largest encodable block"),
      Self::InvalidPointer => f.write_str("pointer is not a live block of this arena"),
    }
  }
}

impl std::error::Error for AllocError {}
