use crate::{align::ALIGNMENT, block::MIN_BLOCK_SIZE};

/// Smallest number of bytes requested from the heap source when no free
/// block fits and the heap-top block is allocated.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// How many members of the matching bucket the best-fit pass inspects.
pub const DEFAULT_BEST_FIT_SCAN: usize = 40;

/// Tuning knobs of an [`Arena`](crate::Arena).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
  pub(crate) chunk_size: usize,
  pub(crate) best_fit_scan: usize,
}

impl Default for ArenaConfig {
  fn default() -> Self {
    Self {
      chunk_size: DEFAULT_CHUNK_SIZE,
      best_fit_scan: DEFAULT_BEST_FIT_SCAN,
    }
  }
}

impl ArenaConfig {
  /// Sets the growth chunk. Rounded up to the alignment and never below the
  /// minimum block size.
  pub fn with_chunk_size(
    mut self,
    chunk_size: usize,
  ) -> Self {
    let aligned = chunk_size.checked_next_multiple_of(ALIGNMENT).unwrap_or(usize::MAX & !(ALIGNMENT - 1));
    self.chunk_size = aligned.max(MIN_BLOCK_SIZE);
    self
  }

  /// Sets the best-fit scan cap. A cap of zero turns the policy into pure
  /// first fit.
  pub fn with_best_fit_scan(
    mut self,
    best_fit_scan: usize,
  ) -> Self {
    self.best_fit_scan = best_fit_scan;
    self
  }

  pub fn chunk_size(&self) -> usize {
    self.chunk_size
  }

  pub fn best_fit_scan(&self) -> usize {
    self.best_fit_scan
  }
}
