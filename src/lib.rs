//! # segalloc - A Segregated-Fit Memory Allocator
//!
//! This crate provides a general-purpose dynamic memory allocator over a
//! single growable region: `allocate`, `release`, `reallocate` and
//! `zero_allocate`, with all bookkeeping kept inside the region it manages.
//!
//! ## Overview
//!
//! ```text
//!   Heap Layout:
//!
//!   offset 0                    64    68    72    80
//!   ┌───────────────────────────┬─────┬─────┬─────┬──────────┬─────────┬─ ─ ─┬─────┐
//!   │  bucket directory         │ pad │ pro │ pro │  block   │  block  │     │ epi │
//!   │  16 x u32 list heads      │     │ hdr │ ftr │          │         │     │ hdr │
//!   └───────────────────────────┴─────┴─────┴─────┴──────────┴─────────┴─ ─ ─┴─────┘
//!                                      └ prologue ┘                       epilogue ┘
//!                                                              grows this way ──▶
//! ```
//!
//! Every block starts with a 4-byte header holding its size and two flags:
//! whether the block is allocated and whether the block before it is.
//! Free blocks also carry a footer and two links into their free list:
//!
//! ```text
//!   Allocated:  ┌────────┬──────────────────────────────┐
//!               │ header │ payload                      │
//!               └────────┴──────────────────────────────┘
//!                        ▲
//!                        └── pointer returned to user (8-byte aligned)
//!
//!   Free:       ┌────────┬──────┬──────┬─────────┬────────┐
//!               │ header │ pred │ succ │ unused  │ footer │
//!               └────────┴──────┴──────┴─────────┴────────┘
//! ```
//!
//! Links and list heads are 4-byte offsets from the heap base, which keeps
//! the minimum block at 16 bytes and caps the heap at 4 GiB.
//!
//! ## Crate Structure
//!
//! ```text
//!   segalloc
//!   ├── align      - Alignment macros (align!, align_to!)
//!   ├── source     - Heap growth primitives (HeapSource, SbrkSource, BufferSource)
//!   ├── block      - Block layout codec (internal)
//!   ├── free_list  - Segregated free-list index
//!   ├── arena      - Arena and the allocation policy
//!   ├── coalesce   - Release, reallocate and boundary-tag coalescing
//!   ├── check      - Consistency checker, heap walk and statistics
//!   ├── config     - ArenaConfig
//!   └── error      - AllocError
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use segalloc::{Arena, BufferSource};
//!
//! let mut arena = Arena::new(BufferSource::default());
//!
//! let ptr = arena.allocate(64).unwrap();
//! unsafe {
//!     ptr.as_ptr().write_bytes(0x2A, 64);
//!     arena.release(ptr.as_ptr());
//! }
//!
//! assert!(arena.check().is_empty());
//! ```
//!
//! ## Allocation Policy
//!
//! A request is rounded to a block size and looked up in its size class.
//! The first 40 members of that class are searched for the best fit; if
//! none fits, the rest of the class and every larger class are searched
//! first-fit. When nothing fits the heap grows, by only the missing bytes
//! if the block at the top of the heap is free. Released blocks are merged
//! with free neighbours immediately.
//!
//! ## Limitations
//!
//! - **Single-threaded only**: an arena has no internal locking
//! - **No shrinking**: the heap never returns memory to its source
//! - **Best-effort misuse checks**: double releases and foreign pointers are
//!   ignored when detected, but not every invalid pointer can be detected
//!
//! ## Safety
//!
//! `release` and `reallocate` take raw pointers and are `unsafe`: the
//! pointer must come from the same arena and must not be used afterwards.

pub mod align;
mod arena;
mod block;
mod check;
mod coalesce;
mod config;
mod error;
mod free_list;
mod source;

pub use arena::{Arena, HEAP_PREFIX};
pub use block::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, Tag};
pub use check::{BlockInfo, Blocks, HeapStats, Violation};
pub use config::{ArenaConfig, DEFAULT_BEST_FIT_SCAN, DEFAULT_CHUNK_SIZE};
pub use error::AllocError;
pub use free_list::{BUCKET_COUNT, bucket_for, bucket_range};
#[cfg(unix)]
pub use source::SbrkSource;
pub use source::{BufferSource, DEFAULT_BUFFER_CAPACITY, HeapSource};
