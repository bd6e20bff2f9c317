//! # fencealloc - A Fence-Guarded Heap Allocator
//!
//! This crate provides a userspace **heap allocator** built on top of a
//! sbrk-style segment: a contiguous region that only grows and shrinks
//! at its end, in whole pages. Inside that region the allocator keeps a
//! doubly-linked registry of blocks, places requests first-fit, splits
//! and coalesces free blocks, and guards every payload with canary
//! *fences* so accidental overwrites are detected instead of silently
//! corrupting neighbouring bookkeeping.
//!
//! ## Overview
//!
//! ```text
//!   Heap region (grows right, whole pages from the segment source):
//!
//!   ┌──────┬──────────────────────┬──────────────────────┬───────────┐
//!   │ root │ block                │ block                │ free tail │
//!   └──────┴──────────────────────┴──────────────────────┴───────────┘
//!
//!   One block:
//!   ┌──────────────┬─────────────┬────────────────────┬─────────────┐
//!   │  descriptor  │ 'f' 'f' 'f' │  user payload      │ 'F' 'F' 'F' │
//!   └──────────────┴─────────────┴────────────────────┴─────────────┘
//!                                ▲
//!                                └── pointer returned to the user
//! ```
//!
//! Each descriptor links to its neighbours, remembers its payload size
//! and state, stores a redundant pointer to its own payload and a
//! checksum of itself. The root record at the base of the region counts
//! pages, descriptors and expected fence bytes. [`Heap::validate`]
//! cross-checks all of it and every operation refuses to run on a heap
//! that fails the check.
//!
//! ## Crate Structure
//!
//! ```text
//!   fencealloc
//!   ├── align      - alignment macros (align_to!, is_aligned!)
//!   ├── block      - block descriptor, fences, checksums (internal)
//!   ├── heap       - the heap engine and its public surface
//!   └── segment    - sbrk-style segment sources (Sbrk, Arena)
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use fencealloc::{Arena, Heap, HeapStatus, PointerType, PAGE_SIZE};
//!
//! // An arena segment keeps the demo self-contained; `Heap::setup()`
//! // uses the real program break instead.
//! let mut heap = Heap::setup_with(Arena::new(16 * PAGE_SIZE)).unwrap();
//!
//! unsafe {
//!     let p = heap.malloc(100);
//!     assert!(!p.is_null());
//!     assert_eq!(heap.validate(), HeapStatus::Ok);
//!     assert_eq!(heap.pointer_type(p), PointerType::Valid);
//!
//!     p.write(42);
//!     let p = heap.realloc(p, 200);
//!     assert_eq!(p.read(), 42);
//!
//!     heap.free(p);
//! }
//! heap.clean();
//! ```
//!
//! ## Limitations
//!
//! - **Single-threaded only**: no synchronization primitives; wrap the
//!   handle in a lock if you need sharing.
//! - **Monotonic region**: interior pages are never returned to the
//!   source; everything is released at once by [`Heap::clean`].
//! - **Accident detection, not security**: fences and checksums catch
//!   stray writes and double frees, not adversarial corruption.
//! - **Natural and page alignment only**: the `_aligned` family pins
//!   payloads to page boundaries; arbitrary alignments are not offered.
//!
//! ## Safety
//!
//! This crate is inherently unsafe as it deals in raw memory. The
//! allocation family is `unsafe fn`: callers vouch that pointers handed
//! to [`Heap::free`] and [`Heap::realloc`] came from the same heap, and
//! that no allocation outlives its handle.

pub mod align;
mod block;
mod heap;
mod segment;

pub use heap::{Heap, HeapStatus, PointerType, SetupError};
pub use segment::{Arena, PAGE_SIZE, Sbrk, SegmentSource};
