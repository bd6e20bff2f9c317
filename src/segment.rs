//! The sbrk-style segment underneath the heap.
//!
//! The heap engine never talks to the operating system directly. It owns a
//! [`SegmentSource`], a monotonic expander with the classic `sbrk(2)`
//! contract: a positive delta grows the owned region and returns the old
//! break (the base of the newly granted bytes), a negative delta shrinks
//! it, and a refused request yields null.
//!
//! Two sources are provided:
//!
//! * [`Sbrk`] moves the real program break through `libc::sbrk`. This is
//!   the production path on POSIX systems.
//! * [`Arena`] simulates a break inside one page-aligned allocation of
//!   fixed capacity. Requests past the capacity are refused, which makes
//!   exhaustion reproducible. All tests run on arenas so they cannot
//!   disturb the program break the process allocator may be using.

use std::{alloc, ptr};

use libc::{c_void, intptr_t, sbrk};

use crate::align_to;

/// Fixed unit of segment growth and shrink, in bytes.
pub const PAGE_SIZE: usize = 0x1000;

/// A contiguous, monotonically growing memory segment.
///
/// Implementations must keep the region contiguous across calls and must
/// hand out a page-aligned base on the first grant; the heap layout
/// arithmetic is built on both guarantees.
pub trait SegmentSource {
  /// Grows the owned region by `delta` bytes (or shrinks it when `delta`
  /// is negative) and returns the previous break, i.e. the address of
  /// the new portion on growth. Returns null when the request is
  /// refused; the owned region is unchanged in that case.
  fn expand(&mut self, delta: isize) -> *mut u8;
}

/// The real program break, moved via `sbrk(2)`.
///
/// `sbrk` reports failure with `(void*)-1`; that sentinel is mapped to a
/// null return here so callers have a single refusal shape to check.
pub struct Sbrk;

impl SegmentSource for Sbrk {
  fn expand(&mut self, delta: isize) -> *mut u8 {
    let previous_break = unsafe { sbrk(delta as intptr_t) };
    if previous_break == usize::MAX as *mut c_void {
      return ptr::null_mut();
    }
    previous_break as *mut u8
  }
}

/// A simulated break inside one fixed, page-aligned allocation.
///
/// ```text
///   base                    base + brk              base + capacity
///    │                           │                         │
///    ▼                           ▼                         ▼
///    ┌───────────────────────────┬─────────────────────────┐
///    │        granted            │        available        │
///    └───────────────────────────┴─────────────────────────┘
/// ```
///
/// The backing storage never moves, so pointers into granted space stay
/// valid for the lifetime of the arena.
pub struct Arena {
  base: *mut u8,
  capacity: usize,
  brk: usize,
}

impl Arena {
  /// Creates an arena able to grant up to `capacity` bytes, rounded up
  /// to whole pages. The storage is zero-filled.
  ///
  /// # Panics
  ///
  /// Panics when `capacity` is zero.
  pub fn new(capacity: usize) -> Self {
    assert!(capacity > 0, "arena capacity must be at least one byte");
    let capacity = align_to!(capacity, PAGE_SIZE);

    // One page-aligned allocation for the whole lifetime of the arena.
    let layout = match alloc::Layout::from_size_align(capacity, PAGE_SIZE) {
      Ok(layout) => layout,
      Err(_) => panic!("arena capacity does not fit a memory layout"),
    };
    let base = unsafe { alloc::alloc_zeroed(layout) };
    if base.is_null() {
      alloc::handle_alloc_error(layout);
    }

    Self { base, capacity, brk: 0 }
  }

  /// Bytes currently granted out of the arena.
  pub fn granted(&self) -> usize {
    self.brk
  }
}

impl SegmentSource for Arena {
  fn expand(&mut self, delta: isize) -> *mut u8 {
    if delta >= 0 {
      let grow = delta as usize;
      if self.brk + grow > self.capacity {
        return ptr::null_mut();
      }
      let previous_break = unsafe { self.base.add(self.brk) };
      self.brk += grow;
      previous_break
    } else {
      let shrink = delta.unsigned_abs();
      if shrink > self.brk {
        return ptr::null_mut();
      }
      let previous_break = unsafe { self.base.add(self.brk) };
      self.brk -= shrink;
      previous_break
    }
  }
}

impl Drop for Arena {
  fn drop(&mut self) {
    // Capacity and alignment were validated in `new`.
    unsafe {
      let layout = alloc::Layout::from_size_align_unchecked(self.capacity, PAGE_SIZE);
      alloc::dealloc(self.base, layout);
    }
  }
}
