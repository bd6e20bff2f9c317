//! Block descriptors and their byte-exact layout.
//!
//! Every allocation lives in a *block*: a descriptor, a left fence, the
//! user payload and a right fence, packed back to back with no padding:
//!
//! ```text
//!   ┌────────────────┬───────────┬──────────────────────┬───────────┐
//!   │   descriptor   │ 'f' 'f' 'f' │   mem_size bytes   │ 'F' 'F' 'F' │
//!   └────────────────┴───────────┴──────────────────────┴───────────┘
//!   ▲                            ▲
//!   │                            └── user_mem_ptr (returned to the user)
//!   └── descriptor address (registry node)
//! ```
//!
//! Payload sizes are arbitrary, so descriptors land on arbitrary byte
//! addresses. The struct is therefore `repr(C, packed)` and every access
//! goes through a raw pointer; taking a reference to a field would be
//! unsound and is rejected by the compiler.
//!
//! Each descriptor carries two corruption detectors:
//!
//! * `user_mem_ptr` duplicates what the layout already implies. A wild
//!   write that shifts it no longer matches the derived value.
//! * `checksum` is the byte sum of the descriptor image with the checksum
//!   field itself read as zero, refreshed after every mutation.

use std::{mem, ptr};

/// Canary bytes on each side of the user payload.
pub const FENCE_LENGTH: usize = 3;
/// Byte written into the fence left of the payload.
pub const LEFT_FENCE_BYTE: u8 = b'f';
/// Byte written into the fence right of the payload.
pub const RIGHT_FENCE_BYTE: u8 = b'F';

/// Size of the descriptor image itself.
pub const CONTROL_STRUCT_SIZE: usize = mem::size_of::<BlockHeader>();

/// Bytes a block occupies beyond its payload.
pub const BLOCK_OVERHEAD: usize = CONTROL_STRUCT_SIZE + 2 * FENCE_LENGTH;

/// Total footprint of a block carrying `mem_size` payload bytes.
pub const fn block_footprint(mem_size: usize) -> usize {
  BLOCK_OVERHEAD + mem_size
}

/// A registry node embedded in the heap region, directly before the left
/// fence of its block.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BlockHeader {
  pub prev: *mut BlockHeader,
  pub next: *mut BlockHeader,
  pub mem_size: usize,
  pub is_free: bool,
  pub user_mem_ptr: *mut u8,
  pub checksum: u64,
}

const CHECKSUM_OFFSET: usize = mem::offset_of!(BlockHeader, checksum);

impl BlockHeader {
  /// First user byte of the block at `header`, derived from the layout.
  ///
  /// # Safety
  ///
  /// `header` must point into a region with at least
  /// `CONTROL_STRUCT_SIZE + FENCE_LENGTH` addressable bytes behind it.
  pub unsafe fn user_ptr(header: *mut BlockHeader) -> *mut u8 {
    unsafe { (header as *mut u8).add(CONTROL_STRUCT_SIZE + FENCE_LENGTH) }
  }

  /// One past the last byte of the block (the end of its right fence).
  ///
  /// # Safety
  ///
  /// `header` must point at an initialized descriptor.
  pub unsafe fn block_end(header: *mut BlockHeader) -> *mut u8 {
    unsafe { (*header).user_mem_ptr.add((*header).mem_size + FENCE_LENGTH) }
  }

  /// Writes a fresh descriptor at `header` and weaves it between `prev`
  /// and `next`, refreshing the neighbours' checksums for the changed
  /// links. The block comes out occupied with both fences written.
  ///
  /// # Safety
  ///
  /// The whole block footprint starting at `header` must be addressable
  /// and owned by the heap; `prev` and `next` must be valid descriptors
  /// or null.
  pub unsafe fn initialize(
    header: *mut BlockHeader,
    mem_size: usize,
    prev: *mut BlockHeader,
    next: *mut BlockHeader,
  ) {
    unsafe {
      header.write_unaligned(BlockHeader {
        prev,
        next,
        mem_size,
        is_free: false,
        user_mem_ptr: Self::user_ptr(header),
        checksum: 0,
      });
      if !prev.is_null() {
        (*prev).next = header;
        Self::refresh_checksum(prev);
      }
      if !next.is_null() {
        (*next).prev = header;
        Self::refresh_checksum(next);
      }
      Self::write_fences(header);
      Self::refresh_checksum(header);
    }
  }

  /// Writes both fences at the positions the descriptor implies.
  ///
  /// # Safety
  ///
  /// `header` must point at an initialized descriptor whose block
  /// footprint is addressable.
  pub unsafe fn write_fences(header: *mut BlockHeader) {
    unsafe {
      let left = (header as *mut u8).add(CONTROL_STRUCT_SIZE);
      ptr::write_bytes(left, LEFT_FENCE_BYTE, FENCE_LENGTH);
      Self::write_right_fence(header);
    }
  }

  /// Rewrites only the right fence, at the current payload end. Used by
  /// every path that moves a block's payload boundary.
  ///
  /// # Safety
  ///
  /// As for [`BlockHeader::write_fences`].
  pub unsafe fn write_right_fence(header: *mut BlockHeader) {
    unsafe {
      let right = (*header).user_mem_ptr.add((*header).mem_size);
      ptr::write_bytes(right, RIGHT_FENCE_BYTE, FENCE_LENGTH);
    }
  }

  /// Byte sum of the descriptor image with the checksum field taken as
  /// zero.
  ///
  /// # Safety
  ///
  /// `header` must point at `CONTROL_STRUCT_SIZE` addressable bytes.
  pub unsafe fn compute_checksum(header: *const BlockHeader) -> u64 {
    let bytes = header as *const u8;
    let mut sum: u64 = 0;
    let mut i = 0;
    while i < CONTROL_STRUCT_SIZE {
      if i == CHECKSUM_OFFSET {
        i += mem::size_of::<u64>();
        continue;
      }
      sum += unsafe { *bytes.add(i) } as u64;
      i += 1;
    }
    sum
  }

  /// Stores the recomputed checksum. Must follow every descriptor
  /// mutation.
  ///
  /// # Safety
  ///
  /// As for [`BlockHeader::compute_checksum`].
  pub unsafe fn refresh_checksum(header: *mut BlockHeader) {
    unsafe {
      let sum = Self::compute_checksum(header);
      (*header).checksum = sum;
    }
  }

  /// Counts the fence bytes of this block that still hold their expected
  /// value, left and right together. An intact block contributes
  /// `2 * FENCE_LENGTH`.
  ///
  /// # Safety
  ///
  /// `header` must point at an initialized descriptor whose block
  /// footprint is addressable.
  pub unsafe fn correct_fence_bytes(header: *const BlockHeader) -> u64 {
    let mut counter: u64 = 0;
    unsafe {
      let left = (header as *const u8).add(CONTROL_STRUCT_SIZE);
      let right = (*header).user_mem_ptr.add((*header).mem_size) as *const u8;
      for i in 0..FENCE_LENGTH {
        if *left.add(i) == LEFT_FENCE_BYTE {
          counter += 1;
        }
        if *right.add(i) == RIGHT_FENCE_BYTE {
          counter += 1;
        }
      }
    }
    counter
  }
}
