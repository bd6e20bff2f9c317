//! The heap engine: lifecycle, placement, integrity checks and pointer
//! classification over a fenced block registry.
//!
//! ## Region layout
//!
//! The heap owns a contiguous run of pages obtained from a
//! [`SegmentSource`]. The first bytes of the first page hold the root
//! record; every block descriptor after it is a node of a doubly-linked
//! registry embedded in the same region:
//!
//! ```text
//!   page 0                                page 1 ...
//!   ┌──────┬─────────────────────┬────────────────────────┬──────────┐
//!   │ root │ block │ block │ ... │ block                  │  slack   │
//!   └──────┴─────────────────────┴────────────────────────┴──────────┘
//!          ▲
//!          └── head (first descriptor), absent while nothing is allocated
//! ```
//!
//! ## Integrity protocol
//!
//! Two running checks guard the region against accidental overwrites:
//!
//! * every descriptor stores a byte-sum checksum of itself, refreshed on
//!   each mutation; a wild write into descriptor bytes breaks it;
//! * the root counts the fence bytes that should exist
//!   (`2 * FENCE_LENGTH` per live block); [`Heap::validate`] re-counts
//!   the bytes that actually hold their canary value, so a payload
//!   overrun that spills into a fence is caught.
//!
//! Every public operation consults [`Heap::validate`] first and refuses
//! to touch an inconsistent heap.

use std::{error, fmt, mem, ptr};

use log::{debug, trace};
use static_assertions::const_assert;

use crate::block::{
  self, BLOCK_OVERHEAD, BlockHeader, CONTROL_STRUCT_SIZE, FENCE_LENGTH,
};
use crate::segment::{PAGE_SIZE, Sbrk, SegmentSource};
use crate::{align_to, is_aligned};

/// Root record at the base of the owned region.
///
/// `fence_checksum` is maintained arithmetically (`+2 * FENCE_LENGTH`
/// per descriptor created, the same down on destruction) and verified
/// against a full fence census during validation.
#[repr(C)]
struct HeapRoot {
  fence_checksum: u64,
  pages: usize,
  headers_allocated: usize,
  head: *mut BlockHeader,
}

const HEAP_ROOT_SIZE: usize = mem::size_of::<HeapRoot>();

// The smallest heap (one page) must hold the root plus one minimal
// block, and an aligned head descriptor parked at the tail of page zero
// must start past the root.
const_assert!(HEAP_ROOT_SIZE + BLOCK_OVERHEAD + 1 <= PAGE_SIZE);
const_assert!(PAGE_SIZE - CONTROL_STRUCT_SIZE - FENCE_LENGTH >= HEAP_ROOT_SIZE);

/// Outcome of a whole-heap consistency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum HeapStatus {
  /// All bookkeeping is consistent.
  Ok = 0,
  /// A fence byte no longer holds its canary value.
  Corrupted = 1,
  /// No heap exists (never set up, or cleaned).
  Uninitialised = 2,
  /// Structural bookkeeping (links, counts, checksums) is inconsistent.
  ControlStructBlur = 3,
}

/// Classification of an arbitrary address against the heap structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerType {
  /// The null pointer.
  Null,
  /// The heap failed its fence check; no classification is possible.
  HeapCorrupted,
  /// Inside the root record or a block descriptor.
  ControlBlock,
  /// Inside a fence of an occupied block.
  InsideFences,
  /// Strictly inside the payload of an occupied block (not its first
  /// byte).
  InsideDataBlock,
  /// Not backed by any live allocation.
  Unallocated,
  /// Exactly the first payload byte of an occupied block; the only
  /// value `free` and `realloc` accept.
  Valid,
}

/// The segment source refused to grow the owned region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupError;

impl fmt::Display for SetupError {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(f, "segment source refused to grow the owned region")
  }
}

impl error::Error for SetupError {}

/// A fence-guarded first-fit heap over a sbrk-style segment.
///
/// The handle owns the region for its whole lifetime: it is created by
/// [`Heap::setup`] (or [`Heap::setup_with`] for a custom segment) and
/// the region is zeroed and returned to the segment source by
/// [`Heap::clean`], which also runs on drop. After `clean` the handle
/// reports [`HeapStatus::Uninitialised`] and refuses every operation.
///
/// # Thread Safety
///
/// Not thread-safe. The handle holds raw pointers into the region and
/// must be confined to one thread or serialised externally.
pub struct Heap<S: SegmentSource> {
  root: *mut HeapRoot,
  segment: S,
}

impl Heap<Sbrk> {
  /// Sets up a heap over the real program break.
  ///
  /// # Errors
  ///
  /// Fails when `sbrk` refuses to provide the initial page.
  pub fn setup() -> Result<Self, SetupError> {
    Self::setup_with(Sbrk)
  }
}

impl<S: SegmentSource> Heap<S> {
  /// Sets up a heap over the given segment source, requesting one page
  /// and writing the zero-initialised root at its base.
  ///
  /// # Errors
  ///
  /// Fails when the source refuses the initial page; nothing is owned
  /// in that case.
  pub fn setup_with(mut segment: S) -> Result<Self, SetupError> {
    let base = segment.expand(PAGE_SIZE as isize);
    if base.is_null() {
      return Err(SetupError);
    }
    let root = base as *mut HeapRoot;
    unsafe {
      root.write(HeapRoot {
        fence_checksum: 0,
        pages: 1,
        headers_allocated: 0,
        head: ptr::null_mut(),
      });
    }
    debug!("setup: heap root at {:p}", root);
    Ok(Self { root, segment })
  }

  /// Runs the full consistency check.
  ///
  /// Checks run in a fixed order and the first failure wins:
  ///
  /// 1. a root exists (else [`HeapStatus::Uninitialised`]);
  /// 2. every descriptor lies inside the owned region, the forward walk
  ///    terminates, and the backward walk over `prev` links visits the
  ///    same nodes (broken `prev` links surface here);
  /// 3. the stored descriptor count matches the walk;
  /// 4. each descriptor's stored user pointer matches the layout-derived
  ///    value and its block ends inside the region;
  /// 5. each descriptor's stored checksum matches recomputation;
  /// 6. the fence census matches the root's running count (else
  ///    [`HeapStatus::Corrupted`]).
  ///
  /// Failures of 2 through 5 report [`HeapStatus::ControlStructBlur`].
  pub fn validate(&self) -> HeapStatus {
    if self.root.is_null() {
      return HeapStatus::Uninitialised;
    }
    unsafe {
      let root = &*self.root;
      let start = self.root as usize;
      let end = start + root.pages * PAGE_SIZE;
      let in_range =
        |header: usize| header >= start + HEAP_ROOT_SIZE && header + CONTROL_STRUCT_SIZE <= end;
      // More descriptors than this cannot fit in the region; a longer
      // walk means the links cycle.
      let walk_cap = (end - start) / CONTROL_STRUCT_SIZE + 1;

      if !root.head.is_null() && !(*root.head).prev.is_null() {
        return HeapStatus::ControlStructBlur;
      }

      let mut forward = 0usize;
      let mut tail: *mut BlockHeader = ptr::null_mut();
      let mut it = root.head;
      while !it.is_null() {
        if !in_range(it as usize) {
          return HeapStatus::ControlStructBlur;
        }
        forward += 1;
        if forward > walk_cap {
          return HeapStatus::ControlStructBlur;
        }
        tail = it;
        it = (*it).next;
      }

      let mut backward = 0usize;
      let mut it = tail;
      while !it.is_null() {
        if !in_range(it as usize) {
          return HeapStatus::ControlStructBlur;
        }
        backward += 1;
        if backward > walk_cap {
          return HeapStatus::ControlStructBlur;
        }
        let prev = (*it).prev;
        if prev.is_null() && it != root.head {
          return HeapStatus::ControlStructBlur;
        }
        it = prev;
      }
      if backward != forward {
        return HeapStatus::ControlStructBlur;
      }

      if root.headers_allocated != forward {
        return HeapStatus::ControlStructBlur;
      }

      let mut it = root.head;
      while !it.is_null() {
        let stored_user = (*it).user_mem_ptr;
        if stored_user != BlockHeader::user_ptr(it) {
          return HeapStatus::ControlStructBlur;
        }
        let mem_size = (*it).mem_size;
        if stored_user as usize + mem_size + FENCE_LENGTH > end {
          return HeapStatus::ControlStructBlur;
        }
        let stored_sum = (*it).checksum;
        if stored_sum != BlockHeader::compute_checksum(it) {
          return HeapStatus::ControlStructBlur;
        }
        it = (*it).next;
      }

      let mut live_fence_bytes: u64 = 0;
      let mut it = root.head;
      while !it.is_null() {
        live_fence_bytes += BlockHeader::correct_fence_bytes(it);
        it = (*it).next;
      }
      if live_fence_bytes != root.fence_checksum {
        return HeapStatus::Corrupted;
      }

      HeapStatus::Ok
    }
  }

  /// Zeroes the owned region, returns every page to the segment source
  /// and drops into the [`HeapStatus::Uninitialised`] state. Refuses to
  /// act when there is nothing to clean. Runs automatically on drop.
  pub fn clean(&mut self) {
    if self.validate() == HeapStatus::Uninitialised {
      return;
    }
    unsafe {
      let owned = (*self.root).pages * PAGE_SIZE;
      ptr::write_bytes(self.root as *mut u8, 0, owned);
      self.segment.expand(-(owned as isize));
      self.root = ptr::null_mut();
    }
    debug!("clean: heap released");
  }

  /// Allocates `size` bytes and returns a pointer to the first payload
  /// byte, or null on failure.
  ///
  /// The search is first-fit over the registry:
  ///
  /// ```text
  ///   exact fit      free block, mem_size == size   -> occupy as is
  ///   split fit      free block large enough for    -> shrink the front,
  ///                  the request plus a whole       carve a new free
  ///                  second block                   block from the tail
  ///   loose fit      free block barely larger       -> occupy and shrink;
  ///                                                 surplus becomes slack
  ///   append         past the last block, growing the segment as needed
  /// ```
  ///
  /// # Returns
  ///
  /// Null when `size` is zero, when the total block footprint would
  /// overflow, when the heap fails validation, or when the segment
  /// source refuses to grow.
  ///
  /// # Safety
  ///
  /// The returned memory is only valid while this heap exists and until
  /// the pointer is passed to [`Heap::free`] or reshaped by
  /// [`Heap::realloc`].
  pub unsafe fn malloc(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    unsafe {
      let Some(footprint) = size.checked_add(BLOCK_OVERHEAD) else {
        return ptr::null_mut();
      };
      if size == 0 || self.validate() != HeapStatus::Ok {
        return ptr::null_mut();
      }
      debug!("malloc: requested {} bytes", size);

      let head = (*self.root).head;
      if head.is_null() {
        let available = (*self.root).pages * PAGE_SIZE - HEAP_ROOT_SIZE;
        if available < footprint {
          let pages = (footprint - available).div_ceil(PAGE_SIZE);
          if self.request_more_space(pages).is_err() {
            return ptr::null_mut();
          }
          return self.malloc(size);
        }
        let first = self.heap_start().add(HEAP_ROOT_SIZE) as *mut BlockHeader;
        self.create_header(first, size, ptr::null_mut(), ptr::null_mut());
        (*self.root).head = first;
        debug!("malloc: first block at {:p}", first);
        return (*first).user_mem_ptr;
      }

      let mut it = head;
      while !it.is_null() {
        let hit = self.try_fit(it, size, footprint);
        if !hit.is_null() {
          return hit;
        }
        it = (*it).next;
      }

      let last = self.last_header();
      let tail_end = BlockHeader::block_end(last) as usize;
      let free_tail = self.heap_end() - tail_end;
      if free_tail < footprint {
        let pages = (footprint - free_tail).div_ceil(PAGE_SIZE);
        if self.request_more_space(pages).is_err() {
          return ptr::null_mut();
        }
        return self.malloc(size);
      }
      let header = tail_end as *mut BlockHeader;
      self.create_header(header, size, last, ptr::null_mut());
      debug!("malloc: appended at {:p}", header);
      (*header).user_mem_ptr
    }
  }

  /// Allocates `number * size` bytes and zero-fills the payload.
  /// Overflow of the product counts as allocation failure.
  ///
  /// # Safety
  ///
  /// As for [`Heap::malloc`].
  pub unsafe fn calloc(
    &mut self,
    number: usize,
    size: usize,
  ) -> *mut u8 {
    unsafe {
      let Some(total) = number.checked_mul(size) else {
        return ptr::null_mut();
      };
      let handler = self.malloc(total);
      if !handler.is_null() {
        ptr::write_bytes(handler, 0, total);
      }
      handler
    }
  }

  /// Resizes the allocation at `memblock` to `count` bytes.
  ///
  /// The cases, first match wins:
  ///
  /// 1. null pointer and zero count: null;
  /// 2. null pointer: plain allocation;
  /// 3. zero count: free, returning null;
  /// 4. pointer not classified [`PointerType::Valid`]: null;
  /// 5. shrink: in place, right fence moved in;
  /// 6. same size: unchanged pointer;
  /// 7. tail block: extend in place, growing the segment as needed;
  /// 8. free successor with enough combined payload: absorb it and
  ///    carve the surplus into a new free block;
  /// 9. free successor whose span covers the request: absorb it whole;
  /// 10. otherwise: allocate elsewhere, copy, free the old block.
  ///
  /// # Safety
  ///
  /// `memblock` must be null or a pointer previously returned by this
  /// heap's allocation functions. The returned pointer obeys the same
  /// contract as [`Heap::malloc`].
  pub unsafe fn realloc(
    &mut self,
    memblock: *mut u8,
    count: usize,
  ) -> *mut u8 {
    unsafe { self.realloc_impl(memblock, count, false) }
  }

  /// Releases the allocation at `memblock`.
  ///
  /// A no-op unless the heap validates clean and `memblock` classifies
  /// as [`PointerType::Valid`]; double frees and foreign pointers fall
  /// out of that gate. The freed block is merged with any free
  /// neighbour and then stretched over the slack up to its successor:
  ///
  /// ```text
  ///   before   [hdr|fff|AAA|FFF][hdr|fff|BBBB|FFF][hdr|fff|CC|FFF]
  ///                   free            freeing           in use
  ///   after    [hdr|fff|AAAAAAAAAAAAAAAAAAAAA|FFF][hdr|fff|CC|FFF]
  ///                        one merged free block         in use
  /// ```
  ///
  /// # Safety
  ///
  /// `memblock` must be null or a pointer into memory reachable by this
  /// process; it is never dereferenced, only classified.
  pub unsafe fn free(
    &mut self,
    memblock: *mut u8,
  ) {
    unsafe {
      if self.validate() != HeapStatus::Ok {
        return;
      }
      if self.pointer_type(memblock) != PointerType::Valid {
        return;
      }
      let mut header = memblock.sub(FENCE_LENGTH + CONTROL_STRUCT_SIZE) as *mut BlockHeader;
      (*header).is_free = true;
      BlockHeader::refresh_checksum(header);
      let freed = (*header).mem_size;
      debug!("free: block at {:p}, {} payload bytes", header, freed);

      let prev = (*header).prev;
      if !prev.is_null() && (*prev).is_free {
        header = self.join_backward(header);
      }
      let next = (*header).next;
      if !next.is_null() && (*next).is_free {
        self.join_forward(header);
      }

      // A free block runs right up to its successor's descriptor; this
      // recovers slack left behind by loose fits and shrinks.
      let next = (*header).next;
      if !next.is_null() {
        let gap = next as usize - (*header).user_mem_ptr as usize - FENCE_LENGTH;
        let mem_size = (*header).mem_size;
        if gap != mem_size {
          (*header).mem_size = gap;
          BlockHeader::write_right_fence(header);
          BlockHeader::refresh_checksum(header);
        }
      }
    }
  }

  /// Like [`Heap::malloc`], with the returned pointer additionally a
  /// multiple of [`PAGE_SIZE`].
  ///
  /// The first block of an empty heap is parked so that its payload
  /// starts exactly on the second page boundary, with the descriptor in
  /// the tail of page zero. Free blocks are reused only when their
  /// payload already sits on a boundary. Appends round the payload
  /// address up to the next boundary; the bytes skipped over become
  /// slack ahead of the new descriptor and are recovered once a
  /// neighbour is freed.
  ///
  /// # Safety
  ///
  /// As for [`Heap::malloc`].
  pub unsafe fn malloc_aligned(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    unsafe {
      let Some(footprint) = size.checked_add(BLOCK_OVERHEAD) else {
        return ptr::null_mut();
      };
      if size == 0 || self.validate() != HeapStatus::Ok {
        return ptr::null_mut();
      }
      debug!("malloc_aligned: requested {} bytes", size);

      let head = (*self.root).head;
      if head.is_null() {
        let Some(required) = size.checked_add(PAGE_SIZE + FENCE_LENGTH) else {
          return ptr::null_mut();
        };
        let owned = (*self.root).pages * PAGE_SIZE;
        if owned < required {
          let pages = (required - owned).div_ceil(PAGE_SIZE);
          if self.request_more_space(pages).is_err() {
            return ptr::null_mut();
          }
          return self.malloc_aligned(size);
        }
        let first =
          self.heap_start().add(PAGE_SIZE - CONTROL_STRUCT_SIZE - FENCE_LENGTH) as *mut BlockHeader;
        self.create_header(first, size, ptr::null_mut(), ptr::null_mut());
        (*self.root).head = first;
        debug!("malloc_aligned: first block at {:p}", first);
        return (*first).user_mem_ptr;
      }

      let mut it = head;
      while !it.is_null() {
        if is_aligned!((*it).user_mem_ptr as usize, PAGE_SIZE) {
          let hit = self.try_fit(it, size, footprint);
          if !hit.is_null() {
            return hit;
          }
        }
        it = (*it).next;
      }

      let last = self.last_header();
      let tail_end = BlockHeader::block_end(last) as usize;
      let user_addr = align_to!(tail_end + CONTROL_STRUCT_SIZE + FENCE_LENGTH, PAGE_SIZE);
      let header = (user_addr - CONTROL_STRUCT_SIZE - FENCE_LENGTH) as *mut BlockHeader;
      let Some(needed_end) = (user_addr + FENCE_LENGTH).checked_add(size) else {
        return ptr::null_mut();
      };
      if needed_end > self.heap_end() {
        let pages = (needed_end - self.heap_end()).div_ceil(PAGE_SIZE);
        if self.request_more_space(pages).is_err() {
          return ptr::null_mut();
        }
      }
      self.create_header(header, size, last, ptr::null_mut());
      debug!("malloc_aligned: appended at {:p}", header);
      (*header).user_mem_ptr
    }
  }

  /// Page-aligned [`Heap::calloc`].
  ///
  /// # Safety
  ///
  /// As for [`Heap::malloc`].
  pub unsafe fn calloc_aligned(
    &mut self,
    number: usize,
    size: usize,
  ) -> *mut u8 {
    unsafe {
      let Some(total) = number.checked_mul(size) else {
        return ptr::null_mut();
      };
      let handler = self.malloc_aligned(total);
      if !handler.is_null() {
        ptr::write_bytes(handler, 0, total);
      }
      handler
    }
  }

  /// Page-aligned [`Heap::realloc`]: the relocation path allocates with
  /// [`Heap::malloc_aligned`]. In-place paths keep the existing
  /// (aligned) payload address.
  ///
  /// # Safety
  ///
  /// As for [`Heap::realloc`].
  pub unsafe fn realloc_aligned(
    &mut self,
    memblock: *mut u8,
    count: usize,
  ) -> *mut u8 {
    unsafe { self.realloc_impl(memblock, count, true) }
  }

  /// Largest payload size among occupied blocks, or zero when the heap
  /// is absent, empty or fails validation.
  pub fn largest_used_block_size(&self) -> usize {
    if self.root.is_null() {
      return 0;
    }
    unsafe {
      if (*self.root).head.is_null() || self.validate() != HeapStatus::Ok {
        return 0;
      }
      let mut max = 0;
      let mut it = (*self.root).head;
      while !it.is_null() {
        let is_free = (*it).is_free;
        let mem_size = (*it).mem_size;
        if !is_free && mem_size > max {
          max = mem_size;
        }
        it = (*it).next;
      }
      max
    }
  }

  /// Classifies an arbitrary address against the heap structure.
  ///
  /// The owning block is the last descriptor at or below `pointer`; its
  /// four boundaries (descriptor end, left fence end, payload end,
  /// right fence end) decide the region, and every region of a free
  /// block except the descriptor itself reads as
  /// [`PointerType::Unallocated`]:
  ///
  /// ```text
  ///   [ descriptor ][ fff ][ payload          ][ FFF ]
  ///   ControlBlock  Inside  Valid / InsideData  Inside   (occupied)
  ///                 Fences  Block               Fences
  ///   ControlBlock  Unallocated ...                      (free)
  /// ```
  ///
  /// # Safety
  ///
  /// `pointer` itself is never dereferenced. The classification walk
  /// trusts the registry links, so the result is only meaningful when
  /// [`Heap::validate`] does not report
  /// [`HeapStatus::ControlStructBlur`]; a corrupted fence census is
  /// detected up front and reported as [`PointerType::HeapCorrupted`].
  pub unsafe fn pointer_type(
    &self,
    pointer: *const u8,
  ) -> PointerType {
    if pointer.is_null() {
      return PointerType::Null;
    }
    match self.validate() {
      HeapStatus::Corrupted => return PointerType::HeapCorrupted,
      HeapStatus::Uninitialised => return PointerType::Unallocated,
      _ => {}
    }
    unsafe {
      let p = pointer as usize;
      let start = self.root as usize;
      if p < start {
        return PointerType::Unallocated;
      }
      if p < start + HEAP_ROOT_SIZE {
        return PointerType::ControlBlock;
      }
      let head = (*self.root).head;
      if head.is_null() {
        return PointerType::Unallocated;
      }

      // Find the last descriptor at or below the pointer. The hop cap
      // keeps a cycled registry from spinning this walk.
      let cap = (*self.root).pages * PAGE_SIZE / CONTROL_STRUCT_SIZE + 1;
      let mut hops = 0usize;
      let mut it = head;
      loop {
        let next = (*it).next;
        if next.is_null() || next as usize > p {
          break;
        }
        hops += 1;
        if hops > cap {
          break;
        }
        it = next;
      }

      let ctrl_end = it as usize + CONTROL_STRUCT_SIZE;
      let lfence_end = ctrl_end + FENCE_LENGTH;
      let user = (*it).user_mem_ptr as usize;
      let user_end = user + (*it).mem_size;
      let rfence_end = user_end + FENCE_LENGTH;
      let is_free = (*it).is_free;

      if p < ctrl_end {
        return PointerType::ControlBlock;
      }
      if is_free {
        return PointerType::Unallocated;
      }
      if p < lfence_end {
        return PointerType::InsideFences;
      }
      if p == user {
        return PointerType::Valid;
      }
      if p < user_end {
        return PointerType::InsideDataBlock;
      }
      if p < rfence_end {
        return PointerType::InsideFences;
      }
      PointerType::Unallocated
    }
  }

  /// Count of live block descriptors.
  pub fn headers_allocated(&self) -> usize {
    if self.root.is_null() {
      return 0;
    }
    unsafe { (*self.root).headers_allocated }
  }

  /// Pages currently owned.
  pub fn pages(&self) -> usize {
    if self.root.is_null() {
      return 0;
    }
    unsafe { (*self.root).pages }
  }

  fn heap_start(&self) -> *mut u8 {
    self.root as *mut u8
  }

  fn heap_end(&self) -> usize {
    unsafe { self.root as usize + (*self.root).pages * PAGE_SIZE }
  }

  /// Grows the owned region by whole pages. A page count whose byte
  /// size cannot be expressed as a signed delta is refused like any
  /// other exhausted request.
  fn request_more_space(
    &mut self,
    pages: usize,
  ) -> Result<(), SetupError> {
    let delta = match pages.checked_mul(PAGE_SIZE) {
      Some(bytes) if bytes <= isize::MAX as usize => bytes as isize,
      _ => return Err(SetupError),
    };
    if self.segment.expand(delta).is_null() {
      return Err(SetupError);
    }
    unsafe {
      (*self.root).pages += pages;
    }
    debug!("grow: {} more pages", pages);
    Ok(())
  }

  /// Writes a descriptor and records it in the root bookkeeping.
  ///
  /// # Safety
  ///
  /// As for [`BlockHeader::initialize`].
  unsafe fn create_header(
    &mut self,
    header: *mut BlockHeader,
    mem_size: usize,
    prev: *mut BlockHeader,
    next: *mut BlockHeader,
  ) {
    unsafe {
      BlockHeader::initialize(header, mem_size, prev, next);
      (*self.root).headers_allocated += 1;
      (*self.root).fence_checksum += 2 * FENCE_LENGTH as u64;
    }
  }

  /// Bookkeeping counterpart of dropping one descriptor.
  fn retire_header(&mut self) {
    unsafe {
      (*self.root).headers_allocated -= 1;
      (*self.root).fence_checksum -= 2 * FENCE_LENGTH as u64;
    }
  }

  /// Occupies the free block at `header` if the request fits, by exact
  /// fit, split or loose fit. Returns the user pointer, or null when
  /// the block is occupied or too small.
  unsafe fn try_fit(
    &mut self,
    header: *mut BlockHeader,
    size: usize,
    footprint: usize,
  ) -> *mut u8 {
    unsafe {
      if !(*header).is_free {
        return ptr::null_mut();
      }
      let mem_size = (*header).mem_size;
      if mem_size == size {
        (*header).is_free = false;
        BlockHeader::refresh_checksum(header);
        debug!("malloc: exact fit at {:p}", header);
        return (*header).user_mem_ptr;
      }
      // The remainder of a split must fit its own descriptor, fences
      // and at least one payload byte.
      if mem_size > footprint.saturating_add(1) {
        self.split(header, size);
        return (*header).user_mem_ptr;
      }
      if mem_size > size {
        (*header).is_free = false;
        (*header).mem_size = size;
        BlockHeader::write_right_fence(header);
        BlockHeader::refresh_checksum(header);
        debug!("malloc: loose fit at {:p}, {} surplus bytes", header, mem_size - size);
        return (*header).user_mem_ptr;
      }
      ptr::null_mut()
    }
  }

  /// Shrinks the free block at `header` to `new_mem_size`, occupying
  /// it, and carves the tail into a new free block:
  ///
  /// ```text
  ///   [hdr|fff|UUUUUUUUUUUUUU|FFF]  ->  [hdr|fff|UUU|FFF][hdr|fff|UU|FFF]
  ///            one free block             occupied          free
  /// ```
  unsafe fn split(
    &mut self,
    header: *mut BlockHeader,
    new_mem_size: usize,
  ) {
    unsafe {
      let prior_mem_size = (*header).mem_size;
      let next = (*header).next;
      let remainder = (*header).user_mem_ptr.add(new_mem_size + FENCE_LENGTH) as *mut BlockHeader;

      (*header).is_free = false;
      (*header).mem_size = new_mem_size;
      BlockHeader::write_right_fence(header);

      // The remainder pays for its own descriptor and fences out of the
      // donor's payload.
      let remainder_size = prior_mem_size - block::block_footprint(new_mem_size);
      self.create_header(remainder, remainder_size, header, next);
      (*remainder).is_free = true;
      BlockHeader::refresh_checksum(remainder);

      trace!(
        "split: {} bytes at {:p} into {} and {} at {:p}",
        prior_mem_size, header, new_mem_size, remainder_size, remainder
      );
    }
  }

  /// Merges the freed block at `header` into its free predecessor and
  /// returns the survivor. The absorbed block's right fence becomes the
  /// survivor's, so the merged payload runs to the absorbed payload's
  /// end and no fence is rewritten.
  unsafe fn join_backward(
    &mut self,
    header: *mut BlockHeader,
  ) -> *mut BlockHeader {
    unsafe {
      let survivor = (*header).prev;
      let absorbed_end = (*header).user_mem_ptr as usize + (*header).mem_size;
      (*survivor).mem_size = absorbed_end - (*survivor).user_mem_ptr as usize;
      let next = (*header).next;
      (*survivor).next = next;
      if !next.is_null() {
        (*next).prev = survivor;
        BlockHeader::refresh_checksum(next);
      }
      BlockHeader::refresh_checksum(survivor);
      self.retire_header();
      trace!("coalesce: {:p} absorbed backward into {:p}", header, survivor);
      survivor
    }
  }

  /// Merges the free successor of `header` into it. Same fence argument
  /// as [`Heap::join_backward`].
  unsafe fn join_forward(
    &mut self,
    header: *mut BlockHeader,
  ) {
    unsafe {
      let absorbed = (*header).next;
      let absorbed_end = (*absorbed).user_mem_ptr as usize + (*absorbed).mem_size;
      (*header).mem_size = absorbed_end - (*header).user_mem_ptr as usize;
      let next = (*absorbed).next;
      (*header).next = next;
      if !next.is_null() {
        (*next).prev = header;
        BlockHeader::refresh_checksum(next);
      }
      BlockHeader::refresh_checksum(header);
      self.retire_header();
      trace!("coalesce: {:p} absorbed forward into {:p}", absorbed, header);
    }
  }

  unsafe fn realloc_impl(
    &mut self,
    memblock: *mut u8,
    count: usize,
    page_aligned: bool,
  ) -> *mut u8 {
    unsafe {
      if memblock.is_null() && count == 0 {
        return ptr::null_mut();
      }
      if memblock.is_null() {
        return if page_aligned { self.malloc_aligned(count) } else { self.malloc(count) };
      }
      if count == 0 {
        self.free(memblock);
        return ptr::null_mut();
      }
      if self.pointer_type(memblock) != PointerType::Valid {
        return ptr::null_mut();
      }

      let header = memblock.sub(FENCE_LENGTH + CONTROL_STRUCT_SIZE) as *mut BlockHeader;
      let current = (*header).mem_size;
      debug!("realloc: block at {:p}, {} -> {} bytes", header, current, count);

      if count < current {
        // Shrink in place; the cut tail becomes slack behind the new
        // right fence.
        (*header).mem_size = count;
        BlockHeader::write_right_fence(header);
        BlockHeader::refresh_checksum(header);
        return memblock;
      }
      if count == current {
        return memblock;
      }

      let next = (*header).next;
      if next.is_null() {
        // Tail block: extend in place, growing the segment when the
        // new right fence would cross the region end.
        let Some(needed_end) = (memblock as usize + FENCE_LENGTH).checked_add(count) else {
          return ptr::null_mut();
        };
        if needed_end > self.heap_end() {
          let pages = (needed_end - self.heap_end()).div_ceil(PAGE_SIZE);
          if self.request_more_space(pages).is_err() {
            return ptr::null_mut();
          }
        }
        (*header).mem_size = count;
        BlockHeader::write_right_fence(header);
        BlockHeader::refresh_checksum(header);
        return memblock;
      }

      if (*next).is_free {
        let next_size = (*next).mem_size;
        let next_payload_end = (*next).user_mem_ptr as usize + next_size;
        let after = (*next).next;

        if current + next_size > count {
          // Absorb the free successor and carve the surplus into a new
          // free block between this one and the old successor's
          // successor.
          self.retire_header();
          (*header).mem_size = count;
          BlockHeader::write_right_fence(header);

          let remainder = memblock.add(count + FENCE_LENGTH) as *mut BlockHeader;
          let remainder_user = remainder as usize + CONTROL_STRUCT_SIZE + FENCE_LENGTH;
          self.create_header(remainder, next_payload_end - remainder_user, header, after);
          (*remainder).is_free = true;
          BlockHeader::refresh_checksum(remainder);
          return memblock;
        }

        if count <= next_payload_end - memblock as usize {
          // Absorb the free successor entirely; its descriptor goes
          // away and the surplus past the new right fence is slack.
          (*header).mem_size = count;
          (*header).next = after;
          BlockHeader::write_right_fence(header);
          BlockHeader::refresh_checksum(header);
          if !after.is_null() {
            (*after).prev = header;
            BlockHeader::refresh_checksum(after);
          }
          self.retire_header();
          return memblock;
        }
      }

      // Relocate: place a fresh block, copy the payload, release the
      // old one.
      let fresh = if page_aligned { self.malloc_aligned(count) } else { self.malloc(count) };
      if fresh.is_null() {
        return ptr::null_mut();
      }
      ptr::copy_nonoverlapping(memblock, fresh, current.min(count));
      self.free(memblock);
      fresh
    }
  }

  /// Last descriptor of the registry, or null when it is empty.
  fn last_header(&self) -> *mut BlockHeader {
    unsafe {
      let mut it = (*self.root).head;
      if it.is_null() {
        return ptr::null_mut();
      }
      while !(*it).next.is_null() {
        it = (*it).next;
      }
      it
    }
  }
}

impl<S: SegmentSource> Drop for Heap<S> {
  fn drop(&mut self) {
    self.clean();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::segment::Arena;

  /// A source that refuses every request.
  struct Refusing;

  impl SegmentSource for Refusing {
    fn expand(
      &mut self,
      _delta: isize,
    ) -> *mut u8 {
      ptr::null_mut()
    }
  }

  fn arena_heap(pages: usize) -> Heap<Arena> {
    let _ = env_logger::builder().is_test(true).try_init();
    Heap::setup_with(Arena::new(pages * PAGE_SIZE)).unwrap()
  }

  fn assert_valid<S: SegmentSource>(heap: &Heap<S>) {
    assert_eq!(heap.validate(), HeapStatus::Ok);
  }

  #[test]
  fn setup_produces_a_valid_empty_heap() {
    let heap = arena_heap(4);
    assert_valid(&heap);
    assert_eq!(heap.pages(), 1);
    assert_eq!(heap.headers_allocated(), 0);
    assert_eq!(heap.largest_used_block_size(), 0);
  }

  #[test]
  fn setup_fails_when_the_segment_refuses() {
    assert_eq!(Heap::setup_with(Refusing).err(), Some(SetupError));
  }

  #[test]
  fn malloc_rejects_zero_and_overflowing_sizes() {
    let mut heap = arena_heap(4);
    unsafe {
      assert!(heap.malloc(0).is_null());
      assert!(heap.malloc(usize::MAX).is_null());
      assert!(heap.malloc(usize::MAX - BLOCK_OVERHEAD).is_null());
    }
    assert_valid(&heap);
  }

  #[test]
  fn malloc_free_lifecycle() {
    let mut heap = arena_heap(4);
    unsafe {
      let p = heap.malloc(1);
      assert!(!p.is_null());
      assert_valid(&heap);
      assert_eq!(heap.pointer_type(p), PointerType::Valid);

      heap.free(p);
      // The registry keeps one block, now marked free.
      assert_eq!(heap.headers_allocated(), 1);
      assert_eq!(heap.pointer_type(p), PointerType::Unallocated);
      assert_eq!(heap.largest_used_block_size(), 0);
      assert_valid(&heap);
    }
  }

  #[test]
  fn blocks_are_packed_back_to_back() {
    let mut heap = arena_heap(4);
    unsafe {
      let a = heap.malloc(PAGE_SIZE);
      let b = heap.malloc(1);
      assert!(!a.is_null() && !b.is_null());
      assert_eq!(
        b as usize,
        a as usize + PAGE_SIZE + CONTROL_STRUCT_SIZE + 2 * FENCE_LENGTH
      );
      assert_valid(&heap);
    }
  }

  #[test]
  fn first_fit_reuses_a_freed_hole() {
    let mut heap = arena_heap(4);
    unsafe {
      let a = heap.malloc(100);
      let b = heap.malloc(200);
      let c = heap.malloc(300);
      assert!(!a.is_null() && !b.is_null() && !c.is_null());

      heap.free(b);
      assert_valid(&heap);

      // The hole is large enough to split, so the request lands at the
      // start of the former block.
      let d = heap.malloc(50);
      assert_eq!(d, b);
      assert_valid(&heap);
    }
  }

  #[test]
  fn exact_fit_reoccupies_a_freed_block() {
    let mut heap = arena_heap(4);
    unsafe {
      let a = heap.malloc(64);
      let b = heap.malloc(32);
      assert!(!b.is_null());
      heap.free(a);
      let c = heap.malloc(64);
      assert_eq!(c, a);
      assert_valid(&heap);
    }
  }

  #[test]
  fn loose_fit_shrinks_and_free_reclaims_the_slack() {
    let mut heap = arena_heap(4);
    unsafe {
      let a = heap.malloc(100);
      let b = heap.malloc(50);
      assert!(!b.is_null());
      heap.free(a);

      // 100 bytes cannot host a 98-byte block plus a whole remainder
      // block, so this is a loose fit with two slack bytes.
      let c = heap.malloc(98);
      assert_eq!(c, a);
      assert_valid(&heap);

      // Freeing stretches the block back over its slack.
      heap.free(c);
      let d = heap.malloc(100);
      assert_eq!(d, a);
      assert_valid(&heap);
    }
  }

  #[test]
  fn fence_corruption_is_detected_and_stops_the_heap() {
    let mut heap = arena_heap(4);
    unsafe {
      let p = heap.malloc(16);
      assert!(!p.is_null());

      // One-byte overrun into the right fence.
      p.add(16).write(0);
      assert_eq!(heap.validate(), HeapStatus::Corrupted);
      assert_eq!(heap.pointer_type(p), PointerType::HeapCorrupted);
      assert!(heap.malloc(8).is_null());
      assert_eq!(heap.largest_used_block_size(), 0);

      // Freeing is refused too; the block count stays put.
      heap.free(p);
      assert_eq!(heap.headers_allocated(), 1);

      // Restoring the canary brings the heap back.
      p.add(16).write(b'F');
      assert_valid(&heap);
    }
  }

  #[test]
  fn aligned_allocation_lands_on_a_page_boundary() {
    let mut heap = arena_heap(4);
    unsafe {
      let a = heap.malloc_aligned(1);
      assert!(!a.is_null());
      assert_eq!(a as usize % PAGE_SIZE, 0);
      assert_valid(&heap);
      heap.free(a);
    }
    heap.clean();
    assert_eq!(heap.validate(), HeapStatus::Uninitialised);
  }

  #[test]
  fn aligned_reuse_only_takes_aligned_free_blocks() {
    let mut heap = arena_heap(8);
    unsafe {
      // An unaligned hole must be skipped even though it is free and
      // large enough.
      let x = heap.malloc(200);
      let y = heap.malloc(50);
      assert!(!y.is_null());
      heap.free(x);

      let z = heap.malloc_aligned(40);
      assert!(!z.is_null());
      assert_ne!(z, x);
      assert_eq!(z as usize % PAGE_SIZE, 0);
      assert_valid(&heap);
    }
  }

  #[test]
  fn aligned_free_block_is_reused_in_place() {
    let mut heap = arena_heap(8);
    unsafe {
      let a = heap.malloc_aligned(64);
      let b = heap.malloc_aligned(64);
      assert!(!a.is_null() && !b.is_null());
      assert_ne!(a, b);
      heap.free(a);

      // The freed aligned block takes the next aligned request.
      let c = heap.malloc_aligned(32);
      assert_eq!(c, a);
      assert_valid(&heap);
    }
  }

  #[test]
  fn realloc_grows_the_tail_block_in_place() {
    let mut heap = arena_heap(8);
    unsafe {
      let a = heap.malloc(10);
      assert!(!a.is_null());
      for i in 0..10 {
        a.add(i).write(i as u8);
      }

      let b = heap.realloc(a, 10_000);
      assert_eq!(b, a);
      for i in 0..10 {
        assert_eq!(b.add(i).read(), i as u8);
      }
      assert_valid(&heap);
    }
  }

  #[test]
  fn realloc_null_and_zero_count_edges() {
    let mut heap = arena_heap(4);
    unsafe {
      assert!(heap.realloc(ptr::null_mut(), 0).is_null());

      let p = heap.realloc(ptr::null_mut(), 16);
      assert!(!p.is_null());
      assert_eq!(heap.pointer_type(p), PointerType::Valid);

      assert!(heap.realloc(p, 0).is_null());
      assert_eq!(heap.pointer_type(p), PointerType::Unallocated);
      assert_valid(&heap);
    }
  }

  #[test]
  fn realloc_same_size_returns_the_same_pointer() {
    let mut heap = arena_heap(4);
    unsafe {
      let p = heap.malloc(128);
      assert_eq!(heap.realloc(p, 128), p);
      assert_valid(&heap);
    }
  }

  #[test]
  fn realloc_shrink_is_idempotent() {
    let mut heap = arena_heap(4);
    unsafe {
      let a = heap.malloc(100);
      let first = heap.realloc(a, 40);
      assert_eq!(first, a);
      assert_valid(&heap);
      let second = heap.realloc(first, 40);
      assert_eq!(second, a);
      assert_valid(&heap);
    }
  }

  #[test]
  fn realloc_rejects_interior_pointers() {
    let mut heap = arena_heap(4);
    unsafe {
      let p = heap.malloc(64);
      assert!(heap.realloc(p.add(1), 10).is_null());
      assert_eq!(heap.pointer_type(p), PointerType::Valid);
      assert_valid(&heap);
    }
  }

  #[test]
  fn realloc_carves_a_remainder_from_a_free_successor() {
    let mut heap = arena_heap(8);
    unsafe {
      let a = heap.malloc(100);
      let b = heap.malloc(100);
      let c = heap.malloc(50);
      assert!(!c.is_null());
      for i in 0..100 {
        a.add(i).write(0x5A);
      }
      heap.free(b);

      // 100 + 100 > 150: grow into the hole and leave a free remainder
      // between the grown block and c.
      assert_eq!(heap.realloc(a, 150), a);
      assert_eq!(heap.headers_allocated(), 3);
      assert_valid(&heap);
      for i in 0..100 {
        assert_eq!(a.add(i).read(), 0x5A);
      }

      // The remainder begins right behind the grown block.
      let d = heap.malloc(50);
      assert_eq!(
        d as usize,
        a as usize + 150 + CONTROL_STRUCT_SIZE + 2 * FENCE_LENGTH
      );
      assert_valid(&heap);
    }
  }

  #[test]
  fn realloc_absorbs_a_free_successor_entirely() {
    let mut heap = arena_heap(8);
    unsafe {
      let a = heap.malloc(100);
      let b = heap.malloc(100);
      let c = heap.malloc(50);
      assert!(!c.is_null());
      heap.free(b);

      // 100 + 100 is not enough payload for 230, but the whole span of
      // both blocks is; the successor's descriptor disappears.
      assert_eq!(heap.realloc(a, 230), a);
      assert_eq!(heap.headers_allocated(), 2);
      assert_valid(&heap);
    }
  }

  #[test]
  fn realloc_relocates_when_it_cannot_grow_in_place() {
    let mut heap = arena_heap(8);
    unsafe {
      let a = heap.malloc(100);
      let b = heap.malloc(50);
      assert!(!b.is_null());
      for i in 0..100 {
        a.add(i).write(i as u8);
      }

      let moved = heap.realloc(a, 500);
      assert!(!moved.is_null());
      assert_ne!(moved, a);
      for i in 0..100 {
        assert_eq!(moved.add(i).read(), i as u8);
      }
      // The old block is free again.
      assert_eq!(heap.pointer_type(a), PointerType::Unallocated);
      assert_valid(&heap);
    }
  }

  #[test]
  fn realloc_aligned_relocation_stays_aligned() {
    let mut heap = arena_heap(16);
    unsafe {
      let a = heap.malloc_aligned(100);
      let b = heap.malloc(50);
      assert!(!b.is_null());
      for i in 0..100 {
        a.add(i).write(0xC3);
      }

      let moved = heap.realloc_aligned(a, 5000);
      assert!(!moved.is_null());
      assert_ne!(moved, a);
      assert_eq!(moved as usize % PAGE_SIZE, 0);
      for i in 0..100 {
        assert_eq!(moved.add(i).read(), 0xC3);
      }
      assert_valid(&heap);
    }
  }

  #[test]
  fn calloc_zero_fills_a_recycled_block() {
    let mut heap = arena_heap(4);
    unsafe {
      let a = heap.malloc(32);
      ptr::write_bytes(a, 0xAB, 32);
      heap.free(a);

      let c = heap.calloc(4, 8);
      assert_eq!(c, a);
      for i in 0..32 {
        assert_eq!(c.add(i).read(), 0);
      }
      assert_valid(&heap);
    }
  }

  #[test]
  fn calloc_treats_overflow_as_failure() {
    let mut heap = arena_heap(4);
    unsafe {
      assert!(heap.calloc(usize::MAX, 2).is_null());
      assert!(heap.calloc_aligned(usize::MAX, 2).is_null());
    }
    assert_valid(&heap);
  }

  #[test]
  fn calloc_aligned_is_aligned_and_zeroed() {
    let mut heap = arena_heap(4);
    unsafe {
      let p = heap.calloc_aligned(3, 100);
      assert!(!p.is_null());
      assert_eq!(p as usize % PAGE_SIZE, 0);
      for i in 0..300 {
        assert_eq!(p.add(i).read(), 0);
      }
      assert_valid(&heap);
    }
  }

  #[test]
  fn coalesce_merges_all_free_neighbours() {
    let mut heap = arena_heap(4);
    unsafe {
      let a = heap.malloc(100);
      let b = heap.malloc(100);
      let c = heap.malloc(100);
      assert!(!a.is_null() && !b.is_null() && !c.is_null());

      heap.free(a);
      heap.free(c);
      assert_valid(&heap);
      // Freeing the middle block merges all three into one.
      heap.free(b);
      assert_eq!(heap.headers_allocated(), 1);
      assert_eq!(heap.largest_used_block_size(), 0);
      assert_valid(&heap);

      // The merged block spans all three footprints, so a request
      // bigger than any single one splits it.
      let d = heap.malloc(300);
      assert_eq!(d, a);
      assert_eq!(heap.headers_allocated(), 2);
      assert_valid(&heap);
    }
  }

  #[test]
  fn free_ignores_null_foreign_and_double_frees() {
    let mut heap = arena_heap(4);
    unsafe {
      heap.free(ptr::null_mut());

      let p = heap.malloc(32);
      let on_stack = 5u8;
      heap.free(&on_stack as *const u8 as *mut u8);
      assert_eq!(heap.headers_allocated(), 1);
      assert_eq!(heap.pointer_type(p), PointerType::Valid);

      heap.free(p);
      let headers = heap.headers_allocated();
      heap.free(p); // double free: already classified unallocated
      assert_eq!(heap.headers_allocated(), headers);
      assert_valid(&heap);
    }
  }

  #[test]
  fn pointer_classification_walks_every_region() {
    let mut heap = arena_heap(4);
    unsafe {
      let p = heap.malloc(32);
      let start = heap.root as usize;

      assert_eq!(heap.pointer_type(ptr::null()), PointerType::Null);
      assert_eq!(heap.pointer_type((start - 1) as *const u8), PointerType::Unallocated);
      assert_eq!(heap.pointer_type((start + 1) as *const u8), PointerType::ControlBlock);
      assert_eq!(
        heap.pointer_type(p.sub(FENCE_LENGTH + 1)),
        PointerType::ControlBlock
      );
      assert_eq!(heap.pointer_type(p.sub(1)), PointerType::InsideFences);
      assert_eq!(heap.pointer_type(p), PointerType::Valid);
      assert_eq!(heap.pointer_type(p.add(1)), PointerType::InsideDataBlock);
      assert_eq!(heap.pointer_type(p.add(31)), PointerType::InsideDataBlock);
      assert_eq!(heap.pointer_type(p.add(32)), PointerType::InsideFences);
      assert_eq!(
        heap.pointer_type(p.add(32 + FENCE_LENGTH)),
        PointerType::Unallocated
      );

      heap.free(p);
      assert_eq!(heap.pointer_type(p), PointerType::Unallocated);
    }
  }

  #[test]
  fn largest_used_block_size_tracks_live_blocks() {
    let mut heap = arena_heap(4);
    unsafe {
      let _a = heap.malloc(100);
      let b = heap.malloc(300);
      let _c = heap.malloc(200);
      assert_eq!(heap.largest_used_block_size(), 300);

      heap.free(b);
      assert_eq!(heap.largest_used_block_size(), 200);
      assert_valid(&heap);
    }
  }

  #[test]
  fn exhaustion_leaves_the_heap_unchanged() {
    let mut heap = arena_heap(2);
    unsafe {
      let a = heap.malloc(100);
      assert!(!a.is_null());

      let failed = heap.malloc(100_000);
      assert!(failed.is_null());
      assert_eq!(heap.pages(), 1);
      assert_eq!(heap.headers_allocated(), 1);
      assert_eq!(heap.pointer_type(a), PointerType::Valid);
      assert_valid(&heap);
    }
  }

  #[test]
  fn clean_releases_everything() {
    let mut heap = arena_heap(4);
    unsafe {
      let p = heap.malloc(64);
      assert!(!p.is_null());

      heap.clean();
      assert_eq!(heap.validate(), HeapStatus::Uninitialised);
      assert_eq!(heap.pages(), 0);
      assert_eq!(heap.headers_allocated(), 0);
      assert_eq!(heap.largest_used_block_size(), 0);
      assert!(heap.malloc(8).is_null());
      assert_eq!(heap.pointer_type(p), PointerType::Unallocated);

      // A second clean has nothing to act on.
      heap.clean();
      assert_eq!(heap.validate(), HeapStatus::Uninitialised);
    }
  }

  #[test]
  fn header_count_blur_is_detected() {
    let mut heap = arena_heap(4);
    unsafe {
      let _p = heap.malloc(8);
      (*heap.root).headers_allocated += 1;
      assert_eq!(heap.validate(), HeapStatus::ControlStructBlur);
      assert!(heap.malloc(8).is_null());
      assert_eq!(heap.largest_used_block_size(), 0);

      (*heap.root).headers_allocated -= 1;
      assert_valid(&heap);
    }
  }

  #[test]
  fn shifted_user_pointer_is_detected() {
    let mut heap = arena_heap(4);
    unsafe {
      let p = heap.malloc(8);
      let header = p.sub(FENCE_LENGTH + CONTROL_STRUCT_SIZE) as *mut BlockHeader;

      (*header).user_mem_ptr = p.add(1);
      BlockHeader::refresh_checksum(header);
      assert_eq!(heap.validate(), HeapStatus::ControlStructBlur);

      (*header).user_mem_ptr = p;
      BlockHeader::refresh_checksum(header);
      assert_valid(&heap);
    }
  }

  #[test]
  fn stale_descriptor_checksum_is_detected() {
    let mut heap = arena_heap(4);
    unsafe {
      let p = heap.malloc(8);
      let header = p.sub(FENCE_LENGTH + CONTROL_STRUCT_SIZE) as *mut BlockHeader;

      // A mutation that skips the checksum refresh must surface.
      (*header).mem_size = 9;
      assert_eq!(heap.validate(), HeapStatus::ControlStructBlur);

      (*header).mem_size = 8;
      assert_valid(&heap);
    }
  }

  #[test]
  fn torture_sequence_keeps_the_validator_green() {
    let mut heap = arena_heap(16);
    unsafe {
      let a = heap.malloc(1000);
      assert_valid(&heap);
      let b = heap.calloc(16, 32);
      assert_valid(&heap);
      let c = heap.malloc_aligned(256);
      assert_valid(&heap);
      heap.free(b);
      assert_valid(&heap);
      let d = heap.malloc(64);
      assert_valid(&heap);
      let a = heap.realloc(a, 2000);
      assert_valid(&heap);
      let a = heap.realloc(a, 50);
      assert_valid(&heap);
      heap.free(d);
      assert_valid(&heap);
      heap.free(a);
      assert_valid(&heap);
      let e = heap.realloc_aligned(ptr::null_mut(), 128);
      assert_eq!(e as usize % PAGE_SIZE, 0);
      assert_valid(&heap);
      heap.free(c);
      assert_valid(&heap);
      heap.free(e);
      assert_valid(&heap);
      assert_eq!(heap.largest_used_block_size(), 0);
    }
  }
}

#[cfg(test)]
mod properties {
  use proptest::prelude::*;

  use super::*;
  use crate::segment::Arena;

  #[derive(Debug, Clone)]
  enum Op {
    Malloc(usize),
    MallocAligned(usize),
    Calloc(usize, usize),
    Realloc(usize, usize),
    Free(usize),
  }

  fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
      (1usize..512).prop_map(Op::Malloc),
      (1usize..256).prop_map(Op::MallocAligned),
      ((1usize..16), (1usize..64)).prop_map(|(n, s)| Op::Calloc(n, s)),
      ((0usize..8), (0usize..600)).prop_map(|(i, c)| Op::Realloc(i, c)),
      (0usize..8).prop_map(Op::Free),
    ]
  }

  proptest! {
    #[test]
    fn validator_holds_over_random_op_sequences(
      ops in proptest::collection::vec(op_strategy(), 1..48),
    ) {
      let mut heap = Heap::setup_with(Arena::new(64 * PAGE_SIZE)).unwrap();
      let mut live: Vec<(*mut u8, usize)> = Vec::new();

      unsafe {
        for op in ops {
          match op {
            Op::Malloc(size) => {
              let p = heap.malloc(size);
              if !p.is_null() {
                prop_assert_eq!(heap.pointer_type(p), PointerType::Valid);
                live.push((p, size));
              }
            }
            Op::MallocAligned(size) => {
              let p = heap.malloc_aligned(size);
              if !p.is_null() {
                prop_assert_eq!(p as usize % PAGE_SIZE, 0);
                live.push((p, size));
              }
            }
            Op::Calloc(number, size) => {
              let p = heap.calloc(number, size);
              if !p.is_null() {
                for i in 0..number * size {
                  prop_assert_eq!(p.add(i).read(), 0);
                }
                live.push((p, number * size));
              }
            }
            Op::Realloc(slot, count) => {
              if live.is_empty() {
                continue;
              }
              let slot = slot % live.len();
              let (p, _) = live[slot];
              let q = heap.realloc(p, count);
              if count == 0 {
                live.remove(slot);
              } else if !q.is_null() {
                live[slot] = (q, count);
              }
            }
            Op::Free(slot) => {
              if live.is_empty() {
                continue;
              }
              let slot = slot % live.len();
              let (p, _) = live.remove(slot);
              heap.free(p);
              let class = heap.pointer_type(p);
              prop_assert!(matches!(
                class,
                PointerType::Unallocated | PointerType::ControlBlock | PointerType::InsideFences
              ));
            }
          }
          prop_assert_eq!(heap.validate(), HeapStatus::Ok);
        }

        // Every surviving pointer still classifies correctly.
        for (p, size) in &live {
          let p = *p;
          prop_assert_eq!(heap.pointer_type(p), PointerType::Valid);
          if *size > 1 {
            prop_assert_eq!(heap.pointer_type(p.add(1)), PointerType::InsideDataBlock);
          }
        }
      }
    }
  }
}
