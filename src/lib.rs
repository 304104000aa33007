#![allow(clippy::missing_safety_doc)]
//! Segregated size-class allocator.
//!
//! Small requests are served from 32 size classes, each owning a free list of blocks
//! carved out of page-mapped arena regions. Freed blocks are merged with their free
//! physical neighbours and re-bucketed by their new size. Requests above 4 KiB get
//! their own mapping, which is returned to the OS as soon as the block is released.
//!
//! All heap state sits behind one lock. The process-wide heap is exposed through the
//! free functions ([`allocate`], [`release`], [`resize`], [`allocate_zeroed`]), through
//! [`Allocator`] for `#[global_allocator]`, and, with the `c_api` feature, as the C
//! `malloc` family.

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::UnsafeCell,
  hint,
  mem::size_of,
  ops::{Deref, DerefMut},
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicBool, Ordering},
};

// =============================================================================
// Constants
// =============================================================================

pub const PAGE_SIZE: usize = 4096;

/// Requests are rounded up to a multiple of this.
pub const MIN_ALIGN: usize = 8;
/// Alignment every payload actually gets: headers and slot sizes are multiples of 16.
pub const MAX_ALIGN: usize = 16;

/// Largest request served by the linear tiny classes.
pub const TINY_MAX_SIZE: usize = 256;
/// Largest request served by size classes. Anything above goes to its own mapping.
pub const SMALL_MAX_SIZE: usize = 4096;

pub const NUM_SIZE_CLASSES: usize = 32;

/// Linear tiny classes (16...256).
const TINY_CLASSES: usize = 16;
const TINY_STEP: usize = 16;

/// Classes per doubling in the geometric small range (256...4096).
const CLASSES_PER_DOUBLING: usize = 4;

/// Arena region sizes. Small regions are larger to amortize the syscall.
const TINY_REGION_SIZE: usize = PAGE_SIZE;
const SMALL_REGION_SIZE: usize = PAGE_SIZE * 4;

const HEADER_SIZE: usize = size_of::<BlockHeader>();

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_ALIGN % MIN_ALIGN == 0);
const _: () = assert!(HEADER_SIZE % MAX_ALIGN == 0);
const _: () = assert!(TINY_CLASSES * TINY_STEP == TINY_MAX_SIZE);
const _: () = assert!(class_to_size(0) == TINY_STEP);
const _: () = assert!(class_to_size(TINY_CLASSES - 1) == TINY_MAX_SIZE);
const _: () = assert!(class_to_size(NUM_SIZE_CLASSES - 1) == SMALL_MAX_SIZE);
const _: () = assert!(slot_sizes_are_valid());
const _: () = assert!(TINY_REGION_SIZE > HEADER_SIZE + TINY_MAX_SIZE);
const _: () = assert!(SMALL_REGION_SIZE > HEADER_SIZE + SMALL_MAX_SIZE);

/// Slot sizes must strictly increase and keep every block start 16-aligned.
const fn slot_sizes_are_valid() -> bool {
  let mut class = 0;
  while class < NUM_SIZE_CLASSES {
    let size = class_to_size(class);
    if size % MAX_ALIGN != 0 {
      return false;
    }
    if class > 0 && size <= class_to_size(class - 1) {
      return false;
    }
    class += 1;
  }
  true
}

// =============================================================================
// Types
// =============================================================================

/// `BlockKind` decides how a block is released.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum BlockKind {
  /// Carved out of an arena region; coalesced and re-bucketed on release.
  Small = 0,
  /// Owns its mapping; unmapped on release.
  Large = 1,
}

/// Size category of a (rounded) request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SizeCategory {
  Tiny,
  Small,
  Large,
}

/// Metadata immediately preceding every payload.
///
/// `next`/`prev` link the block into a list: its size class's free list while free, or
/// the large-block list for the whole life of a large block. `next_phys`/`prev_phys`
/// link physical neighbours inside one arena region and stay valid whether the block is
/// free or not. The two pairs are never used interchangeably.
#[repr(C, align(16))]
struct BlockHeader {
  /// Usable payload bytes, header excluded.
  size: usize,
  next: *mut BlockHeader,
  prev: *mut BlockHeader,
  next_phys: *mut BlockHeader,
  prev_phys: *mut BlockHeader,
  is_free: bool,
  kind: BlockKind,
}

impl BlockHeader {
  #[inline]
  fn payload(block: *mut BlockHeader) -> *mut u8 {
    unsafe { (block as *mut u8).add(HEADER_SIZE) }
  }

  /// Recovers the header of a payload handed out by this allocator.
  #[inline]
  unsafe fn from_payload(ptr: *mut u8) -> *mut BlockHeader {
    unsafe { ptr.sub(HEADER_SIZE) as *mut BlockHeader }
  }
}

/// One allocation-size bucket.
#[derive(Clone, Copy)]
struct SizeClass {
  /// Slot size handed out for requests of this class.
  size: usize,
  free_list: *mut BlockHeader,
}

/// Snapshot of the heap's traffic with the page source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  /// Arena regions mapped for the size classes. They are never unmapped.
  pub arena_regions: usize,
  /// Large mappings created since startup.
  pub large_mapped: usize,
  /// Large mappings returned to the page source.
  pub large_unmapped: usize,
  /// Large blocks currently allocated.
  pub live_large: usize,
  /// Bytes currently mapped, arenas and large blocks together.
  pub mapped_bytes: usize,
}

impl HeapStats {
  const EMPTY: HeapStats = HeapStats {
    arena_regions: 0,
    large_mapped: 0,
    large_unmapped: 0,
    live_large: 0,
    mapped_bytes: 0,
  };
}

// =============================================================================
// Platform
// =============================================================================

/// Source of page-granular, zero-initialized, readable and writable memory.
///
/// # Safety
///
/// `map` must return either `None` or a region of at least `len` bytes that is aligned
/// to [`PAGE_SIZE`], zero-filled, and not handed out again until passed to `unmap`.
pub unsafe trait PageSource {
  /// Maps `len` bytes. `len` is always a multiple of [`PAGE_SIZE`].
  fn map(&self, len: usize) -> Option<NonNull<u8>>;

  /// Returns a region obtained from `map` with the same `len`.
  unsafe fn unmap(&self, region: NonNull<u8>, len: usize);
}

/// Anonymous private mappings from the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsPages;

unsafe impl PageSource for OsPages {
  fn map(&self, len: usize) -> Option<NonNull<u8>> {
    unsafe { os_mmap(len) }
  }

  unsafe fn unmap(&self, region: NonNull<u8>, len: usize) {
    unsafe { os_munmap(region.as_ptr(), len) };
  }
}

unsafe fn os_mmap(size: usize) -> Option<NonNull<u8>> {
  debug_assert!(size % PAGE_SIZE == 0, "os_mmap: {size} is not a page multiple");
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    None
  } else {
    NonNull::new(ptr as *mut u8)
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

// =============================================================================
// Lock
// =============================================================================

struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

/// Data guarded by a [`SpinLock`].
struct Locked<T> {
  lock: SpinLock,
  data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Locked<T> {}

impl<T> Locked<T> {
  const fn new(data: T) -> Self {
    Self {
      lock: SpinLock::new(),
      data: UnsafeCell::new(data),
    }
  }

  #[inline]
  fn lock(&self) -> LockGuard<'_, T> {
    self.lock.lock();
    LockGuard { locked: self }
  }
}

struct LockGuard<'a, T> {
  locked: &'a Locked<T>,
}

impl<T> Deref for LockGuard<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    unsafe { &*self.locked.data.get() }
  }
}

impl<T> DerefMut for LockGuard<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.locked.data.get() }
  }
}

impl<T> Drop for LockGuard<'_, T> {
  fn drop(&mut self) {
    self.locked.lock.unlock();
  }
}

// =============================================================================
// Heap State
// =============================================================================

/// Everything the heap lock protects.
struct HeapState {
  classes: [SizeClass; NUM_SIZE_CLASSES],
  /// Head of the large-block list.
  large: *mut BlockHeader,
  stats: HeapStats,
}

// Headers are only reached through the lock that owns this state.
unsafe impl Send for HeapState {}

impl HeapState {
  const fn new() -> Self {
    let mut classes = [SizeClass {
      size: 0,
      free_list: null_mut(),
    }; NUM_SIZE_CLASSES];

    let mut class = 0;
    while class < NUM_SIZE_CLASSES {
      classes[class].size = class_to_size(class);
      class += 1;
    }

    Self {
      classes,
      large: null_mut(),
      stats: HeapStats::EMPTY,
    }
  }

  fn allocate<P: PageSource>(&mut self, pages: &P, size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
      return None;
    }
    let size = size.checked_add(MIN_ALIGN - 1)? & !(MIN_ALIGN - 1);

    let block = match classify(size) {
      SizeCategory::Tiny => self.alloc_small(pages, size, TINY_REGION_SIZE)?,
      SizeCategory::Small => self.alloc_small(pages, size, SMALL_REGION_SIZE)?,
      SizeCategory::Large => self.alloc_large(pages, size)?,
    };

    unsafe { (*block).is_free = false };
    NonNull::new(BlockHeader::payload(block))
  }

  /// Releases the block owning `ptr`.
  unsafe fn release<P: PageSource>(&mut self, pages: &P, ptr: NonNull<u8>) {
    let block = unsafe { BlockHeader::from_payload(ptr.as_ptr()) };
    debug_assert!(
      unsafe { !(*block).is_free },
      "release: block {block:p} is already free"
    );

    unsafe {
      (*block).is_free = true;
      match (*block).kind {
        BlockKind::Large => self.release_large(pages, block),
        BlockKind::Small => {
          let merged = self.coalesce(block);
          self.push_free(merged);
        }
      }
    }
  }

  // ---------------------------------------------------------------------------
  // Free lists
  // ---------------------------------------------------------------------------

  /// Pushes a free small block on the list its size belongs to.
  unsafe fn push_free(&mut self, block: *mut BlockHeader) {
    let class = class_floor(unsafe { (*block).size });
    let list = &mut self.classes[class].free_list;
    unsafe {
      (*block).prev = null_mut();
      (*block).next = *list;
      if !(*list).is_null() {
        (**list).prev = block;
      }
    }
    *list = block;
  }

  /// Unlinks a free small block from its list. Must run before its size changes.
  unsafe fn unlink_free(&mut self, block: *mut BlockHeader) {
    let class = class_floor(unsafe { (*block).size });
    unsafe {
      let next = (*block).next;
      let prev = (*block).prev;
      if prev.is_null() {
        debug_assert!(
          self.classes[class].free_list == block,
          "unlink_free: {block:p} is not the head of class {class}"
        );
        self.classes[class].free_list = next;
      } else {
        (*prev).next = next;
      }
      if !next.is_null() {
        (*next).prev = prev;
      }
      (*block).next = null_mut();
      (*block).prev = null_mut();
    }
  }

  /// Pops a free block able to hold a slot of `class`, looking at larger classes when
  /// the class itself is empty.
  fn take_fit(&mut self, class: usize) -> Option<NonNull<BlockHeader>> {
    let found = (class..NUM_SIZE_CLASSES).find(|&c| !self.classes[c].free_list.is_null())?;
    let block = self.classes[found].free_list;
    unsafe { self.unlink_free(block) };
    NonNull::new(block)
  }

  // ---------------------------------------------------------------------------
  // Small allocation
  // ---------------------------------------------------------------------------

  fn alloc_small<P: PageSource>(
    &mut self,
    pages: &P,
    size: usize,
    region_size: usize,
  ) -> Option<*mut BlockHeader> {
    let class = size_to_class(size);
    let block = match self.take_fit(class) {
      Some(block) => block.as_ptr(),
      None => self.map_arena(pages, region_size)?,
    };

    let target = self.classes[class].size;
    debug_assert!(
      unsafe { (*block).size } >= target,
      "alloc_small: block {block:p} too small for class {class}"
    );
    unsafe { self.split(block, target) };
    Some(block)
  }

  /// Maps a fresh region and formats it as a single free block.
  fn map_arena<P: PageSource>(&mut self, pages: &P, region_size: usize) -> Option<*mut BlockHeader> {
    let region = pages.map(region_size)?;
    let block = region.as_ptr() as *mut BlockHeader;
    unsafe {
      block.write(BlockHeader {
        size: region_size - HEADER_SIZE,
        next: null_mut(),
        prev: null_mut(),
        next_phys: null_mut(),
        prev_phys: null_mut(),
        is_free: true,
        kind: BlockKind::Small,
      });
    }

    self.stats.arena_regions += 1;
    self.stats.mapped_bytes += region_size;
    Some(block)
  }

  /// Shrinks `block` to `target` payload bytes, turning the tail into a new free
  /// block. Keeps the block whole when the tail, minus its own header, would hold
  /// fewer than `HEADER_SIZE` bytes.
  unsafe fn split(&mut self, block: *mut BlockHeader, target: usize) {
    let size = unsafe { (*block).size };
    if size - target < 2 * HEADER_SIZE {
      return;
    }
    // The tail spans everything past the slot, its own header included.
    let rest_size = size - target - HEADER_SIZE;

    let rest = unsafe { (block as *mut u8).add(HEADER_SIZE + target) as *mut BlockHeader };
    unsafe {
      let next_phys = (*block).next_phys;
      rest.write(BlockHeader {
        size: rest_size,
        next: null_mut(),
        prev: null_mut(),
        next_phys,
        prev_phys: block,
        is_free: true,
        kind: BlockKind::Small,
      });
      if !next_phys.is_null() {
        (*next_phys).prev_phys = rest;
      }
      (*block).next_phys = rest;
      (*block).size = target;
      self.push_free(rest);
    }
  }

  /// Merges a block being freed with its free physical neighbours. Returns the block
  /// that now covers it, which is not on any list yet.
  unsafe fn coalesce(&mut self, mut block: *mut BlockHeader) -> *mut BlockHeader {
    unsafe {
      let next = (*block).next_phys;
      if !next.is_null() && (*next).is_free {
        self.unlink_free(next);
        (*block).size += (*next).size + HEADER_SIZE;
        (*block).next_phys = (*next).next_phys;
        if !(*block).next_phys.is_null() {
          (*(*block).next_phys).prev_phys = block;
        }
      }

      let prev = (*block).prev_phys;
      if !prev.is_null() && (*prev).is_free {
        self.unlink_free(prev);
        (*prev).size += (*block).size + HEADER_SIZE;
        (*prev).next_phys = (*block).next_phys;
        if !(*prev).next_phys.is_null() {
          (*(*prev).next_phys).prev_phys = prev;
        }
        block = prev;
      }
    }
    block
  }

  // ---------------------------------------------------------------------------
  // Large allocation
  // ---------------------------------------------------------------------------

  fn alloc_large<P: PageSource>(&mut self, pages: &P, size: usize) -> Option<*mut BlockHeader> {
    let total = size.checked_add(HEADER_SIZE + PAGE_SIZE - 1)? & !(PAGE_SIZE - 1);
    let region = pages.map(total)?;
    let block = region.as_ptr() as *mut BlockHeader;

    unsafe {
      block.write(BlockHeader {
        size: total - HEADER_SIZE,
        next: self.large,
        prev: null_mut(),
        next_phys: null_mut(),
        prev_phys: null_mut(),
        is_free: false,
        kind: BlockKind::Large,
      });
      if !self.large.is_null() {
        (*self.large).prev = block;
      }
    }
    self.large = block;

    self.stats.large_mapped += 1;
    self.stats.live_large += 1;
    self.stats.mapped_bytes += total;
    Some(block)
  }

  unsafe fn release_large<P: PageSource>(&mut self, pages: &P, block: *mut BlockHeader) {
    let total = unsafe { (*block).size } + HEADER_SIZE;
    unsafe {
      let next = (*block).next;
      let prev = (*block).prev;
      if prev.is_null() {
        self.large = next;
      } else {
        (*prev).next = next;
      }
      if !next.is_null() {
        (*next).prev = prev;
      }
      pages.unmap(NonNull::new_unchecked(block as *mut u8), total);
    }

    self.stats.large_unmapped += 1;
    self.stats.live_large -= 1;
    self.stats.mapped_bytes -= total;
  }
}

// =============================================================================
// Heap
// =============================================================================

/// A size-class heap drawing its memory from `P`.
///
/// Every operation takes the heap lock for its whole duration.
pub struct Heap<P: PageSource> {
  state: Locked<HeapState>,
  pages: P,
}

impl<P: PageSource> Heap<P> {
  pub const fn with_pages(pages: P) -> Self {
    Self {
      state: Locked::new(HeapState::new()),
      pages,
    }
  }

  /// Allocates at least `size` bytes, 16-byte aligned. `None` for zero-size requests or
  /// when the page source refuses to map.
  pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
    self.state.lock().allocate(&self.pages, size)
  }

  /// Releases a block. Null is ignored.
  ///
  /// `ptr` must come from this heap and must not have been released already.
  pub unsafe fn release(&self, ptr: *mut u8) {
    let Some(ptr) = NonNull::new(ptr) else {
      return;
    };
    unsafe { self.state.lock().release(&self.pages, ptr) };
  }

  /// Resizes a block to hold at least `new_size` bytes.
  ///
  /// Null behaves like [`Heap::allocate`]. A zero size releases the block. A size the
  /// block already holds returns `ptr` itself; otherwise the contents move to a new
  /// block. When that allocation fails the old block is left untouched.
  pub unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
    let Some(ptr) = NonNull::new(ptr) else {
      return self.allocate(new_size);
    };

    let mut state = self.state.lock();
    if new_size == 0 {
      unsafe { state.release(&self.pages, ptr) };
      return None;
    }

    let old_size = unsafe { (*BlockHeader::from_payload(ptr.as_ptr())).size };
    if new_size <= old_size {
      return Some(ptr);
    }

    let moved = state.allocate(&self.pages, new_size)?;
    unsafe {
      ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), old_size);
      state.release(&self.pages, ptr);
    }
    Some(moved)
  }

  /// Allocates `count * elem_size` zeroed bytes. The product wraps on overflow.
  pub fn allocate_zeroed(&self, count: usize, elem_size: usize) -> Option<NonNull<u8>> {
    let total = count.wrapping_mul(elem_size);
    let ptr = self.allocate(total)?;
    unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
    Some(ptr)
  }

  /// Payload capacity of a live block, 0 for null.
  pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
    if ptr.is_null() {
      return 0;
    }
    let _state = self.state.lock();
    unsafe { (*BlockHeader::from_payload(ptr)).size }
  }

  pub fn stats(&self) -> HeapStats {
    self.state.lock().stats
  }
}

// =============================================================================
// Process-wide heap
// =============================================================================

static HEAP: Heap<OsPages> = Heap::with_pages(OsPages);

#[inline]
fn into_raw(ptr: Option<NonNull<u8>>) -> *mut u8 {
  ptr.map_or(null_mut(), NonNull::as_ptr)
}

/// Allocates `size` bytes from the process-wide heap. Null on failure or zero size.
pub fn allocate(size: usize) -> *mut u8 {
  into_raw(HEAP.allocate(size))
}

/// Releases a block from the process-wide heap. Null is ignored.
///
/// `ptr` must come from this heap and must not have been released already; anything
/// else corrupts the heap.
pub unsafe fn release(ptr: *mut u8) {
  unsafe { HEAP.release(ptr) }
}

/// Resizes a block of the process-wide heap, see [`Heap::resize`]. A zero size releases
/// `ptr` and returns null; a failed growth returns null and leaves `ptr` valid. Same
/// pointer contract as [`release`].
pub unsafe fn resize(ptr: *mut u8, new_size: usize) -> *mut u8 {
  into_raw(unsafe { HEAP.resize(ptr, new_size) })
}

/// Allocates `count * elem_size` zeroed bytes. The product wraps on overflow.
pub fn allocate_zeroed(count: usize, elem_size: usize) -> *mut u8 {
  into_raw(HEAP.allocate_zeroed(count, elem_size))
}

/// Payload capacity of a live block, 0 for null. Same pointer contract as [`release`].
pub unsafe fn usable_size(ptr: *mut u8) -> usize {
  unsafe { HEAP.usable_size(ptr) }
}

/// Mapping counters of the process-wide heap.
pub fn stats() -> HeapStats {
  HEAP.stats()
}

// =============================================================================
// GlobalAlloc
// =============================================================================

pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() > MAX_ALIGN {
      return null_mut();
    }
    allocate(layout.size().max(1))
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { release(ptr) }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() > MAX_ALIGN {
      return null_mut();
    }
    unsafe { resize(ptr, new_size.max(1)) }
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() > MAX_ALIGN {
      return null_mut();
    }
    allocate_zeroed(1, layout.size().max(1))
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  allocate(size)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { release(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  allocate_zeroed(nmemb, size)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  unsafe { resize(ptr, size) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  unsafe { usable_size(ptr) }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

// =============================================================================
// Size Classes
// =============================================================================

/// Sub-class multipliers for the geometric range (scaled by 16 for integer math).
/// Each represents a fraction of the doubling: 1.0, 1.19, 1.44, 1.69
const GEO_MULTIPLIERS: [usize; 4] = [16, 19, 23, 27];

#[inline(always)]
fn classify(size: usize) -> SizeCategory {
  if size <= TINY_MAX_SIZE {
    SizeCategory::Tiny
  } else if size <= SMALL_MAX_SIZE {
    SizeCategory::Small
  } else {
    SizeCategory::Large
  }
}

/// Convert class index to slot size (inverse of `size_to_class`).
#[inline(always)]
const fn class_to_size(class: usize) -> usize {
  if class < TINY_CLASSES {
    (class + 1) * TINY_STEP
  } else {
    // Geometric index 1 is the first step past TINY_MAX_SIZE.
    let geo_index = class - TINY_CLASSES + 1;
    let order = geo_index / CLASSES_PER_DOUBLING;
    let sub = geo_index % CLASSES_PER_DOUBLING;

    let base = TINY_MAX_SIZE << order;
    align_up((base * GEO_MULTIPLIERS[sub]) / 16, 16)
  }
}

/// Smallest class whose slot holds `size`. `size` must be in `1..=SMALL_MAX_SIZE`.
#[inline(always)]
fn size_to_class(size: usize) -> usize {
  debug_assert!(
    size > 0 && size <= SMALL_MAX_SIZE,
    "size_to_class: {size} out of range"
  );

  // Linear range: ceil(size / 16) - 1
  if size <= TINY_MAX_SIZE {
    return (size - 1) / TINY_STEP;
  }

  // Geometric range: find order via log2, then sub-class via thresholds
  let log2 = (usize::BITS as usize - 1) - size.leading_zeros() as usize;
  let order = log2 - TINY_MAX_SIZE.trailing_zeros() as usize;
  let base = TINY_MAX_SIZE << order;

  let t0 = base;
  let t1 = align_up((base * GEO_MULTIPLIERS[1]) >> 4, 16);
  let t2 = align_up((base * GEO_MULTIPLIERS[2]) >> 4, 16);
  let t3 = align_up((base * GEO_MULTIPLIERS[3]) >> 4, 16);

  // Count exceeded thresholds
  let exceeded =
    (size > t0) as usize + (size > t1) as usize + (size > t2) as usize + (size > t3) as usize;

  // If exceeded == 4, bump to next order
  let order_bump = exceeded >> 2;
  let sub = exceeded & 3;

  let geo_index = (order + order_bump) * CLASSES_PER_DOUBLING + sub;
  TINY_CLASSES + geo_index - 1
}

/// Largest class whose slot fits inside a free block of `size` bytes. Free blocks live
/// on this class's list, so anything popped from a class list can serve that class.
#[inline(always)]
fn class_floor(size: usize) -> usize {
  debug_assert!(size >= TINY_STEP, "class_floor: free block of {size} bytes");
  if size >= SMALL_MAX_SIZE {
    return NUM_SIZE_CLASSES - 1;
  }
  let class = size_to_class(size);
  if class_to_size(class) == size { class } else { class - 1 }
}

// =============================================================================
// Tests
// =============================================================================
