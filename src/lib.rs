//! Segregated free-list heap allocator with boundary-tag coalescing.
//!
//! A [`Heap`] manages one growable [`MemoryRegion`]. Every block carries its size and
//! allocated bit twice, in a header word before the payload and a footer word after
//! it, so both neighbors of a block are found in O(1). Free blocks are kept in nine
//! size-class buckets, each a doubly linked list sorted by ascending size.
//!
//! ```text
//!   Region layout after init:
//!
//!   ┌──────────────────────────┬─────┬──────────┬───────────────────────┬─────┐
//!   │ bucket table (9 × 2 w)   │ pad │ prologue │ blocks ...            │ epi │
//!   │ pred/succ sentinel nodes │     │ hdr  ftr │ hdr payload... ftr    │ hdr │
//!   └──────────────────────────┴─────┴──────────┴───────────────────────┴─────┘
//!
//!   Free block:      [ size|0 ][ pred ][ succ ] ...unused... [ size|0 ]
//!   Allocated block: [ size|1 ][ payload .................... ][ size|1 ]
//!                               ▲
//!                               └── pointer returned to the caller
//! ```
//!
//! The engine is single-threaded and never returns memory to its region. Use
//! [`GlobalHeap`] for a lock-guarded `GlobalAlloc` over a process-wide instance,
//! for example as the `#[global_allocator]`.
//!
//! # Logging under `#[global_allocator]`
//!
//! The heap emits its log records (`trace`/`debug` per call, `warn` when the
//! region is exhausted) from inside [`GlobalHeap`]'s lock, and that lock is not
//! reentrant. When `GlobalHeap` is the global allocator, any logger that
//! allocates while handling a record deadlocks on the first one. Install no
//! logger, filter the `segalloc` target out, or use one that never allocates.
#![allow(clippy::missing_safety_doc)]

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::UnsafeCell,
  fmt, hint,
  mem::size_of,
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicBool, Ordering},
};

mod region;

pub use region::{DEFAULT_CAPACITY, MemoryRegion, MmapRegion};

// =============================================================================
// Constants
// =============================================================================

/// Width of one header, footer or link slot.
pub const WORD_SIZE: usize = 8;
/// Every block size and payload address is a multiple of this.
pub const ALIGNMENT: usize = 8;
/// Header, footer and both free-list links.
pub const MIN_BLOCK_SIZE: usize = 4 * WORD_SIZE;
/// Default amount the region grows by when no free block fits.
pub const CHUNK_SIZE: usize = 1 << 12;
/// Number of size-class buckets.
pub const BUCKET_COUNT: usize = 9;

/// Inclusive upper bound of every bucket but the last, which is unbounded.
const BUCKET_LIMITS: [usize; BUCKET_COUNT - 1] = [32, 64, 128, 256, 512, 1024, 2048, 4096];

/// A bucket sentinel is a bare `pred`/`succ` pair with no tags.
const BUCKET_NODE_SIZE: usize = 2 * WORD_SIZE;
const BUCKET_TABLE_SIZE: usize = BUCKET_COUNT * BUCKET_NODE_SIZE;
const PROLOGUE_SIZE: usize = 2 * WORD_SIZE;
/// Bucket table, one pad word, prologue header and footer, epilogue header.
const INITIAL_SIZE: usize = BUCKET_TABLE_SIZE + 4 * WORD_SIZE;
/// Header plus footer.
const TAG_OVERHEAD: usize = 2 * WORD_SIZE;

/// Process-wide heap reservation for [`GlobalHeap`].
const GLOBAL_CAPACITY: usize = 1 << 30; // 1GB

const ALLOCATED_BIT: u64 = 0x1;
const SIZE_MASK: u64 = !0x7;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(WORD_SIZE >= size_of::<usize>());
const _: () = assert!(WORD_SIZE >= size_of::<*mut u8>());
const _: () = assert!(MIN_BLOCK_SIZE % ALIGNMENT == 0);
const _: () = assert!(CHUNK_SIZE % ALIGNMENT == 0);
const _: () = assert!(CHUNK_SIZE >= MIN_BLOCK_SIZE);
const _: () = assert!(INITIAL_SIZE % ALIGNMENT == 0);
const _: () = assert!(BUCKET_LIMITS[0] == MIN_BLOCK_SIZE);

// =============================================================================
// Errors
// =============================================================================

/// Why an allocation request could not be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
  #[error("zero-sized request")]
  ZeroSize,
  #[error("requested size overflows the address space")]
  SizeOverflow,
  #[error("memory region cannot grow")]
  OutOfMemory,
  #[error("memory region base is not word aligned")]
  MisalignedRegion,
  #[error("memory region could not be reserved")]
  RegionUnavailable,
}

/// First inconsistency found by [`Heap::validate`].
///
/// Offsets are in bytes from the region's low bound to the offending block's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeapViolation {
  #[error("block at offset {offset} is not word aligned")]
  Misaligned { offset: usize },
  #[error("block at offset {offset} has header {header:#x} but footer {footer:#x}")]
  TagMismatch {
    offset: usize,
    header: u64,
    footer: u64,
  },
  #[error("block at offset {offset} has impossible size {size}")]
  BadSize { offset: usize, size: usize },
  #[error("free block at offset {offset} follows another free block")]
  AdjacentFree { offset: usize },
  #[error("prologue block is corrupted")]
  BadPrologue,
  #[error("epilogue at offset {offset} is corrupted or misplaced")]
  BadEpilogue { offset: usize },
  #[error("address at offset {offset} lies outside the region")]
  OutOfBounds { offset: usize },
  #[error("free block at offset {offset} of size {size} is listed in bucket {bucket}")]
  WrongBucket {
    offset: usize,
    size: usize,
    bucket: usize,
  },
  #[error("free block at offset {offset} has an inconsistent predecessor link")]
  BrokenLink { offset: usize },
  #[error("allocated block at offset {offset} is on a free list")]
  AllocatedInFreeList { offset: usize },
  #[error("bucket {bucket} is out of order at offset {offset}")]
  Unsorted { offset: usize, bucket: usize },
  #[error("bucket {bucket} does not terminate")]
  ListCycle { bucket: usize },
  #[error("{walked} free blocks in the heap but {listed} on the free lists")]
  FreeCountMismatch { walked: usize, listed: usize },
}

// =============================================================================
// Block Layout
// =============================================================================

#[inline(always)]
const fn pack(size: usize, allocated: bool) -> u64 {
  size as u64 | allocated as u64
}

#[inline(always)]
const fn tag_size(tag: u64) -> usize {
  (tag & SIZE_MASK) as usize
}

#[inline(always)]
const fn tag_allocated(tag: u64) -> bool {
  tag & ALLOCATED_BIT != 0
}

#[inline(always)]
unsafe fn read_word(p: *mut u8) -> u64 {
  unsafe { p.cast::<u64>().read() }
}

#[inline(always)]
unsafe fn write_word(p: *mut u8, value: u64) {
  unsafe { p.cast::<u64>().write(value) }
}

/// A block, addressed by its payload pointer.
///
/// The accessors below are the only code that turns a block into header, footer,
/// link or neighbor addresses. Address computation is wrapping and safe; every read
/// or write is `unsafe` and requires the block to lie inside a live heap.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Block(*mut u8);

impl Block {
  #[inline(always)]
  fn header(self) -> *mut u8 {
    self.0.wrapping_sub(WORD_SIZE)
  }

  #[inline(always)]
  unsafe fn tag(self) -> u64 {
    unsafe { read_word(self.header()) }
  }

  #[inline(always)]
  unsafe fn size(self) -> usize {
    tag_size(unsafe { self.tag() })
  }

  #[inline(always)]
  unsafe fn is_allocated(self) -> bool {
    tag_allocated(unsafe { self.tag() })
  }

  /// Located through the size recorded in the header.
  #[inline(always)]
  unsafe fn footer(self) -> *mut u8 {
    self
      .0
      .wrapping_add(unsafe { self.size() })
      .wrapping_sub(TAG_OVERHEAD)
  }

  #[inline(always)]
  unsafe fn write_header(self, size: usize, allocated: bool) {
    unsafe { write_word(self.header(), pack(size, allocated)) }
  }

  /// Must follow `write_header` with the same size.
  #[inline(always)]
  unsafe fn write_footer(self, size: usize, allocated: bool) {
    debug_assert_eq!(unsafe { self.size() }, size);
    unsafe { write_word(self.footer(), pack(size, allocated)) }
  }

  #[inline(always)]
  unsafe fn write_tags(self, size: usize, allocated: bool) {
    unsafe {
      self.write_header(size, allocated);
      self.write_footer(size, allocated);
    }
  }

  #[inline(always)]
  unsafe fn next_neighbor(self) -> Block {
    Block(self.0.wrapping_add(unsafe { self.size() }))
  }

  /// Reads the previous block's footer, which sits right before our header.
  #[inline(always)]
  unsafe fn prev_neighbor(self) -> Block {
    let prev_size = tag_size(unsafe { read_word(self.0.wrapping_sub(TAG_OVERHEAD)) });
    Block(self.0.wrapping_sub(prev_size))
  }

  #[inline(always)]
  unsafe fn pred(self) -> Option<Block> {
    NonNull::new(unsafe { self.0.cast::<*mut u8>().read() }).map(|p| Block(p.as_ptr()))
  }

  #[inline(always)]
  unsafe fn succ(self) -> Option<Block> {
    let slot = self.0.wrapping_add(WORD_SIZE);
    NonNull::new(unsafe { slot.cast::<*mut u8>().read() }).map(|p| Block(p.as_ptr()))
  }

  #[inline(always)]
  unsafe fn set_pred(self, pred: Option<Block>) {
    unsafe { self.0.cast::<*mut u8>().write(pred.map_or(null_mut(), |b| b.0)) }
  }

  #[inline(always)]
  unsafe fn set_succ(self, succ: Option<Block>) {
    let slot = self.0.wrapping_add(WORD_SIZE);
    unsafe { slot.cast::<*mut u8>().write(succ.map_or(null_mut(), |b| b.0)) }
  }

  #[inline(always)]
  fn payload(self) -> NonNull<u8> {
    debug_assert!(!self.0.is_null());
    // SAFETY: blocks are only ever built from region addresses or caller payloads.
    unsafe { NonNull::new_unchecked(self.0) }
  }
}

// =============================================================================
// Size Classes
// =============================================================================

/// Bucket index for a block of `size` bytes.
///
/// Buckets cover `..=32`, `33..=64`, ... `2049..=4096` and `4097..`.
#[inline]
pub const fn bucket_of(size: usize) -> usize {
  let mut bucket = 0;
  while bucket < BUCKET_LIMITS.len() {
    if size <= BUCKET_LIMITS[bucket] {
      return bucket;
    }
    bucket += 1;
  }
  BUCKET_COUNT - 1
}

/// Block size needed to serve a `request`-byte payload: the minimum block for
/// anything that fits in one word, otherwise payload plus tags rounded to
/// [`ALIGNMENT`]. `None` on overflow.
#[inline]
pub const fn adjusted_size(request: usize) -> Option<usize> {
  if request <= WORD_SIZE {
    return Some(MIN_BLOCK_SIZE);
  }
  match request.checked_add(TAG_OVERHEAD + ALIGNMENT - 1) {
    Some(padded) => Some(padded & !(ALIGNMENT - 1)),
    None => None,
  }
}

// =============================================================================
// Heap
// =============================================================================

/// Allocator state for one region: where the bucket table and the prologue live.
///
/// Exactly one `Heap` may manage a given region. It is not `Sync`; wrap it (see
/// [`GlobalHeap`]) if it has to be shared.
pub struct Heap<R: MemoryRegion = MmapRegion> {
  region: R,
  buckets: *mut u8,
  prologue: Block,
}

impl Heap<MmapRegion> {
  /// Heap over a fresh [`MmapRegion`] of [`DEFAULT_CAPACITY`] bytes.
  pub fn new() -> Result<Self, AllocError> {
    Self::init(MmapRegion::new()?)
  }
}

impl<R: MemoryRegion> Heap<R> {
  /// Lays out the bucket table, prologue and epilogue at the region's current end,
  /// then grows it by [`CHUNK_SIZE`].
  pub fn init(mut region: R) -> Result<Self, AllocError> {
    let start = region
      .extend(INITIAL_SIZE)
      .ok_or(AllocError::OutOfMemory)?
      .as_ptr();
    if start as usize % ALIGNMENT != 0 {
      return Err(AllocError::MisalignedRegion);
    }

    let prologue = unsafe {
      // Null links: every bucket starts out as a lone sentinel.
      ptr::write_bytes(start, 0, BUCKET_TABLE_SIZE);

      let base = start.add(BUCKET_TABLE_SIZE);
      write_word(base, 0);
      write_word(base.add(WORD_SIZE), pack(PROLOGUE_SIZE, true));
      write_word(base.add(2 * WORD_SIZE), pack(PROLOGUE_SIZE, true));
      write_word(base.add(3 * WORD_SIZE), pack(0, true));
      Block(base.add(2 * WORD_SIZE))
    };

    let mut heap = Self {
      region,
      buckets: start,
      prologue,
    };
    unsafe { heap.extend_heap(CHUNK_SIZE)? };

    log::debug!(
      "heap initialised at {:p}, {} bytes",
      heap.region.low_bound(),
      heap.heap_size()
    );
    heap.after_mutation("init");
    Ok(heap)
  }

  pub fn region(&self) -> &R {
    &self.region
  }

  pub fn into_region(self) -> R {
    self.region
  }

  /// Bytes currently owned by the region, bookkeeping included.
  pub fn heap_size(&self) -> usize {
    self.region.size()
  }

  #[inline(always)]
  fn bucket_head(&self, bucket: usize) -> Block {
    debug_assert!(bucket < BUCKET_COUNT);
    Block(self.buckets.wrapping_add(bucket * BUCKET_NODE_SIZE))
  }

  #[inline(always)]
  fn first_block(&self) -> Block {
    Block(self.prologue.0.wrapping_add(PROLOGUE_SIZE))
  }

  #[inline(always)]
  fn offset_of(&self, block: Block) -> usize {
    (block.0 as usize).wrapping_sub(self.region.low_bound() as usize)
  }

  #[inline]
  fn after_mutation(&self, op: &str) {
    #[cfg(feature = "check-heap")]
    if let Err(violation) = self.check_heap(op) {
      panic!("heap corrupted after {op}: {violation}");
    }
    #[cfg(not(feature = "check-heap"))]
    let _ = op;
  }
}

// =============================================================================
// Free Lists
// =============================================================================

impl<R: MemoryRegion> Heap<R> {
  /// Links `block` into its bucket in ascending size order and marks it free.
  ///
  /// Equal sizes go in front of the existing run.
  unsafe fn insert(&mut self, block: Block) {
    unsafe {
      let size = block.size();
      block.write_tags(size, false);

      let mut pred = self.bucket_head(bucket_of(size));
      let mut succ = pred.succ();
      while let Some(next) = succ
        && next.size() < size
      {
        pred = next;
        succ = next.succ();
      }

      block.set_pred(Some(pred));
      block.set_succ(succ);
      pred.set_succ(Some(block));
      if let Some(next) = succ {
        next.set_pred(Some(block));
      }
    }
  }

  /// Unlinks `block` from its bucket and marks it allocated.
  ///
  /// `block` must currently be on a free list; its predecessor is never null
  /// thanks to the bucket sentinels.
  unsafe fn remove(&mut self, block: Block) {
    unsafe {
      let size = block.size();
      block.write_tags(size, true);

      let pred = block.pred();
      let succ = block.succ();
      debug_assert!(pred.is_some(), "remove: block {:p} is not listed", block.0);
      if let Some(pred) = pred {
        pred.set_succ(succ);
      }
      if let Some(succ) = succ {
        succ.set_pred(pred);
      }
    }
  }

  /// First block of at least `asize` bytes, searching buckets upwards from
  /// `bucket_of(asize)`. Lists are sorted, so the hit is the best fit of its bucket.
  unsafe fn find_fit(&self, asize: usize) -> Option<Block> {
    for bucket in bucket_of(asize)..BUCKET_COUNT {
      let mut cursor = unsafe { self.bucket_head(bucket).succ() };
      while let Some(block) = cursor {
        if unsafe { block.size() } >= asize {
          return Some(block);
        }
        cursor = unsafe { block.succ() };
      }
    }
    None
  }
}

// =============================================================================
// Allocation
// =============================================================================

impl<R: MemoryRegion> Heap<R> {
  /// Allocates a block with at least `size` payload bytes, aligned to [`ALIGNMENT`].
  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    if size == 0 {
      return Err(AllocError::ZeroSize);
    }
    let asize = adjusted_size(size).ok_or(AllocError::SizeOverflow)?;

    let block = match unsafe { self.find_fit(asize) } {
      Some(block) => block,
      None => unsafe { self.extend_heap(asize.max(CHUNK_SIZE))? },
    };
    unsafe { self.place(block, asize) };

    log::trace!("allocate({size}) asize={asize} -> {:p}", block.0);
    self.after_mutation("allocate");
    Ok(block.payload())
  }

  /// Returns a block to the heap, merging it with free neighbors. `None` is a no-op.
  ///
  /// # Safety
  ///
  /// `ptr` must come from this heap and must not have been released since.
  pub unsafe fn release(&mut self, ptr: Option<NonNull<u8>>) {
    let Some(ptr) = ptr else {
      return;
    };
    let block = Block(ptr.as_ptr());
    debug_assert!(unsafe { block.is_allocated() }, "release: {ptr:p} is not allocated");

    log::trace!("release({ptr:p}) size={}", unsafe { block.size() });
    unsafe { self.coalesce(block) };
    self.after_mutation("release");
  }

  /// Moves an allocation to a block of `new_size` bytes, keeping the first
  /// `min(old, new_size)` payload bytes.
  ///
  /// A zero `new_size` releases `ptr` and yields `Ok(None)`; a `None` pointer
  /// allocates. On failure the original block is left untouched.
  ///
  /// # Safety
  ///
  /// Same contract as [`Heap::release`].
  pub unsafe fn resize(
    &mut self,
    ptr: Option<NonNull<u8>>,
    new_size: usize,
  ) -> Result<Option<NonNull<u8>>, AllocError> {
    if new_size == 0 {
      unsafe { self.release(ptr) };
      return Ok(None);
    }

    let Some(old) = ptr else {
      return self.allocate(new_size).map(Some);
    };

    let new = self.allocate(new_size)?;
    unsafe {
      let len = self.usable_size(old).min(new_size);
      ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), len);
      self.release(Some(old));
    }

    log::trace!("resize({old:p}, {new_size}) -> {new:p}");
    Ok(Some(new))
  }

  /// Allocates `count * element_size` bytes, all zero.
  pub fn allocate_zeroed(
    &mut self,
    count: usize,
    element_size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    let bytes = count
      .checked_mul(element_size)
      .ok_or(AllocError::SizeOverflow)?;
    let ptr = self.allocate(bytes)?;
    unsafe { ptr::write_bytes(ptr.as_ptr(), 0, bytes) };
    Ok(ptr)
  }

  /// Payload bytes available behind `ptr`, which may exceed what was requested.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation of this heap.
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    unsafe { Block(ptr.as_ptr()).size() - TAG_OVERHEAD }
  }

  /// Grows the region by at least `bytes` and returns the resulting free block,
  /// already merged with a free block that ended at the old epilogue.
  unsafe fn extend_heap(&mut self, bytes: usize) -> Result<Block, AllocError> {
    let size = align_up(bytes.max(MIN_BLOCK_SIZE), ALIGNMENT);

    let Some(old_end) = self.region.extend(size) else {
      log::warn!("region refused to grow by {size} bytes");
      return Err(AllocError::OutOfMemory);
    };
    log::debug!("heap grown by {size} bytes, now {} bytes", self.heap_size());

    unsafe {
      // The old epilogue header becomes the new block's header.
      let block = Block(old_end.as_ptr());
      block.write_tags(size, false);
      block.next_neighbor().write_header(0, true);
      Ok(self.coalesce(block))
    }
  }

  /// Merges `block` with whichever immediate neighbors are free and lists the result.
  ///
  /// Free blocks are never adjacent, so one step in each direction is enough.
  unsafe fn coalesce(&mut self, block: Block) -> Block {
    unsafe {
      let prev = block.prev_neighbor();
      let next = block.next_neighbor();
      let mut size = block.size();

      let merged = match (prev.is_allocated(), next.is_allocated()) {
        (true, true) => block,
        (true, false) => {
          self.remove(next);
          size += next.size();
          block.write_tags(size, false);
          block
        }
        (false, true) => {
          self.remove(prev);
          size += prev.size();
          prev.write_tags(size, false);
          prev
        }
        (false, false) => {
          self.remove(prev);
          self.remove(next);
          size += prev.size() + next.size();
          prev.write_tags(size, false);
          prev
        }
      };

      self.insert(merged);
      merged
    }
  }

  /// Takes `block` off its list and splits off the tail when at least a minimum
  /// block would remain.
  unsafe fn place(&mut self, block: Block, asize: usize) {
    unsafe {
      let remainder = block.size() - asize;
      self.remove(block);

      if remainder >= MIN_BLOCK_SIZE {
        block.write_tags(asize, true);
        let rest = block.next_neighbor();
        rest.write_tags(remainder, false);
        self.insert(rest);
      }
    }
  }
}

// =============================================================================
// Diagnostics
// =============================================================================

/// One block as seen by [`Heap::blocks`] or [`Heap::free_list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
  pub payload: NonNull<u8>,
  /// Payload offset from the region's low bound.
  pub offset: usize,
  /// Whole block size, tags included.
  pub size: usize,
  pub allocated: bool,
}

/// Aggregate view of the block chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub heap_size: usize,
  pub allocated_blocks: usize,
  pub allocated_bytes: usize,
  pub free_blocks: usize,
  pub free_bytes: usize,
  pub largest_free: usize,
}

impl fmt::Display for HeapStats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "heap {} bytes: {} allocated ({} bytes), {} free ({} bytes, largest {})",
      self.heap_size,
      self.allocated_blocks,
      self.allocated_bytes,
      self.free_blocks,
      self.free_bytes,
      self.largest_free
    )
  }
}

/// Iterator over the block chain, prologue and epilogue excluded.
pub struct Blocks<'a, R: MemoryRegion> {
  heap: &'a Heap<R>,
  cursor: Block,
}

impl<R: MemoryRegion> Iterator for Blocks<'_, R> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    let block = self.cursor;
    let size = unsafe { block.size() };
    if size == 0 {
      return None;
    }
    self.cursor = unsafe { block.next_neighbor() };
    Some(self.heap.info(block))
  }
}

/// Iterator over one bucket's free list, smallest block first.
pub struct FreeList<'a, R: MemoryRegion> {
  heap: &'a Heap<R>,
  cursor: Option<Block>,
}

impl<R: MemoryRegion> Iterator for FreeList<'_, R> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    let block = self.cursor?;
    self.cursor = unsafe { block.succ() };
    Some(self.heap.info(block))
  }
}

impl<R: MemoryRegion> Heap<R> {
  fn info(&self, block: Block) -> BlockInfo {
    let tag = unsafe { block.tag() };
    BlockInfo {
      payload: block.payload(),
      offset: self.offset_of(block),
      size: tag_size(tag),
      allocated: tag_allocated(tag),
    }
  }

  /// Walks the block chain. Only meaningful on a heap that passes [`Heap::validate`].
  pub fn blocks(&self) -> Blocks<'_, R> {
    Blocks {
      heap: self,
      cursor: self.first_block(),
    }
  }

  /// Walks the free list of `bucket`.
  ///
  /// # Panics
  ///
  /// If `bucket >= BUCKET_COUNT`.
  pub fn free_list(&self, bucket: usize) -> FreeList<'_, R> {
    assert!(bucket < BUCKET_COUNT, "bucket {bucket} out of range");
    FreeList {
      heap: self,
      cursor: unsafe { self.bucket_head(bucket).succ() },
    }
  }

  pub fn stats(&self) -> HeapStats {
    let mut stats = HeapStats {
      heap_size: self.heap_size(),
      ..HeapStats::default()
    };
    for block in self.blocks() {
      if block.allocated {
        stats.allocated_blocks += 1;
        stats.allocated_bytes += block.size;
      } else {
        stats.free_blocks += 1;
        stats.free_bytes += block.size;
        stats.largest_free = stats.largest_free.max(block.size);
      }
    }
    stats
  }

  /// Logs every block and every free list at `debug` level.
  pub fn dump(&self) {
    if !log::log_enabled!(log::Level::Debug) {
      return;
    }

    log::debug!("{}", self.stats());
    for (n, block) in self.blocks().enumerate() {
      log::debug!(
        "block {n:4} offset {:8} size {:6} {}",
        block.offset,
        block.size,
        if block.allocated { "allocated" } else { "free" }
      );
    }
    for bucket in 0..BUCKET_COUNT {
      for block in self.free_list(bucket) {
        log::debug!(
          "bucket {bucket} offset {:8} size {:6}",
          block.offset,
          block.size
        );
      }
    }
  }
}

// =============================================================================
// Heap Validator
// =============================================================================

impl<R: MemoryRegion> Heap<R> {
  /// Checks every block and every free list, returning the first inconsistency.
  ///
  /// Never mutates the heap. Reads are bounds-checked against the region before
  /// they happen, so a corrupted heap is reported rather than walked off.
  pub fn validate(&self) -> Result<(), HeapViolation> {
    let lo = self.region.low_bound() as usize;
    let hi = self.region.high_bound() as usize;
    let table_end = self.buckets as usize + BUCKET_TABLE_SIZE;
    if (self.buckets as usize) < lo {
      return Err(HeapViolation::OutOfBounds { offset: 0 });
    }

    unsafe {
      if self.prologue.tag() != pack(PROLOGUE_SIZE, true)
        || read_word(self.prologue.0) != pack(PROLOGUE_SIZE, true)
      {
        return Err(HeapViolation::BadPrologue);
      }
    }

    // Block chain.
    let mut walked = 0usize;
    let mut prev_allocated = true;
    let mut block = self.first_block();
    let epilogue = loop {
      let addr = block.0 as usize;
      let offset = self.offset_of(block);
      if addr < table_end + WORD_SIZE || addr > hi {
        return Err(HeapViolation::OutOfBounds { offset });
      }
      if addr % ALIGNMENT != 0 {
        return Err(HeapViolation::Misaligned { offset });
      }

      let header = unsafe { block.tag() };
      let size = tag_size(header);
      if size == 0 {
        break block;
      }
      if size < MIN_BLOCK_SIZE {
        return Err(HeapViolation::BadSize { offset, size });
      }
      if size > hi - addr {
        return Err(HeapViolation::OutOfBounds { offset });
      }

      let footer = unsafe { read_word(block.footer()) };
      if header != footer {
        return Err(HeapViolation::TagMismatch {
          offset,
          header,
          footer,
        });
      }

      let allocated = tag_allocated(header);
      if !allocated {
        if !prev_allocated {
          return Err(HeapViolation::AdjacentFree { offset });
        }
        walked += 1;
      }
      prev_allocated = allocated;
      block = Block(block.0.wrapping_add(size));
    };

    let offset = self.offset_of(epilogue);
    if unsafe { epilogue.tag() } != pack(0, true) || epilogue.0 as usize != hi {
      return Err(HeapViolation::BadEpilogue { offset });
    }

    // Free lists.
    let mut listed = 0usize;
    for bucket in 0..BUCKET_COUNT {
      let mut pred = self.bucket_head(bucket);
      let mut prev_size = 0;
      let mut in_bucket = 0usize;
      let mut cursor = unsafe { pred.succ() };

      while let Some(block) = cursor {
        let addr = block.0 as usize;
        let offset = self.offset_of(block);
        if addr < table_end + WORD_SIZE || addr >= hi {
          return Err(HeapViolation::OutOfBounds { offset });
        }
        if addr % ALIGNMENT != 0 {
          return Err(HeapViolation::Misaligned { offset });
        }

        in_bucket += 1;
        if in_bucket > walked {
          return Err(HeapViolation::ListCycle { bucket });
        }

        let tag = unsafe { block.tag() };
        let size = tag_size(tag);
        if tag_allocated(tag) {
          return Err(HeapViolation::AllocatedInFreeList { offset });
        }
        if bucket_of(size) != bucket {
          return Err(HeapViolation::WrongBucket {
            offset,
            size,
            bucket,
          });
        }
        if size < prev_size {
          return Err(HeapViolation::Unsorted { offset, bucket });
        }
        if unsafe { block.pred() } != Some(pred) {
          return Err(HeapViolation::BrokenLink { offset });
        }

        pred = block;
        prev_size = size;
        cursor = unsafe { block.succ() };
      }
      listed += in_bucket;
    }

    if listed != walked {
      return Err(HeapViolation::FreeCountMismatch { walked, listed });
    }
    Ok(())
  }

  /// [`Heap::validate`], logging the first violation together with `context`.
  pub fn check_heap(&self, context: impl fmt::Display) -> Result<(), HeapViolation> {
    self.validate().inspect_err(|violation| {
      log::error!("heap check failed ({context}): {violation}");
    })
  }
}

// =============================================================================
// GlobalAlloc
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
  fn lock(&self) -> SpinGuard<'_> {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
    SpinGuard { lock: self }
  }
}

/// Releases the lock on drop, including while unwinding.
struct SpinGuard<'a> {
  lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
  #[inline]
  fn drop(&mut self) {
    self.lock.locked.store(false, Ordering::Release);
  }
}

/// Process-wide heap behind a spin lock, created on first use over a 1 GiB
/// [`MmapRegion`] reservation. It can be installed with `#[global_allocator]`.
///
/// Layouts aligned above [`ALIGNMENT`] are served from an oversized block: the
/// payload is rounded up and the block's own payload pointer is stored in the
/// word just below it. See the crate docs for the logging caveat.
pub struct GlobalHeap {
  lock: SpinLock,
  heap: UnsafeCell<Option<Heap<MmapRegion>>>,
}

unsafe impl Sync for GlobalHeap {}

impl GlobalHeap {
  pub const fn new() -> Self {
    Self {
      lock: SpinLock::new(),
      heap: UnsafeCell::new(None),
    }
  }

  /// Runs `f` on the heap under the lock. `None` if the heap cannot be created.
  ///
  /// A panic in `f` unlocks the heap on its way out.
  pub fn with_heap<T>(&self, f: impl FnOnce(&mut Heap<MmapRegion>) -> T) -> Option<T> {
    let _guard = self.lock.lock();
    let slot = unsafe { &mut *self.heap.get() };
    if slot.is_none() {
      *slot = MmapRegion::with_capacity(GLOBAL_CAPACITY)
        .and_then(Heap::init)
        .ok();
    }
    slot.as_mut().map(f)
  }

  /// Discards the current heap and its region and starts over with a fresh one.
  ///
  /// # Safety
  ///
  /// Every pointer handed out so far becomes dangling.
  pub unsafe fn reset(&self) -> Result<(), AllocError> {
    let _guard = self.lock.lock();
    let slot = unsafe { &mut *self.heap.get() };
    *slot = None;
    let heap = MmapRegion::with_capacity(GLOBAL_CAPACITY).and_then(Heap::init)?;
    *slot = Some(heap);
    Ok(())
  }
}

impl Default for GlobalHeap {
  fn default() -> Self {
    Self::new()
  }
}

/// Allocates `layout` out of `heap`, honoring alignments above [`ALIGNMENT`].
fn allocate_layout<R: MemoryRegion>(heap: &mut Heap<R>, layout: Layout) -> Option<NonNull<u8>> {
  let size = layout.size().max(1);
  let align = layout.align();
  if align <= ALIGNMENT {
    return heap.allocate(size).ok();
  }

  // `align - WORD_SIZE` bytes of slack cover the worst rounding, plus one word
  // for the stashed block pointer.
  let raw = heap.allocate(size.checked_add(align)?).ok()?;
  let aligned = align_up(raw.as_ptr() as usize + WORD_SIZE, align);
  let ptr = raw.as_ptr().wrapping_add(aligned - raw.as_ptr() as usize);
  unsafe { ptr.cast::<*mut u8>().sub(1).write(raw.as_ptr()) };
  NonNull::new(ptr)
}

/// Payload pointer of the block behind `ptr` as handed out by [`allocate_layout`].
///
/// # Safety
///
/// `ptr` must come from [`allocate_layout`] with the same `layout`.
unsafe fn block_payload(ptr: NonNull<u8>, layout: Layout) -> NonNull<u8> {
  if layout.align() <= ALIGNMENT {
    return ptr;
  }
  unsafe { NonNull::new_unchecked(ptr.as_ptr().cast::<*mut u8>().sub(1).read()) }
}

unsafe impl GlobalAlloc for GlobalHeap {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    self
      .with_heap(|heap| allocate_layout(heap, layout))
      .flatten()
      .map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    let Some(ptr) = NonNull::new(ptr) else {
      return;
    };
    self.with_heap(|heap| unsafe { heap.release(Some(block_payload(ptr, layout))) });
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let Some(old) = NonNull::new(ptr) else {
      return null_mut();
    };

    if layout.align() <= ALIGNMENT {
      return self
        .with_heap(|heap| unsafe { heap.resize(Some(old), new_size.max(1)) }.ok())
        .flatten()
        .flatten()
        .map_or(null_mut(), NonNull::as_ptr);
    }

    let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
      return null_mut();
    };
    self
      .with_heap(|heap| {
        let new = allocate_layout(heap, new_layout)?;
        unsafe {
          ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), layout.size().min(new_size));
          heap.release(Some(block_payload(old, layout)));
        }
        Some(new)
      })
      .flatten()
      .map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() <= ALIGNMENT {
      return self
        .with_heap(|heap| heap.allocate_zeroed(1, layout.size().max(1)).ok())
        .flatten()
        .map_or(null_mut(), NonNull::as_ptr);
    }

    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr.write_bytes(0, layout.size()) };
    }
    ptr
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
static DRIVER_HEAP: GlobalHeap = GlobalHeap::new();

/// Starts a new trace on a fresh heap. 0 on success, -1 on failure.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mm_init() -> i32 {
  match unsafe { DRIVER_HEAP.reset() } {
    Ok(()) => 0,
    Err(_) => -1,
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mm_malloc(size: usize) -> *mut u8 {
  DRIVER_HEAP
    .with_heap(|heap| heap.allocate(size).ok())
    .flatten()
    .map_or(null_mut(), NonNull::as_ptr)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mm_free(ptr: *mut u8) {
  if ptr.is_null() {
    return;
  }
  DRIVER_HEAP.with_heap(|heap| unsafe { heap.release(NonNull::new(ptr)) });
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mm_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  DRIVER_HEAP
    .with_heap(|heap| unsafe { heap.resize(NonNull::new(ptr), size) }.ok())
    .flatten()
    .flatten()
    .map_or(null_mut(), NonNull::as_ptr)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mm_calloc(nmemb: usize, size: usize) -> *mut u8 {
  DRIVER_HEAP
    .with_heap(|heap| heap.allocate_zeroed(nmemb, size).ok())
    .flatten()
    .map_or(null_mut(), NonNull::as_ptr)
}

/// 0 when the heap is consistent, -1 otherwise. `line` is only used for the log record.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mm_checkheap(line: i32) -> i32 {
  match DRIVER_HEAP.with_heap(|heap| heap.check_heap(format_args!("line {line}"))) {
    Some(Ok(())) => 0,
    _ => -1,
  }
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
