//! Raw memory providers for [`Heap`](crate::Heap).
//!
//! A region is a single contiguous byte range that only ever grows at its high end.

use core::ptr::{NonNull, null_mut};

use crate::AllocError;

/// Reference maximum heap size (20 MiB).
pub const DEFAULT_CAPACITY: usize = 20 << 20;

/// A contiguous, growable byte range owned by exactly one heap.
///
/// `low_bound` must be aligned to [`ALIGNMENT`](crate::ALIGNMENT) and must not move
/// once the first `extend` succeeded.
pub trait MemoryRegion {
  /// Grows the region by `bytes`. Returns the old end, which is the first new byte,
  /// or `None` when the region cannot grow.
  fn extend(&mut self, bytes: usize) -> Option<NonNull<u8>>;

  /// First byte of the region.
  fn low_bound(&self) -> *mut u8;

  /// One past the last byte handed out so far.
  fn high_bound(&self) -> *mut u8;

  /// Bytes handed out so far.
  fn size(&self) -> usize {
    self.high_bound() as usize - self.low_bound() as usize
  }
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

// =============================================================================
// MmapRegion
// =============================================================================

/// Region backed by one up-front `mmap` reservation with a bump break.
///
/// Pages are only committed by the kernel when first touched, so a large
/// capacity costs address space, not memory.
pub struct MmapRegion {
  base: NonNull<u8>,
  brk: usize,
  capacity: usize,
}

impl MmapRegion {
  /// Reserves [`DEFAULT_CAPACITY`] bytes.
  pub fn new() -> Result<Self, AllocError> {
    Self::with_capacity(DEFAULT_CAPACITY)
  }

  /// Reserves `capacity` bytes. The region refuses to grow past it.
  pub fn with_capacity(capacity: usize) -> Result<Self, AllocError> {
    if capacity == 0 {
      return Err(AllocError::RegionUnavailable);
    }

    let raw = unsafe { os_mmap(capacity) };
    let base = NonNull::new(raw).ok_or(AllocError::RegionUnavailable)?;
    log::debug!("mmap region reserved {capacity} bytes at {raw:p}");

    Ok(Self {
      base,
      brk: 0,
      capacity,
    })
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }
}

impl MemoryRegion for MmapRegion {
  fn extend(&mut self, bytes: usize) -> Option<NonNull<u8>> {
    let new_brk = self.brk.checked_add(bytes)?;
    if new_brk > self.capacity {
      log::warn!(
        "mmap region exhausted: {} + {} exceeds capacity {}",
        self.brk,
        bytes,
        self.capacity
      );
      return None;
    }

    let old_end = unsafe { self.base.add(self.brk) };
    self.brk = new_brk;
    Some(old_end)
  }

  #[inline]
  fn low_bound(&self) -> *mut u8 {
    self.base.as_ptr()
  }

  #[inline]
  fn high_bound(&self) -> *mut u8 {
    unsafe { self.base.as_ptr().add(self.brk) }
  }
}

impl Drop for MmapRegion {
  fn drop(&mut self) {
    unsafe { os_munmap(self.base.as_ptr(), self.capacity) };
  }
}
