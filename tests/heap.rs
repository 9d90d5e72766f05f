//! Integration tests for the segregated free-list heap

use std::cell::Cell;
use std::ptr::NonNull;
use std::rc::Rc;

use segalloc::{
  AllocError, BUCKET_COUNT, CHUNK_SIZE, Heap, HeapViolation, MIN_BLOCK_SIZE, MemoryRegion,
  MmapRegion, WORD_SIZE, adjusted_size, bucket_of,
};

/// Word-aligned region over a fixed buffer that can be told to refuse growth.
struct BufferRegion {
  _buf: Vec<u64>,
  base: *mut u8,
  brk: usize,
  capacity: usize,
  refuse: Rc<Cell<bool>>,
}

impl BufferRegion {
  fn new(capacity: usize, skew: usize) -> (Self, Rc<Cell<bool>>) {
    let mut buf = vec![0u64; capacity.div_ceil(8) + 1];
    let base = unsafe { buf.as_mut_ptr().cast::<u8>().add(skew) };
    let refuse = Rc::new(Cell::new(false));
    let region = Self {
      _buf: buf,
      base,
      brk: 0,
      capacity,
      refuse: Rc::clone(&refuse),
    };
    (region, refuse)
  }
}

impl MemoryRegion for BufferRegion {
  fn extend(&mut self, bytes: usize) -> Option<NonNull<u8>> {
    let end = self.brk.checked_add(bytes)?;
    if self.refuse.get() || end > self.capacity {
      return None;
    }
    let old_end = unsafe { self.base.add(self.brk) };
    self.brk = end;
    NonNull::new(old_end)
  }

  fn low_bound(&self) -> *mut u8 {
    self.base
  }

  fn high_bound(&self) -> *mut u8 {
    unsafe { self.base.add(self.brk) }
  }
}

fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
  unsafe { ptr.as_ptr().write_bytes(byte, len) };
}

fn holds(ptr: NonNull<u8>, len: usize, byte: u8) -> bool {
  unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }
    .iter()
    .all(|&b| b == byte)
}

#[test]
fn test_release_then_allocate_reuses_block() {
  let mut heap = Heap::new().unwrap();

  let a = heap.allocate(100).unwrap();
  fill(a, 100, 0xA5);
  unsafe { heap.release(Some(a)) };

  let b = heap.allocate(100).unwrap();
  assert_eq!(a, b);
  heap.validate().unwrap();
}

#[test]
fn test_reuse_without_merge() {
  let mut heap = Heap::new().unwrap();

  let a = heap.allocate(24).unwrap();
  let b = heap.allocate(24).unwrap();
  assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 40);

  unsafe { heap.release(Some(a)) };
  let listed: Vec<_> = heap.free_list(bucket_of(40)).collect();
  assert_eq!(listed.len(), 1);
  assert_eq!(listed[0].payload, a);
  assert_eq!(listed[0].size, 40);

  let size_before = heap.heap_size();
  let c = heap.allocate(16).unwrap();
  assert_eq!(c, a);
  assert_eq!(heap.heap_size(), size_before);

  // 40 - 32 is below the minimum block, so the block is handed out whole.
  assert_eq!(unsafe { heap.usable_size(c) }, 40 - 2 * WORD_SIZE);
  heap.validate().unwrap();
}

#[test]
fn test_release_merges_with_free_neighbor() {
  let mut heap = Heap::new().unwrap();

  let a = heap.allocate(24).unwrap();
  let b = heap.allocate(24).unwrap();
  let _c = heap.allocate(24).unwrap();

  unsafe { heap.release(Some(b)) };
  unsafe { heap.release(Some(a)) };

  let merged: Vec<_> = heap.free_list(bucket_of(80)).collect();
  assert_eq!(merged.len(), 1);
  assert_eq!(merged[0].payload, a);
  assert_eq!(merged[0].size, 80);
  assert!(!merged[0].allocated);
  assert_eq!(heap.free_list(bucket_of(40)).count(), 0);
  heap.validate().unwrap();
}

#[test]
fn test_release_merges_with_free_predecessor() {
  let mut heap = Heap::new().unwrap();

  let a = heap.allocate(24).unwrap();
  let b = heap.allocate(24).unwrap();
  let c = heap.allocate(24).unwrap();

  unsafe {
    heap.release(Some(a));
    heap.release(Some(b));
  }

  let blocks: Vec<_> = heap.blocks().collect();
  assert_eq!(blocks[0].payload, a);
  assert_eq!(blocks[0].size, 80);
  assert!(!blocks[0].allocated);
  assert_eq!(blocks[1].payload, c);
  assert!(blocks[1].allocated);

  let merged: Vec<_> = heap.free_list(bucket_of(80)).collect();
  assert_eq!(merged.len(), 1);
  assert_eq!(merged[0].payload, a);
  assert_eq!(heap.free_list(bucket_of(40)).count(), 0);
  heap.validate().unwrap();
}

#[test]
fn test_release_merges_both_sides() {
  let mut heap = Heap::new().unwrap();

  let a = heap.allocate(24).unwrap();
  let b = heap.allocate(24).unwrap();
  let c = heap.allocate(24).unwrap();
  let _d = heap.allocate(24).unwrap();

  unsafe {
    heap.release(Some(a));
    heap.release(Some(c));
    heap.release(Some(b));
  }

  let blocks: Vec<_> = heap.blocks().collect();
  assert_eq!(blocks[0].payload, a);
  assert_eq!(blocks[0].size, 120);
  assert!(!blocks[0].allocated);
  assert!(blocks[1].allocated);
  heap.validate().unwrap();
}

#[test]
fn test_large_request_grows_by_exact_size() {
  let mut heap = Heap::new().unwrap();
  let before = heap.heap_size();

  let request = CHUNK_SIZE + 904;
  let p = heap.allocate(request).unwrap();
  assert_eq!(heap.heap_size() - before, adjusted_size(request).unwrap());
  assert!(unsafe { heap.usable_size(p) } >= request);

  // The initial chunk merged with the growth and was split back off.
  let stats = heap.stats();
  assert_eq!(stats.allocated_blocks, 1);
  assert_eq!(stats.free_blocks, 1);
  assert_eq!(stats.free_bytes, CHUNK_SIZE);
  heap.validate().unwrap();
}

#[test]
fn test_small_request_grows_by_chunk() {
  let mut heap = Heap::new().unwrap();
  let before = heap.heap_size();

  // Exhaust the initial chunk exactly.
  heap.allocate(CHUNK_SIZE - 2 * WORD_SIZE).unwrap();
  assert_eq!(heap.heap_size(), before);
  assert_eq!(heap.stats().free_blocks, 0);

  heap.allocate(16).unwrap();
  assert_eq!(heap.heap_size() - before, CHUNK_SIZE);
  heap.validate().unwrap();
}

#[test]
fn test_allocate_zeroed_clears_reused_memory() {
  let mut heap = Heap::new().unwrap();

  let dirty = heap.allocate(80).unwrap();
  fill(dirty, 80, 0xFF);
  unsafe { heap.release(Some(dirty)) };

  let p = heap.allocate_zeroed(10, 8).unwrap();
  assert_eq!(p, dirty);
  assert!(holds(p, 80, 0));
  heap.validate().unwrap();
}

#[test]
fn test_zero_size_requests() {
  let mut heap = Heap::new().unwrap();
  let before = heap.heap_size();

  assert_eq!(heap.allocate(0), Err(AllocError::ZeroSize));
  assert_eq!(heap.allocate_zeroed(0, 8), Err(AllocError::ZeroSize));
  assert_eq!(heap.allocate_zeroed(8, 0), Err(AllocError::ZeroSize));
  assert_eq!(heap.heap_size(), before);

  unsafe { heap.release(None) };
  heap.validate().unwrap();
}

#[test]
fn test_overflowing_requests() {
  let mut heap = Heap::new().unwrap();

  assert_eq!(heap.allocate(usize::MAX), Err(AllocError::SizeOverflow));
  assert_eq!(
    heap.allocate_zeroed(usize::MAX, 2),
    Err(AllocError::SizeOverflow)
  );
  heap.validate().unwrap();
}

#[test]
fn test_minimum_block_for_tiny_requests() {
  let mut heap = Heap::new().unwrap();

  let a = heap.allocate(1).unwrap();
  let b = heap.allocate(1).unwrap();
  assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, MIN_BLOCK_SIZE);
  assert_eq!(a.as_ptr() as usize % 8, 0);
  heap.validate().unwrap();
}

#[test]
fn test_resize_preserves_prefix() {
  let mut heap = Heap::new().unwrap();

  let p = heap.allocate(64).unwrap();
  for i in 0..64 {
    unsafe { *p.as_ptr().add(i) = i as u8 };
  }

  let grown = unsafe { heap.resize(Some(p), 1000) }.unwrap().unwrap();
  for i in 0..64 {
    assert_eq!(unsafe { *grown.as_ptr().add(i) }, i as u8);
  }

  let shrunk = unsafe { heap.resize(Some(grown), 10) }.unwrap().unwrap();
  for i in 0..10 {
    assert_eq!(unsafe { *shrunk.as_ptr().add(i) }, i as u8);
  }
  heap.validate().unwrap();
}

#[test]
fn test_resize_edge_cases() {
  let mut heap = Heap::new().unwrap();

  let p = unsafe { heap.resize(None, 48) }.unwrap().unwrap();
  assert!(unsafe { heap.usable_size(p) } >= 48);
  assert_eq!(heap.stats().allocated_blocks, 1);

  assert_eq!(unsafe { heap.resize(Some(p), 0) }, Ok(None));
  assert_eq!(heap.stats().allocated_blocks, 0);

  assert_eq!(unsafe { heap.resize(None, 0) }, Ok(None));
  heap.validate().unwrap();
}

#[test]
fn test_resize_failure_keeps_original() {
  let region = MmapRegion::with_capacity(3 * CHUNK_SIZE).unwrap();
  let mut heap = Heap::init(region).unwrap();

  let p = heap.allocate(1000).unwrap();
  fill(p, 1000, 0x3C);

  assert_eq!(
    unsafe { heap.resize(Some(p), 100_000) },
    Err(AllocError::OutOfMemory)
  );
  assert!(holds(p, 1000, 0x3C));
  assert_eq!(heap.stats().allocated_blocks, 1);
  heap.validate().unwrap();

  unsafe { heap.release(Some(p)) };
  heap.validate().unwrap();
}

#[test]
fn test_exhaustion_leaves_heap_usable() {
  let region = MmapRegion::with_capacity(2 * CHUNK_SIZE).unwrap();
  let mut heap = Heap::init(region).unwrap();
  let before = heap.heap_size();

  assert_eq!(heap.allocate(3 * CHUNK_SIZE), Err(AllocError::OutOfMemory));
  assert_eq!(heap.allocate_zeroed(1024, 16), Err(AllocError::OutOfMemory));
  assert_eq!(heap.heap_size(), before);
  heap.validate().unwrap();

  let p = heap.allocate(128).unwrap();
  fill(p, 128, 1);
  heap.validate().unwrap();
}

#[test]
fn test_init_failures() {
  let (region, _) = BufferRegion::new(100, 0);
  assert_eq!(Heap::init(region).err(), Some(AllocError::OutOfMemory));

  // Room for the bookkeeping but not for the first chunk.
  let (region, _) = BufferRegion::new(1024, 0);
  assert_eq!(Heap::init(region).err(), Some(AllocError::OutOfMemory));

  let (region, _) = BufferRegion::new(2 * CHUNK_SIZE, 4);
  assert_eq!(Heap::init(region).err(), Some(AllocError::MisalignedRegion));
}

#[test]
fn test_region_failure_is_reported() {
  let (region, refuse) = BufferRegion::new(4 * CHUNK_SIZE, 0);
  let mut heap = Heap::init(region).unwrap();

  refuse.set(true);
  assert_eq!(heap.allocate(2 * CHUNK_SIZE), Err(AllocError::OutOfMemory));

  // Served from the existing chunk, no growth needed.
  let p = heap.allocate(256).unwrap();
  heap.validate().unwrap();

  refuse.set(false);
  let q = heap.allocate(2 * CHUNK_SIZE).unwrap();
  unsafe {
    heap.release(Some(p));
    heap.release(Some(q));
  }
  heap.validate().unwrap();
  assert_eq!(heap.stats().free_blocks, 1);
}

#[test]
fn test_allocate_release_is_idempotent() {
  let mut heap = Heap::new().unwrap();
  let _guard = heap.allocate(200).unwrap();

  for size in [1, 8, 9, 24, 100, 500, 2000, 4000, 9000] {
    let first = heap.allocate(size).unwrap();
    let size_before = heap.heap_size();
    unsafe { heap.release(Some(first)) };

    let second = heap.allocate(size).unwrap();
    assert_eq!(first, second, "size {size}");
    assert_eq!(heap.heap_size(), size_before, "size {size}");
    unsafe { heap.release(Some(second)) };
    heap.validate().unwrap();
  }
}

#[test]
fn test_caller_corruption_is_detected() {
  let mut heap = Heap::new().unwrap();
  let a = heap.allocate(24).unwrap();
  let _b = heap.allocate(24).unwrap();
  heap.validate().unwrap();

  // Clear the allocated bit in the header only.
  unsafe { a.as_ptr().sub(WORD_SIZE).cast::<u64>().write(40) };
  let offset = a.as_ptr() as usize - heap.region().low_bound() as usize;
  assert_eq!(
    heap.validate(),
    Err(HeapViolation::TagMismatch {
      offset,
      header: 40,
      footer: 41,
    })
  );
  assert!(heap.check_heap("after corruption").is_err());
}

#[cfg(feature = "check-heap")]
#[test]
#[should_panic(expected = "heap corrupted after allocate")]
fn test_check_heap_feature_panics_on_corruption() {
  let mut heap = Heap::new().unwrap();
  let a = heap.allocate(24).unwrap();

  // Footer sits right after the usable payload.
  unsafe {
    let footer = a.as_ptr().add(heap.usable_size(a)).cast::<u64>();
    footer.write(0xDEAD_BEE0);
  }
  let _ = heap.allocate(24);
}

#[test]
fn test_mixed_trace_keeps_invariants() {
  let mut heap = Heap::new().unwrap();
  let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

  // Simple LCG for deterministic testing
  let mut rng_state = 0x2545_F491u32;
  let mut next_random = || {
    rng_state = rng_state.wrapping_mul(1103515245).wrapping_add(12345);
    rng_state >> 8
  };

  for step in 0..3000u32 {
    let roll = next_random() % 10;
    if live.is_empty() || (roll < 5 && live.len() < 96) {
      let size = match next_random() % 16 {
        0 => 4097 + (next_random() % 12_000) as usize,
        1..=3 => 1 + (next_random() % 16) as usize,
        _ => 1 + (next_random() % 1500) as usize,
      };
      let byte = (step % 251) as u8;
      let p = heap.allocate(size).unwrap();
      fill(p, size, byte);
      live.push((p, size, byte));
    } else if roll < 8 {
      let idx = next_random() as usize % live.len();
      let (p, size, byte) = live.swap_remove(idx);
      assert!(holds(p, size, byte), "step {step}: payload clobbered");
      unsafe { heap.release(Some(p)) };
    } else {
      let idx = next_random() as usize % live.len();
      let (p, size, byte) = live[idx];
      let new_size = 1 + (next_random() % 3000) as usize;
      let q = unsafe { heap.resize(Some(p), new_size) }.unwrap().unwrap();
      let kept = size.min(new_size);
      assert!(holds(q, kept, byte), "step {step}: resize lost data");
      fill(q, new_size, byte);
      live[idx] = (q, new_size, byte);
    }

    if let Err(violation) = heap.validate() {
      panic!("step {step}: {violation}");
    }
  }

  // Live payloads never overlap.
  let mut ranges: Vec<_> = live
    .iter()
    .map(|&(p, size, _)| (p.as_ptr() as usize, p.as_ptr() as usize + size))
    .collect();
  ranges.sort_unstable();
  for pair in ranges.windows(2) {
    assert!(pair[0].1 <= pair[1].0);
  }
  for &(p, size, byte) in &live {
    assert!(holds(p, size, byte));
  }

  // Buckets stay sorted and hold only their own size class.
  for bucket in 0..BUCKET_COUNT {
    let sizes: Vec<_> = heap.free_list(bucket).map(|b| b.size).collect();
    assert!(sizes.windows(2).all(|w| w[0] <= w[1]));
    assert!(sizes.iter().all(|&s| bucket_of(s) == bucket));
  }

  // No two free blocks are adjacent.
  let blocks: Vec<_> = heap.blocks().collect();
  assert!(blocks.windows(2).all(|w| w[0].allocated || w[1].allocated));

  for (p, _, _) in live.drain(..) {
    unsafe { heap.release(Some(p)) };
  }
  heap.validate().unwrap();
  assert_eq!(heap.stats().free_blocks, 1);
  assert_eq!(heap.stats().allocated_blocks, 0);
}
