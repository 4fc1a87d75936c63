// Copyright 2018-2025 the Deno authors. MIT license.
use std::cell::RefCell;

use crate::error::UvError;

/// Default size of the per-loop shared read buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug)]
enum Storage {
  Shared(Box<[u8]>),
  Heap(Vec<u8>),
}

/// Storage for one read callback's worth of incoming bytes.
///
/// Either the loop-wide shared buffer, which must go back through
/// [`BufferArena::release`], or a one-off allocation made while the shared
/// buffer was busy. Only an arena can hand out the shared buffer.
#[derive(Debug)]
pub struct ReadBuffer {
  storage: Storage,
}

impl ReadBuffer {
  pub fn is_shared(&self) -> bool {
    matches!(self.storage, Storage::Shared(_))
  }

  pub fn len(&self) -> usize {
    self.as_slice().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn as_slice(&self) -> &[u8] {
    match &self.storage {
      Storage::Shared(buf) => buf,
      Storage::Heap(buf) => buf,
    }
  }

  pub fn as_mut_slice(&mut self) -> &mut [u8] {
    match &mut self.storage {
      Storage::Shared(buf) => buf,
      Storage::Heap(buf) => buf,
    }
  }
}

/// A single reusable read buffer per loop.
///
/// While the shared buffer is handed out the arena is busy, and every further
/// request gets its own heap allocation of the requested size. The arena is
/// busy exactly when the shared slot is empty.
pub struct BufferArena {
  slot: RefCell<Option<Box<[u8]>>>,
  capacity: usize,
}

static_assertions::assert_not_impl_any!(BufferArena: Sync);

impl BufferArena {
  pub fn new(capacity: usize) -> Self {
    let slot = (capacity > 0).then(|| vec![0u8; capacity].into_boxed_slice());
    Self {
      slot: RefCell::new(slot),
      capacity,
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn is_busy(&self) -> bool {
    self.capacity > 0 && self.slot.borrow().is_none()
  }

  /// Hands out the shared buffer, at its full capacity, whenever it is free.
  /// Otherwise allocates `requested` bytes on the heap.
  pub fn alloc(&self, requested: usize) -> Result<ReadBuffer, UvError> {
    if let Some(buf) = self.slot.borrow_mut().take() {
      return Ok(ReadBuffer {
        storage: Storage::Shared(buf),
      });
    }
    let mut buf = Vec::new();
    buf
      .try_reserve_exact(requested)
      .map_err(|_| UvError::OutOfMemory)?;
    buf.resize(requested, 0);
    Ok(ReadBuffer {
      storage: Storage::Heap(buf),
    })
  }

  /// Returns a buffer obtained from [`BufferArena::alloc`]. Heap buffers are
  /// simply dropped.
  pub fn release(&self, buf: ReadBuffer) {
    match buf.storage {
      Storage::Shared(buf) => {
        let mut slot = self.slot.borrow_mut();
        assert!(slot.is_none(), "shared read buffer released while not busy");
        *slot = Some(buf);
      }
      Storage::Heap(_) => {}
    }
  }
}

impl Default for BufferArena {
  fn default() -> Self {
    Self::new(DEFAULT_BUFFER_SIZE)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn test_shared_then_heap() {
    let arena = BufferArena::new(16);
    assert!(!arena.is_busy());

    let first = arena.alloc(16).unwrap();
    assert!(first.is_shared());
    assert!(arena.is_busy());

    let second = arena.alloc(8).unwrap();
    assert!(!second.is_shared());
    assert_eq!(second.len(), 8);

    arena.release(second);
    assert!(arena.is_busy());
    arena.release(first);
    assert!(!arena.is_busy());

    assert!(arena.alloc(4).unwrap().is_shared());
  }

  #[test]
  fn test_shared_buffer_ignores_requested_size() {
    let arena = BufferArena::new(16);
    let buf = arena.alloc(32).unwrap();
    assert!(buf.is_shared());
    assert_eq!(buf.len(), 16);
    assert!(arena.is_busy());
    let small = arena.alloc(4).unwrap();
    assert!(!small.is_shared());
    assert_eq!(small.len(), 4);
    arena.release(small);
    arena.release(buf);
    assert!(!arena.is_busy());
  }

  #[test]
  fn test_zero_capacity_never_busy() {
    let arena = BufferArena::new(0);
    let buf = arena.alloc(4).unwrap();
    assert!(!buf.is_shared());
    assert!(!arena.is_busy());
  }

  #[test]
  #[should_panic(expected = "released while not busy")]
  fn test_double_release_panics() {
    let arena = BufferArena::new(4);
    let buf = arena.alloc(4).unwrap();
    let copy = ReadBuffer {
      storage: Storage::Shared(buf.as_slice().into()),
    };
    arena.release(buf);
    arena.release(copy);
  }

  #[test]
  fn test_heap_allocation_failure_is_out_of_memory() {
    let arena = BufferArena::new(4);
    let _shared = arena.alloc(4).unwrap();
    let err = arena.alloc(usize::MAX).unwrap_err();
    assert_eq!(err, UvError::OutOfMemory);
  }
}
