//! Chunk-sized staging buffers
//!
//! The verify path and the parity engine move whole chunks between
//! devices and the staging area. `ChunkBuf` is a heap buffer aligned to
//! the chunk size (block I/O in the array is always chunk-aligned at
//! this layer), and `ChunkBufPool` keeps a bounded free list so steady
//! state verify traffic does not allocate.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;

use crate::chunk::CHUNK_SIZE;
use crate::error::{Error, Result};

/// Required alignment for chunk buffers.
pub const CHUNK_BUF_ALIGNMENT: usize = CHUNK_SIZE;

// =============================================================================
// ChunkBuf
// =============================================================================

/// A chunk-aligned heap buffer.
///
/// Always zero-initialized at allocation. Owned exclusively; implements
/// `Send` for handoff between the initiator and the parity engine but
/// not `Sync`.
#[derive(Debug)]
pub struct ChunkBuf {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
}

// SAFETY: ChunkBuf owns its allocation exclusively; moving it between
// threads transfers that ownership.
unsafe impl Send for ChunkBuf {}

impl ChunkBuf {
    /// Allocate a new zeroed buffer of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::BufferAlloc` if `size` is 0 or the allocation
    /// fails.
    pub fn new_zeroed(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::BufferAlloc {
                size,
                reason: "size must be greater than 0".into(),
            });
        }

        let layout =
            Layout::from_size_align(size, CHUNK_BUF_ALIGNMENT).map_err(|e| Error::BufferAlloc {
                size,
                reason: e.to_string(),
            })?;

        // SAFETY: layout has nonzero size and valid alignment.
        let ptr = unsafe { alloc_zeroed(layout) };

        NonNull::new(ptr).map_or_else(
            || {
                Err(Error::BufferAlloc {
                    size,
                    reason: "allocator returned null".into(),
                })
            },
            |ptr| Ok(Self { ptr, size, layout }),
        )
    }

    /// Allocate a buffer of exactly one chunk.
    pub fn new_chunk() -> Result<Self> {
        Self::new_zeroed(CHUNK_SIZE)
    }

    /// Buffer length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Always `false` for a successfully constructed buffer.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Fill the entire buffer with a byte value.
    pub fn fill(&mut self, value: u8) {
        self.as_mut_slice().fill(value);
    }

    /// Zero the entire buffer.
    pub fn zero(&mut self) {
        self.fill(0);
    }

    /// Copy `data` into the front of the buffer.
    ///
    /// # Panics
    ///
    /// Panics if `data.len() > self.len()`.
    pub fn copy_from_slice(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.size,
            "source slice too large: {} > {}",
            data.len(),
            self.size
        );
        self.as_mut_slice()[..data.len()].copy_from_slice(data);
    }

    #[inline]
    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for size bytes and we have shared access.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    #[inline]
    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for size bytes and we have exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for ChunkBuf {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with self.layout and not yet freed.
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

impl Deref for ChunkBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for ChunkBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl AsRef<[u8]> for ChunkBuf {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for ChunkBuf {
    #[inline]
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

// =============================================================================
// ChunkBufPool
// =============================================================================

/// A bounded pool of reusable chunk buffers.
///
/// Buffers are zeroed on reuse so a verify task never observes stale
/// data from a previous job.
#[derive(Debug)]
pub struct ChunkBufPool {
    buffers: parking_lot::Mutex<Vec<ChunkBuf>>,
    buffer_size: usize,
    max_capacity: usize,
}

impl ChunkBufPool {
    /// Create a pool of `buffer_size`-byte buffers with `initial_count`
    /// pre-allocated and at most `max_capacity` retained.
    pub fn new(buffer_size: usize, initial_count: usize, max_capacity: usize) -> Result<Self> {
        let mut buffers = Vec::with_capacity(max_capacity);
        for _ in 0..initial_count {
            buffers.push(ChunkBuf::new_zeroed(buffer_size)?);
        }

        Ok(Self {
            buffers: parking_lot::Mutex::new(buffers),
            buffer_size,
            max_capacity,
        })
    }

    /// Get a zeroed buffer from the pool, allocating if the pool is empty.
    pub fn get(&self) -> Result<ChunkBuf> {
        let popped = self.buffers.lock().pop();
        match popped {
            Some(mut buf) => {
                buf.zero();
                Ok(buf)
            }
            None => ChunkBuf::new_zeroed(self.buffer_size),
        }
    }

    /// Return a buffer to the pool. Dropped if the pool is full or the
    /// size does not match.
    pub fn put(&self, buf: ChunkBuf) {
        if buf.len() != self.buffer_size {
            return;
        }
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_capacity {
            buffers.push(buf);
        }
    }

    /// Number of buffers currently available.
    pub fn available(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Size of the buffers managed by this pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_zero_size_rejected() {
        assert_matches!(
            ChunkBuf::new_zeroed(0),
            Err(Error::BufferAlloc { size: 0, .. })
        );
    }

    #[test]
    fn test_new_chunk_is_zeroed_and_aligned() {
        let buf = ChunkBuf::new_chunk().unwrap();
        assert_eq!(buf.len(), CHUNK_SIZE);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(buf.as_ptr() as usize % CHUNK_BUF_ALIGNMENT, 0);
    }

    #[test]
    fn test_fill_and_copy() {
        let mut buf = ChunkBuf::new_chunk().unwrap();
        buf.fill(0xAB);
        assert!(buf.iter().all(|&b| b == 0xAB));

        buf.copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
        assert_eq!(buf[4], 0xAB);
    }

    #[test]
    #[should_panic(expected = "source slice too large")]
    fn test_copy_overflow_panics() {
        let mut buf = ChunkBuf::new_zeroed(4).unwrap();
        buf.copy_from_slice(&[0; 8]);
    }

    #[test]
    fn test_pool_reuse_zeroes() {
        let pool = ChunkBufPool::new(CHUNK_SIZE, 1, 2).unwrap();
        assert_eq!(pool.available(), 1);

        let mut buf = pool.get().unwrap();
        buf.fill(0xFF);
        pool.put(buf);
        assert_eq!(pool.available(), 1);

        let buf = pool.get().unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_pool_capacity_and_size_checks() {
        let pool = ChunkBufPool::new(CHUNK_SIZE, 0, 1).unwrap();

        // Mismatched size is dropped
        pool.put(ChunkBuf::new_zeroed(512).unwrap());
        assert_eq!(pool.available(), 0);

        pool.put(ChunkBuf::new_chunk().unwrap());
        pool.put(ChunkBuf::new_chunk().unwrap());
        // Second put exceeds max_capacity and is dropped
        assert_eq!(pool.available(), 1);
    }
}
