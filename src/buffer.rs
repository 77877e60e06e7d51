//! Endpoint memory buffers
//!
//! The SIE reads and writes packet buffers behind the CPU's back, so all
//! buffer access is volatile.

use core::ptr::NonNull;

/// Endpoint memory buffer allocator
///
/// Hands out buffers from the top of a caller-supplied region, downwards.
pub struct Allocator {
    start: *mut u8,
    ptr: *mut u8,
}

impl Allocator {
    /// Partition `memory` for endpoint buffers
    ///
    /// Memory must be static, since the SIE keeps its addresses.
    pub fn new(memory: &'static mut [u8]) -> Self {
        let size = memory.len();
        let start = memory.as_mut_ptr();
        // Safety: one past the end of the allocation
        let ptr = unsafe { start.add(size) };
        Allocator { start, ptr }
    }

    /// Allocates a buffer of `size` bytes
    pub fn allocate(&mut self, size: usize) -> Option<Buffer> {
        let ptr = self.ptr as usize;
        let new_ptr = ptr.checked_sub(size)?;
        let start = self.start as usize;
        if new_ptr < start {
            None
        } else {
            // Keep the pointer's provenance while moving it down
            self.ptr = self.ptr.wrapping_sub(size);
            NonNull::new(self.ptr).map(|ptr| Buffer { ptr, len: size })
        }
    }

    /// Returns how many bytes are still available
    pub fn remaining(&self) -> usize {
        self.ptr as usize - self.start as usize
    }
}

/// A region of endpoint memory
///
/// Owned by exactly one endpoint. The SIE may write it while a receive
/// descriptor is armed.
pub struct Buffer {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the buffer is exclusively owned; it came from `&'static mut` memory.
unsafe impl Send for Buffer {}

impl Buffer {
    /// Returns the buffer's capacity
    pub fn len(&self) -> usize {
        self.len
    }

    /// The address handed to a buffer descriptor
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Copy bytes out of the buffer, starting at `offset`
    ///
    /// Returns the number of bytes copied, constrained by the size of `dst` and
    /// the space after `offset`.
    pub fn volatile_read(&self, offset: usize, dst: &mut [u8]) -> usize {
        let size = dst.len().min(self.len.saturating_sub(offset));
        for (idx, byte) in dst[..size].iter_mut().enumerate() {
            // Safety: offset + idx < len
            *byte = unsafe { self.ptr.as_ptr().add(offset + idx).read_volatile() };
        }
        size
    }

    /// Copy bytes into the buffer, starting at `offset`
    ///
    /// Returns the number of bytes copied.
    pub fn volatile_write(&mut self, offset: usize, src: &[u8]) -> usize {
        let size = src.len().min(self.len.saturating_sub(offset));
        for (idx, byte) in src[..size].iter().enumerate() {
            // Safety: offset + idx < len
            unsafe { self.ptr.as_ptr().add(offset + idx).write_volatile(*byte) };
        }
        size
    }

    /// Move `size` bytes from the start of `src` into this buffer at `offset`
    ///
    /// Returns the number of bytes moved.
    pub fn copy_from(&mut self, offset: usize, src: &Buffer, size: usize) -> usize {
        let size = size
            .min(src.len)
            .min(self.len.saturating_sub(offset));
        for idx in 0..size {
            // Safety: idx < src.len, offset + idx < self.len
            unsafe {
                let byte = src.ptr.as_ptr().add(idx).read_volatile();
                self.ptr.as_ptr().add(offset + idx).write_volatile(byte);
            }
        }
        size
    }
}

#[cfg(test)]
pub(crate) fn leak(size: usize) -> &'static mut [u8] {
    std::vec![0u8; size].leak()
}

#[cfg(test)]
mod test {
    use super::{leak, Allocator};

    #[test]
    fn allocate_entire_buffer() {
        let memory = leak(32);
        let base = memory.as_ptr();
        let mut alloc = Allocator::new(memory);
        let buffer = alloc.allocate(32);
        assert!(buffer.is_some());
        assert_eq!(buffer.unwrap().as_ptr(), base);

        assert!(alloc.allocate(1).is_none());
        assert_eq!(alloc.remaining(), 0);
    }

    #[test]
    fn allocate_partial_buffers() {
        let memory = leak(32);
        let base = memory.as_ptr();
        let mut alloc = Allocator::new(memory);

        let buffer = alloc.allocate(7).unwrap();
        assert_eq!(buffer.as_ptr(), base.wrapping_add(32 - 7));
        assert_eq!(buffer.len(), 7);

        let buffer = alloc.allocate(7).unwrap();
        assert_eq!(buffer.as_ptr(), base.wrapping_add(32 - 14));

        assert!(alloc.allocate(19).is_none());
        assert_eq!(alloc.remaining(), 18);
    }

    #[test]
    fn read_write_offsets() {
        let mut alloc = Allocator::new(leak(8));
        let mut buffer = alloc.allocate(8).unwrap();

        assert_eq!(buffer.volatile_write(6, &[1, 2, 3, 4]), 2);
        let mut dst = [0; 4];
        assert_eq!(buffer.volatile_read(4, &mut dst), 4);
        assert_eq!(dst, [0, 0, 1, 2]);
        assert_eq!(buffer.volatile_read(8, &mut dst), 0);
    }

    #[test]
    fn copy_between_buffers() {
        let mut alloc = Allocator::new(leak(12));
        let mut packet = alloc.allocate(4).unwrap();
        let mut staging = alloc.allocate(8).unwrap();

        packet.volatile_write(0, &[9, 8, 7, 6]);
        assert_eq!(staging.copy_from(6, &packet, 4), 2);
        let mut dst = [0; 8];
        staging.volatile_read(0, &mut dst);
        assert_eq!(dst, [0, 0, 0, 0, 0, 0, 9, 8]);
    }
}
