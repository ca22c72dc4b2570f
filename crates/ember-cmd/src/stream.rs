//! # Linear Stream
//!
//! An append-only byte buffer over one backing allocation.
//!
//! The stream never grows in place. When its owner needs more room it hands
//! in a new allocation with [`LinearStream::replace_buffer`] and gets the old
//! one back, to be pooled until the device is done with it.

use alloc::sync::Arc;
use core::ptr::NonNull;

use ember_core::{Error, GpuAddr, Result};
use ember_mem::Allocation;

/// Append-only view over a backing allocation
#[derive(Debug, Default)]
pub struct LinearStream {
    allocation: Option<Arc<Allocation>>,
    base: Option<NonNull<u8>>,
    used: usize,
    max_available: usize,
}

impl LinearStream {
    /// Create a stream with no backing
    pub const fn new() -> Self {
        Self {
            allocation: None,
            base: None,
            used: 0,
            max_available: 0,
        }
    }

    /// Create a stream over `allocation` exposing `max_size` bytes
    pub fn with_allocation(allocation: Arc<Allocation>, max_size: usize) -> Self {
        let mut stream = Self::new();
        stream.replace_buffer(allocation, max_size);
        stream
    }

    /// Reserve `size` bytes at the cursor
    ///
    /// Fails with [`Error::BufferOverflow`] if the stream cannot hold them
    /// and [`Error::InvalidState`] if it has no CPU-visible backing.
    pub fn get_space(&mut self, size: usize) -> Result<&mut [u8]> {
        let base = self.base.ok_or(Error::InvalidState)?;
        if size > self.available_space() {
            return Err(Error::BufferOverflow);
        }
        let offset = self.used;
        self.used += size;
        // SAFETY: [offset, offset + size) lies within max_available, which
        // never exceeds the backing size; the stream is the only CPU writer of
        // its backing while bound
        Ok(unsafe { core::slice::from_raw_parts_mut(base.as_ptr().add(offset), size) })
    }

    /// Append a plain-old-data value, returning its offset
    pub fn emit<T: bytemuck::Pod>(&mut self, value: &T) -> Result<usize> {
        let offset = self.used;
        let bytes = bytemuck::bytes_of(value);
        self.get_space(bytes.len())?.copy_from_slice(bytes);
        Ok(offset)
    }

    /// Advance the cursor to a multiple of `alignment`
    pub fn align_to(&mut self, alignment: usize) -> Result<()> {
        if !alignment.is_power_of_two() {
            return Err(Error::InvalidParameter);
        }
        let aligned = (self.used + alignment - 1) & !(alignment - 1);
        if aligned > self.max_available {
            return Err(Error::BufferOverflow);
        }
        self.used = aligned;
        Ok(())
    }

    /// Bytes still writable
    #[inline]
    pub fn available_space(&self) -> usize {
        self.max_available.saturating_sub(self.used)
    }

    /// Bytes written
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Writable window size
    #[inline]
    pub fn max_available_space(&self) -> usize {
        self.max_available
    }

    /// Limit the writable window, never past the backing
    pub fn override_max_size(&mut self, max_size: usize) {
        let backing = self
            .allocation
            .as_ref()
            .map_or(0, |a| a.size().as_usize());
        self.max_available = max_size.min(backing);
    }

    /// Device address of the start of the stream
    #[inline]
    pub fn gpu_base(&self) -> GpuAddr {
        self.allocation
            .as_ref()
            .map_or(GpuAddr::null(), |a| a.gpu_addr())
    }

    /// Current backing
    #[inline]
    pub fn allocation(&self) -> Option<&Arc<Allocation>> {
        self.allocation.as_ref()
    }

    /// Bind a new backing, returning the previous one
    ///
    /// The cursor restarts at zero; bytes written to the previous backing stay
    /// readable by the device as long as that backing lives.
    pub fn replace_buffer(
        &mut self,
        allocation: Arc<Allocation>,
        max_size: usize,
    ) -> Option<Arc<Allocation>> {
        self.base = allocation.cpu_ptr();
        self.used = 0;
        self.max_available = max_size.min(allocation.size().as_usize());
        self.allocation.replace(allocation)
    }

    /// Move the backing out, leaving the stream unbound
    pub fn take_allocation(&mut self) -> Option<Arc<Allocation>> {
        self.base = None;
        self.used = 0;
        self.max_available = 0;
        self.allocation.take()
    }
}

// SAFETY: `base` points into the owned backing allocation, which is Send
unsafe impl Send for LinearStream {}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::ByteSize;
    use ember_mem::{AllocationKind, MemoryManager};

    #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Packet {
        opcode: u32,
        length: u32,
        address: u64,
    }

    fn stream(manager: &MemoryManager, max: usize) -> LinearStream {
        let allocation = manager
            .allocate(ByteSize::KIB_4, 0, AllocationKind::LinearStream)
            .unwrap();
        LinearStream::with_allocation(allocation, max)
    }

    #[test]
    fn test_get_space_advances() {
        let manager = MemoryManager::with_host_memory();
        let mut cs = stream(&manager, 4096);
        cs.get_space(16).unwrap().fill(0xAB);
        assert_eq!(cs.used(), 16);
        assert_eq!(cs.available_space(), 4080);
        assert_eq!(cs.get_space(4081), Err(Error::BufferOverflow));
        assert_eq!(cs.used(), 16);
    }

    #[test]
    fn test_emit_writes_bytes() {
        let manager = MemoryManager::with_host_memory();
        let mut cs = stream(&manager, 4096);
        cs.get_space(4).unwrap();
        cs.align_to(8).unwrap();
        let packet = Packet {
            opcode: 0x31,
            length: 2,
            address: 0xDEAD_B000,
        };
        let offset = cs.emit(&packet).unwrap();
        assert_eq!(offset, 8);

        let base = cs.allocation().unwrap().cpu_ptr().unwrap();
        // SAFETY: reading back the 16 bytes just written
        let written = unsafe { core::slice::from_raw_parts(base.as_ptr().add(8), 16) };
        assert_eq!(written, bytemuck::bytes_of(&packet));
    }

    #[test]
    fn test_max_size_clamped_to_backing() {
        let manager = MemoryManager::with_host_memory();
        let mut cs = stream(&manager, 1 << 20);
        assert_eq!(cs.max_available_space(), 4096);
        cs.override_max_size(1024);
        assert_eq!(cs.available_space(), 1024);
        assert_eq!(cs.align_to(2048), Err(Error::BufferOverflow));
    }

    #[test]
    fn test_replace_and_take() {
        let manager = MemoryManager::with_host_memory();
        let mut cs = LinearStream::new();
        assert_eq!(cs.get_space(1), Err(Error::InvalidState));
        assert!(cs.gpu_base().is_null());

        let first = manager
            .allocate(ByteSize::KIB_4, 0, AllocationKind::LinearStream)
            .unwrap();
        let first_id = first.id();
        assert!(cs.replace_buffer(first, 4096).is_none());
        cs.get_space(100).unwrap();

        let second = manager
            .allocate(ByteSize::KIB_64, 0, AllocationKind::LinearStream)
            .unwrap();
        let old = cs.replace_buffer(second, 60 * 1024).unwrap();
        assert_eq!(old.id(), first_id);
        assert_eq!(cs.used(), 0);
        assert_eq!(cs.max_available_space(), 60 * 1024);

        assert!(cs.take_allocation().is_some());
        assert_eq!(cs.available_space(), 0);
    }
}
