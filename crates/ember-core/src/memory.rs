//! # Memory Management Primitives
//!
//! Allocation flags, addressing modes, VA ranges and the page/cache-line
//! constants the growth logic rounds to.

use crate::types::*;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Memory constants shared by allocators and streams
#[derive(Debug, Clone, Copy)]
pub struct MemoryConstants;

impl MemoryConstants {
    /// Page size; every stream and heap backing is a whole number of pages
    pub const PAGE_SIZE: u64 = 4096;
    /// CPU cache line
    pub const CACHE_LINE_SIZE: u64 = 64;
    /// Minimum alignment of a wrapped host pointer
    pub const HOST_PTR_ALIGNMENT: u64 = 4;
}

/// Round `value` up to `alignment` (a power of two)
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// [`align_up`] that returns `None` instead of overflowing
#[inline]
pub const fn checked_align_up(value: u64, alignment: u64) -> Option<u64> {
    let mask = alignment - 1;
    match value.checked_add(mask) {
        Some(sum) => Some(sum & !mask),
        None => None,
    }
}

// =============================================================================
// ALLOCATION FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Flags for device memory allocation
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        /// Map uncached on the CPU side
        const UNCACHEABLE = 1 << 0;
        /// Pin pages at creation (no lazy population)
        const FORCE_PIN = 1 << 1;
        /// Memory is caller-owned host memory wrapped for device access
        const HOST_PTR = 1 << 2;
        /// Zero the memory before handing it out
        const ZEROED = 1 << 3;
    }
}

impl Default for AllocFlags {
    fn default() -> Self {
        AllocFlags::ZEROED
    }
}

// =============================================================================
// ADDRESSING MODE
// =============================================================================

/// Which GPU virtual range an allocation must live in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressingMode {
    /// Anywhere in the full virtual range
    #[default]
    Full,
    /// Inside the 32-bit internal heap window (base-relative addressing)
    Internal32,
}

// =============================================================================
// VIRTUAL ADDRESS RANGE
// =============================================================================

/// A range in GPU virtual address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaRange {
    /// Start address
    pub start: GpuAddr,
    /// End address (exclusive)
    pub end: GpuAddr,
}

impl VaRange {
    /// Create a new VA range
    pub const fn new(start: GpuAddr, size: ByteSize) -> Self {
        Self {
            start,
            end: GpuAddr::new(start.raw() + size.as_bytes()),
        }
    }

    /// Get range size
    pub fn size(&self) -> ByteSize {
        ByteSize::from_bytes(self.end - self.start)
    }

    /// Check if address is in range
    pub fn contains(&self, addr: GpuAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Check if ranges overlap
    pub fn overlaps(&self, other: &VaRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Standard GPU virtual address regions
pub mod regions {
    use super::*;

    /// 32-bit internal heap window (heaps addressed relative to its base)
    pub const INTERNAL_HEAP: VaRange = VaRange {
        start: GpuAddr::new(0x1_0000_0000),
        end: GpuAddr::new(0x2_0000_0000),
    };

    /// General purpose allocations (above the internal window)
    pub const FULL: VaRange = VaRange {
        start: GpuAddr::new(0x10_0000_0000),
        end: GpuAddr::new(0x8000_0000_0000),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(1, MemoryConstants::PAGE_SIZE), 4096);
        assert_eq!(align_up(4096, MemoryConstants::PAGE_SIZE), 4096);
        assert_eq!(align_up(65, MemoryConstants::CACHE_LINE_SIZE), 128);
    }

    #[test]
    fn test_checked_align_up_overflow() {
        let page = MemoryConstants::PAGE_SIZE;
        assert_eq!(checked_align_up(4097, page), Some(8192));
        assert_eq!(checked_align_up(u64::MAX - page + 1, page), Some(u64::MAX - page + 1));
        assert_eq!(checked_align_up(u64::MAX - 1, page), None);
    }

    #[test]
    fn test_regions_disjoint() {
        assert!(!regions::INTERNAL_HEAP.overlaps(&regions::FULL));
        assert_eq!(regions::INTERNAL_HEAP.size(), ByteSize::GIB_4);
        assert!(regions::FULL.contains(GpuAddr::new(0x10_0000_1000)));
    }
}
