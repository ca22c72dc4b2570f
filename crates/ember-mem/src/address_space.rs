//! # GPU Virtual Address Space
//!
//! First-fit reservation of GPU virtual ranges for backing allocators.
//!
//! The host-memory backing keeps two of these: one over the full range and
//! one over the 32-bit internal heap window, so that internal heaps can be
//! addressed relative to a single base.

use alloc::vec::Vec;

use ember_core::memory::{checked_align_up, MemoryConstants};
use ember_core::{ByteSize, Error, GpuAddr, Result, VaRange};

// =============================================================================
// VA BLOCK
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct VaBlock {
    range: VaRange,
    free: bool,
}

// =============================================================================
// ADDRESS SPACE
// =============================================================================

/// A window of GPU virtual addresses handed out first-fit
#[derive(Debug)]
pub struct AddressSpace {
    /// Managed range
    range: VaRange,
    /// Blocks in address order, covering `range` without gaps
    blocks: Vec<VaBlock>,
    /// Statistics
    stats: AddressSpaceStats,
}

/// Address space statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressSpaceStats {
    /// Number of reservations
    pub reservations: u64,
    /// Number of releases
    pub releases: u64,
    /// Currently reserved bytes
    pub reserved: u64,
}

impl AddressSpace {
    /// Create an address space over `range`
    pub fn new(range: VaRange) -> Self {
        Self {
            range,
            blocks: alloc::vec![VaBlock { range, free: true }],
            stats: AddressSpaceStats::default(),
        }
    }

    /// Managed range
    pub fn range(&self) -> VaRange {
        self.range
    }

    /// Reserve `size` bytes aligned to `alignment` (at least a page)
    pub fn reserve(&mut self, size: ByteSize, alignment: u64) -> Result<VaRange> {
        if size.as_bytes() == 0 || !alignment.is_power_of_two() {
            return Err(Error::InvalidParameter);
        }
        let size = checked_align_up(size.as_bytes(), MemoryConstants::PAGE_SIZE)
            .ok_or(Error::OutOfMemory)?;
        let alignment = alignment.max(MemoryConstants::PAGE_SIZE);

        let found = self.blocks.iter().enumerate().find_map(|(i, block)| {
            if !block.free {
                return None;
            }
            let start = block.range.start.align_up(alignment);
            let end = start.raw().checked_add(size)?;
            (end <= block.range.end.raw()).then_some((
                i,
                VaRange {
                    start,
                    end: GpuAddr::new(end),
                },
            ))
        });

        let (index, reserved) = found.ok_or(Error::OutOfMemory)?;
        self.split_block(index, reserved);

        self.stats.reservations += 1;
        self.stats.reserved += size;
        Ok(reserved)
    }

    /// Carve `reserved` out of the free block at `index`
    fn split_block(&mut self, index: usize, reserved: VaRange) {
        let block = self.blocks.remove(index);
        let mut at = index;

        if reserved.start > block.range.start {
            self.blocks.insert(
                at,
                VaBlock {
                    range: VaRange {
                        start: block.range.start,
                        end: reserved.start,
                    },
                    free: true,
                },
            );
            at += 1;
        }

        self.blocks.insert(
            at,
            VaBlock {
                range: reserved,
                free: false,
            },
        );

        if reserved.end < block.range.end {
            self.blocks.insert(
                at + 1,
                VaBlock {
                    range: VaRange {
                        start: reserved.end,
                        end: block.range.end,
                    },
                    free: true,
                },
            );
        }
    }

    /// Release a range previously returned by [`reserve`](Self::reserve)
    pub fn release(&mut self, range: VaRange) -> Result<()> {
        let index = self
            .blocks
            .iter()
            .position(|b| !b.free && b.range == range)
            .ok_or(Error::NotFound)?;

        self.blocks[index].free = true;
        self.stats.releases += 1;
        self.stats.reserved -= range.size().as_bytes();

        self.merge_free_blocks();
        Ok(())
    }

    fn merge_free_blocks(&mut self) {
        let mut i = 0;
        while i + 1 < self.blocks.len() {
            if self.blocks[i].free && self.blocks[i + 1].free {
                self.blocks[i].range.end = self.blocks[i + 1].range.end;
                self.blocks.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Get statistics
    pub fn stats(&self) -> AddressSpaceStats {
        self.stats
    }

    /// Total free bytes
    pub fn free_space(&self) -> ByteSize {
        ByteSize::from_bytes(
            self.blocks
                .iter()
                .filter(|b| b.free)
                .map(|b| b.range.size().as_bytes())
                .sum(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(size: u64) -> AddressSpace {
        AddressSpace::new(VaRange::new(
            GpuAddr::new(0x10_0000),
            ByteSize::from_bytes(size),
        ))
    }

    #[test]
    fn test_reserve_first_fit() {
        let mut va = space(0x10_000);
        let a = va.reserve(ByteSize::from_bytes(100), 0x1000).unwrap();
        let b = va.reserve(ByteSize::KIB_4, 0x1000).unwrap();
        assert_eq!(a.start, GpuAddr::new(0x10_0000));
        assert_eq!(a.size(), ByteSize::KIB_4);
        assert_eq!(b.start, a.end);
        assert_eq!(va.stats().reserved, 0x2000);
    }

    #[test]
    fn test_release_merges() {
        let mut va = space(0x4000);
        let a = va.reserve(ByteSize::KIB_4, 0x1000).unwrap();
        let b = va.reserve(ByteSize::KIB_4, 0x1000).unwrap();
        va.release(a).unwrap();
        va.release(b).unwrap();
        assert_eq!(va.free_space(), ByteSize::from_bytes(0x4000));
        let whole = va.reserve(ByteSize::from_bytes(0x4000), 0x1000).unwrap();
        assert_eq!(whole, va.range());
    }

    #[test]
    fn test_exhaustion() {
        let mut va = space(0x2000);
        assert!(va.reserve(ByteSize::from_bytes(0x2000), 0x1000).is_ok());
        assert_eq!(
            va.reserve(ByteSize::KIB_4, 0x1000),
            Err(Error::OutOfMemory)
        );
    }

    #[test]
    fn test_reserve_near_u64_max() {
        let mut va = space(0x2000);
        assert_eq!(
            va.reserve(ByteSize::from_bytes(u64::MAX - 1), 0x1000),
            Err(Error::OutOfMemory)
        );
        assert!(va.reserve(ByteSize::KIB_4, 0x1000).is_ok());
    }

    #[test]
    fn test_release_unknown_range() {
        let mut va = space(0x2000);
        let bogus = VaRange::new(GpuAddr::new(0x10_0000), ByteSize::KIB_4);
        assert_eq!(va.release(bogus), Err(Error::NotFound));
    }
}
