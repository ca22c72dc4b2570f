//! # Residency Tracking
//!
//! Per-engine residency and eviction sets. A tracker belongs to exactly one
//! submission engine and is never shared, so it carries no lock.

use alloc::sync::Arc;
use alloc::vec::Vec;

use ember_core::ByteSize;

use crate::allocation::Allocation;

/// Allocations to make resident for the next flush, and those to evict
#[derive(Debug, Default)]
pub struct ResidencyTracker {
    residency: Vec<Arc<Allocation>>,
    eviction: Vec<Arc<Allocation>>,
}

impl ResidencyTracker {
    /// Create empty sets
    pub const fn new() -> Self {
        Self {
            residency: Vec::new(),
            eviction: Vec::new(),
        }
    }

    /// Queue `allocation` for the next flush
    pub fn push_for_residency(&mut self, allocation: Arc<Allocation>) {
        log::trace!("{:?} queued for residency", allocation.id());
        self.residency.push(allocation);
    }

    /// Allocations queued for the next flush
    pub fn residency_set(&self) -> &[Arc<Allocation>] {
        &self.residency
    }

    /// Bytes queued for the next flush
    pub fn residency_size(&self) -> ByteSize {
        ByteSize::from_bytes(self.residency.iter().map(|a| a.size().as_bytes()).sum())
    }

    /// Drain the residency set
    pub fn clear_residency_set(&mut self) -> Vec<Arc<Allocation>> {
        core::mem::take(&mut self.residency)
    }

    /// Queue `allocation` for physical eviction
    pub fn push_for_eviction(&mut self, allocation: Arc<Allocation>) {
        log::trace!("{:?} queued for eviction", allocation.id());
        self.eviction.push(allocation);
    }

    /// Allocations queued for eviction
    pub fn eviction_set(&self) -> &[Arc<Allocation>] {
        &self.eviction
    }

    /// Drain the eviction set
    pub fn clear_eviction_set(&mut self) -> Vec<Arc<Allocation>> {
        core::mem::take(&mut self.eviction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationKind;
    use crate::manager::MemoryManager;

    #[test]
    fn test_sets_drain_independently() {
        let manager = MemoryManager::with_host_memory();
        let a = manager
            .allocate(ByteSize::KIB_4, 0, AllocationKind::Buffer)
            .unwrap();
        let b = manager
            .allocate(ByteSize::KIB_64, 0, AllocationKind::Buffer)
            .unwrap();

        let mut tracker = ResidencyTracker::new();
        tracker.push_for_residency(Arc::clone(&a));
        tracker.push_for_residency(Arc::clone(&b));
        tracker.push_for_eviction(a);
        assert_eq!(tracker.residency_size(), ByteSize::from_kib(68));

        assert_eq!(tracker.clear_residency_set().len(), 2);
        assert!(tracker.residency_set().is_empty());
        assert_eq!(tracker.eviction_set().len(), 1);
        assert_eq!(tracker.clear_eviction_set().len(), 1);
    }
}
