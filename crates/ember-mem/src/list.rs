//! # Allocation Lists
//!
//! Ordered pools of shared allocations. Lists do no locking themselves; the
//! memory manager keeps both of its pools behind one lock.

use alloc::sync::Arc;
use alloc::vec::Vec;

use ember_core::{AllocationHandle, ByteSize};

use crate::allocation::Allocation;

/// Which of the manager's pools an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Allocations parked until a submission retires, then freed
    Temporary,
    /// Retired allocations kept for cheap reacquisition
    Reusable,
}

impl PoolKind {
    /// Short name for logs
    pub const fn name(self) -> &'static str {
        match self {
            PoolKind::Temporary => "temporary",
            PoolKind::Reusable => "reusable",
        }
    }
}

/// An insertion-ordered list of allocations
#[derive(Debug, Default)]
pub struct AllocationList {
    entries: Vec<Arc<Allocation>>,
}

impl AllocationList {
    /// Create an empty list
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append an allocation
    pub fn push(&mut self, allocation: Arc<Allocation>) {
        self.entries.push(allocation);
    }

    /// Detach the first entry matching `predicate`
    pub fn detach_first<F>(&mut self, mut predicate: F) -> Option<Arc<Allocation>>
    where
        F: FnMut(&Allocation) -> bool,
    {
        let index = self.entries.iter().position(|a| predicate(a))?;
        Some(self.entries.remove(index))
    }

    /// Detach the entry with `id`
    pub fn remove(&mut self, id: AllocationHandle) -> Option<Arc<Allocation>> {
        self.detach_first(|a| a.id() == id)
    }

    /// Whether an entry with `id` is present
    pub fn contains(&self, id: AllocationHandle) -> bool {
        self.entries.iter().any(|a| a.id() == id)
    }

    /// Detach every entry for which `release` returns true
    pub fn split_off_where<F>(&mut self, mut release: F) -> Vec<Arc<Allocation>>
    where
        F: FnMut(&Allocation) -> bool,
    {
        let mut released = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for allocation in self.entries.drain(..) {
            if release(&allocation) {
                released.push(allocation);
            } else {
                kept.push(allocation);
            }
        }
        self.entries = kept;
        released
    }

    /// Remove every entry
    pub fn take_all(&mut self) -> Vec<Arc<Allocation>> {
        core::mem::take(&mut self.entries)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of entry sizes
    pub fn total_size(&self) -> ByteSize {
        ByteSize::from_bytes(self.entries.iter().map(|a| a.size().as_bytes()).sum())
    }

    /// Iterate entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Allocation>> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationKind;
    use crate::manager::MemoryManager;

    #[test]
    fn test_detach_first_in_order() {
        let manager = MemoryManager::with_host_memory();
        let small = manager
            .allocate(ByteSize::KIB_4, 0, AllocationKind::Buffer)
            .unwrap();
        let large = manager
            .allocate(ByteSize::KIB_64, 0, AllocationKind::Buffer)
            .unwrap();

        let mut list = AllocationList::new();
        list.push(Arc::clone(&small));
        list.push(Arc::clone(&large));
        assert_eq!(list.total_size(), ByteSize::from_kib(68));

        let found = list.detach_first(|a| a.size() >= ByteSize::KIB_4).unwrap();
        assert_eq!(found.id(), small.id());
        assert_eq!(list.len(), 1);
        assert!(list.contains(large.id()));
        assert!(list.remove(small.id()).is_none());
    }

    #[test]
    fn test_split_off_where() {
        let manager = MemoryManager::with_host_memory();
        let mut list = AllocationList::new();
        for size in [1u64, 2, 3] {
            list.push(
                manager
                    .allocate(ByteSize::from_kib(size * 4), 0, AllocationKind::Buffer)
                    .unwrap(),
            );
        }
        let released = list.split_off_where(|a| a.size() > ByteSize::KIB_4);
        assert_eq!(released.len(), 2);
        assert_eq!(list.len(), 1);
        assert!(list.take_all().len() == 1 && list.is_empty());
    }
}
