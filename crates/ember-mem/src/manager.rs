//! # Allocation Lifecycle Manager
//!
//! Sole owner of the shared allocation pools. Every submission context that
//! uses the same device goes through one [`MemoryManager`], passed by
//! reference; there is no global instance.
//!
//! ## Pools
//!
//! - **Temporary**: allocations released by their owner while the device may
//!   still read them. Freed once every context that used them has retired.
//! - **Reusable**: backings of streams and heaps that outgrew them. Handed
//!   back by [`MemoryManager::obtain_reusable`] once retired.
//!
//! Both pools sit behind a single lock. Operations that need to scan and
//! then mutate do so under one acquisition, so nothing re-enters the lock.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use ember_core::memory::regions;
use ember_core::{
    AddressingMode, AllocFlags, AllocationHandle, AllocationStatus, ByteSize, ContextId, Error,
    Result, TaskCount, VaRange, INITIAL_HARDWARE_TAG, MAX_CONTEXTS, NOT_USED,
};

use crate::allocation::{Allocation, AllocationKind, AllocationRequest};
use crate::backing::{Backing, BackingAllocator, HostMemoryBacking};
use crate::list::{AllocationList, PoolKind};
use crate::tag::CompletionTag;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Memory manager configuration
#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    /// Free instead of pooling on `store_for_reuse`
    pub disable_resource_recycling: bool,
    /// Size of the 32-bit internal heap window (host backing)
    pub internal_heap_size: ByteSize,
    /// Full-range VA window (host backing)
    pub full_range: VaRange,
}

impl ManagerConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            disable_resource_recycling: false,
            internal_heap_size: ByteSize::GIB_4,
            full_range: regions::FULL,
        }
    }

    /// Apply `EMBER_DISABLE_RESOURCE_RECYCLING` from the environment
    #[cfg(feature = "std")]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("EMBER_DISABLE_RESOURCE_RECYCLING") {
            match value.trim() {
                "1" | "true" => self.disable_resource_recycling = true,
                "0" | "false" => self.disable_resource_recycling = false,
                other => log::warn!(
                    "ignoring EMBER_DISABLE_RESOURCE_RECYCLING={:?}",
                    other
                ),
            }
        }
        self
    }

    /// Internal heap window derived from `internal_heap_size`
    pub fn internal_range(&self) -> VaRange {
        VaRange::new(regions::INTERNAL_HEAP.start, self.internal_heap_size)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Memory manager statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct ManagerStats {
    /// Bytes currently backed
    pub memory_in_use: u64,
    /// Live allocations
    pub allocation_count: usize,
    /// Entries in the temporary pool
    pub temporary_count: usize,
    /// Entries in the reusable pool
    pub reusable_count: usize,
    /// Requests served from the reusable pool
    pub reuse_hits: u64,
    /// Requests the reusable pool could not serve
    pub reuse_misses: u64,
}

// =============================================================================
// MEMORY MANAGER
// =============================================================================

#[derive(Debug, Default)]
struct Pools {
    temporary: AllocationList,
    reusable: AllocationList,
}

impl Pools {
    fn list_mut(&mut self, pool: PoolKind) -> &mut AllocationList {
        match pool {
            PoolKind::Temporary => &mut self.temporary,
            PoolKind::Reusable => &mut self.reusable,
        }
    }
}

#[derive(Debug, Default)]
struct Contexts {
    registered: usize,
    tags: [Option<CompletionTag>; MAX_CONTEXTS],
    /// Last submission handed to the device by a released context
    released: [Option<TaskCount>; MAX_CONTEXTS],
}

impl Contexts {
    /// A released slot may be handed out again once everything its previous
    /// owner sent has retired
    fn recyclable(&self, slot: usize) -> bool {
        match (self.released[slot], &self.tags[slot]) {
            (Some(last), Some(tag)) => tag.is_retired(last),
            (Some(last), None) => last == INITIAL_HARDWARE_TAG,
            (None, _) => false,
        }
    }
}

/// Allocation lifecycle manager
#[derive(Debug)]
pub struct MemoryManager {
    config: ManagerConfig,
    backing: Arc<Backing>,
    pools: spin::Mutex<Pools>,
    contexts: spin::RwLock<Contexts>,
    next_id: AtomicU64,
    reuse_hits: AtomicU64,
    reuse_misses: AtomicU64,
}

impl MemoryManager {
    /// Create a manager over `allocator`
    pub fn new<A: BackingAllocator + 'static>(allocator: A, config: ManagerConfig) -> Self {
        Self {
            config,
            backing: Arc::new(Backing::new(Box::new(allocator))),
            pools: spin::Mutex::new(Pools::default()),
            contexts: spin::RwLock::new(Contexts::default()),
            next_id: AtomicU64::new(1),
            reuse_hits: AtomicU64::new(0),
            reuse_misses: AtomicU64::new(0),
        }
    }

    /// Manager over host memory with the default configuration
    pub fn with_host_memory() -> Self {
        Self::with_host_memory_config(ManagerConfig::default())
    }

    /// Manager over host memory laid out per `config`
    pub fn with_host_memory_config(config: ManagerConfig) -> Self {
        let backing = HostMemoryBacking::with_ranges(config.full_range, config.internal_range());
        Self::new(backing, config)
    }

    /// Configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // =========================================================================
    // Contexts
    // =========================================================================

    /// Register a submission context
    ///
    /// Fresh slots are used first; after that, a slot given up with
    /// [`release_context`](Self::release_context) is recycled once its
    /// previous owner's work has retired.
    pub fn register_context(&self) -> Result<ContextId> {
        let mut contexts = self.contexts.write();
        if let Some(ctx) = ContextId::new(contexts.registered as u32) {
            contexts.registered += 1;
            log::debug!("registered submission context {}", ctx);
            return Ok(ctx);
        }

        let slot = (0..MAX_CONTEXTS)
            .find(|&slot| contexts.recyclable(slot))
            .ok_or(Error::ContextLimitReached)?;
        let ctx = ContextId::new(slot as u32).ok_or(Error::ContextLimitReached)?;
        contexts.released[slot] = None;
        contexts.tags[slot] = None;
        log::debug!("recycled submission context {}", ctx);
        Ok(ctx)
    }

    /// Give up `ctx` after its owner handed `last_submission` to the device
    ///
    /// The tag stays bound so pooled allocations the context used still
    /// retire against it until the slot is recycled.
    pub fn release_context(&self, ctx: ContextId, last_submission: TaskCount) {
        log::debug!(
            "released submission context {} at submission {}",
            ctx,
            last_submission
        );
        self.contexts.write().released[ctx.index()] = Some(last_submission);
    }

    /// Bind the completion tag retirement checks use for `ctx`
    pub fn register_completion_tag(&self, ctx: ContextId, tag: CompletionTag) {
        log::debug!("context {} tag bound at {}", ctx, tag.gpu_addr());
        self.contexts.write().tags[ctx.index()] = Some(tag);
    }

    /// Completion tag bound to `ctx`
    pub fn completion_tag(&self, ctx: ContextId) -> Option<CompletionTag> {
        self.contexts.read().tags[ctx.index()].clone()
    }

    /// Whether every context that used `allocation` has retired its marker
    ///
    /// A context without a bound tag never retires anything.
    pub fn is_retired(&self, allocation: &Allocation) -> bool {
        let contexts = self.contexts.read();
        allocation.usage().all(|(ctx, marker)| {
            contexts.tags[ctx.index()]
                .as_ref()
                .is_some_and(|tag| tag.is_retired(marker))
        })
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate `size` bytes of `kind`; `alignment` 0 picks the kind default
    pub fn allocate(
        &self,
        size: ByteSize,
        alignment: u64,
        kind: AllocationKind,
    ) -> core::result::Result<Arc<Allocation>, AllocationStatus> {
        self.allocate_with_request(
            &AllocationRequest::new(size, kind).with_alignment(alignment),
        )
    }

    /// Allocate a heap inside the 32-bit internal window
    pub fn allocate_internal(
        &self,
        size: ByteSize,
    ) -> core::result::Result<Arc<Allocation>, AllocationStatus> {
        self.allocate(size, 0, AllocationKind::InternalHeap)
    }

    /// Wrap caller-owned host memory for device access
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `size` bytes until the
    /// returned allocation (and every clone of it) is dropped.
    pub unsafe fn allocate_with_host_ptr(
        &self,
        size: ByteSize,
        ptr: NonNull<u8>,
    ) -> core::result::Result<Arc<Allocation>, AllocationStatus> {
        let mut request = AllocationRequest::new(size, AllocationKind::BufferHostMemory)
            .with_flags(AllocFlags::HOST_PTR);
        request.host_ptr = Some(ptr);
        self.allocate_with_request(&request)
    }

    /// Allocate per an explicit request
    pub fn allocate_with_request(
        &self,
        request: &AllocationRequest,
    ) -> core::result::Result<Arc<Allocation>, AllocationStatus> {
        let memory = self.backing.allocate(request).map_err(|status| {
            log::warn!(
                "{} allocation of {} failed: {}",
                request.kind.name(),
                request.size,
                status
            );
            status
        })?;

        let id = AllocationHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        log::trace!(
            "allocated {} {:?} ({}) at {}",
            request.kind.name(),
            id,
            memory.size(),
            memory.gpu_addr()
        );
        Ok(Arc::new(Allocation::new(
            id,
            request.kind,
            request.flags,
            memory,
            Arc::clone(&self.backing),
        )))
    }

    // =========================================================================
    // Pools
    // =========================================================================

    /// Detach the first retired reusable entry of at least `min_size`
    pub fn obtain_reusable(
        &self,
        min_size: ByteSize,
        addressing: AddressingMode,
    ) -> Option<Arc<Allocation>> {
        let found = self.pools.lock().reusable.detach_first(|a| {
            a.size() >= min_size && a.addressing_mode() == addressing && self.is_retired(a)
        });

        match &found {
            Some(allocation) => {
                allocation.increment_reuse_count();
                self.reuse_hits.fetch_add(1, Ordering::Relaxed);
                log::trace!(
                    "reusing {:?} ({}) for {} request",
                    allocation.id(),
                    allocation.size(),
                    min_size
                );
            }
            None => {
                self.reuse_misses.fetch_add(1, Ordering::Relaxed);
            }
        }
        found
    }

    /// Park `allocation` in the reusable pool
    ///
    /// Its completion markers stay as they are; `obtain_reusable` skips it
    /// until they retire. With recycling disabled it is released instead.
    pub fn store_for_reuse(&self, allocation: Arc<Allocation>) {
        if self.config.disable_resource_recycling {
            self.check_gpu_usage_and_destroy(allocation);
            return;
        }
        log::trace!("storing {:?} for reuse", allocation.id());
        self.pools.lock().reusable.push(allocation);
    }

    /// Park `allocation` until submission `marker` of `ctx` retires
    pub fn store_temporary(&self, allocation: Arc<Allocation>, ctx: ContextId, marker: TaskCount) {
        allocation.update_task_count(marker, ctx);
        log::trace!(
            "storing {:?} as temporary until {} reaches {}",
            allocation.id(),
            ctx,
            marker
        );
        self.pools.lock().temporary.push(allocation);
    }

    /// Free every entry of `pool` that `ctx` retired up to `required`
    ///
    /// `required` is capped at the value the `ctx` tag shows; without a tag
    /// nothing `ctx` used is released. Entries referenced by a later
    /// submission in `ctx`, or still in flight in another context, stay
    /// pooled. Returns the number released.
    pub fn reclaim_retired(&self, ctx: ContextId, required: TaskCount, pool: PoolKind) -> usize {
        let observed = self.completion_tag(ctx).map(|tag| tag.value());
        let limit = observed.map(|value| value.min(required));
        if limit != Some(required) {
            log::trace!(
                "{} reclaim capped at {:?} (asked for {})",
                ctx,
                limit,
                required
            );
        }

        let released = self.pools.lock().list_mut(pool).split_off_where(|a| {
            let marker = a.task_count(ctx);
            if marker != NOT_USED && limit.map_or(true, |limit| marker > limit) {
                return false;
            }
            self.is_retired_outside(a, ctx)
        });

        let count = released.len();
        log::debug!(
            "reclaimed {} {} allocations for {} up to {}",
            count,
            pool.name(),
            ctx,
            required
        );
        count
    }

    fn is_retired_outside(&self, allocation: &Allocation, ctx: ContextId) -> bool {
        let contexts = self.contexts.read();
        allocation
            .usage()
            .filter(|(other, _)| *other != ctx)
            .all(|(other, marker)| {
                contexts.tags[other.index()]
                    .as_ref()
                    .is_some_and(|tag| tag.is_retired(marker))
            })
    }

    /// Free `allocation` now if the device is done with it, else park it
    pub fn check_gpu_usage_and_destroy(&self, allocation: Arc<Allocation>) {
        if self.is_retired(&allocation) {
            log::trace!("destroying retired {:?}", allocation.id());
            drop(allocation);
        } else {
            log::trace!("deferring destruction of {:?}", allocation.id());
            self.pools.lock().temporary.push(allocation);
        }
    }

    /// Drop `allocation` from both pools and release the caller's reference
    pub fn free_allocation(&self, allocation: Arc<Allocation>) {
        let id = allocation.id();
        {
            let mut pools = self.pools.lock();
            pools.temporary.remove(id);
            pools.reusable.remove(id);
        }
        log::trace!("freed {:?}", id);
    }

    /// Hand an eviction set to the backing allocator
    pub fn process_eviction(
        &self,
        eviction_set: Vec<Arc<Allocation>>,
    ) -> core::result::Result<(), AllocationStatus> {
        if eviction_set.is_empty() {
            return Ok(());
        }
        log::debug!("evicting {} allocations", eviction_set.len());
        self.backing.evict(&eviction_set)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Bytes currently backed across all allocations of this manager
    pub fn memory_in_use(&self) -> u64 {
        self.backing.memory_in_use()
    }

    /// Live allocations
    pub fn allocation_count(&self) -> usize {
        self.backing.allocation_count()
    }

    /// Entries in `pool`
    pub fn pool_len(&self, pool: PoolKind) -> usize {
        self.pools.lock().list_mut(pool).len()
    }

    /// Whether `pool` holds the allocation `id`
    pub fn pool_contains(&self, pool: PoolKind, id: AllocationHandle) -> bool {
        self.pools.lock().list_mut(pool).contains(id)
    }

    /// Snapshot of counters
    pub fn stats(&self) -> ManagerStats {
        let pools = self.pools.lock();
        ManagerStats {
            memory_in_use: self.memory_in_use(),
            allocation_count: self.allocation_count(),
            temporary_count: pools.temporary.len(),
            reusable_count: pools.reusable.len(),
            reuse_hits: self.reuse_hits.load(Ordering::Relaxed),
            reuse_misses: self.reuse_misses.load(Ordering::Relaxed),
        }
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        let pools = self.pools.get_mut();
        let temporary = pools.temporary.take_all();
        let reusable = pools.reusable.take_all();
        log::debug!(
            "memory manager teardown: {} temporary, {} reusable",
            temporary.len(),
            reusable.len()
        );
    }
}

static_assertions::assert_impl_all!(MemoryManager: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_context() -> (MemoryManager, ContextId, CompletionTag) {
        let manager = MemoryManager::with_host_memory();
        let ctx = manager.register_context().unwrap();
        let tag_allocation = manager
            .allocate(ByteSize::KIB_4, 0, AllocationKind::TagBuffer)
            .unwrap();
        let tag = CompletionTag::new(tag_allocation).unwrap();
        manager.register_completion_tag(ctx, tag.clone());
        (manager, ctx, tag)
    }

    #[test]
    fn test_reuse_waits_for_retirement() {
        let (manager, ctx, tag) = manager_with_context();
        let stream = manager
            .allocate(ByteSize::KIB_64, 0, AllocationKind::LinearStream)
            .unwrap();
        let id = stream.id();
        stream.update_task_count(10, ctx);
        manager.store_for_reuse(stream);

        tag.signal(9);
        assert!(manager
            .obtain_reusable(ByteSize::KIB_64, AddressingMode::Full)
            .is_none());

        tag.signal(10);
        let reused = manager
            .obtain_reusable(ByteSize::KIB_64, AddressingMode::Full)
            .unwrap();
        assert_eq!(reused.id(), id);
        assert_eq!(reused.reuse_count(), 1);
        assert!(tag.value() >= reused.task_count(ctx));
        assert_eq!(manager.pool_len(PoolKind::Reusable), 0);
    }

    #[test]
    fn test_reuse_matches_size_and_addressing() {
        let (manager, _ctx, _tag) = manager_with_context();
        let internal = manager.allocate_internal(ByteSize::KIB_64).unwrap();
        manager.store_for_reuse(internal);
        let small = manager
            .allocate(ByteSize::KIB_4, 0, AllocationKind::LinearStream)
            .unwrap();
        manager.store_for_reuse(small);

        assert!(manager
            .obtain_reusable(ByteSize::KIB_64, AddressingMode::Full)
            .is_none());
        let found = manager
            .obtain_reusable(ByteSize::KIB_4, AddressingMode::Internal32)
            .unwrap();
        assert_eq!(found.addressing_mode(), AddressingMode::Internal32);
        assert_eq!(manager.stats().reuse_misses, 1);
        assert_eq!(manager.stats().reuse_hits, 1);
    }

    #[test]
    fn test_untagged_context_never_retires() {
        let manager = MemoryManager::with_host_memory();
        let ctx = manager.register_context().unwrap();
        let buffer = manager
            .allocate(ByteSize::KIB_4, 0, AllocationKind::Buffer)
            .unwrap();
        assert!(manager.is_retired(&buffer));
        buffer.update_task_count(1, ctx);
        assert!(!manager.is_retired(&buffer));
    }

    #[test]
    fn test_reclaim_temporary() {
        let (manager, ctx, tag) = manager_with_context();
        for marker in [3, 5, 8] {
            let buffer = manager
                .allocate(ByteSize::KIB_4, 0, AllocationKind::Buffer)
                .unwrap();
            manager.store_temporary(buffer, ctx, marker);
        }
        let before = manager.allocation_count();

        tag.signal(5);
        assert_eq!(manager.reclaim_retired(ctx, 5, PoolKind::Temporary), 2);
        assert_eq!(manager.pool_len(PoolKind::Temporary), 1);
        assert_eq!(manager.allocation_count(), before - 2);
    }

    #[test]
    fn test_reclaim_keeps_other_context_usage() {
        let (manager, a, tag_a) = manager_with_context();
        let b = manager.register_context().unwrap();
        let tag_b = CompletionTag::new(
            manager
                .allocate(ByteSize::KIB_4, 0, AllocationKind::TagBuffer)
                .unwrap(),
        )
        .unwrap();
        manager.register_completion_tag(b, tag_b.clone());

        let shared = manager
            .allocate(ByteSize::KIB_4, 0, AllocationKind::Buffer)
            .unwrap();
        let id = shared.id();
        shared.update_task_count(4, b);
        manager.store_temporary(shared, a, 2);

        tag_a.signal(2);
        assert_eq!(manager.reclaim_retired(a, 2, PoolKind::Temporary), 0);
        assert!(manager.pool_contains(PoolKind::Temporary, id));

        tag_b.signal(4);
        assert_eq!(manager.reclaim_retired(a, 2, PoolKind::Temporary), 1);
    }

    #[test]
    fn test_check_gpu_usage_and_destroy() {
        let (manager, ctx, tag) = manager_with_context();
        let busy = manager
            .allocate(ByteSize::KIB_4, 0, AllocationKind::Buffer)
            .unwrap();
        busy.update_task_count(1, ctx);
        let idle = manager
            .allocate(ByteSize::KIB_4, 0, AllocationKind::Buffer)
            .unwrap();
        let count = manager.allocation_count();

        manager.check_gpu_usage_and_destroy(idle);
        assert_eq!(manager.allocation_count(), count - 1);

        manager.check_gpu_usage_and_destroy(busy);
        assert_eq!(manager.pool_len(PoolKind::Temporary), 1);
        tag.signal(1);
        assert_eq!(manager.reclaim_retired(ctx, 1, PoolKind::Temporary), 1);
    }

    #[test]
    fn test_disable_recycling_frees() {
        let config = ManagerConfig {
            disable_resource_recycling: true,
            ..ManagerConfig::default()
        };
        let manager = MemoryManager::with_host_memory_config(config);
        let stream = manager
            .allocate(ByteSize::KIB_4, 0, AllocationKind::LinearStream)
            .unwrap();
        manager.store_for_reuse(stream);
        assert_eq!(manager.pool_len(PoolKind::Reusable), 0);
        assert_eq!(manager.memory_in_use(), 0);
    }

    #[test]
    fn test_free_allocation_detaches() {
        let (manager, _ctx, _tag) = manager_with_context();
        let stream = manager
            .allocate(ByteSize::KIB_4, 0, AllocationKind::LinearStream)
            .unwrap();
        manager.store_for_reuse(Arc::clone(&stream));
        manager.free_allocation(stream);
        assert_eq!(manager.pool_len(PoolKind::Reusable), 0);
    }

    #[test]
    fn test_host_ptr_allocation() {
        let manager = MemoryManager::with_host_memory();
        let mut storage = [0u32; 16];
        let ptr = NonNull::new(storage.as_mut_ptr().cast::<u8>()).unwrap();
        // SAFETY: storage outlives the allocation
        let wrapped = unsafe { manager.allocate_with_host_ptr(ByteSize::from_bytes(64), ptr) }
            .unwrap();
        assert_eq!(wrapped.kind(), AllocationKind::BufferHostMemory);
        assert_eq!(wrapped.cpu_ptr(), Some(ptr));

        // SAFETY: as above
        let misaligned = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(2)) };
        // SAFETY: as above
        let status = unsafe { manager.allocate_with_host_ptr(ByteSize::from_bytes(8), misaligned) };
        assert_eq!(status.err(), Some(AllocationStatus::InvalidHostPointer));
    }

    #[test]
    fn test_context_limit() {
        let manager = MemoryManager::with_host_memory();
        for _ in 0..MAX_CONTEXTS {
            manager.register_context().unwrap();
        }
        assert_eq!(
            manager.register_context(),
            Err(Error::ContextLimitReached)
        );
    }

    #[test]
    fn test_reclaim_capped_at_observed_tag() {
        let (manager, ctx, tag) = manager_with_context();
        let buffer = manager
            .allocate(ByteSize::KIB_4, 0, AllocationKind::Buffer)
            .unwrap();
        manager.store_temporary(buffer, ctx, 5);

        tag.signal(3);
        assert_eq!(manager.reclaim_retired(ctx, 5, PoolKind::Temporary), 0);
        assert_eq!(manager.pool_len(PoolKind::Temporary), 1);

        tag.signal(5);
        assert_eq!(manager.reclaim_retired(ctx, 5, PoolKind::Temporary), 1);
    }

    #[test]
    fn test_reclaim_without_tag_keeps_used_entries() {
        let manager = MemoryManager::with_host_memory();
        let ctx = manager.register_context().unwrap();
        let buffer = manager
            .allocate(ByteSize::KIB_4, 0, AllocationKind::Buffer)
            .unwrap();
        manager.store_temporary(buffer, ctx, 0);
        assert_eq!(manager.reclaim_retired(ctx, 0, PoolKind::Temporary), 0);
    }

    #[test]
    fn test_context_slot_recycled_after_retirement() {
        let manager = MemoryManager::with_host_memory();
        let contexts: Vec<ContextId> = (0..MAX_CONTEXTS)
            .map(|_| manager.register_context().unwrap())
            .collect();
        let reused = contexts[3];
        let tag = CompletionTag::new(
            manager
                .allocate(ByteSize::KIB_4, 0, AllocationKind::TagBuffer)
                .unwrap(),
        )
        .unwrap();
        manager.register_completion_tag(reused, tag.clone());

        tag.signal(2);
        manager.release_context(reused, 3);
        assert_eq!(
            manager.register_context(),
            Err(Error::ContextLimitReached)
        );

        tag.signal(3);
        assert_eq!(manager.register_context(), Ok(reused));
        assert!(manager.completion_tag(reused).is_none());
        assert_eq!(
            manager.register_context(),
            Err(Error::ContextLimitReached)
        );

        // nothing was ever sent from this one
        manager.release_context(contexts[5], 0);
        assert_eq!(manager.register_context(), Ok(contexts[5]));
    }

    #[test]
    fn test_concurrent_contexts_share_pools() {
        use core::sync::atomic::{AtomicBool, AtomicU32};
        use std::thread;

        const ROUNDS: TaskCount = 200;

        let manager = Arc::new(MemoryManager::with_host_memory());
        let mut workers = Vec::new();
        let mut devices = Vec::new();

        for _ in 0..2 {
            let ctx = manager.register_context().unwrap();
            let tag = CompletionTag::new(
                manager
                    .allocate(ByteSize::KIB_4, 0, AllocationKind::TagBuffer)
                    .unwrap(),
            )
            .unwrap();
            manager.register_completion_tag(ctx, tag.clone());
            let submitted = Arc::new(AtomicU32::new(0));
            let done = Arc::new(AtomicBool::new(false));

            // stands in for the device: retires whatever was submitted, late
            devices.push({
                let (tag, submitted, done) = (tag.clone(), Arc::clone(&submitted), Arc::clone(&done));
                thread::spawn(move || {
                    while !done.load(Ordering::Acquire) {
                        tag.signal(submitted.load(Ordering::Acquire));
                        thread::yield_now();
                    }
                    tag.signal(submitted.load(Ordering::Acquire));
                })
            });

            workers.push({
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    for submission in 1..=ROUNDS {
                        let stream = match manager
                            .obtain_reusable(ByteSize::KIB_4, AddressingMode::Full)
                        {
                            Some(stream) => {
                                for (user, marker) in stream.usage() {
                                    let observed = manager.completion_tag(user).unwrap().value();
                                    assert!(observed >= marker, "{} at {} < {}", user, observed, marker);
                                }
                                stream
                            }
                            None => manager
                                .allocate(ByteSize::KIB_4, 0, AllocationKind::LinearStream)
                                .unwrap(),
                        };
                        stream.update_task_count(submission, ctx);
                        manager.store_for_reuse(stream);

                        let scratch = manager
                            .allocate(ByteSize::KIB_4, 0, AllocationKind::Buffer)
                            .unwrap();
                        manager.store_temporary(scratch, ctx, submission);
                        submitted.store(submission, Ordering::Release);

                        manager.reclaim_retired(ctx, tag.value(), PoolKind::Temporary);
                    }
                    done.store(true, Ordering::Release);
                    ctx
                })
            });
        }

        let contexts: Vec<ContextId> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        for device in devices {
            device.join().unwrap();
        }

        for ctx in contexts {
            manager.reclaim_retired(ctx, ROUNDS, PoolKind::Temporary);
        }
        assert_eq!(manager.pool_len(PoolKind::Temporary), 0);

        let pooled = manager.pool_len(PoolKind::Reusable);
        let mut drained = 0;
        while manager
            .obtain_reusable(ByteSize::KIB_4, AddressingMode::Full)
            .is_some()
        {
            drained += 1;
        }
        assert_eq!(drained, pooled);
    }
}
