//! # Allocations
//!
//! The unit of device-addressable memory and its per-context usage markers.
//!
//! An [`Allocation`] is shared as `Arc<Allocation>` between the memory
//! manager's pools, streams, residency sets and callers. Identity, size and
//! addresses are fixed at creation; everything that changes per submission
//! is atomic so that readers in other contexts never need the manager lock.

use alloc::sync::Arc;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use ember_core::{
    AddressingMode, AllocFlags, AllocationHandle, ByteSize, ContextId, GpuAddr, MemoryConstants,
    TaskCount, MAX_CONTEXTS, NOT_RESIDENT, NOT_USED,
};

use crate::backing::{Backing, BackingMemory};

// =============================================================================
// ALLOCATION KIND
// =============================================================================

/// What an allocation is used for
///
/// The closed set of kinds drives the few decisions that depend on usage:
/// which VA window the memory must live in and its default alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    /// Backing of a command stream or a non-internal indirect heap
    LinearStream,
    /// Generic device buffer
    Buffer,
    /// Buffer wrapping caller-owned host memory
    BufferHostMemory,
    /// Image storage
    Image,
    /// Heap addressed through the 32-bit internal window
    InternalHeap,
    /// Completion tag word
    TagBuffer,
    /// Anything else
    Unknown,
}

impl AllocationKind {
    /// VA window required by this kind
    pub const fn addressing_mode(self) -> AddressingMode {
        match self {
            AllocationKind::InternalHeap => AddressingMode::Internal32,
            AllocationKind::LinearStream
            | AllocationKind::Buffer
            | AllocationKind::BufferHostMemory
            | AllocationKind::Image
            | AllocationKind::TagBuffer
            | AllocationKind::Unknown => AddressingMode::Full,
        }
    }

    /// Alignment used when the caller does not ask for one
    pub const fn default_alignment(self) -> u64 {
        match self {
            AllocationKind::LinearStream
            | AllocationKind::InternalHeap
            | AllocationKind::Image => MemoryConstants::PAGE_SIZE,
            AllocationKind::TagBuffer
            | AllocationKind::Buffer
            | AllocationKind::BufferHostMemory
            | AllocationKind::Unknown => MemoryConstants::CACHE_LINE_SIZE,
        }
    }

    /// Short name for logs
    pub const fn name(self) -> &'static str {
        match self {
            AllocationKind::LinearStream => "linear-stream",
            AllocationKind::Buffer => "buffer",
            AllocationKind::BufferHostMemory => "buffer-host-memory",
            AllocationKind::Image => "image",
            AllocationKind::InternalHeap => "internal-heap",
            AllocationKind::TagBuffer => "tag-buffer",
            AllocationKind::Unknown => "unknown",
        }
    }
}

// =============================================================================
// ALLOCATION REQUEST
// =============================================================================

/// Parameters handed to a backing allocator
#[derive(Debug, Clone, Copy)]
pub struct AllocationRequest {
    /// Requested size in bytes
    pub size: ByteSize,
    /// Alignment (power of two); `0` selects the kind's default
    pub alignment: u64,
    /// Usage kind
    pub kind: AllocationKind,
    /// Allocation flags
    pub flags: AllocFlags,
    /// Caller-owned memory to wrap instead of allocating
    pub host_ptr: Option<NonNull<u8>>,
}

impl AllocationRequest {
    /// Request for fresh memory of `kind`
    pub fn new(size: ByteSize, kind: AllocationKind) -> Self {
        Self {
            size,
            alignment: 0,
            kind,
            flags: AllocFlags::default(),
            host_ptr: None,
        }
    }

    /// With explicit alignment
    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    /// With flags
    pub fn with_flags(mut self, flags: AllocFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Alignment actually applied
    pub fn effective_alignment(&self) -> u64 {
        if self.alignment == 0 {
            self.kind.default_alignment()
        } else {
            self.alignment
        }
    }

    /// VA window required by the request
    pub fn addressing_mode(&self) -> AddressingMode {
        self.kind.addressing_mode()
    }
}

// =============================================================================
// ALLOCATION
// =============================================================================

/// A unit of GPU-addressable memory
pub struct Allocation {
    id: AllocationHandle,
    kind: AllocationKind,
    size: ByteSize,
    gpu_addr: GpuAddr,
    cpu_ptr: Option<NonNull<u8>>,
    flags: AllocFlags,
    /// Last submission per context that referenced this allocation
    task_count: [AtomicU32; MAX_CONTEXTS],
    /// Submission per context this allocation is resident for
    residency_task_count: [AtomicU32; MAX_CONTEXTS],
    reuse_count: AtomicU32,
    evictable: AtomicBool,
    memory: Option<BackingMemory>,
    backing: Arc<Backing>,
}

impl Allocation {
    pub(crate) fn new(
        id: AllocationHandle,
        kind: AllocationKind,
        flags: AllocFlags,
        memory: BackingMemory,
        backing: Arc<Backing>,
    ) -> Self {
        Self {
            id,
            kind,
            size: memory.size(),
            gpu_addr: memory.gpu_addr(),
            cpu_ptr: memory.cpu_ptr(),
            flags,
            task_count: core::array::from_fn(|_| AtomicU32::new(NOT_USED)),
            residency_task_count: core::array::from_fn(|_| AtomicU32::new(NOT_RESIDENT)),
            reuse_count: AtomicU32::new(0),
            evictable: AtomicBool::new(true),
            memory: Some(memory),
            backing,
        }
    }

    /// Unique id
    #[inline]
    pub fn id(&self) -> AllocationHandle {
        self.id
    }

    /// Usage kind
    #[inline]
    pub fn kind(&self) -> AllocationKind {
        self.kind
    }

    /// Size in bytes
    #[inline]
    pub fn size(&self) -> ByteSize {
        self.size
    }

    /// Device virtual address
    #[inline]
    pub fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    /// CPU mapping, if the memory is host-visible
    #[inline]
    pub fn cpu_ptr(&self) -> Option<NonNull<u8>> {
        self.cpu_ptr
    }

    /// VA window the allocation lives in
    #[inline]
    pub fn addressing_mode(&self) -> AddressingMode {
        self.kind.addressing_mode()
    }

    /// Allocation flags
    #[inline]
    pub fn flags(&self) -> AllocFlags {
        self.flags
    }

    /// Whether the CPU mapping is cached
    #[inline]
    pub fn is_cacheable(&self) -> bool {
        !self.flags.contains(AllocFlags::UNCACHEABLE)
    }

    // =========================================================================
    // Completion markers
    // =========================================================================

    /// Last submission in `ctx` that referenced this allocation
    #[inline]
    pub fn task_count(&self, ctx: ContextId) -> TaskCount {
        self.task_count[ctx.index()].load(Ordering::Acquire)
    }

    /// Record that submission `task_count` in `ctx` references this allocation
    #[inline]
    pub fn update_task_count(&self, task_count: TaskCount, ctx: ContextId) {
        self.task_count[ctx.index()].store(task_count, Ordering::Release);
    }

    /// Whether any context ever referenced this allocation
    pub fn is_used(&self) -> bool {
        self.task_count
            .iter()
            .any(|tc| tc.load(Ordering::Acquire) != NOT_USED)
    }

    /// Whether `ctx` referenced this allocation
    #[inline]
    pub fn is_used_by(&self, ctx: ContextId) -> bool {
        self.task_count(ctx) != NOT_USED
    }

    /// Contexts with a completion marker set, with their marker
    pub fn usage(&self) -> impl Iterator<Item = (ContextId, TaskCount)> + '_ {
        self.task_count.iter().enumerate().filter_map(|(i, tc)| {
            let value = tc.load(Ordering::Acquire);
            let ctx = ContextId::new(i as u32)?;
            (value != NOT_USED).then_some((ctx, value))
        })
    }

    // =========================================================================
    // Residency markers
    // =========================================================================

    /// Submission in `ctx` this allocation is resident for
    #[inline]
    pub fn residency_task_count(&self, ctx: ContextId) -> TaskCount {
        self.residency_task_count[ctx.index()].load(Ordering::Acquire)
    }

    /// Mark resident in `ctx` up to submission `task_count`
    #[inline]
    pub fn update_residency_task_count(&self, task_count: TaskCount, ctx: ContextId) {
        self.residency_task_count[ctx.index()].store(task_count, Ordering::Release);
    }

    /// Whether the residency marker in `ctx` is below `task_count`
    #[inline]
    pub fn is_residency_task_count_below(&self, task_count: TaskCount, ctx: ContextId) -> bool {
        let current = self.residency_task_count(ctx);
        current == NOT_RESIDENT || current < task_count
    }

    /// Whether the allocation is in a residency set of `ctx`
    #[inline]
    pub fn is_resident(&self, ctx: ContextId) -> bool {
        self.residency_task_count(ctx) != NOT_RESIDENT
    }

    /// Drop residency in `ctx`; the completion marker is kept
    #[inline]
    pub fn release_residency(&self, ctx: ContextId) {
        self.update_residency_task_count(NOT_RESIDENT, ctx);
    }

    // =========================================================================
    // Reuse and eviction
    // =========================================================================

    /// How many times the allocation was taken from a reuse pool
    #[inline]
    pub fn reuse_count(&self) -> u32 {
        self.reuse_count.load(Ordering::Relaxed)
    }

    pub(crate) fn increment_reuse_count(&self) {
        self.reuse_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether a later non-residency may evict the allocation
    #[inline]
    pub fn is_evictable(&self) -> bool {
        self.evictable.load(Ordering::Acquire)
    }

    /// Set the evictable flag
    #[inline]
    pub fn set_evictable(&self, evictable: bool) {
        self.evictable.store(evictable, Ordering::Release);
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("gpu_addr", &self.gpu_addr)
            .field("reuse_count", &self.reuse_count())
            .finish()
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if let Some(memory) = self.memory.take() {
            log::trace!("releasing {} allocation {:?}", self.kind.name(), self.id);
            self.backing.release(memory);
        }
    }
}

// SAFETY: the CPU pointer is owned by the allocation for its whole lifetime;
// all mutable per-submission state is atomic
unsafe impl Send for Allocation {}
// SAFETY: see above; shared access never writes through `cpu_ptr`
unsafe impl Sync for Allocation {}

static_assertions::assert_impl_all!(Allocation: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::HostMemoryBacking;

    fn allocation(kind: AllocationKind) -> Arc<Allocation> {
        let backing = Arc::new(Backing::new(alloc::boxed::Box::new(
            HostMemoryBacking::new(),
        )));
        let memory = backing
            .allocate(&AllocationRequest::new(ByteSize::KIB_4, kind))
            .unwrap();
        Arc::new(Allocation::new(
            AllocationHandle::new(1),
            kind,
            AllocFlags::default(),
            memory,
            backing,
        ))
    }

    #[test]
    fn test_kind_decisions() {
        assert_eq!(
            AllocationKind::InternalHeap.addressing_mode(),
            AddressingMode::Internal32
        );
        assert_eq!(
            AllocationKind::LinearStream.addressing_mode(),
            AddressingMode::Full
        );
        assert_eq!(AllocationKind::Image.default_alignment(), 4096);
        let request = AllocationRequest::new(ByteSize::KIB_4, AllocationKind::Buffer);
        assert_eq!(request.effective_alignment(), 64);
        assert_eq!(request.with_alignment(256).effective_alignment(), 256);
    }

    #[test]
    fn test_fresh_allocation_state() {
        let gfx = allocation(AllocationKind::Buffer);
        let ctx = ContextId::new(0).unwrap();
        assert!(!gfx.is_used());
        assert!(!gfx.is_resident(ctx));
        assert!(gfx.is_evictable());
        assert!(gfx.is_cacheable());
        assert_eq!(gfx.reuse_count(), 0);
        assert!(gfx.cpu_ptr().is_some());
    }

    #[test]
    fn test_markers_are_per_context() {
        let gfx = allocation(AllocationKind::Buffer);
        let a = ContextId::new(0).unwrap();
        let b = ContextId::new(1).unwrap();

        gfx.update_task_count(4, a);
        assert!(gfx.is_used_by(a));
        assert!(!gfx.is_used_by(b));
        assert_eq!(gfx.usage().collect::<alloc::vec::Vec<_>>(), [(a, 4)]);

        gfx.update_residency_task_count(4, a);
        assert!(gfx.is_resident(a));
        assert!(gfx.is_residency_task_count_below(5, a));
        assert!(!gfx.is_residency_task_count_below(4, a));

        gfx.release_residency(a);
        assert!(!gfx.is_resident(a));
        assert_eq!(gfx.task_count(a), 4);
    }

    #[test]
    fn test_drop_releases_backing() {
        let gfx = allocation(AllocationKind::Buffer);
        let backing = Arc::clone(&gfx.backing);
        assert_eq!(backing.memory_in_use(), 4096);
        drop(gfx);
        assert_eq!(backing.memory_in_use(), 0);
        assert_eq!(backing.allocation_count(), 0);
    }
}
