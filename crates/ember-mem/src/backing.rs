//! # Backing Allocators
//!
//! The seam between the lifecycle manager and whatever actually produces
//! device-addressable memory (a kernel driver, a hypervisor channel, host
//! RAM in tests).

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use ember_core::memory::{regions, MemoryConstants};
use ember_core::{AddressingMode, AllocationStatus, ByteSize, GpuAddr, VaRange};

use crate::address_space::AddressSpace;
use crate::allocation::{Allocation, AllocationRequest};

// =============================================================================
// BACKING MEMORY
// =============================================================================

/// Memory produced by a [`BackingAllocator`]
///
/// Owned by exactly one [`Allocation`] and handed back to the allocator when
/// that allocation is dropped.
#[derive(Debug)]
pub struct BackingMemory {
    cpu_ptr: Option<NonNull<u8>>,
    gpu_range: VaRange,
    size: ByteSize,
    alignment: u64,
    addressing: AddressingMode,
    host_owned: bool,
}

impl BackingMemory {
    /// Describe a piece of backing memory
    ///
    /// `host_owned` marks caller-owned memory that must not be freed on
    /// release.
    pub fn new(
        cpu_ptr: Option<NonNull<u8>>,
        gpu_range: VaRange,
        size: ByteSize,
        alignment: u64,
        addressing: AddressingMode,
        host_owned: bool,
    ) -> Self {
        Self {
            cpu_ptr,
            gpu_range,
            size,
            alignment,
            addressing,
            host_owned,
        }
    }

    /// CPU mapping
    pub fn cpu_ptr(&self) -> Option<NonNull<u8>> {
        self.cpu_ptr
    }

    /// Device virtual address
    pub fn gpu_addr(&self) -> GpuAddr {
        self.gpu_range.start
    }

    /// Reserved VA range (page granular)
    pub fn gpu_range(&self) -> VaRange {
        self.gpu_range
    }

    /// Usable size
    pub fn size(&self) -> ByteSize {
        self.size
    }

    /// Alignment of the CPU mapping
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// VA window
    pub fn addressing_mode(&self) -> AddressingMode {
        self.addressing
    }

    /// Whether the memory belongs to the caller
    pub fn is_host_owned(&self) -> bool {
        self.host_owned
    }
}

// =============================================================================
// BACKING ALLOCATOR TRAIT
// =============================================================================

/// Producer of device-addressable memory
pub trait BackingAllocator: Send + Sync + fmt::Debug {
    /// Allocate memory for `request`, or report why not
    fn allocate(&self, request: &AllocationRequest) -> Result<BackingMemory, AllocationStatus>;

    /// Return memory obtained from [`allocate`](Self::allocate)
    fn release(&self, memory: BackingMemory);

    /// Physically evict allocations that left every residency set
    fn evict(&self, allocations: &[Arc<Allocation>]) -> Result<(), AllocationStatus> {
        let _ = allocations;
        Ok(())
    }
}

impl<T: BackingAllocator + ?Sized> BackingAllocator for Arc<T> {
    fn allocate(&self, request: &AllocationRequest) -> Result<BackingMemory, AllocationStatus> {
        (**self).allocate(request)
    }

    fn release(&self, memory: BackingMemory) {
        (**self).release(memory)
    }

    fn evict(&self, allocations: &[Arc<Allocation>]) -> Result<(), AllocationStatus> {
        (**self).evict(allocations)
    }
}

// =============================================================================
// SHARED BACKING
// =============================================================================

/// Backing allocator plus the usage counters every allocation reports into
#[derive(Debug)]
pub(crate) struct Backing {
    allocator: Box<dyn BackingAllocator>,
    memory_in_use: AtomicU64,
    allocation_count: AtomicUsize,
}

impl Backing {
    pub(crate) fn new(allocator: Box<dyn BackingAllocator>) -> Self {
        Self {
            allocator,
            memory_in_use: AtomicU64::new(0),
            allocation_count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn allocate(
        &self,
        request: &AllocationRequest,
    ) -> Result<BackingMemory, AllocationStatus> {
        let memory = self.allocator.allocate(request)?;
        self.memory_in_use
            .fetch_add(memory.size().as_bytes(), Ordering::Relaxed);
        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        Ok(memory)
    }

    pub(crate) fn release(&self, memory: BackingMemory) {
        self.memory_in_use
            .fetch_sub(memory.size().as_bytes(), Ordering::Relaxed);
        self.allocation_count.fetch_sub(1, Ordering::Relaxed);
        self.allocator.release(memory);
    }

    pub(crate) fn evict(&self, allocations: &[Arc<Allocation>]) -> Result<(), AllocationStatus> {
        self.allocator.evict(allocations)
    }

    pub(crate) fn memory_in_use(&self) -> u64 {
        self.memory_in_use.load(Ordering::Relaxed)
    }

    pub(crate) fn allocation_count(&self) -> usize {
        self.allocation_count.load(Ordering::Relaxed)
    }
}

// =============================================================================
// HOST MEMORY BACKING
// =============================================================================

/// Backing allocator over the global heap
///
/// Memory is zeroed and aligned; GPU addresses come from a full-range VA
/// space and a separate 32-bit internal window. Useful for software
/// submission and tests.
pub struct HostMemoryBacking {
    full: spin::Mutex<AddressSpace>,
    internal: spin::Mutex<AddressSpace>,
    /// Refuse allocations that would exceed this many bytes
    limit: Option<u64>,
    in_use: AtomicU64,
    evicted: AtomicU64,
}

impl HostMemoryBacking {
    /// Unlimited host backing with the standard VA windows
    pub fn new() -> Self {
        Self::with_ranges(regions::FULL, regions::INTERNAL_HEAP)
    }

    /// Host backing over explicit VA windows
    pub fn with_ranges(full: VaRange, internal: VaRange) -> Self {
        Self {
            full: spin::Mutex::new(AddressSpace::new(full)),
            internal: spin::Mutex::new(AddressSpace::new(internal)),
            limit: None,
            in_use: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Cap the number of bytes this backing hands out
    pub fn with_limit(mut self, bytes: u64) -> Self {
        self.limit = Some(bytes);
        self
    }

    /// Bytes currently allocated
    pub fn in_use(&self) -> u64 {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Allocations passed to [`BackingAllocator::evict`] so far
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn space(&self, mode: AddressingMode) -> &spin::Mutex<AddressSpace> {
        match mode {
            AddressingMode::Full => &self.full,
            AddressingMode::Internal32 => &self.internal,
        }
    }

    fn reserve_va(
        &self,
        mode: AddressingMode,
        size: ByteSize,
        alignment: u64,
    ) -> Result<VaRange, AllocationStatus> {
        self.space(mode).lock().reserve(size, alignment).map_err(|e| {
            log::warn!("VA reservation of {} failed: {}", size, e);
            AllocationStatus::Error
        })
    }

    fn wrap_host_ptr(
        &self,
        request: &AllocationRequest,
        ptr: NonNull<u8>,
    ) -> Result<BackingMemory, AllocationStatus> {
        if (ptr.as_ptr() as usize as u64) % MemoryConstants::HOST_PTR_ALIGNMENT != 0 {
            return Err(AllocationStatus::InvalidHostPointer);
        }
        let mode = request.addressing_mode();
        let range = self.reserve_va(mode, request.size, MemoryConstants::PAGE_SIZE)?;
        Ok(BackingMemory::new(
            Some(ptr),
            range,
            request.size,
            MemoryConstants::HOST_PTR_ALIGNMENT,
            mode,
            true,
        ))
    }
}

impl Default for HostMemoryBacking {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostMemoryBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemoryBacking")
            .field("limit", &self.limit)
            .field("in_use", &self.in_use())
            .finish()
    }
}

impl BackingAllocator for HostMemoryBacking {
    fn allocate(&self, request: &AllocationRequest) -> Result<BackingMemory, AllocationStatus> {
        if request.size.as_bytes() == 0 {
            return Err(AllocationStatus::Error);
        }
        if let Some(ptr) = request.host_ptr {
            return self.wrap_host_ptr(request, ptr);
        }

        let size = request.size.as_bytes();
        if let Some(limit) = self.limit {
            if self.in_use().saturating_add(size) > limit {
                return Err(AllocationStatus::Error);
            }
        }

        let alignment = request.effective_alignment();
        let layout = Layout::from_size_align(request.size.as_usize(), alignment as usize)
            .map_err(|_| AllocationStatus::Error)?;

        let mode = request.addressing_mode();
        let range = self.reserve_va(mode, request.size, alignment)?;

        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            if let Err(e) = self.space(mode).lock().release(range) {
                log::warn!("releasing VA range {:?} after failed allocation: {}", range, e);
            }
            return Err(AllocationStatus::Error);
        };

        self.in_use.fetch_add(size, Ordering::Relaxed);
        Ok(BackingMemory::new(
            Some(ptr),
            range,
            request.size,
            alignment,
            mode,
            false,
        ))
    }

    fn release(&self, memory: BackingMemory) {
        if let Err(e) = self
            .space(memory.addressing_mode())
            .lock()
            .release(memory.gpu_range())
        {
            log::warn!("releasing unknown VA range {:?}: {}", memory.gpu_range(), e);
        }

        if memory.is_host_owned() {
            return;
        }
        let Some(ptr) = memory.cpu_ptr() else {
            return;
        };
        match Layout::from_size_align(memory.size().as_usize(), memory.alignment() as usize) {
            // SAFETY: same pointer and layout as the allocation in `allocate`
            Ok(layout) => unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) },
            Err(_) => log::warn!("leaking host memory with invalid layout"),
        }
        self.in_use
            .fetch_sub(memory.size().as_bytes(), Ordering::Relaxed);
    }

    fn evict(&self, allocations: &[Arc<Allocation>]) -> Result<(), AllocationStatus> {
        self.evicted
            .fetch_add(allocations.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

static_assertions::assert_impl_all!(HostMemoryBacking: Send, Sync);
