//! # Ember Core Types
//!
//! Fundamental type definitions used across the submission core.
//!
//! These types provide:
//! - Strong typing for GPU addresses and sizes
//! - Submission numbers and their sentinels
//! - Submission context and engine identifiers

use core::fmt;
use core::ops::{Add, Sub};

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU Virtual Address
///
/// This is an address in the GPU's virtual address space.
/// It is NOT a CPU pointer and cannot be dereferenced directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Create a null GPU address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check alignment
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }

    /// Align up to boundary
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl Add<u64> for GpuAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<GpuAddr> for GpuAddr {
    type Output = u64;

    fn sub(self, rhs: GpuAddr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// SIZE TYPES
// =============================================================================

/// Size in bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero size
    pub const ZERO: Self = Self(0);
    /// 4 KiB
    pub const KIB_4: Self = Self(4 * 1024);
    /// 64 KiB
    pub const KIB_64: Self = Self(64 * 1024);
    /// 4 GiB (internal heap window)
    pub const GIB_4: Self = Self(4 * 1024 * 1024 * 1024);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from KiB
    #[inline]
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * 1024)
    }

    /// Create from MiB
    #[inline]
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Create from GiB
    #[inline]
    pub const fn from_gib(gib: u64) -> Self {
        Self(gib * 1024 * 1024 * 1024)
    }

    /// Get as bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Get as `usize` (host-side lengths)
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Align up
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 * 1024 {
            write!(f, "{} GiB", self.0 / (1024 * 1024 * 1024))
        } else if self.0 >= 1024 * 1024 {
            write!(f, "{} MiB", self.0 / (1024 * 1024))
        } else if self.0 >= 1024 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// HANDLE TYPES
// =============================================================================

/// Opaque handle to a GPU resource
///
/// Handles are type-safe wrappers that prevent mixing different resource types.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Handle<T> {
    id: u64,
    _marker: core::marker::PhantomData<T>,
}

impl<T> Handle<T> {
    /// Create a new handle
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            _marker: core::marker::PhantomData,
        }
    }

    /// Create a null handle
    #[inline]
    pub const fn null() -> Self {
        Self::new(0)
    }

    /// Get the raw ID
    #[inline]
    pub const fn id(self) -> u64 {
        self.id
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.id == 0
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handle<{}>(0x{:x})",
            core::any::type_name::<T>(),
            self.id
        )
    }
}

/// Marker for allocation handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AllocationMarker;

/// Handle to a device-memory allocation
pub type AllocationHandle = Handle<AllocationMarker>;

// =============================================================================
// TASK COUNTS
// =============================================================================

/// Submission number
///
/// Assigned at flush time, strictly increasing per engine. The device writes
/// the highest retired value to the completion tag.
pub type TaskCount = u32;

/// Completion marker of an allocation that no submission ever referenced
pub const NOT_USED: TaskCount = TaskCount::MAX;

/// Residency marker of an allocation that is in no residency set
pub const NOT_RESIDENT: TaskCount = TaskCount::MAX;

/// Tag value the device starts from
pub const INITIAL_HARDWARE_TAG: TaskCount = 0;

// =============================================================================
// SUBMISSION CONTEXTS
// =============================================================================

/// Maximum number of submission contexts sharing one memory manager
pub const MAX_CONTEXTS: usize = 8;

/// Identifier of a submission context registered with a memory manager
///
/// Each command stream receiver owns exactly one context. Allocations keep
/// their completion and residency markers per context.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ContextId(u32);

impl ContextId {
    /// Create a context id, rejecting indices past [`MAX_CONTEXTS`]
    #[inline]
    pub const fn new(index: u32) -> Option<Self> {
        if (index as usize) < MAX_CONTEXTS {
            Some(Self(index))
        } else {
            None
        }
    }

    /// Slot index into per-context arrays
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextId({})", self.0)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

// =============================================================================
// ENGINES
// =============================================================================

/// Hardware engine a batch is submitted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EngineType {
    /// Render/compute command streamer
    #[default]
    Render,
    /// Dedicated compute command streamer
    Compute,
    /// Blitter / copy engine
    Copy,
}

impl EngineType {
    /// Short name for logs
    pub const fn name(self) -> &'static str {
        match self {
            EngineType::Render => "rcs",
            EngineType::Compute => "ccs",
            EngineType::Copy => "bcs",
        }
    }
}

// =============================================================================
// STATIC ASSERTIONS
// =============================================================================

static_assertions::assert_impl_all!(GpuAddr: Send, Sync, Copy);
static_assertions::assert_impl_all!(ByteSize: Send, Sync, Copy);
static_assertions::assert_impl_all!(ContextId: Send, Sync, Copy);
static_assertions::const_assert!(NOT_USED > INITIAL_HARDWARE_TAG);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_addr_alignment() {
        let addr = GpuAddr::new(0x1001);
        assert!(!addr.is_aligned(0x1000));
        assert_eq!(addr.align_up(0x1000), GpuAddr::new(0x2000));
        assert_eq!(GpuAddr::new(0x3000) - GpuAddr::new(0x1000), 0x2000);
    }

    #[test]
    fn test_byte_size_display() {
        assert_eq!(alloc::format!("{}", ByteSize::from_kib(64)), "64 KiB");
        assert_eq!(ByteSize::from_bytes(4097).align_up(4096).as_bytes(), 8192);
    }

    #[test]
    fn test_context_id_bounds() {
        assert!(ContextId::new(0).is_some());
        assert_eq!(ContextId::new(3).map(ContextId::index), Some(3));
        assert!(ContextId::new(MAX_CONTEXTS as u32).is_none());
    }
}
