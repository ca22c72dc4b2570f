//! # Indirect Heaps
//!
//! Linear streams holding state the command stream points at.

use alloc::sync::Arc;
use core::ops::{Deref, DerefMut};

use ember_core::memory::regions;
use ember_core::{AddressingMode, GpuAddr};
use ember_mem::Allocation;

use crate::stream::LinearStream;

/// Indirect heap kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// Dynamic state (samplers, blend state, interface descriptors)
    DynamicState,
    /// Indirect objects (kernel arguments, curbe)
    IndirectObject,
    /// Surface state (binding tables, surface descriptors)
    SurfaceState,
    /// General state (scratch)
    GeneralState,
}

impl HeapKind {
    /// Number of heap kinds
    pub const COUNT: usize = 4;

    /// All kinds in slot order
    pub const ALL: [HeapKind; Self::COUNT] = [
        HeapKind::DynamicState,
        HeapKind::IndirectObject,
        HeapKind::SurfaceState,
        HeapKind::GeneralState,
    ];

    /// Slot index
    pub const fn index(self) -> usize {
        match self {
            HeapKind::DynamicState => 0,
            HeapKind::IndirectObject => 1,
            HeapKind::SurfaceState => 2,
            HeapKind::GeneralState => 3,
        }
    }

    /// Short name for logs
    pub const fn name(self) -> &'static str {
        match self {
            HeapKind::DynamicState => "dsh",
            HeapKind::IndirectObject => "ioh",
            HeapKind::SurfaceState => "ssh",
            HeapKind::GeneralState => "gsh",
        }
    }
}

/// A linear stream bound to a heap kind
#[derive(Debug)]
pub struct IndirectHeap {
    kind: HeapKind,
    stream: LinearStream,
}

impl IndirectHeap {
    /// Unbound heap of `kind`
    pub const fn new(kind: HeapKind) -> Self {
        Self {
            kind,
            stream: LinearStream::new(),
        }
    }

    /// Heap over `allocation` exposing `max_size` bytes
    pub fn with_allocation(kind: HeapKind, allocation: Arc<Allocation>, max_size: usize) -> Self {
        Self {
            kind,
            stream: LinearStream::with_allocation(allocation, max_size),
        }
    }

    /// Heap kind
    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    /// Whether the backing lives in the 32-bit internal window
    pub fn is_internal(&self) -> bool {
        self.stream
            .allocation()
            .is_some_and(|a| a.addressing_mode() == AddressingMode::Internal32)
    }

    /// Base address state pointers are relative to
    ///
    /// Internal heaps share the window base; others are their own base.
    pub fn heap_gpu_base(&self) -> GpuAddr {
        if self.is_internal() {
            regions::INTERNAL_HEAP.start
        } else {
            self.stream.gpu_base()
        }
    }

    /// Offset of the heap start from [`heap_gpu_base`](Self::heap_gpu_base)
    pub fn heap_gpu_start_offset(&self) -> u64 {
        self.stream.gpu_base() - self.heap_gpu_base()
    }
}

impl Deref for IndirectHeap {
    type Target = LinearStream;

    fn deref(&self) -> &LinearStream {
        &self.stream
    }
}

impl DerefMut for IndirectHeap {
    fn deref_mut(&mut self) -> &mut LinearStream {
        &mut self.stream
    }
}
