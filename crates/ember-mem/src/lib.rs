//! # Ember Memory Management
//!
//! Allocation lifecycle: allocations, the backing-allocator seam, reuse
//! pools, residency sets and the completion tag.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Ember Memory System                        │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                     MemoryManager                         │  │
//! │  │   (temporary + reusable pools, context tag registry)      │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │             │                                  │                │
//! │  ┌──────────┴──────────┐           ┌───────────┴────────────┐   │
//! │  │  Arc<Allocation>    │           │  ResidencyTracker      │   │
//! │  │  (per-context       │◄──────────│  (per engine, no lock) │   │
//! │  │   markers, RAII)    │           └────────────────────────┘   │
//! │  └──────────┬──────────┘                                        │
//! │  ┌──────────┴────────────────────────────────────────────────┐  │
//! │  │        BackingAllocator (host memory + VA spaces)         │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Retirement
//!
//! An allocation may be reused or freed only after the device has retired
//! the last submission that referenced it in every context. Pools keep
//! unretired entries and skip them on lookup; nothing here waits.

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod address_space;
pub mod allocation;
pub mod backing;
pub mod list;
pub mod manager;
pub mod residency;
pub mod tag;

// Re-exports
pub use address_space::AddressSpace;
pub use allocation::{Allocation, AllocationKind, AllocationRequest};
pub use backing::{BackingAllocator, BackingMemory, HostMemoryBacking};
pub use list::{AllocationList, PoolKind};
pub use manager::{ManagerConfig, ManagerStats, MemoryManager};
pub use residency::ResidencyTracker;
pub use tag::CompletionTag;
