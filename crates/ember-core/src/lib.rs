//! # Ember Core
//!
//! Foundational types, errors, and synchronization primitives shared by the
//! allocation lifecycle layer and the command submission layer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ember-core                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Types     │  │   Memory    │  │     Sync            │  │
//! │  │ (GpuAddr,   │  │ (AllocFlags,│  │  (TagWord, Clock,   │  │
//! │  │  TaskCount) │  │  VaRange)   │  │   wait_for)         │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! │                   ┌─────────────────────┐                   │
//! │                   │       Error         │                   │
//! │                   └─────────────────────┘                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything above this crate compares submission numbers ([`TaskCount`])
//! against a single device-written tag word. The helpers in [`sync`] are the
//! only place where the host blocks on that word.

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod memory;
pub mod sync;
pub mod types;

// Re-exports for convenience
pub use error::{AllocationStatus, Error, Result};
pub use memory::{AddressingMode, AllocFlags, MemoryConstants, VaRange};
pub use types::*;
