//! # Ember Command Submission
//!
//! Growable command streams and indirect heaps, batch buffers, and the
//! command stream receiver that turns them into submissions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    CommandStreamReceiver<B>                     │
//! │                                                                 │
//! │  ┌──────────────┐  ┌────────────────────┐  ┌─────────────────┐  │
//! │  │ LinearStream │  │ IndirectHeap x4    │  │ ResidencyTracker│  │
//! │  │ (commands)   │  │ (dsh/ioh/ssh/gsh)  │  │ (ember-mem)     │  │
//! │  └──────┬───────┘  └─────────┬──────────┘  └────────┬────────┘  │
//! │         └──────────────┬─────┴──────────────────────┘           │
//! │                  ┌─────┴───────┐     ┌──────────────────────┐   │
//! │                  │ BatchBuffer │────►│ SubmissionAggregator │   │
//! │                  └─────┬───────┘     │ (batched dispatch)   │   │
//! │                        │             └──────────┬───────────┘   │
//! │                  ┌─────┴────────────────────────┴───────────┐   │
//! │                  │          SubmissionBackend (B)           │   │
//! │                  └──────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//!              │ Arc<MemoryManager>            ▲ CompletionTag
//!              ▼                               │ (written by device)
//! ```
//!
//! ## Counters
//!
//! | Counter          | Advanced by                          |
//! |------------------|--------------------------------------|
//! | `task_count`     | every accepted flush                 |
//! | `latest_sent`    | every accepted flush                 |
//! | `latest_flushed` | hand-off to the hardware             |
//! | tag value        | the device, on retirement            |
//!
//! In immediate dispatch all three host counters move together.

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod batch;
pub mod config;
pub mod heap;
pub mod receiver;
pub mod stream;
pub mod submit;

// Re-exports
pub use batch::{BatchBuffer, BatchFlags, ChainedSegment, PendingBatch, SubmissionAggregator};
pub use config::{DispatchMode, EngineConfig};
pub use heap::{HeapKind, IndirectHeap};
pub use receiver::CommandStreamReceiver;
pub use stream::LinearStream;
pub use submit::{SoftwareBackend, SubmissionBackend, SubmissionRecord};
