//! # Submission Backends
//!
//! The hardware hand-off seam, and a software backend that completes work
//! on the host.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use ember_core::{EngineType, Error, GpuAddr, Result, TaskCount};
use ember_mem::{Allocation, CompletionTag};

use crate::batch::BatchBuffer;

/// Hardware submission primitive
///
/// Accepts a finished batch plus the allocations that must be resident for
/// it. A failed hand-off must leave device state untouched.
pub trait SubmissionBackend: fmt::Debug {
    /// Hand `batch` to the hardware
    fn submit(&mut self, batch: &BatchBuffer, residency: &[Arc<Allocation>]) -> Result<()>;

    /// Learn where the device must write retired submission numbers
    fn set_tag(&mut self, tag: &CompletionTag) {
        let _ = tag;
    }

    /// Make host writes to `allocation` visible to the device
    fn make_coherent(&mut self, allocation: &Allocation) {
        let _ = allocation;
    }
}

// =============================================================================
// SOFTWARE BACKEND
// =============================================================================

/// One accepted submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionRecord {
    /// Submission number
    pub task_count: TaskCount,
    /// Engine
    pub engine: EngineType,
    /// Address of the first command
    pub gpu_start: GpuAddr,
    /// Command bytes
    pub len: usize,
    /// Command buffers the batch spans
    pub segments: usize,
    /// Allocations in the residency list
    pub residency_count: usize,
}

/// Backend that "executes" each batch by writing its number to the tag
#[derive(Debug)]
pub struct SoftwareBackend {
    tag: Option<CompletionTag>,
    auto_complete: bool,
    fail_next: bool,
    log: Vec<SubmissionRecord>,
    coherency_requests: usize,
}

impl SoftwareBackend {
    /// Backend that retires every batch on submission
    pub fn new() -> Self {
        Self {
            tag: None,
            auto_complete: true,
            fail_next: false,
            log: Vec::new(),
            coherency_requests: 0,
        }
    }

    /// Backend that accepts batches but leaves the tag alone
    pub fn deferred() -> Self {
        Self {
            auto_complete: false,
            ..Self::new()
        }
    }

    /// Reject the next submission
    pub fn fail_next_submission(&mut self) {
        self.fail_next = true;
    }

    /// Accepted submissions in order
    pub fn submissions(&self) -> &[SubmissionRecord] {
        &self.log
    }

    /// Number of `make_coherent` calls seen
    pub fn coherency_requests(&self) -> usize {
        self.coherency_requests
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SubmissionBackend for SoftwareBackend {
    fn submit(&mut self, batch: &BatchBuffer, residency: &[Arc<Allocation>]) -> Result<()> {
        if core::mem::take(&mut self.fail_next) {
            return Err(Error::SubmissionFailed);
        }

        self.log.push(SubmissionRecord {
            task_count: batch.task_count,
            engine: batch.engine,
            gpu_start: batch.gpu_start(),
            len: batch.len(),
            segments: 1 + batch.chain.len(),
            residency_count: residency.len(),
        });

        if self.auto_complete {
            if let Some(tag) = &self.tag {
                tag.signal(batch.task_count);
            }
        }
        Ok(())
    }

    fn set_tag(&mut self, tag: &CompletionTag) {
        self.tag = Some(tag.clone());
    }

    fn make_coherent(&mut self, _allocation: &Allocation) {
        self.coherency_requests += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::ByteSize;
    use ember_mem::{AllocationKind, MemoryManager};

    #[test]
    fn test_software_backend_signals_tag() {
        let manager = MemoryManager::with_host_memory();
        let tag = CompletionTag::new(
            manager
                .allocate(ByteSize::KIB_4, 0, AllocationKind::TagBuffer)
                .unwrap(),
        )
        .unwrap();
        let cs = manager
            .allocate(ByteSize::KIB_4, 0, AllocationKind::LinearStream)
            .unwrap();

        let mut backend = SoftwareBackend::new();
        backend.set_tag(&tag);
        let mut batch = BatchBuffer::new(cs, 0, 32, EngineType::Render);
        batch.task_count = 4;
        backend.submit(&batch, &[]).unwrap();
        assert_eq!(tag.value(), 4);
        assert_eq!(backend.submissions()[0].len, 32);

        backend.fail_next_submission();
        batch.task_count = 5;
        assert_eq!(backend.submit(&batch, &[]), Err(Error::SubmissionFailed));
        assert_eq!(tag.value(), 4);
        assert_eq!(backend.submissions().len(), 1);
    }
}
