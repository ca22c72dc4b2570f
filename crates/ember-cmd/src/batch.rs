//! # Batch Buffers
//!
//! A finished slice of a command stream on its way to the hardware, and the
//! queue batched dispatch keeps them in until they are sent.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use ember_core::{EngineType, GpuAddr, TaskCount};
use ember_mem::Allocation;

bitflags::bitflags! {
    /// Batch submission flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BatchFlags: u32 {
        /// Make host writes coherent before the device reads
        const REQUIRES_COHERENCY = 1 << 0;
        /// Submit at low priority
        const LOW_PRIORITY = 1 << 1;
        /// Commands continue in chained segments
        const CHAINED = 1 << 2;
    }
}

/// A later piece of a batch, in a backing the stream moved to
#[derive(Debug, Clone)]
pub struct ChainedSegment {
    /// Allocation holding the commands
    pub command_buffer: Arc<Allocation>,
    /// End of the commands; segments start at offset 0
    pub used_size: usize,
}

/// A command buffer slice ready for submission
///
/// When the command stream was rebacked while the batch was being written,
/// the commands continue in `chain`, executed in order after the first
/// slice.
#[derive(Debug, Clone)]
pub struct BatchBuffer {
    /// Allocation holding the commands
    pub command_buffer: Arc<Allocation>,
    /// Offset of the first command
    pub start_offset: usize,
    /// End of the commands (exclusive offset)
    pub used_size: usize,
    /// Continuations in later backings
    pub chain: Vec<ChainedSegment>,
    /// Target engine
    pub engine: EngineType,
    /// Submission number; assigned when the batch is flushed
    pub task_count: TaskCount,
    /// Submission flags
    pub flags: BatchFlags,
}

impl BatchBuffer {
    /// Batch over `[start_offset, used_size)` of `command_buffer`
    pub fn new(
        command_buffer: Arc<Allocation>,
        start_offset: usize,
        used_size: usize,
        engine: EngineType,
    ) -> Self {
        Self {
            command_buffer,
            start_offset,
            used_size,
            chain: Vec::new(),
            engine,
            task_count: 0,
            flags: BatchFlags::empty(),
        }
    }

    /// With flags
    pub fn with_flags(mut self, flags: BatchFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Continue the batch at the start of `command_buffer`
    pub fn push_segment(&mut self, command_buffer: Arc<Allocation>, used_size: usize) {
        self.chain.push(ChainedSegment {
            command_buffer,
            used_size,
        });
        self.flags |= BatchFlags::CHAINED;
    }

    /// Every allocation holding commands of this batch
    pub fn command_buffers(&self) -> impl Iterator<Item = &Arc<Allocation>> + '_ {
        core::iter::once(&self.command_buffer).chain(self.chain.iter().map(|s| &s.command_buffer))
    }

    /// Device address of the first command
    pub fn gpu_start(&self) -> GpuAddr {
        self.command_buffer.gpu_addr().offset(self.start_offset as u64)
    }

    /// Command bytes across the first slice and every segment
    pub fn len(&self) -> usize {
        let first = self.used_size.saturating_sub(self.start_offset);
        first + self.chain.iter().map(|s| s.used_size).sum::<usize>()
    }

    /// Whether the slice is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// SUBMISSION AGGREGATOR
// =============================================================================

/// A recorded flush awaiting hand-off
#[derive(Debug)]
pub struct PendingBatch {
    /// The batch, with its submission number set
    pub batch: BatchBuffer,
    /// Residency list captured at flush time
    pub residency: Vec<Arc<Allocation>>,
}

/// FIFO of recorded flushes for batched dispatch
#[derive(Debug, Default)]
pub struct SubmissionAggregator {
    pending: VecDeque<PendingBatch>,
}

impl SubmissionAggregator {
    /// Create an empty aggregator
    pub const fn new() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }

    /// Record a flush
    pub fn record(&mut self, batch: BatchBuffer, residency: Vec<Arc<Allocation>>) {
        log::trace!(
            "recording batch {} ({} bytes, {} resident)",
            batch.task_count,
            batch.len(),
            residency.len()
        );
        self.pending.push_back(PendingBatch { batch, residency });
    }

    /// Oldest recorded flush
    pub fn front(&self) -> Option<&PendingBatch> {
        self.pending.front()
    }

    /// Remove the oldest recorded flush
    pub fn pop_front(&mut self) -> Option<PendingBatch> {
        self.pending.pop_front()
    }

    /// Number of recorded flushes
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is recorded
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Highest recorded submission number
    pub fn last_task_count(&self) -> Option<TaskCount> {
        self.pending.back().map(|p| p.batch.task_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::ByteSize;
    use ember_mem::{AllocationKind, MemoryManager};

    #[test]
    fn test_batch_geometry() {
        let manager = MemoryManager::with_host_memory();
        let cs = manager
            .allocate(ByteSize::KIB_4, 0, AllocationKind::LinearStream)
            .unwrap();
        let base = cs.gpu_addr();
        let batch = BatchBuffer::new(cs, 64, 192, EngineType::Render)
            .with_flags(BatchFlags::LOW_PRIORITY);
        assert_eq!(batch.gpu_start(), base.offset(64));
        assert_eq!(batch.len(), 128);
        assert!(batch.flags.contains(BatchFlags::LOW_PRIORITY));
    }

    #[test]
    fn test_chained_segments_add_up() {
        let manager = MemoryManager::with_host_memory();
        let first = manager
            .allocate(ByteSize::KIB_4, 0, AllocationKind::LinearStream)
            .unwrap();
        let second = manager
            .allocate(ByteSize::KIB_64, 0, AllocationKind::LinearStream)
            .unwrap();
        let second_id = second.id();

        let mut batch = BatchBuffer::new(first, 1000, 4000, EngineType::Render);
        assert!(!batch.flags.contains(BatchFlags::CHAINED));
        batch.push_segment(second, 96);
        assert!(batch.flags.contains(BatchFlags::CHAINED));
        assert_eq!(batch.len(), 3096);
        let ids: Vec<_> = batch.command_buffers().map(|a| a.id()).collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[1], second_id);
    }

    #[test]
    fn test_aggregator_is_fifo() {
        let manager = MemoryManager::with_host_memory();
        let cs = manager
            .allocate(ByteSize::KIB_4, 0, AllocationKind::LinearStream)
            .unwrap();
        let mut aggregator = SubmissionAggregator::new();
        for task_count in 1..=3 {
            let mut batch = BatchBuffer::new(Arc::clone(&cs), 0, 64, EngineType::Compute);
            batch.task_count = task_count;
            aggregator.record(batch, Vec::new());
        }
        assert_eq!(aggregator.pending_count(), 3);
        assert_eq!(aggregator.last_task_count(), Some(3));
        assert_eq!(aggregator.pop_front().unwrap().batch.task_count, 1);
        assert_eq!(aggregator.front().unwrap().batch.task_count, 2);
    }
}
