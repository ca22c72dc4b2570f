//! # Command Stream Receiver
//!
//! The per-engine coordinator between "commands have been written" and
//! "hardware has consumed them".
//!
//! ## Lifecycle of a submission
//!
//! 1. Callers reserve space with [`CommandStreamReceiver::get_cs`] and
//!    [`CommandStreamReceiver::get_indirect_heap`] and write into it.
//! 2. Every allocation the work touches goes through
//!    [`CommandStreamReceiver::make_resident`], which stamps it with the
//!    number the next flush will carry.
//! 3. [`CommandStreamReceiver::flush`] hands the batch and the residency set
//!    to the backend, advances the submission counter, and tears residency
//!    down again.
//! 4. The device writes retired numbers to the completion tag; waits and
//!    pool reclaims compare against it.
//!
//! A receiver is owned by one thread at a time. Shared state lives in the
//! [`MemoryManager`], passed in at construction.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;

use ember_core::memory::checked_align_up;
use ember_core::sync::CompletionWaiter;
use ember_core::{
    AllocationStatus, ByteSize, ContextId, EngineType, Error, MemoryConstants, Result, TaskCount,
    INITIAL_HARDWARE_TAG, NOT_USED,
};
use ember_mem::{
    Allocation, AllocationKind, CompletionTag, MemoryManager, PoolKind, ResidencyTracker,
};

use crate::batch::{BatchBuffer, ChainedSegment, SubmissionAggregator};
use crate::config::{DispatchMode, EngineConfig};
use crate::heap::{HeapKind, IndirectHeap};
use crate::stream::LinearStream;
use crate::submit::SubmissionBackend;

/// Size arithmetic that cannot be represented is resource exhaustion
const EXHAUSTED: Error = Error::Allocation(AllocationStatus::Error);

// =============================================================================
// COMMAND STREAM RECEIVER
// =============================================================================

/// Submission engine for one hardware engine
#[derive(Debug)]
pub struct CommandStreamReceiver<B: SubmissionBackend> {
    manager: Arc<MemoryManager>,
    backend: B,
    waiter: Box<dyn CompletionWaiter>,
    config: EngineConfig,
    dispatch_mode: DispatchMode,
    ctx: ContextId,
    engine: EngineType,

    /// Last submission number assigned
    task_count: TaskCount,
    /// Last submission number recorded by a flush
    latest_sent_task_count: TaskCount,
    /// Last submission number handed to the hardware
    latest_flushed_task_count: TaskCount,
    tag: Option<CompletionTag>,

    command_stream: LinearStream,
    /// Outgrown command stream backings holding unflushed commands, oldest first
    cs_segments: Vec<ChainedSegment>,
    /// Command stream cursor at the last `flush_task`
    cs_flushed_to: usize,
    heaps: [IndirectHeap; HeapKind::COUNT],
    residency: ResidencyTracker,
    aggregator: SubmissionAggregator,
    total_memory_used: u64,
}

impl<B: SubmissionBackend> CommandStreamReceiver<B> {
    /// Create a receiver that busy-polls the tag with the monotonic clock
    #[cfg(feature = "std")]
    pub fn new(
        manager: Arc<MemoryManager>,
        backend: B,
        engine: EngineType,
        config: EngineConfig,
    ) -> Result<Self> {
        let waiter = ember_core::sync::PollingWaiter::new(ember_core::sync::MonotonicClock);
        Self::with_waiter(manager, backend, engine, config, Box::new(waiter))
    }

    /// Create a receiver with an explicit wait strategy
    pub fn with_waiter(
        manager: Arc<MemoryManager>,
        backend: B,
        engine: EngineType,
        config: EngineConfig,
        waiter: Box<dyn CompletionWaiter>,
    ) -> Result<Self> {
        let ctx = manager.register_context()?;
        log::debug!(
            "command stream receiver for {} on {} ({:?} dispatch)",
            engine.name(),
            ctx,
            config.dispatch_mode
        );
        Ok(Self {
            manager,
            backend,
            waiter,
            config,
            dispatch_mode: config.dispatch_mode,
            ctx,
            engine,
            task_count: 0,
            latest_sent_task_count: 0,
            latest_flushed_task_count: 0,
            tag: None,
            command_stream: LinearStream::new(),
            cs_segments: Vec::new(),
            cs_flushed_to: 0,
            heaps: HeapKind::ALL.map(IndirectHeap::new),
            residency: ResidencyTracker::new(),
            aggregator: SubmissionAggregator::new(),
            total_memory_used: 0,
        })
    }

    // =========================================================================
    // Completion tag
    // =========================================================================

    /// Allocate a tag buffer, seed it with the initial value and bind it
    pub fn initialize_tag_allocation(&mut self) -> Result<()> {
        let allocation = self.manager.allocate(
            ByteSize::from_bytes(MemoryConstants::PAGE_SIZE),
            0,
            AllocationKind::TagBuffer,
        )?;
        let tag = CompletionTag::new(allocation)?;
        tag.signal(INITIAL_HARDWARE_TAG);
        self.set_tag_allocation(tag);
        Ok(())
    }

    /// Bind the completion tag
    pub fn set_tag_allocation(&mut self, tag: CompletionTag) {
        self.backend.set_tag(&tag);
        self.manager.register_completion_tag(self.ctx, tag.clone());
        self.tag = Some(tag);
    }

    /// Bound completion tag
    pub fn tag(&self) -> Option<&CompletionTag> {
        self.tag.as_ref()
    }

    // =========================================================================
    // Residency
    // =========================================================================

    /// Queue `allocation` for the next flush
    ///
    /// Repeated calls before that flush are no-ops.
    pub fn make_resident(&mut self, allocation: &Arc<Allocation>) {
        let submission = self.task_count + 1;
        if allocation.is_residency_task_count_below(submission, self.ctx) {
            if !allocation.is_resident(self.ctx) {
                self.total_memory_used += allocation.size().as_bytes();
            }
            self.residency.push_for_residency(Arc::clone(allocation));
            allocation.update_task_count(submission, self.ctx);
        }
        allocation.update_residency_task_count(submission, self.ctx);
    }

    /// Take `allocation` out of this engine's residency
    ///
    /// An evictable allocation is queued for eviction; otherwise it only
    /// becomes evictable, so the next non-residency evicts it. The completion
    /// marker is kept so pools still see the last submission that used it.
    pub fn make_non_resident(&mut self, allocation: &Arc<Allocation>) {
        if allocation.is_resident(self.ctx) {
            self.backend.make_coherent(allocation);
            if allocation.is_evictable() {
                self.residency.push_for_eviction(Arc::clone(allocation));
            } else {
                allocation.set_evictable(true);
            }
        }
        allocation.release_residency(self.ctx);
    }

    /// Post-flush residency teardown, then eviction
    ///
    /// With an override list, exactly those allocations go non-resident and
    /// the engine's own residency set is left alone.
    pub fn make_surface_pack_non_resident(
        &mut self,
        residency_override: Option<&[Arc<Allocation>]>,
    ) -> Result<()> {
        let set = match residency_override {
            Some(list) => list.to_vec(),
            None => self.residency.clear_residency_set(),
        };
        for allocation in &set {
            self.make_non_resident(allocation);
        }
        self.process_eviction()
    }

    /// Drain the eviction set through the memory manager
    pub fn process_eviction(&mut self) -> Result<()> {
        let set = self.residency.clear_eviction_set();
        self.manager.process_eviction(set)?;
        Ok(())
    }

    /// Residency and eviction sets being built
    pub fn residency(&self) -> &ResidencyTracker {
        &self.residency
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// Command stream with at least `min_required` writable bytes
    ///
    /// A stream that is too small is rebacked and its cursor restarts at
    /// zero. Commands written since the last [`flush_task`](Self::flush_task)
    /// stay pending in the old backing and are chained into the next one;
    /// a backing with nothing pending goes to the reusable pool, stamped
    /// with the current submission number.
    pub fn get_cs(&mut self, min_required: usize) -> Result<&mut LinearStream> {
        if self.command_stream.allocation().is_none()
            || self.command_stream.available_space() < min_required
        {
            let reserve = self.config.submission_reserve.as_bytes();
            let size = (min_required as u64)
                .checked_add(reserve)
                .and_then(|size| checked_align_up(size, MemoryConstants::PAGE_SIZE))
                .ok_or(EXHAUSTED)?;
            let required = size
                .checked_add(self.config.cs_overfetch_size.as_bytes())
                .ok_or(EXHAUSTED)?;
            let max_size = usize::try_from(size - reserve).map_err(|_| EXHAUSTED)?;

            let allocation =
                self.obtain_or_allocate(ByteSize::from_bytes(required), AllocationKind::LinearStream)?;
            log::debug!(
                "{} command stream grows to {} (backing {})",
                self.engine.name(),
                ByteSize::from_bytes(size - reserve),
                allocation.size()
            );

            let old_used = self.command_stream.used();
            if let Some(old) = self.command_stream.replace_buffer(allocation, max_size) {
                if old_used > self.cs_flushed_to {
                    log::trace!(
                        "{} chaining {} unflushed bytes in {:?}",
                        self.engine.name(),
                        old_used - self.cs_flushed_to,
                        old.id()
                    );
                    self.cs_segments.push(ChainedSegment {
                        command_buffer: old,
                        used_size: old_used,
                    });
                } else {
                    self.store_for_reuse(old);
                }
            }
            self.cs_flushed_to = 0;
        }
        Ok(&mut self.command_stream)
    }

    /// Indirect heap of `kind` with at least `min_required` writable bytes
    pub fn get_indirect_heap(
        &mut self,
        kind: HeapKind,
        min_required: usize,
    ) -> Result<&mut IndirectHeap> {
        let heap = &self.heaps[kind.index()];
        if heap.allocation().is_none() || heap.available_space() < min_required {
            self.allocate_heap_memory(kind, min_required)?;
        }
        Ok(&mut self.heaps[kind.index()])
    }

    fn allocate_heap_memory(&mut self, kind: HeapKind, min_required: usize) -> Result<()> {
        let default_size = match kind {
            HeapKind::SurfaceState => self.config.default_ssh_size,
            HeapKind::DynamicState | HeapKind::IndirectObject | HeapKind::GeneralState => {
                self.config.default_heap_size
            }
        };
        let internal = kind == HeapKind::IndirectObject && self.config.internal_heaps_supported;
        let allocation_kind = if internal {
            AllocationKind::InternalHeap
        } else {
            AllocationKind::LinearStream
        };

        let mut final_size = checked_align_up(
            default_size.as_bytes().max(min_required as u64),
            MemoryConstants::PAGE_SIZE,
        )
        .ok_or(EXHAUSTED)?;
        let allocation = self.obtain_or_allocate(ByteSize::from_bytes(final_size), allocation_kind)?;
        final_size = final_size.max(allocation.size().as_bytes());

        if kind == HeapKind::SurfaceState {
            final_size = self
                .config
                .max_ssh_size
                .as_bytes()
                .max(min_required as u64)
                .min(allocation.size().as_bytes());
        }

        log::debug!(
            "{} {} heap rebacked with {} ({} exposed)",
            self.engine.name(),
            kind.name(),
            allocation.size(),
            ByteSize::from_bytes(final_size)
        );
        let max_size = usize::try_from(final_size).map_err(|_| EXHAUSTED)?;
        if let Some(old) = self.heaps[kind.index()].replace_buffer(allocation, max_size) {
            self.store_for_reuse(old);
        }
        Ok(())
    }

    /// Return the backing of heap `kind` to the reusable pool
    pub fn release_indirect_heap(&mut self, kind: HeapKind) {
        if let Some(old) = self.heaps[kind.index()].take_allocation() {
            self.store_for_reuse(old);
        }
    }

    fn obtain_or_allocate(
        &self,
        size: ByteSize,
        kind: AllocationKind,
    ) -> Result<Arc<Allocation>> {
        if let Some(allocation) = self.manager.obtain_reusable(size, kind.addressing_mode()) {
            return Ok(allocation);
        }
        Ok(self.manager.allocate(size, 0, kind)?)
    }

    /// Stamp `allocation` with the current submission number unless it
    /// already carries a later one
    fn stamp(&self, allocation: &Allocation) {
        let marker = allocation.task_count(self.ctx);
        if marker == NOT_USED || marker < self.task_count {
            allocation.update_task_count(self.task_count, self.ctx);
        }
    }

    fn store_for_reuse(&self, allocation: Arc<Allocation>) {
        self.stamp(&allocation);
        self.manager.store_for_reuse(allocation);
    }

    /// Command stream
    pub fn command_stream(&self) -> &LinearStream {
        &self.command_stream
    }

    /// Indirect heap of `kind`
    pub fn indirect_heap(&self, kind: HeapKind) -> &IndirectHeap {
        &self.heaps[kind.index()]
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Flush the command stream from `start_offset` to its cursor
    ///
    /// `start_offset` is relative to the backing the task started in: the
    /// oldest pending segment if the stream grew since the last flush, else
    /// the current backing. The tag, every command buffer of the batch and
    /// every bound heap are made resident first.
    pub fn flush_task(&mut self, start_offset: usize) -> Result<TaskCount> {
        let current = self
            .command_stream
            .allocation()
            .cloned()
            .ok_or(Error::InvalidState)?;
        let used = self.command_stream.used();

        let batch = match self.cs_segments.split_first() {
            Some((first, rest)) => {
                if start_offset > first.used_size {
                    return Err(Error::InvalidParameter);
                }
                let mut batch = BatchBuffer::new(
                    Arc::clone(&first.command_buffer),
                    start_offset,
                    first.used_size,
                    self.engine,
                );
                for segment in rest {
                    batch.push_segment(Arc::clone(&segment.command_buffer), segment.used_size);
                }
                batch.push_segment(current, used);
                batch
            }
            None => {
                if start_offset > used {
                    return Err(Error::InvalidParameter);
                }
                BatchBuffer::new(current, start_offset, used, self.engine)
            }
        };

        if let Some(tag) = self.tag.clone() {
            self.make_resident(tag.allocation());
        }
        for command_buffer in batch.command_buffers() {
            self.make_resident(command_buffer);
        }
        let heap_allocations: Vec<Arc<Allocation>> = self
            .heaps
            .iter()
            .filter_map(|heap| heap.allocation().cloned())
            .collect();
        for allocation in &heap_allocations {
            self.make_resident(allocation);
        }

        let task_count = self.flush(batch, None)?;
        self.cs_flushed_to = used;
        for segment in core::mem::take(&mut self.cs_segments) {
            self.store_for_reuse(segment.command_buffer);
        }
        Ok(task_count)
    }

    /// Hand `batch` to the hardware path
    ///
    /// Immediate dispatch submits now and advances the counters only if the
    /// backend accepts the batch. Batched dispatch records it and assigns
    /// its number; the hand-off happens in
    /// [`flush_batched_submissions`](Self::flush_batched_submissions).
    pub fn flush(
        &mut self,
        mut batch: BatchBuffer,
        residency_override: Option<&[Arc<Allocation>]>,
    ) -> Result<TaskCount> {
        batch.task_count = self.task_count + 1;

        match self.dispatch_mode {
            DispatchMode::Immediate => {
                let residency = residency_override.unwrap_or(self.residency.residency_set());
                if let Err(e) = self.backend.submit(&batch, residency) {
                    log::warn!(
                        "{} submission {} failed: {}",
                        self.engine.name(),
                        batch.task_count,
                        e
                    );
                    return Err(e);
                }
                self.task_count = batch.task_count;
                self.latest_sent_task_count = self.task_count;
                self.latest_flushed_task_count = self.task_count;
            }
            DispatchMode::Batched => {
                let residency = residency_override
                    .map(<[Arc<Allocation>]>::to_vec)
                    .unwrap_or_else(|| self.residency.residency_set().to_vec());
                self.aggregator.record(batch, residency);
                self.task_count += 1;
                self.latest_sent_task_count = self.task_count;
            }
        }

        // the batch is with the hardware path; a failed eviction must not read
        // as a failed flush
        if let Err(e) = self.make_surface_pack_non_resident(residency_override) {
            log::warn!(
                "{} eviction after submission {} failed: {}",
                self.engine.name(),
                self.task_count,
                e
            );
        }
        Ok(self.task_count)
    }

    /// Hand every recorded batch to the hardware, oldest first
    ///
    /// Stops at the first rejected batch, which stays recorded.
    pub fn flush_batched_submissions(&mut self) -> Result<()> {
        if self.aggregator.is_empty() {
            return Ok(());
        }
        log::debug!(
            "{} flushing {} batched submissions",
            self.engine.name(),
            self.aggregator.pending_count()
        );

        while let Some(pending) = self.aggregator.front() {
            let task_count = pending.batch.task_count;
            if let Err(e) = self.backend.submit(&pending.batch, &pending.residency) {
                log::warn!(
                    "{} batched submission {} failed: {}",
                    self.engine.name(),
                    task_count,
                    e
                );
                return Err(e);
            }
            self.latest_flushed_task_count = task_count;
            self.aggregator.pop_front();
        }
        Ok(())
    }

    /// Recorded batches not yet handed to the hardware
    pub fn pending_batches(&self) -> usize {
        self.aggregator.pending_count()
    }

    // =========================================================================
    // Waits
    // =========================================================================

    /// Wait for the tag to reach `target`
    ///
    /// Recorded work up to `target` is handed to the hardware first. Returns
    /// `Ok(false)` if `enable_timeout` is set and `timeout_us` microseconds
    /// pass first; counters are untouched either way.
    pub fn wait_for_completion_with_timeout(
        &mut self,
        enable_timeout: bool,
        timeout_us: u64,
        target: TaskCount,
    ) -> Result<bool> {
        let tag = self.tag.clone().ok_or(Error::TagNotBound)?;
        if target > self.latest_flushed_task_count {
            self.flush_batched_submissions()?;
        }

        let timeout = enable_timeout.then(|| Duration::from_micros(timeout_us));
        let retired = self.waiter.wait(tag.word(), target, timeout);
        if !retired {
            log::warn!(
                "{} wait for {} timed out at tag {}",
                self.engine.name(),
                target,
                tag.value()
            );
        }
        Ok(retired)
    }

    /// Wait without bound for `required`, then reclaim `pool`
    ///
    /// Returns the number of allocations released.
    pub fn cleanup_retired(&mut self, required: TaskCount, pool: PoolKind) -> Result<usize> {
        let tag = self.tag.clone().ok_or(Error::TagNotBound)?;
        if required > self.latest_flushed_task_count {
            self.flush_batched_submissions()?;
        }
        self.waiter.wait(tag.word(), required, None);
        Ok(self.manager.reclaim_retired(self.ctx, required, pool))
    }

    /// Blocking teardown
    ///
    /// Sends recorded work, waits for everything sent, releases the streams
    /// and reclaims both pools for this engine.
    pub fn cleanup_resources(&mut self) -> Result<()> {
        self.flush_batched_submissions()?;
        self.release_streams();

        if self.tag.is_some() {
            let required = self.latest_flushed_task_count;
            self.cleanup_retired(required, PoolKind::Temporary)?;
            self.cleanup_retired(required, PoolKind::Reusable)?;
        }
        Ok(())
    }

    /// Give every stream backing to the manager
    ///
    /// Markers past the last submission handed to the hardware are pulled
    /// back to it: that work never reaches the device, so the tag would
    /// never retire it.
    fn release_streams(&mut self) {
        let mut released: Vec<Arc<Allocation>> = core::mem::take(&mut self.cs_segments)
            .into_iter()
            .map(|segment| segment.command_buffer)
            .collect();
        released.extend(self.command_stream.take_allocation());
        for heap in self.heaps.iter_mut() {
            released.extend(heap.take_allocation());
        }
        self.cs_flushed_to = 0;

        let last = self.latest_flushed_task_count;
        for allocation in released {
            let marker = allocation.task_count(self.ctx);
            if marker != NOT_USED && marker > last {
                allocation.update_task_count(last, self.ctx);
            }
            self.manager.check_gpu_usage_and_destroy(allocation);
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Last submission number assigned
    pub fn peek_task_count(&self) -> TaskCount {
        self.task_count
    }

    /// Current tag value, if a tag is bound
    pub fn peek_tag_value(&self) -> Option<TaskCount> {
        self.tag.as_ref().map(CompletionTag::value)
    }

    /// Last submission number recorded by a flush
    pub fn peek_latest_sent_task_count(&self) -> TaskCount {
        self.latest_sent_task_count
    }

    /// Last submission number handed to the hardware
    pub fn peek_latest_flushed_task_count(&self) -> TaskCount {
        self.latest_flushed_task_count
    }

    /// Bytes made resident for the first time on this engine
    pub fn peek_total_memory_used(&self) -> u64 {
        self.total_memory_used
    }

    /// Current dispatch mode
    pub fn peek_dispatch_mode(&self) -> DispatchMode {
        self.dispatch_mode
    }

    /// Switch dispatch mode; leaving batched mode sends recorded work
    pub fn override_dispatch_mode(&mut self, mode: DispatchMode) -> Result<()> {
        if mode == self.dispatch_mode {
            return Ok(());
        }
        log::debug!(
            "{} dispatch mode {:?} -> {:?}",
            self.engine.name(),
            self.dispatch_mode,
            mode
        );
        if self.dispatch_mode == DispatchMode::Batched {
            self.flush_batched_submissions()?;
        }
        self.dispatch_mode = mode;
        Ok(())
    }

    /// Submission context of this engine
    pub fn context_id(&self) -> ContextId {
        self.ctx
    }

    /// Engine
    pub fn engine(&self) -> EngineType {
        self.engine
    }

    /// Configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Memory manager
    pub fn manager(&self) -> &Arc<MemoryManager> {
        &self.manager
    }

    /// Submission backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Submission backend, mutably
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

impl<B: SubmissionBackend> Drop for CommandStreamReceiver<B> {
    fn drop(&mut self) {
        // handing recorded work over does not wait for the device
        if let Err(e) = self.flush_batched_submissions() {
            log::warn!(
                "{} dropped with {} unsent batched submissions: {}",
                self.engine.name(),
                self.aggregator.pending_count(),
                e
            );
        }
        self.release_streams();
        self.manager
            .release_context(self.ctx, self.latest_flushed_task_count);
    }
}

static_assertions::assert_impl_all!(CommandStreamReceiver<crate::submit::SoftwareBackend>: Send);
