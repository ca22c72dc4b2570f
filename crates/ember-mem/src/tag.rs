//! # Completion Tag
//!
//! The device-visible word the hardware bumps as submissions retire, bound to
//! the allocation that backs it.

use alloc::sync::Arc;
use core::fmt;

use ember_core::sync::TagWord;
use ember_core::{Error, GpuAddr, Result, TaskCount};

use crate::allocation::Allocation;

struct TagInner {
    word: TagWord,
    allocation: Arc<Allocation>,
}

/// Shared handle to a completion tag
///
/// Clones observe the same word. The backing allocation stays alive as long
/// as any clone does.
#[derive(Clone)]
pub struct CompletionTag {
    inner: Arc<TagInner>,
}

impl CompletionTag {
    /// Bind a tag to `allocation`
    ///
    /// The allocation must be CPU-visible, at least 4 bytes, and 4-byte
    /// aligned.
    pub fn new(allocation: Arc<Allocation>) -> Result<Self> {
        let ptr = allocation.cpu_ptr().ok_or(Error::InvalidParameter)?;
        if allocation.size().as_bytes() < core::mem::size_of::<TaskCount>() as u64 {
            return Err(Error::InvalidParameter);
        }
        if ptr.as_ptr() as usize % core::mem::align_of::<TaskCount>() != 0 {
            return Err(Error::MisalignedAddress);
        }

        // SAFETY: checked above that the mapping covers an aligned u32; the
        // allocation is kept alive next to the view
        let word = unsafe { TagWord::new(allocation.gpu_addr(), ptr) };
        Ok(Self {
            inner: Arc::new(TagInner { word, allocation }),
        })
    }

    /// Current tag value
    #[inline]
    pub fn value(&self) -> TaskCount {
        self.inner.word.value()
    }

    /// Whether submission `task_count` has retired
    #[inline]
    pub fn is_retired(&self, task_count: TaskCount) -> bool {
        self.inner.word.is_retired(task_count)
    }

    /// Write the tag from the host
    #[inline]
    pub fn signal(&self, value: TaskCount) {
        self.inner.word.signal(value);
    }

    /// Host view of the word
    #[inline]
    pub fn word(&self) -> &TagWord {
        &self.inner.word
    }

    /// GPU address the device writes to
    #[inline]
    pub fn gpu_addr(&self) -> GpuAddr {
        self.inner.word.gpu_addr()
    }

    /// Allocation backing the tag
    #[inline]
    pub fn allocation(&self) -> &Arc<Allocation> {
        &self.inner.allocation
    }
}

impl fmt::Debug for CompletionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionTag")
            .field("gpu_addr", &self.gpu_addr())
            .field("value", &self.value())
            .finish()
    }
}

static_assertions::assert_impl_all!(CompletionTag: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationKind;
    use crate::manager::MemoryManager;
    use ember_core::{ByteSize, INITIAL_HARDWARE_TAG};

    #[test]
    fn test_tag_starts_zeroed() {
        let manager = MemoryManager::with_host_memory();
        let allocation = manager
            .allocate(ByteSize::KIB_4, 0, AllocationKind::TagBuffer)
            .unwrap();
        let tag = CompletionTag::new(allocation).unwrap();
        assert_eq!(tag.value(), INITIAL_HARDWARE_TAG);
        assert!(!tag.is_retired(1));
    }

    #[test]
    fn test_clones_share_word() {
        let manager = MemoryManager::with_host_memory();
        let allocation = manager
            .allocate(ByteSize::KIB_4, 0, AllocationKind::TagBuffer)
            .unwrap();
        let tag = CompletionTag::new(allocation).unwrap();
        let other = tag.clone();
        tag.signal(9);
        assert_eq!(other.value(), 9);
        assert!(other.is_retired(9));
        assert_eq!(other.gpu_addr(), tag.allocation().gpu_addr());
    }
}
