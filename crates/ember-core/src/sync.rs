//! # Synchronization Primitives
//!
//! The completion tag word, wall clocks, and the polling helpers every
//! blocking operation goes through.
//!
//! The device signals progress by writing a monotonically increasing value
//! to a single word of host-visible memory. Nothing here sleeps: waits spin
//! on that word, optionally bounded by a monotonic clock. Swapping the
//! [`CompletionWaiter`] is the hook for interrupt-driven waits.

use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;

use crate::types::*;

// =============================================================================
// TAG WORD
// =============================================================================

/// Host view of the device-written completion tag
///
/// Retirement of submission `n` is `value() >= n`. The word is read with
/// acquire ordering so that everything the device wrote before the tag is
/// visible once the tag is observed.
pub struct TagWord {
    /// GPU address the device writes to
    gpu_addr: GpuAddr,
    /// CPU mapping of the same word
    cpu_ptr: NonNull<AtomicU32>,
}

impl TagWord {
    /// Create a view over a tag word
    ///
    /// # Safety
    /// - `cpu_ptr` must be valid for reads and writes of a `u32`, aligned to 4
    ///   bytes, and stay valid for the lifetime of the returned view
    /// - `gpu_addr` must map the same word for the device
    pub unsafe fn new(gpu_addr: GpuAddr, cpu_ptr: NonNull<u8>) -> Self {
        Self {
            gpu_addr,
            cpu_ptr: cpu_ptr.cast(),
        }
    }

    /// Get GPU address
    #[inline]
    pub fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    #[inline]
    fn word(&self) -> &AtomicU32 {
        // SAFETY: validity and alignment guaranteed by constructor contract
        unsafe { self.cpu_ptr.as_ref() }
    }

    /// Current tag value
    #[inline]
    pub fn value(&self) -> TaskCount {
        self.word().load(Ordering::Acquire)
    }

    /// Whether submission `task_count` has retired
    #[inline]
    pub fn is_retired(&self, task_count: TaskCount) -> bool {
        self.value() >= task_count
    }

    /// Write the tag from the host
    ///
    /// Used to seed the initial value and by software backends standing in
    /// for the device.
    #[inline]
    pub fn signal(&self, value: TaskCount) {
        self.word().store(value, Ordering::Release);
    }
}

impl fmt::Debug for TagWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagWord")
            .field("gpu_addr", &self.gpu_addr)
            .field("value", &self.value())
            .finish()
    }
}

// SAFETY: the word is only accessed through atomics
unsafe impl Send for TagWord {}
// SAFETY: the word is only accessed through atomics
unsafe impl Sync for TagWord {}

// =============================================================================
// CLOCKS
// =============================================================================

/// Monotonic time source for bounded waits
pub trait Clock: Send + Sync {
    /// Opaque point in time
    type Instant: Copy;

    /// Current time
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `start`
    fn elapsed(&self, start: Self::Instant) -> Duration;
}

/// Wall clock backed by `std::time::Instant`
#[cfg(feature = "std")]
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

#[cfg(feature = "std")]
impl Clock for MonotonicClock {
    type Instant = std::time::Instant;

    #[inline]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    #[inline]
    fn elapsed(&self, start: Self::Instant) -> Duration {
        start.elapsed()
    }
}

// =============================================================================
// POLLING
// =============================================================================

/// Spin until `condition` holds or `timeout` elapses
///
/// Returns `true` if the condition was observed. A `None` timeout polls
/// forever. The condition is evaluated once more after the deadline so a
/// value that landed during the last spin still counts.
pub fn wait_for<C, F>(clock: &C, timeout: Option<Duration>, mut condition: F) -> bool
where
    C: Clock + ?Sized,
    F: FnMut() -> bool,
{
    if condition() {
        return true;
    }

    let Some(timeout) = timeout else {
        while !condition() {
            core::hint::spin_loop();
        }
        return true;
    };

    let start = clock.now();
    loop {
        if condition() {
            return true;
        }
        if clock.elapsed(start) >= timeout {
            return condition();
        }
        core::hint::spin_loop();
    }
}

// =============================================================================
// COMPLETION WAITERS
// =============================================================================

/// Strategy for blocking until the tag reaches a submission number
pub trait CompletionWaiter: Send + Sync + fmt::Debug {
    /// Wait for `tag >= target`; `false` means the timeout elapsed first
    fn wait(&self, tag: &TagWord, target: TaskCount, timeout: Option<Duration>) -> bool;
}

/// Busy-polling waiter
#[derive(Debug, Clone, Copy, Default)]
pub struct PollingWaiter<C> {
    clock: C,
}

impl<C: Clock> PollingWaiter<C> {
    /// Create a waiter over `clock`
    pub const fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock + fmt::Debug> CompletionWaiter for PollingWaiter<C> {
    fn wait(&self, tag: &TagWord, target: TaskCount, timeout: Option<Duration>) -> bool {
        wait_for(&self.clock, timeout, || tag.is_retired(target))
    }
}

static_assertions::assert_impl_all!(TagWord: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU64;

    /// Clock that advances one millisecond per reading
    #[derive(Debug, Default)]
    struct SteppingClock {
        ticks: AtomicU64,
    }

    impl Clock for SteppingClock {
        type Instant = u64;

        fn now(&self) -> u64 {
            self.ticks.fetch_add(1, Ordering::Relaxed)
        }

        fn elapsed(&self, start: u64) -> Duration {
            Duration::from_millis(self.now() - start)
        }
    }

    fn tag_over(word: &AtomicU32) -> TagWord {
        let ptr = NonNull::from(word).cast::<u8>();
        // SAFETY: word outlives the view in every test
        unsafe { TagWord::new(GpuAddr::new(0x1000), ptr) }
    }

    #[test]
    fn test_tag_word_retirement() {
        let word = AtomicU32::new(INITIAL_HARDWARE_TAG);
        let tag = tag_over(&word);
        assert!(tag.is_retired(0));
        assert!(!tag.is_retired(1));
        tag.signal(5);
        assert_eq!(tag.value(), 5);
        assert!(tag.is_retired(5));
        assert!(!tag.is_retired(6));
    }

    #[test]
    fn test_wait_for_times_out() {
        let clock = SteppingClock::default();
        let mut polls = 0;
        let observed = wait_for(&clock, Some(Duration::from_millis(10)), || {
            polls += 1;
            false
        });
        assert!(!observed);
        assert!(polls > 1);
    }

    #[test]
    fn test_wait_for_immediate() {
        let clock = SteppingClock::default();
        assert!(wait_for(&clock, Some(Duration::ZERO), || true));
        assert_eq!(clock.ticks.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_polling_waiter() {
        let word = AtomicU32::new(3);
        let tag = tag_over(&word);
        let waiter = PollingWaiter::new(SteppingClock::default());
        assert!(waiter.wait(&tag, 3, None));
        assert!(!waiter.wait(&tag, 4, Some(Duration::from_millis(5))));
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_wait_observes_other_thread() {
        use std::sync::Arc;

        let word = Arc::new(AtomicU32::new(0));
        let writer = {
            let word = Arc::clone(&word);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                word.store(7, Ordering::Release);
            })
        };

        let tag = tag_over(&word);
        let waiter = PollingWaiter::new(MonotonicClock);
        assert!(waiter.wait(&tag, 7, Some(Duration::from_secs(5))));
        writer.join().unwrap();
    }
}
