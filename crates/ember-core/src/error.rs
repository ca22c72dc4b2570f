//! # Ember Error Handling
//!
//! Error types for the submission core.
//!
//! Error handling in Ember follows these principles:
//! - Errors are typed and categorized
//! - No panics in production code paths
//! - Failures are returned, never dropped; policy (retry, evict, fail the
//!   API call) belongs to the caller
//! - Errors are `no_std` compatible

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Ember Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Ember unified error type
///
/// Errors are categorized by subsystem. Resource exhaustion surfaces as
/// [`Error::Allocation`] so the API layer can map it to an out-of-resources
/// code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Object is not in a state that allows the operation
    InvalidState,
    /// Resource not found
    NotFound,
    /// Operation timed out
    Timeout,
    /// Operation not supported by this backend
    NotSupported,

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Backing allocator could not satisfy the request
    Allocation(AllocationStatus),
    /// GPU virtual address space exhausted
    OutOfMemory,
    /// Address not aligned
    MisalignedAddress,
    /// Write past the end of a stream
    BufferOverflow,
    /// No free submission context slot
    ContextLimitReached,

    // =========================================================================
    // Command Submission Errors
    // =========================================================================
    /// Hardware hand-off rejected the batch
    SubmissionFailed,
    /// No completion tag bound to the engine
    TagNotBound,
}

impl Error {
    /// Whether this error means the device ran out of memory
    pub const fn is_out_of_resources(&self) -> bool {
        matches!(
            self,
            Self::Allocation(AllocationStatus::Error) | Self::OutOfMemory
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::InvalidState => write!(f, "invalid state"),
            Self::NotFound => write!(f, "resource not found"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::NotSupported => write!(f, "operation not supported"),

            // Memory
            Self::Allocation(status) => write!(f, "allocation failed: {}", status),
            Self::OutOfMemory => write!(f, "out of GPU address space"),
            Self::MisalignedAddress => write!(f, "misaligned address"),
            Self::BufferOverflow => write!(f, "stream overflow"),
            Self::ContextLimitReached => write!(f, "submission context limit reached"),

            // Submission
            Self::SubmissionFailed => write!(f, "submission failed"),
            Self::TagNotBound => write!(f, "completion tag not bound"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

// =============================================================================
// SUB-ERROR TYPES
// =============================================================================

/// Status reported by a backing allocator when it cannot produce memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStatus {
    /// Generic failure (resource exhaustion)
    Error,
    /// Caller-supplied host memory cannot be wrapped
    InvalidHostPointer,
    /// Device pool exhausted; a non-device pool may still succeed
    RetryInNonDevicePool,
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "out of device memory"),
            Self::InvalidHostPointer => write!(f, "invalid host pointer"),
            Self::RetryInNonDevicePool => write!(f, "retry in non-device pool"),
        }
    }
}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<AllocationStatus> for Error {
    fn from(e: AllocationStatus) -> Self {
        Error::Allocation(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_conversion() {
        let err: Error = AllocationStatus::InvalidHostPointer.into();
        assert_eq!(err, Error::Allocation(AllocationStatus::InvalidHostPointer));
        assert!(!err.is_out_of_resources());
        assert!(Error::from(AllocationStatus::Error).is_out_of_resources());
        assert!(Error::OutOfMemory.is_out_of_resources());
    }

    #[test]
    fn test_display() {
        let text = alloc::format!("{}", Error::Allocation(AllocationStatus::Error));
        assert_eq!(text, "allocation failed: out of device memory");
        assert_eq!(alloc::format!("{}", Error::TagNotBound), "completion tag not bound");
    }
}
